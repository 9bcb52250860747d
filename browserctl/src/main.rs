use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::env;
use std::fs;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const ALTERNATIVES_GROUP: &str = "x-browser";
const ALTERNATIVES_LINK: &str = "/usr/bin/x-browser";
const BROWSER_PROGRAM: &str = "browser";
const DEFAULT_PROGRAM_CONF: &str = "/etc/supervisor/conf.d/browser.conf";
const DEFAULT_BROWSERS_DIR: &str = "/opt/browsers";

// Binary names probed on PATH after an installer-package install, and inside
// the install directory after an archive install.
const PATH_BINARY_CANDIDATES: &[&str] = &[
    "google-chrome-stable",
    "google-chrome-beta",
    "google-chrome",
    "chromium",
    "chromium-browser",
];
const ARCHIVE_BINARY_CANDIDATES: &[&str] = &["chrome", "chromium", "chromium-browser", "headless_shell"];

#[derive(Parser, Debug)]
#[command(name = "browserctl", version, about = "Browser lifecycle CLI")]
struct Cli {
    #[arg(long, global = true)]
    json: bool,
    #[arg(long = "program-conf", global = true, hide = true)]
    program_conf: Option<PathBuf>,
    #[arg(long = "browsers-dir", global = true, hide = true)]
    browsers_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Install {
        source: String,
    },
    SetArgs {
        #[arg(allow_hyphen_values = true)]
        args: String,
    },
    AppendArgs {
        #[arg(allow_hyphen_values = true)]
        args: String,
    },
}

#[derive(Debug, Error)]
enum BrowserctlError {
    #[error("invalid install source: {0}")]
    InvalidSource(String),
    #[error("unsupported package kind: {0}")]
    UnsupportedPackageKind(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("install target is not empty: {0}")]
    PreexistingInstallation(String),
    #[error("no browser executable found after install: {0}")]
    ExecutableNotFound(String),
    #[error("supervisor config missing: {0}")]
    ConfigMissing(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug)]
struct Context {
    json: bool,
    program_conf: PathBuf,
    program_conf_overridden: bool,
    browsers_dir: PathBuf,
    supervisorctl: PathBuf,
}

fn main() -> Result<(), BrowserctlError> {
    let cli = Cli::parse();
    let ctx = build_context(&cli);

    let result = match cli.command {
        Commands::Install { source } => handle_install(&ctx, &source),
        Commands::SetArgs { args } => handle_set_args(&ctx, &args),
        Commands::AppendArgs { args } => handle_append_args(&ctx, &args),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn build_context(cli: &Cli) -> Context {
    let env_conf = env::var("GEMBOX_BROWSER_PROGRAM_CONF")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from);
    let program_conf_overridden = cli.program_conf.is_some() || env_conf.is_some();
    let program_conf = cli
        .program_conf
        .clone()
        .or(env_conf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PROGRAM_CONF));
    let browsers_dir = cli
        .browsers_dir
        .clone()
        .or_else(|| {
            env::var("GEMBOX_BROWSERS_DIR")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BROWSERS_DIR));
    let supervisorctl = match env::var("GEMBOX_SUPERVISORCTL") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
        _ => PathBuf::from("supervisorctl"),
    };
    Context {
        json: cli.json,
        program_conf,
        program_conf_overridden,
        browsers_dir,
        supervisorctl,
    }
}

fn log_line(message: &str) {
    println!("[{}] {message}", Utc::now().format("%m%d/%H%M%S%.3f"));
}

// ---------------------------------------------------------------------------
// Install source resolution

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arch {
    Amd64,
    Arm64,
}

fn host_arch() -> Result<Arch, BrowserctlError> {
    match env::consts::ARCH {
        "x86_64" => Ok(Arch::Amd64),
        "aarch64" => Ok(Arch::Arm64),
        other => Err(BrowserctlError::Process(format!(
            "unsupported architecture: {other}"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageKind {
    Installer,
    Archive,
}

struct SourceSpec {
    tag: &'static str,
    amd64_url: &'static str,
    arm64_url: &'static str,
    compat_link: &'static str,
}

// Every supported (tag, arch) pair is enumerated here; nothing is derived
// from constructed names at runtime.
const SOURCES: &[SourceSpec] = &[
    SourceSpec {
        tag: "chrome",
        amd64_url: "https://dl.google.com/linux/direct/google-chrome-stable_current_amd64.deb",
        arm64_url: "https://dl.google.com/linux/direct/google-chrome-stable_current_arm64.deb",
        compat_link: "/usr/bin/google-chrome",
    },
    SourceSpec {
        tag: "chrome-beta",
        amd64_url: "https://dl.google.com/linux/direct/google-chrome-beta_current_amd64.deb",
        arm64_url: "https://dl.google.com/linux/direct/google-chrome-beta_current_arm64.deb",
        compat_link: "/usr/bin/google-chrome-beta",
    },
    SourceSpec {
        tag: "chromium",
        amd64_url: "https://github.com/ungoogled-software/ungoogled-chromium-portablelinux/releases/download/138.0.7204.157-1/ungoogled-chromium_138.0.7204.157-1_linux.tar.xz",
        arm64_url: "https://github.com/ungoogled-software/ungoogled-chromium-portablelinux/releases/download/138.0.7204.157-1/ungoogled-chromium_138.0.7204.157-1_arm64_linux.tar.xz",
        compat_link: "/usr/bin/chromium-browser",
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedInstall {
    url: String,
    kind: PackageKind,
    install_name: String,
    compat_link: Option<PathBuf>,
}

fn resolve_source(source: &str, arch: Arch) -> Result<ResolvedInstall, BrowserctlError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let kind = package_kind_for_url(source)?;
        return Ok(ResolvedInstall {
            url: source.to_string(),
            kind,
            install_name: "custom".to_string(),
            compat_link: None,
        });
    }
    if source.contains("://") {
        return Err(BrowserctlError::InvalidSource(source.to_string()));
    }
    let Some(spec) = SOURCES.iter().find(|spec| spec.tag == source) else {
        return Err(BrowserctlError::InvalidSource(source.to_string()));
    };
    let url = match arch {
        Arch::Amd64 => spec.amd64_url,
        Arch::Arm64 => spec.arm64_url,
    };
    Ok(ResolvedInstall {
        url: url.to_string(),
        kind: package_kind_for_url(url)?,
        install_name: spec.tag.to_string(),
        compat_link: Some(PathBuf::from(spec.compat_link)),
    })
}

fn url_file_name(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .rsplit('/')
        .next()
        .unwrap_or(without_query)
        .to_string()
}

fn package_kind_for_url(url: &str) -> Result<PackageKind, BrowserctlError> {
    let name = url_file_name(url);
    if name.ends_with(".deb") {
        Ok(PackageKind::Installer)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") || name.ends_with(".tar.xz") {
        Ok(PackageKind::Archive)
    } else {
        Err(BrowserctlError::UnsupportedPackageKind(name))
    }
}

// ---------------------------------------------------------------------------
// Install

fn handle_install(ctx: &Context, source: &str) -> Result<(), BrowserctlError> {
    let arch = host_arch()?;
    let resolved = resolve_source(source, arch)?;
    log_line(&format!("resolved {source} to {}", resolved.url));

    let install_dir = ctx.browsers_dir.join(&resolved.install_name);
    if resolved.kind == PackageKind::Archive {
        ensure_install_dir_empty(&install_dir)?;
    }

    let download_dir = temp_download_dir();
    fs::create_dir_all(&download_dir)?;
    let artifact_path = download_dir.join(url_file_name(&resolved.url));
    let install_result = (|| -> Result<PathBuf, BrowserctlError> {
        download_file(&resolved.url, &artifact_path)?;
        log_line(&format!("downloaded {}", artifact_path.display()));
        match resolved.kind {
            PackageKind::Installer => install_system_package(&artifact_path),
            PackageKind::Archive => install_archive(&artifact_path, &install_dir),
        }
    })();
    // The downloaded artifact never outlives the install attempt.
    let _ = fs::remove_dir_all(&download_dir);
    let executable = install_result?;
    log_line(&format!("installed browser at {}", executable.display()));

    let priority = register_alternative(&executable)?;
    if let Some(link) = &resolved.compat_link {
        force_symlink(Path::new(ALTERNATIVES_LINK), link)?;
    }

    let supervisor = SupervisorCtl::new(&ctx.supervisorctl);
    supervisor.restart_program(BROWSER_PROGRAM, RestartPolicy::BestEffort)?;

    output(
        ctx,
        json!({
            "source": source,
            "url": resolved.url,
            "executable": executable.display().to_string(),
            "priority": priority,
        }),
    )
}

fn ensure_install_dir_empty(install_dir: &Path) -> Result<(), BrowserctlError> {
    match fs::read_dir(install_dir) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(BrowserctlError::PreexistingInstallation(
                    install_dir.display().to_string(),
                ));
            }
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(BrowserctlError::Io(err)),
    }
}

fn temp_download_dir() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    env::temp_dir().join(format!("browserctl-{}-{}", std::process::id(), nanos))
}

fn download_file(url: &str, path: &Path) -> Result<(), BrowserctlError> {
    let client = reqwest::blocking::Client::new();
    let response = client
        .get(url)
        .header("User-Agent", "browserctl")
        .send()
        .map_err(|err| BrowserctlError::Download(format!("{url}: {err}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(BrowserctlError::Download(format!("{url}: HTTP {status}")));
    }
    let bytes = response
        .bytes()
        .map_err(|err| BrowserctlError::Download(format!("{url}: {err}")))?;
    ensure_parent(path)?;
    fs::write(path, &bytes)?;
    Ok(())
}

fn install_system_package(artifact: &Path) -> Result<PathBuf, BrowserctlError> {
    let output = Command::new("apt-get")
        .env("DEBIAN_FRONTEND", "noninteractive")
        .args(["install", "-y", "--no-install-recommends"])
        .arg(artifact)
        .output()
        .map_err(|err| BrowserctlError::Process(format!("failed to run apt-get: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(BrowserctlError::Process(format!(
            "apt-get install failed with status {}: {stderr}",
            output.status
        )));
    }
    discover_path_executable()
}

fn discover_path_executable() -> Result<PathBuf, BrowserctlError> {
    for name in PATH_BINARY_CANDIDATES {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }
    Err(BrowserctlError::ExecutableNotFound(
        "no known browser binary on PATH".to_string(),
    ))
}

fn install_archive(artifact: &Path, install_dir: &Path) -> Result<PathBuf, BrowserctlError> {
    fs::create_dir_all(install_dir)?;
    let result = extract_archive(artifact, install_dir)
        .and_then(|_| discover_archive_executable(install_dir));
    if result.is_err() {
        // A failed install never leaves content in the target; the next
        // attempt starts from an empty directory.
        let _ = fs::remove_dir_all(install_dir);
    }
    result
}

fn extract_archive(artifact: &Path, destination_dir: &Path) -> Result<(), BrowserctlError> {
    let entries = tar_list_entries(artifact)?;
    let strip_components = tar_has_single_top_level_dir(&entries);
    let mut cmd = Command::new("tar");
    cmd.arg("-xf").arg(artifact).arg("-C").arg(destination_dir);
    if strip_components {
        cmd.arg("--strip-components").arg("1");
    }
    let status = cmd
        .status()
        .map_err(|err| BrowserctlError::Process(format!("failed to run tar: {err}")))?;
    if !status.success() {
        return Err(BrowserctlError::Process(format!(
            "tar extraction failed with status {status}"
        )));
    }
    Ok(())
}

fn normalize_tar_entry_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let stripped = trimmed
        .trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/');
    if stripped.is_empty() {
        return None;
    }
    Some(stripped.to_string())
}

fn tar_list_entries(artifact: &Path) -> Result<Vec<String>, BrowserctlError> {
    let output = Command::new("tar")
        .arg("-tf")
        .arg(artifact)
        .output()
        .map_err(|err| BrowserctlError::Process(format!("failed to run tar: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BrowserctlError::Process(format!(
            "tar listing failed with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .filter_map(normalize_tar_entry_path)
        .collect())
}

fn tar_has_single_top_level_dir(entries: &[String]) -> bool {
    let mut top: Option<&str> = None;
    let mut saw_nested = false;
    for entry in entries {
        let mut parts = entry.splitn(2, '/');
        let first = parts.next().unwrap_or("");
        let rest = parts.next();
        if first.is_empty() {
            continue;
        }
        match rest {
            Some(_) => {
                saw_nested = true;
                match top {
                    None => top = Some(first),
                    Some(existing) => {
                        if existing != first {
                            return false;
                        }
                    }
                }
            }
            None => {
                // Allow only the top-level directory marker entry itself.
                if let Some(existing) = top {
                    if existing != first {
                        return false;
                    }
                } else {
                    top = Some(first);
                }
            }
        }
    }
    saw_nested && top.is_some()
}

fn discover_archive_executable(install_dir: &Path) -> Result<PathBuf, BrowserctlError> {
    for name in ARCHIVE_BINARY_CANDIDATES {
        let candidate = install_dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(BrowserctlError::ExecutableNotFound(format!(
        "no browser executable in {}",
        install_dir.display()
    )))
}

// ---------------------------------------------------------------------------
// Alternatives registration

fn register_alternative(executable: &Path) -> Result<u32, BrowserctlError> {
    let priority = next_alternative_priority();
    let executable = executable.display().to_string();
    let priority_text = priority.to_string();
    run_checked(
        "update-alternatives",
        &[
            "--install",
            ALTERNATIVES_LINK,
            ALTERNATIVES_GROUP,
            &executable,
            &priority_text,
        ],
    )?;
    run_checked(
        "update-alternatives",
        &["--set", ALTERNATIVES_GROUP, &executable],
    )?;
    Ok(priority)
}

// A fresh registration always outranks every existing one; earlier targets
// stay registered so rollback through the alternatives mechanism works.
fn next_alternative_priority() -> u32 {
    let output = Command::new("update-alternatives")
        .args(["--query", ALTERNATIVES_GROUP])
        .output();
    let max = match output {
        Ok(out) if out.status.success() => {
            parse_max_priority(&String::from_utf8_lossy(&out.stdout))
        }
        _ => None,
    };
    max.unwrap_or(90) + 10
}

fn parse_max_priority(text: &str) -> Option<u32> {
    text.lines()
        .filter_map(|line| line.strip_prefix("Priority:"))
        .filter_map(|value| value.trim().parse::<u32>().ok())
        .max()
}

fn force_symlink(target: &Path, link_path: &Path) -> Result<(), BrowserctlError> {
    ensure_parent(link_path)?;
    match fs::symlink_metadata(link_path) {
        Ok(meta) => {
            if meta.file_type().is_symlink() || meta.file_type().is_file() {
                fs::remove_file(link_path)?;
            } else {
                return Err(BrowserctlError::Process(format!(
                    "refusing to replace directory with symlink: {}",
                    link_path.display()
                )));
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(BrowserctlError::Io(err)),
    }
    #[cfg(unix)]
    {
        symlink(target, link_path)?;
        return Ok(());
    }
    #[allow(unreachable_code)]
    Err(BrowserctlError::Process(
        "symlinks are not supported on this platform".to_string(),
    ))
}

fn run_checked(program: &str, args: &[&str]) -> Result<(), BrowserctlError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|err| BrowserctlError::Process(format!("failed to run {program}: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(BrowserctlError::Process(format!(
            "{program} {} failed with status {}: {stderr}",
            args.join(" "),
            output.status
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Supervisor control channel

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestartPolicy {
    BestEffort,
    Required,
}

struct SupervisorCtl {
    program: PathBuf,
}

impl SupervisorCtl {
    fn new(program: &Path) -> Self {
        Self {
            program: program.to_path_buf(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<(), BrowserctlError> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|err| {
                BrowserctlError::Process(format!(
                    "failed to run {}: {err}",
                    self.program.display()
                ))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(BrowserctlError::Process(format!(
                "{} {} failed with status {}: {stderr}",
                self.program.display(),
                args.join(" "),
                output.status
            )));
        }
        Ok(())
    }

    fn restart_program(&self, name: &str, policy: RestartPolicy) -> Result<(), BrowserctlError> {
        match self.run(&["restart", name]) {
            Ok(()) => Ok(()),
            Err(err) => match policy {
                RestartPolicy::Required => Err(err),
                RestartPolicy::BestEffort => {
                    // Install may legitimately run at image-build time with no
                    // supervisor listening.
                    eprintln!("warning: supervisor restart skipped: {err}");
                    Ok(())
                }
            },
        }
    }

    fn apply_config_changes(&self) -> Result<(), BrowserctlError> {
        self.run(&["reread"])?;
        self.run(&["update"])
    }
}

// ---------------------------------------------------------------------------
// Argument editor

fn handle_set_args(ctx: &Context, new_args: &str) -> Result<(), BrowserctlError> {
    edit_program_args(ctx, |command_path, _tail| {
        join_command(command_path, new_args)
    })
}

fn handle_append_args(ctx: &Context, extra: &str) -> Result<(), BrowserctlError> {
    edit_program_args(ctx, |command_path, tail| {
        join_command(&join_command(command_path, tail), extra)
    })
}

fn edit_program_args<F>(ctx: &Context, edit: F) -> Result<(), BrowserctlError>
where
    F: FnOnce(&str, &str) -> String,
{
    require_privilege(ctx)?;
    if !ctx.program_conf.is_file() {
        return Err(BrowserctlError::ConfigMissing(
            ctx.program_conf.display().to_string(),
        ));
    }
    let content = fs::read_to_string(&ctx.program_conf)?;
    let patched = patch_command_line(&content, edit)?;
    write_atomic_text_file_preserving_mode(&ctx.program_conf, &patched)?;

    let supervisor = SupervisorCtl::new(&ctx.supervisorctl);
    supervisor.apply_config_changes()?;
    supervisor.restart_program(BROWSER_PROGRAM, RestartPolicy::Required)?;

    let command_line = command_line_of(&patched).unwrap_or_default();
    output(ctx, json!({ "command": command_line }))
}

fn require_privilege(ctx: &Context) -> Result<(), BrowserctlError> {
    // An explicit config override means the caller owns the file; the root
    // requirement only guards the system supervisor fragment.
    if ctx.program_conf_overridden {
        return Ok(());
    }
    if current_uid() != 0 {
        return Err(BrowserctlError::PermissionDenied(
            "editing the supervisor config requires root".to_string(),
        ));
    }
    Ok(())
}

fn current_uid() -> u32 {
    #[cfg(unix)]
    {
        let output = Command::new("id").arg("-u").output();
        if let Ok(output) = output {
            if output.status.success() {
                let text = String::from_utf8_lossy(&output.stdout);
                if let Ok(value) = text.trim().parse::<u32>() {
                    return value;
                }
            }
        }
    }
    u32::MAX
}

fn join_command(head: &str, tail: &str) -> String {
    let head = head.trim();
    let tail = tail.trim();
    if tail.is_empty() {
        head.to_string()
    } else if head.is_empty() {
        tail.to_string()
    } else {
        format!("{head} {tail}")
    }
}

// The single substitution contract for the supervised command line: the
// first token (the binary path) is preserved, the edit decides the rest.
fn patch_command_line<F>(content: &str, edit: F) -> Result<String, BrowserctlError>
where
    F: FnOnce(&str, &str) -> String,
{
    let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();
    let Some(idx) = lines
        .iter()
        .position(|line| line.trim_start().starts_with("command="))
    else {
        return Err(BrowserctlError::Process(
            "no command= line in supervisor config".to_string(),
        ));
    };
    let line = &lines[idx];
    let trimmed = line.trim_start();
    let indent = &line[..line.len() - trimmed.len()];
    let value = trimmed["command=".len()..].trim();
    let (command_path, tail) = match value.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (value, ""),
    };
    if command_path.is_empty() {
        return Err(BrowserctlError::Process(
            "supervisor config has an empty command path".to_string(),
        ));
    }
    let new_value = edit(command_path, tail);
    let patched = format!("{indent}command={}", new_value.trim());
    lines[idx] = patched;
    let mut out = lines.join("\n");
    if !out.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

fn command_line_of(content: &str) -> Option<String> {
    content
        .lines()
        .find(|line| line.trim_start().starts_with("command="))
        .map(|line| line.trim_start()["command=".len()..].trim().to_string())
}

// ---------------------------------------------------------------------------
// Shared plumbing

fn ensure_parent(path: &Path) -> Result<(), BrowserctlError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn write_atomic_text_file(
    path: &Path,
    content: &str,
    mode: Option<u32>,
) -> Result<(), BrowserctlError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "browserctl".to_string()),
        pid,
        ts
    ));
    fs::write(&tmp_path, content)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn write_atomic_text_file_preserving_mode(
    path: &Path,
    content: &str,
) -> Result<(), BrowserctlError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path).map(|m| m.permissions().mode()).ok();
        return write_atomic_text_file(path, content, mode);
    }
    #[allow(unreachable_code)]
    write_atomic_text_file(path, content, None)
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), BrowserctlError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), BrowserctlError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
