use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const PROXY_AUTH_TEMPLATE: &str = include_str!("../config/proxy.auth.conf");
const PROXY_OPEN_TEMPLATE: &str = include_str!("../config/proxy.open.conf");
const FORWARDER_BASE_FRAGMENT: &str = include_str!("../config/forwarder-base.conf");
const MCP_ROUTE_TEMPLATE: &str = include_str!("../config/mcp-route.conf");
const MCP_PROGRAM_TEMPLATE: &str = include_str!("../config/mcp-program.conf");

const BASE_FRAGMENT_NAME: &str = "base.conf";

#[derive(Parser, Debug)]
#[command(name = "gembox", version, about = "Gembox bootstrap CLI")]
struct Cli {
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Boot {
        #[arg(long, default_value_t = false)]
        no_exec: bool,
    },
    Assemble,
    Wait,
    LaunchProxy,
    Doctor,
}

#[derive(Debug, Error)]
enum GemboxError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("timed out waiting for backends: {0}")]
    Timeout(String),
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
}

struct ServiceDescriptor {
    name: &'static str,
    port_env: &'static str,
    default_port: u16,
}

// Backends the reverse proxy fronts. Order here is probe order.
const SERVICES: &[ServiceDescriptor] = &[
    ServiceDescriptor {
        name: "gem",
        port_env: "GEM_PORT",
        default_port: 8088,
    },
    ServiceDescriptor {
        name: "cdp",
        port_env: "CDP_PORT",
        default_port: 9222,
    },
    ServiceDescriptor {
        name: "gui",
        port_env: "GUI_PORT",
        default_port: 6080,
    },
    ServiceDescriptor {
        name: "mcp",
        port_env: "MCP_PORT",
        default_port: 8931,
    },
];

// Snapshot of every recognized environment variable, read once per
// invocation. Components take this by reference and never read ambient
// environment state themselves.
#[derive(Debug, Clone)]
struct Env {
    proxy_port: u16,
    wait_host: String,
    wait_ports: Option<String>,
    wait_interval: f64,
    wait_timeout: f64,
    auth_token: String,
    upstream_proxy: String,
    runtime_dir: PathBuf,
    disabled_dir: PathBuf,
    forwarder_dir: PathBuf,
    supervisor_dir: PathBuf,
    runtime_user: String,
    proxy_cmd: String,
    supervisor_cmd: String,
    supervisorctl: PathBuf,
    service_ports: BTreeMap<&'static str, Option<u16>>,
    disabled: BTreeSet<&'static str>,
}

impl Env {
    fn from_env() -> Result<Self, GemboxError> {
        let mut service_ports = BTreeMap::new();
        for service in SERVICES {
            service_ports.insert(
                service.name,
                read_port_var(service.port_env, service.default_port)?,
            );
        }
        let disabled_dir = read_path_var("GEMBOX_DISABLED_DIR", "/etc/gembox/disabled");
        let mut disabled = BTreeSet::new();
        for service in SERVICES {
            if disabled_dir
                .join(format!("{}.disabled", service.name))
                .exists()
            {
                disabled.insert(service.name);
            }
        }
        let proxy_port = read_port_var("PROXY_PORT", 8080)?
            .ok_or_else(|| GemboxError::Config("PROXY_PORT must not be empty".to_string()))?;
        Ok(Self {
            proxy_port,
            wait_host: read_string_var("WAIT_HOST", "127.0.0.1"),
            wait_ports: env::var("WAIT_PORTS")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            wait_interval: read_seconds_var("WAIT_INTERVAL", 0.5)?,
            wait_timeout: read_seconds_var("WAIT_TIMEOUT", 30.0)?,
            auth_token: read_string_var("GEMBOX_AUTH_TOKEN", ""),
            upstream_proxy: read_string_var("UPSTREAM_PROXY", ""),
            runtime_dir: read_path_var("GEMBOX_RUNTIME_DIR", "/run/gembox"),
            disabled_dir,
            forwarder_dir: read_path_var("GEMBOX_FORWARDER_DIR", "/etc/gembox/forwarder.d"),
            supervisor_dir: read_path_var("GEMBOX_SUPERVISOR_DIR", "/etc/supervisor/conf.d"),
            runtime_user: read_string_var("GEMBOX_USER", "gem"),
            proxy_cmd: read_string_var("GEMBOX_PROXY_CMD", "nginx -g 'daemon off;'"),
            supervisor_cmd: read_string_var(
                "GEMBOX_SUPERVISOR_CMD",
                "supervisord -n -c /etc/supervisor/supervisord.conf",
            ),
            supervisorctl: read_path_var("GEMBOX_SUPERVISORCTL", "supervisorctl"),
            service_ports,
            disabled,
        })
    }
}

fn read_port_var(name: &str, default: u16) -> Result<Option<u16>, GemboxError> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<u16>()
                .map(Some)
                .map_err(|_| GemboxError::Config(format!("invalid port in {name}: {trimmed}")))
        }
        Err(_) => Ok(Some(default)),
    }
}

fn read_seconds_var(name: &str, default: f64) -> Result<f64, GemboxError> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Ok(default);
            }
            let seconds = trimmed.parse::<f64>().map_err(|_| {
                GemboxError::Config(format!("invalid duration in {name}: {trimmed}"))
            })?;
            if !seconds.is_finite() || seconds <= 0.0 {
                return Err(GemboxError::Config(format!(
                    "duration in {name} must be positive: {trimmed}"
                )));
            }
            Ok(seconds)
        }
        Err(_) => Ok(default),
    }
}

fn read_string_var(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn read_path_var(name: &str, default: &str) -> PathBuf {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
        _ => PathBuf::from(default),
    }
}

fn main() -> Result<(), GemboxError> {
    let cli = Cli::parse();
    let ctx = Context { json: cli.json };

    let result = match cli.command {
        Commands::Boot { no_exec } => handle_boot(&ctx, no_exec),
        Commands::Assemble => handle_assemble(&ctx),
        Commands::Wait => handle_wait(&ctx),
        Commands::LaunchProxy => handle_launch_proxy(&ctx),
        Commands::Doctor => handle_doctor(&ctx),
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

fn log_line(message: &str) {
    println!("[{}] {message}", Utc::now().format("%m%d/%H%M%S%.3f"));
}

// ---------------------------------------------------------------------------
// Port prober and readiness gate

fn probe_port(host: &str, port: u16, connect_timeout: Duration) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, connect_timeout).is_ok() {
            return true;
        }
    }
    false
}

fn readiness_ports(env: &Env) -> Result<Vec<u16>, GemboxError> {
    let disabled_ports: Vec<u16> = SERVICES
        .iter()
        .filter(|service| env.disabled.contains(service.name))
        .filter_map(|service| env.service_ports[service.name])
        .collect();

    let ports = match &env.wait_ports {
        Some(raw) => {
            let mut ports = Vec::new();
            for token in raw.split(',') {
                let token = token.trim();
                if token.is_empty() {
                    continue;
                }
                let port = token.parse::<u16>().map_err(|_| {
                    GemboxError::Config(format!("invalid port in WAIT_PORTS: {token}"))
                })?;
                ports.push(port);
            }
            ports
        }
        None => SERVICES
            .iter()
            .filter(|service| !env.disabled.contains(service.name))
            .filter_map(|service| env.service_ports[service.name])
            .collect(),
    };

    // A disabled service's port never survives into the probed set, even
    // when the caller supplied an explicit override list.
    Ok(ports
        .into_iter()
        .filter(|port| !disabled_ports.contains(port))
        .collect())
}

fn wait_for_ports(env: &Env, ports: &[u16]) -> Result<(), GemboxError> {
    if ports.is_empty() {
        return Ok(());
    }
    let interval = Duration::from_secs_f64(env.wait_interval);
    let timeout = Duration::from_secs_f64(env.wait_timeout);
    let connect_timeout = interval.min(Duration::from_secs(1));
    let start = Instant::now();
    loop {
        let mut pending = None;
        for port in ports {
            if !probe_port(&env.wait_host, *port, connect_timeout) {
                pending = Some(*port);
                break;
            }
        }
        let Some(port) = pending else {
            return Ok(());
        };
        thread::sleep(interval);
        if start.elapsed() >= timeout {
            return Err(GemboxError::Timeout(format!(
                "{}:{port} not accepting connections after {}s",
                env.wait_host, env.wait_timeout
            )));
        }
    }
}

fn handle_wait(ctx: &Context) -> Result<(), GemboxError> {
    let env = Env::from_env()?;
    let ports = readiness_ports(&env)?;
    wait_for_ports(&env, &ports)?;
    output(ctx, json!({ "ready": true, "ports": ports }))
}

fn handle_launch_proxy(_ctx: &Context) -> Result<(), GemboxError> {
    let env = Env::from_env()?;
    let ports = readiness_ports(&env)?;
    log_line(&format!(
        "waiting for backends on {:?} (interval {}s, timeout {}s)",
        ports, env.wait_interval, env.wait_timeout
    ));
    wait_for_ports(&env, &ports)?;
    log_line("backends ready, starting proxy");
    exec_shell(&env.proxy_cmd)
}

#[cfg(unix)]
fn exec_shell(command: &str) -> Result<(), GemboxError> {
    let err = Command::new("sh").arg("-c").arg(command).exec();
    Err(GemboxError::Process(format!(
        "failed to exec '{command}': {err}"
    )))
}

#[cfg(not(unix))]
fn exec_shell(command: &str) -> Result<(), GemboxError> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .status()
        .map_err(|err| GemboxError::Process(format!("failed to run '{command}': {err}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(GemboxError::Process(format!(
            "'{command}' exited with status {status}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Template resolver

fn substitute(template: &str, bindings: &BTreeMap<String, String>) -> String {
    // Only declared binding names are replaced; any other ${...} in the
    // template stays literal.
    let mut out = template.to_string();
    for (name, value) in bindings {
        out = out.replace(&format!("${{{name}}}"), value);
    }
    out
}

#[derive(Debug, Clone)]
struct Fragment {
    name: String,
    contents: String,
}

fn load_fragments(dir: &Path) -> Result<(Fragment, Vec<Fragment>), GemboxError> {
    let base_path = dir.join(BASE_FRAGMENT_NAME);
    if !base_path.is_file() {
        return Err(GemboxError::Config(format!(
            "missing base forwarder fragment: {}",
            base_path.display()
        )));
    }
    let base = Fragment {
        name: BASE_FRAGMENT_NAME.to_string(),
        contents: fs::read_to_string(&base_path)?,
    };
    let mut extras = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name == BASE_FRAGMENT_NAME || !name.ends_with(".conf") {
            continue;
        }
        extras.push(Fragment {
            name,
            contents: fs::read_to_string(entry.path())?,
        });
    }
    extras.sort_by(|a, b| a.name.cmp(&b.name));
    Ok((base, extras))
}

fn push_fragment(out: &mut String, name: &str, contents: &str) {
    out.push_str(&format!("# fragment: {name}\n"));
    out.push_str(contents.trim_end_matches('\n'));
    out.push_str("\n\n");
}

fn render_forwarder(
    base: &Fragment,
    upstream: Option<&str>,
    extras: &[Fragment],
    bindings: &BTreeMap<String, String>,
) -> String {
    let mut out = String::new();
    push_fragment(&mut out, &base.name, &substitute(&base.contents, bindings));
    if let Some(addr) = upstream {
        out.push_str("# fragment: upstream (environment)\n");
        out.push_str(&format!("forward / {addr}\n\n"));
    }
    for fragment in extras {
        push_fragment(
            &mut out,
            &fragment.name,
            &substitute(&fragment.contents, bindings),
        );
    }
    out
}

// ---------------------------------------------------------------------------
// Config assembler

fn auth_enabled(env: &Env) -> bool {
    !env.auth_token.trim().is_empty()
}

fn upstream_address(env: &Env) -> Option<&str> {
    let trimmed = env.upstream_proxy.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("true") {
        None
    } else {
        Some(trimmed)
    }
}

fn required_port(env: &Env, name: &str) -> Result<u16, GemboxError> {
    env.service_ports
        .get(name)
        .copied()
        .flatten()
        .ok_or_else(|| GemboxError::Config(format!("{name} port is not configured")))
}

fn proxy_bindings(env: &Env) -> Result<BTreeMap<String, String>, GemboxError> {
    let mut bindings = BTreeMap::new();
    bindings.insert("PROXY_PORT".to_string(), env.proxy_port.to_string());
    bindings.insert("GEM_PORT".to_string(), required_port(env, "gem")?.to_string());
    bindings.insert("CDP_PORT".to_string(), required_port(env, "cdp")?.to_string());
    bindings.insert(
        "RUNTIME_DIR".to_string(),
        env.runtime_dir.display().to_string(),
    );
    if auth_enabled(env) {
        bindings.insert("AUTH_TOKEN".to_string(), env.auth_token.trim().to_string());
    }
    Ok(bindings)
}

fn assemble_configs(env: &Env) -> Result<Vec<PathBuf>, GemboxError> {
    fs::create_dir_all(&env.runtime_dir)?;
    fs::create_dir_all(env.runtime_dir.join("proxy.d"))?;
    let mut written = Vec::new();

    // Proxy routing config: exactly one variant per boot.
    let proxy_path = env.runtime_dir.join("proxy.conf");
    let template = if auth_enabled(env) {
        PROXY_AUTH_TEMPLATE
    } else {
        PROXY_OPEN_TEMPLATE
    };
    write_atomic_text_file(&proxy_path, &substitute(template, &proxy_bindings(env)?))?;
    written.push(proxy_path);

    // Upstream forwarder config, assembled from fragments.
    let forwarder_path = env.runtime_dir.join("forwarder.conf");
    if env.upstream_proxy.trim().is_empty() {
        remove_if_present(&forwarder_path)?;
    } else {
        let (base, extras) = load_fragments(&env.forwarder_dir)?;
        let rendered = render_forwarder(&base, upstream_address(env), &extras, &BTreeMap::new());
        write_atomic_text_file(&forwarder_path, &rendered)?;
        written.push(forwarder_path);
    }

    // MCP feature config: a supervisor program fragment plus a proxy route.
    let route_path = env.runtime_dir.join("proxy.d").join("mcp.conf");
    let program_path = env.supervisor_dir.join("mcp.conf");
    let mcp_port = env.service_ports.get("mcp").copied().flatten();
    match mcp_port {
        Some(port) if !env.disabled.contains("mcp") => {
            let mut bindings = BTreeMap::new();
            bindings.insert("MCP_PORT".to_string(), port.to_string());
            bindings.insert("RUN_USER".to_string(), env.runtime_user.clone());
            fs::create_dir_all(&env.supervisor_dir)?;
            write_atomic_text_file(&route_path, &substitute(MCP_ROUTE_TEMPLATE, &bindings))?;
            write_atomic_text_file(&program_path, &substitute(MCP_PROGRAM_TEMPLATE, &bindings))?;
            written.push(route_path);
            written.push(program_path);
        }
        _ => {
            remove_if_present(&route_path)?;
            remove_if_present(&program_path)?;
        }
    }

    Ok(written)
}

fn handle_assemble(ctx: &Context) -> Result<(), GemboxError> {
    let env = Env::from_env()?;
    let written = assemble_configs(&env)?;
    output(
        ctx,
        json!({ "written": written.iter().map(|p| p.display().to_string()).collect::<Vec<_>>() }),
    )
}

// ---------------------------------------------------------------------------
// Boot orchestrator

fn handle_boot(ctx: &Context, no_exec: bool) -> Result<(), GemboxError> {
    let env = Env::from_env()?;
    ensure_runtime_user(&env)?;
    prepare_filesystem(&env)?;
    let written = assemble_configs(&env)?;
    for path in &written {
        log_line(&format!("wrote {}", path.display()));
    }
    if no_exec {
        return output(
            ctx,
            json!({
                "written": written.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                "exec": false,
            }),
        );
    }
    log_line("handing control to the process supervisor");
    exec_shell(&env.supervisor_cmd)
}

fn ensure_runtime_user(env: &Env) -> Result<(), GemboxError> {
    let user = env.runtime_user.trim();
    if user.is_empty() {
        return Ok(());
    }
    let exists = Command::new("id")
        .arg("-u")
        .arg(user)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    if exists {
        return Ok(());
    }
    let status = Command::new("useradd")
        .args(["--system", "--create-home", "--shell", "/usr/sbin/nologin"])
        .arg(user)
        .status()
        .map_err(|err| GemboxError::Process(format!("failed to run useradd: {err}")))?;
    if !status.success() {
        return Err(GemboxError::Process(format!(
            "useradd {user} failed with status {status}"
        )));
    }
    log_line(&format!("created runtime user {user}"));
    Ok(())
}

fn prepare_filesystem(env: &Env) -> Result<(), GemboxError> {
    fs::create_dir_all(&env.runtime_dir)?;
    fs::create_dir_all(env.runtime_dir.join("proxy.d"))?;
    fs::create_dir_all(&env.disabled_dir)?;
    fs::create_dir_all(&env.forwarder_dir)?;
    let base = env.forwarder_dir.join(BASE_FRAGMENT_NAME);
    if !base.exists() {
        write_atomic_text_file(&base, FORWARDER_BASE_FRAGMENT)?;
    }
    if current_uid() == 0 && !env.runtime_user.trim().is_empty() {
        chown_tree(env.runtime_user.trim(), &env.runtime_dir)?;
    }
    Ok(())
}

fn chown_tree(user: &str, path: &Path) -> Result<(), GemboxError> {
    let status = Command::new("chown")
        .arg("-R")
        .arg(format!("{user}:"))
        .arg(path)
        .status()
        .map_err(|err| GemboxError::Process(format!("failed to run chown: {err}")))?;
    if !status.success() {
        return Err(GemboxError::Process(format!(
            "chown of {} failed with status {status}",
            path.display()
        )));
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

// ---------------------------------------------------------------------------
// Doctor

fn dir_writable(path: &Path) -> bool {
    fs::create_dir_all(path)
        .and_then(|_| {
            let probe = path.join(".gembox_write_test");
            fs::write(&probe, b"ok")?;
            fs::remove_file(&probe)?;
            Ok(())
        })
        .is_ok()
}

fn handle_doctor(ctx: &Context) -> Result<(), GemboxError> {
    let env = Env::from_env()?;
    let supervisor_ok = which::which(&env.supervisorctl).is_ok();
    let runtime_ok = dir_writable(&env.runtime_dir);

    let mut services = BTreeMap::new();
    for service in SERVICES {
        let Some(port) = env.service_ports[service.name] else {
            continue;
        };
        let live = probe_port(&env.wait_host, port, Duration::from_millis(250));
        services.insert(format!("{}:{port}", service.name), live);
    }

    if ctx.json {
        let payload = JsonResult {
            ok: runtime_ok,
            result: Some(json!({
                "supervisorctl": supervisor_ok,
                "runtime_dir_writable": runtime_ok,
                "services": services,
            })),
            error: if runtime_ok {
                None
            } else {
                Some("runtime directory is not writable".to_string())
            },
        };
        print_json(&payload)?;
    } else {
        println!(
            "Supervisor control: {}",
            if supervisor_ok { "ok" } else { "missing" }
        );
        println!(
            "Runtime dir: {}",
            if runtime_ok { "writable" } else { "not writable" }
        );
        for (name, live) in &services {
            println!("Backend {name}: {}", if *live { "up" } else { "down" });
        }
    }
    if !runtime_ok {
        return Err(GemboxError::Process(
            "runtime directory is not writable".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared plumbing

fn ensure_parent(path: &Path) -> Result<(), GemboxError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn write_atomic_text_file(path: &Path, content: &str) -> Result<(), GemboxError> {
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
            .unwrap_or_else(|| "gembox".to_string()),
        pid,
        ts
    ));
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), GemboxError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(GemboxError::Io(err)),
    }
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), GemboxError> {
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

fn print_json<T: Serialize>(payload: &T) -> Result<(), GemboxError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
