use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const MCP_ROUTE_TEMPLATE: &str = include_str!("../config/mcp-route.conf");
const MCP_PROGRAM_TEMPLATE: &str = include_str!("../config/mcp-program.conf");
const DEFAULT_MCP_PACKAGE: &str = "@playwright/mcp";
const SENTINEL_NAME: &str = "mcp.disabled";

#[derive(Parser, Debug)]
#[command(name = "mcpctl", version, about = "MCP sidecar CLI")]
struct Cli {
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Install {
        version: Option<String>,
    },
    Enable,
    Disable,
}

#[derive(Debug, Error)]
enum McpctlError {
    #[error("config error: {0}")]
    Config(String),
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

// Paths and values resolved once from the environment.
#[derive(Debug)]
struct Context {
    json: bool,
    runtime_dir: PathBuf,
    supervisor_dir: PathBuf,
    disabled_dir: PathBuf,
    mcp_port: u16,
    run_user: String,
    package: String,
    supervisorctl: PathBuf,
}

fn main() -> Result<(), McpctlError> {
    let cli = Cli::parse();
    let ctx = build_context(&cli)?;

    let result = match cli.command {
        Commands::Install { version } => handle_install(&ctx, version.as_deref()),
        Commands::Enable => handle_enable(&ctx),
        Commands::Disable => handle_disable(&ctx),
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

fn build_context(cli: &Cli) -> Result<Context, McpctlError> {
    let mcp_port = match env::var("MCP_PORT") {
        Ok(value) => {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                return Err(McpctlError::Config("MCP_PORT must not be empty".to_string()));
            }
            trimmed
                .parse::<u16>()
                .map_err(|_| McpctlError::Config(format!("invalid port in MCP_PORT: {trimmed}")))?
        }
        Err(_) => 8931,
    };
    Ok(Context {
        json: cli.json,
        runtime_dir: read_path_var("GEMBOX_RUNTIME_DIR", "/run/gembox"),
        supervisor_dir: read_path_var("GEMBOX_SUPERVISOR_DIR", "/etc/supervisor/conf.d"),
        disabled_dir: read_path_var("GEMBOX_DISABLED_DIR", "/etc/gembox/disabled"),
        mcp_port,
        run_user: env::var("GEMBOX_USER").unwrap_or_else(|_| "gem".to_string()),
        package: env::var("GEMBOX_MCP_PACKAGE").unwrap_or_else(|_| DEFAULT_MCP_PACKAGE.to_string()),
        supervisorctl: match env::var("GEMBOX_SUPERVISORCTL") {
            Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
            _ => PathBuf::from("supervisorctl"),
        },
    })
}

fn read_path_var(name: &str, default: &str) -> PathBuf {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
        _ => PathBuf::from(default),
    }
}

fn log_line(message: &str) {
    println!("[{}] {message}", Utc::now().format("%m%d/%H%M%S%.3f"));
}

fn route_path(ctx: &Context) -> PathBuf {
    ctx.runtime_dir.join("proxy.d").join("mcp.conf")
}

fn program_path(ctx: &Context) -> PathBuf {
    ctx.supervisor_dir.join("mcp.conf")
}

fn sentinel_path(ctx: &Context) -> PathBuf {
    ctx.disabled_dir.join(SENTINEL_NAME)
}

fn substitute(template: &str, bindings: &BTreeMap<String, String>) -> String {
    let mut out = template.to_string();
    for (name, value) in bindings {
        out = out.replace(&format!("${{{name}}}"), value);
    }
    out
}

fn mcp_bindings(ctx: &Context) -> BTreeMap<String, String> {
    let mut bindings = BTreeMap::new();
    bindings.insert("MCP_PORT".to_string(), ctx.mcp_port.to_string());
    bindings.insert("RUN_USER".to_string(), ctx.run_user.clone());
    bindings
}

fn write_feature_files(ctx: &Context) -> Result<(), McpctlError> {
    let bindings = mcp_bindings(ctx);
    write_atomic_text_file(&route_path(ctx), &substitute(MCP_ROUTE_TEMPLATE, &bindings))?;
    write_atomic_text_file(
        &program_path(ctx),
        &substitute(MCP_PROGRAM_TEMPLATE, &bindings),
    )?;
    remove_if_present(&sentinel_path(ctx))?;
    Ok(())
}

fn remove_feature_files(ctx: &Context) -> Result<(), McpctlError> {
    remove_if_present(&route_path(ctx))?;
    remove_if_present(&program_path(ctx))?;
    let sentinel = sentinel_path(ctx);
    ensure_parent(&sentinel)?;
    write_atomic_text_file(&sentinel, "disabled by mcpctl\n")?;
    Ok(())
}

fn handle_enable(ctx: &Context) -> Result<(), McpctlError> {
    write_feature_files(ctx)?;
    let supervisor = SupervisorCtl::new(&ctx.supervisorctl);
    supervisor.apply_config_changes(RestartPolicy::Required)?;
    output(ctx, json!({ "enabled": true, "port": ctx.mcp_port }))
}

fn handle_disable(ctx: &Context) -> Result<(), McpctlError> {
    remove_feature_files(ctx)?;
    let supervisor = SupervisorCtl::new(&ctx.supervisorctl);
    supervisor.apply_config_changes(RestartPolicy::Required)?;
    output(ctx, json!({ "enabled": false }))
}

fn handle_install(ctx: &Context, version: Option<&str>) -> Result<(), McpctlError> {
    which::which("npm")
        .map_err(|_| McpctlError::Process("npm is required to install the MCP server".to_string()))?;
    let spec = format!("{}@{}", ctx.package, version.unwrap_or("latest"));
    log_line(&format!("installing {spec}"));
    let output_result = Command::new("npm")
        .args(["install", "-g"])
        .arg(&spec)
        .output()
        .map_err(|err| McpctlError::Process(format!("failed to run npm: {err}")))?;
    if !output_result.status.success() {
        let stderr = String::from_utf8_lossy(&output_result.stderr).trim().to_string();
        return Err(McpctlError::Process(format!(
            "npm install {spec} failed with status {}: {stderr}",
            output_result.status
        )));
    }

    write_feature_files(ctx)?;
    // Install may run at image-build time before any supervisor exists.
    let supervisor = SupervisorCtl::new(&ctx.supervisorctl);
    supervisor.apply_config_changes(RestartPolicy::BestEffort)?;
    output(ctx, json!({ "installed": spec, "enabled": true }))
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

    fn run(&self, args: &[&str]) -> Result<(), McpctlError> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|err| {
                McpctlError::Process(format!("failed to run {}: {err}", self.program.display()))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(McpctlError::Process(format!(
                "{} {} failed with status {}: {stderr}",
                self.program.display(),
                args.join(" "),
                output.status
            )));
        }
        Ok(())
    }

    fn apply_config_changes(&self, policy: RestartPolicy) -> Result<(), McpctlError> {
        let result = self.run(&["reread"]).and_then(|_| self.run(&["update"]));
        match result {
            Ok(()) => Ok(()),
            Err(err) => match policy {
                RestartPolicy::Required => Err(err),
                RestartPolicy::BestEffort => {
                    eprintln!("warning: supervisor update skipped: {err}");
                    Ok(())
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Shared plumbing

fn ensure_parent(path: &Path) -> Result<(), McpctlError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn write_atomic_text_file(path: &Path, content: &str) -> Result<(), McpctlError> {
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
            .unwrap_or_else(|| "mcpctl".to_string()),
        pid,
        ts
    ));
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), McpctlError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(McpctlError::Io(err)),
    }
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), McpctlError> {
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

fn print_json<T: Serialize>(payload: &T) -> Result<(), McpctlError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
