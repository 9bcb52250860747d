use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("mcpctl");
    Command::new(path)
}

fn write_supervisorctl_stub(dir: &Path, exit_code: i32) -> (PathBuf, PathBuf) {
    let log = dir.join("supervisorctl.log");
    let stub = dir.join("supervisorctl");
    fs::write(
        &stub,
        format!("#!/bin/sh\necho \"$@\" >> {}\nexit {exit_code}\n", log.display()),
    )
    .unwrap();
    #[cfg(unix)]
    fs::set_permissions(&stub, fs::Permissions::from_mode(0o755)).unwrap();
    (stub, log)
}

fn feature_env(cmd: &mut Command, root: &Path, stub: &Path) {
    cmd.env("GEMBOX_RUNTIME_DIR", root.join("run"))
        .env("GEMBOX_SUPERVISOR_DIR", root.join("supervisor.d"))
        .env("GEMBOX_DISABLED_DIR", root.join("disabled"))
        .env("GEMBOX_SUPERVISORCTL", stub);
}

#[test]
fn enable_writes_fragments_and_cycles_supervisor() {
    let dir = tempdir().unwrap();
    let (stub, log) = write_supervisorctl_stub(dir.path(), 0);

    let mut cmd = bin();
    feature_env(&mut cmd, dir.path(), &stub);
    cmd.env("MCP_PORT", "9050").arg("enable").assert().success();

    let route = fs::read_to_string(dir.path().join("run/proxy.d/mcp.conf")).unwrap();
    assert!(route.contains("http://127.0.0.1:9050/"));
    let program = fs::read_to_string(dir.path().join("supervisor.d/mcp.conf")).unwrap();
    assert!(program.contains("--port 9050"));
    assert!(!dir.path().join("disabled/mcp.disabled").exists());

    let calls = fs::read_to_string(&log).unwrap();
    let calls: Vec<&str> = calls.lines().collect();
    assert_eq!(calls, vec!["reread", "update"]);
}

#[test]
fn disable_removes_fragments_and_creates_sentinel() {
    let dir = tempdir().unwrap();
    let (stub, _log) = write_supervisorctl_stub(dir.path(), 0);

    let mut cmd = bin();
    feature_env(&mut cmd, dir.path(), &stub);
    cmd.arg("enable").assert().success();

    let mut cmd = bin();
    feature_env(&mut cmd, dir.path(), &stub);
    cmd.arg("disable").assert().success();

    assert!(!dir.path().join("run/proxy.d/mcp.conf").exists());
    assert!(!dir.path().join("supervisor.d/mcp.conf").exists());
    assert!(dir.path().join("disabled/mcp.disabled").exists());
}

#[test]
fn enable_is_fatal_when_supervisor_is_unreachable() {
    let dir = tempdir().unwrap();
    let (stub, _log) = write_supervisorctl_stub(dir.path(), 3);

    let mut cmd = bin();
    feature_env(&mut cmd, dir.path(), &stub);
    cmd.arg("enable").assert().failure().code(1);
}

#[test]
fn rejects_malformed_port() {
    let dir = tempdir().unwrap();
    let (stub, _log) = write_supervisorctl_stub(dir.path(), 0);

    let mut cmd = bin();
    feature_env(&mut cmd, dir.path(), &stub);
    cmd.env("MCP_PORT", "lots")
        .arg("enable")
        .assert()
        .failure()
        .code(1)
        .stderr(contains("MCP_PORT"));
}
