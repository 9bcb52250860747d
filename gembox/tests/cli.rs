use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("gembox");
    Command::new(path)
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

// A port that was bound and released is closed with high probability.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn assemble_env(cmd: &mut Command, root: &Path) {
    cmd.env("GEMBOX_RUNTIME_DIR", root.join("run"))
        .env("GEMBOX_DISABLED_DIR", root.join("disabled"))
        .env("GEMBOX_FORWARDER_DIR", root.join("forwarder.d"))
        .env("GEMBOX_SUPERVISOR_DIR", root.join("supervisor.d"))
        .env("GEMBOX_USER", "");
}

#[test]
fn wait_succeeds_when_port_is_live() {
    let dir = tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    bin()
        .env("WAIT_PORTS", port.to_string())
        .env("WAIT_INTERVAL", "0.1")
        .env("WAIT_TIMEOUT", "5")
        .env("GEMBOX_DISABLED_DIR", dir.path())
        .arg("--json")
        .arg("wait")
        .assert()
        .success();
}

#[test]
fn wait_times_out_with_deterministic_deadline() {
    let dir = tempdir().unwrap();
    let port = closed_port();

    let started = Instant::now();
    bin()
        .env("WAIT_PORTS", port.to_string())
        .env("WAIT_INTERVAL", "0.25")
        .env("WAIT_TIMEOUT", "1")
        .env("GEMBOX_DISABLED_DIR", dir.path())
        .arg("wait")
        .assert()
        .failure()
        .code(1)
        .stderr(contains("timed out"));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");
}

#[test]
fn wait_sees_listener_that_appears_after_start() {
    let dir = tempdir().unwrap();
    let port = closed_port();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        // Hold the socket open long enough for the gate to see it.
        thread::sleep(Duration::from_secs(3));
        drop(listener);
    });

    let started = Instant::now();
    bin()
        .env("WAIT_PORTS", port.to_string())
        .env("WAIT_INTERVAL", "0.1")
        .env("WAIT_TIMEOUT", "10")
        .env("GEMBOX_DISABLED_DIR", dir.path())
        .arg("wait")
        .assert()
        .success();
    assert!(started.elapsed() < Duration::from_secs(5));
    handle.join().unwrap();
}

#[test]
fn wait_excludes_sentinel_disabled_port_from_override() {
    let dir = tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let live_port = listener.local_addr().unwrap().port();
    let mcp_port = closed_port();
    fs::write(dir.path().join("mcp.disabled"), "").unwrap();

    // The disabled feature's port is in the override list but must not be
    // probed; the command succeeds with nothing listening on it.
    bin()
        .env("WAIT_PORTS", format!("{live_port},, {mcp_port} "))
        .env("MCP_PORT", mcp_port.to_string())
        .env("WAIT_INTERVAL", "0.1")
        .env("WAIT_TIMEOUT", "2")
        .env("GEMBOX_DISABLED_DIR", dir.path())
        .arg("--json")
        .arg("wait")
        .assert()
        .success()
        .stdout(contains(live_port.to_string()));
}

#[test]
fn wait_rejects_malformed_override() {
    let dir = tempdir().unwrap();
    bin()
        .env("WAIT_PORTS", "8088,not-a-port")
        .env("GEMBOX_DISABLED_DIR", dir.path())
        .arg("wait")
        .assert()
        .failure()
        .code(1)
        .stderr(contains("WAIT_PORTS"));
}

#[test]
fn assemble_writes_surfaces_and_is_idempotent() {
    let dir = tempdir().unwrap();
    let forwarder_dir = dir.path().join("forwarder.d");
    fs::create_dir_all(&forwarder_dir).unwrap();
    fs::write(
        forwarder_dir.join("base.conf"),
        "listen-address 127.0.0.1:8118\n",
    )
    .unwrap();
    fs::write(forwarder_dir.join("10-extra.conf"), "toggle 0\n").unwrap();

    let run = |root: &Path| {
        let mut cmd = bin();
        assemble_env(&mut cmd, root);
        cmd.env("GEMBOX_AUTH_TOKEN", "t0k3n")
            .env("UPSTREAM_PROXY", "squid.internal:3128")
            .arg("--json")
            .arg("assemble")
            .assert()
            .success();
    };
    run(dir.path());

    let proxy_conf = dir.path().join("run/proxy.conf");
    let forwarder_conf = dir.path().join("run/forwarder.conf");
    let first_proxy = fs::read(&proxy_conf).unwrap();
    let first_forwarder = fs::read(&forwarder_conf).unwrap();

    let forwarder_text = String::from_utf8(first_forwarder.clone()).unwrap();
    assert!(forwarder_text.starts_with("# fragment: base.conf\n"));
    let forward_at = forwarder_text.find("forward / squid.internal:3128").unwrap();
    let extra_at = forwarder_text.find("# fragment: 10-extra.conf").unwrap();
    assert!(forward_at < extra_at);

    let proxy_text = String::from_utf8(first_proxy.clone()).unwrap();
    assert!(proxy_text.contains("Bearer t0k3n"));

    run(dir.path());
    assert_eq!(fs::read(&proxy_conf).unwrap(), first_proxy);
    assert_eq!(fs::read(&forwarder_conf).unwrap(), first_forwarder);
}

#[test]
fn assemble_respects_mcp_sentinel() {
    let dir = tempdir().unwrap();
    let disabled_dir = dir.path().join("disabled");
    fs::create_dir_all(&disabled_dir).unwrap();

    let mut cmd = bin();
    assemble_env(&mut cmd, dir.path());
    cmd.arg("assemble").assert().success();
    assert!(dir.path().join("run/proxy.d/mcp.conf").exists());
    assert!(dir.path().join("supervisor.d/mcp.conf").exists());

    fs::write(disabled_dir.join("mcp.disabled"), "").unwrap();
    let mut cmd = bin();
    assemble_env(&mut cmd, dir.path());
    cmd.arg("assemble").assert().success();
    assert!(!dir.path().join("run/proxy.d/mcp.conf").exists());
    assert!(!dir.path().join("supervisor.d/mcp.conf").exists());
}

#[test]
fn boot_no_exec_prepares_filesystem_and_assembles() {
    let dir = tempdir().unwrap();

    let mut cmd = bin();
    assemble_env(&mut cmd, dir.path());
    let output = cmd
        .arg("--json")
        .arg("boot")
        .arg("--no-exec")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    // Boot seeds the default base fragment and writes the proxy config.
    assert!(dir.path().join("forwarder.d/base.conf").exists());
    assert!(dir.path().join("run/proxy.conf").exists());
    assert!(dir.path().join("disabled").is_dir());

    let json_start = output
        .iter()
        .position(|byte| *byte == b'{')
        .expect("json payload");
    let value = parse_json(&output[json_start..]);
    assert!(value["ok"].as_bool().unwrap());
    assert_eq!(value["result"]["exec"].as_bool().unwrap(), false);
}

#[test]
fn doctor_reports_runtime_dir() {
    let dir = tempdir().unwrap();
    let mut cmd = bin();
    assemble_env(&mut cmd, dir.path());
    let output = cmd
        .arg("--json")
        .arg("doctor")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    assert!(value["ok"].as_bool().unwrap());
    assert!(value["result"]["runtime_dir_writable"].as_bool().unwrap());
}
