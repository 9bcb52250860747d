use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("browserctl");
    Command::new(path)
}

// A supervisorctl stand-in that records its invocations.
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

fn write_program_conf(dir: &Path, command: &str) -> PathBuf {
    let conf = dir.join("browser.conf");
    fs::write(
        &conf,
        format!("[program:browser]\ncommand={command}\nautostart=true\nautorestart=true\n"),
    )
    .unwrap();
    conf
}

#[test]
fn install_rejects_unknown_tag_before_any_network_call() {
    bin()
        .arg("install")
        .arg("netscape")
        .assert()
        .failure()
        .code(1)
        .stderr(contains("invalid install source: netscape"));
}

#[test]
fn install_rejects_unsupported_package_suffix() {
    bin()
        .arg("install")
        .arg("https://mirror.example/browser.zip")
        .assert()
        .failure()
        .code(1)
        .stderr(contains("unsupported package kind"));
}

#[test]
fn archive_install_refuses_non_empty_target_before_download() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("custom");
    fs::create_dir_all(&target).unwrap();
    fs::write(target.join("chrome"), "old install").unwrap();

    // example.invalid never resolves; failing fast with the precondition
    // error proves no download was attempted.
    bin()
        .arg("--browsers-dir")
        .arg(dir.path())
        .arg("install")
        .arg("https://example.invalid/browser.tar.gz")
        .assert()
        .failure()
        .code(1)
        .stderr(contains("install target is not empty"));
    assert_eq!(
        fs::read_to_string(target.join("chrome")).unwrap(),
        "old install"
    );
}

#[test]
fn set_args_replaces_tail_and_cycles_supervisor() {
    let dir = tempdir().unwrap();
    let (stub, log) = write_supervisorctl_stub(dir.path(), 0);
    let conf = write_program_conf(dir.path(), "/usr/bin/x-browser --old-flag --headless=old");

    bin()
        .env("GEMBOX_SUPERVISORCTL", &stub)
        .arg("--program-conf")
        .arg(&conf)
        .arg("set-args")
        .arg("--flag-x")
        .assert()
        .success();

    let content = fs::read_to_string(&conf).unwrap();
    assert!(content.contains("command=/usr/bin/x-browser --flag-x\n"));
    assert!(!content.contains("--old-flag"));
    assert!(content.contains("autostart=true"));

    let calls = fs::read_to_string(&log).unwrap();
    let calls: Vec<&str> = calls.lines().collect();
    assert_eq!(calls, vec!["reread", "update", "restart browser"]);
}

#[test]
fn append_args_keeps_existing_tail() {
    let dir = tempdir().unwrap();
    let (stub, _log) = write_supervisorctl_stub(dir.path(), 0);
    let conf = write_program_conf(dir.path(), "/usr/bin/x-browser --flag-a");

    bin()
        .env("GEMBOX_SUPERVISORCTL", &stub)
        .arg("--program-conf")
        .arg(&conf)
        .arg("append-args")
        .arg("--flag-y")
        .assert()
        .success();

    let content = fs::read_to_string(&conf).unwrap();
    assert!(content.contains("command=/usr/bin/x-browser --flag-a --flag-y\n"));
}

#[test]
fn append_args_twice_accumulates_duplicates() {
    let dir = tempdir().unwrap();
    let (stub, _log) = write_supervisorctl_stub(dir.path(), 0);
    let conf = write_program_conf(dir.path(), "/usr/bin/x-browser");

    for _ in 0..2 {
        bin()
            .env("GEMBOX_SUPERVISORCTL", &stub)
            .arg("--program-conf")
            .arg(&conf)
            .arg("append-args")
            .arg("--flag-y")
            .assert()
            .success();
    }

    let content = fs::read_to_string(&conf).unwrap();
    assert!(content.contains("command=/usr/bin/x-browser --flag-y --flag-y\n"));
}

#[test]
fn set_args_fails_when_config_is_missing() {
    let dir = tempdir().unwrap();
    let (stub, _log) = write_supervisorctl_stub(dir.path(), 0);

    bin()
        .env("GEMBOX_SUPERVISORCTL", &stub)
        .arg("--program-conf")
        .arg(dir.path().join("absent.conf"))
        .arg("set-args")
        .arg("--flag-x")
        .assert()
        .failure()
        .code(1)
        .stderr(contains("supervisor config missing"));
}

#[test]
fn set_args_is_fatal_when_supervisor_is_unreachable() {
    let dir = tempdir().unwrap();
    let (stub, _log) = write_supervisorctl_stub(dir.path(), 7);
    let conf = write_program_conf(dir.path(), "/usr/bin/x-browser --flag-a");

    // Unlike install's best-effort restart, argument edits target a live
    // system: a failing control channel must fail the command.
    bin()
        .env("GEMBOX_SUPERVISORCTL", &stub)
        .arg("--program-conf")
        .arg(&conf)
        .arg("set-args")
        .arg("--flag-x")
        .assert()
        .failure()
        .code(1);
}

#[test]
fn json_error_envelope_on_failure() {
    let output = bin()
        .arg("--json")
        .arg("install")
        .arg("netscape")
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let value: serde_json::Value = serde_json::from_slice(&output).expect("json output");
    assert!(!value["ok"].as_bool().unwrap());
    assert!(value["error"]
        .as_str()
        .unwrap()
        .contains("invalid install source"));
}
