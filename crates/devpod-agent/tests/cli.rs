//! The devpod binary driven from the command line

use std::process::Command;

const AGENT: &str = env!("CARGO_BIN_EXE_devpod");

#[test]
fn test_version() {
    let output = Command::new(AGENT).arg("version").output().unwrap();

    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), env!("CARGO_PKG_VERSION"));
}

#[test]
fn test_up_on_local_target() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("devcontainer.json"), b"{\"image\":\"alpine\"}").unwrap();
    std::fs::create_dir(source.path().join("docs")).unwrap();
    std::fs::write(source.path().join("docs/notes.txt"), b"notes").unwrap();

    let target = tempfile::tempdir().unwrap();
    let target_dir = target.path().join("workspace");

    let output = Command::new(AGENT)
        .args(["up", "--target", "local", "--no-inject", "--id", "cli-test"])
        .arg("--source")
        .arg(source.path())
        .arg("--target-dir")
        .arg(&target_dir)
        .args(["--agent-path", AGENT, "--ping-timeout", "10"])
        .output()
        .unwrap();

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["contentSource"], "streamed-folder");
    assert_eq!(result["workspace"]["id"], "cli-test");
    assert_eq!(result["targetDir"], target_dir.to_str().unwrap());

    assert_eq!(
        std::fs::read(target_dir.join("devcontainer.json")).unwrap(),
        b"{\"image\":\"alpine\"}"
    );
    assert_eq!(std::fs::read(target_dir.join("docs/notes.txt")).unwrap(), b"notes");
}

#[test]
fn test_unknown_target_is_rejected() {
    let output = Command::new(AGENT)
        .args(["up", "--target", "ftp://example.com", "--no-inject"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unsupported target"), "{}", stderr);
}

#[test]
fn test_missing_agent_reports_handshake_failure() {
    let source = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();

    let output = Command::new(AGENT)
        .args(["up", "--target", "local", "--no-inject", "--ping-timeout", "5"])
        .arg("--source")
        .arg(source.path())
        .arg("--target-dir")
        .arg(target.path())
        .args(["--agent-path", "/nonexistent/devpod"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ping client"), "{}", stderr);
}
