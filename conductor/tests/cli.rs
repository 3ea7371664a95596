//! CLI tests for `conductor init`, `conductor extract` and `conductor run`.
//!
//! Spawns the conductor binary in a scratch directory and checks exit codes,
//! stdout and the files it writes.

use std::fs;
use std::process::Command;

use conductor::exit_codes;
use conductor::io::config::{PipelineConfig, load_config};

fn conductor() -> Command {
    Command::new(env!("CARGO_BIN_EXE_conductor"))
}

#[test]
fn init_writes_default_config_and_respects_force() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("conductor.toml");

    let status = conductor()
        .current_dir(temp.path())
        .arg("init")
        .status()
        .expect("conductor init");
    assert_eq!(status.code(), Some(exit_codes::OK));
    assert_eq!(load_config(&path).expect("load"), PipelineConfig::default());

    fs::write(&path, "max_improvement_loops = 2\n").expect("edit");
    let status = conductor()
        .current_dir(temp.path())
        .arg("init")
        .status()
        .expect("conductor init again");
    assert_eq!(status.code(), Some(exit_codes::OK));
    assert_eq!(
        fs::read_to_string(&path).expect("read"),
        "max_improvement_loops = 2\n"
    );

    let status = conductor()
        .current_dir(temp.path())
        .args(["init", "--force"])
        .status()
        .expect("conductor init --force");
    assert_eq!(status.code(), Some(exit_codes::OK));
    assert_eq!(load_config(&path).expect("load").max_improvement_loops, 15);
}

#[test]
fn extract_prints_validated_payload() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("reply.txt"),
        "Here is the code:\n```json\n{\"description\": \"doubles\", \"code\": \"def f(x): return x*2\"}\n```\n",
    )
    .expect("write reply");

    let output = conductor()
        .current_dir(temp.path())
        .args(["extract", "--schema", "generated_code", "reply.txt"])
        .output()
        .expect("conductor extract");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"code\": \"def f(x): return x*2\""), "{stdout}");
}

#[test]
fn extract_rejects_invalid_payload() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("reply.txt"), "{\"review_comments\": \"not a list\"}")
        .expect("write reply");

    let output = conductor()
        .current_dir(temp.path())
        .args(["extract", "--schema", "code_review", "reply.txt"])
        .output()
        .expect("conductor extract");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid code_review payload"), "{stderr}");
}

#[test]
fn run_with_invalid_config_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("conductor.toml"),
        "[invoker]\nmax_retries = 0\n",
    )
    .expect("write config");

    let output = conductor()
        .current_dir(temp.path())
        .args(["run", "--task", "double a number"])
        .output()
        .expect("conductor run");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("max_retries"));
    assert!(!temp.path().join("workspace").exists());
}

#[test]
fn run_rejects_zero_iterations_override() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = conductor()
        .current_dir(temp.path())
        .args(["run", "--task", "double a number", "--max-iterations", "0"])
        .output()
        .expect("conductor run");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("max_improvement_loops"));
    assert!(!temp.path().join("workspace").exists());
}
