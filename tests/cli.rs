// Acceptance tests for the `seamless` binary
//
// Each test gets its own cache directory and buffer folder. The bash
// transformation reads its inputs from files named after the pins.

mod common;

use predicates::prelude::*;
use seamless::calculate_checksum;
use seamless::transformation::register_transformation_dict;
use serde_json::json;

use common::TestWorkspace;

/// `a + b` in bash, with code and inputs placed in the buffer folder
fn write_add_transformation(workspace: &TestWorkspace, a: i64, b: i64) -> (std::path::PathBuf, String) {
    let code = workspace.add_buffer(b"echo $(( $(cat a) + $(cat b) ))\n");
    let a = workspace.add_buffer(format!("{a}\n").as_bytes());
    let b = workspace.add_buffer(format!("{b}\n").as_bytes());
    let dict = json!({
        "__language__": "bash",
        "__output__": ["result", "int", null],
        "code": ["text", null, code.to_hex()],
        "a": ["int", null, a.to_hex()],
        "b": ["int", null, b.to_hex()],
    });
    let (tf_checksum, _, _) = register_transformation_dict(&dict).unwrap();
    let path = workspace.write_file("add.json", &dict.to_string());
    (path, tf_checksum.to_hex())
}

#[test]
fn test_checksum_of_file() {
    let workspace = TestWorkspace::new();
    let path = workspace.write_file("hello.txt", "hello\n");

    workspace
        .seamless()
        .arg("checksum")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains(calculate_checksum(b"hello\n").to_hex()));
}

#[test]
fn test_invalid_checksum_is_rejected() {
    let workspace = TestWorkspace::new();

    workspace
        .seamless()
        .args(["status", "not-a-checksum"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid checksum"));
}

#[test]
fn test_status_of_unknown_transformation() {
    let workspace = TestWorkspace::new();
    let unknown = calculate_checksum(b"never registered").to_hex();

    let output = workspace
        .seamless()
        .args(["status", &unknown])
        .output()
        .unwrap();
    assert!(output.status.success());
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["code"], -3);
    assert_eq!(status["status"], "unknown");
}

#[test]
fn test_bash_transformation_is_cached_across_invocations() {
    let workspace = TestWorkspace::new();
    let (path, tf_checksum) = write_add_transformation(&workspace, 2, 3);
    let expected = calculate_checksum(b"5\n").to_hex();

    // First run executes bash
    workspace
        .seamless()
        .arg("run")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains(&expected));

    // Second run is answered by the result store
    workspace
        .seamless()
        .arg("run")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains(&expected));

    workspace
        .seamless()
        .arg("run")
        .arg(&path)
        .arg("--value")
        .assert()
        .success()
        .stdout(predicate::str::diff("5\n"));

    let output = workspace
        .seamless()
        .args(["status", &tf_checksum])
        .output()
        .unwrap();
    assert!(output.status.success());
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["code"], 3);
    assert_eq!(status["result"], expected.as_str());

    workspace
        .seamless()
        .arg("fingertip")
        .arg(&expected)
        .assert()
        .success()
        .stdout(predicate::eq(b"5\n" as &[u8]));

    workspace
        .seamless()
        .args(["undo", &tf_checksum])
        .assert()
        .success()
        .stderr(predicate::str::contains("Forgot result"));

    // Nothing left to forget
    workspace
        .seamless()
        .args(["undo", &tf_checksum])
        .assert()
        .failure();
}

#[test]
fn test_failing_transformation_reports_logs() {
    let workspace = TestWorkspace::new();
    let code = workspace.add_buffer(b"echo broken >&2\nexit 3\n");
    let dict = json!({
        "__language__": "bash",
        "__output__": ["result", "int", null],
        "code": ["text", null, code.to_hex()],
    });
    let path = workspace.write_file("broken.json", &dict.to_string());

    workspace
        .seamless()
        .arg("run")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("broken"));
}

#[test]
fn test_recorded_failure_is_not_rerun() {
    let workspace = TestWorkspace::new();
    let counter = workspace.path().join("attempts");
    let code = workspace.add_buffer(format!("echo attempt >> '{}'\nexit 3\n", counter.display()).as_bytes());
    let dict = json!({
        "__language__": "bash",
        "__output__": ["result", "int", null],
        "code": ["text", null, code.to_hex()],
    });
    let (tf_checksum, _, _) = register_transformation_dict(&dict).unwrap();
    let path = workspace.write_file("failing.json", &dict.to_string());

    workspace.seamless().arg("run").arg(&path).assert().failure();
    // The exception comes back from the result store without running bash again
    workspace.seamless().arg("run").arg(&path).assert().failure();

    let attempts = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(attempts.lines().count(), 1);

    let output = workspace
        .seamless()
        .args(["status", &tf_checksum.to_hex()])
        .output()
        .unwrap();
    assert!(output.status.success());
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["code"], 0);
    assert_eq!(status["status"], "error");
}
