//! Exit-code contract of the `matrix-ci` binary.

use std::path::Path;
use std::process::{Command, Output};

fn matrix_ci(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_matrix-ci"))
        .arg("--config")
        .arg(config)
        .args(args)
        .current_dir(config.parent().unwrap_or(Path::new(".")))
        .env_remove("MATRIX_CI_MAX_PARALLEL")
        .env_remove("MATRIX_CI_ARTIFACTS_DIR")
        .env_remove("MATRIX_CI_STATE_FILE")
        .output()
        .expect("failed to run matrix-ci")
}

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("matrix-ci.toml");
    std::fs::write(&path, body).unwrap();
    path
}

const PASSING: &str = r#"
[[axes]]
name = "os"
values = ["linux", "osx"]

[[steps]]
name = "build"
category = "build"
run = "echo building for $AXIS_OS"
"#;

#[test]
fn test_validate_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), PASSING);
    let out = matrix_ci(&config, &["validate"]);
    assert_eq!(out.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Jobs: 2"));
}

#[test]
fn test_config_error_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"
[[axes]]
name = "os"
values = ["linux"]

[[steps]]
name = "deps"
category = "provision"
run = "touch ran"
when = { equals = { axis = "python", value = "2.7" } }
"#,
    );
    let out = matrix_ci(&config, &["run"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("python"));
    assert!(!dir.path().join("ran").exists());
}

#[test]
fn test_missing_config_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let out = matrix_ci(&dir.path().join("absent.toml"), &["validate"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn test_passing_run_exits_0_and_writes_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), PASSING);
    let out = matrix_ci(&config, &["run"]);
    assert_eq!(out.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stdout).contains("Summary: 2/2 jobs passed"));
    assert!(dir.path().join(".matrix-ci/pipeline.json").exists());
}

#[test]
fn test_failing_job_exits_1() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"
[[steps]]
name = "test"
category = "test"
run = "exit 1"
"#,
    );
    let out = matrix_ci(&config, &["run", "--artifacts-dir", "out"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stdout).contains("Violations:"));
}

#[test]
fn test_expand_json_lists_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), PASSING);
    let out = matrix_ci(&config, &["expand", "--format", "json"]);
    assert_eq!(out.status.code(), Some(0));

    let jobs: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let jobs = jobs.as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0]["label"], "os=linux");
    assert_eq!(jobs[1]["axes"]["os"], "osx");
    assert_eq!(jobs[0]["key"].as_str().unwrap().len(), 64);
}

#[test]
fn test_plan_single_job() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), PASSING);
    let out = matrix_ci(&config, &["plan", "--job", "2"]);
    assert_eq!(out.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("#2 os=osx"));
    assert!(stdout.contains("echo building for $AXIS_OS"));
    assert!(!stdout.contains("#1 os=linux"));
}
