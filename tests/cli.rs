use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ctx_ingest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ctx-ingest");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let exports = root.join("exports/github");
    fs::create_dir_all(&exports).unwrap();
    fs::write(
        exports.join("activity.jsonl"),
        concat!(
            r#"{"id":"pr-7","type":"pull_request","timestamp":"2024-05-01T10:00:00Z","author":"alice","title":"Adopt WAL mode","body":"We agreed to enable WAL because readers block writers.","files":["src/db.rs"],"labels":["storage"]}"#,
            "\n",
            r#"{"id":"c-9","type":"commit","timestamp":"2024-05-02T08:30:00Z","author":"bob","title":"Tune busy timeout","files":["src/db.rs"]}"#,
            "\n",
        ),
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/ctx-ingest.sqlite"

[processing]
batch_size = 5
retry_delay_ms = 10

[connectors.export.github]
root = "{root}/exports/github"
display_name = "GitHub export"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("ctx-ingest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ctx_ingest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ctx_ingest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ctx-ingest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

/// Create a project with one github integration; returns their IDs.
fn create_project(config_path: &Path) -> (String, String) {
    let (stdout, stderr, success) = run_ctx_ingest(config_path, &["project", "create", "payments"]);
    assert!(success, "project create failed: {}", stderr);
    let project_id = stdout.trim().to_string();

    let (stdout, stderr, success) = run_ctx_ingest(
        config_path,
        &["integration", "add", &project_id, "github", "--name", "Payments repo"],
    );
    assert!(success, "integration add failed: {}", stderr);
    (project_id, stdout.trim().to_string())
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ctx_ingest(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_ctx_ingest(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_ctx_ingest(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_connectors_lists_export_platforms() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_ctx_ingest(&config_path, &["connectors"]);
    assert!(success);
    assert!(stdout.contains("github"));
    assert!(stdout.contains("GitHub export"));
}

#[test]
fn test_project_and_integration_listing() {
    let (_tmp, config_path) = setup_test_env();
    let (project_id, integration_id) = create_project(&config_path);

    let (stdout, _, success) = run_ctx_ingest(&config_path, &["project", "list"]);
    assert!(success);
    assert!(stdout.contains("payments"));
    assert!(stdout.contains(&project_id));

    let (stdout, _, success) = run_ctx_ingest(&config_path, &["integration", "list", &project_id]);
    assert!(success);
    assert!(stdout.contains(&integration_id));
    assert!(stdout.contains("active"));

    let (stdout, stderr, success) = run_ctx_ingest(
        &config_path,
        &["source", "add", &integration_id, "repository", "acme/payments"],
    );
    assert!(success, "source add failed: {}", stderr);
    assert!(!stdout.trim().is_empty());

    let (stdout, _, success) = run_ctx_ingest(&config_path, &["source", "list", &project_id]);
    assert!(success);
    assert!(stdout.contains("acme/payments"));
}

#[test]
fn test_sync_then_resync_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();
    let (_, integration_id) = create_project(&config_path);

    let (stdout, stderr, success) = run_ctx_ingest(&config_path, &["sync", &integration_id]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("complete"));
    assert!(stdout.contains("processed:     2"));

    // Reset the time cursor so the export is fetched again in full.
    let (_, _, success) = run_ctx_ingest(
        &config_path,
        &[
            "checkpoint",
            "set",
            &integration_id,
            r#"{"total_events_processed": 2, "processed_event_ids": ["pr-7", "c-9"]}"#,
        ],
    );
    assert!(success);

    let (stdout, _, success) = run_ctx_ingest(&config_path, &["sync", &integration_id]);
    assert!(success);
    assert!(stdout.contains("duplicates:    2"));
    assert!(stdout.contains("processed:     0"));
}

#[test]
fn test_checkpoint_set_replaces() {
    let (_tmp, config_path) = setup_test_env();
    let (_, integration_id) = create_project(&config_path);

    for total in [100, 150] {
        let json = format!(r#"{{"total_events_processed": {}}}"#, total);
        let (_, stderr, success) = run_ctx_ingest(
            &config_path,
            &["checkpoint", "set", &integration_id, &json],
        );
        assert!(success, "checkpoint set failed: {}", stderr);
    }

    let (stdout, _, success) =
        run_ctx_ingest(&config_path, &["checkpoint", "get", &integration_id]);
    assert!(success);
    let checkpoint: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(checkpoint["total_events_processed"], 150);
}

#[test]
fn test_health_reports_failed_integration() {
    let (_tmp, config_path) = setup_test_env();
    let (project_id, _) = create_project(&config_path);

    // No connector is configured for slack, so its sync fails.
    let (stdout, _, success) = run_ctx_ingest(
        &config_path,
        &["integration", "add", &project_id, "slack"],
    );
    assert!(success);
    let slack_id = stdout.trim().to_string();
    let (_, stderr, success) = run_ctx_ingest(&config_path, &["sync", &slack_id]);
    assert!(!success);
    assert!(stderr.contains("No connector registered"));

    let (stdout, _, success) =
        run_ctx_ingest(&config_path, &["health", &project_id, "--json"]);
    assert!(success);
    let health: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(health["total_integrations"], 2);
    assert_eq!(health["failed_integrations"], 1);
    assert_eq!(health["overall_status"], "degraded");

    let (stdout, _, success) = run_ctx_ingest(&config_path, &["integration", "reset", &slack_id]);
    assert!(success);
    assert!(stdout.contains("active"));

    let (stdout, _, success) = run_ctx_ingest(&config_path, &["health", &project_id]);
    assert!(success);
    assert!(stdout.contains("Overall:      healthy"));
}

#[test]
fn test_process_file_prints_result() {
    let (tmp, config_path) = setup_test_env();
    let events = tmp.path().join("events.jsonl");
    fs::write(
        &events,
        concat!(
            r#"{"platform_id":"m-1","event_type":"message","timestamp":"2024-05-01T10:00:00Z","author":"alice","content":"Let's go with Postgres","platform":"slack","thread_id":"t-1"}"#,
            "\n",
            "not an event\n",
            r#"{"platform_id":"m-2","event_type":"message","timestamp":"2024-05-01T10:05:00Z","author":"bob","content":"Agreed","platform":"slack","thread_id":"t-1"}"#,
            "\n",
        ),
    )
    .unwrap();

    let (stdout, stderr, success) =
        run_ctx_ingest(&config_path, &["process", events.to_str().unwrap()]);
    assert!(success, "process failed: {}", stderr);
    let result: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(result["processed_events"], 2);
    assert_eq!(result["discussions"].as_array().unwrap().len(), 1);
    assert_eq!(result["decisions"].as_array().unwrap().len(), 2);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_ctx_ingest(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
