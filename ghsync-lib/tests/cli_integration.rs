//! Integration tests for the `ghsync` commands, run against a mock GitHub API.

use ghsync_lib::Host;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Test host that captures output to in-memory buffers.
struct TestHost {
    output_buf: Vec<u8>,
    error_buf: Vec<u8>,
}

impl TestHost {
    const fn new() -> Self {
        Self {
            output_buf: Vec::new(),
            error_buf: Vec::new(),
        }
    }

    fn output_str(&self) -> String {
        String::from_utf8_lossy(&self.output_buf).into_owned()
    }

    fn error_str(&self) -> String {
        String::from_utf8_lossy(&self.error_buf).into_owned()
    }
}

impl Host for TestHost {
    fn output(&mut self) -> impl std::io::Write {
        &mut self.output_buf
    }

    fn error(&mut self) -> impl std::io::Write {
        &mut self.error_buf
    }
}

fn write_config(dir: &tempfile::TempDir, server: &MockServer) -> String {
    let config = format!(
        "base_url = \"{}\"\nrepo = \"octo/widgets\"\nrate_limit_per_hour = 3600000\ndatabase = \"{}\"\n",
        server.uri(),
        dir.path().join("ghsync.db").display().to_string().replace('\\', "/"),
    );

    let path = dir.path().join("ghsync.toml");
    std::fs::write(&path, config).unwrap();
    path.display().to_string()
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Miri cannot call CreateIoCompletionPort on Windows")]
async fn collect_then_extract_again() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/octo/widgets/pulls"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1, "number": 1, "state": "open"}])))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir, &server);

    let mut host = TestHost::new();
    ghsync_lib::run(
        &mut host,
        ["ghsync", "collect", "--config", &config, "--task", "collect_pull_requests", "--color", "never"],
    )
    .await
    .unwrap();

    let output = host.output_str();
    assert!(output.contains("Collected collect_pull_requests: full sync"), "got: {output}");
    assert!(output.contains("1 records new, 0 updated"), "got: {output}");

    let mut host = TestHost::new();
    ghsync_lib::run(
        &mut host,
        ["ghsync", "collect", "--config", &config, "--task", "collect_pull_requests", "--color", "never"],
    )
    .await
    .unwrap();
    let output = host.output_str();
    assert!(output.contains("incremental sync"), "got: {output}");
    assert!(output.contains("0 records new, 1 updated"), "got: {output}");

    let mut host = TestHost::new();
    ghsync_lib::run(&mut host, ["ghsync", "extract", "--config", &config, "--color", "never"])
        .await
        .unwrap();

    let output = host.output_str();
    assert!(output.contains("Extracted extract_commit_statuses"), "got: {output}");
    assert!(output.contains("Extracted extract_check_runs"), "got: {output}");
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Miri cannot call CreateIoCompletionPort on Windows")]
async fn failed_task_stops_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/octo/widgets/pulls"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "Bad credentials"})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir, &server);

    let mut host = TestHost::new();
    let result = ghsync_lib::run(&mut host, ["ghsync", "collect", "--config", &config, "--color", "never"]).await;

    assert!(result.is_err());
    assert!(host.error_str().contains("0 of 8 tasks completed"), "got: {}", host.error_str());
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Miri cannot call CreateIoCompletionPort on Windows")]
async fn missing_repository_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.toml");
    std::fs::write(&path, "").unwrap();
    let config = path.display().to_string();

    let mut host = TestHost::new();
    let err = ghsync_lib::run(&mut host, ["ghsync", "collect", "--config", &config])
        .await
        .unwrap_err();

    assert!(format!("{err}").contains("no repository given"));
}
