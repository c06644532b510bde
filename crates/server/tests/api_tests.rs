use axum::http::StatusCode;
use axum_test::TestServer;
use opsdash_core::BuildKind;
use serde_json::{json, Value};
use server::config::DashboardConfig;
use server::{create_router, state::AppState};
use std::time::Duration;
use tempfile::TempDir;

fn test_config(repo: &std::path::Path, step_delay: Duration) -> DashboardConfig {
    let mut config = DashboardConfig::default();
    config.build.repo_path = repo.to_path_buf();
    config.build.use_sudo = false;
    config.build.build_account = "opsdash-no-such-user".to_string();
    config.build.owner_account = "opsdash-no-such-owner".to_string();
    config.build.mock_step_delay_ms = step_delay.as_millis() as u64;
    config.build.abort_settle_timeout_secs = 10;
    config
}

fn setup_test_server(step_delay: Duration) -> (TestServer, AppState, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let state = AppState::new(test_config(temp_dir.path(), step_delay));
    let app = create_router(state.clone());
    let server = TestServer::new(app).expect("Failed to create test server");
    (server, state, temp_dir)
}

fn parse_ndjson(body: &str) -> Vec<Value> {
    body.lines()
        .map(|line| serde_json::from_str(line).expect("Invalid NDJSON line"))
        .collect()
}

mod health {
    use super::*;

    #[tokio::test]
    async fn test_health_endpoint() {
        let (server, _state, _temp_dir) = setup_test_server(Duration::ZERO);

        let response = server.get("/health").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["build_running"], false);
    }

    #[tokio::test]
    async fn test_openapi_lists_build_routes() {
        let (server, _state, _temp_dir) = setup_test_server(Duration::ZERO);

        let response = server.get("/api/openapi.json").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert!(body["paths"]["/api/build"].is_object());
        assert!(body["paths"]["/api/build/abort"].is_object());
    }
}

mod config {
    use super::*;

    #[tokio::test]
    async fn test_public_config() {
        let (server, _state, temp_dir) = setup_test_server(Duration::from_millis(7));

        let response = server.get("/api/config").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["build_dir"], "build-wmma");
        assert_eq!(body["mock_step_delay_ms"], 7);
        assert_eq!(
            body["repo_path"],
            temp_dir.path().display().to_string().as_str()
        );
    }
}

mod build {
    use super::*;

    #[tokio::test]
    async fn test_mock_build_streams_ndjson() {
        let (server, _state, _temp_dir) = setup_test_server(Duration::ZERO);

        let response = server.post("/api/build").add_query_param("mock", "true").await;

        response.assert_status_ok();
        assert_eq!(
            response.header("content-type").to_str().unwrap(),
            "application/x-ndjson"
        );

        let messages = parse_ndjson(&response.text());
        assert_eq!(messages.len(), 11);
        assert_eq!(messages[0], json!({"output": "Starting mock build process..."}));
        assert_eq!(messages[9], json!({"output": "Build completed successfully!"}));
        assert_eq!(messages[10], json!({"status": "completed", "success": true}));
    }

    #[tokio::test]
    async fn test_status_after_build() {
        let (server, _state, _temp_dir) = setup_test_server(Duration::ZERO);

        server
            .post("/api/build")
            .add_query_param("mock", "true")
            .await
            .assert_status_ok();

        let response = server.get("/api/build/status").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["running"], false);
        assert!(body["active"].is_null());
        assert_eq!(body["last"]["state"], "succeeded");
        assert_eq!(body["last"]["kind"], "mock");
        assert_eq!(body["last"]["result"], true);
    }

    #[tokio::test]
    async fn test_malformed_query_is_bad_request() {
        let (server, _state, _temp_dir) = setup_test_server(Duration::ZERO);

        let response = server
            .post("/api/build")
            .add_query_param("mock", "maybe")
            .expect_failure()
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn test_start_while_running_conflicts() {
        let (server, state, _temp_dir) = setup_test_server(Duration::from_millis(500));

        let stream = state.builds.start(BuildKind::Mock).unwrap();

        let response = server
            .post("/api/build")
            .add_query_param("mock", "true")
            .expect_failure()
            .await;

        response.assert_status(StatusCode::CONFLICT);
        let body: Value = response.json();
        assert_eq!(body["error"], "conflict");

        let status: Value = server.get("/api/build/status").await.json();
        assert_eq!(status["running"], true);

        let abort: Value = server.post("/api/build/abort").await.json();
        assert_eq!(abort["status"], "aborted");

        let messages = stream.collect_all().await;
        assert_eq!(messages.last().and_then(|m| m.success()), Some(false));
    }

    #[tokio::test]
    async fn test_abort_when_idle() {
        let (server, _state, _temp_dir) = setup_test_server(Duration::ZERO);

        let response = server.post("/api/build/abort").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "not_running");
        assert!(body.get("session_id").is_none());
        assert!(body.get("backup_restored").is_none());
    }

    #[tokio::test]
    async fn test_real_build_failure_reports_and_recovers() {
        let (server, _state, temp_dir) = setup_test_server(Duration::ZERO);
        let output_dir = temp_dir.path().join("build-wmma");
        std::fs::create_dir(&output_dir).unwrap();
        std::fs::write(output_dir.join("server"), "old").unwrap();

        let response = server.post("/api/build").await;

        response.assert_status_ok();
        let messages = parse_ndjson(&response.text());
        let lines: Vec<&str> = messages
            .iter()
            .filter_map(|m| m["output"].as_str())
            .collect();

        assert_eq!(
            lines.first().copied(),
            Some("Changing repository ownership to opsdash-no-such-user...")
        );
        assert!(lines
            .iter()
            .any(|l| l.starts_with("Build failed with error:")));
        assert_eq!(
            lines.last().copied(),
            Some("Warning: Failed to restore ownership to opsdash-no-such-owner")
        );
        assert_eq!(
            messages.last(),
            Some(&json!({"status": "completed", "success": false}))
        );

        // Existing output is moved aside even when the first stage fails
        let failed = temp_dir.path().join("build-wmma.failed.0");
        assert!(lines
            .iter()
            .any(|l| *l == format!("Moved failed build to {}", failed.display())));
        assert_eq!(std::fs::read_to_string(failed.join("server")).unwrap(), "old");
        assert!(!output_dir.exists());
    }
}
