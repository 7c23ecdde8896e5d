// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! HTTP-level tests: boot the server on port 0 against the echo provider
//! and drive it with a real client.

use std::sync::Arc;

use kuuzuki_bus::Bus;
use kuuzuki_config::Config;
use kuuzuki_core::App;
use kuuzuki_model::mock::EchoProvider;
use kuuzuki_model::ProviderRegistry;
use kuuzuki_permission::PermissionGate;
use kuuzuki_plugin::PluginHost;
use kuuzuki_server::ServerInfo;
use kuuzuki_storage::Storage;

async fn boot() -> (tempfile::TempDir, Arc<App>, String) {
    let dir = tempfile::tempdir().unwrap();
    let bus = Bus::new();
    let storage = Arc::new(Storage::open(dir.path().join("data"), Arc::clone(&bus)).unwrap());

    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(EchoProvider));

    let mut config = Config::default();
    config.model = Some("mock/echo".into());

    let plugins = PluginHost::new(Vec::new());
    let permissions = PermissionGate::new(Arc::clone(&bus), Arc::clone(&plugins), None, None);

    let app = App::assemble(
        bus,
        storage,
        Arc::new(config),
        Arc::new(providers),
        kuuzuki_tools::builtin_registry(),
        permissions,
        plugins,
        None,
        dir.path().to_path_buf(),
    )
    .unwrap();

    let (port, server) = kuuzuki_server::bind(Arc::clone(&app), "127.0.0.1", 0)
        .await
        .unwrap();
    tokio::spawn(server);

    (dir, app, format!("http://127.0.0.1:{port}"))
}

#[tokio::test]
async fn health_reports_status_and_version() {
    let (_dir, _app, base) = boot().await;
    let body: serde_json::Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert!(body["timestamp"].is_i64() || body["timestamp"].is_u64());
}

#[tokio::test]
async fn port_zero_publishes_the_chosen_port_in_server_info() {
    let (_dir, app, base) = boot().await;
    let info = ServerInfo::read(app.storage.root()).unwrap();
    assert!(base.ends_with(&info.port.to_string()));
    assert_eq!(info.pid, std::process::id());
}

#[tokio::test]
async fn session_crud_over_http() {
    let (_dir, _app, base) = boot().await;
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("{base}/session"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["title"], "Untitled");

    let listed: serde_json::Value = client
        .get(format!("{base}/session"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let fetched: serde_json::Value = client
        .get(format!("{base}/session/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["id"], id.as_str());

    let deleted = client
        .delete(format!("{base}/session/{id}"))
        .send()
        .await
        .unwrap();
    assert!(deleted.status().is_success());

    let missing = client
        .get(format!("{base}/session/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn posting_a_message_runs_a_turn() {
    let (_dir, _app, base) = boot().await;
    let client = reqwest::Client::new();

    let session: serde_json::Value = client
        .post(format!("{base}/session"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = session["id"].as_str().unwrap();

    let message: serde_json::Value = client
        .post(format!("{base}/session/{id}/message"))
        .json(&serde_json::json!({
            "parts": [{ "type": "text", "text": "ping" }]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(message["role"], "assistant");
    assert_eq!(message["finish"], "stop");
}

#[tokio::test]
async fn unknown_permission_reply_is_404() {
    let (_dir, _app, base) = boot().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/permission/reply"))
        .json(&serde_json::json!({
            "sessionId": "session_x",
            "permissionId": "permission_x",
            "response": "once"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sse_stream_projects_session_events_with_envelope_ids() {
    let (_dir, app, base) = boot().await;
    let client = reqwest::Client::new();

    let mut response = client
        .get(format!("{base}/event"))
        .send()
        .await
        .unwrap();

    // Trigger an observable event after the stream is open.
    let app2 = Arc::clone(&app);
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        app2.sessions.create(None).await.unwrap();
    });

    let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), response.chunk())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = String::from_utf8_lossy(&chunk);
    assert!(text.contains("event: session.updated"), "got: {text}");
    assert!(text.contains("id: "), "got: {text}");
}
