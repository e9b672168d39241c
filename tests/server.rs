//! End-to-end HTTP surface tests against a live listener.
//!
//! The library directory starts empty, which still exercises the full
//! router: parameter validation, error contract, auth, rate limiting, and
//! collections CRUD.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use zimi::app::App;
use zimi::config::Config;

struct TestServer {
    _tmp: TempDir,
    addr: SocketAddr,
    client: reqwest::Client,
    app: Arc<App>,
}

impl TestServer {
    async fn start(configure: impl FnOnce(&mut Config)) -> Self {
        let tmp = TempDir::new().unwrap();
        let zims = tmp.path().join("zims");
        std::fs::create_dir_all(&zims).unwrap();
        let mut config = Config::with_dirs(zims, tmp.path().join("data"));
        configure(&mut config);
        let app = App::new(config);
        app.startup().await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = zimi::server::router(app.clone());
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        TestServer {
            _tmp: tmp,
            addr,
            client: reqwest::Client::new(),
            app,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn get_json(&self, path: &str) -> (u16, serde_json::Value) {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(serde_json::Value::Null);
        (status, body)
    }
}

#[tokio::test]
async fn health_reports_ok_and_version() {
    let server = TestServer::start(|_| {}).await;
    let (status, body) = server.get_json("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["ok"], true);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn list_empty_library() {
    let server = TestServer::start(|_| {}).await;
    let (status, body) = server.get_json("/list").await;
    assert_eq!(status, 200);
    assert_eq!(body, serde_json::json!([]));
}

#[tokio::test]
async fn search_requires_query() {
    let server = TestServer::start(|_| {}).await;
    let (status, body) = server.get_json("/search").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn search_empty_library_returns_no_results() {
    let server = TestServer::start(|_| {}).await;
    let (status, body) = server.get_json("/search?q=water&fast=1&limit=3").await;
    assert_eq!(status, 200);
    assert_eq!(body["results"], serde_json::json!([]));
    assert_eq!(body["phase"], "title");
    assert_eq!(body["partial"], true);
}

#[tokio::test]
async fn search_unknown_archive_scope_is_404() {
    let server = TestServer::start(|_| {}).await;
    let (status, body) = server.get_json("/search?q=water&zim=ghost").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn search_unknown_collection_is_400() {
    let server = TestServer::start(|_| {}).await;
    let (status, body) = server.get_json("/search?q=water&collection=none").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn read_unknown_archive_is_404() {
    let server = TestServer::start(|_| {}).await;
    let (status, body) = server.get_json("/read?zim=ghost&path=A/Water").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn raw_unknown_archive_is_404() {
    let server = TestServer::start(|_| {}).await;
    let (status, _) = server.get_json("/w/ghost/A/Water").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn resolve_unknown_host_returns_null_archive() {
    let server = TestServer::start(|_| {}).await;
    let (status, body) = server
        .get_json("/resolve?url=https://en.wikipedia.org/wiki/Water")
        .await;
    assert_eq!(status, 200);
    assert!(body["archive"].is_null());
}

#[tokio::test]
async fn resolve_batch_caps_input() {
    let server = TestServer::start(|_| {}).await;
    let urls: Vec<String> = (0..101).map(|i| format!("https://x.example/{i}")).collect();
    let response = server
        .client
        .post(server.url("/resolve"))
        .json(&serde_json::json!({ "urls": urls }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn resolve_batch_returns_entry_per_url() {
    let server = TestServer::start(|_| {}).await;
    let response = server
        .client
        .post(server.url("/resolve"))
        .json(&serde_json::json!({ "urls": ["https://a.example/x", "https://b.example/y"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["results"]["https://a.example/x"].is_null());
    assert!(body["results"]["https://b.example/y"].is_null());
}

#[tokio::test]
async fn rate_limit_returns_429_with_retry_after() {
    let server = TestServer::start(|c| c.rate_limit = 5).await;
    for _ in 0..5 {
        let (status, _) = server.get_json("/search?q=x&fast=1").await;
        assert_eq!(status, 200);
    }
    let response = server
        .client
        .get(server.url("/search?q=x&fast=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 429);
    let retry_after: u64 = response
        .headers()
        .get("retry-after")
        .expect("Retry-After header")
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "rate_limited");
}

#[tokio::test]
async fn health_bypasses_rate_limit() {
    let server = TestServer::start(|c| c.rate_limit = 2).await;
    for _ in 0..10 {
        let (status, _) = server.get_json("/health").await;
        assert_eq!(status, 200);
    }
}

#[tokio::test]
async fn collections_crud_roundtrip() {
    let server = TestServer::start(|_| {}).await;

    // Empty collection set.
    let (status, body) = server.get_json("/collections").await;
    assert_eq!(status, 200);
    assert_eq!(body, serde_json::json!({}));

    // Create (no archives referenced; empty list is valid).
    let response = server
        .client
        .post(server.url("/collections"))
        .json(&serde_json::json!({ "name": "reference", "zims": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let (_, body) = server.get_json("/collections").await;
    assert_eq!(body["reference"], serde_json::json!([]));

    // Delete.
    let response = server
        .client
        .delete(server.url("/collections?name=reference"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // Delete again: gone.
    let response = server
        .client
        .delete(server.url("/collections?name=reference"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn collection_rejects_unknown_archive() {
    let server = TestServer::start(|_| {}).await;
    let response = server
        .client
        .post(server.url("/collections"))
        .json(&serde_json::json!({ "name": "bad", "zims": ["ghost"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn manage_requires_password_when_set() {
    let server = TestServer::start(|c| c.manage_password = Some("sesame".into())).await;

    // Public probe works without auth.
    let (status, body) = server.get_json("/manage/has-password").await;
    assert_eq!(status, 200);
    assert_eq!(body["has_password"], true);

    // Status requires the password.
    let (status, body) = server.get_json("/manage/status").await;
    assert_eq!(status, 401);
    assert_eq!(body["error"]["code"], "unauthorized");

    let response = server
        .client
        .get(server.url("/manage/status"))
        .header("Authorization", "Bearer sesame")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let response = server
        .client
        .get(server.url("/manage/status"))
        .header("Authorization", "Bearer wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn manage_disabled_hides_routes() {
    let server = TestServer::start(|c| c.manage_enabled = false).await;
    let (status, _) = server.get_json("/manage/status").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn manage_password_protects_collections_mutation() {
    let server = TestServer::start(|c| c.manage_password = Some("sesame".into())).await;
    let response = server
        .client
        .post(server.url("/collections"))
        .json(&serde_json::json!({ "name": "locked", "zims": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    let response = server
        .client
        .post(server.url("/collections"))
        .header("Authorization", "Bearer sesame")
        .json(&serde_json::json!({ "name": "locked", "zims": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // Reads stay open.
    let (status, _) = server.get_json("/collections").await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn manage_downloads_initially_empty() {
    let server = TestServer::start(|_| {}).await;
    let (status, body) = server.get_json("/manage/downloads").await;
    assert_eq!(status, 200);
    assert_eq!(body["downloads"], serde_json::json!([]));
}

#[tokio::test]
async fn manage_download_rejects_foreign_hosts() {
    let server = TestServer::start(|_| {}).await;
    let response = server
        .client
        .post(server.url("/manage/download"))
        .json(&serde_json::json!({ "url": "https://evil.example/x.zim" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn manage_cancel_unknown_download_is_404() {
    let server = TestServer::start(|_| {}).await;
    let response = server
        .client
        .post(server.url("/manage/cancel"))
        .json(&serde_json::json!({ "id": "ghost" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn manage_refresh_reports_count() {
    let server = TestServer::start(|_| {}).await;
    let response = server
        .client
        .post(server.url("/manage/refresh"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["archives"], 0);
}

#[tokio::test]
async fn manage_auto_update_toggle() {
    let server = TestServer::start(|_| {}).await;
    let response = server
        .client
        .post(server.url("/manage/auto-update"))
        .json(&serde_json::json!({ "enabled": true, "frequency": "daily" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["enabled"], true);
    assert_eq!(body["frequency"], "daily");

    let response = server
        .client
        .post(server.url("/manage/auto-update"))
        .json(&serde_json::json!({ "frequency": "hourly" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn manage_stats_exposes_metrics() {
    let server = TestServer::start(|_| {}).await;
    // Generate some traffic first.
    let _ = server.get_json("/health").await;
    let _ = server.get_json("/search?q=x&fast=1").await;
    let (status, body) = server.get_json("/manage/stats").await;
    assert_eq!(status, 200);
    assert!(body["metrics"]["total_requests"].as_u64().unwrap() >= 2);
    assert!(body["metrics"]["endpoints"].is_object());
}

#[tokio::test]
async fn manage_set_password_requires_current() {
    let server = TestServer::start(|_| {}).await;

    // No password yet: set freely.
    let response = server
        .client
        .post(server.url("/manage/set-password"))
        .json(&serde_json::json!({ "password": "first" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // Changing without the current password fails.
    let response = server
        .client
        .post(server.url("/manage/set-password"))
        .json(&serde_json::json!({ "password": "second" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    // With the current password it succeeds.
    let response = server
        .client
        .post(server.url("/manage/set-password"))
        .json(&serde_json::json!({ "current": "first", "password": "second" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(server.app.has_password());
}

#[tokio::test]
async fn random_with_empty_library_is_404() {
    let server = TestServer::start(|_| {}).await;
    let (status, _) = server.get_json("/random").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn unknown_route_is_404() {
    let server = TestServer::start(|_| {}).await;
    let response = server
        .client
        .get(server.url("/no-such-route"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn collection_scoped_search_resolves_scope() {
    let server = TestServer::start(|_| {}).await;
    // Create an empty collection, then search it: valid scope, no hits.
    let _ = server
        .client
        .post(server.url("/collections"))
        .json(&serde_json::json!({ "name": "docs", "zims": [] }))
        .send()
        .await
        .unwrap();
    let (status, body) = server.get_json("/search?q=water&collection=docs&fast=1").await;
    assert_eq!(status, 200);
    assert_eq!(body["results"], serde_json::json!([]));
}

/// Directory-scan behavior through the whole stack: files that appear and
/// vanish are reflected by `/list` after a refresh, and non-archives are
/// ignored. (Corrupt files are skipped by metadata extraction.)
#[tokio::test]
async fn refresh_tracks_directory_contents() {
    let server = TestServer::start(|_| {}).await;
    let zims = PathBuf::from(server.app.registry.archive_dir());
    std::fs::write(zims.join("notes.txt"), b"not an archive").unwrap();
    std::fs::write(zims.join("broken_2023-01.zim"), b"garbage").unwrap();

    let response = server
        .client
        .post(server.url("/manage/refresh"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    // The garbage file fails metadata extraction and is skipped.
    assert_eq!(body["archives"], 0);
}
