//! JSON HTTP API.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/search` | Two-phase cross-archive search |
//! | `GET`  | `/suggest` | Title autocomplete |
//! | `GET`  | `/read` | Article as plain text |
//! | `GET`  | `/snippet` | Short description for an entry |
//! | `GET`  | `/random` | Random article |
//! | `GET`  | `/list` | Installed archives with metadata |
//! | `GET`  | `/catalog` | PDF catalog for zimgit-style archives |
//! | `GET/POST` | `/resolve` | Cross-archive URL resolution (single/batch) |
//! | `GET/POST/DELETE` | `/collections` | Named archive sets |
//! | `GET`  | `/health` | Liveness probe |
//! | `GET`  | `/w/{zim}/{path}` | Raw entry bytes (Range supported) |
//! | `*`    | `/manage/...` | Library management (auth when a password is set) |
//!
//! Errors follow the `{ "error": { "code", "message" } }` contract of
//! [`crate::error`]. A per-IP sliding window rate limiter covers the API
//! routes; `/health`, `/manage/*`, and `/w/*` bypass it. Every request is
//! timed into the metrics registry.

use axum::body::Body;
use axum::extract::{ConnectInfo, MatchedPath, Path as AxumPath, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

use crate::app::App;
use crate::archive::read_illustration;
use crate::download::DownloadKind;
use crate::error::ZimiError;
use crate::resolve::MAX_BATCH_URLS;
use crate::search::{fetch_entry, SearchOptions, MAX_SEARCH_LIMIT};

/// Entries above this size are refused on `/w/` unless streamable.
const MAX_SERVE_BYTES: usize = 50 * 1024 * 1024;

pub fn router(app: Arc<App>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/search", get(handle_search))
        .route("/suggest", get(handle_suggest))
        .route("/read", get(handle_read))
        .route("/snippet", get(handle_snippet))
        .route("/random", get(handle_random))
        .route("/list", get(handle_list))
        .route("/catalog", get(handle_pdf_catalog))
        .route("/resolve", get(handle_resolve).post(handle_resolve_batch))
        .route(
            "/collections",
            get(handle_collections_get)
                .post(handle_collections_post)
                .delete(handle_collections_delete),
        )
        .route("/health", get(handle_health))
        .route("/w/:zim/*path", get(handle_raw))
        .route("/manage/status", get(manage_status))
        .route("/manage/stats", get(manage_stats))
        .route("/manage/catalog", get(manage_catalog))
        .route("/manage/check-updates", get(manage_check_updates))
        .route("/manage/downloads", get(manage_downloads))
        .route("/manage/history", get(manage_history))
        .route("/manage/has-password", get(manage_has_password))
        .route("/manage/set-password", post(manage_set_password))
        .route("/manage/download", post(manage_download))
        .route("/manage/import", post(manage_import))
        .route("/manage/update", post(manage_update))
        .route("/manage/delete", post(manage_delete))
        .route("/manage/cancel", post(manage_cancel))
        .route("/manage/clear-downloads", post(manage_clear_downloads))
        .route("/manage/refresh", post(manage_refresh))
        .route("/manage/build-fts", post(manage_build_fts))
        .route("/manage/auto-update", post(manage_auto_update))
        .layer(middleware::from_fn_with_state(
            app.clone(),
            limit_and_measure,
        ))
        .layer(cors)
        .with_state(app)
}

pub async fn serve(app: Arc<App>, addr: SocketAddr) -> anyhow::Result<()> {
    let router = router(app);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// ── middleware ──

/// Reverse proxies allowed to set `X-Forwarded-For`.
const TRUSTED_PROXIES: [&str; 4] = ["127.0.0.1", "::1", "172.17.0.1", "172.18.0.1"];

fn client_ip(peer: SocketAddr, headers: &HeaderMap) -> IpAddr {
    let direct = peer.ip();
    if TRUSTED_PROXIES.contains(&direct.to_string().as_str()) {
        if let Some(xff) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
        {
            return xff;
        }
    }
    direct
}

fn rate_limited_path(path: &str) -> bool {
    !(path == "/health" || path.starts_with("/manage/") || path.starts_with("/w/"))
}

async fn limit_and_measure(
    State(app): State<Arc<App>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    if rate_limited_path(&path) {
        let ip = client_ip(peer, request.headers());
        if let Some(retry_after) = app.rate_limiter.check(ip) {
            app.metrics.record_rate_limited();
            return ZimiError::RateLimited { retry_after }.into_response();
        }
    }

    let started = Instant::now();
    let response = next.run(request).await;
    app.metrics.record(
        &route,
        started.elapsed(),
        response.status().is_server_error(),
    );
    response
}

// ── shared helpers ──

/// Resolve `zim` / `collection` parameters into an explicit scope.
fn resolve_scope(
    app: &App,
    zim: Option<&str>,
    collection: Option<&str>,
) -> Result<Option<Vec<String>>, ZimiError> {
    if let Some(name) = collection {
        let collections = app.state.load_collections();
        let ids = collections
            .get(name)
            .ok_or_else(|| ZimiError::BadRequest(format!("collection '{name}' not found")))?;
        return Ok(Some(ids.clone()));
    }
    if let Some(zim) = zim {
        let ids: Vec<String> = zim
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(None);
        }
        return Ok(Some(ids));
    }
    Ok(None)
}

fn require_manage(app: &App) -> Result<(), ZimiError> {
    if !app.config.manage_enabled {
        return Err(ZimiError::NotFound(
            "library management is disabled".into(),
        ));
    }
    Ok(())
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::AUTHORIZATION)?.to_str().ok()
}

// ── core endpoints ──

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
    limit: Option<usize>,
    zim: Option<String>,
    collection: Option<String>,
    fast: Option<String>,
    timeout_ms: Option<u64>,
}

async fn handle_search(
    State(app): State<Arc<App>>,
    Query(params): Query<SearchParams>,
) -> Result<Response, ZimiError> {
    let query = params
        .q
        .as_deref()
        .ok_or_else(|| ZimiError::BadRequest("missing ?q= parameter".into()))?;
    let scope = resolve_scope(&app, params.zim.as_deref(), params.collection.as_deref())?;
    let opts = SearchOptions {
        limit: params.limit.unwrap_or(5).clamp(1, MAX_SEARCH_LIMIT),
        scope,
        fast: params.fast.as_deref() == Some("1"),
        timeout: params
            .timeout_ms
            .map(std::time::Duration::from_millis)
            .unwrap_or(crate::search::DEFAULT_TIMEOUT),
        include_snippets: true,
    };
    let outcome = app.engine.search(query, opts).await?;
    Ok(Json(outcome).into_response())
}

#[derive(Deserialize)]
struct SuggestParams {
    q: Option<String>,
    limit: Option<usize>,
    zim: Option<String>,
    collection: Option<String>,
}

async fn handle_suggest(
    State(app): State<Arc<App>>,
    Query(params): Query<SuggestParams>,
) -> Result<Response, ZimiError> {
    let query = params
        .q
        .as_deref()
        .ok_or_else(|| ZimiError::BadRequest("missing ?q= parameter".into()))?;
    let scope = resolve_scope(&app, params.zim.as_deref(), params.collection.as_deref())?;
    let results = app
        .engine
        .suggest(query, scope, params.limit.unwrap_or(10))
        .await?;
    Ok(Json(json!({ "results": results })).into_response())
}

#[derive(Deserialize)]
struct ReadParams {
    zim: Option<String>,
    path: Option<String>,
    max_length: Option<usize>,
}

async fn handle_read(
    State(app): State<Arc<App>>,
    Query(params): Query<ReadParams>,
) -> Result<Response, ZimiError> {
    let (zim, path) = match (params.zim.as_deref(), params.path.as_deref()) {
        (Some(zim), Some(path)) => (zim, path),
        _ => {
            return Err(ZimiError::BadRequest(
                "missing ?zim= and ?path= parameters".into(),
            ))
        }
    };
    let result = app.read_article(zim, path, params.max_length).await?;
    Ok(Json(result).into_response())
}

#[derive(Deserialize)]
struct SnippetParams {
    zim: Option<String>,
    path: Option<String>,
}

async fn handle_snippet(
    State(app): State<Arc<App>>,
    Query(params): Query<SnippetParams>,
) -> Result<Response, ZimiError> {
    let (zim, path) = match (params.zim.as_deref(), params.path.as_deref()) {
        (Some(zim), Some(path)) => (zim, path),
        _ => {
            return Err(ZimiError::BadRequest(
                "missing ?zim= and ?path= parameters".into(),
            ))
        }
    };
    let result = app.snippet(zim, path).await?;
    Ok(Json(result).into_response())
}

#[derive(Deserialize)]
struct RandomParams {
    zim: Option<String>,
}

async fn handle_random(
    State(app): State<Arc<App>>,
    Query(params): Query<RandomParams>,
) -> Result<Response, ZimiError> {
    let result = app.random_article(params.zim.as_deref()).await?;
    Ok(Json(result).into_response())
}

#[derive(Serialize)]
struct ListEntry {
    id: String,
    title: String,
    description: String,
    language: String,
    entries: u64,
    size: u64,
    category: crate::archive::Category,
    has_fts: bool,
    update_available: bool,
    file: String,
    date: String,
}

async fn handle_list(State(app): State<Arc<App>>) -> Result<Response, ZimiError> {
    let updates = app.updates_available.read().unwrap().clone();
    let mut out = Vec::new();
    for entry in app.registry.entries() {
        let meta = entry.meta();
        let info = app.titles.info(&meta.id).await;
        out.push(ListEntry {
            update_available: updates.contains_key(&meta.id),
            has_fts: info.map(|i| i.has_fts).unwrap_or(false),
            entries: if meta.entries > 0 {
                meta.entries
            } else {
                info.map(|i| i.entries).unwrap_or(0)
            },
            id: meta.id,
            title: meta.title,
            description: meta.description,
            language: meta.language,
            size: meta.size,
            category: meta.category,
            file: meta.file,
            date: meta.date,
        });
    }
    Ok(Json(out).into_response())
}

#[derive(Deserialize)]
struct PdfCatalogParams {
    zim: Option<String>,
}

async fn handle_pdf_catalog(
    State(app): State<Arc<App>>,
    Query(params): Query<PdfCatalogParams>,
) -> Result<Response, ZimiError> {
    let zim = params
        .zim
        .as_deref()
        .ok_or_else(|| ZimiError::BadRequest("missing ?zim= parameter".into()))?;
    let docs = app.pdf_catalog(zim).await?;
    Ok(Json(json!({ "documents": docs })).into_response())
}

#[derive(Deserialize)]
struct ResolveParams {
    url: Option<String>,
    domains: Option<String>,
}

async fn handle_resolve(
    State(app): State<Arc<App>>,
    Query(params): Query<ResolveParams>,
) -> Result<Response, ZimiError> {
    if params.domains.as_deref() == Some("1") {
        return Ok(Json(app.resolver.host_map()).into_response());
    }
    let url = params
        .url
        .as_deref()
        .ok_or_else(|| ZimiError::BadRequest("missing ?url= parameter".into()))?;
    match app.resolver.resolve(&app.titles, url).await {
        Some(resolved) => Ok(Json(json!({
            "archive": resolved.archive,
            "path": resolved.path,
        }))
        .into_response()),
        None => Ok(Json(json!({ "archive": null })).into_response()),
    }
}

#[derive(Deserialize)]
struct ResolveBatchBody {
    urls: Vec<String>,
}

async fn handle_resolve_batch(
    State(app): State<Arc<App>>,
    Json(body): Json<ResolveBatchBody>,
) -> Result<Response, ZimiError> {
    if body.urls.len() > MAX_BATCH_URLS {
        return Err(ZimiError::BadRequest(format!(
            "'urls' must contain at most {MAX_BATCH_URLS} entries"
        )));
    }
    let results = app
        .resolver
        .resolve_batch(app.titles.clone(), body.urls)
        .await;
    Ok(Json(json!({ "results": results })).into_response())
}

// ── collections ──

async fn handle_collections_get(State(app): State<Arc<App>>) -> Result<Response, ZimiError> {
    Ok(Json(app.state.load_collections()).into_response())
}

#[derive(Deserialize)]
struct CollectionBody {
    name: String,
    #[serde(default)]
    zims: Vec<String>,
}

async fn handle_collections_post(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<CollectionBody>,
) -> Result<Response, ZimiError> {
    app.check_auth(bearer(&headers))?;
    let name = body.name.trim();
    if name.is_empty() || name.len() > 64 {
        return Err(ZimiError::BadRequest(
            "collection name must be 1-64 characters".into(),
        ));
    }
    if body.zims.len() > 200 {
        return Err(ZimiError::BadRequest(
            "'zims' must contain at most 200 entries".into(),
        ));
    }
    for id in &body.zims {
        if app.registry.get(id).is_none() {
            return Err(ZimiError::BadRequest(format!("archive '{id}' not found")));
        }
    }
    app.state
        .save_collection(name, body.zims)
        .map_err(|e| ZimiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "status": "ok", "collection": name })).into_response())
}

#[derive(Deserialize)]
struct CollectionDeleteParams {
    name: Option<String>,
}

async fn handle_collections_delete(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Query(params): Query<CollectionDeleteParams>,
) -> Result<Response, ZimiError> {
    app.check_auth(bearer(&headers))?;
    let name = params
        .name
        .as_deref()
        .ok_or_else(|| ZimiError::BadRequest("missing ?name= parameter".into()))?;
    let deleted = app
        .state
        .delete_collection(name)
        .map_err(|e| ZimiError::Internal(e.to_string()))?;
    if !deleted {
        return Err(ZimiError::NotFound(format!(
            "collection '{name}' not found"
        )));
    }
    Ok(Json(json!({ "status": "deleted", "collection": name })).into_response())
}

async fn handle_health(State(app): State<Arc<App>>) -> Response {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "archives": app.registry.len(),
    }))
    .into_response()
}

// ── raw entry serving ──

static BASE_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<base\s[^>]*>").expect("static pattern"));

fn streamable(mime: &str) -> bool {
    mime.starts_with("video/") || mime.starts_with("audio/") || mime == "application/ogg"
}

/// Parse a `Range: bytes=` header against a known total size.
fn parse_range(header: &str, total: usize) -> Option<(usize, usize)> {
    let spec = header.strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None; // multi-range unsupported
    }
    if let Some(suffix) = spec.strip_prefix('-') {
        let len: usize = suffix.parse().ok()?;
        if len == 0 {
            return None;
        }
        return Some((total.saturating_sub(len), total.saturating_sub(1)));
    }
    let (start_str, end_str) = spec.split_once('-')?;
    let start: usize = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        total.saturating_sub(1)
    } else {
        end_str.parse::<usize>().ok()?.min(total.saturating_sub(1))
    };
    if start > end || start >= total {
        return None;
    }
    Some((start, end))
}

fn etag_for(zim: &str, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(zim.as_bytes());
    hasher.update(b"/");
    hasher.update(path.as_bytes());
    let digest = hasher.finalize();
    format!("\"{:x}\"", u64::from_le_bytes(digest[..8].try_into().expect("8 bytes")))
}

async fn handle_raw(
    State(app): State<Arc<App>>,
    AxumPath((zim, path)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ZimiError> {
    let entry_path = urlencoding::decode(&path)
        .map(|c| c.into_owned())
        .unwrap_or(path);
    let entry = app
        .registry
        .get(&zim)
        .ok_or_else(|| ZimiError::NotFound(format!("archive '{zim}' not found")))?;

    // Archive icon pseudo-entry.
    if entry_path == "-/icon" {
        let icon = app
            .registry
            .with_native(entry, |handle| Ok(read_illustration(handle)))
            .await?
            .ok_or_else(|| ZimiError::NotFound("no icon".into()))?;
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "image/png")
            .header(header::CACHE_CONTROL, "public, max-age=604800, immutable")
            .body(Body::from(icon))
            .expect("valid response"));
    }

    // Redirect probe first: redirect entries never land in the index.
    if app.titles.lookup(&zim, &entry_path).await.is_none() {
        let probe = entry_path.clone();
        let redirect = app
            .registry
            .with_native(entry.clone(), move |handle| {
                Ok(
                    match crate::archive::fetch_entry_native(handle, &probe, false) {
                        crate::archive::NativeFetch::Redirect { target_path } => {
                            Some(target_path)
                        }
                        _ => None,
                    },
                )
            })
            .await?;
        if let Some(target) = redirect {
            return Ok(Response::builder()
                .status(StatusCode::FOUND)
                .header(header::LOCATION, format!("/w/{zim}/{target}"))
                .body(Body::empty())
                .expect("valid response"));
        }
    }

    let fetched = fetch_entry(&app.registry, &app.titles, entry, &entry_path)
        .await?
        .ok_or_else(|| {
            ZimiError::NotFound(format!("entry '{entry_path}' not found in {zim}"))
        })?;
    let mime = fetched.mime.clone();
    let mut bytes = fetched.bytes;
    let total = bytes.len();

    if !streamable(&mime) && total > MAX_SERVE_BYTES {
        return Err(ZimiError::BadRequest(format!(
            "entry too large ({} MB)",
            total / (1024 * 1024)
        )));
    }

    let etag = etag_for(&zim, &entry_path);
    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        == Some(etag.as_str())
    {
        return Ok(Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .body(Body::empty())
            .expect("valid response"));
    }

    if mime.starts_with("text/html") {
        let text = String::from_utf8_lossy(&bytes);
        bytes = BASE_TAG_RE.replace_all(&text, "").into_owned().into_bytes();
    }

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, mime.clone())
        .header(header::CACHE_CONTROL, "public, max-age=86400, immutable")
        .header(header::ETAG, etag);

    if streamable(&mime) {
        builder = builder.header(header::ACCEPT_RANGES, "bytes");
        let range = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_range(v, total));
        if let Some((start, end)) = range {
            let slice = bytes[start..=end].to_vec();
            return Ok(builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{total}"),
                )
                .body(Body::from(slice))
                .expect("valid response"));
        }
    }

    Ok(builder
        .status(StatusCode::OK)
        .body(Body::from(bytes))
        .expect("valid response"))
}

// ── management ──

async fn manage_status(State(app): State<Arc<App>>, headers: HeaderMap) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    app.check_auth(bearer(&headers))?;
    let auto = app.auto_update.lock().unwrap();
    let total_size: u64 = app
        .registry
        .entries()
        .iter()
        .map(|e| e.meta().size)
        .sum();
    Ok(Json(json!({
        "archives": app.registry.len(),
        "total_size_bytes": total_size,
        "manage_enabled": true,
        "hosts_mapped": app.resolver.host_map().len(),
        "auto_update": {
            "enabled": auto.enabled,
            "frequency": auto.freq.as_str(),
            "last_check": auto.last_check,
        },
    }))
    .into_response())
}

async fn manage_stats(State(app): State<Arc<App>>, headers: HeaderMap) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    app.check_auth(bearer(&headers))?;
    let mut indexes = Vec::new();
    for entry in app.registry.entries() {
        let meta = entry.meta();
        let state = app.titles.build_state(&meta.id);
        let info = app.titles.info(&meta.id).await;
        indexes.push(json!({
            "id": meta.id,
            "state": state,
            "entries": info.map(|i| i.entries).unwrap_or(0),
            "has_fts": info.map(|i| i.has_fts).unwrap_or(false),
        }));
    }
    Ok(Json(json!({
        "metrics": app.metrics.snapshot(),
        "result_cache_entries": app.engine.result_cache_len(),
        "title_indexes": indexes,
    }))
    .into_response())
}

#[derive(Deserialize)]
struct ManageCatalogParams {
    q: Option<String>,
    lang: Option<String>,
    count: Option<u32>,
    start: Option<u32>,
}

async fn manage_catalog(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Query(params): Query<ManageCatalogParams>,
) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    app.check_auth(bearer(&headers))?;
    let installed: std::collections::HashSet<String> = app
        .registry
        .entries()
        .iter()
        .map(|e| {
            let (base, _) = crate::archive::split_zim_date(&e.meta().file);
            base.to_lowercase()
        })
        .collect();
    let (total, items) = app
        .catalog
        .fetch(
            params.q.as_deref().unwrap_or(""),
            params.lang.as_deref().unwrap_or("eng"),
            params.count.unwrap_or(20).min(500),
            params.start.unwrap_or(0),
            &installed,
        )
        .await
        .map_err(|e| ZimiError::DownloadFailed(e.to_string()))?;
    Ok(Json(json!({ "total": total, "items": items })).into_response())
}

async fn manage_check_updates(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    app.check_auth(bearer(&headers))?;
    let updates = app.check_updates().await?;
    Ok(Json(json!({ "count": updates.len(), "updates": updates })).into_response())
}

async fn manage_downloads(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    app.check_auth(bearer(&headers))?;
    Ok(Json(json!({ "downloads": app.downloads.list() })).into_response())
}

async fn manage_history(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    app.check_auth(bearer(&headers))?;
    Ok(Json(json!({ "history": app.state.load_history() })).into_response())
}

async fn manage_has_password(State(app): State<Arc<App>>) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    Ok(Json(json!({ "has_password": app.has_password() })).into_response())
}

#[derive(Deserialize)]
struct SetPasswordBody {
    #[serde(default)]
    current: String,
    #[serde(default)]
    password: String,
}

async fn manage_set_password(
    State(app): State<Arc<App>>,
    Json(body): Json<SetPasswordBody>,
) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    if app.has_password() {
        app.check_auth(Some(&format!("Bearer {}", body.current)))
            .map_err(|_| ZimiError::Unauthorized)?;
    }
    app.state
        .set_password(body.password.trim())
        .map_err(|e| ZimiError::Internal(e.to_string()))?;
    let status = if body.password.trim().is_empty() {
        "password cleared"
    } else {
        "password set"
    };
    Ok(Json(json!({ "status": status })).into_response())
}

#[derive(Deserialize)]
struct UrlBody {
    url: String,
}

async fn manage_download(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<UrlBody>,
) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    app.check_auth(bearer(&headers))?;
    let task = app
        .downloads
        .start(&body.url, DownloadKind::New, true)?;
    Ok(Json(json!({ "status": "started", "slug": task.slug })).into_response())
}

async fn manage_import(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<UrlBody>,
) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    app.check_auth(bearer(&headers))?;
    let task = app
        .downloads
        .start(&body.url, DownloadKind::New, false)?;
    Ok(Json(json!({ "status": "started", "slug": task.slug })).into_response())
}

async fn manage_update(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    app.check_auth(bearer(&headers))?;
    let started = app.run_update_pass().await?;
    Ok(Json(json!({ "status": "started", "count": started.len(), "archives": started }))
        .into_response())
}

#[derive(Deserialize)]
struct DeleteBody {
    filename: String,
}

async fn manage_delete(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<DeleteBody>,
) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    app.check_auth(bearer(&headers))?;
    let filename = body.filename.trim();
    if filename.is_empty() || filename.contains("..") || filename.contains('/') {
        return Err(ZimiError::BadRequest("invalid filename".into()));
    }
    if !filename.ends_with(".zim") {
        return Err(ZimiError::BadRequest(
            "only .zim files can be deleted".into(),
        ));
    }
    let path = app.registry.archive_dir().join(filename);
    if !path.exists() {
        return Err(ZimiError::NotFound(format!("file '{filename}' not found")));
    }
    let archive_id = crate::archive::archive_id(filename);
    let (title, size) = app
        .registry
        .get(&archive_id)
        .map(|e| {
            let m = e.meta();
            (m.title, m.size)
        })
        .unwrap_or_default();
    std::fs::remove_file(&path).map_err(|e| ZimiError::Internal(e.to_string()))?;
    tracing::info!("deleted archive {filename}");
    app.state.append_history(crate::state::HistoryEvent {
        ts: chrono::Utc::now().timestamp(),
        kind: "deleted".to_string(),
        filename: filename.to_string(),
        size_bytes: size,
        title,
        archive_id,
    });
    app.refresh_library().await?;
    Ok(Json(json!({ "status": "deleted", "filename": filename })).into_response())
}

#[derive(Deserialize)]
struct CancelBody {
    #[serde(alias = "id")]
    slug: String,
}

async fn manage_cancel(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<CancelBody>,
) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    app.check_auth(bearer(&headers))?;
    app.downloads.cancel(&body.slug)?;
    Ok(Json(json!({ "status": "cancelling", "slug": body.slug })).into_response())
}

async fn manage_clear_downloads(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    app.check_auth(bearer(&headers))?;
    let removed = app.downloads.clear_finished();
    Ok(Json(json!({ "status": "cleared", "removed": removed })).into_response())
}

async fn manage_refresh(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    app.check_auth(bearer(&headers))?;
    let count = app.refresh_library().await?;
    let app2 = app.clone();
    tokio::spawn(async move {
        app2.ensure_indexes().await;
    });
    Ok(Json(json!({ "status": "refreshed", "archives": count })).into_response())
}

#[derive(Deserialize)]
struct BuildFtsBody {
    #[serde(alias = "name")]
    id: String,
}

async fn manage_build_fts(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<BuildFtsBody>,
) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    app.check_auth(bearer(&headers))?;
    let entry = app
        .registry
        .get(&body.id)
        .ok_or_else(|| ZimiError::NotFound(format!("archive '{}' not found", body.id)))?;
    let _write_guard = entry.title_lock.write().await;
    let info = app
        .titles
        .build_fts(&body.id)
        .await
        .map_err(|e| ZimiError::Internal(e.to_string()))?;
    Ok(Json(json!({
        "status": "built",
        "entries": info.entries,
        "has_fts": info.has_fts,
    }))
    .into_response())
}

#[derive(Deserialize)]
struct AutoUpdateBody {
    enabled: Option<bool>,
    frequency: Option<String>,
}

async fn manage_auto_update(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<AutoUpdateBody>,
) -> Result<Response, ZimiError> {
    require_manage(&app)?;
    app.check_auth(bearer(&headers))?;
    let mut state = app.auto_update.lock().unwrap();
    if let Some(freq) = body.frequency.as_deref() {
        state.freq = crate::config::UpdateFreq::parse(freq).ok_or_else(|| {
            ZimiError::BadRequest("frequency must be daily, weekly, or monthly".into())
        })?;
    }
    if let Some(enabled) = body.enabled {
        state.enabled = enabled;
    }
    Ok(Json(json!({
        "enabled": state.enabled,
        "frequency": state.freq.as_str(),
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_full_forms() {
        assert_eq!(parse_range("bytes=0-499", 1000), Some((0, 499)));
        assert_eq!(parse_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_range("bytes=-200", 1000), Some((800, 999)));
        assert_eq!(parse_range("bytes=0-9999", 1000), Some((0, 999)));
    }

    #[test]
    fn range_rejects_bad_specs() {
        assert_eq!(parse_range("bytes=500-100", 1000), None);
        assert_eq!(parse_range("bytes=1000-", 1000), None);
        assert_eq!(parse_range("bytes=0-10,20-30", 1000), None);
        assert_eq!(parse_range("items=0-10", 1000), None);
        assert_eq!(parse_range("bytes=-0", 1000), None);
    }

    #[test]
    fn rate_limited_paths_exclude_bypass_routes() {
        assert!(rate_limited_path("/search"));
        assert!(rate_limited_path("/resolve"));
        assert!(!rate_limited_path("/health"));
        assert!(!rate_limited_path("/manage/status"));
        assert!(!rate_limited_path("/w/wikipedia/A/Water"));
    }

    #[test]
    fn etag_stable_and_distinct() {
        assert_eq!(etag_for("wiki", "A/Water"), etag_for("wiki", "A/Water"));
        assert_ne!(etag_for("wiki", "A/Water"), etag_for("wiki", "A/Fire"));
    }

    #[test]
    fn client_ip_honors_trusted_proxy_only() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        let proxy: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(
            client_ip(proxy, &headers),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
        let direct: SocketAddr = "198.51.100.7:5000".parse().unwrap();
        assert_eq!(
            client_ip(direct, &headers),
            "198.51.100.7".parse::<IpAddr>().unwrap()
        );
    }
}
