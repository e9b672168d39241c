//! Application wiring: one owned value holding every subsystem, passed by
//! reference into the HTTP handlers and background workers. No globals.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::archive::Registry;
use crate::catalog::{CatalogClient, UpdateInfo};
use crate::config::{Config, UpdateFreq};
use crate::download::{
    remove_old_versions, DownloadEvent, DownloadKind, DownloadManager, DownloadTask,
};
use crate::error::ZimiError;
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;
use crate::reader::{
    extract_snippet, extract_thumbnail, strip_html, truncate_words, DEFAULT_READ_LENGTH,
    MAX_READ_LENGTH, MAX_SNIPPET_ENTRY_BYTES,
};
use crate::resolve::Resolver;
use crate::search::{fetch_entry, SearchEngine};
use crate::state::{migrate_legacy_files, HistoryEvent, StateStore};
use crate::title_index::{BuildOutcome, TitleStore};

pub struct AutoUpdateState {
    pub enabled: bool,
    pub freq: UpdateFreq,
    pub last_check: Option<i64>,
}

pub struct App {
    pub config: Config,
    pub state: Arc<StateStore>,
    pub registry: Arc<Registry>,
    pub titles: Arc<TitleStore>,
    pub engine: SearchEngine,
    pub resolver: Arc<Resolver>,
    pub downloads: DownloadManager,
    pub catalog: CatalogClient,
    pub metrics: Metrics,
    pub rate_limiter: RateLimiter,
    /// Latest update-check verdicts, keyed by archive id.
    pub updates_available: std::sync::RwLock<HashMap<String, UpdateInfo>>,
    pub auto_update: Mutex<AutoUpdateState>,
    auto_update_running: AtomicBool,
    download_events: Mutex<Option<UnboundedReceiver<DownloadEvent>>>,
}

impl App {
    pub fn new(config: Config) -> Arc<Self> {
        let state = Arc::new(StateStore::new(config.data_dir.clone()));
        let registry = Arc::new(Registry::new(config.archive_dir.clone(), state.clone()));
        let titles = Arc::new(TitleStore::new(config.titles_dir()));
        let engine = SearchEngine::new(registry.clone(), titles.clone());
        engine.set_rank_overrides(state.load_rank_overrides());

        let client = reqwest::Client::new();
        let (events_tx, events_rx) = unbounded_channel();
        let downloads =
            DownloadManager::new(config.archive_dir.clone(), client.clone(), events_tx);

        let auto_update = Mutex::new(AutoUpdateState {
            enabled: config.auto_update,
            freq: config.auto_update_freq,
            last_check: None,
        });

        Arc::new(App {
            rate_limiter: RateLimiter::new(config.rate_limit),
            catalog: CatalogClient::new(client),
            metrics: Metrics::new(),
            resolver: Arc::new(Resolver::new()),
            downloads,
            engine,
            titles,
            registry,
            state,
            config,
            updates_available: std::sync::RwLock::new(HashMap::new()),
            auto_update,
            auto_update_running: AtomicBool::new(false),
            download_events: Mutex::new(Some(events_rx)),
        })
    }

    /// One-time startup: legacy migration, initial scan, background
    /// workers (download events, index builds, handle pre-warm, scheduler).
    pub async fn startup(self: &Arc<Self>) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.config.data_dir)?;
        migrate_legacy_files(&self.config.archive_dir, &self.config.data_dir);
        self.downloads.sweep_stale_tmp();

        self.refresh_library().await?;

        // Download completion events.
        if let Some(mut rx) = self.download_events.lock().unwrap().take() {
            let app = self.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    app.handle_download_event(event).await;
                }
            });
        }

        // Index builds and handle pre-warm proceed in the background so
        // the server is responsive immediately.
        let app = self.clone();
        tokio::spawn(async move {
            app.ensure_indexes().await;
            app.registry.prewarm().await;
        });

        // Auto-update scheduler.
        let app = self.clone();
        tokio::spawn(async move {
            app.auto_update_loop().await;
        });

        Ok(())
    }

    /// Rescan the library. Caches are dropped unconditionally: a refresh
    /// is the explicit signal that the world may have moved.
    pub async fn refresh_library(&self) -> Result<usize, ZimiError> {
        let report = self
            .registry
            .refresh()
            .await
            .map_err(|e| ZimiError::Internal(e.to_string()))?;
        self.engine.invalidate_caches();
        if report.library_changed() {
            self.on_library_changed().await;
        }
        Ok(report.total)
    }

    async fn on_library_changed(&self) {
        self.engine.invalidate_caches();
        let metas: Vec<_> = self.registry.entries().iter().map(|e| e.meta()).collect();
        self.resolver.rebuild(&metas);
        self.titles.clean_stale(&self.registry.ids()).await;
    }

    /// Build every missing or stale title index, sequentially. Archives
    /// that failed three builds stay quarantined until the next restart.
    pub async fn ensure_indexes(&self) {
        for entry in self.registry.entries() {
            let meta = entry.meta();
            if self.titles.is_quarantined(&meta.id) {
                continue;
            }
            if self.titles.is_current(&meta.id, meta.size, meta.mtime).await {
                if meta.entries == 0 {
                    if let Some(info) = self.titles.info(&meta.id).await {
                        self.registry.record_entry_count(&meta.id, info.entries);
                    }
                }
                continue;
            }
            let _write_guard = entry.title_lock.write().await;
            match self
                .titles
                .build(&meta.id, &meta.path, meta.size, meta.mtime)
                .await
            {
                Ok(BuildOutcome::Built { rows, .. }) => {
                    self.registry.record_entry_count(&meta.id, rows);
                    self.engine.invalidate_caches();
                }
                Ok(BuildOutcome::Cancelled) => {}
                Err(_) => {
                    // Failure count lives in the store; retried on the
                    // next refresh until quarantined.
                }
            }
        }
    }

    async fn handle_download_event(&self, event: DownloadEvent) {
        match event {
            DownloadEvent::Completed(task) => {
                self.finish_download(task).await;
            }
            DownloadEvent::Failed { task, error } => {
                self.state.append_history(HistoryEvent {
                    ts: chrono::Utc::now().timestamp(),
                    kind: "download_failed".to_string(),
                    filename: task.filename.clone(),
                    size_bytes: 0,
                    title: String::new(),
                    archive_id: String::new(),
                });
                tracing::warn!("download failed for {}: {error}", task.filename);
            }
        }
    }

    async fn finish_download(&self, task: Arc<DownloadTask>) {
        if task.kind == DownloadKind::Update {
            remove_old_versions(self.registry.archive_dir(), &task.filename);
        }
        let _ = self.refresh_library().await;

        let archive_id = crate::archive::archive_id(&task.filename);
        let (title, size) = self
            .registry
            .get(&archive_id)
            .map(|e| {
                let m = e.meta();
                (m.title, m.size)
            })
            .unwrap_or_default();
        self.state.append_history(HistoryEvent {
            ts: chrono::Utc::now().timestamp(),
            kind: match task.kind {
                DownloadKind::Update => "updated",
                DownloadKind::New => "downloaded",
            }
            .to_string(),
            filename: task.filename.clone(),
            size_bytes: size,
            title,
            archive_id: archive_id.clone(),
        });
        self.updates_available.write().unwrap().remove(&archive_id);
        self.ensure_indexes().await;
    }

    // ── auto-update ──

    async fn auto_update_loop(self: &Arc<Self>) {
        loop {
            let (enabled, freq) = {
                let state = self.auto_update.lock().unwrap();
                (state.enabled, state.freq)
            };
            let interval = if enabled {
                freq.interval()
            } else {
                // Idle poll so re-enabling takes effect without restart.
                std::time::Duration::from_secs(60)
            };
            tokio::time::sleep(interval).await;
            let enabled = self.auto_update.lock().unwrap().enabled;
            if !enabled {
                continue;
            }
            if self
                .auto_update_running
                .swap(true, Ordering::SeqCst)
            {
                continue;
            }
            if let Err(err) = self.run_update_pass().await {
                tracing::warn!("auto-update pass failed: {err}");
            }
            self.auto_update_running.store(false, Ordering::SeqCst);
        }
    }

    /// One check-and-download pass; used by both the scheduler and the
    /// manual `/manage/update` trigger.
    pub async fn run_update_pass(&self) -> Result<Vec<String>, ZimiError> {
        let updates = self.check_updates().await?;
        let mut started = Vec::new();
        for update in updates {
            if update.download_url.is_empty() {
                continue;
            }
            match self
                .downloads
                .start(&update.download_url, DownloadKind::Update, true)
            {
                Ok(task) => {
                    tracing::info!("update started: {}", task.filename);
                    started.push(update.id);
                }
                Err(ZimiError::Conflict(_)) => {
                    // A live (or cancelled-and-kept) task owns the slug;
                    // the next cadence retries.
                    continue;
                }
                Err(err) => {
                    tracing::warn!("update start failed for {}: {err}", update.id);
                }
            }
        }
        Ok(started)
    }

    pub async fn check_updates(&self) -> Result<Vec<UpdateInfo>, ZimiError> {
        let installed: Vec<(String, String)> = self
            .registry
            .entries()
            .iter()
            .map(|e| {
                let m = e.meta();
                (m.id, m.file)
            })
            .collect();
        let updates = self
            .catalog
            .check_updates(&installed)
            .await
            .map_err(|e| ZimiError::DownloadFailed(e.to_string()))?;
        self.auto_update.lock().unwrap().last_check = Some(chrono::Utc::now().timestamp());
        let mut map = self.updates_available.write().unwrap();
        map.clear();
        for update in &updates {
            map.insert(update.id.clone(), update.clone());
        }
        Ok(updates)
    }

    // ── auth ──

    /// Verify a `Bearer <password>` header against the stored hash. With
    /// no password configured, management is open.
    pub fn check_auth(&self, auth_header: Option<&str>) -> Result<(), ZimiError> {
        let Some(stored) = self
            .state
            .password_hash(self.config.manage_password.as_deref())
        else {
            return Ok(());
        };
        let presented = auth_header
            .and_then(|h| h.strip_prefix("Bearer "))
            .unwrap_or("");
        if presented.is_empty() || !crate::state::password_matches(presented, &stored) {
            return Err(ZimiError::Unauthorized);
        }
        Ok(())
    }

    pub fn has_password(&self) -> bool {
        self.state
            .password_hash(self.config.manage_password.as_deref())
            .is_some()
    }

    // ── reading ──

    pub async fn read_article(
        &self,
        archive_id: &str,
        path: &str,
        max_length: Option<usize>,
    ) -> Result<ReadResult, ZimiError> {
        let entry = self
            .registry
            .get(archive_id)
            .ok_or_else(|| ZimiError::NotFound(format!("archive '{archive_id}' not found")))?;
        let max_length = max_length
            .unwrap_or(DEFAULT_READ_LENGTH)
            .min(MAX_READ_LENGTH);

        let fetched = fetch_entry(&self.registry, &self.titles, entry, path)
            .await?
            .ok_or_else(|| {
                ZimiError::NotFound(format!("entry '{path}' not found in {archive_id}"))
            })?;

        let plain = if fetched.mime.starts_with("text/html") {
            strip_html(&String::from_utf8_lossy(&fetched.bytes))
        } else if fetched.mime == "application/pdf" {
            "[PDF document; fetch the raw entry for its contents]".to_string()
        } else if fetched.mime.starts_with("text/") {
            String::from_utf8_lossy(&fetched.bytes).to_string()
        } else {
            format!("[binary entry, {} bytes]", fetched.bytes.len())
        };
        let full_length = plain.chars().count();
        let (text, truncated) = truncate_words(&plain, max_length);
        Ok(ReadResult {
            archive: archive_id.to_string(),
            path: fetched.path,
            title: fetched.title,
            text,
            mime: fetched.mime,
            truncated,
            full_length,
        })
    }

    pub async fn snippet(
        &self,
        archive_id: &str,
        path: &str,
    ) -> Result<SnippetResult, ZimiError> {
        let entry = self
            .registry
            .get(archive_id)
            .ok_or_else(|| ZimiError::NotFound(format!("archive '{archive_id}' not found")))?;
        let fetched = fetch_entry(&self.registry, &self.titles, entry, path)
            .await?
            .ok_or_else(|| {
                ZimiError::NotFound(format!("entry '{path}' not found in {archive_id}"))
            })?;
        if fetched.bytes.len() > MAX_SNIPPET_ENTRY_BYTES
            || !fetched.mime.starts_with("text/html")
        {
            return Ok(SnippetResult {
                snippet: String::new(),
                thumbnail: None,
            });
        }
        let html = String::from_utf8_lossy(&fetched.bytes);
        let snippet = extract_snippet(&html);
        let thumbnail =
            extract_thumbnail(&html, path).map(|p| format!("/w/{archive_id}/{p}"));
        Ok(SnippetResult { snippet, thumbnail })
    }

    pub async fn random_article(
        &self,
        archive_id: Option<&str>,
    ) -> Result<RandomResult, ZimiError> {
        let entry = match archive_id {
            Some(id) => self
                .registry
                .get(id)
                .ok_or_else(|| ZimiError::NotFound(format!("archive '{id}' not found")))?,
            None => {
                let entries = self.registry.entries();
                if entries.is_empty() {
                    return Err(ZimiError::NotFound("no archives installed".into()));
                }
                let nanos = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.subsec_nanos() as usize)
                    .unwrap_or(0);
                entries[nanos % entries.len()].clone()
            }
        };
        let id = entry.id();
        let hit = self
            .titles
            .random_article(&id)
            .await
            .ok_or_else(|| ZimiError::IndexUnavailable(id.clone()))?;
        Ok(RandomResult {
            archive: id,
            path: hit.path,
            title: hit.title,
        })
    }

    /// zimgit-style PDF catalog from the archive's `database.js` entry.
    pub async fn pdf_catalog(&self, archive_id: &str) -> Result<Vec<PdfDoc>, ZimiError> {
        let entry = self
            .registry
            .get(archive_id)
            .ok_or_else(|| ZimiError::NotFound(format!("archive '{archive_id}' not found")))?;
        let fetched = fetch_entry(&self.registry, &self.titles, entry, "database.js")
            .await?
            .ok_or_else(|| {
                ZimiError::NotFound(format!(
                    "no catalog (database.js) in '{archive_id}'"
                ))
            })?;
        let content = String::from_utf8_lossy(&fetched.bytes);
        let docs = crate::catalog::parse_database_js(&content).ok_or_else(|| {
            ZimiError::Internal(format!("unparseable catalog in '{archive_id}'"))
        })?;
        Ok(docs
            .into_iter()
            .map(|doc| PdfDoc {
                title: doc
                    .get("ti")
                    .and_then(|v| v.as_str())
                    .unwrap_or("?")
                    .to_string(),
                files: doc
                    .get("fp")
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect())
    }
}

#[derive(Debug, Serialize)]
pub struct ReadResult {
    pub archive: String,
    pub path: String,
    pub title: String,
    pub text: String,
    pub mime: String,
    pub truncated: bool,
    pub full_length: usize,
}

#[derive(Debug, Serialize)]
pub struct SnippetResult {
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RandomResult {
    pub archive: String,
    pub path: String,
    pub title: String,
}

#[derive(Debug, Serialize)]
pub struct PdfDoc {
    pub title: String,
    pub files: Vec<String>,
}
