//! Resumable archive downloads.
//!
//! One task may be active per catalog slug (the date-stripped basename).
//! Transfers write to `<filename>.tmp` and resume with a `Range` header
//! from whatever is already on disk; the finished file is verified against
//! the server-reported length and renamed into place atomically. HTTP 5xx
//! and network errors retry with 1 s / 4 s / 16 s backoff; 4xx is terminal.
//! Cancellation flips the task state and the transfer loop notices at the
//! next chunk boundary, keeping the partial `.tmp` for a later resume.
//!
//! Completion is announced over a channel; the app layer refreshes the
//! library, appends history, and kicks the index build.

use dashmap::DashMap;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::archive::split_zim_date;
use crate::error::ZimiError;

/// Retries after the initial attempt.
const MAX_RETRIES: u32 = 3;
/// Stale partial files older than this are swept at startup.
const STALE_TMP_AGE: Duration = Duration::from_secs(24 * 60 * 60);
/// Finished tasks linger this long in listings before being dropped.
const FINISHED_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadKind {
    New,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Complete,
    Failed(String),
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Queued | TaskState::Running)
    }

    fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Complete => "complete",
            TaskState::Failed(_) => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub struct DownloadTask {
    pub slug: String,
    pub url: String,
    pub filename: String,
    pub dest: PathBuf,
    pub kind: DownloadKind,
    state: Mutex<TaskState>,
    pub bytes_written: AtomicU64,
    pub total_bytes: AtomicU64,
    pub started_at: std::time::Instant,
    pub started_epoch: i64,
    cancel: CancellationToken,
}

impl DownloadTask {
    pub fn state(&self) -> TaskState {
        self.state.lock().unwrap().clone()
    }

    fn set_state(&self, state: TaskState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn tmp_path(&self) -> PathBuf {
        let mut name = self.dest.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadStatus {
    pub slug: String,
    pub filename: String,
    pub url: String,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub bytes_written: u64,
    pub total_bytes: u64,
    pub percent: f64,
    pub started_at: i64,
    pub elapsed_secs: u64,
    pub kind: DownloadKind,
}

pub enum DownloadEvent {
    Completed(Arc<DownloadTask>),
    Failed {
        task: Arc<DownloadTask>,
        error: String,
    },
}

static FILENAME_OK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w.\-]+$").expect("static pattern"));

/// Validate a catalog download URL and extract its target filename.
/// `require_kiwix` restricts the host to the official mirror (the catalog
/// path); imports allow any HTTPS origin.
pub fn validate_url(url: &str, require_kiwix: bool) -> Result<(String, String), String> {
    if require_kiwix {
        if !url.starts_with("https://download.kiwix.org/") {
            return Err("URL must be from download.kiwix.org".to_string());
        }
    } else if !url.starts_with("https://") {
        return Err("URL must use HTTPS".to_string());
    }
    // The OPDS catalog hands out .meta4 metalink URLs; the direct file is
    // the same URL without the suffix.
    let url = url.strip_suffix(".meta4").unwrap_or(url).to_string();
    let clean = url.split(['?', '#']).next().unwrap_or(&url);
    let filename = clean.rsplit('/').next().unwrap_or("").to_string();
    if filename.is_empty() || filename.contains("..") {
        return Err("Invalid filename in URL".to_string());
    }
    if !filename.ends_with(".zim") {
        return Err("Only .zim files can be downloaded".to_string());
    }
    if !FILENAME_OK.is_match(&filename) {
        return Err("Invalid characters in filename".to_string());
    }
    Ok((url, filename))
}

/// Backoff before retry `attempt` (1-based): 1 s, 4 s, 16 s.
pub fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(4u64.pow(attempt.saturating_sub(1)))
}

/// Whether an HTTP status merits a retry (5xx; everything else 4xx-ish is
/// terminal).
pub fn status_retryable(status: u16) -> bool {
    (500..600).contains(&status)
}

pub struct DownloadManager {
    dir: PathBuf,
    client: reqwest::Client,
    tasks: DashMap<String, Arc<DownloadTask>>,
    events: tokio::sync::mpsc::UnboundedSender<DownloadEvent>,
}

impl DownloadManager {
    pub fn new(
        dir: PathBuf,
        client: reqwest::Client,
        events: tokio::sync::mpsc::UnboundedSender<DownloadEvent>,
    ) -> Self {
        DownloadManager {
            dir,
            client,
            tasks: DashMap::new(),
            events,
        }
    }

    /// Begin (or resume) a download. At most one task may exist per slug;
    /// a second start while one is queued, running, or cancelled-but-not-
    /// cleared returns `conflict`.
    pub fn start(
        &self,
        url: &str,
        kind: DownloadKind,
        require_kiwix: bool,
    ) -> Result<Arc<DownloadTask>, ZimiError> {
        let (url, filename) =
            validate_url(url, require_kiwix).map_err(ZimiError::BadRequest)?;
        let (base, _) = split_zim_date(&filename);
        let slug = base.to_lowercase();

        if let Some(existing) = self.tasks.get(&slug) {
            match existing.state() {
                TaskState::Complete | TaskState::Failed(_) => {
                    drop(existing);
                    self.tasks.remove(&slug);
                }
                _ => {
                    return Err(ZimiError::Conflict(format!(
                        "download already active for '{slug}'"
                    )));
                }
            }
        }

        let task = Arc::new(DownloadTask {
            slug: slug.clone(),
            url,
            filename: filename.clone(),
            dest: self.dir.join(&filename),
            kind,
            state: Mutex::new(TaskState::Queued),
            bytes_written: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            started_at: std::time::Instant::now(),
            started_epoch: chrono::Utc::now().timestamp(),
            cancel: CancellationToken::new(),
        });
        self.tasks.insert(slug, task.clone());

        let client = self.client.clone();
        let events = self.events.clone();
        let run_task = task.clone();
        tokio::spawn(async move {
            let result = run_transfer(&client, &run_task).await;
            match result {
                Ok(TransferEnd::Complete) => {
                    run_task.set_state(TaskState::Complete);
                    let _ = events.send(DownloadEvent::Completed(run_task));
                }
                Ok(TransferEnd::Cancelled) => {
                    run_task.set_state(TaskState::Cancelled);
                    tracing::info!("download cancelled: {}", run_task.filename);
                }
                Err(error) => {
                    tracing::warn!("download failed: {}: {error}", run_task.filename);
                    run_task.set_state(TaskState::Failed(error.clone()));
                    let _ = events.send(DownloadEvent::Failed {
                        task: run_task,
                        error,
                    });
                }
            }
        });
        Ok(task)
    }

    pub fn get(&self, slug: &str) -> Option<Arc<DownloadTask>> {
        self.tasks.get(slug).map(|t| t.clone())
    }

    /// Request cancellation; the transfer loop stops at the next chunk.
    pub fn cancel(&self, slug: &str) -> Result<(), ZimiError> {
        let task = self
            .tasks
            .get(slug)
            .ok_or_else(|| ZimiError::NotFound(format!("no download for '{slug}'")))?;
        if task.state().is_terminal() {
            return Err(ZimiError::BadRequest("download already finished".into()));
        }
        task.cancel.cancel();
        Ok(())
    }

    /// Drop finished tasks (including cancelled ones, freeing the slug).
    pub fn clear_finished(&self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, task| !task.state().is_terminal());
        before - self.tasks.len()
    }

    /// Whether any task is still queued or running.
    pub fn any_active(&self) -> bool {
        self.tasks.iter().any(|t| !t.state().is_terminal())
    }

    pub fn list(&self) -> Vec<DownloadStatus> {
        // Old finished tasks age out of the listing.
        self.tasks.retain(|_, task| {
            !(task.state().is_terminal() && task.started_at.elapsed() > FINISHED_TTL)
        });
        let mut statuses: Vec<DownloadStatus> = self
            .tasks
            .iter()
            .map(|task| {
                let state = task.state();
                let written = task.bytes_written.load(Ordering::Relaxed);
                let total = task.total_bytes.load(Ordering::Relaxed);
                DownloadStatus {
                    slug: task.slug.clone(),
                    filename: task.filename.clone(),
                    url: task.url.clone(),
                    state: state.as_str(),
                    error: match &state {
                        TaskState::Failed(e) => Some(e.clone()),
                        _ => None,
                    },
                    bytes_written: written,
                    total_bytes: total,
                    percent: if total > 0 {
                        (written as f64 / total as f64 * 1000.0).round() / 10.0
                    } else {
                        0.0
                    },
                    started_at: task.started_epoch,
                    elapsed_secs: task.started_at.elapsed().as_secs(),
                    kind: task.kind,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.slug.cmp(&b.slug));
        statuses
    }

    /// Startup sweep: remove partial files older than a day that no active
    /// task owns.
    pub fn sweep_stale_tmp(&self) {
        let Ok(read) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for dent in read.flatten() {
            let name = dent.file_name().to_string_lossy().to_string();
            if !name.ends_with(".zim.tmp") {
                continue;
            }
            let owned = self
                .tasks
                .iter()
                .any(|t| !t.state().is_terminal() && t.tmp_path().file_name()
                    .map(|f| f.to_string_lossy() == name)
                    .unwrap_or(false));
            if owned {
                continue;
            }
            let age = dent
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok());
            if age.map(|a| a > STALE_TMP_AGE).unwrap_or(false) {
                tracing::info!("sweeping stale partial download {name}");
                let _ = std::fs::remove_file(dent.path());
            }
        }
    }
}

#[derive(Debug)]
enum TransferEnd {
    Complete,
    Cancelled,
}

async fn run_transfer(
    client: &reqwest::Client,
    task: &Arc<DownloadTask>,
) -> Result<TransferEnd, String> {
    task.set_state(TaskState::Running);
    let mut attempt = 0u32;
    loop {
        match transfer_once(client, task).await {
            Ok(end) => return Ok(end),
            Err(TransferError::Terminal(msg)) => return Err(msg),
            Err(TransferError::Transient(msg)) => {
                attempt += 1;
                if attempt > MAX_RETRIES {
                    return Err(format!("{msg} (after {MAX_RETRIES} retries)"));
                }
                let delay = retry_delay(attempt);
                tracing::info!(
                    "download retry {attempt}/{MAX_RETRIES} for {} in {}s: {msg}",
                    task.filename,
                    delay.as_secs()
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = task.cancel.cancelled() => return Ok(TransferEnd::Cancelled),
                }
            }
        }
    }
}

enum TransferError {
    /// Network or 5xx; retried with backoff.
    Transient(String),
    /// 4xx or verification failure; reported as `download_failed`.
    Terminal(String),
}

async fn transfer_once(
    client: &reqwest::Client,
    task: &Arc<DownloadTask>,
) -> Result<TransferEnd, TransferError> {
    let tmp = task.tmp_path();
    let existing = std::fs::metadata(&tmp).map(|m| m.len()).unwrap_or(0);

    let mut request = client
        .get(&task.url)
        .header("User-Agent", concat!("zimi/", env!("CARGO_PKG_VERSION")));
    if existing > 0 {
        tracing::info!(
            "resuming download of {} from {existing} bytes",
            task.filename
        );
        request = request.header("Range", format!("bytes={existing}-"));
    }

    let response = tokio::select! {
        result = request.send() => match result {
            Ok(r) => r,
            Err(e) => return Err(TransferError::Transient(e.to_string())),
        },
        _ = task.cancel.cancelled() => return Ok(TransferEnd::Cancelled),
    };
    let status = response.status().as_u16();

    // Range not satisfiable: the partial file is already complete.
    if status == 416 && existing > 0 {
        finalize(task, &tmp, existing)?;
        return Ok(TransferEnd::Complete);
    }
    if status >= 400 {
        let msg = format!("HTTP {status}");
        return Err(if status_retryable(status) {
            TransferError::Transient(msg)
        } else {
            TransferError::Terminal(msg)
        });
    }

    let (mut written, total, append) = if status == 206 {
        let total = response
            .headers()
            .get("Content-Range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or_else(|| existing + response.content_length().unwrap_or(0));
        (existing, total, true)
    } else {
        // Server ignored the range; start over.
        (0, response.content_length().unwrap_or(0), false)
    };
    task.total_bytes.store(total, Ordering::Relaxed);
    task.bytes_written.store(written, Ordering::Relaxed);

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(append)
        .write(true)
        .truncate(!append)
        .open(&tmp)
        .await
        .map_err(|e| TransferError::Terminal(format!("opening {}: {e}", tmp.display())))?;

    let mut stream = response.bytes_stream();
    loop {
        if task.cancel.is_cancelled() {
            // Keep the partial file for resume.
            let _ = file.flush().await;
            return Ok(TransferEnd::Cancelled);
        }
        match stream.next().await {
            Some(Ok(chunk)) => {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| TransferError::Terminal(format!("write: {e}")))?;
                written += chunk.len() as u64;
                task.bytes_written.store(written, Ordering::Relaxed);
            }
            Some(Err(e)) => {
                let _ = file.flush().await;
                return Err(TransferError::Transient(e.to_string()));
            }
            None => break,
        }
    }
    file.flush()
        .await
        .map_err(|e| TransferError::Terminal(format!("flush: {e}")))?;
    drop(file);

    if total > 0 && written != total {
        // Keep the file for inspection; the startup sweep cleans it later.
        return Err(TransferError::Terminal(format!(
            "size mismatch: expected {total}, got {written}"
        )));
    }

    finalize(task, &tmp, written)?;
    Ok(TransferEnd::Complete)
}

fn finalize(task: &DownloadTask, tmp: &Path, written: u64) -> Result<(), TransferError> {
    std::fs::rename(tmp, &task.dest)
        .map_err(|e| TransferError::Terminal(format!("rename: {e}")))?;
    task.bytes_written.store(written, Ordering::Relaxed);
    if task.total_bytes.load(Ordering::Relaxed) == 0 {
        task.total_bytes.store(written, Ordering::Relaxed);
    }
    tracing::info!("download complete: {}", task.filename);
    Ok(())
}

/// After an update lands, older dated versions of the same archive are
/// removed from the directory.
pub fn remove_old_versions(dir: &Path, new_filename: &str) -> Vec<String> {
    let (base, date) = split_zim_date(new_filename);
    if date.is_none() {
        return Vec::new();
    }
    let mut removed = Vec::new();
    let Ok(read) = std::fs::read_dir(dir) else {
        return removed;
    };
    for dent in read.flatten() {
        let name = dent.file_name().to_string_lossy().to_string();
        if name == new_filename || !name.ends_with(".zim") {
            continue;
        }
        let (other_base, other_date) = split_zim_date(&name);
        if other_base == base && other_date.is_some() {
            if std::fs::remove_file(dent.path()).is_ok() {
                tracing::info!("removed old version {name}");
                removed.push(name);
            }
        }
    }
    removed
}
