//! Per-archive on-disk title indexes.
//!
//! Each archive gets one SQLite database at `<data_dir>/titles/<id>.db`:
//!
//! ```text
//! entries(path TEXT PRIMARY KEY, title TEXT, title_lower TEXT,
//!         kind TEXT, mime TEXT, cluster INTEGER, blob INTEGER)
//! idx_title_lower ON entries(title_lower)
//! entries_fts     -- FTS5 over (path UNINDEXED, title, kind UNINDEXED),
//!                 -- present only when the archive has <= 2M rows
//! meta(key TEXT PRIMARY KEY, value TEXT)
//! ```
//!
//! The `(cluster, blob)` columns pin each entry's content location inside
//! the archive, so the reader can fetch bytes with a single indexed lookup
//! instead of walking the archive directory.
//!
//! Builds stream rows from a dedicated archive handle into
//! `<id>.db.tmp` in batches of 5000 per transaction, then atomically rename
//! over the live file. A build is cancelled cooperatively at batch
//! boundaries. Reads go through a small pre-warmed per-archive pool.
//!
//! Corruption recovery is one-shot: a failing query closes the pool and
//! deletes the database so the next refresh rebuilds it. Three consecutive
//! build failures quarantine the archive from the title phase.

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::archive::{scan_entries, EntryKind, EntryRow};

pub const SCHEMA_VERSION: &str = "1";
/// Archives with more rows than this skip the FTS table at build time; it
/// can still be added later on demand.
pub const FTS_ROW_THRESHOLD: u64 = 2_000_000;
/// Rows per insert transaction during builds.
const BUILD_BATCH: usize = 5000;
/// Rows per chunk for the budgeted substring fallback scan.
const SCAN_CHUNK: i64 = 5000;
/// Per-archive budget for the substring fallback.
pub const TOKEN_SCAN_BUDGET: Duration = Duration::from_millis(50);
/// Consecutive build failures before an archive is quarantined.
const MAX_BUILD_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct TitleHit {
    pub path: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy)]
pub struct IndexInfo {
    pub entries: u64,
    pub articles: u64,
    pub has_fts: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BuildState {
    Missing,
    Building { built_rows: u64 },
    /// Index file present; row counts and the FTS flag come from
    /// [`TitleStore::info`].
    Ready,
    Failed { attempts: u32 },
}

#[derive(Clone)]
struct BuildProgress {
    built: Arc<AtomicU64>,
    cancel: CancellationToken,
}

pub enum BuildOutcome {
    Built { rows: u64, has_fts: bool },
    Cancelled,
}

pub struct TitleStore {
    dir: PathBuf,
    pools: DashMap<String, SqlitePool>,
    builds: DashMap<String, BuildProgress>,
    failures: DashMap<String, u32>,
}

impl TitleStore {
    pub fn new(dir: PathBuf) -> Self {
        TitleStore {
            dir,
            pools: DashMap::new(),
            builds: DashMap::new(),
            failures: DashMap::new(),
        }
    }

    pub fn db_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.db"))
    }

    fn tmp_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.db.tmp"))
    }

    // ── pool management ──

    async fn pool(&self, id: &str) -> Option<SqlitePool> {
        if let Some(pool) = self.pools.get(id) {
            return Some(pool.clone());
        }
        let path = self.db_path(id);
        if !path.exists() {
            return None;
        }
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .min_connections(2)
            .max_connections(3)
            .connect_with(options)
            .await
            .ok()?;
        self.pools.insert(id.to_string(), pool.clone());
        Some(pool)
    }

    pub async fn close(&self, id: &str) {
        if let Some((_, pool)) = self.pools.remove(id) {
            pool.close().await;
        }
    }

    /// Drop the index entirely (archive deleted, or corruption recovery).
    pub async fn delete(&self, id: &str) {
        self.close(id).await;
        let _ = std::fs::remove_file(self.db_path(id));
        let _ = std::fs::remove_file(self.tmp_path(id));
    }

    /// Close the pool and delete the database after a query-level failure,
    /// so the next refresh rebuilds from scratch.
    async fn recover_corrupt(&self, id: &str, err: &sqlx::Error) {
        tracing::warn!("title index for {id} failed ({err}); deleting for rebuild");
        self.delete(id).await;
    }

    // ── build lifecycle ──

    pub fn build_state(&self, id: &str) -> BuildState {
        if let Some(progress) = self.builds.get(id) {
            return BuildState::Building {
                built_rows: progress.built.load(Ordering::Relaxed),
            };
        }
        if let Some(attempts) = self.failures.get(id) {
            if *attempts >= MAX_BUILD_FAILURES {
                return BuildState::Failed {
                    attempts: *attempts,
                };
            }
        }
        if self.db_path(id).exists() {
            BuildState::Ready
        } else {
            BuildState::Missing
        }
    }

    pub fn is_quarantined(&self, id: &str) -> bool {
        self.failures
            .get(id)
            .map(|a| *a >= MAX_BUILD_FAILURES)
            .unwrap_or(false)
    }

    pub fn record_build_failure(&self, id: &str) -> u32 {
        let mut entry = self.failures.entry(id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn clear_failures(&self, id: &str) {
        self.failures.remove(id);
    }

    /// Ask a running build (if any) to stop at its next batch boundary.
    pub fn cancel_build(&self, id: &str) {
        if let Some(progress) = self.builds.get(id) {
            progress.cancel.cancel();
        }
    }

    /// Whether the on-disk index matches the archive's current fingerprint.
    pub async fn is_current(&self, id: &str, size: u64, mtime: i64) -> bool {
        let Some(pool) = self.pool(id).await else {
            return false;
        };
        let meta = match read_meta(&pool).await {
            Ok(meta) => meta,
            Err(_) => return false,
        };
        meta.get("schema_version").map(String::as_str) == Some(SCHEMA_VERSION)
            && meta.get("zim_size").map(String::as_str) == Some(size.to_string().as_str())
            && meta.get("zim_mtime").map(String::as_str) == Some(mtime.to_string().as_str())
    }

    /// Build (or rebuild) the index for one archive. Opens a dedicated
    /// archive handle, so the global archive lock is not required.
    pub async fn build(
        &self,
        id: &str,
        zim_path: &Path,
        size: u64,
        mtime: i64,
    ) -> Result<BuildOutcome> {
        std::fs::create_dir_all(&self.dir)?;
        let tmp = self.tmp_path(id);
        let _ = std::fs::remove_file(&tmp);

        let progress = BuildProgress {
            built: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        };
        if self.builds.contains_key(id) {
            bail!("index build already running for {id}");
        }
        self.builds.insert(id.to_string(), progress.clone());

        let result = self
            .build_inner(id, zim_path, size, mtime, &tmp, &progress)
            .await;
        self.builds.remove(id);

        match &result {
            Ok(BuildOutcome::Built { rows, has_fts }) => {
                self.clear_failures(id);
                tracing::info!(
                    "title index built for {id}: {rows} rows{}",
                    if *has_fts { "" } else { " (no FTS)" }
                );
            }
            Ok(BuildOutcome::Cancelled) => {
                let _ = std::fs::remove_file(&tmp);
                tracing::info!("title index build cancelled for {id}");
            }
            Err(err) => {
                let _ = std::fs::remove_file(&tmp);
                let attempts = self.record_build_failure(id);
                tracing::warn!("title index build failed for {id} (attempt {attempts}): {err}");
            }
        }
        result
    }

    async fn build_inner(
        &self,
        id: &str,
        zim_path: &Path,
        size: u64,
        mtime: i64,
        tmp: &Path,
        progress: &BuildProgress,
    ) -> Result<BuildOutcome> {
        let options = SqliteConnectOptions::new()
            .filename(tmp)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Off);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("opening build database")?;

        create_schema(&pool).await?;

        // The archive walk is blocking; stream batches through a channel.
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<EntryRow>>(4);
        let scan_path = zim_path.to_path_buf();
        let cancel = progress.cancel.clone();
        let scanner = tokio::task::spawn_blocking(move || -> Result<u64> {
            let zim = zim::Zim::new(&scan_path).map_err(|e| anyhow::anyhow!("open: {e}"))?;
            let mut batch = Vec::with_capacity(BUILD_BATCH);
            let sent = scan_entries(&zim, &|| cancel.is_cancelled(), |row| {
                batch.push(row);
                if batch.len() >= BUILD_BATCH {
                    let full = std::mem::replace(&mut batch, Vec::with_capacity(BUILD_BATCH));
                    // Receiver dropping means the build aborted; stop quietly.
                    let _ = tx.blocking_send(full);
                }
            })?;
            if !batch.is_empty() {
                let _ = tx.blocking_send(batch);
            }
            Ok(sent)
        });

        let mut total = 0u64;
        let mut articles = 0u64;
        while let Some(batch) = rx.recv().await {
            articles += batch
                .iter()
                .filter(|r| r.kind == EntryKind::Article)
                .count() as u64;
            total += batch.len() as u64;
            insert_batch(&pool, &batch).await?;
            progress.built.store(total, Ordering::Relaxed);
            if progress.cancel.is_cancelled() {
                break;
            }
        }

        // Unblock the scanner if the insert loop bailed early.
        drop(rx);
        let scan_result = scanner.await.context("scan task")?;
        if progress.cancel.is_cancelled() {
            pool.close().await;
            return Ok(BuildOutcome::Cancelled);
        }
        let scanned = scan_result?;

        if scanned == 0 {
            pool.close().await;
            bail!("{id} has no indexable entries");
        }

        let has_fts = scanned <= FTS_ROW_THRESHOLD;
        if has_fts {
            populate_fts(&pool).await?;
        } else {
            tracing::info!(
                "title index for {id}: {scanned} rows, skipping FTS (threshold {FTS_ROW_THRESHOLD})"
            );
        }

        write_meta(
            &pool,
            &[
                ("schema_version", SCHEMA_VERSION.to_string()),
                ("zim_size", size.to_string()),
                ("zim_mtime", mtime.to_string()),
                ("entry_count", scanned.to_string()),
                ("article_count", articles.to_string()),
                ("has_fts", if has_fts { "1" } else { "0" }.to_string()),
                ("built_at", chrono::Utc::now().timestamp().to_string()),
            ],
        )
        .await?;

        pool.close().await;

        // Atomic swap; evict the stale read pool first.
        self.close(id).await;
        std::fs::rename(tmp, self.db_path(id)).context("renaming index into place")?;
        Ok(BuildOutcome::Built {
            rows: scanned,
            has_fts,
        })
    }

    /// Add the FTS table to an existing index without rescanning the
    /// archive.
    pub async fn build_fts(&self, id: &str) -> Result<IndexInfo> {
        let path = self.db_path(id);
        if !path.exists() {
            bail!("no title index for {id}");
        }
        self.close(id).await;
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='entries_fts'",
        )
        .fetch_one(&pool)
        .await?;
        if existing == 0 {
            populate_fts(&pool).await?;
            write_meta(&pool, &[("has_fts", "1".to_string())]).await?;
        }
        let info = info_from_meta(&read_meta(&pool).await?);
        pool.close().await;
        Ok(info)
    }

    // ── queries ──

    pub async fn info(&self, id: &str) -> Option<IndexInfo> {
        let pool = self.pool(id).await?;
        match read_meta(&pool).await {
            Ok(meta) => Some(info_from_meta(&meta)),
            Err(err) => {
                self.recover_corrupt(id, &err).await;
                None
            }
        }
    }

    /// Case-insensitive prefix lookup over article titles. O(log n) range
    /// scan on the `title_lower` index.
    pub async fn prefix(&self, id: &str, query: &str, limit: usize) -> Option<Vec<TitleHit>> {
        let pool = self.pool(id).await?;
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return Some(Vec::new());
        }
        let Some(upper) = prefix_upper_bound(&q) else {
            return Some(Vec::new());
        };
        let result = sqlx::query(
            "SELECT path, title FROM entries \
             WHERE kind = 'article' AND title_lower >= ?1 AND title_lower < ?2 \
             ORDER BY title_lower LIMIT ?3",
        )
        .bind(&q)
        .bind(&upper)
        .bind(limit as i64)
        .fetch_all(&pool)
        .await;
        match result {
            Ok(rows) => Some(
                rows.iter()
                    .map(|row| TitleHit {
                        path: row.get("path"),
                        title: row.get("title"),
                    })
                    .collect(),
            ),
            Err(err) => {
                self.recover_corrupt(id, &err).await;
                None
            }
        }
    }

    /// Multi-token lookup. Uses the FTS table when present; otherwise a
    /// budgeted substring scan over `entries`, chunked so the deadline is
    /// honored between chunks. Returns `(hits, truncated)`.
    pub async fn tokens(
        &self,
        id: &str,
        tokens: &[String],
        limit: usize,
    ) -> Option<(Vec<TitleHit>, bool)> {
        if tokens.is_empty() {
            return Some((Vec::new(), false));
        }
        let pool = self.pool(id).await?;
        let has_fts = match read_meta(&pool).await {
            Ok(meta) => meta.get("has_fts").map(String::as_str) == Some("1"),
            Err(err) => {
                self.recover_corrupt(id, &err).await;
                return None;
            }
        };

        if has_fts {
            let match_expr = fts_match_expr(tokens);
            let result = sqlx::query(
                "SELECT path, title FROM entries_fts \
                 WHERE entries_fts MATCH ?1 AND kind = 'article' LIMIT ?2",
            )
            .bind(&match_expr)
            .bind(limit as i64)
            .fetch_all(&pool)
            .await;
            return match result {
                Ok(rows) => Some((
                    rows.iter()
                        .map(|row| TitleHit {
                            path: row.get("path"),
                            title: row.get("title"),
                        })
                        .collect(),
                    false,
                )),
                Err(err) => {
                    self.recover_corrupt(id, &err).await;
                    None
                }
            };
        }

        // Fallback: chunked substring scan with a hard time budget.
        let needles: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();
        let deadline = Instant::now() + TOKEN_SCAN_BUDGET;
        let mut hits = Vec::new();
        let mut truncated = false;
        let mut last_rowid = 0i64;
        loop {
            let rows = sqlx::query(
                "SELECT rowid, path, title, title_lower FROM entries \
                 WHERE kind = 'article' AND rowid > ?1 ORDER BY rowid LIMIT ?2",
            )
            .bind(last_rowid)
            .bind(SCAN_CHUNK)
            .fetch_all(&pool)
            .await;
            let rows = match rows {
                Ok(rows) => rows,
                Err(err) => {
                    self.recover_corrupt(id, &err).await;
                    return None;
                }
            };
            if rows.is_empty() {
                break;
            }
            for row in &rows {
                last_rowid = row.get("rowid");
                let lower: String = row.get("title_lower");
                if needles.iter().all(|n| lower.contains(n.as_str())) {
                    hits.push(TitleHit {
                        path: row.get("path"),
                        title: row.get("title"),
                    });
                    if hits.len() >= limit {
                        return Some((hits, false));
                    }
                }
            }
            if Instant::now() >= deadline {
                truncated = true;
                break;
            }
        }
        Some((hits, truncated))
    }

    /// Resolve a path to its content coordinates.
    pub async fn lookup(&self, id: &str, path: &str) -> Option<EntryRow> {
        let pool = self.pool(id).await?;
        let row = sqlx::query(
            "SELECT path, title, kind, mime, cluster, blob FROM entries WHERE path = ?1",
        )
        .bind(path)
        .fetch_optional(&pool)
        .await
        .ok()??;
        Some(EntryRow {
            path: row.get("path"),
            title: row.get("title"),
            kind: EntryKind::from_str(row.get::<String, _>("kind").as_str()),
            mime: row.get("mime"),
            cluster: row.get::<i64, _>("cluster") as u32,
            blob: row.get::<i64, _>("blob") as u32,
        })
    }

    /// Fast existence probe used by the cross-source resolver.
    pub async fn exists(&self, id: &str, path: &str) -> bool {
        let Some(pool) = self.pool(id).await else {
            return false;
        };
        sqlx::query_scalar::<_, i64>("SELECT 1 FROM entries WHERE path = ?1 LIMIT 1")
            .bind(path)
            .fetch_optional(&pool)
            .await
            .ok()
            .flatten()
            .is_some()
    }

    /// A uniformly-random article via rowid probing.
    pub async fn random_article(&self, id: &str) -> Option<TitleHit> {
        let pool = self.pool(id).await?;
        for _ in 0..8 {
            let row = sqlx::query(
                "SELECT path, title FROM entries \
                 WHERE kind = 'article' \
                   AND rowid >= (ABS(RANDOM()) % (SELECT MAX(rowid) FROM entries)) \
                 ORDER BY rowid LIMIT 1",
            )
            .fetch_optional(&pool)
            .await
            .ok()?;
            if let Some(row) = row {
                return Some(TitleHit {
                    path: row.get("path"),
                    title: row.get("title"),
                });
            }
        }
        None
    }

    /// Remove index files for archives that no longer exist.
    pub async fn clean_stale(&self, live_ids: &[String]) {
        let Ok(read) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for dent in read.flatten() {
            let name = dent.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".db") {
                if !live_ids.contains(&id.to_string()) {
                    tracing::info!("removing stale title index {name}");
                    self.delete(id).await;
                }
            }
        }
    }
}

/// Upper bound for a half-open prefix range: the query with its last
/// character incremented. `None` when no finite bound exists.
fn prefix_upper_bound(q: &str) -> Option<String> {
    let mut chars: Vec<char> = q.chars().collect();
    while let Some(&last) = chars.last() {
        if let Some(next) = char::from_u32(last as u32 + 1) {
            *chars.last_mut().expect("non-empty") = next;
            return Some(chars.iter().collect());
        }
        chars.pop();
    }
    None
}

fn fts_match_expr(tokens: &[String]) -> String {
    let mut parts = Vec::with_capacity(tokens.len());
    for (i, token) in tokens.iter().enumerate() {
        let clean = token.replace('"', "");
        if clean.is_empty() {
            continue;
        }
        if i == tokens.len() - 1 {
            parts.push(format!("\"{clean}\"*"));
        } else {
            parts.push(format!("\"{clean}\""));
        }
    }
    parts.join(" ")
}

pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS entries (
            path TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            title_lower TEXT NOT NULL,
            kind TEXT NOT NULL,
            mime TEXT NOT NULL DEFAULT '',
            cluster INTEGER NOT NULL,
            blob INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_title_lower ON entries(title_lower)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn populate_fts(pool: &SqlitePool) -> Result<()> {
    let exists: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='entries_fts'",
    )
    .fetch_one(pool)
    .await?;
    if exists == 0 {
        sqlx::query(
            "CREATE VIRTUAL TABLE entries_fts USING fts5(path UNINDEXED, title, kind UNINDEXED)",
        )
        .execute(pool)
        .await?;
    }
    sqlx::query("INSERT INTO entries_fts(path, title, kind) SELECT path, title, kind FROM entries")
        .execute(pool)
        .await?;
    Ok(())
}

async fn insert_batch(pool: &SqlitePool, batch: &[EntryRow]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for row in batch {
        sqlx::query(
            "INSERT OR IGNORE INTO entries (path, title, title_lower, kind, mime, cluster, blob) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&row.path)
        .bind(&row.title)
        .bind(row.title.to_lowercase())
        .bind(row.kind.as_str())
        .bind(&row.mime)
        .bind(row.cluster as i64)
        .bind(row.blob as i64)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn write_meta(pool: &SqlitePool, pairs: &[(&str, String)]) -> Result<()> {
    for (key, value) in pairs {
        sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)")
            .bind(key)
            .bind(value)
            .execute(pool)
            .await?;
    }
    Ok(())
}

async fn read_meta(pool: &SqlitePool) -> Result<std::collections::HashMap<String, String>, sqlx::Error> {
    let rows = sqlx::query("SELECT key, value FROM meta").fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("key"), row.get("value")))
        .collect())
}

fn info_from_meta(meta: &std::collections::HashMap<String, String>) -> IndexInfo {
    IndexInfo {
        entries: meta
            .get("entry_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        articles: meta
            .get("article_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        has_fts: meta.get("has_fts").map(String::as_str) == Some("1"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Hand-build an index file the way `build()` would, without needing a
    /// real archive on disk.
    async fn fixture_store(rows: &[(&str, &str, EntryKind)]) -> (TempDir, TitleStore) {
        let tmp = TempDir::new().unwrap();
        let store = TitleStore::new(tmp.path().join("titles"));
        std::fs::create_dir_all(tmp.path().join("titles")).unwrap();
        let options = SqliteConnectOptions::new()
            .filename(store.db_path("fix"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        create_schema(&pool).await.unwrap();
        let entry_rows: Vec<EntryRow> = rows
            .iter()
            .enumerate()
            .map(|(i, (path, title, kind))| EntryRow {
                path: path.to_string(),
                title: title.to_string(),
                kind: *kind,
                mime: if *kind == EntryKind::Article {
                    "text/html".to_string()
                } else {
                    String::new()
                },
                cluster: i as u32,
                blob: 0,
            })
            .collect();
        insert_batch(&pool, &entry_rows).await.unwrap();
        populate_fts(&pool).await.unwrap();
        write_meta(
            &pool,
            &[
                ("schema_version", SCHEMA_VERSION.to_string()),
                ("zim_size", "100".to_string()),
                ("zim_mtime", "200".to_string()),
                ("entry_count", rows.len().to_string()),
                (
                    "article_count",
                    rows.iter()
                        .filter(|r| r.2 == EntryKind::Article)
                        .count()
                        .to_string(),
                ),
                ("has_fts", "1".to_string()),
            ],
        )
        .await
        .unwrap();
        pool.close().await;
        (tmp, store)
    }

    fn sample_rows() -> Vec<(&'static str, &'static str, EntryKind)> {
        vec![
            ("A/Water", "Water", EntryKind::Article),
            ("A/Water_treatment", "Water treatment", EntryKind::Article),
            ("A/Waterfall", "Waterfall", EntryKind::Article),
            ("A/Fire", "Fire", EntryKind::Article),
            ("I/water.png", "water.png", EntryKind::Image),
        ]
    }

    #[tokio::test]
    async fn prefix_matches_case_insensitively() {
        let (_tmp, store) = fixture_store(&sample_rows()).await;
        let hits = store.prefix("fix", "WaT", 10).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.title.to_lowercase().starts_with("wat")));
    }

    #[tokio::test]
    async fn prefix_respects_limit_and_order() {
        let (_tmp, store) = fixture_store(&sample_rows()).await;
        let hits = store.prefix("fix", "water", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Water");
    }

    #[tokio::test]
    async fn prefix_excludes_non_articles() {
        let (_tmp, store) = fixture_store(&sample_rows()).await;
        let hits = store.prefix("fix", "water.p", 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn prefix_missing_index_returns_none() {
        let tmp = TempDir::new().unwrap();
        let store = TitleStore::new(tmp.path().join("titles"));
        assert!(store.prefix("ghost", "water", 10).await.is_none());
    }

    #[tokio::test]
    async fn prefix_empty_query_is_empty() {
        let (_tmp, store) = fixture_store(&sample_rows()).await;
        assert!(store.prefix("fix", "  ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tokens_via_fts_finds_all_words() {
        let (_tmp, store) = fixture_store(&sample_rows()).await;
        let (hits, truncated) = store
            .tokens("fix", &["water".into(), "treatment".into()], 10)
            .await
            .unwrap();
        assert!(!truncated);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "A/Water_treatment");
    }

    #[tokio::test]
    async fn tokens_fallback_without_fts() {
        let (_tmp, store) = fixture_store(&sample_rows()).await;
        // Flip the meta flag so the fallback path runs.
        let options = SqliteConnectOptions::new().filename(store.db_path("fix"));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        write_meta(&pool, &[("has_fts", "0".to_string())]).await.unwrap();
        pool.close().await;
        store.close("fix").await;

        let (hits, truncated) = store
            .tokens("fix", &["treatment".into()], 10)
            .await
            .unwrap();
        assert!(!truncated);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Water treatment");
    }

    #[tokio::test]
    async fn lookup_and_exists() {
        let (_tmp, store) = fixture_store(&sample_rows()).await;
        let row = store.lookup("fix", "A/Water").await.unwrap();
        assert_eq!(row.title, "Water");
        assert_eq!(row.kind, EntryKind::Article);
        assert!(store.exists("fix", "A/Fire").await);
        assert!(!store.exists("fix", "A/Earth").await);
    }

    #[tokio::test]
    async fn random_article_returns_article() {
        let (_tmp, store) = fixture_store(&sample_rows()).await;
        let hit = store.random_article("fix").await.unwrap();
        assert!(hit.path.starts_with("A/"));
    }

    #[tokio::test]
    async fn is_current_checks_fingerprint() {
        let (_tmp, store) = fixture_store(&sample_rows()).await;
        assert!(store.is_current("fix", 100, 200).await);
        assert!(!store.is_current("fix", 100, 999).await);
        assert!(!store.is_current("fix", 999, 200).await);
        assert!(!store.is_current("ghost", 100, 200).await);
    }

    #[tokio::test]
    async fn info_reads_meta() {
        let (_tmp, store) = fixture_store(&sample_rows()).await;
        let info = store.info("fix").await.unwrap();
        assert_eq!(info.entries, 5);
        assert_eq!(info.articles, 4);
        assert!(info.has_fts);
    }

    #[tokio::test]
    async fn build_fts_on_demand_is_idempotent() {
        let (_tmp, store) = fixture_store(&sample_rows()).await;
        let info = store.build_fts("fix").await.unwrap();
        assert!(info.has_fts);
        let again = store.build_fts("fix").await.unwrap();
        assert!(again.has_fts);
    }

    #[tokio::test]
    async fn delete_removes_files() {
        let (_tmp, store) = fixture_store(&sample_rows()).await;
        assert!(store.db_path("fix").exists());
        store.delete("fix").await;
        assert!(!store.db_path("fix").exists());
    }

    #[tokio::test]
    async fn clean_stale_keeps_live() {
        let (_tmp, store) = fixture_store(&sample_rows()).await;
        store.clean_stale(&["fix".to_string()]).await;
        assert!(store.db_path("fix").exists());
        store.clean_stale(&[]).await;
        assert!(!store.db_path("fix").exists());
    }

    #[tokio::test]
    async fn build_state_tracks_index_file() {
        let (_tmp, store) = fixture_store(&sample_rows()).await;
        assert!(matches!(store.build_state("fix"), BuildState::Ready));
        assert!(matches!(store.build_state("ghost"), BuildState::Missing));
        store.delete("fix").await;
        assert!(matches!(store.build_state("fix"), BuildState::Missing));
    }

    #[tokio::test]
    async fn quarantine_after_three_failures() {
        let tmp = TempDir::new().unwrap();
        let store = TitleStore::new(tmp.path().join("titles"));
        assert!(!store.is_quarantined("bad"));
        for _ in 0..3 {
            store.record_build_failure("bad");
        }
        assert!(store.is_quarantined("bad"));
        store.clear_failures("bad");
        assert!(!store.is_quarantined("bad"));
    }

    #[test]
    fn upper_bound_increments_last_char() {
        assert_eq!(prefix_upper_bound("wat").as_deref(), Some("wau"));
        assert_eq!(prefix_upper_bound("z").as_deref(), Some("{"));
    }

    #[test]
    fn fts_expr_quotes_and_prefixes() {
        let expr = fts_match_expr(&["water".into(), "trea".into()]);
        assert_eq!(expr, "\"water\" \"trea\"*");
        let hostile = fts_match_expr(&["wa\"ter".into()]);
        assert_eq!(hostile, "\"water\"*");
    }
}
