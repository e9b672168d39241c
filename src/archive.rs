//! Archive registry: the process-wide map of opened ZIM archives.
//!
//! The registry owns three things:
//!
//! 1. **Metadata** for every `*.zim` file in the archive directory, read once
//!    per `(size, mtime)` and cached in `cache.json` so restarts are instant.
//! 2. **Native handles** (`zim::Zim`), opened lazily and kept warm. The
//!    underlying reader shares decoder state across calls, so every use of a
//!    registry-held handle happens under the single global `zim_lock`.
//!    Dedicated handles opened for index builds bypass the lock.
//! 3. **Per-archive title locks** guarding the title-index store, so title
//!    work runs in parallel across archives while build/refresh writers get
//!    exclusivity.
//!
//! `refresh()` rescans the directory: new files are added, vanished files
//! dropped, and files whose size/mtime changed are reopened. Each refresh
//! bumps a generation counter that the caches key off for invalidation.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use zim::{DirectoryEntry, MimeType, Target, Zim};

use crate::error::ZimiError;
use crate::state::{CachedArchiveMeta, StateStore};

/// Coarse classification of an entry, stored in the title index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Article,
    Image,
    Media,
    Other,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Article => "article",
            EntryKind::Image => "image",
            EntryKind::Media => "media",
            EntryKind::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "article" => EntryKind::Article,
            "image" => EntryKind::Image,
            "media" => EntryKind::Media,
            _ => EntryKind::Other,
        }
    }

    pub fn from_mime(mime: Option<&str>) -> Self {
        match mime {
            Some(m) if m.starts_with("text/html") => EntryKind::Article,
            Some(m) if m.starts_with("image/") => EntryKind::Image,
            Some(m) if m.starts_with("video/") || m.starts_with("audio/") => EntryKind::Media,
            _ => EntryKind::Other,
        }
    }
}

/// Derived archive category, computed once from the slug. Ordered rules,
/// first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Category {
    Medical,
    #[serde(rename = "Stack Exchange")]
    StackExchange,
    #[serde(rename = "Dev Docs")]
    DevDocs,
    Education,
    #[serde(rename = "How-To")]
    HowTo,
    Wikimedia,
    Books,
    Other,
}

pub fn categorize(name: &str) -> Category {
    let n = name.to_lowercase();
    // Medical first so wikipedia_en_medicine does not fall into Wikimedia.
    if n.contains("medicine")
        || n == "wikem"
        || n.contains("ready.gov")
        || (n.starts_with("zimgit-")
            && ["water", "food", "disaster"].iter().any(|k| n.contains(k)))
    {
        return Category::Medical;
    }
    if ["stackoverflow", "askubuntu", "superuser", "serverfault"].contains(&n.as_str())
        || n.contains("stackexchange")
    {
        return Category::StackExchange;
    }
    if n.starts_with("devdocs_") || n == "freecodecamp" {
        return Category::DevDocs;
    }
    if n.starts_with("ted_")
        || [
            "crashcourse",
            "phet",
            "appropedia",
            "artofproblemsolving",
            "edutechwiki",
            "explainxkcd",
        ]
        .contains(&n.as_str())
    {
        return Category::Education;
    }
    // How-To before the wiki* catch-all so wikihow matches here.
    if ["wikihow", "ifixit"].contains(&n.as_str()) || n.contains("off-the-grid") {
        return Category::HowTo;
    }
    if n.starts_with("wiki") || n.starts_with("wikt") || n == "openstreetmap-wiki" {
        return Category::Wikimedia;
    }
    if ["gutenberg", "rationalwiki", "theworldfactbook"].contains(&n.as_str()) {
        return Category::Books;
    }
    Category::Other
}

static SLUG_STRIP: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\.stackexchange\.com_en_all.*$",
        r"\.com_en_all.*$",
        r"_en_all_maxi.*$",
        r"_en_all.*$",
        r"_en_maxi.*$",
        r"_en_2\d{3}.*$",
        r"_maxi_2\d{3}.*$",
        r"_2\d{3}-\d{2}$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

/// Stable identifier for an archive file:
/// `stackoverflow.com_en_all_2023-11.zim` → `stackoverflow`.
pub fn archive_id(filename: &str) -> String {
    let mut name = filename.strip_suffix(".zim").unwrap_or(filename).to_string();
    for re in SLUG_STRIP.iter() {
        name = re.replace(&name, "").into_owned();
    }
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    slug.trim_matches('-').to_string()
}

static DATE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_(\d{4}-\d{2})\.zim$").expect("static pattern"));

/// Split `wikipedia_en_all_2023-11.zim` into its date-stripped base and the
/// `YYYY-MM` stamp, when present.
pub fn split_zim_date(filename: &str) -> (String, Option<String>) {
    if let Some(caps) = DATE_SUFFIX.captures(filename) {
        let m = caps.get(0).expect("whole match");
        (filename[..m.start()].to_string(), Some(caps[1].to_string()))
    } else {
        (
            filename.strip_suffix(".zim").unwrap_or(filename).to_string(),
            None,
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveMeta {
    pub id: String,
    pub file: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub size: u64,
    #[serde(skip)]
    pub mtime: i64,
    pub entries: u64,
    pub title: String,
    pub description: String,
    pub language: String,
    pub publisher: String,
    pub date: String,
    pub flavor: String,
    pub has_icon: bool,
    pub category: Category,
}

/// One registered archive: metadata plus the lazily-opened native handle and
/// the per-archive title lock.
pub struct ArchiveEntry {
    meta: RwLock<ArchiveMeta>,
    handle: Mutex<Option<Arc<Zim>>>,
    pub title_lock: tokio::sync::RwLock<()>,
}

impl ArchiveEntry {
    fn new(meta: ArchiveMeta) -> Self {
        ArchiveEntry {
            meta: RwLock::new(meta),
            handle: Mutex::new(None),
            title_lock: tokio::sync::RwLock::new(()),
        }
    }

    pub fn meta(&self) -> ArchiveMeta {
        self.meta.read().unwrap().clone()
    }

    pub fn id(&self) -> String {
        self.meta.read().unwrap().id.clone()
    }

    pub fn set_entry_count(&self, count: u64) {
        self.meta.write().unwrap().entries = count;
    }

    /// Open (or reuse) the native handle. Opening itself needs no global
    /// lock; every *use* of the returned handle does.
    pub fn open_handle(&self) -> Result<Arc<Zim>, ZimiError> {
        let mut slot = self.handle.lock().unwrap();
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }
        let meta = self.meta();
        if !meta.path.exists() {
            return Err(ZimiError::ArchiveGone(meta.id));
        }
        let zim = Zim::new(&meta.path)
            .map_err(|e| ZimiError::Internal(format!("opening {}: {e}", meta.file)))?;
        let handle = Arc::new(zim);
        *slot = Some(handle.clone());
        Ok(handle)
    }

    fn close_handle(&self) {
        *self.handle.lock().unwrap() = None;
    }
}

#[derive(Debug, Default, Clone)]
pub struct RefreshReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub total: usize,
}

impl RefreshReport {
    pub fn library_changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.changed.is_empty()
    }
}

pub struct Registry {
    archive_dir: PathBuf,
    archives: RwLock<HashMap<String, Arc<ArchiveEntry>>>,
    /// Global lock for all native reads through registry-held handles.
    pub zim_lock: Arc<Mutex<()>>,
    generation: AtomicU64,
    state: Arc<StateStore>,
}

impl Registry {
    pub fn new(archive_dir: PathBuf, state: Arc<StateStore>) -> Self {
        Registry {
            archive_dir,
            archives: RwLock::new(HashMap::new()),
            zim_lock: Arc::new(Mutex::new(())),
            generation: AtomicU64::new(0),
            state,
        }
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Bumped on every refresh that changed the library; caches compare it.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ArchiveEntry>> {
        self.archives.read().unwrap().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.archives.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn entries(&self) -> Vec<Arc<ArchiveEntry>> {
        let map = self.archives.read().unwrap();
        let mut entries: Vec<_> = map.values().cloned().collect();
        entries.sort_by_key(|e| e.id());
        entries
    }

    pub fn len(&self) -> usize {
        self.archives.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rescan the archive directory, reconciling the registry with what is
    /// on disk. Metadata for unchanged files comes from the disk cache.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let dir = self.archive_dir.clone();
        let files = tokio::task::spawn_blocking(move || scan_dir(&dir))
            .await
            .context("refresh scan task")??;

        let mut cache = self.state.load_meta_cache();
        let mut report = RefreshReport::default();
        let mut seen_ids = Vec::new();
        let mut cache_dirty = false;

        for file in &files {
            let id = unique_id(&file.filename, &seen_ids);
            seen_ids.push(id.clone());

            let existing = self.get(&id);
            if let Some(entry) = &existing {
                let meta = entry.meta();
                if meta.size == file.size && meta.mtime == file.mtime {
                    continue;
                }
                report.changed.push(id.clone());
                entry.close_handle();
            }

            let cached = cache
                .get(&file.filename)
                .filter(|c| c.size == file.size && c.mtime == file.mtime)
                .cloned();

            let meta = match cached {
                Some(c) => meta_from_cache(&id, file, &c),
                None => {
                    let path = file.path.clone();
                    let raw = tokio::task::spawn_blocking(move || read_zim_metadata(&path))
                        .await
                        .context("metadata task")?;
                    let raw = match raw {
                        Ok(raw) => raw,
                        Err(err) => {
                            tracing::warn!("skipping corrupt archive {}: {err}", file.filename);
                            continue;
                        }
                    };
                    cache.insert(
                        file.filename.clone(),
                        CachedArchiveMeta {
                            name: id.clone(),
                            size: file.size,
                            mtime: file.mtime,
                            entry_count: 0,
                            title: raw.title.clone(),
                            description: raw.description.clone(),
                            language: raw.language.clone(),
                            publisher: raw.publisher.clone(),
                            date: raw.date.clone(),
                            flavor: raw.flavor.clone(),
                            has_icon: raw.has_icon,
                        },
                    );
                    cache_dirty = true;
                    meta_from_raw(&id, file, &raw)
                }
            };

            if existing.is_some() {
                let entry = existing.expect("checked above");
                *entry.meta.write().unwrap() = meta;
            } else {
                report.added.push(id.clone());
                self.archives
                    .write()
                    .unwrap()
                    .insert(id.clone(), Arc::new(ArchiveEntry::new(meta)));
            }
        }

        // Drop archives whose file vanished.
        let current: Vec<String> = self.ids();
        for id in current {
            if !seen_ids.contains(&id) {
                if let Some(entry) = self.archives.write().unwrap().remove(&id) {
                    entry.close_handle();
                }
                report.removed.push(id);
            }
        }

        // Prune cache rows for files no longer on disk.
        let on_disk: Vec<&String> = files.iter().map(|f| &f.filename).collect();
        let before = cache.len();
        cache.retain(|filename, _| on_disk.contains(&filename));
        if cache_dirty || cache.len() != before {
            self.state.save_meta_cache(&cache);
        }

        report.total = self.len();
        if report.library_changed() {
            self.generation.fetch_add(1, Ordering::AcqRel);
            tracing::info!(
                "library refresh: {} archives (+{} -{} ~{})",
                report.total,
                report.added.len(),
                report.removed.len(),
                report.changed.len()
            );
        }
        Ok(report)
    }

    /// Persist an updated entry count (learned during an index build) back
    /// into the registry and the metadata cache.
    pub fn record_entry_count(&self, id: &str, count: u64) {
        if let Some(entry) = self.get(id) {
            entry.set_entry_count(count);
            let meta = entry.meta();
            let mut cache = self.state.load_meta_cache();
            if let Some(cached) = cache.get_mut(&meta.file) {
                cached.entry_count = count;
                self.state.save_meta_cache(&cache);
            }
        }
    }

    /// Run `f` against the archive's native handle on a blocking thread,
    /// holding the global archive lock for the duration.
    pub async fn with_native<R, F>(&self, entry: Arc<ArchiveEntry>, f: F) -> Result<R, ZimiError>
    where
        R: Send + 'static,
        F: FnOnce(&Zim) -> Result<R, ZimiError> + Send + 'static,
    {
        let handle = entry.open_handle()?;
        let lock = self.zim_lock.clone();
        tokio::task::spawn_blocking(move || {
            // A poisoned lock means a native call aborted mid-operation;
            // no partial state may survive that. Fail fast.
            let _guard = lock.lock().unwrap_or_else(|_| {
                tracing::error!("global archive lock poisoned; aborting");
                std::process::abort();
            });
            f(&handle)
        })
        .await
        .map_err(|e| ZimiError::Internal(format!("native task: {e}")))?
    }

    /// Touch each archive's native handle so first queries skip the open
    /// cost. Runs in the background right after startup.
    pub async fn prewarm(&self) {
        for entry in self.entries() {
            let id = entry.id();
            let result = self
                .with_native(entry, |zim| {
                    let _first = zim.iterate_by_urls().next();
                    Ok(())
                })
                .await;
            if let Err(err) = result {
                tracing::warn!("prewarm failed for {id}: {err}");
            }
        }
    }
}

fn unique_id(filename: &str, taken: &[String]) -> String {
    let id = archive_id(filename);
    if !taken.contains(&id) {
        return id;
    }
    // Identifier collision between two files: fall back to the full stem.
    let full = filename.strip_suffix(".zim").unwrap_or(filename).to_lowercase();
    tracing::warn!("archive id collision on '{id}', using '{full}'");
    full
}

struct ScannedFile {
    filename: String,
    path: PathBuf,
    size: u64,
    mtime: i64,
}

fn scan_dir(dir: &Path) -> Result<Vec<ScannedFile>> {
    let mut files = Vec::new();
    let read = match std::fs::read_dir(dir) {
        Ok(read) => read,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(err) => return Err(err).context("reading archive dir"),
    };
    for dent in read {
        let dent = dent?;
        let path = dent.path();
        let filename = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) if n.ends_with(".zim") => n.to_string(),
            _ => continue,
        };
        let meta = dent.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        files.push(ScannedFile {
            filename,
            path,
            size: meta.len(),
            mtime,
        });
    }
    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(files)
}

fn meta_from_cache(id: &str, file: &ScannedFile, cached: &CachedArchiveMeta) -> ArchiveMeta {
    ArchiveMeta {
        id: id.to_string(),
        file: file.filename.clone(),
        path: file.path.clone(),
        size: file.size,
        mtime: file.mtime,
        entries: cached.entry_count,
        title: cached.title.clone(),
        description: cached.description.clone(),
        language: cached.language.clone(),
        publisher: cached.publisher.clone(),
        date: cached.date.clone(),
        flavor: cached.flavor.clone(),
        has_icon: cached.has_icon,
        category: categorize(id),
    }
}

fn meta_from_raw(id: &str, file: &ScannedFile, raw: &RawZimMeta) -> ArchiveMeta {
    let date = if raw.date.is_empty() {
        split_zim_date(&file.filename).1.unwrap_or_default()
    } else {
        raw.date.clone()
    };
    ArchiveMeta {
        id: id.to_string(),
        file: file.filename.clone(),
        path: file.path.clone(),
        size: file.size,
        mtime: file.mtime,
        entries: 0,
        title: if raw.title.is_empty() {
            id.to_string()
        } else {
            raw.title.clone()
        },
        description: raw.description.clone(),
        language: raw.language.clone(),
        publisher: raw.publisher.clone(),
        date,
        flavor: raw.flavor.clone(),
        has_icon: raw.has_icon,
        category: categorize(id),
    }
}

// ── Native access helpers ──
//
// Everything that touches the `zim` crate lives below, so the rest of the
// crate deals only in paths, titles, and bytes.

/// One indexable entry, as streamed to the title-index builder. `(cluster,
/// blob)` pin the content location so later reads skip the directory walk.
#[derive(Debug, Clone)]
pub struct EntryRow {
    pub path: String,
    pub title: String,
    pub kind: EntryKind,
    pub mime: String,
    pub cluster: u32,
    pub blob: u32,
}

#[derive(Debug, Default, Clone)]
pub struct RawZimMeta {
    pub title: String,
    pub description: String,
    pub language: String,
    pub publisher: String,
    pub date: String,
    pub flavor: String,
    pub has_icon: bool,
}

fn mime_str(entry: &DirectoryEntry) -> Option<String> {
    match &entry.mime_type {
        MimeType::Type(s) => Some(s.clone()),
        _ => None,
    }
}

pub fn entry_path(entry: &DirectoryEntry) -> String {
    format!("{}/{}", entry.namespace.as_byte() as char, entry.url)
}

/// Read an archive's `M`-namespace metadata without a full directory walk.
/// `iterate_by_urls` yields entries in namespace order, so iteration stops
/// once the metadata namespace has been passed.
pub fn read_zim_metadata(path: &Path) -> Result<RawZimMeta> {
    let zim = Zim::new(path).map_err(|e| anyhow::anyhow!("open failed: {e}"))?;
    let mut meta = RawZimMeta::default();
    for entry in zim.iterate_by_urls() {
        let entry = entry.map_err(|e| anyhow::anyhow!("directory read: {e}"))?;
        if entry.namespace.as_byte() > b'M' {
            break;
        }
        if entry.namespace.as_byte() != b'M' {
            continue;
        }
        let value = || -> Option<String> {
            let (cluster, blob) = match entry.target {
                Some(Target::Cluster(c, b)) => (c, b),
                _ => return None,
            };
            let bytes = read_blob(&zim, cluster, blob).ok()?;
            Some(String::from_utf8_lossy(&bytes).trim().to_string())
        };
        match entry.url.as_str() {
            "Title" => meta.title = value().unwrap_or_default(),
            "Description" => meta.description = value().unwrap_or_default(),
            "Language" => meta.language = value().unwrap_or_default(),
            "Publisher" => meta.publisher = value().unwrap_or_default(),
            "Date" => meta.date = value().unwrap_or_default(),
            "Flavour" => meta.flavor = value().unwrap_or_default(),
            url if url.starts_with("Illustration_48x48") => meta.has_icon = true,
            _ => {}
        }
    }
    Ok(meta)
}

/// The archive's 48x48 illustration bytes, if present.
pub fn read_illustration(zim: &Zim) -> Option<Vec<u8>> {
    for entry in zim.iterate_by_urls() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if entry.namespace.as_byte() > b'M' {
            break;
        }
        if entry.namespace.as_byte() == b'M' && entry.url.starts_with("Illustration_48x48") {
            if let Some(Target::Cluster(cluster, blob)) = entry.target {
                return read_blob(zim, cluster, blob).ok();
            }
        }
    }
    None
}

pub fn read_blob(zim: &Zim, cluster: u32, blob: u32) -> Result<Vec<u8>> {
    let cluster = zim
        .get_cluster(cluster)
        .map_err(|e| anyhow::anyhow!("cluster read: {e}"))?;
    let guard = cluster
        .read()
        .map_err(|e| anyhow::anyhow!("cluster read: {e}"))?;
    let blob = guard
        .blob(blob)
        .map_err(|e| anyhow::anyhow!("blob read: {e}"))?;
    Ok(blob.to_vec())
}

/// Asset extensions excluded from the article namespace during indexing;
/// they are indexed with kind `other` so `/w/` lookups still resolve.
fn asset_kind(path: &str) -> Option<EntryKind> {
    let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "css" | "js" | "json" | "woff" | "woff2" | "ttf" | "eot" | "otf" | "map" => {
            Some(EntryKind::Other)
        }
        _ => None,
    }
}

/// Walk every content entry, streaming rows to `emit`. Returns the number of
/// rows emitted. Redirect and metadata entries are skipped; `stop` is
/// checked between entries so builds cancel promptly.
pub fn scan_entries(
    zim: &Zim,
    stop: &dyn Fn() -> bool,
    mut emit: impl FnMut(EntryRow),
) -> Result<u64> {
    let mut count = 0u64;
    for entry in zim.iterate_by_urls() {
        if stop() {
            anyhow::bail!("scan cancelled");
        }
        let entry = entry.map_err(|e| anyhow::anyhow!("directory read: {e}"))?;
        if matches!(
            entry.namespace,
            zim::Namespace::Metadata
                | zim::Namespace::FulltextIndex
                | zim::Namespace::CategoriesText
                | zim::Namespace::CategoriesArticleList
                | zim::Namespace::CategoriesArticle
        ) {
            continue;
        }
        let (cluster, blob) = match entry.target {
            Some(Target::Cluster(c, b)) => (c, b),
            _ => continue, // redirects resolve at read time
        };
        let path = entry_path(&entry);
        let mime = mime_str(&entry);
        let kind = asset_kind(&path).unwrap_or_else(|| {
            let by_mime = EntryKind::from_mime(mime.as_deref());
            if by_mime == EntryKind::Other && entry.namespace.as_byte() == b'I' {
                EntryKind::Image
            } else {
                by_mime
            }
        });
        let title = if entry.title.is_empty() {
            entry.url.clone()
        } else {
            entry.title.clone()
        };
        emit(EntryRow {
            path,
            title,
            kind,
            mime: mime.unwrap_or_default(),
            cluster,
            blob,
        });
        count += 1;
    }
    Ok(count)
}

/// A resolved entry: either content bytes coordinates or a redirect.
pub enum FoundEntry {
    Content {
        path: String,
        title: String,
        mime: Option<String>,
        cluster: u32,
        blob: u32,
    },
    Redirect {
        target_path: String,
    },
}

/// Linear-scan lookup by path, used when the title index cannot answer
/// (missing, stale, or a namespace-fallback probe). Must run under the
/// global archive lock.
pub fn find_entry(zim: &Zim, path: &str) -> Option<FoundEntry> {
    for entry in zim.iterate_by_urls() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if entry_path(&entry) != path {
            continue;
        }
        return match entry.target {
            Some(Target::Cluster(cluster, blob)) => Some(FoundEntry::Content {
                path: entry_path(&entry),
                title: entry.title.clone(),
                mime: mime_str(&entry),
                cluster,
                blob,
            }),
            Some(Target::Redirect(idx)) => {
                let target = zim.get_by_url_index(idx).ok()?;
                Some(FoundEntry::Redirect {
                    target_path: entry_path(&target),
                })
            }
            None => None,
        };
    }
    None
}

/// Result of a direct native fetch through the directory walk.
pub enum NativeFetch {
    Content {
        path: String,
        title: String,
        mime: Option<String>,
        bytes: Vec<u8>,
    },
    Redirect {
        target_path: String,
    },
    Missing,
}

/// Fetch an entry's bytes by path, probing namespace fallbacks and
/// optionally following redirect chains. Must run under the global archive
/// lock.
pub fn fetch_entry_native(zim: &Zim, path: &str, follow_redirects: bool) -> NativeFetch {
    let mut probes = vec![path.to_string()];
    probes.extend(namespace_fallbacks(path));
    for probe in probes {
        let mut current = probe;
        // Bounded redirect chase; loops in broken archives stop here.
        for _ in 0..4 {
            match find_entry(zim, &current) {
                Some(FoundEntry::Content {
                    path,
                    title,
                    mime,
                    cluster,
                    blob,
                }) => {
                    let bytes = match read_blob(zim, cluster, blob) {
                        Ok(bytes) => bytes,
                        Err(_) => return NativeFetch::Missing,
                    };
                    return NativeFetch::Content {
                        path,
                        title,
                        mime,
                        bytes,
                    };
                }
                Some(FoundEntry::Redirect { target_path }) => {
                    if !follow_redirects {
                        return NativeFetch::Redirect { target_path };
                    }
                    current = target_path;
                }
                None => break,
            }
        }
    }
    NativeFetch::Missing
}

/// Alternative paths for old/new namespace layouts: `A/`, `I/`, `C/`, `-/`
/// prefixes stripped or added.
pub fn namespace_fallbacks(path: &str) -> Vec<String> {
    const PREFIXES: [&str; 4] = ["A/", "I/", "C/", "-/"];
    for prefix in PREFIXES {
        if let Some(rest) = path.strip_prefix(prefix) {
            return vec![rest.to_string()];
        }
    }
    PREFIXES.iter().map(|p| format!("{p}{path}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_id_strips_common_patterns() {
        assert_eq!(archive_id("stackoverflow.com_en_all_2023-11.zim"), "stackoverflow");
        assert_eq!(archive_id("wikipedia_en_all_maxi_2024-01.zim"), "wikipedia");
        assert_eq!(archive_id("wiktionary_en_all_nopic_2023-10.zim"), "wiktionary");
        assert_eq!(archive_id("gutenberg_en_all_2023-08.zim"), "gutenberg");
        assert_eq!(archive_id("devdocs_en_rust_2024-02.zim"), "devdocs_en_rust_2024-02");
        assert_eq!(archive_id("zimgit-water_en_2021-03.zim"), "zimgit-water_en_2021-03");
    }

    #[test]
    fn archive_id_sanitizes() {
        assert_eq!(archive_id("My Archive!.zim"), "my-archive");
    }

    #[test]
    fn split_date() {
        let (base, date) = split_zim_date("wikipedia_en_all_2023-11.zim");
        assert_eq!(base, "wikipedia_en_all");
        assert_eq!(date.as_deref(), Some("2023-11"));
        let (base, date) = split_zim_date("nodate.zim");
        assert_eq!(base, "nodate");
        assert!(date.is_none());
    }

    #[test]
    fn categorize_rules_ordered() {
        assert_eq!(categorize("wikipedia"), Category::Wikimedia);
        assert_eq!(categorize("wikipedia_en_medicine"), Category::Medical);
        assert_eq!(categorize("stackoverflow"), Category::StackExchange);
        assert_eq!(categorize("3dprinting.stackexchange"), Category::StackExchange);
        assert_eq!(categorize("devdocs_en_rust"), Category::DevDocs);
        assert_eq!(categorize("wikihow"), Category::HowTo);
        assert_eq!(categorize("gutenberg"), Category::Books);
        assert_eq!(categorize("apod"), Category::Other);
    }

    #[test]
    fn entry_kind_from_mime() {
        assert_eq!(EntryKind::from_mime(Some("text/html")), EntryKind::Article);
        assert_eq!(
            EntryKind::from_mime(Some("text/html; charset=utf-8")),
            EntryKind::Article
        );
        assert_eq!(EntryKind::from_mime(Some("image/png")), EntryKind::Image);
        assert_eq!(EntryKind::from_mime(Some("video/webm")), EntryKind::Media);
        assert_eq!(EntryKind::from_mime(Some("text/css")), EntryKind::Other);
        assert_eq!(EntryKind::from_mime(None), EntryKind::Other);
    }

    #[test]
    fn kind_roundtrip() {
        for kind in [
            EntryKind::Article,
            EntryKind::Image,
            EntryKind::Media,
            EntryKind::Other,
        ] {
            assert_eq!(EntryKind::from_str(kind.as_str()), kind);
        }
    }

    #[test]
    fn namespace_fallback_paths() {
        assert_eq!(namespace_fallbacks("A/Water"), vec!["Water"]);
        let added = namespace_fallbacks("Water");
        assert!(added.contains(&"A/Water".to_string()));
        assert!(added.contains(&"C/Water".to_string()));
    }

    #[test]
    fn unique_id_collision_falls_back_to_stem() {
        let taken = vec!["wikipedia".to_string()];
        let id = unique_id("wikipedia_en_all_2023-11.zim", &taken);
        assert_eq!(id, "wikipedia_en_all_2023-11");
    }

    #[tokio::test]
    async fn refresh_on_missing_dir_is_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let state = Arc::new(StateStore::new(tmp.path().join("data")));
        let registry = Registry::new(tmp.path().join("no-such-dir"), state);
        let report = registry.refresh().await.unwrap();
        assert_eq!(report.total, 0);
        assert!(!report.library_changed());
    }

    #[tokio::test]
    async fn refresh_skips_non_zim_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("zims");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("notes.txt"), "hello").unwrap();
        let state = Arc::new(StateStore::new(tmp.path().join("data")));
        let registry = Registry::new(dir, state);
        let report = registry.refresh().await.unwrap();
        assert_eq!(report.total, 0);
    }

    #[tokio::test]
    async fn refresh_drops_corrupt_archive() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("zims");
        std::fs::create_dir_all(&dir).unwrap();
        // Not a real ZIM file: metadata read fails, archive is skipped.
        std::fs::write(dir.join("broken_2023-01.zim"), b"not a zim").unwrap();
        let state = Arc::new(StateStore::new(tmp.path().join("data")));
        let registry = Registry::new(dir, state);
        let report = registry.refresh().await.unwrap();
        assert_eq!(report.total, 0);
        assert!(registry.get("broken").is_none());
    }
}
