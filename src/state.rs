//! Persistent on-disk state under the data directory.
//!
//! Files:
//!
//! | File | Contents |
//! |---|---|
//! | `cache.json` | Last archive metadata snapshot, keyed by filename |
//! | `password` | `salt$hash`: random hex salt and salted SHA-256 of the management password |
//! | `collections.json` | `{ name: [archive_id, …] }` |
//! | `history.json` | Append-only ring of the last 1000 library events |
//! | `source_ranks.json` | Optional per-archive rank overrides |
//! | `titles/<id>.db` | Per-archive title indexes (see `title_index`) |
//!
//! Every write goes to `<file>.tmp` followed by an atomic rename, so a crash
//! mid-write leaves the previous file intact. Legacy flat files at the
//! archive dir root (`.zimi_password`, `.zimi_collections.json`,
//! `.zimi_cache.json`) are migrated on first run.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const HISTORY_MAX: usize = 1000;

/// Serialize `value` to `path` via a temp file + rename.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, data)
        .with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let data = std::fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

/// Cached per-file archive metadata, so restarts skip re-reading archives
/// whose (size, mtime) did not change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedArchiveMeta {
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    pub entry_count: u64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub publisher: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub flavor: String,
    #[serde(default)]
    pub has_icon: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaCacheFile {
    pub version: u32,
    pub generated: String,
    pub files: HashMap<String, CachedArchiveMeta>,
}

pub const META_CACHE_VERSION: u32 = 1;

/// A library change worth remembering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub ts: i64,
    /// `downloaded`, `updated`, or `deleted`.
    pub kind: String,
    pub filename: String,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub archive_id: String,
}

/// Owner of all JSON state files. Writers lock; readers get clones.
pub struct StateStore {
    data_dir: PathBuf,
    collections_lock: Mutex<()>,
    history_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(data_dir: PathBuf) -> Self {
        StateStore {
            data_dir,
            collections_lock: Mutex::new(()),
            history_lock: Mutex::new(()),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    // ── metadata cache ──

    pub fn load_meta_cache(&self) -> HashMap<String, CachedArchiveMeta> {
        match read_json::<MetaCacheFile>(&self.path("cache.json")) {
            Some(f) if f.version == META_CACHE_VERSION => f.files,
            _ => HashMap::new(),
        }
    }

    pub fn save_meta_cache(&self, files: &HashMap<String, CachedArchiveMeta>) {
        let file = MetaCacheFile {
            version: META_CACHE_VERSION,
            generated: chrono::Utc::now().to_rfc3339(),
            files: files.clone(),
        };
        if let Err(err) = atomic_write_json(&self.path("cache.json"), &file) {
            tracing::warn!("could not save metadata cache: {err}");
        }
    }

    // ── collections ──

    pub fn load_collections(&self) -> HashMap<String, Vec<String>> {
        read_json(&self.path("collections.json")).unwrap_or_default()
    }

    pub fn save_collection(&self, name: &str, archives: Vec<String>) -> Result<()> {
        let _guard = self.collections_lock.lock().unwrap();
        let mut all = self.load_collections();
        all.insert(name.to_string(), archives);
        atomic_write_json(&self.path("collections.json"), &all)
    }

    /// Returns false when the collection did not exist.
    pub fn delete_collection(&self, name: &str) -> Result<bool> {
        let _guard = self.collections_lock.lock().unwrap();
        let mut all = self.load_collections();
        if all.remove(name).is_none() {
            return Ok(false);
        }
        atomic_write_json(&self.path("collections.json"), &all)?;
        Ok(true)
    }

    // ── history ──

    pub fn load_history(&self) -> Vec<HistoryEvent> {
        read_json(&self.path("history.json")).unwrap_or_default()
    }

    /// Prepend an event, keeping the newest `HISTORY_MAX`.
    pub fn append_history(&self, event: HistoryEvent) {
        let _guard = self.history_lock.lock().unwrap();
        let mut events = self.load_history();
        events.insert(0, event);
        events.truncate(HISTORY_MAX);
        if let Err(err) = atomic_write_json(&self.path("history.json"), &events) {
            tracing::warn!("could not write history: {err}");
        }
    }

    // ── management password ──

    /// Stored credential (`salt$hash`), from env (salted and hashed on
    /// read) or the password file. The salt travels inside the credential
    /// string, so verification never needs a second lookup.
    pub fn password_hash(&self, env_password: Option<&str>) -> Option<String> {
        if let Some(pw) = env_password {
            return Some(new_stored_password(pw));
        }
        let stored = std::fs::read_to_string(self.path("password")).ok()?;
        let trimmed = stored.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }

    /// Persist (or clear, with an empty string) the salted password hash.
    pub fn set_password(&self, password: &str) -> Result<()> {
        let content = if password.is_empty() {
            String::new()
        } else {
            new_stored_password(password)
        };
        std::fs::create_dir_all(&self.data_dir)?;
        let tmp = self.path("password.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, self.path("password"))?;
        tracing::info!(
            "manage password {}",
            if password.is_empty() { "cleared" } else { "set" }
        );
        Ok(())
    }

    // ── source rank overrides ──

    pub fn load_rank_overrides(&self) -> HashMap<String, i64> {
        read_json(&self.path("source_ranks.json")).unwrap_or_default()
    }
}

/// SHA-256 of `salt:password`, hex-encoded.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Build a `salt$hash` credential with a fresh random salt.
pub fn new_stored_password(password: &str) -> String {
    let salt = generate_salt();
    let hash = hash_password(password, &salt);
    format!("{salt}${hash}")
}

fn generate_salt() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Verify a presented password against a stored `salt$hash` credential.
/// Credentials without a salt separator are unsalted SHA-256 from installs
/// migrated off the flat-file layout; they keep verifying until the
/// password is next set.
pub fn password_matches(presented: &str, stored: &str) -> bool {
    let computed = match stored.split_once('$') {
        Some((salt, _)) => format!("{salt}${}", hash_password(presented, salt)),
        None => sha256_hex(presented),
    };
    // Compare without short-circuiting on the first differing byte.
    if computed.len() != stored.len() {
        return false;
    }
    computed
        .bytes()
        .zip(stored.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Move legacy flat files from the archive dir root into the data dir.
pub fn migrate_legacy_files(archive_dir: &Path, data_dir: &Path) {
    let migrations = [
        (".zimi_password", "password"),
        (".zimi_collections.json", "collections.json"),
        (".zimi_cache.json", "cache.json"),
    ];
    for (old_name, new_name) in migrations {
        let old_path = archive_dir.join(old_name);
        let new_path = data_dir.join(new_name);
        if old_path.exists() && !new_path.exists() {
            if std::fs::create_dir_all(data_dir).is_ok()
                && std::fs::rename(&old_path, &new_path).is_ok()
            {
                tracing::info!("migrated {} -> {}", old_name, new_name);
            }
        }
    }
}
