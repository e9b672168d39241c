//! Cross-archive URL resolution.
//!
//! Maps external site URLs (`https://en.wikipedia.org/wiki/Water`) to an
//! installed archive and entry path, so the reader can rewrite outbound
//! links to stay offline. A host map is rebuilt from archive metadata on
//! every library change; candidate entry paths are derived per host family
//! and checked against the title index (fast, no native code).

use futures_util::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use crate::archive::ArchiveMeta;
use crate::title_index::TitleStore;

/// Concurrent existence probes for batch resolution.
const BATCH_CONCURRENCY: usize = 8;
pub const MAX_BATCH_URLS: usize = 100;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Resolved {
    pub archive: String,
    pub path: String,
}

pub struct Resolver {
    /// host → archive id, only for installed archives.
    hosts: RwLock<HashMap<String, String>>,
}

static FILENAME_DOMAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([a-zA-Z0-9.-]+\.[a-z]{2,})_").expect("static pattern"));
static WIKI_HOST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w{2,3})\.(wiki\w+\.org)$").expect("static pattern"));
static NAMESPACE_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][a-z]+:").expect("static pattern"));

impl Resolver {
    pub fn new() -> Self {
        Resolver {
            hosts: RwLock::new(HashMap::new()),
        }
    }

    pub fn host_map(&self) -> HashMap<String, String> {
        self.hosts.read().unwrap().clone()
    }

    /// Rebuild the host map from the registry's current archive set.
    pub fn rebuild(&self, archives: &[ArchiveMeta]) {
        let mut map = HashMap::new();

        // 1. Domains embedded in filenames: stackoverflow.com_en_all_*.zim.
        for meta in archives {
            if let Some(caps) = FILENAME_DOMAIN_RE.captures(&meta.file) {
                add_domain(&mut map, &caps[1], &meta.id);
            }
        }

        // 2. Wikimedia projects keyed by language metadata.
        for meta in archives {
            if map.values().any(|v| v == &meta.id) {
                continue;
            }
            let lang = language_code(&meta.language);
            for project in [
                "wikipedia",
                "wiktionary",
                "wikiquote",
                "wikibooks",
                "wikivoyage",
                "wikiversity",
                "wikinews",
            ] {
                if meta.id == project || meta.id.starts_with(&format!("{project}_")) {
                    add_domain(&mut map, &format!("{lang}.{project}.org"), &meta.id);
                }
            }
        }

        // 3. Name-based inference for anything still unmapped.
        for meta in archives {
            if map.values().any(|v| v == &meta.id) {
                continue;
            }
            if meta.id.starts_with("zimgit") || meta.id.contains("_en_") {
                continue;
            }
            for tld in [".com", ".org", ".io", ".net"] {
                add_domain(&mut map, &format!("{}{tld}", meta.id), &meta.id);
            }
        }

        tracing::info!(
            "host map: {} hosts -> {} archives",
            map.len(),
            map.values().collect::<std::collections::HashSet<_>>().len()
        );
        *self.hosts.write().unwrap() = map;
    }

    /// Resolve one URL to an installed archive entry. Existence checks go
    /// through the title index only.
    pub async fn resolve(&self, titles: &TitleStore, url: &str) -> Option<Resolved> {
        let (host, path) = split_url(url)?;
        let archive_id = {
            let map = self.hosts.read().unwrap();
            map.get(&host)
                .or_else(|| map.get(host.strip_prefix("www.").unwrap_or(&host)))
                .cloned()
        }?;

        for candidate in candidate_paths(&host, &path) {
            if titles.exists(&archive_id, &candidate).await {
                return Some(Resolved {
                    archive: archive_id,
                    path: candidate,
                });
            }
        }
        None
    }

    /// Resolve a batch of URLs with bounded concurrency. The result map has
    /// one key per input URL; unresolvable URLs map to `None`.
    pub async fn resolve_batch(
        self: &Arc<Self>,
        titles: Arc<TitleStore>,
        urls: Vec<String>,
    ) -> HashMap<String, Option<Resolved>> {
        stream::iter(urls.into_iter().map(|url| {
            let resolver = self.clone();
            let titles = titles.clone();
            async move {
                let resolved = resolver.resolve(&titles, &url).await;
                (url, resolved)
            }
        }))
        .buffer_unordered(BATCH_CONCURRENCY)
        .collect()
        .await
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

fn add_domain(map: &mut HashMap<String, String>, domain: &str, id: &str) {
    let domain = domain.trim().to_lowercase();
    if domain.is_empty() || !domain.contains('.') {
        return;
    }
    map.entry(domain.clone()).or_insert_with(|| id.to_string());
    // www. sibling.
    if let Some(bare) = domain.strip_prefix("www.") {
        map.entry(bare.to_string()).or_insert_with(|| id.to_string());
    } else {
        map.entry(format!("www.{domain}"))
            .or_insert_with(|| id.to_string());
    }
    // Mobile Wikimedia variant: en.wikipedia.org → en.m.wikipedia.org.
    if let Some(caps) = WIKI_HOST_RE.captures(&domain) {
        map.entry(format!("{}.m.{}", &caps[1], &caps[2]))
            .or_insert_with(|| id.to_string());
    }
}

fn language_code(language: &str) -> String {
    // ZIM metadata uses ISO 639-3 ("eng"); hosts use 639-1 ("en").
    let lang = language.trim().to_lowercase();
    match lang.as_str() {
        "eng" | "" => "en".to_string(),
        "deu" | "ger" => "de".to_string(),
        "fra" | "fre" => "fr".to_string(),
        "spa" => "es".to_string(),
        "ita" => "it".to_string(),
        "por" => "pt".to_string(),
        "rus" => "ru".to_string(),
        "zho" | "chi" => "zh".to_string(),
        "jpn" => "ja".to_string(),
        other => other.chars().take(2).collect(),
    }
}

/// `https://en.wikipedia.org/wiki/Water#x` → (`en.wikipedia.org`, `wiki/Water`).
fn split_url(url: &str) -> Option<(String, String)> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let rest = rest.split('#').next().unwrap_or(rest);
    let rest = rest.split('?').next().unwrap_or(rest);
    let (host, path) = match rest.split_once('/') {
        Some((h, p)) => (h, p),
        None => (rest, ""),
    };
    let host = host.split('@').last().unwrap_or(host);
    let host = host.split(':').next().unwrap_or(host).to_lowercase();
    if host.is_empty() {
        return None;
    }
    let path = urlencoding::decode(path)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| path.to_string());
    Some((host, path))
}

/// Candidate entry paths for a host family, most likely first.
fn candidate_paths(host: &str, url_path: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    let push = |v: &mut Vec<String>, p: String| {
        if !p.is_empty() && !v.contains(&p) {
            v.push(p);
        }
    };

    let is_wikimedia = [
        "wikipedia.org",
        "wiktionary.org",
        "wikiquote.org",
        "wikibooks.org",
        "wikivoyage.org",
        "wikiversity.org",
        "wikinews.org",
    ]
    .iter()
    .any(|d| host.ends_with(d));

    if is_wikimedia {
        // /wiki/Article_Name → A/Article_Name.
        let rest = url_path.strip_prefix("wiki/").unwrap_or(url_path);
        push(&mut candidates, format!("A/{rest}"));
        push(&mut candidates, rest.to_string());
        // Strip project namespaces (Portal:, Category:, ...).
        let stripped = NAMESPACE_PREFIX_RE.replace(rest, "").into_owned();
        if stripped != rest {
            push(&mut candidates, format!("A/{stripped}"));
            push(&mut candidates, stripped);
        }
    } else if host.ends_with("stackexchange.com")
        || host.ends_with("stackoverflow.com")
        || host.ends_with("serverfault.com")
        || host.ends_with("superuser.com")
        || host.ends_with("askubuntu.com")
    {
        push(&mut candidates, format!("A/{url_path}"));
        push(&mut candidates, url_path.to_string());
    } else if host.ends_with("rationalwiki.org") || host.ends_with("appropedia.org") {
        // MediaWiki without the A/ prefix.
        let rest = url_path.strip_prefix("wiki/").unwrap_or(url_path);
        push(&mut candidates, rest.to_string());
        push(&mut candidates, format!("A/{rest}"));
    } else {
        push(&mut candidates, format!("A/{url_path}"));
        push(&mut candidates, url_path.to_string());
        // Some packagers prefix entry paths with the domain.
        push(&mut candidates, format!("{host}/{url_path}"));
    }
    candidates
}
