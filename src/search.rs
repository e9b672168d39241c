//! Two-phase cross-archive search.
//!
//! **Phase 1 (title)** fans out over every archive in scope in parallel:
//! each task takes that archive's title read lock, consults the suggestion
//! cache, and queries the title store (prefix on the first token, plus a
//! token query for multi-word input). The whole phase completes or times
//! out within a hard 800 ms budget; whatever merged by then proceeds.
//!
//! **Phase 2 (deep)** is skipped for `fast` requests. Archives are visited
//! serially in `(source_rank desc, id asc)` order under the global archive
//! lock: token candidates from the title store have their bodies fetched
//! and verified to contain every query token, and surviving hits carry a
//! content score. The phase honors whatever remains of the request budget.
//!
//! Merged hits are deduplicated by `(archive, canonical path)`, scored,
//! ordered deterministically, truncated to the limit, and only then have
//! snippets and thumbnails filled in.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::archive::{ArchiveEntry, Category, NativeFetch, Registry};
use crate::cache::{
    search_key, TtlLru, RESULT_CACHE_CAP, RESULT_CACHE_TTL, SUGGEST_CACHE_CAP, SUGGEST_CACHE_TTL,
};
use crate::error::ZimiError;
use crate::reader::{effective_mime, extract_snippet, extract_thumbnail, strip_html};
use crate::title_index::{TitleHit, TitleStore};

/// Hard budget for the parallel title phase.
pub const PHASE1_BUDGET: Duration = Duration::from_millis(800);
/// Default total search budget.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(12);
pub const MAX_SEARCH_LIMIT: usize = 50;
/// Candidates fetched per archive in the deep phase.
const DEEP_CANDIDATES_PER_ARCHIVE: usize = 30;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "how", "i",
    "in", "is", "it", "its", "my", "not", "of", "on", "or", "so", "that", "the", "this", "to",
    "was", "we", "what", "when", "where", "which", "who", "will", "with", "you",
];

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    /// `None` means all archives; otherwise an explicit id list (a single
    /// archive or a resolved collection).
    pub scope: Option<Vec<String>>,
    pub fast: bool,
    pub timeout: Duration,
    pub include_snippets: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            limit: 5,
            scope: None,
            fast: false,
            timeout: DEFAULT_TIMEOUT,
            include_snippets: true,
        }
    }
}

/// How a hit was found; feeds the title-quality score floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HitVia {
    Title,
    Content,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub archive: String,
    pub path: String,
    pub title: String,
    pub kind: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub source_rank: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub results: Vec<SearchHit>,
    /// `"title"` when only phase 1 ran, `"full"` otherwise.
    pub phase: &'static str,
    pub partial: bool,
    pub elapsed_ms: u64,
    pub by_source: HashMap<String, usize>,
}

/// One suggestion row (also the cached unit for autocomplete).
#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub archive: String,
    pub path: String,
    pub title: String,
}

pub struct SearchEngine {
    registry: Arc<Registry>,
    titles: Arc<TitleStore>,
    result_cache: TtlLru<u64, SearchOutcome>,
    suggest_cache: TtlLru<(String, String), Vec<Suggestion>>,
    rank_overrides: std::sync::RwLock<HashMap<String, i64>>,
}

impl SearchEngine {
    pub fn new(registry: Arc<Registry>, titles: Arc<TitleStore>) -> Self {
        SearchEngine {
            registry,
            titles,
            result_cache: TtlLru::new(RESULT_CACHE_CAP, RESULT_CACHE_TTL),
            suggest_cache: TtlLru::new(SUGGEST_CACHE_CAP, SUGGEST_CACHE_TTL),
            rank_overrides: std::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn set_rank_overrides(&self, overrides: HashMap<String, i64>) {
        *self.rank_overrides.write().unwrap() = overrides;
    }

    /// Drop every cached result and suggestion; called on library changes.
    pub fn invalidate_caches(&self) {
        self.result_cache.clear();
        self.suggest_cache.clear();
    }

    pub fn result_cache_len(&self) -> usize {
        self.result_cache.len()
    }

    fn source_rank(&self, id: &str, category: Category) -> i64 {
        if let Some(rank) = self.rank_overrides.read().unwrap().get(id) {
            return *rank;
        }
        if id.starts_with("wikipedia") {
            100
        } else if id.starts_with("wiktionary") || id.starts_with("wikiquote") {
            90
        } else if category == Category::StackExchange {
            80
        } else if category == Category::DevDocs {
            70
        } else {
            50
        }
    }

    fn scoped_archives(
        &self,
        scope: &Option<Vec<String>>,
    ) -> Result<Vec<Arc<ArchiveEntry>>, ZimiError> {
        match scope {
            None => Ok(self.registry.entries()),
            Some(ids) => {
                let mut entries = Vec::with_capacity(ids.len());
                for id in ids {
                    let entry = self
                        .registry
                        .get(id)
                        .ok_or_else(|| ZimiError::NotFound(format!("archive '{id}' not found")))?;
                    entries.push(entry);
                }
                Ok(entries)
            }
        }
    }

    /// Cross-archive search. See the module docs for the two-phase shape.
    pub async fn search(
        &self,
        query: &str,
        opts: SearchOptions,
    ) -> Result<SearchOutcome, ZimiError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ZimiError::BadRequest("query must not be empty".into()));
        }
        let limit = opts.limit.clamp(1, MAX_SEARCH_LIMIT);

        let scope_key = match &opts.scope {
            None => String::new(),
            Some(ids) => {
                let mut sorted = ids.clone();
                sorted.sort();
                sorted.join(",")
            }
        };
        let key = search_key(query, &scope_key, limit, opts.fast);
        if let Some(mut cached) = self.result_cache.get(&key) {
            if opts.include_snippets {
                self.fill_snippets(&mut cached.results).await;
            }
            return Ok(cached);
        }

        let started = Instant::now();
        let deadline = started + opts.timeout;
        let archives = self.scoped_archives(&opts.scope)?;

        let tokens = query_tokens(query);
        let cleaned = clean_query(query);

        // Phase 1: parallel title lookups.
        let (mut raw_hits, mut partial) = self.title_phase(&archives, query, &tokens, limit).await;

        // Phase 2: serialized content verification under the global lock.
        if !opts.fast {
            let (deep_hits, deep_partial) = self
                .deep_phase(&archives, &cleaned, &tokens, limit, deadline)
                .await;
            raw_hits.extend(deep_hits);
            partial = partial || deep_partial;
        }

        let query_lower = query.to_lowercase();
        let mut results = self.merge(raw_hits, &query_lower, &tokens);
        results.truncate(limit);

        let mut by_source: HashMap<String, usize> = HashMap::new();
        for hit in &results {
            *by_source.entry(hit.archive.clone()).or_default() += 1;
        }

        let outcome = SearchOutcome {
            results,
            phase: if opts.fast { "title" } else { "full" },
            partial: partial || opts.fast,
            elapsed_ms: started.elapsed().as_millis() as u64,
            by_source,
        };

        // Cache the bare outcome; snippets are a post-filter.
        self.result_cache.put(key, outcome.clone());

        let mut outcome = outcome;
        if opts.include_snippets {
            self.fill_snippets(&mut outcome.results).await;
        }
        tracing::info!(
            "search q={query:?} limit={limit} fast={} {}ms {} hits",
            opts.fast,
            outcome.elapsed_ms,
            outcome.results.len()
        );
        Ok(outcome)
    }

    /// Autocomplete over one archive or all; prefix-only, deduplicated by
    /// title, served from the suggestion cache when possible.
    pub async fn suggest(
        &self,
        query: &str,
        scope: Option<Vec<String>>,
        limit: usize,
    ) -> Result<Vec<Suggestion>, ZimiError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ZimiError::BadRequest("query must not be empty".into()));
        }
        let limit = limit.clamp(1, MAX_SEARCH_LIMIT);
        let archives = self.scoped_archives(&scope)?;
        let prefix = query.to_lowercase();

        let mut merged: Vec<Suggestion> = Vec::new();
        let mut seen_titles = HashSet::new();
        for entry in archives {
            let id = entry.id();
            if self.titles.is_quarantined(&id) {
                continue;
            }
            let cache_key = (id.clone(), prefix.clone());
            let hits = match self.suggest_cache.get(&cache_key) {
                Some(cached) => cached,
                None => {
                    let _title_guard = entry.title_lock.read().await;
                    let hits = self
                        .titles
                        .prefix(&id, &prefix, limit)
                        .await
                        .unwrap_or_default()
                        .into_iter()
                        .map(|h| Suggestion {
                            archive: id.clone(),
                            path: h.path,
                            title: h.title,
                        })
                        .collect::<Vec<_>>();
                    self.suggest_cache.put(cache_key, hits.clone());
                    hits
                }
            };
            merged.extend(hits);
        }

        merged.sort_by(|a, b| {
            (a.title.len(), &a.title, &a.archive).cmp(&(b.title.len(), &b.title, &b.archive))
        });
        merged.retain(|s| seen_titles.insert(s.title.to_lowercase()));
        merged.truncate(limit);
        Ok(merged)
    }

    async fn title_phase(
        &self,
        archives: &[Arc<ArchiveEntry>],
        query: &str,
        tokens: &[String],
        limit: usize,
    ) -> (Vec<RawHit>, bool) {
        let mut set: JoinSet<Option<(String, i64, Vec<TitleHit>)>> = JoinSet::new();
        for entry in archives {
            let entry = entry.clone();
            let id = entry.id();
            if self.titles.is_quarantined(&id) {
                continue;
            }
            let meta = entry.meta();
            let rank = self.source_rank(&id, meta.category);
            let titles = self.titles.clone();
            let query = query.to_string();
            let tokens = tokens.to_vec();
            set.spawn(async move {
                let _title_guard = entry.title_lock.read().await;
                let mut hits = titles.prefix(&id, &query, limit).await?;
                if tokens.len() > 1 {
                    if let Some((token_hits, _truncated)) = titles.tokens(&id, &tokens, limit).await
                    {
                        hits.extend(token_hits);
                    }
                }
                Some((id, rank, hits))
            });
        }

        let mut raw = Vec::new();
        let mut partial = false;
        let phase_deadline = Instant::now() + PHASE1_BUDGET;
        while !set.is_empty() {
            let remaining = phase_deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, set.join_next()).await {
                Ok(Some(Ok(Some((id, rank, hits))))) => {
                    let mut seen = HashSet::new();
                    for hit in hits {
                        if seen.insert(hit.path.clone()) {
                            raw.push(RawHit {
                                archive: id.clone(),
                                path: hit.path,
                                title: hit.title,
                                via: HitVia::Title,
                                content_score: 0.0,
                                source_rank: rank,
                            });
                        }
                    }
                }
                Ok(Some(Ok(None))) => {
                    // Index unavailable for that archive; search proceeds.
                    partial = true;
                }
                Ok(Some(Err(_))) => {
                    partial = true;
                }
                Ok(None) => break,
                Err(_) => {
                    // Budget exhausted; abandon the stragglers.
                    set.abort_all();
                    partial = true;
                    break;
                }
            }
        }
        (raw, partial)
    }

    async fn deep_phase(
        &self,
        archives: &[Arc<ArchiveEntry>],
        cleaned_query: &str,
        tokens: &[String],
        limit: usize,
        deadline: Instant,
    ) -> (Vec<RawHit>, bool) {
        let mut ordered: Vec<(Arc<ArchiveEntry>, i64)> = archives
            .iter()
            .map(|e| {
                let meta = e.meta();
                (e.clone(), self.source_rank(&meta.id, meta.category))
            })
            .collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.id().cmp(&b.0.id())));

        let search_tokens: Vec<String> = if tokens.is_empty() {
            query_tokens(cleaned_query)
        } else {
            tokens.to_vec()
        };
        if search_tokens.is_empty() {
            return (Vec::new(), false);
        }

        let mut hits = Vec::new();
        let mut partial = false;
        for (entry, rank) in ordered {
            if Instant::now() >= deadline {
                partial = true;
                break;
            }
            let id = entry.id();

            // Candidate harvest through the title store; the global lock
            // below subsumes the per-archive title lock here.
            let candidates = match self
                .titles
                .tokens(&id, &search_tokens, DEEP_CANDIDATES_PER_ARCHIVE)
                .await
            {
                Some((candidates, truncated)) => {
                    partial = partial || truncated;
                    candidates
                }
                None => {
                    partial = true;
                    continue;
                }
            };
            if candidates.is_empty() {
                continue;
            }

            // Pin content coordinates before entering native code.
            let mut located = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                if let Some(row) = self.titles.lookup(&id, &candidate.path).await {
                    located.push(row);
                }
            }

            let needles: Vec<String> = search_tokens.iter().map(|t| t.to_lowercase()).collect();
            let verify_deadline = deadline;
            let verified = self
                .registry
                .with_native(entry.clone(), move |zim| {
                    let mut out = Vec::new();
                    for row in located {
                        if Instant::now() >= verify_deadline {
                            break;
                        }
                        let Ok(bytes) = crate::archive::read_blob(zim, row.cluster, row.blob)
                        else {
                            continue;
                        };
                        let text = strip_html(&String::from_utf8_lossy(&bytes)).to_lowercase();
                        if !needles.iter().all(|n| text.contains(n.as_str())) {
                            continue;
                        }
                        let first_pos = needles
                            .iter()
                            .filter_map(|n| text.find(n.as_str()))
                            .min()
                            .unwrap_or(text.len());
                        // Earlier occurrences score higher, 0..20.
                        let earliness = 1.0 - (first_pos.min(5000) as f64 / 5000.0);
                        out.push((row.path, row.title, 10.0 + earliness * 10.0));
                        if out.len() >= limit {
                            break;
                        }
                    }
                    Ok(out)
                })
                .await;

            match verified {
                Ok(verified) => {
                    for (path, title, content_score) in verified {
                        hits.push(RawHit {
                            archive: id.clone(),
                            path,
                            title,
                            via: HitVia::Content,
                            content_score,
                            source_rank: rank,
                        });
                    }
                }
                Err(err) => {
                    tracing::warn!("deep search failed for {id}: {err}");
                    partial = true;
                }
            }
        }
        (hits, partial)
    }

    /// Score, deduplicate, and deterministically order merged hits.
    fn merge(&self, raw: Vec<RawHit>, query_lower: &str, tokens: &[String]) -> Vec<SearchHit> {
        let needles: Vec<String> = if tokens.is_empty() {
            query_lower
                .split_whitespace()
                .map(str::to_string)
                .collect()
        } else {
            tokens.iter().map(|t| t.to_lowercase()).collect()
        };

        let mut best: HashMap<(String, String), SearchHit> = HashMap::new();
        for hit in raw {
            let canonical = canonical_path(&hit.path);
            let score = score_hit(
                &hit.title,
                query_lower,
                &needles,
                hit.via,
                hit.content_score,
                hit.source_rank,
            );
            let key = (hit.archive.clone(), canonical);
            let candidate = SearchHit {
                archive: hit.archive,
                path: hit.path,
                title: hit.title,
                kind: "article".to_string(),
                score: (score * 10.0).round() / 10.0,
                snippet: None,
                thumbnail: None,
                source_rank: hit.source_rank,
            };
            best.entry(key)
                .and_modify(|existing| {
                    if candidate.score > existing.score {
                        *existing = candidate.clone();
                    }
                })
                .or_insert(candidate);
        }

        let mut merged: Vec<SearchHit> = best.into_values().collect();
        merged.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.title.len().cmp(&b.title.len()))
                .then_with(|| a.title.cmp(&b.title))
                .then_with(|| a.archive.cmp(&b.archive))
                .then_with(|| a.path.cmp(&b.path))
        });
        merged
    }

    /// Fill snippets and thumbnails for the final result set only.
    async fn fill_snippets(&self, hits: &mut [SearchHit]) {
        for hit in hits.iter_mut() {
            if hit.snippet.is_some() {
                continue;
            }
            let Some(entry) = self.registry.get(&hit.archive) else {
                continue;
            };
            match fetch_entry(&self.registry, &self.titles, entry, &hit.path).await {
                Ok(Some(fetched)) if fetched.mime.starts_with("text/html") => {
                    let html = String::from_utf8_lossy(&fetched.bytes);
                    hit.snippet = Some(extract_snippet(&html));
                    hit.thumbnail = extract_thumbnail(&html, &hit.path)
                        .map(|p| format!("/w/{}/{}", hit.archive, p));
                }
                _ => {}
            }
        }
    }
}

struct RawHit {
    archive: String,
    path: String,
    title: String,
    via: HitVia,
    content_score: f64,
    source_rank: i64,
}

/// Title-match quality plus content and authority components.
fn score_hit(
    title: &str,
    query_lower: &str,
    needles: &[String],
    via: HitVia,
    content_score: f64,
    source_rank: i64,
) -> f64 {
    let title_lower = title.to_lowercase();
    let quality = if title_lower == query_lower {
        100.0
    } else if title_lower.starts_with(query_lower) {
        80.0
    } else if !needles.is_empty() && needles.iter().all(|n| title_lower.contains(n.as_str())) {
        60.0
    } else if via == HitVia::Content {
        40.0
    } else {
        30.0
    };
    quality + content_score + source_rank as f64 / 10.0
}

/// Dedup key: fragment stripped, percent-escapes decoded, `A/` prefix
/// collapsed.
pub fn canonical_path(path: &str) -> String {
    let path = path.split('#').next().unwrap_or(path);
    let decoded = urlencoding::decode(path)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| path.to_string());
    decoded
        .strip_prefix("A/")
        .map(str::to_string)
        .unwrap_or(decoded)
}

/// Query words with stop words removed; falls back to all words when the
/// query is nothing but stop words.
pub fn query_tokens(query: &str) -> Vec<String> {
    let all: Vec<String> = query
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();
    let kept: Vec<String> = all
        .iter()
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .cloned()
        .collect();
    if kept.is_empty() {
        all
    } else {
        kept
    }
}

/// Strip stop words for the deep phase, preserving quoted phrases.
pub fn clean_query(query: &str) -> String {
    let mut phrases = Vec::new();
    let mut rest = String::new();
    let mut in_quote = false;
    let mut current = String::new();
    for c in query.chars() {
        if c == '"' {
            if in_quote {
                phrases.push(format!("\"{current}\""));
                current.clear();
            }
            in_quote = !in_quote;
        } else if in_quote {
            current.push(c);
        } else {
            rest.push(c);
        }
    }
    if in_quote && !current.is_empty() {
        rest.push_str(&current);
    }
    let words: Vec<&str> = rest
        .split_whitespace()
        .filter(|w| !STOP_WORDS.contains(&w.to_lowercase().as_str()))
        .collect();
    let combined = phrases
        .into_iter()
        .chain(words.into_iter().map(str::to_string))
        .collect::<Vec<_>>()
        .join(" ");
    if combined.is_empty() {
        query.to_string()
    } else {
        combined
    }
}

pub struct FetchedEntry {
    pub path: String,
    pub title: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Fetch one entry's bytes: indexed `(cluster, blob)` lookup when the title
/// store can answer, directory walk under the global lock otherwise.
pub async fn fetch_entry(
    registry: &Registry,
    titles: &TitleStore,
    entry: Arc<ArchiveEntry>,
    path: &str,
) -> Result<Option<FetchedEntry>, ZimiError> {
    let id = entry.id();
    if let Some(row) = titles.lookup(&id, path).await {
        let mime = effective_mime(
            if row.mime.is_empty() {
                None
            } else {
                Some(row.mime.as_str())
            },
            &row.path,
        );
        let (cluster, blob) = (row.cluster, row.blob);
        let bytes = registry
            .with_native(entry, move |zim| {
                crate::archive::read_blob(zim, cluster, blob)
                    .map_err(|e| ZimiError::Internal(e.to_string()))
            })
            .await?;
        return Ok(Some(FetchedEntry {
            path: row.path,
            title: row.title,
            mime,
            bytes,
        }));
    }

    let probe_path = path.to_string();
    let fetched = registry
        .with_native(entry, move |zim| {
            Ok(crate::archive::fetch_entry_native(zim, &probe_path, true))
        })
        .await?;
    match fetched {
        NativeFetch::Content {
            path,
            title,
            mime,
            bytes,
        } => {
            let mime = effective_mime(mime.as_deref(), &path);
            Ok(Some(FetchedEntry {
                path,
                title,
                mime,
                bytes,
            }))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_strips_fragment_and_prefix() {
        assert_eq!(canonical_path("A/Water#History"), "Water");
        assert_eq!(canonical_path("Water"), "Water");
        assert_eq!(canonical_path("A/Caf%C3%A9"), "Café");
    }

    #[test]
    fn tokens_drop_stop_words() {
        assert_eq!(query_tokens("how to purify water"), vec!["purify", "water"]);
    }

    #[test]
    fn tokens_keep_all_stop_word_query() {
        assert_eq!(query_tokens("to be or not"), vec!["to", "be", "or", "not"]);
    }

    #[test]
    fn clean_query_preserves_phrases() {
        let cleaned = clean_query("\"water cycle\" in the desert");
        assert!(cleaned.contains("\"water cycle\""));
        assert!(cleaned.contains("desert"));
        assert!(!cleaned.contains(" the "));
    }

    #[test]
    fn clean_query_all_stop_words_returns_original() {
        assert_eq!(clean_query("the of and"), "the of and");
    }

    #[test]
    fn score_exact_beats_prefix_beats_substring() {
        let needles = vec!["water".to_string()];
        let exact = score_hit("Water", "water", &needles, HitVia::Title, 0.0, 50);
        let prefix = score_hit("Waterfall", "water", &needles, HitVia::Title, 0.0, 50);
        let substring = score_hit("Deep water", "water", &needles, HitVia::Title, 0.0, 50);
        let content_only = score_hit("Hydrology", "water", &needles, HitVia::Content, 0.0, 50);
        assert!(exact > prefix);
        assert!(prefix > substring);
        assert!(substring > content_only);
    }

    #[test]
    fn source_rank_breaks_ties() {
        let needles = vec!["water".to_string()];
        let wiki = score_hit("Water", "water", &needles, HitVia::Title, 0.0, 100);
        let other = score_hit("Water", "water", &needles, HitVia::Title, 0.0, 50);
        assert!(wiki > other);
    }

    #[test]
    fn merge_dedups_by_canonical_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let state = Arc::new(crate::state::StateStore::new(tmp.path().join("data")));
        let registry = Arc::new(Registry::new(tmp.path().join("zims"), state));
        let titles = Arc::new(TitleStore::new(tmp.path().join("titles")));
        let engine = SearchEngine::new(registry, titles);

        let raw = vec![
            RawHit {
                archive: "wikipedia".into(),
                path: "A/Water".into(),
                title: "Water".into(),
                via: HitVia::Title,
                content_score: 0.0,
                source_rank: 100,
            },
            RawHit {
                archive: "wikipedia".into(),
                path: "Water".into(),
                title: "Water".into(),
                via: HitVia::Content,
                content_score: 15.0,
                source_rank: 100,
            },
            RawHit {
                archive: "wiktionary".into(),
                path: "A/Water".into(),
                title: "Water".into(),
                via: HitVia::Title,
                content_score: 0.0,
                source_rank: 90,
            },
        ];
        let merged = engine.merge(raw, "water", &["water".to_string()]);
        assert_eq!(merged.len(), 2);
        // Wikipedia first on source rank.
        assert_eq!(merged[0].archive, "wikipedia");
    }

    #[test]
    fn merge_order_is_deterministic() {
        let tmp = tempfile::TempDir::new().unwrap();
        let state = Arc::new(crate::state::StateStore::new(tmp.path().join("data")));
        let registry = Arc::new(Registry::new(tmp.path().join("zims"), state));
        let titles = Arc::new(TitleStore::new(tmp.path().join("titles")));
        let engine = SearchEngine::new(registry, titles);

        let make = || {
            vec![
                RawHit {
                    archive: "b".into(),
                    path: "A/Water_cycle".into(),
                    title: "Water cycle".into(),
                    via: HitVia::Title,
                    content_score: 0.0,
                    source_rank: 50,
                },
                RawHit {
                    archive: "a".into(),
                    path: "A/Water_cycle".into(),
                    title: "Water cycle".into(),
                    via: HitVia::Title,
                    content_score: 0.0,
                    source_rank: 50,
                },
            ]
        };
        let first = engine.merge(make(), "water", &["water".to_string()]);
        let second = engine.merge(make(), "water", &["water".to_string()]);
        let order =
            |hits: &[SearchHit]| hits.iter().map(|h| h.archive.clone()).collect::<Vec<_>>();
        assert_eq!(order(&first), order(&second));
        // Equal everything else: archive id ascending.
        assert_eq!(first[0].archive, "a");
    }

    #[tokio::test]
    async fn search_rejects_empty_query() {
        let tmp = tempfile::TempDir::new().unwrap();
        let state = Arc::new(crate::state::StateStore::new(tmp.path().join("data")));
        let registry = Arc::new(Registry::new(tmp.path().join("zims"), state));
        let titles = Arc::new(TitleStore::new(tmp.path().join("titles")));
        let engine = SearchEngine::new(registry, titles);
        let err = engine
            .search("  ", SearchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "bad_request");
    }

    #[tokio::test]
    async fn search_unknown_scope_archive_is_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let state = Arc::new(crate::state::StateStore::new(tmp.path().join("data")));
        let registry = Arc::new(Registry::new(tmp.path().join("zims"), state));
        let titles = Arc::new(TitleStore::new(tmp.path().join("titles")));
        let engine = SearchEngine::new(registry, titles);
        let err = engine
            .search(
                "water",
                SearchOptions {
                    scope: Some(vec!["ghost".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn empty_library_fast_search_is_partial_title_phase() {
        let tmp = tempfile::TempDir::new().unwrap();
        let state = Arc::new(crate::state::StateStore::new(tmp.path().join("data")));
        let registry = Arc::new(Registry::new(tmp.path().join("zims"), state));
        let titles = Arc::new(TitleStore::new(tmp.path().join("titles")));
        let engine = SearchEngine::new(registry, titles);
        let outcome = engine
            .search(
                "water",
                SearchOptions {
                    fast: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.phase, "title");
        assert!(outcome.partial);
    }

    #[tokio::test]
    async fn repeated_search_hits_result_cache() {
        let tmp = tempfile::TempDir::new().unwrap();
        let state = Arc::new(crate::state::StateStore::new(tmp.path().join("data")));
        let registry = Arc::new(Registry::new(tmp.path().join("zims"), state));
        let titles = Arc::new(TitleStore::new(tmp.path().join("titles")));
        let engine = SearchEngine::new(registry, titles);
        let opts = SearchOptions {
            fast: true,
            include_snippets: false,
            ..Default::default()
        };
        engine.search("water", opts.clone()).await.unwrap();
        assert_eq!(engine.result_cache_len(), 1);
        engine.search("water", opts).await.unwrap();
        assert_eq!(engine.result_cache_len(), 1);
        engine.invalidate_caches();
        assert_eq!(engine.result_cache_len(), 0);
    }
}
