//! Kiwix OPDS catalog client and update detection.
//!
//! The library catalog is an Atom feed. Entries carry the archive name,
//! flavor, sizes, and an `open-access` acquisition link pointing at the
//! `.zim` download. Update detection strips the `YYYY-MM` stamp from
//! installed filenames and looks for a catalog entry with the same base and
//! a newer date, preferring the longest name match so flavors pair up
//! exactly.
//!
//! Also here: the parser for zimgit-style PDF collections, whose
//! `database.js` entry holds a Python-literal list of document records.

use anyhow::{bail, Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::archive::split_zim_date;

pub const KIWIX_OPDS_BASE: &str = "https://library.kiwix.org/catalog/search";
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
/// Page size used when walking the whole catalog for update checks.
const UPDATE_PAGE: u32 = 500;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogItem {
    pub name: String,
    pub title: String,
    pub summary: String,
    pub language: String,
    pub category: String,
    pub author: String,
    pub date: String,
    pub article_count: u64,
    pub media_count: u64,
    pub size_bytes: u64,
    pub download_url: String,
    pub icon_url: String,
    pub installed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateInfo {
    pub id: String,
    pub installed_file: String,
    pub installed_date: String,
    pub latest_date: String,
    pub download_url: String,
    pub title: String,
    pub size_bytes: u64,
}

pub struct CatalogClient {
    client: reqwest::Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new(client: reqwest::Client) -> Self {
        CatalogClient {
            client,
            base_url: KIWIX_OPDS_BASE.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(client: reqwest::Client, base_url: String) -> Self {
        CatalogClient { client, base_url }
    }

    /// Fetch one catalog page. `installed_bases` marks entries already in
    /// the library (matched by date-stripped download filename).
    pub async fn fetch(
        &self,
        query: &str,
        lang: &str,
        count: u32,
        start: u32,
        installed_bases: &HashSet<String>,
    ) -> Result<(u64, Vec<CatalogItem>)> {
        let mut url = format!("{}?count={count}&start={start}", self.base_url);
        if !query.is_empty() {
            url.push_str(&format!("&q={}", urlencoding::encode(query)));
        }
        if !lang.is_empty() {
            url.push_str(&format!("&lang={}", urlencoding::encode(lang)));
        }
        let response = self
            .client
            .get(&url)
            .timeout(FETCH_TIMEOUT)
            .header("User-Agent", concat!("zimi/", env!("CARGO_PKG_VERSION")))
            .send()
            .await
            .context("catalog request")?;
        if !response.status().is_success() {
            bail!("catalog returned HTTP {}", response.status());
        }
        let xml = response.text().await.context("catalog body")?;
        parse_opds(&xml, installed_bases)
    }

    /// Compare installed archives against the catalog. `installed` is
    /// `(archive_id, filename)` for every library member.
    pub async fn check_updates(&self, installed: &[(String, String)]) -> Result<Vec<UpdateInfo>> {
        let dated: Vec<(String, String, String, String)> = installed
            .iter()
            .filter_map(|(id, filename)| {
                let (base, date) = split_zim_date(filename);
                date.map(|d| (id.clone(), filename.clone(), base, d))
            })
            .collect();
        if dated.is_empty() {
            return Ok(Vec::new());
        }

        let no_bases = HashSet::new();
        let (total, mut items) = self.fetch("", "eng", UPDATE_PAGE, 0, &no_bases).await?;
        while (items.len() as u64) < total {
            let (_, more) = self
                .fetch("", "eng", UPDATE_PAGE, items.len() as u32, &no_bases)
                .await?;
            if more.is_empty() {
                break;
            }
            items.extend(more);
        }

        Ok(find_updates(&dated, &items))
    }
}

/// Match installed `(id, filename, base, date)` rows against catalog items.
fn find_updates(
    installed: &[(String, String, String, String)],
    items: &[CatalogItem],
) -> Vec<UpdateInfo> {
    let mut updates = Vec::new();
    for (id, filename, filebase, inst_date) in installed {
        let mut best: Option<&CatalogItem> = None;
        let mut best_len = 0usize;
        for item in items {
            if item.download_url.is_empty() || item.name.is_empty() {
                continue;
            }
            let cat_date = if item.date.len() >= 7 {
                &item.date[..7]
            } else {
                continue;
            };
            // Flavor-exact match: the installed base starts with the
            // catalog name; the longest catalog name wins.
            if filebase.starts_with(&format!("{}_", item.name))
                && cat_date > inst_date.as_str()
                && item.name.len() > best_len
            {
                best = Some(item);
                best_len = item.name.len();
            }
        }
        if let Some(item) = best {
            updates.push(UpdateInfo {
                id: id.clone(),
                installed_file: filename.clone(),
                installed_date: inst_date.clone(),
                latest_date: item.date[..7].to_string(),
                download_url: item.download_url.clone(),
                title: item.title.clone(),
                size_bytes: item.size_bytes,
            });
        }
    }
    updates
}

/// Event-parse the OPDS Atom feed.
pub fn parse_opds(xml: &str, installed_bases: &HashSet<String>) -> Result<(u64, Vec<CatalogItem>)> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut total = 0u64;
    let mut items = Vec::new();
    let mut current: Option<CatalogItem> = None;
    let mut text_target: Option<&'static str> = None;
    let mut in_author = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e))
                if e.local_name().as_ref() == b"link" =>
            {
                if let Some(item) = current.as_mut() {
                    let mut rel = String::new();
                    let mut href = String::new();
                    let mut ltype = String::new();
                    let mut length = 0u64;
                    for attr in e.attributes().flatten() {
                        let value = String::from_utf8_lossy(&attr.value).to_string();
                        match attr.key.as_ref() {
                            b"rel" => rel = value,
                            b"href" => href = value,
                            b"type" => ltype = value,
                            b"length" => length = value.parse().unwrap_or(0),
                            _ => {}
                        }
                    }
                    if rel == "http://opds-spec.org/acquisition/open-access"
                        && ltype == "application/x-zim"
                    {
                        item.download_url = href;
                        item.size_bytes = length;
                    } else if rel == "http://opds-spec.org/image/thumbnail" {
                        item.icon_url = if href.starts_with('/') {
                            format!("https://library.kiwix.org{href}")
                        } else {
                            href
                        };
                    }
                }
            }
            Ok(Event::Start(ref e)) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"entry" => current = Some(CatalogItem::default()),
                    b"totalResults" if current.is_none() => text_target = Some("total"),
                    b"author" if current.is_some() => in_author = true,
                    b"name" if in_author => text_target = Some("author"),
                    b"name" if current.is_some() => text_target = Some("name"),
                    b"title" if current.is_some() => text_target = Some("title"),
                    b"summary" if current.is_some() => text_target = Some("summary"),
                    b"language" if current.is_some() => text_target = Some("language"),
                    b"category" if current.is_some() => text_target = Some("category"),
                    b"articleCount" if current.is_some() => text_target = Some("articles"),
                    b"mediaCount" if current.is_some() => text_target = Some("media"),
                    b"issued" if current.is_some() => text_target = Some("date"),
                    _ => {}
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                match (text_target, current.as_mut()) {
                    (Some("total"), None) => total = text.trim().parse().unwrap_or(0),
                    (Some("name"), Some(item)) => item.name.push_str(&text),
                    (Some("title"), Some(item)) => item.title.push_str(&text),
                    (Some("summary"), Some(item)) => item.summary.push_str(&text),
                    (Some("language"), Some(item)) => item.language.push_str(&text),
                    (Some("category"), Some(item)) => item.category.push_str(&text),
                    (Some("articles"), Some(item)) => {
                        item.article_count = text.trim().parse().unwrap_or(0)
                    }
                    (Some("media"), Some(item)) => {
                        item.media_count = text.trim().parse().unwrap_or(0)
                    }
                    (Some("date"), Some(item)) => {
                        if item.date.is_empty() {
                            item.date = text.trim().chars().take(10).collect();
                        }
                    }
                    (Some("author"), Some(item)) => {
                        if text.trim() != "-" {
                            item.author.push_str(text.trim());
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"entry" => {
                        if let Some(mut item) = current.take() {
                            if !item.download_url.is_empty() {
                                let filename = item
                                    .download_url
                                    .rsplit('/')
                                    .next()
                                    .unwrap_or("")
                                    .trim_end_matches(".meta4");
                                let (base, _) = split_zim_date(filename);
                                item.installed = installed_bases.contains(&base.to_lowercase());
                            }
                            items.push(item);
                        }
                    }
                    b"author" => in_author = false,
                    _ => text_target = None,
                }
                if local.as_ref() != b"author" {
                    text_target = None;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => bail!("catalog XML parse error: {e}"),
            _ => {}
        }
        buf.clear();
    }

    Ok((total, items))
}

/// Convert a zimgit `database.js` payload (`var DATABASE = [...]`, Python
/// literal syntax) into JSON values.
pub fn parse_database_js(content: &str) -> Option<Vec<serde_json::Value>> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("var DATABASE =")
        .or_else(|| trimmed.strip_prefix("var DATABASE="))
        .unwrap_or(trimmed)
        .trim()
        .trim_end_matches(';');
    let json = python_literal_to_json(body)?;
    serde_json::from_str::<Vec<serde_json::Value>>(&json).ok()
}

/// Best-effort literal translation: single-quoted strings become JSON
/// strings, `True`/`False`/`None` become their JSON spellings.
fn python_literal_to_json(src: &str) -> Option<String> {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                let quote = c;
                out.push('"');
                while let Some(inner) = chars.next() {
                    match inner {
                        '\\' => {
                            let escaped = chars.next()?;
                            match escaped {
                                '\'' => out.push('\''),
                                '"' => out.push_str("\\\""),
                                '\\' => out.push_str("\\\\"),
                                'n' => out.push_str("\\n"),
                                't' => out.push_str("\\t"),
                                other => {
                                    out.push('\\');
                                    out.push(other);
                                }
                            }
                        }
                        '"' if quote == '\'' => out.push_str("\\\""),
                        c if c == quote => break,
                        other => out.push(other),
                    }
                }
                out.push('"');
            }
            'T' if chars.clone().take(3).collect::<String>() == "rue" => {
                for _ in 0..3 {
                    chars.next();
                }
                out.push_str("true");
            }
            'F' if chars.clone().take(4).collect::<String>() == "alse" => {
                for _ in 0..4 {
                    chars.next();
                }
                out.push_str("false");
            }
            'N' if chars.clone().take(3).collect::<String>() == "one" => {
                for _ in 0..3 {
                    chars.next();
                }
                out.push_str("null");
            }
            other => out.push(other),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom"
      xmlns:dc="http://purl.org/dc/terms/"
      xmlns:opds="http://opds-spec.org/2010/catalog">
  <totalResults>2</totalResults>
  <entry>
    <name>wikipedia_en_all</name>
    <title>Wikipedia</title>
    <summary>The free encyclopedia</summary>
    <language>eng</language>
    <category>wikipedia</category>
    <articleCount>6000000</articleCount>
    <mediaCount>100</mediaCount>
    <author><name>Kiwix</name></author>
    <dc:issued>2024-01-15T00:00:00Z</dc:issued>
    <link rel="http://opds-spec.org/acquisition/open-access"
          type="application/x-zim"
          href="https://download.kiwix.org/zim/wikipedia/wikipedia_en_all_2024-01.zim.meta4"
          length="90000000000"/>
    <link rel="http://opds-spec.org/image/thumbnail" href="/catalog/icon.png"/>
  </entry>
  <entry>
    <name>wikihow_en_maxi</name>
    <title>wikiHow</title>
    <language>eng</language>
    <dc:issued>2023-09-01T00:00:00Z</dc:issued>
    <link rel="http://opds-spec.org/acquisition/open-access"
          type="application/x-zim"
          href="https://download.kiwix.org/zim/other/wikihow_en_maxi_2023-09.zim.meta4"
          length="12000"/>
  </entry>
</feed>"#;

    #[test]
    fn parse_feed_basics() {
        let (total, items) = parse_opds(FEED, &HashSet::new()).unwrap();
        assert_eq!(total, 2);
        assert_eq!(items.len(), 2);
        let wiki = &items[0];
        assert_eq!(wiki.name, "wikipedia_en_all");
        assert_eq!(wiki.title, "Wikipedia");
        assert_eq!(wiki.language, "eng");
        assert_eq!(wiki.author, "Kiwix");
        assert_eq!(wiki.date, "2024-01-15");
        assert_eq!(wiki.article_count, 6_000_000);
        assert_eq!(wiki.size_bytes, 90_000_000_000);
        assert!(wiki.download_url.ends_with(".zim.meta4"));
        assert_eq!(wiki.icon_url, "https://library.kiwix.org/catalog/icon.png");
        assert!(!wiki.installed);
    }

    #[test]
    fn parse_feed_marks_installed() {
        let mut bases = HashSet::new();
        bases.insert("wikihow_en_maxi".to_string());
        let (_, items) = parse_opds(FEED, &bases).unwrap();
        assert!(!items[0].installed);
        assert!(items[1].installed);
    }

    #[test]
    fn updates_found_for_newer_date() {
        let (_, items) = parse_opds(FEED, &HashSet::new()).unwrap();
        let installed = vec![(
            "wikipedia".to_string(),
            "wikipedia_en_all_2023-06.zim".to_string(),
            "wikipedia_en_all".to_string(),
            "2023-06".to_string(),
        )];
        let updates = find_updates(&installed, &items);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].id, "wikipedia");
        assert_eq!(updates[0].latest_date, "2024-01");
    }

    #[test]
    fn no_update_when_current() {
        let (_, items) = parse_opds(FEED, &HashSet::new()).unwrap();
        let installed = vec![(
            "wikipedia".to_string(),
            "wikipedia_en_all_2024-01.zim".to_string(),
            "wikipedia_en_all".to_string(),
            "2024-01".to_string(),
        )];
        assert!(find_updates(&installed, &items).is_empty());
    }

    #[test]
    fn longest_name_match_wins() {
        let mut items = parse_opds(FEED, &HashSet::new()).unwrap().1;
        // A shorter, also-matching name with a newer date must lose to the
        // exact flavor match.
        let mut generic = items[0].clone();
        generic.name = "wikipedia".to_string();
        generic.date = "2025-01-01".to_string();
        generic.download_url = "https://download.kiwix.org/zim/wikipedia_2025-01.zim".to_string();
        items.push(generic);
        let installed = vec![(
            "wikipedia".to_string(),
            "wikipedia_en_all_2023-06.zim".to_string(),
            "wikipedia_en_all".to_string(),
            "2023-06".to_string(),
        )];
        let updates = find_updates(&installed, &items);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].latest_date, "2024-01");
    }

    #[test]
    fn database_js_parses_python_literals() {
        let content = r#"var DATABASE = [
            {'ti': "Water Purification Guide", 'fp': ['guides/water.pdf'], 'ok': True},
            {'ti': 'It\'s a "test"', 'fp': [], 'n': None},
        ];"#;
        // Trailing commas are invalid JSON; the real payloads do not have
        // them, so mirror that here.
        let content = content.replace("},\n        ];", "}];");
        let docs = parse_database_js(&content).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["ti"], "Water Purification Guide");
        assert_eq!(docs[0]["ok"], true);
        assert_eq!(docs[1]["ti"], "It's a \"test\"");
        assert!(docs[1]["n"].is_null());
    }

    #[test]
    fn database_js_rejects_garbage() {
        assert!(parse_database_js("not a database").is_none());
    }
}
