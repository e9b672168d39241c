//! Article reading and text extraction.
//!
//! Entry bytes come out of the archive via the title index's stored
//! `(cluster, blob)` coordinates, falling back to a directory walk when the
//! index cannot answer. HTML is reduced to plain text with a small
//! tag-stripping pass; snippets prefer the page's own description metadata
//! over body text.

use once_cell::sync::Lazy;
use regex::Regex;

/// Characters returned per article by default; keeps responses manageable
/// for LLM consumers.
pub const DEFAULT_READ_LENGTH: usize = 8000;
/// Upper bound a client may request.
pub const MAX_READ_LENGTH: usize = 50_000;
/// Snippet extraction reads at most this much of an entry.
pub const SNIPPET_SCAN_BYTES: usize = 15_360;
/// Snippet length cap.
pub const SNIPPET_LENGTH: usize = 240;
/// Entries above this size are skipped for snippet extraction.
pub const MAX_SNIPPET_ENTRY_BYTES: usize = 10 * 1024 * 1024;

static SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("static pattern"));
static STYLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").expect("static pattern"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("static pattern"));
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static pattern"));

/// Remove tags and collapse whitespace, yielding plain text.
pub fn strip_html(html: &str) -> String {
    let text = SCRIPT_RE.replace_all(html, "");
    let text = STYLE_RE.replace_all(&text, "");
    let text = TAG_RE.replace_all(&text, " ");
    let text = decode_entities(&text);
    WS_RE.replace_all(&text, " ").trim().to_string()
}

/// Decode the handful of entities that actually occur in article bodies.
fn decode_entities(text: &str) -> String {
    let mut out = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ");
    // Numeric references: &#NNN; and &#xHH;
    static NUM_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"&#(x?[0-9a-fA-F]+);").expect("static pattern"));
    if NUM_RE.is_match(&out) {
        out = NUM_RE
            .replace_all(&out, |caps: &regex::Captures| {
                let body = &caps[1];
                let code = if let Some(hex) = body.strip_prefix('x') {
                    u32::from_str_radix(hex, 16).ok()
                } else {
                    body.parse::<u32>().ok()
                };
                code.and_then(char::from_u32)
                    .map(|c| c.to_string())
                    .unwrap_or_default()
            })
            .into_owned();
    }
    out
}

/// Truncate at a word boundary at or before `max_length` characters.
pub fn truncate_words(text: &str, max_length: usize) -> (String, bool) {
    if text.chars().count() <= max_length {
        return (text.to_string(), false);
    }
    let cut: String = text.chars().take(max_length).collect();
    let truncated = match cut.rfind(char::is_whitespace) {
        Some(pos) if pos > max_length / 2 => cut[..pos].trim_end().to_string(),
        _ => cut,
    };
    (truncated, true)
}

static META_DESC_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"(?is)<meta\s+(?:name|property)=["'](?:og:)?description["']\s+content=["']([^"']{20,})["']"#,
        r#"(?is)<meta\s+content=["']([^"']{20,})["']\s+(?:name|property)=["'](?:og:)?description["']"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

static MAIN_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(main|article)[\s>]").expect("static pattern"));

/// First `max` bytes of `s`, backed off to a UTF-8 boundary.
fn head(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Extract a short description from an HTML document: meta description,
/// `og:description`, then the first body text past the navigation chrome.
pub fn extract_snippet(html: &str) -> String {
    let head = head(html, 8000);
    for re in META_DESC_RES.iter() {
        if let Some(caps) = re.captures(head) {
            let snippet = strip_html(&caps[1]);
            if !snippet.is_empty() {
                return truncate_words(&snippet, SNIPPET_LENGTH).0;
            }
        }
    }
    // Body text from <main>/<article> onward skips headers and nav bars.
    if let Some(m) = MAIN_TAG_RE.find(html) {
        let body = strip_html(&html[m.start()..]);
        if !body.is_empty() {
            return truncate_words(&body, SNIPPET_LENGTH).0;
        }
    }
    truncate_words(&strip_html(html), SNIPPET_LENGTH).0
}

static OG_IMAGE_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"(?is)<meta\s+property=["']og:image["']\s+content=["']([^"']+)["']"#,
        r#"(?is)<meta\s+content=["']([^"']+)["']\s+property=["']og:image["']"#,
        r#"(?is)<meta\s+name=["']twitter:image["']\s+content=["']([^"']+)["']"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

/// Pick a thumbnail path from page metadata. Only archive-relative raster
/// images qualify; external URLs and SVGs are skipped.
pub fn extract_thumbnail(html: &str, entry_path: &str) -> Option<String> {
    let head = head(html, 8000);
    for re in OG_IMAGE_RES.iter() {
        if let Some(caps) = re.captures(head) {
            let src = caps[1].trim();
            if src.starts_with("http") || src.starts_with("//") || src.starts_with("data:") {
                continue;
            }
            if src.to_lowercase().ends_with(".svg") {
                continue;
            }
            return Some(resolve_relative(entry_path, src));
        }
    }
    None
}

/// Resolve `src` against the directory of `entry_path`.
fn resolve_relative(entry_path: &str, src: &str) -> String {
    if let Some(rest) = src.strip_prefix('/') {
        return rest.to_string();
    }
    let mut parts: Vec<&str> = entry_path.split('/').collect();
    parts.pop();
    for seg in src.split('/') {
        match seg {
            "." | "" => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// MIME fallback by extension for entries whose stored type is empty or a
/// bare subtype ("mp4" instead of "video/mp4").
pub fn mime_for_path(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?.to_lowercase();
    let mime = match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "xml" => "application/xml",
        "txt" => "text/plain",
        "wasm" => "application/wasm",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "ogv" => "video/ogg",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "opus" => "audio/opus",
        "flac" => "audio/flac",
        "vtt" => "text/vtt",
        "epub" => "application/epub+zip",
        _ => return None,
    };
    Some(mime)
}

/// Normalize a stored MIME value: extension fallback for empty values, and
/// repair of bare subtypes some packagers emit.
pub fn effective_mime(stored: Option<&str>, path: &str) -> String {
    match stored {
        Some(m) if m.contains('/') => m.to_string(),
        Some(m) if !m.is_empty() => {
            // Bare subtype like "mp4": resolve as if it were an extension.
            mime_for_path(&format!("x.{m}"))
                .map(str::to_string)
                .unwrap_or_else(|| "application/octet-stream".to_string())
        }
        _ => mime_for_path(path)
            .map(str::to_string)
            .unwrap_or_else(|| "application/octet-stream".to_string()),
    }
}
