//! Response classification and HTML content extraction.
//!
//! The dispatcher buckets responses by Content-Type; the HTML path decodes
//! the body, parses tolerantly, and pulls out the indexable fields plus
//! outbound links in document order. All size caps are byte caps applied
//! on character boundaries.

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::config::CrawlConfig;
use crate::sitemaps;

/// Where a response goes after Content-Type dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    Html,
    Sitemap,
    RobotsTxt,
    Extractable,
    Unsupported,
}

/// Byte caps for extracted fields
#[derive(Debug, Clone)]
pub struct ExtractionCaps {
    pub max_title_size: usize,
    pub max_body_size: usize,
    pub max_keywords_size: usize,
    pub max_description_size: usize,
    pub max_headings_count: usize,
    pub default_encoding: String,
}

impl ExtractionCaps {
    pub fn from_config(config: &CrawlConfig) -> Self {
        Self {
            max_title_size: config.max_title_size,
            max_body_size: config.max_body_size,
            max_keywords_size: config.max_keywords_size,
            max_description_size: config.max_description_size,
            max_headings_count: config.max_headings_count,
            default_encoding: config.default_encoding.clone(),
        }
    }
}

/// Classify a response for the discovery pipeline
pub fn classify(
    content_type: Option<&str>,
    path: &str,
    config: &CrawlConfig,
) -> ContentClass {
    if path == "/robots.txt" {
        return ContentClass::RobotsTxt;
    }
    let essence = content_type
        .map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
        .unwrap_or_default();

    if essence == "text/html" || essence == "application/xhtml+xml" || essence.is_empty() {
        return ContentClass::Html;
    }
    if sitemaps::looks_like_sitemap(content_type, path) {
        return ContentClass::Sitemap;
    }
    if config.content_extraction_enabled
        && config
            .content_extraction_mime_types
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&essence))
    {
        return ContentClass::Extractable;
    }
    ContentClass::Unsupported
}

/// Everything pulled from one HTML document
#[derive(Debug, Default, Clone)]
pub struct PageExtract {
    pub title: Option<String>,
    pub body: String,
    pub meta_keywords: Option<String>,
    pub meta_description: Option<String>,
    pub headings: Vec<String>,
    /// Absolute http(s) link targets in document order, resolved against
    /// the document base; unparseable hrefs and other schemes are dropped
    /// here. Allowlist/dedup filtering and the link-count caps happen in
    /// the discovery pipeline.
    pub links: Vec<Url>,
}

/// Decode and extract an HTML document fetched from `final_url`.
pub fn extract_html(body: &[u8], content_type: Option<&str>, final_url: &Url, caps: &ExtractionCaps) -> PageExtract {
    let text = decode_body(body, content_type, &caps.default_encoding);
    let document = Html::parse_document(&text);
    extract_from_document(&document, final_url, caps)
}

pub fn extract_from_document(
    document: &Html,
    final_url: &Url,
    caps: &ExtractionCaps,
) -> PageExtract {
    let base_url = base_href(document)
        .and_then(|href| final_url.join(&href).ok())
        .unwrap_or_else(|| final_url.clone());

    let title = select_first_text(document, "title")
        .map(|t| truncate_bytes(t.trim(), caps.max_title_size));
    let meta_keywords = select_meta(document, "keywords")
        .map(|v| truncate_bytes(&v, caps.max_keywords_size));
    let meta_description = select_meta(document, "description")
        .map(|v| truncate_bytes(&v, caps.max_description_size));

    let heading_selector = selector("h1, h2, h3, h4, h5, h6");
    let headings: Vec<String> = document
        .select(&heading_selector)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|h| !h.is_empty())
        .take(caps.max_headings_count)
        .collect();

    let mut body = String::new();
    let root = document
        .select(&selector("body"))
        .next()
        .unwrap_or_else(|| document.root_element());
    collect_visible_text(root, &mut body, caps.max_body_size);
    let body = truncate_bytes(normalize_whitespace(&body).trim(), caps.max_body_size);

    let link_selector = selector("a[href], area[href], link[rel=canonical]");
    let links: Vec<Url> = document
        .select(&link_selector)
        .filter_map(|el| el.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty())
        .filter_map(|href| base_url.join(href).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .collect();

    PageExtract {
        title: title.filter(|t| !t.is_empty()),
        body,
        meta_keywords,
        meta_description,
        headings,
        links,
    }
}

// Selectors here are compile-time constants; parse failure would be a
// programming error caught by the selector tests.
fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

fn base_href(document: &Html) -> Option<String> {
    document
        .select(&selector("base[href]"))
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(|s| s.to_string())
}

fn select_first_text(document: &Html, css: &str) -> Option<String> {
    document
        .select(&selector(css))
        .map(|el| el.text().collect::<String>())
        .find(|t| !t.trim().is_empty())
}

fn select_meta(document: &Html, name: &str) -> Option<String> {
    let sel = selector(&format!("meta[name={name}]"));
    document
        .select(&sel)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Elements whose text never counts as page content
const NOISE_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "iframe", "svg", "nav", "head",
];

fn collect_visible_text(element: ElementRef, out: &mut String, cap: usize) {
    if out.len() > cap {
        return;
    }
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            out.push(' ');
        } else if let Some(child_el) = ElementRef::wrap(child) {
            if !NOISE_TAGS.contains(&child_el.value().name()) {
                collect_visible_text(child_el, out, cap);
            }
        }
    }
}

fn normalize_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_space = true;
    for c in input.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

/// Truncate to a byte budget without splitting a character
pub fn truncate_bytes(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return input.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    input[..end].to_string()
}

/// Decode a response body using the charset from the Content-Type header,
/// a BOM, or a meta tag, falling back to the configured default. UTF-8 and
/// Latin-1 decode exactly; anything else decodes as UTF-8 lossy, which
/// keeps ASCII content intact.
pub fn decode_body(body: &[u8], content_type: Option<&str>, default_encoding: &str) -> String {
    let charset = content_type
        .and_then(charset_from_content_type)
        .or_else(|| charset_from_bom(body))
        .or_else(|| charset_from_meta(body))
        .unwrap_or_else(|| default_encoding.to_string());

    let charset = charset.to_ascii_lowercase();
    match charset.as_str() {
        "iso-8859-1" | "latin1" | "windows-1252" => body.iter().map(|&b| b as char).collect(),
        _ => String::from_utf8_lossy(strip_utf8_bom(body)).into_owned(),
    }
}

fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

fn charset_from_bom(body: &[u8]) -> Option<String> {
    if body.starts_with(&[0xEF, 0xBB, 0xBF]) {
        Some("utf-8".to_string())
    } else {
        None
    }
}

fn strip_utf8_bom(body: &[u8]) -> &[u8] {
    body.strip_prefix([0xEF, 0xBB, 0xBF].as_slice()).unwrap_or(body)
}

/// Scan the document head for `<meta charset>` declarations
fn charset_from_meta(body: &[u8]) -> Option<String> {
    let head = String::from_utf8_lossy(&body[..body.len().min(1024)]).to_lowercase();
    if let Some(pos) = head.find("charset=") {
        let rest = &head[pos + "charset=".len()..];
        let value: String = rest
            .trim_start_matches(['"', '\''])
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        if !value.is_empty() {
            return Some(value);
        }
    }
    None
}
