//! XML sitemap and sitemap-index parsing.
//!
//! Entries stream out of the reader one at a time; malformed entries are
//! skipped and counted rather than aborting the document. Oversized
//! documents are truncated at the entry cap with a warning.

use std::io::{Cursor, Read};

use flate2::read::GzDecoder;
use sitemap::reader::{SiteMapEntity, SiteMapReader};
use thiserror::Error;

/// Hard caps from the sitemap protocol
pub const MAX_SITEMAP_URLS: usize = 50_000;
pub const MAX_SITEMAP_BYTES: usize = 50 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum SitemapError {
    #[error("sitemap exceeds {MAX_SITEMAP_BYTES} bytes uncompressed")]
    TooLarge,

    #[error("failed to decompress sitemap: {0}")]
    Gzip(String),
}

/// Parsed sitemap content
#[derive(Debug, Default)]
pub struct SitemapParse {
    /// Page URLs from <urlset> entries, in document order
    pub page_urls: Vec<String>,
    /// Nested sitemap locations from <sitemapindex> entries
    pub nested_sitemaps: Vec<String>,
    /// Entries dropped as malformed
    pub skipped: usize,
    /// True when the URL cap cut the document short
    pub truncated: bool,
}

impl SitemapParse {
    pub fn url_count(&self) -> usize {
        self.page_urls.len() + self.nested_sitemaps.len()
    }
}

/// Parse a sitemap or sitemap-index document, decompressing gzip payloads
/// on the fly.
pub fn parse_sitemap(data: &[u8]) -> Result<SitemapParse, SitemapError> {
    let bytes = maybe_gunzip(data)?;
    let mut parse = SitemapParse::default();

    let reader = SiteMapReader::new(Cursor::new(bytes));
    for entity in reader {
        if parse.url_count() >= MAX_SITEMAP_URLS {
            parse.truncated = true;
            break;
        }
        match entity {
            SiteMapEntity::Url(entry) => match entry.loc.get_url() {
                Some(url) => parse.page_urls.push(url.to_string()),
                None => parse.skipped += 1,
            },
            SiteMapEntity::SiteMap(entry) => match entry.loc.get_url() {
                Some(url) => parse.nested_sitemaps.push(url.to_string()),
                None => parse.skipped += 1,
            },
            _ => parse.skipped += 1,
        }
    }

    Ok(parse)
}

/// Decode gzip when the magic bytes say so, enforcing the uncompressed cap
fn maybe_gunzip(data: &[u8]) -> Result<Vec<u8>, SitemapError> {
    if data.len() < 2 || data[..2] != GZIP_MAGIC {
        if data.len() > MAX_SITEMAP_BYTES {
            return Err(SitemapError::TooLarge);
        }
        return Ok(data.to_vec());
    }

    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let n = decoder
            .read(&mut chunk)
            .map_err(|e| SitemapError::Gzip(e.to_string()))?;
        if n == 0 {
            break;
        }
        if out.len() + n > MAX_SITEMAP_BYTES {
            return Err(SitemapError::TooLarge);
        }
        out.extend_from_slice(&chunk[..n]);
    }
    Ok(out)
}

/// Heuristic used by the dispatcher: does this response look like a
/// sitemap document?
pub fn looks_like_sitemap(content_type: Option<&str>, path: &str) -> bool {
    if let Some(ct) = content_type {
        let essence = ct.split(';').next().unwrap_or_default().trim();
        if essence.ends_with("xml") || essence == "application/x-gzip" || essence == "application/gzip" {
            return true;
        }
    }
    let path = path.to_ascii_lowercase();
    path.ends_with(".xml") || path.ends_with(".xml.gz") || path.contains("sitemap")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn urlset(urls: &[&str]) -> String {
        let mut doc = String::from(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">"#,
        );
        for url in urls {
            doc.push_str(&format!("<url><loc>{url}</loc></url>"));
        }
        doc.push_str("</urlset>");
        doc
    }

    #[test]
    fn test_parses_urlset_in_order() {
        let doc = urlset(&[
            "http://a.example/1",
            "http://a.example/2",
            "http://a.example/3",
        ]);
        let parse = parse_sitemap(doc.as_bytes()).unwrap();
        assert_eq!(
            parse.page_urls,
            vec![
                "http://a.example/1",
                "http://a.example/2",
                "http://a.example/3"
            ]
        );
        assert!(!parse.truncated);
        assert_eq!(parse.skipped, 0);
    }

    #[test]
    fn test_parses_sitemap_index() {
        let doc = r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>http://a.example/sitemap-a.xml</loc></sitemap>
  <sitemap><loc>http://a.example/sitemap-b.xml</loc></sitemap>
</sitemapindex>"#;
        let parse = parse_sitemap(doc.as_bytes()).unwrap();
        assert!(parse.page_urls.is_empty());
        assert_eq!(
            parse.nested_sitemaps,
            vec![
                "http://a.example/sitemap-a.xml",
                "http://a.example/sitemap-b.xml"
            ]
        );
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let doc = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>http://a.example/good</loc></url>
  <url><loc>:: not a url ::</loc></url>
  <url><loc>http://a.example/also-good</loc></url>
</urlset>"#;
        let parse = parse_sitemap(doc.as_bytes()).unwrap();
        assert_eq!(parse.page_urls.len(), 2);
        assert_eq!(parse.skipped, 1);
    }

    #[test]
    fn test_gzip_payload_is_decoded() {
        let doc = urlset(&["http://a.example/z"]);
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(doc.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let parse = parse_sitemap(&compressed).unwrap();
        assert_eq!(parse.page_urls, vec!["http://a.example/z"]);
    }

    #[test]
    fn test_looks_like_sitemap() {
        assert!(looks_like_sitemap(Some("application/xml"), "/whatever"));
        assert!(looks_like_sitemap(Some("text/xml; charset=utf-8"), "/x"));
        assert!(looks_like_sitemap(None, "/sitemap.xml"));
        assert!(looks_like_sitemap(None, "/sitemap_index.xml.gz"));
        assert!(!looks_like_sitemap(Some("text/html"), "/page"));
    }

    #[test]
    fn test_well_formed_document_yields_exact_count() {
        let urls: Vec<String> = (0..100).map(|i| format!("http://a.example/p{i}")).collect();
        let refs: Vec<&str> = urls.iter().map(|s| s.as_str()).collect();
        let parse = parse_sitemap(urlset(&refs).as_bytes()).unwrap();
        assert_eq!(parse.page_urls.len(), 100);
    }
}
