//! URL value objects: normalization, fingerprinting, and authority handling.
//!
//! Every URL entering the crawl is canonicalized here once; the rest of the
//! engine only ever sees [`NormalizedUrl`] values. The fingerprint is a
//! stable 128-bit hash of the normalized form and is the sole dedup key.

use dashmap::DashSet;
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("URL has no host")]
    MissingHost,

    #[error("invalid url - too complex: {0}")]
    TooComplex(String),
}

/// Structural limits applied during normalization
#[derive(Debug, Clone)]
pub struct UrlLimits {
    pub max_url_length: usize,
    pub max_url_segments: usize,
    pub max_url_params: usize,
}

impl Default for UrlLimits {
    fn default() -> Self {
        Self {
            max_url_length: 2048,
            max_url_segments: 16,
            max_url_params: 32,
        }
    }
}

/// The (scheme, host, port) triple used for robots scoping and allowlist
/// comparison. Ports are always explicit internally; `Display` elides the
/// scheme default.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Authority {
    pub fn from_url(url: &Url) -> Result<Self, UrlError> {
        let host = url.host_str().ok_or(UrlError::MissingHost)?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| UrlError::UnsupportedScheme(url.scheme().to_string()))?;
        Ok(Self {
            scheme: url.scheme().to_string(),
            host: host.trim_end_matches('.').to_ascii_lowercase(),
            port,
        })
    }

    /// Parse an allowlist entry. Must be an absolute http(s) URL with an
    /// empty path, e.g. "https://example.com" or "http://example.com:8080".
    pub fn parse_domain(input: &str) -> Result<Self, UrlError> {
        let url = Url::parse(input).map_err(|e| UrlError::Parse(format!("{input}: {e}")))?;
        check_scheme(&url)?;
        if !matches!(url.path(), "" | "/") || url.query().is_some() || url.fragment().is_some() {
            return Err(UrlError::Parse(format!(
                "domain entry must not carry a path, query, or fragment: {input}"
            )));
        }
        Self::from_url(&url)
    }

    fn is_default_port(&self) -> bool {
        matches!(
            (self.scheme.as_str(), self.port),
            ("http", 80) | ("https", 443)
        )
    }

    /// The robots.txt location for this authority
    pub fn robots_url(&self) -> String {
        format!("{self}/robots.txt")
    }
}

impl std::fmt::Display for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_default_port() {
            write!(f, "{}://{}", self.scheme, self.host)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

/// Thread-safe set of crawlable authorities. Seeds are inserted at crawl
/// start, which is why this is not a frozen structure.
#[derive(Debug, Default)]
pub struct Allowlist {
    entries: DashSet<Authority>,
}

impl Allowlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, authority: Authority) -> bool {
        self.entries.insert(authority)
    }

    pub fn contains(&self, authority: &Authority) -> bool {
        self.entries.contains(authority)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Authority> {
        self.entries.iter().map(|a| a.clone()).collect()
    }
}

/// A parsed, canonicalized URL together with its stable fingerprint.
///
/// Invariant: two values with equal `as_str()` always carry equal
/// fingerprints, since the fingerprint is computed from the normalized
/// string alone.
#[derive(Debug, Clone)]
pub struct NormalizedUrl {
    inner: Url,
    normalized: String,
    fingerprint: u128,
}

impl NormalizedUrl {
    /// Parse and normalize an arbitrary URL string.
    ///
    /// Normalization order: scheme/host lowercasing and IDN conversion
    /// (done by the `url` crate on parse), trailing host dot removal,
    /// default port elision, fragment removal, duplicate-slash collapse
    /// and dot-segment resolution in the path, percent-decoding of
    /// unreserved characters, and query canonicalization (empty-value
    /// pairs dropped, key order and duplicate order preserved).
    pub fn parse(input: &str, limits: &UrlLimits) -> Result<Self, UrlError> {
        let url = Url::parse(input.trim()).map_err(|e| UrlError::Parse(format!("{input}: {e}")))?;
        Self::from_url(url, limits)
    }

    pub fn from_url(mut url: Url, limits: &UrlLimits) -> Result<Self, UrlError> {
        check_scheme(&url)?;
        let host = url
            .host_str()
            .ok_or(UrlError::MissingHost)?
            .trim_end_matches('.')
            .to_ascii_lowercase();
        url.set_host(Some(&host))
            .map_err(|e| UrlError::Parse(e.to_string()))?;
        url.set_fragment(None);

        let path = normalize_path(url.path());
        url.set_path(&path);

        if let Some(query) = url.query() {
            let pairs = canonical_query_pairs(query);
            if pairs.is_empty() {
                url.set_query(None);
            } else {
                let mut serializer = url::form_urlencoded::Serializer::new(String::new());
                for (k, v) in &pairs {
                    serializer.append_pair(k, v);
                }
                let canonical = serializer.finish();
                url.set_query(Some(&canonical));
            }
        }

        let normalized = render(&url);
        enforce_limits(&url, &normalized, limits)?;

        let fingerprint = fingerprint_of(&normalized);
        Ok(Self {
            inner: url,
            normalized,
            fingerprint,
        })
    }

    pub fn as_url(&self) -> &Url {
        &self.inner
    }

    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    pub fn fingerprint(&self) -> u128 {
        self.fingerprint
    }

    pub fn authority(&self) -> Authority {
        // Scheme was checked at construction, so this cannot fail.
        Authority {
            scheme: self.inner.scheme().to_string(),
            host: self
                .inner
                .host_str()
                .unwrap_or_default()
                .to_ascii_lowercase(),
            port: self.inner.port_or_known_default().unwrap_or(0),
        }
    }

    pub fn path(&self) -> &str {
        self.inner.path()
    }

    /// Resolve a possibly-relative link against this URL.
    pub fn join(&self, link: &str, limits: &UrlLimits) -> Result<Self, UrlError> {
        let joined = self
            .inner
            .join(link.trim())
            .map_err(|e| UrlError::Parse(format!("{link}: {e}")))?;
        Self::from_url(joined, limits)
    }
}

impl PartialEq for NormalizedUrl {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for NormalizedUrl {}

impl std::fmt::Display for NormalizedUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.normalized)
    }
}

fn check_scheme(url: &Url) -> Result<(), UrlError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(UrlError::UnsupportedScheme(other.to_string())),
    }
}

/// 128-bit fingerprint of a normalized URL string. SHA-256 truncated to
/// its first 16 bytes; stable across runs and platforms.
pub fn fingerprint_of(normalized: &str) -> u128 {
    let digest = Sha256::digest(normalized.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    u128::from_be_bytes(bytes)
}

/// Collapse duplicate slashes, resolve "." and ".." segments, and decode
/// unnecessarily percent-encoded characters. Dot segments never escape
/// the root.
fn normalize_path(path: &str) -> String {
    let mut segments: Vec<String> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                segments.pop();
            }
            other => segments.push(decode_unreserved(other)),
        }
    }

    let trailing_slash = path.ends_with('/') || path.ends_with("/.") || path.ends_with("/..");
    let mut out = String::with_capacity(path.len());
    for segment in &segments {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() || trailing_slash {
        out.push('/');
    }
    out
}

/// Percent-decode sequences whose decoded byte is an unreserved character;
/// everything else keeps its encoding, with hex digits uppercased.
fn decode_unreserved(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = String::with_capacity(segment.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &segment[i + 1..i + 3];
            if let Ok(value) = u8::from_str_radix(hex, 16) {
                if value.is_ascii_alphanumeric() || matches!(value, b'-' | b'.' | b'_' | b'~') {
                    out.push(value as char);
                } else {
                    out.push('%');
                    out.push_str(&hex.to_ascii_uppercase());
                }
                i += 3;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Keep query pairs in original order, duplicates included; only pairs
/// with an empty value are dropped. Key order is semantic, so sorting is
/// deliberately not performed.
fn canonical_query_pairs(query: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn render(url: &Url) -> String {
    let mut out = String::with_capacity(64);
    out.push_str(url.scheme());
    out.push_str("://");
    out.push_str(url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(url.path());
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

fn enforce_limits(url: &Url, normalized: &str, limits: &UrlLimits) -> Result<(), UrlError> {
    if normalized.len() > limits.max_url_length {
        return Err(UrlError::TooComplex(format!(
            "length {} exceeds {}",
            normalized.len(),
            limits.max_url_length
        )));
    }
    let segments = url.path().split('/').filter(|s| !s.is_empty()).count();
    if segments > limits.max_url_segments {
        return Err(UrlError::TooComplex(format!(
            "{segments} path segments exceed {}",
            limits.max_url_segments
        )));
    }
    let params = url
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).count())
        .unwrap_or(0);
    if params > limits.max_url_params {
        return Err(UrlError::TooComplex(format!(
            "{params} query params exceed {}",
            limits.max_url_params
        )));
    }
    Ok(())
}
