//! Crawl configuration: recognized options, defaults, and validation.
//!
//! Loaded from TOML or built in code. Validation runs once at startup and
//! any failure is fatal before the crawl begins. Certificate material is
//! parsed here so the engine only ever consumes ready-made certificates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resolver::ResolvePolicy;
use crate::urls::{Authority, UrlError, UrlLimits};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid domain entry: {0}")]
    InvalidDomain(#[from] UrlError),

    #[error("Invalid CA certificate: {0}")]
    Certificate(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslVerificationMode {
    Full,
    Certificate,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub http_proxy_host: String,
    #[serde(default = "default_proxy_port")]
    pub http_proxy_port: u16,
    #[serde(default = "default_proxy_protocol")]
    pub http_proxy_protocol: String,
    #[serde(default)]
    pub http_proxy_username: Option<String>,
    #[serde(default)]
    pub http_proxy_password: Option<String>,
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_proxy_protocol() -> String {
    "http".to_string()
}

/// Per-host basic-auth credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthEntry {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlFilterKind {
    Begins,
    Ends,
    Contains,
    Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlFilterConfig {
    #[serde(rename = "type")]
    pub kind: UrlFilterKind,
    pub pattern: String,
}

/// A single field-extraction rule; either a CSS selector or a regex with
/// one capture group, applied to HTML results only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRuleConfig {
    pub name: String,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainRulesConfig {
    #[serde(default)]
    pub url_filters: Vec<UrlFilterConfig>,
    #[serde(default)]
    pub rules: Vec<FieldRuleConfig>,
}

/// The full set of recognized crawl options. Field names follow the
/// external configuration surface; defaults match the documented values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub crawl_id: Option<String>,
    pub domain_allowlist: Vec<String>,
    pub seed_urls: Vec<String>,
    pub sitemap_urls: Vec<String>,
    pub user_agent: Option<String>,

    pub output_sink: String,
    pub output_dir: Option<PathBuf>,

    pub url_queue: String,
    pub url_queue_size_limit: usize,

    pub max_duration: u64,
    pub max_crawl_depth: u32,
    pub max_unique_url_count: usize,
    pub max_url_length: usize,
    pub max_url_segments: usize,
    pub max_url_params: usize,
    pub threads_per_crawl: usize,

    pub max_redirects: u32,
    pub max_response_size: usize,
    pub connect_timeout: u64,
    pub socket_timeout: u64,
    pub request_timeout: u64,

    pub max_title_size: usize,
    pub max_body_size: usize,
    pub max_keywords_size: usize,
    pub max_description_size: usize,
    pub max_extracted_links_count: usize,
    pub max_indexed_links_count: usize,
    pub max_headings_count: usize,

    pub content_extraction_enabled: bool,
    pub content_extraction_mime_types: Vec<String>,

    pub default_encoding: String,
    pub compression_enabled: bool,
    pub sitemap_discovery_disabled: bool,
    pub head_requests_enabled: bool,

    /// PEM strings or paths to PEM files
    pub ssl_ca_certificates: Vec<String>,
    pub ssl_verification_mode: SslVerificationMode,

    pub http_proxy: Option<ProxyConfig>,

    pub loopback_allowed: bool,
    pub private_networks_allowed: bool,

    pub http_auth_allowed: bool,
    /// host -> credentials
    pub auth: HashMap<String, AuthEntry>,

    /// domain -> extraction rules and URL filters
    pub domains_extraction_rules: HashMap<String, DomainRulesConfig>,

    pub stats_dump_interval: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            crawl_id: None,
            domain_allowlist: Vec::new(),
            seed_urls: Vec::new(),
            sitemap_urls: Vec::new(),
            user_agent: None,
            output_sink: "console".to_string(),
            output_dir: None,
            url_queue: "memory_only".to_string(),
            url_queue_size_limit: 10_000,
            max_duration: 86_400,
            max_crawl_depth: 10,
            max_unique_url_count: 100_000,
            max_url_length: 2048,
            max_url_segments: 16,
            max_url_params: 32,
            threads_per_crawl: 10,
            max_redirects: 10,
            max_response_size: 10 * 1024 * 1024,
            connect_timeout: 10,
            socket_timeout: 10,
            request_timeout: 60,
            max_title_size: 1024,
            max_body_size: 5 * 1024 * 1024,
            max_keywords_size: 512,
            max_description_size: 1024,
            max_extracted_links_count: 1000,
            max_indexed_links_count: 25,
            max_headings_count: 25,
            content_extraction_enabled: false,
            content_extraction_mime_types: Vec::new(),
            default_encoding: "UTF-8".to_string(),
            compression_enabled: true,
            sitemap_discovery_disabled: false,
            head_requests_enabled: false,
            ssl_ca_certificates: Vec::new(),
            ssl_verification_mode: SslVerificationMode::Full,
            http_proxy: None,
            loopback_allowed: false,
            private_networks_allowed: false,
            http_auth_allowed: false,
            auth: HashMap::new(),
            domains_extraction_rules: HashMap::new(),
            stats_dump_interval: 10,
        }
    }
}

impl CrawlConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain_allowlist.is_empty() {
            return Err(ConfigError::Validation(
                "domain_allowlist must not be empty".to_string(),
            ));
        }
        for entry in &self.domain_allowlist {
            Authority::parse_domain(entry)?;
        }
        if self.seed_urls.is_empty() {
            return Err(ConfigError::Validation(
                "seed_urls must not be empty".to_string(),
            ));
        }
        if self.threads_per_crawl == 0 {
            return Err(ConfigError::Validation(
                "threads_per_crawl must be at least 1".to_string(),
            ));
        }
        if self.url_queue_size_limit == 0 {
            return Err(ConfigError::Validation(
                "url_queue_size_limit must be at least 1".to_string(),
            ));
        }
        if self.max_crawl_depth == 0 {
            return Err(ConfigError::Validation(
                "max_crawl_depth must be at least 1".to_string(),
            ));
        }
        if self.max_unique_url_count == 0 {
            return Err(ConfigError::Validation(
                "max_unique_url_count must be at least 1".to_string(),
            ));
        }
        if self.content_extraction_enabled && self.content_extraction_mime_types.is_empty() {
            return Err(ConfigError::Validation(
                "content_extraction_enabled requires content_extraction_mime_types".to_string(),
            ));
        }
        if self.output_sink == "file" && self.output_dir.is_none() {
            return Err(ConfigError::Validation(
                "output_sink = \"file\" requires output_dir".to_string(),
            ));
        }
        Ok(())
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("Elastic-Crawler/{VERSION}"))
    }

    /// Crawl id used to tag logs and events; generated when absent.
    pub fn crawl_id(&self) -> String {
        self.crawl_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn url_limits(&self) -> UrlLimits {
        UrlLimits {
            max_url_length: self.max_url_length,
            max_url_segments: self.max_url_segments,
            max_url_params: self.max_url_params,
        }
    }

    pub fn resolve_policy(&self) -> ResolvePolicy {
        ResolvePolicy {
            loopback_allowed: self.loopback_allowed,
            private_networks_allowed: self.private_networks_allowed,
        }
    }

    pub fn allowlist_authorities(&self) -> Result<Vec<Authority>, ConfigError> {
        self.domain_allowlist
            .iter()
            .map(|d| Authority::parse_domain(d).map_err(ConfigError::from))
            .collect()
    }

    /// Parse configured CA material into certificates. Each entry is either
    /// inline PEM or a path to a PEM file.
    pub fn ca_certificates(&self) -> Result<Vec<reqwest::Certificate>, ConfigError> {
        let mut certs = Vec::new();
        for entry in &self.ssl_ca_certificates {
            let pem = if entry.contains("-----BEGIN") {
                entry.clone().into_bytes()
            } else {
                std::fs::read(entry)?
            };
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ConfigError::Certificate(e.to_string()))?;
            certs.push(cert);
        }
        Ok(certs)
    }

    pub fn proxy_url(&self) -> Option<String> {
        self.http_proxy.as_ref().map(|p| {
            format!(
                "{}://{}:{}",
                p.http_proxy_protocol, p.http_proxy_host, p.http_proxy_port
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> CrawlConfig {
        CrawlConfig {
            domain_allowlist: vec!["http://a.example".to_string()],
            seed_urls: vec!["http://a.example/".to_string()],
            ..CrawlConfig::default()
        }
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = CrawlConfig::default();
        assert_eq!(config.max_duration, 86_400);
        assert_eq!(config.max_crawl_depth, 10);
        assert_eq!(config.max_unique_url_count, 100_000);
        assert_eq!(config.max_url_length, 2048);
        assert_eq!(config.threads_per_crawl, 10);
        assert_eq!(config.max_response_size, 10 * 1024 * 1024);
        assert_eq!(config.max_indexed_links_count, 25);
        assert_eq!(config.default_encoding, "UTF-8");
        assert!(config.compression_enabled);
        assert!(!config.head_requests_enabled);
        assert!(!config.loopback_allowed);
    }

    #[test]
    fn test_validate_requires_allowlist_and_seeds() {
        let mut config = CrawlConfig::default();
        assert!(config.validate().is_err());

        config.domain_allowlist = vec!["http://a.example".to_string()];
        assert!(config.validate().is_err());

        config.seed_urls = vec!["http://a.example/".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_domain_with_path() {
        let mut config = minimal();
        config.domain_allowlist = vec!["http://a.example/path".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_file_sink_requires_dir() {
        let mut config = minimal();
        config.output_sink = "file".to_string();
        assert!(config.validate().is_err());
        config.output_dir = Some(PathBuf::from("/tmp/out"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_user_agent_default() {
        let config = minimal();
        assert_eq!(config.user_agent(), format!("Elastic-Crawler/{VERSION}"));

        let mut config = minimal();
        config.user_agent = Some("CustomBot/2.0".to_string());
        assert_eq!(config.user_agent(), "CustomBot/2.0");
    }

    #[test]
    fn test_crawl_id_generated_when_absent() {
        let config = minimal();
        let id = config.crawl_id();
        assert!(!id.is_empty());

        let mut config = minimal();
        config.crawl_id = Some("crawl-7".to_string());
        assert_eq!(config.crawl_id(), "crawl-7");
    }

    #[test]
    fn test_toml_round_trip() {
        let raw = r#"
            domain_allowlist = ["http://a.example"]
            seed_urls = ["http://a.example/"]
            max_crawl_depth = 3
            output_sink = "console"

            [domains_extraction_rules."http://a.example"]
            url_filters = [{ type = "begins", pattern = "/docs" }]
            rules = [{ name = "author", selector = "meta[name=author]" }]
        "#;
        let config: CrawlConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.max_crawl_depth, 3);
        let rules = &config.domains_extraction_rules["http://a.example"];
        assert_eq!(rules.url_filters.len(), 1);
        assert_eq!(rules.url_filters[0].kind, UrlFilterKind::Begins);
        assert_eq!(rules.rules[0].name, "author");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_proxy_url() {
        let mut config = minimal();
        assert!(config.proxy_url().is_none());
        config.http_proxy = Some(ProxyConfig {
            http_proxy_host: "proxy.example".to_string(),
            http_proxy_port: 3128,
            http_proxy_protocol: "http".to_string(),
            http_proxy_username: None,
            http_proxy_password: None,
        });
        assert_eq!(config.proxy_url().unwrap(), "http://proxy.example:3128");
    }
}
