//! Core crawl data types: tasks entering the queue and result records
//! leaving the engine.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::urls::NormalizedUrl;

/// Status sentinel recorded on fatal error results. Deliberately outside
/// the HTTP status code range.
pub const FATAL_ERROR_STATUS: u16 = 999;

/// How a URL entered the crawl
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveredVia {
    Seed,
    Sitemap,
    HtmlLink,
    RobotsRedirect,
}

/// A unit of crawl work. Immutable once enqueued.
#[derive(Debug, Clone)]
pub struct CrawlTask {
    pub url: NormalizedUrl,
    pub depth: u32,
    pub referer: Option<String>,
    pub discovered_via: DiscoveredVia,
}

impl CrawlTask {
    pub fn seed(url: NormalizedUrl) -> Self {
        Self {
            url,
            depth: 1,
            referer: None,
            discovered_via: DiscoveredVia::Seed,
        }
    }

    pub fn from_sitemap(url: NormalizedUrl, referer: Option<String>) -> Self {
        Self {
            url,
            depth: 1,
            referer,
            discovered_via: DiscoveredVia::Sitemap,
        }
    }

    /// A sitemap location reached through a robots.txt declaration
    pub fn from_robots(url: NormalizedUrl, referer: Option<String>) -> Self {
        Self {
            url,
            depth: 1,
            referer,
            discovered_via: DiscoveredVia::RobotsRedirect,
        }
    }

    pub fn child_of(parent: &CrawlTask, url: NormalizedUrl) -> Self {
        Self {
            url,
            depth: parent.depth + 1,
            referer: Some(parent.url.as_str().to_string()),
            discovered_via: DiscoveredVia::HtmlLink,
        }
    }
}

/// Attributes shared by every result variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMeta {
    pub id: Uuid,
    pub url: String,
    pub status_code: u16,
    pub content_type: Option<String>,
    /// Unix milliseconds
    pub start_time: u64,
    pub end_time: u64,
    pub duration_ms: u64,
}

impl ResultMeta {
    pub fn new(url: &NormalizedUrl, status_code: u16, content_type: Option<String>) -> Self {
        let now = unix_millis();
        Self {
            id: Uuid::new_v4(),
            url: url.as_str().to_string(),
            status_code,
            content_type,
            start_time: now,
            end_time: now,
            duration_ms: 0,
        }
    }

    pub fn timed(mut self, start: SystemTime, end: SystemTime) -> Self {
        self.start_time = to_millis(start);
        self.end_time = to_millis(end);
        self.duration_ms = self.end_time.saturating_sub(self.start_time);
        self
    }
}

fn unix_millis() -> u64 {
    to_millis(SystemTime::now())
}

fn to_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Classification carried by error results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Fatal,
    UnsupportedContentType,
}

/// The outcome of crawling one URL, emitted to the output sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrawlResult {
    Html {
        #[serde(flatten)]
        meta: ResultMeta,
        title: Option<String>,
        body: String,
        meta_keywords: Option<String>,
        meta_description: Option<String>,
        headings: Vec<String>,
        links: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        extracted_fields: BTreeMap<String, String>,
    },
    Sitemap {
        #[serde(flatten)]
        meta: ResultMeta,
        url_count: usize,
    },
    RobotsTxt {
        #[serde(flatten)]
        meta: ResultMeta,
    },
    ContentFile {
        #[serde(flatten)]
        meta: ResultMeta,
        body: String,
    },
    Redirect {
        #[serde(flatten)]
        meta: ResultMeta,
        location: String,
    },
    Error {
        #[serde(flatten)]
        meta: ResultMeta,
        class: ErrorClass,
        message: String,
    },
}

impl CrawlResult {
    pub fn meta(&self) -> &ResultMeta {
        match self {
            CrawlResult::Html { meta, .. }
            | CrawlResult::Sitemap { meta, .. }
            | CrawlResult::RobotsTxt { meta }
            | CrawlResult::ContentFile { meta, .. }
            | CrawlResult::Redirect { meta, .. }
            | CrawlResult::Error { meta, .. } => meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ResultMeta {
        match self {
            CrawlResult::Html { meta, .. }
            | CrawlResult::Sitemap { meta, .. }
            | CrawlResult::RobotsTxt { meta }
            | CrawlResult::ContentFile { meta, .. }
            | CrawlResult::Redirect { meta, .. }
            | CrawlResult::Error { meta, .. } => meta,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CrawlResult::Error { .. })
    }

    /// Short variant label used by events and stats
    pub fn kind_label(&self) -> &'static str {
        match self {
            CrawlResult::Html { .. } => "html",
            CrawlResult::Sitemap { .. } => "sitemap",
            CrawlResult::RobotsTxt { .. } => "robots_txt",
            CrawlResult::ContentFile { .. } => "content_file",
            CrawlResult::Redirect { .. } => "redirect",
            CrawlResult::Error { .. } => "error",
        }
    }

    pub fn fatal_error(url: &NormalizedUrl, message: String) -> Self {
        CrawlResult::Error {
            meta: ResultMeta::new(url, FATAL_ERROR_STATUS, None),
            class: ErrorClass::Fatal,
            message,
        }
    }

    pub fn transient_error(url: &NormalizedUrl, status_code: u16, message: String) -> Self {
        CrawlResult::Error {
            meta: ResultMeta::new(url, status_code, None),
            class: ErrorClass::Transient,
            message,
        }
    }

    pub fn unsupported_content_type(
        url: &NormalizedUrl,
        status_code: u16,
        content_type: Option<String>,
    ) -> Self {
        let message = format!(
            "unsupported content type: {}",
            content_type.as_deref().unwrap_or("unknown")
        );
        CrawlResult::Error {
            meta: ResultMeta::new(url, status_code, content_type),
            class: ErrorClass::UnsupportedContentType,
            message,
        }
    }
}
