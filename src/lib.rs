pub mod backoff;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod extract;
pub mod logging;
pub mod models;
pub mod network;
pub mod queue;
pub mod resolver;
pub mod robots;
pub mod ruleset;
pub mod sink;
pub mod sitemaps;
pub mod stats;
pub mod urls;

use thiserror::Error;

/// Top-level error type for the crawler driver
#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("URL error: {0}")]
    Url(#[from] urls::UrlError),

    #[error("Queue error: {0}")]
    Queue(#[from] queue::QueueError),

    #[error("HTTP client error: {0}")]
    Fetch(#[from] network::FetchError),

    #[error("Output sink error: {0}")]
    Sink(#[from] sink::SinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CrawlerError>;

// Re-export main types for library usage
pub use config::CrawlConfig;
pub use coordinator::{CrawlCoordinator, CrawlSummary, EndReason};
pub use models::{CrawlResult, CrawlTask, DiscoveredVia, FATAL_ERROR_STATUS};
pub use network::{Fetcher, HttpClient};
pub use queue::{EnqueueOutcome, UrlQueue, VisitedSet};
pub use robots::{RobotsRecord, RobotsService};
pub use stats::{Stats, StatsSnapshot};
pub use urls::{Allowlist, Authority, NormalizedUrl};
