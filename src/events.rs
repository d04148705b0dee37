//! Lifecycle events raised by the engine.
//!
//! Events serve two consumers: the stats aggregator (updated inline) and
//! an external event sink that receives each event as one JSON line.
//! Emission is serialized through a single lock so sinks never see
//! interleaved writes.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::stats::{Stats, StatsSnapshot};

/// Why a task was removed before fetching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    RobotsDisallowed,
    DepthExceeded,
    Duplicate,
    QueueFull,
    NotAllowlisted,
    InvalidUrl,
    FilteredOut,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::RobotsDisallowed => "robots_disallowed",
            DropReason::DepthExceeded => "depth_exceeded",
            DropReason::Duplicate => "duplicate",
            DropReason::QueueFull => "queue_full",
            DropReason::NotAllowlisted => "not_allowlisted",
            DropReason::InvalidUrl => "invalid_url",
            DropReason::FilteredOut => "filtered_out",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum CrawlEvent {
    CrawlStart {
        crawl_id: String,
    },
    CrawlEnd {
        crawl_id: String,
        reason: String,
        stats: StatsSnapshot,
    },
    UrlFetchStart {
        url: String,
    },
    UrlFetchEnd {
        url: String,
        result_kind: String,
        status: u16,
        bytes: usize,
    },
    UrlDiscover {
        from: String,
        to: String,
    },
    UrlDrop {
        url: String,
        reason: DropReason,
    },
    RobotsFetched {
        authority: String,
        is_fallback: bool,
    },
    Warning {
        message: String,
    },
    Error {
        kind: String,
        url: String,
    },
    StatsSnapshot {
        stats: StatsSnapshot,
    },
}

/// Consumer of serialized events; must tolerate concurrent callers or be
/// wrapped by one (the bus serializes either way).
pub trait EventSink: Send + Sync {
    fn emit_event(&self, line: &str);
}

/// Default sink: events land in the structured log stream.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit_event(&self, line: &str) {
        tracing::debug!(target: "crawl_events", "{line}");
    }
}

pub struct EventBus {
    sink: Mutex<Box<dyn EventSink>>,
    stats: Arc<Stats>,
}

impl EventBus {
    pub fn new(sink: Box<dyn EventSink>, stats: Arc<Stats>) -> Self {
        Self {
            sink: Mutex::new(sink),
            stats,
        }
    }

    pub fn with_tracing(stats: Arc<Stats>) -> Self {
        Self::new(Box::new(TracingEventSink), stats)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn emit(&self, event: CrawlEvent) {
        match &event {
            CrawlEvent::UrlDrop { .. } => self.stats.record_drop(),
            CrawlEvent::Error { kind, .. } => self.stats.record_error(kind),
            _ => {}
        }

        match serde_json::to_string(&event) {
            Ok(line) => self.sink.lock().emit_event(&line),
            Err(e) => tracing::warn!("failed to serialize event: {e}"),
        }
    }
}
