//! Thread-safe crawl counters and the duration histogram.
//!
//! Counters are plain atomics updated from events; the histogram sits
//! behind a fine-grained lock since observations are cheap and rare
//! relative to fetch latency.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Fixed-bucket latency histogram in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histogram {
    buckets: Vec<(u64, u64)>,
    sum_ms: u64,
    count: u64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: vec![
                (10, 0),
                (50, 0),
                (100, 0),
                (250, 0),
                (500, 0),
                (1000, 0),
                (2500, 0),
                (5000, 0),
                (u64::MAX, 0),
            ],
            sum_ms: 0,
            count: 0,
        }
    }

    pub fn observe(&mut self, value_ms: u64) {
        self.sum_ms += value_ms;
        self.count += 1;
        for (threshold, count) in &mut self.buckets {
            if value_ms <= *threshold {
                *count += 1;
                break;
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean_ms(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum_ms / self.count
        }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Stats {
    pub pages_visited: AtomicU64,
    pub bytes_downloaded: AtomicU64,
    pub links_extracted: AtomicU64,
    pub links_enqueued: AtomicU64,
    pub urls_dropped: AtomicU64,
    errors_by_kind: DashMap<String, u64>,
    durations: Mutex<Histogram>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            pages_visited: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            links_extracted: AtomicU64::new(0),
            links_enqueued: AtomicU64::new(0),
            urls_dropped: AtomicU64::new(0),
            errors_by_kind: DashMap::new(),
            durations: Mutex::new(Histogram::new()),
        }
    }

    pub fn record_page(&self, bytes: usize, duration_ms: u64) {
        self.pages_visited.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.durations.lock().observe(duration_ms);
    }

    pub fn record_error(&self, kind: &str) {
        *self.errors_by_kind.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn record_links(&self, extracted: usize, enqueued: usize) {
        self.links_extracted
            .fetch_add(extracted as u64, Ordering::Relaxed);
        self.links_enqueued
            .fetch_add(enqueued as u64, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.urls_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pages_visited: self.pages_visited.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            links_extracted: self.links_extracted.load(Ordering::Relaxed),
            links_enqueued: self.links_enqueued.load(Ordering::Relaxed),
            urls_dropped: self.urls_dropped.load(Ordering::Relaxed),
            errors_by_kind: self
                .errors_by_kind
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            durations: self.durations.lock().clone(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all counters, serialized into events and the
/// final crawl summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub pages_visited: u64,
    pub bytes_downloaded: u64,
    pub links_extracted: u64,
    pub links_enqueued: u64,
    pub urls_dropped: u64,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub durations: Histogram,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let errors: u64 = self.errors_by_kind.values().sum();
        write!(
            f,
            "{} pages, {} bytes, {} links extracted, {} enqueued, {} dropped, {} errors, mean fetch {}ms",
            self.pages_visited,
            self.bytes_downloaded,
            self.links_extracted,
            self.links_enqueued,
            self.urls_dropped,
            errors,
            self.durations.mean_ms()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets_and_mean() {
        let mut hist = Histogram::new();
        hist.observe(5);
        hist.observe(100);
        hist.observe(45);
        assert_eq!(hist.count(), 3);
        assert_eq!(hist.mean_ms(), 50);
    }

    #[test]
    fn test_histogram_catches_outliers() {
        let mut hist = Histogram::new();
        hist.observe(120_000);
        assert_eq!(hist.count(), 1);
    }

    #[test]
    fn test_counters() {
        let stats = Stats::new();
        stats.record_page(1024, 30);
        stats.record_page(2048, 70);
        stats.record_links(10, 4);
        stats.record_error("timeout");
        stats.record_error("timeout");
        stats.record_error("tls");
        stats.record_drop();

        let snap = stats.snapshot();
        assert_eq!(snap.pages_visited, 2);
        assert_eq!(snap.bytes_downloaded, 3072);
        assert_eq!(snap.links_extracted, 10);
        assert_eq!(snap.links_enqueued, 4);
        assert_eq!(snap.urls_dropped, 1);
        assert_eq!(snap.errors_by_kind["timeout"], 2);
        assert_eq!(snap.errors_by_kind["tls"], 1);
        assert_eq!(snap.durations.mean_ms(), 50);
    }

    #[test]
    fn test_snapshot_display() {
        let stats = Stats::new();
        stats.record_page(10, 20);
        let line = stats.snapshot().to_string();
        assert!(line.contains("1 pages"));
        assert!(line.contains("10 bytes"));
    }
}
