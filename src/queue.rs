//! URL queues with fingerprint dedup, bounded capacity, and backpressure.
//!
//! Backends sit behind [`UrlQueue`] and are looked up by name in a small
//! registry. Both backends share the same dedup rule: the fingerprint is
//! checked and inserted atomically under the queue lock, so a URL can be
//! enqueued at most once per crawl no matter how many producers race.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::Mutex;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use thiserror::Error;
use tokio::sync::Notify;

use crate::config::CrawlConfig;
use crate::models::{CrawlTask, DiscoveredVia};
use crate::urls::{NormalizedUrl, UrlLimits};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("queue is full")]
    Full,

    #[error("unique URL budget exhausted")]
    BudgetExhausted,

    #[error("unknown queue backend: {0}")]
    UnknownBackend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Fingerprint already seen; the call was an idempotent no-op
    Duplicate,
}

/// Set of fingerprints already enqueued this crawl, bounded by the unique
/// URL budget. Membership reads are lock-free; inserts go through the
/// queue lock, which keeps the budget check exact.
#[derive(Debug)]
pub struct VisitedSet {
    set: DashSet<u128>,
    cap: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOutcome {
    Inserted,
    Seen,
    Exhausted,
}

impl VisitedSet {
    pub fn new(cap: usize) -> Self {
        Self {
            set: DashSet::new(),
            cap,
        }
    }

    pub fn contains(&self, fingerprint: u128) -> bool {
        self.set.contains(&fingerprint)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn is_exhausted(&self) -> bool {
        self.set.len() >= self.cap
    }

    fn try_insert(&self, fingerprint: u128) -> VisitOutcome {
        if self.set.contains(&fingerprint) {
            return VisitOutcome::Seen;
        }
        if self.set.len() >= self.cap {
            return VisitOutcome::Exhausted;
        }
        if self.set.insert(fingerprint) {
            VisitOutcome::Inserted
        } else {
            VisitOutcome::Seen
        }
    }
}

#[async_trait]
pub trait UrlQueue: Send + Sync {
    /// Thread-safe enqueue with dedup and backpressure. `Full` and
    /// `BudgetExhausted` are the caller's signal to drop or terminate.
    fn enqueue(&self, task: CrawlTask) -> Result<EnqueueOutcome, QueueError>;

    /// Wait for the next task. Returns `None` once the queue is closed
    /// and fully drained.
    async fn dequeue(&self) -> Option<CrawlTask>;

    /// Irreversible. Pending items still drain; new enqueues fail.
    fn close(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// In-memory backend

pub struct MemoryQueue {
    inner: Mutex<VecDeque<CrawlTask>>,
    closed: AtomicBool,
    notify: Notify,
    limit: usize,
    visited: Arc<VisitedSet>,
}

impl MemoryQueue {
    pub fn new(limit: usize, visited: Arc<VisitedSet>) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            limit,
            visited,
        }
    }
}

#[async_trait]
impl UrlQueue for MemoryQueue {
    fn enqueue(&self, task: CrawlTask) -> Result<EnqueueOutcome, QueueError> {
        let mut queue = self.inner.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        if queue.len() >= self.limit {
            return Err(QueueError::Full);
        }
        match self.visited.try_insert(task.url.fingerprint()) {
            VisitOutcome::Seen => Ok(EnqueueOutcome::Duplicate),
            VisitOutcome::Exhausted => Err(QueueError::BudgetExhausted),
            VisitOutcome::Inserted => {
                queue.push_back(task);
                drop(queue);
                self.notify.notify_one();
                Ok(EnqueueOutcome::Enqueued)
            }
        }
    }

    async fn dequeue(&self) -> Option<CrawlTask> {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.inner.lock();
                if let Some(task) = queue.pop_front() {
                    if !queue.is_empty() {
                        // Pass the wakeup along so sibling consumers keep draining
                        self.notify.notify_one();
                    }
                    return Some(task);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

// ---------------------------------------------------------------------------
// File-backed backend

/// On-disk task record, length-prefixed rkyv framing
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
struct SpillRecord {
    url: String,
    depth: u32,
    referer: Option<String>,
    via: u8,
}

impl SpillRecord {
    fn from_task(task: &CrawlTask) -> Self {
        let via = match task.discovered_via {
            DiscoveredVia::Seed => 0,
            DiscoveredVia::Sitemap => 1,
            DiscoveredVia::HtmlLink => 2,
            DiscoveredVia::RobotsRedirect => 3,
        };
        Self {
            url: task.url.as_str().to_string(),
            depth: task.depth,
            referer: task.referer.clone(),
            via,
        }
    }

    fn into_task(self, limits: &UrlLimits) -> Option<CrawlTask> {
        let url = NormalizedUrl::parse(&self.url, limits).ok()?;
        let discovered_via = match self.via {
            0 => DiscoveredVia::Seed,
            1 => DiscoveredVia::Sitemap,
            3 => DiscoveredVia::RobotsRedirect,
            _ => DiscoveredVia::HtmlLink,
        };
        Some(CrawlTask {
            url,
            depth: self.depth,
            referer: self.referer,
            discovered_via,
        })
    }
}

struct SpillState {
    mem: VecDeque<CrawlTask>,
    disk_count: usize,
    read_offset: u64,
}

/// Bounded queue that keeps a memory window and spills overflow to a
/// length-prefixed record file, refilling the window in FIFO order as it
/// drains. Dedup and budget behave exactly like the memory backend.
pub struct FileBackedQueue {
    state: Mutex<SpillState>,
    closed: AtomicBool,
    notify: Notify,
    limit: usize,
    mem_window: usize,
    spill_path: PathBuf,
    visited: Arc<VisitedSet>,
    limits: UrlLimits,
}

const DEFAULT_MEM_WINDOW: usize = 1024;

impl FileBackedQueue {
    pub fn new(
        dir: &std::path::Path,
        limit: usize,
        visited: Arc<VisitedSet>,
        limits: UrlLimits,
    ) -> Result<Self, QueueError> {
        std::fs::create_dir_all(dir)?;
        let spill_path = dir.join("queue.spill");
        // A crawl never resumes another crawl's spill
        if spill_path.exists() {
            std::fs::remove_file(&spill_path)?;
        }
        Ok(Self {
            state: Mutex::new(SpillState {
                mem: VecDeque::new(),
                disk_count: 0,
                read_offset: 0,
            }),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            limit,
            mem_window: DEFAULT_MEM_WINDOW.min(limit.max(1)),
            spill_path,
            visited,
            limits,
        })
    }

    fn append_record(&self, task: &CrawlTask) -> Result<(), QueueError> {
        let record = SpillRecord::from_task(task);
        let bytes = rkyv::to_bytes::<_, 1024>(&record)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.spill_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Refill the memory window from disk. Caller holds the state lock.
    fn refill(&self, state: &mut SpillState) -> Result<(), QueueError> {
        if state.disk_count == 0 {
            return Ok(());
        }
        let mut file = File::open(&self.spill_path)?;
        file.seek(SeekFrom::Start(state.read_offset))?;

        while state.mem.len() < self.mem_window && state.disk_count > 0 {
            let mut len_bytes = [0u8; 4];
            file.read_exact(&mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut record_bytes = vec![0u8; len];
            file.read_exact(&mut record_bytes)?;
            state.read_offset += 4 + len as u64;
            state.disk_count -= 1;

            // Records come from our own spill file written above
            let record: SpillRecord = unsafe { rkyv::from_bytes_unchecked(&record_bytes) }
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            if let Some(task) = record.into_task(&self.limits) {
                state.mem.push_back(task);
            }
        }

        // Drop the file once everything has been read back
        if state.disk_count == 0 {
            let _ = std::fs::remove_file(&self.spill_path);
            state.read_offset = 0;
        }
        Ok(())
    }
}

#[async_trait]
impl UrlQueue for FileBackedQueue {
    fn enqueue(&self, task: CrawlTask) -> Result<EnqueueOutcome, QueueError> {
        let mut state = self.state.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        if state.mem.len() + state.disk_count >= self.limit {
            return Err(QueueError::Full);
        }
        match self.visited.try_insert(task.url.fingerprint()) {
            VisitOutcome::Seen => Ok(EnqueueOutcome::Duplicate),
            VisitOutcome::Exhausted => Err(QueueError::BudgetExhausted),
            VisitOutcome::Inserted => {
                // FIFO: once anything sits on disk, new items must follow it
                if state.disk_count == 0 && state.mem.len() < self.mem_window {
                    state.mem.push_back(task);
                } else {
                    self.append_record(&task)?;
                    state.disk_count += 1;
                }
                drop(state);
                self.notify.notify_one();
                Ok(EnqueueOutcome::Enqueued)
            }
        }
    }

    async fn dequeue(&self) -> Option<CrawlTask> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.mem.is_empty() && state.disk_count > 0 {
                    if let Err(e) = self.refill(&mut state) {
                        tracing::error!("queue spill refill failed: {e}");
                        state.disk_count = 0;
                    }
                }
                if let Some(task) = state.mem.pop_front() {
                    if !state.mem.is_empty() || state.disk_count > 0 {
                        self.notify.notify_one();
                    }
                    return Some(task);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn len(&self) -> usize {
        let state = self.state.lock();
        state.mem.len() + state.disk_count
    }
}

// ---------------------------------------------------------------------------
// Backend registry

type QueueConstructor =
    fn(&CrawlConfig, Arc<VisitedSet>) -> Result<Arc<dyn UrlQueue>, QueueError>;

fn build_memory(
    config: &CrawlConfig,
    visited: Arc<VisitedSet>,
) -> Result<Arc<dyn UrlQueue>, QueueError> {
    Ok(Arc::new(MemoryQueue::new(
        config.url_queue_size_limit,
        visited,
    )))
}

fn build_file_backed(
    config: &CrawlConfig,
    visited: Arc<VisitedSet>,
) -> Result<Arc<dyn UrlQueue>, QueueError> {
    let dir = config
        .output_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir)
        .join("url_queue");
    Ok(Arc::new(FileBackedQueue::new(
        &dir,
        config.url_queue_size_limit,
        visited,
        config.url_limits(),
    )?))
}

const REGISTRY: &[(&str, QueueConstructor)] = &[
    ("memory_only", build_memory),
    ("file_backed", build_file_backed),
];

/// Look up a queue backend by its configured name
pub fn build_queue(
    config: &CrawlConfig,
    visited: Arc<VisitedSet>,
) -> Result<Arc<dyn UrlQueue>, QueueError> {
    let name = config.url_queue.as_str();
    REGISTRY
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, build)| build(config, visited))
        .unwrap_or_else(|| Err(QueueError::UnknownBackend(name.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urls::NormalizedUrl;
    use tempfile::TempDir;

    fn task(url: &str) -> CrawlTask {
        CrawlTask::seed(NormalizedUrl::parse(url, &UrlLimits::default()).unwrap())
    }

    fn memory(limit: usize, cap: usize) -> MemoryQueue {
        MemoryQueue::new(limit, Arc::new(VisitedSet::new(cap)))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = memory(10, 100);
        queue.enqueue(task("http://a.example/1")).unwrap();
        queue.enqueue(task("http://a.example/2")).unwrap();
        queue.enqueue(task("http://a.example/3")).unwrap();

        assert_eq!(queue.dequeue().await.unwrap().url.as_str(), "http://a.example/1");
        assert_eq!(queue.dequeue().await.unwrap().url.as_str(), "http://a.example/2");
        assert_eq!(queue.dequeue().await.unwrap().url.as_str(), "http://a.example/3");
    }

    #[tokio::test]
    async fn test_duplicate_is_idempotent_noop() {
        let queue = memory(10, 100);
        assert_eq!(
            queue.enqueue(task("http://a.example/x")).unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            queue.enqueue(task("http://a.example/x")).unwrap(),
            EnqueueOutcome::Duplicate
        );
        // Normalization-equivalent spelling is also a duplicate
        assert_eq!(
            queue.enqueue(task("HTTP://A.EXAMPLE:80/x")).unwrap(),
            EnqueueOutcome::Duplicate
        );
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_full_at_limit() {
        let queue = memory(2, 100);
        queue.enqueue(task("http://a.example/1")).unwrap();
        queue.enqueue(task("http://a.example/2")).unwrap();
        let err = queue.enqueue(task("http://a.example/3"));
        assert!(matches!(err, Err(QueueError::Full)));
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let queue = memory(10, 2);
        queue.enqueue(task("http://a.example/1")).unwrap();
        queue.enqueue(task("http://a.example/2")).unwrap();
        let err = queue.enqueue(task("http://a.example/3"));
        assert!(matches!(err, Err(QueueError::BudgetExhausted)));
        // A duplicate of an already-budgeted URL is still a no-op, not an error
        assert_eq!(
            queue.enqueue(task("http://a.example/1")).unwrap(),
            EnqueueOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = memory(10, 100);
        queue.enqueue(task("http://a.example/1")).unwrap();
        queue.close();

        assert!(matches!(
            queue.enqueue(task("http://a.example/2")),
            Err(QueueError::Closed)
        ));
        assert!(queue.dequeue().await.is_some());
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(memory(10, 100));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.enqueue(task("http://a.example/1")).unwrap();
        let got = consumer.await.unwrap();
        assert_eq!(got.unwrap().url.as_str(), "http://a.example/1");
    }

    #[tokio::test]
    async fn test_concurrent_producers_single_winner() {
        let queue = Arc::new(memory(1000, 1000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut enqueued = 0;
                for i in 0..50 {
                    if let Ok(EnqueueOutcome::Enqueued) =
                        queue.enqueue(task(&format!("http://a.example/p{i}")))
                    {
                        enqueued += 1;
                    }
                }
                enqueued
            }));
        }
        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        // 8 producers raced over the same 50 URLs; each won exactly once
        assert_eq!(total, 50);
        assert_eq!(queue.len(), 50);
    }

    #[tokio::test]
    async fn test_file_backed_spills_and_preserves_order() {
        let dir = TempDir::new().unwrap();
        let queue = FileBackedQueue::new(
            dir.path(),
            5000,
            Arc::new(VisitedSet::new(5000)),
            UrlLimits::default(),
        )
        .unwrap();

        let count = DEFAULT_MEM_WINDOW + 50;
        for i in 0..count {
            queue.enqueue(task(&format!("http://a.example/p{i}"))).unwrap();
        }
        assert_eq!(queue.len(), count);

        for i in 0..count {
            let got = queue.dequeue().await.unwrap();
            assert_eq!(got.url.as_str(), format!("http://a.example/p{i}"));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_file_backed_dedup_and_limit() {
        let dir = TempDir::new().unwrap();
        let queue = FileBackedQueue::new(
            dir.path(),
            2,
            Arc::new(VisitedSet::new(100)),
            UrlLimits::default(),
        )
        .unwrap();

        queue.enqueue(task("http://a.example/1")).unwrap();
        assert_eq!(
            queue.enqueue(task("http://a.example/1")).unwrap(),
            EnqueueOutcome::Duplicate
        );
        queue.enqueue(task("http://a.example/2")).unwrap();
        assert!(matches!(
            queue.enqueue(task("http://a.example/3")),
            Err(QueueError::Full)
        ));
    }

    #[tokio::test]
    async fn test_spill_record_round_trip() {
        for via in [
            DiscoveredVia::Seed,
            DiscoveredVia::Sitemap,
            DiscoveredVia::HtmlLink,
            DiscoveredVia::RobotsRedirect,
        ] {
            let original = CrawlTask {
                url: NormalizedUrl::parse("http://a.example/deep?x=1", &UrlLimits::default())
                    .unwrap(),
                depth: 4,
                referer: Some("http://a.example/".to_string()),
                discovered_via: via,
            };
            let record = SpillRecord::from_task(&original);
            let restored = record.into_task(&UrlLimits::default()).unwrap();
            assert_eq!(restored.url, original.url);
            assert_eq!(restored.depth, 4);
            assert_eq!(restored.discovered_via, via);
        }
    }

    #[test]
    fn test_registry_rejects_unknown_backend() {
        let config = CrawlConfig {
            url_queue: "etched_in_stone".to_string(),
            ..CrawlConfig::default()
        };
        let err = build_queue(&config, Arc::new(VisitedSet::new(10)));
        assert!(matches!(err, Err(QueueError::UnknownBackend(_))));
    }

    #[test]
    fn test_registry_builds_known_backends() {
        for name in ["memory_only", "file_backed"] {
            let config = CrawlConfig {
                url_queue: name.to_string(),
                ..CrawlConfig::default()
            };
            assert!(build_queue(&config, Arc::new(VisitedSet::new(10))).is_ok());
        }
    }
}
