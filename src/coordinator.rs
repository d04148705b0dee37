//! Crawl orchestration: seeding, the worker pool, depth and budget
//! accounting, and termination.
//!
//! Workers run a dequeue -> robots-check -> fetch -> extract -> emit ->
//! enqueue-children loop. The queue and visited set are the only shared
//! mutable state besides the per-authority robots gate and politeness
//! windows; no lock is ever held across I/O.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::CrawlConfig;
use crate::events::{CrawlEvent, DropReason, EventBus, EventSink};
use crate::extract::{self, ContentClass, ExtractionCaps};
use crate::models::{CrawlResult, CrawlTask, DiscoveredVia, ResultMeta, FATAL_ERROR_STATUS};
use crate::network::{FetchedResponse, Fetcher, HttpClient};
use crate::queue::{self, EnqueueOutcome, QueueError, UrlQueue, VisitedSet};
use crate::robots::RobotsService;
use crate::ruleset::Ruleset;
use crate::sink::{self, Sink};
use crate::sitemaps;
use crate::stats::{Stats, StatsSnapshot};
use crate::urls::{Allowlist, Authority, NormalizedUrl, UrlLimits};
use crate::CrawlerError;

/// How long Draining waits for workers before aborting them
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Idle polling cadence for completion detection
const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// The queue must look idle this long before the crawl counts as complete,
/// covering the window between a dequeue and its in-flight accounting.
const IDLE_GRACE: Duration = Duration::from_millis(300);

/// Upper bound applied to robots crawl-delay waits
const MAX_POLITENESS_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlState {
    Idle,
    Seeding,
    Running,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Completed,
    MaxDurationExceeded,
    BudgetExhausted,
    Stopped,
    FatalError,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Completed => "completed",
            EndReason::MaxDurationExceeded => "max_duration_exceeded",
            EndReason::BudgetExhausted => "budget_exhausted",
            EndReason::Stopped => "stopped",
            EndReason::FatalError => "fatal_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub crawl_id: String,
    pub reason: EndReason,
    pub stats: StatsSnapshot,
}

pub struct CrawlCoordinator {
    config: Arc<CrawlConfig>,
    crawl_id: String,
    limits: UrlLimits,
    caps: ExtractionCaps,
    allowlist: Arc<Allowlist>,
    visited: Arc<VisitedSet>,
    queue: Arc<dyn UrlQueue>,
    fetcher: Arc<dyn Fetcher>,
    robots: Arc<RobotsService>,
    ruleset: Arc<Ruleset>,
    sink: Arc<dyn Sink>,
    events: Arc<EventBus>,
    stats: Arc<Stats>,
    cancel: CancellationToken,
    state: Mutex<CrawlState>,
    end_reason: Mutex<Option<EndReason>>,
    in_flight: AtomicUsize,
    seeding_done: AtomicBool,
    sitemaps_scheduled: AtomicBool,
    seeds_enqueued: AtomicUsize,
    politeness: DashMap<Authority, Arc<tokio::sync::Mutex<Instant>>>,
}

impl CrawlCoordinator {
    /// Build a coordinator with the real HTTP client.
    pub fn new(config: CrawlConfig) -> Result<Arc<Self>, CrawlerError> {
        config.validate()?;
        let allowlist = Arc::new(Allowlist::new());
        for authority in config.allowlist_authorities()? {
            allowlist.insert(authority);
        }
        let fetcher: Arc<dyn Fetcher> =
            Arc::new(HttpClient::from_config(&config, allowlist.clone())?);
        Self::with_fetcher(config, fetcher, allowlist, None, None)
    }

    /// Build with an injected transport and optional sink overrides. The
    /// allowlist must already contain the configured domains.
    pub fn with_fetcher(
        config: CrawlConfig,
        fetcher: Arc<dyn Fetcher>,
        allowlist: Arc<Allowlist>,
        event_sink: Option<Box<dyn EventSink>>,
        result_sink: Option<Arc<dyn Sink>>,
    ) -> Result<Arc<Self>, CrawlerError> {
        let crawl_id = config.crawl_id();
        let stats = Arc::new(Stats::new());
        let events = Arc::new(match event_sink {
            Some(sink) => EventBus::new(sink, stats.clone()),
            None => EventBus::with_tracing(stats.clone()),
        });
        let visited = Arc::new(VisitedSet::new(config.max_unique_url_count));
        let queue = queue::build_queue(&config, visited.clone())?;
        let robots = Arc::new(RobotsService::new(
            fetcher.clone(),
            events.clone(),
            config.user_agent(),
        ));
        let ruleset = Arc::new(
            Ruleset::compile(&config.domains_extraction_rules)
                .map_err(|e| crate::config::ConfigError::Validation(e.to_string()))?,
        );
        let sink = match result_sink {
            Some(sink) => sink,
            None => sink::build_sink(&config, &crawl_id)?,
        };

        Ok(Arc::new(Self {
            crawl_id,
            limits: config.url_limits(),
            caps: ExtractionCaps::from_config(&config),
            allowlist,
            visited,
            queue,
            fetcher,
            robots,
            ruleset,
            sink,
            events,
            stats,
            cancel: CancellationToken::new(),
            state: Mutex::new(CrawlState::Idle),
            end_reason: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            seeding_done: AtomicBool::new(false),
            sitemaps_scheduled: AtomicBool::new(false),
            seeds_enqueued: AtomicUsize::new(0),
            politeness: DashMap::new(),
            config: Arc::new(config),
        }))
    }

    pub fn state(&self) -> CrawlState {
        *self.state.lock()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// External stop signal; observable by workers between I/O steps.
    pub fn stop(&self) {
        self.request_stop(EndReason::Stopped);
    }

    fn set_state(&self, next: CrawlState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::info!(crawl_id = %self.crawl_id, "crawl state {:?} -> {next:?}", *state);
            *state = next;
        }
    }

    fn request_stop(&self, reason: EndReason) {
        {
            let mut guard = self.end_reason.lock();
            if guard.is_none() {
                *guard = Some(reason);
            }
        }
        self.set_state(CrawlState::Draining);
        self.queue.close();
        self.cancel.cancel();
    }

    fn stop_requested(&self) -> bool {
        self.end_reason.lock().is_some()
    }

    /// Run the crawl to completion using the configured seed list.
    pub async fn run(self: &Arc<Self>) -> CrawlSummary {
        let seeds = self.config.seed_urls.clone();
        self.run_with_seeds(seeds.into_iter()).await
    }

    /// Run with a lazy seed source. Seeds are pulled on demand and never
    /// materialized, so an unbounded iterator is fine: backpressure from
    /// the queue throttles the pump.
    pub async fn run_with_seeds<I>(self: &Arc<Self>, seeds: I) -> CrawlSummary
    where
        I: Iterator<Item = String> + Send + 'static,
    {
        self.set_state(CrawlState::Seeding);
        self.events.emit(CrawlEvent::CrawlStart {
            crawl_id: self.crawl_id.clone(),
        });

        let seed_pump = {
            let this = self.clone();
            tokio::task::spawn_blocking(move || this.pump_seeds(seeds))
        };

        let sitemap_task = {
            let this = self.clone();
            tokio::spawn(async move {
                this.clone().schedule_sitemaps().await;
                this.sitemaps_scheduled.store(true, Ordering::SeqCst);
            })
        };

        self.set_state(CrawlState::Running);
        let mut workers = JoinSet::new();
        for id in 0..self.config.threads_per_crawl {
            let this = self.clone();
            workers.spawn(async move { this.worker_loop(id).await });
        }

        self.supervise().await;

        // Draining: the queue is closed; give workers a grace window
        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            tracing::warn!("drain grace deadline hit, aborting remaining workers");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
        seed_pump.abort();
        sitemap_task.abort();

        if let Err(e) = self.sink.finish() {
            tracing::warn!("failed to flush sink: {e}");
        }

        let reason = (*self.end_reason.lock()).unwrap_or(EndReason::Completed);
        let stats = self.stats.snapshot();
        self.events.emit(CrawlEvent::CrawlEnd {
            crawl_id: self.crawl_id.clone(),
            reason: reason.as_str().to_string(),
            stats: stats.clone(),
        });
        self.set_state(CrawlState::Terminated);
        tracing::info!(crawl_id = %self.crawl_id, "crawl ended ({}): {stats}", reason.as_str());

        CrawlSummary {
            crawl_id: self.crawl_id.clone(),
            reason,
            stats,
        }
    }

    /// Blocking seed pump. Retries on queue backpressure rather than
    /// materializing the iterator.
    fn pump_seeds<I>(self: Arc<Self>, seeds: I)
    where
        I: Iterator<Item = String>,
    {
        for seed in seeds {
            if self.cancel.is_cancelled() {
                break;
            }
            let url = match NormalizedUrl::parse(&seed, &self.limits) {
                Ok(url) => url,
                Err(e) => {
                    tracing::warn!("skipping invalid seed {seed}: {e}");
                    self.events.emit(CrawlEvent::UrlDrop {
                        url: seed.clone(),
                        reason: DropReason::InvalidUrl,
                    });
                    continue;
                }
            };
            // Seed authorities are crawlable by definition
            self.allowlist.insert(url.authority());

            loop {
                match self.queue.enqueue(CrawlTask::seed(url.clone())) {
                    Ok(EnqueueOutcome::Enqueued) => {
                        self.seeds_enqueued.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Ok(EnqueueOutcome::Duplicate) => break,
                    Err(QueueError::Full) => {
                        if self.cancel.is_cancelled() {
                            return;
                        }
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(QueueError::BudgetExhausted) => {
                        self.request_stop(EndReason::BudgetExhausted);
                        return;
                    }
                    Err(_) => return,
                }
            }
        }

        if self.seeds_enqueued.load(Ordering::Relaxed) == 0 && !self.stop_requested() {
            tracing::error!("no valid seed URLs could be enqueued");
            self.request_stop(EndReason::FatalError);
        }
        self.seeding_done.store(true, Ordering::SeqCst);
    }

    /// Enqueue configured sitemaps right away, then the ones declared in
    /// robots.txt once seeding has settled the allowlist.
    async fn schedule_sitemaps(self: Arc<Self>) {
        for raw in &self.config.sitemap_urls {
            match NormalizedUrl::parse(raw, &self.limits) {
                Ok(url) => {
                    self.allowlist.insert(url.authority());
                    self.enqueue_sitemap_task(CrawlTask::from_sitemap(url, None));
                }
                Err(e) => tracing::warn!("skipping invalid sitemap URL {raw}: {e}"),
            }
        }

        if self.config.sitemap_discovery_disabled {
            return;
        }

        while !self.seeding_done.load(Ordering::SeqCst) {
            if self.cancel.is_cancelled() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for authority in self.allowlist.snapshot() {
            if self.cancel.is_cancelled() {
                return;
            }
            let record = self.robots.record_for(&authority).await;
            for raw in &record.sitemap_urls {
                if let Ok(url) = NormalizedUrl::parse(raw, &self.limits) {
                    if self.allowlist.contains(&url.authority()) {
                        self.enqueue_sitemap_task(CrawlTask::from_robots(
                            url,
                            Some(authority.robots_url()),
                        ));
                    }
                }
            }
        }
    }

    fn enqueue_sitemap_task(&self, task: CrawlTask) {
        match self.queue.enqueue(task) {
            Ok(_) => {}
            Err(QueueError::BudgetExhausted) => self.request_stop(EndReason::BudgetExhausted),
            Err(e) => tracing::debug!("sitemap enqueue failed: {e}"),
        }
    }

    /// Watch for termination triggers: sustained idleness, the duration
    /// timer, budget exhaustion, and the external stop signal.
    async fn supervise(self: &Arc<Self>) {
        let deadline = Instant::now() + Duration::from_secs(self.config.max_duration);
        let mut idle_check = tokio::time::interval(IDLE_CHECK_INTERVAL);
        let mut stats_timer =
            tokio::time::interval(Duration::from_secs(self.config.stats_dump_interval.max(1)));
        stats_timer.tick().await; // immediate first tick is not a dump
        let mut idle_since: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::info!("max_duration reached, stopping crawl");
                    self.request_stop(EndReason::MaxDurationExceeded);
                    break;
                }
                _ = stats_timer.tick() => {
                    let snapshot = self.stats.snapshot();
                    tracing::info!(crawl_id = %self.crawl_id, "progress: {snapshot}, queued {}", self.queue.len());
                    self.events.emit(CrawlEvent::StatsSnapshot { stats: snapshot });
                }
                _ = idle_check.tick() => {
                    if self.stop_requested() {
                        break;
                    }
                    let idle = self.seeding_done.load(Ordering::SeqCst)
                        && self.sitemaps_scheduled.load(Ordering::SeqCst)
                        && self.queue.is_empty()
                        && self.in_flight.load(Ordering::SeqCst) == 0;
                    if !idle {
                        idle_since = None;
                        continue;
                    }
                    let since = *idle_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= IDLE_GRACE {
                        self.request_stop(EndReason::Completed);
                        break;
                    }
                }
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, id: usize) {
        tracing::debug!("worker {id} started");
        loop {
            let task = tokio::select! {
                _ = self.cancel.cancelled() => break,
                task = self.queue.dequeue() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            self.process_task(task).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::debug!("worker {id} finished");
    }

    async fn process_task(self: &Arc<Self>, task: CrawlTask) {
        let authority = task.url.authority();
        let is_robots_path = task.url.path() == "/robots.txt";

        if !is_robots_path {
            let record = self.robots.record_for(&authority).await;
            if !record.allowed(self.robots.user_agent(), task.url.as_str()) {
                self.events.emit(CrawlEvent::UrlDrop {
                    url: task.url.as_str().to_string(),
                    reason: DropReason::RobotsDisallowed,
                });
                return;
            }
            if let Some(delay) = record.crawl_delay(self.robots.user_agent()) {
                self.wait_politely(&authority, delay.min(MAX_POLITENESS_WAIT))
                    .await;
            }
        }

        self.events.emit(CrawlEvent::UrlFetchStart {
            url: task.url.as_str().to_string(),
        });
        let started = SystemTime::now();

        let fetched = tokio::select! {
            // On stop, partially fetched results are discarded
            _ = self.cancel.cancelled() => return,
            fetched = self.fetcher.fetch(task.url.as_url()) => fetched,
        };
        let ended = SystemTime::now();

        match fetched {
            Ok(response) => self.handle_response(task, response, started, ended).await,
            Err(e) => {
                self.events.emit(CrawlEvent::Error {
                    kind: e.kind().to_string(),
                    url: task.url.as_str().to_string(),
                });
                let result = if e.is_fatal() {
                    CrawlResult::fatal_error(&task.url, e.to_string())
                } else {
                    CrawlResult::transient_error(&task.url, FATAL_ERROR_STATUS, e.to_string())
                };
                self.finish_result(result, started, ended, 0);
            }
        }
    }

    async fn handle_response(
        self: &Arc<Self>,
        task: CrawlTask,
        response: FetchedResponse,
        started: SystemTime,
        ended: SystemTime,
    ) {
        // The final URL after any followed redirects is what gets recorded
        let final_url = NormalizedUrl::from_url(response.final_url.clone(), &self.limits)
            .unwrap_or_else(|_| task.url.clone());
        let body_len = response.body.len();
        let meta = ResultMeta::new(&final_url, response.status, response.content_type.clone());

        if let Some(location) = response.redirect_location {
            self.finish_result(
                CrawlResult::Redirect { meta, location },
                started,
                ended,
                body_len,
            );
            return;
        }

        if response.status >= 400 {
            self.events.emit(CrawlEvent::Error {
                kind: "http_status".to_string(),
                url: final_url.as_str().to_string(),
            });
            self.finish_result(
                CrawlResult::Error {
                    meta,
                    class: crate::models::ErrorClass::Transient,
                    message: format!("HTTP status {}", response.status),
                },
                started,
                ended,
                body_len,
            );
            return;
        }

        let class = extract::classify(
            response.content_type.as_deref(),
            final_url.path(),
            &self.config,
        );
        let entered_as_sitemap = matches!(
            task.discovered_via,
            DiscoveredVia::Sitemap | DiscoveredVia::RobotsRedirect
        );
        let class = if entered_as_sitemap && class != ContentClass::Html {
            // A task that entered via a sitemap reference and is not a page
            // is the sitemap document itself
            ContentClass::Sitemap
        } else {
            class
        };

        match class {
            ContentClass::Html => {
                self.handle_html(task, final_url, meta, response.body, started, ended)
                    .await;
            }
            ContentClass::Sitemap => {
                self.handle_sitemap(task, final_url, meta, response.body, started, ended)
                    .await;
            }
            ContentClass::RobotsTxt => {
                self.finish_result(CrawlResult::RobotsTxt { meta }, started, ended, body_len);
            }
            ContentClass::Extractable => {
                let body = extract::truncate_bytes(
                    &String::from_utf8_lossy(&response.body),
                    self.caps.max_body_size,
                );
                self.finish_result(
                    CrawlResult::ContentFile { meta, body },
                    started,
                    ended,
                    body_len,
                );
            }
            ContentClass::Unsupported => {
                self.events.emit(CrawlEvent::Error {
                    kind: "unsupported_content_type".to_string(),
                    url: final_url.as_str().to_string(),
                });
                self.finish_result(
                    CrawlResult::unsupported_content_type(
                        &final_url,
                        response.status,
                        response.content_type,
                    ),
                    started,
                    ended,
                    body_len,
                );
            }
        }
    }

    async fn handle_html(
        self: &Arc<Self>,
        task: CrawlTask,
        final_url: NormalizedUrl,
        meta: ResultMeta,
        body: Vec<u8>,
        started: SystemTime,
        ended: SystemTime,
    ) {
        let body_len = body.len();
        let caps = self.caps.clone();
        let ruleset = self.ruleset.clone();
        let content_type = meta.content_type.clone();
        let parse_url = final_url.clone();

        // HTML parsing is CPU-bound; keep it off the async workers
        let parsed = tokio::task::spawn_blocking(move || {
            let text =
                extract::decode_body(&body, content_type.as_deref(), &caps.default_encoding);
            let document = scraper::Html::parse_document(&text);
            let page = extract::extract_from_document(&document, parse_url.as_url(), &caps);
            let fields = ruleset.extract_fields(&parse_url, &document, &page.body);
            (page, fields)
        })
        .await;

        let (page, fields) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                self.events.emit(CrawlEvent::Error {
                    kind: "parser_error".to_string(),
                    url: final_url.as_str().to_string(),
                });
                self.finish_result(
                    CrawlResult::Error {
                        meta,
                        class: crate::models::ErrorClass::Transient,
                        message: format!("HTML parser failed: {e}"),
                    },
                    started,
                    ended,
                    body_len,
                );
                return;
            }
        };

        // Filter before truncating: the result payload and the discovery
        // set are both drawn from the same admitted sequence, so neither
        // carries off-allowlist or already-visited links
        let extracted_count = page.links.len();
        let admitted = self.admit_links(&page.links);
        let indexed_links: Vec<String> = admitted
            .iter()
            .take(self.config.max_indexed_links_count)
            .map(|u| u.as_str().to_string())
            .collect();

        let result = CrawlResult::Html {
            meta,
            title: page.title.clone(),
            body: page.body.clone(),
            meta_keywords: page.meta_keywords.clone(),
            meta_description: page.meta_description.clone(),
            headings: page.headings.clone(),
            links: indexed_links,
            extracted_fields: fields,
        };
        self.finish_result(result, started, ended, body_len);

        self.discover_links(&task, admitted, extracted_count).await;
    }

    /// Admission filter for extracted links: normalize, keep http(s)
    /// allowlisted targets not yet visited, dedup within the page, and cap
    /// at the extraction limit. Document order is preserved.
    fn admit_links(&self, links: &[url::Url]) -> Vec<NormalizedUrl> {
        let mut admitted = Vec::new();
        let mut seen_on_page = std::collections::HashSet::new();

        for link in links {
            if admitted.len() >= self.config.max_extracted_links_count {
                break;
            }
            let url = match NormalizedUrl::from_url(link.clone(), &self.limits) {
                Ok(url) => url,
                Err(_) => {
                    self.events.emit(CrawlEvent::UrlDrop {
                        url: link.to_string(),
                        reason: DropReason::InvalidUrl,
                    });
                    continue;
                }
            };
            if !self.allowlist.contains(&url.authority()) {
                self.events.emit(CrawlEvent::UrlDrop {
                    url: url.as_str().to_string(),
                    reason: DropReason::NotAllowlisted,
                });
                continue;
            }
            if self.visited.contains(url.fingerprint()) || !seen_on_page.insert(url.fingerprint())
            {
                self.events.emit(CrawlEvent::UrlDrop {
                    url: url.as_str().to_string(),
                    reason: DropReason::Duplicate,
                });
                continue;
            }
            admitted.push(url);
        }
        admitted
    }

    async fn handle_sitemap(
        self: &Arc<Self>,
        task: CrawlTask,
        final_url: NormalizedUrl,
        meta: ResultMeta,
        body: Vec<u8>,
        started: SystemTime,
        ended: SystemTime,
    ) {
        let body_len = body.len();
        let parsed = tokio::task::spawn_blocking(move || sitemaps::parse_sitemap(&body)).await;

        let parse = match parsed {
            Ok(Ok(parse)) => parse,
            Ok(Err(e)) => {
                self.events.emit(CrawlEvent::Warning {
                    message: format!("sitemap {final_url} rejected: {e}"),
                });
                self.finish_result(
                    CrawlResult::Error {
                        meta,
                        class: crate::models::ErrorClass::Transient,
                        message: e.to_string(),
                    },
                    started,
                    ended,
                    body_len,
                );
                return;
            }
            Err(e) => {
                self.events.emit(CrawlEvent::Error {
                    kind: "parser_error".to_string(),
                    url: final_url.as_str().to_string(),
                });
                self.finish_result(
                    CrawlResult::Error {
                        meta,
                        class: crate::models::ErrorClass::Transient,
                        message: format!("sitemap parser failed: {e}"),
                    },
                    started,
                    ended,
                    body_len,
                );
                return;
            }
        };

        if parse.truncated {
            self.events.emit(CrawlEvent::Warning {
                message: format!(
                    "sitemap {final_url} truncated at {} URLs",
                    sitemaps::MAX_SITEMAP_URLS
                ),
            });
        }
        if parse.skipped > 0 {
            self.events.emit(CrawlEvent::Warning {
                message: format!(
                    "sitemap {final_url}: skipped {} malformed entries",
                    parse.skipped
                ),
            });
        }

        let url_count = parse.url_count();
        self.finish_result(
            CrawlResult::Sitemap { meta, url_count },
            started,
            ended,
            body_len,
        );

        // Nested sitemaps are fetched like any other sitemap reference
        for nested in parse.nested_sitemaps {
            if let Ok(url) = NormalizedUrl::parse(&nested, &self.limits) {
                if self.allowlist.contains(&url.authority()) {
                    self.enqueue_sitemap_task(CrawlTask::from_sitemap(
                        url,
                        Some(task.url.as_str().to_string()),
                    ));
                }
            }
        }

        let mut enqueued = 0usize;
        let extracted = parse.page_urls.len();
        for raw in parse.page_urls {
            if self.stop_requested() {
                break;
            }
            let Ok(url) = NormalizedUrl::parse(&raw, &self.limits) else {
                self.events.emit(CrawlEvent::UrlDrop {
                    url: raw,
                    reason: DropReason::InvalidUrl,
                });
                continue;
            };
            let entry = CrawlTask::from_sitemap(url, Some(task.url.as_str().to_string()));
            if self.admit_and_enqueue(entry, task.url.as_str()).await {
                enqueued += 1;
            }
        }
        self.stats.record_links(extracted, enqueued);
    }

    /// Enqueue one parent page's admitted children in document order.
    async fn discover_links(
        self: &Arc<Self>,
        parent: &CrawlTask,
        links: Vec<NormalizedUrl>,
        extracted_count: usize,
    ) {
        let mut enqueued = 0usize;

        for url in links {
            if self.stop_requested() {
                break;
            }
            let child = CrawlTask::child_of(parent, url);
            if child.depth > self.config.max_crawl_depth {
                self.events.emit(CrawlEvent::UrlDrop {
                    url: child.url.as_str().to_string(),
                    reason: DropReason::DepthExceeded,
                });
                continue;
            }
            if self.admit_and_enqueue(child, parent.url.as_str()).await {
                enqueued += 1;
            }
        }

        self.stats.record_links(extracted_count, enqueued);
    }

    /// Shared admission path for discovered URLs: allowlist, URL filters,
    /// dedup pre-check, robots, then the atomic enqueue.
    async fn admit_and_enqueue(self: &Arc<Self>, task: CrawlTask, from: &str) -> bool {
        let url_string = task.url.as_str().to_string();

        if !self.allowlist.contains(&task.url.authority()) {
            self.events.emit(CrawlEvent::UrlDrop {
                url: url_string,
                reason: DropReason::NotAllowlisted,
            });
            return false;
        }
        if !self.ruleset.allows(&task.url) {
            self.events.emit(CrawlEvent::UrlDrop {
                url: url_string,
                reason: DropReason::FilteredOut,
            });
            return false;
        }
        // Cheap pre-check; the enqueue below is the authoritative
        // check-and-insert
        if self.visited.contains(task.url.fingerprint()) {
            self.events.emit(CrawlEvent::UrlDrop {
                url: url_string,
                reason: DropReason::Duplicate,
            });
            return false;
        }
        let authority = task.url.authority();
        if !self
            .robots
            .allowed(&authority, task.url.as_str())
            .await
        {
            self.events.emit(CrawlEvent::UrlDrop {
                url: url_string,
                reason: DropReason::RobotsDisallowed,
            });
            return false;
        }

        match self.queue.enqueue(task) {
            Ok(EnqueueOutcome::Enqueued) => {
                self.events.emit(CrawlEvent::UrlDiscover {
                    from: from.to_string(),
                    to: url_string,
                });
                true
            }
            Ok(EnqueueOutcome::Duplicate) => {
                self.events.emit(CrawlEvent::UrlDrop {
                    url: url_string,
                    reason: DropReason::Duplicate,
                });
                false
            }
            Err(QueueError::Full) => {
                self.events.emit(CrawlEvent::UrlDrop {
                    url: url_string,
                    reason: DropReason::QueueFull,
                });
                false
            }
            Err(QueueError::BudgetExhausted) => {
                self.request_stop(EndReason::BudgetExhausted);
                false
            }
            Err(_) => false,
        }
    }

    /// Stamp timing, emit the result and its fetch-end event, and update
    /// page counters.
    fn finish_result(
        &self,
        mut result: CrawlResult,
        started: SystemTime,
        ended: SystemTime,
        bytes: usize,
    ) {
        let timed = result.meta().clone().timed(started, ended);
        *result.meta_mut() = timed;
        let meta = result.meta();

        self.events.emit(CrawlEvent::UrlFetchEnd {
            url: meta.url.clone(),
            result_kind: result.kind_label().to_string(),
            status: meta.status_code,
            bytes,
        });
        self.stats.record_page(bytes, meta.duration_ms);

        if let Err(e) = self.sink.emit(&result) {
            tracing::warn!("sink rejected result for {}: {e}", meta.url);
        }
    }

    /// Honor robots crawl-delay per authority without holding any lock
    /// while sleeping.
    async fn wait_politely(&self, authority: &Authority, delay: Duration) {
        let gate = self
            .politeness
            .entry(authority.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Instant::now())))
            .clone();

        let wait = {
            let mut ready_at = gate.lock().await;
            let now = Instant::now();
            let wait = ready_at.saturating_duration_since(now);
            *ready_at = (*ready_at).max(now) + delay;
            wait
        };

        if !wait.is_zero() {
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{FetchError, RobotsOutcome};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Canned transport: path -> (status, content type, body)
    struct StubSite {
        pages: HashMap<String, (u16, &'static str, String)>,
        robots: String,
    }

    impl StubSite {
        fn new(robots: &str) -> Self {
            Self {
                pages: HashMap::new(),
                robots: robots.to_string(),
            }
        }

        fn page(mut self, url: &str, body: &str) -> Self {
            self.pages
                .insert(url.to_string(), (200, "text/html", body.to_string()));
            self
        }
    }

    #[async_trait]
    impl Fetcher for StubSite {
        async fn fetch(&self, url: &url::Url) -> Result<FetchedResponse, FetchError> {
            match self.pages.get(url.as_str()) {
                Some((status, content_type, body)) => Ok(FetchedResponse {
                    final_url: url.clone(),
                    status: *status,
                    content_type: Some(content_type.to_string()),
                    body: body.clone().into_bytes(),
                    redirect_location: None,
                }),
                None => Ok(FetchedResponse {
                    final_url: url.clone(),
                    status: 404,
                    content_type: Some("text/html".to_string()),
                    body: Vec::new(),
                    redirect_location: None,
                }),
            }
        }

        async fn fetch_robots(
            &self,
            _authority: &Authority,
        ) -> Result<RobotsOutcome, FetchError> {
            Ok(RobotsOutcome::Fetched {
                status: 200,
                body: self.robots.clone(),
            })
        }
    }

    /// Sink that captures everything emitted
    #[derive(Default)]
    struct CapturingSink(parking_lot::Mutex<Vec<CrawlResult>>);

    impl Sink for CapturingSink {
        fn emit(&self, result: &CrawlResult) -> Result<(), crate::sink::SinkError> {
            self.0.lock().push(result.clone());
            Ok(())
        }
    }

    fn config(seeds: &[&str], allow: &[&str]) -> CrawlConfig {
        CrawlConfig {
            domain_allowlist: allow.iter().map(|s| s.to_string()).collect(),
            seed_urls: seeds.iter().map(|s| s.to_string()).collect(),
            sitemap_discovery_disabled: true,
            threads_per_crawl: 2,
            ..CrawlConfig::default()
        }
    }

    async fn crawl(config: CrawlConfig, site: StubSite) -> (CrawlSummary, Vec<CrawlResult>) {
        let allowlist = Arc::new(Allowlist::new());
        for authority in config.allowlist_authorities().unwrap() {
            allowlist.insert(authority);
        }
        let capture = Arc::new(CapturingSink::default());
        let coordinator = CrawlCoordinator::with_fetcher(
            config,
            Arc::new(site),
            allowlist,
            None,
            Some(capture.clone()),
        )
        .unwrap();
        let summary = coordinator.run().await;
        assert_eq!(coordinator.state(), CrawlState::Terminated);
        let results = capture.0.lock().clone();
        (summary, results)
    }

    #[tokio::test]
    async fn test_same_host_links_followed_offsite_dropped() {
        let site = StubSite::new("User-agent: *\nAllow: /")
            .page(
                "http://a.example/",
                r#"<a href="/b">b</a><a href="/c">c</a><a href="http://evil.example/x">evil</a>"#,
            )
            .page("http://a.example/b", "<p>b</p>")
            .page("http://a.example/c", "<p>c</p>");

        let (summary, results) =
            crawl(config(&["http://a.example/"], &["http://a.example"]), site).await;

        assert_eq!(summary.reason, EndReason::Completed);
        assert_eq!(summary.stats.pages_visited, 3);
        assert_eq!(summary.stats.links_enqueued, 2);
        // The offsite link was dropped, not errored
        assert!(summary.stats.urls_dropped >= 1);
        assert!(summary.stats.errors_by_kind.is_empty());

        let mut urls: Vec<&str> = results.iter().map(|r| r.meta().url.as_str()).collect();
        urls.sort();
        assert_eq!(
            urls,
            vec!["http://a.example/", "http://a.example/b", "http://a.example/c"]
        );
        assert!(results.iter().all(|r| !r.is_error()));
    }

    #[tokio::test]
    async fn test_result_payload_links_are_filtered() {
        let site = StubSite::new("User-agent: *\nAllow: /")
            .page(
                "http://a.example/",
                r#"<a href="/b">b</a>
                <a href="/b">b again</a>
                <a href="http://evil.example/x">evil</a>
                <a href="mailto:someone@a.example">mail</a>
                <a href="/">self</a>"#,
            )
            .page("http://a.example/b", "<p>b</p>");

        let (_, results) =
            crawl(config(&["http://a.example/"], &["http://a.example"]), site).await;

        let home = results
            .iter()
            .find(|r| r.meta().url == "http://a.example/")
            .unwrap();
        match home {
            CrawlResult::Html { links, .. } => {
                // Off-allowlist, non-http, duplicate, and already-visited
                // targets never reach the payload
                assert_eq!(links, &vec!["http://a.example/b".to_string()]);
            }
            other => panic!("expected html result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_robots_disallow_drops_without_error() {
        let site = StubSite::new("User-agent: *\nDisallow: /private")
            .page(
                "http://a.example/",
                r#"<a href="/private">p</a><a href="/open">o</a>"#,
            )
            .page("http://a.example/open", "<p>open</p>")
            .page("http://a.example/private", "<p>secret</p>");

        let (summary, _) = crawl(config(&["http://a.example/"], &["http://a.example"]), site).await;

        // Only / and /open were fetched
        assert_eq!(summary.stats.pages_visited, 2);
        assert!(summary.stats.urls_dropped >= 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_terminates() {
        let mut cfg = config(&["http://a.example/"], &["http://a.example"]);
        cfg.max_unique_url_count = 3;
        let site = StubSite::new("User-agent: *\nAllow: /")
            .page(
                "http://a.example/",
                r#"<a href="/a">a</a><a href="/b">b</a><a href="/c">c</a><a href="/d">d</a>"#,
            )
            .page("http://a.example/a", "<p>a</p>")
            .page("http://a.example/b", "<p>b</p>")
            .page("http://a.example/c", "<p>c</p>")
            .page("http://a.example/d", "<p>d</p>");

        let (summary, _) = crawl(cfg, site).await;

        assert_eq!(summary.reason, EndReason::BudgetExhausted);
        assert!(summary.stats.pages_visited <= 3);
    }

    #[tokio::test]
    async fn test_duplicate_links_fetched_once() {
        let site = StubSite::new("User-agent: *\nAllow: /")
            .page(
                "http://a.example/",
                r#"<a href="/x">1</a><a href="/x">2</a><a href="/y">3</a>"#,
            )
            .page("http://a.example/x", "<p>x</p>")
            .page("http://a.example/y", "<p>y</p>");

        let (summary, _) = crawl(config(&["http://a.example/"], &["http://a.example"]), site).await;

        // /x once, /y once, plus the seed
        assert_eq!(summary.stats.pages_visited, 3);
        assert_eq!(summary.stats.links_enqueued, 2);
    }

    #[tokio::test]
    async fn test_depth_limit_stops_descent() {
        let mut cfg = config(&["http://a.example/"], &["http://a.example"]);
        cfg.max_crawl_depth = 2;
        let site = StubSite::new("User-agent: *\nAllow: /")
            .page("http://a.example/", r#"<a href="/d2">next</a>"#)
            .page("http://a.example/d2", r#"<a href="/d3">next</a>"#)
            .page("http://a.example/d3", r#"<a href="/d4">next</a>"#);

        let (summary, _) = crawl(cfg, site).await;

        // Seed is depth 1, /d2 is depth 2, /d3 would be depth 3
        assert_eq!(summary.stats.pages_visited, 2);
    }

    #[tokio::test]
    async fn test_seed_authority_is_auto_allowlisted() {
        // Seed host is not in the configured allowlist
        let cfg = config(&["http://b.example/"], &["http://a.example"]);
        let site = StubSite::new("User-agent: *\nAllow: /")
            .page("http://b.example/", "<p>seeded</p>");

        let (summary, _) = crawl(cfg, site).await;

        assert_eq!(summary.stats.pages_visited, 1);
        assert_eq!(summary.reason, EndReason::Completed);
    }

    #[tokio::test]
    async fn test_external_stop() {
        let cfg = config(&["http://a.example/"], &["http://a.example"]);
        let site = StubSite::new("User-agent: *\nAllow: /").page("http://a.example/", "<p>x</p>");

        let allowlist = Arc::new(Allowlist::new());
        for authority in cfg.allowlist_authorities().unwrap() {
            allowlist.insert(authority);
        }
        let coordinator = CrawlCoordinator::with_fetcher(
            cfg,
            Arc::new(site),
            allowlist,
            None,
            Some(Arc::new(CapturingSink::default())),
        )
        .unwrap();
        coordinator.stop();
        let summary = coordinator.run().await;
        assert_eq!(summary.reason, EndReason::Stopped);
    }

    #[tokio::test]
    async fn test_all_seeds_invalid_is_fatal() {
        let cfg = config(&["not a url", "ftp://x.example/"], &["http://a.example"]);
        let site = StubSite::new("User-agent: *\nAllow: /");

        let (summary, _) = crawl(cfg, site).await;
        assert_eq!(summary.reason, EndReason::FatalError);
        assert_eq!(summary.stats.pages_visited, 0);
    }
}
