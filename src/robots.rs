//! Per-authority robots.txt acquisition, caching, and decisions.
//!
//! Each authority is fetched at most once per crawl. The first caller for
//! an authority performs the fetch under a per-key gate; concurrent
//! callers await the same gate and then read the cached record, so a
//! thundering herd on a fresh authority collapses into one request.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use robotstxt::DefaultMatcher;
use tokio::sync::Mutex;

use crate::backoff::{ExponentialBackoff, MAX_RETRIES};
use crate::events::{CrawlEvent, EventBus};
use crate::network::{FetchError, Fetcher, RobotsOutcome};
use crate::urls::Authority;

/// Cached robots.txt decision data for one authority
#[derive(Debug)]
pub struct RobotsRecord {
    pub authority: Authority,
    pub fetched_at: SystemTime,
    /// Raw robots.txt body; `None` means the allow-all fallback
    rules: Option<String>,
    pub sitemap_urls: Vec<String>,
    pub is_fallback: bool,
}

impl RobotsRecord {
    pub fn parsed(authority: Authority, body: String) -> Self {
        let sitemap_urls = scan_sitemap_urls(&body);
        Self {
            authority,
            fetched_at: SystemTime::now(),
            rules: Some(body),
            sitemap_urls,
            is_fallback: false,
        }
    }

    /// Allow-all record used when robots.txt is absent or unreachable
    pub fn fallback(authority: Authority) -> Self {
        Self {
            authority,
            fetched_at: SystemTime::now(),
            rules: None,
            sitemap_urls: Vec::new(),
            is_fallback: true,
        }
    }

    pub fn allowed(&self, user_agent: &str, url: &str) -> bool {
        match &self.rules {
            None => true,
            Some(body) => {
                let mut matcher = DefaultMatcher::default();
                matcher.one_agent_allowed_by_robots(body, user_agent, url)
            }
        }
    }

    /// Crawl-delay for the best-matching agent group; wildcard group is
    /// the fallback.
    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        let body = self.rules.as_deref()?;
        let agent_lower = user_agent.to_lowercase();

        let mut group_matches_agent = false;
        let mut group_matches_wildcard = false;
        // Consecutive User-agent lines share one group; a directive line
        // closes the group
        let mut group_has_directives = false;
        let mut delay_for_agent = None;
        let mut delay_for_wildcard = None;

        for line in body.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_lowercase().as_str() {
                "user-agent" => {
                    if group_has_directives {
                        group_matches_agent = false;
                        group_matches_wildcard = false;
                        group_has_directives = false;
                    }
                    let agent = value.to_lowercase();
                    if agent == "*" {
                        group_matches_wildcard = true;
                    } else if agent_lower.contains(&agent) {
                        group_matches_agent = true;
                    }
                }
                "crawl-delay" => {
                    group_has_directives = true;
                    if let Ok(secs) = value.parse::<f64>() {
                        if secs >= 0.0 {
                            let delay = Duration::from_secs_f64(secs);
                            if group_matches_agent {
                                delay_for_agent = Some(delay);
                            }
                            if group_matches_wildcard && delay_for_wildcard.is_none() {
                                delay_for_wildcard = Some(delay);
                            }
                        }
                    }
                }
                _ => {
                    group_has_directives = true;
                }
            }
        }

        delay_for_agent.or(delay_for_wildcard)
    }
}

/// Sitemap declarations are independent of agent groups, so a plain line
/// scan is all that is needed.
fn scan_sitemap_urls(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            let line = line.trim();
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("sitemap") {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
            None
        })
        .collect()
}

pub struct RobotsService {
    cache: DashMap<Authority, Arc<RobotsRecord>>,
    gates: DashMap<Authority, Arc<Mutex<()>>>,
    fetcher: Arc<dyn Fetcher>,
    events: Arc<EventBus>,
    user_agent: String,
    backoff: ExponentialBackoff,
}

impl RobotsService {
    pub fn new(fetcher: Arc<dyn Fetcher>, events: Arc<EventBus>, user_agent: String) -> Self {
        Self {
            cache: DashMap::new(),
            gates: DashMap::new(),
            fetcher,
            events,
            user_agent,
            backoff: ExponentialBackoff::for_robots(),
        }
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Record for an authority, fetching on first encounter. Never fails:
    /// persistent fetch failure degrades to the allow-all fallback.
    pub async fn record_for(&self, authority: &Authority) -> Arc<RobotsRecord> {
        if let Some(record) = self.cache.get(authority) {
            return record.clone();
        }

        let gate = self
            .gates
            .entry(authority.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // Another caller may have filled the cache while we waited
        if let Some(record) = self.cache.get(authority) {
            return record.clone();
        }

        let record = Arc::new(self.acquire(authority).await);
        self.events.emit(CrawlEvent::RobotsFetched {
            authority: authority.to_string(),
            is_fallback: record.is_fallback,
        });
        self.cache.insert(authority.clone(), record.clone());
        record
    }

    pub async fn allowed(&self, authority: &Authority, url: &str) -> bool {
        self.record_for(authority).await.allowed(&self.user_agent, url)
    }

    async fn acquire(&self, authority: &Authority) -> RobotsRecord {
        let mut attempt = 0;
        loop {
            match self.fetcher.fetch_robots(authority).await {
                Ok(RobotsOutcome::Fetched { status, body }) if (200..300).contains(&status) => {
                    return RobotsRecord::parsed(authority.clone(), body);
                }
                Ok(RobotsOutcome::Fetched { status, .. }) if (400..500).contains(&status) => {
                    // Missing robots means an open door
                    return RobotsRecord::fallback(authority.clone());
                }
                Ok(RobotsOutcome::Unavailable) => {
                    return RobotsRecord::fallback(authority.clone());
                }
                Ok(RobotsOutcome::Fetched { status, .. }) => {
                    if attempt >= MAX_RETRIES {
                        self.warn_fallback(authority, &format!("status {status}"));
                        return RobotsRecord::fallback(authority.clone());
                    }
                }
                Err(e) if e.is_fatal() => {
                    self.warn_fallback(authority, &e.to_string());
                    return RobotsRecord::fallback(authority.clone());
                }
                Err(e) => {
                    if attempt >= MAX_RETRIES {
                        self.warn_fallback(authority, &e.to_string());
                        return RobotsRecord::fallback(authority.clone());
                    }
                }
            }

            tokio::time::sleep(self.backoff.delay(attempt)).await;
            attempt += 1;
        }
    }

    fn warn_fallback(&self, authority: &Authority, reason: &str) {
        tracing::warn!("robots.txt unavailable for {authority}: {reason}, allowing all");
        self.events.emit(CrawlEvent::Warning {
            message: format!("robots.txt unavailable for {authority}: {reason}"),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::FetchedResponse;
    use crate::stats::Stats;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn authority(s: &str) -> Authority {
        Authority::parse_domain(s).unwrap()
    }

    fn events() -> Arc<EventBus> {
        Arc::new(EventBus::with_tracing(Arc::new(Stats::new())))
    }

    struct StubFetcher {
        calls: AtomicU32,
        responses: parking_lot::Mutex<Vec<Result<RobotsOutcome, FetchError>>>,
    }

    impl StubFetcher {
        fn new(responses: Vec<Result<RobotsOutcome, FetchError>>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                responses: parking_lot::Mutex::new(responses),
            }
        }

        fn ok(status: u16, body: &str) -> Result<RobotsOutcome, FetchError> {
            Ok(RobotsOutcome::Fetched {
                status,
                body: body.to_string(),
            })
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, _url: &url::Url) -> Result<FetchedResponse, FetchError> {
            unimplemented!("robots tests never fetch pages")
        }

        async fn fetch_robots(
            &self,
            _authority: &Authority,
        ) -> Result<RobotsOutcome, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses[0]
                    .as_ref()
                    .map(|o| o.clone())
                    .map_err(|_| FetchError::Timeout)
            }
        }
    }

    fn service(stub: StubFetcher) -> (RobotsService, Arc<StubFetcher>) {
        let stub = Arc::new(stub);
        let service = RobotsService::new(stub.clone(), events(), "TestBot/1.0".to_string());
        (service, stub)
    }

    #[test]
    fn test_disallow_all() {
        let record = RobotsRecord::parsed(
            authority("http://a.example"),
            "User-agent: *\nDisallow: /".to_string(),
        );
        assert!(!record.allowed("TestBot", "http://a.example/x"));
    }

    #[test]
    fn test_allow_wins_on_longer_match() {
        let record = RobotsRecord::parsed(
            authority("http://a.example"),
            "User-agent: *\nDisallow: /private\nAllow: /private/open".to_string(),
        );
        assert!(record.allowed("TestBot", "http://a.example/"));
        assert!(!record.allowed("TestBot", "http://a.example/private/x"));
        assert!(record.allowed("TestBot", "http://a.example/private/open/x"));
    }

    #[test]
    fn test_fallback_allows_everything() {
        let record = RobotsRecord::fallback(authority("http://a.example"));
        assert!(record.is_fallback);
        assert!(record.allowed("TestBot", "http://a.example/anything"));
        assert_eq!(record.crawl_delay("TestBot"), None);
    }

    #[test]
    fn test_crawl_delay_prefers_specific_agent() {
        let body = "User-agent: TestBot\nCrawl-delay: 2\n\nUser-agent: *\nCrawl-delay: 7";
        let record = RobotsRecord::parsed(authority("http://a.example"), body.to_string());
        assert_eq!(
            record.crawl_delay("TestBot/1.0"),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            record.crawl_delay("OtherBot"),
            Some(Duration::from_secs(7))
        );
    }

    #[test]
    fn test_crawl_delay_shared_agent_group() {
        let body = "User-agent: BotA\nUser-agent: BotB\nCrawl-delay: 3";
        let record = RobotsRecord::parsed(authority("http://a.example"), body.to_string());
        assert_eq!(record.crawl_delay("BotA"), Some(Duration::from_secs(3)));
        assert_eq!(record.crawl_delay("BotB"), Some(Duration::from_secs(3)));
        assert_eq!(record.crawl_delay("BotC"), None);
    }

    #[test]
    fn test_sitemap_line_scan() {
        let body = "User-agent: *\nDisallow:\nSitemap: http://a.example/sitemap.xml\nsitemap: http://a.example/other.xml\n";
        let urls = scan_sitemap_urls(body);
        assert_eq!(
            urls,
            vec![
                "http://a.example/sitemap.xml".to_string(),
                "http://a.example/other.xml".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_fetched_once_and_cached() {
        let (service, stub) = service(StubFetcher::new(vec![StubFetcher::ok(
            200,
            "User-agent: *\nDisallow: /private",
        )]));
        let auth = authority("http://a.example");

        let first = service.record_for(&auth).await;
        let second = service.record_for(&auth).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
        assert!(!service.allowed(&auth, "http://a.example/private/x").await);
        assert!(service.allowed(&auth, "http://a.example/ok").await);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let (service, stub) = service(StubFetcher::new(vec![StubFetcher::ok(200, "")]));
        let service = Arc::new(service);
        let auth = authority("http://a.example");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let service = service.clone();
            let auth = auth.clone();
            handles.push(tokio::spawn(
                async move { service.record_for(&auth).await },
            ));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_404_is_immediate_fallback() {
        let (service, stub) = service(StubFetcher::new(vec![StubFetcher::ok(404, "")]));
        let record = service.record_for(&authority("http://a.example")).await;
        assert!(record.is_fallback);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_5xx_retries_then_falls_back() {
        let (service, stub) = service(StubFetcher::new(vec![
            StubFetcher::ok(500, ""),
            StubFetcher::ok(503, ""),
            StubFetcher::ok(500, ""),
        ]));
        let record = service.record_for(&authority("http://a.example")).await;
        assert!(record.is_fallback);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1 + MAX_RETRIES);
    }

    #[tokio::test]
    async fn test_5xx_then_success_uses_rules() {
        let (service, _) = service(StubFetcher::new(vec![
            StubFetcher::ok(500, ""),
            StubFetcher::ok(200, "User-agent: *\nDisallow: /"),
        ]));
        let record = service.record_for(&authority("http://a.example")).await;
        assert!(!record.is_fallback);
        assert!(!record.allowed("TestBot", "http://a.example/x"));
    }

    #[tokio::test]
    async fn test_offsite_redirect_is_no_robots() {
        let (service, stub) =
            service(StubFetcher::new(vec![Ok(RobotsOutcome::Unavailable)]));
        let record = service.record_for(&authority("http://a.example")).await;
        assert!(record.is_fallback);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }
}
