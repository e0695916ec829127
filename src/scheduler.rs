//! The top-level scheduler: ties queues, throttles, the dedup filter, and
//! the config watcher into the enqueue/dequeue request path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config_watcher::{ConfigEvent, ConfigWatcher};
use crate::domain::registered_domain;
use crate::domain_config::DomainConfig;
use crate::dupefilter::DupeFilter;
use crate::error::SchedulerError;
use crate::public_ip::PublicIpProvider;
use crate::queue::PriorityQueue;
use crate::request::{MetaValue, RequestRecord};
use crate::throttle::ThrottledQueue;

/// Static, rarely-changing knobs. Built from [`crate::config::Settings`] at
/// startup; kept separate from the scheduler's mutable runtime state.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub persist: bool,
    pub queue_refresh: Duration,
    pub ip_refresh: Duration,
    pub item_retries: u32,
    pub add_type: bool,
    pub add_ip: bool,
    pub default_window: f64,
    pub default_hits: i64,
    pub default_moderated: bool,
    pub dupefilter_timeout: u64,
    pub config_key: String,
    pub config_channel: String,
    pub config_poll_interval: Duration,
}

/// A request hydrated from a stored [`RequestRecord`], ready to hand back
/// to the fetcher. Distinct from `RequestRecord` because hydration fills in
/// defaults and merges header/cookie state that only makes sense once a
/// record leaves the queue.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: String,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
    pub cookies: HashMap<String, String>,
    pub meta: HashMap<String, MetaValue>,
    pub encoding: Option<String>,
    pub priority: i64,
    pub callback: Option<String>,
    pub errback: Option<String>,
}

/// Per-domain priority queue fabric, gated by a distributed throttle, with
/// dedup, blacklist, and live reconfiguration wired in.
///
/// Queue discovery and IP refresh are only ever touched from the task that
/// drives `next_request`/`enqueue_request` — there is exactly one logical
/// fetcher per scheduler instance, so those fields need no synchronization.
/// `domain_config` and `config_dirty`, in contrast, are written by the
/// config-watcher task and read here, so they're behind an `Arc<RwLock<_>>`
/// / `Arc<AtomicBool>`, the same split the crawler's own rate limiter uses
/// for state shared between its fetch loop and a background task
/// (`scrapers/rate_limiter/mod.rs`).
pub struct Scheduler {
    conn: ConnectionManager,
    redis_client: redis::Client,
    ip_provider: Box<dyn PublicIpProvider>,
    config: SchedulerConfig,

    spidername: String,
    dupefilter: Option<DupeFilter>,

    queue_dict: HashMap<String, ThrottledQueue>,
    queue_keys: Vec<String>,
    my_ip: String,
    last_queue_refresh: Option<Instant>,
    last_ip_refresh: Option<Instant>,

    domain_config: Arc<RwLock<HashMap<String, DomainConfig>>>,
    config_dirty: Arc<AtomicBool>,
    watcher: Option<ConfigWatcher>,
    watcher_apply_task: Option<tokio::task::JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        conn: ConnectionManager,
        redis_client: redis::Client,
        ip_provider: Box<dyn PublicIpProvider>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            conn,
            redis_client,
            ip_provider,
            config,
            spidername: String::new(),
            dupefilter: None,
            queue_dict: HashMap::new(),
            queue_keys: Vec::new(),
            my_ip: "127.0.0.1".to_string(),
            last_queue_refresh: None,
            last_ip_refresh: None,
            domain_config: Arc::new(RwLock::new(HashMap::new())),
            config_dirty: Arc::new(AtomicBool::new(false)),
            watcher: None,
            watcher_apply_task: None,
        }
    }

    /// Capture spider identity, build the initial queue set, start the
    /// config watcher, and construct the dedup filter.
    pub async fn open(&mut self, spidername: &str) -> Result<(), SchedulerError> {
        self.spidername = spidername.to_string();
        self.my_ip = self.ip_provider.current_ip().await;

        self.dupefilter = Some(DupeFilter::new(
            self.conn.clone(),
            format!("{}:dupefilter", spidername),
            self.config.dupefilter_timeout,
        ));

        self.discover_queues().await?;
        self.last_queue_refresh = Some(Instant::now());
        self.last_ip_refresh = Some(Instant::now());

        let (watcher, mut rx) = ConfigWatcher::spawn(
            self.conn.clone(),
            self.redis_client.clone(),
            self.config.config_key.clone(),
            self.config.config_channel.clone(),
            self.config.config_poll_interval,
        );
        self.watcher = Some(watcher);

        let domain_config = self.domain_config.clone();
        let config_dirty = self.config_dirty.clone();
        self.watcher_apply_task = Some(tokio::spawn(async move {
            apply_config_events(&mut rx, domain_config, config_dirty).await;
        }));

        info!(spider = %spidername, "scheduler opened");
        Ok(())
    }

    /// If `persist` is false, wipe the dedup filter and every known queue.
    pub async fn close(&mut self, reason: &str) -> Result<(), SchedulerError> {
        info!(spider = %self.spidername, %reason, "scheduler closing");

        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(handle) = self.watcher_apply_task.take() {
            handle.abort();
        }

        if !self.config.persist {
            if let Some(filter) = &self.dupefilter {
                filter.clear().await?;
            }
            for queue in self.queue_dict.values() {
                queue.clear().await?;
            }
        }

        Ok(())
    }

    fn queue_scan_pattern(&self) -> String {
        format!("{}:*:queue", self.spidername)
    }

    fn domain_of_queue_key(&self, key: &str) -> Option<String> {
        let prefix = format!("{}:", self.spidername);
        let suffix = ":queue";
        key.strip_prefix(&prefix)?.strip_suffix(suffix).map(str::to_string)
    }

    fn compose_throttle_key(&self, domain: &str) -> String {
        let mut parts = Vec::new();
        if self.config.add_type {
            parts.push(self.spidername.clone());
        }
        if self.config.add_ip {
            parts.push(self.my_ip.clone());
        }
        parts.push(domain.to_string());
        parts.join(":")
    }

    async fn throttle_params_for(&self, domain: &str) -> (f64, i64, bool) {
        let overrides = self.domain_config.read().await;
        match overrides.get(domain) {
            Some(cfg) => (cfg.window, cfg.effective_hits(), self.config.default_moderated),
            None => (
                self.config.default_window,
                self.config.default_hits,
                self.config.default_moderated,
            ),
        }
    }

    async fn build_queue(&self, key: &str, domain: &str) -> ThrottledQueue {
        let (window, hits, moderated) = self.throttle_params_for(domain).await;
        let inner = PriorityQueue::new(self.conn.clone(), key.to_string());
        ThrottledQueue::new(
            self.conn.clone(),
            inner,
            window,
            hits,
            moderated,
            self.compose_throttle_key(domain),
        )
    }

    /// Enumerate live queues in Redis and adopt any not already tracked.
    /// Existing queues are never dropped from memory mid-run; a Redis key
    /// that disappears simply stops appearing in `queue_keys`.
    async fn discover_queues(&mut self) -> Result<(), SchedulerError> {
        let pattern = self.queue_scan_pattern();
        let mut conn = self.conn.clone();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await?;

        let mut discovered = Vec::new();
        while let Some(key) = futures_util::StreamExt::next(&mut iter).await {
            discovered.push(key);
        }
        drop(iter);

        for key in &discovered {
            if !self.queue_dict.contains_key(key) {
                if let Some(domain) = self.domain_of_queue_key(key) {
                    let queue = self.build_queue(key, &domain).await;
                    self.queue_dict.insert(key.clone(), queue);
                }
            }
        }

        self.queue_keys = discovered;
        Ok(())
    }

    /// Rebuild throttle parameters for every already-known queue from the
    /// current override map (or defaults, if the map has no entry for that
    /// queue's domain). Called whenever `config_dirty` was raised.
    async fn rebuild_throttle_params(&mut self) {
        let domains: Vec<(String, String)> = self
            .queue_dict
            .keys()
            .filter_map(|key| self.domain_of_queue_key(key).map(|d| (key.clone(), d)))
            .collect();

        for (key, domain) in domains {
            let (window, hits, moderated) = self.throttle_params_for(&domain).await;
            if let Some(queue) = self.queue_dict.get_mut(&key) {
                queue.window = window;
                queue.limit = hits;
                queue.moderated = moderated;
            }
        }
    }

    async fn maybe_refresh_queues(&mut self) -> Result<(), SchedulerError> {
        let dirty = self.config_dirty.swap(false, Ordering::SeqCst);
        let elapsed = self
            .last_queue_refresh
            .map(|t| t.elapsed() >= self.config.queue_refresh)
            .unwrap_or(true);

        if dirty {
            self.rebuild_throttle_params().await;
        }

        if dirty || elapsed {
            self.discover_queues().await?;
            self.last_queue_refresh = Some(Instant::now());
        }

        Ok(())
    }

    async fn maybe_refresh_ip(&mut self) {
        let elapsed = self
            .last_ip_refresh
            .map(|t| t.elapsed() >= self.config.ip_refresh)
            .unwrap_or(true);

        if !elapsed {
            return;
        }

        let new_ip = self.ip_provider.current_ip().await;
        if new_ip != self.my_ip {
            info!(old_ip = %self.my_ip, new_ip = %new_ip, "public IP changed");
            self.my_ip = new_ip;
        }
        self.last_ip_refresh = Some(Instant::now());
    }

    /// Reject if `dont_filter` is false and the dedup filter has already
    /// seen this request, if the `(appid, crawlid)` pair is blacklisted, or
    /// if the request has expired. Otherwise routes it to the
    /// domain-appropriate queue.
    pub async fn enqueue_request(&mut self, record: RequestRecord) -> Result<(), SchedulerError> {
        if !record.dont_filter {
            if let Some(filter) = &self.dupefilter {
                if filter.request_seen(&record).await? {
                    debug!(url = %record.url, "dropping duplicate request");
                    return Ok(());
                }
            }
        }

        if let (Some(appid), Some(crawlid)) = (record.appid(), record.crawlid()) {
            let member = format!("{}||{}", appid, crawlid);
            let mut conn = self.conn.clone();
            let blacklisted: bool = conn
                .sismember(format!("{}:blacklist", self.spidername), &member)
                .await?;
            if blacklisted {
                debug!(url = %record.url, %member, "dropping blacklisted request");
                return Ok(());
            }
        }

        let expires = record.expires();
        if expires != 0 {
            let now = chrono::Utc::now().timestamp();
            if now > expires {
                debug!(url = %record.url, "dropping expired request");
                return Ok(());
            }
        }

        let domain = registered_domain(&record.url).unwrap_or_else(|| "unknown".to_string());
        let key = format!("{}:{}:queue", self.spidername, domain);
        let priority = record.priority;

        if let Some(queue) = self.queue_dict.get(&key) {
            queue.push(&record, priority).await?;
        } else {
            // Not yet adopted into memory; write directly so the next
            // `discover_queues` refresh picks it up.
            let raw = PriorityQueue::new(self.conn.clone(), key);
            raw.push(&record, priority).await?;
        }

        Ok(())
    }

    /// Shuffle queue keys, then try each in turn for up to `item_retries`
    /// rounds, sleeping a random interval between rounds to desynchronize
    /// workers. A pop may come back empty because the queue is empty or
    /// because the throttle denied it — `find_item` can't tell which, by
    /// design (spec.md §4.5.5).
    async fn find_item(&mut self) -> Result<Option<RequestRecord>, SchedulerError> {
        let mut keys = self.queue_keys.clone();
        keys.shuffle(&mut rand::thread_rng());

        for _ in 0..self.config.item_retries.max(1) {
            for key in &keys {
                if let Some(queue) = self.queue_dict.get(key) {
                    if let Some(item) = queue.pop().await? {
                        return Ok(Some(item));
                    }
                }
            }
            let jitter = rand::random::<f64>();
            tokio::time::sleep(Duration::from_secs_f64(jitter)).await;
        }

        Ok(None)
    }

    /// Refresh queues/IP as needed, pop the next item, and hydrate it into
    /// a [`Request`]. Returns `Ok(None)` if nothing is currently available.
    pub async fn next_request(&mut self) -> Result<Option<Request>, SchedulerError> {
        self.maybe_refresh_queues().await?;
        self.maybe_refresh_ip().await;

        match self.find_item().await? {
            Some(record) => Ok(Some(hydrate(record)?)),
            None => Ok(None),
        }
    }

    /// Always `false` — upstream fetchers must poll `next_request` on
    /// their own cadence rather than waiting on a signal.
    pub fn has_pending_requests(&self) -> bool {
        false
    }
}

async fn apply_config_events(
    rx: &mut mpsc::Receiver<ConfigEvent>,
    domain_config: Arc<RwLock<HashMap<String, DomainConfig>>>,
    config_dirty: Arc<AtomicBool>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            ConfigEvent::Applied(map) => {
                *domain_config.write().await = map;
            }
            ConfigEvent::Wiped | ConfigEvent::Error(_) => {
                if !domain_config.read().await.is_empty() {
                    warn!("reverting domain overrides to scheduler defaults");
                }
                domain_config.write().await.clear();
            }
        }
        config_dirty.store(true, Ordering::SeqCst);
    }
}

/// Hydrate a stored record into a `Request`: parse the URL (retrying once
/// with an `http://` prefix), lift a nested `meta.meta` map if present,
/// apply `curdepth`/`retry_times` defaults, and fold `useragent`/`cookie`
/// into headers/cookies.
fn hydrate(record: RequestRecord) -> Result<Request, SchedulerError> {
    let url = Url::parse(&record.url)
        .or_else(|_| Url::parse(&format!("http://{}", record.url)))
        .map_err(|_| SchedulerError::InvalidUrl(record.url.clone()))?;

    let mut meta = record.meta;
    if let Some(nested) = meta.remove("meta").and_then(|v| match v {
        MetaValue::Map(m) => Some(m),
        _ => None,
    }) {
        for (k, v) in nested {
            meta.entry(k).or_insert(v);
        }
    }
    meta.entry("curdepth".to_string()).or_insert(MetaValue::Integer(0));
    meta.entry("retry_times".to_string())
        .or_insert(MetaValue::Integer(0));

    let mut headers = record.headers;
    if let Some(useragent) = meta.get("useragent").and_then(MetaValue::as_str) {
        headers.insert("User-Agent".to_string(), vec![useragent.to_string()]);
    }

    let mut cookies = record.cookies;
    if let Some(cookie_value) = meta.get("cookie") {
        match cookie_value {
            MetaValue::Map(m) => {
                for (k, v) in m {
                    if let Some(s) = v.as_str() {
                        cookies.insert(k.clone(), s.to_string());
                    }
                }
            }
            MetaValue::String(raw) => {
                cookies.extend(crate::request::parse_cookie_string(raw));
            }
            _ => {}
        }
    }

    Ok(Request {
        url,
        method: record.method,
        headers,
        body: record.body,
        cookies,
        meta,
        encoding: record.encoding,
        priority: record.priority,
        callback: record.callback,
        errback: record.errback,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn base_record(url: &str) -> RequestRecord {
        RequestRecord {
            url: url.to_string(),
            method: "GET".to_string(),
            headers: Map::new(),
            body: vec![],
            cookies: Map::new(),
            meta: Map::new(),
            encoding: None,
            priority: 0,
            dont_filter: false,
            callback: None,
            errback: None,
        }
    }

    #[test]
    fn hydrate_retries_with_http_prefix_on_bad_url() {
        let record = base_record("example.com/a");
        let req = hydrate(record).unwrap();
        assert_eq!(req.url.scheme(), "http");
        assert_eq!(req.url.host_str(), Some("example.com"));
    }

    #[test]
    fn hydrate_fills_curdepth_and_retry_times_defaults() {
        let record = base_record("https://example.com/a");
        let req = hydrate(record).unwrap();
        assert_eq!(req.meta.get("curdepth").and_then(MetaValue::as_i64), Some(0));
        assert_eq!(req.meta.get("retry_times").and_then(MetaValue::as_i64), Some(0));
    }

    #[test]
    fn hydrate_applies_useragent_to_headers() {
        let mut record = base_record("https://example.com/a");
        record.meta.insert("useragent".to_string(), MetaValue::from("test-bot/1.0"));
        let req = hydrate(record).unwrap();
        assert_eq!(
            req.headers.get("User-Agent"),
            Some(&vec!["test-bot/1.0".to_string()])
        );
    }

    #[test]
    fn hydrate_parses_string_cookie_meta() {
        let mut record = base_record("https://example.com/a");
        record
            .meta
            .insert("cookie".to_string(), MetaValue::from("a=b; c=d;"));
        let req = hydrate(record).unwrap();
        assert_eq!(req.cookies.get("a"), Some(&"b".to_string()));
        assert_eq!(req.cookies.get("c"), Some(&"d".to_string()));
    }

    #[test]
    fn hydrate_lifts_nested_meta_map() {
        let mut record = base_record("https://example.com/a");
        let mut nested = Map::new();
        nested.insert("crawlid".to_string(), MetaValue::from("abc"));
        record.meta.insert("meta".to_string(), MetaValue::Map(nested));
        let req = hydrate(record).unwrap();
        assert_eq!(req.meta.get("crawlid").and_then(MetaValue::as_str), Some("abc"));
        assert!(!req.meta.contains_key("meta"));
    }
}
