//! Listing pagination, dedup, bounded enrichment and per-region caches.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::PageError;
use crate::region::{classify, subnet_of, Classification, Coordinates, RegionCode, SubnetLocationTable};
use crate::scheduler::Enricher;
use crate::target::{Instance, Target};
use crate::upstream::{ListingPage, ListingUpstream};
use crate::util::jitter_ms;

mod observer;
mod pool;
mod session;

pub use observer::{DiscoveryObserver, NoopObserver};
pub use pool::map_limit;
pub use session::{ClassifiedInstance, DiscoverySession, SessionSnapshot};

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Simultaneous enrichment calls per page.
    pub workers: usize,
    pub page_retries: u32,
    pub page_backoff: Duration,
    pub page_backoff_factor: u32,
    /// Bound on one listing request; a stalled page aborts the loop.
    pub page_timeout: Duration,
    /// Pacing after a rate-limited page before the next page may start.
    pub page_rate_limit_pause_ms: Range<u64>,
    /// Pacing after a rate-limited enrichment before the next page may start.
    pub enrich_rate_limit_pause_ms: Range<u64>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            workers: 12,
            page_retries: 5,
            page_backoff: Duration::from_millis(2_000),
            page_backoff_factor: 2,
            page_timeout: Duration::from_millis(15_000),
            page_rate_limit_pause_ms: 500..1_000,
            enrich_rate_limit_pause_ms: 800..1_500,
        }
    }
}

/// Which part of the session a refresh rebuilds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefreshScope {
    All,
    Region(RegionCode),
}

impl RefreshScope {
    pub const ALL: &'static str = "all";
}

impl FromStr for RefreshScope {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("refresh scope must be \"all\" or a region code".into());
        }
        if trimmed.eq_ignore_ascii_case(Self::ALL) {
            return Ok(RefreshScope::All);
        }
        Ok(RefreshScope::Region(RegionCode::new(trimmed)))
    }
}

impl fmt::Display for RefreshScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshScope::All => f.write_str(Self::ALL),
            RefreshScope::Region(code) => write!(f, "{code}"),
        }
    }
}

impl Serialize for RefreshScope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    Completed,
    Aborted,
    /// A full refresh was already running; nothing was done.
    AlreadyRunning,
}

/// Sent to observers at refresh end and returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub collection_id: String,
    pub scope: RefreshScope,
    pub outcome: RefreshOutcome,
    pub pages: u32,
    pub instances: usize,
    pub rate_limited: bool,
    pub error: Option<String>,
}

/// Drives one collection's discovery. Share it behind an `Arc`.
pub struct DiscoveryOrchestrator {
    listing: Arc<dyn ListingUpstream>,
    enricher: Arc<dyn Enricher>,
    table: Arc<SubnetLocationTable>,
    observer: Arc<dyn DiscoveryObserver>,
    config: DiscoveryConfig,
    session: Mutex<DiscoverySession>,
    next_uid: AtomicU64,
}

/// Holds `refresh_in_progress` for the lifetime of one full refresh.
struct RefreshGuard<'a> {
    session: &'a Mutex<DiscoverySession>,
}

impl<'a> RefreshGuard<'a> {
    fn try_begin(session: &'a Mutex<DiscoverySession>) -> Option<Self> {
        let mut s = session.lock();
        if s.refresh_in_progress {
            return None;
        }
        s.refresh_in_progress = true;
        Some(Self { session })
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.session.lock().refresh_in_progress = false;
    }
}

impl DiscoveryOrchestrator {
    pub fn new(
        listing: Arc<dyn ListingUpstream>,
        enricher: Arc<dyn Enricher>,
        table: Arc<SubnetLocationTable>,
        observer: Arc<dyn DiscoveryObserver>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            listing,
            enricher,
            table,
            observer,
            config,
            session: Mutex::new(DiscoverySession::default()),
            next_uid: AtomicU64::new(1),
        }
    }

    /// Fire-and-forget refresh on the current runtime.
    pub fn request_refresh(self: &Arc<Self>, collection_id: impl Into<String>, scope: RefreshScope) {
        let this = Arc::clone(self);
        let collection_id = collection_id.into();
        tokio::spawn(async move {
            this.refresh(&collection_id, scope).await;
        });
    }

    /// Run one refresh to completion. A full refresh started while another is
    /// running returns [`RefreshOutcome::AlreadyRunning`] immediately.
    pub async fn refresh(&self, collection_id: &str, scope: RefreshScope) -> RefreshSummary {
        let _guard = if scope == RefreshScope::All {
            match RefreshGuard::try_begin(&self.session) {
                Some(guard) => Some(guard),
                None => {
                    debug!(collection = collection_id, "full refresh already running");
                    return self.summary(collection_id, scope, RefreshOutcome::AlreadyRunning, 0, None);
                }
            }
        } else {
            None
        };

        {
            let mut s = self.session.lock();
            match &scope {
                RefreshScope::All => s.reset_all(collection_id),
                RefreshScope::Region(region) => {
                    if s.collection_id() != Some(collection_id) {
                        s.reset_all(collection_id);
                    }
                    s.reset_region(region);
                }
            }
        }
        self.set_rate_limited(false);
        info!(collection = collection_id, scope = %scope, "refresh started");
        self.observer.refresh_started(collection_id, &scope);

        let (pages, error) = match self.paginate(collection_id).await {
            Ok(pages) => (pages, None),
            Err((pages, err)) => {
                warn!(collection = collection_id, %err, "pagination aborted");
                (pages, Some(err))
            }
        };

        {
            let mut s = self.session.lock();
            match &scope {
                RefreshScope::All => s.rebuild_regions(),
                RefreshScope::Region(region) => s.rebuild_region(region),
            }
        }
        let outcome = if error.is_some() {
            RefreshOutcome::Aborted
        } else {
            RefreshOutcome::Completed
        };
        let summary = self.summary(collection_id, scope, outcome, pages, error);
        info!(
            collection = collection_id,
            pages = summary.pages,
            instances = summary.instances,
            rate_limited = summary.rate_limited,
            "refresh finished"
        );
        self.observer.refresh_finished(&summary);
        summary
    }

    fn summary(
        &self,
        collection_id: &str,
        scope: RefreshScope,
        outcome: RefreshOutcome,
        pages: u32,
        error: Option<PageError>,
    ) -> RefreshSummary {
        let s = self.session.lock();
        RefreshSummary {
            collection_id: collection_id.to_string(),
            scope,
            outcome,
            pages,
            instances: s.all_instances().len(),
            rate_limited: s.rate_limited,
            error: error.map(|e| e.to_string()),
        }
    }

    /// Returns the number of pages processed, or that count plus the error
    /// that stopped the loop.
    async fn paginate(&self, collection_id: &str) -> Result<u32, (u32, PageError)> {
        let mut cursor: Option<String> = None;
        let mut pages = 0u32;
        loop {
            let page = self
                .fetch_page_with_retry(collection_id, cursor.as_deref())
                .await
                .map_err(|err| (pages, err))?;
            pages += 1;
            let ListingPage {
                mut data,
                next_page_cursor,
            } = page;
            debug!(collection = collection_id, page = pages, size = data.len(), "listing page fetched");

            for instance in &mut data {
                instance.uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
            }
            let batch = self.session.lock().merge_page(collection_id, data);
            if !batch.is_empty() {
                map_limit(batch, self.config.workers, |instance| {
                    self.handle_instance(collection_id, instance)
                })
                .await;
            }

            self.session.lock().next_page_cursor = next_page_cursor.clone();
            let Some(next) = next_page_cursor else {
                return Ok(pages);
            };
            self.wait_for_page_slot().await;
            cursor = Some(next);
        }
    }

    async fn fetch_page_with_retry(
        &self,
        collection_id: &str,
        cursor: Option<&str>,
    ) -> Result<ListingPage, PageError> {
        let mut backoff = self.config.page_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let resp = tokio::time::timeout(
                self.config.page_timeout,
                self.listing.fetch_page(collection_id, cursor),
            )
            .await
            .map_err(|_| PageError::Transport("listing request timed out".into()))?
            .map_err(|err| PageError::Transport(err.0))?;
            match resp.status {
                _ if resp.is_success() => {
                    self.set_rate_limited(false);
                    return ListingPage::parse(&resp.body)
                        .map_err(|err| PageError::Malformed(err.to_string()));
                }
                429 => {
                    self.set_rate_limited(true);
                    self.defer_next_page(&self.config.page_rate_limit_pause_ms);
                    if attempt > self.config.page_retries {
                        return Err(PageError::RateLimited { attempts: attempt });
                    }
                    warn!(
                        collection = collection_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "listing rate limited; retrying page"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(self.config.page_backoff_factor);
                }
                status @ (401 | 403) => return Err(PageError::Auth { status }),
                status => return Err(PageError::Upstream { status }),
            }
        }
    }

    /// Classify one instance, from cache when possible. Never fails.
    async fn handle_instance(&self, collection_id: &str, instance: Instance) -> RegionCode {
        let target = instance.target(collection_id);
        let cached = self.session.lock().classification(&target).cloned();
        if let Some(cached) = cached {
            if !cached.region_code.is_unknown() {
                self.publish_region(&cached.region_code, &target, &instance);
            }
            return cached.region_code;
        }

        let classification = match self.enricher.enrich(target.clone()).await {
            Ok(details) => {
                if let Some(location) = details.client_location() {
                    self.session.lock().client_location = Some(location);
                }
                let subnet = details.address().and_then(subnet_of);
                classify(subnet.as_deref(), &self.table)
            }
            Err(err) => {
                if err.is_rate_limited() {
                    self.set_rate_limited(true);
                    self.defer_next_page(&self.config.enrich_rate_limit_pause_ms);
                }
                debug!(target = %target, status = err.status(), %err, "enrichment failed; classifying as unknown");
                Classification::unknown()
            }
        };

        let region = classification.region_code.clone();
        {
            let mut s = self.session.lock();
            s.record(target.clone(), classification);
            if !region.is_unknown() {
                s.note_representative(&region, &instance);
            }
        }
        if !region.is_unknown() {
            self.publish_region(&region, &target, &instance);
        }
        region
    }

    fn publish_region(&self, region: &RegionCode, target: &Target, instance: &Instance) {
        let added = self.session.lock().append_to_region(region, target);
        if added {
            self.observer.instance_classified(region, instance);
        }
    }

    fn set_rate_limited(&self, rate_limited: bool) {
        let changed = {
            let mut s = self.session.lock();
            let changed = s.rate_limited != rate_limited;
            s.rate_limited = rate_limited;
            changed
        };
        if changed {
            self.observer.rate_limited_changed(rate_limited);
        }
    }

    fn defer_next_page(&self, pause_ms: &Range<u64>) {
        let until = Instant::now() + jitter_ms(pause_ms);
        self.session.lock().next_page_earliest = Some(until);
    }

    async fn wait_for_page_slot(&self) {
        let until = self.session.lock().next_page_earliest;
        if let Some(until) = until {
            if until > Instant::now() {
                debug!("pacing next listing page");
                tokio::time::sleep_until(until).await;
            }
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.session.lock().refresh_in_progress
    }

    pub fn rate_limited(&self) -> bool {
        self.session.lock().rate_limited()
    }

    pub fn classification(&self, target: &Target) -> Option<Classification> {
        self.session.lock().classification(target).cloned()
    }

    pub fn instances_in(&self, region: &RegionCode) -> Vec<Instance> {
        self.session.lock().instances_in(region)
    }

    pub fn representative(&self, region: &RegionCode) -> Option<Instance> {
        self.session.lock().representative(region).cloned()
    }

    pub fn client_location(&self) -> Option<Coordinates> {
        self.session.lock().client_location()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.lock().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parses_all_and_region_codes() {
        assert_eq!("all".parse::<RefreshScope>().unwrap(), RefreshScope::All);
        assert_eq!(" ALL ".parse::<RefreshScope>().unwrap(), RefreshScope::All);
        assert_eq!(
            "us-ca".parse::<RefreshScope>().unwrap(),
            RefreshScope::Region(RegionCode::new("US-CA"))
        );
        assert!("  ".parse::<RefreshScope>().is_err());
        assert_eq!(RefreshScope::Region(RegionCode::new("de")).to_string(), "DE");
    }

    #[test]
    fn summary_serializes_scope_as_string() {
        let summary = RefreshSummary {
            collection_id: "1".into(),
            scope: RefreshScope::All,
            outcome: RefreshOutcome::Completed,
            pages: 1,
            instances: 3,
            rate_limited: false,
            error: None,
        };
        let v = serde_json::to_value(&summary).unwrap();
        assert_eq!(v["scope"], "all");
        assert_eq!(v["outcome"], "completed");
    }
}
