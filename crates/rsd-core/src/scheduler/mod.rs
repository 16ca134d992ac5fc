//! Bounded-concurrency, bounded-queue runner for join-details requests.
//!
//! Every `submit` enqueues one job; a single pump task drains the queue while
//! slots are free, honoring the shared rate-limit pause and the bad-target
//! denylist. Job failures are local to the job's future.

use std::collections::VecDeque;
use std::future::Future;
use std::ops::Range;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::FetchError;
use crate::target::Target;
use crate::upstream::{JoinDetails, JoinUpstream};
use crate::util::jitter_ms;

mod bad_targets;
mod lease;
mod retry;

pub use bad_targets::BadTargetCache;
pub use lease::{HeaderOverride, IdleProbe, LeaseGuard, OverrideLease};
pub use retry::{AttemptOutcome, RetryBudget, Step};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 12;
pub const DEFAULT_MAX_QUEUE: usize = 300;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_in_flight: usize,
    pub max_queue: usize,
    pub attempt_timeout: Duration,
    pub bad_target_ttl: Duration,
    pub auth_retries: u32,
    pub rate_limit_retries: u32,
    pub rate_limit_backoff_ms: Range<u64>,
    pub override_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_queue: DEFAULT_MAX_QUEUE,
            attempt_timeout: Duration::from_millis(8_000),
            bad_target_ttl: Duration::from_millis(60_000),
            auth_retries: 1,
            rate_limit_retries: 2,
            rate_limit_backoff_ms: 1_200..3_000,
            override_grace: Duration::from_millis(800),
        }
    }
}

/// Anything that can turn a target into join details. The orchestrator only
/// depends on this seam.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, target: Target) -> Result<JoinDetails, FetchError>;

    /// True when a request for `target` would be skipped without a network call.
    fn is_temporarily_bad(&self, _target: &Target) -> bool {
        false
    }
}

struct Job {
    target: Target,
    key: String,
    reply: oneshot::Sender<Result<JoinDetails, FetchError>>,
}

struct SchedulerState {
    in_flight: usize,
    queue: VecDeque<Job>,
    blocked_until: Option<Instant>,
    bad_targets: BadTargetCache,
    pumping: bool,
}

struct Inner {
    config: SchedulerConfig,
    upstream: Arc<dyn JoinUpstream>,
    lease: OverrideLease,
    state: Mutex<SchedulerState>,
    csrf_token: Mutex<Option<String>>,
}

impl IdleProbe for Inner {
    fn is_idle(&self) -> bool {
        let st = self.state.lock();
        st.in_flight == 0 && st.queue.is_empty()
    }
}

/// Point-in-time counters, mostly for diagnostics and tests.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub in_flight: usize,
    pub queued: usize,
    pub bad_targets: usize,
    pub blocked_for_ms: u64,
}

#[derive(Clone)]
pub struct RequestScheduler {
    inner: Arc<Inner>,
}

impl RequestScheduler {
    pub fn new(
        config: SchedulerConfig,
        upstream: Arc<dyn JoinUpstream>,
        rule: Arc<dyn HeaderOverride>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let probe: Weak<dyn IdleProbe> = weak.clone();
            Inner {
                lease: OverrideLease::new(rule, config.override_grace, probe),
                state: Mutex::new(SchedulerState {
                    in_flight: 0,
                    queue: VecDeque::new(),
                    blocked_until: None,
                    bad_targets: BadTargetCache::new(config.bad_target_ttl),
                    pumping: false,
                }),
                csrf_token: Mutex::new(None),
                upstream,
                config,
            }
        });
        Self { inner }
    }

    /// Clear any override a previous process left behind.
    pub async fn start(&self) {
        self.inner.lease.reset().await;
    }

    /// Reject everything still queued and drop the override regardless of
    /// outstanding references. In-flight attempts run to their timeout.
    pub async fn suspend(&self) {
        let dropped: Vec<Job> = {
            let mut st = self.inner.state.lock();
            st.queue.drain(..).collect()
        };
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "rejecting queued jobs on suspend");
        }
        for job in dropped {
            let _ = job.reply.send(Err(FetchError::Closed));
        }
        self.inner.lease.reset().await;
    }

    /// Enqueue a job now and return a future that settles exactly once.
    ///
    /// Must be called inside a Tokio runtime. When the queue is full the oldest
    /// queued job is rejected with [`FetchError::QueueOverflow`] first.
    pub fn submit(
        &self,
        target: Target,
    ) -> impl Future<Output = Result<JoinDetails, FetchError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let key = target.key();
        let capacity = self.inner.config.max_queue.max(1);
        {
            let mut st = self.inner.state.lock();
            while st.queue.len() >= capacity {
                let Some(dropped) = st.queue.pop_front() else {
                    break;
                };
                warn!(target = %dropped.key, "join queue overflow; dropping oldest request");
                let _ = dropped.reply.send(Err(FetchError::QueueOverflow));
            }
            st.queue.push_back(Job {
                target,
                key,
                reply: tx,
            });
        }
        Inner::kick(&self.inner);
        async move { rx.await.unwrap_or(Err(FetchError::Closed)) }
    }

    pub fn is_temporarily_bad(&self, target: &Target) -> bool {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .bad_targets
            .is_blocked(&target.key(), now)
    }

    pub fn stats(&self) -> SchedulerStats {
        let now = Instant::now();
        let mut st = self.inner.state.lock();
        st.bad_targets.purge(now);
        SchedulerStats {
            in_flight: st.in_flight,
            queued: st.queue.len(),
            bad_targets: st.bad_targets.len(),
            blocked_for_ms: st
                .blocked_until
                .map(|until| until.saturating_duration_since(now).as_millis() as u64)
                .unwrap_or(0),
        }
    }

    pub fn lease(&self) -> &OverrideLease {
        &self.inner.lease
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }
}

#[async_trait]
impl Enricher for RequestScheduler {
    async fn enrich(&self, target: Target) -> Result<JoinDetails, FetchError> {
        self.submit(target).await
    }

    fn is_temporarily_bad(&self, target: &Target) -> bool {
        RequestScheduler::is_temporarily_bad(self, target)
    }
}

impl Inner {
    fn kick(this: &Arc<Self>) {
        {
            let mut st = this.state.lock();
            if st.pumping {
                return;
            }
            st.pumping = true;
        }
        tokio::spawn(Arc::clone(this).pump());
    }

    async fn pump(self: Arc<Self>) {
        loop {
            let wait_until = {
                let mut st = self.state.lock();
                if st.in_flight >= self.config.max_in_flight || st.queue.is_empty() {
                    st.pumping = false;
                    let idle = st.in_flight == 0 && st.queue.is_empty();
                    drop(st);
                    // Skipped jobs settle without a slot, so no SlotGuard re-checks the lease.
                    if idle {
                        self.lease.schedule_uninstall();
                    }
                    return;
                }
                let now = Instant::now();
                match st.blocked_until {
                    Some(until) if now < until => Some(until),
                    _ => {
                        let Some(job) = st.queue.pop_front() else {
                            st.pumping = false;
                            return;
                        };
                        if st.bad_targets.is_blocked(&job.key, now) {
                            debug!(target = %job.key, "skipping recently failed target");
                            let _ = job.reply.send(Err(FetchError::TemporarilySkipped));
                            continue;
                        }
                        st.in_flight += 1;
                        let slot = SlotGuard {
                            inner: Arc::clone(&self),
                        };
                        tokio::spawn(Arc::clone(&self).run(job, slot));
                        None
                    }
                }
            };
            if let Some(until) = wait_until {
                trace!("pump paused for shared rate-limit backoff");
                tokio::time::sleep_until(until).await;
            }
        }
    }

    async fn run(self: Arc<Self>, job: Job, slot: SlotGuard) {
        let result = self.execute(&job.target, &job.key).await;
        if let Err(err) = &result {
            debug!(target = %job.key, status = err.status(), %err, "join request failed");
        }
        let _ = job.reply.send(result);
        drop(slot);
    }

    async fn execute(&self, target: &Target, key: &str) -> Result<JoinDetails, FetchError> {
        let mut budget = RetryBudget::new(self.config.auth_retries, self.config.rate_limit_retries);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let token = self.csrf_token.lock().clone();
            let response = {
                let _lease = self.lease.acquire().await?;
                tokio::time::timeout(
                    self.config.attempt_timeout,
                    self.upstream.request_join(target, token.as_deref()),
                )
                .await
            };
            let response = match response {
                Ok(Ok(resp)) => resp,
                Ok(Err(err)) => return Err(self.fail_attempt(key, FetchError::Transport(err.0))),
                Err(_) => return Err(self.fail_attempt(key, FetchError::Timeout)),
            };
            match budget.next(AttemptOutcome::from_response(response)) {
                Step::Done(result) => return result,
                Step::RefreshToken(token) => {
                    debug!(target = %key, attempt, "anti-forgery token refreshed; retrying");
                    *self.csrf_token.lock() = Some(token);
                }
                Step::Backoff => {
                    let delay = jitter_ms(&self.config.rate_limit_backoff_ms);
                    self.state.lock().blocked_until = Some(Instant::now() + delay);
                    warn!(
                        target = %key,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        "join request rate limited; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn fail_attempt(&self, key: &str, err: FetchError) -> FetchError {
        if err.marks_target_bad() {
            let now = Instant::now();
            self.state.lock().bad_targets.mark(key.to_string(), now);
            debug!(target = %key, "target marked temporarily bad");
        }
        err
    }
}

/// One occupied in-flight slot. Dropping it frees the slot and restarts the
/// pump in the same critical section, even if the job panicked.
struct SlotGuard {
    inner: Arc<Inner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let start_pump = {
            let mut st = self.inner.state.lock();
            st.in_flight = st.in_flight.saturating_sub(1);
            if st.pumping || st.queue.is_empty() {
                false
            } else {
                st.pumping = true;
                true
            }
        };
        if start_pump {
            tokio::spawn(Arc::clone(&self.inner).pump());
        }
        self.inner.lease.schedule_uninstall();
    }
}
