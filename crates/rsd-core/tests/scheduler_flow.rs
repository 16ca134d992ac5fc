use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use rsd_core::scheduler::{Enricher, HeaderOverride, RequestScheduler, SchedulerConfig};
use rsd_core::upstream::{JoinUpstream, RawResponse, TransportError, UserAgentRule};
use rsd_core::{FetchError, Target};
use serde_json::json;
use tokio::time::{sleep, Duration, Instant};

enum Reply {
    Respond(RawResponse),
    Hang,
    Refuse,
}

type Script = Box<dyn Fn(&Target, Option<&str>, usize) -> Reply + Send + Sync>;

struct Call {
    key: String,
    token: Option<String>,
    at: Instant,
}

struct FakeJoin {
    script: Script,
    delay: Duration,
    calls: Mutex<Vec<Call>>,
    live: AtomicUsize,
    peak: AtomicUsize,
}

struct LiveGuard<'a>(&'a AtomicUsize);

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeJoin {
    fn new(
        delay: Duration,
        script: impl Fn(&Target, Option<&str>, usize) -> Reply + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            delay,
            calls: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn always_ok(delay: Duration) -> Arc<Self> {
        Self::new(delay, |_, _, _| Reply::Respond(ok_response("128.116.1.5")))
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.key == key).count()
    }
}

#[async_trait]
impl JoinUpstream for FakeJoin {
    async fn request_join(
        &self,
        target: &Target,
        csrf_token: Option<&str>,
    ) -> Result<RawResponse, TransportError> {
        let nth = {
            let mut calls = self.calls.lock();
            let nth = calls.iter().filter(|c| c.key == target.key()).count();
            calls.push(Call {
                key: target.key(),
                token: csrf_token.map(str::to_string),
                at: Instant::now(),
            });
            nth
        };
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _live = LiveGuard(&self.live);
        let reply = (self.script)(target, csrf_token, nth);
        sleep(self.delay).await;
        match reply {
            Reply::Respond(resp) => Ok(resp),
            Reply::Hang => std::future::pending().await,
            Reply::Refuse => Err(TransportError("connection refused".into())),
        }
    }
}

#[derive(Default)]
struct CountingRule {
    installs: AtomicUsize,
    removals: AtomicUsize,
}

#[async_trait]
impl HeaderOverride for CountingRule {
    fn is_available(&self) -> bool {
        true
    }
    async fn install(&self) -> anyhow::Result<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn remove(&self) -> anyhow::Result<()> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn ok_response(address: &str) -> RawResponse {
    RawResponse::ok_json(&json!({
        "joinScript": {"UdmuxEndpoints": [{"Address": address}]}
    }))
}

fn scheduler(upstream: Arc<FakeJoin>) -> RequestScheduler {
    RequestScheduler::new(
        SchedulerConfig::default(),
        upstream,
        Arc::new(UserAgentRule::new("Agent/1", true)),
    )
}

#[tokio::test(start_paused = true)]
async fn in_flight_never_exceeds_twelve() {
    let upstream = FakeJoin::always_ok(Duration::from_millis(100));
    let sched = scheduler(upstream.clone());

    let pending: Vec<_> = (0..40)
        .map(|i| sched.submit(Target::new("1", format!("i{i}"))))
        .collect();
    assert!(sched.stats().queued <= 300);
    let results = join_all(pending).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(upstream.call_count(), 40);
    assert_eq!(upstream.peak.load(Ordering::SeqCst), 12);
    assert_eq!(sched.stats().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn submission_past_capacity_rejects_oldest_queued() {
    let upstream = FakeJoin::always_ok(Duration::from_millis(10));
    let sched = scheduler(upstream.clone());

    // Nothing runs until the test yields, so all 301 submissions hit the queue.
    let pending: Vec<_> = (0..301)
        .map(|i| sched.submit(Target::new("1", format!("i{i}"))))
        .collect();
    assert_eq!(sched.stats().queued, 300);

    let results = join_all(pending).await;
    assert_eq!(results[0], Err(FetchError::QueueOverflow));
    assert!(results[1..].iter().all(|r| r.is_ok()));
    assert_eq!(upstream.calls_for("1:i0"), 0);
    assert_eq!(upstream.call_count(), 300);
}

#[tokio::test(start_paused = true)]
async fn timed_out_target_is_skipped_for_sixty_seconds() {
    let upstream = FakeJoin::new(
        Duration::ZERO,
        |_, _, nth| {
            if nth == 0 {
                Reply::Hang
            } else {
                Reply::Respond(ok_response("128.116.1.5"))
            }
        },
    );
    let sched = scheduler(upstream.clone());
    let target = Target::new("1", "slow");

    let started = Instant::now();
    let first = sched.submit(target.clone()).await;
    assert_eq!(first, Err(FetchError::Timeout));
    assert!(started.elapsed() >= Duration::from_secs(8));
    assert!(sched.is_temporarily_bad(&target));
    assert!(Enricher::is_temporarily_bad(&sched, &target));

    assert_eq!(
        sched.submit(target.clone()).await,
        Err(FetchError::TemporarilySkipped)
    );
    sleep(Duration::from_millis(59_999)).await;
    assert_eq!(
        sched.submit(target.clone()).await,
        Err(FetchError::TemporarilySkipped)
    );
    assert_eq!(upstream.calls_for("1:slow"), 1);

    sleep(Duration::from_millis(1)).await;
    assert!(sched.submit(target).await.is_ok());
    assert_eq!(upstream.calls_for("1:slow"), 2);
}

#[tokio::test(start_paused = true)]
async fn transport_failure_marks_target_bad_without_retry() {
    let upstream = FakeJoin::new(Duration::ZERO, |_, _, _| Reply::Refuse);
    let sched = scheduler(upstream.clone());
    let target = Target::new("1", "gone");

    let err = sched.submit(target.clone()).await.unwrap_err();
    assert!(matches!(err, FetchError::Transport(_)));
    assert_eq!(err.status(), 504);
    assert_eq!(upstream.call_count(), 1);
    assert!(sched.is_temporarily_bad(&target));
}

#[tokio::test(start_paused = true)]
async fn two_rate_limits_retry_twice_with_jittered_backoff() {
    let upstream = FakeJoin::new(
        Duration::ZERO,
        |_, _, _| Reply::Respond(RawResponse::new(429, "slow down")),
    );
    let sched = scheduler(upstream.clone());

    let result = sched.submit(Target::new("1", "busy")).await;
    assert_eq!(result, Err(FetchError::RateLimited));

    let calls = upstream.calls.lock();
    assert_eq!(calls.len(), 3);
    for pair in calls.windows(2) {
        let gap = pair[1].at - pair[0].at;
        assert!(
            gap >= Duration::from_millis(1_200) && gap < Duration::from_millis(3_000),
            "gap {gap:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn rate_limit_pause_holds_back_other_jobs() {
    let upstream = FakeJoin::new(
        Duration::ZERO,
        |target, _, nth| {
            if target.instance_id == "first" && nth == 0 {
                Reply::Respond(RawResponse::new(429, ""))
            } else {
                Reply::Respond(ok_response("128.116.1.5"))
            }
        },
    );
    let sched = scheduler(upstream.clone());

    let start = Instant::now();
    let a = sched.submit(Target::new("1", "first"));
    // Let the first attempt hit the 429 before anything else is queued.
    sleep(Duration::from_millis(10)).await;
    assert!(sched.stats().blocked_for_ms > 0);
    let b = sched.submit(Target::new("1", "second"));
    let (a, b) = tokio::join!(a, b);
    assert!(a.is_ok() && b.is_ok());

    let calls = upstream.calls.lock();
    let second = calls.iter().find(|c| c.key == "1:second").unwrap();
    assert!(second.at - start >= Duration::from_millis(1_200));
}

#[tokio::test(start_paused = true)]
async fn expired_token_is_refreshed_once() {
    let upstream = FakeJoin::new(
        Duration::ZERO,
        |_, token, _| match token {
            Some("fresh") => Reply::Respond(ok_response("128.116.1.5")),
            _ => Reply::Respond(RawResponse::new(403, "token validation failed").with_csrf_token("fresh")),
        },
    );
    let sched = scheduler(upstream.clone());

    assert!(sched.submit(Target::new("1", "a")).await.is_ok());
    {
        let calls = upstream.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].token, None);
        assert_eq!(calls[1].token.as_deref(), Some("fresh"));
    }

    // The refreshed token is reused by later jobs.
    assert!(sched.submit(Target::new("1", "b")).await.is_ok());
    assert_eq!(upstream.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn repeated_auth_failure_surfaces_upstream_403() {
    let upstream = FakeJoin::new(
        Duration::ZERO,
        |_, _, nth| {
            Reply::Respond(RawResponse::new(403, "denied").with_csrf_token(format!("t{nth}")))
        },
    );
    let sched = scheduler(upstream.clone());

    let err = sched.submit(Target::new("1", "a")).await.unwrap_err();
    assert_eq!(err.status(), 403);
    assert_eq!(upstream.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn malformed_and_upstream_errors_are_surfaced() {
    let upstream = FakeJoin::new(
        Duration::ZERO,
        |target, _, _| match target.instance_id.as_str() {
            "bad" => Reply::Respond(RawResponse::new(200, r#"{"status":12}"#)),
            _ => Reply::Respond(RawResponse::new(500, "boom")),
        },
    );
    let sched = scheduler(upstream.clone());

    let malformed = sched.submit(Target::new("1", "bad")).await.unwrap_err();
    assert_eq!(malformed, FetchError::Malformed);
    assert_eq!(malformed.status(), 502);

    let upstream_err = sched.submit(Target::new("1", "err")).await.unwrap_err();
    assert_eq!(
        upstream_err,
        FetchError::Upstream {
            status: 500,
            body: "boom".into()
        }
    );
    assert!(!sched.is_temporarily_bad(&Target::new("1", "err")));
}

#[tokio::test(start_paused = true)]
async fn missing_override_capability_fails_without_network_call() {
    let upstream = FakeJoin::always_ok(Duration::ZERO);
    let sched = RequestScheduler::new(
        SchedulerConfig::default(),
        upstream.clone(),
        Arc::new(UserAgentRule::new("Agent/1", false)),
    );

    let err = sched.submit(Target::new("1", "a")).await.unwrap_err();
    assert_eq!(err, FetchError::PermissionMissing);
    assert_eq!(err.status(), 403);
    assert_eq!(upstream.call_count(), 0);
    assert_eq!(sched.stats().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn override_removed_only_after_idle_grace() {
    let upstream = FakeJoin::always_ok(Duration::from_millis(50));
    let rule = Arc::new(CountingRule::default());
    let sched = RequestScheduler::new(SchedulerConfig::default(), upstream, rule.clone());

    let batch: Vec<_> = (0..3)
        .map(|i| sched.submit(Target::new("1", format!("i{i}"))))
        .collect();
    join_all(batch).await;
    assert_eq!(rule.installs.load(Ordering::SeqCst), 1);
    assert!(sched.lease().is_installed().await);

    sleep(Duration::from_millis(799)).await;
    assert_eq!(rule.removals.load(Ordering::SeqCst), 0);

    sleep(Duration::from_millis(2)).await;
    assert_eq!(rule.removals.load(Ordering::SeqCst), 1);
    assert!(!sched.lease().is_installed().await);
}

#[tokio::test(start_paused = true)]
async fn new_work_inside_grace_window_keeps_override() {
    let upstream = FakeJoin::always_ok(Duration::from_millis(50));
    let rule = Arc::new(CountingRule::default());
    let sched = RequestScheduler::new(SchedulerConfig::default(), upstream, rule.clone());

    sched.submit(Target::new("1", "a")).await.unwrap();
    sleep(Duration::from_millis(400)).await;
    sched.submit(Target::new("1", "b")).await.unwrap();
    sleep(Duration::from_millis(500)).await;
    assert_eq!(rule.removals.load(Ordering::SeqCst), 0);
    assert_eq!(rule.installs.load(Ordering::SeqCst), 1);

    sleep(Duration::from_millis(400)).await;
    assert_eq!(rule.removals.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn user_agent_rule_is_active_only_during_calls() {
    let rule = Arc::new(UserAgentRule::new("Agent/1", true));
    let upstream = FakeJoin::always_ok(Duration::from_millis(10));
    let sched = RequestScheduler::new(SchedulerConfig::default(), upstream, rule.clone());
    sched.start().await;
    assert_eq!(rule.current(), None);

    sched.submit(Target::new("1", "a")).await.unwrap();
    assert_eq!(rule.current(), Some("Agent/1"));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(rule.current(), None);
}

#[tokio::test(start_paused = true)]
async fn suspend_rejects_queue_and_drops_override() {
    let upstream = FakeJoin::always_ok(Duration::from_millis(100));
    let rule = Arc::new(CountingRule::default());
    let config = SchedulerConfig {
        max_in_flight: 1,
        ..SchedulerConfig::default()
    };
    let sched = RequestScheduler::new(config, upstream, rule.clone());

    let running = sched.submit(Target::new("1", "a"));
    let queued = sched.submit(Target::new("1", "b"));
    tokio::task::yield_now().await;
    sched.suspend().await;

    assert_eq!(queued.await, Err(FetchError::Closed));
    assert!(running.await.is_ok());
    assert!(rule.removals.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(start_paused = true)]
async fn override_removed_after_queue_drains_through_skipped_jobs() {
    let upstream = FakeJoin::new(Duration::from_millis(20), |target, _, _| {
        if target.instance_id == "bad" {
            Reply::Hang
        } else {
            Reply::Respond(ok_response("128.116.1.5"))
        }
    });
    let rule = Arc::new(UserAgentRule::new("Agent/1", true));
    let config = SchedulerConfig {
        max_in_flight: 1,
        ..SchedulerConfig::default()
    };
    let sched = RequestScheduler::new(config, upstream.clone(), rule.clone());
    let bad = Target::new("1", "bad");

    assert_eq!(sched.submit(bad.clone()).await, Err(FetchError::Timeout));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(rule.current(), None);

    // The last job left in the queue is settled by the pump, not by a slot.
    let good = sched.submit(Target::new("1", "good"));
    let skipped = sched.submit(bad);
    assert!(good.await.is_ok());
    assert_eq!(skipped.await, Err(FetchError::TemporarilySkipped));
    assert_eq!(rule.current(), Some("Agent/1"));

    let stats = sched.stats();
    assert_eq!((stats.in_flight, stats.queued), (0, 0));
    assert_eq!(sched.lease().ref_count(), 0);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(rule.current(), None);
    assert_eq!(upstream.calls_for("1:bad"), 1);
}
