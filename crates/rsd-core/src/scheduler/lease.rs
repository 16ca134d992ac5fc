use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::FetchError;

/// Narrow outbound-header rewrite required by the join endpoint.
#[async_trait]
pub trait HeaderOverride: Send + Sync {
    /// False when the privileged capability is missing altogether.
    fn is_available(&self) -> bool;
    /// Install the rule, replacing any stale copy.
    async fn install(&self) -> anyhow::Result<()>;
    async fn remove(&self) -> anyhow::Result<()>;
}

/// Lets the lease ask its owner whether work is still pending.
pub trait IdleProbe: Send + Sync {
    fn is_idle(&self) -> bool;
}

#[derive(Default)]
struct LeaseState {
    ref_count: usize,
    generation: u64,
    timer_armed: bool,
}

struct LeaseInner {
    rule: Arc<dyn HeaderOverride>,
    grace: Duration,
    probe: Weak<dyn IdleProbe>,
    state: Mutex<LeaseState>,
    // Serializes install/remove; the flag mirrors what was last confirmed.
    installed: tokio::sync::Mutex<bool>,
}

/// Reference-counted, debounced holder of the header override.
#[derive(Clone)]
pub struct OverrideLease {
    inner: Arc<LeaseInner>,
}

impl OverrideLease {
    pub fn new(rule: Arc<dyn HeaderOverride>, grace: Duration, probe: Weak<dyn IdleProbe>) -> Self {
        Self {
            inner: Arc::new(LeaseInner {
                rule,
                grace,
                probe,
                state: Mutex::new(LeaseState::default()),
                installed: tokio::sync::Mutex::new(false),
            }),
        }
    }

    /// Take a reference, installing the override on the 0 -> 1 transition.
    /// The returned guard releases the reference when dropped.
    pub async fn acquire(&self) -> Result<LeaseGuard, FetchError> {
        if !self.inner.rule.is_available() {
            return Err(FetchError::PermissionMissing);
        }
        {
            let mut st = self.inner.state.lock();
            st.ref_count += 1;
            if st.timer_armed {
                st.timer_armed = false;
                st.generation = st.generation.wrapping_add(1);
                trace!("pending override removal cancelled");
            }
        }
        let guard = LeaseGuard {
            inner: Arc::clone(&self.inner),
        };
        let mut installed = self.inner.installed.lock().await;
        if !*installed {
            match self.inner.rule.install().await {
                Ok(()) => {
                    *installed = true;
                    debug!("header override installed");
                }
                Err(err) => warn!(%err, "failed to install header override"),
            }
        }
        Ok(guard)
    }

    /// Arm the grace timer if nothing holds or needs the override.
    pub fn schedule_uninstall(&self) {
        self.inner.schedule_uninstall();
    }

    /// Remove the override unconditionally and forget every reference.
    /// Used at startup and suspend so the rule never leaks across restarts.
    pub async fn reset(&self) {
        {
            let mut st = self.inner.state.lock();
            st.ref_count = 0;
            st.timer_armed = false;
            st.generation = st.generation.wrapping_add(1);
        }
        let mut installed = self.inner.installed.lock().await;
        if let Err(err) = self.inner.rule.remove().await {
            warn!(%err, "failed to clear header override");
        }
        *installed = false;
    }

    pub fn ref_count(&self) -> usize {
        self.inner.state.lock().ref_count
    }

    pub async fn is_installed(&self) -> bool {
        *self.inner.installed.lock().await
    }
}

impl LeaseInner {
    fn release(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            st.ref_count = st.ref_count.saturating_sub(1);
        }
        self.schedule_uninstall();
    }

    fn probe_idle(&self) -> bool {
        self.probe.upgrade().map_or(true, |p| p.is_idle())
    }

    fn schedule_uninstall(self: &Arc<Self>) {
        let idle = self.probe_idle();
        let generation = {
            let mut st = self.state.lock();
            if st.ref_count > 0 || st.timer_armed || !idle {
                return;
            }
            st.timer_armed = true;
            st.generation
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime available; header override removal not scheduled");
            self.state.lock().timer_armed = false;
            return;
        };
        let inner = Arc::clone(self);
        handle.spawn(async move {
            tokio::time::sleep(inner.grace).await;
            inner.expire(generation).await;
        });
    }

    async fn expire(&self, generation: u64) {
        {
            let mut st = self.state.lock();
            if st.generation != generation {
                return;
            }
            st.timer_armed = false;
            if st.ref_count > 0 {
                return;
            }
        }
        if !self.probe_idle() {
            return;
        }
        let mut installed = self.installed.lock().await;
        // An acquire may have slipped in while we waited for the install lock.
        if self.state.lock().ref_count > 0 || !*installed {
            return;
        }
        if let Err(err) = self.rule.remove().await {
            warn!(%err, "failed to remove header override");
        }
        *installed = false;
        debug!("header override removed");
    }
}

/// Held for the duration of one upstream call.
pub struct LeaseGuard {
    inner: Arc<LeaseInner>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.inner.release();
    }
}
