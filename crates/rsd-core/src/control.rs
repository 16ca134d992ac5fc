//! Inbound calls from renderers: fetch one instance's details, or ask for a refresh.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::discovery::{DiscoveryOrchestrator, RefreshScope};
use crate::error::{FetchError, FetchFailure};
use crate::scheduler::Enricher;
use crate::target::Target;
use crate::upstream::JoinDetails;

static GAME_PAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https://www\.roblox\.com/(?:[a-z]{2}(?:-[a-z]{2})?/)?games/\d+")
        .expect("game page regex")
});

/// Decides whether a caller may use the control surface at all.
pub trait OriginPolicy: Send + Sync {
    fn allows(&self, origin: &str) -> bool;
}

/// Admits game pages, optionally under a locale segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct GamePageOrigin;

impl OriginPolicy for GamePageOrigin {
    fn allows(&self, origin: &str) -> bool {
        GAME_PAGE.is_match(origin)
    }
}

pub struct ControlSurface {
    enricher: Arc<dyn Enricher>,
    orchestrator: Arc<DiscoveryOrchestrator>,
    policy: Arc<dyn OriginPolicy>,
}

impl ControlSurface {
    pub fn new(enricher: Arc<dyn Enricher>, orchestrator: Arc<DiscoveryOrchestrator>) -> Self {
        Self {
            enricher,
            orchestrator,
            policy: Arc::new(GamePageOrigin),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn OriginPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn authorize(&self, origin: &str) -> Result<(), FetchFailure> {
        if self.policy.allows(origin) {
            Ok(())
        } else {
            debug!(origin, "rejected control call");
            Err(FetchFailure::new(403, "sender not allowed"))
        }
    }

    pub async fn fetch_details(
        &self,
        collection_id: &str,
        instance_id: &str,
    ) -> Result<JoinDetails, FetchFailure> {
        let (collection_id, instance_id) = (collection_id.trim(), instance_id.trim());
        if collection_id.is_empty() || instance_id.is_empty() {
            return Err(FetchFailure::new(400, "missing collection or instance id"));
        }
        let target = Target::new(collection_id, instance_id);
        if self.enricher.is_temporarily_bad(&target) {
            return Err(FetchError::TemporarilySkipped.into());
        }
        self.enricher.enrich(target).await.map_err(FetchFailure::from)
    }

    pub fn request_refresh(&self, collection_id: &str, scope: &str) -> Result<(), FetchFailure> {
        let collection_id = collection_id.trim();
        if collection_id.is_empty() {
            return Err(FetchFailure::new(400, "missing collection id"));
        }
        let scope: RefreshScope = scope.parse().map_err(|msg: String| FetchFailure::new(400, msg))?;
        self.orchestrator.request_refresh(collection_id, scope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_pages_are_allowed() {
        let policy = GamePageOrigin;
        assert!(policy.allows("https://www.roblox.com/games/920587237/Adopt-Me"));
        assert!(policy.allows("https://www.roblox.com/de/games/1"));
        assert!(policy.allows("https://www.roblox.com/pt-br/games/1"));
        assert!(!policy.allows("https://www.roblox.com/users/1"));
        assert!(!policy.allows("http://www.roblox.com/games/1"));
        assert!(!policy.allows("https://evil.example/games/1"));
    }
}
