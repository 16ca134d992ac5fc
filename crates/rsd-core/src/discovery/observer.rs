use rsd_events::{topics, Bus};
use serde::Serialize;
use serde_json::json;

use super::{RefreshScope, RefreshSummary};
use crate::region::RegionCode;
use crate::target::Instance;

/// Receives incremental discovery progress. Every method defaults to a no-op.
///
/// Callbacks run on the refresh task; keep them short and never block.
pub trait DiscoveryObserver: Send + Sync {
    fn refresh_started(&self, _collection_id: &str, _scope: &RefreshScope) {}
    fn instance_classified(&self, _region: &RegionCode, _instance: &Instance) {}
    fn refresh_finished(&self, _summary: &RefreshSummary) {}
    fn rate_limited_changed(&self, _rate_limited: bool) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl DiscoveryObserver for NoopObserver {}

#[derive(Serialize)]
struct Classified<'a> {
    region: &'a RegionCode,
    instance: &'a Instance,
}

impl DiscoveryObserver for Bus {
    fn refresh_started(&self, collection_id: &str, scope: &RefreshScope) {
        self.publish(
            topics::TOPIC_REFRESH_STARTED,
            &json!({"collection_id": collection_id, "scope": scope.to_string()}),
        );
    }

    fn instance_classified(&self, region: &RegionCode, instance: &Instance) {
        self.publish(
            topics::TOPIC_INSTANCE_CLASSIFIED,
            &Classified { region, instance },
        );
    }

    fn refresh_finished(&self, summary: &RefreshSummary) {
        self.publish(topics::TOPIC_REFRESH_FINISHED, summary);
    }

    fn rate_limited_changed(&self, rate_limited: bool) {
        self.publish(
            topics::TOPIC_RATE_LIMITED,
            &json!({"rate_limited": rate_limited}),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_publishes_observer_callbacks_on_topics() {
        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        let observer: &dyn DiscoveryObserver = &bus;

        observer.refresh_started("42", &RefreshScope::All);
        observer.instance_classified(&RegionCode::new("US-CA"), &Instance::new("a"));
        observer.rate_limited_changed(true);

        let started = rx.recv().await.unwrap();
        assert_eq!(started.kind, topics::TOPIC_REFRESH_STARTED);
        assert_eq!(started.payload["scope"], "all");

        let classified = rx.recv().await.unwrap();
        assert_eq!(classified.kind, topics::TOPIC_INSTANCE_CLASSIFIED);
        assert_eq!(classified.payload["region"], "US-CA");
        assert_eq!(classified.payload["instance"]["id"], "a");

        let limited = rx.recv().await.unwrap();
        assert_eq!(limited.payload["rate_limited"], true);
    }
}
