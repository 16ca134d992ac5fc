//! Canonical event topic constants shared by the pipeline and its renderers.
//!
//! Favor dot.case names and keep the list grouped by producer.

// Discovery orchestrator
pub const TOPIC_REFRESH_STARTED: &str = "discovery.refresh.started";
pub const TOPIC_INSTANCE_CLASSIFIED: &str = "discovery.instance.classified";
pub const TOPIC_REFRESH_FINISHED: &str = "discovery.refresh.finished";
pub const TOPIC_RATE_LIMITED: &str = "discovery.rate_limited";
