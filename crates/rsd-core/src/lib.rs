//! Discovery and enrichment pipeline for a rate-limited instance directory.
//!
//! [`RequestScheduler`] turns many concurrent "details for instance X" calls
//! into a bounded, retried stream of upstream requests;
//! [`DiscoveryOrchestrator`] paginates the listing, classifies every instance
//! into a region and publishes results as they arrive.

pub mod config;
pub mod control;
pub mod discovery;
pub mod error;
pub mod region;
pub mod scheduler;
pub mod target;
pub mod upstream;
pub mod util;

pub use control::{ControlSurface, GamePageOrigin, OriginPolicy};
pub use discovery::{
    DiscoveryConfig, DiscoveryObserver, DiscoveryOrchestrator, NoopObserver, RefreshOutcome,
    RefreshScope, RefreshSummary, SessionSnapshot,
};
pub use error::{FetchError, FetchFailure, PageError};
pub use region::{Classification, Coordinates, RegionCatalog, RegionCode, SubnetLocationTable};
pub use scheduler::{Enricher, HeaderOverride, OverrideLease, RequestScheduler, SchedulerConfig};
pub use target::{Instance, Target};
pub use upstream::{
    HttpUpstream, JoinDetails, JoinUpstream, ListingPage, ListingUpstream, RawResponse,
    TransportError, UserAgentRule,
};
