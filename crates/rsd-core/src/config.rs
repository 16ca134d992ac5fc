use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::discovery::DiscoveryConfig;
use crate::region::RegionCatalog;
use crate::scheduler::SchedulerConfig;
use crate::upstream::http::HttpSettings;
use crate::util::parse_bool_flag;

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct SchedulerSection {
    /// Concurrent join-details requests (default 12).
    #[serde(default)]
    pub max_in_flight: Option<usize>,
    /// Queued requests before the oldest is rejected (default 300).
    #[serde(default)]
    pub max_queue: Option<usize>,
    #[serde(default)]
    pub attempt_timeout_ms: Option<u64>,
    #[serde(default)]
    pub bad_target_ttl_ms: Option<u64>,
    #[serde(default)]
    pub auth_retries: Option<u32>,
    #[serde(default)]
    pub rate_limit_retries: Option<u32>,
    #[serde(default)]
    pub rate_limit_backoff_min_ms: Option<u64>,
    #[serde(default)]
    pub rate_limit_backoff_max_ms: Option<u64>,
    /// Delay before an idle header override is removed (default 800).
    #[serde(default)]
    pub override_grace_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct DiscoverySection {
    /// Enrichment workers per page (default 12).
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub page_retries: Option<u32>,
    #[serde(default)]
    pub page_backoff_ms: Option<u64>,
    #[serde(default)]
    pub page_backoff_factor: Option<u32>,
    /// Bound on one listing page request (default 15000).
    #[serde(default)]
    pub page_timeout_ms: Option<u64>,
    /// Listing page size, 10..=100 upstream.
    #[serde(default)]
    pub page_size: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct UpstreamSection {
    #[serde(default)]
    pub listing_base_url: Option<String>,
    #[serde(default)]
    pub join_url: Option<String>,
    /// User-Agent installed by the header override.
    #[serde(default)]
    pub join_user_agent: Option<String>,
    /// Enables the header override; without it join requests fail with 403.
    #[serde(default)]
    pub compat_join: Option<bool>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Whole-request bound for both endpoints (default 15000).
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct RegionsSection {
    /// JSON file mapping `a.b.c.0` subnets to locations.
    #[serde(default)]
    pub subnet_table: Option<String>,
    /// Region codes to show, in order; defaults to the built-in list.
    #[serde(default)]
    pub catalog: Option<Vec<String>>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub regions: RegionsSection,
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn write_schema_file(path: impl AsRef<Path>) -> std::io::Result<()> {
    let schema_json = config_schema_json();
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    parse_config(&content).with_context(|| format!("invalid config {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    Ok(cfg)
}

impl Config {
    /// Apply `RSD_*` overrides from the process environment.
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let number = |key: &str| lookup(key).and_then(|raw| raw.trim().parse::<u64>().ok());
        if let Some(v) = number("RSD_MAX_IN_FLIGHT") {
            self.scheduler.max_in_flight = Some(v as usize);
        }
        if let Some(v) = number("RSD_MAX_QUEUE") {
            self.scheduler.max_queue = Some(v as usize);
        }
        if let Some(v) = number("RSD_ATTEMPT_TIMEOUT_MS") {
            self.scheduler.attempt_timeout_ms = Some(v);
        }
        if let Some(v) = lookup("RSD_COMPAT_JOIN").and_then(|raw| parse_bool_flag(&raw)) {
            self.upstream.compat_join = Some(v);
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        let d = SchedulerConfig::default();
        let s = &self.scheduler;
        let min = s.rate_limit_backoff_min_ms.unwrap_or(d.rate_limit_backoff_ms.start);
        let max = s
            .rate_limit_backoff_max_ms
            .unwrap_or(d.rate_limit_backoff_ms.end)
            .max(min);
        SchedulerConfig {
            max_in_flight: s.max_in_flight.unwrap_or(d.max_in_flight).max(1),
            max_queue: s.max_queue.unwrap_or(d.max_queue).max(1),
            attempt_timeout: s
                .attempt_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(d.attempt_timeout),
            bad_target_ttl: s
                .bad_target_ttl_ms
                .map(Duration::from_millis)
                .unwrap_or(d.bad_target_ttl),
            auth_retries: s.auth_retries.unwrap_or(d.auth_retries),
            rate_limit_retries: s.rate_limit_retries.unwrap_or(d.rate_limit_retries),
            rate_limit_backoff_ms: min..max,
            override_grace: s
                .override_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(d.override_grace),
        }
    }

    pub fn discovery(&self) -> DiscoveryConfig {
        let d = DiscoveryConfig::default();
        let s = &self.discovery;
        DiscoveryConfig {
            workers: s.workers.unwrap_or(d.workers).max(1),
            page_retries: s.page_retries.unwrap_or(d.page_retries),
            page_backoff: s
                .page_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(d.page_backoff),
            page_backoff_factor: s.page_backoff_factor.unwrap_or(d.page_backoff_factor).max(1),
            page_timeout: s
                .page_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(d.page_timeout),
            ..d
        }
    }

    pub fn http(&self) -> HttpSettings {
        let d = HttpSettings::default();
        let u = &self.upstream;
        HttpSettings {
            listing_base_url: u.listing_base_url.clone().unwrap_or(d.listing_base_url),
            join_url: u.join_url.clone().unwrap_or(d.join_url),
            page_size: self.discovery.page_size.unwrap_or(d.page_size).clamp(10, 100),
            join_user_agent: u.join_user_agent.clone().unwrap_or(d.join_user_agent),
            header_override: u.compat_join.unwrap_or(d.header_override),
            connect_timeout: u
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(d.connect_timeout),
            request_timeout: u
                .request_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(d.request_timeout),
        }
    }

    pub fn catalog(&self) -> RegionCatalog {
        match &self.regions.catalog {
            Some(codes) => RegionCatalog::only(codes),
            None => RegionCatalog::builtin(),
        }
    }

    pub fn subnet_table_path(&self) -> Option<PathBuf> {
        self.regions.subnet_table.as_ref().map(PathBuf::from)
    }
}
