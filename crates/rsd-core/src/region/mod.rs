//! Region classification: address -> /24 subnet -> table record -> region code.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

mod catalog;
mod table;

pub use catalog::{haversine_km, RegionCatalog, RegionInfo, DEFAULT_REGIONS};
pub use table::{LocationRecord, NamedCode, SubnetLocationTable};

/// Country whose subdivisions become separate regions (`US-CA`, `US-VA`, ...).
pub const SUBDIVIDED_COUNTRY: &str = "US";

static SUBDIVISION_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"-\d+$").expect("subdivision regex"));

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Coarse geographic bucket; `??` when nothing could be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionCode(String);

impl RegionCode {
    pub const UNKNOWN: &'static str = "??";

    pub fn new(code: impl AsRef<str>) -> Self {
        Self(normalize_code(code.as_ref()))
    }

    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN || self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RegionCode {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub region_code: RegionCode,
    pub coordinates: Option<Coordinates>,
}

impl Classification {
    pub fn unknown() -> Self {
        Self {
            region_code: RegionCode::unknown(),
            coordinates: None,
        }
    }
}

/// Trim and upper-case a region or country code.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// `"CA-1"` -> `"CA"`.
pub fn normalize_subdivision(code: &str) -> String {
    let code = normalize_code(code);
    SUBDIVISION_SUFFIX.replace(&code, "").into_owned()
}

/// Reduce an IPv4 address to its /24 network, rendered as `a.b.c.0`.
pub fn subnet_of(address: &str) -> Option<String> {
    let addr: Ipv4Addr = address.trim().parse().ok()?;
    let net = Ipv4Net::new(addr, 24).ok()?.trunc();
    Some(net.network().to_string())
}

/// Map a subnet to a region. Never fails; anything unresolvable is `??`.
pub fn classify(subnet: Option<&str>, table: &SubnetLocationTable) -> Classification {
    let Some(record) = subnet.and_then(|s| table.get(s)) else {
        return Classification::unknown();
    };
    let coordinates = record.coordinates();
    let country = record
        .country
        .as_ref()
        .map(|c| normalize_code(&c.code))
        .filter(|c| !c.is_empty());
    let subdivision = record
        .region
        .as_ref()
        .map(|r| normalize_subdivision(&r.code))
        .filter(|r| !r.is_empty());

    let region_code = match (country.as_deref(), subdivision) {
        (Some(SUBDIVIDED_COUNTRY), Some(sub)) => RegionCode(format!("{SUBDIVIDED_COUNTRY}-{sub}")),
        (Some(country), _) => RegionCode(country.to_string()),
        (None, _) => RegionCode::unknown(),
    };
    Classification {
        region_code,
        coordinates,
    }
}
