use serde::Serialize;

use super::{Coordinates, RegionCode};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Display metadata for one well-known region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionInfo {
    pub code: &'static str,
    pub coordinates: Coordinates,
    pub city: &'static str,
    pub state: Option<&'static str>,
    pub country: &'static str,
}

const fn region(
    code: &'static str,
    latitude: f64,
    longitude: f64,
    city: &'static str,
    state: Option<&'static str>,
    country: &'static str,
) -> RegionInfo {
    RegionInfo {
        code,
        coordinates: Coordinates {
            latitude,
            longitude,
        },
        city,
        state,
        country,
    }
}

pub const DEFAULT_REGIONS: &[&str] = &[
    "SG", "DE", "FR", "JP", "BR", "NL", "PL", "US-CA", "US-VA", "US-IL", "US-TX", "US-FL",
    "US-NY", "US-WA", "US-GA", "AU", "GB", "IN", "HK",
];

static BUILTIN: &[RegionInfo] = &[
    region("SG", 1.3521, 103.8198, "Singapore", None, "Singapore"),
    region("DE", 50.1109, 8.6821, "Frankfurt", None, "Germany"),
    region("FR", 48.8566, 2.3522, "Paris", None, "France"),
    region("JP", 35.6895, 139.6917, "Tokyo", None, "Japan"),
    region("BR", -14.235, -51.9253, "", None, "Brazil"),
    region("NL", 52.3676, 4.9041, "Amsterdam", None, "Netherlands"),
    region("PL", 52.237049, 21.017532, "Warsaw", None, "Poland"),
    region("HK", 22.396428, 114.109497, "Hong Kong", None, "China"),
    region("US-CA", 34.0522, -118.2437, "LA", Some("California"), "USA"),
    region("US-VA", 38.9577, -77.1445, "Ashburn", Some("Virginia"), "USA"),
    region("US-IL", 41.8781, -87.6298, "Chicago", Some("Illinois"), "USA"),
    region("US-TX", 32.7767, -96.797, "Dallas", Some("Texas"), "USA"),
    region("US-FL", 25.7617, -80.1918, "Miami", Some("Florida"), "USA"),
    region("US-NY", 40.7128, -74.006, "NYC", Some("New York"), "USA"),
    region("US-WA", 47.6062, -122.3321, "Seattle", Some("Washington"), "USA"),
    region("US-GA", 33.749, -84.388, "Atlanta", Some("Georgia"), "USA"),
    region("AU", -33.8688, 151.2093, "Sydney", None, "Australia"),
    region("GB", 51.5074, -0.1278, "London", None, "United Kingdom"),
    region("IN", 19.076, 72.8777, "Mumbai", None, "India"),
];

/// Great-circle distance in kilometres.
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Well-known regions, in their default display order.
#[derive(Debug, Clone)]
pub struct RegionCatalog {
    regions: Vec<RegionInfo>,
}

impl Default for RegionCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RegionCatalog {
    pub fn builtin() -> Self {
        let regions = DEFAULT_REGIONS
            .iter()
            .filter_map(|code| BUILTIN.iter().find(|r| r.code == *code).cloned())
            .collect();
        Self { regions }
    }

    /// Restrict the catalog to `codes`, keeping their order. Unknown codes are skipped.
    pub fn only(codes: &[String]) -> Self {
        let regions = codes
            .iter()
            .filter_map(|code| {
                let code = RegionCode::new(code);
                BUILTIN.iter().find(|r| r.code == code.as_str()).cloned()
            })
            .collect();
        Self { regions }
    }

    pub fn regions(&self) -> &[RegionInfo] {
        &self.regions
    }

    pub fn get(&self, code: &str) -> Option<&RegionInfo> {
        self.regions.iter().find(|r| r.code == code)
    }

    /// Human label such as `"Ashburn, Virginia, USA"` or `"Unknown Region"`.
    pub fn display_name(&self, code: &str) -> String {
        let Some(info) = self.get(code) else {
            if code == RegionCode::UNKNOWN {
                return "Unknown Region".to_string();
            }
            if let Some(state) = code.strip_prefix("US-") {
                return format!("{state}, USA");
            }
            return code.to_string();
        };
        let mut parts: Vec<&str> = Vec::with_capacity(3);
        if !info.city.is_empty() && info.city != info.country {
            parts.push(info.city);
        }
        if let Some(state) = info.state {
            parts.push(state);
        }
        parts.push(info.country);
        parts.dedup();
        parts.join(", ")
    }

    /// Closest catalog region to `location`, with its distance.
    pub fn nearest_region(&self, location: Coordinates) -> Option<(&RegionInfo, f64)> {
        self.regions
            .iter()
            .map(|r| (r, haversine_km(location, r.coordinates)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_follows_default_order() {
        let catalog = RegionCatalog::builtin();
        let codes: Vec<_> = catalog.regions().iter().map(|r| r.code).collect();
        assert_eq!(codes, DEFAULT_REGIONS);
    }

    #[test]
    fn display_names() {
        let catalog = RegionCatalog::builtin();
        assert_eq!(catalog.display_name("US-VA"), "Ashburn, Virginia, USA");
        assert_eq!(catalog.display_name("SG"), "Singapore");
        assert_eq!(catalog.display_name("BR"), "Brazil");
        assert_eq!(catalog.display_name("US-OR"), "OR, USA");
        assert_eq!(catalog.display_name("??"), "Unknown Region");
        assert_eq!(catalog.display_name("ZZ"), "ZZ");
    }

    #[test]
    fn haversine_matches_known_distance() {
        let london = Coordinates {
            latitude: 51.5074,
            longitude: -0.1278,
        };
        let paris = Coordinates {
            latitude: 48.8566,
            longitude: 2.3522,
        };
        let d = haversine_km(london, paris);
        assert!((d - 343.5).abs() < 2.0, "got {d}");
        assert_eq!(haversine_km(london, london), 0.0);
    }

    #[test]
    fn nearest_region_picks_closest() {
        let catalog = RegionCatalog::builtin();
        let berlin = Coordinates {
            latitude: 52.52,
            longitude: 13.405,
        };
        let (info, _) = catalog.nearest_region(berlin).unwrap();
        assert_eq!(info.code, "DE");
        let seattle_ish = Coordinates {
            latitude: 47.0,
            longitude: -122.0,
        };
        assert_eq!(catalog.nearest_region(seattle_ish).unwrap().0.code, "US-WA");
    }

    #[test]
    fn only_keeps_requested_known_codes() {
        let catalog = RegionCatalog::only(&["gb".into(), "ZZ".into(), "US-CA".into()]);
        let codes: Vec<_> = catalog.regions().iter().map(|r| r.code).collect();
        assert_eq!(codes, ["GB", "US-CA"]);
        let origin = Coordinates {
            latitude: 0.0,
            longitude: 0.0,
        };
        assert!(RegionCatalog::only(&[]).nearest_region(origin).is_none());
    }
}
