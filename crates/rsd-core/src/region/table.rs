use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::Coordinates;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedCode {
    pub code: String,
}

/// Location of one /24 subnet. Every field is optional in the bundled data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    #[serde(default)]
    pub country: Option<NamedCode>,
    #[serde(default)]
    pub region: Option<NamedCode>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl LocationRecord {
    pub fn coordinates(&self) -> Option<Coordinates> {
        Some(Coordinates {
            latitude: self.latitude?,
            longitude: self.longitude?,
        })
    }
}

/// Read-only subnet -> location map, keyed by `a.b.c.0`.
#[derive(Debug, Clone, Default)]
pub struct SubnetLocationTable {
    entries: HashMap<String, LocationRecord>,
}

impl SubnetLocationTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        let entries: HashMap<String, LocationRecord> = serde_json::from_str(raw)?;
        Ok(Self { entries })
    }

    /// Load the bundled table. Any failure yields an empty table so every
    /// instance classifies as unknown instead of aborting startup.
    pub fn load(path: &Path) -> Self {
        let parsed = std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|raw| Self::from_json_str(&raw).map_err(|e| e.to_string()));
        match parsed {
            Ok(table) => {
                info!(path = %path.display(), subnets = table.len(), "subnet table loaded");
                table
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "subnet table unavailable; classifying everything as unknown");
                Self::empty()
            }
        }
    }

    pub fn get(&self, subnet: &str) -> Option<&LocationRecord> {
        self.entries.get(subnet)
    }

    pub fn insert(&mut self, subnet: impl Into<String>, record: LocationRecord) {
        self.entries.insert(subnet.into(), record);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_or_broken_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SubnetLocationTable::load(&dir.path().join("absent.json")).is_empty());

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "[not a map").unwrap();
        assert!(SubnetLocationTable::load(&path).is_empty());
    }

    #[test]
    fn load_reads_records() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"1.2.3.0":{{"country":{{"code":"JP"}},"latitude":35.6,"longitude":139.7}}}}"#
        )
        .unwrap();
        let table = SubnetLocationTable::load(file.path());
        assert_eq!(table.len(), 1);
        let rec = table.get("1.2.3.0").unwrap();
        assert_eq!(rec.country.as_ref().unwrap().code, "JP");
        assert!(rec.region.is_none());
        assert_eq!(rec.coordinates().unwrap().longitude, 139.7);
    }
}
