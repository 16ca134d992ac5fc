use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one live instance inside a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    pub collection_id: String,
    pub instance_id: String,
}

impl Target {
    pub fn new(collection_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Composite cache/queue key: `"{collection}:{instance}"`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.collection_id, self.instance_id)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.collection_id, self.instance_id)
    }
}

/// One running instance as reported by the listing endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub playing: Option<u32>,
    #[serde(default)]
    pub max_players: Option<u32>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub ping: Option<u32>,
    /// Process-local tiebreak id assigned when the page is merged.
    #[serde(default, skip_deserializing)]
    pub uid: u64,
}

impl Instance {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            playing: None,
            max_players: None,
            fps: None,
            ping: None,
            uid: 0,
        }
    }

    pub fn target(&self, collection_id: &str) -> Target {
        Target::new(collection_id, self.id.clone())
    }
}
