//! Upstream seams: the paginated listing endpoint and the per-instance join
//! endpoint. The pipeline only sees [`RawResponse`]s; status handling and
//! retries live in the scheduler and the orchestrator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::FetchError;
use crate::region::Coordinates;
use crate::target::{Instance, Target};

pub mod http;

pub use http::{HttpSettings, HttpUpstream, UserAgentRule};

/// Connection-level failure (refused, reset, aborted). Never carries a status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Status, body and the refreshed anti-forgery token if the server sent one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub csrf_token: Option<String>,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            csrf_token: None,
            body: body.into(),
        }
    }

    pub fn ok_json(body: &Value) -> Self {
        Self::new(200, body.to_string())
    }

    pub fn with_csrf_token(mut self, token: impl Into<String>) -> Self {
        self.csrf_token = Some(token.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait JoinUpstream: Send + Sync {
    /// Issue one join-details request. Timeouts are applied by the caller.
    async fn request_join(
        &self,
        target: &Target,
        csrf_token: Option<&str>,
    ) -> Result<RawResponse, TransportError>;
}

#[async_trait]
pub trait ListingUpstream: Send + Sync {
    async fn fetch_page(
        &self,
        collection_id: &str,
        cursor: Option<&str>,
    ) -> Result<RawResponse, TransportError>;
}

/// One page of the public instance listing.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingPage {
    #[serde(default)]
    pub data: Vec<Instance>,
    #[serde(default)]
    pub next_page_cursor: Option<String>,
}

impl ListingPage {
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        let mut page: ListingPage = serde_json::from_str(body)?;
        if page.next_page_cursor.as_deref().is_some_and(str::is_empty) {
            page.next_page_cursor = None;
        }
        Ok(page)
    }
}

/// Parsed success body of the join endpoint.
///
/// Only `joinScript` is required; the endpoint address and session descriptor
/// are optional and degrade to "unknown" during classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JoinDetails {
    raw: Value,
}

impl JoinDetails {
    pub fn parse(body: &str) -> Result<Self, FetchError> {
        let raw: Value = serde_json::from_str(body).map_err(|_| FetchError::Malformed)?;
        Self::from_value(raw)
    }

    pub fn from_value(raw: Value) -> Result<Self, FetchError> {
        match raw.get("joinScript") {
            Some(Value::Object(_)) => Ok(Self { raw }),
            _ => Err(FetchError::Malformed),
        }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Address of the first relay endpoint, e.g. `128.116.44.10`.
    pub fn address(&self) -> Option<&str> {
        self.raw
            .pointer("/joinScript/UdmuxEndpoints/0/Address")
            .and_then(Value::as_str)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.raw
            .pointer("/joinScript/SessionId")
            .and_then(Value::as_str)
    }

    /// The session descriptor is itself JSON and may carry the caller's location.
    pub fn client_location(&self) -> Option<Coordinates> {
        let session: Value = serde_json::from_str(self.session_id()?).ok()?;
        let latitude = session.get("Latitude")?.as_f64()?;
        let longitude = session.get("Longitude")?.as_f64()?;
        Some(Coordinates {
            latitude,
            longitude,
        })
    }
}
