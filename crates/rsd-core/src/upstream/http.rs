use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{JoinUpstream, ListingUpstream, RawResponse, TransportError};
use crate::scheduler::HeaderOverride;
use crate::target::Target;

pub const DEFAULT_LISTING_BASE_URL: &str = "https://games.roblox.com";
pub const DEFAULT_JOIN_URL: &str = "https://gamejoin.roblox.com/v1/join-game-instance";
pub const DEFAULT_JOIN_USER_AGENT: &str = "Roblox/WinInet";
const CSRF_HEADER: &str = "x-csrf-token";

/// Connection settings for [`HttpUpstream`].
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub listing_base_url: String,
    pub join_url: String,
    pub page_size: u32,
    pub join_user_agent: String,
    pub header_override: bool,
    pub connect_timeout: Duration,
    /// Whole-request bound, body included.
    pub request_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            listing_base_url: DEFAULT_LISTING_BASE_URL.to_string(),
            join_url: DEFAULT_JOIN_URL.to_string(),
            page_size: 100,
            join_user_agent: DEFAULT_JOIN_USER_AGENT.to_string(),
            header_override: true,
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Rewrites the join request's `User-Agent` while installed.
pub struct UserAgentRule {
    available: bool,
    value: String,
    installed: AtomicBool,
}

impl UserAgentRule {
    pub fn new(value: impl Into<String>, available: bool) -> Self {
        Self {
            available,
            value: value.into(),
            installed: AtomicBool::new(false),
        }
    }

    /// The rewritten value, if the rule is active right now.
    pub fn current(&self) -> Option<&str> {
        self.installed
            .load(Ordering::SeqCst)
            .then_some(self.value.as_str())
    }
}

#[async_trait]
impl HeaderOverride for UserAgentRule {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn install(&self) -> anyhow::Result<()> {
        if !self.available {
            anyhow::bail!("user-agent override is disabled");
        }
        // Remove-then-add; with an in-process rule both collapse to one store.
        self.installed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self) -> anyhow::Result<()> {
        self.installed.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// reqwest-backed implementation of both upstream endpoints.
#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    settings: HttpSettings,
    rule: Arc<UserAgentRule>,
}

impl HttpUpstream {
    pub fn new(settings: HttpSettings) -> anyhow::Result<Self> {
        let client = builder(&settings).build()?;
        let rule = Arc::new(UserAgentRule::new(
            settings.join_user_agent.clone(),
            settings.header_override,
        ));
        Ok(Self {
            client,
            settings,
            rule,
        })
    }

    /// The header override this upstream consults; hand it to the scheduler.
    pub fn rule(&self) -> Arc<UserAgentRule> {
        Arc::clone(&self.rule)
    }

    /// Listing URL with every path segment and query value percent-encoded.
    pub fn listing_url(
        &self,
        collection_id: &str,
        cursor: Option<&str>,
    ) -> Result<reqwest::Url, TransportError> {
        let mut url = reqwest::Url::parse(&self.settings.listing_base_url)
            .map_err(|err| TransportError(format!("invalid listing base url: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| TransportError("listing base url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(["v1", "games", collection_id, "servers", "Public"]);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("excludeFullGames", "true")
                .append_pair("limit", &self.settings.page_size.to_string())
                .append_pair("sortOrder", "Asc");
            if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
                query.append_pair("cursor", cursor);
            }
        }
        Ok(url)
    }
}

fn builder(settings: &HttpSettings) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(format!("rsd/{}", env!("CARGO_PKG_VERSION")))
        .connect_timeout(settings.connect_timeout)
        .timeout(settings.request_timeout)
        .tcp_keepalive(Duration::from_secs(60))
        .pool_idle_timeout(Duration::from_secs(90))
}

/// Numeric collection ids go over the wire as numbers.
fn place_id(collection_id: &str) -> Value {
    match collection_id.parse::<u64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::from(collection_id),
    }
}

async fn into_raw(resp: reqwest::Response) -> Result<RawResponse, TransportError> {
    let status = resp.status().as_u16();
    let csrf_token = resp
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = resp
        .text()
        .await
        .map_err(|err| TransportError(err.to_string()))?;
    Ok(RawResponse {
        status,
        csrf_token,
        body,
    })
}

#[async_trait]
impl JoinUpstream for HttpUpstream {
    async fn request_join(
        &self,
        target: &Target,
        csrf_token: Option<&str>,
    ) -> Result<RawResponse, TransportError> {
        let body = json!({
            "placeId": place_id(&target.collection_id),
            "isTeleport": false,
            "gameId": target.instance_id,
            "gameJoinAttemptId": uuid::Uuid::new_v4().to_string(),
        });
        let mut req = self.client.post(&self.settings.join_url).json(&body);
        if let Some(ua) = self.rule.current() {
            req = req.header(reqwest::header::USER_AGENT, ua);
        }
        if let Some(token) = csrf_token {
            req = req.header(CSRF_HEADER, token);
        }
        let resp = req
            .send()
            .await
            .map_err(|err| TransportError(err.to_string()))?;
        into_raw(resp).await
    }
}

#[async_trait]
impl ListingUpstream for HttpUpstream {
    async fn fetch_page(
        &self,
        collection_id: &str,
        cursor: Option<&str>,
    ) -> Result<RawResponse, TransportError> {
        let resp = self
            .client
            .get(self.listing_url(collection_id, cursor)?)
            .send()
            .await
            .map_err(|err| TransportError(err.to_string()))?;
        into_raw(resp).await
    }
}
