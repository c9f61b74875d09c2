//! HTTP push transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{
    AUTHORIZATION, CONNECTION, CONTENT_TYPE, HOST, HeaderValue, USER_AGENT,
};
use reqwest::{Client, redirect};
use tracing::debug;
use url::Url;

use super::payload::PushPayload;
use super::retry::AttemptOutcome;
use crate::config::HostInfo;
use crate::registry::DeviceRecord;
use crate::{Error, Result};

/// Product token of this module in the `User-Agent` header.
pub const MODULE_PRODUCT: &str = "znc-palaver";

/// A fully prepared push request for one device.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub endpoint: Url,
    pub bearer: String,
    pub body: Vec<u8>,
}

impl PushRequest {
    /// Prepare the request for `record`. Fails when the device cannot be reached.
    pub fn new(record: &DeviceRecord, payload: &PushPayload) -> Result<Self> {
        let raw = record
            .push_endpoint
            .as_deref()
            .ok_or_else(|| Error::validation(format!("device {} has no push endpoint", record.key)))?;

        let endpoint = Url::parse(raw)
            .map_err(|e| Error::validation(format!("invalid push endpoint {}: {}", raw, e)))?;
        if !matches!(endpoint.scheme(), "http" | "https") || endpoint.host_str().is_none() {
            return Err(Error::validation(format!(
                "unsupported push endpoint {}",
                raw
            )));
        }

        let bearer = record.bearer_token().to_string();
        HeaderValue::from_str(&format!("Bearer {}", bearer))
            .map_err(|_| Error::validation("push token is not a valid header value"))?;

        Ok(Self {
            endpoint,
            bearer,
            body: payload.to_body()?,
        })
    }

    /// Host name sent in the `Host` header (without port).
    pub fn host(&self) -> &str {
        self.endpoint.host_str().unwrap_or_default()
    }
}

/// Sends a single push attempt and classifies the result.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, request: &PushRequest) -> AttemptOutcome;
}

/// `reqwest`-backed transport: one fresh connection per attempt.
pub struct HttpPushTransport {
    client: Client,
    user_agent: String,
}

impl HttpPushTransport {
    pub fn new(host: &HostInfo, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(0)
            .http1_title_case_headers()
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            user_agent: user_agent(host),
        })
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn send(&self, request: &PushRequest) -> AttemptOutcome {
        let result = self
            .client
            .post(request.endpoint.clone())
            .header(HOST, request.host())
            .header(CONNECTION, "close")
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", request.bearer))
            .header(USER_AGENT, self.user_agent.as_str())
            .body(request.body.clone())
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!(host = request.host(), status, "Push endpoint responded");
                AttemptOutcome::from_status(status)
            }
            Err(e) if e.is_builder() => AttemptOutcome::Unroutable(e.to_string()),
            Err(e) => AttemptOutcome::Transient(e.to_string()),
        }
    }
}

/// `<module>/<version> <host>/<version>`.
pub fn user_agent(host: &HostInfo) -> String {
    format!(
        "{}/{} {}/{}",
        MODULE_PRODUCT,
        env!("CARGO_PKG_VERSION"),
        host.product,
        host.version
    )
}
