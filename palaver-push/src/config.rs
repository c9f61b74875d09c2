//! Runtime configuration.
//!
//! Every section has sensible defaults; [`PushConfig::from_env_or_default`]
//! overlays `PALAVER_*` environment variables on top of them.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::notification::RetryPolicy;
use crate::{Error, Result};

/// Identity of the bouncer hosting the module, reported in the push `User-Agent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub product: String,
    pub version: String,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            product: "znc".to_string(),
            version: "1.8.2".to_string(),
        }
    }
}

/// Line gateway listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind address.
    pub bind_address: String,
    /// Listen port.
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 6698,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Retry behaviour for push deliveries.
    pub retry: RetryPolicy,
    /// Per-attempt HTTP timeout in seconds.
    pub request_timeout_secs: u64,
    /// Directory holding one registry file per account.
    pub data_dir: PathBuf,
    /// Host identity for the `User-Agent` header.
    pub host: HostInfo,
    /// Line gateway settings (binary only).
    pub gateway: GatewayConfig,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout_secs: 30,
            data_dir: PathBuf::from("./moddata/palaver"),
            host: HostInfo::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl PushConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `PALAVER_DATA_DIR`
    /// - `PALAVER_MAX_ATTEMPTS`, `PALAVER_RETRY_DELAY_MS`, `PALAVER_RETRY_JITTER`
    /// - `PALAVER_REQUEST_TIMEOUT_SECS`
    /// - `PALAVER_HOST_PRODUCT`, `PALAVER_HOST_VERSION`
    /// - `PALAVER_BIND_ADDRESS`, `PALAVER_PORT`
    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env_or_default`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = non_empty("PALAVER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_var(&non_empty, "PALAVER_MAX_ATTEMPTS") {
            config.retry.max_attempts = v;
        }
        if let Some(v) = parse_var(&non_empty, "PALAVER_RETRY_DELAY_MS") {
            config.retry.backoff_ms = v;
        }
        if let Some(v) = parse_var(&non_empty, "PALAVER_RETRY_JITTER") {
            config.retry.jitter = v;
        }
        if let Some(v) = parse_var(&non_empty, "PALAVER_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = v;
        }
        if let Some(product) = non_empty("PALAVER_HOST_PRODUCT") {
            config.host.product = product;
        }
        if let Some(version) = non_empty("PALAVER_HOST_VERSION") {
            config.host.version = version;
        }
        if let Some(bind_address) = non_empty("PALAVER_BIND_ADDRESS") {
            config.gateway.bind_address = bind_address;
        }
        if let Some(v) = parse_var(&non_empty, "PALAVER_PORT") {
            config.gateway.port = v;
        }

        config
    }

    /// Reject configurations the dispatcher cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }
        if self.host.product.contains(char::is_whitespace)
            || self.host.version.contains(char::is_whitespace)
        {
            return Err(Error::config("host product and version must not contain spaces"));
        }
        Ok(())
    }

    /// Per-attempt request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}
