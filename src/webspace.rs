//! Control-plane client that boots a webspace and resolves its address
//!
//! A boot is two calls made strictly in sequence:
//! - `POST {url}/internal/id:{user_id}/ensure-started` answers with the raw IP/host
//! - `GET {url}/v1/webspace/id:{user_id}/config` answers with the HTTP port
//!
//! Both calls carry `Authorization: Bearer {iam_token}`.

use crate::error::{BootError, ConfigError};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const ENSURE_STARTED: &str = "ensure-started";
const RUNTIME_CONFIG: &str = "webspace config";

/// The (URL, credential, user id) triple naming which webspace to boot
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    /// Control-plane base URL
    pub url: String,
    /// Bearer token sent with every control-plane call
    pub iam_token: String,
    /// Owner of the webspace
    pub user_id: u64,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("url", &self.url)
            .field("iam_token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl Identity {
    pub fn new(url: impl Into<String>, iam_token: impl Into<String>, user_id: u64) -> Self {
        Self {
            url: url.into(),
            iam_token: iam_token.into(),
            user_id,
        }
    }

    /// Reject identities that could never authenticate against the control plane
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() || self.iam_token.is_empty() || self.user_id == 0 {
            return Err(ConfigError::Invalid(
                "URL, IAM token and user ID cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ensure_started_url(&self) -> String {
        format!("{}/internal/id:{}/ensure-started", self.base_url(), self.user_id)
    }

    pub fn runtime_config_url(&self) -> String {
        format!("{}/v1/webspace/id:{}/config", self.base_url(), self.user_id)
    }

    fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

/// Runtime configuration reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RuntimeConfig {
    /// Seconds the webspace needs after start; informational only
    #[serde(rename = "startupDelay", default)]
    pub startup_delay: f64,
    #[serde(rename = "httpPort")]
    pub http_port: u16,
}

/// Error body returned by the control plane on non-200 responses
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(rename = "Message", alias = "message", default)]
    message: String,
}

/// Issues the ensure-started and runtime-config calls for one identity.
///
/// Cloning is cheap; clones share the underlying connection pool.
#[derive(Clone)]
pub struct LifecycleClient {
    identity: Arc<Identity>,
    client: reqwest::Client,
}

impl LifecycleClient {
    /// Create a client for `identity`. Each control-plane call is bounded by
    /// `request_timeout`; `Duration::ZERO` leaves calls unbounded.
    pub fn new(identity: Identity, request_timeout: Duration) -> Result<Self, ConfigError> {
        identity.validate()?;

        let mut builder = reqwest::Client::builder();
        if !request_timeout.is_zero() {
            builder = builder.timeout(request_timeout);
        }
        let client = builder
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            identity: Arc::new(identity),
            client,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Ask the control plane to start the webspace and return its raw IP/host.
    ///
    /// Safe to repeat: an already running webspace answers the same way.
    pub async fn ensure_started(&self) -> Result<String, BootError> {
        let response = self
            .send(Method::POST, self.identity.ensure_started_url(), ENSURE_STARTED)
            .await?;

        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(ENSURE_STARTED, e))?;

        String::from_utf8(body.to_vec()).map_err(|e| BootError::DecodeFailed {
            call: ENSURE_STARTED,
            reason: e.to_string(),
        })
    }

    /// Fetch the port and startup hint of the webspace
    pub async fn fetch_runtime_config(&self) -> Result<RuntimeConfig, BootError> {
        let response = self
            .send(Method::GET, self.identity.runtime_config_url(), RUNTIME_CONFIG)
            .await?;

        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(RUNTIME_CONFIG, e))?;

        decode_first(&body).map_err(|e| BootError::DecodeFailed {
            call: RUNTIME_CONFIG,
            reason: e.to_string(),
        })
    }

    /// Ensure the webspace is started, then resolve it to `host:port`
    pub async fn boot(&self) -> Result<String, BootError> {
        let host = self.ensure_started().await?;
        let config = self.fetch_runtime_config().await?;

        debug!(
            user_id = self.identity.user_id,
            host,
            http_port = config.http_port,
            startup_delay = config.startup_delay,
            "Webspace runtime config fetched"
        );

        Ok(format!("{}:{}", host, config.http_port))
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        call: &'static str,
    ) -> Result<reqwest::Response, BootError> {
        let request = self
            .client
            .request(method, url)
            .bearer_auth(&self.identity.iam_token)
            .build()
            .map_err(|_| BootError::RequestConstructionFailed(call))?;

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| transport_error(call, e))?;

        if response.status() != StatusCode::OK {
            return Err(rejection(call, response).await);
        }

        Ok(response)
    }
}

/// Turn a non-200 response into `RemoteRejected`, preferring the body's message
async fn rejection(call: &'static str, response: reqwest::Response) -> BootError {
    let status = response.status();
    let message = response
        .bytes()
        .await
        .ok()
        .and_then(|body| decode_first::<Option<ErrorBody>>(&body).ok())
        .map(|body| body.unwrap_or_default().message)
        .unwrap_or_else(|| format!("non-ok status {}", status.as_u16()));

    BootError::RemoteRejected { call, message }
}

/// Decode the first JSON value of a body; anything after it is ignored
fn decode_first<T: DeserializeOwned>(body: &[u8]) -> serde_json::Result<T> {
    serde_json::Deserializer::from_slice(body)
        .into_iter::<T>()
        .next()
        .unwrap_or_else(|| serde_json::from_slice(body))
}

fn transport_error(call: &'static str, err: reqwest::Error) -> BootError {
    if err.is_timeout() {
        BootError::Timeout(call)
    } else {
        BootError::TransportFailed {
            call,
            reason: err.to_string(),
        }
    }
}
