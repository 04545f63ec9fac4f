//! Public exit IP lookup
//!
//! Used for logging only: the result never decides whether a connection
//! attempt succeeded.

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// ipify JSON endpoint
pub const DEFAULT_ENDPOINT: &str = "https://api.ipify.org?format=json";

/// Timeout of a single lookup
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

/// Errors that can occur during a lookup
#[derive(Debug, thiserror::Error)]
pub enum PublicIpError {
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("Lookup request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct IpifyResponse {
    ip: String,
}

/// Asks a "what is my IP" service for the current exit address
#[derive(Debug, Clone)]
pub struct PublicIpLookup {
    client: Client,
    endpoint: String,
}

impl PublicIpLookup {
    /// Create a lookup against `endpoint` (http or https)
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, PublicIpError> {
        let endpoint = endpoint.into();
        let url = Url::parse(&endpoint)
            .map_err(|e| PublicIpError::InvalidUrl(format!("Failed to parse URL: {}", e)))?;

        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(PublicIpError::InvalidUrl(format!(
                    "Only HTTP/HTTPS schemes are supported, got: {}",
                    scheme
                )));
            }
        }

        // Never report a proxy's address
        let client = Client::builder()
            .timeout(timeout)
            .no_proxy()
            .use_rustls_tls()
            .build()
            .map_err(|e| {
                PublicIpError::InvalidUrl(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self { client, endpoint })
    }

    /// Lookup against the default ipify endpoint
    pub fn ipify() -> Result<Self, PublicIpError> {
        Self::new(DEFAULT_ENDPOINT, DEFAULT_TIMEOUT)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Fetch the current public IP
    #[tracing::instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn lookup(&self) -> Result<String, PublicIpError> {
        let body = self
            .client
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let ip = parse_ip(&body);
        debug!(ip = %ip, "Public IP lookup succeeded");
        Ok(ip)
    }
}

/// Extract the address from an ipify JSON body, or fall back to the raw text
pub fn parse_ip(body: &str) -> String {
    serde_json::from_str::<IpifyResponse>(body)
        .map(|response| response.ip)
        .unwrap_or_else(|_| body.trim().to_string())
}
