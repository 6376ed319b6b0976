//! HTTP client factory and shared request helpers
//!
//! Every feed and sink builds its client here so timeouts and TLS settings
//! are applied uniformly.

use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::FeedError;

/// HTTP client configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// User agent sent with every request
    pub user_agent: String,
    /// Accept self-signed/invalid certificates (on-prem Splunk installs)
    pub accept_invalid_certs: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            user_agent: format!("ioc-relay/{}", env!("CARGO_PKG_VERSION")),
            accept_invalid_certs: false,
        }
    }
}

impl HttpConfig {
    pub fn insecure(mut self, accept_invalid_certs: bool) -> Self {
        self.accept_invalid_certs = accept_invalid_certs;
        self
    }
}

/// Create an HTTP client
pub fn create_http_client(config: &HttpConfig) -> Result<Client, FeedError> {
    Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(config.user_agent.clone())
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .build()
        .map_err(|e| FeedError::ClientBuild(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// OAuth2 client-credentials grant.
///
/// `request` is a POST to the token endpoint with the vendor's credential
/// placement (basic auth or form fields) already applied.
pub async fn client_credentials_token(request: RequestBuilder) -> Result<String, FeedError> {
    let response = request.send().await?;
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(FeedError::Auth(format!("token endpoint returned {}: {}", status, body)));
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| FeedError::Decode(e.to_string()))?;

    if token.access_token.is_empty() {
        return Err(FeedError::Auth("token endpoint returned an empty token".to_string()));
    }

    debug!("Access token acquired");
    Ok(token.access_token)
}

/// Turn a non-success response into [`FeedError::Status`]
pub async fn expect_success(response: Response) -> Result<Response, FeedError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(FeedError::Auth(format!("HTTP {}: {}", status.as_u16(), body)));
    }
    Err(FeedError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HttpConfig::default();
        assert_eq!(config.timeout_secs, 60);
        assert!(config.user_agent.starts_with("ioc-relay/"));
        assert!(!config.accept_invalid_certs);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: HttpConfig = serde_json::from_str(r#"{"timeout_secs": 5}"#).unwrap();
        assert_eq!(config.timeout_secs, 5);
        assert!(config.user_agent.starts_with("ioc-relay/"));
    }

    #[test]
    fn test_client_builds() {
        assert!(create_http_client(&HttpConfig::default().insecure(true)).is_ok());
    }
}
