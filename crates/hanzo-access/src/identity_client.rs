//! Identity-provider OAuth client backing the gateway's `/auth/*` proxy.
//!
//! The gateway fronts the provider so the client secret never leaves the
//! server; browsers only ever see the authorize redirect and token bundles.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::identity::{fetch_identity_discovery, IdentityDiscoveryDocument};

const IDENTITY_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_AUTH_SCOPE: &str = "openid profile email";

#[derive(Debug, Error)]
pub enum IdentityClientError {
    #[error("identity provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("identity provider returned status {status} during {operation}")]
    Status { status: u16, operation: &'static str },
}

#[derive(Debug, Clone)]
pub struct IdentityClientConfig {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Default)]
/// Optional parameters forwarded from `/auth/login`.
pub struct AuthorizeUrlParams {
    pub state: Option<String>,
    pub scope: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

/// OAuth client for the configured identity provider.
#[derive(Debug)]
pub struct IdentityProviderClient {
    http: reqwest::Client,
    config: IdentityClientConfig,
    discovery: Mutex<Option<IdentityDiscoveryDocument>>,
}

impl IdentityProviderClient {
    pub fn new(config: IdentityClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            discovery: Mutex::new(None),
        }
    }

    /// Builds the provider authorize URL for a login redirect.
    pub async fn build_authorize_url(
        &self,
        redirect_uri: &str,
        params: &AuthorizeUrlParams,
    ) -> Result<String, IdentityClientError> {
        let discovery = self.cached_discovery().await?;
        let mut pairs = vec![
            ("response_type".to_string(), "code".to_string()),
            ("client_id".to_string(), self.config.client_id.clone()),
            ("redirect_uri".to_string(), redirect_uri.to_string()),
            (
                "scope".to_string(),
                params
                    .scope
                    .clone()
                    .unwrap_or_else(|| DEFAULT_AUTH_SCOPE.to_string()),
            ),
        ];
        if let Some(state) = params.state.as_deref() {
            pairs.push(("state".to_string(), state.to_string()));
        }
        if let Some(code_challenge) = params.code_challenge.as_deref() {
            pairs.push(("code_challenge".to_string(), code_challenge.to_string()));
            pairs.push((
                "code_challenge_method".to_string(),
                params
                    .code_challenge_method
                    .clone()
                    .unwrap_or_else(|| "S256".to_string()),
            ));
        }
        let query = pairs
            .iter()
            .map(|(key, value)| format!("{key}={}", url_encode_component(value)))
            .collect::<Vec<_>>()
            .join("&");
        Ok(format!("{}?{query}", discovery.authorization_endpoint))
    }

    /// Exchanges an authorization code for a token bundle.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<Value, IdentityClientError> {
        let discovery = self.cached_discovery().await?;
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("client_id", self.config.client_id.clone()),
            ("client_secret", self.config.client_secret.clone()),
        ];
        if let Some(code_verifier) = code_verifier {
            form.push(("code_verifier", code_verifier.to_string()));
        }
        self.post_token_form(&discovery.token_endpoint, &form, "code exchange")
            .await
    }

    /// Exchanges a refresh token for a fresh bundle.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Value, IdentityClientError> {
        let discovery = self.cached_discovery().await?;
        let form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", self.config.client_id.clone()),
            ("client_secret", self.config.client_secret.clone()),
        ];
        self.post_token_form(&discovery.token_endpoint, &form, "token refresh")
            .await
    }

    /// Proxies the provider userinfo endpoint with the caller's bearer.
    pub async fn userinfo(&self, bearer: &str) -> Result<Value, IdentityClientError> {
        let discovery = self.cached_discovery().await?;
        let url = discovery
            .userinfo_endpoint
            .clone()
            .unwrap_or_else(|| format!("{}/userinfo", self.config.issuer.trim_end_matches('/')));
        let response = self
            .http
            .get(url)
            .bearer_auth(bearer)
            .timeout(IDENTITY_CLIENT_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(IdentityClientError::Status {
                status: response.status().as_u16(),
                operation: "userinfo",
            });
        }
        Ok(response.json::<Value>().await?)
    }

    async fn post_token_form(
        &self,
        token_endpoint: &str,
        form: &[(&str, String)],
        operation: &'static str,
    ) -> Result<Value, IdentityClientError> {
        let response = self
            .http
            .post(token_endpoint)
            .form(form)
            .timeout(IDENTITY_CLIENT_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(IdentityClientError::Status {
                status: response.status().as_u16(),
                operation,
            });
        }
        Ok(response.json::<Value>().await?)
    }

    async fn cached_discovery(&self) -> Result<IdentityDiscoveryDocument, IdentityClientError> {
        let mut discovery = self.discovery.lock().await;
        if let Some(cached) = discovery.as_ref() {
            return Ok(cached.clone());
        }
        let fetched = fetch_identity_discovery(&self.http, &self.config.issuer).await?;
        *discovery = Some(fetched.clone());
        Ok(fetched)
    }
}

/// Percent-encodes a query component; everything outside the unreserved set
/// is escaped.
fn url_encode_component(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}
