//! Secret-reference resolution against the secret back end.
//!
//! Values prefixed `kms://` are dereferenced through a machine-identity
//! login whose access token is cached until shortly before expiry; all other
//! values pass through untouched. Resolution failures propagate so startup
//! can abort before the gateway accepts traffic.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;

use hanzo_core::current_unix_timestamp_ms;

pub const KMS_SECRET_PREFIX: &str = "kms://";

const SECRET_BACKEND_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICE_TOKEN_EXPIRY_MARGIN_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum SecretResolutionError {
    #[error("secret backend request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("secret backend returned status {status} during {operation}")]
    Status { status: u16, operation: &'static str },
    #[error("secret '{0}' not found")]
    NotFound(String),
    #[error("secret reference '{0}' requires a configured secret backend")]
    BackendUnconfigured(String),
}

#[derive(Debug, Clone)]
/// Machine-identity credentials and base URL for the secret back end.
pub struct SecretBackendConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
struct CachedServiceToken {
    access_token: String,
    expires_unix_ms: u64,
}

#[derive(Debug, Deserialize)]
struct MachineLoginResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SecretValueResponse {
    value: String,
}

/// Resolves literal or `kms://NAME` secret references.
#[derive(Debug)]
pub struct SecretResolver {
    http: reqwest::Client,
    config: SecretBackendConfig,
    cached_token: Mutex<Option<CachedServiceToken>>,
}

impl SecretResolver {
    pub fn new(config: SecretBackendConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            cached_token: Mutex::new(None),
        }
    }

    /// Returns `value` unchanged unless it is a `kms://` reference, in which
    /// case the named secret is fetched and its cleartext returned.
    pub async fn resolve(&self, value: &str) -> Result<String, SecretResolutionError> {
        let Some(name) = value.strip_prefix(KMS_SECRET_PREFIX) else {
            return Ok(value.to_string());
        };
        let access_token = self.service_access_token().await?;
        let url = format!(
            "{}/v1/secrets/{name}",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .get(url)
            .bearer_auth(&access_token)
            .timeout(SECRET_BACKEND_TIMEOUT)
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Err(SecretResolutionError::NotFound(name.to_string()));
        }
        if !response.status().is_success() {
            return Err(SecretResolutionError::Status {
                status: response.status().as_u16(),
                operation: "secret fetch",
            });
        }
        let payload = response.json::<SecretValueResponse>().await?;
        Ok(payload.value)
    }

    /// Logs in with the machine identity, caching the access token until
    /// expiry minus a safety margin.
    async fn service_access_token(&self) -> Result<String, SecretResolutionError> {
        let mut cached = self.cached_token.lock().await;
        let now_unix_ms = current_unix_timestamp_ms();
        if let Some(token) = cached.as_ref() {
            if token.expires_unix_ms > now_unix_ms.saturating_add(SERVICE_TOKEN_EXPIRY_MARGIN_MS) {
                return Ok(token.access_token.clone());
            }
        }

        let url = format!(
            "{}/v1/auth/machine-login",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(url)
            .json(&json!({
                "client_id": self.config.client_id,
                "client_secret": self.config.client_secret,
            }))
            .timeout(SECRET_BACKEND_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SecretResolutionError::Status {
                status: response.status().as_u16(),
                operation: "machine login",
            });
        }
        let login = response.json::<MachineLoginResponse>().await?;
        let ttl_ms = login.expires_in.unwrap_or(300).saturating_mul(1_000);
        *cached = Some(CachedServiceToken {
            access_token: login.access_token.clone(),
            expires_unix_ms: now_unix_ms.saturating_add(ttl_ms),
        });
        Ok(login.access_token)
    }
}

/// Returns true when `value` needs the secret back end to resolve.
pub fn is_secret_reference(value: &str) -> bool {
    value.starts_with(KMS_SECRET_PREFIX)
}
