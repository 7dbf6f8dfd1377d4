//! Identity-provider token validation against discovered JWKS.
//!
//! The discovery document and JWKS are cached for the process; a `kid` miss
//! triggers one JWKS refetch before the token is rejected. Signature,
//! issuer, audience, and expiry are verified; everything else in the claim
//! set is projected untouched for policy code.

use std::time::Duration;

use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, errors::ErrorKind, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

const IDENTITY_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
/// Relevant subset of the provider's OpenID discovery document.
pub struct IdentityDiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

/// Fetches `{issuer}/.well-known/openid-configuration`.
pub async fn fetch_identity_discovery(
    http: &reqwest::Client,
    issuer: &str,
) -> Result<IdentityDiscoveryDocument, reqwest::Error> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    http.get(url)
        .timeout(IDENTITY_PROVIDER_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json::<IdentityDiscoveryDocument>()
        .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates token-rejection reasons surfaced to callers.
pub enum IdentityRejectionReason {
    InvalidToken,
    Expired,
    IssuerMismatch,
    AudienceMismatch,
    JwksUnavailable,
    Malformed,
}

impl IdentityRejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidToken => "invalid_token",
            Self::Expired => "expired",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::AudienceMismatch => "audience_mismatch",
            Self::JwksUnavailable => "jwks_unavailable",
            Self::Malformed => "malformed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Claims projected from a validated identity token; immutable afterwards.
pub struct ResolvedIdentity {
    pub user_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub owner: String,
    pub current_org_id: Option<String>,
    pub org_ids: Vec<String>,
    pub roles: Vec<String>,
    pub claims: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct IdentityValidatorConfig {
    pub issuer: String,
    pub audience: String,
}

/// Validates identity-provider JWTs and projects their claims.
#[derive(Debug)]
pub struct IdentityTokenValidator {
    http: reqwest::Client,
    config: IdentityValidatorConfig,
    discovery: Mutex<Option<IdentityDiscoveryDocument>>,
    jwks: Mutex<Option<JwkSet>>,
}

impl IdentityTokenValidator {
    pub fn new(config: IdentityValidatorConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            discovery: Mutex::new(None),
            jwks: Mutex::new(None),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.config.issuer
    }

    /// Verifies signature, issuer, audience, and expiry; returns the
    /// projected identity or the rejection reason.
    pub async fn validate(&self, token: &str) -> Result<ResolvedIdentity, IdentityRejectionReason> {
        let header =
            decode_header(token).map_err(|_| IdentityRejectionReason::Malformed)?;

        let jwks = self
            .cached_jwks()
            .await
            .map_err(|_| IdentityRejectionReason::JwksUnavailable)?;
        let jwk = match select_jwk(&jwks, header.kid.as_deref()) {
            Some(jwk) => jwk.clone(),
            None => {
                // A kid miss may mean the provider rotated keys; refetch once.
                let jwks = self
                    .refresh_jwks()
                    .await
                    .map_err(|_| IdentityRejectionReason::JwksUnavailable)?;
                select_jwk(&jwks, header.kid.as_deref())
                    .cloned()
                    .ok_or(IdentityRejectionReason::InvalidToken)?
            }
        };

        let decoding_key =
            DecodingKey::from_jwk(&jwk).map_err(|_| IdentityRejectionReason::InvalidToken)?;
        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_audience(&[self.config.audience.as_str()]);

        let data = decode::<Value>(token, &decoding_key, &validation).map_err(|error| {
            match error.kind() {
                ErrorKind::ExpiredSignature => IdentityRejectionReason::Expired,
                ErrorKind::InvalidIssuer => IdentityRejectionReason::IssuerMismatch,
                ErrorKind::InvalidAudience => IdentityRejectionReason::AudienceMismatch,
                ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                    IdentityRejectionReason::Malformed
                }
                _ => IdentityRejectionReason::InvalidToken,
            }
        })?;

        let claims = data
            .claims
            .as_object()
            .cloned()
            .ok_or(IdentityRejectionReason::Malformed)?;
        project_identity_claims(claims)
    }

    async fn cached_jwks(&self) -> Result<JwkSet, reqwest::Error> {
        {
            let jwks = self.jwks.lock().await;
            if let Some(cached) = jwks.as_ref() {
                return Ok(cached.clone());
            }
        }
        self.refresh_jwks().await
    }

    async fn refresh_jwks(&self) -> Result<JwkSet, reqwest::Error> {
        let discovery = self.cached_discovery().await?;
        let fetched = self
            .http
            .get(&discovery.jwks_uri)
            .timeout(IDENTITY_PROVIDER_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<JwkSet>()
            .await?;
        let mut jwks = self.jwks.lock().await;
        *jwks = Some(fetched.clone());
        Ok(fetched)
    }

    async fn cached_discovery(&self) -> Result<IdentityDiscoveryDocument, reqwest::Error> {
        let mut discovery = self.discovery.lock().await;
        if let Some(cached) = discovery.as_ref() {
            return Ok(cached.clone());
        }
        let fetched = fetch_identity_discovery(&self.http, &self.config.issuer).await?;
        *discovery = Some(fetched.clone());
        Ok(fetched)
    }
}

fn select_jwk<'a>(jwks: &'a JwkSet, kid: Option<&str>) -> Option<&'a Jwk> {
    match kid {
        Some(kid) => jwks.find(kid),
        None => jwks.keys.first(),
    }
}

/// Projects the raw claim map into the gateway's identity shape. Org ids are
/// the group claims plus the owner, deduplicated in order.
fn project_identity_claims(
    claims: Map<String, Value>,
) -> Result<ResolvedIdentity, IdentityRejectionReason> {
    let user_id = claim_string(&claims, "sub").ok_or(IdentityRejectionReason::Malformed)?;
    let owner = claim_string(&claims, "owner").unwrap_or_else(|| user_id.clone());
    let mut org_ids = claim_string_list(&claims, "groups");
    if !org_ids.iter().any(|org| org == &owner) {
        org_ids.push(owner.clone());
    }

    Ok(ResolvedIdentity {
        email: claim_string(&claims, "email"),
        display_name: claim_string(&claims, "name")
            .or_else(|| claim_string(&claims, "preferred_username")),
        current_org_id: claim_string(&claims, "current_org_id")
            .or_else(|| claim_string(&claims, "currentOrgId")),
        roles: claim_string_list(&claims, "roles"),
        user_id,
        owner,
        org_ids,
        claims,
    })
}

fn claim_string(claims: &Map<String, Value>, key: &str) -> Option<String> {
    claims
        .get(key)?
        .as_str()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn claim_string_list(claims: &Map<String, Value>, key: &str) -> Vec<String> {
    let Some(Value::Array(values)) = claims.get(key) else {
        return Vec::new();
    };
    let mut collected = Vec::new();
    for value in values {
        if let Some(text) = value.as_str().map(str::trim).filter(|text| !text.is_empty()) {
            if !collected.iter().any(|existing: &String| existing == text) {
                collected.push(text.to_string());
            }
        }
    }
    collected
}
