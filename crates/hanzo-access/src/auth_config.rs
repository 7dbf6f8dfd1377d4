//! Gateway auth-mode configuration and startup secret resolution.
//!
//! Configured token and password values may be `kms://` references; they are
//! dereferenced exactly once here and only the resolved record is consulted
//! at request time.

use crate::secrets::{is_secret_reference, SecretResolutionError, SecretResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported gateway authentication modes.
pub enum GatewayAuthMode {
    Token,
    Password,
    Identity,
    Mesh,
}

impl GatewayAuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Password => "password",
            Self::Identity => "identity",
            Self::Mesh => "mesh",
        }
    }
}

#[derive(Debug, Clone)]
/// Auth configuration as loaded from flags/env; secret values may still be
/// opaque references.
pub struct GatewayAuthConfig {
    pub mode: GatewayAuthMode,
    pub token: Option<String>,
    pub password: Option<String>,
    pub allow_mesh_identity: bool,
}

#[derive(Debug, Clone)]
/// Auth configuration with every secret dereferenced to cleartext.
pub struct ResolvedGatewayAuth {
    pub mode: GatewayAuthMode,
    pub token: Option<String>,
    pub password: Option<String>,
    pub allow_mesh_identity: bool,
}

/// Dereferences each configured secret exactly once. Reference values with
/// no configured secret backend fail resolution, which aborts startup.
pub async fn resolve_gateway_auth(
    config: &GatewayAuthConfig,
    resolver: Option<&SecretResolver>,
) -> Result<ResolvedGatewayAuth, SecretResolutionError> {
    Ok(ResolvedGatewayAuth {
        mode: config.mode,
        token: resolve_optional_secret(config.token.as_deref(), resolver).await?,
        password: resolve_optional_secret(config.password.as_deref(), resolver).await?,
        allow_mesh_identity: config.allow_mesh_identity,
    })
}

async fn resolve_optional_secret(
    value: Option<&str>,
    resolver: Option<&SecretResolver>,
) -> Result<Option<String>, SecretResolutionError> {
    let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    if !is_secret_reference(value) {
        return Ok(Some(value.to_string()));
    }
    let Some(resolver) = resolver else {
        return Err(SecretResolutionError::BackendUnconfigured(value.to_string()));
    };
    resolver.resolve(value).await.map(Some)
}
