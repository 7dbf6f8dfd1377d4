//! Per-connection authorization shared by the HTTP and WebSocket surfaces.
//!
//! The decision is a pure function of the resolved auth config, the supplied
//! credentials, and request metadata; the optional rate limiter runs before
//! any credential comparison and is reset by a successful authentication.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;

use crate::auth_config::{GatewayAuthMode, ResolvedGatewayAuth};
use crate::identity::{IdentityRejectionReason, IdentityTokenValidator, ResolvedIdentity};
use crate::origin_policy::hostname_of_authority;
use crate::tenant::{resolve_tenant_context, ConnectTenantParams, TenantContext};
use hanzo_core::current_unix_timestamp_ms;

/// Hosts under this suffix are treated as mesh-resident when the peer is
/// also loopback (the mesh daemon terminates the connection locally).
pub const MESH_HOST_SUFFIX: &str = ".ts.net";
/// Login header stamped by the mesh ingress for authenticated peers.
pub const MESH_LOGIN_HEADER: &str = "x-mesh-user-login";

pub const AUTH_METHOD_TOKEN: &str = "token";
pub const AUTH_METHOD_PASSWORD: &str = "password";
pub const AUTH_METHOD_IDENTITY: &str = "identity";
/// Legacy external name for the mesh method, retained for compatibility.
pub const AUTH_METHOD_MESH: &str = "tailscale";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Rejection reasons surfaced in close frames and HTTP bodies.
pub enum AuthRejectionReason {
    RateLimited,
    TokenMissingConfig,
    TokenMissing,
    TokenMismatch,
    PasswordMissingConfig,
    PasswordMissing,
    PasswordMismatch,
    IdentityMissingConfig,
    IdentityTokenMissing,
    Identity(IdentityRejectionReason),
    TenantOrgNotMember,
    MeshIdentityRequired,
}

impl AuthRejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::TokenMissingConfig => "token_missing_config",
            Self::TokenMissing => "token_missing",
            Self::TokenMismatch => "token_mismatch",
            Self::PasswordMissingConfig => "password_missing_config",
            Self::PasswordMissing => "password_missing",
            Self::PasswordMismatch => "password_mismatch",
            Self::IdentityMissingConfig => "identity_missing_config",
            Self::IdentityTokenMissing => "identity_token_missing",
            Self::Identity(reason) => reason.as_str(),
            Self::TenantOrgNotMember => "tenant_org_not_member",
            Self::MeshIdentityRequired => "mesh_identity_required",
        }
    }
}

#[derive(Debug, Clone, Default)]
/// Credentials and peer metadata extracted from an upgrade or HTTP request.
pub struct ConnectionAuthRequest {
    pub bearer_token: Option<String>,
    pub password: Option<String>,
    pub peer_ip: Option<IpAddr>,
    pub request_host: Option<String>,
    pub forwarded_for: Option<String>,
    pub forwarded_host: Option<String>,
    pub mesh_login: Option<String>,
    pub tenant_params: ConnectTenantParams,
}

impl ConnectionAuthRequest {
    /// Rate-limit bucketing key; per source ip, with one shared bucket for
    /// peers whose address is unknown.
    pub fn rate_limit_key(&self) -> String {
        self.peer_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown-peer".to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Outcome of a connection-authorization decision.
pub enum ConnectionAuthOutcome {
    Accepted {
        method: &'static str,
        user: Option<String>,
        identity: Option<ResolvedIdentity>,
        tenant: Option<TenantContext>,
    },
    Rejected {
        reason: AuthRejectionReason,
    },
}

impl ConnectionAuthOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    fn rejected(reason: AuthRejectionReason) -> Self {
        Self::Rejected { reason }
    }
}

/// Per-key sliding-window rate limiter over attempt timestamps.
#[derive(Debug)]
pub struct SlidingWindowRateLimiter {
    window_ms: u64,
    max_attempts: usize,
    buckets: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(window_ms: u64, max_attempts: usize) -> Self {
        Self {
            window_ms: window_ms.max(1),
            max_attempts: max_attempts.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Records an attempt for `key`; returns false once the window is full.
    pub fn try_acquire(&self, key: &str, now_unix_ms: u64) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(|poison| poison.into_inner());
        let attempts = buckets.entry(key.to_string()).or_default();
        let window_start = now_unix_ms.saturating_sub(self.window_ms);
        while attempts.front().is_some_and(|stamp| *stamp <= window_start) {
            attempts.pop_front();
        }
        if attempts.len() >= self.max_attempts {
            return false;
        }
        attempts.push_back(now_unix_ms);
        true
    }

    /// Clears the window for `key`; called after a successful auth.
    pub fn reset(&self, key: &str) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|poison| poison.into_inner());
        buckets.remove(key);
    }
}

/// Authorizes one connection across all configured modes.
pub async fn authorize_gateway_connection(
    auth: &ResolvedGatewayAuth,
    validator: Option<&IdentityTokenValidator>,
    request: &ConnectionAuthRequest,
    rate_limiter: Option<&SlidingWindowRateLimiter>,
) -> ConnectionAuthOutcome {
    let rate_key = request.rate_limit_key();
    if let Some(limiter) = rate_limiter {
        if !limiter.try_acquire(&rate_key, current_unix_timestamp_ms()) {
            return ConnectionAuthOutcome::rejected(AuthRejectionReason::RateLimited);
        }
    }

    let primary = match auth.mode {
        GatewayAuthMode::Token => authorize_with_shared_token(auth, request),
        GatewayAuthMode::Password => authorize_with_shared_password(auth, request),
        GatewayAuthMode::Identity => {
            authorize_with_identity_token(validator, request).await
        }
        GatewayAuthMode::Mesh => authorize_with_mesh_identity(request),
    };

    let outcome = match primary {
        ConnectionAuthOutcome::Rejected { reason }
            if auth.allow_mesh_identity
                && auth.mode != GatewayAuthMode::Mesh
                && rejection_is_missing_credential(&reason) =>
        {
            match authorize_with_mesh_identity(request) {
                accepted @ ConnectionAuthOutcome::Accepted { .. } => accepted,
                ConnectionAuthOutcome::Rejected { .. } => {
                    ConnectionAuthOutcome::rejected(reason)
                }
            }
        }
        other => other,
    };

    if outcome.is_accepted() {
        if let Some(limiter) = rate_limiter {
            limiter.reset(&rate_key);
        }
    }
    outcome
}

fn rejection_is_missing_credential(reason: &AuthRejectionReason) -> bool {
    matches!(
        reason,
        AuthRejectionReason::TokenMissing
            | AuthRejectionReason::PasswordMissing
            | AuthRejectionReason::IdentityTokenMissing
    )
}

fn authorize_with_shared_token(
    auth: &ResolvedGatewayAuth,
    request: &ConnectionAuthRequest,
) -> ConnectionAuthOutcome {
    let Some(expected) = non_empty(auth.token.as_deref()) else {
        return ConnectionAuthOutcome::rejected(AuthRejectionReason::TokenMissingConfig);
    };
    let Some(supplied) = non_empty(request.bearer_token.as_deref()) else {
        return ConnectionAuthOutcome::rejected(AuthRejectionReason::TokenMissing);
    };
    if supplied != expected {
        return ConnectionAuthOutcome::rejected(AuthRejectionReason::TokenMismatch);
    }
    ConnectionAuthOutcome::Accepted {
        method: AUTH_METHOD_TOKEN,
        user: None,
        identity: None,
        tenant: None,
    }
}

fn authorize_with_shared_password(
    auth: &ResolvedGatewayAuth,
    request: &ConnectionAuthRequest,
) -> ConnectionAuthOutcome {
    let Some(expected) = non_empty(auth.password.as_deref()) else {
        return ConnectionAuthOutcome::rejected(AuthRejectionReason::PasswordMissingConfig);
    };
    let supplied = non_empty(request.password.as_deref())
        .or_else(|| non_empty(request.bearer_token.as_deref()));
    let Some(supplied) = supplied else {
        return ConnectionAuthOutcome::rejected(AuthRejectionReason::PasswordMissing);
    };
    if supplied != expected {
        return ConnectionAuthOutcome::rejected(AuthRejectionReason::PasswordMismatch);
    }
    ConnectionAuthOutcome::Accepted {
        method: AUTH_METHOD_PASSWORD,
        user: None,
        identity: None,
        tenant: None,
    }
}

async fn authorize_with_identity_token(
    validator: Option<&IdentityTokenValidator>,
    request: &ConnectionAuthRequest,
) -> ConnectionAuthOutcome {
    let Some(validator) = validator else {
        return ConnectionAuthOutcome::rejected(AuthRejectionReason::IdentityMissingConfig);
    };
    let Some(bearer) = non_empty(request.bearer_token.as_deref()) else {
        return ConnectionAuthOutcome::rejected(AuthRejectionReason::IdentityTokenMissing);
    };
    let identity = match validator.validate(bearer).await {
        Ok(identity) => identity,
        Err(reason) => {
            return ConnectionAuthOutcome::rejected(AuthRejectionReason::Identity(reason));
        }
    };
    let tenant = match resolve_tenant_context(&identity, &request.tenant_params) {
        Ok(tenant) => tenant,
        Err(_) => {
            return ConnectionAuthOutcome::rejected(AuthRejectionReason::TenantOrgNotMember);
        }
    };
    ConnectionAuthOutcome::Accepted {
        method: AUTH_METHOD_IDENTITY,
        user: Some(identity.user_id.clone()),
        identity: Some(identity),
        tenant,
    }
}

/// Accepts the mesh-supplied login when the peer is mesh-resident: a
/// loopback peer behind a mesh-suffixed host, or a mesh-issued forwarded
/// chain.
fn authorize_with_mesh_identity(request: &ConnectionAuthRequest) -> ConnectionAuthOutcome {
    let Some(login) = non_empty(request.mesh_login.as_deref()) else {
        return ConnectionAuthOutcome::rejected(AuthRejectionReason::MeshIdentityRequired);
    };
    let loopback_peer = request.peer_ip.is_some_and(|ip| ip.is_loopback());
    let mesh_host = host_has_mesh_suffix(request.request_host.as_deref());
    let mesh_forwarded = non_empty(request.forwarded_for.as_deref()).is_some()
        && host_has_mesh_suffix(request.forwarded_host.as_deref());
    if (loopback_peer && mesh_host) || mesh_forwarded {
        return ConnectionAuthOutcome::Accepted {
            method: AUTH_METHOD_MESH,
            user: Some(login.to_string()),
            identity: None,
            tenant: None,
        };
    }
    ConnectionAuthOutcome::rejected(AuthRejectionReason::MeshIdentityRequired)
}

fn host_has_mesh_suffix(host: Option<&str>) -> bool {
    let Some(host) = non_empty(host) else {
        return false;
    };
    hostname_of_authority(&host.to_ascii_lowercase()).ends_with(MESH_HOST_SUFFIX)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
