//! Request admission shared by every endpoint: bearer extraction,
//! authorization, body limits, and CORS preflight.

use super::*;
use hanzo_access::MESH_LOGIN_HEADER;

#[derive(Debug, Clone)]
/// An authorized HTTP request with whatever tenant/identity came with it.
pub(super) struct AcceptedHttpRequest {
    pub(super) method: &'static str,
    pub(super) user: Option<String>,
    pub(super) identity: Option<ResolvedIdentity>,
    pub(super) tenant: Option<TenantContext>,
    pub(super) bearer_token: Option<String>,
}

pub(super) fn bearer_token_from_headers(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(header::AUTHORIZATION)?;
    let raw = header.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Assembles the authorizer's view of an HTTP request or WebSocket upgrade.
pub(super) fn connection_auth_request_from_http(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    query_token: Option<&str>,
    tenant_params: ConnectTenantParams,
) -> ConnectionAuthRequest {
    let bearer_token = bearer_token_from_headers(headers).or_else(|| {
        query_token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
    });
    ConnectionAuthRequest {
        bearer_token,
        password: header_string(headers, "x-gateway-password"),
        peer_ip: peer.map(|addr| addr.ip()),
        request_host: header_string(headers, "host"),
        forwarded_for: header_string(headers, "x-forwarded-for"),
        forwarded_host: header_string(headers, "x-forwarded-host"),
        mesh_login: header_string(headers, MESH_LOGIN_HEADER),
        tenant_params,
    }
}

/// Runs the connection authorizer for an HTTP request and maps rejections
/// onto the API error envelope.
pub(super) async fn authorize_http_request(
    state: &GatewayServerState,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Result<AcceptedHttpRequest, GatewayApiError> {
    let request =
        connection_auth_request_from_http(headers, peer, None, ConnectTenantParams::default());
    let bearer_token = request.bearer_token.clone();
    let outcome = authorize_gateway_connection(
        &state.config.auth,
        state.identity_validator.as_deref(),
        &request,
        state.rate_limiter.as_ref(),
    )
    .await;
    match outcome {
        ConnectionAuthOutcome::Accepted {
            method,
            user,
            identity,
            tenant,
        } => Ok(AcceptedHttpRequest {
            method,
            user,
            identity,
            tenant,
            bearer_token,
        }),
        ConnectionAuthOutcome::Rejected { reason } => {
            state.note_auth_failure(&reason);
            Err(GatewayApiError::unauthorized(&reason))
        }
    }
}

/// Enforces the body byte cap, then parses JSON into the request type.
pub(super) fn parse_json_body<T: serde::de::DeserializeOwned>(
    state: &GatewayServerState,
    body: &Bytes,
) -> Result<T, GatewayApiError> {
    if body.len() > state.config.max_body_bytes {
        return Err(GatewayApiError::payload_too_large(
            state.config.max_body_bytes,
        ));
    }
    serde_json::from_slice::<T>(body)
        .map_err(|error| GatewayApiError::invalid_request(format!("invalid JSON body: {error}")))
}

/// Answers `OPTIONS` preflight with 204; allow headers are attached only
/// when the origin policy admits the caller.
pub(super) async fn handle_cors_preflight(
    State(state): State<Arc<GatewayServerState>>,
    headers: HeaderMap,
) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let origin = header_string(&headers, "origin");
    let request_host = header_string(&headers, "host").unwrap_or_default();
    let decision = evaluate_origin_policy(
        &request_host,
        origin.as_deref(),
        &state.config.allowed_origins,
        &state.runtime_origins,
    );
    if decision.is_allowed() {
        if let Some(origin) = origin {
            append_cors_allow_headers(response.headers_mut(), &origin);
        }
    }
    response
}

/// Adds CORS response headers for an already-allowed origin.
pub(super) fn append_cors_allow_headers(headers: &mut HeaderMap, origin: &str) {
    if let Ok(value) = origin.parse() {
        headers.insert("access-control-allow-origin", value);
    }
    if let Ok(value) = "GET, POST, OPTIONS".parse() {
        headers.insert("access-control-allow-methods", value);
    }
    if let Ok(value) = "authorization, content-type".parse() {
        headers.insert("access-control-allow-headers", value);
    }
    if let Ok(value) = "true".parse() {
        headers.insert("access-control-allow-credentials", value);
    }
}

/// Attaches CORS allow headers to a handler response when the request's
/// origin passes policy.
pub(super) fn apply_cors_to_response(
    state: &GatewayServerState,
    request_headers: &HeaderMap,
    response: &mut Response,
) {
    let Some(origin) = header_string(request_headers, "origin") else {
        return;
    };
    let request_host = header_string(request_headers, "host").unwrap_or_default();
    let decision = evaluate_origin_policy(
        &request_host,
        Some(origin.as_str()),
        &state.config.allowed_origins,
        &state.runtime_origins,
    );
    if decision.is_allowed() {
        append_cors_allow_headers(response.headers_mut(), &origin);
    }
}
