//! Identity-provider OAuth proxy endpoints (`/auth/*`).
//!
//! The gateway fronts the provider so the client secret stays server-side;
//! browsers interact only with these endpoints.

use super::request_preflight::apply_cors_to_response;
use super::*;
use hanzo_access::{AuthorizeUrlParams, IdentityClientError};

#[derive(Debug, Deserialize)]
pub(super) struct AuthLoginQuery {
    redirect_uri: Option<String>,
    state: Option<String>,
    scope: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct AuthCallbackQuery {
    code: Option<String>,
    redirect_uri: Option<String>,
    code_verifier: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct AuthRefreshBody {
    refresh_token: String,
}

fn identity_client(
    state: &GatewayServerState,
) -> Result<Arc<IdentityProviderClient>, GatewayApiError> {
    state
        .identity_client
        .clone()
        .ok_or_else(|| GatewayApiError::invalid_request("identity provider is not configured"))
}

fn map_identity_client_error(error: IdentityClientError) -> GatewayApiError {
    match error {
        IdentityClientError::Status { status, .. } if status < 500 => {
            GatewayApiError::invalid_request(format!(
                "identity provider rejected the request (status {status})"
            ))
        }
        _ => GatewayApiError::internal(),
    }
}

pub(super) async fn handle_auth_login(
    State(state): State<Arc<GatewayServerState>>,
    headers: HeaderMap,
    Query(query): Query<AuthLoginQuery>,
) -> Response {
    let mut response = match auth_login_redirect(&state, query).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };
    apply_cors_to_response(&state, &headers, &mut response);
    response
}

async fn auth_login_redirect(
    state: &GatewayServerState,
    query: AuthLoginQuery,
) -> Result<Response, GatewayApiError> {
    let client = identity_client(state)?;
    let Some(redirect_uri) = query
        .redirect_uri
        .as_deref()
        .map(str::trim)
        .filter(|uri| !uri.is_empty())
    else {
        return Err(GatewayApiError::invalid_request("redirect_uri is required"));
    };
    let authorize_url = client
        .build_authorize_url(
            redirect_uri,
            &AuthorizeUrlParams {
                state: query.state,
                scope: query.scope,
                code_challenge: query.code_challenge,
                code_challenge_method: query.code_challenge_method,
            },
        )
        .await
        .map_err(map_identity_client_error)?;
    let location = authorize_url
        .parse()
        .map_err(|_| GatewayApiError::internal())?;
    let mut response = StatusCode::FOUND.into_response();
    response.headers_mut().insert(header::LOCATION, location);
    Ok(response)
}

pub(super) async fn handle_auth_callback(
    State(state): State<Arc<GatewayServerState>>,
    headers: HeaderMap,
    Query(query): Query<AuthCallbackQuery>,
) -> Response {
    let mut response = match auth_callback_bundle(&state, query).await {
        Ok(bundle) => Json(bundle).into_response(),
        Err(error) => error.into_response(),
    };
    apply_cors_to_response(&state, &headers, &mut response);
    response
}

async fn auth_callback_bundle(
    state: &GatewayServerState,
    query: AuthCallbackQuery,
) -> Result<Value, GatewayApiError> {
    let client = identity_client(state)?;
    let Some(code) = query
        .code
        .as_deref()
        .map(str::trim)
        .filter(|code| !code.is_empty())
    else {
        return Err(GatewayApiError::invalid_request("code is required"));
    };
    let Some(redirect_uri) = query
        .redirect_uri
        .as_deref()
        .map(str::trim)
        .filter(|uri| !uri.is_empty())
    else {
        return Err(GatewayApiError::invalid_request("redirect_uri is required"));
    };
    client
        .exchange_code(code, redirect_uri, query.code_verifier.as_deref())
        .await
        .map_err(map_identity_client_error)
}

pub(super) async fn handle_auth_refresh(
    State(state): State<Arc<GatewayServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut response = match auth_refresh_bundle(&state, &body).await {
        Ok(bundle) => Json(bundle).into_response(),
        Err(error) => error.into_response(),
    };
    apply_cors_to_response(&state, &headers, &mut response);
    response
}

async fn auth_refresh_bundle(
    state: &GatewayServerState,
    body: &Bytes,
) -> Result<Value, GatewayApiError> {
    let client = identity_client(state)?;
    let request = parse_json_body::<AuthRefreshBody>(state, body)?;
    if request.refresh_token.trim().is_empty() {
        return Err(GatewayApiError::invalid_request("refresh_token is required"));
    }
    client
        .refresh(request.refresh_token.trim())
        .await
        .map_err(map_identity_client_error)
}

pub(super) async fn handle_auth_logout(
    State(state): State<Arc<GatewayServerState>>,
    headers: HeaderMap,
) -> Response {
    let mut response = Json(json!({ "ok": true })).into_response();
    apply_cors_to_response(&state, &headers, &mut response);
    response
}

pub(super) async fn handle_auth_userinfo(
    State(state): State<Arc<GatewayServerState>>,
    headers: HeaderMap,
) -> Response {
    let mut response = match auth_userinfo_payload(&state, &headers).await {
        Ok(info) => Json(info).into_response(),
        Err(error) => error.into_response(),
    };
    apply_cors_to_response(&state, &headers, &mut response);
    response
}

async fn auth_userinfo_payload(
    state: &GatewayServerState,
    headers: &HeaderMap,
) -> Result<Value, GatewayApiError> {
    let client = identity_client(state)?;
    let Some(bearer) = bearer_token_from_headers(headers) else {
        return Err(GatewayApiError::unauthorized(
            &AuthRejectionReason::IdentityTokenMissing,
        ));
    };
    client
        .userinfo(&bearer)
        .await
        .map_err(map_identity_client_error)
}
