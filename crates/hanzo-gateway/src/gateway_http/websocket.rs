//! WebSocket upgrade, connect-frame exchange, and session registry.

use super::*;
use crate::gateway_ws_protocol::{
    build_gateway_accept_frame, build_gateway_close_frame, parse_gateway_connect_frame,
    GatewayConnectFrame, GATEWAY_WS_CLOSE_REASON_INVALID_CONNECT_FRAME,
    GATEWAY_WS_CONNECT_FRAME_TIMEOUT_SECONDS, GATEWAY_WS_HEARTBEAT_INTERVAL_SECONDS,
};
use hanzo_access::resolve_tenant_context;

#[derive(Debug, Deserialize)]
pub(super) struct WsUpgradeQuery {
    access_token: Option<String>,
}

pub(super) async fn handle_gateway_ws_upgrade(
    State(state): State<Arc<GatewayServerState>>,
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<WsUpgradeQuery>,
) -> Response {
    // Browser peers carry an Origin header; native nodes and operators do
    // not and skip the origin policy.
    if let Some(origin) = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
    {
        let request_host = headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let decision = evaluate_origin_policy(
            request_host,
            Some(origin),
            &state.config.allowed_origins,
            &state.runtime_origins,
        );
        if let hanzo_access::OriginDecision::Denied { reason } = decision {
            return (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": { "message": reason } })),
            )
                .into_response();
        }
    }

    let auth_request = connection_auth_request_from_http(
        &headers,
        Some(peer),
        query.access_token.as_deref(),
        ConnectTenantParams::default(),
    );
    let outcome = authorize_gateway_connection(
        &state.config.auth,
        state.identity_validator.as_deref(),
        &auth_request,
        state.rate_limiter.as_ref(),
    )
    .await;
    match outcome {
        ConnectionAuthOutcome::Accepted {
            method,
            user,
            identity,
            tenant: _,
        } => ws.on_upgrade(move |socket| {
            run_gateway_ws_connection(state, socket, method, user, identity, peer)
        }),
        ConnectionAuthOutcome::Rejected { reason } => {
            state.note_auth_failure(&reason);
            GatewayApiError::unauthorized(&reason).into_response()
        }
    }
}

async fn run_gateway_ws_connection(
    state: Arc<GatewayServerState>,
    socket: WebSocket,
    method: &'static str,
    user: Option<String>,
    identity: Option<ResolvedIdentity>,
    peer: SocketAddr,
) {
    let (mut sender, mut receiver) = socket.split();

    let connect_deadline = Duration::from_secs(GATEWAY_WS_CONNECT_FRAME_TIMEOUT_SECONDS);
    let first_text = tokio::time::timeout(connect_deadline, async {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                WsMessage::Text(text) => return Some(text.to_string()),
                WsMessage::Close(_) => return None,
                _ => continue,
            }
        }
        None
    })
    .await;

    let Ok(Some(raw_connect)) = first_text else {
        let frame = build_gateway_close_frame(
            GATEWAY_WS_CLOSE_REASON_INVALID_CONNECT_FRAME,
            Some("connect frame not received"),
        );
        let _ = sender.send(WsMessage::Text(frame.to_string().into())).await;
        let _ = sender.close().await;
        return;
    };

    let connect = match parse_gateway_connect_frame(&raw_connect) {
        Ok(connect) => connect,
        Err(detail) => {
            let frame = build_gateway_close_frame(
                GATEWAY_WS_CLOSE_REASON_INVALID_CONNECT_FRAME,
                Some(&detail),
            );
            let _ = sender.send(WsMessage::Text(frame.to_string().into())).await;
            let _ = sender.close().await;
            return;
        }
    };

    // The connect frame may scope the session to an org; membership is
    // enforced against the validated identity.
    let tenant = match identity.as_ref() {
        Some(identity) => {
            let params = ConnectTenantParams {
                org_id: connect.org_id.clone(),
                project_id: connect.project_id.clone(),
                env: connect.env.clone(),
            };
            match resolve_tenant_context(identity, &params) {
                Ok(tenant) => tenant,
                Err(error) => {
                    let frame = build_gateway_close_frame(&error.to_string(), None);
                    let _ = sender.send(WsMessage::Text(frame.to_string().into())).await;
                    let _ = sender.close().await;
                    return;
                }
            }
        }
        None => None,
    };

    let connection_id = state.mint_connection_id();
    register_connect_session(
        &state,
        &connection_id,
        &connect,
        method,
        user,
        tenant.as_ref(),
        peer,
    );
    let accept_frame = build_gateway_accept_frame(&connection_id);
    if sender
        .send(WsMessage::Text(accept_frame.to_string().into()))
        .await
        .is_err()
    {
        state.remove_session(&connection_id);
        return;
    }
    debug!(
        connection_id,
        role = connect.role.as_str(),
        method,
        "gateway session registered"
    );

    let mut heartbeat = tokio::time::interval(Duration::from_secs(
        GATEWAY_WS_HEARTBEAT_INTERVAL_SECONDS.max(1),
    ));
    heartbeat.tick().await;

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                let Some(inbound) = inbound else {
                    break;
                };
                let message = match inbound {
                    Ok(message) => message,
                    Err(_) => break,
                };
                match message {
                    WsMessage::Text(_) | WsMessage::Binary(_) => {
                        // Post-connect frames belong to the agent engine's
                        // capability protocol, which this surface does not
                        // terminate.
                        let frame = json!({
                            "type": "error",
                            "message": "unsupported frame; this endpoint only accepts the connect exchange",
                        });
                        if sender
                            .send(WsMessage::Text(frame.to_string().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    WsMessage::Ping(payload) => {
                        if sender.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Close(_) => break,
                }
            }
            _ = heartbeat.tick() => {
                if sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.remove_session(&connection_id);
    debug!(connection_id, "gateway session closed");
}

fn register_connect_session(
    state: &GatewayServerState,
    connection_id: &str,
    connect: &GatewayConnectFrame,
    method: &'static str,
    user: Option<String>,
    tenant: Option<&TenantContext>,
    peer: SocketAddr,
) {
    state.register_session(GatewaySessionInfo {
        connection_id: connection_id.to_string(),
        role: connect.role.as_str(),
        method,
        user,
        tenant_org: tenant.map(|tenant| tenant.org_id.clone()),
        presence_key: connect.presence_key.clone(),
        client_ip: Some(peer.ip().to_string()),
        scopes: connect.scopes.clone(),
        caps: connect.caps.clone(),
        commands: connect.commands.clone(),
    });
}
