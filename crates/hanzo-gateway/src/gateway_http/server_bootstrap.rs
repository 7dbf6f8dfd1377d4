//! Gateway server bootstrap and router wiring.

use super::*;

/// Binds and serves the gateway until ctrl-c, then drains the usage queue.
pub async fn run_gateway_server(state: Arc<GatewayServerState>) -> Result<()> {
    let bind_addr = state
        .config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid gateway bind address '{}'", state.config.bind))?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind gateway on {bind_addr}"))?;
    serve_gateway(listener, state).await
}

/// Serves an already-bound listener until ctrl-c, then drains usage.
pub async fn serve_gateway(listener: TcpListener, state: Arc<GatewayServerState>) -> Result<()> {
    std::fs::create_dir_all(&state.config.state_dir).with_context(|| {
        format!("failed to create {}", state.config.state_dir.display())
    })?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound gateway address")?;
    info!(
        addr = %local_addr,
        auth_mode = state.config.auth.mode.as_str(),
        state_dir = %state.config.state_dir.display(),
        "gateway listening"
    );

    let app = build_gateway_router(Arc::clone(&state));
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
    .context("gateway server exited unexpectedly")?;

    // Best-effort drain; records that cannot be posted are discarded.
    state.usage_reporter.shutdown().await;
    info!(
        auth_failures = state.auth_failure_count(),
        rate_limited = state.rate_limited_count(),
        "gateway shut down"
    );
    Ok(())
}

pub fn build_gateway_router(state: Arc<GatewayServerState>) -> Router {
    let body_limit = state.config.max_body_bytes.saturating_add(1);
    Router::new()
        .route(
            OPENAI_CHAT_COMPLETIONS_ENDPOINT,
            post(handle_openai_chat_completions).options(handle_cors_preflight),
        )
        .route(OPENAI_MODELS_ENDPOINT, get(handle_openai_models))
        .route(
            AUTH_LOGIN_ENDPOINT,
            get(handle_auth_login).options(handle_cors_preflight),
        )
        .route(
            AUTH_CALLBACK_ENDPOINT,
            get(handle_auth_callback).options(handle_cors_preflight),
        )
        .route(
            AUTH_REFRESH_ENDPOINT,
            post(handle_auth_refresh).options(handle_cors_preflight),
        )
        .route(
            AUTH_LOGOUT_ENDPOINT,
            post(handle_auth_logout).options(handle_cors_preflight),
        )
        .route(
            AUTH_USERINFO_ENDPOINT,
            get(handle_auth_userinfo).options(handle_cors_preflight),
        )
        .route(HEALTHZ_ENDPOINT, get(handle_healthz))
        .route(GATEWAY_WS_ENDPOINT, get(handle_gateway_ws_upgrade))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn handle_healthz(State(state): State<Arc<GatewayServerState>>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "uptime_seconds": state.uptime_seconds(),
        "connections": state.session_count(),
    }))
}
