//! `POST /v1/chat/completions` and `GET /v1/models` handlers.

use super::request_preflight::apply_cors_to_response;
use super::*;

pub(super) async fn handle_openai_chat_completions(
    State(state): State<Arc<GatewayServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut response = match chat_completions_response(&state, peer, &headers, &body).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };
    apply_cors_to_response(&state, &headers, &mut response);
    response
}

async fn chat_completions_response(
    state: &Arc<GatewayServerState>,
    peer: SocketAddr,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, GatewayApiError> {
    let accepted = authorize_http_request(state, headers, Some(peer)).await?;
    let request = parse_json_body::<ChatCompletionsRequest>(state, body)?;
    let chat_prompt = translate_chat_messages(&request.messages)?;
    let agent_id = resolve_agent_id(
        request.model.as_deref(),
        &state.config.agent_ids,
        &state.config.default_agent_id,
    );

    let billing_subject = accepted.tenant.as_ref().map(|tenant| BillingSubject {
        org_id: &tenant.org_id,
        user_id: &tenant.user_id,
    });
    let admission = check_billing_admission(
        state.billing.as_deref(),
        billing_subject,
        accepted.bearer_token.as_deref(),
    )
    .await;
    if let BillingAdmission::Denied { reason, status } = admission {
        return Err(GatewayApiError::billing_denied(reason, status));
    }

    let run_id = state.mint_run_id();
    let user_or_conn = request
        .user
        .clone()
        .or_else(|| accepted.user.clone())
        .unwrap_or_else(|| state.mint_connection_id());
    let run_request = AgentRunRequest {
        run_id: run_id.clone(),
        agent_id: agent_id.clone(),
        session_key: derive_session_key(&agent_id, &user_or_conn),
        prompt: chat_prompt.prompt,
        extra_system_prompt: chat_prompt.extra_system_prompt,
    };
    let response_model = request.model.clone().unwrap_or_else(|| agent_id.clone());

    if !request.extra.is_empty() {
        debug!(
            run_id,
            ignored = ?request.extra.keys().collect::<Vec<_>>(),
            "ignoring unsupported chat-completion fields"
        );
    }

    if request.stream {
        return Ok(stream_chat_completions(
            Arc::clone(state),
            run_request,
            response_model,
            accepted.tenant.clone(),
        ));
    }

    let created_unix = current_unix_timestamp();
    let completion = state
        .engine
        .run_agent(run_request)
        .await
        .map_err(|error| {
            warn!(run_id, "agent engine failed: {error}");
            GatewayApiError::internal()
        })?;

    report_run_usage(
        state,
        accepted.tenant.as_ref(),
        &response_model,
        &completion,
    );

    let content = joined_payload_text(&completion.payload_texts);
    let payload =
        build_chat_completion_payload(&run_id, created_unix, &response_model, &content, &completion.usage);
    Ok(Json(payload).into_response())
}

/// Enqueues a usage record unless the run had zero token activity.
pub(super) fn report_run_usage(
    state: &GatewayServerState,
    tenant: Option<&TenantContext>,
    requested_model: &str,
    completion: &AgentRunCompletion,
) {
    if !completion.usage.has_token_activity() {
        return;
    }
    let usage = &completion.usage;
    state.usage_reporter.report(UsageRecord {
        tenant: tenant.map(|tenant| UsageTenant {
            org_id: tenant.org_id.clone(),
            project_id: tenant.project_id.clone(),
            user_id: tenant.user_id.clone(),
        }),
        model: completion
            .model
            .clone()
            .unwrap_or_else(|| requested_model.to_string()),
        provider: completion
            .provider
            .clone()
            .unwrap_or_else(|| USAGE_PROVIDER_FALLBACK.to_string()),
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_tokens: (usage.cache_read_tokens > 0).then_some(usage.cache_read_tokens),
        cache_write_tokens: (usage.cache_write_tokens > 0).then_some(usage.cache_write_tokens),
        total_tokens: usage.total_tokens,
        duration_ms: completion.duration_ms,
        timestamp: current_unix_timestamp_ms(),
    });
}

pub(super) async fn handle_openai_models(
    State(state): State<Arc<GatewayServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let mut response = match authorize_http_request(&state, &headers, Some(peer)).await {
        Ok(_) => Json(build_models_payload(
            &state.config.agent_ids,
            current_unix_timestamp(),
        ))
        .into_response(),
        Err(error) => error.into_response(),
    };
    apply_cors_to_response(&state, &headers, &mut response);
    response
}
