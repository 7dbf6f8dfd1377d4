//! Gateway HTTP/WS tests grouped by runtime behavior.

use super::*;
use async_trait::async_trait;
use axum::routing::get as axum_get;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hanzo_access::GatewayAuthMode;
use hanzo_billing::{BillingClientConfig, UsageSinkConfig};
use hanzo_events::{AgentEngineError, RunLifecyclePhase};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message as ClientWsMessage};

const TEST_TOKEN: &str = "secret-A";
const HS_SECRET: &[u8] = b"gateway-http-test-secret";

#[derive(Clone, Default)]
struct ScriptedEngine {
    bus: Option<Arc<AgentEventBus>>,
    deltas: Vec<String>,
    payload_texts: Vec<String>,
    usage: AgentRunUsage,
    fail: bool,
    captured_requests: Arc<Mutex<Vec<AgentRunRequest>>>,
}

#[async_trait]
impl AgentEngine for ScriptedEngine {
    async fn run_agent(
        &self,
        request: AgentRunRequest,
    ) -> Result<AgentRunCompletion, AgentEngineError> {
        if let Ok(mut captured) = self.captured_requests.lock() {
            captured.push(request.clone());
        }
        if self.fail {
            return Err(AgentEngineError::Failure("scripted failure".to_string()));
        }
        if let Some(bus) = self.bus.as_ref() {
            bus.publish(AgentEvent::lifecycle(
                request.run_id.clone(),
                RunLifecyclePhase::Start,
            ));
            for delta in &self.deltas {
                bus.publish(AgentEvent::assistant_delta(
                    request.run_id.clone(),
                    delta.clone(),
                ));
            }
            bus.publish(AgentEvent::lifecycle(
                request.run_id.clone(),
                RunLifecyclePhase::End,
            ));
        }
        Ok(AgentRunCompletion {
            payload_texts: self.payload_texts.clone(),
            usage: self.usage,
            duration_ms: Some(42),
            model: None,
            provider: None,
        })
    }
}

fn resolved_token_auth() -> ResolvedGatewayAuth {
    ResolvedGatewayAuth {
        mode: GatewayAuthMode::Token,
        token: Some(TEST_TOKEN.to_string()),
        password: None,
        allow_mesh_identity: false,
    }
}

struct TestGatewayBuilder {
    auth: ResolvedGatewayAuth,
    engine: ScriptedEngine,
    bus: Arc<AgentEventBus>,
    identity_validator: Option<Arc<IdentityTokenValidator>>,
    identity_client: Option<Arc<IdentityProviderClient>>,
    billing: Option<Arc<BillingClient>>,
    usage_reporter: UsageReporter,
    allowed_origins: Vec<String>,
    max_body_bytes: usize,
    rate_limit: Option<RateLimitSettings>,
}

impl TestGatewayBuilder {
    fn new() -> Self {
        let bus = Arc::new(AgentEventBus::new());
        let engine = ScriptedEngine {
            bus: Some(Arc::clone(&bus)),
            payload_texts: vec!["Hello from the agent.".to_string()],
            ..Default::default()
        };
        Self {
            auth: resolved_token_auth(),
            engine,
            bus,
            identity_validator: None,
            identity_client: None,
            billing: None,
            usage_reporter: UsageReporter::disabled(),
            allowed_origins: Vec::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            rate_limit: None,
        }
    }

    fn build_state(self, state_dir: &std::path::Path) -> Arc<GatewayServerState> {
        let mut config =
            GatewayServerConfig::new("127.0.0.1:0", state_dir.to_path_buf(), self.auth);
        config.allowed_origins = self.allowed_origins;
        config.max_body_bytes = self.max_body_bytes;
        config.rate_limit = self.rate_limit;
        config.agent_ids = vec!["default".to_string(), "bot".to_string()];
        Arc::new(GatewayServerState::new(
            config,
            GatewayCollaborators {
                engine: Arc::new(self.engine),
                event_bus: self.bus,
                identity_validator: self.identity_validator,
                identity_client: self.identity_client,
                billing: self.billing,
                usage_reporter: self.usage_reporter,
                runtime_origins: Arc::new(RuntimeOriginAllowSet::new()),
            },
        ))
    }
}

async fn start_gateway(state: Arc<GatewayServerState>) -> (String, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = build_gateway_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
    });
    (format!("http://{addr}"), addr)
}

fn chat_body(message: &str) -> Value {
    json!({
        "model": "bot",
        "messages": [{ "role": "user", "content": message }],
    })
}

async fn post_chat(
    base_url: &str,
    bearer: &str,
    body: &Value,
) -> (reqwest::StatusCode, Value) {
    let response = reqwest::Client::new()
        .post(format!("{base_url}/v1/chat/completions"))
        .bearer_auth(bearer)
        .json(body)
        .send()
        .await
        .expect("send");
    let status = response.status();
    let payload = response.json::<Value>().await.unwrap_or(Value::Null);
    (status, payload)
}

fn sse_data_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(str::to_string)
        .collect()
}

// Mock identity provider serving discovery + an HS256 JWKS.

async fn start_mock_identity_provider() -> String {
    async fn handle_discovery(headers: HeaderMap) -> Json<Value> {
        let host = headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("127.0.0.1");
        let base = format!("http://{host}");
        Json(json!({
            "issuer": base,
            "authorization_endpoint": format!("{base}/authorize"),
            "token_endpoint": format!("{base}/token"),
            "jwks_uri": format!("{base}/jwks"),
            "userinfo_endpoint": format!("{base}/userinfo"),
        }))
    }

    async fn handle_jwks() -> Json<Value> {
        Json(json!({
            "keys": [{
                "kty": "oct",
                "kid": "k1",
                "alg": "HS256",
                "k": URL_SAFE_NO_PAD.encode(HS_SECRET),
            }]
        }))
    }

    async fn handle_token() -> Json<Value> {
        Json(json!({ "access_token": "bundle-token", "token_type": "bearer" }))
    }

    async fn handle_userinfo() -> Json<Value> {
        Json(json!({ "sub": "user-1", "email": "user@acme.example" }))
    }

    let app = Router::new()
        .route(
            "/.well-known/openid-configuration",
            axum_get(handle_discovery),
        )
        .route("/jwks", axum_get(handle_jwks))
        .route("/token", axum::routing::post(handle_token))
        .route("/userinfo", axum_get(handle_userinfo));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn sign_identity_token(issuer: &str, balance_user: &str) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some("k1".to_string());
    let claims = json!({
        "sub": balance_user,
        "iss": issuer,
        "aud": "hanzo-gateway",
        "exp": current_unix_timestamp().saturating_add(3_600),
        "groups": ["acme"],
    });
    encode(&header, &claims, &EncodingKey::from_secret(HS_SECRET)).expect("encode token")
}

async fn start_mock_commerce(balance_cents: i64, subscription_active: bool) -> String {
    let app = Router::new()
        .route(
            "/v1/users/{user_id}/balance",
            axum_get(move || async move { Json(json!({ "balance": balance_cents })) }),
        )
        .route(
            "/v1/orgs/{org_id}/subscription",
            axum_get(move || async move {
                if subscription_active {
                    Json(json!({ "subscription": { "id": "sub-1", "status": "active" } }))
                } else {
                    Json(json!({ "subscription": null }))
                }
            }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn chat_completion_with_the_shared_token_succeeds() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let state = TestGatewayBuilder::new().build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let (status, payload) = post_chat(&base_url, TEST_TOKEN, &chat_body("hi")).await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert!(payload["id"]
        .as_str()
        .is_some_and(|id| id.starts_with("chatcmpl_")));
    assert_eq!(payload["object"].as_str(), Some("chat.completion"));
    let choices = payload["choices"].as_array().expect("choices");
    assert_eq!(choices.len(), 1);
    assert_eq!(choices[0]["message"]["role"].as_str(), Some("assistant"));
    assert_eq!(
        choices[0]["message"]["content"].as_str(),
        Some("Hello from the agent.")
    );
    assert_eq!(choices[0]["finish_reason"].as_str(), Some("stop"));
}

#[tokio::test]
async fn wrong_bearer_token_is_rejected_with_its_reason() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let state = TestGatewayBuilder::new().build_state(tempdir.path());
    let (base_url, _) = start_gateway(Arc::clone(&state)).await;

    let (status, payload) = post_chat(&base_url, "wrong", &chat_body("hi")).await;
    assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);
    assert_eq!(payload["error"]["reason"].as_str(), Some("token_mismatch"));
    assert_eq!(state.auth_failure_count(), 1);
}

#[tokio::test]
async fn wrong_method_is_rejected_with_405() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let state = TestGatewayBuilder::new().build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let response = reqwest::Client::new()
        .get(format!("{base_url}/v1/chat/completions"))
        .bearer_auth(TEST_TOKEN)
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
    assert!(response.headers().contains_key("allow"));
}

#[tokio::test]
async fn oversized_bodies_are_rejected_with_413() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut builder = TestGatewayBuilder::new();
    builder.max_body_bytes = 512;
    let state = builder.build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let (status, _) = post_chat(&base_url, TEST_TOKEN, &chat_body(&"x".repeat(600))).await;
    assert_eq!(status, reqwest::StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn invalid_message_shapes_are_rejected_with_400() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let state = TestGatewayBuilder::new().build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let (status, payload) = post_chat(
        &base_url,
        TEST_TOKEN,
        &json!({ "model": "bot", "messages": "not-an-array" }),
    )
    .await;
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(
        payload["error"]["type"].as_str(),
        Some("invalid_request_error")
    );

    let (status, _) = post_chat(
        &base_url,
        TEST_TOKEN,
        &json!({ "model": "bot", "messages": [{ "role": "user", "content": "" }] }),
    )
    .await;
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn empty_run_payloads_produce_the_fallback_reply() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut builder = TestGatewayBuilder::new();
    builder.engine.payload_texts = Vec::new();
    let state = builder.build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let (status, payload) = post_chat(&base_url, TEST_TOKEN, &chat_body("hi")).await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(
        payload["choices"][0]["message"]["content"].as_str(),
        Some(NO_RESPONSE_FALLBACK_TEXT)
    );
    assert_eq!(payload["choices"][0]["finish_reason"].as_str(), Some("stop"));
}

#[tokio::test]
async fn engine_failures_surface_as_api_errors() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut builder = TestGatewayBuilder::new();
    builder.engine.fail = true;
    let state = builder.build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let (status, payload) = post_chat(&base_url, TEST_TOKEN, &chat_body("hi")).await;
    assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(payload["error"]["type"].as_str(), Some("api_error"));
    assert_eq!(payload["error"]["message"].as_str(), Some("internal error"));
}

#[tokio::test]
async fn streaming_emits_role_then_deltas_then_done() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut builder = TestGatewayBuilder::new();
    builder.engine.deltas = vec!["Hel".to_string(), "lo".to_string()];
    builder.engine.payload_texts = vec!["Hello".to_string()];
    let state = builder.build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let response = reqwest::Client::new()
        .post(format!("{base_url}/v1/chat/completions"))
        .bearer_auth(TEST_TOKEN)
        .json(&json!({
            "model": "bot",
            "stream": true,
            "messages": [{ "role": "user", "content": "hi" }],
        }))
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let raw = response.text().await.expect("body");
    let frames = sse_data_lines(&raw);
    assert!(frames.len() >= 4, "frames: {frames:?}");

    let role_chunk = serde_json::from_str::<Value>(&frames[0]).expect("role chunk");
    assert_eq!(
        role_chunk["choices"][0]["delta"]["role"].as_str(),
        Some("assistant")
    );
    let first = serde_json::from_str::<Value>(&frames[1]).expect("first content");
    assert_eq!(first["choices"][0]["delta"]["content"].as_str(), Some("Hel"));
    let second = serde_json::from_str::<Value>(&frames[2]).expect("second content");
    assert_eq!(second["choices"][0]["delta"]["content"].as_str(), Some("lo"));

    let done_count = frames.iter().filter(|frame| *frame == "[DONE]").count();
    assert_eq!(done_count, 1);
    assert_eq!(frames.last().map(String::as_str), Some("[DONE]"));
}

#[tokio::test]
async fn streaming_without_deltas_synthesizes_the_final_payload() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut builder = TestGatewayBuilder::new();
    builder.engine.deltas = Vec::new();
    builder.engine.payload_texts = vec!["part one".to_string(), "part two".to_string()];
    let state = builder.build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let response = reqwest::Client::new()
        .post(format!("{base_url}/v1/chat/completions"))
        .bearer_auth(TEST_TOKEN)
        .json(&json!({
            "stream": true,
            "messages": [{ "role": "user", "content": "hi" }],
        }))
        .send()
        .await
        .expect("send");
    let raw = response.text().await.expect("body");
    let frames = sse_data_lines(&raw);

    let role_chunk = serde_json::from_str::<Value>(&frames[0]).expect("role chunk");
    assert_eq!(
        role_chunk["choices"][0]["delta"]["role"].as_str(),
        Some("assistant")
    );
    let content = serde_json::from_str::<Value>(&frames[1]).expect("content chunk");
    assert_eq!(
        content["choices"][0]["delta"]["content"].as_str(),
        Some("part one\n\npart two")
    );
    assert_eq!(frames.last().map(String::as_str), Some("[DONE]"));
}

#[tokio::test]
async fn streaming_engine_failure_emits_the_error_chunk_then_done() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut builder = TestGatewayBuilder::new();
    builder.engine.fail = true;
    let state = builder.build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let response = reqwest::Client::new()
        .post(format!("{base_url}/v1/chat/completions"))
        .bearer_auth(TEST_TOKEN)
        .json(&json!({
            "stream": true,
            "messages": [{ "role": "user", "content": "hi" }],
        }))
        .send()
        .await
        .expect("send");
    let raw = response.text().await.expect("body");
    let frames = sse_data_lines(&raw);
    let error_chunk = frames
        .iter()
        .filter_map(|frame| serde_json::from_str::<Value>(frame).ok())
        .find(|chunk| {
            chunk["choices"][0]["delta"]["content"].as_str() == Some(STREAM_INTERNAL_ERROR_TEXT)
        });
    assert!(error_chunk.is_some(), "frames: {frames:?}");
    assert_eq!(frames.last().map(String::as_str), Some("[DONE]"));
}

#[tokio::test]
async fn token_usage_is_reported_once_per_run() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut builder = TestGatewayBuilder::new();
    builder.engine.usage = AgentRunUsage {
        input_tokens: 12,
        output_tokens: 7,
        cache_read_tokens: 0,
        cache_write_tokens: 0,
        total_tokens: 19,
    };
    builder.usage_reporter = UsageReporter::new(Some(UsageSinkConfig {
        base_url: "http://127.0.0.1:9".to_string(),
        service_token: None,
    }))
    .with_flush_interval(Duration::from_secs(3_600));
    let state = builder.build_state(tempdir.path());
    let (base_url, _) = start_gateway(Arc::clone(&state)).await;

    let (status, payload) = post_chat(&base_url, TEST_TOKEN, &chat_body("hi")).await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(payload["usage"]["prompt_tokens"].as_u64(), Some(12));
    assert_eq!(payload["usage"]["completion_tokens"].as_u64(), Some(7));
    assert_eq!(payload["usage"]["total_tokens"].as_u64(), Some(19));
    assert_eq!(state.usage_reporter.queue_len(), 1);
}

#[tokio::test]
async fn zero_token_runs_report_no_usage() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut builder = TestGatewayBuilder::new();
    builder.usage_reporter = UsageReporter::new(Some(UsageSinkConfig {
        base_url: "http://127.0.0.1:9".to_string(),
        service_token: None,
    }))
    .with_flush_interval(Duration::from_secs(3_600));
    let state = builder.build_state(tempdir.path());
    let (base_url, _) = start_gateway(Arc::clone(&state)).await;

    let (status, _) = post_chat(&base_url, TEST_TOKEN, &chat_body("hi")).await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(state.usage_reporter.queue_len(), 0);
}

#[tokio::test]
async fn identity_caller_with_no_funds_is_denied_with_402() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let issuer = start_mock_identity_provider().await;
    let commerce = start_mock_commerce(0, false).await;

    let mut builder = TestGatewayBuilder::new();
    builder.auth = ResolvedGatewayAuth {
        mode: GatewayAuthMode::Identity,
        token: None,
        password: None,
        allow_mesh_identity: false,
    };
    builder.identity_validator = Some(Arc::new(IdentityTokenValidator::new(
        hanzo_access::IdentityValidatorConfig {
            issuer: issuer.clone(),
            audience: "hanzo-gateway".to_string(),
        },
    )));
    builder.billing = Some(Arc::new(BillingClient::new(BillingClientConfig {
        base_url: commerce,
        service_token: Some("svc".to_string()),
        basic_credentials: None,
    })));
    let state = builder.build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let token = sign_identity_token(&issuer, "user-1");
    let (status, payload) = post_chat(&base_url, &token, &chat_body("hi")).await;
    assert_eq!(status, reqwest::StatusCode::PAYMENT_REQUIRED);
    assert_eq!(payload["error"]["type"].as_str(), Some("billing_error"));
    let message = payload["error"]["message"].as_str().expect("message");
    assert!(message.contains("Insufficient funds"), "message: {message}");
    assert!(message.contains("Balance: $0.00"), "message: {message}");
}

#[tokio::test]
async fn identity_caller_with_active_subscription_is_admitted() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let issuer = start_mock_identity_provider().await;
    let commerce = start_mock_commerce(0, true).await;

    let mut builder = TestGatewayBuilder::new();
    builder.auth = ResolvedGatewayAuth {
        mode: GatewayAuthMode::Identity,
        token: None,
        password: None,
        allow_mesh_identity: false,
    };
    builder.identity_validator = Some(Arc::new(IdentityTokenValidator::new(
        hanzo_access::IdentityValidatorConfig {
            issuer: issuer.clone(),
            audience: "hanzo-gateway".to_string(),
        },
    )));
    builder.billing = Some(Arc::new(BillingClient::new(BillingClientConfig {
        base_url: commerce,
        service_token: None,
        basic_credentials: None,
    })));
    let state = builder.build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let token = sign_identity_token(&issuer, "user-1");
    let (status, _) = post_chat(&base_url, &token, &chat_body("hi")).await;
    assert_eq!(status, reqwest::StatusCode::OK);
}

#[tokio::test]
async fn billing_outage_fails_closed_for_identity_callers() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let issuer = start_mock_identity_provider().await;

    let mut builder = TestGatewayBuilder::new();
    builder.auth = ResolvedGatewayAuth {
        mode: GatewayAuthMode::Identity,
        token: None,
        password: None,
        allow_mesh_identity: false,
    };
    builder.identity_validator = Some(Arc::new(IdentityTokenValidator::new(
        hanzo_access::IdentityValidatorConfig {
            issuer: issuer.clone(),
            audience: "hanzo-gateway".to_string(),
        },
    )));
    builder.billing = Some(Arc::new(BillingClient::new(BillingClientConfig {
        base_url: "http://127.0.0.1:9".to_string(),
        service_token: None,
        basic_credentials: None,
    })));
    let state = builder.build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let token = sign_identity_token(&issuer, "user-1");
    let (status, payload) = post_chat(&base_url, &token, &chat_body("hi")).await;
    assert_eq!(status, reqwest::StatusCode::PAYMENT_REQUIRED);
    let message = payload["error"]["message"].as_str().expect("message");
    assert!(message.contains("Billing service unavailable"), "message: {message}");
}

#[tokio::test]
async fn rate_limiting_rejects_repeated_failures_per_source() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut builder = TestGatewayBuilder::new();
    builder.rate_limit = Some(RateLimitSettings {
        window_ms: 60_000,
        max_attempts: 2,
    });
    let state = builder.build_state(tempdir.path());
    let (base_url, _) = start_gateway(Arc::clone(&state)).await;

    for _ in 0..2 {
        let (status, _) = post_chat(&base_url, "wrong", &chat_body("hi")).await;
        assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);
    }
    let (status, payload) = post_chat(&base_url, "wrong", &chat_body("hi")).await;
    assert_eq!(status, reqwest::StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(payload["error"]["reason"].as_str(), Some("rate_limited"));
    assert_eq!(state.rate_limited_count(), 1);
}

#[tokio::test]
async fn models_endpoint_lists_configured_agents() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let state = TestGatewayBuilder::new().build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let response = reqwest::Client::new()
        .get(format!("{base_url}/v1/models"))
        .bearer_auth(TEST_TOKEN)
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let payload = response.json::<Value>().await.expect("payload");
    assert_eq!(payload["object"].as_str(), Some("list"));
    let ids: Vec<&str> = payload["data"]
        .as_array()
        .expect("data")
        .iter()
        .filter_map(|model| model["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["default", "bot"]);
}

#[tokio::test]
async fn healthz_answers_without_authentication() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let state = TestGatewayBuilder::new().build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let response = reqwest::get(format!("{base_url}/healthz"))
        .await
        .expect("send");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let payload = response.json::<Value>().await.expect("payload");
    assert_eq!(payload["ok"].as_bool(), Some(true));
}

#[tokio::test]
async fn cors_preflight_reflects_only_allowed_origins() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut builder = TestGatewayBuilder::new();
    builder.allowed_origins = vec!["https://app.example".to_string()];
    let state = builder.build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let client = reqwest::Client::new();
    let response = client
        .request(
            reqwest::Method::OPTIONS,
            format!("{base_url}/auth/login"),
        )
        .header("origin", "https://app.example")
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|value| value.to_str().ok()),
        Some("https://app.example")
    );

    let response = client
        .request(
            reqwest::Method::OPTIONS,
            format!("{base_url}/auth/login"),
        )
        .header("origin", "https://evil.example")
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
    assert!(response
        .headers()
        .get("access-control-allow-origin")
        .is_none());
}

#[tokio::test]
async fn auth_login_redirects_to_the_identity_provider() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let issuer = start_mock_identity_provider().await;
    let mut builder = TestGatewayBuilder::new();
    builder.identity_client = Some(Arc::new(IdentityProviderClient::new(
        hanzo_access::IdentityClientConfig {
            issuer: issuer.clone(),
            client_id: "gateway-client".to_string(),
            client_secret: "gateway-secret".to_string(),
        },
    )));
    let state = builder.build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client");
    let response = client
        .get(format!(
            "{base_url}/auth/login?redirect_uri=https%3A%2F%2Fapp.example%2Fcb&state=xyz"
        ))
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), reqwest::StatusCode::FOUND);
    let location = response
        .headers()
        .get("location")
        .and_then(|value| value.to_str().ok())
        .expect("location");
    assert!(location.starts_with(&format!("{issuer}/authorize?")));
    assert!(location.contains("state=xyz"));
    assert!(!location.contains("gateway-secret"));
}

#[tokio::test]
async fn auth_refresh_and_userinfo_proxy_the_provider() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let issuer = start_mock_identity_provider().await;
    let mut builder = TestGatewayBuilder::new();
    builder.identity_client = Some(Arc::new(IdentityProviderClient::new(
        hanzo_access::IdentityClientConfig {
            issuer,
            client_id: "gateway-client".to_string(),
            client_secret: "gateway-secret".to_string(),
        },
    )));
    let state = builder.build_state(tempdir.path());
    let (base_url, _) = start_gateway(state).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base_url}/auth/refresh"))
        .json(&json!({ "refresh_token": "refresh-1" }))
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let payload = response.json::<Value>().await.expect("payload");
    assert_eq!(payload["access_token"].as_str(), Some("bundle-token"));

    let response = client
        .get(format!("{base_url}/auth/userinfo"))
        .bearer_auth("caller-token")
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let payload = response.json::<Value>().await.expect("payload");
    assert_eq!(payload["sub"].as_str(), Some("user-1"));

    let response = client
        .post(format!("{base_url}/auth/logout"))
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let payload = response.json::<Value>().await.expect("payload");
    assert_eq!(payload["ok"].as_bool(), Some(true));
}

#[tokio::test]
async fn websocket_connect_frame_registers_a_session() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let state = TestGatewayBuilder::new().build_state(tempdir.path());
    let (_, addr) = start_gateway(Arc::clone(&state)).await;

    let mut request = format!("ws://{addr}/")
        .into_client_request()
        .expect("request");
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {TEST_TOKEN}")).expect("header"),
    );
    let (mut stream, _) = connect_async(request).await.expect("connect");

    let connect_frame = json!({
        "role": "node",
        "caps": ["camera", "canvas"],
        "commands": ["canvas.draw"],
        "userAgent": "hanzo-node-test/1.0",
        "presenceKey": "tablet-1",
    });
    stream
        .send(ClientWsMessage::text(connect_frame.to_string()))
        .await
        .expect("send connect");

    let reply = stream.next().await.expect("reply").expect("frame");
    let ClientWsMessage::Text(text) = reply else {
        panic!("expected text acceptance frame, got {reply:?}");
    };
    let accepted = serde_json::from_str::<Value>(text.as_str()).expect("accept frame");
    assert_eq!(accepted["type"].as_str(), Some("accepted"));
    assert!(accepted["connectionId"]
        .as_str()
        .is_some_and(|id| id.starts_with("conn_")));
    assert_eq!(state.session_count(), 1);

    stream
        .close(None)
        .await
        .expect("close");
    for _ in 0..100 {
        if state.session_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.session_count(), 0);
}

#[tokio::test]
async fn websocket_upgrade_without_credentials_is_rejected() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let state = TestGatewayBuilder::new().build_state(tempdir.path());
    let (_, addr) = start_gateway(state).await;

    let request = format!("ws://{addr}/")
        .into_client_request()
        .expect("request");
    let result = connect_async(request).await;
    assert!(result.is_err(), "handshake must fail without a bearer");
}

#[tokio::test]
async fn invalid_connect_frame_is_closed_with_a_reason() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let state = TestGatewayBuilder::new().build_state(tempdir.path());
    let (_, addr) = start_gateway(Arc::clone(&state)).await;

    let mut request = format!("ws://{addr}/")
        .into_client_request()
        .expect("request");
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {TEST_TOKEN}")).expect("header"),
    );
    let (mut stream, _) = connect_async(request).await.expect("connect");
    stream
        .send(ClientWsMessage::text(r#"{"role":"spectator"}"#))
        .await
        .expect("send");

    let reply = stream.next().await.expect("reply").expect("frame");
    let ClientWsMessage::Text(text) = reply else {
        panic!("expected close frame, got {reply:?}");
    };
    let frame = serde_json::from_str::<Value>(text.as_str()).expect("close frame");
    assert_eq!(frame["type"].as_str(), Some("close"));
    assert_eq!(
        frame["reason"].as_str(),
        Some(crate::gateway_ws_protocol::GATEWAY_WS_CLOSE_REASON_INVALID_CONNECT_FRAME)
    );
    assert_eq!(state.session_count(), 0);
}

#[test]
fn session_keys_are_prefixed_and_sanitized() {
    assert_eq!(derive_session_key("bot", "user-1"), "openai:bot:user-1");
    assert_eq!(
        derive_session_key("bot", "user one@example"),
        "openai:bot:user_one_example"
    );
    assert_eq!(derive_session_key("bot", "  "), "openai:bot:anonymous");
}

#[test]
fn model_strings_route_to_known_agents_or_the_default() {
    let known = vec!["default".to_string(), "bot".to_string()];
    assert_eq!(resolve_agent_id(Some("bot"), &known, "default"), "bot");
    assert_eq!(resolve_agent_id(Some("BOT"), &known, "default"), "bot");
    assert_eq!(
        resolve_agent_id(Some("gpt-4o-mini"), &known, "default"),
        "default"
    );
    assert_eq!(resolve_agent_id(None, &known, "default"), "default");
}

#[test]
fn message_translation_builds_the_composite_prompt() {
    let messages = json!([
        { "role": "system", "content": "Be terse." },
        { "role": "developer", "content": "Prefer bullet lists." },
        { "role": "user", "content": "hello" },
        { "role": "assistant", "content": "hi" },
        { "role": "tool", "name": "camera", "content": "frame captured" },
        { "role": "function", "content": "legacy output" },
    ]);
    let prompt = translate_chat_messages(&messages).expect("translate");
    assert_eq!(
        prompt.extra_system_prompt.as_deref(),
        Some("Be terse.\n\nPrefer bullet lists.")
    );
    assert_eq!(
        prompt.prompt,
        "User:\nhello\n\nAssistant:\nhi\n\nTool:camera:\nframe captured\n\nTool:\nlegacy output"
    );
}

#[test]
fn message_translation_reads_content_part_arrays() {
    let messages = json!([
        { "role": "user", "content": [
            { "type": "text", "text": "first" },
            { "type": "input_text", "text": "second" },
            { "type": "image_url", "image_url": { "url": "ignored" } },
        ]},
    ]);
    let prompt = translate_chat_messages(&messages).expect("translate");
    assert_eq!(prompt.prompt, "User:\nfirst\nsecond");
}

#[test]
fn stream_flag_coercion_accepts_common_spellings() {
    for (raw, expected) in [
        (json!({ "messages": [], "stream": true }), true),
        (json!({ "messages": [], "stream": "true" }), true),
        (json!({ "messages": [], "stream": 1 }), true),
        (json!({ "messages": [], "stream": false }), false),
        (json!({ "messages": [], "stream": "no" }), false),
        (json!({ "messages": [] }), false),
    ] {
        let request: ChatCompletionsRequest =
            serde_json::from_value(raw.clone()).expect("parse request");
        assert_eq!(request.stream, expected, "raw: {raw}");
    }
}
