//! OpenAI-compatible gateway server and request flow handlers.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hanzo_access::{
    authorize_gateway_connection, evaluate_origin_policy, AuthRejectionReason,
    ConnectionAuthOutcome, ConnectionAuthRequest, ConnectTenantParams, IdentityProviderClient,
    IdentityTokenValidator, ResolvedGatewayAuth, ResolvedIdentity, RuntimeOriginAllowSet,
    SlidingWindowRateLimiter, TenantContext,
};
use hanzo_billing::{
    check_billing_admission, BillingAdmission, BillingClient, BillingSubject, UsageRecord,
    UsageReporter, UsageTenant,
};
use hanzo_core::{current_unix_timestamp, current_unix_timestamp_ms};
use hanzo_events::{
    AgentEngine, AgentEvent, AgentEventBody, AgentEventBus, AgentRunCompletion, AgentRunRequest,
    AgentRunUsage,
};

mod auth_proxy;
mod chat_completions_handler;
mod endpoints;
mod openai_compat;
mod request_preflight;
mod request_translation;
mod server_bootstrap;
mod server_state;
mod stream_response_handler;
#[cfg(test)]
mod tests;
mod types;
mod websocket;

use auth_proxy::{
    handle_auth_callback, handle_auth_login, handle_auth_logout, handle_auth_refresh,
    handle_auth_userinfo,
};
use chat_completions_handler::{handle_openai_chat_completions, handle_openai_models};
use endpoints::*;
use openai_compat::{
    build_chat_completion_payload, build_content_chunk, build_models_payload, build_role_chunk,
    joined_payload_text,
};
use request_preflight::{
    authorize_http_request, bearer_token_from_headers, connection_auth_request_from_http,
    handle_cors_preflight, parse_json_body,
};
use request_translation::{derive_session_key, resolve_agent_id, translate_chat_messages};
use stream_response_handler::stream_chat_completions;
use types::{ChatCompletionsRequest, GatewayApiError};
use websocket::handle_gateway_ws_upgrade;

pub use server_bootstrap::{build_gateway_router, run_gateway_server, serve_gateway};
pub use server_state::{
    GatewayCollaborators, GatewayServerConfig, GatewayServerState, GatewaySessionInfo,
    RateLimitSettings,
};
