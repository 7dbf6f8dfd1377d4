//! Shared endpoint and policy constant definitions for the gateway.

pub(super) const OPENAI_CHAT_COMPLETIONS_ENDPOINT: &str = "/v1/chat/completions";
pub(super) const OPENAI_MODELS_ENDPOINT: &str = "/v1/models";
pub(super) const AUTH_LOGIN_ENDPOINT: &str = "/auth/login";
pub(super) const AUTH_CALLBACK_ENDPOINT: &str = "/auth/callback";
pub(super) const AUTH_REFRESH_ENDPOINT: &str = "/auth/refresh";
pub(super) const AUTH_LOGOUT_ENDPOINT: &str = "/auth/logout";
pub(super) const AUTH_USERINFO_ENDPOINT: &str = "/auth/userinfo";
pub(super) const HEALTHZ_ENDPOINT: &str = "/healthz";
pub(super) const GATEWAY_WS_ENDPOINT: &str = "/";

pub(super) const DEFAULT_MAX_BODY_BYTES: usize = 1_048_576;
pub(super) const DEFAULT_AGENT_ID: &str = "default";
pub(super) const OPENAI_MODEL_OWNER: &str = "hanzo-gateway";
pub(super) const OPENAI_CHAT_COMPLETION_OBJECT: &str = "chat.completion";
pub(super) const OPENAI_CHAT_COMPLETION_CHUNK_OBJECT: &str = "chat.completion.chunk";

/// Substitute content when a run resolves with no payload text at all.
pub(super) const NO_RESPONSE_FALLBACK_TEXT: &str = "No response from Hanzo Bot.";
/// Streamed to the client when the engine fails mid-run.
pub(super) const STREAM_INTERNAL_ERROR_TEXT: &str = "Error: internal error";

pub(super) const USAGE_PROVIDER_FALLBACK: &str = "hanzo";
