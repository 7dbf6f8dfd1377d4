//! Core gateway request/response/error types used across handlers.

use super::*;
use serde::de::Deserializer;

#[derive(Debug)]
/// Error surfaced over HTTP in the OpenAI error envelope.
pub(super) struct GatewayApiError {
    pub(super) status: StatusCode,
    pub(super) error_type: &'static str,
    pub(super) message: String,
    pub(super) reason: Option<&'static str>,
}

impl GatewayApiError {
    fn new(status: StatusCode, error_type: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error_type,
            message: message.into(),
            reason: None,
        }
    }

    pub(super) fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message)
    }

    pub(super) fn unauthorized(reason: &AuthRejectionReason) -> Self {
        let status = if matches!(reason, AuthRejectionReason::RateLimited) {
            StatusCode::TOO_MANY_REQUESTS
        } else {
            StatusCode::UNAUTHORIZED
        };
        let mut error = Self::new(status, "authentication_error", "unauthorized");
        error.reason = Some(reason.as_str());
        error
    }

    pub(super) fn billing_denied(message: impl Into<String>, status: u16) -> Self {
        Self::new(
            StatusCode::from_u16(status).unwrap_or(StatusCode::PAYMENT_REQUIRED),
            "billing_error",
            message,
        )
    }

    pub(super) fn payload_too_large(limit: usize) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "invalid_request_error",
            format!("request body exceeds {limit} bytes"),
        )
    }

    /// Never echoes caller credentials or engine internals.
    pub(super) fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "api_error",
            "internal error",
        )
    }
}

impl IntoResponse for GatewayApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "type": self.error_type,
            "message": self.message,
        });
        if let Some(reason) = self.reason {
            error["reason"] = Value::String(reason.to_string());
        }
        (self.status, Json(json!({ "error": error }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
/// Body of `POST /v1/chat/completions`.
pub(super) struct ChatCompletionsRequest {
    pub(super) model: Option<String>,
    #[serde(default)]
    pub(super) messages: Value,
    #[serde(default, deserialize_with = "coerce_stream_flag")]
    pub(super) stream: bool,
    #[serde(default)]
    pub(super) user: Option<String>,
    #[serde(flatten)]
    pub(super) extra: BTreeMap<String, Value>,
}

/// Clients send `stream` as a bool, a string, or a number; coerce all of
/// them to a boolean.
fn coerce_stream_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(flag) => flag,
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        ),
        Value::Number(number) => number.as_f64().is_some_and(|value| value != 0.0),
        _ => false,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Composite prompt reshaped from the OpenAI message list.
pub(super) struct ChatPrompt {
    pub(super) prompt: String,
    pub(super) extra_system_prompt: Option<String>,
}
