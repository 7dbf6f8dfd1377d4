//! OpenAI-compatible response and stream-chunk payload builders.

use super::*;

pub(super) fn build_chat_completion_payload(
    run_id: &str,
    created_unix: u64,
    model: &str,
    content: &str,
    usage: &AgentRunUsage,
) -> Value {
    json!({
        "id": run_id,
        "object": OPENAI_CHAT_COMPLETION_OBJECT,
        "created": created_unix,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": content,
            },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": usage.input_tokens,
            "completion_tokens": usage.output_tokens,
            "total_tokens": usage.total_tokens,
        }
    })
}

/// First stream chunk: announces the assistant role.
pub(super) fn build_role_chunk(run_id: &str, created_unix: u64, model: &str) -> Value {
    json!({
        "id": run_id,
        "object": OPENAI_CHAT_COMPLETION_CHUNK_OBJECT,
        "created": created_unix,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": { "role": "assistant" },
            "finish_reason": Value::Null,
        }],
    })
}

/// One content chunk per assistant delta.
pub(super) fn build_content_chunk(
    run_id: &str,
    created_unix: u64,
    model: &str,
    text: &str,
) -> Value {
    json!({
        "id": run_id,
        "object": OPENAI_CHAT_COMPLETION_CHUNK_OBJECT,
        "created": created_unix,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": { "content": text },
            "finish_reason": Value::Null,
        }],
    })
}

pub(super) fn build_models_payload(agent_ids: &[String], created_unix: u64) -> Value {
    let data: Vec<Value> = agent_ids
        .iter()
        .map(|agent_id| {
            json!({
                "id": agent_id,
                "object": "model",
                "created": created_unix,
                "owned_by": OPENAI_MODEL_OWNER,
            })
        })
        .collect();
    json!({ "object": "list", "data": data })
}

/// Joins non-empty payload texts with blank lines; an empty run yields the
/// fallback string.
pub(super) fn joined_payload_text(payload_texts: &[String]) -> String {
    let joined = payload_texts
        .iter()
        .map(|text| text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    if joined.is_empty() {
        NO_RESPONSE_FALLBACK_TEXT.to_string()
    } else {
        joined
    }
}
