//! Reshapes the OpenAI message list into the composite prompt the agent
//! engine consumes.

use super::types::ChatPrompt;
use super::*;

/// Builds the composite prompt: `system`/`developer` messages become the
/// extra system prompt, everything else becomes tagged conversation entries.
pub(super) fn translate_chat_messages(messages: &Value) -> Result<ChatPrompt, GatewayApiError> {
    let Value::Array(messages) = messages else {
        return Err(GatewayApiError::invalid_request("messages must be an array"));
    };

    let mut system_segments = Vec::new();
    let mut conversation_segments = Vec::new();
    for message in messages {
        let Value::Object(map) = message else {
            continue;
        };
        let role = map
            .get("role")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|role| !role.is_empty())
            .unwrap_or("user")
            .to_ascii_lowercase();
        let text = extract_message_content_text(map.get("content"));
        if text.is_empty() {
            continue;
        }
        match role.as_str() {
            "system" | "developer" => system_segments.push(text),
            other => {
                let label = conversation_label(other, map.get("name").and_then(Value::as_str));
                conversation_segments.push(format!("{label}:\n{text}"));
            }
        }
    }

    let extra_system_prompt = if system_segments.is_empty() {
        None
    } else {
        Some(system_segments.join("\n\n"))
    };
    let prompt = conversation_segments.join("\n\n");
    if prompt.is_empty() && extra_system_prompt.is_none() {
        return Err(GatewayApiError::invalid_request(
            "messages did not include any textual content",
        ));
    }

    Ok(ChatPrompt {
        prompt,
        extra_system_prompt,
    })
}

/// `function` is the legacy spelling of `tool`; tool entries carry the tool
/// name when one is present.
fn conversation_label(role: &str, name: Option<&str>) -> String {
    match role {
        "assistant" => "Assistant".to_string(),
        "tool" | "function" => match name.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => format!("Tool:{name}"),
            None => "Tool".to_string(),
        },
        _ => "User".to_string(),
    }
}

fn extract_message_content_text(content: Option<&Value>) -> String {
    let Some(content) = content else {
        return String::new();
    };
    match content {
        Value::String(text) => text.trim().to_string(),
        Value::Array(parts) => {
            let mut segments = Vec::new();
            for part in parts {
                if let Some(text) = extract_message_content_part(part) {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        segments.push(trimmed.to_string());
                    }
                }
            }
            segments.join("\n")
        }
        Value::Object(_) => extract_message_content_part(content).unwrap_or_default(),
        _ => String::new(),
    }
}

fn extract_message_content_part(part: &Value) -> Option<String> {
    match part {
        Value::String(text) => Some(text.to_string()),
        Value::Object(map) => {
            let part_type = map.get("type").and_then(Value::as_str).unwrap_or("text");
            match part_type {
                "text" | "input_text" | "output_text" => map
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            }
        }
        _ => None,
    }
}

/// The model string selects an agent when it names a known one; anything
/// else routes to the default agent.
pub(super) fn resolve_agent_id(
    model: Option<&str>,
    known_agent_ids: &[String],
    default_agent_id: &str,
) -> String {
    let Some(model) = model.map(str::trim).filter(|model| !model.is_empty()) else {
        return default_agent_id.to_string();
    };
    known_agent_ids
        .iter()
        .find(|agent_id| agent_id.eq_ignore_ascii_case(model))
        .cloned()
        .unwrap_or_else(|| default_agent_id.to_string())
}

/// Session key shape: `openai:{agent_id}:{user_or_conn}`.
pub(super) fn derive_session_key(agent_id: &str, user_or_conn: &str) -> String {
    format!(
        "openai:{agent_id}:{}",
        sanitize_session_component(user_or_conn)
    )
}

fn sanitize_session_component(raw: &str) -> String {
    let mut normalized = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            normalized.push(ch);
        } else {
            normalized.push('_');
        }
    }
    if normalized.is_empty() {
        "anonymous".to_string()
    } else {
        normalized
    }
}
