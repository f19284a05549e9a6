//! Request translation: one OpenAI chat request in, one CLI invocation out.
//!
//! The claude CLI runs in single-shot print mode, so the conversation is
//! flattened into a single prompt. System instructions travel separately via
//! `--append-system-prompt`; continuity across requests is left to the CLI's
//! own `--resume` sessions.

use serde_json::Value;

use crate::model::{resolve_model, ModelAlias};
use crate::types::{ChatCompletionRequest, ContentPart, Message, MessageContent, Role};

/// Everything needed to run the CLI once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationDescriptor {
    pub prompt: String,
    pub model: ModelAlias,
    /// Never `Some("")`.
    pub system_prompt: Option<String>,
    pub session_id: Option<String>,
}

impl InvocationDescriptor {
    pub fn new(prompt: impl Into<String>, model: ModelAlias) -> Self {
        Self {
            prompt: prompt.into(),
            model,
            system_prompt: None,
            session_id: None,
        }
    }
}

pub fn translate_request(request: &ChatCompletionRequest) -> InvocationDescriptor {
    InvocationDescriptor {
        prompt: build_prompt(&request.messages),
        model: resolve_model(request.model.as_deref()),
        system_prompt: extract_system_prompt(&request.messages),
        session_id: request.user.clone(),
    }
}

/// Plain text of a message's content. Never fails.
pub fn extract_content(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(part_text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        MessageContent::Other(value) => value_text(value),
    }
}

fn part_text(part: &ContentPart) -> &str {
    match part {
        ContentPart::Plain(text) | ContentPart::Text { text } => text,
        ContentPart::Other(_) => "",
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// System messages joined by a blank line, or `None` when none has text.
pub fn extract_system_prompt(messages: &[Message]) -> Option<String> {
    let parts: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| extract_content(&m.content))
        .filter(|text| !text.is_empty())
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Flatten user and assistant turns into one prompt, in order.
///
/// Earlier assistant turns are fenced in `<previous_response>` tags so the
/// model does not read them as new instructions.
pub fn build_prompt(messages: &[Message]) -> String {
    messages
        .iter()
        .filter_map(|m| {
            let text = extract_content(&m.content);
            match m.role {
                Role::System => None,
                Role::User => Some(text),
                Role::Assistant => Some(format!(
                    "<previous_response>\n{text}\n</previous_response>\n"
                )),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
