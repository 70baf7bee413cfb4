use serde::Serialize;

use crate::types::{ContentBlock, Message, UserContentBlock, UserContentBody};

/// A progress event distilled from the raw stream-json protocol.
///
/// One [`Message`] can expand into several events (an assistant turn with
/// text plus two tool calls yields three). Order within the expansion follows
/// the order of the content blocks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ToolStart {
        tool_use_id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolEnd {
        tool_use_id: String,
        is_error: bool,
        output: String,
    },
    Message {
        text: String,
    },
    Error {
        message: String,
    },
}

/// Tool output is clipped before it is handed to observers.
const MAX_TOOL_OUTPUT: usize = 2_000;

/// Translate one protocol message into zero or more progress events.
pub fn translate(msg: &Message) -> Vec<AgentEvent> {
    match msg {
        Message::System(_) => Vec::new(),
        Message::Assistant(asst) => asst
            .message
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } if !text.trim().is_empty() => {
                    Some(AgentEvent::Message { text: text.clone() })
                }
                ContentBlock::ToolUse { id, name, input } => Some(AgentEvent::ToolStart {
                    tool_use_id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect(),
        Message::User(user) => match &user.message.content {
            UserContentBody::Text(_) => Vec::new(),
            UserContentBody::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    UserContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => Some(AgentEvent::ToolEnd {
                        tool_use_id: tool_use_id.clone(),
                        is_error: is_error.unwrap_or(false),
                        output: clip(
                            &content.as_ref().map(|c| c.to_text()).unwrap_or_default(),
                        ),
                    }),
                    UserContentBlock::Text { .. } => None,
                })
                .collect(),
        },
        Message::Result(r) if r.failed() => {
            let message = if r.errors.is_empty() {
                "agent finished with an error result".to_string()
            } else {
                r.errors.join("; ")
            };
            vec![AgentEvent::Error { message }]
        }
        Message::Result(_) => Vec::new(),
    }
}

fn clip(s: &str) -> String {
    if s.len() <= MAX_TOOL_OUTPUT {
        return s.to_string();
    }
    let mut end = MAX_TOOL_OUTPUT;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
