use std::collections::HashMap;

use schemars::schema_for;

use crate::history::{Message, MessageRole, ToolCall};
use crate::llm::{ChatMessage, ChatRole};

use super::candidates::CandidateList;

const EXTRACTOR_SYSTEM_PROMPT: &str = "You are analyzing the transcript of a completed \
coding-assistant session. Find moments where the user corrected the assistant after a tool \
call: disapproval, a request to undo, or a stated preference the assistant violated. For \
each correction, produce a guard rule that would have flagged the offending tool invocation \
before it ran.\n\n\
Respond with a single JSON object matching this schema:\n\n{schema}\n\n\
Patterns are regular expressions searched case-sensitively against the serialized tool \
input. Prefer narrow patterns anchored to the offending command or path over broad ones. \
Use action \"block\" only when the correction shows real damage or an explicit prohibition; \
otherwise use \"warn\". Set message_number to the numbered transcript entry containing the \
user's correction. Return {\"rules\": []} when the session contains no corrections.";

/// A transcript rendered for the oracle plus the mapping from its visible
/// entry numbers back to message ids.
#[derive(Debug, Clone)]
pub struct RenderedTranscript {
    pub text: String,
    pub message_ids: Vec<String>,
}

impl RenderedTranscript {
    /// Resolve a 1-based transcript entry number to its message id.
    pub fn message_id(&self, number: usize) -> Option<&str> {
        number
            .checked_sub(1)
            .and_then(|idx| self.message_ids.get(idx))
            .map(|id| id.as_str())
    }
}

/// Renders messages in order as numbered entries, with each assistant
/// message's tool calls summarized on indented lines beneath it.
pub fn format_transcript(
    messages: &[Message],
    tool_calls: &[ToolCall],
    max_message_chars: usize,
) -> RenderedTranscript {
    let mut calls_by_message: HashMap<&str, Vec<&ToolCall>> = HashMap::new();
    for call in tool_calls {
        calls_by_message
            .entry(call.message_id.as_str())
            .or_default()
            .push(call);
    }

    let mut text = String::new();
    let mut message_ids = Vec::with_capacity(messages.len());

    for (idx, message) in messages.iter().enumerate() {
        let role = match message.role {
            MessageRole::User => "USER",
            MessageRole::Assistant => "ASSISTANT",
        };
        let content = truncate_chars(&message.content, max_message_chars);
        text.push_str(&format!("[{}] {}: {}\n", idx + 1, role, content));

        if let Some(calls) = calls_by_message.get(message.id.as_str()) {
            for call in calls {
                let input = serde_json::to_string(&call.input)
                    .unwrap_or_else(|_| "<unserializable input>".to_string());
                text.push_str(&format!(
                    "    [tool: {}] {}\n",
                    call.tool,
                    truncate_chars(&input, max_message_chars)
                ));
                if let Some(output) = &call.output {
                    text.push_str(&format!(
                        "    [result] {}\n",
                        truncate_chars(output, max_message_chars)
                    ));
                }
            }
        }

        message_ids.push(message.id.clone());
    }

    RenderedTranscript { text, message_ids }
}

pub fn build_extraction_messages(transcript: &RenderedTranscript) -> Vec<ChatMessage> {
    let schema = schema_for!(CandidateList);
    let schema_json =
        serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "{}".to_string());

    vec![
        ChatMessage {
            role: ChatRole::System,
            content: EXTRACTOR_SYSTEM_PROMPT.replace("{schema}", &schema_json),
        },
        ChatMessage {
            role: ChatRole::User,
            content: transcript.text.clone(),
        },
    ]
}

fn truncate_chars(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let head: String = content.chars().take(max_chars).collect();
    format!("{head} [truncated]")
}
