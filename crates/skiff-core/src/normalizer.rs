use std::collections::HashMap;

use serde_json::{json, Value};

use skiff_providers::StreamChunk;
use skiff_types::{CanonicalMessage, FinishReason, TokenUsage};

#[derive(Default)]
struct PendingToolCall {
    name: String,
    args_buf: String,
    parsed: Option<Value>,
}

/// Turns one provider turn's raw chunk sequence into canonical messages.
///
/// Tool-call arguments may arrive as partial JSON text; a parse is
/// re-attempted on every delta and the last successful parse is kept, but
/// nothing is emitted until the call completes. The atomic single-event
/// form degenerates to start, one delta, end.
pub struct ResponseNormalizer {
    session_id: String,
    pending: HashMap<String, PendingToolCall>,
    finish: Option<(FinishReason, Option<TokenUsage>)>,
}

impl ResponseNormalizer {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            pending: HashMap::new(),
            finish: None,
        }
    }

    /// The provider turn's finish signal, once observed. The loop emits
    /// the terminal message itself after dispatch, so this is consumed
    /// out-of-band rather than appearing in `ingest` output.
    pub fn take_finish(&mut self) -> Option<(FinishReason, Option<TokenUsage>)> {
        self.finish.take()
    }

    pub fn ingest(&mut self, chunk: StreamChunk) -> Vec<CanonicalMessage> {
        match chunk {
            StreamChunk::TextDelta(text) => vec![CanonicalMessage::Text {
                session_id: self.session_id.clone(),
                text,
            }],
            StreamChunk::ReasoningDelta(_) => {
                // Reasoning traces are provider-internal; not part of the
                // canonical schema.
                Vec::new()
            }
            StreamChunk::ToolCallStart { id, name } => {
                let entry = self.pending.entry(id).or_default();
                if entry.name.is_empty() {
                    entry.name = name;
                }
                Vec::new()
            }
            StreamChunk::ToolCallDelta { id, args_delta } => {
                let Some(entry) = self.pending.get_mut(&id) else {
                    tracing::warn!(call_id = %id, "argument delta for unknown tool call, dropped");
                    return Vec::new();
                };
                entry.args_buf.push_str(&args_delta);
                // Partial JSON is expected here; only a successful parse
                // is retained.
                if let Ok(value) = serde_json::from_str::<Value>(&entry.args_buf) {
                    entry.parsed = Some(value);
                }
                Vec::new()
            }
            StreamChunk::ToolCallEnd { id } => {
                let Some(call) = self.pending.remove(&id) else {
                    tracing::warn!(call_id = %id, "completion for unknown tool call, dropped");
                    return Vec::new();
                };
                if call.name.trim().is_empty() {
                    tracing::warn!(call_id = %id, "tool call completed without a name, dropped");
                    return Vec::new();
                }
                let arguments = match serde_json::from_str::<Value>(&call.args_buf) {
                    Ok(value) => value,
                    Err(_) => call.parsed.unwrap_or_else(|| {
                        if !call.args_buf.trim().is_empty() {
                            tracing::warn!(
                                call_id = %id,
                                tool = %call.name,
                                "tool call arguments never parsed, defaulting to empty object"
                            );
                        }
                        json!({})
                    }),
                };
                vec![CanonicalMessage::ToolCall {
                    session_id: self.session_id.clone(),
                    tool_call_id: id,
                    tool_name: call.name,
                    arguments,
                }]
            }
            StreamChunk::Done {
                finish_reason,
                usage,
            } => {
                self.finish = Some((FinishReason::from_provider(&finish_reason), usage));
                Vec::new()
            }
        }
    }
}
