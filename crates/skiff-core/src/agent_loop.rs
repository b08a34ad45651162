use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use skiff_observability::{emit_event, AgentEvent, ProcessKind};
use skiff_providers::ProviderRegistry;
use skiff_tools::{validate_tool_schemas, ExecutionContext, ToolRegistry};
use skiff_types::{
    AgentRun, CanonicalMessage, ChatMessage, FinishReason, RunOutcome, TokenUsage, ToolCallRecord,
    ToolResult,
};

use crate::{
    CancellationRegistry, EventBus, ResponseNormalizer, SessionStore, MAX_ROUNDS_CEILING,
};

const MAX_MODEL_FOLD_CHARS: usize = 16_000;

pub type OnMessage = Arc<dyn Fn(&CanonicalMessage) + Send + Sync>;

pub enum PromptInput {
    Prompt(String),
    History(Vec<ChatMessage>),
}

impl From<&str> for PromptInput {
    fn from(prompt: &str) -> Self {
        PromptInput::Prompt(prompt.to_string())
    }
}

impl From<String> for PromptInput {
    fn from(prompt: String) -> Self {
        PromptInput::Prompt(prompt)
    }
}

pub struct ExecuteOptions {
    /// Required round budget; clamped to [`MAX_ROUNDS_CEILING`].
    pub max_rounds: usize,
    pub workspace_root: PathBuf,
    pub session_id: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub cancel: Option<CancellationToken>,
    pub on_message: Option<OnMessage>,
}

impl ExecuteOptions {
    pub fn new(max_rounds: usize, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            max_rounds,
            workspace_root: workspace_root.into(),
            session_id: None,
            provider: None,
            model: None,
            system_prompt: None,
            cancel: None,
            on_message: None,
        }
    }
}

struct Emitter {
    messages: Vec<CanonicalMessage>,
    on_message: Option<OnMessage>,
    bus: EventBus,
}

impl Emitter {
    fn emit(&mut self, message: CanonicalMessage) {
        if let Some(callback) = &self.on_message {
            callback(&message);
        }
        self.bus.publish(message.clone());
        self.messages.push(message);
    }
}

/// The sequential tool-calling state machine: request, stream, dispatch,
/// repeat until the model stops asking for tools or the round budget is
/// spent. One instance serves any number of sessions; per-call state
/// lives on the stack of `execute`.
#[derive(Clone)]
pub struct AgentLoop {
    providers: ProviderRegistry,
    tools: ToolRegistry,
    sessions: SessionStore,
    cancellations: CancellationRegistry,
    bus: EventBus,
}

impl AgentLoop {
    pub fn new(
        providers: ProviderRegistry,
        tools: ToolRegistry,
        sessions: SessionStore,
        cancellations: CancellationRegistry,
        bus: EventBus,
    ) -> Self {
        Self {
            providers,
            tools,
            sessions,
            cancellations,
            bus,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    pub async fn execute(
        &self,
        input: PromptInput,
        opts: ExecuteOptions,
    ) -> anyhow::Result<AgentRun> {
        if opts.max_rounds == 0 {
            anyhow::bail!("max_rounds must be at least 1");
        }
        let max_rounds = opts.max_rounds.min(MAX_ROUNDS_CEILING);
        let started = Instant::now();

        let session_id = opts
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let workspace = opts.workspace_root.to_string_lossy().to_string();
        let session = self.sessions.get_or_create(&session_id, &workspace).await;

        let cancel = match opts.cancel.clone() {
            Some(token) => token,
            None => self.cancellations.create(&session_id).await,
        };
        let ctx = ExecutionContext::new(opts.workspace_root.clone(), session_id.clone())
            .with_cancel(cancel.clone());

        let mut conversation = match input {
            PromptInput::Prompt(prompt) => {
                let mut conversation = session.messages.clone();
                if let Some(system) = &opts.system_prompt {
                    let has_system = conversation
                        .first()
                        .map(|m| matches!(m.role, skiff_types::MessageRole::System))
                        .unwrap_or(false);
                    if !has_system {
                        conversation.insert(0, ChatMessage::system(system.clone()));
                    }
                }
                conversation.push(ChatMessage::user(prompt));
                conversation
            }
            PromptInput::History(history) => history,
        };

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            AgentEvent {
                session_id: Some(&session_id),
                provider_id: opts.provider.as_deref(),
                model_id: opts.model.as_deref(),
                status: Some("start"),
                ..AgentEvent::new("run.start", "core.agent_loop")
            },
        );

        let mut emitter = Emitter {
            messages: Vec::new(),
            on_message: opts.on_message.clone(),
            bus: self.bus.clone(),
        };

        let mut outcome = RunOutcome::Completed;
        let mut finish_reason = FinishReason::Stop;
        let mut usage_total = TokenUsage::default();
        let mut rounds = 0usize;

        'rounds: for round in 0..max_rounds {
            if cancel.is_cancelled() {
                outcome = RunOutcome::Cancelled;
                finish_reason = FinishReason::Cancelled;
                break;
            }
            rounds = round + 1;

            let schemas = self.tools.schemas().await;
            if let Err(err) = validate_tool_schemas(&schemas) {
                let detail = err.to_string();
                self.emit_provider_error(&mut emitter, &session_id, &detail, "TOOL_SCHEMA_INVALID");
                outcome = RunOutcome::Failed { error: detail };
                break;
            }

            let stream = self
                .providers
                .stream(
                    opts.provider.as_deref(),
                    opts.model.as_deref(),
                    conversation.clone(),
                    Some(schemas),
                    cancel.clone(),
                )
                .await;
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    let detail = err.to_string();
                    self.emit_provider_error(
                        &mut emitter,
                        &session_id,
                        &detail,
                        provider_error_code(&detail),
                    );
                    outcome = RunOutcome::Failed { error: detail };
                    break;
                }
            };

            let mut normalizer = ResponseNormalizer::new(&session_id);
            let mut assistant_text = String::new();
            let mut round_calls: Vec<ToolCallRecord> = Vec::new();
            let mut provider_finish: Option<FinishReason> = None;

            while let Some(chunk) = stream.next().await {
                if cancel.is_cancelled() {
                    outcome = RunOutcome::Cancelled;
                    finish_reason = FinishReason::Cancelled;
                    break 'rounds;
                }
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let detail = err.to_string();
                        self.emit_provider_error(
                            &mut emitter,
                            &session_id,
                            &detail,
                            provider_error_code(&detail),
                        );
                        outcome = RunOutcome::Failed { error: detail };
                        break 'rounds;
                    }
                };
                for message in normalizer.ingest(chunk) {
                    match &message {
                        CanonicalMessage::Text { text, .. } => assistant_text.push_str(text),
                        CanonicalMessage::ToolCall {
                            tool_call_id,
                            tool_name,
                            arguments,
                            ..
                        } => round_calls.push(ToolCallRecord {
                            id: tool_call_id.clone(),
                            name: tool_name.clone(),
                            arguments: arguments.clone(),
                        }),
                        _ => {}
                    }
                    emitter.emit(message);
                }
                if let Some((reason, usage)) = normalizer.take_finish() {
                    if let Some(usage) = usage {
                        usage_total.add(&usage);
                    }
                    provider_finish = Some(reason);
                    break;
                }
            }

            if round_calls.is_empty() {
                conversation.push(ChatMessage::assistant(assistant_text));
                finish_reason = provider_finish.unwrap_or(FinishReason::Stop);
                if finish_reason == FinishReason::ToolCalls {
                    // Provider claimed tool calls but none materialized;
                    // nothing left to do with this turn.
                    finish_reason = FinishReason::Stop;
                }
                break;
            }

            conversation.push(ChatMessage::assistant_with_calls(
                assistant_text,
                round_calls.clone(),
            ));

            for call in round_calls {
                if cancel.is_cancelled() {
                    outcome = RunOutcome::Cancelled;
                    finish_reason = FinishReason::Cancelled;
                    break 'rounds;
                }
                let result = match self
                    .tools
                    .execute(&call.name, call.arguments.clone(), &ctx)
                    .await
                {
                    Ok(result) => result,
                    Err(err) => ToolResult::fail(format!("tool `{}` crashed: {err}", call.name)),
                };
                // A tool that was already running when cancellation fired
                // finishes on its own; its result is discarded, not folded.
                if cancel.is_cancelled() {
                    outcome = RunOutcome::Cancelled;
                    finish_reason = FinishReason::Cancelled;
                    break 'rounds;
                }
                emit_event(
                    if result.success { Level::INFO } else { Level::WARN },
                    ProcessKind::Engine,
                    AgentEvent {
                        session_id: Some(&session_id),
                        tool: Some(&call.name),
                        tool_call_id: Some(&call.id),
                        status: Some(if result.success { "ok" } else { "failed" }),
                        error_code: result.error.as_deref(),
                        ..AgentEvent::new("tool.dispatch", "core.agent_loop")
                    },
                );
                let payload = if result.success {
                    result.payload.clone()
                } else {
                    json!({"error": result.error.clone().unwrap_or_else(|| "tool failed".to_string())})
                };
                emitter.emit(CanonicalMessage::ToolResult {
                    session_id: session_id.clone(),
                    tool_call_id: call.id.clone(),
                    payload,
                    is_error: !result.success,
                });
                conversation.push(ChatMessage::tool(call.id, render_result_for_model(&result)));
            }

            if round + 1 == max_rounds {
                finish_reason = FinishReason::MaxRounds;
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        if !matches!(outcome, RunOutcome::Failed { .. }) {
            if matches!(outcome, RunOutcome::Cancelled) {
                finish_reason = FinishReason::Cancelled;
            }
            emitter.emit(CanonicalMessage::TurnFinished {
                session_id: session_id.clone(),
                reason: finish_reason,
                usage: usage_total.clone(),
                duration_ms,
            });
        }

        self.sessions
            .update_messages(&session_id, conversation)
            .await;
        self.cancellations.remove(&session_id).await;

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            AgentEvent {
                session_id: Some(&session_id),
                status: Some(match &outcome {
                    RunOutcome::Completed => "ok",
                    RunOutcome::Cancelled => "cancelled",
                    RunOutcome::Failed { .. } => "failed",
                }),
                ..AgentEvent::new("run.finish", "core.agent_loop")
            },
        );

        Ok(AgentRun {
            session_id,
            outcome,
            messages: emitter.messages,
            usage: usage_total,
            duration_ms,
            rounds,
        })
    }

    fn emit_provider_error(
        &self,
        emitter: &mut Emitter,
        session_id: &str,
        detail: &str,
        error_code: &str,
    ) {
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            AgentEvent {
                session_id: Some(session_id),
                status: Some("failed"),
                error_code: Some(error_code),
                detail: Some(&truncate_text(detail, 500)),
                ..AgentEvent::new("provider.call.error", "core.agent_loop")
            },
        );
        emitter.emit(CanonicalMessage::Error {
            session_id: session_id.to_string(),
            message: truncate_text(detail, 2_000),
        });
    }
}

fn render_result_for_model(result: &ToolResult) -> String {
    if result.success {
        truncate_text(
            &serde_json::to_string_pretty(&result.payload).unwrap_or_default(),
            MAX_MODEL_FOLD_CHARS,
        )
    } else {
        format!(
            "Error: {}",
            result.error.as_deref().unwrap_or("tool failed")
        )
    }
}

fn truncate_text(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = input[..end].to_string();
    out.push_str("...<truncated>");
    out
}

fn provider_error_code(error_text: &str) -> &'static str {
    let lower = error_text.to_lowercase();
    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
    {
        return "RATE_LIMIT_EXCEEDED";
    }
    if lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("api key")
        || lower.contains("401")
        || lower.contains("403")
    {
        return "AUTHENTICATION_ERROR";
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return "TIMEOUT";
    }
    if lower.contains("500") || lower.contains("502") || lower.contains("503") {
        return "PROVIDER_SERVER_ERROR";
    }
    "PROVIDER_REQUEST_FAILED"
}
