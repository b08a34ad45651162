use std::collections::HashMap;
use std::sync::Arc;
use std::{pin::Pin, str};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use skiff_types::{ChatMessage, MessageRole, ModelInfo, ProviderInfo, TokenUsage, ToolSchema};

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

/// Raw provider-native streaming alphabet. The normalizer in skiff-core
/// turns this into canonical messages; nothing downstream of it should
/// ever see these.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallDelta {
        id: String,
        args_delta: String,
    },
    ToolCallEnd {
        id: String,
    },
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

/// Explicit construction inputs for one provider. Credentials are passed
/// here, never read from process-global state by the adapters themselves.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream>;
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.info().id)
            .finish()
    }
}

pub type ProviderFactory = fn(&str, ProviderSettings) -> anyhow::Result<Arc<dyn Provider>>;

struct OpenAiDefaults {
    display_name: &'static str,
    base_url: &'static str,
    model: &'static str,
    requires_key: bool,
}

fn openai_defaults(id: &str) -> Option<OpenAiDefaults> {
    let defaults = match id {
        "openai" => OpenAiDefaults {
            display_name: "OpenAI",
            base_url: "https://api.openai.com/v1",
            model: "gpt-4o-mini",
            requires_key: true,
        },
        "openrouter" => OpenAiDefaults {
            display_name: "OpenRouter",
            base_url: "https://openrouter.ai/api/v1",
            model: "openai/gpt-4o-mini",
            requires_key: true,
        },
        "groq" => OpenAiDefaults {
            display_name: "Groq",
            base_url: "https://api.groq.com/openai/v1",
            model: "llama-3.1-8b-instant",
            requires_key: true,
        },
        "mistral" => OpenAiDefaults {
            display_name: "Mistral",
            base_url: "https://api.mistral.ai/v1",
            model: "mistral-small-latest",
            requires_key: true,
        },
        "together" => OpenAiDefaults {
            display_name: "Together",
            base_url: "https://api.together.xyz/v1",
            model: "meta-llama/Llama-3.1-8B-Instruct-Turbo",
            requires_key: true,
        },
        "ollama" => OpenAiDefaults {
            display_name: "Ollama",
            base_url: "http://127.0.0.1:11434/v1",
            model: "llama3.1:8b",
            requires_key: false,
        },
        _ => return None,
    };
    Some(defaults)
}

fn build_openai_compatible(id: &str, settings: ProviderSettings) -> anyhow::Result<Arc<dyn Provider>> {
    let defaults = openai_defaults(id)
        .ok_or_else(|| anyhow::anyhow!("unknown openai-compatible provider `{id}`"))?;
    let api_key = settings
        .api_key
        .as_deref()
        .filter(|key| !is_placeholder_api_key(key))
        .map(ToString::to_string);
    if defaults.requires_key && api_key.is_none() {
        anyhow::bail!("provider `{id}` requires an API key and none was supplied");
    }
    let model = settings
        .model
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(defaults.model)
        .to_string();
    Ok(Arc::new(OpenAiCompatibleProvider {
        id: id.to_string(),
        name: defaults.display_name.to_string(),
        base_url: normalize_base(settings.base_url.as_deref().unwrap_or(defaults.base_url)),
        api_key,
        default_model: model,
        client: Client::new(),
    }))
}

fn build_anthropic(_id: &str, settings: ProviderSettings) -> anyhow::Result<Arc<dyn Provider>> {
    let api_key = settings
        .api_key
        .as_deref()
        .filter(|key| !is_placeholder_api_key(key))
        .map(ToString::to_string)
        .ok_or_else(|| anyhow::anyhow!("provider `anthropic` requires an API key"))?;
    let model = settings
        .model
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or("claude-3-5-sonnet-latest")
        .to_string();
    Ok(Arc::new(AnthropicProvider {
        api_key,
        base_url: normalize_plain_base(
            settings
                .base_url
                .as_deref()
                .unwrap_or("https://api.anthropic.com"),
        ),
        default_model: model,
        client: Client::new(),
    }))
}

/// Adding a provider is one entry here plus its chunk mapping; nothing
/// else in the engine changes.
pub fn builtin_factories() -> HashMap<&'static str, ProviderFactory> {
    let mut table: HashMap<&'static str, ProviderFactory> = HashMap::new();
    for id in ["openai", "openrouter", "groq", "mistral", "together", "ollama"] {
        table.insert(id, build_openai_compatible);
    }
    table.insert("anthropic", build_anthropic);
    table
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<Vec<Arc<dyn Provider>>>,
    build_errors: Arc<HashMap<String, String>>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    /// Builds every configured provider through the factory table. A
    /// provider whose factory fails (missing key, unknown id) is kept as a
    /// recorded error and surfaces when explicitly selected.
    pub fn from_config(config: AppConfig) -> Self {
        let factories = builtin_factories();
        let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
        let mut build_errors = HashMap::new();

        let mut ids = config.providers.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        for id in ids {
            let entry = &config.providers[&id];
            let settings = ProviderSettings {
                api_key: entry.api_key.clone(),
                base_url: entry.url.clone(),
                model: entry.default_model.clone(),
            };
            let Some(factory) = factories.get(id.as_str()) else {
                build_errors.insert(id.clone(), format!("unknown provider `{id}`"));
                continue;
            };
            match factory(&id, settings) {
                Ok(provider) => providers.push(provider),
                Err(err) => {
                    tracing::warn!(provider = %id, error = %err, "provider not constructed");
                    build_errors.insert(id.clone(), err.to_string());
                }
            }
        }

        Self {
            providers: Arc::new(providers),
            build_errors: Arc::new(build_errors),
            default_provider: config.default_provider,
        }
    }

    /// Registry with a single pre-built provider; the seam tests and
    /// embedders use to inject their own backend.
    pub fn single(provider: Arc<dyn Provider>) -> Self {
        Self {
            providers: Arc::new(vec![provider]),
            build_errors: Arc::new(HashMap::new()),
            default_provider: None,
        }
    }

    pub fn list(&self) -> Vec<ProviderInfo> {
        self.providers.iter().map(|p| p.info()).collect()
    }

    pub fn select(&self, provider_id: Option<&str>) -> anyhow::Result<Arc<dyn Provider>> {
        if let Some(id) = provider_id {
            if let Some(provider) = self.providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            if let Some(err) = self.build_errors.get(id) {
                anyhow::bail!("provider `{id}` is unavailable: {err}");
            }
            let available = self
                .providers
                .iter()
                .map(|p| p.info().id)
                .collect::<Vec<_>>();
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        }

        if let Some(default_id) = &self.default_provider {
            if let Some(provider) = self.providers.iter().find(|p| &p.info().id == default_id) {
                return Ok(provider.clone());
            }
        }
        let Some(provider) = self.providers.first() else {
            anyhow::bail!("no provider configured");
        };
        Ok(provider.clone())
    }

    pub async fn stream(
        &self,
        provider_id: Option<&str>,
        model_id: Option<&str>,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let provider = self.select(provider_id)?;
        provider.stream(messages, model_id, tools, cancel).await
    }
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn normalize_plain_base(input: &str) -> String {
    input.trim_end_matches('/').to_string()
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

/// Splits SSE byte chunks into complete `data:` payloads, buffering
/// partial frames across network reads.
struct SseFrameBuffer {
    buffer: String,
}

impl SseFrameBuffer {
    fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(str::from_utf8(bytes).unwrap_or_default());
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let frame = self.buffer[..pos].to_string();
            self.buffer = self.buffer[pos + 2..].to_string();
            for line in frame.lines() {
                if let Some(payload) = line.strip_prefix("data: ") {
                    payloads.push(payload.trim().to_string());
                }
            }
        }
        payloads
    }
}

fn extract_openai_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
}

fn extract_openai_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    if usage.is_null() {
        return None;
    }
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

struct OpenAiCompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

fn openai_wire_message(message: &ChatMessage) -> Value {
    match message.role {
        MessageRole::System => json!({"role": "system", "content": message.content}),
        MessageRole::User => json!({"role": "user", "content": message.content}),
        MessageRole::Assistant => {
            let mut wire = json!({"role": "assistant", "content": message.content});
            if !message.tool_calls.is_empty() {
                wire["tool_calls"] = Value::Array(
                    message
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments.to_string()
                                }
                            })
                        })
                        .collect(),
                );
            }
            wire
        }
        MessageRole::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
            "content": message.content
        }),
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: self.id.clone(),
                display_name: self.default_model.clone(),
                context_window: 128_000,
            }],
        }
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let model = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
            .to_string();
        let url = format!("{}/chat/completions", self.base_url);
        let wire_messages = messages.iter().map(openai_wire_message).collect::<Vec<_>>();

        let wire_tools = tools
            .unwrap_or_default()
            .into_iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "model": model,
            "messages": wire_messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !wire_tools.is_empty() {
            body["tools"] = Value::Array(wire_tools);
            body["tool_choice"] = json!("auto");
        }

        let mut req = self.client.post(url).json(&body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "provider stream request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut frames = SseFrameBuffer::new();
            // OpenAI only carries the call id on the first fragment of each
            // tool call; later fragments are correlated by index.
            let mut call_ids: HashMap<u64, String> = HashMap::new();
            let mut open_calls: Vec<String> = Vec::new();
            let mut pending_usage: Option<TokenUsage> = None;

            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done {
                        finish_reason: "cancelled".to_string(),
                        usage: pending_usage.take(),
                    };
                    break;
                }
                let chunk = chunk?;
                for payload in frames.push(&chunk) {
                    if payload == "[DONE]" {
                        yield StreamChunk::Done {
                            finish_reason: "stop".to_string(),
                            usage: pending_usage.take(),
                        };
                        continue;
                    }
                    let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                        continue;
                    };
                    if let Some(detail) = extract_openai_error(&value) {
                        Err(anyhow::anyhow!(detail))?;
                    }
                    if let Some(usage) = extract_openai_usage(&value) {
                        pending_usage = Some(usage);
                    }

                    let choices = value
                        .get("choices")
                        .and_then(|v| v.as_array())
                        .cloned()
                        .unwrap_or_default();
                    for choice in choices {
                        let delta = choice.get("delta").cloned().unwrap_or_default();

                        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                yield StreamChunk::TextDelta(text.to_string());
                            }
                        }

                        if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                            for call in tool_calls {
                                let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                                let function = call.get("function").cloned().unwrap_or_default();
                                if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                                    if !id.is_empty() && !call_ids.contains_key(&index) {
                                        call_ids.insert(index, id.to_string());
                                        open_calls.push(id.to_string());
                                        let name = function
                                            .get("name")
                                            .and_then(|v| v.as_str())
                                            .unwrap_or_default()
                                            .to_string();
                                        yield StreamChunk::ToolCallStart {
                                            id: id.to_string(),
                                            name,
                                        };
                                    }
                                }
                                let args_delta = function
                                    .get("arguments")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or_default();
                                if !args_delta.is_empty() {
                                    if let Some(id) = call_ids.get(&index) {
                                        yield StreamChunk::ToolCallDelta {
                                            id: id.clone(),
                                            args_delta: args_delta.to_string(),
                                        };
                                    }
                                }
                            }
                        }

                        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                            if !reason.is_empty() {
                                for id in open_calls.drain(..) {
                                    yield StreamChunk::ToolCallEnd { id };
                                }
                                yield StreamChunk::Done {
                                    finish_reason: reason.to_string(),
                                    usage: pending_usage.take(),
                                };
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

struct AnthropicProvider {
    api_key: String,
    base_url: String,
    default_model: String,
    client: Client,
}

fn anthropic_wire(messages: &[ChatMessage]) -> (String, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut wire = Vec::new();
    for message in messages {
        match message.role {
            MessageRole::System => system_parts.push(message.content.clone()),
            MessageRole::User => {
                wire.push(json!({"role": "user", "content": message.content}));
            }
            MessageRole::Assistant => {
                let mut blocks = Vec::new();
                if !message.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": message.content}));
                }
                for call in &message.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments
                    }));
                }
                wire.push(json!({"role": "assistant", "content": blocks}));
            }
            MessageRole::Tool => {
                wire.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                        "content": message.content
                    }]
                }));
            }
        }
    }
    (system_parts.join("\n\n"), wire)
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "anthropic".to_string(),
            name: "Anthropic".to_string(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: "anthropic".to_string(),
                display_name: self.default_model.clone(),
                context_window: 200_000,
            }],
        }
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let model = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
            .to_string();
        let (system, wire_messages) = anthropic_wire(&messages);

        let mut body = json!({
            "model": model,
            "max_tokens": 4096,
            "stream": true,
            "messages": wire_messages,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if let Some(tools) = tools.filter(|t| !t.is_empty()) {
            body["tools"] = Value::Array(
                tools
                    .into_iter()
                    .map(|tool| {
                        json!({
                            "name": tool.name,
                            "description": tool.description,
                            "input_schema": tool.input_schema
                        })
                    })
                    .collect(),
            );
        }

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("anthropic-version", "2023-06-01")
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "provider stream request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut frames = SseFrameBuffer::new();
            // Anthropic correlates content blocks by index, not id.
            let mut block_ids: HashMap<u64, String> = HashMap::new();
            let mut usage = TokenUsage::default();
            let mut finish_reason = "stop".to_string();

            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done {
                        finish_reason: "cancelled".to_string(),
                        usage: Some(usage.clone()),
                    };
                    break;
                }
                let chunk = chunk?;
                for payload in frames.push(&chunk) {
                    let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                        continue;
                    };
                    match value.get("type").and_then(|v| v.as_str()).unwrap_or_default() {
                        "message_start" => {
                            if let Some(input) = value
                                .pointer("/message/usage/input_tokens")
                                .and_then(|v| v.as_u64())
                            {
                                usage.prompt_tokens = input;
                            }
                        }
                        "content_block_start" => {
                            let index =
                                value.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                            let block = value.get("content_block").cloned().unwrap_or_default();
                            if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                                let id = block
                                    .get("id")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or_default()
                                    .to_string();
                                let name = block
                                    .get("name")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or_default()
                                    .to_string();
                                if !id.is_empty() {
                                    block_ids.insert(index, id.clone());
                                    yield StreamChunk::ToolCallStart { id, name };
                                }
                            }
                        }
                        "content_block_delta" => {
                            let index =
                                value.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                            let delta = value.get("delta").cloned().unwrap_or_default();
                            match delta.get("type").and_then(|v| v.as_str()).unwrap_or_default() {
                                "text_delta" => {
                                    if let Some(text) =
                                        delta.get("text").and_then(|v| v.as_str())
                                    {
                                        yield StreamChunk::TextDelta(text.to_string());
                                    }
                                }
                                "thinking_delta" => {
                                    if let Some(text) =
                                        delta.get("thinking").and_then(|v| v.as_str())
                                    {
                                        yield StreamChunk::ReasoningDelta(text.to_string());
                                    }
                                }
                                "input_json_delta" => {
                                    if let Some(partial) =
                                        delta.get("partial_json").and_then(|v| v.as_str())
                                    {
                                        if let Some(id) = block_ids.get(&index) {
                                            yield StreamChunk::ToolCallDelta {
                                                id: id.clone(),
                                                args_delta: partial.to_string(),
                                            };
                                        }
                                    }
                                }
                                _ => {}
                            }
                        }
                        "content_block_stop" => {
                            let index =
                                value.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                            if let Some(id) = block_ids.remove(&index) {
                                yield StreamChunk::ToolCallEnd { id };
                            }
                        }
                        "message_delta" => {
                            if let Some(reason) = value
                                .pointer("/delta/stop_reason")
                                .and_then(|v| v.as_str())
                            {
                                finish_reason = reason.to_string();
                            }
                            if let Some(output) = value
                                .pointer("/usage/output_tokens")
                                .and_then(|v| v.as_u64())
                            {
                                usage.completion_tokens = output;
                            }
                        }
                        "message_stop" => {
                            usage.total_tokens =
                                usage.prompt_tokens.saturating_add(usage.completion_tokens);
                            yield StreamChunk::Done {
                                finish_reason: finish_reason.clone(),
                                usage: Some(usage.clone()),
                            };
                        }
                        "error" => {
                            let detail = value
                                .pointer("/error/message")
                                .and_then(|v| v.as_str())
                                .unwrap_or("provider error");
                            Err(anyhow::anyhow!(detail.to_string()))?;
                        }
                        // ping and friends carry nothing we need.
                        _ => {}
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(provider_ids: &[&str], default_provider: Option<&str>) -> AppConfig {
        let mut providers = HashMap::new();
        for id in provider_ids {
            providers.insert(
                (*id).to_string(),
                ProviderConfig {
                    api_key: Some(format!("sk-{id}-test")),
                    url: None,
                    default_model: Some(format!("{id}-model")),
                },
            );
        }
        AppConfig {
            providers,
            default_provider: default_provider.map(|s| s.to_string()),
        }
    }

    #[test]
    fn explicit_provider_wins_over_default_provider() {
        let registry = ProviderRegistry::from_config(cfg(&["openai", "openrouter"], Some("openai")));
        let provider = registry.select(Some("openrouter")).expect("provider");
        assert_eq!(provider.info().id, "openrouter");
    }

    #[test]
    fn uses_default_provider_when_none_requested() {
        let registry =
            ProviderRegistry::from_config(cfg(&["openai", "openrouter"], Some("openrouter")));
        let provider = registry.select(None).expect("provider");
        assert_eq!(provider.info().id, "openrouter");
    }

    #[test]
    fn falls_back_to_first_provider_when_default_missing() {
        let registry = ProviderRegistry::from_config(cfg(&["openai"], Some("anthropic")));
        let provider = registry.select(None).expect("provider");
        assert_eq!(provider.info().id, "openai");
    }

    #[test]
    fn explicit_unknown_provider_errors() {
        let registry = ProviderRegistry::from_config(cfg(&["openai"], None));
        let err = registry.select(Some("openruter")).expect_err("expected error");
        assert!(err.to_string().contains("openruter"));
    }

    #[test]
    fn missing_api_key_fails_at_construction_not_at_call_time() {
        let err = build_openai_compatible("openai", ProviderSettings::default())
            .err()
            .expect("expected factory failure");
        assert!(err.to_string().contains("requires an API key"));

        // Registry records the failure and surfaces it on selection.
        let mut config = AppConfig::default();
        config
            .providers
            .insert("openai".to_string(), ProviderConfig::default());
        let registry = ProviderRegistry::from_config(config);
        let err = registry.select(Some("openai")).expect_err("unavailable");
        assert!(err.to_string().contains("unavailable"));
    }

    #[test]
    fn placeholder_api_keys_are_treated_as_absent() {
        let settings = ProviderSettings {
            api_key: Some("placeholder".to_string()),
            ..Default::default()
        };
        assert!(build_openai_compatible("openai", settings).is_err());
    }

    #[test]
    fn keyless_ollama_constructs() {
        let provider =
            build_openai_compatible("ollama", ProviderSettings::default()).expect("ollama");
        assert_eq!(provider.info().id, "ollama");
    }

    #[test]
    fn anthropic_requires_key_and_defaults_model() {
        assert!(build_anthropic("anthropic", ProviderSettings::default()).is_err());
        let provider = build_anthropic(
            "anthropic",
            ProviderSettings {
                api_key: Some("sk-ant-test".to_string()),
                ..Default::default()
            },
        )
        .expect("anthropic");
        assert_eq!(provider.info().id, "anthropic");
    }

    #[test]
    fn sse_frame_buffer_handles_split_frames() {
        let mut frames = SseFrameBuffer::new();
        assert!(frames.push(b"data: {\"a\":").is_empty());
        let complete = frames.push(b"1}\n\ndata: [DONE]\n\n");
        assert_eq!(complete, vec!["{\"a\":1}", "[DONE]"]);
    }

    #[test]
    fn openai_wire_message_maps_roles_and_tool_calls() {
        let assistant = ChatMessage::assistant_with_calls(
            "working on it",
            vec![skiff_types::ToolCallRecord {
                id: "call_1".to_string(),
                name: "read".to_string(),
                arguments: json!({"file_path": "a.txt"}),
            }],
        );
        let wire = openai_wire_message(&assistant);
        assert_eq!(wire["role"], "assistant");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "read");

        let tool = ChatMessage::tool("call_1", "contents");
        let wire = openai_wire_message(&tool);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_1");
    }

    #[test]
    fn anthropic_wire_splits_system_and_folds_tool_results() {
        let messages = vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("hi"),
            ChatMessage::assistant_with_calls(
                "",
                vec![skiff_types::ToolCallRecord {
                    id: "toolu_1".to_string(),
                    name: "ls".to_string(),
                    arguments: json!({}),
                }],
            ),
            ChatMessage::tool("toolu_1", "src\nCargo.toml"),
        ];
        let (system, wire) = anthropic_wire(&messages);
        assert_eq!(system, "be terse");
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1]["content"][0]["type"], "tool_use");
        assert_eq!(wire[2]["content"][0]["type"], "tool_result");
        assert_eq!(wire[2]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn usage_extraction_fills_total_when_missing() {
        let usage = extract_openai_usage(&json!({
            "usage": {"prompt_tokens": 12, "completion_tokens": 8}
        }))
        .expect("usage");
        assert_eq!(usage.total_tokens, 20);
    }
}
