use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use skiff_types::{ToolResult, ToolSchema, ValidationReport};

pub mod fs_tools;
pub mod sandbox;
pub mod search_tools;
pub mod shell_tool;

pub use fs_tools::{EditTool, MultiEditTool, ReadTool, WriteTool};
pub use sandbox::resolve_sandboxed;
pub use search_tools::{GlobTool, GrepTool, LsTool};
pub use shell_tool::BashTool;

/// Immutable per-invocation bundle threaded into every tool call. The
/// workspace root is the sandbox boundary; the token is polled at
/// suspension points, never used to preempt a running tool.
#[derive(Clone)]
pub struct ExecutionContext {
    pub workspace_root: PathBuf,
    pub session_id: String,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(workspace_root: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            session_id: session_id.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    /// Expected failures come back as `ToolResult { success: false }`;
    /// `Err` is reserved for genuinely unexpected conditions.
    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult>;

    fn validate(&self, args: &Value) -> ValidationReport {
        validate_args(&self.schema(), args)
    }

    fn can_execute(&self, ctx: &ExecutionContext) -> bool {
        !ctx.workspace_root.as_os_str().is_empty()
    }
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The standard eight-tool workspace set.
    pub async fn with_default_tools() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(ReadTool)).await;
        registry.register(Arc::new(WriteTool)).await;
        registry.register(Arc::new(EditTool)).await;
        registry.register(Arc::new(MultiEditTool)).await;
        registry.register(Arc::new(LsTool)).await;
        registry.register(Arc::new(GrepTool)).await;
        registry.register(Arc::new(GlobTool)).await;
        registry.register(Arc::new(BashTool)).await;
        registry
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.schema().name;
        let mut tools = self.tools.write().await;
        if tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool registration collision, last one wins");
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.tools.write().await.remove(name).is_some()
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names = self
            .tools
            .read()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    /// The LLM-facing function-calling schema array, sorted by name.
    pub async fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas = self
            .tools
            .read()
            .await
            .values()
            .map(|t| t.schema())
            .collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Validates, gates, executes, and stamps timing metadata. Unknown
    /// tools and failed validation short-circuit without running a body.
    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<ToolResult> {
        let Some(tool) = self.get(name).await else {
            return Ok(ToolResult::fail(format!("unknown tool: {name}")));
        };

        let report = tool.validate(&args);
        if !report.is_valid() {
            return Ok(ToolResult::fail(format!(
                "invalid parameters for `{name}`: {}",
                report.errors.join("; ")
            )));
        }
        if !tool.can_execute(ctx) {
            return Ok(ToolResult::fail(format!(
                "tool `{name}` is unavailable in this context"
            )));
        }

        let started = Instant::now();
        let mut result = tool.execute(args, ctx).await?;
        result.metadata.duration_ms = started.elapsed().as_millis() as u64;
        if result.metadata.output_bytes == 0 {
            result.metadata.output_bytes = result.payload.to_string().len() as u64;
        }
        Ok(result)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Default parameter validation: required fields must be present and
/// every provided field must match its declared primitive type.
pub fn validate_args(schema: &ToolSchema, args: &Value) -> ValidationReport {
    let mut errors = Vec::new();
    let Some(obj) = args.as_object() else {
        return ValidationReport::invalid(vec!["arguments must be a JSON object".to_string()]);
    };

    let root = &schema.input_schema;
    if let Some(required) = root.get("required").and_then(|v| v.as_array()) {
        for key in required.iter().filter_map(|v| v.as_str()) {
            if !obj.contains_key(key) || obj[key].is_null() {
                errors.push(format!("missing required parameter `{key}`"));
            }
        }
    }

    if let Some(props) = root.get("properties").and_then(|v| v.as_object()) {
        for (key, value) in obj {
            let Some(expected) = props
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str())
            else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok && !value.is_null() {
                errors.push(format!("parameter `{key}` must be a {expected}"));
            }
        }
    }

    if errors.is_empty() {
        ValidationReport::default()
    } else {
        ValidationReport::invalid(errors)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

/// Providers reject whole requests over one malformed schema, so the full
/// list is checked before every round. Arrays must declare `items`,
/// recursively through every nested schema position.
pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        if let Some(arr) = value.as_array() {
            for (idx, item) in arr.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}[{idx}]"), item)?;
            }
        }
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    for combinator in ["oneOf", "anyOf", "allOf"] {
        if let Some(children) = obj.get(combinator).and_then(|v| v.as_array()) {
            for (idx, child) in children.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}.{combinator}[{idx}]"), child)?;
            }
        }
    }
    if let Some(additional) = obj.get("additionalProperties") {
        validate_schema_node(tool_name, &format!("{path}.additionalProperties"), additional)?;
    }

    Ok(())
}
