use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use skiff_core::{
    AgentLoop, CancellationRegistry, ConfigStore, EventBus, ExecuteOptions, SessionStore,
};
use skiff_observability::{
    emit_event, init_process_logging, logs_dir_from_state_dir, AgentEvent, ProcessKind,
};
use skiff_providers::ProviderRegistry;
use skiff_tools::{ExecutionContext, ToolRegistry};
use skiff_types::CanonicalMessage;

const SUPPORTED_PROVIDER_IDS: [&str; 7] = [
    "openai",
    "openrouter",
    "anthropic",
    "ollama",
    "groq",
    "mistral",
    "together",
];

#[derive(Parser, Debug)]
#[command(name = "skiff-engine")]
#[command(about = "Headless Skiff coding-agent engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one agent turn against a workspace, streaming canonical
    /// messages to stdout as JSON lines.
    Run {
        prompt: String,
        #[arg(long, default_value = ".")]
        workspace: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long, default_value_t = 6)]
        max_rounds: usize,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
    /// Invoke one tool directly from a JSON payload: `{"tool": ..., "args": {...}}`.
    /// Accepts inline JSON, `@file`, or `-` for stdin.
    Tool {
        #[arg(long)]
        json: String,
        #[arg(long, default_value = ".")]
        workspace: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir();
    let (_log_guard, _log_info) =
        init_process_logging(ProcessKind::Engine, &logs_dir_from_state_dir(&state_dir), 14)?;

    match cli.command {
        Command::Run {
            prompt,
            workspace,
            provider,
            model,
            api_key,
            max_rounds,
            session,
            system,
            config,
        } => {
            let provider = normalize_and_validate_provider(provider)?;
            let overrides = build_cli_overrides(api_key, provider.clone(), model.clone())?;
            let config_path = config
                .map(PathBuf::from)
                .unwrap_or_else(|| state_dir.join("config.json"));
            let config = ConfigStore::load(&config_path, overrides).await?;

            let workspace_root = std::fs::canonicalize(&workspace)
                .with_context(|| format!("workspace does not exist: {workspace}"))?;

            let agent = AgentLoop::new(
                ProviderRegistry::from_config(config.get()),
                ToolRegistry::with_default_tools().await,
                SessionStore::new(),
                CancellationRegistry::new(),
                EventBus::new(),
            );

            let mut opts = ExecuteOptions::new(max_rounds, workspace_root);
            opts.provider = provider;
            opts.model = model;
            opts.session_id = session;
            opts.system_prompt = system;
            opts.on_message = Some(Arc::new(|message: &CanonicalMessage| {
                if let Ok(line) = serde_json::to_string(message) {
                    println!("{line}");
                }
            }));

            let run = agent.execute(prompt.into(), opts).await?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                AgentEvent {
                    session_id: Some(&run.session_id),
                    status: Some(if run.outcome.is_success() { "ok" } else { "failed" }),
                    ..AgentEvent::new("cli.run.finish", "engine.main")
                },
            );
            eprintln!(
                "run {}: {:?} in {}ms over {} round(s), {} tokens",
                run.session_id,
                run.outcome,
                run.duration_ms,
                run.rounds,
                run.usage.total_tokens
            );
            if !run.outcome.is_success() {
                std::process::exit(1);
            }
        }
        Command::Tool { json, workspace } => {
            let payload = read_tool_json(&json)?;
            let tool = payload
                .get("tool")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            if tool.is_empty() {
                anyhow::bail!("tool is required in input json");
            }
            let args = payload
                .get("args")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));

            let workspace_root = std::fs::canonicalize(&workspace)
                .with_context(|| format!("workspace does not exist: {workspace}"))?;
            let registry = ToolRegistry::with_default_tools().await;
            let ctx = ExecutionContext::new(workspace_root, uuid::Uuid::new_v4().to_string());
            let result = registry.execute(&tool, args, &ctx).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn resolve_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SKIFF_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".skiff")
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    )
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Option<serde_json::Value>> {
    if api_key.is_none() && provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();

    if let Some(p) = &provider {
        root.insert(
            "default_provider".to_string(),
            serde_json::Value::String(p.clone()),
        );
    }

    // Key/model overrides target the chosen provider, or openai when the
    // provider flag is omitted.
    let target_provider = provider.as_deref().unwrap_or("openai");
    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(key) = api_key {
            provider_config.insert("api_key".to_string(), serde_json::Value::String(key));
        }
        if let Some(model) = model {
            provider_config.insert(
                "default_model".to_string(),
                serde_json::Value::String(model),
            );
        }
        let mut providers = serde_json::Map::new();
        providers.insert(
            target_provider.to_string(),
            serde_json::Value::Object(provider_config),
        );
        root.insert(
            "providers".to_string(),
            serde_json::Value::Object(providers),
        );
    }

    Ok(Some(serde_json::Value::Object(root)))
}

fn read_tool_json(input: &str) -> anyhow::Result<serde_json::Value> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    if let Some(path) = input.strip_prefix('@') {
        let raw = std::fs::read_to_string(path)?;
        return Ok(serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_str(input)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_cli_overrides_targets_selected_provider() {
        let overrides = build_cli_overrides(
            Some("sk-test".to_string()),
            Some("openrouter".to_string()),
            Some("google/gemini-2.5-flash".to_string()),
        )
        .expect("overrides")
        .expect("some");

        assert_eq!(overrides["default_provider"], "openrouter");
        assert_eq!(
            overrides["providers"]["openrouter"]["api_key"],
            json!("sk-test")
        );
        assert_eq!(
            overrides["providers"]["openrouter"]["default_model"],
            json!("google/gemini-2.5-flash")
        );
    }

    #[test]
    fn build_cli_overrides_defaults_to_openai_without_provider() {
        let overrides = build_cli_overrides(Some("sk-test".to_string()), None, None)
            .expect("overrides")
            .expect("some");

        assert!(overrides.get("default_provider").is_none());
        assert_eq!(overrides["providers"]["openai"]["api_key"], json!("sk-test"));
    }

    #[test]
    fn normalize_and_validate_provider_accepts_known_values_case_insensitive() {
        let provider =
            normalize_and_validate_provider(Some(" Anthropic ".to_string())).expect("provider");
        assert_eq!(provider.as_deref(), Some("anthropic"));
    }

    #[test]
    fn normalize_and_validate_provider_rejects_unknown_value() {
        let err = normalize_and_validate_provider(Some("openruter".to_string())).unwrap_err();
        assert!(err.to_string().contains("unsupported provider `openruter`"));
    }

    #[test]
    fn read_tool_json_parses_inline_payloads() {
        let payload = read_tool_json(r#"{"tool": "ls", "args": {"path": "src"}}"#).expect("json");
        assert_eq!(payload["tool"], "ls");
        assert_eq!(payload["args"]["path"], "src");
    }
}
