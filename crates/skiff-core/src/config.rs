use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::fs;

use skiff_providers::AppConfig;

// Env var carrying each provider's key, applied as a layer below CLI
// overrides so an explicit flag still wins.
const ENV_API_KEYS: &[(&str, &str)] = &[
    ("openai", "OPENAI_API_KEY"),
    ("openrouter", "OPENROUTER_API_KEY"),
    ("anthropic", "ANTHROPIC_API_KEY"),
    ("groq", "GROQ_API_KEY"),
    ("mistral", "MISTRAL_API_KEY"),
    ("together", "TOGETHER_API_KEY"),
];

/// Layered configuration: config file, then environment, then CLI
/// overrides, later layers winning key-by-key.
#[derive(Clone)]
pub struct ConfigStore {
    merged: Value,
}

impl ConfigStore {
    pub async fn load(
        path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file_layer = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str::<Value>(&raw)
                .map_err(|err| anyhow::anyhow!("invalid config file {}: {err}", path.display()))?,
            Err(_) => empty_object(),
        };

        let mut merged = empty_object();
        for layer in [
            file_layer,
            env_layer(),
            cli_overrides.unwrap_or_else(empty_object),
        ] {
            merge_values(&mut merged, layer);
        }

        Ok(Self { merged })
    }

    pub fn get(&self) -> AppConfig {
        serde_json::from_value(self.merged.clone()).unwrap_or_default()
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn env_layer() -> Value {
    let mut providers = Map::new();
    for (provider_id, var) in ENV_API_KEYS {
        let Ok(key) = std::env::var(var) else {
            continue;
        };
        if key.trim().is_empty() {
            continue;
        }
        providers.insert(
            (*provider_id).to_string(),
            serde_json::json!({"api_key": key}),
        );
    }
    if providers.is_empty() {
        empty_object()
    } else {
        serde_json::json!({"providers": providers})
    }
}

/// Deep merge: objects merge key-by-key, everything else is replaced.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay) => {
            if !overlay.is_null() {
                *base_slot = overlay;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_is_deep_and_later_layers_win() {
        let mut base = json!({
            "default_provider": "openai",
            "providers": {
                "openai": {"api_key": "file-key", "default_model": "gpt-4o-mini"}
            }
        });
        merge_values(
            &mut base,
            json!({
                "providers": {
                    "openai": {"api_key": "cli-key"},
                    "anthropic": {"api_key": "ant-key"}
                }
            }),
        );
        assert_eq!(base["default_provider"], "openai");
        assert_eq!(base["providers"]["openai"]["api_key"], "cli-key");
        assert_eq!(base["providers"]["openai"]["default_model"], "gpt-4o-mini");
        assert_eq!(base["providers"]["anthropic"]["api_key"], "ant-key");
    }

    #[test]
    fn null_overlay_values_do_not_erase() {
        let mut base = json!({"default_provider": "openai"});
        merge_values(&mut base, json!({"default_provider": null}));
        assert_eq!(base["default_provider"], "openai");
    }

    #[tokio::test]
    async fn load_tolerates_missing_file_and_applies_cli_layer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::load(
            dir.path().join("config.json"),
            Some(json!({
                "default_provider": "openrouter",
                "providers": {"openrouter": {"api_key": "sk-or"}}
            })),
        )
        .await
        .expect("load");
        let config = store.get();
        assert_eq!(config.default_provider.as_deref(), Some("openrouter"));
        assert_eq!(
            config.providers["openrouter"].api_key.as_deref(),
            Some("sk-or")
        );
    }

    #[tokio::test]
    async fn load_reads_file_layer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"default_provider":"ollama","providers":{"ollama":{"default_model":"llama3.1:8b"}}}"#,
        )
        .expect("write");
        let store = ConfigStore::load(&path, None).await.expect("load");
        let config = store.get();
        assert_eq!(config.default_provider.as_deref(), Some("ollama"));
    }

    #[tokio::test]
    async fn invalid_config_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(ConfigStore::load(&path, None).await.is_err());
    }
}
