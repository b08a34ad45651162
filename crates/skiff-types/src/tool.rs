use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolMetadata {
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_paths: Vec<String>,
    pub output_bytes: u64,
}

/// Outcome of one tool invocation. Expected failures (missing file, bad
/// path, validation errors) are `success: false`, never a thrown error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: ToolMetadata,
}

impl ToolResult {
    pub fn ok(payload: Value) -> Self {
        Self {
            success: true,
            payload,
            error: None,
            metadata: ToolMetadata::default(),
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: json!({}),
            error: Some(error.into()),
            metadata: ToolMetadata::default(),
        }
    }

    pub fn with_paths(mut self, paths: Vec<String>) -> Self {
        self.metadata.affected_paths = paths;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self { errors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_result_carries_error_and_empty_payload() {
        let result = ToolResult::fail("file not found");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("file not found"));
        assert_eq!(result.payload, json!({}));
    }

    #[test]
    fn validation_report_default_is_valid() {
        assert!(ValidationReport::default().is_valid());
        assert!(!ValidationReport::invalid(vec!["missing".to_string()]).is_valid());
    }
}
