use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::fs;

use skiff_types::{ToolResult, ToolSchema};

use crate::sandbox::resolve_sandboxed;
use crate::{ExecutionContext, Tool};

const MAX_READ_BYTES: u64 = 5 * 1024 * 1024;
const MAX_READ_LINES: usize = 2_000;
const MAX_LINE_CHARS: usize = 2_000;

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "webp", "ico", "pdf", "zip", "gz", "tar", "bz2", "xz",
    "7z", "exe", "dll", "so", "dylib", "a", "o", "class", "wasm", "woff", "woff2", "ttf", "otf",
    "mp3", "mp4", "avi", "mov", "sqlite", "db",
];

fn looks_binary(path: &std::path::Path, bytes: &[u8]) -> bool {
    if let Some(ext) = path.extension().and_then(|v| v.to_str()) {
        if BINARY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            return true;
        }
    }
    bytes.iter().take(8192).any(|&b| b == 0)
}

fn modified_rfc3339(meta: &std::fs::Metadata) -> Option<String> {
    meta.modified()
        .ok()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
}

pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "read".to_string(),
            description: "Read a file from the workspace. Supports 1-based line-range reads \
                          for text files; binary files return metadata instead of content."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string", "description": "Workspace-relative path"},
                    "start_line": {"type": "integer", "description": "1-based first line"},
                    "line_count": {"type": "integer", "description": "Maximum lines to return"},
                    "encoding": {"type": "string", "description": "Text encoding label, utf-8 assumed"}
                },
                "required": ["file_path"]
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let raw_path = args["file_path"].as_str().unwrap_or("");
        let path = match resolve_sandboxed(&ctx.workspace_root, raw_path) {
            Ok(p) => p,
            Err(err) => return Ok(ToolResult::fail(err)),
        };

        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(_) => return Ok(ToolResult::fail(format!("file not found: {raw_path}"))),
        };
        if meta.is_dir() {
            return Ok(ToolResult::fail(format!("not a file: {raw_path}")));
        }
        if meta.len() > MAX_READ_BYTES {
            return Ok(ToolResult::fail(format!(
                "file too large: {} bytes (limit {MAX_READ_BYTES})",
                meta.len()
            )));
        }

        let bytes = fs::read(&path).await?;
        if looks_binary(&path, &bytes) {
            let payload = json!({
                "kind": "binary",
                "path": raw_path,
                "size_bytes": meta.len(),
                "extension": path.extension().and_then(|v| v.to_str()),
                "modified": modified_rfc3339(&meta),
                "note": "binary file; content not returned"
            });
            return Ok(ToolResult::ok(payload).with_paths(vec![raw_path.to_string()]));
        }

        let text = String::from_utf8_lossy(&bytes);
        let lines = text.lines().collect::<Vec<_>>();
        let total_lines = lines.len();

        let start = args["start_line"].as_u64().map(|v| v as usize).unwrap_or(1);
        if start == 0 {
            return Ok(ToolResult::fail("start_line is 1-based".to_string()));
        }
        if start > total_lines && total_lines > 0 {
            return Ok(ToolResult::fail(format!(
                "start_line {start} beyond end of file ({total_lines} lines)"
            )));
        }
        let requested = args["line_count"]
            .as_u64()
            .map(|v| (v as usize).clamp(1, MAX_READ_LINES))
            .unwrap_or(MAX_READ_LINES);

        let mut line_truncated = false;
        let selected = lines
            .iter()
            .skip(start - 1)
            .take(requested)
            .map(|line| {
                if line.chars().count() > MAX_LINE_CHARS {
                    line_truncated = true;
                    let cut = line.chars().take(MAX_LINE_CHARS).collect::<String>();
                    format!("{cut}... [line truncated]")
                } else {
                    (*line).to_string()
                }
            })
            .collect::<Vec<_>>();

        let returned = selected.len();
        let range_truncated = start - 1 + returned < total_lines;
        let mut content = selected.join("\n");
        if !range_truncated && !line_truncated && text.ends_with('\n') {
            content.push('\n');
        }
        if range_truncated {
            content.push_str(&format!(
                "\n[truncated: showing lines {}-{} of {}]",
                start,
                start + returned.saturating_sub(1),
                total_lines
            ));
        }

        let payload = json!({
            "kind": "text",
            "path": raw_path,
            "content": content,
            "start_line": start,
            "lines_returned": returned,
            "total_lines": total_lines,
            "truncated": range_truncated || line_truncated,
            "encoding": args["encoding"].as_str().unwrap_or("utf-8")
        });
        Ok(ToolResult::ok(payload).with_paths(vec![raw_path.to_string()]))
    }
}

pub struct WriteTool;

#[async_trait]
impl Tool for WriteTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "write".to_string(),
            description: "Write content to a workspace file, creating parent directories and \
                          overwriting any existing file."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string", "description": "Workspace-relative path"},
                    "content": {"type": "string"}
                },
                "required": ["file_path", "content"]
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let raw_path = args["file_path"].as_str().unwrap_or("");
        let content = args["content"].as_str().unwrap_or("");
        let path = match resolve_sandboxed(&ctx.workspace_root, raw_path) {
            Ok(p) => p,
            Err(err) => return Ok(ToolResult::fail(err)),
        };

        if path.is_dir() {
            return Ok(ToolResult::fail(format!(
                "cannot write: `{raw_path}` is a directory"
            )));
        }
        let is_new_file = !path.exists();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, content).await?;

        let payload = json!({
            "path": raw_path,
            "is_new_file": is_new_file,
            "bytes_written": content.len()
        });
        Ok(ToolResult::ok(payload).with_paths(vec![raw_path.to_string()]))
    }
}

pub struct EditTool;

#[async_trait]
impl Tool for EditTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "edit".to_string(),
            description: "Replace every occurrence of an exact substring in a file. Fails when \
                          the substring is absent or the occurrence count does not match \
                          expected_replacements. An empty old_string creates a new file."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string", "description": "Workspace-relative path"},
                    "old_string": {"type": "string"},
                    "new_string": {"type": "string"},
                    "expected_replacements": {"type": "integer"}
                },
                "required": ["file_path", "old_string", "new_string"]
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let raw_path = args["file_path"].as_str().unwrap_or("");
        let old = args["old_string"].as_str().unwrap_or("");
        let new = args["new_string"].as_str().unwrap_or("");
        let path = match resolve_sandboxed(&ctx.workspace_root, raw_path) {
            Ok(p) => p,
            Err(err) => return Ok(ToolResult::fail(err)),
        };

        if old.is_empty() {
            if path.exists() {
                return Ok(ToolResult::fail(
                    "old_string is empty but the file already exists; use a non-empty \
                     old_string or the write tool",
                ));
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&path, new).await?;
            let payload = json!({"path": raw_path, "created": true, "replacements": 0});
            return Ok(ToolResult::ok(payload).with_paths(vec![raw_path.to_string()]));
        }

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(_) => return Ok(ToolResult::fail(format!("file not found: {raw_path}"))),
        };

        let count = content.matches(old).count();
        if count == 0 {
            return Ok(ToolResult::fail(format!(
                "old_string not found in {raw_path}"
            )));
        }
        if let Some(expected) = args["expected_replacements"].as_u64() {
            if count as u64 != expected {
                return Ok(ToolResult::fail(format!(
                    "expected {expected} replacements but found {count}"
                )));
            }
        }

        fs::write(&path, content.replace(old, new)).await?;
        let payload = json!({"path": raw_path, "created": false, "replacements": count});
        Ok(ToolResult::ok(payload).with_paths(vec![raw_path.to_string()]))
    }
}

pub struct MultiEditTool;

#[async_trait]
impl Tool for MultiEditTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "multi_edit".to_string(),
            description: "Apply an ordered list of substring edits to one file. fail_fast \
                          (default) discards everything on the first failure; otherwise the \
                          edits that succeed are kept and per-edit outcomes reported."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string", "description": "Workspace-relative path"},
                    "edits": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "old_string": {"type": "string"},
                                "new_string": {"type": "string"},
                                "expected_replacements": {"type": "integer"}
                            },
                            "required": ["old_string", "new_string"]
                        }
                    },
                    "fail_fast": {"type": "boolean"}
                },
                "required": ["file_path", "edits"]
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let raw_path = args["file_path"].as_str().unwrap_or("");
        let path = match resolve_sandboxed(&ctx.workspace_root, raw_path) {
            Ok(p) => p,
            Err(err) => return Ok(ToolResult::fail(err)),
        };
        let edits = args["edits"].as_array().cloned().unwrap_or_default();
        if edits.is_empty() {
            return Ok(ToolResult::fail("edits must not be empty"));
        }
        let fail_fast = args["fail_fast"].as_bool().unwrap_or(true);

        let original = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(_) => return Ok(ToolResult::fail(format!("file not found: {raw_path}"))),
        };

        let mut buffer = original.clone();
        let mut results = Vec::new();
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        for (index, edit) in edits.iter().enumerate() {
            let old = edit["old_string"].as_str().unwrap_or("");
            let new = edit["new_string"].as_str().unwrap_or("");

            let failure = if old.is_empty() {
                Some("old_string must not be empty".to_string())
            } else {
                let count = buffer.matches(old).count();
                if count == 0 {
                    Some("old_string not found".to_string())
                } else if let Some(expected) = edit["expected_replacements"].as_u64() {
                    if count as u64 != expected {
                        Some(format!("expected {expected} replacements but found {count}"))
                    } else {
                        None
                    }
                } else {
                    None
                }
            };

            match failure {
                None => {
                    let count = buffer.matches(old).count();
                    buffer = buffer.replace(old, new);
                    succeeded += 1;
                    results.push(json!({"index": index, "success": true, "replacements": count}));
                }
                Some(err) => {
                    failed += 1;
                    results.push(json!({"index": index, "success": false, "error": err}));
                    if fail_fast {
                        return Ok(ToolResult::fail(format!(
                            "edit {index} failed: {}; no changes applied",
                            results
                                .last()
                                .and_then(|r| r["error"].as_str())
                                .unwrap_or("unknown")
                        )));
                    }
                }
            }
        }

        // Only touch the file when something actually changed.
        if succeeded > 0 {
            fs::write(&path, &buffer).await?;
        }

        let payload = json!({
            "path": raw_path,
            "edits_successful": succeeded,
            "edits_failed": failed,
            "results": results
        });
        let mut result = ToolResult::ok(payload).with_paths(vec![raw_path.to_string()]);
        if succeeded == 0 {
            result.success = false;
            result.error = Some("no edits could be applied".to_string());
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx(dir: &TempDir) -> ExecutionContext {
        ExecutionContext::new(dir.path(), "test-session")
    }

    async fn run(tool: &dyn Tool, args: Value, ctx: &ExecutionContext) -> ToolResult {
        tool.execute(args, ctx).await.expect("tool execute")
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = ctx(&dir);

        let written = run(
            &WriteTool,
            json!({"file_path": "a.txt", "content": "hello"}),
            &ctx,
        )
        .await;
        assert!(written.success);
        assert_eq!(written.payload["is_new_file"], true);

        let read = run(&ReadTool, json!({"file_path": "a.txt"}), &ctx).await;
        assert!(read.success);
        assert_eq!(read.payload["content"], "hello");
    }

    #[tokio::test]
    async fn full_range_read_preserves_trailing_newline() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = ctx(&dir);
        run(
            &WriteTool,
            json!({"file_path": "nl.txt", "content": "alpha\nbeta\n"}),
            &ctx,
        )
        .await;
        let read = run(&ReadTool, json!({"file_path": "nl.txt"}), &ctx).await;
        assert_eq!(read.payload["content"], "alpha\nbeta\n");
    }

    #[tokio::test]
    async fn write_creates_parent_directories_and_reports_overwrite() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = ctx(&dir);

        let first = run(
            &WriteTool,
            json!({"file_path": "nested/deep/file.txt", "content": "one"}),
            &ctx,
        )
        .await;
        assert!(first.success);
        assert_eq!(first.payload["is_new_file"], true);

        let second = run(
            &WriteTool,
            json!({"file_path": "nested/deep/file.txt", "content": "two"}),
            &ctx,
        )
        .await;
        assert_eq!(second.payload["is_new_file"], false);
    }

    #[tokio::test]
    async fn write_rejects_existing_directory_target() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::create_dir(dir.path().join("subdir")).expect("mkdir");
        let result = run(
            &WriteTool,
            json!({"file_path": "subdir", "content": "x"}),
            &ctx(&dir),
        )
        .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or("").contains("directory"));
    }

    #[tokio::test]
    async fn path_escapes_fail_for_every_fs_tool() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = ctx(&dir);
        let tools: Vec<(&dyn Tool, Value)> = vec![
            (&ReadTool, json!({"file_path": "../escape.txt"})),
            (&WriteTool, json!({"file_path": "/etc/passwd", "content": "x"})),
            (
                &EditTool,
                json!({"file_path": "../e.txt", "old_string": "a", "new_string": "b"}),
            ),
            (
                &MultiEditTool,
                json!({"file_path": "../e.txt", "edits": [{"old_string": "a", "new_string": "b"}]}),
            ),
        ];
        for (tool, args) in tools {
            let result = run(tool, args, &ctx).await;
            assert!(!result.success, "tool {} accepted escape", tool.schema().name);
        }
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn read_line_range_is_one_based_and_truncation_flagged() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = ctx(&dir);
        let body = (1..=10).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        run(&WriteTool, json!({"file_path": "n.txt", "content": body}), &ctx).await;

        let read = run(
            &ReadTool,
            json!({"file_path": "n.txt", "start_line": 3, "line_count": 2}),
            &ctx,
        )
        .await;
        assert!(read.success);
        let content = read.payload["content"].as_str().unwrap();
        assert!(content.starts_with("line 3\nline 4"));
        assert_eq!(read.payload["truncated"], true);
        assert_eq!(read.payload["lines_returned"], 2);
        assert_eq!(read.payload["total_lines"], 10);
    }

    #[tokio::test]
    async fn read_reports_binary_files_without_content() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("blob.png"), [0u8, 159, 146, 150]).expect("write");
        let read = run(&ReadTool, json!({"file_path": "blob.png"}), &ctx(&dir)).await;
        assert!(read.success);
        assert_eq!(read.payload["kind"], "binary");
        assert!(read.payload.get("content").is_none());
    }

    #[tokio::test]
    async fn read_missing_file_fails_cleanly() {
        let dir = TempDir::new().expect("tempdir");
        let read = run(&ReadTool, json!({"file_path": "nope.txt"}), &ctx(&dir)).await;
        assert!(!read.success);
        assert!(read.error.as_deref().unwrap_or("").contains("not found"));
    }

    #[tokio::test]
    async fn edit_replaces_and_second_application_fails() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = ctx(&dir);
        run(&WriteTool, json!({"file_path": "a.txt", "content": "hello"}), &ctx).await;

        let args = json!({
            "file_path": "a.txt",
            "old_string": "hello",
            "new_string": "world",
            "expected_replacements": 1
        });
        let first = run(&EditTool, args.clone(), &ctx).await;
        assert!(first.success);
        assert_eq!(first.payload["replacements"], 1);

        let read = run(&ReadTool, json!({"file_path": "a.txt"}), &ctx).await;
        assert_eq!(read.payload["content"], "world");

        // old_string is gone now, so the same edit must fail.
        let second = run(&EditTool, args, &ctx).await;
        assert!(!second.success);
        assert!(second.error.as_deref().unwrap_or("").contains("not found"));
    }

    #[tokio::test]
    async fn edit_expected_count_mismatch_fails() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = ctx(&dir);
        run(&WriteTool, json!({"file_path": "a.txt", "content": "x x x"}), &ctx).await;
        let result = run(
            &EditTool,
            json!({
                "file_path": "a.txt",
                "old_string": "x",
                "new_string": "y",
                "expected_replacements": 2
            }),
            &ctx,
        )
        .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or("").contains("found 3"));
    }

    #[tokio::test]
    async fn edit_empty_old_string_creates_new_file_but_not_over_existing() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = ctx(&dir);

        let created = run(
            &EditTool,
            json!({"file_path": "fresh.txt", "old_string": "", "new_string": "seed"}),
            &ctx,
        )
        .await;
        assert!(created.success);
        assert_eq!(created.payload["created"], true);

        let clobber = run(
            &EditTool,
            json!({"file_path": "fresh.txt", "old_string": "", "new_string": "again"}),
            &ctx,
        )
        .await;
        assert!(!clobber.success);
    }

    #[tokio::test]
    async fn multi_edit_best_effort_applies_partial_set() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = ctx(&dir);
        run(&WriteTool, json!({"file_path": "m.txt", "content": "a and more"}), &ctx).await;

        let result = run(
            &MultiEditTool,
            json!({
                "file_path": "m.txt",
                "fail_fast": false,
                "edits": [
                    {"old_string": "a", "new_string": "b"},
                    {"old_string": "nonexistent", "new_string": "x"}
                ]
            }),
            &ctx,
        )
        .await;
        assert!(result.success);
        assert_eq!(result.payload["edits_successful"], 1);
        assert_eq!(result.payload["edits_failed"], 1);

        let read = run(&ReadTool, json!({"file_path": "m.txt"}), &ctx).await;
        assert_eq!(read.payload["content"], "b bnd more");
    }

    #[tokio::test]
    async fn multi_edit_fail_fast_discards_all_changes() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = ctx(&dir);
        run(&WriteTool, json!({"file_path": "m.txt", "content": "alpha beta"}), &ctx).await;

        let result = run(
            &MultiEditTool,
            json!({
                "file_path": "m.txt",
                "edits": [
                    {"old_string": "alpha", "new_string": "gamma"},
                    {"old_string": "missing", "new_string": "x"}
                ]
            }),
            &ctx,
        )
        .await;
        assert!(!result.success);

        let read = run(&ReadTool, json!({"file_path": "m.txt"}), &ctx).await;
        assert_eq!(read.payload["content"], "alpha beta");
    }

    #[tokio::test]
    async fn multi_edit_sequential_edits_see_previous_results() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = ctx(&dir);
        run(&WriteTool, json!({"file_path": "seq.txt", "content": "one"}), &ctx).await;

        let result = run(
            &MultiEditTool,
            json!({
                "file_path": "seq.txt",
                "edits": [
                    {"old_string": "one", "new_string": "two"},
                    {"old_string": "two", "new_string": "three", "expected_replacements": 1}
                ]
            }),
            &ctx,
        )
        .await;
        assert!(result.success);
        assert_eq!(result.payload["edits_successful"], 2);

        let read = run(&ReadTool, json!({"file_path": "seq.txt"}), &ctx).await;
        assert_eq!(read.payload["content"], "three");
    }
}
