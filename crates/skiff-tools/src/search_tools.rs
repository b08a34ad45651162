use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use regex::RegexBuilder;
use serde_json::{json, Value};
use tokio::fs;

use skiff_types::{ToolResult, ToolSchema};

use crate::sandbox::{relative_to_root, resolve_sandboxed};
use crate::{ExecutionContext, Tool};

const MAX_GREP_RESULTS: usize = 1_000;
const DEFAULT_GREP_RESULTS: usize = 100;
const DEFAULT_GREP_FILES: usize = 200;
const MAX_GLOB_RESULTS: usize = 1_000;
const DEFAULT_GLOB_RESULTS: usize = 100;

// Build output and VCS internals are never useful search targets; the
// walker's own hidden/gitignore filters handle the rest.
const SKIP_DIRS: &[&str] = &["target", "node_modules", "dist", "build", ".git", ".svn", ".hg"];

fn skippable_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| SKIP_DIRS.contains(&name))
        .unwrap_or(false)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, String> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|err| format!("invalid glob `{pattern}`: {err}"))?;
        builder.add(glob);
    }
    builder.build().map_err(|err| err.to_string())
}

fn modified_rfc3339(meta: &std::fs::Metadata) -> Option<String> {
    meta.modified()
        .ok()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
}

fn entry_kind(file_type: Option<std::fs::FileType>) -> &'static str {
    match file_type {
        Some(ft) if ft.is_dir() => "dir",
        Some(ft) if ft.is_symlink() => "symlink",
        _ => "file",
    }
}

pub struct LsTool;

#[async_trait]
impl Tool for LsTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "ls".to_string(),
            description: "List a workspace directory: directories first, then files, \
                          alphabetical within each group."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Workspace-relative directory, defaults to the root"},
                    "show_hidden": {"type": "boolean"},
                    "ignore": {"type": "array", "items": {"type": "string"}, "description": "Glob patterns to exclude"},
                    "detailed": {"type": "boolean", "description": "Include size and modified time"}
                }
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let raw_path = args["path"].as_str().unwrap_or(".");
        let path = match resolve_sandboxed(&ctx.workspace_root, raw_path) {
            Ok(p) => p,
            Err(err) => return Ok(ToolResult::fail(err)),
        };
        let show_hidden = args["show_hidden"].as_bool().unwrap_or(false);
        let detailed = args["detailed"].as_bool().unwrap_or(false);
        let ignore_patterns = args["ignore"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let ignore_set = match build_globset(&ignore_patterns) {
            Ok(set) => set,
            Err(err) => return Ok(ToolResult::fail(err)),
        };

        let mut read_dir = match fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(_) => return Ok(ToolResult::fail(format!("not a directory: {raw_path}"))),
        };

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !show_hidden && name.starts_with('.') {
                continue;
            }
            if !ignore_patterns.is_empty() && ignore_set.is_match(&name) {
                continue;
            }
            let file_type = entry.file_type().await.ok();
            let kind = entry_kind(file_type);
            let mut item = json!({"name": name, "type": kind});
            if detailed {
                if let Ok(meta) = entry.metadata().await {
                    item["size"] = json!(meta.len());
                    item["modified"] = json!(modified_rfc3339(&meta));
                }
            }
            if kind == "dir" {
                dirs.push(item);
            } else {
                files.push(item);
            }
        }

        let by_name = |a: &Value, b: &Value| {
            a["name"]
                .as_str()
                .unwrap_or("")
                .cmp(b["name"].as_str().unwrap_or(""))
        };
        dirs.sort_by(by_name);
        files.sort_by(by_name);
        dirs.extend(files);

        let count = dirs.len();
        Ok(ToolResult::ok(json!({
            "path": raw_path,
            "entries": dirs,
            "count": count
        })))
    }
}

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "grep".to_string(),
            description: "Regex search across workspace text files. Skips binaries, VCS \
                          internals and build output; results are capped and flagged when \
                          truncated."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Regular expression"},
                    "path": {"type": "string", "description": "Workspace-relative search root"},
                    "include": {"type": "string", "description": "Only search files matching this glob"},
                    "case_sensitive": {"type": "boolean", "description": "Defaults to true"},
                    "max_results": {"type": "integer"},
                    "max_files": {"type": "integer"}
                },
                "required": ["pattern"]
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let pattern = args["pattern"].as_str().unwrap_or("");
        let raw_root = args["path"].as_str().unwrap_or(".");
        let root = match resolve_sandboxed(&ctx.workspace_root, raw_root) {
            Ok(p) => p,
            Err(err) => return Ok(ToolResult::fail(err)),
        };

        let case_sensitive = args["case_sensitive"].as_bool().unwrap_or(true);
        let regex = match RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
        {
            Ok(re) => re,
            Err(err) => return Ok(ToolResult::fail(format!("invalid pattern: {err}"))),
        };

        let include = match args["include"].as_str() {
            Some(glob) => match build_globset(&[glob.to_string()]) {
                Ok(set) => Some(set),
                Err(err) => return Ok(ToolResult::fail(err)),
            },
            None => None,
        };

        let max_results = args["max_results"]
            .as_u64()
            .map(|v| (v as usize).clamp(1, MAX_GREP_RESULTS))
            .unwrap_or(DEFAULT_GREP_RESULTS);
        let max_files = args["max_files"]
            .as_u64()
            .map(|v| (v as usize).clamp(1, MAX_GREP_RESULTS))
            .unwrap_or(DEFAULT_GREP_FILES);

        let mut matches = Vec::new();
        let mut matched_files = 0usize;
        let mut truncated = false;

        let walker = WalkBuilder::new(&root)
            .filter_entry(|entry| !skippable_dir(entry.path()))
            .build();
        'files: for entry in walker.flatten() {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            let rel = relative_to_root(&root, path);
            if let Some(include) = &include {
                if !include.is_match(&rel) {
                    continue;
                }
            }
            let Ok(bytes) = fs::read(path).await else {
                continue;
            };
            if bytes.iter().take(1024).any(|&b| b == 0) {
                continue;
            }
            let content = String::from_utf8_lossy(&bytes);
            let display_path = relative_to_root(&ctx.workspace_root, path);
            let mut file_matched = false;
            for (idx, line) in content.lines().enumerate() {
                for found in regex.find_iter(line) {
                    file_matched = true;
                    matches.push(json!({
                        "file": display_path,
                        "line_number": idx + 1,
                        "line": line,
                        "match_start": found.start(),
                        "match_end": found.end()
                    }));
                    if matches.len() >= max_results {
                        truncated = true;
                        break 'files;
                    }
                }
            }
            if file_matched {
                matched_files += 1;
                if matched_files >= max_files {
                    truncated = true;
                    break;
                }
            }
        }

        let count = matches.len();
        Ok(ToolResult::ok(json!({
            "pattern": pattern,
            "matches": matches,
            "count": count,
            "truncated": truncated
        })))
    }
}

pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "glob".to_string(),
            description: "Find workspace files by glob pattern. Supports *, ?, ** and brace \
                          alternation."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string", "description": "Workspace-relative search root"},
                    "include_dirs": {"type": "boolean"},
                    "show_hidden": {"type": "boolean"},
                    "limit": {"type": "integer"},
                    "sort_by_modified": {"type": "boolean", "description": "Most recently modified first"}
                },
                "required": ["pattern"]
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let pattern = args["pattern"].as_str().unwrap_or("");
        if pattern.contains("..") || pattern.starts_with('/') {
            return Ok(ToolResult::fail(format!(
                "pattern denied by sandbox policy: `{pattern}`"
            )));
        }
        let raw_root = args["path"].as_str().unwrap_or(".");
        let root = match resolve_sandboxed(&ctx.workspace_root, raw_root) {
            Ok(p) => p,
            Err(err) => return Ok(ToolResult::fail(err)),
        };

        let matcher = match GlobBuilder::new(pattern).literal_separator(true).build() {
            Ok(glob) => glob.compile_matcher(),
            Err(err) => return Ok(ToolResult::fail(format!("invalid glob: {err}"))),
        };

        let include_dirs = args["include_dirs"].as_bool().unwrap_or(false);
        let show_hidden = args["show_hidden"].as_bool().unwrap_or(false);
        let sort_by_modified = args["sort_by_modified"].as_bool().unwrap_or(false);
        let limit = args["limit"]
            .as_u64()
            .map(|v| (v as usize).clamp(1, MAX_GLOB_RESULTS))
            .unwrap_or(DEFAULT_GLOB_RESULTS);

        struct Hit {
            entry: Value,
            path: String,
            modified: Option<std::time::SystemTime>,
        }

        let mut hits = Vec::new();
        let walker = WalkBuilder::new(&root)
            .hidden(!show_hidden)
            .filter_entry(|entry| !skippable_dir(entry.path()))
            .build();
        for entry in walker.flatten() {
            let path = entry.path();
            if path == root {
                continue;
            }
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir && !include_dirs {
                continue;
            }
            let rel = relative_to_root(&root, path);
            if !matcher.is_match(&rel) {
                continue;
            }
            let meta = entry.metadata().ok();
            let display_path = relative_to_root(&ctx.workspace_root, path);
            hits.push(Hit {
                entry: json!({
                    "path": display_path,
                    "type": if is_dir { "dir" } else { "file" },
                    "size": meta.as_ref().map(|m| m.len()),
                    "modified": meta.as_ref().and_then(modified_rfc3339)
                }),
                path: rel,
                modified: meta.and_then(|m| m.modified().ok()),
            });
        }

        if sort_by_modified {
            hits.sort_by(|a, b| b.modified.cmp(&a.modified));
        } else {
            hits.sort_by(|a, b| a.path.cmp(&b.path));
        }

        let truncated = hits.len() > limit;
        hits.truncate(limit);
        let entries = hits.into_iter().map(|h| h.entry).collect::<Vec<_>>();
        let count = entries.len();
        Ok(ToolResult::ok(json!({
            "pattern": pattern,
            "entries": entries,
            "count": count,
            "truncated": truncated
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx(dir: &TempDir) -> ExecutionContext {
        ExecutionContext::new(dir.path(), "test-session")
    }

    fn seed(dir: &TempDir, path: &str, content: &str) {
        let full = dir.path().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).expect("mkdir");
        std::fs::write(full, content).expect("write");
    }

    async fn run(tool: &dyn Tool, args: Value, ctx: &ExecutionContext) -> ToolResult {
        tool.execute(args, ctx).await.expect("tool execute")
    }

    #[tokio::test]
    async fn ls_sorts_directories_before_files() {
        let dir = TempDir::new().expect("tempdir");
        seed(&dir, "zebra.txt", "");
        seed(&dir, "alpha/inner.txt", "");
        seed(&dir, "beta/inner.txt", "");
        seed(&dir, "apple.txt", "");

        let result = run(&LsTool, json!({}), &ctx(&dir)).await;
        assert!(result.success);
        let names = result.payload["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["alpha", "beta", "apple.txt", "zebra.txt"]);
    }

    #[tokio::test]
    async fn ls_hides_dotfiles_unless_asked() {
        let dir = TempDir::new().expect("tempdir");
        seed(&dir, ".secret", "");
        seed(&dir, "visible.txt", "");

        let default = run(&LsTool, json!({}), &ctx(&dir)).await;
        assert_eq!(default.payload["count"], 1);

        let all = run(&LsTool, json!({"show_hidden": true}), &ctx(&dir)).await;
        assert_eq!(all.payload["count"], 2);
    }

    #[tokio::test]
    async fn ls_applies_ignore_globs_and_detailed_mode() {
        let dir = TempDir::new().expect("tempdir");
        seed(&dir, "keep.rs", "fn main() {}");
        seed(&dir, "skip.log", "");

        let result = run(
            &LsTool,
            json!({"ignore": ["*.log"], "detailed": true}),
            &ctx(&dir),
        )
        .await;
        let entries = result.payload["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["name"], "keep.rs");
        assert!(entries[0]["size"].is_u64());
    }

    #[tokio::test]
    async fn ls_rejects_escaping_path() {
        let dir = TempDir::new().expect("tempdir");
        let result = run(&LsTool, json!({"path": "../"}), &ctx(&dir)).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn grep_reports_line_numbers_and_spans() {
        let dir = TempDir::new().expect("tempdir");
        seed(&dir, "src/lib.rs", "fn alpha() {}\nfn beta() {}\n");

        let result = run(&GrepTool, json!({"pattern": "fn beta"}), &ctx(&dir)).await;
        assert!(result.success);
        assert_eq!(result.payload["count"], 1);
        let hit = &result.payload["matches"][0];
        assert_eq!(hit["file"], "src/lib.rs");
        assert_eq!(hit["line_number"], 2);
        assert_eq!(hit["match_start"], 0);
        assert_eq!(hit["match_end"], 7);
    }

    #[tokio::test]
    async fn grep_caps_results_and_flags_truncation() {
        let dir = TempDir::new().expect("tempdir");
        let body = (0..20).map(|_| "needle\n").collect::<String>();
        seed(&dir, "hay.txt", &body);

        let result = run(
            &GrepTool,
            json!({"pattern": "needle", "max_results": 5}),
            &ctx(&dir),
        )
        .await;
        assert_eq!(result.payload["count"], 5);
        assert_eq!(result.payload["truncated"], true);
    }

    #[tokio::test]
    async fn grep_respects_include_glob_and_case_flag() {
        let dir = TempDir::new().expect("tempdir");
        seed(&dir, "a.rs", "Needle here");
        seed(&dir, "b.txt", "Needle there");

        let result = run(
            &GrepTool,
            json!({"pattern": "needle", "include": "**/*.rs", "case_sensitive": false}),
            &ctx(&dir),
        )
        .await;
        assert_eq!(result.payload["count"], 1);
        assert_eq!(result.payload["matches"][0]["file"], "a.rs");

        let sensitive = run(
            &GrepTool,
            json!({"pattern": "needle", "include": "**/*.rs"}),
            &ctx(&dir),
        )
        .await;
        assert_eq!(sensitive.payload["count"], 0);
    }

    #[tokio::test]
    async fn grep_skips_binary_files() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("bin.dat"), [b'n', 0u8, b'e']).expect("write");
        seed(&dir, "text.txt", "needle");

        let result = run(&GrepTool, json!({"pattern": "n"}), &ctx(&dir)).await;
        let files = result.payload["matches"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["file"].as_str().unwrap())
            .collect::<Vec<_>>();
        assert!(files.iter().all(|f| *f == "text.txt"));
    }

    #[tokio::test]
    async fn grep_rejects_escaping_search_root() {
        let dir = TempDir::new().expect("tempdir");
        for root in ["../", "/etc"] {
            let result = run(
                &GrepTool,
                json!({"pattern": "x", "path": root}),
                &ctx(&dir),
            )
            .await;
            assert!(!result.success, "root {root} accepted");
        }
    }

    #[tokio::test]
    async fn glob_star_star_matches_extension_exactly() {
        let dir = TempDir::new().expect("tempdir");
        seed(&dir, "src/index.ts", "");
        seed(&dir, "src/components/Button.tsx", "");

        let result = run(&GlobTool, json!({"pattern": "**/*.ts"}), &ctx(&dir)).await;
        assert!(result.success);
        let paths = result.payload["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["path"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["src/index.ts"]);
    }

    #[tokio::test]
    async fn glob_supports_brace_alternation() {
        let dir = TempDir::new().expect("tempdir");
        seed(&dir, "a.rs", "");
        seed(&dir, "b.toml", "");
        seed(&dir, "c.md", "");

        let result = run(&GlobTool, json!({"pattern": "*.{rs,toml}"}), &ctx(&dir)).await;
        let paths = result.payload["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["path"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["a.rs", "b.toml"]);
    }

    #[tokio::test]
    async fn glob_rejects_traversal_patterns() {
        let dir = TempDir::new().expect("tempdir");
        for pattern in ["../*", "/etc/*"] {
            let result = run(&GlobTool, json!({"pattern": pattern}), &ctx(&dir)).await;
            assert!(!result.success, "pattern {pattern} accepted");
        }
    }

    #[tokio::test]
    async fn glob_limit_truncates_and_flags() {
        let dir = TempDir::new().expect("tempdir");
        for i in 0..5 {
            seed(&dir, &format!("f{i}.txt"), "");
        }
        let result = run(
            &GlobTool,
            json!({"pattern": "*.txt", "limit": 2}),
            &ctx(&dir),
        )
        .await;
        assert_eq!(result.payload["count"], 2);
        assert_eq!(result.payload["truncated"], true);
    }
}
