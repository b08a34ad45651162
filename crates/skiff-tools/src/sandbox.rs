use std::path::{Component, Path, PathBuf};

/// Resolves a tool-supplied relative path against the workspace root and
/// rejects anything that could land outside it. This runs in every
/// path-accepting tool before any filesystem or process side effect.
///
/// Rejected: absolute paths, any `..` component, and any joined path whose
/// normalized form does not keep the workspace root as a prefix.
pub fn resolve_sandboxed(workspace_root: &Path, raw: &str) -> Result<PathBuf, String> {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        return Err(format!("absolute paths are not allowed: `{raw}`"));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(format!("parent-directory segments are not allowed: `{raw}`"));
    }

    let joined = normalize(&workspace_root.join(candidate));
    let root = normalize(workspace_root);
    if !joined.starts_with(&root) {
        return Err(format!("path escapes the workspace: `{raw}`"));
    }
    Ok(joined)
}

/// Lexical normalization only. The target may not exist yet (write/edit
/// create files), so `canonicalize` is not an option here.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Relative path of `path` under `root`, for reporting matches and
/// listings in workspace-relative form.
pub fn relative_to_root(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
