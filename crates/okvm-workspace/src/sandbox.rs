//! Path resolution confined to a workspace root.
//!
//! Every path a tool hands us goes through [`resolve`] before touching the
//! filesystem. The check is lexical first (so `..` can never climb above the
//! root) and then physical: the deepest ancestor that already exists is
//! canonicalised and must still live under the canonical root, which stops
//! symlinks planted inside the tree from pointing out of it.

use okvm_core::{OkvmError, OkvmResult};
use std::path::{Path, PathBuf};

/// Resolves `raw` against `root`, rejecting anything that escapes it.
///
/// Absolute paths are anchored at the root, so `/notes.txt` and
/// `notes.txt` name the same file. Backslashes are treated as separators.
/// No component may be named `.git` in any case, since snapshots could not
/// version it.
pub fn resolve(root: &Path, raw: &str) -> OkvmResult<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(OkvmError::ToolExecution("path must not be empty".into()));
    }
    if trimmed.contains('\0') {
        return Err(OkvmError::SandboxViolation(format!(
            "path '{}' contains a NUL byte",
            trimmed.escape_debug()
        )));
    }

    let normalized = trimmed.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for component in normalized.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    tracing::warn!(path = %trimmed, "Path escapes workspace root");
                    return Err(OkvmError::SandboxViolation(format!(
                        "'{trimmed}' resolves outside the workspace"
                    )));
                }
            }
            name if name.eq_ignore_ascii_case(".git") => {
                tracing::warn!(path = %trimmed, "Path names a reserved .git entry");
                return Err(OkvmError::SandboxViolation(format!(
                    "'{trimmed}' uses the reserved name '.git'"
                )));
            }
            name => parts.push(name),
        }
    }

    let canonical_root = root.canonicalize()?;
    let mut existing = canonical_root.clone();
    let mut remainder = parts.iter();
    // Walk down while the path exists so symlinks are resolved as we go.
    for part in remainder.by_ref() {
        let next = existing.join(part);
        match std::fs::symlink_metadata(&next) {
            Ok(_) => {
                let canonical = next.canonicalize().map_err(|_| {
                    OkvmError::SandboxViolation(format!("'{trimmed}' points at a dangling link"))
                })?;
                if !canonical.starts_with(&canonical_root) {
                    tracing::warn!(path = %trimmed, "Symlink escapes workspace root");
                    return Err(OkvmError::SandboxViolation(format!(
                        "'{trimmed}' resolves outside the workspace"
                    )));
                }
                existing = canonical;
            }
            Err(_) => {
                existing = next;
                break;
            }
        }
    }
    for part in remainder {
        existing.push(part);
    }
    Ok(existing)
}

/// Renders a resolved path as a root-relative, `/`-separated string.
///
/// The root itself renders as `"."`.
pub fn relative_display(root: &Path, path: &Path) -> String {
    let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let relative = path
        .strip_prefix(&canonical_root)
        .or_else(|_| path.strip_prefix(root))
        .unwrap_or(path);
    let rendered: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if rendered.is_empty() {
        ".".to_string()
    } else {
        rendered.join("/")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn root() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_relative_path_stays_inside() {
        let dir = root();
        let p = resolve(dir.path(), "sub/notes.txt").unwrap();
        assert!(p.starts_with(dir.path().canonicalize().unwrap()));
        assert!(p.ends_with("sub/notes.txt"));
    }

    #[test]
    fn test_absolute_path_is_anchored() {
        let dir = root();
        let a = resolve(dir.path(), "/notes.txt").unwrap();
        let b = resolve(dir.path(), "notes.txt").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parent_escape_rejected() {
        let dir = root();
        let err = resolve(dir.path(), "../../etc/passwd").unwrap_err();
        assert!(matches!(err, OkvmError::SandboxViolation(_)));
        let err = resolve(dir.path(), "a/../../b").unwrap_err();
        assert!(matches!(err, OkvmError::SandboxViolation(_)));
    }

    #[test]
    fn test_inner_parent_is_fine() {
        let dir = root();
        let p = resolve(dir.path(), "a/b/../c.txt").unwrap();
        assert!(p.ends_with("a/c.txt"));
    }

    #[test]
    fn test_backslashes_are_separators() {
        let dir = root();
        let err = resolve(dir.path(), "..\\..\\secret").unwrap_err();
        assert!(matches!(err, OkvmError::SandboxViolation(_)));
        let p = resolve(dir.path(), "docs\\readme.md").unwrap();
        assert!(p.ends_with("docs/readme.md"));
    }

    #[test]
    fn test_empty_path_rejected() {
        let dir = root();
        assert!(resolve(dir.path(), "   ").is_err());
    }

    #[test]
    fn test_dot_is_root() {
        let dir = root();
        let p = resolve(dir.path(), ".").unwrap();
        assert_eq!(p, dir.path().canonicalize().unwrap());
        assert_eq!(relative_display(dir.path(), &p), ".");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let dir = root();
        let outside = root();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let err = resolve(dir.path(), "link/stolen.txt").unwrap_err();
        assert!(matches!(err, OkvmError::SandboxViolation(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_root_allowed() {
        let dir = root();
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("alias")).unwrap();
        let p = resolve(dir.path(), "alias/file.txt").unwrap();
        assert!(p.ends_with("real/file.txt"));
    }

    #[test]
    fn test_git_component_rejected_in_any_case() {
        let dir = root();
        for raw in [".git/notes.txt", "sub/.git", "a/.GIT/config", "x\\.Git\\y"] {
            let err = resolve(dir.path(), raw).unwrap_err();
            assert!(matches!(err, OkvmError::SandboxViolation(_)), "{raw}");
        }
        assert!(resolve(dir.path(), ".gitignore").is_ok());
        assert!(resolve(dir.path(), "notes.git").is_ok());
    }

    #[test]
    fn test_relative_display_uses_forward_slashes() {
        let dir = root();
        let p = resolve(dir.path(), "a/b/c.txt").unwrap();
        assert_eq!(relative_display(dir.path(), &p), "a/b/c.txt");
    }
}
