use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which version-control backend workspaces get.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotBackend {
    /// Embedded git repository kept beside the tree.
    #[default]
    Git,
    /// No version control; snapshot operations fail with `SnapshotsDisabled`.
    Disabled,
}

/// Settings for the [`WorkspaceManager`](crate::WorkspaceManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_quota_bytes")]
    pub default_quota_bytes: u64,
    /// Upper bound on live workspaces; 0 means unlimited.
    #[serde(default)]
    pub max_workspaces: usize,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default)]
    pub snapshots: SnapshotBackend,
    /// Keep workspaces (and their snapshot log) across process restarts.
    #[serde(default)]
    pub durable: bool,
    #[serde(default = "default_snapshot_list_limit")]
    pub snapshot_list_limit: usize,
}

fn default_base_dir() -> PathBuf {
    std::env::temp_dir().join("okvm-workspaces")
}

fn default_quota_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_operation_timeout_secs() -> u64 {
    30
}

fn default_snapshot_list_limit() -> usize {
    20
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            default_quota_bytes: default_quota_bytes(),
            max_workspaces: 0,
            operation_timeout_secs: default_operation_timeout_secs(),
            snapshots: SnapshotBackend::default(),
            durable: false,
            snapshot_list_limit: default_snapshot_list_limit(),
        }
    }
}

impl WorkspaceConfig {
    /// Config rooted at `base_dir` with every other field defaulted.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let cfg: WorkspaceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.default_quota_bytes, 64 * 1024 * 1024);
        assert_eq!(cfg.max_workspaces, 0);
        assert_eq!(cfg.snapshots, SnapshotBackend::Git);
        assert!(!cfg.durable);
        assert_eq!(cfg.snapshot_list_limit, 20);
    }

    #[test]
    fn test_disabled_backend_parses() {
        let cfg: WorkspaceConfig =
            serde_json::from_str(r#"{"snapshots": "disabled", "durable": true}"#).unwrap();
        assert_eq!(cfg.snapshots, SnapshotBackend::Disabled);
        assert!(cfg.durable);
    }
}
