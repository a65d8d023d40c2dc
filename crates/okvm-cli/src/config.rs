use okvm_agent::{ExecutorConfig, ModelConfig};
use okvm_session::{ConversationStoreConfig, SessionConfig};
use okvm_workspace::WorkspaceConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Contents of `okvm.toml`. Every section is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct OkvmConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub conversations: ConversationStoreConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}

impl OkvmConfig {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Reads `path`; a missing file means all defaults.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Self::parse(&raw).map_err(|e| {
                anyhow::anyhow!("Invalid config file '{}': {e}", path.display())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read config file '{}': {e}",
                path.display()
            )),
        }
    }

    /// Checks that go beyond what deserialisation enforces.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workspace.default_quota_bytes == 0 {
            anyhow::bail!("workspace.default_quota_bytes must be greater than 0");
        }
        if self.executor.max_tool_calls == 0 {
            anyhow::bail!("executor.max_tool_calls must be greater than 0");
        }
        if self.executor.turn_timeout_secs == 0 {
            anyhow::bail!("executor.turn_timeout_secs must be greater than 0");
        }
        if self.session.event_buffer == 0 {
            anyhow::bail!("session.event_buffer must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use okvm_session::StoreBackend;
    use okvm_workspace::SnapshotBackend;

    #[test]
    fn test_empty_config_is_all_defaults() {
        let cfg = OkvmConfig::parse("").unwrap();
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.executor.max_tool_calls, 16);
        assert_eq!(cfg.workspace.default_quota_bytes, 64 * 1024 * 1024);
        assert_eq!(cfg.workspace.snapshots, SnapshotBackend::Git);
        assert_eq!(cfg.conversations.backend, StoreBackend::File);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_sections_override_defaults() {
        let cfg = OkvmConfig::parse(
            r#"
            [server]
            port = 8080

            [model]
            model_id = "local-model"
            api_base_url = "http://localhost:8000"

            [workspace]
            base_dir = "/srv/okvm"
            default_quota_bytes = 1048576
            snapshots = "disabled"
            durable = true

            [session]
            idle_timeout_secs = 60

            [conversations]
            backend = "sqlite"
            path = "data/okvm.db"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.model.model_id, "local-model");
        assert_eq!(cfg.model.base_url(), "http://localhost:8000");
        assert_eq!(cfg.workspace.default_quota_bytes, 1_048_576);
        assert_eq!(cfg.workspace.snapshots, SnapshotBackend::Disabled);
        assert!(cfg.workspace.durable);
        assert_eq!(cfg.session.idle_timeout_secs, 60);
        assert_eq!(cfg.session.sweep_interval_secs, 60);
        assert_eq!(cfg.conversations.backend, StoreBackend::Sqlite);
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(OkvmConfig::parse("[conversations]\nbackend = \"redis\"").is_err());
    }

    #[test]
    fn test_zero_quota_fails_validation() {
        let cfg = OkvmConfig::parse("[workspace]\ndefault_quota_bytes = 0").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn test_missing_file_means_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = OkvmConfig::load(&tmp.path().join("okvm.toml")).await.unwrap();
        assert_eq!(cfg.server.port, 3000);
    }

    #[tokio::test]
    async fn test_invalid_file_names_the_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("okvm.toml");
        std::fs::write(&path, "[server]\nport = \"not a port\"").unwrap();
        let err = OkvmConfig::load(&path).await.unwrap_err();
        assert!(err.to_string().contains("okvm.toml"));
    }
}
