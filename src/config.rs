//! Configuration for the ledger, the attach servers and the orchestrator.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConclaveError;
use crate::protocol::MAX_PAYLOAD_BYTES;

/// Environment variable overriding the state directory
pub const HOME_ENV: &str = "CONCLAVE_HOME";
/// Environment variable overriding the attach socket directory
pub const SOCKET_DIR_ENV: &str = "CONCLAVE_SOCKET_DIR";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConclaveConfig {
    pub ledger: LedgerConfig,
    pub attach: AttachConfig,
    pub orchestrator: OrchestratorConfig,
}

impl ConclaveConfig {
    /// Load from a JSON file; absent fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConclaveError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConclaveError::Config(format!("{}: {e}", path.as_ref().display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| ConclaveError::Config(format!("{}: {e}", path.as_ref().display())))?;
        debug!(path = %path.as_ref().display(), "Loaded configuration");
        Ok(config)
    }

    /// Apply `CONCLAVE_HOME` / `CONCLAVE_SOCKET_DIR` overrides
    pub fn apply_env(mut self) -> Self {
        if let Some(home) = std::env::var_os(HOME_ENV) {
            let home = PathBuf::from(home);
            self.ledger.path = Some(home.join("ledger.db"));
            self.attach.socket_dir = home.join("sockets");
        }
        if let Some(dir) = std::env::var_os(SOCKET_DIR_ENV) {
            self.attach.socket_dir = PathBuf::from(dir);
        }
        self
    }
}

/// State directory: `$CONCLAVE_HOME`, else `~/.conclave`, else a temp dir
pub fn default_home() -> PathBuf {
    if let Some(home) = std::env::var_os(HOME_ENV) {
        return PathBuf::from(home);
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".conclave"),
        None => std::env::temp_dir().join("conclave"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Database file; `None` keeps the ledger in memory
    pub path: Option<PathBuf>,
    /// Capacity of the post-commit notification channel
    pub notify_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: Some(default_home().join("ledger.db")),
            notify_capacity: 1024,
        }
    }
}

impl LedgerConfig {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    /// Root directory for per-cluster socket directories
    pub socket_dir: PathBuf,
    /// Output history retained for late attachers, in bytes
    pub ring_buffer_bytes: usize,
    /// How long `stop()` waits before escalating to SIGKILL
    pub stop_timeout_ms: u64,
    /// Delay between sending EXIT frames and removing the socket file
    pub exit_grace_ms: u64,
    /// Frames queued per client before it is considered stalled and dropped
    pub client_queue_frames: usize,
    /// Largest accepted frame payload
    pub max_frame_bytes: usize,
    pub cols: u16,
    pub rows: u16,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_home().join("sockets"),
            ring_buffer_bytes: 1024 * 1024,
            stop_timeout_ms: 5_000,
            exit_grace_ms: 100,
            client_queue_frames: 256,
            max_frame_bytes: MAX_PAYLOAD_BYTES,
            cols: 120,
            rows: 30,
        }
    }
}

impl AttachConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    /// `<socket_dir>/<cluster_id>/<agent_id>.sock`
    pub fn socket_path(&self, cluster_id: &str, agent_id: &str) -> PathBuf {
        self.socket_dir
            .join(cluster_id)
            .join(format!("{agent_id}.sock"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Iteration cap for agents whose template does not set one
    pub default_max_iterations: u32,
    /// Working directory handed to launched agents
    pub agent_cwd: Option<PathBuf>,
    /// Status snapshots kept for clusters that completed or failed
    pub finished_history: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: 5,
            agent_cwd: None,
            finished_history: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConclaveConfig::default();
        assert_eq!(config.attach.ring_buffer_bytes, 1024 * 1024);
        assert_eq!(config.attach.stop_timeout(), Duration::from_secs(5));
        assert_eq!(config.attach.max_frame_bytes, MAX_PAYLOAD_BYTES);
        assert!(config.ledger.path.is_some());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conclave.json");
        std::fs::write(
            &path,
            r#"{ "attach": { "stop_timeout_ms": 250, "socket_dir": "/tmp/conclave-test" } }"#,
        )
        .unwrap();

        let config = ConclaveConfig::load(&path).unwrap();
        assert_eq!(config.attach.stop_timeout_ms, 250);
        assert_eq!(config.attach.exit_grace_ms, 100);
        assert_eq!(
            config.attach.socket_path("c1", "worker"),
            PathBuf::from("/tmp/conclave-test/c1/worker.sock")
        );
        assert_eq!(config.orchestrator.default_max_iterations, 5);
        assert_eq!(config.orchestrator.finished_history, 64);
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ConclaveConfig::load(&path),
            Err(ConclaveError::Config(_))
        ));
    }
}
