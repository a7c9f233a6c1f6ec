//! Engine configuration.

use driftsync_core::DEFAULT_MAX_DRIFT_MS;
use driftsync_sync::{BackoffConfig, ReconcileConfig, SessionConfig};

/// An application index over history registers.
#[derive(Debug, Clone)]
pub struct IndexDef {
    /// Table name.
    pub table: String,
    /// Columns to index.
    pub columns: Vec<String>,
}

/// Recognized options. All have defaults; a zero-config replica works.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifies the database file (`<name>.db`).
    pub name: String,
    /// Sync endpoint the orchestrator connects to.
    pub sync_url: String,
    /// Clock-drift threshold in milliseconds.
    pub max_drift_ms: u64,
    /// Application indexes to create at open.
    pub indexes: Vec<IndexDef>,
    /// Imported mnemonic phrase; autogenerated when absent.
    pub mnemonic: Option<String>,
    /// Reconciliation tunables.
    pub reconcile: ReconcileConfig,
    /// Per-session settings.
    pub session: SessionConfig,
    /// Retry policy for transient sync failures.
    pub backoff: BackoffConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "driftsync".into(),
            sync_url: "wss://relay.driftsync.io".into(),
            max_drift_ms: DEFAULT_MAX_DRIFT_MS,
            indexes: Vec::new(),
            mnemonic: None,
            reconcile: ReconcileConfig::default(),
            session: SessionConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl Config {
    /// The database file name for this configuration.
    pub fn database_file(&self) -> String {
        format!("{}.db", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.database_file(), "driftsync.db");
        assert_eq!(config.max_drift_ms, 300_000);
        assert!(config.mnemonic.is_none());
        assert_eq!(config.reconcile.list_threshold, 50);
        assert_eq!(config.reconcile.max_items_per_frame, 500);
    }
}
