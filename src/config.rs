//! Configuration for replica clients
//!
//! Every wait in the layer is bounded; the bounds live here. Defaults
//! can be overridden with `REPLICA_SYNC_*` environment variables.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::bootstrap::DEFAULT_MIGRATIONS;

/// Configuration shared by all components of one client
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root directory for store files and durable slots
    pub data_dir: PathBuf,
    /// Window during which a competing init message defers creation
    pub init_wait: Duration,
    /// How long a deferred client waits for `INIT_COMPLETE`
    pub init_complete_wait: Duration,
    /// Negotiation rounds before giving up with `InitRaceTimeout`
    pub init_attempts: u32,
    /// Delay between a leader's local write and its broadcast
    pub debounce: Duration,
    /// Upper bound for the post-import reopen poll
    pub import_settle: Duration,
    /// Upper bound for the first leadership decision
    pub leadership_wait: Duration,
    /// Period of the leader's persist loop
    pub persist_interval: Duration,
    /// Buffered messages per channel topic
    pub channel_capacity: usize,
    /// Table whose presence means the schema is installed
    pub root_table: String,
    /// Migration scripts applied in order on a fresh store
    pub migrations: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            init_wait: Duration::from_millis(1000),
            init_complete_wait: Duration::from_secs(10),
            init_attempts: 3,
            debounce: Duration::from_millis(500),
            import_settle: Duration::from_millis(500),
            leadership_wait: Duration::from_secs(30),
            persist_interval: Duration::from_secs(5),
            channel_capacity: 1024,
            root_table: "notes".to_string(),
            migrations: DEFAULT_MIGRATIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SyncConfig {
    /// Create config with custom data directory
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Build from defaults plus environment overrides
    pub fn from_env() -> Self {
        let mut config = match env::var("REPLICA_SYNC_DATA_DIR") {
            Ok(dir) => Self::new(dir),
            Err(_) => Self::default(),
        };
        config.debounce = env_millis("REPLICA_SYNC_DEBOUNCE_MS", config.debounce);
        config.persist_interval =
            env_millis("REPLICA_SYNC_PERSIST_INTERVAL_MS", config.persist_interval);
        config.init_wait = env_millis("REPLICA_SYNC_INIT_WAIT_MS", config.init_wait);
        config.leadership_wait = env_millis("REPLICA_SYNC_LEADER_WAIT_MS", config.leadership_wait);
        config
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval = interval;
        self
    }

    pub fn with_init_wait(mut self, wait: Duration) -> Self {
        self.init_wait = wait;
        self
    }

    pub fn with_init_complete_wait(mut self, wait: Duration) -> Self {
        self.init_complete_wait = wait;
        self
    }

    pub fn with_import_settle(mut self, settle: Duration) -> Self {
        self.import_settle = settle;
        self
    }

    pub fn with_leadership_wait(mut self, wait: Duration) -> Self {
        self.leadership_wait = wait;
        self
    }

    pub fn with_migrations(mut self, root_table: &str, scripts: Vec<String>) -> Self {
        self.root_table = root_table.to_string();
        self.migrations = scripts;
        self
    }

    /// Directory holding store files
    pub fn stores_dir(&self) -> PathBuf {
        self.data_dir.join("stores")
    }

    /// Directory holding durable snapshot slots
    pub fn slots_dir(&self) -> PathBuf {
        self.data_dir.join("slots")
    }

    /// Topic of the short-lived init coordination channel
    pub fn init_topic(&self, store: &str) -> String {
        format!("{}/init", store)
    }

    /// Topic of the long-lived write replication channel
    pub fn write_topic(&self, store: &str) -> String {
        format!("{}/writes", store)
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(e) => {
                warn!(key, value = %raw, error = %e, "ignoring unparseable duration");
                default
            }
        },
        Err(_) => default,
    }
}
