//! # Node Configuration
//!
//! Optional TOML file. Every section and every key has a default, so an
//! empty file (or no file at all) yields a working standalone node.
//!
//! ```toml
//! [store]
//! path = "pointgraph.redb"
//!
//! [bus]
//! subscriber_capacity = 256
//! rule_queue_capacity = 8192
//!
//! [rules]
//! enabled = true
//!
//! [replication]
//! listen = "0.0.0.0:7070"
//! upstream = "central.example:7070"
//! peer_id = "central"
//! timeout_secs = 60
//! retries = 3
//! ```

use pointgraph_core::{BusConfig, DbConfig, PointGraphError, PropagationConfig, RuleEngineConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default store file.
pub const DEFAULT_STORE_PATH: &str = "pointgraph.redb";

/// Maximum config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

// =============================================================================
// SECTIONS
// =============================================================================

/// Full node configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// `[store]`
    pub store: StoreSection,
    /// `[bus]`
    pub bus: BusSection,
    /// `[rules]`
    pub rules: RulesSection,
    /// `[replication]`
    pub replication: ReplicationSection,
}

/// `[store]`: where the redb file lives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_STORE_PATH),
        }
    }
}

/// `[bus]`: subscriber queue sizes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusSection {
    pub subscriber_capacity: usize,
    pub rule_queue_capacity: usize,
}

impl Default for BusSection {
    fn default() -> Self {
        let cfg = BusConfig::default();
        Self {
            subscriber_capacity: cfg.subscriber_capacity,
            rule_queue_capacity: cfg.rule_queue_capacity,
        }
    }
}

/// `[rules]`: the reactive rule engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RulesSection {
    pub enabled: bool,
    pub feedback_capacity: usize,
    pub notification_capacity: usize,
}

impl Default for RulesSection {
    fn default() -> Self {
        let cfg = RuleEngineConfig::default();
        Self {
            enabled: true,
            feedback_capacity: cfg.feedback_capacity,
            notification_capacity: cfg.notification_capacity,
        }
    }
}

/// `[replication]`: the TCP listener and the upstream peer.
///
/// `peer_id` names the upstream. Points received from it carry that ID as
/// their origin and are never sent back. It defaults to the upstream
/// address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationSection {
    pub listen: Option<String>,
    pub upstream: Option<String>,
    pub peer_id: Option<String>,
    pub timeout_secs: u64,
    pub retries: u32,
    pub backoff_ms: u64,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        let cfg = PropagationConfig::default();
        Self {
            listen: None,
            upstream: None,
            peer_id: None,
            timeout_secs: cfg.timeout.as_secs(),
            retries: cfg.retries,
            backoff_ms: cfg.backoff.as_millis() as u64,
        }
    }
}

impl ReplicationSection {
    /// ID of the configured upstream, if any.
    pub fn upstream_id(&self) -> Option<String> {
        self.upstream
            .as_ref()
            .map(|addr| self.peer_id.clone().unwrap_or_else(|| addr.clone()))
    }
}

// =============================================================================
// LOADING
// =============================================================================

impl AppConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, PointGraphError> {
        toml::from_str(text)
            .map_err(|e| PointGraphError::Serialization(format!("Invalid config: {}", e)))
    }

    /// Load the config file, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, PointGraphError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let metadata = std::fs::metadata(path).map_err(|e| {
            PointGraphError::Io(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(PointGraphError::Serialization(format!(
                "Config size {} bytes exceeds maximum allowed {} bytes",
                metadata.len(),
                MAX_CONFIG_FILE_SIZE
            )));
        }

        let text = std::fs::read_to_string(path)
            .map_err(|e| PointGraphError::Io(format!("Read config: {}", e)))?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Apply command-line overrides.
    #[must_use]
    pub fn with_store_path(mut self, path: Option<PathBuf>) -> Self {
        if let Some(path) = path {
            self.store.path = path;
        }
        self
    }

    /// Core tunables derived from this file.
    pub fn db_config(&self) -> DbConfig {
        DbConfig {
            bus: BusConfig {
                subscriber_capacity: self.bus.subscriber_capacity,
                rule_queue_capacity: self.bus.rule_queue_capacity,
            },
            rules: RuleEngineConfig {
                feedback_capacity: self.rules.feedback_capacity,
                notification_capacity: self.rules.notification_capacity,
            },
            propagation: PropagationConfig {
                timeout: Duration::from_secs(self.replication.timeout_secs),
                retries: self.replication.retries,
                backoff: Duration::from_millis(self.replication.backoff_ms),
            },
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
