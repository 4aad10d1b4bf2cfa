//! # Client Configuration
//!
//! Bridge and sync settings for one client, loaded from a single TOML file.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     ISOMETRY_SYNC_MODE=manual                                          │
//! │     ISOMETRY_CONFLICT_WINDOW_MS=8000                                   │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/isometry/client.toml (Linux)                             │
//! │     ~/Library/Application Support/com.isometry.isometry/client.toml    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     realtime mode, 5s conflict window, remote-wins                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # client.toml
//! [bridge]
//! default_timeout_ms = 10000
//! max_attempts = 3
//!
//! [sync]
//! mode = "realtime"          # realtime | manual | offline
//! conflict_window_ms = 5000
//! debounce_ms = 300
//! default_strategy = "remote-wins"
//! immediate_entities = ["notebook_cards"]
//! ```

use std::path::PathBuf;
use std::time::Duration;

use isometry_bridge::BridgeConfig;
use isometry_core::{ConflictStrategy, SyncMode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync coordinator behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Publication mode.
    #[serde(default)]
    pub mode: SyncMode,

    /// Liveness check period (seconds).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Two changes to one entity closer than this are concurrent (ms).
    #[serde(default = "default_conflict_window")]
    pub conflict_window_ms: u64,

    /// Coalescing delay for repeated changes (ms). 0 disables debouncing.
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Applied when no resolver accepts a conflict.
    #[serde(default)]
    pub default_strategy: ConflictStrategy,

    /// Entity types whose changes are never debounced.
    #[serde(default)]
    pub immediate_entities: Vec<String>,

    /// Capacity of the sync-level offline queue.
    #[serde(default = "default_offline_queue_capacity")]
    pub offline_queue_capacity: usize,

    /// Changes replayed per batch after reconnect.
    #[serde(default = "default_drain_batch_size")]
    pub drain_batch_size: usize,

    /// Send attempts per change during replay.
    #[serde(default = "default_replay_max_attempts")]
    pub replay_max_attempts: u32,

    /// First replay backoff (ms).
    #[serde(default = "default_replay_initial_backoff")]
    pub replay_initial_backoff_ms: u64,

    /// Replay backoff cap (ms).
    #[serde(default = "default_replay_max_backoff")]
    pub replay_max_backoff_ms: u64,
}

fn default_heartbeat_interval() -> u64 {
    10
}
fn default_conflict_window() -> u64 {
    5_000
}
fn default_debounce() -> u64 {
    300
}
fn default_offline_queue_capacity() -> usize {
    1_000
}
fn default_drain_batch_size() -> usize {
    10
}
fn default_replay_max_attempts() -> u32 {
    3
}
fn default_replay_initial_backoff() -> u64 {
    500
}
fn default_replay_max_backoff() -> u64 {
    5_000
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            mode: SyncMode::default(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            conflict_window_ms: default_conflict_window(),
            debounce_ms: default_debounce(),
            default_strategy: ConflictStrategy::default(),
            immediate_entities: Vec::new(),
            offline_queue_capacity: default_offline_queue_capacity(),
            drain_batch_size: default_drain_batch_size(),
            replay_max_attempts: default_replay_max_attempts(),
            replay_initial_backoff_ms: default_replay_initial_backoff(),
            replay_max_backoff_ms: default_replay_max_backoff(),
        }
    }
}

impl SyncSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn replay_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.replay_initial_backoff_ms)
    }

    pub fn replay_max_backoff(&self) -> Duration {
        Duration::from_millis(self.replay_max_backoff_ms)
    }

    /// Whether changes to `entity` skip the debounce window.
    pub fn is_immediate(&self, entity: &str) -> bool {
        self.debounce_ms == 0 || self.immediate_entities.iter().any(|e| e == entity)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "heartbeat_interval_secs must be greater than 0".into(),
            ));
        }
        if self.offline_queue_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "offline_queue_capacity must be greater than 0".into(),
            ));
        }
        if self.drain_batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "drain_batch_size must be greater than 0".into(),
            ));
        }
        if self.replay_max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "replay_max_attempts must be greater than 0".into(),
            ));
        }
        if self.replay_initial_backoff_ms > self.replay_max_backoff_ms {
            return Err(SyncError::InvalidConfig(
                "replay_initial_backoff_ms must not exceed replay_max_backoff_ms".into(),
            ));
        }
        for entity in &self.immediate_entities {
            isometry_core::validation::validate_entity_name(entity)?;
        }
        Ok(())
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Complete client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Transport bridge settings.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Sync coordinator settings.
    #[serde(default)]
    pub sync: SyncSettings,
}

impl ClientConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (client.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading client config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns defaults if loading fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load client config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Client config saved");
        Ok(())
    }

    /// Validates both sections.
    pub fn validate(&self) -> SyncResult<()> {
        self.bridge
            .validate()
            .map_err(|e| SyncError::InvalidConfig(format!("bridge: {e}")))?;
        self.sync.validate()
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("ISOMETRY_SYNC_MODE") {
            match mode.parse() {
                Ok(parsed) => {
                    debug!(mode = %mode, "Overriding sync mode from environment");
                    self.sync.mode = parsed;
                }
                Err(e) => warn!(mode = %mode, error = %e, "Ignoring ISOMETRY_SYNC_MODE"),
            }
        }

        if let Ok(strategy) = std::env::var("ISOMETRY_DEFAULT_STRATEGY") {
            match strategy.parse() {
                Ok(parsed) => self.sync.default_strategy = parsed,
                Err(e) => warn!(strategy = %strategy, error = %e, "Ignoring ISOMETRY_DEFAULT_STRATEGY"),
            }
        }

        if let Some(ms) = env_u64("ISOMETRY_CONFLICT_WINDOW_MS") {
            debug!(ms, "Overriding conflict window from environment");
            self.sync.conflict_window_ms = ms;
        }

        if let Some(ms) = env_u64("ISOMETRY_DEBOUNCE_MS") {
            self.sync.debounce_ms = ms;
        }

        if let Some(secs) = env_u64("ISOMETRY_HEARTBEAT_SECS") {
            self.sync.heartbeat_interval_secs = secs;
        }

        if let Some(ms) = env_u64("ISOMETRY_REQUEST_TIMEOUT_MS") {
            debug!(ms, "Overriding request timeout from environment");
            self.bridge.default_timeout_ms = ms;
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "isometry", "isometry")
            .map(|dirs| dirs.config_dir().join("client.toml"))
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring non-numeric environment override");
            None
        }
    }
}
