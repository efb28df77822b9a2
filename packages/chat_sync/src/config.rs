use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [connection]
//                    max_backoff_secs = 10
//
//   env var:         CHAT_SYNC_CONNECTION__MAX_BACKOFF_SECS=10
//                    (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub sync: SyncFileConfig,
}

/// Server endpoints (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            ws_url: default_ws_url(),
        }
    }
}

/// Push channel tunables (lives under `[connection]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// 0 = keep retrying for as long as a credential is present.
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            max_reconnect_attempts: 0,
        }
    }
}

/// Reconciliation and typing tunables (lives under `[sync]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncFileConfig {
    #[serde(default = "default_reconcile_window_ms")]
    pub reconcile_window_ms: u64,
    #[serde(default = "default_trim_whitespace")]
    pub trim_whitespace: bool,
    #[serde(default = "default_typing_decay_secs")]
    pub typing_decay_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for SyncFileConfig {
    fn default() -> Self {
        Self {
            reconcile_window_ms: default_reconcile_window_ms(),
            trim_whitespace: default_trim_whitespace(),
            typing_decay_secs: default_typing_decay_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_api_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_ws_url() -> String {
    "ws://localhost:8000/ws".to_string()
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_secs() -> u64 {
    30
}
fn default_reconcile_window_ms() -> u64 {
    30_000
}
fn default_trim_whitespace() -> bool {
    true
}
fn default_typing_decay_secs() -> u64 {
    10
}
fn default_request_timeout_secs() -> u64 {
    30
}

/// Build a figment that layers: defaults → config.toml → CHAT_SYNC_* env vars.
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("CHAT_SYNC_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Reconnection schedule for the push channel.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    /// None = unlimited.
    pub max_attempts: Option<u32>,
}

impl BackoffConfig {
    /// Delay before reconnection attempt number `attempt` (0-based):
    /// initial, 2×initial, 4×initial, … capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    pub fn from_file(fc: &ConnectionFileConfig) -> Self {
        Self {
            initial: Duration::from_millis(fc.initial_backoff_ms.max(1)),
            max: Duration::from_secs(fc.max_backoff_secs.max(1)),
            max_attempts: match fc.max_reconnect_attempts {
                0 => None,
                n => Some(n),
            },
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::from_file(&ConnectionFileConfig::default())
    }
}

/// Matching predicate for optimistic-message reconciliation.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileConfig {
    /// How long after an optimistic insert a server echo may still claim it.
    pub window: Duration,
    /// Compare content after trimming surrounding whitespace.
    pub trim_whitespace: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(default_reconcile_window_ms()),
            trim_whitespace: default_trim_whitespace(),
        }
    }
}

/// Runtime configuration for the synchronization core.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub api_url: String,
    pub ws_url: String,
    pub backoff: BackoffConfig,
    pub reconcile: ReconcileConfig,
    pub typing_decay: Duration,
    pub request_timeout: Duration,
}

impl SyncConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            api_url: fc.server.api_url.trim_end_matches('/').to_string(),
            ws_url: fc.server.ws_url.clone(),
            backoff: BackoffConfig::from_file(&fc.connection),
            reconcile: ReconcileConfig {
                window: Duration::from_millis(fc.sync.reconcile_window_ms),
                trim_whitespace: fc.sync.trim_whitespace,
            },
            typing_decay: Duration::from_secs(fc.sync.typing_decay_secs.max(1)),
            request_timeout: Duration::from_secs(fc.sync.request_timeout_secs.max(1)),
        }
    }

    /// Resolve the data directory and extract the layered configuration.
    pub fn load(custom_dir: Option<PathBuf>) -> Result<(PathBuf, Self)> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".chat-sync"),
        };
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let fc: FileConfig = load_config(&data_dir)
            .extract()
            .context("Failed to load configuration")?;
        Ok((data_dir, Self::from_file(&fc)))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}
