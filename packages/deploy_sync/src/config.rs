use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::connection::BackoffPolicy;
use crate::engine::EngineOptions;
use crate::progress::ProgressConfig;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [backend]
//                    base_url = "https://deploy.example.com"
//
//   env var:         DEPLOY_SYNC_BACKEND__BASE_URL=https://deploy.example.com
//
//   (double underscore = nesting; single underscore stays within field names:
//    DEPLOY_SYNC_RECONNECT__MAX_ATTEMPTS=5)

pub const ENV_PREFIX: &str = "DEPLOY_SYNC_";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub backend: BackendFileConfig,
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,
    #[serde(default)]
    pub progress: ProgressFileConfig,
}

/// Where the backend lives (under `[backend]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BackendFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Reconnect backoff (under `[reconnect]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectFileConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for ReconnectFileConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

/// Progress computation (under `[progress]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressFileConfig {
    /// Share of a running stage's weight counted toward the overall figure.
    #[serde(default = "default_in_progress_credit")]
    pub in_progress_credit: f64,
}

impl Default for ProgressFileConfig {
    fn default() -> Self {
        Self {
            in_progress_credit: default_in_progress_credit(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_jitter_ms() -> u64 {
    500
}
fn default_in_progress_credit() -> f64 {
    0.5
}

/// Build a figment that layers: defaults → config.toml → DEPLOY_SYNC_* env vars.
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Backend endpoints (runtime view).
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl BackendConfig {
    pub fn from_file(fc: &BackendFileConfig) -> Self {
        Self {
            base_url: fc.base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(fc.request_timeout_secs.max(1)),
        }
    }
}

impl BackoffPolicy {
    pub fn from_file(fc: &ReconnectFileConfig) -> Self {
        let base_delay = Duration::from_millis(fc.base_delay_ms.max(1));
        Self {
            base_delay,
            max_delay: Duration::from_millis(fc.max_delay_ms).max(base_delay),
            max_attempts: fc.max_attempts,
            jitter: Duration::from_millis(fc.jitter_ms),
        }
    }
}

impl ProgressConfig {
    pub fn from_file(fc: &ProgressFileConfig) -> Self {
        Self {
            in_progress_credit: fc.in_progress_credit.clamp(0.0, 1.0),
        }
    }
}

/// Fully resolved configuration.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub backend: BackendConfig,
    pub engine: EngineOptions,
}

impl SyncConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            backend: BackendConfig::from_file(&fc.backend),
            engine: EngineOptions {
                backoff: BackoffPolicy::from_file(&fc.reconnect),
                progress: ProgressConfig::from_file(&fc.progress),
                ..Default::default()
            },
        }
    }

    /// Load and resolve the layered configuration for `data_dir`.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let fc: FileConfig = load_config(data_dir)
            .extract()
            .context("Failed to load configuration")?;
        Ok(Self::from_file(&fc))
    }
}

// =============================================================================
// Directory layout (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct SyncPaths {
    pub data_dir: PathBuf,
}

impl SyncPaths {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".deploysync"),
        };
        let state_dir = data_dir.join("state");
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("Failed to create state directory: {:?}", state_dir))?;

        info!("Data directory: {}", data_dir.display());
        Ok(Self { data_dir })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn session_state_path(&self) -> PathBuf {
        self.state_dir().join("session.json")
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.backend.base_url, "http://localhost:8080");
        assert_eq!(fc.backend.request_timeout_secs, 30);
        assert_eq!(fc.reconnect.base_delay_ms, 1000);
        assert_eq!(fc.reconnect.max_attempts, 10);
        assert_eq!(fc.progress.in_progress_credit, 0.5);
    }

    // ── from_file ───────────────────────────────────────────────────────

    #[test]
    fn test_backoff_from_file() {
        let policy = BackoffPolicy::from_file(&ReconnectFileConfig {
            base_delay_ms: 250,
            max_delay_ms: 4000,
            max_attempts: 3,
            jitter_ms: 0,
        });
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(4));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.jitter, Duration::ZERO);
    }

    #[test]
    fn test_backoff_max_never_below_base() {
        let policy = BackoffPolicy::from_file(&ReconnectFileConfig {
            base_delay_ms: 5000,
            max_delay_ms: 100,
            ..Default::default()
        });
        assert_eq!(policy.max_delay, policy.base_delay);
    }

    #[test]
    fn test_progress_credit_clamped() {
        let pc = ProgressConfig::from_file(&ProgressFileConfig {
            in_progress_credit: 3.0,
        });
        assert_eq!(pc.in_progress_credit, 1.0);
    }

    #[test]
    fn test_backend_url_trailing_slash() {
        let bc = BackendConfig::from_file(&BackendFileConfig {
            base_url: "https://deploy.example.com/".into(),
            request_timeout_secs: 10,
        });
        assert_eq!(bc.base_url, "https://deploy.example.com");
        assert_eq!(bc.request_timeout, Duration::from_secs(10));
    }

    // ── figment layering ────────────────────────────────────────────────

    #[test]
    fn test_load_without_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(tmp.path()).unwrap();
        assert_eq!(config.engine.backoff.max_attempts, 10);
    }

    #[test]
    fn test_config_toml_overrides_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[backend]\nbase_url = \"https://deploy.example.com\"\n\n[reconnect]\nmax_attempts = 4\n",
        )
        .unwrap();
        let config = SyncConfig::load(tmp.path()).unwrap();
        assert_eq!(config.backend.base_url, "https://deploy.example.com");
        assert_eq!(config.engine.backoff.max_attempts, 4);
        assert_eq!(config.engine.backoff.base_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_config_toml_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[reconnect]\nmax_attempts = \"lots\"\n",
        )
        .unwrap();
        assert!(SyncConfig::load(tmp.path()).is_err());
    }

    // ── SyncPaths ───────────────────────────────────────────────────────

    #[test]
    fn test_paths_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = SyncPaths::new(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(paths.data_dir, tmp.path());
        assert!(tmp.path().join("state").exists());
        assert_eq!(
            paths.session_state_path(),
            tmp.path().join("state/session.json")
        );
        assert_eq!(paths.config_toml_path(), tmp.path().join("config.toml"));
    }
}
