//! Configuration for the position engine and the position server.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Tuning for the position engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Storage key the position table is saved under
    pub namespace: String,
    /// Directory backing the persistent medium
    pub storage_dir: PathBuf,
    /// Period of the autosave loop
    pub autosave_interval: Duration,
    /// Delay before a verification check fires
    pub verification_delay: Duration,
    /// Allowed gap (seconds) between player time and cached position
    pub drift_threshold: f64,
    /// Minimum spacing of saves triggered by "now playing" notifications
    pub save_throttle: Duration,
    /// Base URL of the remote position service, if any
    pub remote_url: Option<String>,
    /// Request timeout for the remote position service
    pub remote_timeout: Duration,
}

const AUTOSAVE_MIN_MS: u64 = 1000;
const AUTOSAVE_MAX_MS: u64 = 3000;
const VERIFY_MIN_MS: u64 = 500;
const VERIFY_MAX_MS: u64 = 1500;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: String::from("videoPositions"),
            storage_dir: PathBuf::from("./positions"),
            autosave_interval: Duration::from_millis(AUTOSAVE_MAX_MS),
            verification_delay: Duration::from_millis(VERIFY_MAX_MS),
            drift_threshold: 2.0,
            save_throttle: Duration::from_millis(1000),
            remote_url: None,
            remote_timeout: Duration::from_millis(5000),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        let autosave_ms = env_parse("AUTOSAVE_INTERVAL_MS", AUTOSAVE_MAX_MS)
            .clamp(AUTOSAVE_MIN_MS, AUTOSAVE_MAX_MS);
        let verify_ms =
            env_parse("VERIFY_DELAY_MS", VERIFY_MAX_MS).clamp(VERIFY_MIN_MS, VERIFY_MAX_MS);
        let drift_threshold = env_parse("DRIFT_THRESHOLD_SECS", defaults.drift_threshold);

        Self {
            namespace: env::var("POSITION_NAMESPACE").unwrap_or(defaults.namespace),
            storage_dir: env::var("POSITION_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            autosave_interval: Duration::from_millis(autosave_ms),
            verification_delay: Duration::from_millis(verify_ms),
            drift_threshold: if drift_threshold.is_finite() && drift_threshold >= 0.0 {
                drift_threshold
            } else {
                defaults.drift_threshold
            },
            save_throttle: Duration::from_millis(env_parse("SAVE_THROTTLE_MS", 1000)),
            remote_url: env::var("POSITION_REMOTE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            remote_timeout: Duration::from_millis(env_parse("POSITION_REMOTE_TIMEOUT_MS", 5000)),
        }
    }
}

/// Configuration for the position server binary.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: String,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            addr: env::var("ADDR").unwrap_or_else(|_| String::from("127.0.0.1")),
            port: env::var("PORT").unwrap_or_else(|_| String::from("3001")),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
