use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use sha2::{Digest, Sha256};

use crate::invoke::RetryPolicy;

/// Engine configuration resolved from the environment.
/// All fields are optional in the environment — missing values fall back
/// to defaults, invalid values are an error rather than a silent default.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub runs_dir: PathBuf,
    pub retry: RetryPolicy,
    pub max_state_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from("runs"),
            retry: RetryPolicy::default(),
            max_state_bytes: 16 * 1024 * 1024,
        }
    }
}

fn get_u32(env: &HashMap<String, String>, key: &str, default: u32) -> Result<u32> {
    match env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => match raw.parse() {
            Ok(v) => Ok(v),
            Err(_) => bail!("Invalid integer for {key}: {raw:?}"),
        },
    }
}

fn get_usize(env: &HashMap<String, String>, key: &str, default: usize) -> Result<usize> {
    match env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => match raw.parse() {
            Ok(v) => Ok(v),
            Err(_) => bail!("Invalid integer for {key}: {raw:?}"),
        },
    }
}

fn get_f64(env: &HashMap<String, String>, key: &str, default: f64) -> Result<f64> {
    match env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => match raw.parse::<f64>() {
            Ok(v) if v.is_finite() && v >= 0.0 => Ok(v),
            _ => bail!("Invalid number for {key}: {raw:?}"),
        },
    }
}

impl AppConfig {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_env_map(&std::env::vars().collect())
    }

    /// Resolve configuration from an explicit variable map. Keeps config
    /// construction pure and independently testable.
    pub fn from_env_map(env: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let runs_dir = env
            .get("STEPFLOW_RUNS_DIR")
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.runs_dir);

        let timeout_s = get_f64(env, "STEPFLOW_HTTP_TIMEOUT_S", 30.0)?;
        let max_attempts = get_u32(env, "STEPFLOW_HTTP_MAX_ATTEMPTS", 5)?;
        if max_attempts == 0 {
            bail!("STEPFLOW_HTTP_MAX_ATTEMPTS must be at least 1");
        }
        let initial_backoff_s = get_f64(env, "STEPFLOW_HTTP_INITIAL_BACKOFF_S", 0.5)?;
        let max_backoff_s = get_f64(env, "STEPFLOW_HTTP_MAX_BACKOFF_S", 8.0)?;
        let jitter_ratio = get_f64(env, "STEPFLOW_HTTP_JITTER_RATIO", 0.2)?;
        if jitter_ratio >= 1.0 {
            bail!("STEPFLOW_HTTP_JITTER_RATIO must be below 1.0");
        }

        let max_state_bytes =
            get_usize(env, "STEPFLOW_MAX_STATE_BYTES", defaults.max_state_bytes)?;

        Ok(Self {
            runs_dir,
            retry: RetryPolicy {
                max_attempts,
                initial_backoff: Duration::from_secs_f64(initial_backoff_s),
                max_backoff: Duration::from_secs_f64(max_backoff_s),
                jitter_ratio,
                call_timeout: if timeout_s > 0.0 {
                    Some(Duration::from_secs_f64(timeout_s))
                } else {
                    None
                },
            },
            max_state_bytes,
        })
    }

    /// Stable sha256 fingerprint of the effective configuration, recorded
    /// in run summaries so an exported audit names the config it ran under.
    pub fn fingerprint(&self) -> String {
        let canonical = format!(
            "runs_dir={}\ntimeout_s={:?}\nmax_attempts={}\ninitial_backoff_ms={}\nmax_backoff_ms={}\njitter_ratio={}\nmax_state_bytes={}\n",
            self.runs_dir.display(),
            self.retry.call_timeout.map(|t| t.as_millis()),
            self.retry.max_attempts,
            self.retry.initial_backoff.as_millis(),
            self.retry.max_backoff.as_millis(),
            self.retry.jitter_ratio,
            self.max_state_bytes,
        );
        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(digest)
    }
}
