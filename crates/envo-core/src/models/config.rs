use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::quantity::{duration_str, ScalarString};

/// Engine tuning read from the optional `engine:` block of an environment document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<CapacityConfig>,
    #[serde(default)]
    pub image_pull: ImagePullConfig,
    #[serde(default)]
    pub health: HealthDefaults,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default = "default_stop_grace_period", with = "duration_str")]
    pub stop_grace_period: Duration,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            image_pull: ImagePullConfig::default(),
            health: HealthDefaults::default(),
            reconcile: ReconcileConfig::default(),
            stop_grace_period: default_stop_grace_period(),
            state_dir: default_state_dir(),
        }
    }
}

/// Host capacity overrides; unset fields fall back to detection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapacityConfig {
    #[serde(
        default,
        deserialize_with = "scalar_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub cpus: Option<String>,
    #[serde(
        default,
        deserialize_with = "scalar_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub memory: Option<String>,
}

/// Lets `cpus: 8` and `cpus: "8"` both deserialize.
fn scalar_text<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Option::<ScalarString>::deserialize(deserializer).map(|s| s.map(|s| s.0))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImagePullConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_pull_attempts")]
    pub attempts: u32,
    #[serde(default = "default_initial_backoff", with = "duration_str")]
    pub initial_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "duration_str")]
    pub max_backoff: Duration,
    /// Bound on a single fetch attempt.
    #[serde(default = "default_pull_timeout", with = "duration_str")]
    pub timeout: Duration,
}

impl Default for ImagePullConfig {
    fn default() -> Self {
        Self {
            attempts: default_pull_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            timeout: default_pull_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthDefaults {
    #[serde(default = "default_health_interval", with = "duration_str")]
    pub interval: Duration,
    #[serde(default = "default_probe_timeout", with = "duration_str")]
    pub timeout: Duration,
    #[serde(default = "default_start_period", with = "duration_str")]
    pub start_period: Duration,
}

impl Default for HealthDefaults {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            timeout: default_probe_timeout(),
            start_period: default_start_period(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval", with = "duration_str")]
    pub interval: Duration,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_window", with = "duration_str")]
    pub window: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: default_reconcile_interval(),
            failure_threshold: default_failure_threshold(),
            max_restarts: default_max_restarts(),
            window: default_restart_window(),
        }
    }
}

fn default_stop_grace_period() -> Duration {
    Duration::from_secs(10)
}

fn default_state_dir() -> String {
    ".envo".to_string()
}

fn default_pull_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_pull_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_health_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_start_period() -> Duration {
    Duration::from_secs(60)
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_window() -> Duration {
    Duration::from_secs(300)
}
