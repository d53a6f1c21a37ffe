use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("spec file not found at {0}")]
    SpecNotFound(PathBuf),

    #[error("malformed spec: {0}")]
    MalformedSpec(String),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("cyclic dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("insufficient capacity for service '{service}': {reason}")]
    InsufficientCapacity { service: String, reason: String },

    #[error("image '{image}' unavailable: {reason}")]
    ImageUnavailable { image: String, reason: String },

    #[error("image reference '{image}' is invalid: {reason}")]
    ImageInvalid { image: String, reason: String },

    #[error("service '{service}' failed to start: {reason}")]
    StartFailed { service: String, reason: String },

    #[error("service '{service}' did not become healthy within {timeout:?}")]
    HealthTimeout { service: String, timeout: Duration },

    #[error("service '{service}' exhausted {restarts} restarts within {window:?}")]
    ReconcileExhausted {
        service: String,
        restarts: u32,
        window: Duration,
    },

    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    #[error("runtime operation failed: {0}")]
    Runtime(String),

    #[error("state persistence failed: {0}")]
    State(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl OrchestratorError {
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Transient failures worth another attempt with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ImageUnavailable { .. })
    }

    /// Errors that leave a service in `Failed` once retries (if any) run out.
    /// `HealthTimeout` only degrades.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::HealthTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
