use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::error::{OrchestratorError, Result};
use crate::models::EnvironmentState;

pub const STATE_FILENAME: &str = "state.json";

/// Persists [`EnvironmentState`] as camelCase JSON. Writes are serialized
/// and atomic (temp file + rename), so readers never see a partial file.
pub struct StateStore {
    state_file_path: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(state_directory: &Path) -> Self {
        Self {
            state_file_path: state_directory.join(STATE_FILENAME),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.state_file_path
    }

    pub async fn load(&self) -> Result<Option<EnvironmentState>> {
        if !self.state_file_path.exists() {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(&self.state_file_path)
            .await
            .map_err(|e| OrchestratorError::State(format!("failed to read state file: {e}")))?;
        let state: EnvironmentState = serde_json::from_str(&json)?;
        Ok(Some(state))
    }

    pub async fn save(&self, state: &EnvironmentState) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.state_file_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                OrchestratorError::State(format!("failed to create state dir: {e}"))
            })?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let temp_path = self.state_file_path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, json)
            .await
            .map_err(|e| OrchestratorError::State(format!("failed to write state file: {e}")))?;
        tokio::fs::rename(&temp_path, &self.state_file_path)
            .await
            .map_err(|e| OrchestratorError::State(format!("failed to replace state file: {e}")))?;
        Ok(())
    }

    /// Remove the state file; a missing file is fine.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.state_file_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OrchestratorError::State(format!(
                "failed to remove state file: {e}"
            ))),
        }
    }
}
