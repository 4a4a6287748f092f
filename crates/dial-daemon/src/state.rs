use dial_proto::protocol::TuningState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Survives restarts: the last country and volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    #[serde(default)]
    pub country: Option<String>,
    pub volume: f32,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            country: None,
            volume: 0.5,
        }
    }
}

/// Shared view of the tuning state.  The controller is the only writer;
/// socket clients read snapshots.
pub struct StateManager {
    state: Arc<RwLock<TuningState>>,
    state_file: Option<PathBuf>,
}

impl StateManager {
    pub fn new(state_file: Option<PathBuf>, initial: TuningState) -> Self {
        Self {
            state: Arc::new(RwLock::new(initial)),
            state_file,
        }
    }

    pub async fn get_state(&self) -> TuningState {
        self.state.read().await.clone()
    }

    /// Apply `f` and bump `rev`.  Returns the new snapshot.
    pub async fn modify<F>(&self, f: F) -> TuningState
    where
        F: FnOnce(&mut TuningState),
    {
        let mut state = self.state.write().await;
        f(&mut state);
        state.rev += 1;
        state.clone()
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        let Some(state_file) = self.state_file.as_ref() else {
            return Ok(());
        };
        let persistent = {
            let state = self.state.read().await;
            PersistentState {
                country: Some(state.country.clone()).filter(|c| !c.is_empty()),
                volume: state.volume,
            }
        };

        if let Some(parent) = state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(state_file, json).await?;
        Ok(())
    }

    pub fn load_persistent(state_file: &Path) -> PersistentState {
        if let Ok(content) = std::fs::read_to_string(state_file) {
            if let Ok(persistent) = serde_json::from_str::<PersistentState>(&content) {
                return persistent;
            }
        }
        PersistentState::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_modify_bumps_rev() {
        let manager = StateManager::new(None, TuningState::default());
        let snap = manager.modify(|s| s.volume = 0.8).await;
        assert_eq!(snap.rev, 1);
        assert_eq!(snap.volume, 0.8);
        assert_eq!(manager.modify(|_| {}).await.rev, 2);
    }

    #[tokio::test]
    async fn test_save_and_load_persistent() {
        let path = std::env::temp_dir()
            .join(format!("fmdial-state-{}", std::process::id()))
            .join("state.json");
        let manager = StateManager::new(Some(path.clone()), TuningState::default());
        manager
            .modify(|s| {
                s.country = "NL".to_string();
                s.volume = 0.3;
            })
            .await;
        manager.save().await.unwrap();

        let loaded = StateManager::load_persistent(&path);
        assert_eq!(loaded.country.as_deref(), Some("NL"));
        assert_eq!(loaded.volume, 0.3);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_missing_state_file_gives_defaults() {
        let loaded = StateManager::load_persistent(Path::new("/nonexistent/state.json"));
        assert_eq!(loaded, PersistentState::default());
    }
}
