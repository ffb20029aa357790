use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::models::{Direction, Features, Prediction};
use crate::shared::AppError;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Invalid features: {0}")]
    InvalidFeatures(String),

    #[error("Model unavailable: {0}")]
    Unavailable(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl From<OracleError> for AppError {
    fn from(error: OracleError) -> Self {
        match error {
            OracleError::InvalidFeatures(msg) => AppError::BadRequest(msg),
            OracleError::Unavailable(msg) | OracleError::Persistence(msg) => {
                AppError::OracleUnavailable(msg)
            }
        }
    }
}

/// An online classifier over round features
pub trait ModelOracle: Send + Sync {
    fn predict(&self, features: &Features) -> Result<Prediction, OracleError>;
    fn learn(&mut self, features: &Features, label: Direction, weight: f64)
        -> Result<(), OracleError>;
    /// Serialized parameters, loadable on the next start
    fn export(&self) -> Result<Vec<u8>, OracleError>;
}

#[async_trait]
pub trait OracleSnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &[u8]) -> Result<(), OracleError>;
}

/// Writes snapshots next to the target and renames them into place
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl OracleSnapshotStore for FileSnapshotStore {
    #[instrument(skip(self, snapshot), fields(path = %self.path.display(), bytes = snapshot.len()))]
    async fn save(&self, snapshot: &[u8]) -> Result<(), OracleError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| OracleError::Persistence(e.to_string()))?;
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, snapshot)
            .await
            .map_err(|e| OracleError::Persistence(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| OracleError::Persistence(e.to_string()))?;

        debug!("Model snapshot written");
        Ok(())
    }
}

/// Keeps the latest snapshot in memory
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<Vec<Vec<u8>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn saved_count(&self) -> usize {
        self.snapshots.lock().await.len()
    }

    pub async fn latest(&self) -> Option<Vec<u8>> {
        self.snapshots.lock().await.last().cloned()
    }
}

#[async_trait]
impl OracleSnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: &[u8]) -> Result<(), OracleError> {
        self.snapshots.lock().await.push(snapshot.to_vec());
        Ok(())
    }
}

struct OracleState {
    model: Box<dyn ModelOracle>,
    updates: u64,
}

/// The process-wide model. Every read and update goes through one lock,
/// so a prediction never observes a half-applied update.
pub struct SharedOracle {
    state: Mutex<OracleState>,
    snapshots: Arc<dyn OracleSnapshotStore>,
    persist_every: u64,
}

impl SharedOracle {
    pub fn new(
        model: Box<dyn ModelOracle>,
        snapshots: Arc<dyn OracleSnapshotStore>,
        persist_every: u64,
    ) -> Self {
        Self {
            state: Mutex::new(OracleState { model, updates: 0 }),
            snapshots,
            persist_every: persist_every.max(1),
        }
    }

    /// Runs `f` with sole access to the model
    pub async fn with_exclusive_access<R>(&self, f: impl FnOnce(&mut dyn ModelOracle) -> R) -> R {
        let mut state = self.state.lock().await;
        f(state.model.as_mut())
    }

    pub async fn predict(&self, features: &Features) -> Result<Prediction, OracleError> {
        self.with_exclusive_access(|model| model.predict(features))
            .await
    }

    /// Applies one weighted update and persists every `persist_every` updates.
    /// A failed save is reported but the in-memory update stands.
    #[instrument(skip(self, features))]
    pub async fn learn(
        &self,
        features: &Features,
        label: Direction,
        weight: f64,
    ) -> Result<(), OracleError> {
        let mut state = self.state.lock().await;
        state.model.learn(features, label, weight)?;
        state.updates += 1;

        if state.updates % self.persist_every != 0 {
            return Ok(());
        }

        let snapshot = state.model.export()?;
        match self.snapshots.save(&snapshot).await {
            Ok(()) => {
                info!(updates = state.updates, "Model snapshot persisted");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, updates = state.updates, "Failed to persist model snapshot");
                Err(e)
            }
        }
    }

    pub async fn updates(&self) -> u64 {
        self.state.lock().await.updates
    }
}
