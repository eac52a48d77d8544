//! Persisted progress counters.
//!
//! A checkpoint is a single height stored as 8 big-endian bytes under a fixed key. It never
//! regresses, and a failed save leaves the previously stored height in place.

use crate::store::{KeyValueStore, StoreError};
use std::sync::Arc;
use thiserror::Error;

/// Key of the last L1 block whose events are fully ingested.
pub const L1_CHECKPOINT_KEY: &str = "latestBlockSynced";

/// Key of the next L2 block the materializer has to apply.
pub const STATE_CHECKPOINT_KEY: &str = "latestStateUpdateApplied";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("checkpoint {key} would regress from {current} to {requested}")]
    Regression {
        key: &'static str,
        current: u64,
        requested: u64,
    },
}

/// Height counter under one key of the store.
#[derive(Clone)]
pub struct Checkpoint {
    store: Arc<dyn KeyValueStore>,
    key: &'static str,
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoint").field("key", &self.key).finish()
    }
}

impl Checkpoint {
    pub fn new(store: Arc<dyn KeyValueStore>, key: &'static str) -> Self {
        Self { store, key }
    }

    pub fn l1(store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(store, L1_CHECKPOINT_KEY)
    }

    pub fn state(store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(store, STATE_CHECKPOINT_KEY)
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    /// Stored height, or 0 when nothing was ever saved.
    pub fn load(&self) -> Result<u64, StoreError> {
        let Some(bytes) = self.store.get(self.key.as_bytes())? else {
            return Ok(0);
        };
        let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| StoreError::Corrupt {
            key: self.key.to_string(),
            reason: format!("expected 8 bytes, got {}", bytes.len()),
        })?;
        Ok(u64::from_be_bytes(raw))
    }

    /// Persist `height`. Saving the current height again is a no-op.
    pub fn save(&self, height: u64) -> Result<(), CheckpointError> {
        let current = self.load()?;
        if height < current {
            return Err(CheckpointError::Regression {
                key: self.key,
                current,
                requested: height,
            });
        }
        if height == current && current != 0 {
            return Ok(());
        }
        if let Err(e) = self.store.put(self.key.as_bytes(), &height.to_be_bytes()) {
            tracing::warn!(key = self.key, height, reason = %e, "checkpoint save failed");
            return Err(e.into());
        }
        tracing::debug!(key = self.key, height, "checkpoint saved");
        Ok(())
    }
}
