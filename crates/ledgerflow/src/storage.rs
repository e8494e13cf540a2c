//! Checkpoint storage abstraction.
//!
//! The engine only requires the contracts below: atomic per-call writes and
//! transactional cooperation with the persistence seam. The bundled
//! [`InMemoryCheckpointStorage`] backs tests and embedded deployments;
//! relational backends implement the same trait.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::checkpoint::{FlowStatus, SerializedCheckpoint};
use crate::error::{Error, FlowError, Result};
use crate::ids::FlowId;

/// One stored checkpoint row.
#[derive(Debug, Clone)]
pub struct StoredCheckpoint {
    pub checkpoint: SerializedCheckpoint,
    /// Errors recorded for operator inspection while hospitalized.
    pub exception: Option<FlowError>,
    /// Free-form metadata attached by operational tooling.
    pub metadata: Option<Value>,
}

/// Persistent store of flow checkpoints.
#[async_trait]
pub trait CheckpointStorage: Send + Sync + 'static {
    /// Insert the first checkpoint for a flow.
    async fn add_checkpoint(&self, flow_id: FlowId, checkpoint: SerializedCheckpoint)
        -> Result<()>;

    /// Replace the checkpoint of an already-persisted flow.
    async fn update_checkpoint(
        &self,
        flow_id: FlowId,
        checkpoint: SerializedCheckpoint,
    ) -> Result<()>;

    /// Update only the status column.
    async fn update_status(&self, flow_id: FlowId, status: FlowStatus) -> Result<()>;

    /// Delete a flow's checkpoint. Deleting a missing checkpoint is not an
    /// error (kill races with orderly removal).
    async fn remove_checkpoint(&self, flow_id: FlowId) -> Result<()>;

    /// Fetch one checkpoint.
    async fn get_checkpoint(&self, flow_id: FlowId) -> Result<Option<SerializedCheckpoint>>;

    /// All checkpoints a restarting node should load and run.
    async fn get_checkpoints_to_run(&self) -> Result<Vec<(FlowId, SerializedCheckpoint)>>;

    /// All checkpoints parked as paused.
    async fn get_paused_checkpoints(&self) -> Result<Vec<(FlowId, SerializedCheckpoint)>>;

    /// Mark every runnable checkpoint paused (crash-recovery entry point).
    async fn mark_all_paused(&self) -> Result<()>;

    /// Record the error that hospitalized a flow.
    async fn add_flow_exception(&self, flow_id: FlowId, error: FlowError) -> Result<()>;

    /// Clear a previously recorded error.
    async fn remove_flow_exception(&self, flow_id: FlowId) -> Result<()>;

    /// Attach operational metadata to a flow.
    async fn add_metadata(&self, flow_id: FlowId, metadata: Value) -> Result<()>;
}

/// Lock-free in-memory checkpoint store.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStorage {
    checkpoints: DashMap<FlowId, StoredCheckpoint>,
}

impl InMemoryCheckpointStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    /// True when no checkpoints are stored.
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[async_trait]
impl CheckpointStorage for InMemoryCheckpointStorage {
    async fn add_checkpoint(
        &self,
        flow_id: FlowId,
        checkpoint: SerializedCheckpoint,
    ) -> Result<()> {
        if self.checkpoints.contains_key(&flow_id) {
            return Err(Error::Storage(format!(
                "checkpoint for {flow_id} already exists"
            )));
        }
        self.checkpoints.insert(
            flow_id,
            StoredCheckpoint {
                checkpoint,
                exception: None,
                metadata: None,
            },
        );
        Ok(())
    }

    async fn update_checkpoint(
        &self,
        flow_id: FlowId,
        checkpoint: SerializedCheckpoint,
    ) -> Result<()> {
        match self.checkpoints.get_mut(&flow_id) {
            Some(mut stored) => {
                stored.checkpoint = checkpoint;
                Ok(())
            }
            None => Err(Error::Storage(format!(
                "no checkpoint for {flow_id} to update"
            ))),
        }
    }

    async fn update_status(&self, flow_id: FlowId, status: FlowStatus) -> Result<()> {
        match self.checkpoints.get_mut(&flow_id) {
            Some(mut stored) => {
                stored.checkpoint.status = status;
                Ok(())
            }
            None => Err(Error::Storage(format!(
                "no checkpoint for {flow_id} to update status"
            ))),
        }
    }

    async fn remove_checkpoint(&self, flow_id: FlowId) -> Result<()> {
        self.checkpoints.remove(&flow_id);
        Ok(())
    }

    async fn get_checkpoint(&self, flow_id: FlowId) -> Result<Option<SerializedCheckpoint>> {
        Ok(self
            .checkpoints
            .get(&flow_id)
            .map(|stored| stored.checkpoint.clone()))
    }

    async fn get_checkpoints_to_run(&self) -> Result<Vec<(FlowId, SerializedCheckpoint)>> {
        Ok(self
            .checkpoints
            .iter()
            .filter(|entry| {
                matches!(
                    entry.checkpoint.status,
                    FlowStatus::Runnable | FlowStatus::Hospitalized
                )
            })
            .map(|entry| (*entry.key(), entry.checkpoint.clone()))
            .collect())
    }

    async fn get_paused_checkpoints(&self) -> Result<Vec<(FlowId, SerializedCheckpoint)>> {
        Ok(self
            .checkpoints
            .iter()
            .filter(|entry| entry.checkpoint.status == FlowStatus::Paused)
            .map(|entry| (*entry.key(), entry.checkpoint.clone()))
            .collect())
    }

    async fn mark_all_paused(&self) -> Result<()> {
        for mut entry in self.checkpoints.iter_mut() {
            if entry.checkpoint.status == FlowStatus::Runnable {
                entry.checkpoint.status = FlowStatus::Paused;
            }
        }
        Ok(())
    }

    async fn add_flow_exception(&self, flow_id: FlowId, error: FlowError) -> Result<()> {
        match self.checkpoints.get_mut(&flow_id) {
            Some(mut stored) => {
                stored.exception = Some(error);
                Ok(())
            }
            None => Err(Error::Storage(format!(
                "no checkpoint for {flow_id} to attach exception"
            ))),
        }
    }

    async fn remove_flow_exception(&self, flow_id: FlowId) -> Result<()> {
        if let Some(mut stored) = self.checkpoints.get_mut(&flow_id) {
            stored.exception = None;
        }
        Ok(())
    }

    async fn add_metadata(&self, flow_id: FlowId, metadata: Value) -> Result<()> {
        if let Some(mut stored) = self.checkpoints.get_mut(&flow_id) {
            stored.metadata = Some(metadata);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{
        Checkpoint, FlowStart, InvocationContext, SubFlow,
    };
    use crate::ids::{Party, SerializedBytes};

    fn serialized() -> SerializedCheckpoint {
        Checkpoint::new(
            InvocationContext::rpc("tester"),
            Party::new("O=Us"),
            SubFlow::Inlined {
                class_name: "app.Top".into(),
                timed: false,
            },
            FlowStart::Explicit,
            SerializedBytes::new(vec![1]),
        )
        .to_serialized()
        .unwrap()
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let storage = InMemoryCheckpointStorage::new();
        let flow_id = FlowId::random();

        storage.add_checkpoint(flow_id, serialized()).await.unwrap();
        let loaded = storage.get_checkpoint(flow_id).await.unwrap().unwrap();

        assert_eq!(loaded.status, FlowStatus::Runnable);
        assert!(loaded.deserialize().is_ok());
    }

    #[tokio::test]
    async fn double_insert_is_rejected() {
        let storage = InMemoryCheckpointStorage::new();
        let flow_id = FlowId::random();

        storage.add_checkpoint(flow_id, serialized()).await.unwrap();
        assert!(storage.add_checkpoint(flow_id, serialized()).await.is_err());
    }

    #[tokio::test]
    async fn paused_checkpoints_are_excluded_from_run_set() {
        let storage = InMemoryCheckpointStorage::new();
        let running = FlowId::random();
        let paused = FlowId::random();

        storage.add_checkpoint(running, serialized()).await.unwrap();
        storage.add_checkpoint(paused, serialized()).await.unwrap();
        storage
            .update_status(paused, FlowStatus::Paused)
            .await
            .unwrap();

        let to_run = storage.get_checkpoints_to_run().await.unwrap();
        assert_eq!(to_run.len(), 1);
        assert_eq!(to_run[0].0, running);

        let paused_set = storage.get_paused_checkpoints().await.unwrap();
        assert_eq!(paused_set.len(), 1);
        assert_eq!(paused_set[0].0, paused);
    }

    #[tokio::test]
    async fn mark_all_paused_converts_runnable_only() {
        let storage = InMemoryCheckpointStorage::new();
        let a = FlowId::random();
        let b = FlowId::random();
        storage.add_checkpoint(a, serialized()).await.unwrap();
        storage.add_checkpoint(b, serialized()).await.unwrap();
        storage
            .update_status(b, FlowStatus::Hospitalized)
            .await
            .unwrap();

        storage.mark_all_paused().await.unwrap();

        assert_eq!(storage.get_paused_checkpoints().await.unwrap().len(), 1);
        assert_eq!(storage.get_checkpoints_to_run().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn removing_missing_checkpoint_is_fine() {
        let storage = InMemoryCheckpointStorage::new();
        assert!(storage.remove_checkpoint(FlowId::random()).await.is_ok());
    }
}
