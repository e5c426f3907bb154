//! # Upload Task Registry
//!
//! Owns every live upload task, keyed by content identifier.
//!
//! ## Overview
//!
//! All operations take the one registry lock, so each mutation is atomic
//! with respect to every other. The registry enforces:
//! - at most one live task per content identifier
//! - `0 <= offset <= filesize`, offset never decreasing
//! - pipeline transitions allowed by [`PipelineStateMachine`]
//! - the payload is dropped once the server no longer needs it
//!
//! Tasks are never evicted on a timer. They leave through [`remove`]
//! (explicitly or when the server reports `remove`), or are replaced when
//! the same bytes are uploaded again after reaching a terminal state.
//!
//! [`remove`]: UploadTaskRegistry::remove

use crate::chunk::{Chunk, ChunkTransferDriver};
use crate::error::{Result, UploadError};
use crate::identity::ContentId;
use crate::state::{state_name, PipelineState, PipelineStateMachine};
use crate::task::{Annotations, TaskSnapshot, UploadMetadata, UploadTask};
use bridge_traits::Clock;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, trace};

pub struct UploadTaskRegistry {
    tasks: RwLock<HashMap<ContentId, UploadTask>>,
    clock: Arc<dyn Clock>,
    driver: ChunkTransferDriver,
}

impl UploadTaskRegistry {
    pub fn new(clock: Arc<dyn Clock>, driver: ChunkTransferDriver) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            clock,
            driver,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn driver(&self) -> &ChunkTransferDriver {
        &self.driver
    }

    fn now(&self) -> i64 {
        self.clock.unix_timestamp_millis()
    }

    /// Register a new task.
    ///
    /// A terminal task with the same id is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::DuplicateTask`] if a live task with `id` exists.
    pub async fn create(
        &self,
        id: ContentId,
        payload: Bytes,
        metadata: UploadMetadata,
    ) -> Result<UploadTask> {
        let mut tasks = self.tasks.write().await;

        if let Some(existing) = tasks.get(&id) {
            if !existing.is_terminal() {
                return Err(UploadError::DuplicateTask {
                    task_id: id.to_string(),
                });
            }
            debug!(
                task_id = %id.short(),
                state = state_name(existing.state),
                "Replacing terminal task"
            );
        }

        let task = UploadTask::new(id.clone(), payload, metadata, self.now());
        tasks.insert(id, task.clone());
        Ok(task)
    }

    /// # Errors
    ///
    /// Returns [`UploadError::TaskNotFound`] if no task has `id`.
    pub async fn get(&self, id: &ContentId) -> Result<UploadTask> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    pub async fn contains(&self, id: &ContentId) -> bool {
        self.tasks.read().await.contains_key(id)
    }

    /// Move the offset forward.
    ///
    /// # Errors
    ///
    /// - [`UploadError::TaskNotFound`] if no task has `id`
    /// - [`UploadError::InvalidOffset`] if `new_offset` decreases or passes `filesize`
    pub async fn mutate_offset(&self, id: &ContentId, new_offset: u64) -> Result<()> {
        let now = self.now();
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| not_found(id))?;
        commit_offset(task, new_offset, now)
    }

    /// Apply a pipeline state, returning the previous one.
    ///
    /// Entering any state other than `waitforchunk` drops the payload.
    ///
    /// # Errors
    ///
    /// - [`UploadError::TaskNotFound`] if no task has `id`
    /// - [`UploadError::IllegalTransition`] if the transition table forbids it
    pub async fn mutate_state(
        &self,
        id: &ContentId,
        new_state: PipelineState,
    ) -> Result<Option<PipelineState>> {
        let now = self.now();
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| not_found(id))?;

        PipelineStateMachine::validate(id, task.state, new_state)?;

        let previous = task.state.replace(new_state);
        if !new_state.holds_payload() && task.payload.take().is_some() {
            trace!(task_id = %id.short(), state = %new_state, "Released payload");
        }
        task.updated_at = now;
        Ok(previous)
    }

    /// Shallow-merge annotations into the task.
    ///
    /// # Errors
    ///
    /// - [`UploadError::TaskNotFound`] if no task has `id`
    /// - [`UploadError::TaskTerminal`] if the task reached a terminal state
    pub async fn merge_annotations(&self, id: &ContentId, partial: Annotations) -> Result<()> {
        let now = self.now();
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| not_found(id))?;

        if let Some(state) = task.state.filter(|s| s.is_terminal()) {
            return Err(UploadError::TaskTerminal {
                task_id: id.to_string(),
                state: state.to_string(),
            });
        }

        task.annotations.extend(partial);
        task.updated_at = now;
        Ok(())
    }

    /// Retire a task. Removing an unknown id is a no-op.
    pub async fn remove(&self, id: &ContentId) -> Option<UploadTask> {
        let mut removed = self.tasks.write().await.remove(id)?;
        removed.payload = None;
        Some(removed)
    }

    /// Slice the next chunk and commit its offset in one step.
    ///
    /// # Errors
    ///
    /// [`UploadError::TaskNotFound`] or any error of
    /// [`ChunkTransferDriver::next_chunk`].
    pub async fn take_next_chunk(&self, id: &ContentId, requested: u64) -> Result<Chunk> {
        let now = self.now();
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| not_found(id))?;

        let chunk = self.driver.next_chunk(task, requested)?;
        commit_offset(task, chunk.new_offset, now)?;
        Ok(chunk)
    }

    /// Snapshots of all tasks, oldest first.
    pub async fn snapshots(&self) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<_> = self
            .tasks
            .read()
            .await
            .values()
            .map(UploadTask::snapshot)
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        snapshots
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Non-terminal tasks without a mutation for at least `timeout`.
    pub async fn stalled(&self, now: i64, timeout: Duration) -> Vec<TaskSnapshot> {
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        self.tasks
            .read()
            .await
            .values()
            .filter(|task| !task.is_terminal())
            .filter(|task| now.saturating_sub(task.updated_at) >= timeout_ms)
            .map(UploadTask::snapshot)
            .collect()
    }
}

impl std::fmt::Debug for UploadTaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadTaskRegistry")
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}

fn not_found(id: &ContentId) -> UploadError {
    UploadError::TaskNotFound {
        task_id: id.to_string(),
    }
}

fn commit_offset(task: &mut UploadTask, new_offset: u64, now: i64) -> Result<()> {
    if new_offset < task.offset || new_offset > task.filesize {
        return Err(UploadError::InvalidOffset {
            task_id: task.id.to_string(),
            offset: new_offset,
            current: task.offset,
            filesize: task.filesize,
        });
    }
    task.offset = new_offset;
    task.updated_at = now;
    Ok(())
}
