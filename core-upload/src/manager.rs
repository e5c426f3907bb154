//! # Upload Manager
//!
//! Client-facing entry point for starting uploads.
//!
//! ## Overview
//!
//! `UploadManager` hashes payloads, registers tasks and sends the initiate
//! and annotate messages. Everything after that is driven by the server
//! through the [`NotificationRouter`](crate::router::NotificationRouter).
//!
//! Submitting bytes that are already being uploaded joins the existing task
//! instead of starting a second one.
//!
//! ## Stall watchdog
//!
//! The server gives no timeout guarantee, and a task whose notifications stop
//! arriving would otherwise wait forever. [`UploadManager::sweep_stalled`]
//! reports every non-terminal task without a registry mutation for longer
//! than [`UploadConfig::stall_timeout`]. With
//! [`UploadConfig::fail_stalled_uploads`] set, tasks still in the upload
//! phase are moved to `uploadfailed` and their payload is released.
//!
//! ## Usage
//!
//! ```ignore
//! let manager = UploadManager::new(transport, clock, events, UploadConfig::default())?;
//!
//! let mut annotations = Annotations::new();
//! annotations.insert("musicpath".into(), json!("Artist/2020 - Album"));
//!
//! let id = manager
//!     .upload_file(Path::new("cover.jpg"), ContentType::Artwork, "image/jpeg", annotations)
//!     .await?;
//! ```

use crate::chunk::{ChunkTransferDriver, DEFAULT_MAX_CHUNK_BYTES};
use crate::error::{Result, UploadError};
use crate::identity::{identify_async, ContentId};
use crate::protocol::OutboundRequest;
use crate::registry::UploadTaskRegistry;
use crate::state::{state_name, PipelineState};
use crate::task::{Annotations, ContentType, TaskSnapshot, UploadMetadata};
use bridge_traits::{Clock, MessageTransport};
use bytes::Bytes;
use core_runtime::events::{CoreEvent, EventBus, UploadEvent};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Default upper bound for a single payload (2 GiB)
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Tuning for the upload pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// Payloads above this size are rejected before hashing
    pub max_payload_bytes: u64,
    /// Largest chunk the server may request
    pub max_chunk_bytes: u64,
    /// Idle time after which a non-terminal task counts as stalled
    pub stall_timeout: Duration,
    pub watchdog_interval: Duration,
    /// Fail stalled tasks that are still in the upload phase
    pub fail_stalled_uploads: bool,
    /// Capacity of the inbound notification channel
    pub notification_buffer_size: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            stall_timeout: Duration::from_secs(120),
            watchdog_interval: Duration::from_secs(15),
            fail_stalled_uploads: false,
            notification_buffer_size: 256,
        }
    }
}

impl UploadConfig {
    pub fn with_max_payload_bytes(mut self, bytes: u64) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    pub fn with_max_chunk_bytes(mut self, bytes: u64) -> Self {
        self.max_chunk_bytes = bytes;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_fail_stalled_uploads(mut self, enabled: bool) -> Self {
        self.fail_stalled_uploads = enabled;
        self
    }

    pub fn with_notification_buffer_size(mut self, size: usize) -> Self {
        self.notification_buffer_size = size;
        self
    }

    /// # Errors
    ///
    /// Returns [`UploadError::Config`] for zero sizes or durations.
    pub fn validate(&self) -> Result<()> {
        if self.max_payload_bytes == 0 {
            return Err(UploadError::Config(
                "max_payload_bytes must be greater than 0".to_string(),
            ));
        }
        if self.max_chunk_bytes == 0 {
            return Err(UploadError::Config(
                "max_chunk_bytes must be greater than 0".to_string(),
            ));
        }
        if self.stall_timeout.is_zero() {
            return Err(UploadError::Config(
                "stall_timeout must be greater than 0".to_string(),
            ));
        }
        if self.watchdog_interval.is_zero() {
            return Err(UploadError::Config(
                "watchdog_interval must be greater than 0".to_string(),
            ));
        }
        if self.notification_buffer_size == 0 {
            return Err(UploadError::Config(
                "notification_buffer_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Upload Manager
// ============================================================================

pub struct UploadManager {
    registry: Arc<UploadTaskRegistry>,
    transport: Arc<dyn MessageTransport>,
    events: EventBus,
    config: UploadConfig,
    /// `updated_at` of each task at the time it was last reported stalled
    stall_reports: Mutex<HashMap<ContentId, i64>>,
}

impl UploadManager {
    /// # Errors
    ///
    /// Returns [`UploadError::Config`] if `config` is invalid.
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: UploadConfig,
    ) -> Result<Self> {
        config.validate()?;
        let driver = ChunkTransferDriver::new(config.max_chunk_bytes);
        Ok(Self {
            registry: Arc::new(UploadTaskRegistry::new(clock, driver)),
            transport,
            events,
            config,
            stall_reports: Mutex::new(HashMap::new()),
        })
    }

    /// Shared registry, handed to the router
    pub fn registry(&self) -> &Arc<UploadTaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    fn emit(&self, event: CoreEvent) {
        self.events.emit(event);
    }

    /// Start uploading `payload`.
    ///
    /// Sends `InitiateUpload` and, when `annotations` is not empty,
    /// `AnnotateUpload`. Returns the task id; identical bytes already in
    /// flight return the existing id without sending anything.
    ///
    /// # Errors
    ///
    /// - [`UploadError::PayloadTooLarge`] above the configured limit
    /// - [`UploadError::Transport`] if the initiate request could not be
    ///   sent; the task is then marked `uploadfailed`
    ///
    /// A failed `AnnotateUpload` does not fail the upload. It is logged and
    /// published as [`UploadEvent::AnnotationRejected`]; the annotations stay
    /// in the registry.
    #[instrument(skip(self, payload, annotations), fields(size = payload.len(), file = %metadata.file_name))]
    pub async fn upload(
        &self,
        payload: Bytes,
        metadata: UploadMetadata,
        annotations: Annotations,
    ) -> Result<ContentId> {
        let size = payload.len() as u64;
        if size > self.config.max_payload_bytes {
            return Err(UploadError::PayloadTooLarge {
                size,
                limit: self.config.max_payload_bytes,
            });
        }

        let id = identify_async(payload.clone()).await?;

        let task = match self.registry.create(id.clone(), payload, metadata).await {
            Ok(task) => task,
            Err(UploadError::DuplicateTask { .. }) => {
                debug!(task_id = %id.short(), "Upload already in flight");
                self.emit(CoreEvent::Upload(UploadEvent::Coalesced {
                    task_id: id.to_string(),
                }));
                return Ok(id);
            }
            Err(e) => return Err(e),
        };

        info!(
            task_id = %id.short(),
            content_type = %task.content_type,
            filesize = task.filesize,
            "Registered upload"
        );
        self.emit(CoreEvent::Upload(UploadEvent::Registered {
            task_id: id.to_string(),
            content_type: task.content_type.to_string(),
            file_name: task.file_name.clone(),
            filesize: task.filesize,
        }));

        if !annotations.is_empty() {
            self.registry
                .merge_annotations(&id, annotations.clone())
                .await?;
        }

        if let Err(e) = OutboundRequest::initiate_upload(&task)
            .send(self.transport.as_ref())
            .await
        {
            self.fail_locally(&id, &e).await;
            return Err(e);
        }
        self.emit(CoreEvent::Upload(UploadEvent::Initiated {
            task_id: id.to_string(),
        }));

        if !annotations.is_empty() {
            let annotated = OutboundRequest::AnnotateUpload {
                task_id: id.clone(),
                annotations,
            }
            .send(self.transport.as_ref())
            .await;
            // The upload itself is under way; annotations can be resent with `annotate`.
            if let Err(e) = annotated {
                warn!(task_id = %id.short(), error = %e, "Annotations not delivered");
                self.emit(CoreEvent::Upload(UploadEvent::AnnotationRejected {
                    task_id: id.to_string(),
                    message: e.to_string(),
                }));
            }
        }

        Ok(id)
    }

    /// Read a file and upload its contents.
    pub async fn upload_file(
        &self,
        path: &Path,
        content_type: ContentType,
        mime_type: &str,
        annotations: Annotations,
    ) -> Result<ContentId> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.upload(
            Bytes::from(bytes),
            UploadMetadata::new(content_type, mime_type, file_name),
            annotations,
        )
        .await
    }

    /// Attach annotations to a live task and forward them to the server.
    ///
    /// # Errors
    ///
    /// [`UploadError::TaskNotFound`] or [`UploadError::TaskTerminal`] if the
    /// task can no longer be annotated; nothing is sent in that case.
    pub async fn annotate(&self, id: &ContentId, annotations: Annotations) -> Result<()> {
        self.registry
            .merge_annotations(id, annotations.clone())
            .await?;

        OutboundRequest::AnnotateUpload {
            task_id: id.clone(),
            annotations,
        }
        .send(self.transport.as_ref())
        .await
    }

    /// Forget a task locally. Later chunk requests for it are rejected.
    pub async fn retire(&self, id: &ContentId) -> Option<TaskSnapshot> {
        let removed = self.registry.remove(id).await?;
        self.stall_reports.lock().await.remove(id);

        info!(task_id = %id.short(), state = state_name(removed.state), "Retired upload");
        self.emit(CoreEvent::Upload(UploadEvent::Removed {
            task_id: id.to_string(),
        }));
        Some(removed.snapshot())
    }

    pub async fn task(&self, id: &ContentId) -> Result<TaskSnapshot> {
        Ok(self.registry.get(id).await?.snapshot())
    }

    /// All tasks, oldest first
    pub async fn tasks(&self) -> Vec<TaskSnapshot> {
        self.registry.snapshots().await
    }

    /// Ask the server for its full task list. The answer reaches the router
    /// as a `ShowUploads` notification.
    pub async fn request_uploads_list(&self) -> Result<()> {
        OutboundRequest::GetUploads
            .send(self.transport.as_ref())
            .await
    }

    async fn fail_locally(&self, id: &ContentId, cause: &UploadError) {
        error!(task_id = %id.short(), error = %cause, "Upload failed");
        if let Err(e) = self
            .registry
            .mutate_state(id, PipelineState::UploadFailed)
            .await
        {
            warn!(task_id = %id.short(), error = %e, "Could not mark upload as failed");
        }
        self.emit(CoreEvent::Upload(UploadEvent::Failed {
            task_id: id.to_string(),
            message: cause.to_string(),
        }));
    }

    // ========================================================================
    // Stall Watchdog
    // ========================================================================

    /// Report stalled tasks once per period of inactivity.
    ///
    /// Returns the ids reported by this sweep.
    pub async fn sweep_stalled(&self) -> Vec<ContentId> {
        let now = self.registry.clock().unix_timestamp_millis();
        let stalled = self.registry.stalled(now, self.config.stall_timeout).await;

        let mut reports = self.stall_reports.lock().await;
        reports.retain(|id, _| stalled.iter().any(|task| &task.id == id));

        let mut reported = Vec::new();
        for task in stalled {
            if reports.get(&task.id) == Some(&task.updated_at) {
                continue;
            }
            reports.insert(task.id.clone(), task.updated_at);

            let idle_secs = u64::try_from(now.saturating_sub(task.updated_at) / 1000).unwrap_or(0);
            warn!(
                task_id = %task.id.short(),
                state = state_name(task.state),
                idle_secs,
                "Upload stalled"
            );
            self.emit(CoreEvent::Upload(UploadEvent::Stalled {
                task_id: task.id.to_string(),
                state: task.state.map(|s| s.to_string()),
                idle_secs,
            }));

            let in_upload_phase = task.state.map_or(true, |s| s.holds_payload());
            if self.config.fail_stalled_uploads && in_upload_phase {
                let cause = UploadError::Stalled {
                    task_id: task.id.to_string(),
                    idle_secs,
                };
                self.fail_locally(&task.id, &cause).await;
            }

            reported.push(task.id);
        }
        reported
    }

    /// Run [`sweep_stalled`](Self::sweep_stalled) every `watchdog_interval`
    /// until `cancel` fires.
    pub fn spawn_watchdog(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.config.watchdog_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Stall watchdog stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let stalled = self.sweep_stalled().await;
                        if !stalled.is_empty() {
                            debug!(count = stalled.len(), "Stall sweep finished");
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for UploadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
