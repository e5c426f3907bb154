//! # Notification Router
//!
//! Applies server notifications to the task registry and derives the
//! client's reactions.
//!
//! ## Overview
//!
//! - **ChunkRequest**: commit the next chunk and send `UploadChunk`. This is
//!   the only place chunk transmissions start.
//! - **StateUpdate**: apply the reported state, retire removed tasks and
//!   trigger the artwork import when an artwork task becomes ready for
//!   integration.
//! - **InternalError**: apply the reported failure state. Nothing is retried.
//! - **ShowUploads**: refresh the observer table.
//!
//! Every registry commit happens before the events and sends derived from it.
//!
//! ## Ordering
//!
//! [`NotificationRouter::run`] consumes one channel sequentially, so the
//! notifications of a task are applied in arrival order. An error is scoped
//! to the notification that caused it: the loop logs it, publishes a
//! [`UploadEvent::ProtocolViolation`] and moves on.

use crate::error::{Result, UploadError};
use crate::identity::ContentId;
use crate::protocol::{InboundMessage, NotificationKind, OutboundRequest, UploadNotification, UploadsList};
use crate::registry::UploadTaskRegistry;
use crate::state::{state_name, PipelineState, PipelineStateMachine};
use crate::task::{ContentType, UploadTask};
use crate::trigger::{ImportTrigger, MUSIC_PATH_ANNOTATION};
use crate::view::UploadsTable;
use bridge_traits::{MessageTransport, RawNotification};
use core_runtime::events::{CoreEvent, EventBus, PipelineEvent, UploadEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

/// What a notification caused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A chunk was committed and sent
    ChunkSent {
        task_id: ContentId,
        offset: u64,
        new_offset: u64,
    },
    /// A new pipeline state was applied
    StateApplied {
        task_id: ContentId,
        previous: Option<PipelineState>,
        state: PipelineState,
        artwork_import: bool,
    },
    /// The notification repeated what the registry already holds
    Unchanged { task_id: ContentId },
    /// The task was retired from the registry
    Retired { task_id: ContentId },
    /// The task belongs to another client; only the table was refreshed
    Untracked { task_id: ContentId },
    TableRefreshed { rows: usize },
    /// Not addressed to the upload pipeline
    Ignored,
}

pub struct NotificationRouter {
    registry: Arc<UploadTaskRegistry>,
    transport: Arc<dyn MessageTransport>,
    trigger: ImportTrigger,
    events: EventBus,
    table: RwLock<UploadsTable>,
    artwork_import: bool,
}

impl NotificationRouter {
    pub fn new(
        registry: Arc<UploadTaskRegistry>,
        transport: Arc<dyn MessageTransport>,
        events: EventBus,
    ) -> Self {
        Self {
            trigger: ImportTrigger::new(Arc::clone(&transport)),
            registry,
            transport,
            events,
            table: RwLock::new(UploadsTable::new()),
            artwork_import: true,
        }
    }

    /// Enable or disable the automatic artwork import.
    pub fn with_artwork_import(mut self, enabled: bool) -> Self {
        self.artwork_import = enabled;
        self
    }

    /// Current observer table
    pub async fn table(&self) -> UploadsTable {
        self.table.read().await.clone()
    }

    fn emit(&self, event: CoreEvent) {
        self.events.emit(event);
    }

    /// Parse and route a raw notification.
    pub async fn handle_raw(&self, raw: &RawNotification) -> Result<RouteOutcome> {
        match InboundMessage::parse(raw)? {
            Some(InboundMessage::Upload(notification)) => self.handle(notification).await,
            Some(InboundMessage::UploadsList(list)) => Ok(self.handle_uploads_list(list).await),
            None => {
                trace!(fnc = %raw.fnc, sig = %raw.sig, "Ignoring foreign notification");
                Ok(RouteOutcome::Ignored)
            }
        }
    }

    #[instrument(skip(self, notification), fields(task_id = %notification.task_id.short(), kind = %notification.kind))]
    pub async fn handle(&self, notification: UploadNotification) -> Result<RouteOutcome> {
        match notification.kind {
            NotificationKind::ChunkRequest => self.on_chunk_request(notification).await,
            NotificationKind::StateUpdate => self.on_state_update(notification).await,
            NotificationKind::InternalError => self.on_internal_error(notification).await,
        }
    }

    /// Refresh the observer table from a `ShowUploads` answer.
    pub async fn handle_uploads_list(&self, list: UploadsList) -> RouteOutcome {
        let rows = list.len();
        self.refresh_table(list).await;
        RouteOutcome::TableRefreshed { rows }
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    async fn on_chunk_request(&self, notification: UploadNotification) -> Result<RouteOutcome> {
        let id = notification.task_id;

        if let Some(server_task) = &notification.task {
            self.table.write().await.try_update_row(server_task);
        }

        let chunk_size = notification.chunk_size.ok_or_else(|| {
            UploadError::MalformedNotification(format!("ChunkRequest for {} without chunksize", id.short()))
        })?;

        let reported = notification.state.unwrap_or(PipelineState::WaitForChunk);
        if reported != PipelineState::WaitForChunk {
            return Err(UploadError::MalformedNotification(format!(
                "ChunkRequest for {} reports state {}",
                id.short(),
                reported
            )));
        }

        let task = self.registry.get(&id).await?;
        if let Some(state) = task.state {
            if state.is_terminal() {
                return Err(UploadError::TaskTerminal {
                    task_id: id.to_string(),
                    state: state.to_string(),
                });
            }
            if !state.holds_payload() {
                return Err(UploadError::NoDataRemaining {
                    task_id: id.to_string(),
                });
            }
        }

        if task.state.is_none() {
            let previous = self.registry.mutate_state(&id, PipelineState::WaitForChunk).await?;
            self.emit_state_changed(&id, previous, PipelineState::WaitForChunk);
        }

        let chunk = self.registry.take_next_chunk(&id, chunk_size).await?;
        let sent = OutboundRequest::UploadChunk {
            task_id: id.clone(),
            chunk_data: chunk.to_hex(),
        }
        .send(self.transport.as_ref())
        .await;
        if let Err(e) = sent {
            // The offset already counts this chunk; the stream cannot continue.
            self.fail_upload(&id, &e).await;
            return Err(e);
        }

        debug!(
            offset = chunk.offset,
            new_offset = chunk.new_offset,
            filesize = task.filesize,
            "Sent chunk"
        );
        self.emit(CoreEvent::Upload(UploadEvent::ChunkSent {
            task_id: id.to_string(),
            offset: chunk.new_offset,
            filesize: task.filesize,
            percent: crate::task::percent(chunk.new_offset, task.filesize),
        }));

        Ok(RouteOutcome::ChunkSent {
            task_id: id,
            offset: chunk.offset,
            new_offset: chunk.new_offset,
        })
    }

    async fn on_state_update(&self, notification: UploadNotification) -> Result<RouteOutcome> {
        let UploadNotification {
            task_id: id,
            state,
            task: server_task,
            uploads_list,
            ..
        } = notification;

        if let Some(list) = uploads_list {
            self.refresh_table(list).await;
        }

        let task = match self.registry.get(&id).await {
            Ok(task) => task,
            Err(UploadError::TaskNotFound { .. }) => return Ok(RouteOutcome::Untracked { task_id: id }),
            Err(e) => return Err(e),
        };

        let Some(state) = state else {
            return Ok(RouteOutcome::Unchanged { task_id: id });
        };

        let repeated_terminal = task.state == Some(state) && state.is_terminal();
        if state != PipelineState::Remove && !repeated_terminal {
            PipelineStateMachine::validate(&id, task.state, state)?;
        }

        if let Some(server_task) = &server_task {
            if !task.is_terminal() && !server_task.annotations.is_empty() {
                self.registry
                    .merge_annotations(&id, server_task.annotations.clone())
                    .await?;
            }
        }

        let outcome = self.apply_state(&task, state).await?;

        if let RouteOutcome::StateApplied {
            previous,
            state: PipelineState::ReadyForIntegration,
            ..
        } = &outcome
        {
            if self.should_import_artwork(&task, *previous) {
                let source = server_task.as_ref().and_then(|t| t.preprocessedpath.as_deref());
                self.import_artwork(&id, source).await?;
                return Ok(RouteOutcome::StateApplied {
                    task_id: id,
                    previous: *previous,
                    state: PipelineState::ReadyForIntegration,
                    artwork_import: true,
                });
            }
        }

        Ok(outcome)
    }

    async fn on_internal_error(&self, notification: UploadNotification) -> Result<RouteOutcome> {
        let id = notification.task_id;

        if let Some(list) = notification.uploads_list {
            self.refresh_table(list).await;
        }

        let task = match self.registry.get(&id).await {
            Ok(task) => task,
            Err(UploadError::TaskNotFound { .. }) => return Ok(RouteOutcome::Untracked { task_id: id }),
            Err(e) => return Err(e),
        };

        warn!(state = state_name(notification.state), "Server reported an internal error");
        self.emit(CoreEvent::Pipeline(PipelineEvent::ServerError {
            task_id: id.to_string(),
            state: state_name(notification.state).to_string(),
        }));

        match notification.state {
            Some(state) => self.apply_state(&task, state).await,
            None => Ok(RouteOutcome::Unchanged { task_id: id }),
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Apply `state` to a tracked task. `remove` retires it.
    async fn apply_state(&self, task: &UploadTask, state: PipelineState) -> Result<RouteOutcome> {
        let id = task.id.clone();

        if state == PipelineState::Remove {
            self.registry.remove(&id).await;
            info!(task_id = %id.short(), "Upload removed by server");
            self.emit_state_changed(&id, task.state, state);
            self.emit(CoreEvent::Upload(UploadEvent::Removed {
                task_id: id.to_string(),
            }));
            return Ok(RouteOutcome::Retired { task_id: id });
        }

        if task.state == Some(state) && state.is_terminal() {
            return Ok(RouteOutcome::Unchanged { task_id: id });
        }

        let previous = self.registry.mutate_state(&id, state).await?;
        if previous != Some(state) {
            self.emit_state_changed(&id, previous, state);
        }

        Ok(RouteOutcome::StateApplied {
            task_id: id,
            previous,
            state,
            artwork_import: false,
        })
    }

    async fn fail_upload(&self, id: &ContentId, cause: &UploadError) {
        error!(task_id = %id.short(), error = %cause, "Chunk transfer failed");
        match self.registry.mutate_state(id, PipelineState::UploadFailed).await {
            Ok(previous) => self.emit_state_changed(id, previous, PipelineState::UploadFailed),
            Err(e) => warn!(task_id = %id.short(), error = %e, "Could not mark upload as failed"),
        }
        self.emit(CoreEvent::Upload(UploadEvent::Failed {
            task_id: id.to_string(),
            message: cause.to_string(),
        }));
    }

    fn should_import_artwork(&self, task: &UploadTask, previous: Option<PipelineState>) -> bool {
        self.artwork_import
            && task.content_type == ContentType::Artwork
            && previous != Some(PipelineState::ReadyForIntegration)
    }

    async fn import_artwork(&self, id: &ContentId, source: Option<&str>) -> Result<()> {
        let annotations = self.registry.get(id).await?.annotations;
        let target = annotations
            .get(MUSIC_PATH_ANNOTATION)
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let request = self
            .trigger
            .trigger_artwork_import(source, target.as_deref(), annotations.clone())
            .await?;

        self.emit(CoreEvent::Pipeline(PipelineEvent::ArtworkImportRequested {
            task_id: id.to_string(),
            source_path: request.source_path,
            target_path: request.target_path,
        }));
        Ok(())
    }

    async fn refresh_table(&self, list: UploadsList) {
        let counts = ContentType::ALL.map(|ct| (ct, list.for_type(ct).len()));
        self.table.write().await.apply_list(list);

        for (content_type, count) in counts {
            self.emit(CoreEvent::Pipeline(PipelineEvent::TaskListRefreshed {
                content_type: content_type.to_string(),
                count,
            }));
        }
    }

    fn emit_state_changed(&self, id: &ContentId, previous: Option<PipelineState>, state: PipelineState) {
        debug!(
            task_id = %id.short(),
            previous = state_name(previous),
            state = %state,
            "Pipeline state changed"
        );
        self.emit(CoreEvent::Pipeline(PipelineEvent::StateChanged {
            task_id: id.to_string(),
            previous: previous.map(|s| s.to_string()),
            state: state.to_string(),
            class: state.class().to_string(),
        }));
    }

    // ========================================================================
    // Event Loop
    // ========================================================================

    /// Consume notifications until the channel closes or `cancel` fires.
    pub async fn run(self: Arc<Self>, mut notifications: mpsc::Receiver<RawNotification>, cancel: CancellationToken) {
        info!("Notification router started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Notification router cancelled");
                    break;
                }
                next = notifications.recv() => {
                    match next {
                        Some(raw) => self.dispatch(&raw).await,
                        None => {
                            debug!("Notification channel closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, raw: &RawNotification) {
        match self.handle_raw(raw).await {
            Ok(outcome) => trace!(?outcome, "Notification routed"),
            Err(e) if e.is_protocol_violation() => {
                let task_id = e.task_id().map(str::to_string).or_else(|| {
                    raw.data
                        .get("taskid")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                });
                warn!(sig = %raw.sig, task_id = ?task_id, error = %e, "Rejected notification");
                self.emit(CoreEvent::Upload(UploadEvent::ProtocolViolation {
                    task_id,
                    message: e.to_string(),
                }));
            }
            Err(e) => {
                error!(sig = %raw.sig, error = %e, "Failed to handle notification");
            }
        }
    }
}

impl std::fmt::Debug for NotificationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRouter")
            .field("artwork_import", &self.artwork_import)
            .finish_non_exhaustive()
    }
}
