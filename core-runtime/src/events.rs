//! Typed events published by the upload core.
//!
//! The manager, router and watchdog emit [`CoreEvent`]s on an [`EventBus`];
//! views and host bridges subscribe. Delivery is a `tokio` broadcast channel:
//! every subscriber sees every event emitted after it subscribed, a slow
//! subscriber gets [`RecvError::Lagged`] and keeps going, and emitting with no
//! subscribers is not an error anyone acts on.
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, UploadEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let mut progress = bus
//!     .stream()
//!     .filter(|event| matches!(event, CoreEvent::Upload(UploadEvent::ChunkSent { .. })));
//!
//! bus.emit(CoreEvent::Upload(UploadEvent::ChunkSent {
//!     task_id: "a9993e364706816aba3e25717850c26c9cd0d89d".to_string(),
//!     offset: 3,
//!     filesize: 3,
//!     percent: 100,
//! }));
//!
//! assert!(progress.recv().await.is_ok());
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

pub use tokio::sync::broadcast::error::RecvError;

/// Per-subscriber backlog used when none is configured.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Upload(UploadEvent),
    Pipeline(PipelineEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

impl CoreEvent {
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Upload(e) => e.description(),
            CoreEvent::Pipeline(e) => e.description(),
        }
    }

    /// How loudly a host should surface the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Upload(e) => e.severity(),
            CoreEvent::Pipeline(e) => e.severity(),
        }
    }

    /// Content identifier the event refers to. `None` for list refreshes and
    /// violations that named no task.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            CoreEvent::Upload(e) => e.task_id(),
            CoreEvent::Pipeline(e) => e.task_id(),
        }
    }
}

// ============================================================================
// Upload Events
// ============================================================================

/// Events about the client side of a transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum UploadEvent {
    /// Task registered after hashing.
    Registered {
        task_id: String,
        /// Wire name of the content type (`artwork`, `video`, `albumfile`).
        content_type: String,
        file_name: String,
        filesize: u64,
    },
    /// Identical bytes were submitted again and joined the existing task.
    Coalesced { task_id: String },
    /// Initiate request handed to the transport.
    Initiated { task_id: String },
    /// Annotations could not be forwarded; the upload continues without them.
    AnnotationRejected { task_id: String, message: String },
    /// A chunk was committed and handed to the transport.
    ChunkSent {
        task_id: String,
        /// Offset after this chunk.
        offset: u64,
        filesize: u64,
        /// Progress percentage (0-100).
        percent: u8,
    },
    /// No activity on a non-terminal task for longer than the stall timeout.
    Stalled {
        task_id: String,
        state: Option<String>,
        idle_secs: u64,
    },
    /// The client gave up on a task (transport failure or stall policy).
    Failed { task_id: String, message: String },
    /// Task retired from the registry.
    Removed { task_id: String },
    /// A notification could not be applied to the task it names.
    ProtocolViolation {
        task_id: Option<String>,
        message: String,
    },
}

impl UploadEvent {
    fn description(&self) -> &str {
        match self {
            UploadEvent::Registered { .. } => "Upload registered",
            UploadEvent::Coalesced { .. } => "Duplicate upload coalesced",
            UploadEvent::Initiated { .. } => "Upload initiated",
            UploadEvent::AnnotationRejected { .. } => "Annotations not delivered",
            UploadEvent::ChunkSent { .. } => "Chunk sent",
            UploadEvent::Stalled { .. } => "Upload stalled",
            UploadEvent::Failed { .. } => "Upload failed",
            UploadEvent::Removed { .. } => "Upload removed",
            UploadEvent::ProtocolViolation { .. } => "Protocol violation",
        }
    }

    fn severity(&self) -> EventSeverity {
        match self {
            UploadEvent::Failed { .. } | UploadEvent::ProtocolViolation { .. } => {
                EventSeverity::Error
            }
            UploadEvent::Stalled { .. } | UploadEvent::AnnotationRejected { .. } => {
                EventSeverity::Warning
            }
            UploadEvent::Registered { .. } => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    fn task_id(&self) -> Option<&str> {
        match self {
            UploadEvent::Registered { task_id, .. }
            | UploadEvent::Coalesced { task_id }
            | UploadEvent::Initiated { task_id }
            | UploadEvent::AnnotationRejected { task_id, .. }
            | UploadEvent::ChunkSent { task_id, .. }
            | UploadEvent::Stalled { task_id, .. }
            | UploadEvent::Failed { task_id, .. }
            | UploadEvent::Removed { task_id } => Some(task_id),
            UploadEvent::ProtocolViolation { task_id, .. } => task_id.as_deref(),
        }
    }
}

// ============================================================================
// Pipeline Events
// ============================================================================

/// Events about the server-side import pipeline as seen by this client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PipelineEvent {
    /// A tracked task moved to a new pipeline state.
    StateChanged {
        task_id: String,
        previous: Option<String>,
        state: String,
        /// Display class of the new state (`good`, `bad`, `active`, `open`).
        class: String,
    },
    /// The server reported an internal error for a task.
    ServerError { task_id: String, state: String },
    /// Artwork import was requested for a task that became ready for integration.
    ArtworkImportRequested {
        task_id: String,
        source_path: String,
        target_path: String,
    },
    /// The observer table was refreshed from a server uploads list.
    TaskListRefreshed { content_type: String, count: usize },
}

impl PipelineEvent {
    fn description(&self) -> &str {
        match self {
            PipelineEvent::StateChanged { .. } => "Pipeline state changed",
            PipelineEvent::ServerError { .. } => "Server reported an internal error",
            PipelineEvent::ArtworkImportRequested { .. } => "Artwork import requested",
            PipelineEvent::TaskListRefreshed { .. } => "Upload list refreshed",
        }
    }

    fn severity(&self) -> EventSeverity {
        match self {
            PipelineEvent::ServerError { .. } => EventSeverity::Error,
            PipelineEvent::StateChanged { class, .. } if class == "bad" => EventSeverity::Warning,
            PipelineEvent::StateChanged { .. } | PipelineEvent::ArtworkImportRequested { .. } => {
                EventSeverity::Info
            }
            PipelineEvent::TaskListRefreshed { .. } => EventSeverity::Debug,
        }
    }

    fn task_id(&self) -> Option<&str> {
        match self {
            PipelineEvent::StateChanged { task_id, .. }
            | PipelineEvent::ServerError { task_id, .. }
            | PipelineEvent::ArtworkImportRequested { task_id, .. } => Some(task_id),
            PipelineEvent::TaskListRefreshed { .. } => None,
        }
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Cloneable publisher handle. All clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// `capacity` is how far a subscriber may fall behind before it lags.
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
        }
    }

    /// Publish to current subscribers and return how many there were.
    pub fn emit(&self, event: CoreEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn stream(&self) -> EventStream {
        EventStream::new(self.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus({} subscribers)", self.subscriber_count())
    }
}

type Predicate = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A subscription that skips events failing an optional predicate.
pub struct EventStream {
    rx: broadcast::Receiver<CoreEvent>,
    predicate: Option<Predicate>,
}

impl EventStream {
    pub fn new(rx: broadcast::Receiver<CoreEvent>) -> Self {
        Self { rx, predicate: None }
    }

    /// Keep only events for which `predicate` holds. Replaces any earlier filter.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }

    fn wanted(&self, event: &CoreEvent) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(event),
            None => true,
        }
    }

    /// Wait for the next wanted event.
    ///
    /// Lagging surfaces as `Err(RecvError::Lagged(n))` once; the stream stays
    /// usable afterwards. `Err(RecvError::Closed)` means every bus is gone.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if self.wanted(&event) {
                return Ok(event);
            }
        }
    }

    /// Next wanted event already buffered, or `None`.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            let event = match self.rx.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Lagged(n)) => return Some(Err(RecvError::Lagged(n))),
                Err(TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            };
            if self.wanted(&event) {
                return Some(Ok(event));
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("filtered", &self.predicate.is_some())
            .finish_non_exhaustive()
    }
}
