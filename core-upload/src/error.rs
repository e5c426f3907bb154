use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    // Identity
    #[error("Content identification failed: {0}")]
    Identity(String),

    #[error("Invalid content identifier: {0}")]
    InvalidContentId(String),

    #[error("Payload of {size} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    // Protocol sequencing
    #[error("Upload task {task_id} already exists")]
    DuplicateTask { task_id: String },

    #[error("Upload task {task_id} not found")]
    TaskNotFound { task_id: String },

    #[error("Invalid offset {offset} for task {task_id} (current {current}, filesize {filesize})")]
    InvalidOffset {
        task_id: String,
        offset: u64,
        current: u64,
        filesize: u64,
    },

    #[error("Invalid state transition for task {task_id} from {from} to {to}")]
    IllegalTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("No data remaining for task {task_id}")]
    NoDataRemaining { task_id: String },

    #[error("Invalid chunk size {requested} (allowed 1..={max})")]
    InvalidChunkSize { requested: u64, max: u64 },

    #[error("Payload of task {task_id} has already been released")]
    PayloadReleased { task_id: String },

    #[error("Upload task {task_id} is in terminal state {state}")]
    TaskTerminal { task_id: String, state: String },

    #[error("Malformed import trigger: {0}")]
    MalformedTrigger(String),

    #[error("Malformed notification: {0}")]
    MalformedNotification(String),

    #[error("Invalid pipeline state: {0}")]
    InvalidState(String),

    #[error("Invalid content type: {0}")]
    InvalidContentType(String),

    // Local
    #[error("Upload task {task_id} stalled after {idle_secs} seconds without server activity")]
    Stalled { task_id: String, idle_secs: u64 },

    #[error("Invalid upload configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] BridgeError),
}

impl UploadError {
    /// Whether the error means a message arrived out of sequence for its task.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            UploadError::DuplicateTask { .. }
                | UploadError::TaskNotFound { .. }
                | UploadError::InvalidOffset { .. }
                | UploadError::IllegalTransition { .. }
                | UploadError::NoDataRemaining { .. }
                | UploadError::InvalidChunkSize { .. }
                | UploadError::PayloadReleased { .. }
                | UploadError::TaskTerminal { .. }
                | UploadError::MalformedTrigger(_)
                | UploadError::MalformedNotification(_)
                | UploadError::InvalidState(_)
                | UploadError::InvalidContentType(_)
        )
    }

    /// The task the error is scoped to, when known.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            UploadError::DuplicateTask { task_id }
            | UploadError::TaskNotFound { task_id }
            | UploadError::InvalidOffset { task_id, .. }
            | UploadError::IllegalTransition { task_id, .. }
            | UploadError::NoDataRemaining { task_id }
            | UploadError::PayloadReleased { task_id }
            | UploadError::TaskTerminal { task_id, .. }
            | UploadError::Stalled { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, UploadError>;
