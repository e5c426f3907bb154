//! # Wire Protocol
//!
//! Typed forms of the messages exchanged with the server.
//!
//! ## Outbound
//!
//! | Request                 | Kind    | Response signal    |
//! |-------------------------|---------|--------------------|
//! | `InitiateUpload`        | request | `UploadingContent` |
//! | `AnnotateUpload`        | call    |                    |
//! | `UploadChunk`           | call    |                    |
//! | `InitiateArtworkImport` | request | `ImportingArtwork` |
//! | `GetUploads`            | request | `ShowUploads`      |
//!
//! ## Inbound
//!
//! Upload notifications arrive with `fnc == "MusicDB:Upload"` and one of
//! the signals `ChunkRequest`, `StateUpdate` or `InternalError`. The answer
//! to `GetUploads` arrives with `fnc == "GetUploads"` and `sig == "ShowUploads"`.
//! Anything else is not addressed to the upload pipeline and is ignored.

use crate::error::{Result, UploadError};
use crate::identity::ContentId;
use crate::state::PipelineState;
use crate::task::{Annotations, ContentType, UploadTask};
use bridge_traits::{MessageTransport, OutboundMessage, RawNotification};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

pub const NOTIFICATION_FUNCTION: &str = "MusicDB:Upload";
pub const UPLOADS_LIST_FUNCTION: &str = "GetUploads";
pub const UPLOADS_LIST_SIGNAL: &str = "ShowUploads";
pub const INITIATE_UPLOAD_SIGNAL: &str = "UploadingContent";
pub const ARTWORK_IMPORT_SIGNAL: &str = "ImportingArtwork";

// ============================================================================
// Outbound
// ============================================================================

/// A message the client sends to the server
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundRequest {
    InitiateUpload {
        task_id: ContentId,
        mime_type: String,
        content_type: ContentType,
        filesize: u64,
        checksum: String,
        file_name: String,
    },
    AnnotateUpload {
        task_id: ContentId,
        annotations: Annotations,
    },
    UploadChunk {
        task_id: ContentId,
        /// Hex encoded chunk bytes
        chunk_data: String,
    },
    InitiateArtworkImport {
        source_path: String,
        target_path: String,
        /// Echoed back with the `ImportingArtwork` response
        annotations: Annotations,
    },
    GetUploads,
}

impl OutboundRequest {
    pub fn initiate_upload(task: &UploadTask) -> Self {
        OutboundRequest::InitiateUpload {
            task_id: task.id.clone(),
            mime_type: task.mime_type.clone(),
            content_type: task.content_type,
            filesize: task.filesize,
            checksum: task.checksum.clone(),
            file_name: task.file_name.clone(),
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            OutboundRequest::InitiateUpload { .. } => "InitiateUpload",
            OutboundRequest::AnnotateUpload { .. } => "AnnotateUpload",
            OutboundRequest::UploadChunk { .. } => "UploadChunk",
            OutboundRequest::InitiateArtworkImport { .. } => "InitiateArtworkImport",
            OutboundRequest::GetUploads => "GetUploads",
        }
    }

    /// Signal of the answer, `None` for fire-and-forget calls
    pub fn response_signal(&self) -> Option<&'static str> {
        match self {
            OutboundRequest::InitiateUpload { .. } => Some(INITIATE_UPLOAD_SIGNAL),
            OutboundRequest::InitiateArtworkImport { .. } => Some(ARTWORK_IMPORT_SIGNAL),
            OutboundRequest::GetUploads => Some(UPLOADS_LIST_SIGNAL),
            OutboundRequest::AnnotateUpload { .. } | OutboundRequest::UploadChunk { .. } => None,
        }
    }

    pub fn arguments(&self) -> Value {
        match self {
            OutboundRequest::InitiateUpload {
                task_id,
                mime_type,
                content_type,
                filesize,
                checksum,
                file_name,
            } => json!({
                "taskid": task_id,
                "mimetype": mime_type,
                "contenttype": content_type,
                "filesize": filesize,
                "checksum": checksum,
                "filename": file_name,
            }),
            OutboundRequest::AnnotateUpload {
                task_id,
                annotations,
            } => {
                let mut arguments = annotations.clone();
                arguments.insert("taskid".to_string(), Value::String(task_id.to_string()));
                Value::Object(arguments)
            }
            OutboundRequest::UploadChunk {
                task_id,
                chunk_data,
            } => json!({
                "taskid": task_id,
                "chunkdata": chunk_data,
            }),
            OutboundRequest::InitiateArtworkImport {
                source_path,
                target_path,
                ..
            } => json!({
                "sourcepath": source_path,
                "targetpath": target_path,
            }),
            OutboundRequest::GetUploads => Value::Object(Map::new()),
        }
    }

    /// Pass-through value the server echoes back with the response
    pub fn pass(&self) -> Option<Value> {
        match self {
            OutboundRequest::InitiateUpload { task_id, .. } => Some(json!({ "taskid": task_id })),
            OutboundRequest::InitiateArtworkImport { annotations, .. } => {
                Some(json!({ "annotations": annotations }))
            }
            _ => None,
        }
    }

    pub fn to_message(&self) -> OutboundMessage {
        match self.response_signal() {
            Some(signal) => {
                OutboundMessage::request(self.method(), signal, self.arguments(), self.pass())
            }
            None => OutboundMessage::call(self.method(), self.arguments()),
        }
    }

    /// Hand the message to the transport.
    pub async fn send(&self, transport: &dyn MessageTransport) -> Result<()> {
        match self.response_signal() {
            Some(signal) => {
                transport
                    .request(self.method(), signal, self.arguments(), self.pass())
                    .await?
            }
            None => transport.call(self.method(), self.arguments()).await?,
        }
        Ok(())
    }
}

// ============================================================================
// Inbound
// ============================================================================

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The server's view of an upload task
///
/// Only the fields the client acts on are typed; everything else is kept in
/// `extra` for observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerUploadTask {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "contenttype")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub preprocessedpath: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub annotations: Annotations,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServerUploadTask {
    /// Typed content type, `None` when absent or unknown
    pub fn content_type(&self) -> Option<ContentType> {
        self.content_type.as_deref().and_then(|s| s.parse().ok())
    }

    /// Typed state, `None` when absent or unknown
    pub fn pipeline_state(&self) -> Option<PipelineState> {
        self.state.as_deref().and_then(|s| s.parse().ok())
    }
}

/// All tasks known to the server, grouped by content type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadsList {
    #[serde(default, deserialize_with = "null_as_default")]
    pub videos: Vec<ServerUploadTask>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub albumfiles: Vec<ServerUploadTask>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub artworks: Vec<ServerUploadTask>,
}

impl UploadsList {
    pub fn for_type(&self, content_type: ContentType) -> &[ServerUploadTask] {
        match content_type {
            ContentType::Video => &self.videos,
            ContentType::AlbumFile => &self.albumfiles,
            ContentType::Artwork => &self.artworks,
        }
    }

    pub fn len(&self) -> usize {
        self.videos.len() + self.albumfiles.len() + self.artworks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Signal of an upload notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// The server wants the next chunk
    ChunkRequest,
    StateUpdate,
    /// Server-side failure, carries the resulting state
    InternalError,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ChunkRequest => "ChunkRequest",
            NotificationKind::StateUpdate => "StateUpdate",
            NotificationKind::InternalError => "InternalError",
        }
    }

    pub fn from_signal(sig: &str) -> Option<Self> {
        match sig {
            "ChunkRequest" => Some(NotificationKind::ChunkRequest),
            "StateUpdate" => Some(NotificationKind::StateUpdate),
            "InternalError" => Some(NotificationKind::InternalError),
            _ => None,
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct NotificationData {
    #[serde(default)]
    taskid: Option<String>,
    #[serde(default)]
    uploadtask: Option<ServerUploadTask>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    chunksize: Option<u64>,
    #[serde(default)]
    uploadslist: Option<UploadsList>,
}

/// A parsed `MusicDB:Upload` notification
#[derive(Debug, Clone, PartialEq)]
pub struct UploadNotification {
    pub kind: NotificationKind,
    pub task_id: ContentId,
    /// Reported state; falls back to the state inside the server snapshot
    pub state: Option<PipelineState>,
    pub task: Option<ServerUploadTask>,
    /// Requested chunk size, present on every `ChunkRequest`
    pub chunk_size: Option<u64>,
    pub uploads_list: Option<UploadsList>,
}

impl UploadNotification {
    /// # Errors
    ///
    /// - [`UploadError::MalformedNotification`] for a foreign function or
    ///   signal, an unreadable payload, a missing or invalid task id, or a
    ///   chunk request without a chunk size
    /// - [`UploadError::InvalidState`] for an unknown state name
    pub fn parse(raw: &RawNotification) -> Result<Self> {
        if raw.fnc != NOTIFICATION_FUNCTION {
            return Err(UploadError::MalformedNotification(format!(
                "unexpected function {}",
                raw.fnc
            )));
        }

        let kind = NotificationKind::from_signal(&raw.sig).ok_or_else(|| {
            UploadError::MalformedNotification(format!("unknown signal {}", raw.sig))
        })?;

        let data: NotificationData = serde_json::from_value(raw.data.clone())
            .map_err(|e| UploadError::MalformedNotification(e.to_string()))?;

        let raw_id = data
            .taskid
            .as_deref()
            .or_else(|| data.uploadtask.as_ref().and_then(|t| t.id.as_deref()))
            .ok_or_else(|| UploadError::MalformedNotification(format!("{kind} without taskid")))?;
        let task_id = ContentId::parse(raw_id)
            .map_err(|_| UploadError::MalformedNotification(format!("invalid taskid {raw_id}")))?;

        let state = data
            .state
            .as_deref()
            .or_else(|| data.uploadtask.as_ref().and_then(|t| t.state.as_deref()))
            .map(str::parse::<PipelineState>)
            .transpose()?;

        if kind == NotificationKind::ChunkRequest && data.chunksize.is_none() {
            return Err(UploadError::MalformedNotification(format!(
                "ChunkRequest for {} without chunksize",
                task_id.short()
            )));
        }

        Ok(Self {
            kind,
            task_id,
            state,
            task: data.uploadtask,
            chunk_size: data.chunksize,
            uploads_list: data.uploadslist,
        })
    }
}

/// Any inbound message the upload pipeline handles
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Upload(UploadNotification),
    UploadsList(UploadsList),
}

impl InboundMessage {
    /// Parse a raw notification, `Ok(None)` when it belongs to someone else.
    pub fn parse(raw: &RawNotification) -> Result<Option<Self>> {
        if raw.fnc == NOTIFICATION_FUNCTION {
            return UploadNotification::parse(raw).map(|n| Some(InboundMessage::Upload(n)));
        }

        if raw.fnc == UPLOADS_LIST_FUNCTION && raw.sig == UPLOADS_LIST_SIGNAL {
            let list = serde_json::from_value(raw.data.clone())
                .map_err(|e| UploadError::MalformedNotification(e.to_string()))?;
            return Ok(Some(InboundMessage::UploadsList(list)));
        }

        Ok(None)
    }
}
