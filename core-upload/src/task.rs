//! Upload task data model.

use crate::error::{Result, UploadError};
use crate::identity::ContentId;
use crate::state::{PipelineState, StateClass};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Open key/value annotations, forwarded to the server verbatim
pub type Annotations = Map<String, Value>;

/// Kind of content being uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Artwork,
    Video,
    AlbumFile,
}

impl ContentType {
    pub const ALL: [ContentType; 3] = [ContentType::Artwork, ContentType::Video, ContentType::AlbumFile];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Artwork => "artwork",
            ContentType::Video => "video",
            ContentType::AlbumFile => "albumfile",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "artwork" => Ok(ContentType::Artwork),
            "video" => Ok(ContentType::Video),
            "albumfile" => Ok(ContentType::AlbumFile),
            _ => Err(UploadError::InvalidContentType(s.to_string())),
        }
    }
}

/// Descriptive fields supplied with a new upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub content_type: ContentType,
    pub mime_type: String,
    pub file_name: String,
}

impl UploadMetadata {
    pub fn new(
        content_type: ContentType,
        mime_type: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            content_type,
            mime_type: mime_type.into(),
            file_name: file_name.into(),
        }
    }
}

/// A registered upload
///
/// `offset` only moves forward and never passes `filesize`. The payload is
/// dropped as soon as the server no longer needs it.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: ContentId,
    pub payload: Option<Bytes>,
    pub filesize: u64,
    pub offset: u64,
    pub content_type: ContentType,
    pub mime_type: String,
    pub file_name: String,
    /// Same value as `id`; the protocol sends it as a separate field
    pub checksum: String,
    pub annotations: Annotations,
    /// `None` until the server acknowledges the initiate request
    pub state: Option<PipelineState>,
    /// Unix millis
    pub created_at: i64,
    /// Unix millis of the last registry mutation
    pub updated_at: i64,
}

impl UploadTask {
    pub(crate) fn new(id: ContentId, payload: Bytes, metadata: UploadMetadata, now: i64) -> Self {
        Self {
            checksum: id.to_string(),
            id,
            filesize: payload.len() as u64,
            payload: Some(payload),
            offset: 0,
            content_type: metadata.content_type,
            mime_type: metadata.mime_type,
            file_name: metadata.file_name,
            annotations: Annotations::new(),
            state: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.filesize - self.offset
    }

    /// Transfer progress (0-100)
    pub fn percent(&self) -> u8 {
        percent(self.offset, self.filesize)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_some_and(|s| s.is_terminal())
    }

    pub fn class(&self) -> StateClass {
        StateClass::of(self.state)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            filesize: self.filesize,
            offset: self.offset,
            content_type: self.content_type,
            mime_type: self.mime_type.clone(),
            file_name: self.file_name.clone(),
            annotations: self.annotations.clone(),
            state: self.state,
            payload_held: self.payload.is_some(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only view of a task for observers. Carries no payload bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: ContentId,
    pub filesize: u64,
    pub offset: u64,
    pub content_type: ContentType,
    pub mime_type: String,
    pub file_name: String,
    pub annotations: Annotations,
    pub state: Option<PipelineState>,
    pub payload_held: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskSnapshot {
    pub fn percent(&self) -> u8 {
        percent(self.offset, self.filesize)
    }

    pub fn class(&self) -> StateClass {
        StateClass::of(self.state)
    }
}

pub(crate) fn percent(offset: u64, filesize: u64) -> u8 {
    if filesize == 0 {
        return 100;
    }
    ((offset.min(filesize) as u128 * 100) / filesize as u128) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::identify;

    fn task(bytes: &'static [u8]) -> UploadTask {
        UploadTask::new(
            identify(bytes),
            Bytes::from_static(bytes),
            UploadMetadata::new(ContentType::Video, "video/mp4", "clip.mp4"),
            1_000,
        )
    }

    #[test]
    fn test_new_task() {
        let task = task(b"0123456789");

        assert_eq!(task.filesize, 10);
        assert_eq!(task.offset, 0);
        assert_eq!(task.remaining(), 10);
        assert_eq!(task.checksum, task.id.as_str());
        assert_eq!(task.state, None);
        assert_eq!(task.class(), StateClass::Open);
        assert_eq!(task.created_at, task.updated_at);
    }

    #[test]
    fn test_percent() {
        let mut task = task(b"0123456789");
        task.offset = 4;
        assert_eq!(task.percent(), 40);
        task.offset = 10;
        assert_eq!(task.percent(), 100);

        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(1, 3), 33);
    }

    #[test]
    fn test_snapshot_omits_payload() {
        let task = task(b"abc");
        let snapshot = task.snapshot();

        assert!(snapshot.payload_held);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("payload").is_none());
        assert_eq!(json["content_type"], "video");
    }

    #[test]
    fn test_content_type_wire_names() {
        for content_type in ContentType::ALL {
            assert_eq!(
                content_type.as_str().parse::<ContentType>().unwrap(),
                content_type
            );
        }
        assert_eq!(
            serde_json::to_string(&ContentType::AlbumFile).unwrap(),
            "\"albumfile\""
        );
        assert!(matches!(
            "audio".parse::<ContentType>(),
            Err(UploadError::InvalidContentType(_))
        ));
    }
}
