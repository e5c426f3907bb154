//! Artwork import trigger.

use crate::error::{Result, UploadError};
use crate::protocol::OutboundRequest;
use crate::task::Annotations;
use bridge_traits::MessageTransport;
use std::sync::Arc;
use tracing::info;

/// Annotation naming the music directory an artwork belongs to
pub const MUSIC_PATH_ANNOTATION: &str = "musicpath";

/// A validated artwork import
#[derive(Debug, Clone, PartialEq)]
pub struct ArtworkImportRequest {
    pub source_path: String,
    pub target_path: String,
    pub annotations: Annotations,
}

impl ArtworkImportRequest {
    /// # Errors
    ///
    /// [`UploadError::MalformedTrigger`] if either path is missing or empty.
    pub fn new(
        source_path: Option<&str>,
        target_path: Option<&str>,
        annotations: Annotations,
    ) -> Result<Self> {
        let source_path = non_empty(source_path, "sourcepath")?;
        let target_path = non_empty(target_path, "targetpath")?;
        Ok(Self {
            source_path,
            target_path,
            annotations,
        })
    }

    pub fn to_request(&self) -> OutboundRequest {
        OutboundRequest::InitiateArtworkImport {
            source_path: self.source_path.clone(),
            target_path: self.target_path.clone(),
            annotations: self.annotations.clone(),
        }
    }
}

fn non_empty(value: Option<&str>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.to_string()),
        _ => Err(UploadError::MalformedTrigger(format!("missing {field}"))),
    }
}

/// Issues follow-up imports once the server finished preprocessing
#[derive(Clone)]
pub struct ImportTrigger {
    transport: Arc<dyn MessageTransport>,
}

impl ImportTrigger {
    pub fn new(transport: Arc<dyn MessageTransport>) -> Self {
        Self { transport }
    }

    /// Send exactly one `InitiateArtworkImport` request.
    ///
    /// Validation happens before anything is sent, so a malformed trigger
    /// leaves the connection untouched.
    pub async fn trigger_artwork_import(
        &self,
        source_path: Option<&str>,
        target_path: Option<&str>,
        annotations: Annotations,
    ) -> Result<ArtworkImportRequest> {
        let request = ArtworkImportRequest::new(source_path, target_path, annotations)?;
        request.to_request().send(self.transport.as_ref()).await?;

        info!(
            source = %request.source_path,
            target = %request.target_path,
            "Requested artwork import"
        );
        Ok(request)
    }
}

impl std::fmt::Debug for ImportTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportTrigger").finish_non_exhaustive()
    }
}
