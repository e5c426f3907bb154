//! # Upload Pipeline Core
//!
//! Client side of resumable, content-addressed uploads into the MusicDB
//! import pipeline.
//!
//! ## Overview
//!
//! An upload is identified by the SHA-1 digest of its bytes. The client
//! announces it with `InitiateUpload`, then answers the server's chunk
//! requests until every byte is sent. The server processes the upload in
//! stages (preprocess, integrate, import) and reports each state change.
//! When an artwork upload becomes ready for integration, the client issues
//! the follow-up artwork import.
//!
//! ## Components
//!
//! - [`identity`]: content identifiers
//! - [`registry::UploadTaskRegistry`]: live tasks, offsets and states
//! - [`state::PipelineStateMachine`]: legal pipeline transitions
//! - [`chunk::ChunkTransferDriver`]: chunk slicing
//! - [`router::NotificationRouter`]: applies server notifications
//! - [`trigger::ImportTrigger`]: artwork import requests
//! - [`manager::UploadManager`]: starting, annotating and retiring uploads
//! - [`view::UploadsTable`]: server task list for observers
//!
//! ## Usage
//!
//! ```ignore
//! use core_upload::{NotificationRouter, UploadConfig, UploadManager};
//!
//! let manager = Arc::new(UploadManager::new(transport.clone(), clock, events.clone(), UploadConfig::default())?);
//! let router = Arc::new(NotificationRouter::new(manager.registry().clone(), transport, events));
//!
//! let (tx, rx) = tokio::sync::mpsc::channel(256);
//! tokio::spawn(router.run(rx, cancel.clone()));
//!
//! // Feed every server notification into `tx`
//! let id = manager.upload(bytes, metadata, annotations).await?;
//! ```

pub mod chunk;
pub mod error;
pub mod identity;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod state;
pub mod task;
pub mod trigger;
pub mod view;

pub use chunk::{Chunk, ChunkTransferDriver};
pub use error::{Result, UploadError};
pub use identity::{identify, identify_async, ContentId};
pub use manager::{UploadConfig, UploadManager};
pub use protocol::{InboundMessage, NotificationKind, OutboundRequest, UploadNotification, UploadsList};
pub use registry::UploadTaskRegistry;
pub use router::{NotificationRouter, RouteOutcome};
pub use state::{PipelineStage, PipelineState, PipelineStateMachine, StateClass};
pub use task::{Annotations, ContentType, TaskSnapshot, UploadMetadata, UploadTask};
pub use trigger::{ArtworkImportRequest, ImportTrigger};
pub use view::{RowStatus, UploadsTable};
