//! Observer table of server-side uploads.
//!
//! The server broadcasts the full task list with most notifications. The
//! table mirrors the latest list per content type so a UI can render rows
//! without touching the registry.

use crate::protocol::{ServerUploadTask, UploadsList};
use crate::state::{status_line, PipelineStage, StateClass};
use crate::task::ContentType;
use serde::{Deserialize, Serialize};

/// One rendered row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowStatus {
    pub task_id: Option<String>,
    pub status: String,
    pub class: StateClass,
    pub stages: Vec<(PipelineStage, StateClass)>,
}

impl RowStatus {
    pub fn of(task: &ServerUploadTask) -> Self {
        let state = task.pipeline_state();
        Self {
            task_id: task.id.clone(),
            status: status_line(state).to_string(),
            class: StateClass::of(state),
            stages: PipelineStage::progression(state).to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadsTable {
    list: UploadsList,
}

impl UploadsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rows of one content type.
    pub fn replace(&mut self, content_type: ContentType, rows: Vec<ServerUploadTask>) {
        match content_type {
            ContentType::Video => self.list.videos = rows,
            ContentType::AlbumFile => self.list.albumfiles = rows,
            ContentType::Artwork => self.list.artworks = rows,
        }
    }

    /// Replace every content type from a full server list.
    pub fn apply_list(&mut self, list: UploadsList) {
        self.list = list;
    }

    /// Update the row with the same id in place.
    ///
    /// Returns `false` if the task has no id, no known content type, or no
    /// matching row. Unknown rows are not appended; the next full list adds them.
    pub fn try_update_row(&mut self, task: &ServerUploadTask) -> bool {
        let (Some(id), Some(content_type)) = (task.id.as_deref(), task.content_type()) else {
            return false;
        };

        let rows = match content_type {
            ContentType::Video => &mut self.list.videos,
            ContentType::AlbumFile => &mut self.list.albumfiles,
            ContentType::Artwork => &mut self.list.artworks,
        };

        match rows.iter_mut().find(|row| row.id.as_deref() == Some(id)) {
            Some(row) => {
                *row = task.clone();
                true
            }
            None => false,
        }
    }

    pub fn rows(&self, content_type: ContentType) -> &[ServerUploadTask] {
        self.list.for_type(content_type)
    }

    pub fn statuses(&self, content_type: ContentType) -> Vec<RowStatus> {
        self.rows(content_type).iter().map(RowStatus::of).collect()
    }

    pub fn list(&self) -> &UploadsList {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}
