//! Chunk slicing.
//!
//! The server asks for chunks by size; the client answers with the next
//! `min(requested, remaining)` bytes starting at the task's offset. The
//! driver only computes the slice. Committing the new offset happens in
//! [`UploadTaskRegistry::take_next_chunk`](crate::registry::UploadTaskRegistry::take_next_chunk)
//! under the same lock that read the offset.

use crate::error::{Result, UploadError};
use crate::identity::ContentId;
use crate::task::UploadTask;
use bytes::Bytes;

/// Default ceiling for a single requested chunk (16 MiB)
pub const DEFAULT_MAX_CHUNK_BYTES: u64 = 16 * 1024 * 1024;

/// A slice of a task's payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub task_id: ContentId,
    /// Offset of the first byte
    pub offset: u64,
    /// Offset after this chunk
    pub new_offset: u64,
    pub data: Bytes,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Wire encoding of the chunk bytes
    pub fn to_hex(&self) -> String {
        hex::encode(&self.data)
    }
}

/// Computes the next chunk of a task
#[derive(Debug, Clone, Copy)]
pub struct ChunkTransferDriver {
    max_chunk: u64,
}

impl Default for ChunkTransferDriver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNK_BYTES)
    }
}

impl ChunkTransferDriver {
    pub fn new(max_chunk: u64) -> Self {
        Self { max_chunk }
    }

    pub fn max_chunk(&self) -> u64 {
        self.max_chunk
    }

    /// Slice `payload[offset .. offset + min(requested, filesize - offset)]`.
    ///
    /// # Errors
    ///
    /// - [`UploadError::InvalidChunkSize`] if `requested` is 0 or above the ceiling
    /// - [`UploadError::NoDataRemaining`] if every byte was already sent
    /// - [`UploadError::PayloadReleased`] if the payload was dropped
    pub fn next_chunk(&self, task: &UploadTask, requested: u64) -> Result<Chunk> {
        if requested == 0 || requested > self.max_chunk {
            return Err(UploadError::InvalidChunkSize {
                requested,
                max: self.max_chunk,
            });
        }

        if task.offset >= task.filesize {
            return Err(UploadError::NoDataRemaining {
                task_id: task.id.to_string(),
            });
        }

        let payload = task
            .payload
            .as_ref()
            .ok_or_else(|| UploadError::PayloadReleased {
                task_id: task.id.to_string(),
            })?;

        let end = task
            .offset
            .saturating_add(requested)
            .min(task.filesize)
            .min(payload.len() as u64);

        Ok(Chunk {
            task_id: task.id.clone(),
            offset: task.offset,
            new_offset: end,
            data: payload.slice(task.offset as usize..end as usize),
        })
    }

    /// Number of chunk requests needed to send `filesize` bytes in `chunk_size` pieces
    pub fn chunk_count(filesize: u64, chunk_size: u64) -> u64 {
        if chunk_size == 0 {
            return 0;
        }
        filesize.div_ceil(chunk_size)
    }
}
