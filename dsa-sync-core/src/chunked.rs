//! Chunked upload protocol.
//!
//! A file is announced to the archive with its declared size, then streamed as
//! fixed-size byte ranges in increasing offset order. Only one chunk is held in
//! memory at a time. The archive reassembles the ranges and answers the last
//! chunk with the finalized file document.
//!
//! There is no resume: a failed chunk fails the whole file, and the caller
//! decides what to do with that file.

use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use mockall::automock;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, error, info};

use crate::contract::{ContainerRef, RemoteError, Session, UploadSession, UploadedFile};

/// 64 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// One contiguous byte range of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub index: usize,
    pub offset: u64,
    pub len: u64,
}

/// What the archive reported after accepting a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkReceipt {
    /// More bytes are expected; `received` is the running total.
    Partial { received: u64 },
    Complete(UploadedFile),
}

/// Wire-level operations of the upload protocol.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Open an upload session for `size` bytes named `name` under `parent`.
    async fn initiate_upload(
        &self,
        session: &Session,
        parent: &ContainerRef,
        name: &str,
        size: u64,
    ) -> Result<UploadSession, RemoteError>;

    async fn send_chunk(
        &self,
        session: &Session,
        upload: &UploadSession,
        chunk: &ChunkSpec,
        bytes: Vec<u8>,
    ) -> Result<ChunkReceipt, RemoteError>;
}

/// Partition `size` bytes into ranges of `chunk_size`; the last range is truncated.
pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<ChunkSpec> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut offset = 0u64;
    while offset < size {
        let len = chunk_size.min(size - offset);
        chunks.push(ChunkSpec {
            index: chunks.len(),
            offset,
            len,
        });
        offset += len;
    }
    chunks
}

/// Upload the file at `path` through `transport`, chunk by chunk.
pub async fn upload_in_chunks<T>(
    transport: &T,
    session: &Session,
    parent: &ContainerRef,
    path: &Path,
    name: &str,
    size: u64,
    chunk_size: u64,
) -> Result<UploadedFile, RemoteError>
where
    T: ChunkTransport + ?Sized,
{
    let upload = transport
        .initiate_upload(session, parent, name, size)
        .await?;
    info!(
        upload_id = %upload.id,
        file = name,
        size,
        parent_id = parent.id(),
        "Upload session opened"
    );

    if let Some(done) = upload.finalized.clone() {
        debug!(file = name, "Upload finalized at initiation");
        return Ok(done);
    }

    let chunks = plan_chunks(size, chunk_size);
    let mut file = tokio::fs::File::open(path).await?;
    let mut completed = None;

    for chunk in &chunks {
        if completed.is_some() {
            return Err(RemoteError::Protocol(format!(
                "upload {} finalized before chunk {} at offset {}",
                upload.id, chunk.index, chunk.offset
            )));
        }

        file.seek(SeekFrom::Start(chunk.offset)).await?;
        let mut bytes = vec![0u8; chunk.len as usize];
        if let Err(e) = file.read_exact(&mut bytes).await {
            error!(error = ?e, path = %path.display(), offset = chunk.offset, "Failed to read chunk from disk");
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(RemoteError::Protocol(format!(
                    "{} is shorter than the declared {} bytes",
                    path.display(),
                    size
                )));
            }
            return Err(e.into());
        }

        debug!(
            upload_id = %upload.id,
            index = chunk.index,
            offset = chunk.offset,
            len = chunk.len,
            "Sending chunk"
        );
        match transport.send_chunk(session, &upload, chunk, bytes).await {
            Ok(ChunkReceipt::Partial { received }) => {
                debug!(upload_id = %upload.id, received, "Chunk accepted");
            }
            Ok(ChunkReceipt::Complete(uploaded)) => completed = Some(uploaded),
            Err(e) => {
                error!(
                    upload_id = %upload.id,
                    offset = chunk.offset,
                    error = %e,
                    "Chunk upload failed, aborting file"
                );
                return Err(e);
            }
        }
    }

    completed.ok_or_else(|| {
        RemoteError::Protocol(format!(
            "upload {} was not finalized after {} chunks",
            upload.id,
            chunks.len()
        ))
    })
}
