//! Bridges the Uploader to container bytes (spec §4.4).

use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::container::{safe_join, ContainerStore};
use crate::error::{CacheError, CacheResult};
use crate::model::UploadRecord;

/// A read/seek stream bounded to `[offset, offset+length)` of a container
/// file. `length` is resolved from the file's actual size when the record's
/// `length` is zero.
pub trait ChunkReader: AsyncRead + AsyncSeek + Send + Unpin {
    fn len(&self) -> u64;
}

struct BoundedFile {
    file: File,
    start: u64,
    len: u64,
    remaining: u64,
}

impl ChunkReader for BoundedFile {
    fn len(&self) -> u64 {
        self.len
    }
}

impl AsyncRead for BoundedFile {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        if self.remaining == 0 {
            return std::task::Poll::Ready(Ok(()));
        }
        let cap = buf.remaining().min(self.remaining as usize);
        let mut limited = buf.take(cap);
        let result = std::pin::Pin::new(&mut self.file).poll_read(cx, &mut limited);
        let filled_now = limited.filled().len();
        buf.advance(filled_now);
        if result.is_ready() {
            self.remaining -= filled_now as u64;
        }
        result
    }
}

impl AsyncSeek for BoundedFile {
    fn start_seek(mut self: std::pin::Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        let start = self.start;
        let len = self.len;
        let offset_in_window = match position {
            SeekFrom::Start(n) => n.min(len),
            SeekFrom::Current(n) => {
                // Approximate: callers in this crate only ever seek from the
                // start of the bounded stream.
                ((len - self.remaining) as i64 + n).clamp(0, len as i64) as u64
            }
            SeekFrom::End(n) => ((len as i64) + n).clamp(0, len as i64) as u64,
        };
        self.remaining = len - offset_in_window;
        std::pin::Pin::new(&mut self.file).start_seek(SeekFrom::Start(start + offset_in_window))
    }

    fn poll_complete(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<u64>> {
        let start = self.start;
        match std::pin::Pin::new(&mut self.file).poll_complete(cx) {
            std::task::Poll::Ready(Ok(absolute)) => {
                std::task::Poll::Ready(Ok(absolute.saturating_sub(start)))
            }
            other => other,
        }
    }
}

#[async_trait]
pub trait ChunkProvider: Send + Sync {
    async fn open_chunk(&self, record: &UploadRecord) -> CacheResult<Box<dyn ChunkReader>>;
}

/// Default implementation reading directly from the `ContainerStore`'s
/// committed files.
pub struct ContainerChunkProvider {
    objects_root: PathBuf,
}

impl ContainerChunkProvider {
    pub fn new(store: &ContainerStore) -> Self {
        Self {
            objects_root: store.root().join("objects"),
        }
    }
}

#[async_trait]
impl ChunkProvider for ContainerChunkProvider {
    async fn open_chunk(&self, record: &UploadRecord) -> CacheResult<Box<dyn ChunkReader>> {
        let path = safe_join(&self.objects_root, &record.path)?;
        let mut file = File::open(&path).await.map_err(CacheError::Io)?;

        let length = if record.length == 0 {
            let metadata = file.metadata().await.map_err(CacheError::Io)?;
            metadata.len().saturating_sub(record.offset)
        } else {
            record.length
        };

        file.seek(SeekFrom::Start(record.offset))
            .await
            .map_err(CacheError::Io)?;

        Ok(Box::new(BoundedFile {
            file,
            start: record.offset,
            len: length,
            remaining: length,
        }))
    }
}
