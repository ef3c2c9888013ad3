//! Write side of the storage engine.

use std::io::SeekFrom;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::error::{StorageError, StorageResult};
use super::repository::{StorageHead, StorageRepository};

const COPY_CHUNK: usize = 8 * 1024;

/// Streams bytes into a storage head one bounded part at a time.
///
/// Incoming bytes are buffered in a private temporary file. Whenever the
/// buffer reaches the part size, or on [`flush`](Self::flush) and
/// [`close`](Self::close), the buffered bytes become one new part and the
/// buffer starts over. At most one part's worth of data is ever held outside
/// the repository.
///
/// Bytes still buffered when a sink is dropped without `close` are lost.
pub struct StorageSink {
    repository: Arc<dyn StorageRepository>,
    head: StorageHead,
    part_size: usize,
    buffer: File,
    buffered: usize,
    written: u64,
    closed: bool,
}

impl StorageSink {
    pub(crate) fn new(
        repository: Arc<dyn StorageRepository>,
        head: StorageHead,
        part_size: usize,
    ) -> StorageResult<Self> {
        let buffer = File::from_std(tempfile::tempfile()?);
        Ok(Self {
            repository,
            head,
            part_size,
            buffer,
            buffered: 0,
            written: 0,
            closed: false,
        })
    }

    pub fn key(&self) -> &str {
        &self.head.key
    }

    /// Bytes accepted so far, committed or not.
    pub fn bytes_written(&self) -> u64 {
        self.written + self.buffered as u64
    }

    pub async fn write(&mut self, mut data: &[u8]) -> StorageResult<()> {
        self.ensure_open()?;

        while !data.is_empty() {
            let take = data.len().min(self.part_size - self.buffered);
            self.buffer.write_all(&data[..take]).await?;
            self.buffered += take;
            data = &data[take..];

            if self.buffered == self.part_size {
                self.commit_part().await?;
            }
        }
        Ok(())
    }

    /// Copy everything `reader` yields into the sink. Returns the byte count.
    pub async fn write_from<R>(&mut self, reader: &mut R) -> StorageResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut chunk = vec![0u8; COPY_CHUNK.min(self.part_size.max(1))];
        let mut total = 0u64;

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            self.write(&chunk[..n]).await?;
            total += n as u64;
        }
    }

    /// Commit any buffered bytes as a part now.
    pub async fn flush(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        self.commit_part().await
    }

    /// Commit remaining bytes and finish. Returns the total length written.
    pub async fn close(mut self) -> StorageResult<u64> {
        self.ensure_open()?;
        self.commit_part().await?;
        self.closed = true;
        debug!(key = %self.head.key, length = self.written, "storage sink closed");
        Ok(self.written)
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::IllegalState(format!(
                "sink for [{}] is closed",
                self.head.key
            )));
        }
        Ok(())
    }

    async fn commit_part(&mut self) -> StorageResult<()> {
        if self.buffered == 0 {
            return Ok(());
        }

        self.buffer.flush().await?;
        self.buffer.seek(SeekFrom::Start(0)).await?;
        let mut part = Vec::with_capacity(self.buffered);
        (&mut self.buffer)
            .take(self.buffered as u64)
            .read_to_end(&mut part)
            .await?;

        if part.len() != self.buffered {
            return Err(StorageError::Corrupt(format!(
                "scratch buffer for [{}] held {} bytes, expected {}",
                self.head.key,
                part.len(),
                self.buffered
            )));
        }

        let head_length = self.repository.append_part(self.head.id, &part).await?;
        let expected = self.written + part.len() as u64;
        if head_length != expected {
            return Err(StorageError::Corrupt(format!(
                "head [{}] reports {} bytes after append, expected {}",
                self.head.key, head_length, expected
            )));
        }

        self.written = expected;
        self.buffered = 0;
        self.buffer.set_len(0).await?;
        self.buffer.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }
}

impl Drop for StorageSink {
    fn drop(&mut self) {
        if !self.closed && self.buffered > 0 {
            warn!(
                key = %self.head.key,
                pending = self.buffered,
                "storage sink dropped with uncommitted bytes"
            );
        }
    }
}
