//! Read side of the storage engine.

use std::collections::VecDeque;
use std::future::Future;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

use super::error::{StorageError, StorageResult};
use super::repository::{PartRef, StorageHead, StorageRepository};

struct LoadedPart {
    file: File,
    remaining: u64,
}

type LoadingPart = Pin<Box<dyn Future<Output = StorageResult<LoadedPart>> + Send>>;

/// One continuous byte stream over a head's parts.
///
/// Parts are fetched one at a time in ascending ordering and spooled to a
/// private temporary file, so only a single part is ever held locally. A part
/// whose payload disagrees with its recorded length, or a total that
/// disagrees with the head, fails the read with [`StorageError::Corrupt`].
///
/// Implements [`AsyncRead`], so it can be handed to `tokio::io::copy` or any
/// other byte stream consumer; the [`StorageError`] travels inside the
/// `io::Error` and is recovered by `StorageError::from`.
pub struct StorageReader {
    repository: Arc<dyn StorageRepository>,
    head: StorageHead,
    parts: VecDeque<PartRef>,
    loading: Option<LoadingPart>,
    current: Option<LoadedPart>,
    delivered: u64,
}

impl std::fmt::Debug for StorageReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageReader")
            .field("key", &self.head.key)
            .field("length", &self.head.length)
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}

impl StorageReader {
    pub(crate) fn new(
        repository: Arc<dyn StorageRepository>,
        head: StorageHead,
        parts: Vec<PartRef>,
    ) -> Self {
        Self {
            repository,
            head,
            parts: parts.into(),
            loading: None,
            current: None,
            delivered: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.head.key
    }

    /// Length recorded on the head.
    pub fn length(&self) -> u64 {
        self.head.length
    }

    /// Fill `buf` with the next bytes; `Ok(0)` means end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        Ok(AsyncReadExt::read(self, buf).await?)
    }

    /// Append the rest of the stream to `out`. Returns the byte count.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> StorageResult<u64> {
        let mut chunk = vec![0u8; 8 * 1024];
        let mut total = 0u64;
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n as u64;
        }
    }

    /// Copy the rest of the stream into `writer`. Returns the byte count.
    pub async fn copy_to<W>(&mut self, writer: &mut W) -> StorageResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut chunk = vec![0u8; 8 * 1024];
        let mut total = 0u64;
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                writer.flush().await?;
                return Ok(total);
            }
            writer.write_all(&chunk[..n]).await?;
            total += n as u64;
        }
    }
}

impl AsyncRead for StorageReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if let Some(loading) = this.loading.as_mut() {
                let loaded = ready!(loading.as_mut().poll(cx));
                this.loading = None;
                this.current = Some(loaded?);
            }

            if let Some(part) = this.current.as_mut() {
                if part.remaining > 0 {
                    let max = buf.remaining().min(part.remaining as usize);
                    let mut window = ReadBuf::new(buf.initialize_unfilled_to(max));
                    ready!(Pin::new(&mut part.file).poll_read(cx, &mut window))?;
                    let n = window.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(StorageError::Io(format!(
                            "scratch file for [{}] ended early",
                            this.head.key
                        ))
                        .into()));
                    }
                    buf.advance(n);
                    part.remaining -= n as u64;
                    this.delivered += n as u64;
                    return Poll::Ready(Ok(()));
                }
                this.current = None;
            }

            match this.parts.pop_front() {
                Some(part) => {
                    this.loading = Some(Box::pin(load_part(
                        this.repository.clone(),
                        this.head.key.clone(),
                        part,
                    )));
                }
                None if this.delivered != this.head.length => {
                    return Poll::Ready(Err(StorageError::Corrupt(format!(
                        "head [{}] records {} bytes but its parts hold {}",
                        this.head.key, this.head.length, this.delivered
                    ))
                    .into()));
                }
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

async fn load_part(
    repository: Arc<dyn StorageRepository>,
    key: String,
    part: PartRef,
) -> StorageResult<LoadedPart> {
    let payload = repository.read_part(part.id).await?;
    if payload.len() as u64 != part.length {
        return Err(StorageError::Corrupt(format!(
            "part {} of [{}] holds {} bytes, recorded {}",
            part.ordering,
            key,
            payload.len(),
            part.length
        )));
    }

    let mut file = File::from_std(tempfile::tempfile()?);
    file.write_all(&payload).await?;
    file.flush().await?;
    file.seek(SeekFrom::Start(0)).await?;

    debug!(key = %key, ordering = part.ordering, part_length = part.length, "loaded part");
    Ok(LoadedPart {
        file,
        remaining: part.length,
    })
}
