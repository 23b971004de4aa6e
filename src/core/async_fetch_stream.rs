//! Awaitable reads over a progressive stream.
//!
//! Instead of surfacing `TryLater`, reads suspend until the driver delivers
//! into the stream's handle and then replay. The request/deliver contract
//! with the driver is the same as for the synchronous stream: one request
//! per block.

use super::base_stream::{BaseStream, Whence};
use super::error::ShimResult;
use super::fetch_driver::FetchDriver;
use super::fetch_state::StreamId;
use super::fetch_stream::{FetchOptions, ProgressiveStream};
use std::sync::Arc;

/// Async wrapper around [`ProgressiveStream`].
pub struct AsyncProgressiveStream {
    inner: ProgressiveStream,
}

impl AsyncProgressiveStream {
    pub fn open(
        driver: Arc<dyn FetchDriver>,
        url: impl Into<String>,
        content_length: usize,
        options: &FetchOptions,
    ) -> ShimResult<Self> {
        Ok(AsyncProgressiveStream {
            inner: ProgressiveStream::open(driver, url, content_length, options)?,
        })
    }

    pub fn id(&self) -> StreamId {
        self.inner.id()
    }

    pub fn length(&self) -> usize {
        self.inner.length()
    }

    pub fn pos(&self) -> usize {
        self.inner.pos()
    }

    pub fn seek(&mut self, offset: i64, whence: Whence) -> usize {
        self.inner.seek(offset, whence)
    }

    /// Synchronous view of the same stream.
    pub fn get_mut(&mut self) -> &mut ProgressiveStream {
        &mut self.inner
    }

    pub fn into_inner(self) -> ProgressiveStream {
        self.inner
    }

    /// Replays `op` until it stops failing with `TryLater`, waiting for a
    /// delivery between attempts.
    async fn drive<T>(
        &mut self,
        mut op: impl FnMut(&mut ProgressiveStream) -> ShimResult<T>,
    ) -> ShimResult<T> {
        let handle = self.inner.handle().clone();
        loop {
            let notified = handle.delivered().notified();
            tokio::pin!(notified);
            // Register before trying so a delivery racing the attempt is not lost.
            notified.as_mut().enable();

            match op(&mut self.inner) {
                Err(e) if e.is_try_later() => {
                    log::trace!("stream {}: suspended on {}", handle.id(), e);
                    notified.await;
                }
                other => return other,
            }
        }
    }

    /// Reads one byte, suspending while its block is in flight.
    pub async fn read_byte(&mut self) -> ShimResult<Option<u8>> {
        self.drive(|s| s.read_byte()).await
    }

    /// Reads up to `length` bytes; fewer only at the end of the stream.
    pub async fn read_bytes(&mut self, length: usize) -> ShimResult<Vec<u8>> {
        self.drive(|s| s.read_bytes(length)).await
    }

    /// Reads from the current position to the end of the stream.
    pub async fn read_to_end(&mut self) -> ShimResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.inner.length() - self.inner.pos());
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = self.drive(|s| s.read_into(&mut buf)).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    pub fn close(&mut self) -> ShimResult<()> {
        self.inner.close()
    }
}
