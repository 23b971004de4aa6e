use super::base_stream::{BaseStream, Whence};
use super::error::{ShimError, ShimResult};
use super::fetch_driver::FetchDriver;
use super::fetch_state::StreamId;
use super::fetch_stream::{FetchOptions, ProgressiveStream};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Explicit engine context.
///
/// Owns the fetch driver shared by every stream it opens and the registry
/// of open streams. Hosts refer to streams by [`StreamId`]; the session
/// resolves them, so a stale id can never reach freed state.
pub struct Session {
    driver: Arc<dyn FetchDriver>,
    streams: FxHashMap<StreamId, ProgressiveStream>,
}

impl Session {
    pub fn new(driver: Arc<dyn FetchDriver>) -> Self {
        Session {
            driver,
            streams: FxHashMap::default(),
        }
    }

    pub fn driver(&self) -> &Arc<dyn FetchDriver> {
        &self.driver
    }

    /// Opens a progressive stream and registers it.
    pub fn open_stream_from_url(
        &mut self,
        url: &str,
        content_length: usize,
        block_size: usize,
        prefetch: bool,
    ) -> ShimResult<StreamId> {
        let options = FetchOptions {
            block_size,
            prefetch,
        };
        let stream = ProgressiveStream::open(self.driver.clone(), url, content_length, &options)?;
        let id = stream.id();
        self.streams.insert(id, stream);
        Ok(id)
    }

    /// Resolves `id` to its open stream.
    pub fn stream(&mut self, id: StreamId) -> ShimResult<&mut ProgressiveStream> {
        self.streams
            .get_mut(&id)
            .ok_or_else(|| ShimError::invalid(format!("unknown stream {}", id)))
    }

    pub fn read_byte(&mut self, id: StreamId) -> ShimResult<Option<u8>> {
        self.stream(id)?.read_byte()
    }

    pub fn read_into(&mut self, id: StreamId, buf: &mut [u8]) -> ShimResult<usize> {
        self.stream(id)?.read_into(buf)
    }

    pub fn seek(&mut self, id: StreamId, offset: i64, whence: Whence) -> ShimResult<usize> {
        Ok(self.stream(id)?.seek(offset, whence))
    }

    pub fn tell(&mut self, id: StreamId) -> ShimResult<usize> {
        Ok(self.stream(id)?.pos())
    }

    /// Closes and forgets a stream. Returns false for an unknown id.
    pub fn drop_stream(&mut self, id: StreamId) -> bool {
        match self.streams.remove(&id) {
            Some(mut stream) => {
                if let Err(e) = stream.close() {
                    log::warn!("stream {}: close failed: {}", id, e);
                }
                true
            }
            None => false,
        }
    }

    /// Claims `block` of stream `id` for a speculative fetch.
    ///
    /// Returns true only when this call moved the block out of
    /// `NotRequested`; the caller then owns the fetch and must deliver or
    /// fail it. A block the reader or an earlier claim already requested is
    /// never handed out again.
    pub fn request_block(&self, id: StreamId, block: usize) -> ShimResult<bool> {
        let stream = self
            .streams
            .get(&id)
            .ok_or_else(|| ShimError::invalid(format!("unknown stream {}", id)))?;
        let handle = stream.handle();
        let map_length = handle.lock()?.map_length();
        if block >= map_length {
            return Err(ShimError::invalid(format!(
                "block {} is past the end of the map ({} entries)",
                block, map_length
            )));
        }
        let claimed = handle.request_block(block)?;
        if claimed {
            log::trace!("stream {}: block {} claimed by host", id, block);
        }
        Ok(claimed)
    }

    /// Delivery entry point for hosts that address streams by id.
    ///
    /// Deliveries for streams that were already dropped are ignored and
    /// reported as `Ok(false)`.
    pub fn on_data_fetched(&self, id: StreamId, block: usize, data: &[u8]) -> ShimResult<bool> {
        match self.streams.get(&id) {
            Some(stream) => stream.handle().deliver_block(block, data),
            None => {
                log::debug!("stream {}: ignoring block {} for unknown stream", id, block);
                Ok(false)
            }
        }
    }

    /// Records a failed fetch for `block` of stream `id`.
    pub fn on_fetch_failed(&self, id: StreamId, block: usize, message: &str) -> ShimResult<()> {
        match self.streams.get(&id) {
            Some(stream) => stream.handle().fail_block(block, message),
            None => Ok(()),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}
