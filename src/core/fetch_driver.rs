//! Host-side fetch drivers.
//!
//! A [`FetchDriver`] receives the three outbound signals of a progressive
//! stream (open, read block, close) and performs deliveries through the
//! [`FetchHandle`] it was given. [`PumpDriver`] plays the role of a
//! single-threaded host event loop: requests are queued and served one at a
//! time when the host calls [`PumpDriver::pump`].

use super::error::{ShimError, ShimResult};
use super::fetch_state::{FetchHandle, StreamId};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Receiver of the outbound signals of progressive streams.
///
/// Implementations must not deliver synchronously from inside
/// [`FetchDriver::read_block`] through the same stream that issued the
/// request; the stream is mid-call at that point.
pub trait FetchDriver: Send + Sync {
    /// A progressive stream was opened. The driver keeps `handle` for as
    /// long as it may still deliver into it.
    fn open(
        &self,
        handle: &FetchHandle,
        url: &str,
        content_length: usize,
        block_shift: u32,
        prefetch: bool,
    ) -> ShimResult<()>;

    /// `block` was demanded for the first time. Emitted once per block.
    fn read_block(&self, handle: &FetchHandle, block: usize);

    /// The stream was closed. Emitted once.
    fn close(&self, id: StreamId);
}

/// Fetches a byte range `[start, end)` of a resource.
pub trait RangeFetcher: Send + Sync {
    fn fetch(&self, url: &str, start: usize, end: usize) -> ShimResult<Vec<u8>>;
}

/// Serves ranges from an in-memory copy of the resource. The URL is ignored.
pub struct MemoryRangeFetcher {
    data: Arc<Vec<u8>>,
}

impl MemoryRangeFetcher {
    pub fn new(data: Vec<u8>) -> Self {
        MemoryRangeFetcher {
            data: Arc::new(data),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl RangeFetcher for MemoryRangeFetcher {
    fn fetch(&self, _url: &str, start: usize, end: usize) -> ShimResult<Vec<u8>> {
        self.data
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or(ShimError::InvalidByteRange { begin: start, end })
    }
}

/// Serves ranges from local files, treating the URL as a filesystem path.
#[derive(Default)]
pub struct FileRangeFetcher;

impl FileRangeFetcher {
    pub fn new() -> Self {
        FileRangeFetcher
    }

    /// Size of the file at `path`, used as the content length.
    pub fn content_length(path: impl AsRef<Path>) -> ShimResult<usize> {
        let metadata = std::fs::metadata(path)?;
        usize::try_from(metadata.len())
            .map_err(|_| ShimError::Generic("file too large for this platform".to_string()))
    }
}

impl RangeFetcher for FileRangeFetcher {
    fn fetch(&self, url: &str, start: usize, end: usize) -> ShimResult<Vec<u8>> {
        if start > end {
            return Err(ShimError::InvalidByteRange { begin: start, end });
        }
        let mut file = File::open(url)?;
        file.seek(SeekFrom::Start(start as u64))?;
        let mut buffer = vec![0u8; end - start];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }
}

struct Entry {
    handle: FetchHandle,
    url: String,
    prefetch: bool,
}

#[derive(Default)]
struct PumpInner {
    streams: FxHashMap<StreamId, Entry>,
    queue: VecDeque<(StreamId, usize)>,
}

/// Single-threaded fetch driver over a [`RangeFetcher`].
///
/// Nothing happens until the host calls [`PumpDriver::pump`], which serves
/// one queued request. After each delivery on a stream opened with prefetch,
/// the next never-requested block is scheduled, unless a block of that
/// stream is still in flight.
pub struct PumpDriver<F: RangeFetcher> {
    fetcher: F,
    inner: Mutex<PumpInner>,
    fetched: AtomicUsize,
}

impl<F: RangeFetcher> PumpDriver<F> {
    pub fn new(fetcher: F) -> Self {
        PumpDriver {
            fetcher,
            inner: Mutex::new(PumpInner::default()),
            fetched: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn lock_inner(&self) -> ShimResult<MutexGuard<'_, PumpInner>> {
        self.inner.lock().map_err(|_| {
            ShimError::Generic("Failed to lock driver queue (mutex poisoned)".to_string())
        })
    }

    /// Number of queued, not yet served requests.
    pub fn pending(&self) -> usize {
        self.lock_inner().map(|inner| inner.queue.len()).unwrap_or(0)
    }

    /// Number of streams the driver is tracking.
    pub fn open_streams(&self) -> usize {
        self.lock_inner().map(|inner| inner.streams.len()).unwrap_or(0)
    }

    /// Total number of ranges fetched so far.
    pub fn fetched_blocks(&self) -> usize {
        self.fetched.load(Ordering::Relaxed)
    }

    /// Serves one queued request. Returns false when the queue was empty.
    pub fn pump(&self) -> ShimResult<bool> {
        let job = {
            let mut inner = self.lock_inner()?;
            loop {
                let Some((id, block)) = inner.queue.pop_front() else {
                    return Ok(false);
                };
                if let Some(entry) = inner.streams.get(&id) {
                    break (entry.handle.clone(), entry.url.clone(), entry.prefetch, block);
                }
                log::trace!("stream {}: dropping queued block {} of closed stream", id, block);
            }
        };
        let (handle, url, prefetch, block) = job;

        let range = {
            let state = handle.lock()?;
            if state.is_closed() {
                return Ok(true);
            }
            state.block_range(block)
        };

        self.fetched.fetch_add(1, Ordering::Relaxed);
        let delivered = self
            .fetcher
            .fetch(&url, range.0, range.1)
            .and_then(|data| handle.deliver_block(block, &data));
        if let Err(e) = delivered {
            handle.fail_block(block, e.to_string())?;
        }

        // A failed block does not hold up prefetching of the others.
        if prefetch {
            self.schedule_prefetch(&handle, block + 1)?;
        }
        Ok(true)
    }

    /// Pumps until the queue is empty and returns the number of requests
    /// served.
    pub fn run_until_idle(&self) -> ShimResult<usize> {
        let mut served = 0;
        while self.pump()? {
            served += 1;
        }
        Ok(served)
    }

    fn schedule_prefetch(&self, handle: &FetchHandle, next: usize) -> ShimResult<()> {
        let block = {
            let mut state = handle.lock()?;
            if state.is_closed() || state.any_in_flight() {
                return Ok(());
            }
            match state.next_empty_block(next) {
                Some(block) if state.request(block) => block,
                _ => {
                    if state.is_data_loaded() {
                        log::debug!("stream {}: all blocks read", handle.id());
                    }
                    return Ok(());
                }
            }
        };
        log::trace!("stream {}: prefetching block {}", handle.id(), block);
        self.lock_inner()?.queue.push_back((handle.id(), block));
        Ok(())
    }
}

impl<F: RangeFetcher> FetchDriver for PumpDriver<F> {
    fn open(
        &self,
        handle: &FetchHandle,
        url: &str,
        content_length: usize,
        block_shift: u32,
        prefetch: bool,
    ) -> ShimResult<()> {
        log::debug!(
            "stream {}: open {} progressively ({} bytes, block shift {}, prefetch {})",
            handle.id(),
            url,
            content_length,
            block_shift,
            prefetch
        );
        self.lock_inner()?.streams.insert(
            handle.id(),
            Entry {
                handle: handle.clone(),
                url: url.to_string(),
                prefetch,
            },
        );
        Ok(())
    }

    fn read_block(&self, handle: &FetchHandle, block: usize) {
        match self.lock_inner() {
            Ok(mut inner) => inner.queue.push_back((handle.id(), block)),
            Err(e) => log::error!("stream {}: cannot queue block {}: {}", handle.id(), block, e),
        }
    }

    fn close(&self, id: StreamId) {
        if let Ok(mut inner) = self.lock_inner() {
            inner.streams.remove(&id);
            inner.queue.retain(|(queued, _)| *queued != id);
        }
        log::debug!("stream {}: closed", id);
    }
}
