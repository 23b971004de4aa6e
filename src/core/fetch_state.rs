use super::error::{ShimError, ShimResult};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Smallest accepted block: 1 KiB.
pub const MIN_BLOCK_SHIFT: u32 = 10;

/// Largest accepted block: 16 MiB.
pub const MAX_BLOCK_SHIFT: u32 = 24;

/// Block size used when the host does not pick one: 64 KiB.
pub const DEFAULT_BLOCK_SIZE: usize = 65536;

/// Fetch status of a single block.
///
/// A block only ever moves forward: `NotRequested -> Requested -> Loaded`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    NotRequested = 0,
    Requested = 1,
    Loaded = 2,
}

/// Validates a block size and returns its log2.
///
/// Only powers of two between 1 KiB and 16 MiB are accepted.
pub fn block_shift_for(block_size: usize) -> ShimResult<u32> {
    if !block_size.is_power_of_two() {
        return Err(ShimError::invalid(format!(
            "block size {} is not a power of two",
            block_size
        )));
    }
    let shift = block_size.trailing_zeros();
    if !(MIN_BLOCK_SHIFT..=MAX_BLOCK_SHIFT).contains(&shift) {
        return Err(ShimError::invalid(format!("invalid block shift: {}", shift)));
    }
    Ok(shift)
}

/// Sparse, block-addressed cache of a remote resource.
///
/// `content` always has exactly `content_length` bytes, but only the ranges
/// of blocks whose status is [`BlockStatus::Loaded`] hold meaningful data.
/// `map` has `content_length / block_size + 1` entries; when the length is
/// a multiple of the block size the trailing entry covers an empty range and
/// is never fetched.
pub struct FetchState {
    block_shift: u32,
    block_size: usize,
    content_length: usize,
    map_length: usize,
    content: Vec<u8>,
    map: Vec<BlockStatus>,
    closed: bool,
    /// Fetch failures reported by the driver, by block
    failures: FxHashMap<usize, String>,
}

impl FetchState {
    /// Creates a state for a resource of `content_length` bytes.
    ///
    /// Fails with `InvalidArgument` for a bad block size and with
    /// `OutOfMemory` when the content buffer cannot be reserved.
    pub fn new(content_length: usize, block_size: usize) -> ShimResult<Self> {
        let block_shift = block_shift_for(block_size)?;
        let block_size = 1usize << block_shift;
        let map_length = content_length / block_size + 1;

        let mut content = Vec::new();
        content
            .try_reserve_exact(content_length)
            .map_err(|_| ShimError::OutOfMemory {
                requested: content_length,
            })?;
        content.resize(content_length, 0);

        let mut map = Vec::new();
        map.try_reserve_exact(map_length)
            .map_err(|_| ShimError::OutOfMemory {
                requested: map_length,
            })?;
        map.resize(map_length, BlockStatus::NotRequested);

        Ok(FetchState {
            block_shift,
            block_size,
            content_length,
            map_length,
            content,
            map,
            closed: false,
            failures: FxHashMap::default(),
        })
    }

    pub fn block_shift(&self) -> u32 {
        self.block_shift
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the total length of the resource.
    pub fn length(&self) -> usize {
        self.content_length
    }

    /// Number of entries in the block map.
    pub fn map_length(&self) -> usize {
        self.map_length
    }

    /// Number of blocks that actually carry bytes.
    pub fn num_blocks(&self) -> usize {
        self.content_length.div_ceil(self.block_size)
    }

    /// Gets the block number for a given byte position.
    pub fn block_of(&self, pos: usize) -> usize {
        pos >> self.block_shift
    }

    /// Byte range `[start, end)` covered by `block`, clipped to the resource.
    pub fn block_range(&self, block: usize) -> (usize, usize) {
        let start = (block << self.block_shift).min(self.content_length);
        let end = (start + self.block_size).min(self.content_length);
        (start, end)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Status of `block`, or `None` when the index is out of range or the
    /// state has been released.
    pub fn status(&self, block: usize) -> Option<BlockStatus> {
        self.map.get(block).copied()
    }

    pub fn is_loaded(&self, block: usize) -> bool {
        self.status(block) == Some(BlockStatus::Loaded)
    }

    /// Performs the one-time `NotRequested -> Requested` transition.
    ///
    /// Returns true only for the caller that performed the transition, which
    /// is then responsible for issuing the fetch.
    pub fn request(&mut self, block: usize) -> bool {
        match self.map.get_mut(block) {
            Some(status @ BlockStatus::NotRequested) => {
                *status = BlockStatus::Requested;
                true
            }
            _ => false,
        }
    }

    /// Stores the bytes of a fetched block.
    ///
    /// Returns `Ok(false)` when the state is already closed and the data was
    /// dropped. A block index past the map or a payload whose length differs
    /// from the block's clipped range is rejected untouched.
    pub fn deliver(&mut self, block: usize, data: &[u8]) -> ShimResult<bool> {
        if self.closed {
            return Ok(false);
        }
        if block >= self.map_length {
            return Err(ShimError::invalid(format!(
                "block {} out of range (map length {})",
                block, self.map_length
            )));
        }
        let (start, end) = self.block_range(block);
        if data.len() != end - start {
            return Err(ShimError::invalid(format!(
                "block {} expects {} bytes, got {}",
                block,
                end - start,
                data.len()
            )));
        }
        self.content[start..end].copy_from_slice(data);
        self.map[block] = BlockStatus::Loaded;
        self.failures.remove(&block);
        Ok(true)
    }

    /// Records that fetching `block` failed. The first failure of each
    /// block is kept; loaded blocks and released states ignore failures.
    pub fn fail(&mut self, block: usize, message: impl Into<String>) {
        if self.closed || self.is_loaded(block) {
            return;
        }
        self.failures.entry(block).or_insert_with(|| message.into());
    }

    /// Failure message recorded for `block`, if any.
    pub fn failure_for(&self, block: usize) -> Option<&str> {
        self.failures.get(&block).map(String::as_str)
    }

    /// Returns a list of block numbers that have not been loaded.
    pub fn missing_blocks(&self) -> Vec<usize> {
        (0..self.num_blocks())
            .filter(|&block| !self.is_loaded(block))
            .collect()
    }

    /// Returns the next block that was never requested, starting at
    /// `begin_block` and wrapping around to the beginning.
    pub fn next_empty_block(&self, begin_block: usize) -> Option<usize> {
        let num_blocks = self.num_blocks();
        if self.closed || num_blocks == 0 {
            return None;
        }
        (0..num_blocks)
            .map(|i| (begin_block + i) % num_blocks)
            .find(|&block| self.status(block) == Some(BlockStatus::NotRequested))
    }

    /// True while any block is requested but neither delivered nor failed.
    pub fn any_in_flight(&self) -> bool {
        self.map
            .iter()
            .enumerate()
            .any(|(block, &s)| s == BlockStatus::Requested && !self.failures.contains_key(&block))
    }

    pub fn num_blocks_loaded(&self) -> usize {
        self.map
            .iter()
            .filter(|&&s| s == BlockStatus::Loaded)
            .count()
    }

    /// Returns true once every byte-carrying block has been delivered.
    pub fn is_data_loaded(&self) -> bool {
        !self.closed && (0..self.num_blocks()).all(|block| self.is_loaded(block))
    }

    /// Loaded bytes `[begin, end)`. Both ends must fall inside one loaded
    /// span; callers only ask for ranges of blocks they checked.
    pub fn bytes(&self, begin: usize, end: usize) -> ShimResult<&[u8]> {
        if begin > end || end > self.content.len() {
            return Err(ShimError::InvalidByteRange { begin, end });
        }
        Ok(&self.content[begin..end])
    }

    /// Frees the content buffer and the block map and marks the state closed.
    pub fn release(&mut self) {
        self.content = Vec::new();
        self.map = Vec::new();
        self.failures.clear();
        self.closed = true;
    }
}

impl fmt::Debug for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchState")
            .field("block_shift", &self.block_shift)
            .field("content_length", &self.content_length)
            .field("map_length", &self.map_length)
            .field("loaded", &self.num_blocks_loaded())
            .field("closed", &self.closed)
            .finish()
    }
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a progressive stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    fn next() -> Self {
        StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        StreamId(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Shared {
    id: StreamId,
    state: Mutex<FetchState>,
    #[cfg(feature = "async")]
    delivered: tokio::sync::Notify,
}

/// Shared, reference-counted handle to a [`FetchState`].
///
/// The stream and the driver each hold a clone, as does any in-flight fetch
/// that will deliver into it. Closing the stream releases the buffers in
/// place; the state itself lives until the last clone is dropped, so late
/// deliveries always land on valid memory and are ignored.
#[derive(Clone)]
pub struct FetchHandle {
    shared: Arc<Shared>,
}

impl FetchHandle {
    pub fn new(state: FetchState) -> Self {
        FetchHandle {
            shared: Arc::new(Shared {
                id: StreamId::next(),
                state: Mutex::new(state),
                #[cfg(feature = "async")]
                delivered: tokio::sync::Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    /// Locks the state, mapping a poisoned mutex to `Generic`.
    #[inline]
    pub fn lock(&self) -> ShimResult<MutexGuard<'_, FetchState>> {
        self.shared.state.lock().map_err(|_| {
            ShimError::Generic("Failed to lock fetch state (mutex poisoned)".to_string())
        })
    }

    /// Requests `block` on behalf of a speculative fetch. See
    /// [`FetchState::request`].
    pub fn request_block(&self, block: usize) -> ShimResult<bool> {
        Ok(self.lock()?.request(block))
    }

    /// Delivery entry point used by fetch drivers.
    pub fn deliver_block(&self, block: usize, data: &[u8]) -> ShimResult<bool> {
        let stored = self.lock()?.deliver(block, data)?;
        if stored {
            log::trace!("stream {}: block {} delivered ({} bytes)", self.id(), block, data.len());
            #[cfg(feature = "async")]
            self.shared.delivered.notify_waiters();
        } else {
            log::debug!("stream {}: ignoring block {} delivered after close", self.id(), block);
        }
        Ok(stored)
    }

    /// Records a failed fetch for `block`.
    pub fn fail_block(&self, block: usize, message: impl Into<String>) -> ShimResult<()> {
        let message = message.into();
        log::warn!("stream {}: fetch of block {} failed: {}", self.id(), block, message);
        self.lock()?.fail(block, message);
        #[cfg(feature = "async")]
        self.shared.delivered.notify_waiters();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|s| s.is_closed()).unwrap_or(true)
    }

    /// Number of live clones of this handle.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    pub(crate) fn release(&self) -> ShimResult<()> {
        self.lock()?.release();
        #[cfg(feature = "async")]
        self.shared.delivered.notify_waiters();
        Ok(())
    }

    #[cfg(feature = "async")]
    pub(crate) fn delivered(&self) -> &tokio::sync::Notify {
        &self.shared.delivered
    }
}

impl fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHandle").field("id", &self.id()).finish()
    }
}
