use super::base_stream::{BaseStream, Whence, clamp_offset};
use super::error::{ShimError, ShimResult};
use super::fetch_driver::FetchDriver;
use super::fetch_state::{BlockStatus, DEFAULT_BLOCK_SIZE, FetchHandle, FetchState, StreamId};
use std::io;
use std::sync::Arc;

/// Options for opening a progressive stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Block size in bytes; a power of two between 1 KiB and 16 MiB.
    pub block_size: usize,
    /// Hint to the driver to fetch blocks ahead of the read cursor.
    pub prefetch: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            prefetch: true,
        }
    }
}

impl FetchOptions {
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }
}

/// A seekable stream over a remote resource that is fetched in blocks.
///
/// Reads are served from blocks already delivered. Reading from a block that
/// is missing asks the driver for it (once) and fails with
/// [`ShimError::TryLater`]; the caller replays the read after the driver has
/// delivered. The stream never blocks.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use pdf_x_bridge::core::{BaseStream, FetchOptions, MemoryRangeFetcher, ProgressiveStream, PumpDriver};
///
/// let driver = Arc::new(PumpDriver::new(MemoryRangeFetcher::new(b"%PDF-1.7".to_vec())));
/// let options = FetchOptions::default().with_block_size(1024);
/// let mut stream = ProgressiveStream::open(driver.clone(), "mem://doc.pdf", 8, &options)?;
///
/// assert!(stream.read_byte().unwrap_err().is_try_later());
/// driver.run_until_idle()?;
/// assert_eq!(stream.read_byte()?, Some(b'%'));
/// # Ok::<(), pdf_x_bridge::core::ShimError>(())
/// ```
pub struct ProgressiveStream {
    handle: FetchHandle,
    driver: Arc<dyn FetchDriver>,
    url: String,
    /// Cursor just past the readable window
    pos: usize,
    /// Readable window `[rp, wp)`, as absolute offsets
    rp: usize,
    wp: usize,
    /// Copy of the block bytes ending at `wp`, so buffered reads skip the lock
    window: Vec<u8>,
    /// Cached total length (immutable, no need to lock the state)
    length: usize,
    closed: bool,
}

impl ProgressiveStream {
    /// Opens a progressive stream over `url`, whose size must be known.
    ///
    /// Fails with `InvalidArgument` for a bad block size and `OutOfMemory`
    /// when the content buffer cannot be allocated. If the driver refuses the
    /// stream, the freshly allocated state is released before returning.
    pub fn open(
        driver: Arc<dyn FetchDriver>,
        url: impl Into<String>,
        content_length: usize,
        options: &FetchOptions,
    ) -> ShimResult<Self> {
        let url = url.into();
        let state = FetchState::new(content_length, options.block_size)?;
        let block_shift = state.block_shift();
        let handle = FetchHandle::new(state);

        if let Err(e) = driver.open(&handle, &url, content_length, block_shift, options.prefetch) {
            handle.release()?;
            return Err(e);
        }
        log::debug!("stream {}: opened {} ({} bytes)", handle.id(), url, content_length);

        Ok(ProgressiveStream {
            handle,
            driver,
            url,
            pos: 0,
            rp: 0,
            wp: 0,
            window: Vec::new(),
            length: content_length,
            closed: false,
        })
    }

    pub fn id(&self) -> StreamId {
        self.handle.id()
    }

    /// Handle the driver delivers into.
    pub fn handle(&self) -> &FetchHandle {
        &self.handle
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns the number of blocks delivered so far.
    pub fn num_blocks_loaded(&self) -> ShimResult<usize> {
        Ok(self.handle.lock()?.num_blocks_loaded())
    }

    /// Returns true once every block has been delivered.
    pub fn is_fully_loaded(&self) -> bool {
        self.handle
            .lock()
            .map(|state| state.is_data_loaded())
            .unwrap_or(false)
    }

    /// Index of `rp` inside `window`.
    #[inline]
    fn window_index(&self) -> usize {
        self.rp - (self.wp - self.window.len())
    }

    fn ensure_open(&self) -> ShimResult<()> {
        if self.closed {
            return Err(ShimError::Generic("read from closed stream".to_string()));
        }
        Ok(())
    }
}

impl BaseStream for ProgressiveStream {
    fn length(&self) -> usize {
        self.length
    }

    fn pos(&self) -> usize {
        self.pos - (self.wp - self.rp)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> usize {
        let base = match whence {
            Whence::Start => 0,
            Whence::Current => self.pos(),
            Whence::End => self.length,
        };
        self.pos = clamp_offset(base, offset, self.length);
        self.rp = 0;
        self.wp = 0;
        self.window.clear();
        self.pos
    }

    fn next(&mut self, _len: usize) -> ShimResult<Option<u8>> {
        self.ensure_open()?;
        self.rp = 0;
        self.wp = 0;
        self.window.clear();
        if self.pos >= self.length {
            return Ok(None);
        }

        let mut state = self.handle.lock()?;
        let block = state.block_of(self.pos);
        match state.status(block) {
            Some(BlockStatus::NotRequested) => {
                state.request(block);
                drop(state);
                log::trace!("stream {}: requesting block {}", self.id(), block);
                self.driver.read_block(&self.handle, block);
                Err(ShimError::TryLater { block })
            }
            Some(BlockStatus::Requested) => match state.failure_for(block) {
                Some(msg) => Err(ShimError::Generic(format!(
                    "fetch failed for block {}: {}",
                    block, msg
                ))),
                None => Err(ShimError::TryLater { block }),
            },
            Some(BlockStatus::Loaded) => {
                let (_, end) = state.block_range(block);
                self.window.extend_from_slice(state.bytes(self.pos, end)?);
                let byte = self.window.first().copied();
                self.rp = self.pos;
                self.wp = end;
                self.pos = end;
                if byte.is_some() {
                    self.rp += 1;
                }
                Ok(byte)
            }
            None => Err(ShimError::Generic("fetch state released".to_string())),
        }
    }

    fn available(&self) -> usize {
        self.wp - self.rp
    }

    fn read_byte(&mut self) -> ShimResult<Option<u8>> {
        if self.rp < self.wp {
            let byte = self.window[self.window_index()];
            self.rp += 1;
            return Ok(Some(byte));
        }
        self.next(1)
    }

    fn read_into(&mut self, buf: &mut [u8]) -> ShimResult<usize> {
        let mut n = 0;
        while n < buf.len() {
            if self.rp == self.wp {
                match self.next(buf.len() - n) {
                    Ok(Some(byte)) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    Ok(None) => break,
                    Err(e) if n > 0 && e.is_try_later() => break,
                    Err(e) => return Err(e),
                }
                continue;
            }
            let count = (self.wp - self.rp).min(buf.len() - n);
            let start = self.window_index();
            buf[n..n + count].copy_from_slice(&self.window[start..start + count]);
            self.rp += count;
            n += count;
        }
        Ok(n)
    }

    fn close(&mut self) -> ShimResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.rp = 0;
        self.wp = 0;
        self.window = Vec::new();
        self.handle.release()?;
        self.driver.close(self.handle.id());
        Ok(())
    }
}

impl Drop for ProgressiveStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("stream {}: close failed: {}", self.handle.id(), e);
        }
    }
}

/// Maps shim errors onto `io::Error`, with `TryLater` as `WouldBlock`.
pub(crate) fn to_io_error(e: ShimError) -> io::Error {
    match e {
        ShimError::TryLater { .. } => io::Error::new(io::ErrorKind::WouldBlock, e),
        ShimError::Io(inner) => inner,
        ShimError::UnexpectedEndOfStream => io::Error::new(io::ErrorKind::UnexpectedEof, e),
        ShimError::InvalidArgument(_) => io::Error::new(io::ErrorKind::InvalidInput, e),
        ShimError::OutOfMemory { .. } => io::Error::new(io::ErrorKind::OutOfMemory, e),
        other => io::Error::other(other),
    }
}

impl io::Read for ProgressiveStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_into(buf).map_err(to_io_error)
    }
}

impl io::Seek for ProgressiveStream {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            io::SeekFrom::Start(offset) => {
                BaseStream::seek(self, i64::try_from(offset).unwrap_or(i64::MAX), Whence::Start)
            }
            io::SeekFrom::Current(offset) => BaseStream::seek(self, offset, Whence::Current),
            io::SeekFrom::End(offset) => BaseStream::seek(self, offset, Whence::End),
        };
        Ok(new_pos as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fetch_driver::{MemoryRangeFetcher, PumpDriver};
    use crate::core::fetch_state::block_shift_for;
    use std::io::Read;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn open(data: &[u8], prefetch: bool) -> (Arc<PumpDriver<MemoryRangeFetcher>>, ProgressiveStream) {
        let driver = Arc::new(PumpDriver::new(MemoryRangeFetcher::new(data.to_vec())));
        let options = FetchOptions::default().with_block_size(1024).with_prefetch(prefetch);
        let stream = ProgressiveStream::open(driver.clone(), "mem://sample", data.len(), &options)
            .unwrap();
        (driver, stream)
    }

    #[test]
    fn test_open_rejects_bad_block_size() {
        let driver = Arc::new(PumpDriver::new(MemoryRangeFetcher::new(vec![0; 10])));
        let options = FetchOptions::default().with_block_size(1000);
        let result = ProgressiveStream::open(driver.clone(), "mem://x", 10, &options);

        assert!(matches!(result, Err(ShimError::InvalidArgument(_))));
        assert_eq!(driver.open_streams(), 0);
    }

    #[test]
    fn test_first_read_is_try_later() {
        let data = sample(3000);
        let (driver, mut stream) = open(&data, false);

        assert!(matches!(stream.read_byte(), Err(ShimError::TryLater { block: 0 })));
        assert!(matches!(stream.read_byte(), Err(ShimError::TryLater { block: 0 })));
        assert_eq!(driver.pending(), 1);
        assert_eq!(stream.pos(), 0);

        driver.run_until_idle().unwrap();
        assert_eq!(stream.read_byte().unwrap(), Some(data[0]));
        assert_eq!(stream.read_byte().unwrap(), Some(data[1]));
        assert_eq!(stream.pos(), 2);
        assert_eq!(stream.available(), 1022);
    }

    #[test]
    fn test_window_ends_at_block_boundary() {
        let data = sample(3000);
        let (driver, mut stream) = open(&data, false);
        stream.read_byte().unwrap_err();
        driver.run_until_idle().unwrap();

        stream.seek(1023, Whence::Start);
        assert_eq!(stream.read_byte().unwrap(), Some(data[1023]));
        assert!(stream.read_byte().unwrap_err().is_try_later());
        assert_eq!(stream.pos(), 1024);
    }

    #[test]
    fn test_default_options() {
        let options = FetchOptions::default();
        assert_eq!(options.block_size, 64 * 1024);
        assert_eq!(block_shift_for(options.block_size).unwrap(), 16);
        assert!(options.prefetch);
    }

    #[test]
    fn test_buffered_reads_do_not_lock_state() {
        let data = sample(3000);
        let (driver, mut stream) = open(&data, false);
        stream.read_byte().unwrap_err();
        driver.run_until_idle().unwrap();
        assert_eq!(stream.read_byte().unwrap(), Some(data[0]));

        // Hold the state lock, as a driver mid-delivery would.
        let handle = stream.handle().clone();
        let _guard = handle.lock().unwrap();

        assert_eq!(stream.read_byte().unwrap(), Some(data[1]));
        let mut buf = [0u8; 100];
        assert_eq!(stream.read_into(&mut buf).unwrap(), 100);
        assert_eq!(&buf[..], &data[2..102]);
        assert_eq!(stream.available(), 1024 - 102);
    }

    #[test]
    fn test_seek_clamps_and_tells() {
        let data = sample(3000);
        let (_driver, mut stream) = open(&data, false);

        assert_eq!(stream.seek(-5, Whence::Start), 0);
        assert_eq!(stream.seek(10, Whence::End), 3000);
        assert_eq!(stream.seek(-100, Whence::Current), 2900);
        assert_eq!(stream.pos(), 2900);
    }

    #[test]
    fn test_eof_after_last_byte() {
        let data = sample(1500);
        let (driver, mut stream) = open(&data, true);
        stream.read_byte().unwrap_err();
        driver.run_until_idle().unwrap();

        stream.seek(-1, Whence::End);
        assert_eq!(stream.read_byte().unwrap(), Some(data[1499]));
        assert_eq!(stream.read_byte().unwrap(), None);
        assert_eq!(stream.read_byte().unwrap(), None);
    }

    #[test]
    fn test_read_bytes_rewinds_on_try_later() {
        let data = sample(3000);
        let (driver, mut stream) = open(&data, false);
        stream.read_byte().unwrap_err();
        driver.run_until_idle().unwrap();

        stream.seek(1000, Whence::Start);
        assert!(stream.read_bytes(100).unwrap_err().is_try_later());
        assert_eq!(stream.pos(), 1000);

        driver.run_until_idle().unwrap();
        assert_eq!(stream.read_bytes(100).unwrap(), data[1000..1100].to_vec());
    }

    #[test]
    fn test_io_read_maps_would_block() {
        let data = sample(2048);
        let (driver, mut stream) = open(&data, true);
        let mut buf = [0u8; 16];

        let err = stream.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        driver.run_until_idle().unwrap();
        let mut all = Vec::new();
        stream.read_to_end(&mut all).unwrap();
        assert_eq!(all, data);
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_reads() {
        let data = sample(2048);
        let (driver, mut stream) = open(&data, false);
        let handle = stream.handle().clone();

        stream.close().unwrap();
        stream.close().unwrap();

        assert!(handle.is_closed());
        assert_eq!(driver.open_streams(), 0);
        assert!(matches!(stream.read_byte(), Err(ShimError::Generic(_))));
    }

    #[test]
    fn test_empty_resource() {
        let (_driver, mut stream) = open(&[], false);

        assert!(stream.is_empty());
        assert_eq!(stream.read_byte().unwrap(), None);
    }
}
