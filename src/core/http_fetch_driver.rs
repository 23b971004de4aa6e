//! Async HTTP fetch driver for progressive streams.
//!
//! Every requested block becomes a tokio task issuing an HTTP range request
//! with reqwest; the body is delivered straight into the stream's
//! [`FetchHandle`]. This is the multithreaded counterpart of
//! [`PumpDriver`](super::fetch_driver::PumpDriver).

use super::error::{ShimError, ShimResult};
use super::fetch_driver::FetchDriver;
use super::fetch_state::{FetchHandle, StreamId};
use reqwest::Client;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;

/// Timeout applied to every request of the default client.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates the HTTP client used by [`TokioFetchDriver::new`].
pub fn default_client() -> ShimResult<Client> {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| ShimError::Generic(format!("Failed to create HTTP client: {}", e)))
}

/// Asks the server for the size of `url`.
///
/// Makes a HEAD request, requires `Accept-Ranges: bytes` and parses the
/// `Content-Length` header.
pub async fn probe_content_length(client: &Client, url: &str) -> ShimResult<usize> {
    let response = client
        .head(url)
        .send()
        .await
        .map_err(|e| ShimError::Generic(format!("Failed to HEAD request: {}", e)))?;

    let accepts_ranges = response
        .headers()
        .get("accept-ranges")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);

    if !accepts_ranges {
        return Err(ShimError::Generic(
            "Server does not support range requests".to_string(),
        ));
    }

    response
        .headers()
        .get("content-length")
        .ok_or_else(|| ShimError::Generic("No Content-Length header".to_string()))?
        .to_str()
        .map_err(|_| ShimError::Generic("Invalid Content-Length header".to_string()))?
        .parse()
        .map_err(|_| ShimError::Generic("Invalid Content-Length value".to_string()))
}

/// Fetches bytes `[start, end)` of `url` with a range request.
pub async fn fetch_range(client: &Client, url: &str, start: usize, end: usize) -> ShimResult<Vec<u8>> {
    if start >= end {
        return Ok(Vec::new());
    }
    let response = client
        .get(url)
        .header("Range", format!("bytes={}-{}", start, end - 1))
        .send()
        .await
        .map_err(|e| ShimError::Generic(format!("Failed to fetch bytes {}-{}: {}", start, end, e)))?;

    if response.status() != 206 {
        return Err(ShimError::Generic(format!(
            "Expected 206 status, got {}",
            response.status()
        )));
    }

    Ok(response
        .bytes()
        .await
        .map_err(|e| ShimError::Generic(format!("Failed to read response: {}", e)))?
        .to_vec())
}

struct Entry {
    url: String,
    prefetch: bool,
}

struct DriverInner {
    client: Client,
    runtime: Handle,
    streams: Mutex<FxHashMap<StreamId, Entry>>,
}

impl DriverInner {
    #[inline]
    fn lock_streams(&self) -> ShimResult<MutexGuard<'_, FxHashMap<StreamId, Entry>>> {
        self.streams.lock().map_err(|_| {
            ShimError::Generic("Failed to lock stream table (mutex poisoned)".to_string())
        })
    }

    fn lookup(&self, id: StreamId) -> Option<(String, bool)> {
        let streams = self.lock_streams().ok()?;
        streams.get(&id).map(|e| (e.url.clone(), e.prefetch))
    }
}

/// Fetch driver that serves blocks from tokio tasks.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use pdf_x_bridge::core::{AsyncProgressiveStream, FetchOptions, TokioFetchDriver, default_client, probe_content_length};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let url = "https://example.com/document.pdf";
///     let length = probe_content_length(&default_client()?, url).await?;
///     let driver = Arc::new(TokioFetchDriver::new(tokio::runtime::Handle::current())?);
///     let mut stream = AsyncProgressiveStream::open(driver, url, length, &FetchOptions::default())?;
///     let header = stream.read_bytes(8).await?;
///     println!("{:?}", String::from_utf8_lossy(&header));
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct TokioFetchDriver {
    inner: Arc<DriverInner>,
}

impl TokioFetchDriver {
    /// Creates a driver with the default client, spawning onto `runtime`.
    pub fn new(runtime: Handle) -> ShimResult<Self> {
        Ok(Self::with_client(default_client()?, runtime))
    }

    pub fn with_client(client: Client, runtime: Handle) -> Self {
        TokioFetchDriver {
            inner: Arc::new(DriverInner {
                client,
                runtime,
                streams: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Number of streams the driver is tracking.
    pub fn open_streams(&self) -> usize {
        self.inner.lock_streams().map(|s| s.len()).unwrap_or(0)
    }
}

fn spawn_fetch(inner: Arc<DriverInner>, handle: FetchHandle, block: usize) {
    let runtime = inner.runtime.clone();
    runtime.spawn(async move {
        let Some((url, prefetch)) = inner.lookup(handle.id()) else {
            return;
        };
        let (start, end) = match handle.lock() {
            Ok(state) if !state.is_closed() => state.block_range(block),
            _ => return,
        };

        log::trace!("stream {}: GET {} bytes={}-{}", handle.id(), url, start, end);
        let result = fetch_range(&inner.client, &url, start, end)
            .await
            .and_then(|data| handle.deliver_block(block, &data));
        match result {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                if let Err(e) = handle.fail_block(block, e.to_string()) {
                    log::error!("stream {}: {}", handle.id(), e);
                    return;
                }
            }
        }

        if prefetch {
            prefetch_next(inner, handle, block + 1);
        }
    });
}

fn prefetch_next(inner: Arc<DriverInner>, handle: FetchHandle, next: usize) {
    let block = {
        let Ok(mut state) = handle.lock() else {
            return;
        };
        if state.is_closed() || state.any_in_flight() {
            return;
        }
        match state.next_empty_block(next) {
            Some(block) if state.request(block) => block,
            _ => return,
        }
    };
    log::trace!("stream {}: prefetching block {}", handle.id(), block);
    spawn_fetch(inner, handle, block);
}

impl FetchDriver for TokioFetchDriver {
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
        self.inner.lock_streams()?.insert(
            handle.id(),
            Entry {
                url: url.to_string(),
                prefetch,
            },
        );
        Ok(())
    }

    fn read_block(&self, handle: &FetchHandle, block: usize) {
        spawn_fetch(self.inner.clone(), handle.clone(), block);
    }

    fn close(&self, id: StreamId) {
        if let Ok(mut streams) = self.inner.lock_streams() {
            streams.remove(&id);
        }
        log::debug!("stream {}: closed", id);
    }
}
