pub mod base_stream;
pub mod bridge;
pub mod error;
pub mod fetch_driver;
pub mod fetch_state;
pub mod fetch_stream;
pub mod retry;
pub mod session;

#[cfg(feature = "async")]
pub mod async_fetch_stream;
#[cfg(feature = "async")]
pub mod http_fetch_driver;

pub use base_stream::{BaseStream, Whence};
pub use bridge::{HostError, HostResult, catch};
pub use error::{ErrorKind, ShimError, ShimResult};
pub use fetch_driver::{FetchDriver, FileRangeFetcher, MemoryRangeFetcher, PumpDriver, RangeFetcher};
pub use fetch_state::{
    BlockStatus, DEFAULT_BLOCK_SIZE, FetchHandle, FetchState, MAX_BLOCK_SHIFT, MIN_BLOCK_SHIFT,
    StreamId, block_shift_for,
};
pub use fetch_stream::{FetchOptions, ProgressiveStream};
pub use session::Session;

#[cfg(feature = "async")]
pub use async_fetch_stream::AsyncProgressiveStream;
#[cfg(feature = "async")]
pub use http_fetch_driver::{TokioFetchDriver, default_client, fetch_range, probe_content_length};
