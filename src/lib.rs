//! # PDF-X Bridge: progressive streams for flat hosts
//!
//! PDF-X Bridge is the export layer between the PDF-X engine and hosts that
//! can only call flat functions: WebAssembly embedders, C callers, scripting
//! runtimes. Its centrepiece is a progressive stream that presents a remote
//! document as an ordinary seekable byte stream while the bytes arrive in
//! blocks over an asynchronous, host-controlled fetch mechanism.
//!
//! ## Progressive Loading
//!
//! A read from a block that has not arrived yet does not block. The stream
//! asks the host's fetch driver for the block (once), and fails with
//! [`ShimError::TryLater`]. The host waits for the delivery and replays the
//! identical call:
//!
//! ```rust
//! use std::sync::Arc;
//! use pdf_x_bridge::core::{BaseStream, FetchOptions, MemoryRangeFetcher, ProgressiveStream, PumpDriver};
//! use pdf_x_bridge::retry_on_try_later;
//!
//! let data = b"%PDF-1.7\n%%EOF\n".to_vec();
//! let driver = Arc::new(PumpDriver::new(MemoryRangeFetcher::new(data.clone())));
//! let options = FetchOptions::default().with_block_size(1024);
//! let mut stream = ProgressiveStream::open(driver.clone(), "mem://doc.pdf", data.len(), &options)?;
//!
//! let header = retry_on_try_later!(driver.run_until_idle()?, stream.read_bytes(8))?;
//! assert_eq!(header, b"%PDF-1.7");
//! # Ok::<(), pdf_x_bridge::core::ShimError>(())
//! ```
//!
//! ## Architecture
//!
//! 1. **Fetch state**: sparse content buffer plus per-block status map,
//!    shared between the stream and the driver through a [`FetchHandle`](crate::core::FetchHandle)
//! 2. **Streams**: [`ProgressiveStream`](crate::core::ProgressiveStream) implements the pull contract
//!    ([`BaseStream`](crate::core::BaseStream), `std::io::Read`, `std::io::Seek`)
//! 3. **Drivers**: [`FetchDriver`](crate::core::FetchDriver) receives open/read/close signals;
//!    [`PumpDriver`](crate::core::PumpDriver) is a single-threaded event loop, and with the
//!    `async` feature `TokioFetchDriver` fetches over HTTP ranges
//! 4. **Boundary**: [`Session`](crate::core::Session) replaces global engine state, the
//!    [`bridge`](crate::core::bridge) collapses errors to "try later" or "error", and
//!    [`ffi`] exposes it all as `extern "C"` functions

pub mod core;
pub mod ffi;

// Re-export main types for convenience
pub use self::core::{
    BaseStream, BlockStatus, ErrorKind, FetchDriver, FetchHandle, FetchOptions, FetchState,
    HostError, ProgressiveStream, PumpDriver, Session, ShimError, ShimResult, StreamId, Whence,
};

#[cfg(feature = "async")]
pub use self::core::{AsyncProgressiveStream, TokioFetchDriver};
