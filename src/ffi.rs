//! C-compatible export surface for progressive streams.
//!
//! # ABI Contract
//!
//! All exported functions use the `extern "C"` calling convention with
//! stable `pdfx_*` symbol names.
//!
//! ## Sessions
//! - `pdfx_session_new` takes a table of host callbacks and returns an opaque
//!   session; release it with `pdfx_session_free`.
//! - Streams are addressed by a non-zero `u64` id. `0` is never a valid id.
//!
//! ## Error handling
//! - Status codes: `0` ok, `-1` end of stream, `-2` try later, `-3` error.
//! - After `-3`, the diagnostic text is available from `pdfx_last_error`
//!   (thread-local, valid until the next failing call on the same thread).
//! - `-2` means the block is being fetched: wait for the host's delivery and
//!   repeat the identical call.
//!
//! ## Callbacks
//! - `fetch_open(user_data, stream, url, content_length, block_shift, prefetch)`
//!   is called once when a stream is opened.
//! - `fetch_read(user_data, stream, block)` is called once per block, the
//!   first time it is needed, unless the host already claimed the block with
//!   `pdfx_request_block`.
//! - `fetch_close(user_data, stream)` is called once when a stream is dropped.
//!
//! Callbacks must not call back into the session synchronously. Deliveries
//! (`pdfx_on_data_fetched`) happen later, from the host's event loop.

use std::cell::RefCell;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::ptr;
use std::slice;
use std::sync::Arc;

use crate::core::base_stream::Whence;
use crate::core::bridge::{HostError, STATUS_EOF, STATUS_OK, catch};
use crate::core::error::{ShimError, ShimResult};
use crate::core::fetch_driver::FetchDriver;
use crate::core::fetch_state::{FetchHandle, StreamId};
use crate::core::session::Session;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg.replace('\0', " ")).ok();
    });
}

/// Records a host error and returns its status code.
fn report(err: HostError) -> c_int {
    if let HostError::Error(msg) = &err {
        set_last_error(msg);
    }
    err.status()
}

/// Host callback table passed to [`pdfx_session_new`].
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PdfxFetchCallbacks {
    /// Opaque pointer handed back to every callback.
    pub user_data: *mut c_void,
    pub fetch_open: Option<
        unsafe extern "C" fn(
            user_data: *mut c_void,
            stream: u64,
            url: *const c_char,
            content_length: usize,
            block_shift: u32,
            prefetch: c_int,
        ),
    >,
    pub fetch_read: Option<unsafe extern "C" fn(user_data: *mut c_void, stream: u64, block: usize)>,
    pub fetch_close: Option<unsafe extern "C" fn(user_data: *mut c_void, stream: u64)>,
}

/// [`FetchDriver`] forwarding every signal to host callbacks.
struct CallbackDriver {
    callbacks: PdfxFetchCallbacks,
}

// SAFETY: the host guarantees that `user_data` and the callbacks may be used
// from whichever thread drives the session.
unsafe impl Send for CallbackDriver {}
unsafe impl Sync for CallbackDriver {}

impl FetchDriver for CallbackDriver {
    fn open(
        &self,
        handle: &FetchHandle,
        url: &str,
        content_length: usize,
        block_shift: u32,
        prefetch: bool,
    ) -> ShimResult<()> {
        let url = CString::new(url)
            .map_err(|_| ShimError::invalid("url contains an interior NUL byte"))?;
        if let Some(fetch_open) = self.callbacks.fetch_open {
            // SAFETY: callback and user_data come from the host's table.
            unsafe {
                fetch_open(
                    self.callbacks.user_data,
                    handle.id().as_raw(),
                    url.as_ptr(),
                    content_length,
                    block_shift,
                    prefetch as c_int,
                )
            };
        }
        Ok(())
    }

    fn read_block(&self, handle: &FetchHandle, block: usize) {
        if let Some(fetch_read) = self.callbacks.fetch_read {
            // SAFETY: callback and user_data come from the host's table.
            unsafe { fetch_read(self.callbacks.user_data, handle.id().as_raw(), block) };
        }
    }

    fn close(&self, id: StreamId) {
        if let Some(fetch_close) = self.callbacks.fetch_close {
            // SAFETY: callback and user_data come from the host's table.
            unsafe { fetch_close(self.callbacks.user_data, id.as_raw()) };
        }
    }
}

/// Opaque session handle.
pub struct PdfxSession {
    session: Session,
}

fn session_mut<'a>(session: *mut PdfxSession) -> ShimResult<&'a mut Session> {
    // SAFETY: the caller passes a pointer obtained from pdfx_session_new.
    unsafe { session.as_mut() }
        .map(|s| &mut s.session)
        .ok_or_else(|| ShimError::invalid("null session"))
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Creates a session whose streams signal the host through `callbacks`.
///
/// Returns null on error; see `pdfx_last_error`.
///
/// # Safety
/// `callbacks` must point to a valid callback table. The table is copied.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pdfx_session_new(callbacks: *const PdfxFetchCallbacks) -> *mut PdfxSession {
    // SAFETY: checked for null; the caller guarantees validity otherwise.
    let Some(callbacks) = (unsafe { callbacks.as_ref() }) else {
        set_last_error("null callback table");
        return ptr::null_mut();
    };
    let driver = Arc::new(CallbackDriver {
        callbacks: *callbacks,
    });
    Box::into_raw(Box::new(PdfxSession {
        session: Session::new(driver),
    }))
}

/// Frees a session and closes every stream still open in it.
///
/// # Safety
/// `session` must come from `pdfx_session_new` and not be used afterwards.
/// Passing null is a no-op.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pdfx_session_free(session: *mut PdfxSession) {
    if !session.is_null() {
        // SAFETY: ownership returns to Rust exactly once.
        drop(unsafe { Box::from_raw(session) });
    }
}

// ---------------------------------------------------------------------------
// Progressive streams
// ---------------------------------------------------------------------------

/// Opens a progressive stream over `url`.
///
/// Returns the stream id, or `0` on error (`pdfx_last_error` has details).
///
/// # Safety
/// `session` must be valid and `url` a NUL-terminated UTF-8 string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pdfx_open_stream_from_url(
    session: *mut PdfxSession,
    url: *const c_char,
    content_length: usize,
    block_size: usize,
    prefetch: c_int,
) -> u64 {
    let result = session_mut(session).and_then(|session| {
        if url.is_null() {
            return Err(ShimError::invalid("null url"));
        }
        // SAFETY: checked for null; the caller guarantees NUL termination.
        let url = unsafe { CStr::from_ptr(url) }
            .to_str()
            .map_err(|_| ShimError::invalid("url is not valid UTF-8"))?;
        session.open_stream_from_url(url, content_length, block_size, prefetch != 0)
    });
    match catch(result) {
        Ok(id) => id.as_raw(),
        Err(err) => {
            set_last_error(err.message());
            0
        }
    }
}

/// Reads one byte.
///
/// Returns the byte (`0..=255`), `-1` at end of stream, `-2` to try later or
/// `-3` on error.
///
/// # Safety
/// `session` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pdfx_stream_read_byte(session: *mut PdfxSession, stream: u64) -> c_int {
    let result = session_mut(session).and_then(|s| s.read_byte(StreamId::from_raw(stream)));
    match catch(result) {
        Ok(Some(byte)) => byte as c_int,
        Ok(None) => STATUS_EOF,
        Err(err) => report(err),
    }
}

/// Reads up to `len` bytes into `buf`.
///
/// Returns the number of bytes read (`0` at end of stream) or a negative
/// status code.
///
/// # Safety
/// `session` must be valid and `buf` must be writable for `len` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pdfx_stream_read(
    session: *mut PdfxSession,
    stream: u64,
    buf: *mut u8,
    len: usize,
) -> isize {
    let result = session_mut(session).and_then(|s| {
        if len == 0 {
            return Ok(0);
        }
        if buf.is_null() {
            return Err(ShimError::invalid("null buffer"));
        }
        // SAFETY: checked for null; the caller guarantees `len` writable bytes.
        let out = unsafe { slice::from_raw_parts_mut(buf, len) };
        s.read_into(StreamId::from_raw(stream), out)
    });
    match catch(result) {
        Ok(n) => n as isize,
        Err(err) => report(err) as isize,
    }
}

/// Repositions a stream. `whence` is `0` (start), `1` (current) or `2` (end).
///
/// Returns the new position or `-3` on error.
///
/// # Safety
/// `session` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pdfx_stream_seek(
    session: *mut PdfxSession,
    stream: u64,
    offset: i64,
    whence: c_int,
) -> i64 {
    let result = session_mut(session).and_then(|s| {
        let whence = Whence::from_raw(whence)
            .ok_or_else(|| ShimError::invalid(format!("invalid whence: {}", whence)))?;
        s.seek(StreamId::from_raw(stream), offset, whence)
    });
    match catch(result) {
        Ok(pos) => pos as i64,
        Err(err) => report(err) as i64,
    }
}

/// Closes a stream. Unknown ids are ignored.
///
/// # Safety
/// `session` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pdfx_drop_stream(session: *mut PdfxSession, stream: u64) {
    if let Ok(session) = session_mut(session) {
        session.drop_stream(StreamId::from_raw(stream));
    }
}

/// Delivers the bytes of `block` to a stream.
///
/// Returns `0` when stored, `1` when the stream is gone and the data was
/// ignored, `-3` for a malformed delivery.
///
/// # Safety
/// `session` must be valid and `data` readable for `size` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pdfx_on_data_fetched(
    session: *mut PdfxSession,
    stream: u64,
    block: usize,
    data: *const u8,
    size: usize,
) -> c_int {
    let result = session_mut(session).and_then(|s| {
        let bytes: &[u8] = if size == 0 {
            &[]
        } else if data.is_null() {
            return Err(ShimError::invalid("null data"));
        } else {
            // SAFETY: checked for null; the caller guarantees `size` bytes.
            unsafe { slice::from_raw_parts(data, size) }
        };
        s.on_data_fetched(StreamId::from_raw(stream), block, bytes)
    });
    match catch(result) {
        Ok(true) => STATUS_OK,
        Ok(false) => 1,
        Err(err) => report(err),
    }
}

/// Claims `block` for a fetch the host starts on its own, ahead of any read.
///
/// Returns `1` when this call claimed the block, `0` when it was already
/// claimed or requested, `-3` for an unknown stream or a block past the map.
/// A claimed block is never passed to `fetch_read`; the host must finish it
/// with `pdfx_on_data_fetched` or `pdfx_on_fetch_failed`.
///
/// # Safety
/// `session` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pdfx_request_block(session: *mut PdfxSession, stream: u64, block: usize) -> c_int {
    let result = session_mut(session).and_then(|s| s.request_block(StreamId::from_raw(stream), block));
    match catch(result) {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(err) => report(err),
    }
}

/// Reports that fetching `block` failed; later reads of it fail with `-3`.
///
/// # Safety
/// `session` must be valid and `message` null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pdfx_on_fetch_failed(
    session: *mut PdfxSession,
    stream: u64,
    block: usize,
    message: *const c_char,
) -> c_int {
    let message = if message.is_null() {
        "fetch failed".to_string()
    } else {
        // SAFETY: checked for null; the caller guarantees NUL termination.
        unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
    };
    let result = session_mut(session)
        .and_then(|s| s.on_fetch_failed(StreamId::from_raw(stream), block, &message));
    match catch(result) {
        Ok(()) => STATUS_OK,
        Err(err) => report(err),
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Message of the last error on this thread, or null.
///
/// The pointer stays valid until the next failing call on this thread.
#[unsafe(no_mangle)]
pub extern "C" fn pdfx_last_error() -> *const c_char {
    LAST_ERROR.with(|e| e.borrow().as_ref().map_or(ptr::null(), |s| s.as_ptr()))
}

/// Clears the last error on this thread.
#[unsafe(no_mangle)]
pub extern "C" fn pdfx_clear_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}
