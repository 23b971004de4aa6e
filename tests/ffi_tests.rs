//! Tests of the `extern "C"` surface, driven the way a C host would: raw
//! pointers, callbacks and status codes.

use pdf_x_bridge::ffi::*;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::ptr;
use std::sync::Mutex;

/// Host-side bookkeeping the callbacks write into through `user_data`.
#[derive(Default)]
struct Host {
    opened: Mutex<Vec<(u64, String, usize, u32, bool)>>,
    reads: Mutex<Vec<(u64, usize)>>,
    closed: Mutex<Vec<u64>>,
}

unsafe extern "C" fn on_open(
    user_data: *mut c_void,
    stream: u64,
    url: *const c_char,
    content_length: usize,
    block_shift: u32,
    prefetch: c_int,
) {
    let host = unsafe { &*(user_data as *const Host) };
    let url = unsafe { CStr::from_ptr(url) }.to_string_lossy().into_owned();
    host.opened
        .lock()
        .unwrap()
        .push((stream, url, content_length, block_shift, prefetch != 0));
}

unsafe extern "C" fn on_read(user_data: *mut c_void, stream: u64, block: usize) {
    let host = unsafe { &*(user_data as *const Host) };
    host.reads.lock().unwrap().push((stream, block));
}

unsafe extern "C" fn on_close(user_data: *mut c_void, stream: u64) {
    let host = unsafe { &*(user_data as *const Host) };
    host.closed.lock().unwrap().push(stream);
}

fn new_session(host: &Host) -> *mut PdfxSession {
    let callbacks = PdfxFetchCallbacks {
        user_data: host as *const Host as *mut c_void,
        fetch_open: Some(on_open),
        fetch_read: Some(on_read),
        fetch_close: Some(on_close),
    };
    let session = unsafe { pdfx_session_new(&callbacks) };
    assert!(!session.is_null());
    session
}

fn last_error() -> String {
    let ptr = pdfx_last_error();
    assert!(!ptr.is_null(), "Expected an error message");
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

#[test]
fn test_read_byte_try_later_then_byte() {
    let host = Host::default();
    let session = new_session(&host);
    let data = sample(3000);
    let url = CString::new("https://example.test/doc.pdf").unwrap();

    unsafe {
        let stream = pdfx_open_stream_from_url(session, url.as_ptr(), data.len(), 1024, 0);
        assert_ne!(stream, 0);
        assert_eq!(
            host.opened.lock().unwrap().as_slice(),
            &[(stream, "https://example.test/doc.pdf".to_string(), 3000, 10, false)]
        );

        assert_eq!(pdfx_stream_read_byte(session, stream), -2);
        assert_eq!(pdfx_stream_read_byte(session, stream), -2);
        assert_eq!(host.reads.lock().unwrap().as_slice(), &[(stream, 0)]);

        assert_eq!(pdfx_on_data_fetched(session, stream, 0, data.as_ptr(), 1024), 0);
        assert_eq!(pdfx_stream_read_byte(session, stream), data[0] as c_int);
        assert_eq!(pdfx_stream_read_byte(session, stream), data[1] as c_int);

        pdfx_drop_stream(session, stream);
        assert_eq!(host.closed.lock().unwrap().as_slice(), &[stream]);
        pdfx_session_free(session);
    }
}

#[test]
fn test_bulk_read_seek_and_eof() {
    let host = Host::default();
    let session = new_session(&host);
    let data = sample(2500);
    let url = CString::new("https://example.test/bulk.pdf").unwrap();

    unsafe {
        let stream = pdfx_open_stream_from_url(session, url.as_ptr(), data.len(), 1024, 1);
        assert_eq!(pdfx_stream_seek(session, stream, -100, 2), 2400);

        let mut buf = vec![0u8; 200];
        assert_eq!(pdfx_stream_read(session, stream, buf.as_mut_ptr(), buf.len()), -2);
        assert_eq!(host.reads.lock().unwrap().as_slice(), &[(stream, 2)]);

        let tail = &data[2048..];
        assert_eq!(pdfx_on_data_fetched(session, stream, 2, tail.as_ptr(), tail.len()), 0);
        assert_eq!(pdfx_stream_read(session, stream, buf.as_mut_ptr(), buf.len()), 100);
        assert_eq!(&buf[..100], &data[2400..]);

        assert_eq!(pdfx_stream_read(session, stream, buf.as_mut_ptr(), buf.len()), 0);
        assert_eq!(pdfx_stream_read_byte(session, stream), -1);

        assert_eq!(pdfx_stream_seek(session, stream, 5, 9), -3);
        assert!(last_error().contains("whence"));

        pdfx_session_free(session);
    }
    assert_eq!(host.closed.lock().unwrap().len(), 1, "Freeing the session closes its streams");
}

#[test]
fn test_claimed_block_is_not_fetched_again() {
    let host = Host::default();
    let session = new_session(&host);
    let data = sample(3000);
    let url = CString::new("https://example.test/ahead.pdf").unwrap();

    unsafe {
        let stream = pdfx_open_stream_from_url(session, url.as_ptr(), data.len(), 1024, 1);

        // The host starts block 1 on its own before anything reads it.
        assert_eq!(pdfx_request_block(session, stream, 1), 1);
        assert_eq!(pdfx_request_block(session, stream, 1), 0);

        assert_eq!(pdfx_stream_seek(session, stream, 1500, 0), 1500);
        assert_eq!(pdfx_stream_read_byte(session, stream), -2);
        assert_eq!(
            pdfx_on_data_fetched(session, stream, 1, data[1024..2048].as_ptr(), 1024),
            0
        );
        assert_eq!(pdfx_stream_read_byte(session, stream), data[1500] as c_int);

        // A block the reader already asked for cannot be claimed.
        assert_eq!(pdfx_stream_seek(session, stream, 0, 0), 0);
        assert_eq!(pdfx_stream_read_byte(session, stream), -2);
        assert_eq!(pdfx_request_block(session, stream, 0), 0);

        assert_eq!(host.reads.lock().unwrap().as_slice(), &[(stream, 0)]);

        assert_eq!(pdfx_request_block(session, stream, 40), -3);
        assert!(last_error().contains("past the end"));
        assert_eq!(pdfx_request_block(session, 0, 0), -3);
        assert!(last_error().contains("unknown stream"));

        pdfx_session_free(session);
    }
}

#[test]
fn test_late_delivery_is_ignored() {
    let host = Host::default();
    let session = new_session(&host);
    let data = sample(2048);
    let url = CString::new("https://example.test/late.pdf").unwrap();

    unsafe {
        let a = pdfx_open_stream_from_url(session, url.as_ptr(), data.len(), 1024, 0);
        let b = pdfx_open_stream_from_url(session, url.as_ptr(), data.len(), 1024, 0);
        assert_eq!(pdfx_stream_read_byte(session, a), -2);
        assert_eq!(pdfx_stream_read_byte(session, b), -2);

        pdfx_drop_stream(session, a);
        assert_eq!(pdfx_on_data_fetched(session, a, 0, data.as_ptr(), 1024), 1);

        assert_eq!(pdfx_on_data_fetched(session, b, 0, data.as_ptr(), 1024), 0);
        assert_eq!(pdfx_stream_read_byte(session, b), data[0] as c_int);

        pdfx_session_free(session);
    }
}

#[test]
fn test_errors_are_reported() {
    let host = Host::default();
    let session = new_session(&host);
    let url = CString::new("https://example.test/bad.pdf").unwrap();

    unsafe {
        assert_eq!(pdfx_open_stream_from_url(session, url.as_ptr(), 4096, 1000, 1), 0);
        assert!(last_error().contains("power of two"));
        assert_eq!(pdfx_open_stream_from_url(session, ptr::null(), 4096, 1024, 1), 0);
        assert!(host.opened.lock().unwrap().is_empty());

        let stream = pdfx_open_stream_from_url(session, url.as_ptr(), 4096, 1024, 0);
        let data = sample(1024);
        assert_eq!(pdfx_on_data_fetched(session, stream, 0, data.as_ptr(), 100), -3);
        assert!(last_error().contains("expects 1024 bytes"));
        assert_eq!(pdfx_on_data_fetched(session, stream, 0, ptr::null(), 1024), -3);

        assert_eq!(pdfx_stream_read_byte(session, stream), -2);
        let reason = CString::new("HTTP 503").unwrap();
        assert_eq!(pdfx_on_fetch_failed(session, stream, 0, reason.as_ptr()), 0);
        assert_eq!(pdfx_stream_read_byte(session, stream), -3);
        assert!(last_error().contains("HTTP 503"));

        assert_eq!(pdfx_stream_read_byte(session, 0), -3);
        assert!(last_error().contains("unknown stream"));

        pdfx_clear_error();
        assert!(pdfx_last_error().is_null());
        pdfx_session_free(session);
    }
}
