/// Retry macros for the try-later convention of progressive streams.
///
/// A read on a progressive stream fails with `TryLater` while the block it
/// needs is in flight. The caller is expected to let the host make progress
/// (pump the driver, wait for a delivery notification) and then replay the
/// identical call. These macros package that loop.

/// Replays an operation up to 64 times while it fails with `TryLater`.
///
/// `$wait` is evaluated before every replay; it may use `?`.
///
/// # Example
/// ```ignore
/// let header = retry_on_try_later!(driver.run_until_idle()?, stream.read_bytes(8))?;
/// ```
///
/// This will:
/// 1. Try `stream.read_bytes(8)`
/// 2. If it fails with `TryLater`, run `driver.run_until_idle()?` and retry
/// 3. Give up with a `Generic` error after 64 replays
/// 4. Return the result or propagate other errors unchanged
#[macro_export]
macro_rules! retry_on_try_later {
    ($wait:expr, $operation:expr) => {
        $crate::retry_on_try_later_with_limit!(64, $wait, $operation)
    };
}

/// Replays an operation with a custom retry limit.
///
/// # Example
/// ```ignore
/// retry_on_try_later_with_limit!(5, driver.pump()?, stream.read_byte())
/// ```
#[macro_export]
macro_rules! retry_on_try_later_with_limit {
    ($max_retries:expr, $wait:expr, $operation:expr) => {{
        let max_retries: usize = $max_retries;
        let mut retries = 0usize;

        loop {
            match $operation {
                Ok(result) => break Ok(result),
                Err(e) if e.is_try_later() => {
                    retries += 1;
                    if retries > max_retries {
                        break Err($crate::core::error::ShimError::Generic(format!(
                            "Exceeded maximum retries ({}) while waiting for data: {}",
                            max_retries, e
                        )));
                    }

                    // Let the host deliver before replaying
                    $wait;
                }
                Err(e) => break Err(e),
            }
        }
    }};
}
