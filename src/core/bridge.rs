//! Error bridge between shim results and the host.
//!
//! The host only understands two kinds of failure: "try later", which it
//! answers by waiting for a delivery and replaying the call, and a plain
//! error carrying a diagnostic message. Every fallible export funnels its
//! result through [`catch`].

use super::error::{ErrorKind, ShimError, ShimResult};
use thiserror::Error;

/// Message carried by the try-later failure.
pub const TRY_LATER_MESSAGE: &str = "operation in progress";

/// Status codes of the flat export surface.
pub const STATUS_OK: i32 = 0;
pub const STATUS_EOF: i32 = -1;
pub const STATUS_TRY_LATER: i32 = -2;
pub const STATUS_ERROR: i32 = -3;

/// Host-visible failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("operation in progress")]
    TryLater,
    #[error("{0}")]
    Error(String),
}

impl HostError {
    pub fn status(&self) -> i32 {
        match self {
            HostError::TryLater => STATUS_TRY_LATER,
            HostError::Error(_) => STATUS_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            HostError::TryLater => TRY_LATER_MESSAGE,
            HostError::Error(msg) => msg,
        }
    }
}

impl From<ShimError> for HostError {
    fn from(e: ShimError) -> Self {
        match e.kind() {
            ErrorKind::RetryLater => HostError::TryLater,
            _ => HostError::Error(e.to_string()),
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;

/// Converts a shim result into what the host sees.
pub fn catch<T>(result: ShimResult<T>) -> HostResult<T> {
    result.map_err(|e| {
        if e.is_try_later() {
            log::trace!("try later: {}", e);
        } else {
            log::debug!("error crossing bridge: {}", e);
        }
        HostError::from(e)
    })
}
