use std::io;
use std::os::unix::io::RawFd;
use thiserror::Error;

use crate::looper::{TaskId, TimerId, WatchId};

/// Errors reported by a looper and its OS layer.
#[derive(Error, Debug)]
pub enum LooperError {
    #[error("poller I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timer {0:?} does not belong to this looper or was destroyed")]
    UnknownTimer(TimerId),

    #[error("fd watch {0:?} does not belong to this looper or was destroyed")]
    UnknownWatch(WatchId),

    #[error("task {0:?} does not belong to this looper or was destroyed")]
    UnknownTask(TaskId),

    #[error("fd {0} is already watched by this looper")]
    FdAlreadyWatched(RawFd),

    #[error("looper is already running on this thread")]
    AlreadyRunning,

    #[error("poller backend {0:?} is not available on this platform")]
    UnsupportedBackend(String),
}

impl LooperError {
    /// errno equivalent used by the C facade.
    pub fn errno(&self) -> i32 {
        match self {
            LooperError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            LooperError::UnknownTimer(_) | LooperError::UnknownWatch(_) | LooperError::UnknownTask(_) => {
                libc::EINVAL
            }
            LooperError::FdAlreadyWatched(_) => libc::EEXIST,
            LooperError::AlreadyRunning => libc::EBUSY,
            LooperError::UnsupportedBackend(_) => libc::ENOSYS,
        }
    }
}

pub type Result<T> = std::result::Result<T, LooperError>;
