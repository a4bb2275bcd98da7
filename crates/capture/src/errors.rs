use nix::errno::Errno;
use pool::PoolError;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by a [`crate::FrameSource`].
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{operation} failed: {errno}")]
    Sys {
        operation: &'static str,
        errno: Errno,
    },

    #[error("Device reported an error condition (revents {revents:#x})")]
    Hangup { revents: i16 },

    #[error("Device is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Clock {clock_id} is not available: {errno}")]
    ClockUnavailable { clock_id: i32, errno: Errno },

    #[error("Cannot identify '{path}': {source}")]
    DeviceNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("'{path}' is not a character device")]
    NotCharDevice { path: PathBuf },

    #[error("Cannot open '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("'{path}' is not a V4L2 device: {source}")]
    QueryCaps {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("'{path}' is not a video capture device")]
    NotCaptureDevice { path: PathBuf },

    #[error("'{path}' does not support read i/o")]
    NoReadIo { path: PathBuf },

    #[error("Buffer count must be greater than 1, got {0}")]
    InvalidBufferCount(usize),

    #[error("Format negotiation failed: {0}")]
    Negotiation(#[source] DeviceError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Device not readable within {0:?}")]
    ReadTimeout(Duration),

    #[error("Waiting for device failed: {0}")]
    Wait(#[source] DeviceError),

    #[error("Frame read failed: {0}")]
    Read(#[source] DeviceError),

    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Reading clock failed: {0}")]
    Clock(Errno),

    #[error("Device control request failed: {0}")]
    Control(#[source] io::Error),

    #[error("Closing device failed: {0}")]
    Close(#[source] DeviceError),

    #[error("Capture is already running")]
    AlreadyCapturing,

    #[error("Device is in use by the capture loop")]
    DeviceBusy,

    #[error("Device was lost by a failed capture worker")]
    DeviceLost,

    #[error("Session is finished")]
    Finished,

    #[error("Failed to spawn capture worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("Capture worker panicked")]
    WorkerPanicked,

    #[error("Period estimation collected {0} samples, need at least 2")]
    InsufficientSamples(usize),
}

impl CaptureError {
    /// Errors that may clear up on their own, e.g. a device that is still
    /// being enumerated after plug-in or is held by another process.
    pub fn is_transient(&self) -> bool {
        match self {
            CaptureError::DeviceNotFound { .. } | CaptureError::ReadTimeout(_) => true,
            CaptureError::Open { source, .. } => {
                source.raw_os_error() == Some(libc::EBUSY)
                    || source.raw_os_error() == Some(libc::EAGAIN)
            }
            _ => false,
        }
    }
}
