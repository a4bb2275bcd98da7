//! Frame acquisition from a streaming video device into a fixed pool of
//! reusable buffers.
//!
//! A [`Session`] negotiates the device format, allocates the
//! [`pool::FramePool`] and runs a background capture loop that keeps
//! refilling the oldest unborrowed buffer. Consumers borrow the newest frames
//! without copying and release them when done.

pub mod clock;
pub mod config;
pub mod device;
pub mod errors;
pub mod estimator;
#[cfg(any(test, feature = "fake-device"))]
pub mod fake;
pub mod logging;
pub mod session;
pub mod stats;
mod worker;

pub use clock::{SystemClock, TimerInfo};
pub use config::{AppConfig, CaptureConfig};
pub use device::{FormatRequest, FrameSource, NegotiatedFormat, Readiness, V4l2Device};
pub use errors::{CaptureError, DeviceError};
pub use estimator::PeriodEstimate;
pub use pool::{BorrowedFrame, FramePool, Timestamp};
pub use session::{CaptureState, Session};
pub use stats::CaptureStats;
