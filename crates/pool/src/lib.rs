//! Fixed pool of frame buffers kept in capture order.
//!
//! One writer refills the oldest unreferenced buffer while any number of
//! readers borrow the newest ones without copying.

pub mod backoff;
pub mod errors;
pub mod handle;
pub mod pool;
mod slot;
pub mod timestamp;

pub use backoff::ClaimBackoff;
pub use errors::PoolError;
pub use handle::{BorrowedFrame, WriteClaim};
pub use pool::{FramePool, SlotInfo};
pub use timestamp::Timestamp;
