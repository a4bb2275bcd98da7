use crate::pool::FramePool;
use crate::timestamp::Timestamp;
use std::fmt;
use std::sync::Arc;

/// A reader's claim on one buffer of a [`FramePool`].
///
/// The buffer cannot be overwritten while the handle exists. Hand it back
/// with [`FramePool::release`]; a handle that is simply dropped releases
/// itself.
pub struct BorrowedFrame {
    pool: Arc<FramePool>,
    index: usize,
    timestamp: Timestamp,
    released: bool,
}

impl BorrowedFrame {
    pub(crate) fn new(pool: Arc<FramePool>, index: usize, timestamp: Timestamp) -> Self {
        Self {
            pool,
            index,
            timestamp,
            released: false,
        }
    }

    /// Frame bytes, exactly [`FramePool::frame_size`] long.
    pub fn data(&self) -> &[u8] {
        // SAFETY: this handle holds a reader count on the slot until it is
        // released, which can only happen after `self` is gone.
        unsafe { self.pool.slot(self.index).bytes() }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Position of the buffer inside its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool.id()
    }

    pub(crate) fn mark_released(&mut self) {
        self.released = true;
    }
}

impl AsRef<[u8]> for BorrowedFrame {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl fmt::Debug for BorrowedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BorrowedFrame")
            .field("pool", &self.pool.id())
            .field("index", &self.index)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

impl Drop for BorrowedFrame {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.pool.release_index(self.index) {
            tracing::error!(index = self.index, error = %e, "Failed to release dropped frame");
        }
    }
}

/// The writer's exclusive claim on the oldest buffer of a [`FramePool`].
///
/// Publish it with [`FramePool::publish`]. A claim dropped without being
/// published goes back to the pool as the oldest, never-filled buffer.
pub struct WriteClaim<'a> {
    pool: &'a FramePool,
    index: usize,
    published: bool,
}

impl<'a> WriteClaim<'a> {
    pub(crate) fn new(pool: &'a FramePool, index: usize) -> Self {
        Self {
            pool,
            index,
            published: false,
        }
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        // SAFETY: the slot was taken out of the ordering with no readers, so
        // nobody else can reach it until it is published or abandoned.
        unsafe { self.pool.slot(self.index).bytes_mut() }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.pool.frame_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn mark_published(&mut self) {
        self.published = true;
    }
}

impl fmt::Debug for WriteClaim<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteClaim")
            .field("pool", &self.pool.id())
            .field("index", &self.index)
            .finish()
    }
}

impl Drop for WriteClaim<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.pool.abandon(self.index);
        }
    }
}
