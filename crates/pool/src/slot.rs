use crate::errors::PoolError;
use std::cell::UnsafeCell;

/// SAFETY & ACCESS PROTOCOL:
///
/// A slot owns the bytes of one frame buffer. The bytes live outside the
/// pool mutex so that readers can look at them and the writer can fill them
/// without holding the lock across device I/O. Access is arbitrated by the
/// bookkeeping kept under the pool mutex instead:
///
/// Writer protocol:
/// 1. Under the lock, remove the slot from the ordering, only if its reader
///    count is 0
/// 2. Fill the bytes with the lock released
/// 3. Under the lock, insert the slot at the front of the ordering
///
/// Reader protocol:
/// 1. Under the lock, increment the reader count of a slot in the ordering
/// 2. Read the bytes with the lock released
/// 3. Under the lock, decrement the reader count
///
/// A slot that is out of the ordering cannot gain readers, and a slot with
/// readers cannot be removed, so shared and exclusive access never overlap.
/// The mutex unlock/lock pairs order the writer's byte writes before any
/// reader's byte reads.
pub(crate) struct Slot {
    data: UnsafeCell<Box<[u8]>>,
}

// SAFETY: see the access protocol above.
unsafe impl Sync for Slot {}

impl Slot {
    /// Allocate a zeroed buffer, reporting allocation failure instead of aborting.
    pub(crate) fn allocate(frame_size: usize) -> Result<Self, PoolError> {
        let mut data = Vec::new();
        data.try_reserve_exact(frame_size)
            .map_err(|source| PoolError::Allocation { frame_size, source })?;
        data.resize(frame_size, 0);
        Ok(Self {
            data: UnsafeCell::new(data.into_boxed_slice()),
        })
    }

    /// # Safety
    /// The caller must hold a reader count on this slot for the lifetime of
    /// the returned slice.
    pub(crate) unsafe fn bytes(&self) -> &[u8] {
        unsafe { &*self.data.get() }
    }

    /// # Safety
    /// The caller must hold the write claim on this slot for the lifetime of
    /// the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self) -> &mut [u8] {
        unsafe { &mut *self.data.get() }
    }
}
