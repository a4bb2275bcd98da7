use crate::errors::PoolError;
use crate::handle::{BorrowedFrame, WriteClaim};
use crate::slot::Slot;
use crate::timestamp::Timestamp;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed set of frame buffers kept in newest-first order.
///
/// Readers borrow the newest buffers without copying; the single writer
/// claims the oldest unreferenced buffer, fills it and publishes it back at
/// the front. Buffers are allocated once here and never resized.
pub struct FramePool {
    id: u64,
    frame_size: usize,
    slots: Box<[Slot]>,
    state: Mutex<PoolState>,
}

struct PoolState {
    /// Slot indices, newest first. Holds every slot except the one being
    /// written.
    order: VecDeque<usize>,
    timestamps: Box<[Timestamp]>,
    readers: Box<[u32]>,
}

/// Point-in-time view of one buffer, as listed by [`FramePool::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub index: usize,
    pub timestamp: Timestamp,
    pub readers: u32,
}

impl FramePool {
    /// Allocate `count` zeroed buffers of `frame_size` bytes each.
    ///
    /// All buffers start unreferenced and stamped [`Timestamp::MIN`].
    pub fn new(count: usize, frame_size: usize) -> Result<Arc<Self>, PoolError> {
        if count < 2 {
            return Err(PoolError::InvalidCapacity { count });
        }
        if frame_size == 0 {
            return Err(PoolError::EmptyFrame);
        }

        let slots = (0..count)
            .map(|_| Slot::allocate(frame_size))
            .collect::<Result<Vec<_>, _>>()?
            .into_boxed_slice();

        tracing::debug!(count, frame_size, "Allocated frame pool");

        Ok(Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            frame_size,
            slots,
            state: Mutex::new(PoolState {
                order: (0..count).collect(),
                timestamps: vec![Timestamp::MIN; count].into_boxed_slice(),
                readers: vec![0; count].into_boxed_slice(),
            }),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of buffers owned by the pool.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Size in bytes of every buffer.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Borrow up to `n` of the newest buffers, newest first.
    ///
    /// Never blocks on the writer. Each returned buffer has its reader count
    /// raised by one until it is released or dropped. The result reflects the
    /// ordering at the moment of the call; newer frames may be published
    /// right after it returns.
    pub fn borrow_newest(self: &Arc<Self>, n: usize) -> Vec<BorrowedFrame> {
        let mut state = self.lock();
        let PoolState {
            order,
            timestamps,
            readers,
        } = &mut *state;

        order
            .iter()
            .take(n)
            .map(|&index| {
                readers[index] += 1;
                BorrowedFrame::new(Arc::clone(self), index, timestamps[index])
            })
            .collect()
    }

    /// Return borrowed buffers to the pool.
    ///
    /// Every frame of this pool is released even if some frames belong to a
    /// different pool; those are released into their own pool when dropped
    /// and reported as [`PoolError::ForeignFrame`].
    pub fn release(
        &self,
        frames: impl IntoIterator<Item = BorrowedFrame>,
    ) -> Result<(), PoolError> {
        let mut foreign = Vec::new();
        let mut result = Ok(());

        {
            let mut state = self.lock();
            for mut frame in frames {
                if frame.pool_id() != self.id {
                    foreign.push(frame);
                    continue;
                }
                let released = Self::release_slot(&mut state, frame.index());
                frame.mark_released();
                if result.is_ok() {
                    result = released;
                }
            }
        }

        if !foreign.is_empty() {
            tracing::error!(count = foreign.len(), "Released frames from a foreign pool");
            drop(foreign);
            if result.is_ok() {
                result = Err(PoolError::ForeignFrame);
            }
        }

        result
    }

    /// Count buffers stamped strictly later than `timestamp`, scanning from
    /// the newest and stopping at the first one that is not newer.
    pub fn count_newer_than(&self, timestamp: Timestamp) -> usize {
        let state = self.lock();
        state
            .order
            .iter()
            .take_while(|&&index| state.timestamps[index] > timestamp)
            .count()
    }

    /// Take the oldest buffer for writing if no reader holds it.
    ///
    /// Returns `None` when the oldest buffer is still borrowed; the caller is
    /// expected to retry later. Only the capture writer calls this.
    pub fn claim_for_write(&self) -> Option<WriteClaim<'_>> {
        let mut state = self.lock();
        let &oldest = state.order.back()?;
        if state.readers[oldest] > 0 {
            return None;
        }
        state.order.pop_back();
        Some(WriteClaim::new(self, oldest))
    }

    /// Stamp a filled buffer and insert it as the newest.
    pub fn publish(&self, mut claim: WriteClaim<'_>, timestamp: Timestamp) {
        let index = claim.index();
        {
            let mut state = self.lock();
            if let Some(&newest) = state.order.front()
                && state.timestamps[newest] > timestamp
            {
                tracing::warn!(
                    newest = %state.timestamps[newest],
                    published = %timestamp,
                    "Published frame is older than the newest frame, clock went backwards"
                );
            }
            state.timestamps[index] = timestamp;
            state.order.push_front(index);
        }
        claim.mark_published();
    }

    /// Buffers in newest-first order with their timestamps and reader counts.
    ///
    /// A buffer currently claimed by the writer is not listed.
    pub fn snapshot(&self) -> Vec<SlotInfo> {
        let state = self.lock();
        state
            .order
            .iter()
            .map(|&index| SlotInfo {
                index,
                timestamp: state.timestamps[index],
                readers: state.readers[index],
            })
            .collect()
    }

    pub fn reader_count(&self, index: usize) -> Option<u32> {
        self.lock().readers.get(index).copied()
    }

    pub(crate) fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    pub(crate) fn release_index(&self, index: usize) -> Result<(), PoolError> {
        Self::release_slot(&mut self.lock(), index)
    }

    /// Put an abandoned claim back as the oldest buffer. Its bytes may be
    /// partially written, so it is stamped as never filled.
    pub(crate) fn abandon(&self, index: usize) {
        let mut state = self.lock();
        state.timestamps[index] = Timestamp::MIN;
        state.order.push_back(index);
    }

    fn release_slot(state: &mut PoolState, index: usize) -> Result<(), PoolError> {
        let readers = &mut state.readers[index];
        debug_assert!(*readers > 0, "reader count underflow on buffer {index}");
        if *readers == 0 {
            return Err(PoolError::ReaderCountUnderflow { index });
        }
        *readers -= 1;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // The state is plain counters and indices that are never left half
        // updated, so a panic elsewhere does not invalidate it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
