//! Deterministic in-memory [`FrameSource`] for exercising sessions without
//! video hardware.
//!
//! Frames become readable at a fixed period. Each frame starts with its
//! 1-based sequence number (little-endian `u64`) and the rest of the buffer
//! is filled with the low byte of that number. Failures can be injected at
//! any time through the shared [`FakeControl`].

use crate::device::{FormatRequest, FrameSource, NegotiatedFormat, Readiness};
use crate::errors::DeviceError;
use nix::errno::Errno;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use v4l::FourCC;
use v4l::format::FieldOrder;

/// Switches and counters shared between a [`FakeDevice`] and the test.
#[derive(Debug, Default)]
pub struct FakeControl {
    stalled: AtomicBool,
    fail_reads: AtomicBool,
    short_reads: AtomicBool,
    closed: AtomicBool,
    reads: AtomicU64,
}

impl FakeControl {
    /// While stalled, every readiness wait runs into its timeout.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Release);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }

    /// Reads deliver half a frame.
    pub fn set_short_reads(&self, short: bool) {
        self.short_reads.store(short, Ordering::Release);
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Format forced by the device regardless of the request, with the stride
/// and size it reports (which may be bogus).
#[derive(Debug, Clone, Copy)]
struct NativeFormat {
    fourcc: FourCC,
    width: u32,
    height: u32,
    stride: u32,
    image_size: u32,
}

#[derive(Debug)]
pub struct FakeDevice {
    period: Duration,
    native: Option<NativeFormat>,
    next_frame: Option<Instant>,
    control: Arc<FakeControl>,
}

impl FakeDevice {
    /// A device accepting any requested format, delivering a frame every
    /// `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            native: None,
            next_frame: None,
            control: Arc::new(FakeControl::default()),
        }
    }

    /// Forces the negotiated format to `width`x`height` in `fourcc`, reporting
    /// `stride` and `image_size` as given.
    pub fn with_native_format(
        mut self,
        fourcc: FourCC,
        width: u32,
        height: u32,
        stride: u32,
        image_size: u32,
    ) -> Self {
        self.native = Some(NativeFormat {
            fourcc,
            width,
            height,
            stride,
            image_size,
        });
        self
    }

    pub fn control(&self) -> Arc<FakeControl> {
        Arc::clone(&self.control)
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.control.is_closed() {
            return Err(DeviceError::Closed);
        }
        Ok(())
    }
}

/// Sequence number written at the start of a frame by [`FakeDevice`].
pub fn frame_sequence(data: &[u8]) -> Option<u64> {
    let head: [u8; 8] = data.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(head))
}

impl FrameSource for FakeDevice {
    fn negotiate(&mut self, request: &FormatRequest) -> Result<NegotiatedFormat, DeviceError> {
        self.ensure_open()?;

        let format = match self.native {
            Some(native) => NegotiatedFormat {
                fourcc: native.fourcc,
                width: native.width,
                height: native.height,
                field_order: FieldOrder::Progressive,
                stride: native.stride,
                image_size: native.image_size,
            },
            None => NegotiatedFormat {
                fourcc: request.fourcc,
                width: request.width,
                height: request.height,
                field_order: FieldOrder::Progressive,
                stride: request.width * 2,
                image_size: request.width * 2 * request.height,
            },
        };
        Ok(format)
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<Readiness, DeviceError> {
        self.ensure_open()?;

        if self.control.stalled.load(Ordering::Acquire) {
            thread::sleep(timeout);
            return Ok(Readiness::Timeout);
        }

        let now = Instant::now();
        let due = *self.next_frame.get_or_insert(now);
        let wait = due.saturating_duration_since(now);
        if wait > timeout {
            thread::sleep(timeout);
            return Ok(Readiness::Timeout);
        }
        thread::sleep(wait);
        Ok(Readiness::Ready)
    }

    fn read_frame(&mut self, buffer: &mut [u8]) -> Result<usize, DeviceError> {
        self.ensure_open()?;

        if self.control.fail_reads.load(Ordering::Acquire) {
            return Err(DeviceError::Sys {
                operation: "read",
                errno: Errno::EIO,
            });
        }

        let sequence = self.control.reads.fetch_add(1, Ordering::AcqRel) + 1;
        buffer.fill(sequence as u8);
        if let Some(head) = buffer.get_mut(..8) {
            head.copy_from_slice(&sequence.to_le_bytes());
        }

        // Keep a steady cadence; after falling behind, restart from now.
        let now = Instant::now();
        let next = self.next_frame.unwrap_or(now) + self.period;
        self.next_frame = Some(next.max(now));

        if self.control.short_reads.load(Ordering::Acquire) {
            return Ok(buffer.len() / 2);
        }
        Ok(buffer.len())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.control.closed.store(true, Ordering::Release);
        Ok(())
    }
}
