use crate::clock::SystemClock;
use crate::device::{FrameSource, Readiness};
use crate::errors::CaptureError;
use crate::stats::{CaptureStats, LoopMetrics};
use pool::{ClaimBackoff, FramePool};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Sleep slice while paused; bounds how long cancellation can go unnoticed.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Emit a debug status line every this many frames.
const STATUS_EVERY: u64 = 300;

/// Everything the capture loop needs besides the device.
pub(crate) struct LoopContext {
    pub pool: Arc<FramePool>,
    pub clock: SystemClock,
    pub read_timeout: Duration,
    pub max_consecutive_timeouts: u32,
    pub backoff: ClaimBackoff,
    pub paused: Arc<AtomicBool>,
    pub stats: Arc<CaptureStats>,
}

/// A running capture thread. Joining hands the device back.
pub(crate) struct CaptureWorker<D> {
    handle: JoinHandle<(D, Result<(), CaptureError>)>,
    cancel: Arc<AtomicBool>,
}

impl<D: FrameSource> CaptureWorker<D> {
    /// Moves `device` onto a new thread running the capture loop. If the
    /// thread cannot be spawned the device is dropped.
    pub(crate) fn spawn(device: D, ctx: LoopContext) -> Result<Self, CaptureError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = Arc::clone(&cancel);

        let handle = thread::Builder::new()
            .name("capture".into())
            .spawn(move || run(device, &ctx, &cancel_flag))
            .map_err(CaptureError::Spawn)?;

        Ok(Self { handle, cancel })
    }

    /// True once the loop has exited on its own.
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals cancellation and waits for the loop. Returns the device and
    /// the loop's outcome, or `None` if the thread panicked.
    pub(crate) fn stop(self) -> Option<(D, Result<(), CaptureError>)> {
        self.cancel.store(true, Ordering::Release);
        self.handle.join().ok()
    }
}

fn run<D: FrameSource>(
    mut device: D,
    ctx: &LoopContext,
    cancel: &AtomicBool,
) -> (D, Result<(), CaptureError>) {
    tracing::info!(
        buffers = ctx.pool.capacity(),
        frame_size = ctx.pool.frame_size(),
        "Capture loop started"
    );

    let result = capture_frames(&mut device, ctx, cancel);

    match &result {
        Ok(()) => tracing::info!(
            frames = ctx.stats.frames_captured(),
            claim_retries = ctx.stats.claim_retries(),
            "Capture loop stopped"
        ),
        Err(e) => tracing::error!(
            frames = ctx.stats.frames_captured(),
            "Capture loop failed: {}",
            e
        ),
    }

    (device, result)
}

fn capture_frames<D: FrameSource>(
    device: &mut D,
    ctx: &LoopContext,
    cancel: &AtomicBool,
) -> Result<(), CaptureError> {
    let metrics = LoopMetrics::new();
    let mut timeouts_in_row = 0u32;
    let mut failed_claims = 0u32;

    while !cancel.load(Ordering::Acquire) {
        if ctx.paused.load(Ordering::Acquire) {
            thread::sleep(PAUSE_POLL_INTERVAL);
            continue;
        }

        match device
            .wait_readable(ctx.read_timeout)
            .map_err(CaptureError::Wait)?
        {
            Readiness::Ready => timeouts_in_row = 0,
            Readiness::Timeout => {
                timeouts_in_row += 1;
                ctx.stats.record_timeout();
                metrics.timeouts.add(1, &[]);

                if timeouts_in_row >= ctx.max_consecutive_timeouts {
                    return Err(CaptureError::ReadTimeout(ctx.read_timeout));
                }
                tracing::warn!(
                    timeouts_in_row,
                    limit = ctx.max_consecutive_timeouts,
                    "Device not readable within {:?}",
                    ctx.read_timeout
                );
                continue;
            }
        }

        let Some(mut claim) = ctx.pool.claim_for_write() else {
            let delay = ctx.backoff.delay_for_attempt(failed_claims);
            failed_claims = failed_claims.saturating_add(1);
            ctx.stats.record_claim_retry();
            metrics.claim_retries.add(1, &[]);

            if ctx.backoff.starvation_reached(failed_claims) {
                tracing::error!(
                    failed_claims,
                    "Readers are starving the capture loop: oldest buffer still borrowed"
                );
            } else if failed_claims == 1 {
                tracing::warn!("No writable buffer, oldest frame is still borrowed. Retrying");
            } else {
                tracing::trace!(failed_claims, ?delay, "Claim retry");
            }

            thread::sleep(delay);
            continue;
        };

        if failed_claims >= ctx.backoff.starvation_threshold {
            tracing::info!(failed_claims, "Capture loop recovered a writable buffer");
        }
        failed_claims = 0;

        // An early return drops the claim, which hands the buffer back as
        // the oldest entry.
        let timestamp = ctx.clock.now()?;
        let expected = claim.len();
        let read = {
            let _span = common::span_debug!("read_frame");
            device
                .read_frame(claim.buffer_mut())
                .map_err(CaptureError::Read)?
        };
        if read != expected {
            return Err(CaptureError::ShortRead {
                expected,
                actual: read,
            });
        }

        ctx.pool.publish(claim, timestamp);

        let frames = ctx.stats.record_frame();
        metrics.frames.add(1, &[]);
        if frames.is_multiple_of(STATUS_EVERY) {
            tracing::debug!(
                frames,
                claim_retries = ctx.stats.claim_retries(),
                timeouts = ctx.stats.timeouts(),
                "Capture status"
            );
        }
    }

    Ok(())
}
