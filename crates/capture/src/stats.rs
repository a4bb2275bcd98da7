use opentelemetry::{global, metrics::Counter};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared between the capture worker and the session owner.
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_captured: AtomicU64,
    claim_retries: AtomicU64,
    timeouts: AtomicU64,
}

impl CaptureStats {
    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    /// Claims refused because the oldest buffer was still borrowed.
    pub fn claim_retries(&self) -> u64 {
        self.claim_retries.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Returns the new total.
    pub(crate) fn record_frame(&self) -> u64 {
        self.frames_captured.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_claim_retry(&self) {
        self.claim_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }
}

/// OpenTelemetry counters mirroring [`CaptureStats`]. No-ops unless a meter
/// provider is installed.
pub(crate) struct LoopMetrics {
    pub frames: Counter<u64>,
    pub claim_retries: Counter<u64>,
    pub timeouts: Counter<u64>,
}

impl LoopMetrics {
    pub(crate) fn new() -> Self {
        let meter = global::meter("capture");

        Self {
            frames: meter
                .u64_counter("capture_frames_total")
                .with_description("Frames read from the device and published")
                .build(),
            claim_retries: meter
                .u64_counter("capture_claim_retries_total")
                .with_description("Write claims refused because readers held the oldest buffer")
                .build(),
            timeouts: meter
                .u64_counter("capture_timeouts_total")
                .with_description("Device readiness waits that timed out")
                .build(),
        }
    }
}
