use crate::clock::SystemClock;
use crate::device::{FrameSource, Readiness};
use crate::errors::CaptureError;
use pool::Timestamp;
use std::time::Duration;

/// Delivered frame interval of a device, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodEstimate {
    pub mean: f64,
    /// Population standard deviation of the intervals
    pub std_dev: f64,
    /// Number of intervals measured
    pub samples: usize,
}

impl PeriodEstimate {
    pub fn frames_per_second(&self) -> f64 {
        if self.mean > 0.0 { 1.0 / self.mean } else { 0.0 }
    }
}

/// Reads frames into a scratch buffer until more than `duration` has
/// elapsed, stamping each read, and reports the interval statistics. At
/// least two frames are read whatever the duration, so a short or zero
/// duration still yields one interval.
pub(crate) fn estimate_period<D: FrameSource>(
    device: &mut D,
    clock: &SystemClock,
    frame_size: usize,
    duration: Duration,
    read_timeout: Duration,
) -> Result<PeriodEstimate, CaptureError> {
    let _span = common::span!("estimate_period");

    let mut scratch = vec![0u8; frame_size];
    let mut stamps = Vec::new();
    let start = clock.now()?;

    loop {
        match device
            .wait_readable(read_timeout)
            .map_err(CaptureError::Wait)?
        {
            Readiness::Ready => {}
            Readiness::Timeout => return Err(CaptureError::ReadTimeout(read_timeout)),
        }

        device
            .read_frame(&mut scratch)
            .map_err(CaptureError::Read)?;

        let now = clock.now()?;
        stamps.push(now);

        if stamps.len() >= 2 && now.saturating_duration_since(start) > duration {
            break;
        }
    }

    let estimate =
        interval_stats(&stamps).ok_or(CaptureError::InsufficientSamples(stamps.len()))?;
    tracing::info!(
        mean = estimate.mean,
        std_dev = estimate.std_dev,
        samples = estimate.samples,
        "Capture period estimated ({:.2} fps)",
        estimate.frames_per_second()
    );
    Ok(estimate)
}

/// Mean and population standard deviation of the gaps between consecutive
/// timestamps. Needs at least two timestamps.
pub fn interval_stats(stamps: &[Timestamp]) -> Option<PeriodEstimate> {
    if stamps.len() < 2 {
        return None;
    }

    let intervals: Vec<f64> = stamps
        .windows(2)
        .map(|pair| pair[1].saturating_duration_since(pair[0]).as_secs_f64())
        .collect();

    let n = intervals.len() as f64;
    let mean = intervals.iter().sum::<f64>() / n;
    let variance = intervals.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    Some(PeriodEstimate {
        mean,
        std_dev: variance.sqrt(),
        samples: intervals.len(),
    })
}
