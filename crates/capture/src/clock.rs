use crate::errors::CaptureError;
use nix::sys::time::TimeSpec;
use nix::time::{ClockId, clock_getres, clock_gettime};
use pool::Timestamp;
use std::time::{Duration, SystemTime};

/// Source of capture timestamps for a session.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    id: ClockId,
    resolution: Duration,
}

impl SystemClock {
    /// Probes `id` once; clocks the kernel does not provide are rejected.
    pub fn new(id: ClockId) -> Result<Self, CaptureError> {
        let unavailable = |errno| CaptureError::ClockUnavailable {
            clock_id: id.as_raw(),
            errno,
        };

        clock_gettime(id).map_err(unavailable)?;
        let resolution = clock_getres(id).map(to_duration).map_err(unavailable)?;

        Ok(Self { id, resolution })
    }

    pub fn id(&self) -> ClockId {
        self.id
    }

    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    pub fn now(&self) -> Result<Timestamp, CaptureError> {
        clock_gettime(self.id)
            .map(Timestamp::from)
            .map_err(CaptureError::Clock)
    }
}

fn to_duration(ts: TimeSpec) -> Duration {
    Duration::new(ts.tv_sec().max(0) as u64, ts.tv_nsec().max(0) as u32)
}

/// When and how precisely a session's clock started.
#[derive(Debug, Clone, Copy)]
pub struct TimerInfo {
    pub wall_start: SystemTime,
    pub clock_start: Timestamp,
    pub resolution: Duration,
}

impl TimerInfo {
    pub fn capture(clock: &SystemClock) -> Result<Self, CaptureError> {
        Ok(Self {
            wall_start: SystemTime::now(),
            clock_start: clock.now()?,
            resolution: clock.resolution(),
        })
    }
}

/// Parses the clock names accepted in configuration.
pub fn parse_clock(name: &str) -> Option<ClockId> {
    match name.trim().to_lowercase().as_str() {
        "monotonic" => Some(ClockId::CLOCK_MONOTONIC),
        "realtime" => Some(ClockId::CLOCK_REALTIME),
        "monotonic_raw" => Some(ClockId::CLOCK_MONOTONIC_RAW),
        "boottime" => Some(ClockId::CLOCK_BOOTTIME),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = SystemClock::new(ClockId::CLOCK_MONOTONIC).unwrap();
        let first = clock.now().unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let second = clock.now().unwrap();

        assert!(second > first);
        assert!(second.saturating_duration_since(first) >= Duration::from_millis(2));
    }

    #[test]
    fn test_resolution_is_sub_millisecond() {
        let clock = SystemClock::new(ClockId::CLOCK_MONOTONIC).unwrap();
        assert!(clock.resolution() > Duration::ZERO);
        assert!(clock.resolution() < Duration::from_millis(1));
    }

    #[test]
    fn test_unknown_clock_is_reported() {
        let err = SystemClock::new(ClockId::from_raw(4242)).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::ClockUnavailable { clock_id: 4242, .. }
        ));
    }

    #[test]
    fn test_parse_clock_names() {
        assert_eq!(parse_clock("monotonic"), Some(ClockId::CLOCK_MONOTONIC));
        assert_eq!(parse_clock(" RealTime "), Some(ClockId::CLOCK_REALTIME));
        assert_eq!(parse_clock("boottime"), Some(ClockId::CLOCK_BOOTTIME));
        assert_eq!(parse_clock("tai"), None);
    }

    #[test]
    fn test_timer_info_starts_near_now() {
        let clock = SystemClock::new(ClockId::CLOCK_MONOTONIC).unwrap();
        let info = TimerInfo::capture(&clock).unwrap();
        let later = clock.now().unwrap();

        assert!(later >= info.clock_start);
        assert_eq!(info.resolution, clock.resolution());
    }
}
