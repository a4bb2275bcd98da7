use nix::sys::time::TimeSpec;
use std::fmt;
use std::time::Duration;

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Capture time of a frame, as read from the session clock.
///
/// Ordering is lexicographic on (seconds, nanoseconds), which is the
/// ordering of the clock the value was read from. Values from different
/// clocks are not comparable in any meaningful way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    sec: i64,
    nsec: u32,
}

impl Timestamp {
    /// Sorts before anything a clock can produce. Buffers that were never
    /// filled carry this value so they are always the oldest.
    pub const MIN: Self = Self {
        sec: i64::MIN,
        nsec: 0,
    };

    /// Nanoseconds past `NANOS_PER_SEC` carry into the seconds field.
    pub const fn new(sec: i64, nsec: u32) -> Self {
        Self {
            sec: sec + (nsec / NANOS_PER_SEC) as i64,
            nsec: nsec % NANOS_PER_SEC,
        }
    }

    pub fn sec(&self) -> i64 {
        self.sec
    }

    pub fn nsec(&self) -> u32 {
        self.nsec
    }

    /// True for the sentinel carried by buffers that were never filled.
    pub fn is_min(&self) -> bool {
        *self == Self::MIN
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(&self, earlier: Timestamp) -> Duration {
        let delta = self.total_nanos() - earlier.total_nanos();
        if delta <= 0 {
            return Duration::ZERO;
        }
        let secs = (delta / NANOS_PER_SEC as i128) as u64;
        let nanos = (delta % NANOS_PER_SEC as i128) as u32;
        Duration::new(secs, nanos)
    }

    fn total_nanos(&self) -> i128 {
        self.sec as i128 * NANOS_PER_SEC as i128 + self.nsec as i128
    }
}

impl From<TimeSpec> for Timestamp {
    fn from(ts: TimeSpec) -> Self {
        Self::new(ts.tv_sec() as i64, ts.tv_nsec() as u32)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_min() {
            return f.write_str("never");
        }
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}
