//! Clock sources used by loopers.
//!
//! * `Host`     → `CLOCK_MONOTONIC`
//! * `Realtime` → `CLOCK_REALTIME`
//! * `Virtual`  → no guest is attached to a generic looper, so it reads the
//!   host clock.
//!
//! Timestamps are plain `u64` milliseconds / nanoseconds since the clock's
//! own epoch, which is also what the C facade exposes.

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ClockType {
    Realtime,
    Virtual,
    #[default]
    Host,
}

impl ClockType {
    /// Maps the C `LooperClockType` value. Unknown values read the host clock.
    pub fn from_raw(raw: i32) -> ClockType {
        match raw {
            0 => ClockType::Realtime,
            1 => ClockType::Virtual,
            _ => ClockType::Host,
        }
    }

    fn clock_id(self) -> libc::clockid_t {
        match self {
            ClockType::Realtime => libc::CLOCK_REALTIME,
            ClockType::Virtual | ClockType::Host => libc::CLOCK_MONOTONIC,
        }
    }
}

/// Current time of `clock` in nanoseconds.
pub fn now_ns(clock: ClockType) -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: valid clock id and a valid out pointer; clock_gettime cannot
    // fail for CLOCK_REALTIME / CLOCK_MONOTONIC.
    unsafe { libc::clock_gettime(clock.clock_id(), &mut ts) };
    (ts.tv_sec as u64).saturating_mul(1_000_000_000).saturating_add(ts.tv_nsec as u64)
}

/// Current time of `clock` in milliseconds.
pub fn now_ms(clock: ClockType) -> u64 {
    now_ns(clock) / 1_000_000
}

/// Converts a relative timeout into an absolute deadline on `now_ms`.
/// `None` is the infinite timeout.
pub fn deadline_after(now_ms: u64, timeout: Option<Duration>) -> Option<u64> {
    timeout.map(|t| now_ms.saturating_add(t.as_millis().min(u64::MAX as u128) as u64))
}
