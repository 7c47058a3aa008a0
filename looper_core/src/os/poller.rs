//! Common trait implemented by every OS multiplexing backend.

use super::interest::{Event, Interest, Token};
use std::io::Result;
use std::os::unix::io::RawFd;

/// Readiness multiplexer used by `GenericLooper`.
///
/// Registrations are keyed by fd; each fd carries one `Token` which is
/// reported back in `Event::token`. Hang-up and error conditions are
/// reported as readable (and errors also as writable) so that a reader
/// observes EOF through its normal read path.
pub trait Poller {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> Result<()>;
    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> Result<()>;
    fn delete(&mut self, fd: RawFd) -> Result<()>;

    /// Waits for readiness. `timeout_ms < 0` blocks indefinitely. Fills at
    /// most `events.len()` entries and returns how many were filled; an
    /// interrupted wait returns 0.
    fn wait(&mut self, events: &mut [Event], timeout_ms: isize) -> Result<usize>;
}

/// Clamps a millisecond timeout to what the C `int` based APIs accept.
pub(crate) fn clamp_timeout(timeout_ms: isize) -> libc::c_int {
    if timeout_ms < 0 {
        -1
    } else {
        timeout_ms.min(libc::c_int::MAX as isize) as libc::c_int
    }
}
