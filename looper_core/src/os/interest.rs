//! Shared types for the OS polling layer.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Identifier attached to a registered fd and echoed back by `Poller::wait`.
pub type Token = usize;

/// Set of readiness conditions a watch cares about.
///
/// The bit values match the C constants `LOOP_IO_READ` (1) and
/// `LOOP_IO_WRITE` (2).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u32);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(1);
    pub const WRITE: Interest = Interest(2);
    pub const READ_WRITE: Interest = Interest(3);

    /// Builds an interest from raw C bits, dropping unknown bits.
    pub const fn from_bits(bits: u32) -> Interest {
        Interest(bits & Self::READ_WRITE.0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn from_flags(readable: bool, writable: bool) -> Interest {
        let mut out = Interest::NONE;
        if readable {
            out |= Interest::READ;
        }
        if writable {
            out |= Interest::WRITE;
        }
        out
    }
}

impl BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Interest {
    type Output = Interest;
    fn bitand(self, rhs: Interest) -> Interest {
        Interest(self.0 & rhs.0)
    }
}

impl Not for Interest {
    type Output = Interest;
    fn not(self) -> Interest {
        Interest(!self.0 & Self::READ_WRITE.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (false, false) => f.write_str("NONE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (true, true) => f.write_str("READ | WRITE"),
        }
    }
}

/// One readiness report produced by a poller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

impl Event {
    pub fn interest(&self) -> Interest {
        Interest::from_flags(self.readable, self.writable)
    }
}
