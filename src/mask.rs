//! Event interest/pending masks.
//!
//! Mirrors the shape of `mio::Interest`: a small closed set of event kinds
//! combined with bitwise-or, rather than pulling in a general bitflags
//! dependency for four values.

use std::ops::{BitOr, BitOrAssign};

/// A set of event kinds: `{READABLE, WRITABLE, ERROR, HANGUP}`.
///
/// `ERROR` and `HANGUP` are always implicitly part of any interest mask
/// (see [`EventMask::with_implicit`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u8);

const READABLE: u8 = 0b0001;
const WRITABLE: u8 = 0b0010;
const ERROR: u8 = 0b0100;
const HANGUP: u8 = 0b1000;

impl EventMask {
    /// No events.
    pub const EMPTY: EventMask = EventMask(0);
    /// The socket has data available to read.
    pub const READABLE: EventMask = EventMask(READABLE);
    /// The socket can accept a write without blocking.
    pub const WRITABLE: EventMask = EventMask(WRITABLE);
    /// The socket has an error pending.
    pub const ERROR: EventMask = EventMask(ERROR);
    /// The peer has closed its end, or the socket was shut down.
    pub const HANGUP: EventMask = EventMask(HANGUP);

    /// Returns this mask with `ERROR` and `HANGUP` forced on, as every
    /// interest mask in this engine implicitly watches both.
    pub fn with_implicit(self) -> EventMask {
        self | EventMask::ERROR | EventMask::HANGUP
    }

    /// True if `self` and `other` share at least one bit.
    pub fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Intersection of `self` and `other`.
    pub fn and(self, other: EventMask) -> EventMask {
        EventMask(self.0 & other.0)
    }

    /// True if no bits are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn to_bits(self) -> u8 {
        self.0
    }

    pub(crate) fn from_raw(bits: u8) -> Self {
        EventMask(bits)
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_bits_always_present() {
        let m = EventMask::READABLE.with_implicit();
        assert!(m.intersects(EventMask::READABLE));
        assert!(m.intersects(EventMask::ERROR));
        assert!(m.intersects(EventMask::HANGUP));
        assert!(!m.intersects(EventMask::WRITABLE));
    }

    #[test]
    fn empty_mask_has_no_bits() {
        assert!(EventMask::EMPTY.is_empty());
        assert!(!EventMask::READABLE.is_empty());
    }
}
