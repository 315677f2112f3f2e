//! Readiness interest and received-event sets.

use std::fmt;
use std::ops;

/// The readiness a channel asks the selector to watch for.
///
/// Unlike received readiness, interest only spans reading and writing;
/// errors and hang-ups are always reported. A channel is first added to
/// a selector with [`Interest::NONE`] and widens its interest once its
/// owner is ready to handle events.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Interest(u8);

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

impl Interest {
    /// Interest in no events; the channel stays registered but silent.
    pub const NONE: Interest = Interest(0);

    /// Interest in read readiness.
    pub const READABLE: Interest = Interest(READABLE);

    /// Interest in write readiness.
    pub const WRITABLE: Interest = Interest(WRITABLE);

    pub const fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Returns the interest with `other` added.
    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// Returns the interest with `other` removed.
    pub const fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    pub(crate) const fn bits(self) -> u8 {
        self.0
    }

    pub(crate) const fn from_bits(bits: u8) -> Interest {
        Interest(bits)
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.add(rhs)
    }
}

impl ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        *self = self.add(rhs);
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        for (flag, name) in [(READABLE, "READABLE"), (WRITABLE, "WRITABLE")] {
            if self.0 & flag != 0 {
                if one {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                one = true;
            }
        }
        if !one {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

/// The readiness a selector received for a channel.
///
/// Read and write readiness mirror the requested interest. The
/// remaining indicators are delivered whether asked for or not: `ERROR`
/// and `HUP` map the kernel's error and hang-up flags, and
/// `READ_CLOSED` reports that the peer shut down its write half. They
/// are hints; the definitive answer always comes from the actual read
/// or write on the descriptor.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Ready(u8);

const ERROR: u8 = 0b0100;
const HUP: u8 = 0b1000;
const READ_CLOSED: u8 = 0b1_0000;

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(READABLE);
    pub const WRITABLE: Ready = Ready(WRITABLE);
    pub const ERROR: Ready = Ready(ERROR);
    pub const HUP: Ready = Ready(HUP);
    pub const READ_CLOSED: Ready = Ready(READ_CLOSED);

    pub const fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub const fn is_error(self) -> bool {
        self.0 & ERROR != 0
    }

    pub const fn is_hup(self) -> bool {
        self.0 & HUP != 0
    }

    pub const fn is_read_closed(self) -> bool {
        self.0 & READ_CLOSED != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        for (flag, name) in [
            (READABLE, "READABLE"),
            (WRITABLE, "WRITABLE"),
            (ERROR, "ERROR"),
            (HUP, "HUP"),
            (READ_CLOSED, "READ_CLOSED"),
        ] {
            if self.0 & flag != 0 {
                if one {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                one = true;
            }
        }
        if !one {
            write!(f, "EMPTY")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_ops() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(both.remove(Interest::WRITABLE) == Interest::READABLE);
        assert!(Interest::NONE.is_none());
    }

    #[test]
    fn ready_contains() {
        let ready = Ready::READABLE | Ready::READ_CLOSED;
        assert!(ready.contains(Ready::READABLE));
        assert!(!ready.contains(Ready::WRITABLE));
        assert!(ready.is_read_closed());
    }

    #[test]
    fn debug_formatting() {
        assert_eq!(format!("{:?}", Interest::NONE), "NONE");
        assert_eq!(
            format!("{:?}", Ready::READABLE | Ready::HUP),
            "READABLE | HUP"
        );
    }
}
