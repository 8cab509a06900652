use std::fmt;
use std::ops::{BitOr, BitOrAssign};

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

/// The readiness a [`Channel`](crate::Channel) asks the demultiplexer to
/// watch for.
///
/// Unlike a registration-time interest set this one may be empty: channels
/// toggle reading and writing on and off over their lifetime, and an empty
/// set means the channel is parked.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(READABLE);
    pub const WRITABLE: Interest = Interest(WRITABLE);

    pub const fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub const fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    /// The epoll event mask for this interest set. Readable covers urgent
    /// data as well. Level-triggered on purpose: the connection write path
    /// relies on being re-notified while the kernel send buffer has room.
    pub(crate) fn to_epoll(self) -> u32 {
        let mut kind = 0;
        if self.is_readable() {
            kind |= libc::EPOLLIN | libc::EPOLLPRI;
        }
        if self.is_writable() {
            kind |= libc::EPOLLOUT;
        }
        kind as u32
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.add(rhs)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        *self = self.add(rhs);
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut written = false;
        if self.is_readable() {
            f.write_str("READABLE")?;
            written = true;
        }
        if self.is_writable() {
            if written {
                f.write_str(" | ")?;
            }
            f.write_str("WRITABLE")?;
            written = true;
        }
        if !written {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// The readiness the demultiplexer reported for one channel on one poll
/// return.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness(u32);

impl Readiness {
    pub(crate) const NONE: Readiness = Readiness(0);

    pub(crate) fn from_epoll(events: u32) -> Readiness {
        Readiness(events)
    }

    fn contains(self, mask: libc::c_int) -> bool {
        self.0 as libc::c_int & mask != 0
    }

    /// Normal or urgent inbound data.
    pub fn is_readable(self) -> bool {
        self.contains(libc::EPOLLIN | libc::EPOLLPRI)
    }

    pub fn is_writable(self) -> bool {
        self.contains(libc::EPOLLOUT)
    }

    pub fn is_error(self) -> bool {
        self.contains(libc::EPOLLERR)
    }

    pub fn is_hangup(self) -> bool {
        self.contains(libc::EPOLLHUP)
    }

    /// `EPOLLIN` specifically; a hang-up that still has readable data must be
    /// drained before the close path runs.
    pub(crate) fn has_input(self) -> bool {
        self.contains(libc::EPOLLIN)
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (mask, name) in [
            (libc::EPOLLIN, "IN"),
            (libc::EPOLLPRI, "PRI"),
            (libc::EPOLLOUT, "OUT"),
            (libc::EPOLLERR, "ERR"),
            (libc::EPOLLHUP, "HUP"),
            (libc::EPOLLRDHUP, "RDHUP"),
        ] {
            if self.contains(mask) {
                list.entry(&name);
            }
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_set_operations() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable() && both.is_writable());
        assert_eq!(both.remove(Interest::WRITABLE), Interest::READABLE);
        assert!(Interest::NONE.is_empty());
        assert_eq!(Interest::NONE.to_epoll(), 0);
    }

    #[test]
    fn readiness_bits() {
        let r = Readiness::from_epoll((libc::EPOLLHUP | libc::EPOLLERR) as u32);
        assert!(r.is_hangup());
        assert!(r.is_error());
        assert!(!r.has_input());
        assert!(!r.is_readable());
    }
}
