//! Thin wrappers around the Linux primitives the runtime is built on:
//! `eventfd` for cross-thread wake-ups and `timerfd` for the timer queue.
//! Raw socket operations live in [`socket`].

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Helper macro to execute a system call that returns an `io::Result`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use syscall;

pub(crate) mod socket;

/// Wake-up descriptor backed by `eventfd`.
///
/// The eventfd object is a 64 bit counter. Writes must be 8 bytes and add to
/// the count; reads must be 8 bytes and reset the count to zero. One write
/// from any thread is enough to make the descriptor readable and pop the
/// owning loop out of `epoll_wait`.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` returned a valid, unowned file descriptor.
        Ok(Waker {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn wake(&self) {
        match self.write_one() {
            Ok(_) => {}
            // Writing only blocks if the counter would overflow; draining and
            // retrying once leaves the counter at one, which is all we need.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.drain();
                if let Err(err) = self.write_one() {
                    log::error!("failed to write to wake-up eventfd: {}", err);
                }
            }
            Err(err) => log::error!("failed to write to wake-up eventfd: {}", err),
        }
    }

    fn write_one(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        syscall!(write(
            self.fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
        ))
        .map(|_| ())
    }

    /// Reset the counter. Called by the owning loop when the descriptor
    /// becomes readable.
    pub(crate) fn drain(&self) {
        let mut buf: [u8; 8] = [0; 8];
        match syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )) {
            Ok(_) => {}
            // Not awoken since the last drain.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => log::error!("failed to read from wake-up eventfd: {}", err),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Monotonic one-shot timer descriptor backed by `timerfd`.
#[derive(Debug)]
pub(crate) struct TimerFd {
    fd: OwnedFd,
}

/// Alarms closer than this are rounded up so `timerfd_settime` never receives
/// a zero (= disarm) value.
const MIN_ALARM: Duration = Duration::from_micros(100);

impl TimerFd {
    pub(crate) fn new() -> io::Result<TimerFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        ))?;
        // SAFETY: `timerfd_create(2)` returned a valid, unowned file descriptor.
        Ok(TimerFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Arm the descriptor to fire once after `delay`.
    pub(crate) fn set_alarm(&self, delay: Duration) {
        let delay = delay.max(MIN_ALARM);
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as libc::c_long,
            },
        };
        if let Err(err) = syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            0,
            &new_value,
            std::ptr::null_mut(),
        )) {
            log::error!("timerfd_settime failed: {}", err);
        }
    }

    /// Consume the expiration count after the descriptor became readable.
    pub(crate) fn read_expirations(&self) -> u64 {
        let mut buf: [u8; 8] = [0; 8];
        match syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )) {
            Ok(_) => u64::from_ne_bytes(buf),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => 0,
            Err(err) => {
                log::error!("failed to read from timerfd: {}", err);
                0
            }
        }
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
