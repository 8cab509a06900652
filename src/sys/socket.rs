//! Owned TCP socket descriptors and the raw operations the runtime needs.

use std::io;
use std::mem;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use crate::addr::InetAddr;

/// Backlog passed to `listen(2)`.
const BACKLOG: libc::c_int = 1024;

/// A TCP socket that owns its file descriptor and closes it on drop.
///
/// Every socket created or accepted through this type is non-blocking and
/// close-on-exec.
#[derive(Debug)]
pub(crate) struct TcpSock {
    fd: OwnedFd,
}

impl TcpSock {
    /// Create a new non-blocking IPv4 stream socket.
    pub(crate) fn new() -> io::Result<TcpSock> {
        let fd = syscall!(socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        ))?;
        // SAFETY: `socket(2)` returned a valid, unowned file descriptor.
        Ok(TcpSock {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Wrap an accepted or connected descriptor.
    pub(crate) fn from_fd(fd: OwnedFd) -> TcpSock {
        TcpSock { fd }
    }

    pub(crate) fn into_fd(self) -> OwnedFd {
        self.fd
    }

    pub(crate) fn bind(&self, addr: &InetAddr) -> io::Result<()> {
        let raw = addr.to_raw();
        syscall!(bind(
            self.fd.as_raw_fd(),
            &raw as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ))
        .map(|_| ())
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.fd.as_raw_fd(), BACKLOG)).map(|_| ())
    }

    /// Accept one pending connection, returning the new non-blocking
    /// close-on-exec descriptor and the peer address.
    pub(crate) fn accept(&self) -> io::Result<(OwnedFd, InetAddr)> {
        let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.fd.as_raw_fd(),
            &mut storage as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        // SAFETY: `accept4(2)` returned a valid, unowned file descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok((fd, InetAddr::from_raw(&storage)))
    }

    /// Start a non-blocking connect. `Ok(())` covers an instantly completed
    /// connect; everything else, `EINPROGRESS` included, is reported through
    /// the error so the caller can partition on the raw os error.
    pub(crate) fn connect(&self, addr: &InetAddr) -> io::Result<()> {
        let raw = addr.to_raw();
        syscall!(connect(
            self.fd.as_raw_fd(),
            &raw as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ))
        .map(|_| ())
    }

    pub(crate) fn write(&self, buf: &[u8]) -> io::Result<usize> {
        syscall!(write(
            self.fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
        ))
        .map(|n| n as usize)
    }

    /// Shut down one or both halves; write-half shutdown is the one the
    /// connection teardown path uses.
    pub(crate) fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        syscall!(shutdown(self.fd.as_raw_fd(), how)).map(|_| ())
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        set_opt(self.fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub(crate) fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        set_opt(self.fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub(crate) fn set_nodelay(&self, on: bool) -> io::Result<()> {
        set_opt(
            self.fd.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            on,
        )
    }

    pub(crate) fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        set_opt(
            self.fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            on,
        )
    }

    /// Fetch and clear the pending socket error (`SO_ERROR`).
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        ))?;
        if err == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(err)))
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<InetAddr> {
        local_addr_of(self.fd.as_raw_fd())
    }

    pub(crate) fn peer_addr(&self) -> io::Result<InetAddr> {
        peer_addr_of(self.fd.as_raw_fd())
    }

    /// A simultaneous connect between the same address/port pair yields a
    /// socket connected to itself.
    pub(crate) fn is_self_connect(&self) -> bool {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => local == peer,
            _ => false,
        }
    }
}

impl AsRawFd for TcpSock {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for TcpSock {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

fn set_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
    let val: libc::c_int = libc::c_int::from(on);
    syscall!(setsockopt(
        fd,
        level,
        name,
        &val as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

pub(crate) fn local_addr_of(fd: RawFd) -> io::Result<InetAddr> {
    let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        &mut storage as *mut libc::sockaddr_in as *mut libc::sockaddr,
        &mut len,
    ))?;
    Ok(InetAddr::from_raw(&storage))
}

pub(crate) fn peer_addr_of(fd: RawFd) -> io::Result<InetAddr> {
    let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    syscall!(getpeername(
        fd,
        &mut storage as *mut libc::sockaddr_in as *mut libc::sockaddr,
        &mut len,
    ))?;
    Ok(InetAddr::from_raw(&storage))
}
