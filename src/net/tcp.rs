use std::io::{self, Read, Write};
use std::net::{self, SocketAddr};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use crate::event::Source;
use crate::interest::Interest;
use crate::notifier::Notifier;
use crate::sys::unix::selector::SourceFd;
use crate::token::Token;

/// A non-blocking listening socket.
///
/// Carries the subset of §6's "configured resources per listener" that are
/// plain `setsockopt` calls: `SO_REUSEADDR`, `SO_REUSEPORT`, and backlog
/// depth. `TCP_FASTOPEN` and the deferred-accept filter are Linux-specific
/// extensions wired in the same way.
#[derive(Debug)]
pub struct TcpListener {
    inner: net::TcpListener,
}

impl TcpListener {
    pub fn bind(addr: SocketAddr, backlog: i32, reuseport: bool) -> io::Result<TcpListener> {
        let domain = if addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        let fd = syscall!(socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0))?;
        let on: libc::c_int = 1;
        syscall!(setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of_val(&on) as libc::socklen_t
        ))?;
        if reuseport {
            syscall!(setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of_val(&on) as libc::socklen_t
            ))?;
        }

        let (raw_addr, len) = socket_addr(&addr);
        let bind_res = unsafe { libc::bind(fd, raw_addr.as_ptr() as *const _, len) };
        if bind_res == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        syscall!(listen(fd, backlog)).map_err(|e| {
            unsafe { libc::close(fd) };
            e
        })?;

        let inner = unsafe { net::TcpListener::from_raw_fd(fd) };
        inner.set_nonblocking(true)?;
        Ok(TcpListener { inner })
    }

    /// Enable Linux `TCP_FASTOPEN` with the given pending-request queue
    /// length. Best-effort: a platform that doesn't support it is not a hard
    /// failure, matching how the content layer may run on a kernel without
    /// the option.
    pub fn set_fastopen(&self, queue_len: libc::c_int) -> io::Result<()> {
        let fd = self.inner.as_raw_fd();
        syscall!(setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            &queue_len as *const _ as *const libc::c_void,
            std::mem::size_of_val(&queue_len) as libc::socklen_t
        ))?;
        Ok(())
    }

    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.inner.accept()?;
        stream.set_nonblocking(true)?;
        Ok((TcpStream { inner: stream }, addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

fn socket_addr(addr: &SocketAddr) -> (Vec<u8>, libc::socklen_t) {
    match addr {
        SocketAddr::V4(a) => {
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    &sin as *const _ as *const u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                )
            };
            (bytes.to_vec(), std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(a) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    &sin6 as *const _ as *const u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                )
            };
            (
                bytes.to_vec(),
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

impl Source for TcpListener {
    fn register(&mut self, notifier: &Notifier, token: Token, interests: Interest) -> io::Result<()> {
        SourceFd(&self.inner.as_raw_fd()).register(notifier, token, interests)
    }

    fn reregister(
        &mut self,
        notifier: &Notifier,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.inner.as_raw_fd()).reregister(notifier, token, interests)
    }

    fn deregister(&mut self, notifier: &Notifier) -> io::Result<()> {
        SourceFd(&self.inner.as_raw_fd()).deregister(notifier)
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// A non-blocking, connected TCP socket.
#[derive(Debug)]
pub struct TcpStream {
    inner: net::TcpStream,
}

impl TcpStream {
    pub fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
        let inner = net::TcpStream::connect(addr)?;
        inner.set_nonblocking(true)?;
        Ok(TcpStream { inner })
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.inner.set_nodelay(on)
    }

    /// `TCP_CORK` on Linux, the kernel-side analogue of nginx's `tcp_nopush`.
    pub fn set_nopush(&self, on: bool) -> io::Result<()> {
        let val: libc::c_int = on as libc::c_int;
        syscall!(setsockopt(
            self.inner.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of_val(&val) as libc::socklen_t
        ))?;
        Ok(())
    }

    pub fn set_keepalive(&self, idle_secs: u32, intvl_secs: u32, count: u32) -> io::Result<()> {
        let fd = self.inner.as_raw_fd();
        let on: libc::c_int = 1;
        syscall!(setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of_val(&on) as libc::socklen_t
        ))?;
        syscall!(setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPIDLE,
            &idle_secs as *const _ as *const libc::c_void,
            std::mem::size_of_val(&idle_secs) as libc::socklen_t
        ))?;
        syscall!(setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPINTVL,
            &intvl_secs as *const _ as *const libc::c_void,
            std::mem::size_of_val(&intvl_secs) as libc::socklen_t
        ))?;
        syscall!(setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPCNT,
            &count as *const _ as *const libc::c_void,
            std::mem::size_of_val(&count) as libc::socklen_t
        ))?;
        Ok(())
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn shutdown(&self, how: net::Shutdown) -> io::Result<()> {
        self.inner.shutdown(how)
    }

    /// Scatter/gather read used by the I/O pipeline's greedy-read loop on
    /// edge-triggered backends (§4.5, `GREEDY_EVENT`).
    pub fn read_vectored(&mut self, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
        Read::read_vectored(&mut self.inner, bufs)
    }

    pub fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        Write::write_vectored(&mut self.inner, bufs)
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Source for TcpStream {
    fn register(&mut self, notifier: &Notifier, token: Token, interests: Interest) -> io::Result<()> {
        SourceFd(&self.inner.as_raw_fd()).register(notifier, token, interests)
    }

    fn reregister(
        &mut self,
        notifier: &Notifier,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.inner.as_raw_fd()).reregister(notifier, token, interests)
    }

    fn deregister(&mut self, notifier: &Notifier) -> io::Result<()> {
        SourceFd(&self.inner.as_raw_fd()).deregister(notifier)
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl FromRawFd for TcpStream {
    unsafe fn from_raw_fd(fd: RawFd) -> TcpStream {
        TcpStream {
            inner: net::TcpStream::from_raw_fd(fd),
        }
    }
}

impl IntoRawFd for TcpStream {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw_fd()
    }
}
