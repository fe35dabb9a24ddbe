use std::io;
use std::net::{self, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::event::Source;
use crate::interest::Interest;
use crate::notifier::Notifier;
use crate::sys::unix::selector::SourceFd;
use crate::token::Token;

/// A non-blocking UDP socket, used both for listener-configured datagram
/// endpoints and for the resolver's (C10) nameserver queries.
#[derive(Debug)]
pub struct UdpSocket {
    inner: net::UdpSocket,
}

impl UdpSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<UdpSocket> {
        let inner = net::UdpSocket::bind(addr)?;
        inner.set_nonblocking(true)?;
        Ok(UdpSocket { inner })
    }

    pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        self.inner.connect(addr)
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.send(buf)
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, addr)
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.recv(buf)
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl Source for UdpSocket {
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

impl AsRawFd for UdpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
