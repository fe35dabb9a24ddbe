//! C8 (part two): the listening socket and its accept handler.
//!
//! §4.7: "loops (up to `multi_accept` times) calling `accept`... `EMFILE`/
//! `ENFILE` disables accepting temporarily (sets a 500-ms timer) to avoid
//! tight loops against fd exhaustion." [`Listener::accept_batch`] is that
//! loop; the caller (the event loop) is responsible for actually arming the
//! 500 ms timer when told to.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::config::ListenerConfig;
use crate::net::{TcpListener, TcpStream};
use crate::token::Token;

/// The 500 ms EMFILE/ENFILE backoff named in §4.7.
pub const ACCEPT_THROTTLE_DELAY: Duration = Duration::from_millis(500);

/// A bound listening socket plus the config every connection it spawns
/// inherits.
pub struct Listener {
    pub token: Token,
    pub inner: TcpListener,
    pub config: ListenerConfig,
}

/// Outcome of one `accept_batch` call.
#[derive(Default)]
pub struct AcceptBatch {
    pub accepted: Vec<(TcpStream, SocketAddr)>,
    /// Set when `accept()` failed with `EMFILE`/`ENFILE`: the caller should
    /// arm a [`ACCEPT_THROTTLE_DELAY`] timer and stop accepting on this
    /// listener until it fires.
    pub throttle: bool,
}

impl Listener {
    pub fn bind(token: Token, config: ListenerConfig) -> io::Result<Listener> {
        let inner = TcpListener::bind(config.addr, config.backlog, config.reuseport)?;
        if let Some(queue_len) = config.fastopen {
            // Best-effort per net/tcp.rs's doc comment; a kernel without
            // TCP_FASTOPEN support is not a listener-bind failure.
            let _ = inner.set_fastopen(queue_len);
        }
        Ok(Listener {
            token,
            inner,
            config,
        })
    }

    /// `accept()` up to `multi_accept` times, applying each stream's
    /// configured socket options. Stops early on `WouldBlock` (queue
    /// drained) or on a fatal fd-exhaustion error (§4.7).
    pub fn accept_batch(&self, multi_accept: u32) -> AcceptBatch {
        let mut batch = AcceptBatch::default();
        for _ in 0..multi_accept.max(1) {
            match self.inner.accept() {
                Ok((stream, addr)) => {
                    self.apply_stream_options(&stream);
                    batch.accepted.push((stream, addr));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) if is_fd_exhaustion(&e) => {
                    log::warn!(
                        "listener {:?}: accept() hit fd exhaustion ({}), throttling for {:?}",
                        self.token,
                        e,
                        ACCEPT_THROTTLE_DELAY
                    );
                    batch.throttle = true;
                    break;
                }
                Err(e) => {
                    log::warn!("listener {:?}: accept() failed: {}", self.token, e);
                    break;
                }
            }
        }
        batch
    }

    fn apply_stream_options(&self, stream: &TcpStream) {
        if self.config.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }
        if self.config.tcp_nopush {
            let _ = stream.set_nopush(true);
        }
        if let Some((idle, intvl, cnt)) = self.config.keepalive {
            let _ = stream.set_keepalive(idle, intvl, cnt);
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn accept_batch_drains_pending_connections_then_stops() {
        let cfg = ListenerConfig::tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
        let listener = Listener::bind(Token(0), cfg).unwrap();
        let addr = listener.local_addr().unwrap();

        let _c1 = TcpStream::connect(addr).unwrap();
        let _c2 = TcpStream::connect(addr).unwrap();

        // Give the kernel a moment to move both SYNs into the accept queue.
        std::thread::sleep(Duration::from_millis(20));

        let batch = listener.accept_batch(8);
        assert_eq!(batch.accepted.len(), 2);
        assert!(!batch.throttle);

        let empty = listener.accept_batch(8);
        assert!(empty.accepted.is_empty());
    }
}
