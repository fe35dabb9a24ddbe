//! C8 (part one): the connection object and its fixed-size pool.
//!
//! §3: "On startup each worker allocates a fixed-size `[Connection;
//! connection_n]`... Free connections are threaded through `data` as a
//! stack." We keep the fixed-capacity, no-per-connection-heap-churn shape —
//! `ConnectionPool` pre-allocates `connection_n` slots once — but thread the
//! free list as a plain `Vec<usize>` stack of slot indices rather than an
//! intrusive pointer chain (Design Notes §9).

use std::net::SocketAddr;
use std::time::Duration;

use crate::net::TcpStream;
use crate::pool::Pool;
use crate::timer::TimerId;
use crate::token::Token;

/// Whether a socket option has been left alone, explicitly enabled, or
/// explicitly disabled — §3's "2-bit state: unset/set/disabled" for
/// `tcp_nodelay`/`tcp_nopush`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TriState {
    #[default]
    Unset,
    Set,
    Disabled,
}

/// Flag bits carried on every connection, per §3.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectionFlags {
    pub reusable: bool,
    pub idle: bool,
    pub close: bool,
    pub error: bool,
    pub destroyed: bool,
    pub timedout: bool,
    /// Bitmask of content-layer buffering state; the core only threads this
    /// bit pattern through, it does not interpret it (§3: "8-bit mask of
    /// buffered layers").
    pub buffered: u8,
    pub tcp_nodelay: TriState,
    pub tcp_nopush: TriState,
    pub sendfile: bool,
    pub pipeline: bool,
}

/// One network connection: its socket, its scoped arena, and the
/// bookkeeping the event loop and I/O pipeline need.
///
/// Per Design Notes §9, a connection borrows a stable reference to its
/// listener rather than owning it — here that is `listener_token`, an index
/// into the worker's listener table, since listeners always outlive the
/// connections they spawn.
pub struct Connection {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
    pub listener_token: Token,
    pub pool: Pool,
    pub flags: ConnectionFlags,
    pub read_timer: Option<TimerId>,
    pub write_timer: Option<TimerId>,
}

impl Connection {
    fn new(stream: TcpStream, peer_addr: SocketAddr, listener_token: Token, pool_size: usize) -> Connection {
        Connection {
            stream,
            peer_addr,
            listener_token,
            pool: Pool::create(pool_size),
            flags: ConnectionFlags::default(),
            read_timer: None,
            write_timer: None,
        }
    }
}

/// The worker's fixed-size connection table plus free and reusable lists.
///
/// - `free` is the stack of never-used-or-fully-freed slot indices (§3:
///   "pulled from the worker's free list").
/// - `reusable` is the FIFO of idle-but-not-yet-closed connections (§4.7's
///   keep-alive queue); when the worker runs low on free slots it closes the
///   oldest entry here first.
pub struct ConnectionPool {
    slots: Vec<Option<Connection>>,
    free: Vec<usize>,
    reusable: std::collections::VecDeque<usize>,
    pool_size: usize,
}

impl ConnectionPool {
    pub fn new(connection_n: usize, pool_size: usize) -> ConnectionPool {
        let mut slots = Vec::with_capacity(connection_n);
        slots.resize_with(connection_n, || None);
        let free = (0..connection_n).rev().collect();
        ConnectionPool {
            slots,
            free,
            reusable: std::collections::VecDeque::new(),
            pool_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// True once free slots drop below 1/16 of capacity (§4.7: "fewer than
    /// 1/16 of its pool free").
    pub fn is_low_on_free_slots(&self) -> bool {
        self.free.len() * 16 < self.slots.len()
    }

    /// True once occupied slots reach 7/8 of capacity (§4.6 step 2: defer
    /// accept-mutex acquisition past this point).
    pub fn is_accept_disabled_threshold(&self) -> bool {
        let used = self.slots.len() - self.free.len();
        used * 8 >= self.slots.len() * 7
    }

    /// `get_connection(fd, log)`: pop a free slot, or if none remain and the
    /// worker is under reuse pressure, evict the oldest reusable connection
    /// first.
    pub fn get_connection(
        &mut self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        listener_token: Token,
    ) -> Option<Token> {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                let victim = self.reusable.pop_front()?;
                self.free_connection(Token(victim));
                self.free.pop()?
            }
        };
        self.slots[idx] = Some(Connection::new(stream, peer_addr, listener_token, self.pool_size));
        Some(Token(idx))
    }

    pub fn get(&self, token: Token) -> Option<&Connection> {
        self.slots.get(token.0)?.as_ref()
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.slots.get_mut(token.0)?.as_mut()
    }

    /// Mark a connection idle-but-reusable (e.g. a keep-alive socket waiting
    /// on the next request).
    pub fn mark_reusable(&mut self, token: Token) {
        if let Some(conn) = self.get_mut(token) {
            conn.flags.reusable = true;
            conn.flags.idle = true;
        }
        self.reusable.push_back(token.0);
    }

    pub fn unmark_reusable(&mut self, token: Token) {
        if let Some(conn) = self.get_mut(token) {
            conn.flags.reusable = false;
            conn.flags.idle = false;
        }
        self.reusable.retain(|&idx| idx != token.0);
    }

    /// `free_connection(c)`: destroy and return the slot to the free list.
    /// Invariant 1 of §8: after this, the connection's fd is no longer
    /// considered live — the caller is responsible for having already
    /// deregistered and closed it via the notifier.
    pub fn free_connection(&mut self, token: Token) -> bool {
        self.reusable.retain(|&idx| idx != token.0);
        if let Some(slot) = self.slots.get_mut(token.0) {
            if let Some(mut conn) = slot.take() {
                conn.flags.destroyed = true;
                self.free.push(token.0);
                return true;
            }
        }
        false
    }

    pub fn oldest_reusable(&self) -> Option<Token> {
        self.reusable.front().copied().map(Token)
    }

    pub fn reusable_count(&self) -> usize {
        self.reusable.len()
    }
}

/// Default keep-alive idle window before a reusable connection is force-
/// closed if nothing else reclaims it first, in the absence of a content-
/// layer-supplied keepalive timeout.
pub const DEFAULT_KEEPALIVE_IDLE: Duration = Duration::from_secs(75);

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn dummy_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    fn bind_and_accept_pair() -> (TcpStream, TcpStream) {
        let listener = crate::net::TcpListener::bind(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            16,
            false,
        )
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = loop {
            if let Ok(pair) = listener.accept() {
                break pair;
            }
        };
        (client, server)
    }

    #[test]
    fn pool_recycles_freed_slots() {
        let mut pool = ConnectionPool::new(2, 4096);
        let (_c1, s1) = bind_and_accept_pair();
        let tok1 = pool.get_connection(s1, dummy_addr(), Token(0)).unwrap();
        pool.free_connection(tok1);
        assert_eq!(pool.free_slots(), 2);
    }

    #[test]
    fn exhausted_pool_evicts_oldest_reusable_connection() {
        let mut pool = ConnectionPool::new(1, 4096);
        let (_c1, s1) = bind_and_accept_pair();
        let tok1 = pool.get_connection(s1, dummy_addr(), Token(0)).unwrap();
        pool.mark_reusable(tok1);

        let (_c2, s2) = bind_and_accept_pair();
        let tok2 = pool
            .get_connection(s2, dummy_addr(), Token(0))
            .expect("should evict the reusable connection to make room");
        assert_eq!(tok2, tok1, "the single slot is reused");
        assert_eq!(pool.reusable_count(), 0);
    }

    #[test]
    fn low_on_free_slots_threshold() {
        let mut pool = ConnectionPool::new(16, 4096);
        for _ in 0..15 {
            let (_c, s) = bind_and_accept_pair();
            pool.get_connection(s, dummy_addr(), Token(0)).unwrap();
        }
        assert!(pool.is_low_on_free_slots());
    }
}
