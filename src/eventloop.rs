//! C7: the worker event loop.
//!
//! `Worker` is the single-threaded owner of everything a worker process
//! touches each iteration (§4.6): the cached-time ring, the timer tree, the
//! fixed connection pool, the listener table, the accept mutex, the posted
//! queues, the open-file cache, the resolver, and the thread pool. Nothing
//! below this layer calls back into any of it except through the notifier's
//! `notify` thunk queue (see `notifier.rs`'s Design Notes reference), so
//! `run_once` is the only place §4.6's six steps are actually sequenced.
//!
//! The content-layer protocol (HTTP, mail, a raw proxy — whatever sits above
//! this crate) plugs in via [`Worker::set_handler`]: one closure invoked for
//! every readable/writable/eof/error connection event. The core itself does
//! not parse a byte of application protocol.

use std::collections::{HashMap, HashSet};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::accept_mutex::AcceptMutex;
use crate::config::{ListenerConfig, WorkerConfig};
use crate::connection::{Connection, ConnectionPool};
use crate::event::{Event, Events};
use crate::file_cache::FileCache;
use crate::listener::{Listener, ACCEPT_THROTTLE_DELAY};
use crate::notifier::Notifier;
use crate::queue::TokenQueue;
use crate::resolver::Resolver;
use crate::slab_zone::SlabZone;
use crate::threadpool::ThreadPool;
use crate::timer::{TimerId, TimerTree};
use crate::token::Token;
use crate::util::time_ring::TimeRing;

/// Reserved token for the resolver's UDP socket, placed well above any
/// listener/connection token (`connection_n` of them, then one per listener).
const RESOLVER_TOKEN: Token = Token(usize::MAX - 2);

enum TimerAction {
    ReenableListener(usize),
}

/// One readable/writable/eof/error notification for a live connection,
/// handed to whatever [`Worker::set_handler`] installed.
pub struct ConnEvent<'a> {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub eof: bool,
    pub error: bool,
    pub conn: &'a mut Connection,
}

type EventHandler = Box<dyn FnMut(ConnEvent)>;

/// The per-worker runtime (§3 "Worker process state").
pub struct Worker {
    notifier: Arc<Notifier>,
    events: Events,
    timers: TimerTree,
    timer_actions: HashMap<TimerId, TimerAction>,
    time: TimeRing,
    connections: ConnectionPool,
    listeners: Vec<Listener>,
    throttled: HashSet<usize>,
    posted: TokenQueue,
    posted_next: TokenQueue,
    pending_conn_events: HashMap<Token, Event>,
    accept_mutex: Option<AcceptMutex>,
    accept_zone: Option<Arc<SlabZone>>,
    file_cache: FileCache,
    thread_pool: ThreadPool,
    resolver: Option<Resolver>,
    handler: Option<EventHandler>,
    config: WorkerConfig,
    shutting_down: bool,
    shutdown_deadline: Option<Instant>,
}

impl Worker {
    /// A standalone worker: if `cfg.accept_mutex` is set, it allocates its
    /// own single-worker zone for the lock word. To coordinate several
    /// workers sharing one zone (several OS processes forked from a common
    /// master, or several threads in one address space — the supervisor
    /// that creates and forks into them is out of scope here per §1) use
    /// [`Worker::with_shared_zone`] instead.
    pub fn new(cfg: WorkerConfig) -> std::io::Result<Worker> {
        if cfg.accept_mutex {
            let zone = Arc::new(SlabZone::create("accept_mutex", 4096)?);
            Worker::with_shared_zone(cfg, zone, 0)
        } else {
            Worker::build(cfg, None)
        }
    }

    /// A worker participating in cross-worker accept-mutex arbitration over
    /// an externally created, shared `zone` (§4.6 step 2). `worker_id` must
    /// be unique among the workers sharing `zone`.
    pub fn with_shared_zone(
        cfg: WorkerConfig,
        zone: Arc<SlabZone>,
        worker_id: u32,
    ) -> std::io::Result<Worker> {
        let mutex = AcceptMutex::new(&zone, worker_id, cfg.accept_mutex_delay).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "accept_mutex zone allocation failed")
        })?;
        let mut worker = Worker::build(cfg, Some(mutex))?;
        worker.accept_zone = Some(zone);
        Ok(worker)
    }

    fn build(cfg: WorkerConfig, accept_mutex: Option<AcceptMutex>) -> std::io::Result<Worker> {
        let notifier = Arc::new(Notifier::new()?);
        let thread_pool = ThreadPool::new(cfg.thread_pool_size, Arc::clone(&notifier));
        let connections = ConnectionPool::new(cfg.connection_n, cfg.bufs_size * cfg.bufs_num);

        let resolver = if cfg.resolver.nameservers.is_empty() {
            None
        } else {
            let r = Resolver::new(cfg.resolver.clone())?;
            let fd = r.socket().as_raw_fd();
            notifier.add(
                &mut crate::sys::unix::selector::SourceFd(&fd),
                RESOLVER_TOKEN,
                crate::interest::Interest::READABLE,
            )?;
            Some(r)
        };

        Ok(Worker {
            notifier,
            events: Events::with_capacity(cfg.connection_n.min(1024).max(64)),
            timers: TimerTree::new(),
            timer_actions: HashMap::new(),
            time: TimeRing::new(),
            connections,
            listeners: Vec::new(),
            throttled: HashSet::new(),
            posted: TokenQueue::new(),
            posted_next: TokenQueue::new(),
            pending_conn_events: HashMap::new(),
            accept_mutex,
            accept_zone: None,
            file_cache: FileCache::new(cfg.file_cache),
            thread_pool,
            resolver,
            handler: None,
            config: cfg,
            shutting_down: false,
            shutdown_deadline: None,
        })
    }

    /// Install the content-layer connection-event callback (§1: everything
    /// above raw readiness is out of scope for this crate).
    pub fn set_handler(&mut self, handler: impl FnMut(ConnEvent) + 'static) {
        self.handler = Some(Box::new(handler));
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn connections(&self) -> &ConnectionPool {
        &self.connections
    }

    pub fn connections_mut(&mut self) -> &mut ConnectionPool {
        &mut self.connections
    }

    pub fn file_cache_mut(&mut self) -> &mut FileCache {
        &mut self.file_cache
    }

    pub fn thread_pool(&self) -> &ThreadPool {
        &self.thread_pool
    }

    pub fn resolver_mut(&mut self) -> Option<&mut Resolver> {
        self.resolver.as_mut()
    }

    /// Bind and register a new listener, returning the token its accept
    /// events will carry.
    pub fn add_listener(&mut self, cfg: ListenerConfig) -> std::io::Result<Token> {
        let idx = self.listeners.len();
        let token = Token(self.config.connection_n + idx);
        let mut listener = Listener::bind(token, cfg)?;
        self.notifier
            .add(&mut listener.inner, token, crate::interest::Interest::READABLE)?;
        self.listeners.push(listener);
        Ok(token)
    }

    /// The bound address of the `idx`-th listener added via
    /// [`Worker::add_listener`], in the order they were added. Mainly useful
    /// when a listener was configured to bind an ephemeral port (`:0`).
    pub fn listener_local_addr(&self, idx: usize) -> std::io::Result<std::net::SocketAddr> {
        self.listeners
            .get(idx)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such listener"))?
            .local_addr()
    }

    fn is_listener_token(&self, token: Token) -> Option<usize> {
        let base = self.config.connection_n;
        if token.0 >= base && token.0 < base + self.listeners.len() {
            Some(token.0 - base)
        } else {
            None
        }
    }

    /// §4.6: one iteration of the worker loop.
    ///
    /// 1. refresh the cached-time ring
    /// 2. accept-mutex arbitration (acquire if below the pool's 7/8
    ///    threshold, release otherwise once the grace period allows)
    /// 3. compute the next timer deadline, used as `process_events`'s wait
    ///    budget
    /// 4. wait for readiness; listener events are handled inline (accept),
    ///    connection events are posted so they run after every listener in
    ///    this batch has had a chance to accept
    /// 5. expire timers
    /// 6. drain the posted queue
    pub fn run_once(&mut self) -> std::io::Result<()> {
        self.time.update();

        let accept_enabled = self.arbitrate_accept_mutex();

        let now_ms = self.time.unix_ms();
        let timeout = self.timers.find_timer(now_ms).map(Duration::from_millis);

        self.events.clear();
        self.notifier.process_events(&mut self.events, timeout)?;

        let ready: Vec<Event> = self.events.iter().copied().collect();
        for event in ready {
            if self.notifier.is_wake_event(&event) {
                continue;
            }
            if event.token() == RESOLVER_TOKEN {
                self.drain_resolver();
                continue;
            }
            if let Some(idx) = self.is_listener_token(event.token()) {
                if accept_enabled && !self.throttled.contains(&idx) {
                    self.accept_on_listener(idx);
                }
                continue;
            }
            self.posted_next.push_back(event.token());
            self.pending_conn_events.insert(event.token(), event);
        }

        let now_ms = self.time.unix_ms();
        let mut expired = Vec::new();
        self.timers.expire_timers(now_ms, |id| expired.push(id));
        for id in expired {
            if let Some(TimerAction::ReenableListener(idx)) = self.timer_actions.remove(&id) {
                self.throttled.remove(&idx);
            }
        }

        std::mem::swap(&mut self.posted, &mut self.posted_next);
        let mut due: Vec<Token> = Vec::new();
        self.posted.drain_into(|t| due.push(t));
        for token in due {
            let Some(event) = self.pending_conn_events.remove(&token) else {
                continue;
            };
            self.dispatch_conn_event(token, event);
        }

        if self.shutting_down {
            self.reap_idle_for_shutdown();
        }

        Ok(())
    }

    fn arbitrate_accept_mutex(&mut self) -> bool {
        if !self.config.accept_mutex {
            return true;
        }
        let Some(mutex) = self.accept_mutex.as_mut() else {
            return true;
        };
        if self.connections.is_accept_disabled_threshold() {
            mutex.release();
            false
        } else {
            mutex.try_acquire()
        }
    }

    fn accept_on_listener(&mut self, idx: usize) {
        let (accepted, throttle, listener_token) = {
            let listener = &self.listeners[idx];
            let batch = listener.accept_batch(self.config.multi_accept);
            (batch.accepted, batch.throttle, listener.token)
        };

        for (stream, addr) in accepted {
            let Some(token) = self.connections.get_connection(stream, addr, listener_token) else {
                log::warn!("worker: connection pool exhausted, dropping accepted peer {addr}");
                continue;
            };
            if let Some(conn) = self.connections.get_mut(token) {
                if let Err(e) = self.notifier.add_conn(&mut conn.stream, token) {
                    log::warn!("worker: failed to register connection {token:?}: {e}");
                    self.connections.free_connection(token);
                }
            }
        }

        if throttle {
            self.throttled.insert(idx);
            let now_ms = self.time.unix_ms();
            let deadline = now_ms + ACCEPT_THROTTLE_DELAY.as_millis() as u64;
            let id = self.timers.insert(deadline, true);
            self.timer_actions.insert(id, TimerAction::ReenableListener(idx));
        }
    }

    fn dispatch_conn_event(&mut self, token: Token, event: Event) {
        let Some(handler) = self.handler.as_mut() else {
            return;
        };
        let Some(conn) = self.connections.get_mut(token) else {
            return;
        };
        handler(ConnEvent {
            token,
            readable: event.is_readable(),
            writable: event.is_writable(),
            eof: event.is_eof(),
            error: event.is_error(),
            conn,
        });
    }

    fn drain_resolver(&mut self) {
        let Some(resolver) = self.resolver.as_mut() else {
            return;
        };
        let now = Instant::now();
        if let Err(e) = resolver.poll_socket(now) {
            log::warn!("resolver: socket read failed: {e}");
        }
        resolver.check_timeouts(now);
    }

    /// Begin graceful shutdown: stop accepting, and start draining idle
    /// connections. `run_once` keeps running until
    /// [`is_shutdown_complete`](Worker::is_shutdown_complete) is true.
    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
        self.shutdown_deadline = Some(Instant::now() + self.config.shutdown_timeout);
        for listener in &mut self.listeners {
            let _ = self.notifier.del(&mut listener.inner, Default::default());
        }
    }

    fn reap_idle_for_shutdown(&mut self) {
        while let Some(token) = self.connections.oldest_reusable() {
            if let Some(conn) = self.connections.get_mut(token) {
                let _ = self.notifier.del_conn(&mut conn.stream, Default::default());
            }
            self.connections.free_connection(token);
        }
    }

    /// True once every timer remaining is cancelable and no reusable
    /// connection is still open, or the shutdown timeout has elapsed —
    /// whichever comes first (§4.6's graceful-shutdown exit condition).
    pub fn is_shutdown_complete(&self) -> bool {
        if !self.shutting_down {
            return false;
        }
        if let Some(deadline) = self.shutdown_deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        self.timers.no_timers_left() && self.connections.reusable_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;
    use crate::net::TcpStream;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[test]
    fn worker_accepts_connection_via_run_once() {
        let mut cfg = WorkerConfig::default();
        cfg.accept_mutex = false;
        cfg.connection_n = 16;
        let mut worker = Worker::new(cfg).unwrap();
        let token = worker.add_listener(ListenerConfig::tcp(loopback())).unwrap();
        let addr = worker.listeners[0].local_addr().unwrap();
        let _ = token;

        let _client = TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        worker.run_once().unwrap();

        assert_eq!(worker.connections().capacity() - worker.connections().free_slots(), 1);
    }

    #[test]
    fn posted_handler_sees_readable_connection_event() {
        let mut cfg = WorkerConfig::default();
        cfg.accept_mutex = false;
        cfg.connection_n = 16;
        let mut worker = Worker::new(cfg).unwrap();
        worker.add_listener(ListenerConfig::tcp(loopback())).unwrap();
        let addr = worker.listeners[0].local_addr().unwrap();

        let seen = StdArc::new(AtomicUsize::new(0));
        let seen2 = StdArc::clone(&seen);
        worker.set_handler(move |ev: ConnEvent| {
            if ev.readable {
                seen2.fetch_add(1, Ordering::SeqCst);
            }
        });

        let mut client = TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        worker.run_once().unwrap(); // accepts

        use std::io::Write;
        client.write_all(b"hi").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        worker.run_once().unwrap(); // should see the readable connection event

        assert!(seen.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn begin_shutdown_marks_worker_shutting_down_and_completes_quickly_when_idle() {
        let mut cfg = WorkerConfig::default();
        cfg.accept_mutex = false;
        cfg.shutdown_timeout = Duration::from_secs(5);
        let mut worker = Worker::new(cfg).unwrap();
        worker.add_listener(ListenerConfig::tcp(loopback())).unwrap();

        assert!(!worker.is_shutdown_complete());
        worker.begin_shutdown();
        // No timers armed and nothing reusable: shutdown is already
        // complete without needing another loop iteration.
        assert!(worker.is_shutdown_complete());
    }
}
