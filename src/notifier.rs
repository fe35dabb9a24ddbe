//! C6: the uniform event-notifier interface.
//!
//! One `Notifier` wraps exactly one OS readiness back-end (`sys::imp`) and
//! exposes the vtable-shaped contract of §4.5: `add`/`del`/`add_conn`/
//! `del_conn`/`notify`/`process_events`/`init`/`done`. Everything above this
//! layer — the event loop, connections, listeners — talks only to
//! `Notifier`, never to `sys` directly, so a second back-end (kqueue, IOCP)
//! can be dropped in without touching C7 or above.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::trace;

use crate::event::{Event, Events, Source};
use crate::interest::Interest;
use crate::sys::imp::selector::Selector;
use crate::sys::imp::waker::Waker;
use crate::token::Token;

/// Reserved token for the cross-thread waker registered by `Notifier::new`.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// Deregistration behavior not already captured by [`Interest`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DelFlags {
    /// The caller is about to `close()` the fd; skip the `epoll_ctl(DEL)`
    /// syscall since closing deregisters implicitly.
    pub close_event: bool,
    /// Leave the fd registered but mark it administratively disabled
    /// (used by `WINCH`-triggered "stop accepting" per §6).
    pub disable_event: bool,
}

/// The event-notification back-end plus the cross-thread waker and a queue
/// of thunks to run after a wake (the "handler is invoked in the worker's
/// loop" half of `notify`'s contract).
pub struct Notifier {
    selector: Selector,
    waker: Waker,
    woken: AtomicBool,
    after_wake: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Notifier {
    /// `init(cycle, timer)` — `cycle`/`timer` are owned by the caller (C7);
    /// `Notifier` itself only needs the back-end and its waker.
    pub fn new() -> io::Result<Notifier> {
        let selector = Selector::new()?;
        let waker = Waker::new_raw(&selector, WAKE_TOKEN)?;
        Ok(Notifier {
            selector,
            waker,
            woken: AtomicBool::new(false),
            after_wake: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn selector(&self) -> &Selector {
        &self.selector
    }

    /// `add(ev, event, flags)`.
    pub fn add<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        source.register(self, token, interests)
    }

    /// `del(ev, event, flags)`.
    pub fn del<S: Source + ?Sized>(&self, source: &mut S, flags: DelFlags) -> io::Result<()> {
        if flags.close_event {
            // Closing the fd (caller's responsibility after this returns)
            // deregisters it implicitly; nothing to do here.
            return Ok(());
        }
        source.deregister(self)
    }

    /// `add_conn(c)` — register both directions of a connection at once.
    pub fn add_conn<S: Source + ?Sized>(&self, source: &mut S, token: Token) -> io::Result<()> {
        source.register(self, token, Interest::READABLE | Interest::WRITABLE)
    }

    /// `del_conn(c, flags)`.
    pub fn del_conn<S: Source + ?Sized>(&self, source: &mut S, flags: DelFlags) -> io::Result<()> {
        self.del(source, flags)
    }

    /// `notify(handler)` — wake a sleeping worker from another thread;
    /// `handler` runs on the worker's own loop once it wakes.
    pub fn notify(&self, handler: impl FnOnce() + Send + 'static) -> io::Result<()> {
        self.after_wake.lock().unwrap().push(Box::new(handler));
        self.woken.store(true, Ordering::Release);
        self.waker.wake()
    }

    /// `process_events(cycle, timeout_ms, flags)`, restricted here to the
    /// raw wait-and-translate step: block up to `timeout` for readiness and
    /// return the resulting events. The decision of "invoke now vs. post"
    /// named in §4.5 belongs to the event loop (C7), which holds the posted
    /// queues and per-connection handlers that `Notifier` deliberately does
    /// not own (see Design Notes §9 on cyclic ownership).
    pub fn process_events(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.selector.select(events, timeout)?;
        if self.woken.swap(false, Ordering::AcqRel) {
            self.waker.ack();
            let thunks: Vec<_> = std::mem::take(&mut *self.after_wake.lock().unwrap());
            for thunk in thunks {
                thunk();
            }
        }
        trace!("process_events: {} events ready", events.len());
        Ok(())
    }

    /// True if `event` is the reserved wake notification rather than a
    /// registered source's event.
    pub fn is_wake_event(&self, event: &Event) -> bool {
        event.token() == WAKE_TOKEN
    }

    /// `done(cycle)`.
    pub fn shutdown(&self) {
        // Selector and Waker close their fds on Drop; nothing else to flush.
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}
