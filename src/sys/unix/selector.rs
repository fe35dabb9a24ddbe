use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::trace;

use crate::event::Events;
use crate::interest::Interest;
use crate::token::Token;

/// Thin wrapper over `epoll(7)`.
///
/// This is the Linux backend for the uniform notifier interface of §4.5. It
/// is deliberately the only thing in the crate that calls `epoll_ctl` /
/// `epoll_wait` directly; everything above `Selector` talks to `Notifier`.
#[derive(Debug)]
pub struct Selector {
    ep: RawFd,
    #[allow(dead_code)]
    id: usize,
}

fn next_id() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let ep = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Selector {
            ep,
            id: next_id(),
        })
    }

    pub fn try_clone(&self) -> io::Result<Selector> {
        let ep = syscall!(fcntl(self.ep, libc::F_DUPFD_CLOEXEC, 0))?;
        Ok(Selector { ep, id: self.id })
    }

    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout.map_or(-1, |d| {
            d.as_millis().min(i32::MAX as u128) as i32
        });

        let cap = events.capacity().max(64);
        let mut raw = vec![libc::epoll_event { events: 0, u64: 0 }; cap];

        let n = loop {
            let res = syscall!(epoll_wait(
                self.ep,
                raw.as_mut_ptr(),
                raw.len() as i32,
                timeout_ms
            ));
            match res {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        events.clear();
        for e in raw.into_iter().take(n as usize) {
            let token = Token(e.u64 as usize);
            let mut ev = crate::event::Event::new(token);
            let flags = e.events;
            if flags & (libc::EPOLLIN as u32) != 0 {
                ev.set_readable();
            }
            if flags & (libc::EPOLLOUT as u32) != 0 {
                ev.set_writable();
            }
            if flags & (libc::EPOLLERR as u32) != 0 {
                ev.set_error(0);
            }
            if flags & ((libc::EPOLLHUP | libc::EPOLLRDHUP) as u32) != 0 {
                ev.set_eof();
            }
            events.push(ev);
        }
        trace!("epoll_wait returned {} events", n);
        Ok(())
    }

    fn interests_to_epoll(interests: Interest) -> u32 {
        let mut flags = 0u32;
        if interests.is_readable() {
            flags |= libc::EPOLLIN as u32;
        }
        if interests.is_writable() {
            flags |= libc::EPOLLOUT as u32;
        }
        if interests.is_edge() {
            flags |= libc::EPOLLET as u32;
        }
        if interests.is_oneshot() {
            flags |= libc::EPOLLONESHOT as u32;
        }
        flags
    }

    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: Self::interests_to_epoll(interests),
            u64: usize::from(token) as u64,
        };
        syscall!(epoll_ctl(self.ep, libc::EPOLL_CTL_ADD, fd, &mut event))?;
        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: Self::interests_to_epoll(interests),
            u64: usize::from(token) as u64,
        };
        syscall!(epoll_ctl(self.ep, libc::EPOLL_CTL_MOD, fd, &mut event))?;
        Ok(())
    }

    /// Deregister `fd`. Per §4.5, closing the fd implicitly deregisters it
    /// from epoll, so callers that are about to `close()` may skip this.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep,
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut()
        ))?;
        Ok(())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        if let Err(err) = syscall!(close(self.ep)) {
            log::warn!("error closing epoll fd: {}", err);
        }
    }
}

/// A `Source` implementation for raw file descriptors, mirroring mio's
/// `unix::SourceFd` wrapper used for pipes, signalfd, eventfd and the like.
#[derive(Debug)]
pub struct SourceFd<'a>(pub &'a RawFd);

impl<'a> crate::event::Source for SourceFd<'a> {
    fn register(
        &mut self,
        notifier: &crate::notifier::Notifier,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        notifier.selector().register(*self.0, token, interests)
    }

    fn reregister(
        &mut self,
        notifier: &crate::notifier::Notifier,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        notifier.selector().reregister(*self.0, token, interests)
    }

    fn deregister(&mut self, notifier: &crate::notifier::Notifier) -> io::Result<()> {
        notifier.selector().deregister(*self.0)
    }
}
