use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::interest::Interest;
use crate::sys::unix::selector::Selector;
use crate::token::Token;

/// Wakes a sleeping worker out of `process_events` from another thread.
///
/// Backs the `notify(handler)` method of §4.5. On Linux this is an
/// `eventfd(2)`; mio uses the identical mechanism for its own `Waker`.
#[derive(Debug)]
pub struct Waker {
    fd: RawFd,
}

impl Waker {
    pub fn new_raw(selector: &Selector, token: Token) -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        selector.register(fd, token, Interest::READABLE)?;
        Ok(Waker { fd })
    }

    pub fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        loop {
            let res = syscall!(write(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len()
            ));
            match res {
                Ok(_) => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // The eventfd counter is saturated; a pending wake is already
                // observable, so this is not an error for our purposes.
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Drain the eventfd counter after waking, so the next `epoll_wait` does
    /// not immediately return spuriously.
    pub fn ack(&self) {
        let mut buf = [0u8; 8];
        let _ = syscall!(read(
            self.fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        ));
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        let _ = syscall!(close(self.fd));
    }
}
