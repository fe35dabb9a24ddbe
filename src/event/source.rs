use std::io;

use crate::interest::Interest;
use crate::notifier::Notifier;
use crate::token::Token;

/// A type that can be registered with a [`Notifier`].
///
/// Mirrors mio's `event::Source`: implementors almost always delegate to a
/// raw file descriptor (see `sys::unix::SourceFd`). Callers should not call
/// these methods directly; register through [`Notifier`] instead, which is
/// what lets the notifier maintain the EOF/error bookkeeping described in
/// §4.5.
pub trait Source {
    fn register(&mut self, notifier: &Notifier, token: Token, interests: Interest)
        -> io::Result<()>;

    fn reregister(
        &mut self,
        notifier: &Notifier,
        token: Token,
        interests: Interest,
    ) -> io::Result<()>;

    fn deregister(&mut self, notifier: &Notifier) -> io::Result<()>;
}
