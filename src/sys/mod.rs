//! Platform-specific event-notification back-ends.
//!
//! §1 scopes platform back-ends (epoll/kqueue/event-ports/IOCP) out as
//! external collaborators; this crate ships the Linux `epoll` back-end as
//! the reference implementation of the uniform interface in §4.5 and keeps
//! every other module talking only to that interface (`notifier::Notifier`),
//! never to `sys` directly.

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix as imp;
