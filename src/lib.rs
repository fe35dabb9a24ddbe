//! Veyrond: the worker runtime of an event-driven network server.
//!
//! A cooperative event loop over a readiness notifier ([`notifier`]), a
//! connection and listener lifecycle manager ([`connection`], [`listener`]),
//! a zero-copy buffer-chain I/O pipeline ([`io_pipeline`]), a shared-memory
//! slab allocator for cross-worker coordination ([`slab_zone`]), and the
//! resolver ([`resolver`]) / open-file cache ([`file_cache`]) a content layer
//! (HTTP, mail, a raw proxy — none of which live in this crate, per §1's
//! content-layer boundary) builds on top of.
//!
//! Feature flags mirror the shape of the dependency: the pool/buffer/timer/
//! slab primitives in [`pool`], [`buf`], [`chain`], [`timer`], [`queue`],
//! [`slab_zone`] and [`accept_mutex`] have no I/O dependency and are always
//! compiled in. Everything that touches a socket or the readiness back-end
//! sits behind `os-poll` and/or `net`, the same split mio itself draws
//! between "you can use the buffer types standalone" and "you need the
//! actual reactor."

#[macro_use]
mod macros;

pub mod accept_mutex;
pub mod buf;
pub mod chain;
pub mod config;
pub mod error;
pub mod file_cache;
pub mod pool;
pub mod queue;
pub mod slab_zone;
pub mod timer;
pub mod token;
pub mod util;

mod interest;
pub use interest::Interest;

#[cfg(any(feature = "os-poll", feature = "net"))]
pub mod event;
#[cfg(any(feature = "os-poll", feature = "net"))]
pub mod notifier;
#[cfg(any(feature = "os-poll", feature = "net"))]
mod sys;

#[cfg(feature = "os-poll")]
pub mod threadpool;

#[cfg(feature = "net")]
pub mod net;

#[cfg(all(feature = "os-poll", feature = "net"))]
pub mod connection;
#[cfg(all(feature = "os-poll", feature = "net"))]
pub mod eventloop;
#[cfg(all(feature = "os-poll", feature = "net"))]
pub mod io_pipeline;
#[cfg(all(feature = "os-poll", feature = "net"))]
pub mod listener;
#[cfg(all(feature = "os-poll", feature = "net"))]
pub mod resolver;

#[cfg(any(feature = "os-poll", feature = "net"))]
pub use event::{Event, Events};
#[cfg(all(feature = "os-poll", feature = "net"))]
pub use eventloop::Worker;
pub use token::Token;
