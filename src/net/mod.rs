//! Non-blocking networking primitives registrable with a [`Notifier`](crate::notifier::Notifier).
//!
//! These are thin wrappers over `std::net`, in the same spirit as mio's own
//! `net` module: they exist to set `O_NONBLOCK`, expose the handful of raw
//! socket options §6 calls out per listener, and implement
//! [`event::Source`](crate::event::Source).

mod tcp;
mod udp;

pub use tcp::{TcpListener, TcpStream};
pub use udp::UdpSocket;
