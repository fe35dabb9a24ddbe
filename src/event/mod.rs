//! Readiness events produced by a [`Notifier`](crate::notifier::Notifier).

mod events;
mod source;

pub use events::{Event, Events, EventsIter};
pub use source::Source;
