//! Ambient utilities the core uses or emits to the content layer (§6).

pub mod codec;
pub mod time_ring;
pub mod units;
