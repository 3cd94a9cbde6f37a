//! Use cases layered over the channel backends.
//!
//! - **`arbitrator`** – exclusive per-device sessions, epochs and stealing.
//! - **`events`** – subscriber list for lifecycle and device-change events.
//! - **`facade`** – the single entry point: backend selection, polling and
//!   session operations routed through the arbitrator.
//!
//! Nothing here performs I/O directly; every device interaction goes through
//! the [`ChannelBackend`](crate::infrastructure::backend::ChannelBackend)
//! trait so tests can substitute mocks.

pub mod arbitrator;
pub mod events;
pub mod facade;
