//! OS- and network-facing adapters.
//!
//! `backend` holds the [`ChannelBackend`](backend::ChannelBackend) seam and
//! its Bridge-HTTP and USB implementations; `storage` loads and saves the
//! TOML configuration file.

pub mod backend;
pub mod storage;
