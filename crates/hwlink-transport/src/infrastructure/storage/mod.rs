//! Storage infrastructure: configuration file persistence.
//!
//! `config` reads and writes the TOML file in the platform config directory
//! and converts it into the runtime settings each component takes.

pub mod config;
