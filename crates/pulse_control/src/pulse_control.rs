//! Pulse Control - Plugin supervision for the telemetry pipeline
//!
//! This crate decides when plugin instances run:
//! - `Runner` turns subscription demand into start decisions
//! - `PluginRegistry` holds the running instances, pooled per plugin key
//! - `Monitor` periodically probes every running instance
//! - `IdAllocator` names instances
//!
//! Spawning processes, resolving metrics and knowing which plugins are
//! loaded are left to the collaborators in `external`.

pub use pulse_events;

mod available;
mod config;
mod error;
mod id;
mod monitor;
mod plugin;
mod registry;
mod runner;

pub mod external;

#[cfg(test)]
mod test_support;

pub use available::*;
pub use config::*;
pub use error::*;
pub use id::*;
pub use monitor::*;
pub use plugin::*;
pub use registry::*;
pub use runner::*;
