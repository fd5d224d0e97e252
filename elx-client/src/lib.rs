//! ElectrumX protocol client.
//!
//! - [`electrumx`]: connection to one server, typed methods, notification
//!   feeds
//! - [`subscriptions`]: address watching on top of a connection
//! - [`config`]: network presets and connection settings

pub mod config;
pub mod electrumx;
pub mod subscriptions;
pub mod tracing;
