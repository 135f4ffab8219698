// agent: Library entry point.
// Exposes modules for integration testing.

pub mod checksum;
pub mod config;
pub mod connection;
pub mod content_store;
pub mod device;
pub mod dispatcher;
pub mod events;
pub mod heartbeat;
pub mod identity;
pub mod metrics;
pub mod playback;
pub mod runtime;

pub use runtime::{Agent, AgentError};
