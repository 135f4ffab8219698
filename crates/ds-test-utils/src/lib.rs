// ds-test-utils: Shared test utilities for the display agent suite.
//
// Provides a mock controller (WebSocket server) and a mock content origin
// (HTTP server) so agent components can be exercised end to end.

pub mod content_server;
pub mod mock_controller;

pub use content_server::ContentServer;
pub use mock_controller::{MockController, Received};
