//! Terminal session engine.
//!
//! Owns shell processes on pseudoterminals, batches their output, strips
//! private OSC side-channel envelopes out of it, and shares each session
//! with any number of clients over a length-prefixed JSON transport.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod multiplexer;
pub mod osc;
pub mod pty;
pub mod registry;
pub mod scrollback;
pub mod transport;

pub use config::EngineConfig;
pub use connection::{serve_connection, ConnectionId};
pub use dispatch::Dispatcher;
pub use error::{ConfigError, EngineError, Result};
pub use osc::{SideChannelCommand, SideChannelEvent};
pub use pty::{Dimensions, SessionSpec};
pub use registry::{Registry, RegistryHandle, SessionEvent, SessionId, SessionInfo, SessionState, SessionStats};
pub use transport::Frame;
