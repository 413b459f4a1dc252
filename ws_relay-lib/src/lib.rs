//! ws_relay-lib: connection registry and broadcast fan-out for a message relay

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod registry;

#[cfg(test)]
mod testing;

// re-exports for ergonomic imports:
pub use config::{DispatchConfig, ReadErrorPolicy, RelayConfig};
pub use connection::{ConnId, Connection, ConnectionInfo};
pub use dispatcher::{Disconnect, Dispatcher, Fanout};
pub use error::{ConfigError, TransportError};
pub use message::Payload;
pub use registry::ConnectionRegistry;
