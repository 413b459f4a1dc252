//! In-memory transports for unit tests.

use std::sync::Arc;

use futures::channel::mpsc;
use futures::{SinkExt, future, sink};

use crate::connection::Connection;
use crate::error::TransportError;
use crate::message::Payload;

/// A connection whose writes land in the returned receiver.
pub fn channel_connection() -> (Arc<Connection>, mpsc::UnboundedReceiver<Payload>) {
    let (tx, rx) = mpsc::unbounded();
    let sink = tx.sink_map_err(|e| TransportError::Write(e.to_string()));
    (Arc::new(Connection::new(None, sink)), rx)
}

/// A connection whose peer has gone away: every write fails.
pub fn failing_connection() -> Arc<Connection> {
    let (conn, rx) = channel_connection();
    drop(rx);
    conn
}

/// A connection whose writes never complete.
pub fn stalled_connection() -> Arc<Connection> {
    let sink = sink::unfold((), |(), _payload: Payload| {
        future::pending::<Result<(), TransportError>>()
    });
    Arc::new(Connection::new(None, sink))
}
