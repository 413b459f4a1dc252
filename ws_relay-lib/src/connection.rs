use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};

use crate::error::TransportError;
use crate::message::Payload;

/// Write half of a relayed connection, as handed over by the transport.
pub type PayloadSink = Pin<Box<dyn Sink<Payload, Error = TransportError> + Send>>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity. Ids are never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnId(u64);

impl ConnId {
    pub fn next() -> Self {
        ConnId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Point-in-time description of a connection, for health output and logs.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnId,
    pub peer: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    pub write_failures: u64,
}

/// A live client connection as seen by the relay.
///
/// Only the write side lives here: the read side is owned by the
/// connection's read loop and never shared. Writes from concurrent
/// broadcasts are serialized through the sink mutex, so frames never
/// interleave on the wire.
pub struct Connection {
    id: ConnId,
    peer: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    sink: Mutex<PayloadSink>,
    write_failures: AtomicU64,
}

impl Connection {
    pub fn new<S>(peer: Option<SocketAddr>, sink: S) -> Self
    where
        S: Sink<Payload, Error = TransportError> + Send + 'static,
    {
        Self {
            id: ConnId::next(),
            peer,
            connected_at: Utc::now(),
            sink: Mutex::new(Box::pin(sink)),
            write_failures: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Write one message, waiting for any in-flight write on this
    /// connection to finish first. A failure bumps `write_failures`.
    pub async fn write(&self, payload: Payload) -> Result<(), TransportError> {
        self.write_limited(payload, None).await
    }

    /// Like `write`, but also holds a permit from `limit` while sending.
    /// The permit is taken only after this connection's sink is ours, so
    /// writes queued behind a stuck one never sit on pool permits.
    pub async fn write_limited(
        &self,
        payload: Payload,
        limit: Option<&Semaphore>,
    ) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        let result = match limit {
            Some(limit) => match limit.acquire().await {
                Ok(_permit) => sink.send(payload).await,
                Err(_) => Err(TransportError::Write("write pool closed".into())),
            },
            None => sink.send(payload).await,
        };
        if result.is_err() {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            peer: self.peer,
            connected_at: self.connected_at,
            write_failures: self.write_failures(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}
