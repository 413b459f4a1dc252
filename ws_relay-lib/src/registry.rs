use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::{ConnId, Connection};

/// The set of connections currently eligible to receive broadcasts.
///
/// Every operation takes the lock for exactly one set operation.
/// `snapshot` copies the members out so a broadcast can iterate them
/// while joins and leaves keep mutating the set.
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: Mutex<HashMap<ConnId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `conn`. Returns `false` if it was already a member.
    pub fn add(&self, conn: Arc<Connection>) -> bool {
        let mut conns = self.conns.lock();
        if conns.contains_key(&conn.id()) {
            return false;
        }
        conns.insert(conn.id(), conn);
        true
    }

    /// Remove the connection with `id`. Removing an absent member is a
    /// no-op; returns whether anything was removed.
    pub fn remove(&self, id: ConnId) -> bool {
        self.conns.lock().remove(&id).is_some()
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.conns.lock().values().cloned().collect()
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.conns.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
