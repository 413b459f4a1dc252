use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use futures::{Sink, Stream, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::{DispatchConfig, ReadErrorPolicy};
use crate::connection::{ConnId, Connection};
use crate::error::TransportError;
use crate::message::Payload;
use crate::registry::ConnectionRegistry;

/// Why a connection's read loop stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disconnect {
    /// Peer closed cleanly, or the inbound stream ended.
    Closed,
    /// A read fault ended the loop under `ReadErrorPolicy::Disconnect`.
    ReadError(TransportError),
}

/// Handle to the writes spawned by one `Dispatcher::broadcast` call.
#[derive(Debug)]
pub struct Fanout {
    recipients: Vec<ConnId>,
    writes: Vec<JoinHandle<()>>,
}

impl Fanout {
    /// Connections this message was addressed to.
    pub fn recipients(&self) -> &[ConnId] {
        &self.recipients
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    /// Wait until every write has finished, successfully or not.
    pub async fn wait(self) {
        for write in self.writes {
            if let Err(e) = write.await {
                error!("Broadcast write task failed: {}", e);
            }
        }
    }
}

/// Owns the registry and fans every inbound message out to the other
/// live connections. Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    config: DispatchConfig,
    write_limit: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        let write_limit = config
            .max_concurrent_writes
            .map(|n| Arc::new(Semaphore::new(n)));
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            config,
            write_limit,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Wrap a freshly upgraded transport's write half and make it
    /// eligible for broadcasts.
    pub fn register<S>(&self, peer: Option<SocketAddr>, sink: S) -> Arc<Connection>
    where
        S: Sink<Payload, Error = TransportError> + Send + 'static,
    {
        let conn = Arc::new(Connection::new(peer, sink));
        self.registry.add(conn.clone());
        info!(
            "Client {} connected from {} ({} online)",
            conn.id(),
            conn.peer()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unknown".into()),
            self.registry.len()
        );
        conn
    }

    /// Register a connection, relay everything it sends, and deregister it
    /// once it goes away.
    pub async fn serve<S, St>(&self, peer: Option<SocketAddr>, sink: S, inbound: St) -> Disconnect
    where
        S: Sink<Payload, Error = TransportError> + Send + 'static,
        St: Stream<Item = Result<Payload, TransportError>>,
    {
        let conn = self.register(peer, sink);
        self.run(conn, inbound).await
    }

    /// Read loop for one connection. This is the only reader of `inbound`.
    /// Returns after the connection has been removed from the registry.
    pub async fn run<St>(&self, conn: Arc<Connection>, inbound: St) -> Disconnect
    where
        St: Stream<Item = Result<Payload, TransportError>>,
    {
        let mut inbound = std::pin::pin!(inbound);

        let reason = loop {
            match inbound.next().await {
                Some(Ok(payload)) => {
                    debug!(
                        "{} sent {} bytes ({})",
                        conn.id(),
                        payload.len(),
                        payload.kind()
                    );
                    self.broadcast(conn.id(), payload);
                }
                None => break Disconnect::Closed,
                Some(Err(e)) if e.is_closed() => break Disconnect::Closed,
                Some(Err(e)) => match self.config.read_errors {
                    ReadErrorPolicy::Tolerate => {
                        warn!("Read error on {}: {}", conn.id(), e);
                    }
                    ReadErrorPolicy::Disconnect => {
                        error!("Read error on {}, dropping connection: {}", conn.id(), e);
                        break Disconnect::ReadError(e);
                    }
                },
            }
        };

        self.registry.remove(conn.id());
        let online = (Utc::now() - conn.connected_at()).num_seconds();
        info!(
            "Client {} disconnected after {}s ({} online)",
            conn.id(),
            online,
            self.registry.len()
        );
        reason
    }

    /// Send `payload` to every connection registered right now, one
    /// spawned write per recipient. Returns without waiting for writes.
    ///
    /// `from` is skipped unless `echo_to_sender` is set. A failed write is
    /// logged and counted on its connection; it neither affects other
    /// recipients nor deregisters anyone.
    pub fn broadcast(&self, from: ConnId, payload: Payload) -> Fanout {
        let echo = self.config.echo_to_sender;
        let targets: Vec<Arc<Connection>> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|conn| echo || conn.id() != from)
            .collect();

        let recipients = targets.iter().map(|conn| conn.id()).collect();
        let writes = targets
            .into_iter()
            .map(|conn| {
                let payload = payload.clone();
                let limit = self.write_limit.clone();
                tokio::spawn(async move {
                    if let Err(e) = conn.write_limited(payload, limit.as_deref()).await {
                        warn!("Write to {} failed: {}", conn.id(), e);
                    }
                })
            })
            .collect();

        Fanout { recipients, writes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{channel_connection, failing_connection, stalled_connection};
    use futures::channel::mpsc;
    use std::time::Duration;
    use tokio::time::timeout;

    type Inbound = mpsc::UnboundedSender<Result<Payload, TransportError>>;

    fn dispatcher(echo_to_sender: bool) -> Dispatcher {
        Dispatcher::new(DispatchConfig {
            echo_to_sender,
            ..DispatchConfig::default()
        })
    }

    /// Register a channel-backed connection and spawn its read loop.
    fn join(
        dispatcher: &Dispatcher,
    ) -> (
        Arc<Connection>,
        Inbound,
        mpsc::UnboundedReceiver<Payload>,
        JoinHandle<Disconnect>,
    ) {
        let (conn, outbound) = channel_connection();
        dispatcher.registry().add(conn.clone());
        let (tx, rx) = mpsc::unbounded();
        let d = dispatcher.clone();
        let c = conn.clone();
        let task = tokio::spawn(async move { d.run(c, rx).await });
        (conn, tx, outbound, task)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Payload>) -> Payload {
        timeout(Duration::from_secs(1), rx.next())
            .await
            .expect("timed out waiting for a message")
            .expect("outbound channel closed")
    }

    /// Nothing should arrive on `rx` beyond what is already buffered.
    fn assert_idle(rx: &mut mpsc::UnboundedReceiver<Payload>) {
        assert!(rx.try_next().is_err(), "unexpected message");
    }

    async fn settle(dispatcher: &Dispatcher, expected: usize) {
        timeout(Duration::from_secs(1), async {
            while dispatcher.registry().len() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry never settled");
    }

    #[tokio::test]
    async fn hello_reaches_the_other_two() {
        let d = dispatcher(false);
        let (_c1, tx1, mut out1, _) = join(&d);
        let (_c2, _tx2, mut out2, _) = join(&d);
        let (_c3, _tx3, mut out3, _) = join(&d);

        tx1.unbounded_send(Ok(Payload::from("hello"))).unwrap();

        assert_eq!(recv(&mut out2).await, Payload::from("hello"));
        assert_eq!(recv(&mut out3).await, Payload::from("hello"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_idle(&mut out1);
        assert_idle(&mut out2);
        assert_idle(&mut out3);
    }

    #[tokio::test]
    async fn sender_gets_echo_when_enabled() {
        let d = dispatcher(true);
        let (_c1, tx1, mut out1, _) = join(&d);
        let (_c2, _tx2, mut out2, _) = join(&d);

        tx1.unbounded_send(Ok(Payload::from(vec![1u8, 2, 3])))
            .unwrap();

        assert_eq!(recv(&mut out1).await, Payload::Binary(vec![1, 2, 3]));
        assert_eq!(recv(&mut out2).await, Payload::Binary(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn clean_close_deregisters() {
        let d = dispatcher(false);
        let (c1, _tx1, _out1, _) = join(&d);
        let (c2, tx2, _out2, task2) = join(&d);

        tx2.unbounded_send(Err(TransportError::ConnectionClosed))
            .unwrap();
        assert_eq!(task2.await.unwrap(), Disconnect::Closed);
        assert!(!d.registry().contains(c2.id()));

        let fanout = d.broadcast(c1.id(), Payload::from("ping"));
        assert!(fanout.is_empty());
        fanout.wait().await;

        let members: Vec<_> = d.registry().snapshot().iter().map(|c| c.id()).collect();
        assert_eq!(members, vec![c1.id()]);
    }

    #[tokio::test]
    async fn stream_end_counts_as_close() {
        let d = dispatcher(true);
        let (c1, tx1, _out1, task1) = join(&d);
        drop(tx1);
        assert_eq!(task1.await.unwrap(), Disconnect::Closed);
        assert!(!d.registry().contains(c1.id()));
        assert!(d.registry().is_empty());
    }

    #[tokio::test]
    async fn read_error_disconnects_by_default() {
        let d = dispatcher(true);
        let (c1, tx1, _out1, task1) = join(&d);
        let fault = TransportError::Connection("reset".into());
        tx1.unbounded_send(Err(fault.clone())).unwrap();
        assert_eq!(task1.await.unwrap(), Disconnect::ReadError(fault));
        assert!(!d.registry().contains(c1.id()));
    }

    #[tokio::test]
    async fn tolerated_read_error_keeps_reading() {
        let d = Dispatcher::new(DispatchConfig {
            echo_to_sender: false,
            read_errors: ReadErrorPolicy::Tolerate,
            max_concurrent_writes: None,
        });
        let (c1, tx1, _out1, task1) = join(&d);
        let (_c2, _tx2, mut out2, _) = join(&d);

        tx1.unbounded_send(Err(TransportError::Connection("glitch".into())))
            .unwrap();
        tx1.unbounded_send(Ok(Payload::from("still here"))).unwrap();

        assert_eq!(recv(&mut out2).await, Payload::from("still here"));
        assert!(d.registry().contains(c1.id()));
        assert!(!task1.is_finished());

        tx1.unbounded_send(Err(TransportError::ConnectionClosed))
            .unwrap();
        assert_eq!(task1.await.unwrap(), Disconnect::Closed);
    }

    #[tokio::test]
    async fn write_error_does_not_affect_other_recipients() {
        let d = dispatcher(false);
        let (sender, _rx) = channel_connection();
        let broken = failing_connection();
        let (healthy, mut out) = channel_connection();
        for conn in [&sender, &broken, &healthy] {
            d.registry().add(conn.clone());
        }

        let fanout = d.broadcast(sender.id(), Payload::from("hi"));
        assert_eq!(fanout.len(), 2);
        fanout.wait().await;

        assert_eq!(recv(&mut out).await, Payload::from("hi"));
        assert_eq!(broken.write_failures(), 1);
        assert!(d.registry().contains(broken.id()));
    }

    #[tokio::test]
    async fn stalled_recipient_does_not_block_others() {
        let d = dispatcher(false);
        let (sender, _rx) = channel_connection();
        let stalled = stalled_connection();
        let (healthy, mut out) = channel_connection();
        for conn in [&sender, &stalled, &healthy] {
            d.registry().add(conn.clone());
        }

        d.broadcast(sender.id(), Payload::from("one"));
        d.broadcast(sender.id(), Payload::from("two"));

        let mut got = vec![recv(&mut out).await, recv(&mut out).await];
        got.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
        assert_eq!(got, vec![Payload::from("one"), Payload::from("two")]);
    }

    #[tokio::test]
    async fn fanout_targets_the_snapshot_only() {
        let d = dispatcher(true);
        let (early, mut early_out) = channel_connection();
        d.registry().add(early.clone());

        let fanout = d.broadcast(early.id(), Payload::from("first"));
        let (late, mut late_out) = channel_connection();
        d.registry().add(late.clone());
        d.registry().remove(early.id());
        assert_eq!(fanout.recipients(), &[early.id()]);
        fanout.wait().await;

        assert_eq!(recv(&mut early_out).await, Payload::from("first"));
        assert_idle(&mut late_out);
    }

    #[tokio::test]
    async fn bounded_writes_still_reach_everyone() {
        let d = Dispatcher::new(DispatchConfig {
            echo_to_sender: true,
            read_errors: ReadErrorPolicy::Disconnect,
            max_concurrent_writes: Some(1),
        });
        let conns: Vec<_> = (0..5).map(|_| channel_connection()).collect();
        for (conn, _) in &conns {
            d.registry().add(conn.clone());
        }

        let fanout = d.broadcast(conns[0].0.id(), Payload::from("x"));
        assert_eq!(fanout.len(), 5);
        fanout.wait().await;

        for (_, mut out) in conns {
            assert_eq!(recv(&mut out).await, Payload::from("x"));
        }
    }

    #[tokio::test]
    async fn stalled_recipient_cannot_exhaust_bounded_writes() {
        let d = Dispatcher::new(DispatchConfig {
            echo_to_sender: false,
            read_errors: ReadErrorPolicy::Disconnect,
            max_concurrent_writes: Some(2),
        });
        let (sender, _rx) = channel_connection();
        let stalled = stalled_connection();
        let (healthy, mut out) = channel_connection();
        for conn in [&sender, &stalled, &healthy] {
            d.registry().add(conn.clone());
        }

        for i in 0..5 {
            d.broadcast(sender.id(), Payload::Text(i.to_string()));
        }

        let mut got = Vec::new();
        for _ in 0..5 {
            got.push(recv(&mut out).await);
        }
        got.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
        let expected: Vec<_> = (0..5).map(|i| Payload::Text(i.to_string())).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn serve_registers_and_cleans_up() {
        let d = dispatcher(true);
        let (out_tx, mut out_rx) = mpsc::unbounded::<Payload>();
        let sink = futures::SinkExt::sink_map_err(out_tx, |e| TransportError::Write(e.to_string()));
        let (in_tx, in_rx) = mpsc::unbounded();

        let served = tokio::spawn({
            let d = d.clone();
            async move { d.serve(None, sink, in_rx).await }
        });
        settle(&d, 1).await;

        in_tx.unbounded_send(Ok(Payload::from("echo"))).unwrap();
        assert_eq!(recv(&mut out_rx).await, Payload::from("echo"));

        drop(in_tx);
        assert_eq!(served.await.unwrap(), Disconnect::Closed);
        settle(&d, 0).await;
    }
}
