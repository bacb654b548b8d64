//! Notification bus over PostgreSQL LISTEN/NOTIFY.
//!
//! One dedicated connection owns every `LISTEN`; a registry fans received
//! notifications out to per-listener channels. On connection loss each
//! listener gets exactly one `healthy = false` marker, the driver reconnects
//! and re-issues its `LISTEN`s, and delivery resumes with healthy
//! notifications. Listener streams end only when the bus (or the listener)
//! is dropped.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio_postgres::tls::NoTlsStream;
use tokio_postgres::{AsyncMessage, Connection, NoTls, Socket};

use crate::error::{EngineError, Result};

/// Buffer size for `QueuePolicy::Drop` listeners; overflow is discarded.
const DROP_BUFFER: usize = 32;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub payload: String,
    /// `false` marks a dropped-and-resumed connection; consumers must
    /// discard state derived from earlier notifications.
    pub healthy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Buffer without bound; nothing is dropped.
    Queue,
    /// Bounded buffer; overflow is discarded.
    Drop,
}

enum ListenerTx {
    Queue(mpsc::UnboundedSender<Notification>),
    Drop(mpsc::Sender<Notification>),
}

impl ListenerTx {
    /// Returns `false` once the receiving side is gone.
    fn send(&self, notification: Notification) -> bool {
        match self {
            ListenerTx::Queue(tx) => tx.send(notification).is_ok(),
            ListenerTx::Drop(tx) => match tx.try_send(notification) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
        }
    }
}

enum ListenerRx {
    Queue(mpsc::UnboundedReceiver<Notification>),
    Drop(mpsc::Receiver<Notification>),
}

/// Receiving half of a bus subscription.
pub struct BusListener {
    rx: ListenerRx,
}

impl BusListener {
    /// Receive the next notification; `None` when the bus is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        match &mut self.rx {
            ListenerRx::Queue(rx) => rx.recv().await,
            ListenerRx::Drop(rx) => rx.recv().await,
        }
    }

    /// Non-blocking receive, for callers that poll between sweeps.
    pub fn try_recv(&mut self) -> Option<Notification> {
        match &mut self.rx {
            ListenerRx::Queue(rx) => rx.try_recv().ok(),
            ListenerRx::Drop(rx) => rx.try_recv().ok(),
        }
    }
}

/// Channel-name keyed listener fan-out. Independent of the connection so
/// dispatch and health marking are testable on their own.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: StdRwLock<HashMap<String, Vec<ListenerTx>>>,
}

impl ListenerRegistry {
    pub fn register(&self, channel: &str, policy: QueuePolicy) -> BusListener {
        let (tx, rx) = match policy {
            QueuePolicy::Queue => {
                let (tx, rx) = mpsc::unbounded_channel();
                (ListenerTx::Queue(tx), ListenerRx::Queue(rx))
            }
            QueuePolicy::Drop => {
                let (tx, rx) = mpsc::channel(DROP_BUFFER);
                (ListenerTx::Drop(tx), ListenerRx::Drop(rx))
            }
        };
        self.listeners
            .write()
            .expect("listener registry poisoned")
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        BusListener { rx }
    }

    pub fn channels(&self) -> Vec<String> {
        self.listeners
            .read()
            .expect("listener registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Deliver a payload to every listener of `channel`, pruning closed ones.
    pub fn dispatch(&self, channel: &str, payload: &str) {
        let mut map = self.listeners.write().expect("listener registry poisoned");
        if let Some(slots) = map.get_mut(channel) {
            slots.retain(|tx| {
                tx.send(Notification {
                    payload: payload.to_string(),
                    healthy: true,
                })
            });
            if slots.is_empty() {
                map.remove(channel);
            }
        }
    }

    /// Emit one unhealthy marker to every listener on every channel.
    pub fn mark_unhealthy(&self) {
        let mut map = self.listeners.write().expect("listener registry poisoned");
        for slots in map.values_mut() {
            slots.retain(|tx| {
                tx.send(Notification {
                    payload: String::new(),
                    healthy: false,
                })
            });
        }
        map.retain(|_, slots| !slots.is_empty());
    }

    #[cfg(test)]
    fn listener_count(&self, channel: &str) -> usize {
        self.listeners
            .read()
            .expect("listener registry poisoned")
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

struct BusInner {
    conninfo: String,
    registry: ListenerRegistry,
    client: RwLock<Option<tokio_postgres::Client>>,
}

/// Handle to the notification bus. Cheap to clone; all clones share the
/// single LISTEN connection.
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    /// Connect to the database and spawn the connection driver.
    pub async fn connect(conninfo: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(conninfo, NoTls).await?;

        let inner = Arc::new(BusInner {
            conninfo: conninfo.to_string(),
            registry: ListenerRegistry::default(),
            client: RwLock::new(Some(client)),
        });

        tokio::spawn(run_driver(inner.clone(), connection));

        Ok(NotificationBus { inner })
    }

    /// Subscribe to a channel. The returned stream is infinite; it yields
    /// `healthy = false` markers around reconnects and ends only when the
    /// listener or the bus is dropped.
    pub async fn listen(&self, channel: &str, policy: QueuePolicy) -> Result<BusListener> {
        let listener = self.inner.registry.register(channel, policy);
        let guard = self.inner.client.read().await;
        if let Some(client) = guard.as_ref() {
            client
                .batch_execute(&format!("LISTEN {}", quote_ident(channel)))
                .await?;
        }
        // Not connected: the driver re-issues LISTEN for every registered
        // channel once the connection is back.
        Ok(listener)
    }

    /// Post a notification. Delivery is at-least-once across healthy periods.
    pub async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        let guard = self.inner.client.read().await;
        let client = guard
            .as_ref()
            .ok_or_else(|| EngineError::Transport("notification bus is not connected".to_string()))?;
        client
            .execute("SELECT pg_notify($1, $2)", &[&channel, &payload])
            .await?;
        Ok(())
    }
}

async fn run_driver(inner: Arc<BusInner>, first: Connection<Socket, NoTlsStream>) {
    let mut connection = Some(first);
    loop {
        let conn = match connection.take() {
            Some(conn) => conn,
            None => reconnect(&inner).await,
        };

        let mut conn = conn;
        let mut messages = futures::stream::poll_fn(move |cx| conn.poll_message(cx));
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notification(n)) => {
                    inner.registry.dispatch(n.channel(), n.payload());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Notification bus connection error: {e}");
                    break;
                }
            }
        }

        // Connection lost: reset derived state exactly once, then reconnect.
        *inner.client.write().await = None;
        inner.registry.mark_unhealthy();
        crate::metrics::bus_reconnect();
    }
}

async fn reconnect(inner: &Arc<BusInner>) -> Connection<Socket, NoTlsStream> {
    loop {
        tokio::time::sleep(RECONNECT_DELAY).await;
        let (client, connection) = match tokio_postgres::connect(&inner.conninfo, NoTls).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("Notification bus reconnect failed: {e}");
                continue;
            }
        };

        let mut relisten_failed = false;
        for channel in inner.registry.channels() {
            if let Err(e) = client
                .batch_execute(&format!("LISTEN {}", quote_ident(&channel)))
                .await
            {
                tracing::warn!(channel = %channel, "Re-LISTEN failed after reconnect: {e}");
                relisten_failed = true;
                break;
            }
        }
        if relisten_failed {
            continue;
        }

        *inner.client.write().await = Some(client);
        tracing::info!("Notification bus reconnected");
        return connection;
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_listener_receives_in_order() {
        let registry = ListenerRegistry::default();
        let mut listener = registry.register("events", QueuePolicy::Queue);

        registry.dispatch("events", "one");
        registry.dispatch("events", "two");
        registry.dispatch("other", "elsewhere");

        assert_eq!(listener.try_recv().unwrap().payload, "one");
        assert_eq!(listener.try_recv().unwrap().payload, "two");
        assert!(listener.try_recv().is_none());
    }

    #[tokio::test]
    async fn drop_listener_discards_overflow() {
        let registry = ListenerRegistry::default();
        let mut listener = registry.register("scan", QueuePolicy::Drop);

        for i in 0..DROP_BUFFER + 8 {
            registry.dispatch("scan", &i.to_string());
        }

        let mut received = 0;
        while listener.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, DROP_BUFFER);
    }

    #[tokio::test]
    async fn unhealthy_marker_reaches_every_listener() {
        let registry = ListenerRegistry::default();
        let mut a = registry.register("events", QueuePolicy::Queue);
        let mut b = registry.register("scan", QueuePolicy::Queue);

        registry.dispatch("events", "before");
        registry.mark_unhealthy();

        assert!(a.try_recv().unwrap().healthy);
        let marker = a.try_recv().unwrap();
        assert!(!marker.healthy);
        assert!(!b.try_recv().unwrap().healthy);
    }

    #[tokio::test]
    async fn closed_listeners_are_pruned() {
        let registry = ListenerRegistry::default();
        let listener = registry.register("events", QueuePolicy::Queue);
        assert_eq!(registry.listener_count("events"), 1);

        drop(listener);
        registry.dispatch("events", "anyone");
        assert_eq!(registry.listener_count("events"), 0);
    }

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("resource_scan_5"), "\"resource_scan_5\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
