//! Subscriber fan-out with per-subscriber coalescing.
//!
//! Each subscription owns an inbound channel, a pending buffer, and a
//! capacity-1 dirty signal. One task drains the inbound channel into the
//! buffer; a second forwards the buffer as a single batch whenever the
//! dirty edge fires. Bursts coalesce into fewer batches while a consumer is
//! slow, and nothing is dropped: memory is the only bound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;

use crate::watch::JobSummaryEvent;

type SubscriberMap = Arc<RwLock<HashMap<u64, mpsc::UnboundedSender<Vec<JobSummaryEvent>>>>>;

/// The set of live subscriptions. Publishing takes the read lock;
/// subscribe, unsubscribe, and terminate take the write lock.
pub struct SubscriberSet {
    subscribers: SubscriberMap,
    next_id: AtomicU64,
}

impl Default for SubscriberSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberSet {
    pub fn new() -> Self {
        SubscriberSet {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers
            .read()
            .expect("subscriber set poisoned")
            .is_empty()
    }

    /// Register a subscription and spawn its two worker tasks. Dropping the
    /// returned handle unsubscribes and tears both tasks down.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .expect("subscriber set poisoned")
            .insert(id, inbound_tx);

        let pending = Arc::new(Mutex::new(Vec::new()));
        let (dirty_tx, dirty_rx) = mpsc::channel(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(1);

        tokio::spawn(watch_events(inbound_rx, pending.clone(), dirty_tx));
        tokio::spawn(send_events(dirty_rx, pending, outbound_tx));

        Subscription {
            rx: outbound_rx,
            _guard: SubscriptionGuard {
                id,
                subscribers: self.subscribers.clone(),
            },
        }
    }

    /// Deliver events to every subscriber's inbound channel.
    pub fn publish(&self, events: Vec<JobSummaryEvent>) {
        let mut dead = Vec::new();
        {
            let map = self.subscribers.read().expect("subscriber set poisoned");
            for (id, tx) in map.iter() {
                if tx.send(events.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut map = self.subscribers.write().expect("subscriber set poisoned");
            for id in dead {
                map.remove(&id);
            }
        }
    }

    /// Close every subscription. Used when the bus reports an unhealthy
    /// connection: derived state is stale and subscribers must re-subscribe.
    pub fn terminate_all(&self) {
        self.subscribers
            .write()
            .expect("subscriber set poisoned")
            .clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.subscribers
            .read()
            .expect("subscriber set poisoned")
            .len()
    }
}

/// A live dashboard subscription. Batches arrive in commit order; the
/// stream ends when the watcher terminates subscribers or the subscription
/// is dropped.
pub struct Subscription {
    rx: mpsc::Receiver<Vec<JobSummaryEvent>>,
    _guard: SubscriptionGuard,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Vec<JobSummaryEvent>> {
        self.rx.recv().await
    }
}

struct SubscriptionGuard {
    id: u64,
    subscribers: SubscriberMap,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.subscribers
            .write()
            .expect("subscriber set poisoned")
            .remove(&self.id);
    }
}

async fn watch_events(
    mut inbound: mpsc::UnboundedReceiver<Vec<JobSummaryEvent>>,
    pending: Arc<Mutex<Vec<JobSummaryEvent>>>,
    dirty: mpsc::Sender<()>,
) {
    while let Some(events) = inbound.recv().await {
        let mut buffer = pending.lock().expect("pending buffer poisoned");
        buffer.extend(events);
        if !buffer.is_empty() {
            // non-blocking edge; a signal already in flight covers us
            let _ = dirty.try_send(());
        }
    }
    // inbound closed: dirty drops with us, which ends send_events
}

async fn send_events(
    mut dirty: mpsc::Receiver<()>,
    pending: Arc<Mutex<Vec<JobSummaryEvent>>>,
    outbound: mpsc::Sender<Vec<JobSummaryEvent>>,
) {
    while dirty.recv().await.is_some() {
        let batch = {
            let mut buffer = pending.lock().expect("pending buffer poisoned");
            std::mem::take(&mut *buffer)
        };
        if batch.is_empty() {
            continue;
        }
        if outbound.send(batch).await.is_err() {
            // consumer dropped the subscription
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::EventType;
    use tokio::time::{timeout, Duration};

    fn event(id: i64) -> JobSummaryEvent {
        JobSummaryEvent {
            id,
            event_type: EventType::Delete,
            job: None,
        }
    }

    #[tokio::test]
    async fn burst_coalesces_without_losing_or_reordering_events() {
        let set = SubscriberSet::new();
        let mut subscription = set.subscribe();

        let total = 20;
        for i in 0..total {
            set.publish(vec![event(i)]);
        }

        let mut received = Vec::new();
        let mut batches = 0;
        while received.len() < total as usize {
            let batch = timeout(Duration::from_secs(1), subscription.recv())
                .await
                .expect("timed out waiting for batch")
                .expect("subscription closed early");
            assert!(!batch.is_empty());
            batches += 1;
            received.extend(batch);
        }

        assert!(batches >= 1 && batches <= total as usize);
        let ids: Vec<i64> = received.iter().map(|e| e.id).collect();
        assert_eq!(ids, (0..total).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_publish() {
        let set = SubscriberSet::new();
        let mut first = set.subscribe();
        let mut second = set.subscribe();
        assert_eq!(set.len(), 2);

        set.publish(vec![event(1), event(2)]);

        for subscription in [&mut first, &mut second] {
            let batch = timeout(Duration::from_secs(1), subscription.recv())
                .await
                .expect("timed out")
                .expect("closed");
            assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);
        }
    }

    #[tokio::test]
    async fn terminate_closes_subscriber_streams() {
        let set = SubscriberSet::new();
        let mut subscription = set.subscribe();

        set.terminate_all();
        assert!(set.is_empty());

        let closed = timeout(Duration::from_secs(1), subscription.recv())
            .await
            .expect("timed out waiting for close");
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn dropping_a_subscription_unsubscribes() {
        let set = SubscriberSet::new();
        let subscription = set.subscribe();
        assert_eq!(set.len(), 1);

        drop(subscription);
        assert_eq!(set.len(), 0);
        // publishing to nobody is a no-op
        set.publish(vec![event(9)]);
    }
}
