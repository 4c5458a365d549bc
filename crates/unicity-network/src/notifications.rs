//! Fan-out hub for network lifecycle notifications.
//!
//! Components hold an `Arc<NetworkNotifications>` and call [`NetworkNotifications::notify`].
//! Subscribers get a [`Subscription`] guard; dropping it unsubscribes.

use crate::peer::{ConnectionType, PeerId};
use crate::protocol::BlockHash;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Something happened to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkNotification {
    PeerConnected {
        peer: PeerId,
        addr: SocketAddr,
        connection_type: ConnectionType,
    },
    PeerDisconnected {
        peer: PeerId,
        addr: SocketAddr,
        /// Whether the address should be credited as good.
        mark_good: bool,
    },
    InvalidHeader {
        peer: PeerId,
        hash: BlockHash,
        reason: String,
    },
    Misbehavior {
        peer: PeerId,
        reason: String,
        score: i32,
    },
}

type Callback = Arc<dyn Fn(&NetworkNotification) + Send + Sync>;

#[derive(Default)]
pub struct NetworkNotifications {
    subscribers: Mutex<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
}

impl NetworkNotifications {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `callback`. It runs on the notifying thread, outside any hub lock.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&NetworkNotification) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, Arc::new(callback)));
        Subscription {
            id,
            hub: Arc::downgrade(self),
        }
    }

    /// Subscribe through an unbounded channel.
    pub fn subscribe_channel(
        self: &Arc<Self>,
    ) -> (Subscription, mpsc::UnboundedReceiver<NetworkNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.subscribe(move |n| {
            let _ = tx.send(n.clone());
        });
        (sub, rx)
    }

    pub fn notify(&self, notification: NetworkNotification) {
        let subscribers: Vec<Callback> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in subscribers {
            callback(&notification);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(sid, _)| *sid != id);
    }
}

/// Unsubscribes on drop.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    hub: Weak<NetworkNotifications>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn disconnected(id: u64) -> NetworkNotification {
        NetworkNotification::PeerDisconnected {
            peer: PeerId(id),
            addr: "10.0.0.1:9590".parse().unwrap(),
            mark_good: false,
        }
    }

    #[test]
    fn test_fan_out_and_unsubscribe() {
        let hub = NetworkNotifications::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        let ca = Arc::clone(&a);
        let sub_a = hub.subscribe(move |_| {
            ca.fetch_add(1, Ordering::SeqCst);
        });
        let cb = Arc::clone(&b);
        let _sub_b = hub.subscribe(move |_| {
            cb.fetch_add(1, Ordering::SeqCst);
        });

        hub.notify(disconnected(1));
        drop(sub_a);
        hub.notify(disconnected(2));

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 2);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn test_callback_may_subscribe_reentrantly() {
        let hub = NetworkNotifications::new();
        let inner_hub = Arc::clone(&hub);
        let held = Arc::new(Mutex::new(Vec::new()));
        let held_in = Arc::clone(&held);
        let _sub = hub.subscribe(move |_| {
            held_in.lock().push(inner_hub.subscribe(|_| {}));
        });
        hub.notify(disconnected(1));
        assert_eq!(hub.subscriber_count(), 2);
    }

    #[test]
    fn test_channel_subscription() {
        let hub = NetworkNotifications::new();
        let (_sub, mut rx) = hub.subscribe_channel();
        hub.notify(disconnected(3));
        assert_eq!(rx.try_recv().unwrap(), disconnected(3));
    }
}
