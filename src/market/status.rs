use crate::market::types::ConnectionState;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

type StatusListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct BroadcasterInner {
    current: ConnectionState,
    next_listener_id: u64,
    listeners: Vec<(u64, StatusListener)>,
    watch_tx: watch::Sender<ConnectionState>,
}

/// Current connection health plus the callbacks observing it.
///
/// Clones share the same state. Callbacks run outside the internal lock, in the order the
/// changes were applied, and must not call back into `set_status`.
#[derive(Clone)]
pub struct ConnectionStatusBroadcaster {
    inner: Arc<Mutex<BroadcasterInner>>,
    delivery: Arc<Mutex<()>>,
}

impl Default for ConnectionStatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionStatusBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let readable = self.inner.lock();
        f.debug_struct("ConnectionStatusBroadcaster")
            .field("current", &readable.current)
            .field("listeners", &readable.listeners.len())
            .finish()
    }
}

impl ConnectionStatusBroadcaster {
    pub fn new() -> Self {
        let (watch_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Mutex::new(BroadcasterInner {
                current: ConnectionState::Disconnected,
                next_listener_id: 0,
                listeners: Vec::new(),
                watch_tx,
            })),
            delivery: Arc::new(Mutex::new(())),
        }
    }

    pub fn current(&self) -> ConnectionState {
        self.inner.lock().current
    }

    /// Returns true when the value changed and listeners were notified.
    pub fn set_status(&self, status: ConnectionState) -> bool {
        let _delivery = self.delivery.lock();
        let listeners: Vec<StatusListener> = {
            let mut writable = self.inner.lock();
            if writable.current == status {
                return false;
            }
            writable.current = status;
            writable.watch_tx.send_replace(status);
            writable
                .listeners
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect()
        };

        tracing::debug!(status = ?status, listeners = listeners.len(), "connection status changed");
        for listener in listeners {
            listener(status);
        }
        true
    }

    /// Delivers the current value to `listener` immediately, then every later change.
    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn subscribe<F>(&self, listener: F) -> StatusSubscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let _delivery = self.delivery.lock();
        let listener: StatusListener = Arc::new(listener);
        let (id, current) = {
            let mut writable = self.inner.lock();
            let id = writable.next_listener_id;
            writable.next_listener_id = writable.next_listener_id.wrapping_add(1);
            writable.listeners.push((id, Arc::clone(&listener)));
            (id, writable.current)
        };

        listener(current);

        StatusSubscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Async view of the same status for tasks that prefer awaiting changes.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.lock().watch_tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

pub struct StatusSubscription {
    id: u64,
    inner: Weak<Mutex<BroadcasterInner>>,
}

impl StatusSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_listener(
        broadcaster: &ConnectionStatusBroadcaster,
    ) -> (Arc<Mutex<Vec<ConnectionState>>>, StatusSubscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = broadcaster.subscribe(move |status| sink.lock().push(status));
        (seen, subscription)
    }

    #[test]
    fn new_subscriber_receives_current_value_synchronously() {
        let broadcaster = ConnectionStatusBroadcaster::new();
        broadcaster.set_status(ConnectionState::Connecting);

        let (seen, _subscription) = recording_listener(&broadcaster);

        assert_eq!(*seen.lock(), vec![ConnectionState::Connecting]);
    }

    #[test]
    fn repeated_status_notifies_once() {
        let broadcaster = ConnectionStatusBroadcaster::new();
        let (seen, _subscription) = recording_listener(&broadcaster);

        assert!(broadcaster.set_status(ConnectionState::Connected));
        assert!(!broadcaster.set_status(ConnectionState::Connected));

        assert_eq!(
            *seen.lock(),
            vec![ConnectionState::Disconnected, ConnectionState::Connected]
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let broadcaster = ConnectionStatusBroadcaster::new();
        let (seen, subscription) = recording_listener(&broadcaster);
        assert_eq!(broadcaster.listener_count(), 1);

        subscription.unsubscribe();
        broadcaster.set_status(ConnectionState::Reconnecting);

        assert_eq!(broadcaster.listener_count(), 0);
        assert_eq!(*seen.lock(), vec![ConnectionState::Disconnected]);
    }

    #[test]
    fn independent_instances_do_not_share_state() {
        let first = ConnectionStatusBroadcaster::new();
        let second = ConnectionStatusBroadcaster::new();

        first.set_status(ConnectionState::Connected);

        assert_eq!(first.current(), ConnectionState::Connected);
        assert_eq!(second.current(), ConnectionState::Disconnected);
    }

    #[test]
    fn clones_share_listeners_across_threads() {
        let broadcaster = ConnectionStatusBroadcaster::new();
        let (seen, _subscription) = recording_listener(&broadcaster);

        let writer = broadcaster.clone();
        std::thread::spawn(move || {
            writer.set_status(ConnectionState::Connecting);
            writer.set_status(ConnectionState::Connected);
        })
        .join()
        .expect("writer thread should finish");

        assert_eq!(
            *seen.lock(),
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected
            ]
        );
    }

    #[tokio::test]
    async fn watch_receiver_observes_changes() {
        let broadcaster = ConnectionStatusBroadcaster::new();
        let mut receiver = broadcaster.watch();

        broadcaster.set_status(ConnectionState::Reconnecting);
        receiver
            .changed()
            .await
            .expect("sender should still be alive");

        assert_eq!(*receiver.borrow(), ConnectionState::Reconnecting);
    }
}
