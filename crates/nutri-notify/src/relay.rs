//! Bridges broadcaster notifications into one UI session.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use metrics::gauge;
use nutri_core::{ChangeNotification, SessionId};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::broadcaster::{Broadcaster, NotificationListener, Subscription};
use crate::error::ListenerError;
use crate::metrics::SESSION_RELAYS_ACTIVE;

/// Session-level consumer callback. Decides for itself whether a change is
/// relevant to what the session is rendering.
pub type SessionCallback = Arc<dyn Fn(&Arc<ChangeNotification>) + Send + Sync>;

struct RelayState {
    active: bool,
    consumers: Vec<SessionCallback>,
}

struct RelayShared {
    session_id: SessionId,
    state: RwLock<RelayState>,
}

/// Listener registered with the broadcaster on behalf of a session.
struct RelayListener {
    name: String,
    shared: Arc<RelayShared>,
}

impl NotificationListener for RelayListener {
    fn name(&self) -> &str {
        &self.name
    }

    // The read guard is held while consumers run so that `stop` (which takes
    // the write guard) returns only after in-flight deliveries finish. It is
    // taken recursively: a consumer may publish again while `stop` waits.
    fn on_notification(&self, notification: &Arc<ChangeNotification>) -> Result<(), ListenerError> {
        let state = self.shared.state.read_recursive();
        if !state.active {
            return Ok(());
        }
        for consumer in &state.consumers {
            if catch_unwind(AssertUnwindSafe(|| consumer(notification))).is_err() {
                warn!(session_id = %self.shared.session_id, "session consumer panicked");
            }
        }
        Ok(())
    }
}

/// Per-session subscriber re-emitting every notification to the session's
/// consumers.
///
/// Consumers must not call `start`, `stop` or `on_change` on their own relay
/// from inside the callback.
pub struct SessionRelay {
    shared: Arc<RelayShared>,
    broadcaster: Arc<Broadcaster>,
    subscription: Mutex<Option<Subscription>>,
}

impl SessionRelay {
    pub fn new(session_id: SessionId, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            shared: Arc::new(RelayShared {
                session_id,
                state: RwLock::new(RelayState {
                    active: false,
                    consumers: Vec::new(),
                }),
            }),
            broadcaster,
            subscription: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.shared.session_id
    }

    /// Register a consumer. Consumers added while the relay runs receive
    /// subsequent notifications.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(&Arc<ChangeNotification>) + Send + Sync + 'static,
    {
        self.shared.state.write().consumers.push(Arc::new(callback));
    }

    /// Subscribe to the broadcaster. Returns `false` if already started.
    pub fn start(&self) -> bool {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            debug!(session_id = %self.shared.session_id, "relay already started");
            return false;
        }
        self.shared.state.write().active = true;
        let listener = Arc::new(RelayListener {
            name: format!("session:{}", self.shared.session_id),
            shared: Arc::clone(&self.shared),
        });
        *subscription = Some(self.broadcaster.subscribe_scoped(listener));
        gauge!(SESSION_RELAYS_ACTIVE).increment(1.0);
        debug!(session_id = %self.shared.session_id, "relay started");
        true
    }

    /// Unsubscribe from the broadcaster. Returns `false` if not running.
    ///
    /// Once this returns no consumer is invoked again, including by a publish
    /// that was already in progress.
    pub fn stop(&self) -> bool {
        let mut subscription = self.subscription.lock();
        self.shared.state.write().active = false;
        match subscription.take() {
            Some(sub) => {
                drop(sub);
                gauge!(SESSION_RELAYS_ACTIVE).decrement(1.0);
                debug!(session_id = %self.shared.session_id, "relay stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.subscription.lock().is_some()
    }
}

impl Drop for SessionRelay {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutri_core::{ChangeKind, PractitionerId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn notification() -> Arc<ChangeNotification> {
        Arc::new(ChangeNotification::new(
            "Client",
            42,
            ChangeKind::updated(),
            PractitionerId::from_raw("u-1"),
        ))
    }

    fn counting_relay(broadcaster: &Arc<Broadcaster>) -> (SessionRelay, Arc<AtomicUsize>) {
        let relay = SessionRelay::new(SessionId::new(), Arc::clone(broadcaster));
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        relay.on_change(move |_| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        });
        (relay, count)
    }

    #[test]
    fn start_is_idempotent() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (relay, count) = counting_relay(&broadcaster);

        assert!(relay.start());
        assert!(!relay.start());
        assert_eq!(broadcaster.subscriber_count(), 1);

        let _ = broadcaster.publish(&notification());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_without_start_is_noop() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (relay, _count) = counting_relay(&broadcaster);
        assert!(!relay.stop());
        assert!(!relay.is_active());
    }

    #[test]
    fn stop_twice_is_noop() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (relay, count) = counting_relay(&broadcaster);
        let _ = relay.start();
        assert!(relay.stop());
        assert!(!relay.stop());
        assert_eq!(broadcaster.subscriber_count(), 0);

        let _ = broadcaster.publish(&notification());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn forwards_exact_payload_to_every_consumer() {
        let broadcaster = Arc::new(Broadcaster::new());
        let relay = SessionRelay::new(SessionId::new(), Arc::clone(&broadcaster));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            relay.on_change(move |n| seen.lock().push(Arc::clone(n)));
        }
        let _ = relay.start();

        let n = notification();
        let _ = broadcaster.publish(&n);
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|s| Arc::ptr_eq(s, &n)));
    }

    #[test]
    fn no_practitioner_filtering_at_relay() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (relay, count) = counting_relay(&broadcaster);
        let _ = relay.start();
        for p in ["u-1", "u-2", ""] {
            let _ = broadcaster.publish(&Arc::new(ChangeNotification::new(
                "Appointment",
                1,
                ChangeKind::created(),
                PractitionerId::from_raw(p),
            )));
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn drop_unsubscribes() {
        let broadcaster = Arc::new(Broadcaster::new());
        {
            let (relay, _count) = counting_relay(&broadcaster);
            let _ = relay.start();
            assert_eq!(broadcaster.subscriber_count(), 1);
        }
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn restart_after_stop_resubscribes() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (relay, count) = counting_relay(&broadcaster);
        let _ = relay.start();
        let _ = relay.stop();
        assert!(relay.start());
        let _ = broadcaster.publish(&notification());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_consumer_does_not_starve_others() {
        let broadcaster = Arc::new(Broadcaster::new());
        let relay = SessionRelay::new(SessionId::new(), Arc::clone(&broadcaster));
        relay.on_change(|_| panic!("component disposed"));
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        relay.on_change(move |_| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        });
        let _ = relay.start();

        let report = broadcaster.publish(&notification());
        assert_eq!(report.failed, 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn two_sessions_then_one_stops() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (a, count_a) = counting_relay(&broadcaster);
        let (b, count_b) = counting_relay(&broadcaster);
        let _ = a.start();
        let _ = b.start();

        let _ = broadcaster.publish(&notification());
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);

        let _ = a.stop();
        let _ = broadcaster.publish(&notification());
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stop_waits_for_in_flight_delivery() {
        let broadcaster = Arc::new(Broadcaster::new());
        let relay = Arc::new(SessionRelay::new(SessionId::new(), Arc::clone(&broadcaster)));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let finished = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&finished);
        relay.on_change(move |_| {
            let _ = entered_tx.send(());
            let _ = release_rx.lock().recv();
            let _ = f.fetch_add(1, Ordering::SeqCst);
        });
        let _ = relay.start();

        let publisher = {
            let broadcaster = Arc::clone(&broadcaster);
            std::thread::spawn(move || broadcaster.publish(&notification()))
        };
        entered_rx.recv().unwrap();

        let stopper = {
            let relay = Arc::clone(&relay);
            std::thread::spawn(move || relay.stop())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!stopper.is_finished(), "stop must wait for the running consumer");

        release_tx.send(()).unwrap();
        assert!(stopper.join().unwrap());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        let _ = publisher.join().unwrap();
    }

    #[test]
    fn nested_publish_while_stopping_completes() {
        let broadcaster = Arc::new(Broadcaster::new());
        let relay = Arc::new(SessionRelay::new(SessionId::new(), Arc::clone(&broadcaster)));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let entered_tx = Mutex::new(entered_tx);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            let cascade = Arc::downgrade(&broadcaster);
            relay.on_change(move |_| {
                if calls.fetch_add(1, Ordering::SeqCst) > 0 {
                    return;
                }
                let _ = entered_tx.lock().send(());
                std::thread::sleep(std::time::Duration::from_millis(200));
                if let Some(broadcaster) = cascade.upgrade() {
                    let _ = broadcaster.publish(&notification());
                }
            });
        }
        let _ = relay.start();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let publisher = {
            let broadcaster = Arc::clone(&broadcaster);
            let done_tx = done_tx.clone();
            std::thread::spawn(move || {
                let _ = broadcaster.publish(&notification());
                let _ = done_tx.send("publish");
            })
        };
        entered_rx.recv().unwrap();
        let stopper = {
            let relay = Arc::clone(&relay);
            std::thread::spawn(move || {
                let _ = relay.stop();
                let _ = done_tx.send("stop");
            })
        };

        let timeout = std::time::Duration::from_secs(3);
        assert!(done_rx.recv_timeout(timeout).is_ok());
        assert!(done_rx.recv_timeout(timeout).is_ok());
        publisher.join().unwrap();
        stopper.join().unwrap();
        assert!(!relay.is_active());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
