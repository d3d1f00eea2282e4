//! Process-wide fan-out of change notifications to in-process listeners.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use metrics::{counter, gauge};
use nutri_core::ChangeNotification;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ListenerError, NotifyError};
use crate::metrics::{
    NOTIFY_LISTENER_FAILURES_TOTAL, NOTIFY_PUBLISHED_TOTAL, NOTIFY_SUBSCRIBERS_ACTIVE,
};

/// Receives every notification published after it subscribed.
///
/// Callbacks run on the publisher's thread, so they should only hand the
/// notification off (signal a refresh, push to a queue) and return.
pub trait NotificationListener: Send + Sync {
    fn name(&self) -> &str;
    fn on_notification(&self, notification: &Arc<ChangeNotification>) -> Result<(), ListenerError>;
}

/// Adapts a closure into a [`NotificationListener`].
pub struct FnListener<F> {
    name: String,
    f: F,
}

impl<F> FnListener<F>
where
    F: Fn(&Arc<ChangeNotification>) -> Result<(), ListenerError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> NotificationListener for FnListener<F>
where
    F: Fn(&Arc<ChangeNotification>) -> Result<(), ListenerError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_notification(&self, notification: &Arc<ChangeNotification>) -> Result<(), ListenerError> {
        (self.f)(notification)
    }
}

/// Handle identifying one registration.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// Outcome of a single publish.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

struct ListenerEntry {
    id: SubscriptionId,
    listener: Arc<dyn NotificationListener>,
}

/// In-memory publish/subscribe hub.
///
/// Constructed once at startup and shared as `Arc<Broadcaster>`. The registry
/// lock is only held to copy the listener list; listeners are invoked after it
/// is released, so a listener may subscribe or unsubscribe from its callback.
pub struct Broadcaster {
    listeners: RwLock<Vec<ListenerEntry>>,
    next_id: AtomicU64,
    publish_count: AtomicU64,
    closed: AtomicBool,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            publish_count: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a listener for every future publish.
    ///
    /// After [`shutdown`](Self::shutdown) the listener is not registered; the
    /// returned id is still valid to pass to `unsubscribe`.
    pub fn subscribe(&self, listener: Arc<dyn NotificationListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write();
        if self.closed.load(Ordering::Acquire) {
            warn!(subscription = %id, listener = listener.name(), "subscribe after shutdown ignored");
            return id;
        }
        debug!(subscription = %id, listener = listener.name(), "listener subscribed");
        listeners.push(ListenerEntry { id, listener });
        gauge!(NOTIFY_SUBSCRIBERS_ACTIVE).set(listeners.len() as f64);
        id
    }

    /// Register a listener and tie its lifetime to the returned guard.
    pub fn subscribe_scoped(self: &Arc<Self>, listener: Arc<dyn NotificationListener>) -> Subscription {
        let id = self.subscribe(listener);
        Subscription {
            id,
            broadcaster: Arc::downgrade(self),
        }
    }

    /// Remove a listener. Unknown or already-removed ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        let removed = listeners.len() != before;
        if removed {
            debug!(subscription = %id, "listener unsubscribed");
            gauge!(NOTIFY_SUBSCRIBERS_ACTIVE).set(listeners.len() as f64);
        }
        removed
    }

    /// Invoke every currently registered listener with `notification`.
    ///
    /// A listener that errors or panics is logged and skipped; the rest still
    /// receive the notification.
    pub fn publish(&self, notification: &Arc<ChangeNotification>) -> PublishReport {
        let _ = self.publish_count.fetch_add(1, Ordering::Relaxed);
        counter!(NOTIFY_PUBLISHED_TOTAL).increment(1);

        let snapshot: Vec<(SubscriptionId, Arc<dyn NotificationListener>)> = self
            .listeners
            .read()
            .iter()
            .map(|entry| (entry.id, Arc::clone(&entry.listener)))
            .collect();

        let mut report = PublishReport::default();
        for (id, listener) in &snapshot {
            match invoke(listener.as_ref(), notification) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    counter!(NOTIFY_LISTENER_FAILURES_TOTAL).increment(1);
                    warn!(
                        subscription = %id,
                        error_kind = err.error_kind(),
                        error = %err,
                        "listener failed, continuing fan-out"
                    );
                }
            }
        }

        debug!(
            entity_type = %notification.entity_type(),
            entity_id = %notification.entity_id(),
            delivered = report.delivered,
            failed = report.failed,
            "published notification"
        );
        report
    }

    /// Drop every listener. Later publishes reach nobody and later subscribes
    /// are ignored.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let mut listeners = self.listeners.write();
        let dropped = listeners.len();
        listeners.clear();
        gauge!(NOTIFY_SUBSCRIBERS_ACTIVE).set(0.0);
        info!(dropped, "broadcaster shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Total number of publish calls.
    pub fn publish_count(&self) -> u64 {
        self.publish_count.load(Ordering::Relaxed)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

fn invoke(
    listener: &dyn NotificationListener,
    notification: &Arc<ChangeNotification>,
) -> Result<(), NotifyError> {
    match catch_unwind(AssertUnwindSafe(|| listener.on_notification(notification))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(NotifyError::Listener {
            listener: listener.name().to_string(),
            source,
        }),
        Err(_panic) => Err(NotifyError::ListenerPanicked(listener.name().to_string())),
    }
}

/// Registration guard returned by [`Broadcaster::subscribe_scoped`].
///
/// Unsubscribes on drop. Holds only a weak reference, so an outstanding guard
/// never keeps the broadcaster alive.
pub struct Subscription {
    id: SubscriptionId,
    broadcaster: Weak<Broadcaster>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            let _ = broadcaster.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutri_core::{ChangeKind, PractitionerId};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn notification(entity_id: i64) -> Arc<ChangeNotification> {
        Arc::new(ChangeNotification::new(
            "Client",
            entity_id,
            ChangeKind::updated(),
            PractitionerId::from_raw("u-1"),
        ))
    }

    /// Records every notification it sees.
    struct Recorder {
        name: String,
        seen: Mutex<Vec<Arc<ChangeNotification>>>,
    }

    impl Recorder {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<Arc<ChangeNotification>> {
            self.seen.lock().clone()
        }
    }

    impl NotificationListener for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_notification(&self, n: &Arc<ChangeNotification>) -> Result<(), ListenerError> {
            self.seen.lock().push(Arc::clone(n));
            Ok(())
        }
    }

    #[test]
    fn publish_with_no_subscribers() {
        let broadcaster = Broadcaster::new();
        let report = broadcaster.publish(&notification(1));
        assert_eq!(report, PublishReport::default());
        assert_eq!(broadcaster.publish_count(), 1);
    }

    #[test]
    fn every_listener_invoked_exactly_once() {
        let broadcaster = Broadcaster::new();
        let recorders: Vec<_> = (0..5).map(|i| Recorder::new(&format!("r{i}"))).collect();
        for r in &recorders {
            let _ = broadcaster.subscribe(r.clone());
        }

        let n = notification(42);
        let report = broadcaster.publish(&n);
        assert_eq!(report.delivered, 5);
        assert_eq!(report.failed, 0);

        for r in &recorders {
            let seen = r.seen();
            assert_eq!(seen.len(), 1);
            assert!(Arc::ptr_eq(&seen[0], &n), "listeners share the same allocation");
        }
    }

    #[test]
    fn late_subscriber_sees_no_earlier_notifications() {
        let broadcaster = Broadcaster::new();
        let _ = broadcaster.publish(&notification(1));

        let late = Recorder::new("late");
        let _ = broadcaster.subscribe(late.clone());
        let _ = broadcaster.publish(&notification(2));

        let seen = late.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].entity_id(), &nutri_core::EntityId::Int(2));
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let broadcaster = Broadcaster::new();
        let keep = Recorder::new("keep");
        let gone = Recorder::new("gone");
        let _ = broadcaster.subscribe(keep.clone());
        let id = broadcaster.subscribe(gone.clone());

        assert!(broadcaster.unsubscribe(id));
        assert!(!broadcaster.unsubscribe(id));
        assert!(!broadcaster.unsubscribe(SubscriptionId(9_999)));
        assert_eq!(broadcaster.subscriber_count(), 1);

        let _ = broadcaster.publish(&notification(1));
        assert_eq!(keep.seen().len(), 1);
        assert!(gone.seen().is_empty());
    }

    #[test]
    fn failing_listener_does_not_block_others() {
        let broadcaster = Broadcaster::new();
        let before = Recorder::new("before");
        let after = Recorder::new("after");
        let _ = broadcaster.subscribe(before.clone());
        let _ = broadcaster.subscribe(Arc::new(FnListener::new("failing", |_| {
            Err(ListenerError::new("render target disposed"))
        })));
        let _ = broadcaster.subscribe(after.clone());

        let report = broadcaster.publish(&notification(7));
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(before.seen().len(), 1);
        assert_eq!(after.seen().len(), 1);
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let broadcaster = Broadcaster::new();
        let before = Recorder::new("before");
        let after = Recorder::new("after");
        let _ = broadcaster.subscribe(before.clone());
        let _ = broadcaster.subscribe(Arc::new(FnListener::new("panicking", |_| {
            panic!("listener exploded")
        })));
        let _ = broadcaster.subscribe(after.clone());

        let report = broadcaster.publish(&notification(7));
        assert_eq!(report.failed, 1);
        assert_eq!(before.seen().len(), 1);
        assert_eq!(after.seen().len(), 1);
    }

    #[test]
    fn scoped_subscription_unsubscribes_on_drop() {
        let broadcaster = Arc::new(Broadcaster::new());
        let recorder = Recorder::new("scoped");
        {
            let sub = broadcaster.subscribe_scoped(recorder.clone());
            assert_eq!(broadcaster.subscriber_count(), 1);
            assert!(sub.id().to_string().starts_with("sub_"));
        }
        assert_eq!(broadcaster.subscriber_count(), 0);
        let _ = broadcaster.publish(&notification(1));
        assert!(recorder.seen().is_empty());
    }

    #[test]
    fn scoped_subscription_outliving_broadcaster_is_harmless() {
        let broadcaster = Arc::new(Broadcaster::new());
        let sub = broadcaster.subscribe_scoped(Recorder::new("orphan"));
        drop(broadcaster);
        drop(sub);
    }

    #[test]
    fn listener_may_unsubscribe_itself_during_publish() {
        let broadcaster = Arc::new(Broadcaster::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let b = Arc::downgrade(&broadcaster);
        let c = Arc::clone(&calls);
        let s = Arc::clone(&slot);
        let id = broadcaster.subscribe(Arc::new(FnListener::new("one-shot", move |_| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
            if let (Some(b), Some(id)) = (b.upgrade(), *s.lock()) {
                let _ = b.unsubscribe(id);
            }
            Ok(())
        })));
        *slot.lock() = Some(id);

        let _ = broadcaster.publish(&notification(1));
        let _ = broadcaster.publish(&notification(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn shutdown_drops_listeners_and_rejects_new_ones() {
        let broadcaster = Broadcaster::new();
        let recorder = Recorder::new("r");
        let _ = broadcaster.subscribe(recorder.clone());
        broadcaster.shutdown();
        assert!(broadcaster.is_shut_down());
        assert_eq!(broadcaster.subscriber_count(), 0);

        let id = broadcaster.subscribe(recorder.clone());
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert!(!broadcaster.unsubscribe(id));

        let report = broadcaster.publish(&notification(1));
        assert_eq!(report.delivered, 0);
        assert!(recorder.seen().is_empty());
    }

    #[test]
    fn concurrent_subscribe_publish_unsubscribe() {
        let broadcaster = Arc::new(Broadcaster::new());
        let total = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for t in 0..8 {
            let broadcaster = Arc::clone(&broadcaster);
            let total = Arc::clone(&total);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let total = Arc::clone(&total);
                    let id = broadcaster.subscribe(Arc::new(FnListener::new(
                        format!("t{t}-{i}"),
                        move |_| {
                            let _ = total.fetch_add(1, Ordering::Relaxed);
                            Ok(())
                        },
                    )));
                    let _ = broadcaster.publish(&notification(i));
                    assert!(broadcaster.unsubscribe(id));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(broadcaster.subscriber_count(), 0);
        assert_eq!(broadcaster.publish_count(), 400);
        assert!(total.load(Ordering::Relaxed) >= 400);
    }
}
