//! Single ingress for domain services announcing committed changes.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use metrics::counter;
use nutri_core::ChangeNotification;
use tracing::{debug, instrument, warn};

use crate::broadcaster::Broadcaster;
use crate::error::NotifyError;
use crate::groups::{GroupManager, GroupName};
use crate::metrics::{NOTIFY_DISPATCH_TOTAL, NOTIFY_SINK_FAILURES_TOTAL, NOTIFY_UNROUTABLE_TOTAL};
use crate::wire;

/// A transport that receives every dispatched notification.
///
/// `deliver` must not block on I/O: transports that talk to the network
/// enqueue and let their own tasks do the sending.
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    fn deliver(&self, notification: &Arc<ChangeNotification>) -> Result<SinkReport, NotifyError>;
}

/// What a sink did with one notification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub delivered: usize,
    pub failed: usize,
    /// The sink had no way to route the notification.
    pub skipped: bool,
}

impl SinkReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Per-sink result of one dispatch.
#[derive(Debug)]
pub struct SinkOutcome {
    pub sink: String,
    pub result: Result<SinkReport, NotifyError>,
}

/// Result of [`Dispatcher::dispatch`]. Informational only; dispatch itself
/// never fails.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<SinkOutcome>,
}

impl DispatchReport {
    pub fn for_sink(&self, name: &str) -> Option<&SinkOutcome> {
        self.outcomes.iter().find(|o| o.sink == name)
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

/// Name of the in-process sink.
pub const LOCAL_SINK: &str = "local";
/// Name of the remote group sink.
pub const REMOTE_SINK: &str = "remote";

impl NotificationSink for Broadcaster {
    fn name(&self) -> &str {
        LOCAL_SINK
    }

    fn deliver(&self, notification: &Arc<ChangeNotification>) -> Result<SinkReport, NotifyError> {
        let report = self.publish(notification);
        Ok(SinkReport {
            delivered: report.delivered,
            failed: report.failed,
            skipped: false,
        })
    }
}

impl NotificationSink for GroupManager {
    fn name(&self) -> &str {
        REMOTE_SINK
    }

    fn deliver(&self, notification: &Arc<ChangeNotification>) -> Result<SinkReport, NotifyError> {
        if !notification.has_routing_identity() {
            counter!(NOTIFY_UNROUTABLE_TOTAL).increment(1);
            debug!(
                entity_type = %notification.entity_type(),
                "notification has no practitioner, skipping remote delivery"
            );
            return Ok(SinkReport::skipped());
        }
        let group = GroupName::for_practitioner(notification.practitioner_id());
        let payload = wire::entity_changed(notification)?;
        let delivery = self.send_to_group(&group, payload);
        Ok(SinkReport {
            delivered: delivery.delivered,
            failed: delivery.failed,
            skipped: false,
        })
    }
}

/// Fans each notification out to every registered sink.
///
/// Sinks run in registration order; a sink that errors or panics is logged
/// and the remaining sinks still run.
#[derive(Clone, Default)]
pub struct Dispatcher {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Dispatcher {
    /// Standard wiring: remote groups first, then the in-process broadcaster.
    ///
    /// The remote sink only enqueues, so it cannot hold back local listeners,
    /// and a slow local listener cannot delay remote devices.
    pub fn new(broadcaster: Arc<Broadcaster>, groups: Arc<GroupManager>) -> Self {
        Self::empty().with_sink(groups).with_sink(broadcaster)
    }

    pub fn empty() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Announce a committed change. Call only after the mutation is durable;
    /// delivery is best-effort and cannot affect it.
    #[instrument(skip_all, fields(
        entity_type = %notification.entity_type(),
        entity_id = %notification.entity_id(),
        change_kind = %notification.change_kind(),
        practitioner_id = %notification.practitioner_id(),
    ))]
    pub fn dispatch(&self, notification: ChangeNotification) -> DispatchReport {
        counter!(NOTIFY_DISPATCH_TOTAL).increment(1);
        let notification = Arc::new(notification);

        let mut report = DispatchReport::default();
        for sink in &self.sinks {
            let result = match catch_unwind(AssertUnwindSafe(|| sink.deliver(&notification))) {
                Ok(result) => result,
                Err(_panic) => Err(NotifyError::Sink {
                    sink: sink.name().to_string(),
                    message: "sink panicked".into(),
                }),
            };
            if let Err(err) = &result {
                counter!(NOTIFY_SINK_FAILURES_TOTAL, "sink" => sink.name().to_string()).increment(1);
                warn!(sink = sink.name(), error_kind = err.error_kind(), error = %err, "sink delivery failed");
            }
            report.outcomes.push(SinkOutcome {
                sink: sink.name().to_string(),
                result,
            });
        }
        report
    }
}
