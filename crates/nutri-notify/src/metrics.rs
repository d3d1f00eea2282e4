//! Metric name constants shared by the notification path and the hub server.
//!
//! Values are recorded through the `metrics` facade; whichever recorder the
//! host installs receives them.

/// Notifications published to in-process listeners (counter).
pub const NOTIFY_PUBLISHED_TOTAL: &str = "notify_published_total";
/// Listener callbacks that returned an error or panicked (counter).
pub const NOTIFY_LISTENER_FAILURES_TOTAL: &str = "notify_listener_failures_total";
/// Registered in-process listeners (gauge).
pub const NOTIFY_SUBSCRIBERS_ACTIVE: &str = "notify_subscribers_active";
/// Dispatch calls (counter).
pub const NOTIFY_DISPATCH_TOTAL: &str = "notify_dispatch_total";
/// Sink failures during dispatch (counter, labels: sink).
pub const NOTIFY_SINK_FAILURES_TOTAL: &str = "notify_sink_failures_total";
/// Notifications without a practitioner, skipped by the remote sink (counter).
pub const NOTIFY_UNROUTABLE_TOTAL: &str = "notify_unroutable_total";
/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Group sends that could not be enqueued (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// Active UI session relays (gauge).
pub const SESSION_RELAYS_ACTIVE: &str = "session_relays_active";
