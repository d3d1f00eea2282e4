//! Real-time change notification fan-out.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `broadcaster` | In-process publish/subscribe hub |
//! | `relay` | Per-UI-session subscriber with scoped lifecycle |
//! | `groups` | Remote connections grouped by practitioner |
//! | `dispatcher` | Ingress for domain services, fans out to sinks |
//! | `wire` | JSON frames sent over the remote channel |
//!
//! Data flow: domain service → `Dispatcher::dispatch` → `Broadcaster`
//! (→ each `SessionRelay` → session consumers) and `GroupManager`
//! (→ each connection queue in the practitioner's group).

pub mod broadcaster;
pub mod dispatcher;
pub mod error;
pub mod groups;
pub mod metrics;
pub mod relay;
pub mod wire;

pub use broadcaster::{
    Broadcaster, FnListener, NotificationListener, PublishReport, Subscription, SubscriptionId,
};
pub use dispatcher::{DispatchReport, Dispatcher, NotificationSink, SinkOutcome, SinkReport};
pub use error::{ListenerError, NotifyError};
pub use groups::{ConnectionLease, ConnectionState, GroupDelivery, GroupManager, GroupName};
pub use relay::SessionRelay;
