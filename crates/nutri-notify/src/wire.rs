//! Events sent over the remote channel.
//!
//! Every frame is a JSON envelope `{"type", "timestamp", "data"}`. Payloads are
//! serialized once and shared between all recipients as `Arc<str>`.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use nutri_core::{ChangeNotification, ConnectionId};
use serde::{Deserialize, Serialize};

use crate::error::NotifyError;
use crate::groups::GroupName;

/// Event name for a committed domain change.
pub const ENTITY_CHANGED: &str = "entity.changed";
/// Event name sent once to every new connection.
pub const CONNECTION_ESTABLISHED: &str = "connection.established";

/// Envelope for every server → client frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl WireEvent {
    fn new(event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data,
        }
    }

    fn to_payload(&self) -> Result<Arc<str>, NotifyError> {
        Ok(Arc::from(serde_json::to_string(self)?))
    }
}

/// Serialize a change into an `entity.changed` frame.
pub fn entity_changed(notification: &ChangeNotification) -> Result<Arc<str>, NotifyError> {
    WireEvent::new(ENTITY_CHANGED, serde_json::to_value(notification)?).to_payload()
}

/// Serialize the greeting sent after a connection is set up.
pub fn connection_established(
    connection_id: &ConnectionId,
    group: Option<&GroupName>,
) -> Result<Arc<str>, NotifyError> {
    let data = serde_json::json!({
        "connectionId": connection_id,
        "grouped": group.is_some(),
        "group": group.map(GroupName::as_str),
    });
    WireEvent::new(CONNECTION_ESTABLISHED, data).to_payload()
}
