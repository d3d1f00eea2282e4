use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::PractitionerId;

/// Names the kind of domain record that changed (e.g. `Client`, `Appointment`).
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of the affected record. Domain tables use either integer or
/// string keys, so both are carried as-is.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Text(String),
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for EntityId {
    fn from(n: i32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Opaque change tag. The domain layer owns the vocabulary; the notification
/// path only forwards it.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeKind(String);

impl ChangeKind {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn created() -> Self {
        Self::new("Created")
    }

    pub fn updated() -> Self {
        Self::new("Updated")
    }

    pub fn deleted() -> Self {
        Self::new("Deleted")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One committed domain mutation.
///
/// Fields are private and there are no setters, so a notification can be
/// shared behind an `Arc` with any number of subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    entity_type: EntityType,
    entity_id: EntityId,
    change_kind: ChangeKind,
    practitioner_id: PractitionerId,
}

impl ChangeNotification {
    pub fn new(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        change_kind: ChangeKind,
        practitioner_id: PractitionerId,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            change_kind,
            practitioner_id,
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn change_kind(&self) -> &ChangeKind {
        &self.change_kind
    }

    pub fn practitioner_id(&self) -> &PractitionerId {
        &self.practitioner_id
    }

    /// Whether the notification can be routed to a practitioner group.
    pub fn has_routing_identity(&self) -> bool {
        !self.practitioner_id.is_blank()
    }
}
