pub mod ids;
pub mod notification;

pub use ids::{ConnectionId, PractitionerId, SessionId};
pub use notification::{ChangeKind, ChangeNotification, EntityId, EntityType};
