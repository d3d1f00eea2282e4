//! Remote connections grouped by owning practitioner.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, gauge};
use nutri_core::{ConnectionId, PractitionerId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::metrics::{
    WS_BROADCAST_DROPS_TOTAL, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};

/// Maximum total lifetime message drops before forcibly disconnecting a slow client.
pub const MAX_TOTAL_DROPS: u64 = 100;

/// Namespace for practitioner group names.
pub const GROUP_PREFIX: &str = "practitioner:";

/// Name of the group holding one practitioner's connections.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct GroupName(String);

impl GroupName {
    /// Derive the group name from the practitioner id alone. The id is kept
    /// verbatim after the prefix, so distinct ids never share a group.
    pub fn for_practitioner(practitioner_id: &PractitionerId) -> Self {
        Self(format!("{GROUP_PREFIX}{practitioner_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of one remote connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered, identity not yet known.
    Connecting,
    /// Authenticated without a practitioner claim; receives no targeted events.
    Ungrouped,
    /// Member of a practitioner group.
    Joined(GroupName),
    /// Removed from the manager.
    Closed,
}

impl ConnectionState {
    pub fn group(&self) -> Option<&GroupName> {
        match self {
            Self::Joined(group) => Some(group),
            _ => None,
        }
    }
}

/// Result of enqueueing one payload on a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Outbound queue is full; the payload was dropped.
    Full,
    /// Writer side has gone away.
    Closed,
}

/// A registered remote connection and its outbound queue.
pub struct RemoteConnection {
    pub id: ConnectionId,
    tx: mpsc::Sender<Arc<str>>,
    state: Mutex<ConnectionState>,
    last_pong: AtomicU64,
    drops: AtomicU64,
}

impl RemoteConnection {
    fn new(id: ConnectionId, tx: mpsc::Sender<Arc<str>>) -> Self {
        Self {
            id,
            tx,
            state: Mutex::new(ConnectionState::Connecting),
            last_pong: AtomicU64::new(now_millis()),
            drops: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    /// Enqueue without waiting. The connection's writer task does the I/O.
    pub fn send(&self, payload: Arc<str>) -> SendOutcome {
        match self.tx.try_send(payload) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.drops.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_millis(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        now_millis().saturating_sub(last) < timeout_ms
    }
}

/// Wall-clock milliseconds since the Unix epoch.
fn now_millis() -> u64 {
    let elapsed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Outcome of a group send.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupDelivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Registry of remote connections and their practitioner groups.
///
/// Membership lives behind its own lock. Sends copy the member list out and
/// enqueue after releasing it, so joins and leaves never wait on delivery.
pub struct GroupManager {
    connections: DashMap<ConnectionId, Arc<RemoteConnection>>,
    groups: RwLock<HashMap<GroupName, HashSet<ConnectionId>>>,
    max_send_queue: usize,
}

impl GroupManager {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            groups: RwLock::new(HashMap::new()),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Register a new connection in `Connecting` state.
    ///
    /// The returned lease removes the connection when dropped; the receiver is
    /// the connection's outbound queue.
    pub fn connect(self: &Arc<Self>) -> (ConnectionLease, mpsc::Receiver<Arc<str>>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let conn = Arc::new(RemoteConnection::new(id.clone(), tx));
        let _ = self.connections.insert(id.clone(), conn);

        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        debug!(connection_id = %id, "connection registered");

        let lease = ConnectionLease {
            id,
            manager: Arc::clone(self),
        };
        (lease, rx)
    }

    /// Attach the authenticated identity to a connection.
    ///
    /// With a practitioner the connection joins that practitioner's group,
    /// leaving any previous one. Without one it stays registered but ungrouped.
    pub fn authenticate(
        &self,
        connection_id: &ConnectionId,
        practitioner_id: Option<&PractitionerId>,
    ) -> ConnectionState {
        let mut groups = self.groups.write();
        let Some(conn) = self.connections.get(connection_id).map(|c| Arc::clone(c.value())) else {
            return ConnectionState::Closed;
        };
        let mut state = conn.state.lock();
        if *state == ConnectionState::Closed {
            return ConnectionState::Closed;
        }

        if let ConnectionState::Joined(previous) = &*state {
            remove_member(&mut groups, previous, connection_id);
        }

        *state = match practitioner_id.filter(|p| !p.is_blank()) {
            Some(practitioner_id) => {
                let group = GroupName::for_practitioner(practitioner_id);
                let _ = groups
                    .entry(group.clone())
                    .or_default()
                    .insert(connection_id.clone());
                info!(connection_id = %connection_id, group = %group, "connection joined group");
                ConnectionState::Joined(group)
            }
            None => {
                info!(connection_id = %connection_id, "connection has no practitioner claim, left ungrouped");
                ConnectionState::Ungrouped
            }
        };
        (*state).clone()
    }

    /// Remove a connection and its group membership. Idempotent.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> bool {
        let Some((_, conn)) = self.connections.remove(connection_id) else {
            return false;
        };
        {
            let mut groups = self.groups.write();
            let mut state = conn.state.lock();
            if let ConnectionState::Joined(group) = &*state {
                remove_member(&mut groups, group, connection_id);
            }
            *state = ConnectionState::Closed;
        }

        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        debug!(connection_id = %connection_id, "connection removed");
        true
    }

    /// Enqueue `payload` for every member of `group`.
    ///
    /// Full or closed queues count as failures for that member only. Members
    /// that keep dropping or whose writer is gone are disconnected.
    pub fn send_to_group(&self, group: &GroupName, payload: Arc<str>) -> GroupDelivery {
        let members: Vec<Arc<RemoteConnection>> = {
            let groups = self.groups.read();
            groups
                .get(group)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| self.connections.get(id).map(|c| Arc::clone(c.value())))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut delivery = GroupDelivery::default();
        let mut to_remove = Vec::new();
        for conn in &members {
            match conn.send(Arc::clone(&payload)) {
                SendOutcome::Sent => delivery.delivered += 1,
                SendOutcome::Full => {
                    delivery.failed += 1;
                    counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
                    let drops = conn.drop_count();
                    if drops >= MAX_TOTAL_DROPS {
                        warn!(connection_id = %conn.id, group = %group, drops, "disconnecting slow client");
                        to_remove.push(conn.id.clone());
                    } else {
                        warn!(connection_id = %conn.id, group = %group, total_drops = drops, "failed to send event to client (queue full)");
                    }
                }
                SendOutcome::Closed => {
                    delivery.failed += 1;
                    counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
                    warn!(connection_id = %conn.id, group = %group, "client writer closed, removing connection");
                    to_remove.push(conn.id.clone());
                }
            }
        }
        debug!(
            group = %group,
            recipients = members.len(),
            delivered = delivery.delivered,
            failed = delivery.failed,
            "group send"
        );

        for id in &to_remove {
            let _ = self.disconnect(id);
        }
        delivery
    }

    /// Enqueue a payload for one connection.
    pub fn send_to(&self, connection_id: &ConnectionId, payload: Arc<str>) -> SendOutcome {
        match self.connections.get(connection_id).map(|c| Arc::clone(c.value())) {
            Some(conn) => conn.send(payload),
            None => SendOutcome::Closed,
        }
    }

    pub fn record_pong(&self, connection_id: &ConnectionId) {
        if let Some(conn) = self.connections.get(connection_id) {
            conn.record_pong();
        }
    }

    /// Remove connections that haven't answered a ping within `timeout`.
    pub fn cleanup_dead_connections(&self, timeout: Duration) -> usize {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().is_alive(timeout))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in dead {
            if self.disconnect(&id) {
                removed += 1;
                info!(connection_id = %id, "cleaned up dead connection");
            }
        }
        removed
    }

    pub fn connection_state(&self, connection_id: &ConnectionId) -> ConnectionState {
        self.connections
            .get(connection_id)
            .map_or(ConnectionState::Closed, |c| c.state())
    }

    /// Current members of a group.
    pub fn group_members(&self, group: &GroupName) -> Vec<ConnectionId> {
        self.groups
            .read()
            .get(group)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of non-empty groups.
    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for GroupManager {
    fn default() -> Self {
        Self::new(256)
    }
}

fn remove_member(
    groups: &mut HashMap<GroupName, HashSet<ConnectionId>>,
    group: &GroupName,
    connection_id: &ConnectionId,
) {
    if let Some(members) = groups.get_mut(group) {
        let _ = members.remove(connection_id);
        if members.is_empty() {
            let _ = groups.remove(group);
        }
    }
}

/// Keeps a connection registered for as long as it is held.
///
/// Dropping the lease (normal close, error return, panic unwind or task abort)
/// removes the connection from its group.
pub struct ConnectionLease {
    id: ConnectionId,
    manager: Arc<GroupManager>,
}

impl ConnectionLease {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn manager(&self) -> &Arc<GroupManager> {
        &self.manager
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let _ = self.manager.disconnect(&self.id);
    }
}

/// Start a background task that periodically removes unresponsive connections.
pub fn start_cleanup_task(
    manager: Arc<GroupManager>,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            let _ = ticker.tick().await;
            let removed = manager.cleanup_dead_connections(timeout);
            if removed > 0 {
                info!(removed, "dead connection cleanup");
            }
        }
    })
}
