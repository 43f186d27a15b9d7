use std::{fmt::Display, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    events::Publisher,
    user::{normalize_host, User, UserDirectory},
};

/// Identifies one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live connection from some host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Unique per connection, even from the same host.
    pub id: ConnectionId,

    /// The normalized host.
    pub host: String,

    /// Who is connected.
    pub user: User,

    /// When the connection was made.
    pub since: chrono::DateTime<chrono::Utc>,
}

impl Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.user)
    }
}

/// Something happened to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A new connection.
    Connected(Connection),

    /// A connection went away.
    Disconnected(Connection),
}

/// The live connections of one scope: a node's TCP clients or a device's web clients.
#[derive(Debug)]
pub struct Connections {
    directory: Arc<UserDirectory>,
    live: Mutex<Vec<Connection>>,
    events: Publisher<ConnectionEvent>,
}

impl Connections {
    /// An empty set of connections resolving users via `directory`.
    pub fn new(directory: Arc<UserDirectory>) -> Self {
        Self {
            directory,
            live: Mutex::new(vec![]),
            events: Publisher::default(),
        }
    }

    /// Register a connection from a host.
    pub async fn add(&self, host: &str) -> Connection {
        let host = normalize_host(host);
        let user = self.directory.get(&host).await;

        let connection = Connection {
            id: ConnectionId::new(),
            host,
            user,
            since: chrono::Utc::now(),
        };

        info!(%connection, "Connected");
        self.live.lock().push(connection.clone());
        self.events
            .publish(ConnectionEvent::Connected(connection.clone()));

        connection
    }

    /// Remove a connection. Returns it if it was live.
    pub fn remove(&self, id: ConnectionId) -> Option<Connection> {
        let removed = {
            let mut live = self.live.lock();
            live.iter()
                .position(|connection| connection.id == id)
                .map(|index| live.remove(index))
        };

        if let Some(connection) = &removed {
            info!(%connection, "Disconnected");
            self.events
                .publish(ConnectionEvent::Disconnected(connection.clone()));
        }

        removed
    }

    /// Move all connections of `other` into this set.
    /// Used when a device is replaced by a reload, so observers are not lost.
    pub fn transplant_from(&self, other: &Connections) {
        let moved = std::mem::take(&mut *other.live.lock());
        debug!("Transplanting {} connection(s)", moved.len());

        for connection in moved {
            self.live.lock().push(connection.clone());
            self.events.publish(ConnectionEvent::Connected(connection));
        }
    }

    /// All live connections.
    pub fn list(&self) -> Vec<Connection> {
        self.live.lock().clone()
    }

    /// The users of all live connections.
    pub fn users(&self) -> Vec<User> {
        self.live
            .lock()
            .iter()
            .map(|connection| connection.user.clone())
            .collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    /// No live connections.
    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }

    /// Subscribe to connects and disconnects.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}
