use log::debug;
use std::collections::{ HashMap, HashSet };
use std::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;

use crate::models::events::ServerEvent;

/// Connection and channel-membership table.
///
/// Holds one outbound sender per live socket connection; a user may
/// hold several connections (tabs, devices) at once. Chatroom channels
/// are plain membership sets, authorization happens before `join` is
/// called. No method awaits, every lock is released before delivery
/// queues can be observed by the socket tasks.
pub struct SocketRegistry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<String, ConnectionEntry>,
    /// Chatroom id -> subscribed connection ids.
    channels: HashMap<String, HashSet<String>>,
    /// User id -> that user's connection ids.
    users: HashMap<String, HashSet<String>>,
}

struct ConnectionEntry {
    user_id: String,
    sender: UnboundedSender<ServerEvent>,
    channels: HashSet<String>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        SocketRegistry {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a live connection and returns its id.
    pub fn register(&self, user_id: &str, sender: UnboundedSender<ServerEvent>) -> String {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let mut inner = self.write();
        inner.connections.insert(connection_id.clone(), ConnectionEntry {
            user_id: user_id.to_string(),
            sender,
            channels: HashSet::new(),
        });
        inner.users.entry(user_id.to_string()).or_default().insert(connection_id.clone());
        connection_id
    }

    pub fn join(&self, connection_id: &str, chatroom_id: &str) {
        let mut guard = self.write();
        let inner = &mut *guard;
        if let Some(entry) = inner.connections.get_mut(connection_id) {
            entry.channels.insert(chatroom_id.to_string());
            inner.channels
                .entry(chatroom_id.to_string())
                .or_default()
                .insert(connection_id.to_string());
        }
    }

    pub fn leave(&self, connection_id: &str, chatroom_id: &str) {
        let mut inner = self.write();
        if let Some(entry) = inner.connections.get_mut(connection_id) {
            entry.channels.remove(chatroom_id);
        }
        let drained = match inner.channels.get_mut(chatroom_id) {
            Some(members) => {
                members.remove(connection_id);
                members.is_empty()
            }
            None => false,
        };
        if drained {
            inner.channels.remove(chatroom_id);
        }
    }

    /// Removes the connection from every channel and the user map.
    /// Chatroom and unread state are untouched.
    pub fn disconnect(&self, connection_id: &str) {
        let mut inner = self.write();
        let entry = match inner.connections.remove(connection_id) {
            Some(entry) => entry,
            None => {
                return;
            }
        };
        for chatroom_id in &entry.channels {
            let drained = match inner.channels.get_mut(chatroom_id) {
                Some(members) => {
                    members.remove(connection_id);
                    members.is_empty()
                }
                None => false,
            };
            if drained {
                inner.channels.remove(chatroom_id);
            }
        }
        let user_gone = match inner.users.get_mut(&entry.user_id) {
            Some(conns) => {
                conns.remove(connection_id);
                conns.is_empty()
            }
            None => false,
        };
        if user_gone {
            inner.users.remove(&entry.user_id);
        }
    }

    pub fn is_joined(&self, connection_id: &str, chatroom_id: &str) -> bool {
        let inner = self.read();
        inner.connections
            .get(connection_id)
            .map(|entry| entry.channels.contains(chatroom_id))
            .unwrap_or(false)
    }

    /// Whether any of the user's connections is subscribed to the room.
    /// Drives the `Sent -> Delivered` transition on send.
    pub fn is_user_subscribed(&self, chatroom_id: &str, user_id: &str) -> bool {
        let inner = self.read();
        let members = match inner.channels.get(chatroom_id) {
            Some(members) => members,
            None => {
                return false;
            }
        };
        members
            .iter()
            .any(|conn_id| {
                inner.connections
                    .get(conn_id)
                    .map(|entry| entry.user_id == user_id)
                    .unwrap_or(false)
            })
    }

    /// Delivers to every connection subscribed to the room, except the
    /// optional originating connection.
    pub fn broadcast(&self, chatroom_id: &str, event: &ServerEvent, exclude: Option<&str>) {
        let inner = self.read();
        let members = match inner.channels.get(chatroom_id) {
            Some(members) => members,
            None => {
                return;
            }
        };
        for conn_id in members {
            if exclude == Some(conn_id.as_str()) {
                continue;
            }
            Self::deliver(&inner, conn_id, event);
        }
    }

    /// Delivers to the room excluding all of one user's connections.
    /// Typing indicators go only to the other participant's tabs.
    pub fn broadcast_excluding_user(&self, chatroom_id: &str, event: &ServerEvent, user_id: &str) {
        let inner = self.read();
        let members = match inner.channels.get(chatroom_id) {
            Some(members) => members,
            None => {
                return;
            }
        };
        for conn_id in members {
            let is_excluded = inner.connections
                .get(conn_id)
                .map(|entry| entry.user_id == user_id)
                .unwrap_or(true);
            if !is_excluded {
                Self::deliver(&inner, conn_id, event);
            }
        }
    }

    /// Delivers to every connection a user holds, regardless of channel
    /// subscriptions. Used for events that precede any subscription,
    /// like a brand-new chatroom.
    pub fn send_to_user(&self, user_id: &str, event: &ServerEvent) {
        let inner = self.read();
        let conns = match inner.users.get(user_id) {
            Some(conns) => conns,
            None => {
                return;
            }
        };
        for conn_id in conns {
            Self::deliver(&inner, conn_id, event);
        }
    }

    fn deliver(inner: &Inner, connection_id: &str, event: &ServerEvent) {
        if let Some(entry) = inner.connections.get(connection_id) {
            if entry.sender.send(event.clone()).is_err() {
                debug!("Dropping event for closed connection {}", connection_id);
            }
        }
    }
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}
