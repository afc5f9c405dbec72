use std::collections::{ HashMap, HashSet };
use std::sync::RwLock;

use crate::models::chat::{ Chatroom, ParticipantRole };

/// In-memory index over the unread sets the store persists.
///
/// The store stays canonical; this index exists so badge counts and
/// message-id lookups never re-traverse every chatroom document.
/// Snapshot unions happen at load time via `prime` and `track_room`;
/// the send and viewed paths apply exact per-message deltas through
/// `record_unread` and `clear_unread`.
pub struct UnreadTracker {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_room: HashMap<(String, ParticipantRole), HashSet<String>>,
    /// Message id -> chatroom id, the global reverse index.
    room_of: HashMap<String, String>,
    /// Chatroom id -> (buyer, seller), for per-user badge counting.
    participants: HashMap<String, (String, String)>,
}

impl UnreadTracker {
    pub fn new() -> Self {
        UnreadTracker {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Warm the index from store snapshots, typically the rooms returned
    /// by a chatroom listing.
    pub fn prime(&self, chatrooms: &[Chatroom]) {
        for room in chatrooms {
            self.track_room(room);
        }
    }

    pub fn track_room(&self, room: &Chatroom) {
        let mut inner = match self.inner.write() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.participants.insert(room.id.clone(), (room.buyer.clone(), room.seller.clone()));
        for role in [ParticipantRole::Buyer, ParticipantRole::Seller] {
            for message_id in room.unread_for(role) {
                inner.insert_unread(&room.id, role, message_id);
            }
        }
    }

    /// Registers the room for badge counting without unioning the
    /// snapshot's unread sets. The send path records its own delta, and
    /// its snapshot may predate a concurrent clear.
    pub fn track_participants(&self, room: &Chatroom) {
        let mut inner = match self.inner.write() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.participants.insert(room.id.clone(), (room.buyer.clone(), room.seller.clone()));
    }

    pub fn record_unread(&self, chatroom_id: &str, recipient: ParticipantRole, message_id: &str) {
        let mut inner = match self.inner.write() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.insert_unread(chatroom_id, recipient, message_id);
    }

    /// Drops the role's entry for the room and returns the ids it held.
    pub fn clear_unread(&self, chatroom_id: &str, recipient: ParticipantRole) -> Vec<String> {
        let mut inner = match self.inner.write() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let ids = inner.by_room
            .remove(&(chatroom_id.to_string(), recipient))
            .map(|set| set.into_iter().collect::<Vec<String>>())
            .unwrap_or_default();
        for id in &ids {
            inner.room_of.remove(id);
        }
        ids
    }

    /// Resolves which chatroom an unread message belongs to.
    pub fn chatroom_of(&self, message_id: &str) -> Option<String> {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.room_of.get(message_id).cloned()
    }

    pub fn unread_in(&self, chatroom_id: &str, recipient: ParticipantRole) -> Vec<String> {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.by_room
            .get(&(chatroom_id.to_string(), recipient))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total unread messages addressed to the user across all indexed
    /// rooms, for the navigation badge.
    pub fn unread_count_for(&self, user_id: &str) -> usize {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut total = 0;
        for (room_id, (buyer, seller)) in &inner.participants {
            let role = if buyer == user_id {
                ParticipantRole::Buyer
            } else if seller == user_id {
                ParticipantRole::Seller
            } else {
                continue;
            };
            total += inner.by_room
                .get(&(room_id.clone(), role))
                .map(|set| set.len())
                .unwrap_or(0);
        }
        total
    }
}

impl Default for UnreadTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn insert_unread(&mut self, chatroom_id: &str, recipient: ParticipantRole, message_id: &str) {
        self.by_room
            .entry((chatroom_id.to_string(), recipient))
            .or_default()
            .insert(message_id.to_string());
        self.room_of.insert(message_id.to_string(), chatroom_id.to_string());
    }
}
