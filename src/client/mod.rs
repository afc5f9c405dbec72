use std::collections::HashMap;
use std::time::{ Duration, Instant };

use crate::models::chat::{ Chatroom, Message, ParticipantRole };
use crate::models::events::ServerEvent;

/// How long a typing indicator stays lit without a follow-up event.
pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(4);

/// Local send state for an optimistic message that has not been
/// acknowledged yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingState {
    Sending,
    Failed,
}

#[derive(Clone, Debug)]
pub struct PendingSend {
    pub correlation_id: String,
    pub message: Message,
    pub state: PendingState,
}

/// One chatroom as this client sees it: the replicated document, plus
/// purely local state (optimistic sends, the typing flag).
pub struct ChatroomReplica {
    pub chatroom: Chatroom,
    pub pending: Vec<PendingSend>,
    typing_until: Option<Instant>,
}

impl ChatroomReplica {
    fn new(chatroom: Chatroom) -> Self {
        ChatroomReplica {
            chatroom,
            pending: Vec::new(),
            typing_until: None,
        }
    }
}

/// Client-side reducer that merges server events into local replicas.
///
/// Events may arrive in odd interleavings (a `StopTyping` after the
/// message it trailed, a duplicate insert after a reconnect); every
/// merge is idempotent and keyed by id, never by content.
pub struct ChatState {
    user_id: String,
    typing_ttl: Duration,
    chatrooms: HashMap<String, ChatroomReplica>,
}

impl ChatState {
    pub fn new(user_id: &str) -> Self {
        Self::with_typing_ttl(user_id, DEFAULT_TYPING_TTL)
    }

    pub fn with_typing_ttl(user_id: &str, typing_ttl: Duration) -> Self {
        ChatState {
            user_id: user_id.to_string(),
            typing_ttl,
            chatrooms: HashMap::new(),
        }
    }

    /// Replaces the local view with a fresh fetch, dropping any local
    /// pending state.
    pub fn load_chatrooms(&mut self, rooms: Vec<Chatroom>) {
        self.chatrooms = rooms
            .into_iter()
            .map(|room| (room.id.clone(), ChatroomReplica::new(room)))
            .collect();
    }

    pub fn clear(&mut self) {
        self.chatrooms.clear();
    }

    pub fn chatroom(&self, chatroom_id: &str) -> Option<&ChatroomReplica> {
        self.chatrooms.get(chatroom_id)
    }

    pub fn chatrooms(&self) -> impl Iterator<Item = &ChatroomReplica> {
        self.chatrooms.values()
    }

    fn my_role(&self, chatroom_id: &str) -> Option<ParticipantRole> {
        self.chatrooms.get(chatroom_id).and_then(|r| r.chatroom.role_of(&self.user_id))
    }

    /// Inserts a provisional message and returns the correlation id to
    /// send along with it. `None` when the room is not loaded.
    pub fn send_optimistic(&mut self, chatroom_id: &str, content: &str) -> Option<String> {
        if !self.chatrooms.contains_key(chatroom_id) {
            return None;
        }
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let message = Message::new(chatroom_id, &self.user_id, content);
        let replica = self.chatrooms.get_mut(chatroom_id)?;
        replica.pending.push(PendingSend {
            correlation_id: correlation_id.clone(),
            message,
            state: PendingState::Sending,
        });
        Some(correlation_id)
    }

    /// Flags an optimistic send as failed. The entry stays visible so
    /// the user can retry or discard it.
    pub fn mark_send_failed(&mut self, chatroom_id: &str, correlation_id: &str) {
        if let Some(replica) = self.chatrooms.get_mut(chatroom_id) {
            if
                let Some(pending) = replica.pending
                    .iter_mut()
                    .find(|p| p.correlation_id == correlation_id)
            {
                pending.state = PendingState::Failed;
            }
        }
    }

    /// Drops a failed send after the user gives up on it.
    pub fn discard_failed(&mut self, chatroom_id: &str, correlation_id: &str) -> bool {
        if let Some(replica) = self.chatrooms.get_mut(chatroom_id) {
            let before = replica.pending.len();
            replica.pending.retain(
                |p| !(p.correlation_id == correlation_id && p.state == PendingState::Failed)
            );
            return replica.pending.len() != before;
        }
        false
    }

    /// Local mirror of the explicit viewed action: clears the unread
    /// set for this user's role. Displaying a room does not call this
    /// automatically; the UI decides when viewing counts.
    pub fn viewed(&mut self, chatroom_id: &str) {
        let role = match self.my_role(chatroom_id) {
            Some(role) => role,
            None => {
                return;
            }
        };
        if let Some(replica) = self.chatrooms.get_mut(chatroom_id) {
            replica.chatroom.unread_for_mut(role).clear();
        }
    }

    /// Unread messages addressed to this user across all loaded rooms.
    pub fn unread_count(&self) -> usize {
        self.chatrooms
            .values()
            .filter_map(|replica| {
                let role = replica.chatroom.role_of(&self.user_id)?;
                Some(replica.chatroom.unread_for(role).len())
            })
            .sum()
    }

    pub fn is_typing(&self, chatroom_id: &str) -> bool {
        self.is_typing_at(chatroom_id, Instant::now())
    }

    pub fn is_typing_at(&self, chatroom_id: &str, now: Instant) -> bool {
        self.chatrooms
            .get(chatroom_id)
            .and_then(|replica| replica.typing_until)
            .map(|until| until > now)
            .unwrap_or(false)
    }

    pub fn apply(&mut self, event: ServerEvent) {
        self.apply_at(event, Instant::now());
    }

    pub fn apply_at(&mut self, event: ServerEvent, now: Instant) {
        match event {
            ServerEvent::InsertMessage { message } => {
                self.insert_message(message);
            }
            ServerEvent::MessageAccepted { correlation_id, message } => {
                if let Some(replica) = self.chatrooms.get_mut(&message.chatroom_id) {
                    replica.pending.retain(|p| p.correlation_id != correlation_id);
                }
                self.insert_message(message);
            }
            ServerEvent::UpdateMessage { message } => {
                self.update_message(message);
            }
            ServerEvent::Typing { chatroom_id } => {
                if let Some(replica) = self.chatrooms.get_mut(&chatroom_id) {
                    replica.typing_until = Some(now + self.typing_ttl);
                }
            }
            ServerEvent::StopTyping { chatroom_id } => {
                if let Some(replica) = self.chatrooms.get_mut(&chatroom_id) {
                    replica.typing_until = None;
                }
            }
            ServerEvent::AddNewChatroom { chatroom } => {
                self.chatrooms
                    .entry(chatroom.id.clone())
                    .or_insert_with(|| ChatroomReplica::new(chatroom));
            }
            ServerEvent::DeleteChatroom { chatroom_id } => {
                self.chatrooms.remove(&chatroom_id);
            }
            ServerEvent::ListingSold { listing_id } => {
                for replica in self.chatrooms.values_mut() {
                    if replica.chatroom.listing.id == listing_id {
                        replica.chatroom.listing.sold = true;
                    }
                }
            }
            ServerEvent::Error { correlation_id: Some(correlation_id), .. } => {
                for replica in self.chatrooms.values_mut() {
                    if
                        let Some(pending) = replica.pending
                            .iter_mut()
                            .find(|p| p.correlation_id == correlation_id)
                    {
                        pending.state = PendingState::Failed;
                    }
                }
            }
            ServerEvent::Error { .. } => {}
        }
    }

    fn insert_message(&mut self, message: Message) {
        let user_id = self.user_id.clone();
        let replica = match self.chatrooms.get_mut(&message.chatroom_id) {
            Some(replica) => replica,
            None => {
                return;
            }
        };
        if replica.chatroom.messages.iter().any(|m| m.id == message.id) {
            return;
        }

        if message.sender != user_id {
            // Their message implies they stopped typing, whether or not
            // the StopTyping frame ever arrives.
            replica.typing_until = None;
            if let Some(role) = replica.chatroom.role_of(&user_id) {
                let unread = replica.chatroom.unread_for_mut(role);
                if !unread.contains(&message.id) {
                    unread.push(message.id.clone());
                }
            }
        }

        replica.chatroom.last_message = Some(message.clone());
        replica.chatroom.messages.push(message);
    }

    fn update_message(&mut self, message: Message) {
        let replica = match self.chatrooms.get_mut(&message.chatroom_id) {
            Some(replica) => replica,
            None => {
                return;
            }
        };
        if let Some(existing) = replica.chatroom.messages.iter_mut().find(|m| m.id == message.id) {
            if message.status > existing.status {
                *existing = message.clone();
                if let Some(last) = replica.chatroom.last_message.as_mut() {
                    if last.id == message.id {
                        *last = message;
                    }
                }
            }
        }
    }
}
