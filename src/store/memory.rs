use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{ Mutex, RwLock };

use crate::error::ChatError;
use crate::models::chat::{ Chatroom, ListingSummary, Message, MessageStatus, ParticipantRole };
use crate::store::ChatroomStore;

/// In-memory backend for development and tests.
///
/// Each chatroom lives behind its own `Mutex`, so mutations against one
/// room are serialized while different rooms stay concurrent. The outer
/// map lock is only held long enough to clone the room handle.
pub struct MemoryChatroomStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<String, Arc<Mutex<Chatroom>>>,
    /// (listing id, buyer id) -> chatroom id, the idempotent-create index.
    by_pair: HashMap<(String, String), String>,
}

impl MemoryChatroomStore {
    pub fn new() -> Self {
        MemoryChatroomStore {
            inner: RwLock::new(Inner::default()),
        }
    }

    async fn room_handle(&self, chatroom_id: &str) -> Result<Arc<Mutex<Chatroom>>, ChatError> {
        let inner = self.inner.read().await;
        inner.rooms
            .get(chatroom_id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("chatroom {}", chatroom_id)))
    }

    async fn snapshot_all(&self) -> Vec<Arc<Mutex<Chatroom>>> {
        let inner = self.inner.read().await;
        inner.rooms.values().cloned().collect()
    }
}

impl Default for MemoryChatroomStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the denormalized `last_message` copy in step after a status
/// transition touched the underlying message.
fn refresh_last_message(room: &mut Chatroom) {
    if let Some(last) = room.messages.last() {
        room.last_message = Some(last.clone());
    }
}

#[async_trait]
impl ChatroomStore for MemoryChatroomStore {
    async fn create_or_get_chatroom(
        &self,
        listing: &ListingSummary,
        buyer: &str,
        seller: &str
    ) -> Result<(Chatroom, bool), ChatError> {
        if buyer == seller {
            return Err(
                ChatError::Validation("a seller cannot open a chatroom on their own listing".to_string())
            );
        }

        let pair = (listing.id.clone(), buyer.to_string());
        {
            let inner = self.inner.read().await;
            if let Some(room_id) = inner.by_pair.get(&pair) {
                if let Some(handle) = inner.rooms.get(room_id) {
                    let room = handle.lock().await.clone();
                    return Ok((room, false));
                }
            }
        }

        let mut inner = self.inner.write().await;
        // A concurrent create may have won the race between the locks.
        if let Some(room_id) = inner.by_pair.get(&pair) {
            if let Some(handle) = inner.rooms.get(room_id) {
                let room = handle.lock().await.clone();
                return Ok((room, false));
            }
        }

        let room = Chatroom::new(listing.clone(), buyer, seller);
        inner.by_pair.insert(pair, room.id.clone());
        inner.rooms.insert(room.id.clone(), Arc::new(Mutex::new(room.clone())));
        Ok((room, true))
    }

    async fn append_message(
        &self,
        chatroom_id: &str,
        sender: &str,
        content: &str
    ) -> Result<Message, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::Validation("message content must not be blank".to_string()));
        }

        let handle = self.room_handle(chatroom_id).await?;
        let mut room = handle.lock().await;
        let role = room
            .role_of(sender)
            .ok_or_else(|| {
                ChatError::Authorization(
                    format!("user {} is not a participant of chatroom {}", sender, chatroom_id)
                )
            })?;

        let message = Message::new(chatroom_id, sender, content);
        room.messages.push(message.clone());
        room.last_message = Some(message.clone());
        let unread = room.unread_for_mut(role.other());
        if !unread.contains(&message.id) {
            unread.push(message.id.clone());
        }
        Ok(message)
    }

    async fn find_chatroom(&self, chatroom_id: &str) -> Result<Chatroom, ChatError> {
        let handle = self.room_handle(chatroom_id).await?;
        let room = handle.lock().await.clone();
        Ok(room)
    }

    async fn list_chatrooms_for_user(&self, user_id: &str) -> Result<Vec<Chatroom>, ChatError> {
        let mut rooms = Vec::new();
        for handle in self.snapshot_all().await {
            let room = handle.lock().await;
            if room.is_participant(user_id) {
                rooms.push(room.clone());
            }
        }
        rooms.sort_by_key(|room| {
            let activity = room.last_message
                .as_ref()
                .map(|m| m.created_at)
                .unwrap_or(room.created_at);
            std::cmp::Reverse(activity)
        });
        Ok(rooms)
    }

    async fn clear_unread(
        &self,
        chatroom_id: &str,
        role: ParticipantRole
    ) -> Result<Vec<String>, ChatError> {
        let handle = self.room_handle(chatroom_id).await?;
        let mut room = handle.lock().await;
        let cleared = std::mem::take(room.unread_for_mut(role));
        if !cleared.is_empty() {
            for message in room.messages.iter_mut() {
                if cleared.contains(&message.id) {
                    message.advance_status(MessageStatus::Read);
                }
            }
            refresh_last_message(&mut room);
        }
        Ok(cleared)
    }

    async fn mark_delivered(
        &self,
        chatroom_id: &str,
        message_id: &str
    ) -> Result<Option<Message>, ChatError> {
        let handle = self.room_handle(chatroom_id).await?;
        let mut room = handle.lock().await;
        let message = room.messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;

        if message.advance_status(MessageStatus::Delivered) {
            let updated = message.clone();
            refresh_last_message(&mut room);
            Ok(Some(updated))
        } else {
            Ok(None)
        }
    }

    async fn set_listing_sold(&self, listing_id: &str) -> Result<Vec<String>, ChatError> {
        let mut affected = Vec::new();
        for handle in self.snapshot_all().await {
            let mut room = handle.lock().await;
            if room.listing.id == listing_id {
                room.listing.sold = true;
                affected.push(room.id.clone());
            }
        }
        Ok(affected)
    }
}
