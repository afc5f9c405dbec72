mod memory;
mod redis;

use async_trait::async_trait;
use log::info;
use std::error::Error;
use std::sync::Arc;

use crate::cli::Args;
use crate::error::ChatError;
use crate::models::chat::{ Chatroom, ListingSummary, Message, ParticipantRole };

/// Persistent chatroom document store.
///
/// All mutating calls against the same chatroom are serialized by the
/// backend, so two concurrent sends to one room land in persistence
/// order with distinct ids. Calls against different rooms proceed
/// independently.
#[async_trait]
pub trait ChatroomStore: Send + Sync {
    /// Fetches the chatroom for `(listing.id, buyer)`, creating it when
    /// absent. The bool reports whether the room was newly created.
    async fn create_or_get_chatroom(
        &self,
        listing: &ListingSummary,
        buyer: &str,
        seller: &str
    ) -> Result<(Chatroom, bool), ChatError>;

    /// Appends a message with a fresh id and `Sent` status, updating
    /// `last_message` and the recipient's unread set in the same
    /// atomic step.
    async fn append_message(
        &self,
        chatroom_id: &str,
        sender: &str,
        content: &str
    ) -> Result<Message, ChatError>;

    async fn find_chatroom(&self, chatroom_id: &str) -> Result<Chatroom, ChatError>;

    /// Rooms where the user is buyer or seller, most recent activity first.
    async fn list_chatrooms_for_user(&self, user_id: &str) -> Result<Vec<Chatroom>, ChatError>;

    /// Empties the role's unread set and marks those messages `Read`.
    /// Returns the ids that were cleared; empty on a second call.
    async fn clear_unread(
        &self,
        chatroom_id: &str,
        role: ParticipantRole
    ) -> Result<Vec<String>, ChatError>;

    /// `Sent -> Delivered`. Returns `None` when the message was already
    /// at `Delivered` or `Read`.
    async fn mark_delivered(
        &self,
        chatroom_id: &str,
        message_id: &str
    ) -> Result<Option<Message>, ChatError>;

    /// Flips the stored listing snapshot to sold on every room that
    /// references the listing. Returns the affected chatroom ids.
    async fn set_listing_sold(&self, listing_id: &str) -> Result<Vec<String>, ChatError>;
}

pub fn create_chatroom_store(
    args: &Args
) -> Result<Arc<dyn ChatroomStore>, Box<dyn Error + Send + Sync>> {
    match args.store_type.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(memory::MemoryChatroomStore::new())),
        "redis" => {
            let store = redis::RedisChatroomStore::new(args.clone())?;
            Ok(Arc::new(store))
        }
        _ =>
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported store type: {}", args.store_type)
                    )
                )
            ),
    }
}

pub fn initialize_chatroom_store(
    args: &Args
) -> Result<Arc<dyn ChatroomStore>, Box<dyn Error + Send + Sync>> {
    info!("Chatrooms will be stored in: {}", args.store_type);
    if args.store_type.to_lowercase() == "redis" {
        info!("Store URL: {}", args.store_url);
    }
    create_chatroom_store(args)
}

pub use memory::MemoryChatroomStore;
