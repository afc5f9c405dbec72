use log::{ debug, error, info, warn };
use std::error::Error;
use std::sync::Arc;

use crate::cli::Args;
use crate::error::ChatError;
use crate::listing::{ create_listing_directory, ListingDirectory };
use crate::models::chat::{ Chatroom, Message, ParticipantRole };
use crate::models::events::{ ClientEvent, ServerEvent };
use crate::registry::SocketRegistry;
use crate::store::{ initialize_chatroom_store, ChatroomStore };
use crate::unread::UnreadTracker;

/// Validates and applies chat events against chatroom state, persists
/// through the store and fans resulting events out through the
/// registry.
///
/// Per-chatroom ordering comes from the store's per-document
/// serialization; the engine itself holds no locks across operations,
/// so different rooms proceed concurrently.
pub struct ChatEngine {
    store: Arc<dyn ChatroomStore>,
    directory: Arc<dyn ListingDirectory>,
    registry: Arc<SocketRegistry>,
    unread: UnreadTracker,
}

impl ChatEngine {
    pub fn new(
        store: Arc<dyn ChatroomStore>,
        directory: Arc<dyn ListingDirectory>,
        registry: Arc<SocketRegistry>
    ) -> Self {
        ChatEngine {
            store,
            directory,
            registry,
            unread: UnreadTracker::new(),
        }
    }

    pub fn from_args(args: &Args) -> Result<ChatEngine, Box<dyn Error + Send + Sync>> {
        let store = initialize_chatroom_store(args)?;
        let directory = create_listing_directory(args)?;
        info!("Listing lookups served by: {}", args.listing_directory);
        Ok(ChatEngine::new(store, directory, Arc::new(SocketRegistry::new())))
    }

    pub fn registry(&self) -> &Arc<SocketRegistry> {
        &self.registry
    }

    pub fn unread(&self) -> &UnreadTracker {
        &self.unread
    }

    /// Applies one client event and returns the frames to send back on
    /// the originating connection. Broadcasts to other participants
    /// happen internally through the registry.
    pub async fn handle_event(
        &self,
        connection_id: &str,
        user_id: &str,
        event: ClientEvent
    ) -> Vec<ServerEvent> {
        let room_id = event.chatroom_id().to_string();
        let (result, correlation_id) = match event {
            ClientEvent::Join { .. } => {
                (self.join(connection_id, user_id, &room_id).await.map(|_| Vec::new()), None)
            }
            ClientEvent::Leave { .. } => {
                self.registry.leave(connection_id, &room_id);
                (Ok(Vec::new()), None)
            }
            ClientEvent::SendMessage { content, correlation_id, .. } => {
                let result = self.send_message(
                    connection_id,
                    user_id,
                    &room_id,
                    &content,
                    &correlation_id
                ).await;
                (result, Some(correlation_id))
            }
            ClientEvent::StartTyping { .. } => {
                (self.typing(connection_id, user_id, &room_id, true).map(|_| Vec::new()), None)
            }
            ClientEvent::StopTyping { .. } => {
                (self.typing(connection_id, user_id, &room_id, false).map(|_| Vec::new()), None)
            }
            ClientEvent::ViewedByBuyer { .. } => {
                (
                    self.viewed(user_id, &room_id, ParticipantRole::Buyer).await.map(|_| Vec::new()),
                    None,
                )
            }
            ClientEvent::ViewedBySeller { .. } => {
                (
                    self
                        .viewed(user_id, &room_id, ParticipantRole::Seller).await
                        .map(|_| Vec::new()),
                    None,
                )
            }
        };

        match result {
            Ok(replies) => replies,
            Err(err) => {
                warn!("Rejected event from {} on chatroom {}: {}", user_id, room_id, err);
                let mut replies = vec![ServerEvent::from_error(&err, correlation_id)];
                if matches!(err, ChatError::NotFound(_)) {
                    // The room is gone as far as this client is concerned.
                    replies.push(ServerEvent::DeleteChatroom { chatroom_id: room_id });
                }
                replies
            }
        }
    }

    async fn join(
        &self,
        connection_id: &str,
        user_id: &str,
        chatroom_id: &str
    ) -> Result<(), ChatError> {
        let room = self.store.find_chatroom(chatroom_id).await?;
        if !room.is_participant(user_id) {
            debug!("Ignoring join to {} from non-participant {}", chatroom_id, user_id);
            return Ok(());
        }
        self.unread.track_room(&room);
        self.registry.join(connection_id, chatroom_id);
        Ok(())
    }

    async fn send_message(
        &self,
        connection_id: &str,
        user_id: &str,
        chatroom_id: &str,
        content: &str,
        correlation_id: &str
    ) -> Result<Vec<ServerEvent>, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::Validation("message content must not be blank".to_string()));
        }

        let room = self.store.find_chatroom(chatroom_id).await?;
        let sender_role = room
            .role_of(user_id)
            .ok_or_else(|| {
                ChatError::Authorization(
                    format!("user {} is not a participant of chatroom {}", user_id, chatroom_id)
                )
            })?;

        let mut message = self.store.append_message(chatroom_id, user_id, content).await?;
        // The room snapshot above predates the append; a viewed event
        // may have cleared unread sets in between. Register the room
        // and record only this message's delta.
        self.unread.track_participants(&room);
        self.unread.record_unread(chatroom_id, sender_role.other(), &message.id);

        self.registry.broadcast(
            chatroom_id,
            &(ServerEvent::InsertMessage { message: message.clone() }),
            Some(connection_id)
        );

        // A recipient with a live subscription has the message on screen
        // or at least in-app: confirm delivery to everyone in the room.
        let recipient = room.participant(sender_role.other());
        if self.registry.is_user_subscribed(chatroom_id, recipient) {
            match self.store.mark_delivered(chatroom_id, &message.id).await {
                Ok(Some(updated)) => {
                    self.registry.broadcast(
                        chatroom_id,
                        &(ServerEvent::UpdateMessage { message: updated.clone() }),
                        None
                    );
                    message = updated;
                }
                Ok(None) => {}
                Err(e) => {
                    // The send itself succeeded; do not fail the ack
                    // over a lost delivery receipt.
                    error!("Could not mark message {} delivered: {}", message.id, e);
                }
            }
        }

        Ok(
            vec![ServerEvent::MessageAccepted {
                correlation_id: correlation_id.to_string(),
                message,
            }]
        )
    }

    fn typing(
        &self,
        connection_id: &str,
        user_id: &str,
        chatroom_id: &str,
        started: bool
    ) -> Result<(), ChatError> {
        if !self.registry.is_joined(connection_id, chatroom_id) {
            return Err(
                ChatError::Authorization(
                    format!("connection has not joined chatroom {}", chatroom_id)
                )
            );
        }
        let event = if started {
            ServerEvent::Typing { chatroom_id: chatroom_id.to_string() }
        } else {
            ServerEvent::StopTyping { chatroom_id: chatroom_id.to_string() }
        };
        self.registry.broadcast_excluding_user(chatroom_id, &event, user_id);
        Ok(())
    }

    async fn viewed(
        &self,
        user_id: &str,
        chatroom_id: &str,
        role: ParticipantRole
    ) -> Result<(), ChatError> {
        let room = self.store.find_chatroom(chatroom_id).await?;
        match room.role_of(user_id) {
            Some(actual) if actual == role => {}
            Some(_) => {
                return Err(
                    ChatError::Authorization(
                        format!("user {} is not the {} of chatroom {}", user_id, role.as_str(), chatroom_id)
                    )
                );
            }
            None => {
                return Err(
                    ChatError::Authorization(
                        format!("user {} is not a participant of chatroom {}", user_id, chatroom_id)
                    )
                );
            }
        }

        let cleared = self.store.clear_unread(chatroom_id, role).await?;
        self.unread.clear_unread(chatroom_id, role);
        debug!("Cleared {} unread messages for {} in {}", cleared.len(), user_id, chatroom_id);
        // Read receipts stay private: no broadcast to the other side.
        Ok(())
    }

    /// First-contact entry point: finds or creates the chatroom between
    /// the buyer and the listing's seller. A freshly created room is
    /// announced to all of the seller's connections.
    pub async fn open_chatroom(&self, listing_id: &str, buyer: &str) -> Result<Chatroom, ChatError> {
        let record = self.directory.lookup(listing_id).await?;
        if record.owner == buyer {
            return Err(
                ChatError::Validation("a seller cannot open a chatroom on their own listing".to_string())
            );
        }

        let (room, created) = self.store.create_or_get_chatroom(
            &record.summary(),
            buyer,
            &record.owner
        ).await?;
        self.unread.track_room(&room);

        if created {
            info!("Chatroom {} opened for listing {} by {}", room.id, listing_id, buyer);
            self.registry.send_to_user(
                &room.seller,
                &(ServerEvent::AddNewChatroom { chatroom: room.clone() })
            );
        }
        Ok(room)
    }

    /// Trigger consumed from the listing service when an item sells.
    /// Every chatroom attached to the listing gets the banner event;
    /// message histories are untouched. Returns the number of rooms
    /// notified.
    pub async fn listing_sold(&self, listing_id: &str, caller: &str) -> Result<usize, ChatError> {
        let record = self.directory.lookup(listing_id).await?;
        if record.owner != caller {
            return Err(
                ChatError::Authorization(
                    format!("user {} does not own listing {}", caller, listing_id)
                )
            );
        }

        let affected = self.store.set_listing_sold(listing_id).await?;
        let event = ServerEvent::ListingSold { listing_id: listing_id.to_string() };
        for chatroom_id in &affected {
            self.registry.broadcast(chatroom_id, &event, None);
        }
        info!("Listing {} marked sold, {} chatrooms notified", listing_id, affected.len());
        Ok(affected.len())
    }

    /// The authed user's chatrooms, most recent activity first. Also
    /// warms the unread index so badge counts are immediately right.
    pub async fn list_chatrooms(&self, user_id: &str) -> Result<Vec<Chatroom>, ChatError> {
        let rooms = self.store.list_chatrooms_for_user(user_id).await?;
        self.unread.prime(&rooms);
        Ok(rooms)
    }

    pub async fn chatroom_messages(
        &self,
        chatroom_id: &str,
        user_id: &str
    ) -> Result<Vec<Message>, ChatError> {
        let room = self.store.find_chatroom(chatroom_id).await?;
        if !room.is_participant(user_id) {
            return Err(
                ChatError::Authorization(
                    format!("user {} is not a participant of chatroom {}", user_id, chatroom_id)
                )
            );
        }
        Ok(room.messages)
    }
}
