use async_trait::async_trait;
use log::error;
use redis::{ AsyncCommands, Client };
use serde::{ Serialize, Deserialize };
use std::collections::{ HashMap, HashSet };
use std::error::Error;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cli::Args;
use crate::error::ChatError;
use crate::models::chat::{ Chatroom, ListingSummary, Message, MessageStatus, ParticipantRole };
use crate::store::ChatroomStore;

/// Chatroom metadata kept apart from the message list. The message
/// history lives in a Redis list keyed per room, `last_message` is the
/// list tail and is derived at read time.
#[derive(Serialize, Deserialize)]
struct RoomMeta {
    id: String,
    listing: ListingSummary,
    buyer: String,
    seller: String,
    created_at: i64,
}

pub struct RedisChatroomStore {
    client: Client,
    key_prefix: String,
    /// In-process per-room write locks: status rewrites touch list
    /// entries by index and must not interleave for the same room.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RedisChatroomStore {
    pub fn new(args: Args) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(Self {
            client: Client::open(args.store_url.as_str())?,
            key_prefix: args.store_key_prefix,
            locks: Mutex::new(HashMap::new()),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    async fn room_lock(&self, chatroom_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(chatroom_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn meta_key(&self, chatroom_id: &str) -> String {
        format!("{}room:{}", self.key_prefix, chatroom_id)
    }

    fn msgs_key(&self, chatroom_id: &str) -> String {
        format!("{}msgs:{}", self.key_prefix, chatroom_id)
    }

    fn unread_key(&self, chatroom_id: &str, role: ParticipantRole) -> String {
        format!("{}unread:{}:{}", self.key_prefix, chatroom_id, role.as_str())
    }

    fn pair_key(&self, listing_id: &str, buyer: &str) -> String {
        format!("{}pair:{}:{}", self.key_prefix, listing_id, buyer)
    }

    fn user_key(&self, user_id: &str) -> String {
        format!("{}user:{}", self.key_prefix, user_id)
    }

    fn listing_key(&self, listing_id: &str) -> String {
        format!("{}listing:{}", self.key_prefix, listing_id)
    }

    async fn load_meta(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        chatroom_id: &str
    ) -> Result<RoomMeta, ChatError> {
        let raw: Option<String> = conn.get(self.meta_key(chatroom_id)).await?;
        let raw = raw.ok_or_else(|| ChatError::NotFound(format!("chatroom {}", chatroom_id)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Messages paired with their raw list positions. Skipped entries
    /// leave index gaps, and any `LSET` rewrite must address the raw
    /// position, never the filtered one.
    async fn load_message_entries(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        chatroom_id: &str
    ) -> Result<Vec<(usize, Message)>, ChatError> {
        let entries: Vec<String> = conn.lrange(self.msgs_key(chatroom_id), 0, -1).await?;
        Ok(parse_message_entries(chatroom_id, &entries))
    }

    async fn load_messages(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        chatroom_id: &str
    ) -> Result<Vec<Message>, ChatError> {
        let indexed = self.load_message_entries(conn, chatroom_id).await?;
        Ok(
            indexed
                .into_iter()
                .map(|(_, message)| message)
                .collect()
        )
    }

    async fn load_room(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        chatroom_id: &str
    ) -> Result<Chatroom, ChatError> {
        let meta = self.load_meta(conn, chatroom_id).await?;
        let messages = self.load_messages(conn, chatroom_id).await?;

        let buyer_unread: HashSet<String> = conn
            .smembers(self.unread_key(chatroom_id, ParticipantRole::Buyer)).await?;
        let seller_unread: HashSet<String> = conn
            .smembers(self.unread_key(chatroom_id, ParticipantRole::Seller)).await?;

        // Sets lose insertion order; report unread ids in history order.
        let in_order = |wanted: &HashSet<String>| {
            messages
                .iter()
                .filter(|m| wanted.contains(&m.id))
                .map(|m| m.id.clone())
                .collect::<Vec<String>>()
        };

        Ok(Chatroom {
            id: meta.id,
            listing: meta.listing,
            buyer: meta.buyer,
            seller: meta.seller,
            created_at: meta.created_at,
            last_message: messages.last().cloned(),
            unread_msg_ids_by_buyer: in_order(&buyer_unread),
            unread_msg_ids_by_seller: in_order(&seller_unread),
            messages,
        })
    }

    async fn load_rooms_by_index(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        index_key: String
    ) -> Result<Vec<Chatroom>, ChatError> {
        let ids: Vec<String> = conn.smembers(index_key).await?;
        let mut rooms = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.load_room(conn, id).await {
                Ok(room) => rooms.push(room),
                Err(ChatError::NotFound(_)) => {
                    error!("Chatroom index references missing room {}", id);
                }
                Err(e) => {
                    return Err(e);
                }
            }
        }
        Ok(rooms)
    }
}

#[async_trait]
impl ChatroomStore for RedisChatroomStore {
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

        let mut conn = self.get_connection().await?;
        let pair_key = self.pair_key(&listing.id, buyer);

        if let Some(existing_id) = conn.get::<_, Option<String>>(&pair_key).await? {
            let room = self.load_room(&mut conn, &existing_id).await?;
            return Ok((room, false));
        }

        let room = Chatroom::new(listing.clone(), buyer, seller);
        let meta = RoomMeta {
            id: room.id.clone(),
            listing: room.listing.clone(),
            buyer: room.buyer.clone(),
            seller: room.seller.clone(),
            created_at: room.created_at,
        };
        // The meta document goes in before the pair claim: any client
        // that can observe the pair key can already load the room.
        let _: () = conn.set(self.meta_key(&room.id), serde_json::to_string(&meta)?).await?;

        let claimed: bool = conn.set_nx(&pair_key, &room.id).await?;
        if !claimed {
            // Lost the race to a concurrent create for the same pair.
            // Our meta document is unreferenced; drop it and load the
            // winner's room.
            let _: () = conn.del(self.meta_key(&room.id)).await?;
            let existing_id: String = conn.get(&pair_key).await?;
            let room = self.load_room(&mut conn, &existing_id).await?;
            return Ok((room, false));
        }

        let _: () = redis::pipe()
            .atomic()
            .sadd(self.user_key(buyer), &room.id).ignore()
            .sadd(self.user_key(seller), &room.id).ignore()
            .sadd(self.listing_key(&listing.id), &room.id).ignore()
            .query_async(&mut conn).await?;

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

        let lock = self.room_lock(chatroom_id).await;
        let _guard = lock.lock().await;

        let mut conn = self.get_connection().await?;
        let meta = self.load_meta(&mut conn, chatroom_id).await?;
        let recipient_role = if meta.buyer == sender {
            ParticipantRole::Seller
        } else if meta.seller == sender {
            ParticipantRole::Buyer
        } else {
            return Err(
                ChatError::Authorization(
                    format!("user {} is not a participant of chatroom {}", sender, chatroom_id)
                )
            );
        };

        let message = Message::new(chatroom_id, sender, content);
        let message_json = serde_json::to_string(&message)?;
        let _: () = redis::pipe()
            .atomic()
            .rpush(self.msgs_key(chatroom_id), message_json).ignore()
            .sadd(self.unread_key(chatroom_id, recipient_role), &message.id).ignore()
            .query_async(&mut conn).await?;

        Ok(message)
    }

    async fn find_chatroom(&self, chatroom_id: &str) -> Result<Chatroom, ChatError> {
        let mut conn = self.get_connection().await?;
        self.load_room(&mut conn, chatroom_id).await
    }

    async fn list_chatrooms_for_user(&self, user_id: &str) -> Result<Vec<Chatroom>, ChatError> {
        let mut conn = self.get_connection().await?;
        let mut rooms = self.load_rooms_by_index(&mut conn, self.user_key(user_id)).await?;
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
        let lock = self.room_lock(chatroom_id).await;
        let _guard = lock.lock().await;

        let mut conn = self.get_connection().await?;
        // Surface NotFound before quietly clearing a nonexistent room.
        let _meta = self.load_meta(&mut conn, chatroom_id).await?;

        let unread_key = self.unread_key(chatroom_id, role);
        let wanted: HashSet<String> = conn.smembers(&unread_key).await?;
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let indexed = self.load_message_entries(&mut conn, chatroom_id).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut cleared = Vec::new();
        let msgs_key = self.msgs_key(chatroom_id);
        for (index, message) in &indexed {
            if wanted.contains(&message.id) {
                let mut updated = message.clone();
                if updated.advance_status(MessageStatus::Read) {
                    pipe.lset(&msgs_key, *index as isize, serde_json::to_string(&updated)?).ignore();
                }
                cleared.push(message.id.clone());
            }
        }
        pipe.del(&unread_key).ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(cleared)
    }

    async fn mark_delivered(
        &self,
        chatroom_id: &str,
        message_id: &str
    ) -> Result<Option<Message>, ChatError> {
        let lock = self.room_lock(chatroom_id).await;
        let _guard = lock.lock().await;

        let mut conn = self.get_connection().await?;
        let indexed = self.load_message_entries(&mut conn, chatroom_id).await?;
        let (index, message) = indexed
            .iter()
            .find(|(_, m)| m.id == message_id)
            .map(|(index, message)| (*index, message))
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;

        let mut updated = message.clone();
        if !updated.advance_status(MessageStatus::Delivered) {
            return Ok(None);
        }

        let _: () = conn
            .lset(self.msgs_key(chatroom_id), index as isize, serde_json::to_string(&updated)?)
            .await?;
        Ok(Some(updated))
    }

    async fn set_listing_sold(&self, listing_id: &str) -> Result<Vec<String>, ChatError> {
        let mut conn = self.get_connection().await?;
        let room_ids: Vec<String> = conn.smembers(self.listing_key(listing_id)).await?;

        let mut affected = Vec::new();
        for chatroom_id in &room_ids {
            let lock = self.room_lock(chatroom_id).await;
            let _guard = lock.lock().await;

            let mut meta = match self.load_meta(&mut conn, chatroom_id).await {
                Ok(meta) => meta,
                Err(ChatError::NotFound(_)) => {
                    error!("Listing index references missing room {}", chatroom_id);
                    continue;
                }
                Err(e) => {
                    return Err(e);
                }
            };
            if !meta.listing.sold {
                meta.listing.sold = true;
                let _: () = conn.set(self.meta_key(chatroom_id), serde_json::to_string(&meta)?).await?;
            }
            affected.push(chatroom_id.clone());
        }
        Ok(affected)
    }
}

fn parse_message_entries(chatroom_id: &str, entries: &[String]) -> Vec<(usize, Message)> {
    let mut messages = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        match serde_json::from_str::<Message>(entry) {
            Ok(message) => messages.push((index, message)),
            Err(e) => {
                error!("Skipping unparsable message in chatroom {}: {}", chatroom_id, e);
            }
        }
    }
    messages
}
