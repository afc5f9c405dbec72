use serde::{ Serialize, Deserialize };

use crate::error::ChatError;
use crate::models::chat::{ Chatroom, Message };

/// Frames a connected client may send over the socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Subscribe this connection to a chatroom's live channel.
    #[serde(rename = "join")] Join {
        chatroom_id: String,
    },
    /// Drop this connection's subscription; the chatroom itself is untouched.
    #[serde(rename = "leave")] Leave {
        chatroom_id: String,
    },
    #[serde(rename = "send_message")] SendMessage {
        chatroom_id: String,
        content: String,
        /// Client-generated id used to reconcile the optimistic local
        /// entry once the acknowledgment arrives.
        correlation_id: String,
    },
    #[serde(rename = "start_typing")] StartTyping {
        chatroom_id: String,
    },
    #[serde(rename = "stop_typing")] StopTyping {
        chatroom_id: String,
    },
    /// Buyer has viewed the chatroom: clear the buyer-side unread set.
    #[serde(rename = "viewed_by_buyer")] ViewedByBuyer {
        chatroom_id: String,
    },
    #[serde(rename = "viewed_by_seller")] ViewedBySeller {
        chatroom_id: String,
    },
}

impl ClientEvent {
    pub fn chatroom_id(&self) -> &str {
        match self {
            ClientEvent::Join { chatroom_id }
            | ClientEvent::Leave { chatroom_id }
            | ClientEvent::SendMessage { chatroom_id, .. }
            | ClientEvent::StartTyping { chatroom_id }
            | ClientEvent::StopTyping { chatroom_id }
            | ClientEvent::ViewedByBuyer { chatroom_id }
            | ClientEvent::ViewedBySeller { chatroom_id } => chatroom_id,
        }
    }
}

/// Frames the server pushes to clients, either as a direct reply on the
/// originating connection or as a broadcast on a chatroom channel.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "insert_message")] InsertMessage {
        message: Message,
    },
    /// A message's status changed (delivery confirmation).
    #[serde(rename = "update_message")] UpdateMessage {
        message: Message,
    },
    #[serde(rename = "typing")] Typing {
        chatroom_id: String,
    },
    #[serde(rename = "stop_typing")] StopTyping {
        chatroom_id: String,
    },
    /// Pushed to the seller when a buyer opens the first chatroom for a
    /// listing.
    #[serde(rename = "add_new_chatroom")] AddNewChatroom {
        chatroom: Chatroom,
    },
    /// Instructs a client to drop a chatroom from its local view.
    #[serde(rename = "delete_chatroom")] DeleteChatroom {
        chatroom_id: String,
    },
    #[serde(rename = "listing_sold")] ListingSold {
        listing_id: String,
    },
    /// Direct reply to a send: carries the canonical persisted message
    /// for the optimistic entry keyed by `correlation_id`.
    #[serde(rename = "message_accepted")] MessageAccepted {
        correlation_id: String,
        message: Message,
    },
    #[serde(rename = "error")] Error {
        kind: String,
        message: String,
        retryable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
}

impl ServerEvent {
    pub fn from_error(err: &ChatError, correlation_id: Option<String>) -> ServerEvent {
        ServerEvent::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.retryable(),
            correlation_id,
        }
    }
}
