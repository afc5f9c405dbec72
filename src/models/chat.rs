use chrono::Utc;
use serde::{ Serialize, Deserialize };

/// Side of the conversation a user occupies within one chatroom.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Buyer,
    Seller,
}

impl ParticipantRole {
    pub fn other(&self) -> ParticipantRole {
        match self {
            ParticipantRole::Buyer => ParticipantRole::Seller,
            ParticipantRole::Seller => ParticipantRole::Buyer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Buyer => "buyer",
            ParticipantRole::Seller => "seller",
        }
    }
}

/// Delivery state of a message. Transitions are one-way:
/// Sent -> Delivered -> Read. A status never moves backwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chatroom_id: String,
    pub sender: String,
    pub content: String,
    pub status: MessageStatus,
    /// Epoch milliseconds, assigned by the server at persist time.
    pub created_at: i64,
    pub updated_at: i64,
}

impl Message {
    pub fn new(chatroom_id: &str, sender: &str, content: &str) -> Message {
        let now = Utc::now().timestamp_millis();
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            chatroom_id: chatroom_id.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            status: MessageStatus::Sent,
            created_at: now,
            updated_at: now,
        }
    }

    /// Advances the status, ignoring transitions that would move it
    /// backwards. Returns true when the status actually changed.
    pub fn advance_status(&mut self, status: MessageStatus) -> bool {
        if status > self.status {
            self.status = status;
            self.updated_at = Utc::now().timestamp_millis();
            true
        } else {
            false
        }
    }
}

/// Denormalized view of the listing a chatroom is attached to. Kept on
/// the chatroom document so clients can render without a directory call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListingSummary {
    pub id: String,
    pub title: String,
    pub sold: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chatroom {
    pub id: String,
    pub listing: ListingSummary,
    pub buyer: String,
    pub seller: String,
    pub created_at: i64,
    pub messages: Vec<Message>,
    pub last_message: Option<Message>,
    pub unread_msg_ids_by_buyer: Vec<String>,
    pub unread_msg_ids_by_seller: Vec<String>,
}

impl Chatroom {
    pub fn new(listing: ListingSummary, buyer: &str, seller: &str) -> Chatroom {
        Chatroom {
            id: uuid::Uuid::new_v4().to_string(),
            listing,
            buyer: buyer.to_string(),
            seller: seller.to_string(),
            created_at: Utc::now().timestamp_millis(),
            messages: Vec::new(),
            last_message: None,
            unread_msg_ids_by_buyer: Vec::new(),
            unread_msg_ids_by_seller: Vec::new(),
        }
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.buyer == user_id || self.seller == user_id
    }

    pub fn role_of(&self, user_id: &str) -> Option<ParticipantRole> {
        if self.buyer == user_id {
            Some(ParticipantRole::Buyer)
        } else if self.seller == user_id {
            Some(ParticipantRole::Seller)
        } else {
            None
        }
    }

    pub fn participant(&self, role: ParticipantRole) -> &str {
        match role {
            ParticipantRole::Buyer => &self.buyer,
            ParticipantRole::Seller => &self.seller,
        }
    }

    pub fn unread_for(&self, role: ParticipantRole) -> &Vec<String> {
        match role {
            ParticipantRole::Buyer => &self.unread_msg_ids_by_buyer,
            ParticipantRole::Seller => &self.unread_msg_ids_by_seller,
        }
    }

    pub fn unread_for_mut(&mut self, role: ParticipantRole) -> &mut Vec<String> {
        match role {
            ParticipantRole::Buyer => &mut self.unread_msg_ids_by_buyer,
            ParticipantRole::Seller => &mut self.unread_msg_ids_by_seller,
        }
    }
}
