use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChatId, MessageId, MessageStatus},
    error::ApiError,
};

/// A message as it appears on the wire. Field names are part of the client
/// contract and must not change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_phone_number: String,
    pub receiver_phone_number: String,
    pub content: String,
    pub status: MessageStatus,
    pub is_encrypted: bool,
    pub created_at: DateTime<Utc>,
}

/// One chat in a user's chat list, messages already filtered by that user's
/// soft-delete horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub peer_phone_number: String,
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatListResponse {
    pub chats: Vec<ChatSummary>,
}

/// History between one pair of users, from the requesting side's view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairMessagesResponse {
    pub chats: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateResponse {
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearChatResponse {
    pub count: u64,
    pub message: String,
}

/// One entry per known conversation, present even when `messages` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEntry {
    pub chat_id: ChatId,
    pub peer_phone_number: String,
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub data: Vec<SyncEntry>,
}

/// Events a client sends over the live socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    Join {
        #[serde(rename = "phoneNumber")]
        phone_number: String,
    },
    SendPrivateMessage {
        #[serde(rename = "recipientPhoneNumber")]
        recipient_phone_number: String,
        #[serde(rename = "senderPhoneNumber")]
        sender_phone_number: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// The user opened the thread with `peer_phone_number`.
    OnlineWith {
        #[serde(rename = "phoneNumber")]
        phone_number: String,
        #[serde(rename = "peerPhoneNumber")]
        peer_phone_number: String,
    },
    /// The user left whatever thread they were viewing.
    OfflineWith {
        #[serde(rename = "phoneNumber")]
        phone_number: String,
    },
    /// One-shot presence announcement to a specific peer's connection.
    Online {
        #[serde(rename = "phoneNumber")]
        phone_number: String,
        #[serde(rename = "peerPhoneNumber")]
        peer_phone_number: String,
    },
    Offline {
        #[serde(rename = "phoneNumber")]
        phone_number: String,
        #[serde(rename = "peerPhoneNumber")]
        peer_phone_number: String,
    },
}

/// Events the server pushes to a live connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    ReceivePrivateMessage {
        #[serde(rename = "senderPhoneNumber")]
        sender_phone_number: String,
        message: MessagePayload,
    },
    /// Global "a new message exists" signal for UI badge refresh.
    NewMessage,
    PeerOnline {
        #[serde(rename = "phoneNumber")]
        phone_number: String,
    },
    PeerOffline {
        #[serde(rename = "phoneNumber")]
        phone_number: String,
    },
    Error(ApiError),
}
