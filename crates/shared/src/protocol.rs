use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ChatId, ChatKind, MessageId, NotificationId, RelationshipId, RelationshipStatus, TempId, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Messages,
    Participants,
    Relationships,
    Notifications,
    Chats,
}

impl Resource {
    pub const ALL: [Resource; 5] = [
        Resource::Messages,
        Resource::Participants,
        Resource::Relationships,
        Resource::Notifications,
        Resource::Chats,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Messages => "messages",
            Resource::Participants => "participants",
            Resource::Relationships => "relationships",
            Resource::Notifications => "notifications",
            Resource::Chats => "chats",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A watched resource: table plus an optional row filter such as `user_id=eq.7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource: Resource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl ResourceKey {
    pub fn new(resource: Resource, filter: Option<String>) -> Self {
        Self { resource, filter }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            Some(filter) => write!(f, "{}[{}]", self.resource, filter),
            None => write!(f, "{}", self.resource),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Untyped push payload exactly as delivered by the store's realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChange {
    pub resource: Resource,
    pub kind: ChangeKind,
    #[serde(default)]
    pub record: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waveform: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub author_id: UserId,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub starred: bool,
    #[serde(default)]
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    #[serde(default)]
    pub read_by: BTreeSet<UserId>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<TempId>,
}

/// Partial message update. Absent fields are left untouched by the receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePatch {
    pub id: MessageId,
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starred: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<BTreeMap<String, BTreeSet<UserId>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_by: Option<BTreeSet<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub user: UserProfile,
    #[serde(default)]
    pub is_admin: bool,
}

/// Row of the participants table as pushed on membership changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantChange {
    pub chat_id: ChatId,
    pub user_id: UserId,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: ChatId,
    pub kind: ChatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub participants: Vec<ParticipantRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePreview>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPatch {
    pub id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePreview>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub id: RelationshipId,
    pub requester_id: UserId,
    pub addressee_id: UserId,
    pub status: RelationshipStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: NotificationId,
    pub user_id: UserId,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Everything a session needs before its first render.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkSnapshot {
    pub chats: Vec<ChatRecord>,
    pub messages: Vec<MessageRecord>,
    pub relationships: Vec<RelationshipRecord>,
    pub notifications: Vec<NotificationRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    Send,
    Edit,
    Delete,
    React,
    Pin,
    Star,
    MarkRead,
    Forward,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteKind::Send => "send",
            WriteKind::Edit => "edit",
            WriteKind::Delete => "delete",
            WriteKind::React => "react",
            WriteKind::Pin => "pin",
            WriteKind::Star => "star",
            WriteKind::MarkRead => "mark_read",
            WriteKind::Forward => "forward",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WriteRequest {
    SendMessage {
        chat_id: ChatId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<AttachmentPayload>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
        client_token: TempId,
    },
    EditMessage {
        message_id: MessageId,
        body: String,
    },
    DeleteMessage {
        message_id: MessageId,
    },
    ToggleReaction {
        message_id: MessageId,
        emoji: String,
    },
    TogglePin {
        message_id: MessageId,
    },
    ToggleStar {
        message_id: MessageId,
    },
    MarkRead {
        chat_id: ChatId,
    },
    ForwardMessage {
        message_id: MessageId,
        target_chat_id: ChatId,
        client_token: TempId,
    },
}

impl WriteRequest {
    pub fn kind(&self) -> WriteKind {
        match self {
            WriteRequest::SendMessage { .. } => WriteKind::Send,
            WriteRequest::EditMessage { .. } => WriteKind::Edit,
            WriteRequest::DeleteMessage { .. } => WriteKind::Delete,
            WriteRequest::ToggleReaction { .. } => WriteKind::React,
            WriteRequest::TogglePin { .. } => WriteKind::Pin,
            WriteRequest::ToggleStar { .. } => WriteKind::Star,
            WriteRequest::MarkRead { .. } => WriteKind::MarkRead,
            WriteRequest::ForwardMessage { .. } => WriteKind::Forward,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteEnvelope {
    pub user_id: UserId,
    pub request: WriteRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WriteResponse {
    Message(MessageRecord),
    Ack,
}
