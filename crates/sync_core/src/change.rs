//! Typed remote changes, narrowed from raw push payloads at the subscription boundary.

use serde::de::DeserializeOwned;
use shared::{
    domain::{ChatId, MessageId, UserId},
    protocol::{
        ChangeKind, ChatPatch, ChatRecord, MessagePatch, MessageRecord, NotificationRecord,
        ParticipantChange, RawChange, RelationshipRecord, Resource, ResourceKey,
    },
};

use crate::error::DecodeError;

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    MessageInserted(MessageRecord),
    MessageUpdated(MessagePatch),
    MessageDeleted {
        chat_id: ChatId,
        message_id: MessageId,
    },
    ChatUpserted(ChatRecord),
    ChatUpdated(ChatPatch),
    ChatRemoved {
        chat_id: ChatId,
    },
    /// Participant rows are too partial to patch in place; the chat list is refetched.
    MembershipChanged {
        chat_id: ChatId,
        user_id: UserId,
    },
    RelationshipChanged {
        kind: ChangeKind,
        record: RelationshipRecord,
    },
    NotificationChanged {
        kind: ChangeKind,
        record: NotificationRecord,
    },
}

#[derive(serde::Deserialize)]
struct MessageRef {
    id: MessageId,
    chat_id: ChatId,
}

#[derive(serde::Deserialize)]
struct ChatRef {
    id: ChatId,
}

impl ChangeEvent {
    pub fn from_raw(key: &ResourceKey, raw: RawChange) -> Result<Self, DecodeError> {
        if raw.resource != key.resource {
            return Err(DecodeError::ResourceMismatch {
                expected: key.resource,
                actual: raw.resource,
            });
        }
        let resource = raw.resource;

        match (resource, raw.kind) {
            (Resource::Messages, ChangeKind::Insert) => {
                Ok(ChangeEvent::MessageInserted(decode(resource, raw.record)?))
            }
            (Resource::Messages, ChangeKind::Update) => {
                let patch: MessagePatch = decode(resource, raw.record)?;
                if patch.deleted == Some(true) {
                    Ok(ChangeEvent::MessageDeleted {
                        chat_id: patch.chat_id,
                        message_id: patch.id,
                    })
                } else {
                    Ok(ChangeEvent::MessageUpdated(patch))
                }
            }
            (Resource::Messages, ChangeKind::Delete) => {
                let message: MessageRef = decode(resource, old_or_record(resource, raw)?)?;
                Ok(ChangeEvent::MessageDeleted {
                    chat_id: message.chat_id,
                    message_id: message.id,
                })
            }
            (Resource::Chats, ChangeKind::Insert) => {
                Ok(ChangeEvent::ChatUpserted(decode(resource, raw.record)?))
            }
            (Resource::Chats, ChangeKind::Update) => {
                Ok(ChangeEvent::ChatUpdated(decode(resource, raw.record)?))
            }
            (Resource::Chats, ChangeKind::Delete) => {
                let chat: ChatRef = decode(resource, old_or_record(resource, raw)?)?;
                Ok(ChangeEvent::ChatRemoved { chat_id: chat.id })
            }
            (Resource::Participants, kind) => {
                let row = if kind == ChangeKind::Delete {
                    old_or_record(resource, raw)?
                } else {
                    raw.record
                };
                let change: ParticipantChange = decode(resource, row)?;
                Ok(ChangeEvent::MembershipChanged {
                    chat_id: change.chat_id,
                    user_id: change.user_id,
                })
            }
            (Resource::Relationships, kind) => {
                let row = if kind == ChangeKind::Delete {
                    old_or_record(resource, raw)?
                } else {
                    raw.record
                };
                Ok(ChangeEvent::RelationshipChanged {
                    kind,
                    record: decode(resource, row)?,
                })
            }
            (Resource::Notifications, kind) => {
                let row = if kind == ChangeKind::Delete {
                    old_or_record(resource, raw)?
                } else {
                    raw.record
                };
                Ok(ChangeEvent::NotificationChanged {
                    kind,
                    record: decode(resource, row)?,
                })
            }
        }
    }

    /// The chat a change is scoped to, if any.
    pub fn chat_id(&self) -> Option<ChatId> {
        match self {
            ChangeEvent::MessageInserted(record) => Some(record.chat_id),
            ChangeEvent::MessageUpdated(patch) => Some(patch.chat_id),
            ChangeEvent::MessageDeleted { chat_id, .. }
            | ChangeEvent::ChatRemoved { chat_id }
            | ChangeEvent::MembershipChanged { chat_id, .. } => Some(*chat_id),
            ChangeEvent::ChatUpserted(record) => Some(record.id),
            ChangeEvent::ChatUpdated(patch) => Some(patch.id),
            ChangeEvent::RelationshipChanged { .. } => None,
            ChangeEvent::NotificationChanged { record, .. } => record.chat_id,
        }
    }
}

fn decode<T: DeserializeOwned>(
    resource: Resource,
    value: serde_json::Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|source| DecodeError::Malformed { resource, source })
}

/// Deletes carry the removed row in `old_record`; some relays put it in `record`.
fn old_or_record(resource: Resource, raw: RawChange) -> Result<serde_json::Value, DecodeError> {
    match raw.old_record {
        Some(old) if !old.is_null() => Ok(old),
        _ if !raw.record.is_null() => Ok(raw.record),
        _ => Err(DecodeError::MissingOldRecord { resource }),
    }
}
