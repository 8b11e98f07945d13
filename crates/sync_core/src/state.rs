//! Locally held view of chats and messages. Only the engine mutates it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, ChatKind, MessageId, MessageKey, NotificationId, RelationshipId, UserId},
    protocol::{
        AttachmentPayload, ChatPatch, ChatRecord, MessagePatch, MessagePreview, MessageRecord,
        NotificationRecord, ParticipantRecord, RelationshipRecord, UserProfile,
    },
};

pub const DELETED_MESSAGE_MARKER: &str = "This message was deleted";
const ATTACHMENT_PREVIEW_PREFIX: &str = "Attachment: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: MessageKey,
    pub chat_id: ChatId,
    pub author_id: UserId,
    pub body: Option<String>,
    pub attachment: Option<AttachmentPayload>,
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub edited: bool,
    pub pinned: bool,
    pub starred: bool,
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    pub read_by: BTreeSet<UserId>,
    pub deleted: bool,
}

impl Message {
    pub fn from_record(record: MessageRecord) -> Self {
        let mut message = Self {
            key: MessageKey::Confirmed(record.id),
            chat_id: record.chat_id,
            author_id: record.author_id,
            body: record.body,
            attachment: record.attachment,
            reply_to: record.reply_to,
            created_at: record.created_at,
            edited: record.edited,
            pinned: record.pinned,
            starred: record.starred,
            reactions: record.reactions,
            read_by: record.read_by,
            deleted: false,
        };
        if record.deleted {
            message.mark_deleted();
        }
        message
    }

    pub fn server_id(&self) -> Option<MessageId> {
        match &self.key {
            MessageKey::Confirmed(id) => Some(*id),
            MessageKey::Pending(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.key, MessageKey::Pending(_))
    }

    /// Field-wise merge: anything the patch leaves out is kept.
    pub fn merge(&mut self, patch: &MessagePatch) {
        if self.deleted {
            // Tombstones only track flags; content stays cleared.
            if let Some(pinned) = patch.pinned {
                self.pinned = pinned;
            }
            if let Some(read_by) = &patch.read_by {
                self.read_by.extend(read_by.iter().copied());
            }
            return;
        }
        if let Some(body) = &patch.body {
            self.body = Some(body.clone());
        }
        if let Some(attachment) = &patch.attachment {
            self.attachment = Some(attachment.clone());
        }
        if let Some(reply_to) = patch.reply_to {
            self.reply_to = Some(reply_to);
        }
        if let Some(edited) = patch.edited {
            self.edited = edited;
        }
        if let Some(pinned) = patch.pinned {
            self.pinned = pinned;
        }
        if let Some(starred) = patch.starred {
            self.starred = starred;
        }
        if let Some(reactions) = &patch.reactions {
            self.reactions = reactions.clone();
        }
        if let Some(read_by) = &patch.read_by {
            // Acknowledgements only grow.
            self.read_by.extend(read_by.iter().copied());
        }
        if patch.deleted == Some(true) {
            self.mark_deleted();
        }
    }

    /// Take over a server-confirmed record, keeping local read receipts.
    pub fn absorb(&mut self, record: MessageRecord) {
        let mut read_by = std::mem::take(&mut self.read_by);
        let confirmed = Message::from_record(record);
        read_by.extend(confirmed.read_by.iter().copied());
        *self = confirmed;
        self.read_by = read_by;
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.body = Some(DELETED_MESSAGE_MARKER.to_string());
        self.attachment = None;
        self.reactions.clear();
        self.edited = false;
        self.starred = false;
    }

    /// Text shown in chat-list previews and alerts.
    pub fn preview_text(&self) -> String {
        if self.deleted {
            return DELETED_MESSAGE_MARKER.to_string();
        }
        match (&self.body, &self.attachment) {
            (Some(body), _) if !body.trim().is_empty() => body.clone(),
            (_, Some(attachment)) => format!("{ATTACHMENT_PREVIEW_PREFIX}{}", attachment.name),
            _ => String::new(),
        }
    }

    pub fn preview(&self) -> MessagePreview {
        MessagePreview {
            message_id: self.server_id(),
            content: self.preview_text(),
            sent_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatState {
    pub id: ChatId,
    pub kind: ChatKind,
    pub title: Option<String>,
    pub avatar_url: Option<String>,
    pub participants: Vec<ParticipantRecord>,
    pub last_message: Option<MessagePreview>,
    pub created_at: DateTime<Utc>,
    pub unread: u32,
    /// Unread messages addressing the viewer, oldest first.
    pub mentions: Vec<MessageId>,
}

impl ChatState {
    pub fn from_record(record: ChatRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            title: record.title,
            avatar_url: record.avatar_url,
            participants: record.participants,
            last_message: record.last_message,
            created_at: record.created_at,
            unread: 0,
            mentions: Vec::new(),
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|preview| preview.sent_at.max(self.created_at))
            .unwrap_or(self.created_at)
    }

    pub fn participant(&self, user_id: UserId) -> Option<&UserProfile> {
        self.participants
            .iter()
            .map(|participant| &participant.user)
            .find(|user| user.user_id == user_id)
    }

    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.participant(user_id).is_some()
    }

    /// Replace server-owned metadata; local counters survive.
    fn replace_metadata(&mut self, record: ChatRecord) {
        let unread = self.unread;
        let mentions = std::mem::take(&mut self.mentions);
        let previous_preview = self.last_message.take();
        *self = ChatState::from_record(record);
        self.unread = unread;
        self.mentions = mentions;
        self.last_message = newer_preview(previous_preview, self.last_message.take());
    }

    fn apply_patch(&mut self, patch: &ChatPatch) {
        if let Some(title) = &patch.title {
            self.title = Some(title.clone());
        }
        if let Some(avatar_url) = &patch.avatar_url {
            self.avatar_url = Some(avatar_url.clone());
        }
        if let Some(preview) = &patch.last_message {
            self.last_message = newer_preview(self.last_message.take(), Some(preview.clone()));
        }
    }

    /// Advance the preview if `message` is at least as recent as the current one.
    pub fn observe_message(&mut self, message: &Message) -> bool {
        let is_newer = self
            .last_message
            .as_ref()
            .map_or(true, |current| message.created_at >= current.sent_at);
        if is_newer {
            self.last_message = Some(message.preview());
        }
        is_newer
    }
}

pub(crate) fn newer_preview(
    current: Option<MessagePreview>,
    incoming: Option<MessagePreview>,
) -> Option<MessagePreview> {
    match (current, incoming) {
        (Some(current), Some(incoming)) if current.sent_at > incoming.sent_at => Some(current),
        (current, None) => current,
        (_, incoming) => incoming,
    }
}

/// Read-only projection of a chat for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSummary {
    pub id: ChatId,
    pub kind: ChatKind,
    pub title: Option<String>,
    pub last_message: Option<MessagePreview>,
    pub unread: u32,
    pub mentioned: bool,
    pub first_unread_mention: Option<MessageId>,
}

#[derive(Debug, Default)]
pub struct SyncState {
    /// Most recent activity first.
    pub(crate) chats: Vec<ChatState>,
    /// Per chat, oldest first.
    pub(crate) messages: HashMap<ChatId, Vec<Message>>,
    pub(crate) relationships: BTreeMap<RelationshipId, RelationshipRecord>,
    pub(crate) notifications: BTreeMap<NotificationId, NotificationRecord>,
}

impl SyncState {
    pub fn chat(&self, chat_id: ChatId) -> Option<&ChatState> {
        self.chats.iter().find(|chat| chat.id == chat_id)
    }

    pub(crate) fn chat_mut(&mut self, chat_id: ChatId) -> Option<&mut ChatState> {
        self.chats.iter_mut().find(|chat| chat.id == chat_id)
    }

    pub fn chats(&self) -> &[ChatState] {
        &self.chats
    }

    pub fn messages(&self, chat_id: ChatId) -> &[Message] {
        self.messages
            .get(&chat_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub(crate) fn messages_mut(&mut self, chat_id: ChatId) -> Option<&mut Vec<Message>> {
        if self.chat(chat_id).is_none() {
            return None;
        }
        Some(self.messages.entry(chat_id).or_default())
    }

    pub fn find_message(&self, chat_id: ChatId, message_id: MessageId) -> Option<&Message> {
        self.messages(chat_id)
            .iter()
            .find(|message| message.server_id() == Some(message_id))
    }

    /// Locate a confirmed message without knowing its chat.
    pub fn locate_message(&self, message_id: MessageId) -> Option<&Message> {
        self.messages
            .values()
            .flat_map(|messages| messages.iter())
            .find(|message| message.server_id() == Some(message_id))
    }

    pub fn relationships(&self) -> Vec<RelationshipRecord> {
        self.relationships.values().cloned().collect()
    }

    /// Newest first.
    pub fn notifications(&self) -> Vec<NotificationRecord> {
        let mut notifications: Vec<_> = self.notifications.values().cloned().collect();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        notifications
    }

    pub fn chat_summaries(&self) -> Vec<ChatSummary> {
        self.chats
            .iter()
            .map(|chat| ChatSummary {
                id: chat.id,
                kind: chat.kind,
                title: chat.title.clone(),
                last_message: chat.last_message.clone(),
                unread: chat.unread,
                mentioned: !chat.mentions.is_empty(),
                first_unread_mention: chat.mentions.first().copied(),
            })
            .collect()
    }

    pub fn display_name(&self, chat_id: ChatId, user_id: UserId) -> Option<&UserProfile> {
        self.chat(chat_id)?.participant(user_id)
    }

    /// Insert or refresh a chat. Returns true when the chat is new.
    pub(crate) fn upsert_chat(&mut self, record: ChatRecord) -> bool {
        let is_new = match self.chat_mut(record.id) {
            Some(chat) => {
                chat.replace_metadata(record);
                false
            }
            None => {
                self.chats.push(ChatState::from_record(record));
                true
            }
        };
        self.sort_chats();
        is_new
    }

    pub(crate) fn patch_chat(&mut self, patch: &ChatPatch) -> bool {
        let Some(chat) = self.chat_mut(patch.id) else {
            return false;
        };
        let before = chat.last_activity();
        chat.apply_patch(patch);
        if chat.last_activity() != before {
            self.sort_chats();
        }
        true
    }

    pub(crate) fn remove_chat(&mut self, chat_id: ChatId) -> bool {
        let before = self.chats.len();
        self.chats.retain(|chat| chat.id != chat_id);
        self.messages.remove(&chat_id);
        self.chats.len() != before
    }

    pub(crate) fn sort_chats(&mut self) {
        self.chats.sort_by(|a, b| {
            b.last_activity()
                .cmp(&a.last_activity())
                .then_with(|| b.id.cmp(&a.id))
        });
    }

    pub(crate) fn clear(&mut self) {
        self.chats.clear();
        self.messages.clear();
        self.relationships.clear();
        self.notifications.clear();
    }
}

/// Insert keeping creation order; equal timestamps go after existing entries.
pub(crate) fn insert_sorted(messages: &mut Vec<Message>, message: Message) -> usize {
    let index = messages.partition_point(|existing| existing.created_at <= message.created_at);
    messages.insert(index, message);
    index
}

/// Restore creation order around `index` after its timestamp changed.
pub(crate) fn resettle(messages: &mut [Message], index: usize) {
    let out_of_order = (index > 0 && messages[index - 1].created_at > messages[index].created_at)
        || (index + 1 < messages.len()
            && messages[index].created_at > messages[index + 1].created_at);
    if out_of_order {
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    }
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;
