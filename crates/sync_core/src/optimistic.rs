//! Optimistic writes: applied locally first, then confirmed or rolled back.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, MessageId, MessageKey, TempId, UserId},
    protocol::{AttachmentPayload, MessagePreview, MessageRecord, WriteKind, WriteRequest},
};
use tracing::debug;

use crate::{
    error::{Anomaly, SyncError},
    state::{insert_sorted, newer_preview, resettle, Message, SyncState},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendDraft {
    pub chat_id: ChatId,
    pub body: Option<String>,
    pub attachment: Option<AttachmentPayload>,
    pub reply_to: Option<MessageId>,
}

impl SendDraft {
    pub fn text(chat_id: ChatId, body: impl Into<String>) -> Self {
        Self {
            chat_id,
            body: Some(body.into()),
            attachment: None,
            reply_to: None,
        }
    }

    fn is_empty(&self) -> bool {
        let has_body = self
            .body
            .as_deref()
            .is_some_and(|body| !body.trim().is_empty());
        !has_body && self.attachment.is_none()
    }
}

/// A change to an already confirmed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOp {
    Edit(String),
    Delete,
    ToggleReaction(String),
    TogglePin,
    ToggleStar,
}

/// What content-based matching compares when an echo carries no client token.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ContentSignature {
    chat_id: ChatId,
    author_id: UserId,
    body: Option<String>,
    attachment: Option<(String, u64)>,
}

impl ContentSignature {
    fn new(
        chat_id: ChatId,
        author_id: UserId,
        body: Option<&str>,
        attachment: Option<&AttachmentPayload>,
    ) -> Self {
        Self {
            chat_id,
            author_id,
            body: body
                .map(str::trim)
                .filter(|body| !body.is_empty())
                .map(str::to_string),
            attachment: attachment.map(|a| (a.name.clone(), a.size_bytes)),
        }
    }

    fn of_record(record: &MessageRecord) -> Self {
        Self::new(
            record.chat_id,
            record.author_id,
            record.body.as_deref(),
            record.attachment.as_ref(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Undo {
    Edit {
        body: Option<String>,
        edited: bool,
    },
    Delete {
        previous: Box<Message>,
    },
    ToggleReaction {
        emoji: String,
        viewer: UserId,
    },
    TogglePin,
    ToggleStar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingKind {
    Send {
        signature: ContentSignature,
        /// Chat preview shown while the send is pending.
        preview: MessagePreview,
        previous_preview: Option<MessagePreview>,
    },
    Mutation { message_id: MessageId, undo: Undo },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub temp_id: TempId,
    pub chat_id: ChatId,
    pub request: WriteRequest,
    pub created_at: DateTime<Utc>,
    sequence: u64,
    /// Requests for this write still in flight.
    attempts: u32,
    /// The store accepted a send without returning its record.
    acknowledged: bool,
    kind: PendingKind,
}

impl PendingWrite {
    pub fn kind(&self) -> WriteKind {
        self.request.kind()
    }

    pub fn is_send(&self) -> bool {
        matches!(self.kind, PendingKind::Send { .. })
    }

    pub fn target_message(&self) -> Option<MessageId> {
        match &self.kind {
            PendingKind::Mutation { message_id, .. } => Some(*message_id),
            PendingKind::Send { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The pending entry now carries its server id.
    Confirmed {
        chat_id: ChatId,
        message_id: MessageId,
    },
    /// The server acknowledged a send without returning the record; the realtime echo will finish it.
    AwaitingEcho,
    /// A mutation was acknowledged.
    Applied { chat_id: ChatId },
    /// Nothing pending under that id (already reconciled or rolled back).
    Missing,
}

/// What a failed request did to its pending write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    RolledBack(PendingWrite),
    /// Another request for the same write may still succeed.
    StillPending,
    /// The write was already settled, by its echo or a remote change.
    Settled(Option<MessageId>),
}

#[derive(Debug, Default)]
pub struct OptimisticWriteTracker {
    pending: HashMap<TempId, PendingWrite>,
    /// Client tokens of confirmed sends.
    settled: HashMap<TempId, (ChatId, MessageId)>,
    next_sequence: u64,
}

impl OptimisticWriteTracker {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn get(&self, temp_id: &TempId) -> Option<&PendingWrite> {
        self.pending.get(temp_id)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.settled.clear();
    }

    /// Chat and server id of the confirmed send that carried `token`.
    pub fn settled_send(&self, token: &TempId) -> Option<(ChatId, MessageId)> {
        self.settled.get(token).copied()
    }

    /// Append a pending message at the tail of its chat and return its temp id.
    pub fn begin_send(
        &mut self,
        state: &mut SyncState,
        draft: SendDraft,
        author_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<TempId, SyncError> {
        if draft.is_empty() {
            return Err(SyncError::EmptyDraft);
        }
        let temp_id = TempId::generate();
        let request = WriteRequest::SendMessage {
            chat_id: draft.chat_id,
            body: draft.body.clone(),
            attachment: draft.attachment.clone(),
            reply_to: draft.reply_to,
            client_token: temp_id.clone(),
        };
        self.push_pending_message(state, temp_id, draft, request, author_id, now)
    }

    /// Optimistically post a copy of an existing message into another chat.
    pub fn begin_forward(
        &mut self,
        state: &mut SyncState,
        message_id: MessageId,
        target_chat_id: ChatId,
        author_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<TempId, SyncError> {
        let source = state
            .locate_message(message_id)
            .ok_or(SyncError::UnknownMessage(message_id))?;
        if source.deleted {
            return Err(SyncError::MessageDeleted(message_id));
        }
        let draft = SendDraft {
            chat_id: target_chat_id,
            body: source.body.clone(),
            attachment: source.attachment.clone(),
            reply_to: None,
        };
        if draft.is_empty() {
            return Err(SyncError::EmptyDraft);
        }
        let temp_id = TempId::generate();
        let request = WriteRequest::ForwardMessage {
            message_id,
            target_chat_id,
            client_token: temp_id.clone(),
        };
        self.push_pending_message(state, temp_id, draft, request, author_id, now)
    }

    fn push_pending_message(
        &mut self,
        state: &mut SyncState,
        temp_id: TempId,
        draft: SendDraft,
        request: WriteRequest,
        author_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<TempId, SyncError> {
        let chat_id = draft.chat_id;
        let Some(chat) = state.chat(chat_id) else {
            return Err(Anomaly::UnknownChat(chat_id).into());
        };
        let previous_preview = chat.last_message.clone();
        // Tail placement must not break creation order under clock skew.
        let created_at = state
            .messages(chat_id)
            .last()
            .map_or(now, |last| last.created_at.max(now));
        let signature = ContentSignature::new(
            chat_id,
            author_id,
            draft.body.as_deref(),
            draft.attachment.as_ref(),
        );
        let message = Message {
            key: MessageKey::Pending(temp_id.clone()),
            chat_id,
            author_id,
            body: draft.body,
            attachment: draft.attachment,
            reply_to: draft.reply_to,
            created_at,
            edited: false,
            pinned: false,
            starred: false,
            reactions: Default::default(),
            read_by: Default::default(),
            deleted: false,
        };
        let preview = message.preview();
        let advanced = state
            .chat_mut(chat_id)
            .is_some_and(|chat| chat.observe_message(&message));
        if advanced {
            state.sort_chats();
        }
        state
            .messages_mut(chat_id)
            .ok_or(Anomaly::UnknownChat(chat_id))?
            .push(message);
        self.insert(PendingWrite {
            temp_id: temp_id.clone(),
            chat_id,
            request,
            created_at: now,
            sequence: 0,
            attempts: 1,
            acknowledged: false,
            kind: PendingKind::Send {
                signature,
                preview,
                previous_preview,
            },
        });
        debug!(chat_id = chat_id.0, temp_id = %temp_id, "optimistic: pending send appended");
        Ok(temp_id)
    }

    /// Apply a change to a confirmed message locally and remember how to undo it.
    pub fn begin_mutation(
        &mut self,
        state: &mut SyncState,
        message_id: MessageId,
        op: MutationOp,
        viewer: UserId,
        now: DateTime<Utc>,
    ) -> Result<TempId, SyncError> {
        let chat_id = state
            .locate_message(message_id)
            .map(|message| message.chat_id)
            .ok_or(SyncError::UnknownMessage(message_id))?;
        let message = find_confirmed_mut(state, chat_id, message_id)
            .ok_or(SyncError::UnknownMessage(message_id))?;
        if message.deleted {
            return Err(SyncError::MessageDeleted(message_id));
        }

        let (request, undo) = match op {
            MutationOp::Edit(body) => {
                let undo = Undo::Edit {
                    body: message.body.clone(),
                    edited: message.edited,
                };
                message.body = Some(body.clone());
                message.edited = true;
                (WriteRequest::EditMessage { message_id, body }, undo)
            }
            MutationOp::Delete => {
                let undo = Undo::Delete {
                    previous: Box::new(message.clone()),
                };
                message.mark_deleted();
                (WriteRequest::DeleteMessage { message_id }, undo)
            }
            MutationOp::ToggleReaction(emoji) => {
                toggle_reaction(message, &emoji, viewer);
                (
                    WriteRequest::ToggleReaction {
                        message_id,
                        emoji: emoji.clone(),
                    },
                    Undo::ToggleReaction { emoji, viewer },
                )
            }
            MutationOp::TogglePin => {
                message.pinned = !message.pinned;
                (WriteRequest::TogglePin { message_id }, Undo::TogglePin)
            }
            MutationOp::ToggleStar => {
                message.starred = !message.starred;
                (WriteRequest::ToggleStar { message_id }, Undo::ToggleStar)
            }
        };
        if matches!(request, WriteRequest::DeleteMessage { .. }) {
            refresh_preview_after_delete(state, chat_id, message_id);
        }

        let temp_id = TempId::generate();
        self.insert(PendingWrite {
            temp_id: temp_id.clone(),
            chat_id,
            request,
            created_at: now,
            sequence: 0,
            attempts: 1,
            acknowledged: false,
            kind: PendingKind::Mutation { message_id, undo },
        });
        Ok(temp_id)
    }

    fn insert(&mut self, mut write: PendingWrite) {
        write.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.pending.insert(write.temp_id.clone(), write);
    }

    /// Find the pending send a server-echoed record satisfies, if any.
    ///
    /// A record carrying a client token matches only that token. Records without
    /// one fall back to the oldest pending send with the same content signature.
    pub fn match_echo(&self, record: &MessageRecord, viewer: UserId) -> Option<TempId> {
        if record.author_id != viewer {
            return None;
        }
        if let Some(token) = &record.client_token {
            return self
                .pending
                .get(token)
                .filter(|write| write.is_send() && write.chat_id == record.chat_id)
                .map(|write| write.temp_id.clone());
        }
        let signature = ContentSignature::of_record(record);
        self.pending
            .values()
            .filter(|write| match &write.kind {
                PendingKind::Send {
                    signature: pending, ..
                } => *pending == signature,
                PendingKind::Mutation { .. } => false,
            })
            .min_by_key(|write| write.sequence)
            .map(|write| write.temp_id.clone())
    }

    /// Settle a pending write with the server's answer. Unknown ids are a no-op.
    pub fn confirm(
        &mut self,
        state: &mut SyncState,
        temp_id: &TempId,
        record: Option<MessageRecord>,
    ) -> ConfirmOutcome {
        match self.pending.get_mut(temp_id) {
            None => return ConfirmOutcome::Missing,
            Some(write) if write.is_send() && record.is_none() => {
                write.acknowledged = true;
                write.attempts = write.attempts.saturating_sub(1);
                return ConfirmOutcome::AwaitingEcho;
            }
            Some(_) => {}
        }
        let Some(write) = self.pending.remove(temp_id) else {
            return ConfirmOutcome::Missing;
        };
        let chat_id = write.chat_id;
        match (write.kind, record) {
            (PendingKind::Send { preview, .. }, Some(record)) => {
                let outcome = promote_pending(state, chat_id, temp_id, record, &preview);
                if let ConfirmOutcome::Confirmed { message_id, .. } = outcome {
                    self.settled.insert(temp_id.clone(), (chat_id, message_id));
                }
                outcome
            }
            (PendingKind::Send { .. }, None) => ConfirmOutcome::AwaitingEcho,
            (PendingKind::Mutation { message_id, .. }, record) => {
                if let Some(record) = record.filter(|record| record.id == message_id) {
                    if let Some(messages) = state.messages_mut(chat_id) {
                        if let Some(index) = messages
                            .iter()
                            .position(|message| message.server_id() == Some(message_id))
                        {
                            messages[index].absorb(record);
                            resettle(messages, index);
                        }
                    }
                }
                ConfirmOutcome::Applied { chat_id }
            }
        }
    }

    /// Issue one more request for a pending send and return it.
    pub fn begin_retry(&mut self, temp_id: &TempId) -> Result<WriteRequest, SyncError> {
        let write = self
            .pending
            .get_mut(temp_id)
            .filter(|write| write.is_send())
            .ok_or_else(|| SyncError::UnknownPendingWrite(temp_id.clone()))?;
        write.attempts += 1;
        Ok(write.request.clone())
    }

    /// Record a failed request. The write is rolled back only once no request for it can still land.
    pub fn fail_attempt(&mut self, state: &mut SyncState, temp_id: &TempId) -> AttemptFailure {
        if !self.pending.contains_key(temp_id) {
            return AttemptFailure::Settled(self.settled_send(temp_id).map(|(_, id)| id));
        }
        let Some(write) = self.pending.get_mut(temp_id) else {
            return AttemptFailure::Settled(None);
        };
        write.attempts = write.attempts.saturating_sub(1);
        if write.attempts > 0 || write.acknowledged {
            return AttemptFailure::StillPending;
        }
        match self.rollback(state, temp_id) {
            Some(write) => AttemptFailure::RolledBack(write),
            None => AttemptFailure::Settled(None),
        }
    }

    /// Undo a failed write. Returns the discarded pending write, if it existed.
    pub fn rollback(&mut self, state: &mut SyncState, temp_id: &TempId) -> Option<PendingWrite> {
        let write = self.pending.remove(temp_id)?;
        match &write.kind {
            PendingKind::Send {
                preview,
                previous_preview,
                ..
            } => {
                if let Some(messages) = state.messages_mut(write.chat_id) {
                    messages.retain(|message| message.key != MessageKey::Pending(temp_id.clone()));
                }
                restore_preview(state, write.chat_id, preview, previous_preview.clone());
            }
            PendingKind::Mutation { message_id, undo } => {
                if let Some(message) = find_confirmed_mut(state, write.chat_id, *message_id) {
                    revert(message, undo);
                }
                if matches!(undo, Undo::Delete { .. }) {
                    refresh_preview_after_delete(state, write.chat_id, *message_id);
                }
            }
        }
        debug!(chat_id = write.chat_id.0, temp_id = %temp_id, kind = %write.kind(), "optimistic: rolled back");
        Some(write)
    }

    /// Drop bookkeeping for a chat that left the local set.
    pub fn discard_chat(&mut self, chat_id: ChatId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, write| write.chat_id != chat_id);
        self.settled.retain(|_, (settled_chat, _)| *settled_chat != chat_id);
        before - self.pending.len()
    }

    /// Drop pending mutations of a message that was deleted remotely.
    pub fn discard_mutations_of(&mut self, message_id: MessageId) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, write| write.target_message() != Some(message_id));
        before - self.pending.len()
    }

    /// Pending sends still shown in the chat, oldest first.
    pub fn pending_sends(&self, chat_id: ChatId) -> Vec<TempId> {
        let mut sends: Vec<_> = self
            .pending
            .values()
            .filter(|write| write.is_send() && write.chat_id == chat_id)
            .collect();
        sends.sort_by_key(|write| write.sequence);
        sends.into_iter().map(|write| write.temp_id.clone()).collect()
    }
}

/// Replace the pending entry in place with the confirmed record.
fn promote_pending(
    state: &mut SyncState,
    chat_id: ChatId,
    temp_id: &TempId,
    record: MessageRecord,
    pending_preview: &MessagePreview,
) -> ConfirmOutcome {
    let message_id = record.id;
    let Some(messages) = state.messages_mut(chat_id) else {
        return ConfirmOutcome::Missing;
    };
    let pending_key = MessageKey::Pending(temp_id.clone());
    let pending_index = messages.iter().position(|message| message.key == pending_key);
    let existing_index = messages
        .iter()
        .position(|message| message.server_id() == Some(message_id));

    let settled_index = match (pending_index, existing_index) {
        (Some(pending), Some(existing)) => {
            // Already inserted under its server id: keep one copy, at the pending position.
            let mut confirmed = messages.remove(existing);
            let pending = if existing < pending { pending - 1 } else { pending };
            confirmed.absorb(record);
            messages[pending] = confirmed;
            pending
        }
        (Some(pending), None) => {
            messages[pending].absorb(record);
            pending
        }
        (None, Some(existing)) => {
            messages[existing].absorb(record);
            existing
        }
        (None, None) => insert_sorted(messages, Message::from_record(record)),
    };
    resettle(messages, settled_index);

    let settled = messages
        .iter()
        .find(|message| message.server_id() == Some(message_id))
        .cloned();
    let advanced = match (settled, state.chat_mut(chat_id)) {
        // The preview still shows the pending copy: hand it over to the confirmed one.
        (Some(settled), Some(chat)) if chat.last_message.as_ref() == Some(pending_preview) => {
            chat.last_message = Some(settled.preview());
            true
        }
        (Some(settled), Some(chat)) => chat.observe_message(&settled),
        _ => false,
    };
    if advanced {
        state.sort_chats();
    }
    ConfirmOutcome::Confirmed {
        chat_id,
        message_id,
    }
}

/// Put back the preview a rolled-back send had replaced.
fn restore_preview(
    state: &mut SyncState,
    chat_id: ChatId,
    pending_preview: &MessagePreview,
    previous: Option<MessagePreview>,
) {
    let newest = state.messages(chat_id).last().map(Message::preview);
    let Some(chat) = state.chat_mut(chat_id) else {
        return;
    };
    if chat.last_message.as_ref() != Some(pending_preview) {
        return;
    }
    chat.last_message = newer_preview(previous, newest);
    state.sort_chats();
}

fn find_confirmed_mut(
    state: &mut SyncState,
    chat_id: ChatId,
    message_id: MessageId,
) -> Option<&mut Message> {
    state
        .messages_mut(chat_id)?
        .iter_mut()
        .find(|message| message.server_id() == Some(message_id))
}

fn toggle_reaction(message: &mut Message, emoji: &str, viewer: UserId) {
    let users = message.reactions.entry(emoji.to_string()).or_default();
    if !users.remove(&viewer) {
        users.insert(viewer);
    }
    if users.is_empty() {
        message.reactions.remove(emoji);
    }
}

fn revert(message: &mut Message, undo: &Undo) {
    match undo {
        Undo::Edit { body, edited } => {
            if !message.deleted {
                message.body = body.clone();
                message.edited = *edited;
            }
        }
        Undo::Delete { previous } => {
            let read_by = std::mem::take(&mut message.read_by);
            *message = (**previous).clone();
            message.read_by.extend(read_by);
        }
        Undo::ToggleReaction { emoji, viewer } => toggle_reaction(message, emoji, *viewer),
        Undo::TogglePin => message.pinned = !message.pinned,
        Undo::ToggleStar => message.starred = !message.starred,
    }
}

/// Keep the chat preview in step when its newest message changes deletion state.
pub(crate) fn refresh_preview_after_delete(
    state: &mut SyncState,
    chat_id: ChatId,
    message_id: MessageId,
) {
    let Some(message) = state
        .find_message(chat_id, message_id)
        .map(|message| message.preview())
    else {
        return;
    };
    if let Some(chat) = state.chat_mut(chat_id) {
        if let Some(current) = chat.last_message.as_mut() {
            if current.message_id == Some(message_id) {
                *current = message;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/optimistic_tests.rs"]
mod tests;
