//! Merges remote changes into local state without duplicates or ordering breaks.

use shared::{
    domain::{ChatId, MessageId, TempId, UserId},
    protocol::{ChangeKind, MessagePatch, MessageRecord},
};
use tracing::debug;

use crate::{
    change::ChangeEvent,
    error::Anomaly,
    optimistic::{refresh_preview_after_delete, ConfirmOutcome, OptimisticWriteTracker},
    state::{insert_sorted, resettle, Message, SyncState},
};

/// What an applied change touched, for the layers downstream of the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub chats_changed: bool,
    pub messages_changed: Option<ChatId>,
    /// A message new to this client. Echoes of the viewer's own pending sends are not reported here.
    pub inserted: Option<Message>,
    pub confirmed: Option<TempId>,
    pub removed_chat: Option<ChatId>,
    pub refetch_chats: bool,
    pub relationships_changed: bool,
    pub notifications_changed: bool,
}

impl ApplyOutcome {
    pub fn is_noop(&self) -> bool {
        *self == ApplyOutcome::default()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconciliationEngine {
    viewer: UserId,
}

impl ReconciliationEngine {
    pub fn new(viewer: UserId) -> Self {
        Self { viewer }
    }

    pub fn viewer(&self) -> UserId {
        self.viewer
    }

    pub fn apply(
        &self,
        state: &mut SyncState,
        tracker: &mut OptimisticWriteTracker,
        event: ChangeEvent,
    ) -> Result<ApplyOutcome, Anomaly> {
        match event {
            ChangeEvent::MessageInserted(record) => self.insert(state, tracker, record),
            ChangeEvent::MessageUpdated(patch) => self.update(state, patch),
            ChangeEvent::MessageDeleted {
                chat_id,
                message_id,
            } => self.delete(state, tracker, chat_id, message_id),
            ChangeEvent::ChatUpserted(record) => {
                let chat_id = record.id;
                if state.upsert_chat(record) {
                    debug!(chat_id = chat_id.0, "reconcile: chat added");
                }
                Ok(ApplyOutcome {
                    chats_changed: true,
                    ..Default::default()
                })
            }
            ChangeEvent::ChatUpdated(patch) => {
                if !state.patch_chat(&patch) {
                    return Err(Anomaly::UnknownChat(patch.id));
                }
                Ok(ApplyOutcome {
                    chats_changed: true,
                    ..Default::default()
                })
            }
            ChangeEvent::ChatRemoved { chat_id } => {
                if !state.remove_chat(chat_id) {
                    return Err(Anomaly::UnknownChat(chat_id));
                }
                tracker.discard_chat(chat_id);
                Ok(ApplyOutcome {
                    chats_changed: true,
                    removed_chat: Some(chat_id),
                    ..Default::default()
                })
            }
            ChangeEvent::MembershipChanged { chat_id, user_id } => {
                debug!(chat_id = chat_id.0, user_id = user_id.0, "reconcile: membership changed");
                Ok(ApplyOutcome {
                    refetch_chats: true,
                    ..Default::default()
                })
            }
            ChangeEvent::RelationshipChanged { kind, record } => {
                let changed = match kind {
                    ChangeKind::Delete => state.relationships.remove(&record.id).is_some(),
                    ChangeKind::Insert | ChangeKind::Update => {
                        state.relationships.insert(record.id, record.clone()) != Some(record)
                    }
                };
                Ok(ApplyOutcome {
                    relationships_changed: changed,
                    ..Default::default()
                })
            }
            ChangeEvent::NotificationChanged { kind, record } => {
                if record.user_id != self.viewer {
                    return Ok(ApplyOutcome::default());
                }
                let changed = match kind {
                    ChangeKind::Delete => state.notifications.remove(&record.id).is_some(),
                    ChangeKind::Insert | ChangeKind::Update => {
                        state.notifications.insert(record.id, record.clone()) != Some(record)
                    }
                };
                Ok(ApplyOutcome {
                    notifications_changed: changed,
                    ..Default::default()
                })
            }
        }
    }

    fn insert(
        &self,
        state: &mut SyncState,
        tracker: &mut OptimisticWriteTracker,
        record: MessageRecord,
    ) -> Result<ApplyOutcome, Anomaly> {
        let chat_id = record.chat_id;
        if state.chat(chat_id).is_none() {
            return Err(Anomaly::UnknownChat(chat_id));
        }

        if let Some(temp_id) = tracker.match_echo(&record, self.viewer) {
            if let ConfirmOutcome::Confirmed { message_id, .. } =
                tracker.confirm(state, &temp_id, Some(record))
            {
                debug!(chat_id = chat_id.0, message_id = message_id.0, temp_id = %temp_id, "reconcile: echo confirmed pending send");
            }
            return Ok(ApplyOutcome {
                chats_changed: true,
                messages_changed: Some(chat_id),
                confirmed: Some(temp_id),
                ..Default::default()
            });
        }

        let message_id = record.id;
        let settled = record
            .client_token
            .as_ref()
            .filter(|_| record.author_id == self.viewer)
            .and_then(|token| tracker.settled_send(token));
        if let Some((settled_chat, settled_id)) = settled {
            if settled_chat == chat_id && settled_id != message_id {
                debug!(
                    chat_id = chat_id.0,
                    message_id = message_id.0,
                    settled_id = settled_id.0,
                    "reconcile: duplicate record of a settled send ignored"
                );
                return Ok(ApplyOutcome::default());
            }
        }

        let Some(messages) = state.messages_mut(chat_id) else {
            return Err(Anomaly::UnknownChat(chat_id));
        };
        if messages
            .iter()
            .any(|message| message.server_id() == Some(message_id))
        {
            return Ok(ApplyOutcome::default());
        }
        let message = Message::from_record(record);
        insert_sorted(messages, message.clone());

        let chats_changed = match state.chat_mut(chat_id) {
            Some(chat) => chat.observe_message(&message),
            None => false,
        };
        if chats_changed {
            state.sort_chats();
        }
        Ok(ApplyOutcome {
            chats_changed,
            messages_changed: Some(chat_id),
            inserted: Some(message),
            ..Default::default()
        })
    }

    fn update(&self, state: &mut SyncState, patch: MessagePatch) -> Result<ApplyOutcome, Anomaly> {
        let chat_id = patch.chat_id;
        let message_id = patch.id;
        let messages = state
            .messages_mut(chat_id)
            .ok_or(Anomaly::UnknownChat(chat_id))?;
        let index = messages
            .iter()
            .position(|message| message.server_id() == Some(message_id))
            .ok_or(Anomaly::UnknownMessage {
                chat_id,
                message_id,
            })?;

        let before = messages[index].clone();
        messages[index].merge(&patch);
        if messages[index] == before {
            return Ok(ApplyOutcome::default());
        }
        resettle(messages, index);
        let preview = messages
            .iter()
            .find(|message| message.server_id() == Some(message_id))
            .map(Message::preview);

        let mut chats_changed = false;
        if let (Some(preview), Some(chat)) = (preview, state.chat_mut(chat_id)) {
            if let Some(current) = chat.last_message.as_mut() {
                if current.message_id == Some(message_id) && *current != preview {
                    *current = preview;
                    chats_changed = true;
                }
            }
        }
        Ok(ApplyOutcome {
            chats_changed,
            messages_changed: Some(chat_id),
            ..Default::default()
        })
    }

    fn delete(
        &self,
        state: &mut SyncState,
        tracker: &mut OptimisticWriteTracker,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<ApplyOutcome, Anomaly> {
        let messages = state
            .messages_mut(chat_id)
            .ok_or(Anomaly::UnknownChat(chat_id))?;
        let message = messages
            .iter_mut()
            .find(|message| message.server_id() == Some(message_id))
            .ok_or(Anomaly::UnknownMessage {
                chat_id,
                message_id,
            })?;
        // Local edits of a message the server deleted can no longer be undone.
        tracker.discard_mutations_of(message_id);
        if message.deleted {
            return Ok(ApplyOutcome::default());
        }
        message.mark_deleted();

        let points_at_deleted = |state: &SyncState| {
            state
                .chat(chat_id)
                .and_then(|chat| chat.last_message.as_ref())
                .is_some_and(|preview| preview.message_id == Some(message_id))
        };
        let chats_changed = points_at_deleted(state);
        refresh_preview_after_delete(state, chat_id, message_id);
        if let Some(chat) = state.chat_mut(chat_id) {
            chat.mentions.retain(|id| *id != message_id);
        }
        Ok(ApplyOutcome {
            chats_changed,
            messages_changed: Some(chat_id),
            ..Default::default()
        })
    }

    /// Remove a message record outright. Used for admin purges only.
    pub fn purge(
        &self,
        state: &mut SyncState,
        tracker: &mut OptimisticWriteTracker,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<ApplyOutcome, Anomaly> {
        let messages = state
            .messages_mut(chat_id)
            .ok_or(Anomaly::UnknownChat(chat_id))?;
        let before = messages.len();
        messages.retain(|message| message.server_id() != Some(message_id));
        if messages.len() == before {
            return Err(Anomaly::UnknownMessage {
                chat_id,
                message_id,
            });
        }
        let newest = messages
            .iter()
            .rev()
            .find(|message| !message.is_pending())
            .map(Message::preview);
        tracker.discard_mutations_of(message_id);

        let mut chats_changed = false;
        if let Some(chat) = state.chat_mut(chat_id) {
            chat.mentions.retain(|id| *id != message_id);
            let pointed_here = chat
                .last_message
                .as_ref()
                .is_some_and(|preview| preview.message_id == Some(message_id));
            if pointed_here {
                chat.last_message = newest;
                chats_changed = true;
            }
        }
        if chats_changed {
            state.sort_chats();
        }
        Ok(ApplyOutcome {
            chats_changed,
            messages_changed: Some(chat_id),
            ..Default::default()
        })
    }

    /// Merge a page of older history. Returns how many messages were new.
    pub fn merge_history(
        &self,
        state: &mut SyncState,
        chat_id: ChatId,
        records: Vec<MessageRecord>,
    ) -> Result<usize, Anomaly> {
        let messages = state
            .messages_mut(chat_id)
            .ok_or(Anomaly::UnknownChat(chat_id))?;
        let mut added = 0;
        for record in records {
            if record.chat_id != chat_id {
                continue;
            }
            let exists = messages
                .iter()
                .any(|message| message.server_id() == Some(record.id));
            if !exists {
                insert_sorted(messages, Message::from_record(record));
                added += 1;
            }
        }
        Ok(added)
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
