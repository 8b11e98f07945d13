//! Fixtures shared by the unit tests.

use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ChatId, ChatKind, MessageId, UserId},
    protocol::{ChatRecord, MessageRecord, ParticipantRecord, UserProfile},
};

use crate::state::SyncState;

pub(crate) const VIEWER: UserId = UserId(1);
pub(crate) const BOB: UserId = UserId(2);
pub(crate) const CAROL: UserId = UserId(3);

pub(crate) fn ts(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + offset_secs, 0)
        .single()
        .expect("valid timestamp")
}

pub(crate) fn profile(user_id: UserId, username: &str) -> UserProfile {
    UserProfile {
        user_id,
        username: username.to_string(),
        display_name: None,
        avatar_url: None,
    }
}

pub(crate) fn chat_record(id: i64, created_offset: i64) -> ChatRecord {
    ChatRecord {
        id: ChatId(id),
        kind: ChatKind::Group,
        title: Some(format!("chat-{id}")),
        avatar_url: None,
        participants: vec![
            ParticipantRecord {
                user: profile(VIEWER, "alice"),
                is_admin: true,
            },
            ParticipantRecord {
                user: profile(BOB, "bob"),
                is_admin: false,
            },
        ],
        last_message: None,
        created_at: ts(created_offset),
    }
}

pub(crate) fn message_record(
    id: i64,
    chat_id: i64,
    author_id: UserId,
    body: &str,
    offset: i64,
) -> MessageRecord {
    MessageRecord {
        id: MessageId(id),
        chat_id: ChatId(chat_id),
        author_id,
        body: Some(body.to_string()),
        attachment: None,
        reply_to: None,
        created_at: ts(offset),
        edited: false,
        pinned: false,
        starred: false,
        reactions: Default::default(),
        read_by: Default::default(),
        deleted: false,
        client_token: None,
    }
}

pub(crate) fn state_with_chats(ids: &[i64]) -> SyncState {
    let mut state = SyncState::default();
    for id in ids {
        state.upsert_chat(chat_record(*id, 0));
    }
    state
}

pub(crate) fn bodies(state: &SyncState, chat_id: i64) -> Vec<String> {
    state
        .messages(ChatId(chat_id))
        .iter()
        .map(|message| message.body.clone().unwrap_or_default())
        .collect()
}
