//! Unread counters and mention flags per chat.

use std::sync::OnceLock;

use regex::Regex;
use shared::domain::{ChatId, UserId};

use crate::state::{Message, SyncState};

/// Which chat the viewer is looking at, and whether the window has focus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FocusState {
    pub open_chat: Option<ChatId>,
    pub window_focused: bool,
}

impl FocusState {
    pub fn is_open_and_focused(&self, chat_id: ChatId) -> bool {
        self.window_focused && self.open_chat == Some(chat_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadChange {
    pub chat_id: ChatId,
    pub unread: u32,
    pub mentioned: bool,
}

fn mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Names may contain `.` and `-` but never end in one, so trailing punctuation is dropped.
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:^|[^\w@])@(\w(?:[\w.\-]*\w)?)").expect("valid regex")
    })
}

/// Whether `body` addresses `username` with `@username` or `@everyone`.
///
/// The token must start the text or follow a non-word character, and must match
/// the whole name, so `alice@example.com`, `@alice123` and `@alice.smith` do not
/// mention `alice`.
pub fn detect_mention(body: Option<&str>, username: &str) -> bool {
    let Some(body) = body.filter(|body| !body.is_empty()) else {
        return false;
    };
    mention_pattern().captures_iter(body).any(|captures| {
        captures.get(1).is_some_and(|token| {
            let token = token.as_str();
            token.eq_ignore_ascii_case("everyone")
                || (!username.is_empty() && token.to_lowercase() == username.to_lowercase())
        })
    })
}

#[derive(Debug, Clone)]
pub struct UnreadAndMentionTracker {
    viewer: UserId,
    username: String,
}

impl UnreadAndMentionTracker {
    pub fn new(viewer: UserId, username: impl Into<String>) -> Self {
        Self {
            viewer,
            username: username.into(),
        }
    }

    /// Count a newly arrived message. Returns the chat's new figures when they moved.
    pub fn on_insert(
        &self,
        state: &mut SyncState,
        message: &Message,
        open_and_focused: bool,
    ) -> Option<UnreadChange> {
        if message.author_id == self.viewer || open_and_focused || message.deleted {
            return None;
        }
        let mentioned = detect_mention(message.body.as_deref(), &self.username);
        let chat = state.chat_mut(message.chat_id)?;
        chat.unread = chat.unread.saturating_add(1);
        if mentioned {
            if let Some(message_id) = message.server_id() {
                if !chat.mentions.contains(&message_id) {
                    chat.mentions.push(message_id);
                }
            }
        }
        Some(UnreadChange {
            chat_id: chat.id,
            unread: chat.unread,
            mentioned: !chat.mentions.is_empty(),
        })
    }

    /// Reset the chat's counter and record the viewer on every message's read-by set.
    pub fn mark_read(&self, state: &mut SyncState, chat_id: ChatId) -> Option<UnreadChange> {
        let viewer = self.viewer;
        if let Some(messages) = state.messages_mut(chat_id) {
            for message in messages.iter_mut().filter(|message| !message.is_pending()) {
                message.read_by.insert(viewer);
            }
        }
        let chat = state.chat_mut(chat_id)?;
        chat.unread = 0;
        chat.mentions.clear();
        Some(UnreadChange {
            chat_id,
            unread: 0,
            mentioned: false,
        })
    }

    /// Derive counters from the loaded messages: other authors' messages the viewer has not read.
    pub fn recompute(&self, state: &mut SyncState, chat_id: ChatId) -> Option<UnreadChange> {
        let (unread, mentions) = {
            let unread_messages: Vec<&Message> = state
                .messages(chat_id)
                .iter()
                .filter(|message| {
                    message.author_id != self.viewer
                        && !message.deleted
                        && !message.is_pending()
                        && !message.read_by.contains(&self.viewer)
                })
                .collect();
            let mentions: Vec<_> = unread_messages
                .iter()
                .filter(|message| detect_mention(message.body.as_deref(), &self.username))
                .filter_map(|message| message.server_id())
                .collect();
            (unread_messages.len() as u32, mentions)
        };
        let chat = state.chat_mut(chat_id)?;
        chat.unread = unread;
        chat.mentions = mentions;
        Some(UnreadChange {
            chat_id,
            unread,
            mentioned: !chat.mentions.is_empty(),
        })
    }

    pub fn recompute_all(&self, state: &mut SyncState) {
        let chat_ids: Vec<_> = state.chats().iter().map(|chat| chat.id).collect();
        for chat_id in chat_ids {
            self.recompute(state, chat_id);
        }
    }
}
