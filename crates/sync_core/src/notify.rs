//! Decides whether an incoming message surfaces an alert, then hands it to an [`AlertSink`].

use std::sync::Arc;

use async_trait::async_trait;
use shared::domain::{ChatId, MessageId, UserId};
use tracing::{debug, info, warn};

use crate::{
    state::{Message, SyncState},
    unread::detect_mention,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    #[default]
    Undetermined,
}

/// Where an alert is shown: the OS notification center when the window is in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertChannel {
    System,
    InApp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub chat_id: ChatId,
    pub message_id: Option<MessageId>,
    pub title: String,
    pub icon: Option<String>,
    pub body: String,
    pub mentioned: bool,
    pub channel: AlertChannel,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn show(&self, alert: Alert) -> anyhow::Result<()>;
}

pub struct MissingAlertSink;

#[async_trait]
impl AlertSink for MissingAlertSink {
    async fn show(&self, _alert: Alert) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("alert sink is not configured"))
    }
}

/// Writes alerts to the log. Used by headless front ends.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn show(&self, alert: Alert) -> anyhow::Result<()> {
        info!(
            chat_id = alert.chat_id.0,
            channel = ?alert.channel,
            mentioned = alert.mentioned,
            "{}: {}",
            alert.title,
            alert.body
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlertContext {
    pub open_and_focused: bool,
    pub window_focused: bool,
    pub permission: PermissionState,
}

pub struct NotificationDispatcher {
    viewer: UserId,
    username: String,
    preview_chars: usize,
    sink: Arc<dyn AlertSink>,
}

impl NotificationDispatcher {
    pub fn new(
        viewer: UserId,
        username: impl Into<String>,
        preview_chars: usize,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            viewer,
            username: username.into(),
            preview_chars,
            sink,
        }
    }

    /// Build the alert for `message`, or `None` when it must stay silent.
    pub fn plan(&self, state: &SyncState, message: &Message, context: AlertContext) -> Option<Alert> {
        if message.author_id == self.viewer || message.deleted {
            return None;
        }
        if context.permission != PermissionState::Granted {
            return None;
        }
        if context.open_and_focused {
            return None;
        }
        let Some(sender) = state.display_name(message.chat_id, message.author_id) else {
            debug!(
                chat_id = message.chat_id.0,
                author_id = message.author_id.0,
                "notify: sender profile not cached, alert suppressed"
            );
            return None;
        };

        Some(Alert {
            chat_id: message.chat_id,
            message_id: message.server_id(),
            title: sender
                .display_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| sender.username.clone()),
            icon: sender.avatar_url.clone(),
            body: truncate_chars(&message.preview_text(), self.preview_chars),
            mentioned: detect_mention(message.body.as_deref(), &self.username),
            channel: if context.window_focused {
                AlertChannel::InApp
            } else {
                AlertChannel::System
            },
        })
    }

    /// Fire-and-forget delivery. Display failures are logged and swallowed.
    pub fn dispatch(&self, alert: Alert) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let chat_id = alert.chat_id.0;
            if let Err(err) = sink.show(alert).await {
                warn!(chat_id, "notify: alert not shown: {err:#}");
            }
        });
    }

    pub fn maybe_notify(
        &self,
        state: &SyncState,
        message: &Message,
        context: AlertContext,
    ) -> bool {
        match self.plan(state, message, context) {
            Some(alert) => {
                self.dispatch(alert);
                true
            }
            None => false,
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) if max > 0 => format!("{}…", &text[..cut]),
        _ => text.to_string(),
    }
}
