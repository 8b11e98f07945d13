use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use shared::domain::{ChatId, SessionIdentity, UserId};
use sync_core::{
    load_settings, ClientEvent, HttpMessageStore, LogAlertSink, PermissionState, SendDraft,
    SyncSession,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from client.toml and the environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    username: String,
    /// Chat to post `--text` into once the session is up.
    #[arg(long, requires = "text")]
    chat: Option<i64>,
    #[arg(long)]
    text: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let store = HttpMessageStore::new(&settings.server_url, settings.message_tail_limit as usize)
        .context("invalid server url")?;
    let session = SyncSession::new(Arc::new(store), Arc::new(LogAlertSink), settings);
    session
        .set_notification_permission(PermissionState::Granted)
        .await;

    let mut events = session.subscribe_events();
    session
        .init(SessionIdentity {
            user_id: UserId(args.user_id),
            username: args.username,
        })
        .await
        .context("initial load failed")?;
    print_chats(&session).await;

    if let (Some(chat), Some(text)) = (args.chat, args.text) {
        let ticket = session.send(SendDraft::text(ChatId(chat), text)).await?;
        match ticket.completion.await? {
            Ok(message_id) => info!(?message_id, "sent"),
            Err(err) => warn!("send failed: {err}"),
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::ChatsChanged) => print_chats(&session).await,
                Ok(ClientEvent::MessagesChanged { chat_id }) => {
                    if let Some(last) = session.messages_snapshot(chat_id).await.last() {
                        println!("[{}] {}: {}", chat_id.0, last.author_id.0, last.preview_text());
                    }
                }
                Ok(ClientEvent::UnreadChanged { chat_id, unread, mentioned }) => {
                    println!("[{}] unread={unread} mentioned={mentioned}", chat_id.0);
                }
                Ok(ClientEvent::SessionFailed(message)) => {
                    warn!("session failed: {message}");
                    break;
                }
                Ok(other) => info!(?other, "event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.teardown().await;
    Ok(())
}

async fn print_chats(session: &SyncSession) {
    for chat in session.chats_snapshot().await {
        let preview = chat
            .last_message
            .as_ref()
            .map(|preview| preview.content.as_str())
            .unwrap_or("");
        println!(
            "{:>6} {:<24} unread={:<3}{} {preview}",
            chat.id.0,
            chat.title.as_deref().unwrap_or("(direct)"),
            chat.unread,
            if chat.mentioned { " @" } else { "" },
        );
    }
}
