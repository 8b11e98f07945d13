//! The session context: owns all synchronized state and wires the components together.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use chrono::Utc;
use shared::{
    domain::{ChatId, MessageId, SessionIdentity, TempId, UserId},
    protocol::{
        BulkSnapshot, MessageRecord, Resource, ResourceKey, WriteKind, WriteRequest,
        WriteResponse,
    },
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    error::{Anomaly, SyncError},
    notify::{AlertContext, AlertSink, NotificationDispatcher, PermissionState},
    optimistic::{AttemptFailure, ConfirmOutcome, MutationOp, OptimisticWriteTracker, SendDraft},
    reconcile::{ApplyOutcome, ReconciliationEngine},
    state::{ChatSummary, Message, SyncState},
    store::MessageStore,
    subscriptions::{RoutedChange, SubscriptionManager, SubscriptionSignal},
    unread::{FocusState, UnreadAndMentionTracker, UnreadChange},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ChatsChanged,
    MessagesChanged {
        chat_id: ChatId,
    },
    UnreadChanged {
        chat_id: ChatId,
        unread: u32,
        mentioned: bool,
    },
    RelationshipsChanged,
    NotificationsChanged,
    WriteConfirmed {
        temp_id: TempId,
        message_id: Option<MessageId>,
    },
    WriteFailed {
        kind: WriteKind,
        temp_id: Option<TempId>,
        message: String,
        transient: bool,
    },
    SubscriptionFailed {
        key: ResourceKey,
        message: String,
    },
    /// Initial load failed; the caller should sign out and retry.
    SessionFailed(String),
}

impl From<UnreadChange> for ClientEvent {
    fn from(change: UnreadChange) -> Self {
        ClientEvent::UnreadChanged {
            chat_id: change.chat_id,
            unread: change.unread,
            mentioned: change.mentioned,
        }
    }
}

/// Handle to an optimistic write in flight.
#[derive(Debug)]
pub struct WriteTicket {
    pub temp_id: TempId,
    /// Resolves to the server id of the written message, when the store returned one.
    pub completion: JoinHandle<Result<Option<MessageId>, SyncError>>,
}

/// Per-identity collaborators, rebuilt on every `init`.
struct SessionParts {
    identity: SessionIdentity,
    engine: ReconciliationEngine,
    unread: UnreadAndMentionTracker,
    notifier: NotificationDispatcher,
}

struct SessionInner {
    parts: Option<SessionParts>,
    state: SyncState,
    tracker: OptimisticWriteTracker,
    subscriptions: SubscriptionManager,
    focus: FocusState,
    permission: PermissionState,
}

impl SessionInner {
    fn viewer(&self) -> Result<UserId, SyncError> {
        self.parts
            .as_ref()
            .map(|parts| parts.identity.user_id)
            .ok_or(SyncError::NotInitialized)
    }

    fn is_viewer(&self, viewer: UserId) -> bool {
        self.parts
            .as_ref()
            .is_some_and(|parts| parts.identity.user_id == viewer)
    }

    fn alert_context(&self, chat_id: ChatId) -> AlertContext {
        AlertContext {
            open_and_focused: self.focus.is_open_and_focused(chat_id),
            window_focused: self.focus.window_focused,
            permission: self.permission,
        }
    }
}

pub struct SyncSession {
    store: Arc<dyn MessageStore>,
    alerts: Arc<dyn AlertSink>,
    settings: ClientSettings,
    inner: Mutex<SessionInner>,
    events: broadcast::Sender<ClientEvent>,
    signals: Mutex<Option<mpsc::UnboundedReceiver<SubscriptionSignal>>>,
}

fn subscription_keys(viewer: UserId) -> Vec<ResourceKey> {
    Resource::ALL
        .into_iter()
        .map(|resource| {
            let filter = match resource {
                Resource::Notifications => Some(format!("user_id=eq.{}", viewer.0)),
                _ => None,
            };
            ResourceKey::new(resource, filter)
        })
        .collect()
}

impl SyncSession {
    pub fn new(
        store: Arc<dyn MessageStore>,
        alerts: Arc<dyn AlertSink>,
        settings: ClientSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            alerts,
            settings,
            inner: Mutex::new(SessionInner {
                parts: None,
                state: SyncState::default(),
                tracker: OptimisticWriteTracker::default(),
                subscriptions: SubscriptionManager::new(signal_tx),
                focus: FocusState::default(),
                permission: PermissionState::default(),
            }),
            events,
            signals: Mutex::new(Some(signal_rx)),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: impl IntoIterator<Item = ClientEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    pub async fn identity(&self) -> Option<SessionIdentity> {
        let inner = self.inner.lock().await;
        inner.parts.as_ref().map(|parts| parts.identity.clone())
    }

    /// Load the viewer's state and open the push channels. Fatal if the initial load fails.
    pub async fn init(self: &Arc<Self>, identity: SessionIdentity) -> Result<(), SyncError> {
        let current = self.identity().await;
        if current.as_ref() == Some(&identity) {
            debug!(user_id = identity.user_id.0, "session: already initialized");
            return Ok(());
        }
        if current.is_some() {
            self.teardown().await;
        }

        let viewer = identity.user_id;
        let snapshot = match self.store.bulk_load(viewer).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(user_id = viewer.0, "session: initial load failed: {err}");
                self.emit(ClientEvent::SessionFailed(err.to_string()));
                return Err(SyncError::BulkLoad(err));
            }
        };

        let unread_events = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let parts = SessionParts {
                engine: ReconciliationEngine::new(viewer),
                unread: UnreadAndMentionTracker::new(viewer, identity.username.clone()),
                notifier: NotificationDispatcher::new(
                    viewer,
                    identity.username.clone(),
                    self.settings.alert_preview_chars,
                    Arc::clone(&self.alerts),
                ),
                identity: identity.clone(),
            };
            load_snapshot(inner, &parts, snapshot);
            let unread_events: Vec<ClientEvent> = inner
                .state
                .chats()
                .iter()
                .filter(|chat| chat.unread > 0)
                .map(|chat| ClientEvent::UnreadChanged {
                    chat_id: chat.id,
                    unread: chat.unread,
                    mentioned: !chat.mentions.is_empty(),
                })
                .collect();
            info!(
                user_id = viewer.0,
                chats = inner.state.chats().len(),
                unread_chats = unread_events.len(),
                "session: initial load applied"
            );
            inner.parts = Some(parts);
            unread_events
        };

        self.emit_all([
            ClientEvent::ChatsChanged,
            ClientEvent::RelationshipsChanged,
            ClientEvent::NotificationsChanged,
        ]);
        self.emit_all(unread_events);

        self.start_dispatcher().await;
        self.open_subscriptions(viewer).await;
        Ok(())
    }

    /// Close every subscription and drop all state. Safe to call repeatedly.
    pub async fn teardown(&self) {
        let mut inner = self.inner.lock().await;
        let closed = inner.subscriptions.close_all();
        let had_session = inner.parts.take().is_some();
        inner.state.clear();
        inner.tracker.clear();
        inner.focus = FocusState::default();
        drop(inner);
        if had_session {
            info!(closed, "session: torn down");
            self.emit(ClientEvent::ChatsChanged);
        }
    }

    async fn start_dispatcher(self: &Arc<Self>) {
        let Some(mut signals) = self.signals.lock().await.take() else {
            return;
        };
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.handle_signal(signal).await;
            }
        });
    }

    async fn open_subscriptions(&self, viewer: UserId) {
        {
            let mut inner = self.inner.lock().await;
            if inner.subscriptions.opened_for() == Some(viewer) {
                return;
            }
            inner.subscriptions.mark_opened_for(viewer);
        }
        for key in subscription_keys(viewer) {
            if let Err(err) = self.open_subscription(viewer, key).await {
                warn!("session: {err}");
            }
        }
    }

    async fn open_subscription(&self, viewer: UserId, key: ResourceKey) -> Result<bool, SyncError> {
        {
            let inner = self.inner.lock().await;
            if inner.subscriptions.is_open(&key) {
                return Ok(false);
            }
        }
        let stream = match self.store.subscribe(viewer, &key).await {
            Ok(stream) => stream,
            Err(source) => {
                self.emit(ClientEvent::SubscriptionFailed {
                    key: key.clone(),
                    message: source.to_string(),
                });
                return Err(SyncError::Subscription { key, source });
            }
        };
        let mut inner = self.inner.lock().await;
        // Identity may have changed while connecting.
        if inner.subscriptions.opened_for() != Some(viewer) {
            return Ok(false);
        }
        Ok(inner.subscriptions.open(key, stream))
    }

    /// Re-open a push channel that failed. A no-op while it is still open.
    pub async fn reopen_subscription(&self, resource: Resource) -> Result<bool, SyncError> {
        let viewer = self.inner.lock().await.viewer()?;
        let key = subscription_keys(viewer)
            .into_iter()
            .find(|key| key.resource == resource)
            .unwrap_or_else(|| ResourceKey::new(resource, None));
        self.open_subscription(viewer, key).await
    }

    async fn handle_signal(self: &Arc<Self>, signal: SubscriptionSignal) {
        match signal {
            SubscriptionSignal::Change(routed) => self.apply_change(routed).await,
            SubscriptionSignal::Failed {
                epoch,
                key,
                message,
            } => {
                let current = self.inner.lock().await.subscriptions.epoch();
                if epoch == current {
                    self.emit(ClientEvent::SubscriptionFailed { key, message });
                }
            }
        }
    }

    async fn apply_change(self: &Arc<Self>, routed: RoutedChange) {
        let (events, refetch) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            if routed.epoch != inner.subscriptions.epoch() {
                debug!(resource = %routed.key, "session: dropped change from closed session");
                return;
            }
            let Some(parts) = inner.parts.as_ref() else {
                return;
            };
            match parts
                .engine
                .apply(&mut inner.state, &mut inner.tracker, routed.event)
            {
                Ok(outcome) => {
                    let refetch = outcome.refetch_chats;
                    (follow_up(inner, outcome), refetch)
                }
                Err(anomaly) => {
                    debug!(resource = %routed.key, "session: discarded change: {anomaly}");
                    return;
                }
            }
        };
        self.emit_all(events);
        if refetch {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = session.refetch_chats().await {
                    warn!("session: chat refetch failed: {err}");
                }
            });
        }
    }

    /// Reload the chat list after a membership change. Unread counters of surviving chats are kept.
    pub async fn refetch_chats(&self) -> Result<(), SyncError> {
        let viewer = self.inner.lock().await.viewer()?;
        let records = self
            .store
            .fetch_chats(viewer)
            .await
            .map_err(SyncError::Fetch)?;

        let new_chats = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            if !inner.is_viewer(viewer) {
                return Ok(());
            }
            let keep: HashSet<ChatId> = records.iter().map(|record| record.id).collect();
            let stale: Vec<ChatId> = inner
                .state
                .chats()
                .iter()
                .map(|chat| chat.id)
                .filter(|chat_id| !keep.contains(chat_id))
                .collect();
            for chat_id in &stale {
                inner.state.remove_chat(*chat_id);
                inner.tracker.discard_chat(*chat_id);
            }
            let mut new_chats = Vec::new();
            for record in records {
                let chat_id = record.id;
                if inner.state.upsert_chat(record) {
                    new_chats.push(chat_id);
                }
            }
            info!(
                user_id = viewer.0,
                removed = stale.len(),
                added = new_chats.len(),
                "session: chat list refreshed"
            );
            new_chats
        };
        self.emit(ClientEvent::ChatsChanged);

        for chat_id in new_chats {
            let limit = self.settings.message_tail_limit as usize;
            match self.store.fetch_messages(viewer, chat_id, None, limit).await {
                Ok(records) => {
                    self.merge_page(viewer, chat_id, records, true).await?;
                }
                Err(err) => warn!(chat_id = chat_id.0, "session: tail fetch failed: {err}"),
            }
        }
        Ok(())
    }

    async fn merge_page(
        &self,
        viewer: UserId,
        chat_id: ChatId,
        records: Vec<MessageRecord>,
        recount: bool,
    ) -> Result<usize, SyncError> {
        let (added, unread) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            if !inner.is_viewer(viewer) {
                return Ok(0);
            }
            let Some(parts) = inner.parts.as_ref() else {
                return Ok(0);
            };
            let added = parts.engine.merge_history(&mut inner.state, chat_id, records)?;
            let newest = inner.state.messages(chat_id).last().cloned();
            let advanced = match (newest, inner.state.chat_mut(chat_id)) {
                (Some(newest), Some(chat)) => chat.observe_message(&newest),
                _ => false,
            };
            if advanced {
                inner.state.sort_chats();
            }
            let unread = if recount {
                parts.unread.recompute(&mut inner.state, chat_id)
            } else {
                None
            };
            (added, unread)
        };
        if added > 0 {
            self.emit(ClientEvent::MessagesChanged { chat_id });
        }
        if let Some(change) = unread {
            self.emit(change.into());
        }
        Ok(added)
    }

    /// Fetch a page of messages older than the oldest one held. Returns how many were new.
    pub async fn load_older(&self, chat_id: ChatId, limit: usize) -> Result<usize, SyncError> {
        let (viewer, before) = {
            let inner = self.inner.lock().await;
            let viewer = inner.viewer()?;
            if inner.state.chat(chat_id).is_none() {
                return Err(Anomaly::UnknownChat(chat_id).into());
            }
            let before = inner
                .state
                .messages(chat_id)
                .iter()
                .find_map(Message::server_id);
            (viewer, before)
        };
        let limit = if limit == 0 {
            self.settings.history_page_size as usize
        } else {
            limit
        };
        let records = self
            .store
            .fetch_messages(viewer, chat_id, before, limit)
            .await
            .map_err(SyncError::Fetch)?;
        self.merge_page(viewer, chat_id, records, false).await
    }

    /// Show `draft` at once as a pending message and write it in the background.
    pub async fn send(self: &Arc<Self>, draft: SendDraft) -> Result<WriteTicket, SyncError> {
        let chat_id = draft.chat_id;
        let (viewer, temp_id, request) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let viewer = inner.viewer()?;
            let temp_id = inner
                .tracker
                .begin_send(&mut inner.state, draft, viewer, Utc::now())?;
            let request = pending_request(&inner.tracker, &temp_id)?;
            (viewer, temp_id, request)
        };
        self.emit(ClientEvent::MessagesChanged { chat_id });
        Ok(self.spawn_write(viewer, temp_id, request))
    }

    /// Post a copy of an existing message into `target_chat_id`.
    pub async fn forward(
        self: &Arc<Self>,
        message_id: MessageId,
        target_chat_id: ChatId,
    ) -> Result<WriteTicket, SyncError> {
        let (viewer, temp_id, request) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let viewer = inner.viewer()?;
            let temp_id = inner.tracker.begin_forward(
                &mut inner.state,
                message_id,
                target_chat_id,
                viewer,
                Utc::now(),
            )?;
            let request = pending_request(&inner.tracker, &temp_id)?;
            (viewer, temp_id, request)
        };
        self.emit(ClientEvent::MessagesChanged {
            chat_id: target_chat_id,
        });
        Ok(self.spawn_write(viewer, temp_id, request))
    }

    pub async fn edit(
        self: &Arc<Self>,
        message_id: MessageId,
        body: impl Into<String>,
    ) -> Result<WriteTicket, SyncError> {
        self.mutate(message_id, MutationOp::Edit(body.into())).await
    }

    pub async fn delete(self: &Arc<Self>, message_id: MessageId) -> Result<WriteTicket, SyncError> {
        self.mutate(message_id, MutationOp::Delete).await
    }

    pub async fn react(
        self: &Arc<Self>,
        message_id: MessageId,
        emoji: impl Into<String>,
    ) -> Result<WriteTicket, SyncError> {
        self.mutate(message_id, MutationOp::ToggleReaction(emoji.into()))
            .await
    }

    pub async fn pin(self: &Arc<Self>, message_id: MessageId) -> Result<WriteTicket, SyncError> {
        self.mutate(message_id, MutationOp::TogglePin).await
    }

    pub async fn star(self: &Arc<Self>, message_id: MessageId) -> Result<WriteTicket, SyncError> {
        self.mutate(message_id, MutationOp::ToggleStar).await
    }

    async fn mutate(
        self: &Arc<Self>,
        message_id: MessageId,
        op: MutationOp,
    ) -> Result<WriteTicket, SyncError> {
        let (viewer, temp_id, request, chat_id) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let viewer = inner.viewer()?;
            let temp_id = inner.tracker.begin_mutation(
                &mut inner.state,
                message_id,
                op,
                viewer,
                Utc::now(),
            )?;
            let write = inner
                .tracker
                .get(&temp_id)
                .ok_or_else(|| SyncError::UnknownPendingWrite(temp_id.clone()))?;
            (viewer, temp_id.clone(), write.request.clone(), write.chat_id)
        };
        self.emit_all([
            ClientEvent::MessagesChanged { chat_id },
            ClientEvent::ChatsChanged,
        ]);
        Ok(self.spawn_write(viewer, temp_id, request))
    }

    /// Re-issue the write behind a pending send that is still shown.
    ///
    /// Every attempt carries the same client token, so whichever record lands
    /// first settles the send and later copies are ignored.
    pub async fn retry(self: &Arc<Self>, temp_id: &TempId) -> Result<WriteTicket, SyncError> {
        let (viewer, request) = {
            let mut inner = self.inner.lock().await;
            let viewer = inner.viewer()?;
            (viewer, inner.tracker.begin_retry(temp_id)?)
        };
        info!(temp_id = %temp_id, "session: retrying write");
        Ok(self.spawn_write(viewer, temp_id.clone(), request))
    }

    fn spawn_write(
        self: &Arc<Self>,
        viewer: UserId,
        temp_id: TempId,
        request: WriteRequest,
    ) -> WriteTicket {
        let session = Arc::clone(self);
        let task_temp_id = temp_id.clone();
        let completion =
            tokio::spawn(async move { session.complete_write(viewer, task_temp_id, request).await });
        WriteTicket {
            temp_id,
            completion,
        }
    }

    async fn complete_write(
        &self,
        viewer: UserId,
        temp_id: TempId,
        request: WriteRequest,
    ) -> Result<Option<MessageId>, SyncError> {
        let kind = request.kind();
        match self.store.write(viewer, request).await {
            Ok(response) => {
                let record = match response {
                    WriteResponse::Message(record) => Some(record),
                    WriteResponse::Ack => None,
                };
                let returned_id = record.as_ref().map(|record| record.id);
                let (outcome, message_id) = {
                    let mut guard = self.inner.lock().await;
                    let inner = &mut *guard;
                    if !inner.is_viewer(viewer) {
                        return Ok(returned_id);
                    }
                    let outcome = inner.tracker.confirm(&mut inner.state, &temp_id, record);
                    // A send settled by another attempt or by its echo keeps that id.
                    let settled = inner.tracker.settled_send(&temp_id).map(|(_, id)| id);
                    (outcome, settled.or(returned_id))
                };
                debug!(temp_id = %temp_id, %kind, ?outcome, "session: write acknowledged");
                match outcome {
                    ConfirmOutcome::Confirmed { chat_id, .. } => self.emit_all([
                        ClientEvent::MessagesChanged { chat_id },
                        ClientEvent::ChatsChanged,
                    ]),
                    ConfirmOutcome::Applied { chat_id } => {
                        self.emit(ClientEvent::MessagesChanged { chat_id })
                    }
                    ConfirmOutcome::AwaitingEcho | ConfirmOutcome::Missing => {}
                }
                self.emit(ClientEvent::WriteConfirmed {
                    temp_id,
                    message_id,
                });
                Ok(message_id)
            }
            Err(source) => {
                let failure = {
                    let mut guard = self.inner.lock().await;
                    let inner = &mut *guard;
                    if inner.is_viewer(viewer) {
                        Some(inner.tracker.fail_attempt(&mut inner.state, &temp_id))
                    } else {
                        None
                    }
                };
                let err = SyncError::WriteFailed { kind, source };
                match failure {
                    Some(AttemptFailure::Settled(message_id)) => {
                        debug!(temp_id = %temp_id, "session: request failed after its write settled: {err}");
                        self.emit(ClientEvent::WriteConfirmed {
                            temp_id,
                            message_id,
                        });
                        return Ok(message_id);
                    }
                    Some(AttemptFailure::StillPending) => {
                        warn!(temp_id = %temp_id, "session: attempt failed, write still pending: {err}");
                        return Err(err);
                    }
                    Some(AttemptFailure::RolledBack(write)) => {
                        warn!(temp_id = %temp_id, "session: {err}");
                        self.emit_all([
                            ClientEvent::MessagesChanged {
                                chat_id: write.chat_id,
                            },
                            ClientEvent::ChatsChanged,
                        ]);
                        self.emit(ClientEvent::WriteFailed {
                            kind,
                            temp_id: Some(temp_id),
                            message: err.to_string(),
                            transient: err.is_transient(),
                        });
                    }
                    None => warn!(temp_id = %temp_id, "session: {err}"),
                }
                Err(err)
            }
        }
    }

    /// Reset the chat's unread state locally and tell the store in the background.
    pub async fn mark_read(self: &Arc<Self>, chat_id: ChatId) -> Result<(), SyncError> {
        let (viewer, change) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let viewer = inner.viewer()?;
            let Some(parts) = inner.parts.as_ref() else {
                return Err(SyncError::NotInitialized);
            };
            let change = parts
                .unread
                .mark_read(&mut inner.state, chat_id)
                .ok_or(Anomaly::UnknownChat(chat_id))?;
            (viewer, change)
        };
        self.emit_all([change.into(), ClientEvent::MessagesChanged { chat_id }]);

        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(source) = session
                .store
                .write(viewer, WriteRequest::MarkRead { chat_id })
                .await
            {
                let err = SyncError::WriteFailed {
                    kind: WriteKind::MarkRead,
                    source,
                };
                warn!(chat_id = chat_id.0, "session: {err}");
                session.emit(ClientEvent::WriteFailed {
                    kind: WriteKind::MarkRead,
                    temp_id: None,
                    message: err.to_string(),
                    transient: err.is_transient(),
                });
            }
        });
        Ok(())
    }

    /// Remove a message record outright (moderation purge).
    pub async fn purge(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), SyncError> {
        let outcome = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let Some(parts) = inner.parts.as_ref() else {
                return Err(SyncError::NotInitialized);
            };
            parts
                .engine
                .purge(&mut inner.state, &mut inner.tracker, chat_id, message_id)?
        };
        self.emit_all(outcome_events(&outcome));
        Ok(())
    }

    pub async fn set_focus(&self, open_chat: Option<ChatId>, window_focused: bool) {
        let mut inner = self.inner.lock().await;
        inner.focus = FocusState {
            open_chat,
            window_focused,
        };
    }

    pub async fn set_notification_permission(&self, permission: PermissionState) {
        self.inner.lock().await.permission = permission;
    }

    pub async fn chats_snapshot(&self) -> Vec<ChatSummary> {
        self.inner.lock().await.state.chat_summaries()
    }

    pub async fn messages_snapshot(&self, chat_id: ChatId) -> Vec<Message> {
        self.inner.lock().await.state.messages(chat_id).to_vec()
    }

    pub async fn relationships_snapshot(&self) -> Vec<shared::protocol::RelationshipRecord> {
        self.inner.lock().await.state.relationships()
    }

    pub async fn notifications_snapshot(&self) -> Vec<shared::protocol::NotificationRecord> {
        self.inner.lock().await.state.notifications()
    }

    pub async fn open_subscriptions_count(&self) -> usize {
        self.inner.lock().await.subscriptions.open_keys().len()
    }
}

fn pending_request(tracker: &OptimisticWriteTracker, temp_id: &TempId) -> Result<WriteRequest, SyncError> {
    tracker
        .get(temp_id)
        .map(|write| write.request.clone())
        .ok_or_else(|| SyncError::UnknownPendingWrite(temp_id.clone()))
}

fn load_snapshot(inner: &mut SessionInner, parts: &SessionParts, snapshot: BulkSnapshot) {
    let viewer = parts.identity.user_id;
    inner.state.clear();
    inner.tracker.clear();
    for chat in snapshot.chats {
        inner.state.upsert_chat(chat);
    }

    let mut per_chat: BTreeMap<ChatId, Vec<MessageRecord>> = BTreeMap::new();
    for record in snapshot.messages {
        per_chat.entry(record.chat_id).or_default().push(record);
    }
    for (chat_id, records) in per_chat {
        if let Err(anomaly) = parts.engine.merge_history(&mut inner.state, chat_id, records) {
            debug!(chat_id = chat_id.0, "session: initial messages discarded: {anomaly}");
            continue;
        }
        let newest = inner.state.messages(chat_id).last().cloned();
        if let (Some(newest), Some(chat)) = (newest, inner.state.chat_mut(chat_id)) {
            chat.observe_message(&newest);
        }
    }
    inner.state.sort_chats();

    for record in snapshot.relationships {
        inner.state.relationships.insert(record.id, record);
    }
    for record in snapshot
        .notifications
        .into_iter()
        .filter(|record| record.user_id == viewer)
    {
        inner.state.notifications.insert(record.id, record);
    }
    parts.unread.recompute_all(&mut inner.state);
}

fn outcome_events(outcome: &ApplyOutcome) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    if outcome.chats_changed {
        events.push(ClientEvent::ChatsChanged);
    }
    if let Some(chat_id) = outcome.messages_changed {
        events.push(ClientEvent::MessagesChanged { chat_id });
    }
    if outcome.relationships_changed {
        events.push(ClientEvent::RelationshipsChanged);
    }
    if outcome.notifications_changed {
        events.push(ClientEvent::NotificationsChanged);
    }
    events
}

/// Counters and alerts for a freshly applied change.
fn follow_up(inner: &mut SessionInner, outcome: ApplyOutcome) -> Vec<ClientEvent> {
    let mut events = outcome_events(&outcome);
    let Some(parts) = inner.parts.as_ref() else {
        return events;
    };
    if let Some(message) = &outcome.inserted {
        let context = inner.alert_context(message.chat_id);
        if let Some(change) = parts
            .unread
            .on_insert(&mut inner.state, message, context.open_and_focused)
        {
            events.push(change.into());
        }
        parts.notifier.maybe_notify(&inner.state, message, context);
    }
    if let Some(temp_id) = outcome.confirmed {
        debug!(temp_id = %temp_id, "session: pending send settled by echo");
    }
    events
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
