//! One push-channel reader task per watched resource.

use std::collections::HashMap;

use futures::StreamExt;
use shared::{domain::UserId, protocol::ResourceKey};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{change::ChangeEvent, error::StoreError, store::ChangeStream};

#[derive(Debug, Clone, PartialEq)]
pub struct RoutedChange {
    /// Session epoch the subscription was opened in. Stale epochs are discarded downstream.
    pub epoch: u64,
    pub key: ResourceKey,
    pub event: ChangeEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionSignal {
    Change(RoutedChange),
    Failed {
        epoch: u64,
        key: ResourceKey,
        message: String,
    },
}

impl SubscriptionSignal {
    pub fn epoch(&self) -> u64 {
        match self {
            SubscriptionSignal::Change(change) => change.epoch,
            SubscriptionSignal::Failed { epoch, .. } => *epoch,
        }
    }
}

pub struct SubscriptionManager {
    active: HashMap<ResourceKey, JoinHandle<()>>,
    epoch: u64,
    /// Identity the current set was opened for; `None` once closed.
    opened_for: Option<UserId>,
    sink: mpsc::UnboundedSender<SubscriptionSignal>,
}

impl SubscriptionManager {
    pub fn new(sink: mpsc::UnboundedSender<SubscriptionSignal>) -> Self {
        Self {
            active: HashMap::new(),
            epoch: 0,
            opened_for: None,
            sink,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn opened_for(&self) -> Option<UserId> {
        self.opened_for
    }

    pub fn mark_opened_for(&mut self, viewer: UserId) {
        self.opened_for = Some(viewer);
    }

    /// A key counts as open while its reader task is still running.
    pub fn is_open(&self, key: &ResourceKey) -> bool {
        self.active
            .get(key)
            .is_some_and(|task| !task.is_finished())
    }

    pub fn open_keys(&self) -> Vec<ResourceKey> {
        self.active
            .iter()
            .filter(|(_, task)| !task.is_finished())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Start reading `stream` for `key`. A no-op returning false when the key is already open.
    pub fn open(&mut self, key: ResourceKey, mut stream: ChangeStream) -> bool {
        if self.is_open(&key) {
            debug!(resource = %key, "subscription: already open");
            return false;
        }
        let epoch = self.epoch;
        let sink = self.sink.clone();
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(raw) => match ChangeEvent::from_raw(&task_key, raw) {
                        Ok(event) => {
                            let routed = RoutedChange {
                                epoch,
                                key: task_key.clone(),
                                event,
                            };
                            if sink.send(SubscriptionSignal::Change(routed)).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(resource = %task_key, "subscription: dropped change: {err}");
                        }
                    },
                    Err(StoreError::Decode(err)) => {
                        warn!(resource = %task_key, "subscription: dropped frame: {err}");
                    }
                    Err(err) => {
                        warn!(resource = %task_key, "subscription: channel failed: {err}");
                        let _ = sink.send(SubscriptionSignal::Failed {
                            epoch,
                            key: task_key.clone(),
                            message: err.to_string(),
                        });
                        return;
                    }
                }
            }
            info!(resource = %task_key, "subscription: channel ended");
            let _ = sink.send(SubscriptionSignal::Failed {
                epoch,
                key: task_key,
                message: StoreError::PushChannelClosed.to_string(),
            });
        });
        if let Some(previous) = self.active.insert(key, task) {
            previous.abort();
        }
        true
    }

    /// Stop every reader and forget them. Changes already queued carry the old epoch.
    pub fn close_all(&mut self) -> usize {
        let closed = self.active.len();
        for (_, task) in self.active.drain() {
            task.abort();
        }
        self.epoch += 1;
        self.opened_for = None;
        if closed > 0 {
            info!(closed, epoch = self.epoch, "subscription: closed all");
        }
        closed
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        for (_, task) in self.active.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use shared::protocol::{ChangeKind, RawChange, Resource};
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;

    fn scripted() -> (
        mpsc::UnboundedSender<Result<RawChange, StoreError>>,
        ChangeStream,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, UnboundedReceiverStream::new(rx).boxed())
    }

    fn chat_insert(id: i64) -> RawChange {
        RawChange {
            resource: Resource::Chats,
            kind: ChangeKind::Insert,
            record: json!({
                "id": id, "kind": "group", "created_at": "2024-05-01T10:00:00Z"
            }),
            old_record: None,
        }
    }

    fn chats_key() -> ResourceKey {
        ResourceKey::new(Resource::Chats, None)
    }

    #[tokio::test]
    async fn open_is_idempotent_per_key() {
        let (sink, mut signals) = mpsc::unbounded_channel();
        let mut manager = SubscriptionManager::new(sink);
        let (first_tx, first) = scripted();
        let (second_tx, second) = scripted();

        assert!(manager.open(chats_key(), first));
        assert!(!manager.open(chats_key(), second));
        assert_eq!(manager.open_keys(), vec![chats_key()]);

        first_tx.send(Ok(chat_insert(1))).expect("send");
        assert!(second_tx.send(Ok(chat_insert(2))).is_err(), "duplicate stream dropped");

        let signal = signals.recv().await.expect("signal");
        let SubscriptionSignal::Change(routed) = signal else {
            panic!("expected change");
        };
        assert_eq!(routed.epoch, 0);
        assert!(matches!(routed.event, ChangeEvent::ChatUpserted(_)));
    }

    #[tokio::test]
    async fn undecodable_payloads_are_dropped_and_reading_continues() {
        let (sink, mut signals) = mpsc::unbounded_channel();
        let mut manager = SubscriptionManager::new(sink);
        let (tx, stream) = scripted();
        manager.open(chats_key(), stream);

        let mut wrong = chat_insert(1);
        wrong.record = json!({"id": "x"});
        tx.send(Ok(wrong)).expect("send");
        tx.send(Err(StoreError::Decode(
            serde_json::from_str::<RawChange>("{").expect_err("invalid"),
        )))
        .expect("send");
        tx.send(Ok(chat_insert(2))).expect("send");

        let SubscriptionSignal::Change(routed) = signals.recv().await.expect("signal") else {
            panic!("expected change");
        };
        let ChangeEvent::ChatUpserted(record) = routed.event else {
            panic!("expected chat upsert");
        };
        assert_eq!(record.id.0, 2);
    }

    #[tokio::test]
    async fn channel_failure_is_reported_and_key_can_reopen() {
        let (sink, mut signals) = mpsc::unbounded_channel();
        let mut manager = SubscriptionManager::new(sink);
        let (tx, stream) = scripted();
        manager.open(chats_key(), stream);

        tx.send(Err(StoreError::PushChannelClosed)).expect("send");
        let signal = signals.recv().await.expect("signal");
        assert!(matches!(signal, SubscriptionSignal::Failed { .. }));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!manager.is_open(&chats_key()));
        let (_tx, stream) = scripted();
        assert!(manager.open(chats_key(), stream));
    }

    #[tokio::test]
    async fn close_all_stops_delivery() {
        let (sink, mut signals) = mpsc::unbounded_channel();
        let mut manager = SubscriptionManager::new(sink);
        manager.mark_opened_for(UserId(1));
        let (tx, stream) = scripted();
        manager.open(chats_key(), stream);

        assert_eq!(manager.close_all(), 1);
        assert_eq!(manager.epoch(), 1);
        assert_eq!(manager.opened_for(), None);
        assert!(manager.open_keys().is_empty());

        let _ = tx.send(Ok(chat_insert(3)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(signals.try_recv().is_err());
    }
}
