use shared::{
    domain::{ChatId, MessageId, TempId},
    error::ApiError,
    protocol::{Resource, ResourceKey, WriteKind},
};
use thiserror::Error;

/// Failures of the message store collaborator, as seen from the client.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store rejected request: {0}")]
    Rejected(ApiError),
    #[error("push channel error: {0}")]
    PushChannel(String),
    #[error("push channel closed by server")]
    PushChannelClosed,
    #[error("invalid payload from store: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid store url: {0}")]
    InvalidUrl(String),
    #[error("message store is unavailable")]
    Unavailable,
}

/// A push payload that could not be narrowed into a typed change.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload for {actual} delivered on {expected} subscription")]
    ResourceMismatch { expected: Resource, actual: Resource },
    #[error("malformed {resource} record: {source}")]
    Malformed {
        resource: Resource,
        source: serde_json::Error,
    },
    #[error("{resource} delete carried no old record")]
    MissingOldRecord { resource: Resource },
}

/// An event referencing state this client does not hold. Discarded, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Anomaly {
    #[error("unknown chat {0}")]
    UnknownChat(ChatId),
    #[error("unknown message {message_id} in chat {chat_id}")]
    UnknownMessage {
        chat_id: ChatId,
        message_id: MessageId,
    },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("session is not initialized")]
    NotInitialized,
    #[error("initial load failed: {0}")]
    BulkLoad(#[source] StoreError),
    #[error("fetch failed: {0}")]
    Fetch(#[source] StoreError),
    #[error("{kind} write failed: {source}")]
    WriteFailed {
        kind: WriteKind,
        #[source]
        source: StoreError,
    },
    #[error("subscription to {key} failed: {source}")]
    Subscription {
        key: ResourceKey,
        #[source]
        source: StoreError,
    },
    #[error("no pending write {0}")]
    UnknownPendingWrite(TempId),
    #[error("nothing to send: message has neither body nor attachment")]
    EmptyDraft,
    #[error("message {0} is not loaded")]
    UnknownMessage(MessageId),
    #[error("message {0} was deleted")]
    MessageDeleted(MessageId),
    #[error(transparent)]
    Anomaly(#[from] Anomaly),
}

impl SyncError {
    /// Whether a user-facing retry of the same action could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::WriteFailed { source, .. } | SyncError::Subscription { source, .. } => {
                match source {
                    StoreError::Rejected(api) => api.is_transient(),
                    StoreError::Decode(_) | StoreError::InvalidUrl(_) => false,
                    _ => true,
                }
            }
            SyncError::BulkLoad(_) | SyncError::Fetch(_) => true,
            _ => false,
        }
    }
}
