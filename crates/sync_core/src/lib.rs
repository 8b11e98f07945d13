pub mod change;
pub mod config;
pub mod error;
pub mod notify;
pub mod optimistic;
pub mod reconcile;
pub mod session;
pub mod state;
pub mod store;
pub mod subscriptions;
pub mod unread;

pub use config::{load_settings, load_settings_from, ClientSettings};
pub use error::{Anomaly, StoreError, SyncError};
pub use notify::{Alert, AlertChannel, AlertSink, LogAlertSink, MissingAlertSink, PermissionState};
pub use optimistic::{MutationOp, SendDraft};
pub use session::{ClientEvent, SyncSession, WriteTicket};
pub use state::{ChatSummary, Message};
pub use store::{HttpMessageStore, MessageStore, MissingMessageStore};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod support;
