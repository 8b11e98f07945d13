//! The Message Store Service seam and its HTTP + WebSocket implementation.

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ChatId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        BulkSnapshot, ChatRecord, MessageRecord, NotificationRecord, RawChange, RelationshipRecord,
        ResourceKey, WriteEnvelope, WriteRequest, WriteResponse,
    },
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::info;
use url::Url;

use crate::error::StoreError;

pub type ChangeStream = BoxStream<'static, Result<RawChange, StoreError>>;

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn bulk_load(&self, viewer: UserId) -> Result<BulkSnapshot, StoreError>;
    async fn fetch_chats(&self, viewer: UserId) -> Result<Vec<ChatRecord>, StoreError>;
    async fn fetch_messages(
        &self,
        viewer: UserId,
        chat_id: ChatId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError>;
    async fn write(&self, viewer: UserId, request: WriteRequest)
        -> Result<WriteResponse, StoreError>;
    async fn subscribe(
        &self,
        viewer: UserId,
        key: &ResourceKey,
    ) -> Result<ChangeStream, StoreError>;
}

pub struct MissingMessageStore;

#[async_trait]
impl MessageStore for MissingMessageStore {
    async fn bulk_load(&self, _viewer: UserId) -> Result<BulkSnapshot, StoreError> {
        Err(StoreError::Unavailable)
    }

    async fn fetch_chats(&self, _viewer: UserId) -> Result<Vec<ChatRecord>, StoreError> {
        Err(StoreError::Unavailable)
    }

    async fn fetch_messages(
        &self,
        _viewer: UserId,
        _chat_id: ChatId,
        _before: Option<MessageId>,
        _limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        Err(StoreError::Unavailable)
    }

    async fn write(
        &self,
        _viewer: UserId,
        _request: WriteRequest,
    ) -> Result<WriteResponse, StoreError> {
        Err(StoreError::Unavailable)
    }

    async fn subscribe(
        &self,
        _viewer: UserId,
        _key: &ResourceKey,
    ) -> Result<ChangeStream, StoreError> {
        Err(StoreError::Unavailable)
    }
}

pub struct HttpMessageStore {
    http: Client,
    server_url: String,
    tail_limit: usize,
}

impl HttpMessageStore {
    pub fn new(server_url: impl Into<String>, tail_limit: usize) -> Result<Self, StoreError> {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        if !(server_url.starts_with("http://") || server_url.starts_with("https://")) {
            return Err(StoreError::InvalidUrl(format!(
                "server_url must start with http:// or https://: {server_url}"
            )));
        }
        Ok(Self {
            http: Client::new(),
            server_url,
            tail_limit,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, StoreError> {
        let response = self
            .http
            .get(format!("{}{path}", self.server_url))
            .query(query)
            .send()
            .await?;
        decode_response(response).await
    }

    fn realtime_url(&self, viewer: UserId, key: &ResourceKey) -> Result<Url, StoreError> {
        let ws_base = if self.server_url.starts_with("https://") {
            self.server_url.replacen("https://", "wss://", 1)
        } else {
            self.server_url.replacen("http://", "ws://", 1)
        };
        let mut url = Url::parse(&format!("{ws_base}/realtime"))
            .map_err(|err| StoreError::InvalidUrl(err.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("user_id", &viewer.0.to_string());
            query.append_pair("resource", key.resource.as_str());
            if let Some(filter) = &key.filter {
                query.append_pair("filter", filter);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl MessageStore for HttpMessageStore {
    async fn bulk_load(&self, viewer: UserId) -> Result<BulkSnapshot, StoreError> {
        let user = [("user_id", viewer.0.to_string())];
        let tail = [
            ("user_id", viewer.0.to_string()),
            ("limit", self.tail_limit.to_string()),
        ];
        let (chats, messages, relationships, notifications) = tokio::try_join!(
            self.get_json::<Vec<ChatRecord>>("/chats", &user),
            self.get_json::<Vec<MessageRecord>>("/messages/tail", &tail),
            self.get_json::<Vec<RelationshipRecord>>("/relationships", &user),
            self.get_json::<Vec<NotificationRecord>>("/notifications", &user),
        )?;
        info!(
            user_id = viewer.0,
            chats = chats.len(),
            messages = messages.len(),
            "store: bulk load complete"
        );
        Ok(BulkSnapshot {
            chats,
            messages,
            relationships,
            notifications,
        })
    }

    async fn fetch_chats(&self, viewer: UserId) -> Result<Vec<ChatRecord>, StoreError> {
        self.get_json("/chats", &[("user_id", viewer.0.to_string())])
            .await
    }

    async fn fetch_messages(
        &self,
        viewer: UserId,
        chat_id: ChatId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let mut query = vec![
            ("user_id", viewer.0.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(before) = before {
            query.push(("before", before.0.to_string()));
        }
        self.get_json(&format!("/chats/{}/messages", chat_id.0), &query)
            .await
    }

    async fn write(
        &self,
        viewer: UserId,
        request: WriteRequest,
    ) -> Result<WriteResponse, StoreError> {
        let response = self
            .http
            .post(format!("{}/writes", self.server_url))
            .json(&WriteEnvelope {
                user_id: viewer,
                request,
            })
            .send()
            .await?;
        decode_response(response).await
    }

    async fn subscribe(
        &self,
        viewer: UserId,
        key: &ResourceKey,
    ) -> Result<ChangeStream, StoreError> {
        let url = self.realtime_url(viewer, key)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| StoreError::PushChannel(format!("failed to connect {url}: {err}")))?;
        info!(user_id = viewer.0, resource = %key, "store: push channel open");

        let changes = ws_stream.filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => {
                    Some(serde_json::from_str::<RawChange>(&text).map_err(StoreError::from))
                }
                Ok(Message::Close(_)) => Some(Err(StoreError::PushChannelClosed)),
                Ok(_) => None,
                Err(err) => Some(Err(StoreError::PushChannel(err.to_string()))),
            }
        });
        Ok(changes.boxed())
    }
}

async fn decode_response<T: DeserializeOwned>(response: Response) -> Result<T, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.bytes().await?;
    let err = serde_json::from_slice::<ApiError>(&body).unwrap_or_else(|_| {
        ApiError::new(
            code_for_status(status),
            String::from_utf8_lossy(&body).trim().to_string(),
        )
    });
    Err(StoreError::Rejected(err))
}

fn code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::UNAUTHORIZED => ErrorCode::Unauthorized,
        StatusCode::FORBIDDEN => ErrorCode::Forbidden,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorCode::Validation,
        StatusCode::CONFLICT => ErrorCode::Conflict,
        StatusCode::TOO_MANY_REQUESTS => ErrorCode::RateLimited,
        _ => ErrorCode::Internal,
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
