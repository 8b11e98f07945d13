use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use shared::protocol::{ChangeKind, Resource};
use tokio::{net::TcpListener, sync::Mutex};

use super::*;
use crate::support::{chat_record, message_record, BOB, VIEWER};

#[derive(Clone, Default)]
struct MockState {
    writes: Arc<Mutex<Vec<WriteEnvelope>>>,
    history_queries: Arc<Mutex<Vec<(i64, HistoryQuery)>>>,
    realtime_queries: Arc<Mutex<Vec<RealtimeQuery>>>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct HistoryQuery {
    user_id: i64,
    limit: usize,
    before: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct RealtimeQuery {
    user_id: i64,
    resource: String,
    filter: Option<String>,
}

async fn list_chats(Query(q): Query<UserQuery>) -> Json<Vec<ChatRecord>> {
    assert_eq!(q.user_id, VIEWER.0);
    Json(vec![chat_record(1, 0), chat_record(2, 5)])
}

async fn message_tail(Query(q): Query<HistoryQuery>) -> Json<Vec<MessageRecord>> {
    assert_eq!(q.limit, 25);
    Json(vec![message_record(10, 1, BOB, "tail", 10)])
}

async fn list_relationships() -> Json<Vec<RelationshipRecord>> {
    Json(Vec::new())
}

async fn list_notifications() -> Json<Vec<NotificationRecord>> {
    Json(Vec::new())
}

async fn chat_history(
    State(state): State<MockState>,
    Path(chat_id): Path<i64>,
    Query(q): Query<HistoryQuery>,
) -> Json<Vec<MessageRecord>> {
    state.history_queries.lock().await.push((chat_id, q));
    Json(vec![message_record(3, chat_id, BOB, "older", 3)])
}

async fn handle_write(
    State(state): State<MockState>,
    Json(envelope): Json<WriteEnvelope>,
) -> Response {
    state.writes.lock().await.push(envelope.clone());
    match envelope.request {
        WriteRequest::SendMessage {
            chat_id,
            body,
            client_token,
            ..
        } => {
            let mut record =
                message_record(500, chat_id.0, envelope.user_id, body.as_deref().unwrap_or(""), 50);
            record.client_token = Some(client_token);
            Json(WriteResponse::Message(record)).into_response()
        }
        WriteRequest::EditMessage { .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"code": "validation", "message": "body too long"})),
        )
            .into_response(),
        WriteRequest::TogglePin { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "upstream down").into_response()
        }
        _ => Json(WriteResponse::Ack).into_response(),
    }
}

async fn realtime(
    State(state): State<MockState>,
    Query(q): Query<RealtimeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    state.realtime_queries.lock().await.push(q);
    ws.on_upgrade(push_one_change)
}

async fn push_one_change(mut socket: WebSocket) {
    let change = json!({
        "resource": "messages",
        "kind": "insert",
        "record": {
            "id": 77, "chat_id": 1, "author_id": 2, "body": "pushed",
            "created_at": "2024-05-01T10:00:00Z"
        }
    });
    let _ = socket.send(WsMessage::Text("not json".into())).await;
    let _ = socket.send(WsMessage::Text(change.to_string())).await;
    let _ = socket.send(WsMessage::Close(None)).await;
}

async fn spawn_store_server() -> anyhow::Result<(String, MockState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = MockState::default();
    let app = Router::new()
        .route("/chats", get(list_chats))
        .route("/messages/tail", get(message_tail))
        .route("/relationships", get(list_relationships))
        .route("/notifications", get(list_notifications))
        .route("/chats/:chat_id/messages", get(chat_history))
        .route("/writes", post(handle_write))
        .route("/realtime", get(realtime))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

#[test]
fn rejects_non_http_server_url() {
    assert!(matches!(
        HttpMessageStore::new("ftp://example.org", 10),
        Err(StoreError::InvalidUrl(_))
    ));
}

#[tokio::test]
async fn bulk_load_joins_all_four_requests() {
    let (server_url, _) = spawn_store_server().await.expect("spawn server");
    let store = HttpMessageStore::new(format!("{server_url}/"), 25).expect("store");
    let snapshot = store.bulk_load(VIEWER).await.expect("bulk load");
    assert_eq!(snapshot.chats.len(), 2);
    assert_eq!(snapshot.messages.len(), 1);
    assert!(snapshot.relationships.is_empty());
    assert!(snapshot.notifications.is_empty());
}

#[tokio::test]
async fn bulk_load_fails_when_any_request_fails() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/chats", get(list_chats))
        .route("/messages/tail", get(message_tail))
        .route("/relationships", get(list_relationships));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let store = HttpMessageStore::new(format!("http://{addr}"), 25).expect("store");
    let err = store.bulk_load(VIEWER).await.expect_err("notifications missing");
    assert!(matches!(
        err,
        StoreError::Rejected(ApiError {
            code: ErrorCode::NotFound,
            ..
        })
    ));
}

#[tokio::test]
async fn history_fetch_sends_cursor() {
    let (server_url, state) = spawn_store_server().await.expect("spawn server");
    let store = HttpMessageStore::new(server_url, 25).expect("store");
    let page = store
        .fetch_messages(VIEWER, ChatId(4), Some(MessageId(9)), 20)
        .await
        .expect("history");
    assert_eq!(page[0].chat_id, ChatId(4));
    assert_eq!(
        state.history_queries.lock().await.clone(),
        vec![(
            4,
            HistoryQuery {
                user_id: VIEWER.0,
                limit: 20,
                before: Some(9)
            }
        )]
    );
}

#[tokio::test]
async fn send_write_returns_confirmed_record_with_token() {
    let (server_url, state) = spawn_store_server().await.expect("spawn server");
    let store = HttpMessageStore::new(server_url, 25).expect("store");
    let token = shared::domain::TempId("tmp-1".into());
    let response = store
        .write(
            VIEWER,
            WriteRequest::SendMessage {
                chat_id: ChatId(1),
                body: Some("hello".into()),
                attachment: None,
                reply_to: None,
                client_token: token.clone(),
            },
        )
        .await
        .expect("write");
    let WriteResponse::Message(record) = response else {
        panic!("expected confirmed record");
    };
    assert_eq!(record.id, MessageId(500));
    assert_eq!(record.client_token, Some(token));
    assert_eq!(state.writes.lock().await[0].user_id, VIEWER);
}

#[tokio::test]
async fn rejected_write_carries_api_error() {
    let (server_url, _) = spawn_store_server().await.expect("spawn server");
    let store = HttpMessageStore::new(server_url, 25).expect("store");

    let err = store
        .write(
            VIEWER,
            WriteRequest::EditMessage {
                message_id: MessageId(1),
                body: "x".repeat(10_000),
            },
        )
        .await
        .expect_err("rejected");
    let StoreError::Rejected(api) = err else {
        panic!("expected rejection, got {err:?}");
    };
    assert_eq!(api.code, ErrorCode::Validation);
    assert_eq!(api.message, "body too long");

    let err = store
        .write(VIEWER, WriteRequest::TogglePin { message_id: MessageId(1) })
        .await
        .expect_err("unavailable");
    let StoreError::Rejected(api) = err else {
        panic!("expected rejection, got {err:?}");
    };
    assert_eq!(api.code, ErrorCode::Internal);
    assert!(api.is_transient());
}

#[tokio::test]
async fn subscribe_streams_changes_until_close() {
    let (server_url, state) = spawn_store_server().await.expect("spawn server");
    let store = HttpMessageStore::new(server_url, 25).expect("store");
    let key = ResourceKey::new(Resource::Messages, Some("chat_id=in.(1,2)".into()));
    let mut changes = store.subscribe(VIEWER, &key).await.expect("subscribe");

    let first = changes.next().await.expect("frame");
    assert!(matches!(first, Err(StoreError::Decode(_))));
    let change = changes.next().await.expect("frame").expect("change");
    assert_eq!(change.resource, Resource::Messages);
    assert_eq!(change.kind, ChangeKind::Insert);
    assert_eq!(change.record["body"], "pushed");
    let closed = changes.next().await.expect("frame");
    assert!(matches!(closed, Err(StoreError::PushChannelClosed)));

    let queries = state.realtime_queries.lock().await.clone();
    assert_eq!(
        queries,
        vec![RealtimeQuery {
            user_id: VIEWER.0,
            resource: "messages".into(),
            filter: Some("chat_id=in.(1,2)".into()),
        }]
    );
}

#[tokio::test]
async fn missing_store_is_unavailable() {
    let err = MissingMessageStore
        .bulk_load(VIEWER)
        .await
        .expect_err("unavailable");
    assert!(matches!(err, StoreError::Unavailable));
}
