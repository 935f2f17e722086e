//! In-process mock of the chat service used by the integration tests.
//!
//! Serves the HTTP routes and the websocket stream on `127.0.0.1:0`. User
//! "bob" (id 1) is seeded; registered users get ids from 2 and chats get
//! ids from 42.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use securechat_sdk::stream::proto::{
    ChatId, ClientMessage, MessageId, RemoteErrorCode, ServerMessage, UserId,
};
use securechat_sdk::{ChatSession, Endpoint};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Interval};

pub const BOB_ID: u64 = 1;
pub const FIRST_CHAT_ID: u64 = 42;

/// How the mock stream reacts once a client is connected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamBehavior {
    /// Stores every send, echoes it back as `new_message`, completes on
    /// half-close.
    Echo,
    /// Stores sends and ignores the half-close. Still answers a client close
    /// handshake.
    IgnoreCompletion,
    /// Pushes `n` messages right after the greeting, then acts like `Echo`.
    Burst(usize),
    /// Pushes a message every period until the client goes away.
    Drip(Duration),
    /// Answers the first send with an `unauthenticated` error frame.
    RejectOnSend,
    /// Greets, then never reads the socket again.
    Stall,
    /// Sleeps this long before every read; otherwise stores sends like
    /// `IgnoreCompletion` and completes on half-close.
    SlowReader(Duration),
}

#[derive(Clone, Debug)]
struct User {
    id: u64,
    name: String,
    password: String,
    public_key: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedSend {
    pub sender_id: u64,
    pub chat_id: u64,
    pub content: Vec<u8>,
}

#[derive(Debug, Default)]
struct Db {
    users: Vec<User>,
    access_tokens: HashMap<String, u64>,
    refresh_tokens: HashMap<String, u64>,
    chats: Vec<ChatSession>,
    sends: Vec<ObservedSend>,
    issued: u64,
}

impl Db {
    fn seeded() -> Self {
        Self {
            users: vec![User {
                id: BOB_ID,
                name: "bob".to_string(),
                password: "bob-pw".to_string(),
                public_key: b"bob-pk".to_vec(),
            }],
            ..Self::default()
        }
    }

    fn issue_tokens(&mut self, user_id: u64) -> Value {
        self.issued += 1;
        let access = format!("access-{user_id}-{}", self.issued);
        let refresh = format!("refresh-{user_id}-{}", self.issued);
        self.access_tokens.insert(access.clone(), user_id);
        self.refresh_tokens.insert(refresh.clone(), user_id);
        json!({"access_token": access, "refresh_token": refresh})
    }
}

#[derive(Clone)]
pub struct MockState {
    db: Arc<Mutex<Db>>,
    behavior: StreamBehavior,
    unavailable_auth_calls: Arc<AtomicUsize>,
    auth_calls: Arc<AtomicUsize>,
}

impl MockState {
    /// Invalidates every issued access token.
    pub async fn revoke_access_tokens(&self) {
        self.db.lock().await.access_tokens.clear();
    }

    /// Makes the next `count` register/login calls answer 503.
    pub fn fail_next_auth_calls(&self, count: usize) {
        self.unavailable_auth_calls.store(count, Ordering::SeqCst);
    }

    pub fn auth_calls(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub async fn observed_sends(&self) -> Vec<ObservedSend> {
        self.db.lock().await.sends.clone()
    }

    async fn user_for(&self, headers: &HeaderMap) -> Option<u64> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))?;
        self.db.lock().await.access_tokens.get(token).copied()
    }

    fn take_unavailable(&self) -> bool {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        self.unavailable_auth_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    async fn record_send(&self, sender_id: u64, chat_id: u64, content: Vec<u8>) -> u64 {
        let mut db = self.db.lock().await;
        db.sends.push(ObservedSend {
            sender_id,
            chat_id,
            content,
        });
        db.sends.len() as u64
    }
}

pub struct MockService {
    pub addr: SocketAddr,
    pub state: MockState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MockService {
    pub async fn spawn(behavior: StreamBehavior) -> Self {
        let state = MockState {
            db: Arc::new(Mutex::new(Db::seeded())),
            behavior,
            unavailable_auth_calls: Arc::new(AtomicUsize::new(0)),
            auth_calls: Arc::new(AtomicUsize::new(0)),
        };
        let app = Router::new()
            .route("/v1/auth/register", post(register))
            .route("/v1/auth/login", post(login))
            .route("/v1/auth/refresh", post(refresh))
            .route("/v1/auth/logout", post(logout))
            .route("/v1/chats", post(create_chat).get(list_chats))
            .route("/v1/chats/:chat_id/messages", get(message_history))
            .route("/v1/users", get(list_users))
            .route("/v1/chat/stream", get(stream_upgrade))
            .with_state(state.clone());
        let (addr, shutdown_tx, task) = spawn_server(app).await;
        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.addr.port())
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if timeout(Duration::from_secs(2), &mut self.task).await.is_err() {
            self.task.abort();
        }
    }
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page_size: Option<usize>,
    last_id: Option<u64>,
}

impl PageQuery {
    fn apply<T>(&self, items: Vec<T>, id: impl Fn(&T) -> u64) -> Vec<T> {
        let after = self.last_id.unwrap_or(0);
        let limit = self.page_size.unwrap_or(usize::MAX);
        items
            .into_iter()
            .filter(|item| id(item) > after)
            .take(limit)
            .collect()
    }
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"message": message}))).into_response()
}

fn field<'a>(payload: &'a Value, name: &str) -> &'a str {
    payload.get(name).and_then(Value::as_str).unwrap_or_default()
}

fn blob(payload: &Value, name: &str) -> Option<Vec<u8>> {
    STANDARD.decode(field(payload, name)).ok()
}

async fn register(State(state): State<MockState>, Json(payload): Json<Value>) -> Response {
    if state.take_unavailable() {
        return error(StatusCode::SERVICE_UNAVAILABLE, "try again later");
    }
    let name = field(&payload, "name");
    let password = field(&payload, "password");
    let Some(public_key) = blob(&payload, "public_key") else {
        return error(StatusCode::BAD_REQUEST, "public_key must be base64");
    };
    if name.is_empty() || password.is_empty() || public_key.is_empty() {
        return error(StatusCode::BAD_REQUEST, "name, password and public_key are required");
    }

    let mut db = state.db.lock().await;
    if db.users.iter().any(|user| user.name == name) {
        return error(
            StatusCode::CONFLICT,
            &format!("User with name {name} already exists."),
        );
    }
    let id = db.users.iter().map(|user| user.id).max().unwrap_or(0) + 1;
    db.users.push(User {
        id,
        name: name.to_string(),
        password: password.to_string(),
        public_key,
    });
    Json(db.issue_tokens(id)).into_response()
}

async fn login(State(state): State<MockState>, Json(payload): Json<Value>) -> Response {
    if state.take_unavailable() {
        return error(StatusCode::SERVICE_UNAVAILABLE, "try again later");
    }
    let name = field(&payload, "name");
    let password = field(&payload, "password");

    let mut db = state.db.lock().await;
    let Some(user) = db.users.iter().find(|user| user.name == name).cloned() else {
        return error(StatusCode::NOT_FOUND, "User not found.");
    };
    if user.password != password {
        return error(StatusCode::UNAUTHORIZED, "Invalid password.");
    }
    Json(db.issue_tokens(user.id)).into_response()
}

async fn refresh(State(state): State<MockState>, Json(payload): Json<Value>) -> Response {
    let token = field(&payload, "refresh_token");
    let mut db = state.db.lock().await;
    let Some(user_id) = db.refresh_tokens.remove(token) else {
        return error(StatusCode::UNAUTHORIZED, "Invalid refresh token.");
    };
    Json(db.issue_tokens(user_id)).into_response()
}

async fn logout(State(state): State<MockState>, Json(payload): Json<Value>) -> Response {
    let token = field(&payload, "refresh_token");
    let mut db = state.db.lock().await;
    if db.refresh_tokens.remove(token).is_none() {
        return error(StatusCode::UNAUTHORIZED, "Invalid refresh token.");
    }
    Json(json!({"message": "Logged out."})).into_response()
}

async fn create_chat(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let Some(sender_id) = state.user_for(&headers).await else {
        return error(StatusCode::UNAUTHORIZED, "Unauthenticated.");
    };
    let receiver_id = payload.get("receiver_id").and_then(Value::as_u64).unwrap_or(0);
    let (Some(sender_key), Some(receiver_key)) = (
        blob(&payload, "sender_encrypted_aes_key"),
        blob(&payload, "receiver_encrypted_aes_key"),
    ) else {
        return error(StatusCode::BAD_REQUEST, "keys must be base64");
    };

    let mut db = state.db.lock().await;
    if !db.users.iter().any(|user| user.id == receiver_id) {
        return error(
            StatusCode::NOT_FOUND,
            &format!("receiver {receiver_id} does not exist"),
        );
    }
    let chat = ChatSession {
        id: ChatId(FIRST_CHAT_ID + db.chats.len() as u64),
        sender_id: UserId(sender_id),
        receiver_id: UserId(receiver_id),
        sender_encrypted_aes_key: sender_key,
        receiver_encrypted_aes_key: receiver_key,
    };
    db.chats.push(chat.clone());
    Json(chat).into_response()
}

async fn list_chats(
    State(state): State<MockState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Response {
    let Some(user_id) = state.user_for(&headers).await else {
        return error(StatusCode::UNAUTHORIZED, "Unauthenticated.");
    };
    let db = state.db.lock().await;
    let mine: Vec<ChatSession> = db
        .chats
        .iter()
        .filter(|chat| chat.sender_id.0 == user_id || chat.receiver_id.0 == user_id)
        .cloned()
        .collect();
    Json(json!({"chats": page.apply(mine, |chat: &ChatSession| chat.id.0)})).into_response()
}

async fn message_history(
    State(state): State<MockState>,
    headers: HeaderMap,
    Path(chat_id): Path<u64>,
    Query(page): Query<PageQuery>,
) -> Response {
    if state.user_for(&headers).await.is_none() {
        return error(StatusCode::UNAUTHORIZED, "Unauthenticated.");
    }
    let db = state.db.lock().await;
    let messages: Vec<Value> = db
        .sends
        .iter()
        .enumerate()
        .filter(|(_, send)| send.chat_id == chat_id)
        .map(|(index, send)| {
            json!({
                "id": index as u64 + 1,
                "chat_id": send.chat_id,
                "sender_id": send.sender_id,
                "aes_encrypted_content": STANDARD.encode(&send.content),
            })
        })
        .collect();
    let messages = page.apply(messages, |message: &Value| {
        message.get("id").and_then(Value::as_u64).unwrap_or(0)
    });
    Json(json!({"messages": messages})).into_response()
}

async fn list_users(
    State(state): State<MockState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Response {
    if state.user_for(&headers).await.is_none() {
        return error(StatusCode::UNAUTHORIZED, "Unauthenticated.");
    }
    let db = state.db.lock().await;
    let users = db.users.clone();
    let users: Vec<Value> = page
        .apply(users, |user: &User| user.id)
        .into_iter()
        .map(|user| {
            json!({
                "id": user.id,
                "name": user.name,
                "public_key": STANDARD.encode(&user.public_key),
            })
        })
        .collect();
    Json(json!({"users": users})).into_response()
}

async fn stream_upgrade(
    State(state): State<MockState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(user_id) = state.user_for(&headers).await else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| run_stream(socket, state, user_id))
        .into_response()
}

async fn run_stream(mut socket: WebSocket, state: MockState, user_id: u64) {
    let hello = ServerMessage::HelloOk {
        user_id: UserId(user_id),
    };
    if send_server_message(&mut socket, hello).await.is_err() {
        return;
    }

    let behavior = state.behavior;
    if behavior == StreamBehavior::Stall {
        // Holding the socket without reading lets the client's writes back up.
        std::future::pending::<()>().await;
    }
    let mut pushed = 0u64;
    if let StreamBehavior::Burst(count) = behavior {
        for _ in 0..count {
            pushed += 1;
            if push(&mut socket, pushed).await.is_err() {
                return;
            }
        }
    }
    let mut drip = match behavior {
        StreamBehavior::Drip(period) => Some(tokio::time::interval(period)),
        _ => None,
    };

    loop {
        if let StreamBehavior::SlowReader(delay) = behavior {
            tokio::time::sleep(delay).await;
        }
        let incoming = tokio::select! {
            incoming = socket.recv() => incoming,
            _ = tick(&mut drip) => {
                pushed += 1;
                if push(&mut socket, pushed).await.is_err() {
                    return;
                }
                continue;
            }
        };
        let text = match incoming {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) => {
                // The close reply goes out on the next read.
                while let Some(Ok(_)) = socket.recv().await {}
                return;
            }
            Some(Err(_)) | None => return,
            Some(Ok(_)) => continue,
        };
        let Ok(message) = ClientMessage::from_text(&text) else {
            return;
        };

        match message {
            ClientMessage::SendMessage {
                chat_id,
                aes_encrypted_content,
            } => {
                if behavior == StreamBehavior::RejectOnSend {
                    let rejection = ServerMessage::Error {
                        code: RemoteErrorCode::Unauthenticated,
                        message: "token expired".to_string(),
                    };
                    let _ = send_server_message(&mut socket, rejection).await;
                    return;
                }
                let message_id = state
                    .record_send(user_id, chat_id.0, aes_encrypted_content.clone())
                    .await;
                if matches!(behavior, StreamBehavior::Echo | StreamBehavior::Burst(_)) {
                    let echo = ServerMessage::NewMessage {
                        message_id: MessageId(message_id),
                        chat_id,
                        sender_id: UserId(user_id),
                        aes_encrypted_content,
                    };
                    if send_server_message(&mut socket, echo).await.is_err() {
                        return;
                    }
                }
            }
            ClientMessage::Complete => {
                if behavior == StreamBehavior::IgnoreCompletion {
                    continue;
                }
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: "completed".into(),
                };
                if socket.send(Message::Close(Some(frame))).await.is_err() {
                    return;
                }
                while let Some(Ok(_)) = socket.recv().await {}
                return;
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn push(socket: &mut WebSocket, sequence: u64) -> Result<(), String> {
    let message = ServerMessage::NewMessage {
        message_id: MessageId(1_000 + sequence),
        chat_id: ChatId(FIRST_CHAT_ID),
        sender_id: UserId(BOB_ID),
        aes_encrypted_content: format!("pushed-{sequence}").into_bytes(),
    };
    send_server_message(socket, message).await
}

async fn send_server_message(socket: &mut WebSocket, msg: ServerMessage) -> Result<(), String> {
    let payload = msg
        .to_text()
        .map_err(|err| format!("failed to encode server message: {err}"))?;
    socket
        .send(Message::Text(payload))
        .await
        .map_err(|err| format!("failed to send server message: {err}"))
}

async fn spawn_server(app: Router) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
