//! In-process stand-in for the chat backend: REST routes plus the `/ws`
//! realtime endpoint, with knobs for expiring credentials and misbehaving
//! sockets.

use std::{borrow::Cow, collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use shared::protocol::{
    ConversationSummaryPayload, CreateConversationRequest, FindUserByPhoneRequest, LoginRequest,
    MessagePayload, ParticipantPayload, RefreshRequest, RegisterRequest, SendMessageRequest,
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, Mutex},
};

pub const PASSWORD: &str = "secret";

#[derive(Debug, Clone)]
pub enum SocketCommand {
    Text(String),
    Close(u16),
    Drop,
}

pub struct FakeData {
    pub access_token: String,
    pub refresh_token: String,
    pub refresh_calls: usize,
    pub refresh_delay: Duration,
    pub fail_refresh: bool,
    pub reject_all: bool,
    pub rejected_requests: usize,
    pub conversations: Vec<ConversationSummaryPayload>,
    pub messages: HashMap<String, Vec<MessagePayload>>,
    pub failing_histories: Vec<String>,
    pub sent: Vec<SendMessageRequest>,
    pub created_with: Vec<String>,
    pub logouts: Vec<RefreshRequest>,
    pub socket_connections: usize,
    pub socket_tokens: Vec<String>,
    pub socket_inbound: Vec<Value>,
    pub clock: i64,
}

impl Default for FakeData {
    fn default() -> Self {
        Self {
            access_token: "access-0".into(),
            refresh_token: "refresh-0".into(),
            refresh_calls: 0,
            refresh_delay: Duration::from_millis(20),
            fail_refresh: false,
            reject_all: false,
            rejected_requests: 0,
            conversations: Vec::new(),
            messages: HashMap::new(),
            failing_histories: Vec::new(),
            sent: Vec::new(),
            created_with: Vec::new(),
            logouts: Vec::new(),
            socket_connections: 0,
            socket_tokens: Vec::new(),
            socket_inbound: Vec::new(),
            clock: 1_700_000_000,
        }
    }
}

#[derive(Clone)]
pub struct FakeChatServer {
    pub url: String,
    pub data: Arc<Mutex<FakeData>>,
    sockets: broadcast::Sender<SocketCommand>,
}

impl FakeChatServer {
    pub async fn spawn() -> Result<Self> {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (sockets, _) = broadcast::channel(64);
        let server = Self {
            url: format!("http://{addr}"),
            data: Arc::new(Mutex::new(FakeData::default())),
            sockets,
        };
        let app = Router::new()
            .route("/auth/login", post(login))
            .route("/auth/register", post(register))
            .route("/auth/refresh", post(refresh))
            .route("/auth/logout", post(logout))
            .route("/user/conversation", get(list_conversations))
            .route("/user/find-by-phone", post(find_by_phone))
            .route("/chat/conversation", post(create_conversation))
            .route("/chat/conversation/:id", get(conversation_history))
            .route("/chat/send", post(send_message))
            .route("/ws", get(realtime))
            .with_state(server.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(server)
    }

    /// Makes every credential handed out so far stale.
    pub async fn expire_access_token(&self) {
        self.data.lock().await.access_token = "access-server-only".into();
    }

    pub async fn add_conversation(&self, id: &str, participants: &[(&str, &str)]) {
        self.data
            .lock()
            .await
            .conversations
            .push(ConversationSummaryPayload {
                conversation_id: id.to_string(),
                participant: Some(
                    participants
                        .iter()
                        .map(|(id, name)| ParticipantPayload {
                            id: id.to_string(),
                            name: name.to_string(),
                        })
                        .collect(),
                ),
            });
    }

    pub async fn add_message(&self, conversation_id: &str, sender_id: &str, body: &str, at: i64) {
        self.data
            .lock()
            .await
            .messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(MessagePayload {
                sender_id: sender_id.to_string(),
                message: body.to_string(),
                created_at: at,
            });
    }

    pub fn push(&self, event: Value) {
        let _ = self.sockets.send(SocketCommand::Text(event.to_string()));
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.sockets.send(SocketCommand::Text(text.to_string()));
    }

    pub fn close_sockets(&self, code: u16) {
        let _ = self.sockets.send(SocketCommand::Close(code));
    }

    /// Drops every socket without a close handshake (the client sees 1006).
    pub fn drop_sockets(&self) {
        let _ = self.sockets.send(SocketCommand::Drop);
    }

    pub fn live_sockets(&self) -> usize {
        self.sockets.receiver_count()
    }

    /// Polls the recorded server state for up to three seconds.
    pub async fn wait_for(&self, check: impl Fn(&FakeData) -> bool) -> bool {
        for _ in 0..300 {
            if check(&*self.data.lock().await) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub async fn wait_for_live_sockets(&self, count: usize) -> bool {
        for _ in 0..300 {
            if self.live_sockets() == count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

/// A port nothing listens on.
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    format!("http://{addr}")
}

fn success(data: impl Serialize) -> Response {
    Json(json!({ "status": "success", "message": "ok", "data": data })).into_response()
}

fn fail(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "status": "fail", "message": message, "data": null })),
    )
        .into_response()
}

async fn authorized(server: &FakeChatServer, headers: &HeaderMap) -> bool {
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);
    let mut data = server.data.lock().await;
    let ok = !data.reject_all && presented.as_deref() == Some(data.access_token.as_str());
    if !ok {
        data.rejected_requests += 1;
    }
    ok
}

fn auth_payload(user_id: &str, name: &str, data: &FakeData) -> Value {
    json!({
        "user": { "user_id": user_id, "name": name },
        "token": { "access_token": data.access_token, "refresh_token": data.refresh_token },
    })
}

async fn login(State(server): State<FakeChatServer>, Json(req): Json<LoginRequest>) -> Response {
    if req.password != PASSWORD {
        return fail(
            StatusCode::BAD_REQUEST,
            "Login fail with error: invalid credentials",
        );
    }
    let data = server.data.lock().await;
    let payload = auth_payload(&format!("id-{}", req.username), &req.username, &data);
    (StatusCode::CREATED, success(payload)).into_response()
}

async fn register(
    State(server): State<FakeChatServer>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    if req.phone.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "phone is required");
    }
    let data = server.data.lock().await;
    let payload = auth_payload(&format!("id-{}", req.username), &req.name, &data);
    (StatusCode::CREATED, success(payload)).into_response()
}

async fn refresh(State(server): State<FakeChatServer>, Json(req): Json<RefreshRequest>) -> Response {
    let delay = {
        let mut data = server.data.lock().await;
        data.refresh_calls += 1;
        data.refresh_delay
    };
    tokio::time::sleep(delay).await;

    let mut data = server.data.lock().await;
    if data.fail_refresh || req.refresh_token != data.refresh_token {
        return fail(StatusCode::BAD_REQUEST, "refresh token is invalid");
    }
    let generation = data.refresh_calls;
    data.access_token = format!("access-{generation}");
    data.refresh_token = format!("refresh-{generation}");
    let payload = auth_payload(&req.user_id, "", &data);
    (StatusCode::CREATED, success(payload)).into_response()
}

async fn logout(State(server): State<FakeChatServer>, Json(req): Json<RefreshRequest>) -> Response {
    server.data.lock().await.logouts.push(req);
    success(Value::Null)
}

async fn list_conversations(State(server): State<FakeChatServer>, headers: HeaderMap) -> Response {
    if !authorized(&server, &headers).await {
        return fail(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    let data = server.data.lock().await;
    success(json!({ "conversation_list": data.conversations }))
}

async fn conversation_history(
    State(server): State<FakeChatServer>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&server, &headers).await {
        return fail(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    let data = server.data.lock().await;
    if data.failing_histories.contains(&id) {
        return fail(StatusCode::INTERNAL_SERVER_ERROR, "history unavailable");
    }
    let messages = data.messages.get(&id).cloned();
    success(json!({ "conversation_id": id, "messages": messages }))
}

async fn send_message(
    State(server): State<FakeChatServer>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Response {
    if !authorized(&server, &headers).await {
        return fail(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    let mut data = server.data.lock().await;
    data.clock += 1;
    let created_at = data.clock;
    data.messages
        .entry(req.conversation_id.clone())
        .or_default()
        .push(MessagePayload {
            sender_id: "id-alice".into(),
            message: req.message.clone(),
            created_at,
        });
    let body = req.message.clone();
    data.sent.push(req);
    success(json!({ "message": body, "created_at": created_at }))
}

async fn create_conversation(
    State(server): State<FakeChatServer>,
    headers: HeaderMap,
    Json(req): Json<CreateConversationRequest>,
) -> Response {
    if !authorized(&server, &headers).await {
        return fail(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    if req.friend_phone == "000" {
        return fail(StatusCode::NOT_FOUND, "friend not found");
    }
    let mut data = server.data.lock().await;
    data.created_with.push(req.friend_phone.clone());
    let id = format!("c-{}", req.friend_phone);
    success(json!({ "conversation_id": id }))
}

async fn find_by_phone(
    State(server): State<FakeChatServer>,
    headers: HeaderMap,
    Json(req): Json<FindUserByPhoneRequest>,
) -> Response {
    if !authorized(&server, &headers).await {
        return fail(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    if req.phone == "000" {
        return fail(StatusCode::NOT_FOUND, "user not found");
    }
    success(json!({
        "email": format!("friend{}@example.com", req.phone),
        "name": "Friend",
        "phone": req.phone,
    }))
}

async fn realtime(
    State(server): State<FakeChatServer>,
    Query(params): Query<HashMap<String, String>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let token = params.get("token").cloned().unwrap_or_default();
    {
        let mut data = server.data.lock().await;
        if token != data.access_token {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        data.socket_connections += 1;
        data.socket_tokens.push(token);
    }
    let commands = server.sockets.subscribe();
    upgrade.on_upgrade(move |socket| serve_socket(server, socket, commands))
}

async fn serve_socket(
    server: FakeChatServer,
    mut socket: WebSocket,
    mut commands: broadcast::Receiver<SocketCommand>,
) {
    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    let value: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));
                    let is_join = value.get("type").and_then(Value::as_str) == Some("join_conversation");
                    let conversation_id = value.get("conversation_id").cloned().unwrap_or(Value::Null);
                    server.data.lock().await.socket_inbound.push(value);
                    if is_join {
                        let ack = json!({ "type": "join_success", "conversation_id": conversation_id });
                        if socket.send(WsMessage::Text(ack.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Ok(SocketCommand::Text(text)) => {
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(SocketCommand::Close(code)) => {
                    let _ = socket
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: Cow::Borrowed("server closing"),
                        })))
                        .await;
                    break;
                }
                Ok(SocketCommand::Drop) | Err(_) => break,
            },
        }
    }
}
