use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::{
    domain::{unix_now, ConversationId, UserId},
    protocol::{RealtimeEvent, INTENTIONAL_CLOSE_CODE},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::{
    config::{realtime_url, ClientSettings},
    error::ConnectionError,
    listeners::{ListenerRegistry, Subscription},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code tungstenite reports when a close frame carried no status.
const NO_STATUS_CLOSE_CODE: u16 = 1005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub server_url: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl ConnectionConfig {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            server_url: settings.server_url.clone(),
            reconnect_delay: settings.reconnect_delay(),
            max_reconnect_attempts: settings.max_reconnect_attempts,
        }
    }
}

/// Everything the connection manager tells its listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotice {
    Event(RealtimeEvent),
    StateChanged(ConnectionState),
    Error(ConnectionError),
}

pub type ConnectionSubscription = Subscription<ConnectionNotice>;

struct ChannelState {
    phase: ConnectionState,
    token: Option<String>,
    attempts: u32,
    /// Bumped by every explicit connect/disconnect; tasks carrying an older
    /// value have been superseded and must not touch the state.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    supervisor: Option<JoinHandle<()>>,
}

struct Shared {
    config: ConnectionConfig,
    state: Mutex<ChannelState>,
    listeners: Arc<ListenerRegistry<ConnectionNotice>>,
}

enum Closure {
    /// We sent the close frame ourselves.
    Local,
    /// The server sent a close frame with this code.
    Remote(u16),
    /// The transport failed without a close handshake.
    Abnormal(String),
}

/// Owns the single realtime channel of a session: opens it, reconnects with a
/// fixed delay after abnormal closures, and fans normalized events out to
/// listeners. Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ChannelState {
                    phase: ConnectionState::Disconnected,
                    token: None,
                    attempts: 0,
                    generation: 0,
                    outbound: None,
                    supervisor: None,
                }),
                listeners: ListenerRegistry::new(),
            }),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.state.lock().await.phase
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&ConnectionNotice) + Send + Sync + 'static,
    ) -> ConnectionSubscription {
        self.shared.listeners.register(listener)
    }

    /// Opens the channel with `access_token`, resolving once it is open or the
    /// first attempt has failed. A failed first attempt still schedules
    /// reconnects in the background.
    pub async fn connect(&self, access_token: &str) -> Result<(), ConnectionError> {
        let opened = {
            let mut state = self.shared.state.lock().await;
            match state.phase {
                ConnectionState::Connected if state.token.as_deref() == Some(access_token) => {
                    return Ok(());
                }
                ConnectionState::Connecting => return Err(ConnectionError::ConnectInProgress),
                _ => {}
            }
            stop_channel(&mut state);

            state.generation += 1;
            state.token = Some(access_token.to_string());
            state.attempts = 0;
            state.phase = ConnectionState::Connecting;
            self.shared.notify_state(ConnectionState::Connecting);

            let (opened_tx, opened_rx) = oneshot::channel();
            state.supervisor = Some(tokio::spawn(Arc::clone(&self.shared).supervise(
                state.generation,
                access_token.to_string(),
                opened_tx,
            )));
            opened_rx
        };

        opened.await.unwrap_or(Err(ConnectionError::Cancelled))
    }

    /// Closes the channel with the intentional close code and stops any
    /// pending reconnect. Final for the current credential.
    pub async fn disconnect(&self) {
        let was = {
            let mut state = self.shared.state.lock().await;
            let was = state.phase;
            stop_channel(&mut state);
            state.generation += 1;
            state.token = None;
            state.attempts = 0;
            state.phase = ConnectionState::Disconnected;
            was
        };
        if was != ConnectionState::Disconnected {
            info!("realtime channel disconnected by client");
            self.shared.notify_state(ConnectionState::Disconnected);
        }
    }

    /// Swaps the credential used by future reconnect attempts without touching
    /// an open channel. No-op after an explicit disconnect.
    pub async fn update_token(&self, access_token: &str) -> bool {
        let mut state = self.shared.state.lock().await;
        match state.token.as_mut() {
            Some(token) => {
                *token = access_token.to_string();
                true
            }
            None => false,
        }
    }

    /// Returns whether the join request was handed to the channel.
    pub async fn join_conversation(&self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        let event = RealtimeEvent::join_conversation(conversation_id.clone(), user_id.clone(), unix_now());
        self.transmit("join_conversation", &event).await
    }

    /// Returns whether the message was handed to the channel.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        body: &str,
    ) -> bool {
        let event = RealtimeEvent::new_message(
            conversation_id.clone(),
            user_id.clone(),
            body,
            unix_now(),
        );
        self.transmit("send_message", &event).await
    }

    async fn transmit(&self, operation: &'static str, event: &RealtimeEvent) -> bool {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(operation, error = %err, "could not encode realtime event");
                return false;
            }
        };
        let sent = {
            let state = self.shared.state.lock().await;
            match (&state.outbound, state.phase) {
                (Some(outbound), ConnectionState::Connected) => {
                    outbound.send(Message::Text(payload)).is_ok()
                }
                _ => false,
            }
        };
        if !sent {
            warn!(operation, conversation_id = %event.conversation_id, "realtime channel not connected; dropping");
            self.shared
                .listeners
                .dispatch(&ConnectionNotice::Error(ConnectionError::ChannelNotReady {
                    operation,
                }));
        }
        sent
    }
}

/// Asks an open channel to close with the intentional code and cancels a
/// supervisor that is connecting or waiting to reconnect.
fn stop_channel(state: &mut ChannelState) {
    let was_connected = state.phase == ConnectionState::Connected;
    if let Some(outbound) = state.outbound.take() {
        let _ = outbound.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        })));
    }
    if let Some(supervisor) = state.supervisor.take() {
        // A connected supervisor exits by itself once the close frame is out.
        if !was_connected {
            supervisor.abort();
        }
    }
}

impl Shared {
    fn notify_state(&self, phase: ConnectionState) {
        debug!(?phase, "realtime channel state changed");
        self.listeners
            .dispatch(&ConnectionNotice::StateChanged(phase));
    }

    fn dispatch_all(&self, notices: Vec<ConnectionNotice>) {
        for notice in &notices {
            if let ConnectionNotice::StateChanged(phase) = notice {
                debug!(?phase, "realtime channel state changed");
            }
            self.listeners.dispatch(notice);
        }
    }

    /// Drives one connect request: open, serve the session, and on abnormal
    /// closure wait and try again until the attempt budget runs out.
    async fn supervise(
        self: Arc<Self>,
        generation: u64,
        initial_token: String,
        opened: oneshot::Sender<Result<(), ConnectionError>>,
    ) {
        let mut opened = Some(opened);
        let mut token = initial_token;

        loop {
            match open_socket(&self.config.server_url, &token).await {
                Ok(socket) => {
                    let Some(outbound) = self.mark_connected(generation).await else {
                        return;
                    };
                    if let Some(opened) = opened.take() {
                        let _ = opened.send(Ok(()));
                    }
                    let closure = self.run_session(socket, outbound).await;
                    if !self.should_reconnect(generation, closure).await {
                        return;
                    }
                }
                Err(error) => {
                    warn!(error = %error, "realtime channel failed to open");
                    self.listeners
                        .dispatch(&ConnectionNotice::Error(error.clone()));
                    let retryable = !matches!(error, ConnectionError::InvalidUrl(_));
                    if let Some(opened) = opened.take() {
                        let _ = opened.send(Err(error));
                    }
                    if !retryable {
                        self.give_up(generation).await;
                        return;
                    }
                }
            }

            let Some(delay) = self.schedule_reconnect(generation).await else {
                return;
            };
            tokio::time::sleep(delay).await;
            match self.begin_attempt(generation).await {
                Some(current) => token = current,
                None => return,
            }
        }
    }

    async fn mark_connected(&self, generation: u64) -> Option<mpsc::UnboundedReceiver<Message>> {
        let receiver = {
            let mut state = self.state.lock().await;
            if state.generation != generation {
                return None;
            }
            let (sender, receiver) = mpsc::unbounded_channel();
            state.outbound = Some(sender);
            state.phase = ConnectionState::Connected;
            state.attempts = 0;
            receiver
        };
        info!("realtime channel connected");
        self.notify_state(ConnectionState::Connected);
        Some(receiver)
    }

    async fn run_session(
        &self,
        socket: Socket,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) -> Closure {
        let (mut writer, mut reader) = socket.split();
        loop {
            tokio::select! {
                queued = outbound.recv() => match queued {
                    Some(message) => {
                        let closing = matches!(message, Message::Close(_));
                        if let Err(err) = writer.send(message).await {
                            return Closure::Abnormal(format!("send failed: {err}"));
                        }
                        if closing {
                            return Closure::Local;
                        }
                    }
                    None => return Closure::Local,
                },
                inbound = reader.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.deliver(&text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => self.deliver(&text),
                        Err(_) => warn!("dropping non-UTF-8 realtime frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame
                            .map(|frame| u16::from(frame.code))
                            .unwrap_or(NO_STATUS_CLOSE_CODE);
                        return Closure::Remote(code);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Closure::Abnormal(err.to_string()),
                    None => return Closure::Abnormal("stream ended without a close frame".into()),
                },
            }
        }
    }

    fn deliver(&self, raw: &str) {
        match normalize_payload(raw, unix_now()) {
            Ok(event) => {
                debug!(kind = ?event.kind, conversation_id = %event.conversation_id, "realtime event");
                self.listeners.dispatch(&ConnectionNotice::Event(event));
            }
            Err(error) => warn!(error = %error, "dropping realtime payload"),
        }
    }

    async fn should_reconnect(&self, generation: u64, closure: Closure) -> bool {
        let mut notices = Vec::new();
        let reconnect = {
            let mut state = self.state.lock().await;
            if state.generation != generation {
                return false;
            }
            state.outbound = None;
            match closure {
                Closure::Local => {
                    state.phase = ConnectionState::Disconnected;
                    notices.push(ConnectionNotice::StateChanged(ConnectionState::Disconnected));
                    false
                }
                Closure::Remote(code) if code == INTENTIONAL_CLOSE_CODE => {
                    info!("server closed the realtime channel");
                    state.phase = ConnectionState::Disconnected;
                    notices.push(ConnectionNotice::StateChanged(ConnectionState::Disconnected));
                    false
                }
                Closure::Remote(code) => {
                    warn!(code, "realtime channel closed abnormally");
                    true
                }
                Closure::Abnormal(reason) => {
                    warn!(%reason, "realtime channel lost");
                    notices.push(ConnectionNotice::Error(
                        ConnectionError::TransportUnreachable(reason),
                    ));
                    true
                }
            }
        };
        self.dispatch_all(notices);
        reconnect
    }

    /// Spends one reconnect attempt and returns the delay to wait, or gives up
    /// when the budget is exhausted.
    async fn schedule_reconnect(&self, generation: u64) -> Option<Duration> {
        let mut notices = Vec::new();
        let delay = {
            let mut state = self.state.lock().await;
            if state.generation != generation {
                return None;
            }
            if state.attempts >= self.config.max_reconnect_attempts {
                warn!(attempts = state.attempts, "giving up on the realtime channel");
                state.phase = ConnectionState::Disconnected;
                state.supervisor = None;
                notices.push(ConnectionNotice::Error(ConnectionError::ReconnectExhausted {
                    attempts: state.attempts,
                }));
                notices.push(ConnectionNotice::StateChanged(ConnectionState::Disconnected));
                None
            } else {
                state.attempts += 1;
                state.phase = ConnectionState::Reconnecting;
                info!(
                    attempt = state.attempts,
                    max_attempts = self.config.max_reconnect_attempts,
                    delay_ms = self.config.reconnect_delay.as_millis() as u64,
                    "scheduling realtime reconnect"
                );
                notices.push(ConnectionNotice::StateChanged(ConnectionState::Reconnecting));
                Some(self.config.reconnect_delay)
            }
        };
        self.dispatch_all(notices);
        delay
    }

    async fn begin_attempt(&self, generation: u64) -> Option<String> {
        let token = {
            let mut state = self.state.lock().await;
            if state.generation != generation {
                return None;
            }
            let token = state.token.clone()?;
            state.phase = ConnectionState::Connecting;
            token
        };
        self.notify_state(ConnectionState::Connecting);
        Some(token)
    }

    async fn give_up(&self, generation: u64) {
        {
            let mut state = self.state.lock().await;
            if state.generation != generation {
                return;
            }
            state.phase = ConnectionState::Disconnected;
            state.supervisor = None;
        }
        self.notify_state(ConnectionState::Disconnected);
    }
}

async fn open_socket(server_url: &str, access_token: &str) -> Result<Socket, ConnectionError> {
    let url = realtime_url(server_url, access_token)?;
    let (socket, _) = connect_async(url.as_str())
        .await
        .map_err(|err| ConnectionError::TransportUnreachable(err.to_string()))?;
    Ok(socket)
}

/// Turns one inbound frame into an event.
///
/// Structured payloads decode directly, except that a `message` field holding
/// a JSON object is unwrapped and used as the event instead. Anything that is
/// not a JSON object, plain text or a bare JSON scalar or array, becomes a
/// `message_received` event with empty sender and conversation, stamped `now`.
/// An object with an unknown `type` is rejected.
pub fn normalize_payload(raw: &str, now: i64) -> Result<RealtimeEvent, ConnectionError> {
    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(raw) else {
        return Ok(RealtimeEvent::raw_text(raw, now));
    };

    let nested = ["message", "messeage"]
        .iter()
        .filter_map(|key| fields.get(*key).and_then(Value::as_str))
        .find_map(|text| match serde_json::from_str::<Value>(text) {
            Ok(inner @ Value::Object(_)) => Some(inner),
            _ => None,
        });
    let effective = nested.unwrap_or(Value::Object(fields));

    serde_json::from_value(effective)
        .map_err(|err| ConnectionError::MalformedPayload(err.to_string()))
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
