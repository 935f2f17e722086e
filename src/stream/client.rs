//! Bidirectional chat stream over a WebSocket.
//!
//! A [`StreamingChannel`] owns one connection. Once open, two tasks run
//! independently of each other:
//!
//! - the writer drains the outbound queue in enqueue order;
//! - the reader hands inbound messages to the caller in arrival order.
//!
//! A slow consumer never holds up sends and a full send queue never holds up
//! inbound delivery. Every lifecycle change goes through one shared state
//! cell whose terminal transition doubles as the completion signal.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::api::auth::AuthError;
use crate::config::{Endpoint, StreamOptions, STREAM_PATH};
use crate::credentials::{Credential, CredentialStore};
use crate::stream::proto::{
    ChatId, ClientMessage, MessageId, RemoteErrorCode, ServerMessage, UserId,
};
use crate::stream::state::{
    sending_finished, terminal_reached, Lifecycle, StateCell, StreamState,
};

/// Upper bound on flushing our close frame.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Errors produced by the chat stream.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The operation needs an open stream. This is a caller bug, not a
    /// transient condition.
    #[error("stream is not open (state: {0:?})")]
    NotOpen(StreamState),

    #[error("stream was already opened")]
    AlreadyOpen,

    #[error("no valid credential; sign in first")]
    NoCredential,

    /// The service refused the credential, at upgrade time or mid-stream.
    #[error("credential rejected by the stream service: {0}")]
    Unauthorized(String),

    #[error("stream cancelled")]
    Cancelled,

    #[error("stream did not finish in time and was shut down")]
    ForcedShutdown,

    #[error("stream protocol error: {0}")]
    Protocol(String),

    #[error("stream unavailable: {0}")]
    Unavailable(String),
}

impl StreamError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    fn from_remote(code: RemoteErrorCode, message: String) -> Self {
        match code {
            RemoteErrorCode::Unauthenticated => Self::Unauthorized(message),
            RemoteErrorCode::Unavailable | RemoteErrorCode::Internal => Self::Unavailable(message),
            RemoteErrorCode::InvalidArgument | RemoteErrorCode::NotFound => Self::Protocol(message),
        }
    }
}

impl From<AuthError> for StreamError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::NoCredential | AuthError::InvalidCredentials => Self::NoCredential,
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// Encrypted message addressed to a chat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub chat_id: ChatId,
    pub encrypted_content: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(chat_id: ChatId, encrypted_content: impl Into<Vec<u8>>) -> Self {
        Self {
            chat_id,
            encrypted_content: encrypted_content.into(),
        }
    }
}

/// Encrypted message received on the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// Arrival order on this connection, starting at 1.
    pub sequence: u64,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub encrypted_content: Vec<u8>,
}

/// Entry point for opening chat streams.
#[derive(Clone, Debug)]
pub struct StreamClient {
    endpoint: Endpoint,
    credentials: Arc<CredentialStore>,
    options: StreamOptions,
}

impl StreamClient {
    pub fn new(endpoint: Endpoint, credentials: Arc<CredentialStore>) -> Self {
        Self {
            endpoint,
            credentials,
            options: StreamOptions::default(),
        }
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    pub fn url(&self) -> String {
        self.endpoint.ws_url(STREAM_PATH)
    }

    /// Creates an idle channel; nothing is connected until
    /// [`StreamingChannel::open`].
    pub fn channel(&self) -> StreamingChannel {
        StreamingChannel {
            url: self.url(),
            credentials: Arc::clone(&self.credentials),
            options: self.options.clone(),
            state: StateCell::new(),
            outbound: Mutex::new(None),
            inbound: None,
            user_id: None,
            tasks: Vec::new(),
        }
    }

    /// Creates a channel and opens it.
    pub async fn open(&self) -> Result<StreamingChannel, StreamError> {
        let mut channel = self.channel();
        channel.open().await?;
        Ok(channel)
    }
}

impl From<OutboundMessage> for ClientMessage {
    fn from(message: OutboundMessage) -> Self {
        ClientMessage::SendMessage {
            chat_id: message.chat_id,
            aes_encrypted_content: message.encrypted_content,
        }
    }
}

/// Sending side of the writer's queue. Dropping it asks the writer to start
/// the websocket close handshake once everything queued has gone out.
#[derive(Debug)]
enum OutboundQueue {
    Bounded(mpsc::Sender<OutboundMessage>),
    Unbounded(mpsc::UnboundedSender<OutboundMessage>),
}

#[derive(Debug)]
enum OutboundReceiver {
    Bounded(mpsc::Receiver<OutboundMessage>),
    Unbounded(mpsc::UnboundedReceiver<OutboundMessage>),
}

impl OutboundQueue {
    fn new(capacity: Option<usize>) -> (Self, OutboundReceiver) {
        match capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (Self::Bounded(tx), OutboundReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Self::Unbounded(tx), OutboundReceiver::Unbounded(rx))
            }
        }
    }

    /// Waits for queue space only when bounded. Fails once the writer is gone.
    async fn push(&self, item: OutboundMessage) -> Result<(), OutboundMessage> {
        match self {
            Self::Bounded(tx) => tx.send(item).await.map_err(|err| err.0),
            Self::Unbounded(tx) => tx.send(item).map_err(|err| err.0),
        }
    }
}

impl OutboundReceiver {
    async fn recv(&mut self) -> Option<OutboundMessage> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Receiving half of an open stream.
///
/// Messages come out in the order the server sent them, each at most once.
/// After the stream is cancelled nothing more is handed out, including
/// messages that had already arrived.
#[derive(Debug)]
pub struct Inbound {
    rx: mpsc::UnboundedReceiver<InboundMessage>,
    lifecycle: watch::Receiver<Lifecycle>,
}

impl Inbound {
    /// Next message, or `None` once the stream has ended and the buffer is
    /// drained, or immediately after cancellation.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        if self.cancelled() {
            self.rx.close();
            return None;
        }
        let message = self.rx.recv().await?;
        if self.cancelled() {
            self.rx.close();
            return None;
        }
        Some(message)
    }

    /// Hands every message to `handler` on a blocking-pool thread.
    ///
    /// The handler may block (write to a terminal, decrypt, take a lock)
    /// without stalling the async runtime. A slow handler delays only
    /// further deliveries, never sends. A call already running when the
    /// stream is cancelled finishes; none starts afterwards.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch<F>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(InboundMessage) + Send + 'static,
    {
        let runtime = Handle::current();
        tokio::task::spawn_blocking(move || {
            while let Some(message) = runtime.block_on(self.recv()) {
                handler(message);
            }
        })
    }

    fn cancelled(&self) -> bool {
        self.lifecycle.borrow().is_cancelled()
    }
}

/// One bidirectional chat stream.
///
/// ```text
/// Idle --open--> Open --half_close--> HalfClosedLocal --remote close--> Closed
///                  \______________ error / cancel / close ____________> Failed
/// ```
#[derive(Debug)]
pub struct StreamingChannel {
    url: String,
    credentials: Arc<CredentialStore>,
    options: StreamOptions,
    state: StateCell,
    outbound: Mutex<Option<OutboundQueue>>,
    inbound: Option<Inbound>,
    user_id: Option<UserId>,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamingChannel {
    pub fn state(&self) -> StreamState {
        self.state.state()
    }

    /// User id the server greeted this connection with.
    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    /// Connects, attaching the current credential once for the life of the
    /// stream, and waits for the server greeting.
    pub async fn open(&mut self) -> Result<(), StreamError> {
        match self.state.state() {
            StreamState::Idle => {}
            StreamState::Open | StreamState::HalfClosedLocal => {
                return Err(StreamError::AlreadyOpen)
            }
            terminal => return Err(StreamError::NotOpen(terminal)),
        }

        let (socket, credential, user_id) = match self.handshake().await {
            Ok(parts) => parts,
            Err(err) => {
                warn!(event = "stream_open_failed", error = %err);
                self.state.fail(err.clone());
                return Err(err);
            }
        };

        let (sink, source) = socket.split();
        let (queue, queue_rx) = OutboundQueue::new(self.options.outbound_capacity);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        self.state.advance(StreamState::Open);
        *self.outbound.get_mut() = Some(queue);
        self.inbound = Some(Inbound {
            rx: inbound_rx,
            lifecycle: self.state.subscribe(),
        });
        self.user_id = Some(user_id);
        self.tasks
            .push(tokio::spawn(run_writer(sink, queue_rx, self.state.clone())));
        self.tasks.push(tokio::spawn(run_reader(
            source,
            inbound_tx,
            self.state.clone(),
            Arc::clone(&self.credentials),
            credential,
        )));

        info!(event = "stream_opened", user_id = user_id.0);
        Ok(())
    }

    /// Queues a message for transmission.
    ///
    /// Only valid while open. Messages from one caller reach the server in
    /// the order they were queued.
    pub async fn send(&self, message: OutboundMessage) -> Result<(), StreamError> {
        let guard = self.outbound.lock().await;
        let state = self.state.state();
        match guard.as_ref() {
            Some(queue) if state == StreamState::Open => queue
                .push(message)
                .await
                .map_err(|_| StreamError::NotOpen(self.state.state())),
            _ => Err(StreamError::NotOpen(state)),
        }
    }

    /// Signals that no more messages will be sent.
    ///
    /// Messages queued earlier are still flushed before the server sees the
    /// half-close. Inbound delivery continues until the server completes.
    ///
    /// Never waits on queue space or the network. It only waits for a `send`
    /// already in progress on another task to finish queueing.
    pub async fn half_close(&self) -> Result<(), StreamError> {
        let _queue = self.outbound.lock().await;
        if !self.state.advance(StreamState::HalfClosedLocal) {
            return Err(StreamError::NotOpen(self.state.state()));
        }
        debug!(event = "stream_half_close_requested");
        Ok(())
    }

    /// Takes the inbound receiver. Returns `None` before open or if it was
    /// already taken.
    pub fn take_inbound(&mut self) -> Option<Inbound> {
        self.inbound.take()
    }

    /// Waits until the stream is terminal and returns how it ended.
    ///
    /// This wait is unbounded; wrap it in a timeout.
    pub async fn wait_terminal(&self) -> Result<(), StreamError> {
        let state = self.state.state();
        if state == StreamState::Idle {
            return Err(StreamError::NotOpen(state));
        }
        let mut lifecycle = self.state.subscribe();
        terminal_reached(&mut lifecycle).await;
        self.state.outcome().unwrap_or_else(|| {
            Err(StreamError::Protocol(
                "stream ended without a terminal state".to_string(),
            ))
        })
    }

    /// Cancels an open or half-closed stream.
    ///
    /// Inbound delivery stops at once and queued but unsent messages are
    /// dropped. The terminal signal fires with [`StreamError::Cancelled`].
    pub fn cancel(&self) {
        if !self.state.state().is_live() {
            return;
        }
        if self.state.fail(StreamError::Cancelled) {
            info!(event = "stream_cancelled");
        }
    }

    /// Brings the connection down and returns how the stream ended.
    ///
    /// Queued messages are flushed and the websocket close handshake starts.
    /// A stream the server finishes within `grace` ends `Closed` (or with
    /// whatever failure the server reported). One that is still live when
    /// `grace` runs out fails with [`StreamError::ForcedShutdown`] and its
    /// transport is aborted. On a terminal stream this only reaps the
    /// transport tasks.
    pub async fn close(&mut self, grace: Duration) -> Result<(), StreamError> {
        if self.state.state() == StreamState::Idle {
            self.state.advance(StreamState::Closed);
            return Ok(());
        }
        let deadline = Instant::now() + grace;
        self.outbound.get_mut().take();

        let mut lifecycle = self.state.subscribe();
        if timeout_at(deadline, terminal_reached(&mut lifecycle))
            .await
            .is_err()
        {
            self.record_forced_shutdown(grace);
        }
        self.join_tasks(deadline).await;
        self.outcome()
    }

    /// Fails a live stream with [`StreamError::ForcedShutdown`] right away,
    /// then gives the transport `grace` to wind down before aborting it.
    ///
    /// On a terminal stream the existing outcome is kept.
    pub async fn force_shutdown(&mut self, grace: Duration) -> Result<(), StreamError> {
        if self.state.state() == StreamState::Idle {
            self.state.advance(StreamState::Closed);
            return Ok(());
        }
        self.record_forced_shutdown(grace);
        self.outbound.get_mut().take();
        self.join_tasks(Instant::now() + grace).await;
        self.outcome()
    }

    fn record_forced_shutdown(&self, grace: Duration) {
        if self.state.fail(StreamError::ForcedShutdown) {
            warn!(
                event = "stream_forced_shutdown",
                grace_ms = grace.as_millis() as u64
            );
        }
    }

    fn outcome(&self) -> Result<(), StreamError> {
        self.state
            .outcome()
            .unwrap_or(Err(StreamError::ForcedShutdown))
    }

    async fn handshake(&self) -> Result<(WsStream, Credential, UserId), StreamError> {
        let request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| StreamError::Protocol(format!("invalid stream url: {err}")))?;
        let authorized = self.credentials.attach_to(request)?;
        let credential = authorized.credential;
        let bound = self.options.handshake_timeout;

        let connected = timeout(bound, connect_async(authorized.call))
            .await
            .map_err(|_| StreamError::Unavailable(format!("connect timed out after {bound:?}")))?;
        let mut socket = match connected {
            Ok((socket, _response)) => socket,
            Err(WsError::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
                self.credentials.reject(&credential);
                return Err(StreamError::Unauthorized(
                    "stream upgrade refused with 401".to_string(),
                ));
            }
            Err(err) => return Err(transport_error(err)),
        };

        let greeting = timeout(bound, recv_hello(&mut socket))
            .await
            .map_err(|_| StreamError::Unavailable(format!("no greeting within {bound:?}")))?;
        match greeting {
            Ok(user_id) => Ok((socket, credential, user_id)),
            Err(err) => {
                if matches!(err, StreamError::Unauthorized(_)) {
                    self.credentials.reject(&credential);
                }
                Err(err)
            }
        }
    }

    async fn join_tasks(&mut self, deadline: Instant) {
        for mut task in std::mem::take(&mut self.tasks) {
            if timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                debug!(event = "stream_task_aborted");
            }
        }
    }
}

impl Drop for StreamingChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn recv_hello(socket: &mut WsStream) -> Result<UserId, StreamError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return match ServerMessage::from_text(&text) {
                    Ok(ServerMessage::HelloOk { user_id }) => Ok(user_id),
                    Ok(ServerMessage::Error { code, message }) => {
                        Err(StreamError::from_remote(code, message))
                    }
                    Ok(_) => Err(StreamError::Protocol(
                        "expected hello_ok as the first server message".to_string(),
                    )),
                    Err(err) => Err(StreamError::Protocol(format!("undecodable greeting: {err}"))),
                };
            }
            Some(Ok(Message::Ping(payload))) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(transport_error)?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err(StreamError::Unavailable(
                    "socket closed before hello_ok".to_string(),
                ));
            }
            Some(Ok(_)) => {
                return Err(StreamError::Protocol(
                    "received non-text frame before hello_ok".to_string(),
                ));
            }
            Some(Err(err)) => return Err(transport_error(err)),
            None => {
                return Err(StreamError::Unavailable(
                    "socket ended before hello_ok".to_string(),
                ));
            }
        }
    }
}

async fn run_writer(mut sink: WsSink, mut queue: OutboundReceiver, state: StateCell) {
    let mut lifecycle = state.subscribe();
    let mut phase = state.subscribe();
    let mut completed = false;

    loop {
        // Queued messages win over the half-close so they go out first.
        let next = tokio::select! {
            biased;
            _ = terminal_reached(&mut lifecycle) => break,
            next = queue.recv() => next,
            _ = sending_finished(&mut phase), if !completed => {
                completed = true;
                if !write_frame(&mut sink, ClientMessage::Complete, &state, &mut lifecycle).await {
                    break;
                }
                debug!(event = "stream_half_closed");
                continue;
            }
        };
        let Some(message) = next else {
            // Channel closing: finish the half-close if one is pending, then
            // start the close handshake and let the reader see the reply.
            if !completed
                && state.state() == StreamState::HalfClosedLocal
                && !write_frame(&mut sink, ClientMessage::Complete, &state, &mut lifecycle).await
            {
                break;
            }
            let _ = timeout(CLOSE_FRAME_TIMEOUT, sink.close()).await;
            debug!(event = "stream_close_handshake_started");
            terminal_reached(&mut lifecycle).await;
            break;
        };
        if !write_frame(&mut sink, message.into(), &state, &mut lifecycle).await {
            break;
        }
    }

    let _ = timeout(CLOSE_FRAME_TIMEOUT, sink.close()).await;
}

/// Writes one frame unless the stream goes terminal first. Returns whether
/// the writer should keep going.
async fn write_frame(
    sink: &mut WsSink,
    message: ClientMessage,
    state: &StateCell,
    lifecycle: &mut watch::Receiver<Lifecycle>,
) -> bool {
    let text = match message.to_text() {
        Ok(text) => text,
        Err(err) => {
            state.fail(StreamError::Protocol(format!(
                "failed to encode client message: {err}"
            )));
            return false;
        }
    };
    let sent = tokio::select! {
        biased;
        _ = terminal_reached(lifecycle) => return false,
        sent = sink.send(Message::Text(text)) => sent,
    };
    match sent {
        Ok(()) => true,
        Err(err) => {
            warn!(event = "stream_send_failed", error = %err);
            state.fail(transport_error(err));
            false
        }
    }
}

async fn run_reader(
    mut source: WsSource,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    state: StateCell,
    credentials: Arc<CredentialStore>,
    credential: Credential,
) {
    let mut lifecycle = state.subscribe();
    let mut sequence = 0u64;

    loop {
        let frame = tokio::select! {
            biased;
            _ = terminal_reached(&mut lifecycle) => return,
            frame = source.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                finish_on_close(&state, frame);
                return;
            }
            Some(Ok(Message::Binary(_))) => {
                state.fail(StreamError::Protocol("unexpected binary frame".to_string()));
                return;
            }
            // Pings are answered by the websocket layer.
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                state.fail(transport_error(err));
                return;
            }
            None => {
                state.fail(StreamError::Unavailable(
                    "connection ended without a close frame".to_string(),
                ));
                return;
            }
        };

        match ServerMessage::from_text(&text) {
            Ok(ServerMessage::NewMessage {
                message_id,
                chat_id,
                sender_id,
                aes_encrypted_content,
            }) => {
                sequence += 1;
                // Without a receiver the message is dropped, never replayed.
                let _ = inbound.send(InboundMessage {
                    sequence,
                    chat_id,
                    message_id,
                    sender_id,
                    encrypted_content: aes_encrypted_content,
                });
            }
            Ok(ServerMessage::Error { code, message }) => {
                let error = StreamError::from_remote(code, message);
                if matches!(error, StreamError::Unauthorized(_)) {
                    credentials.reject(&credential);
                }
                warn!(event = "stream_remote_error", error = %error);
                state.fail(error);
                return;
            }
            Ok(ServerMessage::HelloOk { .. }) => debug!(event = "stream_duplicate_greeting"),
            Err(err) => {
                state.fail(StreamError::Protocol(format!(
                    "undecodable server message: {err}"
                )));
                return;
            }
        }
    }
}

fn finish_on_close(state: &StateCell, frame: Option<CloseFrame<'_>>) {
    match frame {
        Some(frame) if frame.code != CloseCode::Normal => {
            state.fail(StreamError::Unavailable(format!(
                "closed by server with code {}: {}",
                u16::from(frame.code),
                frame.reason
            )));
        }
        _ => {
            if state.advance(StreamState::Closed) {
                info!(event = "stream_completed_by_remote");
            }
        }
    }
}

fn transport_error(err: WsError) -> StreamError {
    StreamError::Unavailable(err.to_string())
}
