use crate::error::AppError;
use crate::market::status::ConnectionStatusBroadcaster;
use crate::market::types::ConnectionState;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const RECONNECT_MAX_DELAY_MS: u64 = 10_000;

pub type FeedWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            base_delay: Duration::from_millis(RECONNECT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(RECONNECT_MAX_DELAY_MS),
        }
    }
}

impl ReconnectPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// `min(base * 2^attempt, max)`; `attempt` counts retries already scheduled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Clean,
    Abnormal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    Retry { attempt: u32, delay: Duration },
    Stop,
    GiveUp,
}

/// Retry budget and lifecycle phase of one socket session.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempts: u32,
    manual_close: bool,
    phase: ConnectionState,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            manual_close: false,
            phase: ConnectionState::Disconnected,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn phase(&self) -> ConnectionState {
        self.phase
    }

    pub fn is_manual_close(&self) -> bool {
        self.manual_close
    }

    pub fn begin_attempt(&mut self) -> ConnectionState {
        self.phase = if self.attempts == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        };
        self.phase
    }

    pub fn on_open(&mut self) {
        self.attempts = 0;
        self.phase = ConnectionState::Connected;
    }

    pub fn request_close(&mut self) {
        self.manual_close = true;
    }

    pub fn on_construction_error(&mut self) {
        self.phase = ConnectionState::Disconnected;
    }

    pub fn on_close(&mut self, kind: CloseKind) -> CloseDecision {
        if self.manual_close || kind == CloseKind::Clean {
            self.phase = ConnectionState::Disconnected;
            return CloseDecision::Stop;
        }

        if self.attempts < self.policy.max_attempts {
            let delay = self.policy.delay_for(self.attempts);
            self.attempts += 1;
            self.phase = ConnectionState::Reconnecting;
            return CloseDecision::Retry {
                attempt: self.attempts,
                delay,
            };
        }

        self.phase = ConnectionState::Disconnected;
        CloseDecision::GiveUp
    }

    /// Explicit reconnect after giving up: a fresh retry budget.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.manual_close = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RawSocketStatus {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Frames queued by a handler; flushed in order before the next inbound frame is read.
#[derive(Debug, Default)]
pub struct Outbox {
    frames: Vec<String>,
}

impl Outbox {
    pub fn push(&mut self, frame: String) {
        self.frames.push(frame);
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, String> {
        self.frames.drain(..)
    }
}

/// Protocol hooks attached to a managed socket. Calls are sequential and never overlap.
pub trait SocketHandler: Send + 'static {
    fn on_open(&mut self, outbox: &mut Outbox);

    fn on_message(&mut self, payload: &mut [u8], outbox: &mut Outbox);

    fn on_error(&mut self, _error: &AppError) {}

    fn on_close(&mut self, _kind: CloseKind) {}

    /// Retry budget spent; the socket stays down until `reconnect` is requested.
    fn on_exhausted(&mut self) {}
}

#[derive(Clone)]
pub enum UrlSource {
    Fixed(String),
    Dynamic(Arc<dyn Fn() -> String + Send + Sync>),
}

impl UrlSource {
    pub fn dynamic<F>(builder: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(builder))
    }

    pub fn resolve(&self) -> String {
        match self {
            Self::Fixed(url) => url.clone(),
            Self::Dynamic(builder) => builder(),
        }
    }
}

impl From<String> for UrlSource {
    fn from(value: String) -> Self {
        Self::Fixed(value)
    }
}

impl From<&str> for UrlSource {
    fn from(value: &str) -> Self {
        Self::Fixed(value.to_string())
    }
}

#[derive(Debug)]
enum SocketCommand {
    Reconnect,
}

#[derive(Debug)]
struct SocketShared {
    raw_status: Mutex<RawSocketStatus>,
    manual_close: AtomicBool,
}

impl SocketShared {
    fn set_raw(&self, status: RawSocketStatus) {
        *self.raw_status.lock() = status;
    }
}

/// Supervises one websocket session: connects, reconnects with backoff, and closes on request.
pub struct ManagedSocketClient {
    shared: Arc<SocketShared>,
    cancel_token: CancellationToken,
    commands: mpsc::UnboundedSender<SocketCommand>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedSocketClient {
    pub fn spawn<H: SocketHandler>(
        url: UrlSource,
        policy: ReconnectPolicy,
        handler: H,
        status: ConnectionStatusBroadcaster,
    ) -> Self {
        let shared = Arc::new(SocketShared {
            raw_status: Mutex::new(RawSocketStatus::Connecting),
            manual_close: AtomicBool::new(false),
        });
        let cancel_token = CancellationToken::new();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let task_shared = Arc::clone(&shared);
        let task_token = cancel_token.clone();
        let join_handle = tokio::spawn(async move {
            run_socket(
                url,
                policy,
                handler,
                status,
                task_shared,
                task_token,
                command_rx,
            )
            .await;
        });

        Self {
            shared,
            cancel_token,
            commands,
            join_handle: Mutex::new(Some(join_handle)),
        }
    }

    pub fn raw_status(&self) -> RawSocketStatus {
        *self.shared.raw_status.lock()
    }

    pub fn is_manually_closed(&self) -> bool {
        self.shared.manual_close.load(Ordering::SeqCst)
    }

    /// Flags the session as intentionally closed before tearing down the connection.
    pub fn close(&self) {
        self.shared.manual_close.store(true, Ordering::SeqCst);
        self.cancel_token.cancel();
    }

    /// Restarts a session that gave up. Ignored while a connection is live or after `close`.
    pub fn reconnect(&self) -> bool {
        if self.is_manually_closed() || self.raw_status() != RawSocketStatus::Closed {
            return false;
        }
        self.commands.send(SocketCommand::Reconnect).is_ok()
    }

    pub async fn shutdown(self) {
        self.close();
        let handle = self.join_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for ManagedSocketClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_socket<H: SocketHandler>(
    url: UrlSource,
    policy: ReconnectPolicy,
    mut handler: H,
    status: ConnectionStatusBroadcaster,
    shared: Arc<SocketShared>,
    cancel_token: CancellationToken,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
) {
    let mut state = ReconnectState::new(policy);

    while !cancel_token.is_cancelled() {
        status.set_status(state.begin_attempt());
        shared.set_raw(RawSocketStatus::Connecting);

        let endpoint = url.resolve();
        debug!(url = %endpoint, attempt = state.attempts(), "opening websocket");
        let connected = tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = connect_socket(&endpoint) => result,
        };

        let close_kind = match connected {
            Ok(stream) => {
                state.on_open();
                shared.set_raw(RawSocketStatus::Open);
                status.set_status(ConnectionState::Connected);
                info!(url = %endpoint, "websocket connected");
                drive_session(stream, &mut handler, &shared, &cancel_token).await
            }
            Err(error) if is_construction_error(&error) => {
                error!(url = %endpoint, %error, "failed to create websocket, not retrying");
                shared.set_raw(RawSocketStatus::Closed);
                state.on_construction_error();
                status.set_status(ConnectionState::Disconnected);
                handler.on_error(&error);
                if wait_for_reconnect(&cancel_token, &mut commands, &mut state).await {
                    continue;
                }
                break;
            }
            Err(error) => {
                warn!(url = %endpoint, %error, "websocket connect failed");
                handler.on_error(&error);
                CloseKind::Abnormal
            }
        };

        shared.set_raw(RawSocketStatus::Closed);
        handler.on_close(close_kind);
        if shared.manual_close.load(Ordering::SeqCst) || cancel_token.is_cancelled() {
            state.request_close();
        }

        match state.on_close(close_kind) {
            CloseDecision::Retry { attempt, delay } => {
                status.set_status(ConnectionState::Reconnecting);
                info!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling websocket reconnect"
                );
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            CloseDecision::Stop => {
                status.set_status(ConnectionState::Disconnected);
                if state.is_manual_close() {
                    break;
                }
                info!(url = %endpoint, "websocket closed cleanly by server");
                if !wait_for_reconnect(&cancel_token, &mut commands, &mut state).await {
                    break;
                }
            }
            CloseDecision::GiveUp => {
                status.set_status(ConnectionState::Disconnected);
                warn!(
                    attempts = policy.max_attempts,
                    "websocket reconnect attempts exhausted, feed unavailable"
                );
                handler.on_exhausted();
                if !wait_for_reconnect(&cancel_token, &mut commands, &mut state).await {
                    break;
                }
            }
        }
    }

    shared.set_raw(RawSocketStatus::Closed);
    status.set_status(ConnectionState::Disconnected);
}

async fn wait_for_reconnect(
    cancel_token: &CancellationToken,
    commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
    state: &mut ReconnectState,
) -> bool {
    tokio::select! {
        _ = cancel_token.cancelled() => false,
        command = commands.recv() => match command {
            Some(SocketCommand::Reconnect) => {
                info!("explicit websocket reconnect requested");
                state.reset();
                true
            }
            None => false,
        },
    }
}

async fn connect_socket(url: &str) -> Result<FeedWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
    Ok(stream)
}

async fn drive_session<H: SocketHandler>(
    stream: FeedWsStream,
    handler: &mut H,
    shared: &SocketShared,
    cancel_token: &CancellationToken,
) -> CloseKind {
    let (mut sink, mut source) = stream.split();
    let mut outbox = Outbox::default();

    handler.on_open(&mut outbox);
    if let Err(error) = flush_outbox(&mut sink, &mut outbox).await {
        warn!(%error, "failed to send opening frames");
        handler.on_error(&error);
        return CloseKind::Abnormal;
    }

    loop {
        let next = tokio::select! {
            _ = cancel_token.cancelled() => {
                shared.set_raw(RawSocketStatus::Closing);
                let close_frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client closing".into(),
                };
                if let Err(error) = sink.send(Message::Close(Some(close_frame))).await {
                    debug!(%error, "close frame not delivered");
                }
                return CloseKind::Clean;
            }
            next = source.next() => next,
        };

        match next {
            None => return CloseKind::Abnormal,
            Some(Ok(Message::Text(text))) => {
                let mut payload = text.into_bytes();
                handler.on_message(payload.as_mut_slice(), &mut outbox);
            }
            Some(Ok(Message::Binary(mut payload))) => {
                handler.on_message(payload.as_mut_slice(), &mut outbox);
            }
            Some(Ok(Message::Close(frame))) => {
                shared.set_raw(RawSocketStatus::Closing);
                let kind = classify_close(frame.as_ref());
                debug!(?frame, ?kind, "websocket close frame received");
                return kind;
            }
            Some(Ok(_)) => continue,
            Some(Err(error)) => {
                let fatal = is_fatal_transport_error(&error);
                let error = AppError::from(error);
                warn!(%error, fatal, "websocket transport error");
                handler.on_error(&error);
                if fatal {
                    return CloseKind::Abnormal;
                }
                continue;
            }
        }

        if let Err(error) = flush_outbox(&mut sink, &mut outbox).await {
            warn!(%error, "failed to send websocket frames");
            handler.on_error(&error);
            return CloseKind::Abnormal;
        }
    }
}

async fn flush_outbox<S>(sink: &mut S, outbox: &mut Outbox) -> Result<(), AppError>
where
    S: futures_util::Sink<Message, Error = tungstenite::Error> + Unpin,
{
    if outbox.is_empty() {
        return Ok(());
    }
    for frame in outbox.drain() {
        sink.feed(Message::Text(frame)).await?;
    }
    sink.flush().await?;
    Ok(())
}

fn classify_close(frame: Option<&CloseFrame<'_>>) -> CloseKind {
    match frame {
        Some(frame) if frame.code == CloseCode::Normal => CloseKind::Clean,
        _ => CloseKind::Abnormal,
    }
}

fn is_construction_error(error: &AppError) -> bool {
    match error {
        AppError::WebSocket(inner) => matches!(
            inner.as_ref(),
            tungstenite::Error::Url(_) | tungstenite::Error::HttpFormat(_)
        ),
        _ => false,
    }
}

fn is_fatal_transport_error(error: &tungstenite::Error) -> bool {
    !matches!(error, tungstenite::Error::Capacity(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    struct RecordingHandler {
        events: mpsc::UnboundedSender<String>,
    }

    impl SocketHandler for RecordingHandler {
        fn on_open(&mut self, outbox: &mut Outbox) {
            let _ = self.events.send("open".to_string());
            outbox.push("hello".to_string());
        }

        fn on_message(&mut self, payload: &mut [u8], _outbox: &mut Outbox) {
            let _ = self
                .events
                .send(format!("message:{}", String::from_utf8_lossy(payload)));
        }

        fn on_close(&mut self, kind: CloseKind) {
            let _ = self.events.send(format!("close:{kind:?}"));
        }

        fn on_exhausted(&mut self) {
            let _ = self.events.send("exhausted".to_string());
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event should arrive in time")
            .expect("handler channel should stay open")
    }

    async fn unused_local_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("ephemeral port should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        drop(listener);
        format!("ws://{addr}")
    }

    #[test]
    fn backoff_sequence_is_capped_and_bounded() {
        let mut state = ReconnectState::new(ReconnectPolicy::default());
        let mut delays = Vec::new();

        loop {
            state.begin_attempt();
            match state.on_close(CloseKind::Abnormal) {
                CloseDecision::Retry { delay, .. } => delays.push(delay.as_millis() as u64),
                CloseDecision::GiveUp => break,
                CloseDecision::Stop => panic!("abnormal close must not stop"),
            }
        }

        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000]);
        assert_eq!(state.phase(), ConnectionState::Disconnected);
        assert_eq!(state.on_close(CloseKind::Abnormal), CloseDecision::GiveUp);
    }

    #[test]
    fn successful_open_resets_retry_budget() {
        let mut state = ReconnectState::new(ReconnectPolicy::default());
        state.begin_attempt();
        let _ = state.on_close(CloseKind::Abnormal);
        let _ = state.on_close(CloseKind::Abnormal);
        assert_eq!(state.attempts(), 2);
        assert_eq!(state.begin_attempt(), ConnectionState::Reconnecting);

        state.on_open();

        assert_eq!(state.attempts(), 0);
        assert_eq!(
            state.on_close(CloseKind::Abnormal),
            CloseDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(1_000)
            }
        );
    }

    #[test]
    fn manual_close_suppresses_reconnect() {
        let mut state = ReconnectState::new(ReconnectPolicy::default());
        state.begin_attempt();
        state.on_open();

        state.request_close();

        assert_eq!(state.on_close(CloseKind::Abnormal), CloseDecision::Stop);
        assert_eq!(state.attempts(), 0);
    }

    #[test]
    fn clean_close_does_not_reconnect() {
        let mut state = ReconnectState::new(ReconnectPolicy::default());
        state.begin_attempt();
        state.on_open();

        assert_eq!(state.on_close(CloseKind::Clean), CloseDecision::Stop);
    }

    #[test]
    fn only_normal_close_code_counts_as_clean() {
        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        };
        let away = CloseFrame {
            code: CloseCode::Away,
            reason: "idle".into(),
        };

        assert_eq!(classify_close(Some(&normal)), CloseKind::Clean);
        assert_eq!(classify_close(Some(&away)), CloseKind::Abnormal);
        assert_eq!(classify_close(None), CloseKind::Abnormal);
    }

    #[test]
    fn url_source_rebuilds_on_every_resolve() {
        let counter = Arc::new(AtomicUsize::new(0));
        let source_counter = Arc::clone(&counter);
        let source = UrlSource::dynamic(move || {
            let n = source_counter.fetch_add(1, Ordering::SeqCst);
            format!("ws://127.0.0.1:9/{n}")
        });

        assert_eq!(source.resolve(), "ws://127.0.0.1:9/0");
        assert_eq!(source.resolve(), "ws://127.0.0.1:9/1");
        assert_eq!(UrlSource::from("ws://fixed").resolve(), "ws://fixed");
    }

    #[tokio::test]
    async fn refused_connections_retry_until_budget_is_spent() {
        let url = unused_local_url().await;
        let resolved = Arc::new(AtomicUsize::new(0));
        let resolved_counter = Arc::clone(&resolved);
        let source = UrlSource::dynamic(move || {
            resolved_counter.fetch_add(1, Ordering::SeqCst);
            url.clone()
        });
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let status = ConnectionStatusBroadcaster::new();

        let client = ManagedSocketClient::spawn(
            source,
            fast_policy(3),
            RecordingHandler { events: events_tx },
            status.clone(),
        );

        loop {
            if next_event(&mut events).await == "exhausted" {
                break;
            }
        }

        assert_eq!(resolved.load(Ordering::SeqCst), 4);
        assert_eq!(status.current(), ConnectionState::Disconnected);
        assert_eq!(client.raw_status(), RawSocketStatus::Closed);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_url_is_not_retried() {
        let resolved = Arc::new(AtomicUsize::new(0));
        let resolved_counter = Arc::clone(&resolved);
        let source = UrlSource::dynamic(move || {
            resolved_counter.fetch_add(1, Ordering::SeqCst);
            "not a url".to_string()
        });
        let (events_tx, _events) = mpsc::unbounded_channel();

        let client = ManagedSocketClient::spawn(
            source,
            fast_policy(3),
            RecordingHandler { events: events_tx },
            ConnectionStatusBroadcaster::new(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(resolved.load(Ordering::SeqCst), 1);
        assert_eq!(client.raw_status(), RawSocketStatus::Closed);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn exchanges_frames_and_manual_close_does_not_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("server should bind");
        let url = format!("ws://{}", listener.local_addr().expect("address"));
        let accepted = Arc::new(AtomicUsize::new(0));
        let server_accepted = Arc::clone(&accepted);
        let (server_tx, mut server_events) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                server_accepted.fetch_add(1, Ordering::SeqCst);
                let server_tx = server_tx.clone();
                tokio::spawn(async move {
                    let mut ws = accept_async(tcp).await.expect("handshake should succeed");
                    while let Some(Ok(message)) = ws.next().await {
                        match message {
                            Message::Text(text) => {
                                let _ = server_tx.send(format!("got:{text}"));
                                let _ = ws.send(Message::Text("world".to_string())).await;
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                    let _ = server_tx.send("closed".to_string());
                });
            }
        });

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let status = ConnectionStatusBroadcaster::new();
        let client = ManagedSocketClient::spawn(
            UrlSource::from(url),
            fast_policy(3),
            RecordingHandler { events: events_tx },
            status.clone(),
        );

        assert_eq!(next_event(&mut events).await, "open");
        assert_eq!(next_event(&mut events).await, "message:world");
        assert_eq!(next_event(&mut server_events).await, "got:hello");
        assert_eq!(status.current(), ConnectionState::Connected);
        assert_eq!(client.raw_status(), RawSocketStatus::Open);

        client.close();
        assert!(client.is_manually_closed());
        assert_eq!(next_event(&mut server_events).await, "closed");
        assert_eq!(next_event(&mut events).await, "close:Clean");
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(status.current(), ConnectionState::Disconnected);
        assert!(!client.reconnect());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn abrupt_server_drop_triggers_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("server should bind");
        let url = format!("ws://{}", listener.local_addr().expect("address"));
        let accepted = Arc::new(AtomicUsize::new(0));
        let server_accepted = Arc::clone(&accepted);

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let seen = server_accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut ws = accept_async(tcp).await.expect("handshake should succeed");
                    if seen == 0 {
                        drop(ws);
                        return;
                    }
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });

        let seen_states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen_states);
        let status = ConnectionStatusBroadcaster::new();
        let _subscription = status.subscribe(move |state| sink.lock().push(state));
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let client = ManagedSocketClient::spawn(
            UrlSource::from(url),
            fast_policy(3),
            RecordingHandler { events: events_tx },
            status.clone(),
        );

        assert_eq!(next_event(&mut events).await, "open");
        assert_eq!(next_event(&mut events).await, "close:Abnormal");
        assert_eq!(next_event(&mut events).await, "open");

        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert!(seen_states.lock().contains(&ConnectionState::Reconnecting));
        client.shutdown().await;
    }
}
