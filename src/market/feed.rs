use crate::error::AppError;
use crate::market::protocol::{
    decode_public_message, decode_server_message, pong_frame, ClientRequest, MarketDataFrame,
    PublicMessage, ServerMessage,
};
use crate::market::socket::{
    CloseKind, ManagedSocketClient, Outbox, ReconnectPolicy, SocketHandler, UrlSource,
};
use crate::market::status::ConnectionStatusBroadcaster;
use crate::market::types::{
    FeedBackend, MarketFeedConfig, MarketUpdate, SubscriptionSet, TimestampSource, PUBLIC_EXCHANGE,
};
use crate::time::TimeSource;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Update(MarketUpdate),
    AuthFailed { message: String },
    /// Reconnect budget spent; nothing more arrives until the socket is told to reconnect.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    AuthSent,
    Authenticated,
    Subscribed,
    AuthFailed,
}

fn emit(events: &mpsc::UnboundedSender<FeedEvent>, event: FeedEvent) {
    if events.send(event).is_err() {
        debug!("feed consumer dropped, discarding event");
    }
}

fn queue(outbox: &mut Outbox, frame: Result<String, AppError>, what: &'static str) {
    match frame {
        Ok(frame) => outbox.push(frame),
        Err(error) => error!(%error, frame = what, "failed to encode outbound frame"),
    }
}

/// Handshake-then-subscribe protocol of the authenticated backend.
pub struct AuthenticatedFeed {
    api_key: String,
    subscriptions: SubscriptionSet,
    phase: SessionPhase,
    broker: Option<String>,
    clock: Arc<dyn TimeSource>,
    events: mpsc::UnboundedSender<FeedEvent>,
}

impl AuthenticatedFeed {
    pub fn new(
        api_key: String,
        subscriptions: SubscriptionSet,
        clock: Arc<dyn TimeSource>,
        events: mpsc::UnboundedSender<FeedEvent>,
    ) -> Self {
        Self {
            api_key,
            subscriptions,
            phase: SessionPhase::Idle,
            broker: None,
            clock,
            events,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn broker(&self) -> Option<&str> {
        self.broker.as_deref()
    }

    fn handle(&mut self, message: ServerMessage, outbox: &mut Outbox) {
        match message {
            ServerMessage::Ping => queue(outbox, pong_frame(), "pong"),
            ServerMessage::AuthSuccess { broker } => self.on_authenticated(broker, outbox),
            ServerMessage::AuthFailure { message } => self.on_auth_failure(message),
            ServerMessage::Error { message } if self.phase == SessionPhase::AuthSent => {
                self.on_auth_failure(message)
            }
            ServerMessage::Error { message } => {
                warn!(phase = ?self.phase, message = %message, "feed server reported an error");
            }
            ServerMessage::MarketData(frame) => {
                if self.phase != SessionPhase::Subscribed {
                    debug!(
                        phase = ?self.phase,
                        "dropping market data received before subscription"
                    );
                    return;
                }
                if let Some(update) = self.accept_market_data(frame) {
                    emit(&self.events, FeedEvent::Update(update));
                }
            }
            ServerMessage::Unrecognized(kind) => {
                debug!(kind = %kind, "ignoring unrecognized feed frame");
            }
        }
    }

    fn on_authenticated(&mut self, broker: Option<String>, outbox: &mut Outbox) {
        if self.phase != SessionPhase::AuthSent {
            debug!(phase = ?self.phase, "ignoring duplicate authentication acknowledgment");
            return;
        }

        self.phase = SessionPhase::Authenticated;
        info!(broker = broker.as_deref().unwrap_or("unknown"), "feed authenticated");
        self.broker = broker;

        for subscription in self.subscriptions.iter() {
            let request = ClientRequest::Subscribe {
                symbol: &subscription.symbol,
                exchange: &subscription.exchange,
                mode: subscription.mode.as_u8(),
            };
            queue(outbox, request.to_frame(), "subscribe");
        }
        self.phase = SessionPhase::Subscribed;
        debug!(subscriptions = self.subscriptions.len(), "subscriptions replayed");
    }

    fn on_auth_failure(&mut self, message: String) {
        if self.phase == SessionPhase::AuthFailed {
            return;
        }
        self.phase = SessionPhase::AuthFailed;
        warn!(message = %message, "feed authentication failed");
        emit(&self.events, FeedEvent::AuthFailed { message });
    }

    fn accept_market_data(&self, frame: MarketDataFrame) -> Option<MarketUpdate> {
        let Some(symbol) = frame.symbol.as_deref() else {
            debug!("dropping market data without symbol");
            return None;
        };
        let Some(subscription) = self.subscriptions.find(symbol, frame.exchange.as_deref()) else {
            debug!(
                symbol,
                exchange = ?frame.exchange,
                "dropping market data for unsubscribed symbol"
            );
            return None;
        };
        let Some(last_price) = frame.last_price.filter(|price| price.is_finite() && *price > 0.0)
        else {
            debug!(
                symbol,
                price = ?frame.last_price,
                "dropping market data with non-positive price"
            );
            return None;
        };

        let (timestamp_ms, timestamp_source) = match frame.timestamp_ms {
            Some(timestamp_ms) => (timestamp_ms, TimestampSource::Server),
            None => (self.clock.now_ms(), TimestampSource::Local),
        };

        Some(MarketUpdate {
            symbol: subscription.symbol.clone(),
            exchange: subscription.exchange.clone(),
            last_price,
            open: frame.open,
            high: frame.high,
            low: frame.low,
            prev_close: frame.prev_close,
            timestamp_ms,
            timestamp_source,
        })
    }
}

impl SocketHandler for AuthenticatedFeed {
    fn on_open(&mut self, outbox: &mut Outbox) {
        debug!(api_key = "***", "sending feed authentication");
        queue(
            outbox,
            ClientRequest::Authenticate {
                api_key: &self.api_key,
            }
            .to_frame(),
            "authenticate",
        );
        self.phase = SessionPhase::AuthSent;
    }

    fn on_message(&mut self, payload: &mut [u8], outbox: &mut Outbox) {
        match decode_server_message(payload) {
            Ok(message) => self.handle(message, outbox),
            Err(error) => warn!(%error, "dropping malformed feed frame"),
        }
    }

    fn on_close(&mut self, kind: CloseKind) {
        debug!(?kind, phase = ?self.phase, "feed session closed");
        self.phase = SessionPhase::Idle;
    }

    fn on_exhausted(&mut self) {
        emit(&self.events, FeedEvent::Unavailable);
    }
}

/// Public kline / mini-ticker streams; no handshake.
pub struct PublicFeed {
    subscriptions: SubscriptionSet,
    clock: Arc<dyn TimeSource>,
    events: mpsc::UnboundedSender<FeedEvent>,
}

impl PublicFeed {
    pub fn new(
        subscriptions: SubscriptionSet,
        clock: Arc<dyn TimeSource>,
        events: mpsc::UnboundedSender<FeedEvent>,
    ) -> Self {
        Self {
            subscriptions,
            clock,
            events,
        }
    }

    fn to_update(&self, message: PublicMessage) -> Option<MarketUpdate> {
        let update = match message {
            PublicMessage::Kline {
                symbol,
                open_time_ms,
                open,
                high,
                low,
                close,
            } => MarketUpdate {
                symbol,
                exchange: PUBLIC_EXCHANGE.to_string(),
                last_price: close,
                open: Some(open),
                high: Some(high),
                low: Some(low),
                prev_close: None,
                timestamp_ms: open_time_ms,
                timestamp_source: TimestampSource::Server,
            },
            PublicMessage::MiniTicker {
                symbol,
                close,
                open,
                high,
                low,
                event_time_ms,
            } => {
                let (timestamp_ms, timestamp_source) = match event_time_ms {
                    Some(timestamp_ms) => (timestamp_ms, TimestampSource::Server),
                    None => (self.clock.now_ms(), TimestampSource::Local),
                };
                MarketUpdate {
                    symbol,
                    exchange: PUBLIC_EXCHANGE.to_string(),
                    last_price: close,
                    open,
                    high,
                    low,
                    prev_close: None,
                    timestamp_ms,
                    timestamp_source,
                }
            }
            PublicMessage::Unrecognized(kind) => {
                debug!(kind = %kind, "ignoring unrecognized public frame");
                return None;
            }
        };

        if !self.subscriptions.matches(&update.symbol, None) {
            debug!(symbol = %update.symbol, "dropping public update for unsubscribed symbol");
            return None;
        }
        if !(update.last_price.is_finite() && update.last_price > 0.0) {
            debug!(symbol = %update.symbol, "dropping public update with non-positive price");
            return None;
        }
        Some(update)
    }
}

impl SocketHandler for PublicFeed {
    fn on_open(&mut self, _outbox: &mut Outbox) {
        debug!(subscriptions = self.subscriptions.len(), "public feed open");
    }

    fn on_message(&mut self, payload: &mut [u8], _outbox: &mut Outbox) {
        match decode_public_message(payload) {
            Ok(message) => {
                if let Some(update) = self.to_update(message) {
                    emit(&self.events, FeedEvent::Update(update));
                }
            }
            Err(error) => warn!(%error, "dropping malformed public frame"),
        }
    }

    fn on_exhausted(&mut self) {
        emit(&self.events, FeedEvent::Unavailable);
    }
}

/// A running feed: the supervised socket plus the consumer's end of the event channel.
pub struct FeedSession {
    pub client: ManagedSocketClient,
    pub events: mpsc::UnboundedReceiver<FeedEvent>,
}

impl FeedSession {
    pub fn open(
        config: &MarketFeedConfig,
        api_key: Option<String>,
        clock: Arc<dyn TimeSource>,
        status: ConnectionStatusBroadcaster,
    ) -> Result<Self, AppError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let policy = ReconnectPolicy::default().with_max_attempts(config.max_reconnect_attempts);
        let url = UrlSource::from(config.ws_url.clone());

        let client = match config.backend {
            FeedBackend::Authenticated => {
                let api_key = api_key
                    .filter(|key| !key.trim().is_empty())
                    .ok_or(AppError::NotAuthenticated)?;
                let handler =
                    AuthenticatedFeed::new(api_key, config.subscriptions.clone(), clock, events_tx);
                ManagedSocketClient::spawn(url, policy, handler, status)
            }
            FeedBackend::Public => {
                let handler = PublicFeed::new(config.subscriptions.clone(), clock, events_tx);
                ManagedSocketClient::spawn(url, policy, handler, status)
            }
        };

        info!(
            backend = ?config.backend,
            url = %config.ws_url,
            subscriptions = config.subscriptions.len(),
            "market feed opened"
        );
        Ok(Self { client, events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoints;
    use crate::market::types::{
        StartMarketFeedArgs, Subscription, SubscriptionArgs, SubscriptionMode,
    };
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    struct FixedTime(i64);

    impl TimeSource for FixedTime {
        fn now_ms(&self) -> i64 {
            self.0
        }
    }

    fn subscriptions() -> SubscriptionSet {
        [
            Subscription::new("RELIANCE", "NSE", SubscriptionMode::Quote).expect("valid"),
            Subscription::new("INFY", "NSE", SubscriptionMode::Quote).expect("valid"),
            Subscription::new("SBIN", "BSE", SubscriptionMode::Ltp).expect("valid"),
        ]
        .into_iter()
        .collect()
    }

    fn authenticated_feed() -> (AuthenticatedFeed, mpsc::UnboundedReceiver<FeedEvent>) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let feed = AuthenticatedFeed::new(
            "key-123".to_string(),
            subscriptions(),
            Arc::new(FixedTime(1_700_000_000_000)),
            events_tx,
        );
        (feed, events)
    }

    fn deliver(handler: &mut impl SocketHandler, raw: &str) -> Vec<String> {
        let mut outbox = Outbox::default();
        let mut payload = raw.as_bytes().to_vec();
        handler.on_message(&mut payload, &mut outbox);
        outbox.drain().collect()
    }

    fn open(handler: &mut impl SocketHandler) -> Vec<String> {
        let mut outbox = Outbox::default();
        handler.on_open(&mut outbox);
        outbox.drain().collect()
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<FeedEvent>) -> Vec<FeedEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    const AUTH_OK: &str = r#"{"type":"auth","status":"success","broker":"angel"}"#;

    #[test]
    fn authenticates_then_replays_subscriptions_in_registration_order() {
        let (mut feed, _events) = authenticated_feed();

        let sent = open(&mut feed);
        assert_eq!(sent, vec![r#"{"action":"authenticate","api_key":"key-123"}"#]);
        assert_eq!(feed.phase(), SessionPhase::AuthSent);

        let sent = deliver(&mut feed, AUTH_OK);
        assert_eq!(
            sent,
            vec![
                r#"{"action":"subscribe","symbol":"RELIANCE","exchange":"NSE","mode":2}"#,
                r#"{"action":"subscribe","symbol":"INFY","exchange":"NSE","mode":2}"#,
                r#"{"action":"subscribe","symbol":"SBIN","exchange":"BSE","mode":1}"#,
            ]
        );
        assert_eq!(feed.phase(), SessionPhase::Subscribed);
        assert_eq!(feed.broker(), Some("angel"));
    }

    #[test]
    fn reconnect_replays_subscriptions_exactly_once_before_data_flows() {
        let (mut feed, mut events) = authenticated_feed();
        open(&mut feed);
        let first = deliver(&mut feed, AUTH_OK);

        feed.on_close(CloseKind::Abnormal);
        assert_eq!(feed.phase(), SessionPhase::Idle);

        open(&mut feed);
        let early = deliver(
            &mut feed,
            r#"{"type":"market_data","symbol":"INFY","exchange":"NSE","data":{"ltp":1500}}"#,
        );
        assert!(early.is_empty());
        assert!(drain(&mut events).is_empty());

        let replayed = deliver(&mut feed, AUTH_OK);
        assert_eq!(replayed, first);
        assert!(deliver(&mut feed, AUTH_OK).is_empty());

        deliver(
            &mut feed,
            r#"{"type":"market_data","symbol":"INFY","exchange":"NSE","data":{"ltp":1501}}"#,
        );
        let forwarded = drain(&mut events);
        assert_eq!(forwarded.len(), 1);
    }

    #[test]
    fn answers_ping_in_any_phase() {
        let (mut feed, _events) = authenticated_feed();
        assert_eq!(deliver(&mut feed, r#"{"type":"ping"}"#), vec![r#"{"type":"pong"}"#]);

        open(&mut feed);
        deliver(&mut feed, AUTH_OK);
        assert_eq!(deliver(&mut feed, r#"{"type":"ping"}"#), vec![r#"{"type":"pong"}"#]);
    }

    #[test]
    fn forwards_matching_updates_with_server_or_local_time() {
        let (mut feed, mut events) = authenticated_feed();
        open(&mut feed);
        deliver(&mut feed, AUTH_OK);

        deliver(
            &mut feed,
            r#"{"type":"market_data","symbol":"INFY","exchange":"NSE",
                "data":{"ltp":1520.5,"open":1500,"high":1525,"low":1490,"timestamp":1700000000123}}"#,
        );
        deliver(
            &mut feed,
            r#"{"type":"market_data","symbol":"SBIN","data":{"last_price":"610.25"}}"#,
        );

        let forwarded = drain(&mut events);
        assert_eq!(
            forwarded,
            vec![
                FeedEvent::Update(MarketUpdate {
                    symbol: "INFY".to_string(),
                    exchange: "NSE".to_string(),
                    last_price: 1_520.5,
                    open: Some(1_500.0),
                    high: Some(1_525.0),
                    low: Some(1_490.0),
                    prev_close: None,
                    timestamp_ms: 1_700_000_000_123,
                    timestamp_source: TimestampSource::Server,
                }),
                FeedEvent::Update(MarketUpdate {
                    symbol: "SBIN".to_string(),
                    exchange: "BSE".to_string(),
                    last_price: 610.25,
                    open: None,
                    high: None,
                    low: None,
                    prev_close: None,
                    timestamp_ms: 1_700_000_000_000,
                    timestamp_source: TimestampSource::Local,
                }),
            ]
        );
    }

    #[test]
    fn never_forwards_non_positive_or_unsubscribed_prices() {
        let (mut feed, mut events) = authenticated_feed();
        open(&mut feed);
        deliver(&mut feed, AUTH_OK);

        for raw in [
            r#"{"type":"market_data","symbol":"INFY","exchange":"NSE","data":{"ltp":0}}"#,
            r#"{"type":"market_data","symbol":"INFY","exchange":"NSE","data":{"ltp":-4.5}}"#,
            r#"{"type":"market_data","symbol":"INFY","exchange":"NSE","data":{}}"#,
            r#"{"type":"market_data","symbol":"INFY","exchange":"BSE","data":{"ltp":10}}"#,
            r#"{"type":"market_data","symbol":"TCS","exchange":"NSE","data":{"ltp":10}}"#,
            r#"{"type":"market_data","symbol":"infy","exchange":"NSE","data":{"ltp":10}}"#,
            r#"{"type":"market_data","data":{"ltp":10}}"#,
            r#"{"type":"market_data""#,
        ] {
            assert!(deliver(&mut feed, raw).is_empty());
        }

        assert!(drain(&mut events).is_empty());
        assert_eq!(feed.phase(), SessionPhase::Subscribed);
    }

    #[test]
    fn auth_failure_is_terminal_and_reported_once() {
        let (mut feed, mut events) = authenticated_feed();
        open(&mut feed);

        let sent = deliver(
            &mut feed,
            r#"{"type":"auth","status":"error","message":"Invalid API key"}"#,
        );
        assert!(sent.is_empty());
        deliver(&mut feed, r#"{"type":"error","message":"again"}"#);
        assert!(deliver(&mut feed, AUTH_OK).is_empty());

        assert_eq!(feed.phase(), SessionPhase::AuthFailed);
        assert_eq!(
            drain(&mut events),
            vec![FeedEvent::AuthFailed {
                message: "Invalid API key".to_string()
            }]
        );
    }

    #[test]
    fn error_frame_during_handshake_fails_auth_but_not_after() {
        let (mut feed, mut events) = authenticated_feed();
        open(&mut feed);
        deliver(&mut feed, r#"{"type":"error","message":"bad key","code":401}"#);
        assert_eq!(feed.phase(), SessionPhase::AuthFailed);
        assert_eq!(drain(&mut events).len(), 1);

        let (mut feed, mut events) = authenticated_feed();
        open(&mut feed);
        deliver(&mut feed, AUTH_OK);
        deliver(&mut feed, r#"{"type":"error","message":"symbol not found"}"#);
        assert_eq!(feed.phase(), SessionPhase::Subscribed);
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn exhausted_socket_reports_unavailable() {
        let (mut feed, mut events) = authenticated_feed();
        feed.on_exhausted();
        assert_eq!(drain(&mut events), vec![FeedEvent::Unavailable]);
    }

    #[test]
    fn public_feed_forwards_klines_and_tickers_for_subscribed_symbols() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let subscriptions: SubscriptionSet = [
            Subscription::new("BTCUSDT", PUBLIC_EXCHANGE, SubscriptionMode::Quote).expect("valid"),
        ]
        .into_iter()
        .collect();
        let mut feed = PublicFeed::new(subscriptions, Arc::new(FixedTime(42)), events_tx);

        assert!(open(&mut feed).is_empty());
        deliver(
            &mut feed,
            r#"{"e":"kline","s":"BTCUSDT","k":{"t":1700000000000,"o":"1","h":"3","l":"0.5","c":"2"}}"#,
        );
        deliver(&mut feed, r#"{"stream":"x","data":{"s":"BTCUSDT","c":"2.5","o":"1"}}"#);
        deliver(&mut feed, r#"{"stream":"y","data":{"s":"ETHUSDT","c":"9","o":"8"}}"#);
        deliver(
            &mut feed,
            r#"{"e":"kline","s":"BTCUSDT","k":{"t":1700000000000,"o":"1","h":"1","l":"1","c":"0"}}"#,
        );

        let forwarded = drain(&mut events);
        assert_eq!(forwarded.len(), 2);
        match &forwarded[1] {
            FeedEvent::Update(update) => {
                assert_eq!(update.last_price, 2.5);
                assert_eq!(update.timestamp_ms, 42);
                assert_eq!(update.timestamp_source, TimestampSource::Local);
                assert_eq!(update.exchange, PUBLIC_EXCHANGE);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn authenticated_session_requires_api_key() {
        let config = StartMarketFeedArgs::default()
            .normalize(&Endpoints::default())
            .expect("defaults should be valid");

        let result = FeedSession::open(
            &config,
            Some("   ".to_string()),
            Arc::new(FixedTime(0)),
            ConnectionStatusBroadcaster::new(),
        );

        assert!(matches!(result, Err(AppError::NotAuthenticated)));
    }

    #[tokio::test]
    async fn streams_updates_from_authenticated_backend() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("server should bind");
        let ws_url = format!("ws://{}", listener.local_addr().expect("address"));
        let (server_tx, mut server_frames) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            let mut ws = accept_async(tcp).await.expect("handshake should succeed");
            while let Some(Ok(message)) = ws.next().await {
                let Message::Text(text) = message else {
                    continue;
                };
                let _ = server_tx.send(text.clone());
                if text.contains("authenticate") {
                    let _ = ws.send(Message::Text(AUTH_OK.to_string())).await;
                } else if text.contains("subscribe") {
                    let _ = ws
                        .send(Message::Text(
                            r#"{"type":"market_data","symbol":"TCS","exchange":"NSE","data":{"ltp":3999.5,"timestamp":1700000000000}}"#
                                .to_string(),
                        ))
                        .await;
                }
            }
        });

        let config = StartMarketFeedArgs {
            ws_url: Some(ws_url),
            subscriptions: Some(vec![SubscriptionArgs {
                symbol: "tcs".to_string(),
                exchange: None,
            }]),
            ..Default::default()
        }
        .normalize(&Endpoints::default())
        .expect("config should be valid");
        let status = ConnectionStatusBroadcaster::new();

        let mut session = FeedSession::open(
            &config,
            Some("key-123".to_string()),
            Arc::new(FixedTime(0)),
            status.clone(),
        )
        .expect("session should open");

        let event = tokio::time::timeout(Duration::from_secs(5), session.events.recv())
            .await
            .expect("update should arrive")
            .expect("channel open");
        match event {
            FeedEvent::Update(update) => {
                assert_eq!(update.symbol, "TCS");
                assert_eq!(update.last_price, 3_999.5);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            server_frames.recv().await.as_deref(),
            Some(r#"{"action":"authenticate","api_key":"key-123"}"#)
        );
        assert_eq!(
            server_frames.recv().await.as_deref(),
            Some(r#"{"action":"subscribe","symbol":"TCS","exchange":"NSE","mode":2}"#)
        );
        assert_eq!(status.current(), crate::market::types::ConnectionState::Connected);

        session.client.shutdown().await;
    }
}
