//! bitbank realtime stream client
//!
//! Subscribes to the hosted realtime service and demultiplexes inbound
//! ticker frames to per-channel consumer queues.
//!
//! Frame grammar (JSON array, dynamically shaped first element):
//! - Ack:  `[1, "... connected ...", "<channel>"]`
//! - Data: `[[{"data": {...}}], "<unused>", "<channel>"]`
//!
//! Channel names join with commas when subscribing to several at once.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::BitbankError;
use crate::types::Tick;

/// bitbank realtime stream URL
const BITBANK_STREAM_URL: &str = "wss://stream.bitbank.cc/realtime";

/// Subscribe key fixed for this deployment (public market data only)
const STREAM_SUBSCRIBE_KEY: &str = "sub-c-e12e9174-dd60-11e6-806b-02ee2ddab7fe";

/// How long the dispatch loop waits for the next frame before treating
/// the subscription as dead
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(310);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// Wire Types
// ============================================================================

/// Command sent to the realtime service
#[derive(Debug, Clone, Serialize)]
struct StreamCommand {
    cmd: String,
    /// Comma-joined channel names
    channels: String,
}

/// Payload carried inside a data frame
#[derive(Debug, Clone, Deserialize)]
struct DataEnvelope {
    data: Tick,
}

/// One inbound frame, decoded by the shape of its first element.
#[derive(Debug, Clone, PartialEq)]
enum Frame {
    /// The provider acknowledged that a channel is connected
    Ack { channel: String },
    /// A ticker update for a connected channel
    Data { channel: String, tick: Tick },
    /// A numeric status frame that is not a connection ack
    /// (e.g. an unsubscribe confirmation); logged and ignored
    Control { message: String },
}

impl Frame {
    /// Decode a raw frame.
    ///
    /// Anything that matches neither the ack nor the data shape is a
    /// protocol violation reported as an error value, never a panic.
    fn parse(raw: &str) -> Result<Frame, BitbankError> {
        let msg: Vec<Value> = serde_json::from_str(raw).map_err(|e| {
            BitbankError::protocol(format!("not a JSON array frame: {} ({})", raw, e))
        })?;

        if msg.len() < 3 {
            return Err(BitbankError::protocol(format!(
                "frame has {} elements, expected 3: {}",
                msg.len(),
                raw
            )));
        }

        let channel = msg[2]
            .as_str()
            .ok_or_else(|| {
                BitbankError::protocol(format!("frame channel is not a string: {}", raw))
            })?
            .to_string();

        match &msg[0] {
            Value::Number(_) => {
                let status = msg[1].as_str().unwrap_or_default();
                if status.contains("connected") {
                    Ok(Frame::Ack { channel })
                } else {
                    Ok(Frame::Control {
                        message: status.to_string(),
                    })
                }
            }
            Value::Array(items) => {
                let first = items.first().ok_or_else(|| {
                    BitbankError::protocol(format!("empty data frame array: {}", raw))
                })?;
                let envelope: DataEnvelope = serde_json::from_value(first.clone()).map_err(|e| {
                    BitbankError::protocol(format!("bad data frame payload: {} ({})", raw, e))
                })?;
                Ok(Frame::Data {
                    channel,
                    tick: envelope.data,
                })
            }
            other => Err(BitbankError::protocol(format!(
                "unknown frame discriminator {}: {}",
                other, raw
            ))),
        }
    }
}

// ============================================================================
// Channel Registry
// ============================================================================

/// A caller-registered subscription awaiting its connection ack
#[derive(Debug, Clone)]
struct ChannelSubscription {
    channel: String,
    queue: mpsc::Sender<Tick>,
}

/// Maps channel names to consumer delivery queues.
///
/// Entries are bound lazily: a name appears in the map only once the
/// provider acknowledges the channel, not at registration time. A bound
/// channel name has exactly one queue.
#[derive(Debug, Default)]
struct ChannelRegistry {
    /// Pending requests in registration order
    pending: Vec<ChannelSubscription>,
    /// Bound queues, one per acknowledged channel name
    bound: HashMap<String, mpsc::Sender<Tick>>,
}

impl ChannelRegistry {
    fn add(&mut self, prefix: &str, pair: &str, queue: mpsc::Sender<Tick>) {
        self.pending.push(ChannelSubscription {
            channel: format!("{}{}", prefix, pair),
            queue,
        });
    }

    /// Remove a channel by name: its pending entries and any bound queue.
    fn remove(&mut self, channel: &str) {
        self.pending.retain(|s| s.channel != channel);
        self.bound.remove(channel);
    }

    /// All requested channel names, comma-joined in registration order.
    fn subscribing_channels(&self) -> String {
        self.pending
            .iter()
            .map(|s| s.channel.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Bind every pending subscription matching an acknowledged channel.
    fn bind(&mut self, channel: &str) {
        for sub in &self.pending {
            if sub.channel == channel {
                self.bound.insert(channel.to_string(), sub.queue.clone());
            }
        }
    }

    fn lookup(&self, channel: &str) -> Option<&mpsc::Sender<Tick>> {
        self.bound.get(channel)
    }
}

// ============================================================================
// Stream Client
// ============================================================================

/// Configuration for the realtime stream
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// WebSocket endpoint of the realtime service
    pub url: String,
    /// Subscribe key identifying this (public) deployment
    pub subscribe_key: String,
    /// How long to wait for the next frame before treating the
    /// subscription as dead
    pub subscribe_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: BITBANK_STREAM_URL.to_string(),
            subscribe_key: STREAM_SUBSCRIBE_KEY.to_string(),
            subscribe_timeout: SUBSCRIBE_TIMEOUT,
        }
    }
}

/// Connection lifecycle of the stream client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No connection
    Idle,
    /// Subscribe issued, waiting for the connection
    Connecting,
    /// Receiving frames
    Streaming,
    /// The dispatch loop has exited
    Stopped,
}

/// Commands accepted by the dispatch loop from other tasks
#[derive(Debug)]
enum Command {
    Unsubscribe,
}

/// Clonable handle for controlling a running stream from another task.
#[derive(Debug, Clone)]
pub struct StreamController {
    command_tx: mpsc::Sender<Command>,
}

impl StreamController {
    /// Ask the provider to drop the subscribed channel set.
    ///
    /// Does not block and does not wait for confirmation. The dispatch
    /// loop clears the affected registry entries once the request has
    /// been written to the socket.
    pub fn unsubscribe(&self) {
        if let Err(e) = self.command_tx.try_send(Command::Unsubscribe) {
            warn!("[Bitbank WS] Failed to queue unsubscribe: {}", e);
        }
    }
}

/// bitbank realtime stream client
pub struct BitbankStream {
    config: StreamConfig,
    /// Validated endpoint, fixed by `connect`
    endpoint: Option<Url>,
    registry: ChannelRegistry,
    command_tx: mpsc::Sender<Command>,
    command_rx: mpsc::Receiver<Command>,
    state: StreamState,
}

impl BitbankStream {
    /// Create a new stream client in the `Idle` state.
    pub fn new(config: StreamConfig) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);

        Self {
            config,
            endpoint: None,
            registry: ChannelRegistry::default(),
            command_tx,
            command_rx,
            state: StreamState::Idle,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Handle for controlling the stream while `subscribe` has it blocked.
    pub fn controller(&self) -> StreamController {
        StreamController {
            command_tx: self.command_tx.clone(),
        }
    }

    /// Register interest in a channel.
    ///
    /// `prefix` is one of the channel prefix constants (for example
    /// [`crate::types::CHANNEL_TICKER`]) and `pair` a trading pair like
    /// `"btc_jpy"`. Ticks arrive on `queue` once the provider
    /// acknowledges the channel. Registering the same (prefix, pair)
    /// twice is not deduplicated; avoiding that is the caller's job.
    pub fn add_subscribe(&mut self, prefix: &str, pair: &str, queue: mpsc::Sender<Tick>) {
        self.registry.add(prefix, pair, queue);
    }

    /// Drop a previously registered channel by full name.
    pub fn remove_subscribe(&mut self, channel: &str) {
        self.registry.remove(channel);
    }

    /// All requested channel names, comma-joined in registration order.
    pub fn subscribing_channels(&self) -> String {
        self.registry.subscribing_channels()
    }

    /// Fix the provider endpoint configuration.
    ///
    /// Pure state transition; no network I/O happens until [`subscribe`].
    ///
    /// [`subscribe`]: BitbankStream::subscribe
    pub fn connect(&mut self) -> Result<(), BitbankError> {
        let mut url = Url::parse(&self.config.url).map_err(|e| {
            BitbankError::config(format!("invalid stream URL {}: {}", self.config.url, e))
        })?;
        url.query_pairs_mut()
            .append_pair("subscribe_key", &self.config.subscribe_key);

        self.endpoint = Some(url);
        Ok(())
    }

    /// Open the stream and dispatch frames until it dies.
    ///
    /// Blocks the calling task; callers wanting concurrency run this in
    /// its own task and supervise it. Every exit is an error the owner
    /// can observe: a provider/transport error, a subscribe timeout, a
    /// protocol violation, or a data frame for a channel that was never
    /// acknowledged.
    pub async fn subscribe(&mut self) -> Result<(), BitbankError> {
        self.state = StreamState::Connecting;
        let result = self.run().await;
        self.state = StreamState::Stopped;
        result
    }

    async fn run(&mut self) -> Result<(), BitbankError> {
        let endpoint = self.endpoint.clone().ok_or_else(|| {
            BitbankError::config("connect() must be called before subscribe()")
        })?;
        let channels = self.registry.subscribing_channels();

        info!("[Bitbank WS] Connecting to {}", endpoint);

        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| BitbankError::stream(format!("connection failed: {}", e)))?;

        info!("[Bitbank WS] Connected, subscribing to [{}]", channels);

        let (mut write, read) = ws_stream.split();

        let cmd = StreamCommand {
            cmd: "subscribe".to_string(),
            channels: channels.clone(),
        };
        let json = serde_json::to_string(&cmd)
            .map_err(|e| BitbankError::stream(format!("failed to encode subscribe: {}", e)))?;
        write
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| BitbankError::stream(format!("failed to send subscribe: {}", e)))?;

        self.state = StreamState::Streaming;

        // Reader task: pushes inbound text frames into the success queue
        // and transport failures into the error queue. The dispatch loop
        // below is the sole consumer of both.
        let (success_tx, mut success_rx) = mpsc::channel::<String>(64);
        let (error_tx, mut error_rx) = mpsc::channel::<String>(16);
        let reader = tokio::spawn(Self::read_frames(read, success_tx, error_tx));

        let result = Self::dispatch(
            &mut self.registry,
            &mut self.command_rx,
            &mut success_rx,
            &mut error_rx,
            &mut write,
            &channels,
            self.config.subscribe_timeout,
        )
        .await;

        reader.abort();
        result
    }

    /// Forward websocket messages into the success/error queues.
    async fn read_frames(
        mut read: SplitStream<WsStream>,
        success_tx: mpsc::Sender<String>,
        error_tx: mpsc::Sender<String>,
    ) {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if success_tx.send(text.to_string()).await.is_err() {
                        // dispatch loop is gone
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    let reason = match frame {
                        Some(f) => format!("connection closed by server: {:?}", f),
                        None => "connection closed by server".to_string(),
                    };
                    let _ = error_tx.send(reason).await;
                    break;
                }
                // ping/pong are answered by the transport
                Ok(_) => {}
                Err(e) => {
                    let _ = error_tx.send(e.to_string()).await;
                    break;
                }
            }
        }
    }

    /// The demultiplexing loop: sole consumer of the success queue, the
    /// error queue, and the per-iteration subscribe timeout.
    ///
    /// Frames are handled strictly in arrival order. Delivery to a
    /// consumer queue is a blocking send, so a slow consumer stalls
    /// every channel.
    async fn dispatch(
        registry: &mut ChannelRegistry,
        command_rx: &mut mpsc::Receiver<Command>,
        success_rx: &mut mpsc::Receiver<String>,
        error_rx: &mut mpsc::Receiver<String>,
        write: &mut SplitSink<WsStream, Message>,
        channels: &str,
        subscribe_timeout: Duration,
    ) -> Result<(), BitbankError> {
        loop {
            tokio::select! {
                frame = success_rx.recv() => {
                    let Some(raw) = frame else {
                        return Err(BitbankError::stream("frame queue closed unexpectedly"));
                    };
                    Self::dispatch_frame(Frame::parse(&raw)?, registry).await?;
                }
                err = error_rx.recv() => {
                    let message =
                        err.unwrap_or_else(|| "error queue closed unexpectedly".to_string());
                    error!("[Bitbank WS] Stream error: {}", message);
                    return Err(BitbankError::stream(message));
                }
                cmd = command_rx.recv() => {
                    if let Some(Command::Unsubscribe) = cmd {
                        Self::send_unsubscribe(write, channels, registry).await?;
                    }
                }
                _ = tokio::time::sleep(subscribe_timeout) => {
                    error!(
                        "[Bitbank WS] No frame within {:?}, giving up",
                        subscribe_timeout
                    );
                    return Err(BitbankError::Timeout);
                }
            }
        }
    }

    /// Route one decoded frame.
    async fn dispatch_frame(
        frame: Frame,
        registry: &mut ChannelRegistry,
    ) -> Result<(), BitbankError> {
        match frame {
            Frame::Ack { channel } => {
                info!("[Bitbank WS] Channel connected: {}", channel);
                registry.bind(&channel);
                Ok(())
            }
            Frame::Data { channel, tick } => {
                debug!("[Bitbank WS] Tick for {}: last={}", channel, tick.last);
                let queue = registry
                    .lookup(&channel)
                    .ok_or_else(|| BitbankError::UnboundChannel(channel.clone()))?;
                queue.send(tick).await.map_err(|_| {
                    BitbankError::stream(format!("consumer queue for {} dropped", channel))
                })
            }
            Frame::Control { message } => {
                debug!("[Bitbank WS] Control frame: {}", message);
                Ok(())
            }
        }
    }

    /// Write the unsubscribe request, then clear the affected registry
    /// entries. The provider is not waited on for confirmation.
    async fn send_unsubscribe(
        write: &mut SplitSink<WsStream, Message>,
        channels: &str,
        registry: &mut ChannelRegistry,
    ) -> Result<(), BitbankError> {
        let cmd = StreamCommand {
            cmd: "unsubscribe".to_string(),
            channels: channels.to_string(),
        };
        let json = serde_json::to_string(&cmd)
            .map_err(|e| BitbankError::stream(format!("failed to encode unsubscribe: {}", e)))?;
        write
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| BitbankError::stream(format!("failed to send unsubscribe: {}", e)))?;

        info!("[Bitbank WS] Unsubscribe requested for [{}]", channels);
        for channel in channels.split(',').filter(|c| !c.is_empty()) {
            registry.remove(channel);
        }
        Ok(())
    }

    /// Ask the provider to drop the joined channel set.
    ///
    /// Non-blocking; equivalent to [`StreamController::unsubscribe`].
    pub fn unsubscribe(&self) {
        self.controller().unsubscribe();
    }
}

impl std::fmt::Debug for BitbankStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitbankStream")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("channels", &self.subscribing_channels())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CHANNEL_TICKER;
    use tokio::sync::mpsc::error::TryRecvError;

    const ACK_FRAME: &str = r#"[1, "Subscription to channel ticker_btc_jpy connected", "ticker_btc_jpy"]"#;
    const DATA_FRAME: &str = r#"[[{"data":{"sell":"100","buy":"99","high":"110","low":"90","last":"101","vol":"5","timestamp":1700000000000}}], "x", "ticker_btc_jpy"]"#;

    #[test]
    fn test_frame_parse_ack() {
        let frame = Frame::parse(ACK_FRAME).unwrap();
        assert_eq!(
            frame,
            Frame::Ack {
                channel: "ticker_btc_jpy".to_string()
            }
        );
    }

    #[test]
    fn test_frame_parse_data() {
        let frame = Frame::parse(DATA_FRAME).unwrap();
        match frame {
            Frame::Data { channel, tick } => {
                assert_eq!(channel, "ticker_btc_jpy");
                assert_eq!(tick.sell, "100");
                assert_eq!(tick.buy, "99");
                assert_eq!(tick.high, "110");
                assert_eq!(tick.low, "90");
                assert_eq!(tick.last, "101");
                assert_eq!(tick.vol, "5");
                assert_eq!(tick.timestamp, 1_700_000_000_000);
            }
            other => panic!("expected data frame, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_parse_non_ack_status_is_control() {
        let frame =
            Frame::parse(r#"[1, "Unsubscribed from channel ticker_btc_jpy", "ticker_btc_jpy"]"#)
                .unwrap();
        assert!(matches!(frame, Frame::Control { .. }));
    }

    #[test]
    fn test_frame_parse_unknown_discriminator() {
        let err = Frame::parse(r#"["bogus", "x", "ticker_btc_jpy"]"#).unwrap_err();
        assert!(matches!(err, BitbankError::Protocol(_)));
    }

    #[test]
    fn test_frame_parse_rejects_short_and_non_array() {
        assert!(matches!(
            Frame::parse(r#"{"not":"an array"}"#).unwrap_err(),
            BitbankError::Protocol(_)
        ));
        assert!(matches!(
            Frame::parse(r#"[1, "connected"]"#).unwrap_err(),
            BitbankError::Protocol(_)
        ));
    }

    #[test]
    fn test_subscribing_channels_registration_order() {
        let mut stream = BitbankStream::new(StreamConfig::default());
        let (q1, _r1) = mpsc::channel(1);
        let (q2, _r2) = mpsc::channel(1);
        stream.add_subscribe(CHANNEL_TICKER, "btc_jpy", q1);
        stream.add_subscribe(CHANNEL_TICKER, "xrp_jpy", q2);

        assert_eq!(stream.subscribing_channels(), "ticker_btc_jpy,ticker_xrp_jpy");
    }

    #[test]
    fn test_remove_subscribe_clears_pending() {
        let mut stream = BitbankStream::new(StreamConfig::default());
        let (q1, _r1) = mpsc::channel(1);
        let (q2, _r2) = mpsc::channel(1);
        stream.add_subscribe(CHANNEL_TICKER, "btc_jpy", q1);
        stream.add_subscribe(CHANNEL_TICKER, "xrp_jpy", q2);
        stream.remove_subscribe("ticker_btc_jpy");

        assert_eq!(stream.subscribing_channels(), "ticker_xrp_jpy");
    }

    #[tokio::test]
    async fn test_dispatch_ack_then_data_reaches_one_queue() {
        let mut registry = ChannelRegistry::default();
        let (q1, mut r1) = mpsc::channel(4);
        let (q2, mut r2) = mpsc::channel(4);
        registry.add(CHANNEL_TICKER, "btc_jpy", q1);
        registry.add(CHANNEL_TICKER, "xrp_jpy", q2);

        BitbankStream::dispatch_frame(Frame::parse(ACK_FRAME).unwrap(), &mut registry)
            .await
            .unwrap();
        BitbankStream::dispatch_frame(Frame::parse(DATA_FRAME).unwrap(), &mut registry)
            .await
            .unwrap();

        let tick = r1.try_recv().unwrap();
        assert_eq!(tick.sell, "100");
        assert_eq!(tick.buy, "99");
        assert_eq!(tick.last, "101");
        assert_eq!(tick.timestamp, 1_700_000_000_000);

        assert!(matches!(r1.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(r2.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_dispatch_data_without_ack_is_reported() {
        let mut registry = ChannelRegistry::default();
        let (q1, mut r1) = mpsc::channel(4);
        registry.add(CHANNEL_TICKER, "btc_jpy", q1);

        let err =
            BitbankStream::dispatch_frame(Frame::parse(DATA_FRAME).unwrap(), &mut registry)
                .await
                .unwrap_err();

        assert!(matches!(err, BitbankError::UnboundChannel(ref c) if c == "ticker_btc_jpy"));
        assert!(matches!(r1.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_bind_keeps_one_queue_per_channel() {
        let mut registry = ChannelRegistry::default();
        let (q1, mut r1) = mpsc::channel(4);
        let (q2, mut r2) = mpsc::channel(4);
        // Duplicate registration is the caller's mistake; the registry
        // still binds exactly one queue for the name (the later one).
        registry.add(CHANNEL_TICKER, "btc_jpy", q1);
        registry.add(CHANNEL_TICKER, "btc_jpy", q2);
        registry.bind("ticker_btc_jpy");

        BitbankStream::dispatch_frame(Frame::parse(DATA_FRAME).unwrap(), &mut registry)
            .await
            .unwrap();

        assert!(matches!(r1.try_recv(), Err(TryRecvError::Empty)));
        assert!(r2.try_recv().is_ok());
    }

    #[test]
    fn test_connect_rejects_bad_url() {
        let config = StreamConfig {
            url: "not a url".to_string(),
            ..StreamConfig::default()
        };
        let mut stream = BitbankStream::new(config);
        assert!(matches!(
            stream.connect().unwrap_err(),
            BitbankError::Config(_)
        ));
    }

    #[tokio::test]
    async fn test_subscribe_requires_connect() {
        let mut stream = BitbankStream::new(StreamConfig::default());
        let err = stream.subscribe().await.unwrap_err();
        assert!(matches!(err, BitbankError::Config(_)));
        assert_eq!(stream.state(), StreamState::Stopped);
    }
}
