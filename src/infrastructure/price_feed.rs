//! Streaming ticker feed.
//!
//! Subscribes to the venue's WebSocket ticker channel and forwards every
//! bid/ask update as a [`PriceTick`]. The reconnect loop runs until the
//! shutdown signal flips or every tick receiver is gone; stopping it never
//! touches position state.

use crate::domain::entities::market::Ticker;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct PriceFeedConfig {
    pub url: String,
    /// Canonical `BASE/QUOTE` pairs
    pub pairs: Vec<String>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on the TCP and WebSocket handshake
    pub connect_timeout: Duration,
    /// Silence after which the session counts as dead. The venue sends a
    /// heartbeat every second once subscribed.
    pub idle_timeout: Duration,
}

impl Default for PriceFeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws.kraken.com/v2".to_string(),
            pairs: Vec::new(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceTick {
    pub pair: String,
    pub ticker: Ticker,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    channel: Option<String>,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WsTicker {
    symbol: String,
    bid: f64,
    ask: f64,
    last: f64,
}

/// How a streaming session ended
#[derive(Debug, PartialEq)]
enum SessionEnd {
    /// Server closed the stream; reconnect
    Closed,
    /// Every tick receiver is gone; stop for good
    ConsumerGone,
}

pub fn subscribe_message(pairs: &[String]) -> String {
    json!({
        "method": "subscribe",
        "params": {
            "channel": "ticker",
            "symbol": pairs,
        }
    })
    .to_string()
}

/// Extract ticks from one text frame. Heartbeats, acknowledgements and
/// malformed frames yield nothing.
pub fn parse_ticker_message(text: &str) -> Vec<PriceTick> {
    let envelope: WsEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Ignoring unparseable frame: {}", e);
            return Vec::new();
        }
    };
    if envelope.channel.as_deref() != Some("ticker") {
        return Vec::new();
    }

    let received_at = Utc::now();
    envelope
        .data
        .into_iter()
        .filter_map(|item| serde_json::from_value::<WsTicker>(item).ok())
        .filter(|t| t.bid > 0.0 && t.ask > 0.0 && t.bid.is_finite() && t.ask.is_finite())
        .map(|t| PriceTick {
            pair: t.symbol,
            ticker: Ticker {
                bid: t.bid,
                ask: t.ask,
                last: t.last,
            },
            received_at,
        })
        .collect()
}

pub struct PriceFeed {
    config: PriceFeedConfig,
}

impl PriceFeed {
    pub fn new(config: PriceFeedConfig) -> Self {
        Self { config }
    }

    /// Stream ticks into `tx` until `shutdown` becomes true
    pub async fn run(self, tx: mpsc::Sender<PriceTick>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.config.initial_backoff;

        loop {
            if *shutdown.borrow() {
                break;
            }
            info!("Connecting price feed to {}", self.config.url);

            tokio::select! {
                result = self.stream_session(&tx) => {
                    match result {
                        Ok(SessionEnd::ConsumerGone) => {
                            info!("Price feed has no consumers left, stopping");
                            return;
                        }
                        Ok(SessionEnd::Closed) => {
                            info!("Price feed closed by server, reconnecting");
                            backoff = self.config.initial_backoff;
                        }
                        Err(e) => {
                            error!("Price feed error: {}, retrying in {:?}", e, backoff);
                        }
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {
                            backoff = (backoff * 2).min(self.config.max_backoff);
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                changed = shutdown.changed() => {
                    // a dropped sender counts as shutdown
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Price feed stopped");
    }

    async fn stream_session(&self, tx: &mpsc::Sender<PriceTick>) -> Result<SessionEnd, String> {
        let connect = connect_async(self.config.url.as_str());
        let (stream, _) = timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| format!("Connect timed out after {:?}", self.config.connect_timeout))?
            .map_err(|e| format!("Failed to connect: {}", e))?;
        let (mut write, mut read) = stream.split();

        let subscribe = subscribe_message(&self.config.pairs);
        write
            .send(Message::Text(subscribe))
            .await
            .map_err(|e| format!("Failed to subscribe: {}", e))?;
        info!("Subscribed to ticker for {:?}", self.config.pairs);

        loop {
            let message = match timeout(self.config.idle_timeout, read.next()).await {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(SessionEnd::Closed),
                Err(_) => {
                    return Err(format!(
                        "No frame for {:?}, connection presumed dead",
                        self.config.idle_timeout
                    ))
                }
            };
            match message {
                Ok(Message::Text(text)) => {
                    for tick in parse_ticker_message(&text) {
                        debug!("Tick {} bid {} ask {}", tick.pair, tick.ticker.bid, tick.ticker.ask);
                        if tx.send(tick).await.is_err() {
                            return Ok(SessionEnd::ConsumerGone);
                        }
                    }
                }
                Ok(Message::Ping(payload)) => {
                    write
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| format!("Failed to answer ping: {}", e))?;
                }
                Ok(Message::Close(frame)) => {
                    warn!("Price feed close frame: {:?}", frame);
                    return Ok(SessionEnd::Closed);
                }
                Ok(_) => {}
                Err(e) => return Err(format!("Read error: {}", e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[test]
    fn test_subscribe_message_shape() {
        let message = subscribe_message(&["BTC/EUR".to_string(), "ETH/EUR".to_string()]);
        let value: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(value["method"], "subscribe");
        assert_eq!(value["params"]["channel"], "ticker");
        assert_eq!(value["params"]["symbol"][1], "ETH/EUR");
    }

    #[test]
    fn test_parse_snapshot_and_update() {
        let text = r#"{"channel":"ticker","type":"update","data":[
            {"symbol":"ETH/EUR","bid":2000.1,"ask":2000.5,"last":2000.3,"volume":12.5},
            {"symbol":"SOL/EUR","bid":0,"ask":150.0,"last":150.0}
        ]}"#;
        let ticks = parse_ticker_message(text);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].pair, "ETH/EUR");
        assert_eq!(ticks[0].ticker.ask, 2000.5);
        assert_eq!(ticks[0].ticker.bid, 2000.1);
    }

    #[test]
    fn test_non_ticker_frames_are_ignored() {
        assert!(parse_ticker_message(r#"{"channel":"heartbeat"}"#).is_empty());
        assert!(parse_ticker_message(r#"{"method":"subscribe","success":true}"#).is_empty());
        assert!(parse_ticker_message("not json").is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_reconnect_loop() {
        let feed = PriceFeed::new(PriceFeedConfig {
            url: "ws://127.0.0.1:1".to_string(),
            pairs: vec!["ETH/EUR".to_string()],
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(60),
            ..Default::default()
        });
        let (tx, _rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(feed.run(tx, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("feed did not stop")
            .unwrap();
    }

    fn reconnect_config(addr: std::net::SocketAddr) -> PriceFeedConfig {
        PriceFeedConfig {
            url: format!("ws://{}", addr),
            pairs: vec!["ETH/EUR".to_string()],
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_millis(200),
        }
    }

    /// Run the feed until the server has counted `connections` connects
    async fn wait_for_connections(config: PriceFeedConfig, accepted: Arc<AtomicUsize>, connections: usize) {
        let (tx, _rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(PriceFeed::new(config).run(tx, shutdown_rx));

        tokio::time::timeout(Duration::from_secs(5), async {
            while accepted.load(Ordering::SeqCst) < connections {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("feed never reconnected");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_silent_server_triggers_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut open = Vec::new();
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
                let _ = ws.next().await;
                counter.fetch_add(1, Ordering::SeqCst);
                // half-open: keep the socket, never send a frame
                open.push(ws);
            }
        });

        wait_for_connections(reconnect_config(addr), accepted, 2).await;
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut open = Vec::new();
            loop {
                // TCP accepted, upgrade never answered
                let (socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                open.push(socket);
            }
        });

        wait_for_connections(reconnect_config(addr), accepted, 2).await;
    }

    #[tokio::test]
    async fn test_streams_ticks_from_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            // wait for the subscription before publishing
            let subscribe = ws.next().await.unwrap().unwrap();
            assert!(subscribe.to_text().unwrap().contains("ticker"));
            let frame = r#"{"channel":"ticker","type":"snapshot","data":[{"symbol":"ETH/EUR","bid":2000.0,"ask":2001.0,"last":2000.5}]}"#;
            ws.send(Message::Text(frame.to_string())).await.unwrap();
            // keep the connection open until the client goes away
            while ws.next().await.is_some() {}
        });

        let feed = PriceFeed::new(PriceFeedConfig {
            url: format!("ws://{}", addr),
            pairs: vec!["ETH/EUR".to_string()],
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(feed.run(tx, shutdown_rx));

        let tick = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tick.pair, "ETH/EUR");
        assert_eq!(tick.ticker.bid, 2000.0);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
