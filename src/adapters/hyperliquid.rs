// ─────────────────────────────────────────────────────────────────────────────
// adapters/hyperliquid.rs — l2Book WebSocket ingestion with reconnect-replay.
// ─────────────────────────────────────────────────────────────────────────────
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use super::{new_shared_stats, new_subscribed_set, SharedStats, SubscribedSet, UpdateEvent};
use crate::book::{Level, Venue};

const WS_URL: &str = "wss://api.hyperliquid.xyz/ws";

/// A level as Hyperliquid sends it: either `{"px":...,"sz":...,"n":...}` or
/// the positional `[px, sz, n]` form. Both appear in the wild depending on
/// endpoint version, so deserialization must accept either.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum WireLevel {
    Object { px: String, sz: String, #[serde(default)] n: u64 },
    Array(Vec<serde_json::Value>),
}

impl WireLevel {
    fn into_level(self) -> Option<Level> {
        match self {
            WireLevel::Object { px, sz, .. } => Some(Level { price: px.parse().ok()?, size: sz.parse().ok()? }),
            WireLevel::Array(arr) => {
                // Prefer string parsing (the common wire form); fall back to
                // numeric JSON values for endpoints that send bare numbers.
                let price = arr.first()?.as_str().and_then(|s| s.parse().ok()).or_else(|| arr.first()?.as_f64())?;
                let size = arr.get(1)?.as_str().and_then(|s| s.parse().ok()).or_else(|| arr.get(1)?.as_f64())?;
                Some(Level { price, size })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct L2BookData {
    coin: String,
    levels: [Vec<WireLevel>; 2],
    #[serde(default)]
    time: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Frame {
    channel: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Subscribe to the `l2Book` channel for `symbol`. Idempotent: resending a
/// subscription the venue already has active is harmless.
pub async fn subscribe(sub: &SubscribedSet, events_tx: &mpsc::UnboundedSender<String>, symbol: &str, n_levels: u32) {
    let mut set = sub.lock().await;
    if set.contains(symbol) {
        return;
    }
    set.insert(symbol.to_string());
    drop(set);
    let frame = serde_json::json!({
        "method": "subscribe",
        "subscription": { "type": "l2Book", "coin": symbol, "nLevels": n_levels }
    });
    let _ = events_tx.send(frame.to_string());
}

/// Runs the connect/subscribe/parse/reconnect loop until the process exits.
/// `send_event` forwards parsed book updates to the store; `resub_rx`
/// delivers newly requested subscriptions from the subscription API.
pub async fn run(
    update_tx: mpsc::UnboundedSender<UpdateEvent>,
    subscribe_requests: mpsc::UnboundedReceiver<String>,
    sub: SubscribedSet,
    stats: SharedStats,
    reconnect_delay: Duration,
) {
    run_with_url(WS_URL, update_tx, subscribe_requests, sub, stats, reconnect_delay).await
}

async fn run_with_url(
    url: &str,
    update_tx: mpsc::UnboundedSender<UpdateEvent>,
    mut subscribe_requests: mpsc::UnboundedReceiver<String>,
    sub: SubscribedSet,
    stats: SharedStats,
    reconnect_delay: Duration,
) {
    let mut retry_delay = reconnect_delay;
    let max_delay = Duration::from_secs(60);

    loop {
        info!("hyperliquid: connecting to {}", url);
        match connect_async(Url::parse(url).expect("valid hyperliquid url")).await {
            Ok((ws_stream, _)) => {
                info!("hyperliquid: connected");
                retry_delay = reconnect_delay;
                {
                    let mut s = stats.lock().await;
                    s.connected = true;
                }

                let (mut write, mut read) = ws_stream.split();

                // Replay all active subscriptions (covers both first connect
                // and post-reconnect resubscription).
                for symbol in sub.lock().await.iter() {
                    let frame = serde_json::json!({
                        "method": "subscribe",
                        "subscription": { "type": "l2Book", "coin": symbol, "nLevels": 20 }
                    });
                    if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                        error!("hyperliquid: resubscribe failed for {}: {}", symbol, e);
                    }
                }

                loop {
                    tokio::select! {
                        incoming = read.next() => {
                            match incoming {
                                Some(Ok(Message::Text(text))) => {
                                    handle_frame(&text, &update_tx, &stats).await;
                                }
                                Some(Ok(Message::Ping(payload))) => {
                                    let _ = write.send(Message::Pong(payload)).await;
                                }
                                Some(Ok(Message::Close(frame))) => {
                                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                                    warn!("hyperliquid: {}", crate::error::Error::ConnectionClosed { reason });
                                    break;
                                }
                                None => {
                                    warn!("hyperliquid: {}", crate::error::Error::ConnectionClosed { reason: "stream ended".to_string() });
                                    break;
                                }
                                Some(Err(e)) => {
                                    error!("hyperliquid: ws error: {}, reconnecting", e);
                                    let mut s = stats.lock().await;
                                    s.errors += 1;
                                    break;
                                }
                                _ => {}
                            }
                        }
                        Some(new_sub) = subscribe_requests.recv() => {
                            if let Err(e) = write.send(Message::Text(new_sub)).await {
                                error!("hyperliquid: subscribe send failed: {}", e);
                            }
                        }
                    }
                }
                stats.lock().await.connected = false;
            }
            Err(e) => {
                error!("hyperliquid: connect failed: {}, retrying in {:?}", e, retry_delay);
            }
        }

        tokio::time::sleep(retry_delay).await;
        retry_delay = std::cmp::min(retry_delay * 2, max_delay);
    }
}

async fn handle_frame(text: &str, update_tx: &mpsc::UnboundedSender<UpdateEvent>, stats: &SharedStats) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(_) => return, // malformed frame: drop, stream continues
    };

    if frame.channel != "l2Book" {
        return;
    }
    let Some(data) = frame.data else { return };
    let book: L2BookData = match serde_json::from_value(data) {
        Ok(b) => b,
        Err(e) => {
            warn!("hyperliquid: failed to parse l2Book data: {}", e);
            let mut s = stats.lock().await;
            s.errors += 1;
            return;
        }
    };

    let bids: Vec<Level> = book.levels[0].iter().cloned().filter_map(WireLevel::into_level).collect();
    let asks: Vec<Level> = book.levels[1].iter().cloned().filter_map(WireLevel::into_level).collect();
    let timestamp = book.time.map(|ms| ms as f64 / 1000.0).unwrap_or_else(now_secs);

    {
        let mut s = stats.lock().await;
        s.messages_received += 1;
        s.last_update = Some(timestamp);
    }

    let _ = update_tx.send(UpdateEvent {
        venue: Venue::Hyperliquid,
        market: book.coin,
        bids,
        asks,
        timestamp,
        is_snapshot: true,
    });
}

pub fn stats_handle() -> SharedStats {
    new_shared_stats()
}

pub fn subscribed_set_handle() -> SubscribedSet {
    new_subscribed_set()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_level() {
        let lvl: WireLevel = serde_json::from_str(r#"{"px":"101.5","sz":"2.0","n":3}"#).unwrap();
        let parsed = lvl.into_level().unwrap();
        assert_eq!(parsed.price, 101.5);
        assert_eq!(parsed.size, 2.0);
    }

    #[test]
    fn test_parse_array_level() {
        let lvl: WireLevel = serde_json::from_str(r#"["101.5","2.0",3]"#).unwrap();
        let parsed = lvl.into_level().unwrap();
        assert_eq!(parsed.price, 101.5);
        assert_eq!(parsed.size, 2.0);
    }

    #[test]
    fn test_full_frame_roundtrip() {
        let text = r#"{"channel":"l2Book","data":{"coin":"BTC","levels":[[{"px":"100","sz":"1","n":1}],[{"px":"101","sz":"1","n":1}]],"time":1000}}"#;
        let frame: Frame = serde_json::from_str(text).unwrap();
        assert_eq!(frame.channel, "l2Book");
        let book: L2BookData = serde_json::from_value(frame.data.unwrap()).unwrap();
        assert_eq!(book.coin, "BTC");
        assert_eq!(book.levels[0].len(), 1);
    }

    #[test]
    fn test_malformed_frame_is_dropped_not_fatal() {
        let parsed: Result<Frame, _> = serde_json::from_str("not json");
        assert!(parsed.is_err());
    }

    /// S8: a client that has two active subscriptions when the connection
    /// drops must see both replayed as subscribe frames on reconnect.
    #[tokio::test]
    async fn test_reconnect_replays_active_subscriptions() {
        use tokio::net::TcpListener;
        use tokio_tungstenite::accept_async;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("ws://{}", addr);

        let (received_tx, mut received_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            // First connection: accept then drop immediately, forcing a reconnect.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            drop(ws.close(None).await);

            // Second connection: collect the replayed subscribe frames.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            for _ in 0..2 {
                if let Some(Ok(Message::Text(text))) = ws.next().await {
                    let _ = received_tx.send(text);
                }
            }
        });

        let sub = new_subscribed_set();
        sub.lock().await.insert("BTC".to_string());
        sub.lock().await.insert("ETH".to_string());
        let stats = new_shared_stats();
        let (update_tx, _update_rx) = mpsc::unbounded_channel();
        let (_sub_tx, sub_rx) = mpsc::unbounded_channel();

        let run_fut = run_with_url(&url, update_tx, sub_rx, sub, stats, Duration::from_millis(10));
        tokio::select! {
            _ = run_fut => {}
            _ = async {
                let first = tokio::time::timeout(Duration::from_secs(2), received_rx.recv()).await.unwrap().unwrap();
                let second = tokio::time::timeout(Duration::from_secs(2), received_rx.recv()).await.unwrap().unwrap();
                assert!(first.contains("l2Book"));
                assert!(second.contains("l2Book"));
            } => {}
        }
    }
}
