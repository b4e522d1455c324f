// ─────────────────────────────────────────────────────────────────────────────
// adapters/lighter.rs — REST initial snapshot + incremental WS diffs, plus a
// periodic REST re-snapshot that bounds drift across any missed diff.
// ─────────────────────────────────────────────────────────────────────────────
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use super::{new_shared_stats, new_subscribed_set, SharedStats, SubscribedSet, UpdateEvent};
use crate::book::{Level, Venue};

const WS_URL: &str = "wss://mainnet.zklighter.elliot.ai/stream";
const REST_BASE: &str = "https://mainnet.zklighter.elliot.ai";

#[derive(Debug, Deserialize)]
struct WireLevel {
    price: String,
    #[serde(alias = "remaining_base_amount")]
    size: String,
}

impl WireLevel {
    fn to_level(&self) -> Option<Level> {
        Some(Level { price: self.price.parse().ok()?, size: self.size.parse().ok()? })
    }
}

#[derive(Debug, Deserialize)]
struct RestOrderBook {
    #[serde(default)]
    bids: Vec<WireLevel>,
    #[serde(default)]
    asks: Vec<WireLevel>,
}

#[derive(Debug, Deserialize)]
struct WsOrderBook {
    #[serde(default)]
    offset: Option<u64>,
    #[serde(default)]
    bids: Vec<WireLevel>,
    #[serde(default)]
    asks: Vec<WireLevel>,
}

#[derive(Debug, Deserialize)]
struct WsFrame {
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    order_book: Option<WsOrderBook>,
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Fetches a deep REST snapshot for a single market and delivers it to the
/// store as `is_snapshot = true`. A failure here is logged and skipped by
/// the caller; it never interrupts the live stream.
pub async fn fetch_rest_snapshot(
    client: &reqwest::Client,
    market_id: u32,
    symbol: &str,
    depth: u32,
    update_tx: &mpsc::UnboundedSender<UpdateEvent>,
) -> crate::error::Result<()> {
    let url = format!(
        "{}/api/v1/orderBookOrders?market_id={}&limit=100&depth={}",
        REST_BASE, market_id, depth
    );
    let book: RestOrderBook = client.get(&url).send().await?.json().await?;
    let bids: Vec<Level> = book.bids.iter().filter_map(WireLevel::to_level).collect();
    let asks: Vec<Level> = book.asks.iter().filter_map(WireLevel::to_level).collect();

    let bid_notional: f64 = bids.iter().map(|l| l.price * l.size).sum();
    let ask_notional: f64 = asks.iter().map(|l| l.price * l.size).sum();
    info!(
        "lighter: rest snapshot {} bids_usd={:.0} asks_usd={:.0}",
        symbol, bid_notional, ask_notional
    );

    let _ = update_tx.send(UpdateEvent {
        venue: Venue::Lighter,
        market: symbol.to_string(),
        bids,
        asks,
        timestamp: now_secs(),
        is_snapshot: true,
    });
    Ok(())
}

/// Every `interval`, re-fetches the REST snapshot for each currently
/// subscribed market. A single cycle's failure is logged and skipped.
pub async fn run_periodic_rest(
    sub: SubscribedSet,
    update_tx: mpsc::UnboundedSender<UpdateEvent>,
    interval: Duration,
    depth: u32,
) {
    let client = reqwest::Client::new();
    loop {
        tokio::time::sleep(interval).await;
        let symbols: Vec<String> = sub.lock().await.iter().cloned().collect();
        for symbol in symbols {
            let Some(market_id) = crate::config::lighter_market_id(&symbol) else { continue };
            if let Err(e) = fetch_rest_snapshot(&client, market_id, &symbol, depth, &update_tx).await {
                warn!("lighter: rest re-snapshot failed for {}: {}", symbol, e);
            }
        }
    }
}

/// Subscribes to the WS diff stream for `symbol`, attempting an initial REST
/// snapshot first. If the REST call fails, subscription proceeds stream-only.
pub async fn subscribe(
    sub: &SubscribedSet,
    ws_subscribe_tx: &mpsc::UnboundedSender<String>,
    update_tx: &mpsc::UnboundedSender<UpdateEvent>,
    symbol: &str,
    depth: u32,
) {
    let market_id = match crate::config::lighter_market_id(symbol) {
        Some(id) => id,
        None => return, // not a Lighter-mapped symbol; caller already logged
    };
    {
        let mut set = sub.lock().await;
        if set.contains(symbol) {
            return;
        }
        set.insert(symbol.to_string());
    }

    let client = reqwest::Client::new();
    if let Err(e) = fetch_rest_snapshot(&client, market_id, symbol, depth, update_tx).await {
        warn!("lighter: initial rest snapshot failed for {}: {}, proceeding stream-only", symbol, e);
    }

    let frame = serde_json::json!({ "type": "subscribe", "channel": format!("order_book/{}", market_id) });
    let _ = ws_subscribe_tx.send(frame.to_string());
}

pub async fn run(
    update_tx: mpsc::UnboundedSender<UpdateEvent>,
    mut subscribe_requests: mpsc::UnboundedReceiver<String>,
    sub: SubscribedSet,
    stats: SharedStats,
    reconnect_delay: Duration,
) {
    let mut retry_delay = reconnect_delay;
    let max_delay = Duration::from_secs(60);

    loop {
        info!("lighter: connecting to {}", WS_URL);
        match connect_async(Url::parse(WS_URL).expect("valid lighter url")).await {
            Ok((ws_stream, _)) => {
                info!("lighter: connected");
                retry_delay = reconnect_delay;
                stats.lock().await.connected = true;

                let (mut write, mut read) = ws_stream.split();

                for symbol in sub.lock().await.iter() {
                    if let Some(market_id) = crate::config::lighter_market_id(symbol) {
                        let frame = serde_json::json!({ "type": "subscribe", "channel": format!("order_book/{}", market_id) });
                        if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                            error!("lighter: resubscribe failed for {}: {}", symbol, e);
                        }
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
                                    warn!("lighter: {}", crate::error::Error::ConnectionClosed { reason });
                                    break;
                                }
                                None => {
                                    warn!("lighter: {}", crate::error::Error::ConnectionClosed { reason: "stream ended".to_string() });
                                    break;
                                }
                                Some(Err(e)) => {
                                    error!("lighter: ws error: {}, reconnecting", e);
                                    stats.lock().await.errors += 1;
                                    break;
                                }
                                _ => {}
                            }
                        }
                        Some(new_sub) = subscribe_requests.recv() => {
                            if let Err(e) = write.send(Message::Text(new_sub)).await {
                                error!("lighter: subscribe send failed: {}", e);
                            }
                        }
                    }
                }
                stats.lock().await.connected = false;
            }
            Err(e) => {
                error!("lighter: connect failed: {}, retrying in {:?}", e, retry_delay);
            }
        }

        tokio::time::sleep(retry_delay).await;
        retry_delay = std::cmp::min(retry_delay * 2, max_delay);
    }
}

fn market_id_from_channel(channel: &str) -> Option<u32> {
    channel.rsplit(':').next()?.parse().ok()
}

async fn handle_frame(text: &str, update_tx: &mpsc::UnboundedSender<UpdateEvent>, stats: &SharedStats) {
    let frame: WsFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(_) => return,
    };

    let is_update = frame.r#type.as_deref() == Some("update/order_book")
        || frame.channel.as_deref().is_some_and(|c| c.starts_with("order_book:"));
    if !is_update {
        return;
    }
    let Some(book) = frame.order_book else { return };
    let Some(channel) = frame.channel.as_deref() else { return };
    let Some(market_id) = market_id_from_channel(channel) else { return };
    let Some(symbol) = crate::config::lighter_symbol(market_id) else { return };

    let bids: Vec<Level> = book.bids.iter().filter_map(WireLevel::to_level).collect();
    let asks: Vec<Level> = book.asks.iter().filter_map(WireLevel::to_level).collect();
    // `offset` is treated as a millisecond timestamp per the source client,
    // not a gap-detection sequence number; falls back to wall clock if absent.
    let timestamp = book.offset.map(|ms| ms as f64 / 1000.0).unwrap_or_else(now_secs);

    {
        let mut s = stats.lock().await;
        s.messages_received += 1;
        s.last_update = Some(timestamp);
    }

    let _ = update_tx.send(UpdateEvent {
        venue: Venue::Lighter,
        market: symbol.to_string(),
        bids,
        asks,
        timestamp,
        is_snapshot: false,
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
    fn test_market_id_from_colon_channel() {
        assert_eq!(market_id_from_channel("order_book:1"), Some(1));
    }

    #[test]
    fn test_parse_ws_diff_frame() {
        let text = r#"{"type":"update/order_book","channel":"order_book:1","order_book":{"offset":5000,"bids":[{"price":"100","size":"1"}],"asks":[]}}"#;
        let frame: WsFrame = serde_json::from_str(text).unwrap();
        assert_eq!(frame.channel.as_deref(), Some("order_book:1"));
        let book = frame.order_book.unwrap();
        assert_eq!(book.offset, Some(5000));
        assert_eq!(book.bids.len(), 1);
    }

    #[test]
    fn test_rest_level_uses_remaining_base_amount_alias() {
        let text = r#"{"price":"100.0","remaining_base_amount":"2.5"}"#;
        let level: WireLevel = serde_json::from_str(text).unwrap();
        let parsed = level.to_level().unwrap();
        assert_eq!(parsed.size, 2.5);
    }
}
