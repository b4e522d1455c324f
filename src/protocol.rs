// ─────────────────────────────────────────────────────────────────────────────
// protocol.rs — downstream client duplex-socket JSON protocol.
// ─────────────────────────────────────────────────────────────────────────────
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::book::{Level, Snapshot};
use crate::liquidity::LiquidityMetrics;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientRequest {
    Subscribe { markets: Vec<String> },
    Unsubscribe { markets: Vec<String> },
}

/// Parses a client frame, accepting both `{"action":"subscribe",...}` and the
/// bare `{"type":"ping"}` / `{"type":"pong"}` heartbeat shape.
pub fn parse_client_frame(text: &str) -> Option<ClientFrame> {
    let value: Value = serde_json::from_str(text).ok()?;
    if let Some(t) = value.get("type").and_then(Value::as_str) {
        if t == "ping" {
            return Some(ClientFrame::Ping);
        }
        if t == "pong" {
            return Some(ClientFrame::Pong);
        }
    }
    if let Some(action) = value.get("action").and_then(Value::as_str) {
        let markets: Vec<String> = value
            .get("markets")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        return match action {
            "subscribe" => Some(ClientFrame::Request(ClientRequest::Subscribe { markets })),
            "unsubscribe" => Some(ClientFrame::Request(ClientRequest::Unsubscribe { markets })),
            _ => None,
        };
    }
    None
}

#[derive(Debug, Clone)]
pub enum ClientFrame {
    Request(ClientRequest),
    Ping,
    Pong,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "orderbook_update")]
    OrderbookUpdate {
        exchange: String,
        market: String,
        bids: Vec<Level>,
        asks: Vec<Level>,
        mid: Option<f64>,
        spread: Option<f64>,
        spread_bps: Option<f64>,
        timestamp: f64,
    },
    #[serde(rename = "liquidity_metrics")]
    LiquidityMetricsUpdate {
        exchange: String,
        market: String,
        metrics: serde_json::Map<String, Value>,
        timestamp: f64,
    },
    #[serde(rename = "price_update")]
    PriceUpdate { exchange: String, market: String, price: f64, timestamp: f64 },
    #[serde(rename = "pong")]
    Pong,
}

const DEPTH_LIMIT: usize = 20;
const ROUND_DP: f64 = 100.0;

fn round2(v: f64) -> f64 {
    (v * ROUND_DP).round() / ROUND_DP
}

impl ServerMessage {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        ServerMessage::OrderbookUpdate {
            exchange: snapshot.venue.clone(),
            market: snapshot.market.clone(),
            bids: snapshot.bids.iter().take(DEPTH_LIMIT).cloned().collect(),
            asks: snapshot.asks.iter().take(DEPTH_LIMIT).cloned().collect(),
            mid: snapshot.mid,
            spread: snapshot.spread,
            spread_bps: snapshot.spread_bps,
            timestamp: snapshot.timestamp,
        }
    }

    pub fn from_metrics(exchange: &str, market: &str, metrics: &LiquidityMetrics, timestamp: f64) -> Self {
        let mut map = serde_json::Map::new();
        for (size, pair) in crate::config::LIQUIDITY_SIZES.iter().zip(metrics.iter()) {
            let key = format!("{}", *size as u64);
            map.insert(
                key,
                serde_json::json!({
                    "buy_cost": round2(pair.buy.total_cost),
                    "buy_avg_price": round2(pair.buy.avg_price),
                    "buy_slippage_bps": round2(pair.buy.slippage_bps),
                    "sell_proceeds": round2(pair.sell.total_cost),
                    "sell_avg_price": round2(pair.sell.avg_price),
                    "sell_slippage_bps": round2(pair.sell.slippage_bps),
                }),
            );
        }
        ServerMessage::LiquidityMetricsUpdate {
            exchange: exchange.to_string(),
            market: market.to_string(),
            metrics: map,
            timestamp,
        }
    }

    pub fn price_update(exchange: &str, market: &str, price: f64, timestamp: f64) -> Self {
        ServerMessage::PriceUpdate {
            exchange: exchange.to_string(),
            market: market.to_string(),
            price,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe_frame() {
        let frame = parse_client_frame(r#"{"action":"subscribe","markets":["BTC","ETH"]}"#).unwrap();
        match frame {
            ClientFrame::Request(ClientRequest::Subscribe { markets }) => {
                assert_eq!(markets, vec!["BTC".to_string(), "ETH".to_string()]);
            }
            _ => panic!("expected Subscribe"),
        }
    }

    #[test]
    fn test_parse_ping() {
        assert!(matches!(parse_client_frame(r#"{"type":"ping"}"#), Some(ClientFrame::Ping)));
    }

    #[test]
    fn test_parse_garbage_returns_none() {
        assert!(parse_client_frame("not json").is_none());
        assert!(parse_client_frame(r#"{"foo":"bar"}"#).is_none());
    }

    #[test]
    fn test_metrics_rounded_to_two_decimals() {
        let pair = crate::liquidity::LiquidityMetricPair {
            buy: crate::liquidity::LiquidityMetric {
                size_usd: 1000.0,
                total_cost: 50.0001,
                avg_price: 101.0049,
                slippage_bps: 49.749,
                levels_used: 1,
                feasible: true,
            },
            sell: crate::liquidity::LiquidityMetric {
                size_usd: 1000.0,
                total_cost: 0.0,
                avg_price: 0.0,
                slippage_bps: 0.0,
                levels_used: 0,
                feasible: false,
            },
        };
        let metrics = vec![pair; 8];
        let msg = ServerMessage::from_metrics("hyperliquid", "BTC", &metrics, 1.0);
        if let ServerMessage::LiquidityMetricsUpdate { metrics, .. } = msg {
            let entry = metrics.get("1000").unwrap();
            assert_eq!(entry["buy_cost"], serde_json::json!(50.0));
            assert_eq!(entry["buy_avg_price"], serde_json::json!(101.0));
        } else {
            panic!("expected LiquidityMetricsUpdate");
        }
    }
}
