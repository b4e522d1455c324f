// ─────────────────────────────────────────────────────────────────────────────
// book.rs — authoritative per-(venue, market) order-book state.
//
// One tokio::sync::Mutex per key, created lazily, guards that key's price
// maps together with its derived snapshot and liquidity metrics so readers
// never observe a book without its matching derived values.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::liquidity::{self, LiquidityMetrics};
use crate::price_history::PriceHistory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Venue {
    Hyperliquid,
    Lighter,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Hyperliquid => "hyperliquid",
            Venue::Lighter => "lighter",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookKey {
    pub venue: Venue,
    pub market: String,
}

/// Sorted, derived view of a book at the moment of its last mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub venue: String,
    pub market: String,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub mid: Option<f64>,
    pub spread: Option<f64>,
    pub spread_bps: Option<f64>,
    pub timestamp: f64,
}

impl Snapshot {
    fn derive(venue: Venue, market: &str, bids: &BTreeMap<OrderedPrice, f64>, asks: &BTreeMap<OrderedPrice, f64>, timestamp: f64) -> Self {
        let bid_levels: Vec<Level> = bids.iter().rev().map(|(p, s)| Level { price: p.0, size: *s }).collect();
        let ask_levels: Vec<Level> = asks.iter().map(|(p, s)| Level { price: p.0, size: *s }).collect();

        let mid = match (bid_levels.first(), ask_levels.first()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
            _ => None,
        };
        let spread = match (bid_levels.first(), ask_levels.first()) {
            (Some(b), Some(a)) => Some(a.price - b.price),
            _ => None,
        };
        let spread_bps = match (spread, mid) {
            (Some(s), Some(m)) if m > 0.0 => Some(s / m * 10_000.0),
            _ => None,
        };

        Snapshot {
            venue: venue.as_str().to_string(),
            market: market.to_string(),
            bids: bid_levels,
            asks: ask_levels,
            mid,
            spread,
            spread_bps,
            timestamp,
        }
    }
}

/// Wraps f64 so it can be a BTreeMap key; book prices are never NaN.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedPrice(f64);
impl Eq for OrderedPrice {}
impl PartialOrd for OrderedPrice {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderedPrice {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

struct BookEntry {
    bids: BTreeMap<OrderedPrice, f64>,
    asks: BTreeMap<OrderedPrice, f64>,
    snapshot: Option<Snapshot>,
    metrics: Option<LiquidityMetrics>,
    history: PriceHistory,
    initialized: bool,
}

impl BookEntry {
    fn new() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            snapshot: None,
            metrics: None,
            history: PriceHistory::new(),
            initialized: false,
        }
    }
}

/// One mid-price change, delivered fire-and-forget over an unbounded channel
/// so a slow broadcaster never blocks a book mutation.
pub struct TickEvent {
    pub venue: Venue,
    pub market: String,
    pub mid: f64,
    pub timestamp: f64,
}

pub struct BookStore {
    entries: RwLock<HashMap<BookKey, Arc<Mutex<BookEntry>>>>,
    price_history_seconds: f64,
    tick_tx: Option<tokio::sync::mpsc::UnboundedSender<TickEvent>>,
}

impl BookStore {
    pub fn new(price_history_seconds: f64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            price_history_seconds,
            tick_tx: None,
        }
    }

    pub fn with_tick_channel(mut self, tx: tokio::sync::mpsc::UnboundedSender<TickEvent>) -> Self {
        self.tick_tx = Some(tx);
        self
    }

    async fn entry_for(&self, key: &BookKey) -> Arc<Mutex<BookEntry>> {
        if let Some(entry) = self.entries.read().await.get(key) {
            return entry.clone();
        }
        let mut write = self.entries.write().await;
        write
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(BookEntry::new())))
            .clone()
    }

    pub async fn initialize(&self, venue: Venue, market: &str, bids: &[Level], asks: &[Level], ts: f64) {
        let key = BookKey { venue, market: market.to_string() };
        let entry_lock = self.entry_for(&key).await;
        let mut entry = entry_lock.lock().await;
        entry.bids.clear();
        entry.asks.clear();
        for l in bids {
            if l.size > 0.0 {
                entry.bids.insert(OrderedPrice(l.price), l.size);
            }
        }
        for l in asks {
            if l.size > 0.0 {
                entry.asks.insert(OrderedPrice(l.price), l.size);
            }
        }
        entry.initialized = true;
        self.commit(venue, market, &mut entry, ts);
    }

    pub async fn update(&self, venue: Venue, market: &str, bids: &[Level], asks: &[Level], ts: f64, is_snapshot: bool) {
        let key = BookKey { venue, market: market.to_string() };
        let entry_lock = self.entry_for(&key).await;
        let mut entry = entry_lock.lock().await;

        if is_snapshot || !entry.initialized {
            entry.bids.clear();
            entry.asks.clear();
            for l in bids {
                if l.size > 0.0 {
                    entry.bids.insert(OrderedPrice(l.price), l.size);
                }
            }
            for l in asks {
                if l.size > 0.0 {
                    entry.asks.insert(OrderedPrice(l.price), l.size);
                }
            }
        } else {
            for l in bids {
                if l.size <= 0.0 {
                    entry.bids.remove(&OrderedPrice(l.price));
                } else {
                    entry.bids.insert(OrderedPrice(l.price), l.size);
                }
            }
            for l in asks {
                if l.size <= 0.0 {
                    entry.asks.remove(&OrderedPrice(l.price));
                } else {
                    entry.asks.insert(OrderedPrice(l.price), l.size);
                }
            }
        }
        entry.initialized = true;
        self.commit(venue, market, &mut entry, ts);
    }

    fn commit(&self, venue: Venue, market: &str, entry: &mut BookEntry, ts: f64) {
        let prev_mid = entry.snapshot.as_ref().and_then(|s| s.mid);
        let snapshot = Snapshot::derive(venue, market, &entry.bids, &entry.asks, ts);

        // Invariant B2: crossed books from upstream are accepted but logged;
        // they do not stop updates.
        if let (Some(b), Some(a)) = (snapshot.bids.first(), snapshot.asks.first()) {
            if b.price >= a.price {
                warn!("book: crossed book for {}/{}: best_bid={} best_ask={}", venue.as_str(), market, b.price, a.price);
            }
        }

        let bid_levels = &snapshot.bids;
        let ask_levels = &snapshot.asks;
        entry.metrics = Some(liquidity::calculate_all_metrics(bid_levels, ask_levels, snapshot.mid));

        if let Some(mid) = snapshot.mid {
            entry.history.push(ts, mid, self.price_history_seconds);
            if prev_mid != Some(mid) {
                if let Some(tx) = &self.tick_tx {
                    let _ = tx.send(TickEvent { venue, market: market.to_string(), mid, timestamp: ts });
                }
            }
        }
        entry.snapshot = Some(snapshot);
    }

    pub async fn get_snapshot(&self, venue: Venue, market: &str) -> Option<Snapshot> {
        let key = BookKey { venue, market: market.to_string() };
        let entry_lock = self.entries.read().await.get(&key)?.clone();
        let entry = entry_lock.lock().await;
        entry.snapshot.clone()
    }

    pub async fn get_metrics(&self, venue: Venue, market: &str) -> Option<LiquidityMetrics> {
        let key = BookKey { venue, market: market.to_string() };
        let entry_lock = self.entries.read().await.get(&key)?.clone();
        let entry = entry_lock.lock().await;
        entry.metrics.clone()
    }

    #[allow(dead_code)] // not yet exposed over HTTP; the original backend doesn't route it either
    pub async fn get_price_history(&self, venue: Venue, market: &str, window_seconds: f64) -> Vec<(f64, f64)> {
        let key = BookKey { venue, market: market.to_string() };
        let Some(entry_lock) = self.entries.read().await.get(&key).cloned() else {
            return Vec::new();
        };
        let entry = entry_lock.lock().await;
        entry.history.window(window_seconds)
    }

    /// All (venue, market) keys currently tracked, for the cadence loop and
    /// the `/markets` endpoint.
    pub async fn tracked_keys(&self) -> Vec<BookKey> {
        self.entries.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lvl(price: f64, size: f64) -> Level {
        Level { price, size }
    }

    #[tokio::test]
    async fn test_s1_snapshot_replace() {
        let store = BookStore::new(3600.0);
        store
            .initialize(
                Venue::Hyperliquid,
                "BTC",
                &[lvl(100.0, 1.0), lvl(99.0, 2.0)],
                &[lvl(101.0, 1.0), lvl(102.0, 3.0)],
                1.0,
            )
            .await;
        let snap = store.get_snapshot(Venue::Hyperliquid, "BTC").await.unwrap();
        assert_eq!(snap.mid, Some(100.5));
        assert_eq!(snap.spread, Some(1.0));
        assert!((snap.spread_bps.unwrap() - 99.50248756218906).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_s2_diff_remove() {
        let store = BookStore::new(3600.0);
        store
            .initialize(Venue::Hyperliquid, "BTC", &[lvl(100.0, 1.0), lvl(99.0, 2.0)], &[lvl(101.0, 1.0), lvl(102.0, 3.0)], 1.0)
            .await;
        store.update(Venue::Hyperliquid, "BTC", &[lvl(99.0, 0.0)], &[], 2.0, false).await;
        let snap = store.get_snapshot(Venue::Hyperliquid, "BTC").await.unwrap();
        assert_eq!(snap.bids.len(), 1);
        assert_eq!(snap.mid, Some(100.5));
    }

    #[tokio::test]
    async fn test_s3_diff_add_overwrite() {
        let store = BookStore::new(3600.0);
        store
            .initialize(Venue::Hyperliquid, "BTC", &[lvl(100.0, 1.0), lvl(99.0, 2.0)], &[lvl(101.0, 1.0), lvl(102.0, 3.0)], 1.0)
            .await;
        store.update(Venue::Hyperliquid, "BTC", &[lvl(99.0, 0.0)], &[], 2.0, false).await;
        store.update(Venue::Hyperliquid, "BTC", &[lvl(100.0, 5.0), lvl(98.0, 4.0)], &[], 3.0, false).await;
        let snap = store.get_snapshot(Venue::Hyperliquid, "BTC").await.unwrap();
        assert_eq!(snap.bids, vec![lvl(100.0, 5.0), lvl(98.0, 4.0)]);
    }

    #[tokio::test]
    async fn test_one_sided_book_has_null_derived_values() {
        let store = BookStore::new(3600.0);
        store.initialize(Venue::Lighter, "ETH", &[lvl(100.0, 1.0)], &[], 1.0).await;
        let snap = store.get_snapshot(Venue::Lighter, "ETH").await.unwrap();
        assert_eq!(snap.mid, None);
        assert_eq!(snap.spread, None);
        assert_eq!(snap.spread_bps, None);
    }

    #[tokio::test]
    async fn test_diff_against_uninitialized_book_behaves_as_snapshot() {
        let store = BookStore::new(3600.0);
        store.update(Venue::Lighter, "ETH", &[lvl(100.0, 1.0)], &[lvl(101.0, 1.0)], 1.0, false).await;
        let snap = store.get_snapshot(Venue::Lighter, "ETH").await.unwrap();
        assert_eq!(snap.mid, Some(100.5));
    }

    #[tokio::test]
    async fn test_price_history_window_tracks_mid() {
        let store = BookStore::new(10.0);
        store.initialize(Venue::Hyperliquid, "BTC", &[lvl(100.0, 1.0)], &[lvl(101.0, 1.0)], 1.0).await;
        store.update(Venue::Hyperliquid, "BTC", &[lvl(100.0, 2.0)], &[], 2.0, false).await;
        let history = store.get_price_history(Venue::Hyperliquid, "BTC", 10.0).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].1, 100.5);
    }

    #[tokio::test]
    async fn test_tick_event_fires_once_per_mid_change() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let store = BookStore::new(3600.0).with_tick_channel(tx);
        store.initialize(Venue::Hyperliquid, "BTC", &[lvl(100.0, 1.0)], &[lvl(101.0, 1.0)], 1.0).await;
        store.update(Venue::Hyperliquid, "BTC", &[lvl(100.0, 2.0)], &[], 2.0, false).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
