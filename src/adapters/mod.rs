// ─────────────────────────────────────────────────────────────────────────────
// adapters/mod.rs — shared contract for upstream venue adapters.
// ─────────────────────────────────────────────────────────────────────────────
pub mod hyperliquid;
pub mod lighter;

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::book::{BookStore, Level, Venue};

/// One book-state update delivered by either adapter.
pub struct UpdateEvent {
    pub venue: Venue,
    pub market: String,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub timestamp: f64,
    pub is_snapshot: bool,
}

pub async fn apply(store: &BookStore, ev: UpdateEvent) {
    if ev.is_snapshot {
        store.initialize(ev.venue, &ev.market, &ev.bids, &ev.asks, ev.timestamp).await;
    } else {
        store.update(ev.venue, &ev.market, &ev.bids, &ev.asks, ev.timestamp, false).await;
    }
}

/// Per-venue connection counters exposed through `GET /stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub connected: bool,
    pub last_update: Option<f64>,
    pub messages_received: u64,
    pub errors: u64,
}

pub type SharedStats = Arc<Mutex<ConnectionStats>>;

pub fn new_shared_stats() -> SharedStats {
    Arc::new(Mutex::new(ConnectionStats::default()))
}

/// Set of symbols subscribed so far, shared between the subscribe API and
/// the reconnect-replay logic of a single adapter.
pub type SubscribedSet = Arc<Mutex<HashSet<String>>>;

pub fn new_subscribed_set() -> SubscribedSet {
    Arc::new(Mutex::new(HashSet::new()))
}
