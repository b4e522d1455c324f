// ─────────────────────────────────────────────────────────────────────────────
// broadcaster.rs — client registry and the three emission paths: cadence
// loop, tick path, and initial-emission-on-subscribe.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::protocol::Message;
use uuid::Uuid;

use crate::book::{BookStore, TickEvent, Venue};
use crate::config;
use crate::protocol::ServerMessage;

pub struct ClientHandle {
    pub tx: mpsc::UnboundedSender<Message>,
    pub symbols: RwLock<HashSet<String>>,
}

#[derive(Clone)]
pub struct Broadcaster {
    store: Arc<BookStore>,
    clients: Arc<RwLock<HashMap<Uuid, Arc<ClientHandle>>>>,
}

fn venue_for_symbol_lookup() -> [Venue; 2] {
    [Venue::Hyperliquid, Venue::Lighter]
}

impl Broadcaster {
    pub fn new(store: Arc<BookStore>) -> Self {
        Self { store, clients: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub async fn register(&self, tx: mpsc::UnboundedSender<Message>) -> Uuid {
        let id = Uuid::new_v4();
        let handle = Arc::new(ClientHandle { tx, symbols: RwLock::new(HashSet::new()) });
        self.clients.write().await.insert(id, handle);
        info!("broadcaster: client {} connected ({} total)", id, self.clients.read().await.len());
        id
    }

    pub async fn remove(&self, id: Uuid) {
        if self.clients.write().await.remove(&id).is_some() {
            info!("broadcaster: client {} disconnected", id);
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Sends a single ping frame to one client; used by the per-connection
    /// 60s idle timeout in the server loop, distinct from the registry-wide
    /// `run_heartbeat` sweep.
    pub async fn send_ping(&self, id: Uuid) -> Result<(), ()> {
        let clients = self.clients.read().await;
        let handle = clients.get(&id).ok_or(())?;
        handle.tx.send(Message::Ping(vec![])).map_err(|_| ())
    }

    /// Adds `markets` to the client's filter and performs the initial
    /// emission for any market that already has a snapshot.
    pub async fn subscribe(&self, id: Uuid, markets: &[String]) {
        let Some(handle) = self.clients.read().await.get(&id).cloned() else { return };
        {
            let mut symbols = handle.symbols.write().await;
            for m in markets {
                symbols.insert(m.clone());
            }
        }
        for symbol in markets {
            for venue in venue_for_symbol_lookup() {
                if venue == Venue::Lighter && config::lighter_market_id(symbol).is_none() {
                    continue;
                }
                if let Some(snapshot) = self.store.get_snapshot(venue, symbol).await {
                    send(&handle, ServerMessage::from_snapshot(&snapshot));
                    if let Some(metrics) = self.store.get_metrics(venue, symbol).await {
                        send(&handle, ServerMessage::from_metrics(venue.as_str(), symbol, &metrics, snapshot.timestamp));
                    }
                }
            }
        }
    }

    /// Replies to a client-initiated `{"type":"ping"}` application frame.
    pub async fn send_pong(&self, id: Uuid) {
        if let Some(handle) = self.clients.read().await.get(&id).cloned() {
            send(&handle, ServerMessage::Pong);
        }
    }

    pub async fn unsubscribe(&self, id: Uuid, markets: &[String]) {
        let Some(handle) = self.clients.read().await.get(&id).cloned() else { return };
        let mut symbols = handle.symbols.write().await;
        for m in markets {
            symbols.remove(m);
        }
    }

    /// Tick path: called from the book store's fire-and-forget callback
    /// whenever a book's mid price changes. Must never block the caller.
    pub async fn on_tick(&self, venue: Venue, market: String, price: f64, timestamp: f64) {
        let clients = self.clients.read().await;
        for handle in clients.values() {
            if handle.symbols.read().await.contains(&market) {
                send(handle, ServerMessage::price_update(venue.as_str(), &market, price, timestamp));
            }
        }
    }

    /// Cadence loop: runs forever at `1/hz` seconds, broadcasting the latest
    /// book + metrics for every tracked market to its subscribers.
    pub async fn run_cadence(&self, hz: f64) {
        let interval = Duration::from_secs_f64(1.0 / hz.max(0.01));
        loop {
            tokio::time::sleep(interval).await;
            let keys = self.store.tracked_keys().await;
            for key in keys {
                let Some(snapshot) = self.store.get_snapshot(key.venue, &key.market).await else { continue };
                let Some(metrics) = self.store.get_metrics(key.venue, &key.market).await else { continue };
                let clients = self.clients.read().await;
                for handle in clients.values() {
                    if handle.symbols.read().await.contains(&key.market) {
                        send(handle, ServerMessage::from_snapshot(&snapshot));
                        send(handle, ServerMessage::from_metrics(key.venue.as_str(), &key.market, &metrics, snapshot.timestamp));
                    }
                }
            }
        }
    }

    /// Drains the book store's tick-event channel forever, dispatching each
    /// mid-price change to its subscribers. Runs alongside `run_cadence`.
    pub async fn run_tick_loop(&self, mut rx: mpsc::UnboundedReceiver<TickEvent>) {
        while let Some(event) = rx.recv().await {
            self.on_tick(event.venue, event.market, event.mid, event.timestamp).await;
        }
    }

    /// Pings every connected client every `interval`; a send failure is
    /// treated as disconnection and the client is dropped from the registry.
    pub async fn run_heartbeat(&self, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let dead: Vec<Uuid> = {
                let clients = self.clients.read().await;
                clients
                    .iter()
                    .filter_map(|(id, handle)| if handle.tx.send(Message::Ping(vec![])).is_err() { Some(*id) } else { None })
                    .collect()
            };
            for id in dead {
                warn!("broadcaster: heartbeat send failed, dropping client {}", id);
                self.remove(id).await;
            }
        }
    }
}

fn send(handle: &ClientHandle, msg: ServerMessage) {
    if let Ok(text) = serde_json::to_string(&msg) {
        let _ = handle.tx.send(Message::Text(text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::Level;

    #[tokio::test]
    async fn test_initial_emission_on_subscribe() {
        let store = Arc::new(BookStore::new(3600.0));
        store
            .initialize(Venue::Hyperliquid, "BTC", &[Level { price: 100.0, size: 1.0 }], &[Level { price: 101.0, size: 1.0 }], 1.0)
            .await;
        let broadcaster = Broadcaster::new(store);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = broadcaster.register(tx).await;
        broadcaster.subscribe(id, &["BTC".to_string()]).await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Message::Text(_)));
    }

    #[tokio::test]
    async fn test_unsubscribed_client_receives_nothing_on_tick() {
        let store = Arc::new(BookStore::new(3600.0));
        let broadcaster = Broadcaster::new(store);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = broadcaster.register(tx).await;
        let _ = id;
        broadcaster.on_tick(Venue::Hyperliquid, "BTC".to_string(), 100.0, 1.0).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tick_path_reaches_subscribed_client() {
        let store = Arc::new(BookStore::new(3600.0));
        let broadcaster = Broadcaster::new(store);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = broadcaster.register(tx).await;
        broadcaster.subscribe(id, &["BTC".to_string()]).await;
        broadcaster.on_tick(Venue::Hyperliquid, "BTC".to_string(), 100.0, 1.0).await;
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, Message::Text(_)));
    }

    /// S7: a subscribed client receives exactly one price_update per mid
    /// change and none for an update that leaves the mid unchanged.
    #[tokio::test]
    async fn test_exactly_one_price_update_per_mid_change() {
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let store = Arc::new(BookStore::new(3600.0).with_tick_channel(tick_tx));
        let broadcaster = Broadcaster::new(store.clone());
        tokio::spawn({
            let b = broadcaster.clone();
            async move { b.run_tick_loop(tick_rx).await }
        });

        store
            .initialize(Venue::Hyperliquid, "BTC", &[Level { price: 100.0, size: 1.0 }], &[Level { price: 101.0, size: 1.0 }], 1.0)
            .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = broadcaster.register(tx).await;
        broadcaster.subscribe(id, &["BTC".to_string()]).await;
        // initial emission: orderbook_update + liquidity_metrics
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        // mid-changing update: bid size change alone doesn't move the book's
        // price levels, so change the bid price to shift the mid.
        store.update(Venue::Hyperliquid, "BTC", &[Level { price: 99.0, size: 1.0 }], &[], 2.0, false).await;
        let tick = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(tick, Message::Text(ref t) if t.contains("price_update")));
        assert!(rx.try_recv().is_err());

        // a diff that doesn't change the mid (adding a deeper, non-top level)
        store.update(Venue::Hyperliquid, "BTC", &[Level { price: 90.0, size: 5.0 }], &[], 3.0, false).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_filter() {
        let store = Arc::new(BookStore::new(3600.0));
        let broadcaster = Broadcaster::new(store);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = broadcaster.register(tx).await;
        broadcaster.subscribe(id, &["BTC".to_string()]).await;
        // drain nothing (no snapshot yet so no initial emission)
        broadcaster.unsubscribe(id, &["BTC".to_string()]).await;
        broadcaster.on_tick(Venue::Hyperliquid, "BTC".to_string(), 100.0, 1.0).await;
        assert!(rx.try_recv().is_err());
    }
}
