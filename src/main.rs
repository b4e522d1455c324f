// ─────────────────────────────────────────────────────────────────────────────
// orderbook-aggregator: real-time DEX order-book aggregator
//
// Pulls L2 books from Hyperliquid and Lighter, maintains authoritative book
// state per (venue, market), derives liquidity/execution-cost metrics, and
// fans snapshots/metrics/ticks out to subscribing duplex-socket clients.
// ─────────────────────────────────────────────────────────────────────────────
mod adapters;
mod book;
mod broadcaster;
mod config;
mod error;
mod liquidity;
mod price_history;
mod protocol;
mod server;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use adapters::UpdateEvent;
use book::BookStore;
use broadcaster::Broadcaster;
use config::Settings;
use server::UpstreamHandles;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();
    log::info!("orderbook-aggregator starting...");

    let settings = Settings::from_env();
    log::info!(
        "  bind_addr={} broadcast_hz={} price_history_secs={} lighter_rest_interval={}s",
        settings.bind_addr, settings.broadcast_frequency_hz, settings.price_history_seconds, settings.lighter_rest_interval_secs
    );

    let (tick_tx, tick_rx) = mpsc::unbounded_channel();
    let store = Arc::new(BookStore::new(settings.price_history_seconds).with_tick_channel(tick_tx));
    let broadcaster = Broadcaster::new(store.clone());

    // ─── Broadcaster background loops ─────────────────────────────────────────
    {
        let b = broadcaster.clone();
        tokio::spawn(async move { b.run_tick_loop(tick_rx).await });
    }
    {
        let b = broadcaster.clone();
        let hz = settings.broadcast_frequency_hz;
        tokio::spawn(async move { b.run_cadence(hz).await });
    }
    {
        let b = broadcaster.clone();
        let interval = Duration::from_secs(settings.heartbeat_interval_secs);
        tokio::spawn(async move { b.run_heartbeat(interval).await });
    }

    // ─── Upstream adapters ─────────────────────────────────────────────────────
    let (update_tx, mut update_rx) = mpsc::unbounded_channel::<UpdateEvent>();

    let hyperliquid_sub = adapters::hyperliquid::subscribed_set_handle();
    let hyperliquid_stats = adapters::hyperliquid::stats_handle();
    let (hyperliquid_tx, hyperliquid_rx) = mpsc::unbounded_channel::<String>();
    {
        let update_tx = update_tx.clone();
        let sub = hyperliquid_sub.clone();
        let stats = hyperliquid_stats.clone();
        let reconnect_delay = Duration::from_secs(settings.reconnect_delay_secs);
        tokio::spawn(async move { adapters::hyperliquid::run(update_tx, hyperliquid_rx, sub, stats, reconnect_delay).await });
    }

    let lighter_sub = adapters::lighter::subscribed_set_handle();
    let lighter_stats = adapters::lighter::stats_handle();
    let (lighter_ws_tx, lighter_ws_rx) = mpsc::unbounded_channel::<String>();
    {
        let update_tx = update_tx.clone();
        let sub = lighter_sub.clone();
        let stats = lighter_stats.clone();
        let reconnect_delay = Duration::from_secs(settings.reconnect_delay_secs);
        tokio::spawn(async move { adapters::lighter::run(update_tx, lighter_ws_rx, sub, stats, reconnect_delay).await });
    }
    {
        let update_tx = update_tx.clone();
        let sub = lighter_sub.clone();
        let interval = Duration::from_secs(settings.lighter_rest_interval_secs);
        let depth = settings.lighter_rest_depth;
        tokio::spawn(async move { adapters::lighter::run_periodic_rest(sub, update_tx, interval, depth).await });
    }

    // ─── Book-store writer: the only task that calls store mutators ──────────
    {
        let store = store.clone();
        tokio::spawn(async move {
            while let Some(ev) = update_rx.recv().await {
                adapters::apply(&store, ev).await;
            }
        });
    }

    let upstream = Arc::new(UpstreamHandles {
        hyperliquid_sub,
        hyperliquid_tx,
        lighter_sub,
        lighter_ws_tx,
        lighter_update_tx: update_tx,
        lighter_rest_depth: settings.lighter_rest_depth,
        hyperliquid_n_levels: settings.hyperliquid_n_levels,
        client_timeout_secs: settings.client_timeout_secs,
        hyperliquid_stats,
        lighter_stats,
    });

    log::info!("all background tasks started, serving on {}", settings.bind_addr);
    if let Err(e) = server::run(&settings.bind_addr, store, broadcaster, upstream).await {
        log::error!("server exited: {}", e);
    }
}
