// ─────────────────────────────────────────────────────────────────────────────
// server.rs — external boundary: one TCP listener serving both the duplex
// client socket and the four read-only HTTP routes, without pulling in a
// second web framework (see DESIGN.md for the tradeoff).
// ─────────────────────────────────────────────────────────────────────────────
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::adapters;
use crate::book::BookStore;
use crate::broadcaster::Broadcaster;
use crate::config::{lighter_market_id, AVAILABLE_ASSETS};
use crate::protocol::{parse_client_frame, ClientFrame, ClientRequest};

/// Upstream subscription plumbing the subscription API forwards into.
pub struct UpstreamHandles {
    pub hyperliquid_sub: adapters::SubscribedSet,
    pub hyperliquid_tx: mpsc::UnboundedSender<String>,
    pub lighter_sub: adapters::SubscribedSet,
    pub lighter_ws_tx: mpsc::UnboundedSender<String>,
    pub lighter_update_tx: mpsc::UnboundedSender<adapters::UpdateEvent>,
    pub lighter_rest_depth: u32,
    pub hyperliquid_n_levels: u32,
    pub client_timeout_secs: u64,
    pub hyperliquid_stats: adapters::SharedStats,
    pub lighter_stats: adapters::SharedStats,
}

pub async fn run(bind_addr: &str, store: Arc<BookStore>, broadcaster: Broadcaster, upstream: Arc<UpstreamHandles>) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!("server: listening on {}", bind_addr);

    loop {
        let (stream, addr) = listener.accept().await?;
        let store = store.clone();
        let broadcaster = broadcaster.clone();
        let upstream = upstream.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, store, broadcaster, upstream).await {
                warn!("server: connection from {} ended: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    store: Arc<BookStore>,
    broadcaster: Broadcaster,
    upstream: Arc<UpstreamHandles>,
) -> std::io::Result<()> {
    let mut peek_buf = [0u8; 2048];
    let n = stream.peek(&mut peek_buf).await?;
    let header_text = String::from_utf8_lossy(&peek_buf[..n]).to_ascii_lowercase();

    if header_text.contains("upgrade: websocket") {
        handle_websocket(stream, broadcaster, upstream).await;
    } else {
        handle_http(stream, &store, &broadcaster, &upstream).await?;
    }
    Ok(())
}

async fn handle_websocket(stream: TcpStream, broadcaster: Broadcaster, upstream: Arc<UpstreamHandles>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("server: websocket handshake failed: {}", e);
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let client_id = broadcaster.register(tx).await;
    let idle_timeout = Duration::from_secs(upstream.client_timeout_secs);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        match tokio::time::timeout(idle_timeout, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match parse_client_frame(&text) {
                Some(ClientFrame::Request(ClientRequest::Subscribe { markets })) => {
                    for symbol in &markets {
                        if !AVAILABLE_ASSETS.contains(&symbol.as_str()) {
                            warn!("server: client {}: {}", client_id, crate::error::Error::UnknownSymbol(symbol.clone()));
                        }
                        adapters::hyperliquid::subscribe(&upstream.hyperliquid_sub, &upstream.hyperliquid_tx, symbol, upstream.hyperliquid_n_levels).await;
                        if lighter_market_id(symbol).is_some() {
                            adapters::lighter::subscribe(&upstream.lighter_sub, &upstream.lighter_ws_tx, &upstream.lighter_update_tx, symbol, upstream.lighter_rest_depth).await;
                        }
                    }
                    broadcaster.subscribe(client_id, &markets).await;
                }
                Some(ClientFrame::Request(ClientRequest::Unsubscribe { markets })) => {
                    broadcaster.unsubscribe(client_id, &markets).await;
                }
                Some(ClientFrame::Ping) => broadcaster.send_pong(client_id).await,
                Some(ClientFrame::Pong) | None => {}
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                warn!("server: client {} read error: {}", client_id, e);
                break;
            }
            Err(_timeout) => {
                // No frame in 60s: ping the client; a send failure disconnects it.
                if broadcaster.send_ping(client_id).await.is_err() {
                    break;
                }
            }
        }
    }

    writer.abort();
    broadcaster.remove(client_id).await;
}

async fn handle_http(stream: TcpStream, store: &BookStore, broadcaster: &Broadcaster, upstream: &UpstreamHandles) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();

    // Drain remaining headers; we don't need them for these read-only routes.
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 || line == "\r\n" {
            break;
        }
    }

    let (status, body) = match path.as_str() {
        "/" => ("200 OK", serde_json::json!({ "status": "ok" })),
        "/stats" => {
            let count = broadcaster.client_count().await;
            let markets = store.tracked_keys().await.len();
            let hyperliquid_stats = upstream.hyperliquid_stats.lock().await.clone();
            let lighter_stats = upstream.lighter_stats.lock().await.clone();
            (
                "200 OK",
                serde_json::json!({
                    "connected_clients": count,
                    "tracked_markets": markets,
                    "exchanges": { "hyperliquid": hyperliquid_stats, "lighter": lighter_stats },
                }),
            )
        }
        "/markets" => {
            let keys = store.tracked_keys().await;
            let markets: Vec<_> = keys.iter().map(|k| serde_json::json!({ "exchange": k.venue.as_str(), "market": k.market })).collect();
            let count = markets.len();
            ("200 OK", serde_json::json!({ "markets": markets, "count": count }))
        }
        "/assets" => ("200 OK", serde_json::json!({ "assets": AVAILABLE_ASSETS })),
        _ => ("404 Not Found", serde_json::json!({ "error": "not found" })),
    };

    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body_str.len(),
        body_str
    );
    let mut stream = reader.into_inner();
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
