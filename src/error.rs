// ─────────────────────────────────────────────────────────────────────────────
// error.rs — structured errors for the adapter / wire-codec boundary.
//
// Background tasks (adapters, broadcaster, server) still propagate with
// Box<dyn std::error::Error + Send + Sync> at the outermost loop, matching
// the rest of this crate; this enum exists for the call sites that want to
// match on a specific failure kind (frame parsing vs transport vs REST).
// ─────────────────────────────────────────────────────────────────────────────
use tokio_tungstenite::tungstenite;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect: {0}")]
    ConnectFailed(#[from] tungstenite::Error),

    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("failed to parse frame: {0}")]
    FrameParse(#[from] serde_json::Error),

    #[error("rest request failed: {0}")]
    Rest(#[from] reqwest::Error),

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
}
