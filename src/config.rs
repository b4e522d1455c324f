// ─────────────────────────────────────────────────────────────────────────────
// config.rs — static market tables and environment-tunable knobs.
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed ladder of USD notional sizes the liquidity engine walks at every tick.
pub const LIQUIDITY_SIZES: [f64; 8] = [
    1_000.0, 5_000.0, 10_000.0, 50_000.0, 100_000.0, 200_000.0, 500_000.0, 1_000_000.0,
];

/// Symbols this deployment tracks across both venues.
pub const AVAILABLE_ASSETS: [&str; 3] = ["ETH", "BTC", "SOL"];

/// Lighter's market index for each tracked symbol.
pub fn lighter_market_id(symbol: &str) -> Option<u32> {
    match symbol {
        "ETH" => Some(0),
        "BTC" => Some(1),
        "SOL" => Some(2),
        _ => None,
    }
}

/// Inverse of `lighter_market_id`, used when parsing inbound Lighter frames.
pub fn lighter_symbol(market_id: u32) -> Option<&'static str> {
    match market_id {
        0 => Some("ETH"),
        1 => Some("BTC"),
        2 => Some("SOL"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub broadcast_frequency_hz: f64,
    pub price_history_seconds: f64,
    pub reconnect_delay_secs: u64,
    pub lighter_rest_interval_secs: u64,
    pub lighter_rest_depth: u32,
    pub hyperliquid_n_levels: u32,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub bind_addr: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            broadcast_frequency_hz: env_f64("BROADCAST_FREQUENCY_HZ", 10.0),
            price_history_seconds: env_f64("PRICE_HISTORY_SECONDS", 3600.0),
            reconnect_delay_secs: env_u64("RECONNECT_DELAY_SECS", 5),
            lighter_rest_interval_secs: env_u64("LIGHTER_REST_INTERVAL_SECS", 5),
            lighter_rest_depth: env_u64("LIGHTER_REST_DEPTH", 20) as u32,
            hyperliquid_n_levels: env_u64("HYPERLIQUID_N_LEVELS", 20) as u32,
            heartbeat_interval_secs: env_u64("HEARTBEAT_INTERVAL_SECS", 30),
            client_timeout_secs: env_u64("CLIENT_TIMEOUT_SECS", 60),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lighter_market_roundtrip() {
        for sym in AVAILABLE_ASSETS {
            let id = lighter_market_id(sym).unwrap();
            assert_eq!(lighter_symbol(id), Some(sym));
        }
    }

    #[test]
    fn test_unknown_symbol_not_mapped() {
        assert_eq!(lighter_market_id("DOGE"), None);
    }
}
