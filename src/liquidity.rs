// ─────────────────────────────────────────────────────────────────────────────
// liquidity.rs — pure ladder-walking liquidity/execution-cost engine.
//
// Given a sorted snapshot, walks each side outward from the best price for a
// fixed ladder of USD notional sizes. No I/O, no shared state: same inputs
// always produce the same LiquidityMetrics.
// ─────────────────────────────────────────────────────────────────────────────
use serde::{Deserialize, Serialize};

use crate::book::Level;
use crate::config::LIQUIDITY_SIZES;

const FEASIBILITY_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LiquidityMetric {
    pub size_usd: f64,
    pub total_cost: f64,
    pub avg_price: f64,
    pub slippage_bps: f64,
    pub levels_used: u32,
    pub feasible: bool,
}

impl LiquidityMetric {
    fn empty(size_usd: f64) -> Self {
        Self {
            size_usd,
            total_cost: 0.0,
            avg_price: 0.0,
            slippage_bps: 0.0,
            levels_used: 0,
            feasible: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LiquidityMetricPair {
    pub buy: LiquidityMetric,
    pub sell: LiquidityMetric,
}

/// `metrics[i]` corresponds to `LIQUIDITY_SIZES[i]`.
pub type LiquidityMetrics = Vec<LiquidityMetricPair>;

/// Walks `levels` outward (already sorted best-first) until `size_usd` of
/// notional is consumed or the book is exhausted.
fn walk(levels: &[Level], size_usd: f64) -> (f64, f64, u32, bool) {
    let mut remaining = size_usd;
    let mut total_cost = 0.0;
    let mut total_units = 0.0;
    let mut levels_used = 0u32;

    for level in levels {
        if remaining <= 0.0 {
            break;
        }
        let level_notional = level.price * level.size;
        levels_used += 1;
        if remaining <= level_notional {
            total_cost += remaining;
            total_units += remaining / level.price;
            remaining = 0.0;
            break;
        } else {
            total_cost += level_notional;
            total_units += level.size;
            remaining -= level_notional;
        }
    }

    let avg_price = if total_units > 0.0 { total_cost / total_units } else { 0.0 };
    let feasible = remaining <= FEASIBILITY_EPSILON;
    (total_cost, avg_price, levels_used, feasible)
}

/// Computes one side's metric. `mid` is `None` when the opposing side of the
/// book is empty, in which case slippage is reported as zero.
fn side_metric(levels: &[Level], size_usd: f64, mid: Option<f64>, is_buy: bool) -> LiquidityMetric {
    if levels.is_empty() {
        return LiquidityMetric::empty(size_usd);
    }
    let (total_cost, avg_price, levels_used, feasible) = walk(levels, size_usd);
    if levels_used == 0 {
        return LiquidityMetric::empty(size_usd);
    }
    let slippage_bps = match mid {
        Some(mid) if mid > 0.0 => {
            let slippage = if is_buy { avg_price - mid } else { mid - avg_price };
            slippage / mid * 10_000.0
        }
        _ => 0.0,
    };
    LiquidityMetric {
        size_usd,
        total_cost,
        avg_price,
        slippage_bps,
        levels_used,
        feasible,
    }
}

/// Computes the full buy/sell ladder for a book side pair, at every
/// configured size.
pub fn calculate_all_metrics(bids: &[Level], asks: &[Level], mid: Option<f64>) -> LiquidityMetrics {
    LIQUIDITY_SIZES
        .iter()
        .map(|&size| LiquidityMetricPair {
            buy: side_metric(asks, size, mid, true),
            sell: side_metric(bids, size, mid, false),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lvl(price: f64, size: f64) -> Level {
        Level { price, size }
    }

    #[test]
    fn test_buy_cost_single_level() {
        // S4: asks=[{101,1},{102,3}], mid=100.5, size_usd=50
        let asks = vec![lvl(101.0, 1.0), lvl(102.0, 3.0)];
        let m = side_metric(&asks, 50.0, Some(100.5), true);
        assert!((m.total_cost - 50.0).abs() < 1e-9);
        assert!((m.avg_price - 101.0).abs() < 1e-9);
        assert!((m.slippage_bps - 49.75).abs() < 1e-2);
        assert_eq!(m.levels_used, 1);
        assert!(m.feasible);
    }

    #[test]
    fn test_buy_cost_two_levels() {
        // S5: same book, size_usd=200
        let asks = vec![lvl(101.0, 1.0), lvl(102.0, 3.0)];
        let m = side_metric(&asks, 200.0, Some(100.5), true);
        assert_eq!(m.levels_used, 2);
        assert!(m.feasible);
        let expected_units = 101.0 / 101.0 + 99.0 / 102.0;
        let expected_avg = 200.0 / expected_units;
        assert!((m.avg_price - expected_avg).abs() < 1e-6);
    }

    #[test]
    fn test_infeasible_size_not_inflated() {
        // S6: asks=[{101,1}] only, size_usd=500
        let asks = vec![lvl(101.0, 1.0)];
        let m = side_metric(&asks, 500.0, Some(100.5), true);
        assert!(!m.feasible);
        assert_eq!(m.levels_used, 1);
        assert!((m.total_cost - 101.0).abs() < 1e-9);
        assert!((m.avg_price - 101.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_side_yields_infeasible_zero() {
        let m = side_metric(&[], 1000.0, Some(100.0), true);
        assert!(!m.feasible);
        assert_eq!(m.levels_used, 0);
        assert_eq!(m.total_cost, 0.0);
    }

    #[test]
    fn test_pure_function_same_output_twice() {
        let asks = vec![lvl(101.0, 1.0), lvl(102.0, 3.0)];
        let a = calculate_all_metrics(&[], &asks, Some(100.5));
        let b = calculate_all_metrics(&[], &asks, Some(100.5));
        assert_eq!(a, b);
    }

    #[test]
    fn test_sell_side_avg_price_below_mid() {
        let bids = vec![lvl(100.0, 1.0), lvl(99.0, 5.0)];
        let m = side_metric(&bids, 5_000.0, Some(100.5), false);
        assert!(m.avg_price <= 100.5);
    }
}
