//! Limit prices for measurement orders.
//!
//! Orders must rest on the book without filling, so buys go below mid and
//! sells above it, scaled by `market_offset` and snapped to the venue tick.

use crate::types::{BookTop, Side};

/// Passive limit price for `side`; `None` when the book is unusable.
pub fn limit_price(book: &BookTop, side: Side, market_offset: f64, tick_size: f64) -> Option<f64> {
    let mid = book.mid();
    if !(mid.is_finite() && mid > 0.0 && market_offset > 0.0) {
        return None;
    }
    let raw = match side {
        Side::Buy => mid * market_offset,
        Side::Sell => mid / market_offset,
    };
    let price = round_to_tick(raw, tick_size, side);
    (price > 0.0).then_some(price)
}

/// Snaps away from the market so rounding never makes the order more aggressive.
pub fn round_to_tick(price: f64, tick_size: f64, side: Side) -> f64 {
    if !(tick_size > 0.0) {
        return price;
    }
    let ticks = price / tick_size;
    // Tolerate representation error before flooring/ceiling.
    let snapped = match side {
        Side::Buy => (ticks + 1e-9).floor(),
        Side::Sell => (ticks - 1e-9).ceil(),
    };
    let decimals = tick_decimals(tick_size);
    let factor = 10f64.powi(decimals as i32);
    (snapped * tick_size * factor).round() / factor
}

fn tick_decimals(tick_size: f64) -> u32 {
    let mut decimals = 0;
    let mut scaled = tick_size;
    while decimals < 12 && (scaled - scaled.round()).abs() > 1e-9 {
        scaled *= 10.0;
        decimals += 1;
    }
    decimals
}
