// =============================================================================
// Core Data Types — candles, trades, latest-value tickers
// =============================================================================

use serde::{Deserialize, Serialize};

/// One fixed-interval OHLCV summary for a single symbol.
///
/// `open_time` (epoch milliseconds) is the unique key inside a symbol's
/// series.  A candle is mutable only while its interval is still open; once
/// `is_closed` it is immutable history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl Candle {
    /// Build a degenerate candle from a single traded price, used to open a
    /// fresh interval when the first tick for it arrives before the kline
    /// stream does.
    pub fn from_trade(open_time: i64, price: f64, quantity: f64) -> Self {
        Self {
            open_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: quantity,
            is_closed: false,
        }
    }
}

/// A single exchange trade tick used to refine the currently open candle.
///
/// `trade_id` increases monotonically per symbol and is the dedup key for
/// at-least-once stream delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggTrade {
    pub trade_id: u64,
    pub price: f64,
    pub quantity: f64,
    /// Trade time in epoch milliseconds.
    pub timestamp: i64,
}

/// Best bid/ask snapshot for one symbol.  Only the most recent sample plus a
/// small rolling window is ever retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookTicker {
    pub bid_price: f64,
    pub bid_quantity: f64,
    pub ask_price: f64,
    pub ask_quantity: f64,
    /// Order book update id — monotonically increasing, used for dedup.
    pub update_id: u64,
}

/// Mark price sample for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkPrice {
    pub mark_price: f64,
    /// Event time in epoch milliseconds.
    pub event_time: i64,
}

/// Lifecycle of one websocket subscription.
///
/// `Closed` is terminal; every other state can be re-entered across
/// reconnect cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Live,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Live => "LIVE",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Closed => "CLOSED",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_from_trade_is_open_and_degenerate() {
        let c = Candle::from_trade(60_000, 101.5, 0.25);
        assert!(!c.is_closed);
        assert_eq!(c.open, 101.5);
        assert_eq!(c.high, 101.5);
        assert_eq!(c.low, 101.5);
        assert_eq!(c.close, 101.5);
        assert_eq!(c.volume, 0.25);
    }

    #[test]
    fn connection_state_display() {
        assert_eq!(ConnectionState::Live.to_string(), "LIVE");
        assert_eq!(ConnectionState::Closed.to_string(), "CLOSED");
    }
}
