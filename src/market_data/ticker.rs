// =============================================================================
// Ticker Board — latest book ticker and mark price per symbol
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use crate::types::{BookTicker, MarkPrice};

/// Mid-price samples kept per symbol for short-horizon smoothing.
const MID_WINDOW: usize = 128;

#[derive(Default)]
struct SymbolTicker {
    book: Option<BookTicker>,
    mark: Option<MarkPrice>,
    mids: VecDeque<f64>,
}

/// Latest top-of-book and mark-price state for every tracked symbol.
///
/// Book updates are deduplicated upstream by update id; the board itself only
/// keeps the newest value plus a small mid-price window.
pub struct TickerBoard {
    symbols: RwLock<HashMap<String, SymbolTicker>>,
}

impl TickerBoard {
    pub fn new() -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
        }
    }

    pub fn update_book(&self, symbol: &str, ticker: BookTicker) {
        let mut map = self.symbols.write();
        let entry = map.entry(symbol.to_string()).or_default();

        let mid = (ticker.bid_price + ticker.ask_price) / 2.0;
        if mid.is_finite() {
            entry.mids.push_back(mid);
            while entry.mids.len() > MID_WINDOW {
                entry.mids.pop_front();
            }
        }
        entry.book = Some(ticker);
    }

    pub fn update_mark(&self, symbol: &str, mark: MarkPrice) {
        let mut map = self.symbols.write();
        map.entry(symbol.to_string()).or_default().mark = Some(mark);
    }

    pub fn book(&self, symbol: &str) -> Option<BookTicker> {
        self.symbols.read().get(symbol).and_then(|t| t.book.clone())
    }

    pub fn mark(&self, symbol: &str) -> Option<MarkPrice> {
        self.symbols.read().get(symbol).and_then(|t| t.mark.clone())
    }

    /// Current mid price, if a book ticker has been seen.
    pub fn mid_price(&self, symbol: &str) -> Option<f64> {
        self.symbols
            .read()
            .get(symbol)
            .and_then(|t| t.book.as_ref())
            .map(|b| (b.bid_price + b.ask_price) / 2.0)
    }

    /// Mean of the recent mid-price window.
    pub fn smoothed_mid(&self, symbol: &str) -> Option<f64> {
        let map = self.symbols.read();
        let mids = &map.get(symbol)?.mids;
        if mids.is_empty() {
            return None;
        }
        Some(mids.iter().sum::<f64>() / mids.len() as f64)
    }
}

impl Default for TickerBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(bid: f64, ask: f64, update_id: u64) -> BookTicker {
        BookTicker {
            bid_price: bid,
            bid_quantity: 1.0,
            ask_price: ask,
            ask_quantity: 1.0,
            update_id,
        }
    }

    #[test]
    fn latest_book_wins() {
        let board = TickerBoard::new();
        board.update_book("BTCUSDT", book(100.0, 101.0, 1));
        board.update_book("BTCUSDT", book(102.0, 103.0, 2));
        let b = board.book("BTCUSDT").unwrap();
        assert_eq!(b.update_id, 2);
        assert!((board.mid_price("BTCUSDT").unwrap() - 102.5).abs() < 1e-9);
    }

    #[test]
    fn smoothed_mid_averages_the_window() {
        let board = TickerBoard::new();
        board.update_book("BTCUSDT", book(99.0, 101.0, 1)); // mid 100
        board.update_book("BTCUSDT", book(101.0, 103.0, 2)); // mid 102
        assert!((board.smoothed_mid("BTCUSDT").unwrap() - 101.0).abs() < 1e-9);
    }

    #[test]
    fn window_is_bounded() {
        let board = TickerBoard::new();
        for i in 0..(MID_WINDOW as u64 + 50) {
            board.update_book("BTCUSDT", book(100.0 + i as f64, 101.0 + i as f64, i + 1));
        }
        let map = board.symbols.read();
        assert_eq!(map["BTCUSDT"].mids.len(), MID_WINDOW);
    }

    #[test]
    fn unknown_symbol_is_none() {
        let board = TickerBoard::new();
        assert!(board.book("XYZUSDT").is_none());
        assert!(board.mark("XYZUSDT").is_none());
        assert!(board.smoothed_mid("XYZUSDT").is_none());
    }

    #[test]
    fn mark_price_updates_independently() {
        let board = TickerBoard::new();
        board.update_mark(
            "ETHUSDT",
            MarkPrice {
                mark_price: 2000.5,
                event_time: 1_700_000_000_000,
            },
        );
        assert!(board.book("ETHUSDT").is_none());
        assert!((board.mark("ETHUSDT").unwrap().mark_price - 2000.5).abs() < 1e-9);
    }
}
