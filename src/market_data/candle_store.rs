// =============================================================================
// Candle Store — symbol-partitioned OHLCV time series
// =============================================================================
//
// Single source of truth for candle history.  Each symbol owns an ordered
// table keyed by open_time with strictly increasing unique keys.
//
// Merge rule: merging takes the union of keys; on a key collision the
// later-arriving value wins only while that candle is still open — closed
// history is immutable.  This makes ingestion idempotent and
// order-independent, so the websocket path and the REST-backfill path can
// feed the same table without coordination beyond the per-symbol lock.
//
// Concurrency: one mutex per symbol serialises that symbol's writers while
// different symbols ingest fully in parallel.  Readers only ever receive
// cloned snapshots, never a reference into the live table.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::types::{AggTrade, Candle};

/// Ordered per-symbol series keyed by open_time.
pub type CandleTable = BTreeMap<i64, Candle>;

/// Persisted file suffix per symbol table.
const FILE_SUFFIX: &str = "_1m.csv";

struct SymbolSeries {
    table: CandleTable,
    /// Highest aggregate-trade id applied to this series (0 = none yet).
    last_trade_id: u64,
}

impl SymbolSeries {
    fn new() -> Self {
        Self {
            table: CandleTable::new(),
            last_trade_id: 0,
        }
    }
}

/// Thread-safe store of every symbol's candle table.
pub struct CandleStore {
    series: RwLock<HashMap<String, Arc<Mutex<SymbolSeries>>>>,
    interval_ms: i64,
}

impl CandleStore {
    /// Store for candles of the given fixed interval (milliseconds).
    pub fn new(interval_ms: i64) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            interval_ms,
        }
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    fn series_for(&self, symbol: &str) -> Arc<Mutex<SymbolSeries>> {
        {
            let map = self.series.read();
            if let Some(s) = map.get(symbol) {
                return s.clone();
            }
        }
        let mut map = self.series.write();
        map.entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SymbolSeries::new())))
            .clone()
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    /// Merge one candle into `symbol`'s table under the closed-history-wins
    /// rule.  Returns `true` when the table changed.
    pub fn ingest_candle(&self, symbol: &str, candle: Candle) -> bool {
        let series = self.series_for(symbol);
        let mut guard = series.lock();
        match guard.table.get(&candle.open_time) {
            Some(existing) if existing.is_closed => false,
            _ => {
                guard.table.insert(candle.open_time, candle);
                true
            }
        }
    }

    /// Merge a batch (REST backfill) into `symbol`'s table.  Returns how many
    /// rows changed the table.
    pub fn ingest_candles(&self, symbol: &str, candles: Vec<Candle>) -> usize {
        let series = self.series_for(symbol);
        let mut guard = series.lock();
        let mut changed = 0;
        for candle in candles {
            match guard.table.get(&candle.open_time) {
                Some(existing) if existing.is_closed => {}
                _ => {
                    guard.table.insert(candle.open_time, candle);
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Refine the currently open candle from one aggregate trade.
    ///
    /// Returns `false` when the trade was a duplicate (its id is not greater
    /// than the last applied id) or would touch closed history.
    pub fn ingest_trade(&self, symbol: &str, trade: &AggTrade) -> bool {
        let series = self.series_for(symbol);
        let mut guard = series.lock();

        if guard.last_trade_id != 0 && trade.trade_id <= guard.last_trade_id {
            return false;
        }
        guard.last_trade_id = trade.trade_id;

        let bucket = trade.timestamp - trade.timestamp.rem_euclid(self.interval_ms);
        match guard.table.get_mut(&bucket) {
            None => {
                guard
                    .table
                    .insert(bucket, Candle::from_trade(bucket, trade.price, trade.quantity));
                true
            }
            Some(candle) if candle.is_closed => false,
            Some(candle) => {
                candle.high = candle.high.max(trade.price);
                candle.low = candle.low.min(trade.price);
                candle.close = trade.price;
                candle.volume += trade.quantity;
                true
            }
        }
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Immutable copy of `symbol`'s full table.  Later ingestion is invisible
    /// to the returned value.
    pub fn snapshot(&self, symbol: &str) -> CandleTable {
        let map = self.series.read();
        match map.get(symbol) {
            Some(series) => series.lock().table.clone(),
            None => CandleTable::new(),
        }
    }

    /// Immutable copy restricted to `[start, end]` open times (inclusive).
    pub fn snapshot_range(&self, symbol: &str, start: i64, end: i64) -> CandleTable {
        let map = self.series.read();
        match map.get(symbol) {
            Some(series) => series
                .lock()
                .table
                .range(start..=end)
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            None => CandleTable::new(),
        }
    }

    /// Snapshot several symbols at once.  Each table is internally
    /// consistent; no cross-symbol ordering is implied.
    pub fn snapshot_many(&self, symbols: &[String]) -> HashMap<String, CandleTable> {
        symbols
            .iter()
            .map(|s| (s.clone(), self.snapshot(s)))
            .collect()
    }

    /// Open time of the newest candle for `symbol`.
    pub fn last_open_time(&self, symbol: &str) -> Option<i64> {
        let map = self.series.read();
        map.get(symbol)
            .and_then(|series| series.lock().table.keys().next_back().copied())
    }

    /// Symbols with at least one stored candle, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let map = self.series.read();
        let mut out: Vec<String> = map
            .iter()
            .filter(|(_, s)| !s.lock().table.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        out.sort();
        out
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Write every symbol's table to `dir` as one CSV per symbol, atomically
    /// (tmp + rename).  The shortest-round-trip float formatting of the CSV
    /// writer reproduces every f64 bit-exactly on restore.
    pub fn persist(&self, dir: &Path) -> Result<usize> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let symbols = {
            let map = self.series.read();
            map.keys().cloned().collect::<Vec<_>>()
        };

        let mut written = 0;
        for symbol in symbols {
            let table = self.snapshot(&symbol);
            if table.is_empty() {
                continue;
            }

            let path = dir.join(format!("{symbol}{FILE_SUFFIX}"));
            let tmp_path = dir.join(format!("{symbol}{FILE_SUFFIX}.tmp"));

            {
                let mut writer = csv::Writer::from_path(&tmp_path)
                    .with_context(|| format!("failed to open {}", tmp_path.display()))?;
                for candle in table.values() {
                    writer
                        .serialize(candle)
                        .with_context(|| format!("failed to write candle for {symbol}"))?;
                }
                writer.flush().context("failed to flush candle csv")?;
            }

            std::fs::rename(&tmp_path, &path)
                .with_context(|| format!("failed to rename {}", tmp_path.display()))?;
            written += 1;
        }

        info!(tables = written, dir = %dir.display(), "candle tables persisted");
        Ok(written)
    }

    /// Rebuild every symbol table found under `dir`.  Returns the restored
    /// symbols; the caller fills only the most recent gap via REST instead of
    /// redownloading full history.
    pub fn restore(&self, dir: &Path) -> Result<Vec<String>> {
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "no persisted candle data");
            return Ok(Vec::new());
        }

        let mut restored = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(symbol) = name.strip_suffix(FILE_SUFFIX) else {
                continue;
            };

            let mut reader = csv::Reader::from_path(entry.path())
                .with_context(|| format!("failed to open {}", entry.path().display()))?;
            let mut candles = Vec::new();
            for row in reader.deserialize::<Candle>() {
                match row {
                    Ok(candle) => candles.push(candle),
                    Err(e) => warn!(symbol, error = %e, "skipping corrupt candle row"),
                }
            }

            if !candles.is_empty() {
                self.ingest_candles(symbol, candles);
                restored.push(symbol.to_string());
            }
        }

        restored.sort();
        info!(symbols = ?restored, "candle tables restored");
        Ok(restored)
    }
}

// =============================================================================
// Interpolation
// =============================================================================

type FieldGet = fn(&Candle) -> f64;
type FieldSet = fn(&mut Candle, f64);

const FIELDS: [(FieldGet, FieldSet); 5] = [
    (|c| c.open, |c, v| c.open = v),
    (|c| c.high, |c, v| c.high = v),
    (|c| c.low, |c, v| c.low = v),
    (|c| c.close, |c, v| c.close = v),
    (|c| c.volume, |c, v| c.volume = v),
];

/// Fill non-finite numeric gaps in place: interior gaps linearly between the
/// surrounding finite samples, trailing gaps by holding the last finite
/// value.  Timestamps are never fabricated — only existing rows change.
pub fn interpolate(table: &mut CandleTable) {
    let keys: Vec<i64> = table.keys().copied().collect();
    for (get, set) in FIELDS {
        let mut values: Vec<f64> = keys.iter().map(|k| get(&table[k])).collect();
        fill_linear(&mut values);
        for (key, value) in keys.iter().zip(values) {
            if let Some(candle) = table.get_mut(key) {
                set(candle, value);
            }
        }
    }
}

fn fill_linear(values: &mut [f64]) {
    let mut last_finite: Option<usize> = None;
    let mut i = 0;
    while i < values.len() {
        if values[i].is_finite() {
            if let Some(prev) = last_finite {
                // Fill the interior run (prev, i) linearly.
                let gap = i - prev;
                if gap > 1 {
                    let base = values[prev];
                    let step = (values[i] - base) / gap as f64;
                    for (offset, slot) in values[prev + 1..i].iter_mut().enumerate() {
                        *slot = base + step * (offset + 1) as f64;
                    }
                }
            }
            last_finite = Some(i);
        }
        i += 1;
    }
    // Trailing run holds the last finite value.  Leading gaps are left alone
    // — there is nothing to anchor them to.
    if let Some(prev) = last_finite {
        let hold = values[prev];
        for slot in values[prev + 1..].iter_mut() {
            *slot = hold;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: i64 = 60_000;

    fn candle(open_time: i64, close: f64, is_closed: bool) -> Candle {
        Candle {
            open_time,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            is_closed,
        }
    }

    fn trade(id: u64, price: f64, quantity: f64, timestamp: i64) -> AggTrade {
        AggTrade {
            trade_id: id,
            price,
            quantity,
            timestamp,
        }
    }

    #[test]
    fn final_state_is_order_independent() {
        let messages = vec![
            candle(0, 100.0, true),
            candle(MINUTE, 101.0, true),
            candle(2 * MINUTE, 102.0, true),
            candle(3 * MINUTE, 103.0, false),
        ];

        // Canonical time order.
        let canonical = CandleStore::new(MINUTE);
        for c in &messages {
            canonical.ingest_candle("BTCUSDT", c.clone());
        }

        // Reversed with duplicates interleaved.
        let scrambled = CandleStore::new(MINUTE);
        for c in messages.iter().rev() {
            scrambled.ingest_candle("BTCUSDT", c.clone());
            scrambled.ingest_candle("BTCUSDT", c.clone());
        }

        let a = canonical.snapshot("BTCUSDT");
        let b = scrambled.snapshot("BTCUSDT");
        assert_eq!(a, b);

        let keys: Vec<i64> = a.keys().copied().collect();
        assert_eq!(keys, vec![0, MINUTE, 2 * MINUTE, 3 * MINUTE]);
    }

    #[test]
    fn closed_history_is_immutable() {
        let store = CandleStore::new(MINUTE);
        assert!(store.ingest_candle("BTCUSDT", candle(0, 100.0, true)));
        // A later arrival for the same closed key is discarded.
        assert!(!store.ingest_candle("BTCUSDT", candle(0, 999.0, true)));
        assert!(!store.ingest_candle("BTCUSDT", candle(0, 999.0, false)));

        let table = store.snapshot("BTCUSDT");
        assert!((table[&0].close - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn open_candle_takes_later_value_until_closed() {
        let store = CandleStore::new(MINUTE);
        store.ingest_candle("BTCUSDT", candle(0, 100.0, false));
        store.ingest_candle("BTCUSDT", candle(0, 100.7, false));
        assert!((store.snapshot("BTCUSDT")[&0].close - 100.7).abs() < f64::EPSILON);

        // Closing the candle freezes it.
        store.ingest_candle("BTCUSDT", candle(0, 100.9, true));
        store.ingest_candle("BTCUSDT", candle(0, 555.0, false));
        assert!((store.snapshot("BTCUSDT")[&0].close - 100.9).abs() < f64::EPSILON);
    }

    #[test]
    fn rest_backfill_fills_the_missing_minute() {
        // Stream delivered minutes 00, 01, 03 — 02 went missing.
        let store = CandleStore::new(MINUTE);
        store.ingest_candle("BTCUSDT", candle(0, 100.0, true));
        store.ingest_candle("BTCUSDT", candle(MINUTE, 101.0, true));
        store.ingest_candle("BTCUSDT", candle(3 * MINUTE, 103.0, false));

        // REST backfill returns 02 (and overlaps are harmless).
        store.ingest_candles(
            "BTCUSDT",
            vec![candle(MINUTE, 101.0, true), candle(2 * MINUTE, 102.0, true)],
        );

        let keys: Vec<i64> = store.snapshot("BTCUSDT").keys().copied().collect();
        assert_eq!(keys, vec![0, MINUTE, 2 * MINUTE, 3 * MINUTE]);
    }

    #[test]
    fn duplicate_trade_id_applies_once() {
        let store = CandleStore::new(MINUTE);
        store.ingest_candle("BTCUSDT", candle(0, 100.0, false));

        let t = trade(7, 105.0, 2.0, 30_000);
        assert!(store.ingest_trade("BTCUSDT", &t));
        assert!(!store.ingest_trade("BTCUSDT", &t));

        let c = &store.snapshot("BTCUSDT")[&0];
        // Exactly one effective update: volume grew by one trade's quantity.
        assert!((c.volume - 12.0).abs() < f64::EPSILON);
        assert!((c.close - 105.0).abs() < f64::EPSILON);
        assert!((c.high - 105.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stale_trade_id_is_discarded() {
        let store = CandleStore::new(MINUTE);
        assert!(store.ingest_trade("BTCUSDT", &trade(10, 100.0, 1.0, 5_000)));
        assert!(!store.ingest_trade("BTCUSDT", &trade(9, 200.0, 1.0, 6_000)));
        let c = &store.snapshot("BTCUSDT")[&0];
        assert!((c.close - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn trade_opens_a_fresh_interval() {
        let store = CandleStore::new(MINUTE);
        assert!(store.ingest_trade("ETHUSDT", &trade(1, 2000.0, 0.5, MINUTE + 100)));
        let table = store.snapshot("ETHUSDT");
        let c = &table[&MINUTE];
        assert!(!c.is_closed);
        assert!((c.open - 2000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn trade_never_touches_closed_history() {
        let store = CandleStore::new(MINUTE);
        store.ingest_candle("BTCUSDT", candle(0, 100.0, true));
        assert!(!store.ingest_trade("BTCUSDT", &trade(1, 500.0, 1.0, 30_000)));
        assert!((store.snapshot("BTCUSDT")[&0].close - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_is_isolated_from_later_ingestion() {
        let store = CandleStore::new(MINUTE);
        store.ingest_candle("BTCUSDT", candle(0, 100.0, true));
        let snap = store.snapshot("BTCUSDT");
        store.ingest_candle("BTCUSDT", candle(MINUTE, 101.0, true));
        assert_eq!(snap.len(), 1);
        assert_eq!(store.snapshot("BTCUSDT").len(), 2);
    }

    #[test]
    fn snapshot_range_is_inclusive() {
        let store = CandleStore::new(MINUTE);
        for i in 0..5 {
            store.ingest_candle("BTCUSDT", candle(i * MINUTE, 100.0 + i as f64, true));
        }
        let part = store.snapshot_range("BTCUSDT", MINUTE, 3 * MINUTE);
        let keys: Vec<i64> = part.keys().copied().collect();
        assert_eq!(keys, vec![MINUTE, 2 * MINUTE, 3 * MINUTE]);
    }

    #[test]
    fn persist_restore_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = CandleStore::new(MINUTE);

        // Values chosen to stress float formatting.
        let mut awkward = candle(0, 0.1 + 0.2, true);
        awkward.volume = 1.000000000000004e-17;
        store.ingest_candle("BTCUSDT", awkward);
        store.ingest_candle("BTCUSDT", candle(MINUTE, 37021.129999999997, true));
        store.ingest_candle("BTCUSDT", candle(2 * MINUTE, 101.5, false));
        store.ingest_candle("ETHUSDT", candle(0, 1999.99, true));

        assert_eq!(store.persist(dir.path()).unwrap(), 2);

        let restored = CandleStore::new(MINUTE);
        let symbols = restored.restore(dir.path()).unwrap();
        assert_eq!(symbols, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);

        assert_eq!(store.snapshot("BTCUSDT"), restored.snapshot("BTCUSDT"));
        assert_eq!(store.snapshot("ETHUSDT"), restored.snapshot("ETHUSDT"));
        // Bit-exact equality of the awkward values.
        assert_eq!(
            store.snapshot("BTCUSDT")[&0].close.to_bits(),
            restored.snapshot("BTCUSDT")[&0].close.to_bits()
        );
    }

    #[test]
    fn restore_from_missing_dir_is_empty() {
        let store = CandleStore::new(MINUTE);
        let symbols = store
            .restore(Path::new("/nonexistent/meridian-test"))
            .unwrap();
        assert!(symbols.is_empty());
    }

    #[test]
    fn interpolate_fills_interior_gaps_only_on_existing_rows() {
        let mut table = CandleTable::new();
        table.insert(0, candle(0, 100.0, true));
        let mut hole = candle(MINUTE, f64::NAN, true);
        hole.open = f64::NAN;
        hole.high = f64::NAN;
        hole.low = f64::NAN;
        hole.volume = f64::NAN;
        table.insert(MINUTE, hole);
        table.insert(2 * MINUTE, candle(2 * MINUTE, 104.0, true));

        let before: Vec<i64> = table.keys().copied().collect();
        interpolate(&mut table);
        let after: Vec<i64> = table.keys().copied().collect();
        assert_eq!(before, after);

        // close: 100 .. 104 — midpoint is 102.
        assert!((table[&MINUTE].close - 102.0).abs() < 1e-9);
        assert!(table[&MINUTE].open.is_finite());
    }

    #[test]
    fn interpolate_steps_linearly_across_a_multi_row_gap() {
        let mut table = CandleTable::new();
        table.insert(0, candle(0, 100.0, true));
        for i in 1..=3 {
            table.insert(i * MINUTE, candle(i * MINUTE, f64::NAN, true));
        }
        table.insert(4 * MINUTE, candle(4 * MINUTE, 108.0, true));

        interpolate(&mut table);
        assert!((table[&MINUTE].close - 102.0).abs() < 1e-9);
        assert!((table[&(2 * MINUTE)].close - 104.0).abs() < 1e-9);
        assert!((table[&(3 * MINUTE)].close - 106.0).abs() < 1e-9);
        // The anchors themselves are untouched.
        assert!((table[&0].close - 100.0).abs() < 1e-9);
        assert!((table[&(4 * MINUTE)].close - 108.0).abs() < 1e-9);
    }

    #[test]
    fn interpolate_holds_trailing_values() {
        let mut table = CandleTable::new();
        table.insert(0, candle(0, 100.0, true));
        table.insert(MINUTE, candle(MINUTE, f64::NAN, false));

        interpolate(&mut table);
        assert!((table[&MINUTE].close - 100.0).abs() < 1e-9);
    }

    #[test]
    fn symbols_ingest_in_parallel_without_interference() {
        let store = Arc::new(CandleStore::new(MINUTE));
        let mut handles = Vec::new();
        for (sym, base) in [("BTCUSDT", 100.0), ("ETHUSDT", 2000.0), ("SOLUSDT", 30.0)] {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    store.ingest_candle(sym, candle(i * MINUTE, base + i as f64, true));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for sym in ["BTCUSDT", "ETHUSDT", "SOLUSDT"] {
            assert_eq!(store.snapshot(sym).len(), 200);
        }
    }
}
