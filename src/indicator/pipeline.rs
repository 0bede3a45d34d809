// =============================================================================
// Indicator Pipeline — scripted indicator computation over candle snapshots
// =============================================================================
//
// User strategy scripts run against immutable candle snapshots on a dedicated
// thread pool, one symbol per task.  The script reads the candle columns and
// writes named series into an `out` map; every entry becomes one indicator
// series keyed `(category, label)` from a `"Category:Label"` string.
//
// A script failure (compile or runtime) is confined to its symbol: other
// symbols in the same batch still produce fresh tables, and the previously
// published table for the failing symbol stays visible.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;
use rhai::{Dynamic, Engine, Scope, AST};
use tracing::debug;

use crate::error::EngineError;
use crate::indicator::functions;
use crate::market_data::{interpolate, CandleTable};
use crate::types::Candle;

/// Category used when a script output key carries no `Category:` prefix.
const DEFAULT_CATEGORY: &str = "Abstract";

/// Operation ceiling per script evaluation, so a runaway script cannot stall
/// a worker thread forever.
const MAX_SCRIPT_OPS: u64 = 25_000_000;

// ---------------------------------------------------------------------------
// Output tables
// ---------------------------------------------------------------------------

/// Indicator series for one symbol, index-aligned with `open_times`.
#[derive(Debug, Clone, Default)]
pub struct IndicatorTable {
    pub open_times: Vec<i64>,
    pub series: BTreeMap<(String, String), Vec<f64>>,
}

impl IndicatorTable {
    pub fn get(&self, category: &str, label: &str) -> Option<&[f64]> {
        self.series
            .get(&(category.to_string(), label.to_string()))
            .map(Vec::as_slice)
    }
}

/// Published indicator tables, one per symbol, swapped whole on each
/// recomputation so readers never observe a half-updated table.
pub struct IndicatorSet {
    tables: RwLock<HashMap<String, Arc<IndicatorTable>>>,
}

impl IndicatorSet {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn replace(&self, symbol: &str, table: IndicatorTable) {
        self.tables
            .write()
            .insert(symbol.to_string(), Arc::new(table));
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<IndicatorTable>> {
        self.tables.read().get(symbol).cloned()
    }
}

impl Default for IndicatorSet {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A strategy script compiled once and evaluated once per symbol per cycle.
#[derive(Debug)]
pub struct CompiledScript {
    ast: AST,
}

pub struct IndicatorPipeline {
    pool: rayon::ThreadPool,
    engine: Engine,
}

impl IndicatorPipeline {
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("indicator-{i}"))
            .build()
            .expect("failed to build indicator thread pool");

        let mut engine = Engine::new();
        engine.set_max_operations(MAX_SCRIPT_OPS);
        engine.register_fn("sma", script_sma);
        engine.register_fn("ema", script_ema);
        engine.register_fn("rsi", script_rsi);

        Self { pool, engine }
    }

    /// Compile a script once for reuse across symbols and cycles.
    pub fn compile(&self, script: &str) -> Result<CompiledScript, EngineError> {
        let ast = self
            .engine
            .compile(script)
            .map_err(|e| EngineError::Script {
                symbol: "*".to_string(),
                message: e.to_string(),
            })?;
        Ok(CompiledScript { ast })
    }

    /// Evaluate `script` against each symbol's snapshot in parallel.
    ///
    /// Returns one result per input symbol; failures carry the symbol so the
    /// caller can keep that symbol's previous table and surface the error.
    pub fn compute(
        &self,
        snapshots: &HashMap<String, CandleTable>,
        script: &CompiledScript,
        interval_ms: i64,
    ) -> HashMap<String, Result<IndicatorTable, EngineError>> {
        self.pool.install(|| {
            snapshots
                .par_iter()
                .map(|(symbol, table)| {
                    let result = self.run_symbol(symbol, table, script, interval_ms);
                    (symbol.clone(), result)
                })
                .collect()
        })
    }

    fn run_symbol(
        &self,
        symbol: &str,
        table: &CandleTable,
        script: &CompiledScript,
        interval_ms: i64,
    ) -> Result<IndicatorTable, EngineError> {
        if table.is_empty() {
            return Ok(IndicatorTable::default());
        }

        // Work on a copy extended with a sentinel row one interval past the
        // newest candle.  The sentinel gives window functions a stable forward
        // edge; it is stripped from every output before publication.
        let mut working = table.clone();
        let last_open = *working.keys().next_back().unwrap_or(&0);
        let sentinel_open = last_open + interval_ms;
        working.insert(
            sentinel_open,
            Candle {
                open_time: sentinel_open,
                open: f64::NAN,
                high: f64::NAN,
                low: f64::NAN,
                close: f64::NAN,
                volume: f64::NAN,
                is_closed: false,
            },
        );
        interpolate(&mut working);

        let padded_rows = working.len();
        let rows = padded_rows - 1;

        let times: Vec<Dynamic> = working.keys().map(|t| Dynamic::from(*t)).collect();
        let column = |f: fn(&Candle) -> f64| -> Vec<Dynamic> {
            working.values().map(|c| Dynamic::from(f(c))).collect()
        };

        let mut scope = Scope::new();
        scope.push("symbol", symbol.to_string());
        scope.push("times", rhai::Array::from(times));
        scope.push("opens", rhai::Array::from(column(|c| c.open)));
        scope.push("highs", rhai::Array::from(column(|c| c.high)));
        scope.push("lows", rhai::Array::from(column(|c| c.low)));
        scope.push("closes", rhai::Array::from(column(|c| c.close)));
        scope.push("volumes", rhai::Array::from(column(|c| c.volume)));
        scope.push("out", rhai::Map::new());

        self.engine
            .run_ast_with_scope(&mut scope, &script.ast)
            .map_err(|e| EngineError::Script {
                symbol: symbol.to_string(),
                message: e.to_string(),
            })?;

        let out: rhai::Map = scope.get_value("out").unwrap_or_default();

        let mut series = BTreeMap::new();
        for (key, value) in out {
            let (category, label) = split_series_key(key.as_str());
            let mut values = dynamic_to_series(&value, padded_rows);
            values.truncate(rows); // drop the sentinel position
            series.insert((category, label), values);
        }

        let open_times: Vec<i64> = table.keys().copied().collect();
        debug!(symbol, rows, series = series.len(), "indicator table computed");
        Ok(IndicatorTable { open_times, series })
    }
}

impl Default for IndicatorPipeline {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Script-visible helpers
// ---------------------------------------------------------------------------

fn array_to_f64(values: &rhai::Array) -> Vec<f64> {
    values.iter().map(dynamic_to_f64).collect()
}

fn dynamic_to_f64(value: &Dynamic) -> f64 {
    if let Ok(f) = value.as_float() {
        f
    } else if let Ok(i) = value.as_int() {
        i as f64
    } else {
        f64::NAN
    }
}

fn f64_to_array(values: Vec<f64>) -> rhai::Array {
    values.into_iter().map(Dynamic::from).collect()
}

fn script_sma(values: rhai::Array, period: i64) -> rhai::Array {
    f64_to_array(functions::sma(&array_to_f64(&values), period.max(0) as usize))
}

fn script_ema(values: rhai::Array, period: i64) -> rhai::Array {
    f64_to_array(functions::ema(&array_to_f64(&values), period.max(0) as usize))
}

fn script_rsi(values: rhai::Array, period: i64) -> rhai::Array {
    f64_to_array(functions::rsi(&array_to_f64(&values), period.max(0) as usize))
}

// ---------------------------------------------------------------------------
// Output conversion
// ---------------------------------------------------------------------------

/// Split an output key into `(category, label)`.  Keys without a colon get
/// the default category.
fn split_series_key(key: &str) -> (String, String) {
    match key.split_once(':') {
        Some((category, label)) => (category.trim().to_string(), label.trim().to_string()),
        None => (DEFAULT_CATEGORY.to_string(), key.trim().to_string()),
    }
}

/// Convert a script output value to a row-aligned series.  Arrays are padded
/// or truncated to `rows`; scalars broadcast to every row.
fn dynamic_to_series(value: &Dynamic, rows: usize) -> Vec<f64> {
    if let Some(array) = value.read_lock::<rhai::Array>() {
        let mut out = array_to_f64(&array);
        out.resize(rows, f64::NAN);
        return out;
    }
    vec![dynamic_to_f64(value); rows]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
