// =============================================================================
// Stream Manager — resilient websocket subscriptions with gap repair
// =============================================================================
//
// One tokio task per (symbol, channel) subscription.  Each task owns its
// connection lifecycle: connect, gap-fill candle history over REST, go live,
// and on any failure back off geometrically and reconnect.  Duplicate and
// out-of-order messages are dropped by event id so that reconnect overlap
// never double-applies an update.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::exchange::ApiClient;
use crate::market_data::candle_store::CandleStore;
use crate::market_data::ticker::TickerBoard;
use crate::types::{AggTrade, BookTicker, Candle, ConnectionState, MarkPrice};

const STREAM_BASE_URL: &str = "wss://fstream.binance.com/ws";

/// Reconnect backoff: base doubles per consecutive failure, capped.
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CEILING: Duration = Duration::from_secs(60);

/// Max rows per kline backfill request.
const BACKFILL_LIMIT: u32 = 1000;

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    Kline,
    AggTrade,
    BookTicker,
    MarkPrice,
}

impl Channel {
    /// Stream-name suffix as used in the websocket URL.
    pub fn suffix(&self) -> &'static str {
        match self {
            Channel::Kline => "kline_1m",
            Channel::AggTrade => "aggTrade",
            Channel::BookTicker => "bookTicker",
            Channel::MarkPrice => "markPrice",
        }
    }

    pub const ALL: [Channel; 4] = [
        Channel::Kline,
        Channel::AggTrade,
        Channel::BookTicker,
        Channel::MarkPrice,
    ];
}

/// Canonical stream key, e.g. `btcusdt@kline_1m`.
pub fn stream_key(symbol: &str, channel: Channel) -> String {
    format!("{}@{}", symbol.to_lowercase(), channel.suffix())
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

pub struct Subscription {
    pub symbol: String,
    pub channel: Channel,
    state: RwLock<ConnectionState>,
    /// Wall-clock ms of the last accepted message (0 = none yet).
    last_message_ms: AtomicI64,
    /// Highest event id accepted (trade id, book update id, or event time).
    last_event_id: AtomicU64,
    /// Open time of the last kline seen, for desync detection.
    last_kline_open: AtomicI64,
}

impl Subscription {
    fn new(symbol: &str, channel: Channel) -> Self {
        Self {
            symbol: symbol.to_string(),
            channel,
            state: RwLock::new(ConnectionState::Connecting),
            last_message_ms: AtomicI64::new(0),
            last_event_id: AtomicU64::new(0),
            last_kline_open: AtomicI64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Accept `event_id` only if it advances past everything already applied.
    /// Single writer per subscription, so load + store is race-free.
    fn accept_event(&self, event_id: u64) -> bool {
        if event_id <= self.last_event_id.load(Ordering::Acquire) {
            return false;
        }
        self.last_event_id.store(event_id, Ordering::Release);
        self.last_message_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        true
    }
}

/// Point-in-time view of one subscription, for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatus {
    pub stream: String,
    pub symbol: String,
    pub channel: Channel,
    pub state: ConnectionState,
    /// Milliseconds since the last accepted message, if any arrived yet.
    pub last_message_age_ms: Option<i64>,
}

// ---------------------------------------------------------------------------
// StreamManager
// ---------------------------------------------------------------------------

pub struct StreamManager {
    client: Arc<ApiClient>,
    store: Arc<CandleStore>,
    tickers: Arc<TickerBoard>,
    subs: RwLock<HashMap<String, Arc<Subscription>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl StreamManager {
    pub fn new(
        client: Arc<ApiClient>,
        store: Arc<CandleStore>,
        tickers: Arc<TickerBoard>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            client,
            store,
            tickers,
            subs: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Start one subscription.  A second call with the same (symbol, channel)
    /// is a no-op.
    pub fn subscribe(self: &Arc<Self>, symbol: &str, channel: Channel) {
        let key = stream_key(symbol, channel);
        let sub = {
            let mut subs = self.subs.write();
            if subs.contains_key(&key) {
                return;
            }
            let sub = Arc::new(Subscription::new(symbol, channel));
            subs.insert(key.clone(), sub.clone());
            sub
        };

        info!(stream = %key, "subscribing");
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager.run_subscription(sub).await;
        });
        self.tasks.lock().push(handle);
    }

    /// Subscribe every market-data channel for `symbol`.
    pub fn subscribe_symbol(self: &Arc<Self>, symbol: &str) {
        for channel in Channel::ALL {
            self.subscribe(symbol, channel);
        }
    }

    /// Snapshot of every subscription, sorted by stream key.
    pub fn status(&self) -> Vec<SubscriptionStatus> {
        let now = Utc::now().timestamp_millis();
        let subs = self.subs.read();
        let mut out: Vec<SubscriptionStatus> = subs
            .iter()
            .map(|(key, sub)| {
                let last = sub.last_message_ms.load(Ordering::Acquire);
                SubscriptionStatus {
                    stream: key.clone(),
                    symbol: sub.symbol.clone(),
                    channel: sub.channel,
                    state: sub.state(),
                    last_message_age_ms: (last > 0).then(|| now - last),
                }
            })
            .collect();
        out.sort_by(|a, b| a.stream.cmp(&b.stream));
        out
    }

    /// Signal every subscription task to stop.  Safe to call more than once;
    /// states move to `Closed` and stay there, and a task subscribed after
    /// this call sees the flag and exits at once.
    pub fn close_all(&self) {
        // send_replace updates the value even with no receiver alive.
        self.shutdown.send_replace(true);
        let subs = self.subs.read();
        for sub in subs.values() {
            sub.set_state(ConnectionState::Closed);
        }
        info!(count = subs.len(), "all streams closed");
    }

    /// Close every stream, then wait up to `grace` for the subscription tasks
    /// to finish their in-flight work (an ongoing gap backfill included).
    /// Returns `true` when everything joined in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.close_all();
        let handles: Vec<tokio::task::JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        match tokio::time::timeout(grace, drain).await {
            Ok(()) => true,
            Err(_) => {
                warn!("grace period elapsed with stream tasks still running");
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    async fn run_subscription(self: Arc<Self>, sub: Arc<Subscription>) {
        let key = stream_key(&sub.symbol, sub.channel);
        let url = format!("{STREAM_BASE_URL}/{key}");
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            sub.set_state(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });

            let ws_stream = match connect_async(&url).await {
                Ok((ws, _response)) => ws,
                Err(e) => {
                    let delay = reconnect_delay(attempt);
                    warn!(stream = %key, error = %e, delay_ms = delay.as_millis() as u64,
                        "websocket connect failed");
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown_rx.changed() => break,
                    }
                }
            };

            info!(stream = %key, "websocket connected");

            // Candle continuity is repaired before the stream goes live so a
            // snapshot taken after reconnect never shows a hole.
            if sub.channel == Channel::Kline {
                if let Some(last) = self.store.last_open_time(&sub.symbol) {
                    let now = Utc::now().timestamp_millis();
                    if let Some((from, to)) = gap_range(last, now, self.store.interval_ms()) {
                        self.fill_gap(&sub.symbol, from, to).await;
                    }
                }
            }

            sub.set_state(ConnectionState::Live);
            attempt = 0;

            let (_write, mut read) = ws_stream.split();
            let reconnect = loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break false,
                    msg = read.next() => match msg {
                        Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                            if let Err(e) = self.handle_message(&sub, &text).await {
                                warn!(stream = %key, error = %e, "failed to handle message");
                            }
                        }
                        // Ping/pong/binary frames are handled by tungstenite.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(stream = %key, error = %e, "websocket read error");
                            break true;
                        }
                        None => {
                            warn!(stream = %key, "websocket stream ended");
                            break true;
                        }
                    }
                }
            };

            if !reconnect {
                break;
            }
            sub.set_state(ConnectionState::Reconnecting);
            attempt += 1;
            let delay = reconnect_delay(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        sub.set_state(ConnectionState::Closed);
        debug!(stream = %key, "subscription task finished");
    }

    async fn handle_message(&self, sub: &Subscription, text: &str) -> Result<()> {
        let root: serde_json::Value =
            serde_json::from_str(text).context("failed to parse stream JSON")?;

        match sub.channel {
            Channel::Kline => {
                let event_time = root["E"].as_u64().context("missing field E")?;
                if !sub.accept_event(event_time) {
                    return Ok(());
                }
                let candle = parse_kline(&root)?;

                // A jump of more than one interval means the exchange skipped
                // updates while we were connected; repair before applying.
                let prev = sub.last_kline_open.load(Ordering::Acquire);
                let interval = self.store.interval_ms();
                if prev != 0 && candle.open_time > prev + interval {
                    let desync = EngineError::StreamDesync {
                        symbol: sub.symbol.clone(),
                        detail: format!(
                            "kline open_time jumped from {prev} to {}",
                            candle.open_time
                        ),
                    };
                    warn!(error = %desync, "backfilling skipped interval(s)");
                    self.fill_gap(&sub.symbol, prev + interval, candle.open_time - 1)
                        .await;
                }
                sub.last_kline_open.store(candle.open_time, Ordering::Release);
                self.store.ingest_candle(&sub.symbol, candle);
            }
            Channel::AggTrade => {
                let trade = parse_agg_trade(&root)?;
                if !sub.accept_event(trade.trade_id) {
                    return Ok(());
                }
                self.store.ingest_trade(&sub.symbol, &trade);
            }
            Channel::BookTicker => {
                let ticker = parse_book_ticker(&root)?;
                if !sub.accept_event(ticker.update_id) {
                    return Ok(());
                }
                self.tickers.update_book(&sub.symbol, ticker);
            }
            Channel::MarkPrice => {
                let event_time = root["E"].as_u64().context("missing field E")?;
                if !sub.accept_event(event_time) {
                    return Ok(());
                }
                let mark = parse_mark_price(&root)?;
                self.tickers.update_mark(&sub.symbol, mark);
            }
        }
        Ok(())
    }

    /// Download `[from, to]` candle history over REST and merge it.  The merge
    /// rule makes overlap with live stream data harmless.
    async fn fill_gap(&self, symbol: &str, from: i64, to: i64) {
        let interval = self.store.interval_ms();
        let mut cursor = from;
        while cursor <= to {
            match self
                .client
                .get_klines(symbol, Some(cursor), Some(to), BACKFILL_LIMIT)
                .await
            {
                Ok(candles) => {
                    let Some(last) = candles.last().map(|c| c.open_time) else {
                        break;
                    };
                    let merged = self.store.ingest_candles(symbol, candles);
                    debug!(symbol, from = cursor, to, merged, "gap backfill chunk");
                    cursor = last + interval;
                }
                Err(e) => {
                    warn!(symbol, error = %e, "gap backfill failed, will retry on next reconnect");
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

fn reconnect_delay(attempt: u32) -> Duration {
    RECONNECT_BASE
        .saturating_mul(1u32 << attempt.min(6))
        .min(RECONNECT_CEILING)
}

/// Inclusive candle range still missing after the newest stored open time,
/// or `None` when the store is already current.
fn gap_range(last_open: i64, now_ms: i64, interval_ms: i64) -> Option<(i64, i64)> {
    let current_bucket = now_ms - now_ms.rem_euclid(interval_ms);
    if last_open >= current_bucket {
        return None;
    }
    // Re-fetch from the last stored candle: it may have still been open when
    // last seen, and the merge rule discards anything already closed.
    Some((last_open, current_bucket))
}

// ---------------------------------------------------------------------------
// Message parsing
// ---------------------------------------------------------------------------

/// Binance sends numeric values as JSON strings inside stream payloads.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Parse a kline event.
///
/// Expected shape:
/// ```json
/// { "e": "kline", "E": 1700000000100, "s": "BTCUSDT", "k": { ... } }
/// ```
fn parse_kline(root: &serde_json::Value) -> Result<Candle> {
    let k = &root["k"];
    Ok(Candle {
        open_time: k["t"].as_i64().context("missing field k.t")?,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
        is_closed: k["x"].as_bool().context("missing field k.x")?,
    })
}

/// Parse an aggTrade event (`a` = aggregate trade id, `T` = trade time).
fn parse_agg_trade(root: &serde_json::Value) -> Result<AggTrade> {
    Ok(AggTrade {
        trade_id: root["a"].as_u64().context("missing field a")?,
        price: parse_string_f64(&root["p"], "p")?,
        quantity: parse_string_f64(&root["q"], "q")?,
        timestamp: root["T"].as_i64().context("missing field T")?,
    })
}

/// Parse a bookTicker event (`u` = order book update id).
fn parse_book_ticker(root: &serde_json::Value) -> Result<BookTicker> {
    Ok(BookTicker {
        bid_price: parse_string_f64(&root["b"], "b")?,
        bid_quantity: parse_string_f64(&root["B"], "B")?,
        ask_price: parse_string_f64(&root["a"], "a")?,
        ask_quantity: parse_string_f64(&root["A"], "A")?,
        update_id: root["u"].as_u64().context("missing field u")?,
    })
}

/// Parse a markPriceUpdate event.
fn parse_mark_price(root: &serde_json::Value) -> Result<MarkPrice> {
    Ok(MarkPrice {
        mark_price: parse_string_f64(&root["p"], "p")?,
        event_time: root["E"].as_i64().context("missing field E")?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
