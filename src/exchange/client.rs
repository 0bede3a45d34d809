// =============================================================================
// Rate-Limited REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// Every call goes through `request`, which:
//   1. Consults the rate-limit ledger and sleeps until the relevant bucket
//      resets when the projected spend would exceed a usable ceiling.  The
//      client never fires a best-effort request that could get the account
//      banned.
//   2. Retries transport failures a bounded number of times with jittered
//      exponential backoff.
//   3. Feeds the response headers back into the ledger — the only source of
//      truth for observed usage.
//   4. Records an (endpoint, duration) timing sample for the status display.
//
// SECURITY: the secret key is never logged or serialised.  Signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift; a measured server-time offset is applied on top.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::Rng;
use reqwest::Method;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::ApiKeys;
use crate::error::EngineError;
use crate::exchange::rate_limit::{parse_rate_limits, RateLimitLedger};
use crate::timing::TaskTimings;
use crate::types::Candle;

type HmacSha256 = Hmac<Sha256>;

/// recvWindow sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;
/// Transport failures are retried at most this many times.
const MAX_TRANSPORT_RETRIES: u32 = 3;
/// First transport-retry delay; doubles per attempt.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Transport-retry delay ceiling.
const BACKOFF_CEILING: Duration = Duration::from_secs(8);
/// Candle interval requested from the klines endpoint.
const KLINE_INTERVAL: &str = "1m";

/// Request weight charged per endpoint family.  Unknown paths are charged
/// the default weight of 1; the ledger headroom absorbs the imprecision.
fn weight_for(path: &str) -> u32 {
    if path.ends_with("/exchangeInfo") {
        10
    } else if path.ends_with("/klines") {
        5
    } else if path.ends_with("/allOpenOrders") {
        1
    } else {
        1
    }
}

fn is_order_path(path: &str) -> bool {
    path.ends_with("/order") || path.ends_with("/allOpenOrders")
}

/// Jittered exponential backoff delay for transport retry `attempt`
/// (0-based).
fn transport_backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(BACKOFF_CEILING);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    exp + jitter
}

/// REST client that self-throttles against the exchange's declared limits.
pub struct ApiClient {
    keys: RwLock<ApiKeys>,
    base_url: String,
    http: reqwest::Client,
    limits: Arc<RateLimitLedger>,
    timings: Arc<TaskTimings>,
    /// Measured server-minus-local clock offset in milliseconds.
    time_offset_ms: AtomicI64,
}

impl ApiClient {
    pub fn new(keys: ApiKeys, limits: Arc<RateLimitLedger>, timings: Arc<TaskTimings>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("api client initialised (base_url=https://fapi.binance.com)");

        Self {
            keys: RwLock::new(keys),
            base_url: "https://fapi.binance.com".to_string(),
            http,
            limits,
            timings,
            time_offset_ms: AtomicI64::new(0),
        }
    }

    /// Replace the API credentials at runtime.
    pub fn set_keys(&self, keys: ApiKeys) {
        *self.keys.write() = keys;
        debug!("api credentials replaced");
    }

    pub fn limits(&self) -> &Arc<RateLimitLedger> {
        &self.limits
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let secret = self.keys.read().secret.clone();
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current exchange timestamp: local clock plus the measured offset.
    fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    /// Full query string for a signed request (appends timestamp, recvWindow,
    /// and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = self.timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Core request path
    // -------------------------------------------------------------------------

    /// Issue one REST call with throttling, bounded transport retries, and
    /// ledger feedback.
    ///
    /// Error contract:
    ///   - `Transport` after the retry budget is exhausted.
    ///   - `RateLimitExceeded` when the server answers 429/418 — the caller
    ///     must defer, the client does not spin on it.
    ///   - `Exchange` for any other non-2xx, carrying the structured
    ///     `{code, msg}` body.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        payload: &[(&str, String)],
        signed: bool,
    ) -> Result<serde_json::Value, EngineError> {
        let weight = weight_for(path);
        let mut spends: Vec<(&str, u32)> = vec![("REQUEST_WEIGHT", weight)];
        if is_order_path(path) {
            spends.push(("ORDERS", 1));
        }

        // Pre-flight: reserve the spend or wait out the blocking bucket.  The
        // reservation is atomic in the ledger, so concurrent callers cannot
        // jointly overrun a nearly-full bucket; the loop re-checks after the
        // wait because another task may have claimed the freed budget.
        loop {
            match self.limits.try_reserve(&spends) {
                Some((bucket, wait)) => {
                    warn!(%bucket, wait_ms = wait.as_millis() as u64, %path, "throttling until bucket reset");
                    tokio::time::sleep(wait.max(Duration::from_millis(50))).await;
                }
                None => break,
            }
        }

        let params: String = payload
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let query = if signed {
            self.signed_query(&params)
        } else {
            params
        };
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let mut attempt = 0u32;
        let response = loop {
            let mut builder = self.http.request(method.clone(), &url);
            if signed {
                builder = builder.header("X-MBX-APIKEY", self.keys.read().api_key.clone());
            }

            let started = Instant::now();
            match builder.send().await {
                Ok(resp) => {
                    self.timings
                        .record(path, started.elapsed().as_secs_f64());
                    break resp;
                }
                Err(e) if attempt < MAX_TRANSPORT_RETRIES => {
                    let delay = transport_backoff(attempt);
                    warn!(
                        %path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transport failure — retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        // The echoed usage headers are the only source of truth for limits.
        self.limits.update_from_headers(response.headers());

        let status = response.status();

        if status.as_u16() == 429 || status.as_u16() == 418 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(60));
            warn!(%path, status = status.as_u16(), retry_after_s = retry_after.as_secs(), "server-side rate limit hit");
            return Err(EngineError::RateLimitExceeded {
                bucket: "server-reported".to_string(),
                retry_after,
            });
        }

        let body: serde_json::Value = response.json().await.map_err(EngineError::from)?;

        if !status.is_success() {
            let code = body["code"].as_i64().unwrap_or(0);
            let message = body["msg"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string());
            return Err(EngineError::Exchange {
                status: status.as_u16(),
                code,
                message,
            });
        }

        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Time correction
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/time — the exchange's clock in epoch milliseconds.
    pub async fn get_server_time(&self) -> Result<i64, EngineError> {
        let body = self.request(Method::GET, "/fapi/v1/time", &[], false).await?;
        body["serverTime"].as_i64().ok_or(EngineError::Exchange {
            status: 200,
            code: 0,
            message: "time response missing serverTime".to_string(),
        })
    }

    /// Measure the server-minus-local clock offset and apply it to all
    /// subsequent signed requests.  Returns the measured offset.
    pub async fn sync_time(&self) -> Result<i64, EngineError> {
        let before = Utc::now().timestamp_millis();
        let server = self.get_server_time().await?;
        let after = Utc::now().timestamp_millis();
        let midpoint = before + (after - before) / 2;
        let offset = server - midpoint;
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        debug!(offset_ms = offset, "server clock offset measured");
        Ok(offset)
    }

    /// Round-trip time of the cheapest endpoint, for the status display.
    pub async fn ping(&self) -> Result<Duration, EngineError> {
        let started = Instant::now();
        self.request(Method::GET, "/fapi/v1/ping", &[], false).await?;
        Ok(started.elapsed())
    }

    // -------------------------------------------------------------------------
    // Rate-limit refresh
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/exchangeInfo — refresh declared limits in the ledger.
    /// Returns the number of limit specs installed.
    pub async fn refresh_limits(&self) -> Result<usize, EngineError> {
        let body = self
            .request(Method::GET, "/fapi/v1/exchangeInfo", &[], false)
            .await?;
        let specs = parse_rate_limits(&body);
        self.limits.apply_limits(&specs);
        debug!(count = specs.len(), "declared rate limits refreshed");
        Ok(specs.len())
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/klines — 1-minute candles, optionally bounded by
    /// `[start_time, end_time]` (epoch milliseconds, inclusive).
    pub async fn get_klines(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Candle>, EngineError> {
        let mut payload: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_string()),
            ("interval", KLINE_INTERVAL.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(start) = start_time {
            payload.push(("startTime", start.to_string()));
        }
        if let Some(end) = end_time {
            payload.push(("endTime", end.to_string()));
        }

        let body = self
            .request(Method::GET, "/fapi/v1/klines", &payload, false)
            .await?;

        let now_ms = Utc::now().timestamp_millis();
        parse_klines(&body, now_ms)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order (signed) — submit a new order.
    pub async fn submit_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        quantity: f64,
        price: Option<f64>,
        time_in_force: Option<&str>,
    ) -> Result<serde_json::Value, EngineError> {
        let client_order_id = format!("meridian-{}", uuid::Uuid::new_v4().simple());
        let mut payload: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("type", order_type.to_string()),
            ("quantity", quantity.to_string()),
            ("newClientOrderId", client_order_id),
        ];
        if let Some(p) = price {
            payload.push(("price", p.to_string()));
        }
        if let Some(tif) = time_in_force {
            payload.push(("timeInForce", tif.to_string()));
        }

        debug!(symbol, side, order_type, quantity, "submitting order");
        self.request(Method::POST, "/fapi/v1/order", &payload, true)
            .await
    }

    /// DELETE /fapi/v1/allOpenOrders (signed) — cancel every open order on
    /// one market.
    pub async fn cancel_symbol_orders(
        &self,
        symbol: &str,
    ) -> Result<serde_json::Value, EngineError> {
        let payload: Vec<(&str, String)> = vec![("symbol", symbol.to_string())];
        debug!(symbol, "cancelling all open orders");
        self.request(Method::DELETE, "/fapi/v1/allOpenOrders", &payload, true)
            .await
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("keys", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Parse the klines array-of-arrays response format.
///
/// Array indices:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] closeTime, ...
///
/// A candle whose close time has not fully elapsed at `now_ms` is still
/// open.
fn parse_klines(body: &serde_json::Value, now_ms: i64) -> Result<Vec<Candle>, EngineError> {
    let raw = body.as_array().ok_or(EngineError::Exchange {
        status: 200,
        code: 0,
        message: "klines response is not an array".to_string(),
    })?;

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        let Some(arr) = entry.as_array() else {
            continue;
        };
        if arr.len() < 7 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }

        let open_time = arr[0].as_i64().unwrap_or(0);
        let close_time = arr[6].as_i64().unwrap_or(0);
        candles.push(Candle {
            open_time,
            open: parse_str_f64(&arr[1]),
            high: parse_str_f64(&arr[2]),
            low: parse_str_f64(&arr[3]),
            close: parse_str_f64(&arr[4]),
            volume: parse_str_f64(&arr[5]),
            is_closed: close_time <= now_ms,
        });
    }
    Ok(candles)
}

/// The exchange sends numeric values as JSON strings; accept either form.
fn parse_str_f64(val: &serde_json::Value) -> f64 {
    if let Some(s) = val.as_str() {
        s.parse::<f64>().unwrap_or(f64::NAN)
    } else {
        val.as_f64().unwrap_or(f64::NAN)
    }
}
