// =============================================================================
// Rate-Limit Ledger — server-reported usage counters per bucket
// =============================================================================
//
// The exchange enforces several independent rate-limit buckets (request
// weight per minute, order counts per 10 s / per day, ...).  The ledger
// mirrors them as `UsageCounter` entries keyed by `LIMIT_NAME:interval`
// (e.g. `REQUEST_WEIGHT:1m`).
//
// Two hard rules:
//   - Spend is reserved optimistically at send time and the reservation is
//     atomic with the ceiling check, so concurrent callers can never jointly
//     pass a nearly-full bucket.  The headers the exchange echoes back
//     (`X-MBX-USED-WEIGHT-1M`, `X-MBX-ORDER-COUNT-10S`, ...) then overwrite
//     the reserved counts with the server's view.
//   - Declared limits come from the periodic exchange-info call; the boot
//     values below are placeholders until the first refresh.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Fraction of a declared limit we refuse to go beyond, in percent.  Staying
/// under the declared ceiling keeps header-update races from producing a ban.
const HEADROOM_PCT: u32 = 95;

/// One rate-limit bucket mirrored from the exchange.
#[derive(Debug, Clone, Serialize)]
pub struct UsageCounter {
    /// Exchange limit family, e.g. `REQUEST_WEIGHT` or `ORDERS`.
    pub limit_name: String,
    /// Length of the bucket's window.
    #[serde(skip)]
    pub interval: Duration,
    /// Usage observed in the current window (from response headers).
    pub count: u32,
    /// Declared ceiling for the window (from exchange info).
    pub limit: u32,
    /// When the current window rolls over.
    pub reset_time: DateTime<Utc>,
}

impl UsageCounter {
    /// Usable budget after the safety headroom is applied.
    fn effective_limit(&self) -> u32 {
        (self.limit as u64 * HEADROOM_PCT as u64 / 100) as u32
    }
}

/// A declared limit parsed out of the exchange-info payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitSpec {
    pub rate_limit_type: String,
    pub interval: String,
    pub interval_num: u32,
    pub limit: u32,
}

impl LimitSpec {
    /// Window length of this limit.
    pub fn window(&self) -> Duration {
        let unit = match self.interval.as_str() {
            "SECOND" => 1,
            "MINUTE" => 60,
            "HOUR" => 3600,
            "DAY" => 86_400,
            _ => 60,
        };
        Duration::from_secs(unit * self.interval_num as u64)
    }

    /// Bucket key, e.g. `REQUEST_WEIGHT:1m`.
    pub fn bucket_key(&self) -> String {
        let suffix = match self.interval.as_str() {
            "SECOND" => "s",
            "MINUTE" => "m",
            "HOUR" => "h",
            "DAY" => "d",
            _ => "m",
        };
        format!("{}:{}{}", self.rate_limit_type, self.interval_num, suffix)
    }
}

/// Parse the `rateLimits` array of an exchange-info response.
pub fn parse_rate_limits(body: &serde_json::Value) -> Vec<LimitSpec> {
    body["rateLimits"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| serde_json::from_value::<LimitSpec>(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse a bucket-interval suffix like `1m` / `10s` / `1d` into a window.
fn parse_interval_suffix(suffix: &str) -> Option<Duration> {
    if suffix.len() < 2 {
        return None;
    }
    let (num, unit) = suffix.split_at(suffix.len() - 1);
    let num: u64 = num.parse().ok()?;
    let secs = match unit {
        "s" | "S" => 1,
        "m" | "M" => 60,
        "h" | "H" => 3600,
        "d" | "D" => 86_400,
        _ => return None,
    };
    Some(Duration::from_secs(num * secs))
}

/// Total spend requested against one limit family.
fn spend_for(limit_name: &str, spends: &[(&str, u32)]) -> u32 {
    spends
        .iter()
        .filter(|(name, _)| *name == limit_name)
        .map(|(_, weight)| *weight)
        .sum()
}

/// Next window boundary for a bucket with window `interval`, computed on the
/// UTC epoch grid the exchange uses.
fn next_reset(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let interval_ms = interval.as_millis() as i64;
    if interval_ms <= 0 {
        return now;
    }
    let now_ms = now.timestamp_millis();
    let boundary = now_ms - now_ms.rem_euclid(interval_ms) + interval_ms;
    DateTime::from_timestamp_millis(boundary).unwrap_or(now)
}

// =============================================================================
// RateLimitLedger
// =============================================================================

/// Thread-safe ledger of every known bucket.  Updates to one bucket are
/// serialised by that bucket's own mutex so concurrent responses never race.
pub struct RateLimitLedger {
    buckets: RwLock<HashMap<String, Arc<Mutex<UsageCounter>>>>,
}

impl RateLimitLedger {
    /// Ledger seeded with conservative boot defaults for the USDT-margined
    /// futures API.  Real limits replace these on the first exchange-info
    /// refresh.
    pub fn new() -> Self {
        let ledger = Self {
            buckets: RwLock::new(HashMap::new()),
        };
        ledger.apply_limits(&[
            LimitSpec {
                rate_limit_type: "REQUEST_WEIGHT".into(),
                interval: "MINUTE".into(),
                interval_num: 1,
                limit: 2400,
            },
            LimitSpec {
                rate_limit_type: "ORDERS".into(),
                interval: "SECOND".into(),
                interval_num: 10,
                limit: 300,
            },
            LimitSpec {
                rate_limit_type: "ORDERS".into(),
                interval: "MINUTE".into(),
                interval_num: 1,
                limit: 1200,
            },
        ]);
        ledger
    }

    /// Install or refresh declared limits.  Observed counts survive a
    /// refresh; only the ceiling changes.
    pub fn apply_limits(&self, specs: &[LimitSpec]) {
        let mut map = self.buckets.write();
        for spec in specs {
            let key = spec.bucket_key();
            match map.get(&key) {
                Some(bucket) => {
                    let mut counter = bucket.lock();
                    if counter.limit != spec.limit {
                        debug!(bucket = %key, old = counter.limit, new = spec.limit, "declared limit changed");
                    }
                    counter.limit = spec.limit;
                    counter.interval = spec.window();
                }
                None => {
                    map.insert(
                        key.clone(),
                        Arc::new(Mutex::new(UsageCounter {
                            limit_name: spec.rate_limit_type.clone(),
                            interval: spec.window(),
                            count: 0,
                            limit: spec.limit,
                            reset_time: next_reset(Utc::now(), spec.window()),
                        })),
                    );
                    debug!(bucket = %key, limit = spec.limit, "rate-limit bucket registered");
                }
            }
        }
    }

    /// Update counters from the headers the exchange echoed back.  The
    /// server's count replaces whatever `try_reserve` bumped optimistically.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        self.update_from_headers_at(headers, Utc::now());
    }

    fn update_from_headers_at(&self, headers: &reqwest::header::HeaderMap, now: DateTime<Utc>) {
        for (name, value) in headers {
            let name = name.as_str();
            let family = if let Some(rest) = name
                .strip_prefix("x-mbx-used-weight-")
            {
                Some(("REQUEST_WEIGHT", rest))
            } else {
                name.strip_prefix("x-mbx-order-count-")
                    .map(|rest| ("ORDERS", rest))
            };

            let Some((limit_name, suffix)) = family else {
                continue;
            };
            let Some(interval) = parse_interval_suffix(suffix) else {
                continue;
            };
            let Ok(count) = value.to_str().unwrap_or("").parse::<u32>() else {
                continue;
            };

            let key = format!("{}:{}", limit_name, suffix.to_lowercase());
            let bucket = {
                let map = self.buckets.read();
                map.get(&key).cloned()
            };

            match bucket {
                Some(bucket) => {
                    let mut counter = bucket.lock();
                    counter.count = count;
                    counter.reset_time = next_reset(now, counter.interval);
                    if count >= counter.effective_limit() {
                        warn!(bucket = %key, count, limit = counter.limit, "bucket at its usable ceiling");
                    }
                }
                None => {
                    // Header for a bucket exchange info has not declared yet.
                    // Track it with the observed count as a provisional limit.
                    let mut map = self.buckets.write();
                    map.entry(key.clone()).or_insert_with(|| {
                        Arc::new(Mutex::new(UsageCounter {
                            limit_name: limit_name.to_string(),
                            interval,
                            count,
                            limit: u32::MAX,
                            reset_time: next_reset(now, interval),
                        }))
                    });
                    debug!(bucket = %key, count, "undeclared bucket observed in headers");
                }
            }
        }
    }

    /// Atomically check and reserve the given `(limit_name, weight)` spends
    /// against every matching bucket.
    ///
    /// On success the counts are bumped before the call is sent, so a second
    /// caller checking the same bucket sees the spend already accounted for;
    /// the next echoed header replaces the optimistic count with the server's.
    /// When any usable ceiling would be crossed, nothing is reserved and the
    /// blocking bucket plus the time until its reset is returned.
    pub fn try_reserve(&self, spends: &[(&str, u32)]) -> Option<(String, Duration)> {
        self.try_reserve_at(spends, Utc::now())
    }

    fn try_reserve_at(
        &self,
        spends: &[(&str, u32)],
        now: DateTime<Utc>,
    ) -> Option<(String, Duration)> {
        // The write lock serialises reservers against each other and against
        // header updates, so check-then-bump is atomic across buckets.
        let map = self.buckets.write();
        for (key, bucket) in map.iter() {
            let mut counter = bucket.lock();
            // A bucket past its reset has rolled over; its count restarts.
            if now >= counter.reset_time {
                counter.count = 0;
                counter.reset_time = next_reset(now, counter.interval);
            }
            let spend = spend_for(&counter.limit_name, spends);
            if spend > 0 && counter.count.saturating_add(spend) > counter.effective_limit() {
                let wait = (counter.reset_time - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                return Some((key.clone(), wait));
            }
        }
        for bucket in map.values() {
            let mut counter = bucket.lock();
            let spend = spend_for(&counter.limit_name, spends);
            counter.count = counter.count.saturating_add(spend);
        }
        None
    }

    /// Serialisable snapshot of every bucket, sorted by key for stable
    /// display.
    pub fn snapshot(&self) -> Vec<UsageCounter> {
        let map = self.buckets.read();
        let mut entries: Vec<(String, UsageCounter)> = map
            .iter()
            .map(|(k, b)| (k.clone(), b.lock().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, c)| c).collect()
    }
}

impl Default for RateLimitLedger {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                reqwest::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn limit_spec_key_and_window() {
        let spec = LimitSpec {
            rate_limit_type: "ORDERS".into(),
            interval: "SECOND".into(),
            interval_num: 10,
            limit: 300,
        };
        assert_eq!(spec.bucket_key(), "ORDERS:10s");
        assert_eq!(spec.window(), Duration::from_secs(10));
    }

    #[test]
    fn parse_rate_limits_from_exchange_info() {
        let body = serde_json::json!({
            "rateLimits": [
                { "rateLimitType": "REQUEST_WEIGHT", "interval": "MINUTE", "intervalNum": 1, "limit": 2400 },
                { "rateLimitType": "ORDERS", "interval": "SECOND", "intervalNum": 10, "limit": 300 }
            ]
        });
        let specs = parse_rate_limits(&body);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].rate_limit_type, "REQUEST_WEIGHT");
        assert_eq!(specs[1].limit, 300);
    }

    #[test]
    fn headers_update_observed_counts() {
        let ledger = RateLimitLedger::new();
        ledger.update_from_headers(&headers(&[("x-mbx-used-weight-1m", "150")]));

        let snap = ledger.snapshot();
        let weight = snap
            .iter()
            .find(|c| c.limit_name == "REQUEST_WEIGHT")
            .unwrap();
        assert_eq!(weight.count, 150);
    }

    #[test]
    fn never_projects_past_the_declared_limit() {
        let ledger = RateLimitLedger::new();
        ledger.apply_limits(&[LimitSpec {
            rate_limit_type: "REQUEST_WEIGHT".into(),
            interval: "MINUTE".into(),
            interval_num: 1,
            limit: 100,
        }]);
        // 95 is the usable ceiling for a declared limit of 100.
        let now = Utc::now();
        ledger.update_from_headers_at(&headers(&[("x-mbx-used-weight-1m", "90")]), now);

        assert!(ledger
            .try_reserve_at(&[("REQUEST_WEIGHT", 5)], now)
            .is_none());
        // The reservation itself counts: the bucket is now at the ceiling.
        let (bucket, wait) = ledger
            .try_reserve_at(&[("REQUEST_WEIGHT", 1)], now)
            .unwrap();
        assert_eq!(bucket, "REQUEST_WEIGHT:1m");
        assert!(wait <= Duration::from_secs(60));
    }

    #[test]
    fn stale_count_cannot_be_spent_twice() {
        // No header echo arrives between the calls, so without reservation
        // every caller would see count 8 and pass.
        let ledger = RateLimitLedger::new();
        ledger.apply_limits(&[LimitSpec {
            rate_limit_type: "REQUEST_WEIGHT".into(),
            interval: "MINUTE".into(),
            interval_num: 1,
            limit: 10,
        }]);
        let now = Utc::now();
        ledger.update_from_headers_at(&headers(&[("x-mbx-used-weight-1m", "8")]), now);

        let mut fired = 0u32;
        for _ in 0..3 {
            if ledger.try_reserve_at(&[("REQUEST_WEIGHT", 1)], now).is_none() {
                fired += 1;
            }
        }
        assert!(8 + fired <= 10, "collective spend overran the declared limit");
        // Effective ceiling of 10 is 9, so exactly one call got through.
        assert_eq!(fired, 1);
    }

    #[test]
    fn expired_buckets_roll_over() {
        let ledger = RateLimitLedger::new();
        ledger.apply_limits(&[LimitSpec {
            rate_limit_type: "REQUEST_WEIGHT".into(),
            interval: "MINUTE".into(),
            interval_num: 1,
            limit: 100,
        }]);
        let now = Utc::now();
        ledger.update_from_headers_at(&headers(&[("x-mbx-used-weight-1m", "95")]), now);

        // One window later the observed count no longer binds.
        let later = now + chrono::Duration::seconds(120);
        assert!(ledger
            .try_reserve_at(&[("REQUEST_WEIGHT", 50)], later)
            .is_none());
    }

    #[test]
    fn limit_one_allows_nothing_extra_when_full() {
        let ledger = RateLimitLedger::new();
        ledger.apply_limits(&[LimitSpec {
            rate_limit_type: "REQUEST_WEIGHT".into(),
            interval: "MINUTE".into(),
            interval_num: 1,
            limit: 1,
        }]);
        let now = Utc::now();
        ledger.update_from_headers_at(&headers(&[("x-mbx-used-weight-1m", "1")]), now);
        // Effective limit of a declared limit 1 is 0 — any spend must wait.
        assert!(ledger
            .try_reserve_at(&[("REQUEST_WEIGHT", 1)], now)
            .is_some());
    }

    #[test]
    fn reservation_bumps_only_the_named_families() {
        let ledger = RateLimitLedger::new();
        assert!(ledger.try_reserve(&[("ORDERS", 1)]).is_none());
        for counter in ledger.snapshot() {
            if counter.limit_name == "ORDERS" {
                assert_eq!(counter.count, 1);
            } else {
                assert_eq!(counter.count, 0);
            }
        }
    }

    #[test]
    fn blocked_reservation_reserves_nothing() {
        let ledger = RateLimitLedger::new();
        ledger.apply_limits(&[LimitSpec {
            rate_limit_type: "REQUEST_WEIGHT".into(),
            interval: "MINUTE".into(),
            interval_num: 1,
            limit: 100,
        }]);
        let now = Utc::now();
        ledger.update_from_headers_at(&headers(&[("x-mbx-used-weight-1m", "95")]), now);

        // An order call spends both families; the weight bucket refuses, so
        // the ORDERS buckets must stay untouched.
        assert!(ledger
            .try_reserve_at(&[("REQUEST_WEIGHT", 1), ("ORDERS", 1)], now)
            .is_some());
        for counter in ledger.snapshot() {
            if counter.limit_name == "ORDERS" {
                assert_eq!(counter.count, 0);
            }
        }
    }

    #[test]
    fn refresh_preserves_observed_counts() {
        let ledger = RateLimitLedger::new();
        ledger.update_from_headers(&headers(&[("x-mbx-used-weight-1m", "42")]));
        ledger.apply_limits(&[LimitSpec {
            rate_limit_type: "REQUEST_WEIGHT".into(),
            interval: "MINUTE".into(),
            interval_num: 1,
            limit: 6000,
        }]);
        let snap = ledger.snapshot();
        let weight = snap
            .iter()
            .find(|c| c.limit_name == "REQUEST_WEIGHT")
            .unwrap();
        assert_eq!(weight.count, 42);
        assert_eq!(weight.limit, 6000);
    }

    #[test]
    fn interval_suffix_parsing() {
        assert_eq!(parse_interval_suffix("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_interval_suffix("10s"), Some(Duration::from_secs(10)));
        assert_eq!(
            parse_interval_suffix("1d"),
            Some(Duration::from_secs(86_400))
        );
        assert_eq!(parse_interval_suffix("x"), None);
        assert_eq!(parse_interval_suffix("10q"), None);
    }
}
