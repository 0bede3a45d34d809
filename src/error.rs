// =============================================================================
// Error Taxonomy — recoverable vs. surfaced failures
// =============================================================================
//
// Every failure in the core falls into one of five classes with distinct
// recovery policies:
//   - Transport:          retried a bounded number of times with jittered
//                         exponential backoff.
//   - RateLimitExceeded:  deferred until the bucket resets, never dropped.
//   - Exchange:           surfaced to the caller, not auto-retried (may mean
//                         bad input or account state).
//   - StreamDesync:       triggers a REST gap-fill, never fatal.
//   - Script:             isolated to one symbol's indicator computation.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Network / timeout failure.  Eligible for automatic retry.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// A rate-limit bucket would be (or was) exceeded.  The caller must wait
    /// `retry_after` before trying again.
    #[error("rate limit exceeded on bucket {bucket}, retry after {retry_after:?}")]
    RateLimitExceeded {
        bucket: String,
        retry_after: Duration,
    },

    /// Structured 4xx/5xx from the exchange.  Not retried automatically.
    #[error("exchange error {status} (code {code}): {message}")]
    Exchange {
        status: u16,
        code: i64,
        message: String,
    },

    /// Detected gap or duplicate in a stream.  Handled by REST gap-fill.
    #[error("stream desync on {symbol}: {detail}")]
    StreamDesync { symbol: String, detail: String },

    /// Strategy-script failure for a single symbol.
    #[error("script error for {symbol}: {message}")]
    Script { symbol: String, message: String },
}

impl EngineError {
    /// Whether the automatic retry machinery in the API client may retry the
    /// failed call.  Rate-limit deferrals are handled separately (sleep until
    /// reset), so they are not "retryable" in this sense.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transport { .. })
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Transport {
            message: e.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        EngineError::Transport {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_is_retryable() {
        let t = EngineError::Transport {
            message: "timed out".into(),
        };
        assert!(t.is_retryable());

        let r = EngineError::RateLimitExceeded {
            bucket: "REQUEST_WEIGHT:1m".into(),
            retry_after: Duration::from_secs(30),
        };
        assert!(!r.is_retryable());

        let x = EngineError::Exchange {
            status: 400,
            code: -1013,
            message: "Filter failure".into(),
        };
        assert!(!x.is_retryable());
    }

    #[test]
    fn display_includes_code_and_bucket() {
        let x = EngineError::Exchange {
            status: 400,
            code: -2019,
            message: "Margin is insufficient".into(),
        };
        let s = x.to_string();
        assert!(s.contains("-2019"));
        assert!(s.contains("400"));

        let r = EngineError::RateLimitExceeded {
            bucket: "ORDERS:10s".into(),
            retry_after: Duration::from_secs(3),
        };
        assert!(r.to_string().contains("ORDERS:10s"));
    }
}
