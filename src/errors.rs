//! Bot-wide error types

use thiserror::Error;

/// Result type for bot operations
pub type Result<T> = std::result::Result<T, BotError>;

/// HTTP statuses that warrant a retry with backoff
const RETRYABLE_STATUS: [u16; 4] = [418, 429, 500, 503];

/// Exchange error codes in the rate-limit family
const RATE_LIMIT_CODES: [i64; 6] = [418, 429, -1003, -1015, -1021, -1099];

/// "Already set" codes returned by margin-type and leverage endpoints
const ALREADY_SET_CODES: [i64; 5] = [-4046, -4098, -4100, -4003, -4056];

/// Errors that can occur while running the bot
#[derive(Error, Debug)]
pub enum BotError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("REST error {status}: {payload}")]
    Rest {
        status: u16,
        payload: serde_json::Value,
    },

    #[error("unexpected exchange payload: {0}")]
    Payload(String),

    #[error("grid computation failed: {0}")]
    Grid(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("position not flat after {attempts} attempts (remaining {remaining})")]
    PositionNotFlat { attempts: u32, remaining: f64 },

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BotError {
    /// Exchange error code carried in a REST error payload, if any.
    ///
    /// The exchange reports codes as JSON numbers, but some gateways relay
    /// them as strings; both forms are accepted.
    pub fn error_code(&self) -> Option<i64> {
        match self {
            BotError::Rest { payload, .. } => payload.get("code").and_then(|code| {
                code.as_i64()
                    .or_else(|| code.as_str().and_then(|s| s.parse().ok()))
            }),
            _ => None,
        }
    }

    /// True when a retry with backoff is appropriate (rate-limit family).
    pub fn is_retryable(&self) -> bool {
        match self {
            BotError::Rest { status, .. } => {
                RETRYABLE_STATUS.contains(status)
                    || self
                        .error_code()
                        .is_some_and(|code| RATE_LIMIT_CODES.contains(&code))
            }
            _ => false,
        }
    }

    /// Duplicate client order id on submission.
    pub fn is_duplicate_order(&self) -> bool {
        self.error_code() == Some(-2011)
    }

    /// Order no longer known to the exchange (already filled or canceled).
    pub fn is_unknown_order(&self) -> bool {
        matches!(self.error_code(), Some(-2011) | Some(-2013))
    }

    /// Margin type or leverage already at the requested value.
    pub fn is_already_set(&self) -> bool {
        self.error_code()
            .is_some_and(|code| ALREADY_SET_CODES.contains(&code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rest_error(status: u16, code: i64) -> BotError {
        BotError::Rest {
            status,
            payload: json!({"code": code, "msg": "test"}),
        }
    }

    #[test]
    fn test_error_code_extraction() {
        assert_eq!(rest_error(400, -2011).error_code(), Some(-2011));

        let string_code = BotError::Rest {
            status: 400,
            payload: json!({"code": "-4046"}),
        };
        assert_eq!(string_code.error_code(), Some(-4046));

        let no_code = BotError::Rest {
            status: 500,
            payload: json!({"msg": "oops"}),
        };
        assert_eq!(no_code.error_code(), None);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(rest_error(429, 0).is_retryable());
        assert!(rest_error(503, 0).is_retryable());
        assert!(rest_error(400, -1003).is_retryable());
        assert!(rest_error(400, -1021).is_retryable());
        assert!(!rest_error(400, -2011).is_retryable());
        assert!(!BotError::Grid("bad".into()).is_retryable());
    }

    #[test]
    fn test_idempotent_and_duplicate_codes() {
        assert!(rest_error(400, -2011).is_duplicate_order());
        assert!(rest_error(400, -2011).is_unknown_order());
        assert!(rest_error(400, -2013).is_unknown_order());
        assert!(!rest_error(400, -2013).is_duplicate_order());

        for code in [-4046, -4098, -4100, -4003, -4056] {
            assert!(rest_error(400, code).is_already_set(), "code {code}");
        }
        assert!(!rest_error(400, -2011).is_already_set());
    }
}
