//! WebSocket payload decoding
//!
//! The market stream delivers best bid/ask updates, either wrapped in a
//! combined-stream envelope (`{"stream": ..., "data": {...}}`) or bare. The
//! user stream delivers account events dispatched by their `e` tag.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

fn f64_from_string_or_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(f64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        Raw::Number(value) => Ok(value),
    }
}

/// Best bid/ask update from the book-ticker stream
#[derive(Debug, Clone, Deserialize)]
pub struct BookTickerEvent {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b", deserialize_with = "f64_from_string_or_number")]
    pub bid: f64,
    #[serde(rename = "a", deserialize_with = "f64_from_string_or_number")]
    pub ask: f64,
}

impl BookTickerEvent {
    /// Decode a market stream frame, unwrapping the combined-stream envelope
    /// when present. Frames that do not carry a book ticker yield `None`.
    pub fn from_frame(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let payload = match value.get("data") {
            Some(data) => data.clone(),
            None => value,
        };
        serde_json::from_value(payload).ok()
    }
}

/// Order/trade update carried inside an `ORDER_TRADE_UPDATE` event
#[derive(Debug, Clone, Deserialize)]
pub struct OrderTradeUpdate {
    #[serde(rename = "c", default)]
    pub client_order_id: String,
    #[serde(rename = "i", default)]
    pub order_id: Option<u64>,
    #[serde(rename = "X", default)]
    pub status: String,
    #[serde(rename = "S", default)]
    pub side: String,
    #[serde(rename = "x", default)]
    pub execution_type: String,
    #[serde(rename = "l", default, deserialize_with = "f64_from_string_or_number")]
    pub last_filled_qty: f64,
}

/// User stream event, dispatched by the `e` (or legacy `eventType`) tag
#[derive(Debug, Clone)]
pub enum UserEvent {
    ListenKeyExpired,
    OrderTradeUpdate(OrderTradeUpdate),
    Other(String),
}

impl UserEvent {
    pub fn from_frame(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let event_type = value
            .get("e")
            .or_else(|| value.get("eventType"))?
            .as_str()?
            .to_string();
        match event_type.as_str() {
            "listenKeyExpired" => Some(UserEvent::ListenKeyExpired),
            "ORDER_TRADE_UPDATE" => {
                let update = value.get("o")?.clone();
                serde_json::from_value(update)
                    .ok()
                    .map(UserEvent::OrderTradeUpdate)
            }
            _ => Some(UserEvent::Other(event_type)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_ticker_enveloped_frame() {
        let frame = r#"{"stream":"btcusdt@bookTicker","data":{"e":"bookTicker","s":"BTCUSDT","b":"59999.99","a":"60000.01"}}"#;
        let event = BookTickerEvent::from_frame(frame).unwrap();
        assert_eq!(event.symbol, "BTCUSDT");
        assert!((event.bid - 59_999.99).abs() < 1e-9);
        assert!((event.ask - 60_000.01).abs() < 1e-9);
    }

    #[test]
    fn test_book_ticker_bare_frame_with_numbers() {
        let frame = r#"{"s":"BTCUSDT","b":59999.99,"a":60000.01}"#;
        let event = BookTickerEvent::from_frame(frame).unwrap();
        assert!((event.bid - 59_999.99).abs() < 1e-9);
    }

    #[test]
    fn test_book_ticker_rejects_garbage() {
        assert!(BookTickerEvent::from_frame("not json").is_none());
        assert!(BookTickerEvent::from_frame(r#"{"ping":1}"#).is_none());
    }

    #[test]
    fn test_user_event_listen_key_expired() {
        let frame = r#"{"e":"listenKeyExpired","E":1700000000000}"#;
        assert!(matches!(
            UserEvent::from_frame(frame),
            Some(UserEvent::ListenKeyExpired)
        ));
    }

    #[test]
    fn test_user_event_order_trade_update() {
        let frame = r#"{"e":"ORDER_TRADE_UPDATE","E":1700000000000,"o":{"s":"BTCUSDT","c":"MVP21_BTCUSDT_0_123456","i":98765,"S":"BUY","X":"FILLED","x":"TRADE","l":"0.001"}}"#;
        let Some(UserEvent::OrderTradeUpdate(update)) = UserEvent::from_frame(frame) else {
            panic!("expected order trade update");
        };
        assert_eq!(update.client_order_id, "MVP21_BTCUSDT_0_123456");
        assert_eq!(update.order_id, Some(98765));
        assert_eq!(update.status, "FILLED");
        assert_eq!(update.side, "BUY");
        assert_eq!(update.execution_type, "TRADE");
        assert!((update.last_filled_qty - 0.001).abs() < 1e-9);
    }

    #[test]
    fn test_user_event_event_type_alias_and_unknown() {
        let frame = r#"{"eventType":"listenKeyExpired"}"#;
        assert!(matches!(
            UserEvent::from_frame(frame),
            Some(UserEvent::ListenKeyExpired)
        ));

        let frame = r#"{"e":"MARGIN_CALL"}"#;
        assert!(matches!(
            UserEvent::from_frame(frame),
            Some(UserEvent::Other(kind)) if kind == "MARGIN_CALL"
        ));
    }
}
