//! Response types for the Kite Connect REST API.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Deserialize;

/// Every Kite response is wrapped in `{"status": ..., "data": ...}`, or
/// `{"status": "error", "message": ..., "error_type": ...}` on failure.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub status: String,
    pub data: Option<T>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error_type: String,
}

impl<T> Envelope<T> {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Error body returned with non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct KiteErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error_type: String,
}

/// Full quote from `/quote`, keyed by `EXCHANGE:SYMBOL`.
pub type QuoteMap = HashMap<String, QuoteResponse>;

#[derive(Debug, Clone, Deserialize)]
pub struct QuoteResponse {
    pub instrument_token: u64,
    pub last_price: Decimal,
    #[serde(default)]
    pub volume: Decimal,
    #[serde(default)]
    pub ohlc: OhlcResponse,
    /// Exchange time, `YYYY-MM-DD HH:MM:SS` in exchange-local time.
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OhlcResponse {
    #[serde(default)]
    pub open: Decimal,
    #[serde(default)]
    pub high: Decimal,
    #[serde(default)]
    pub low: Decimal,
    #[serde(default)]
    pub close: Decimal,
}

/// `/instruments/historical/{token}/{interval}` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoricalResponse {
    /// `[timestamp, open, high, low, close, volume]`
    pub candles: Vec<(String, Decimal, Decimal, Decimal, Decimal, Decimal)>,
}

/// Order placement and cancellation both answer with the order ID.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderIdResponse {
    pub order_id: String,
}

/// One entry of `/orders/{order_id}`; the last entry is the current state.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderHistoryEntry {
    pub order_id: String,
    pub status: String,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub average_price: Decimal,
    #[serde(default)]
    pub filled_quantity: u64,
    #[serde(default)]
    pub quantity: u64,
}

/// `/user/margins` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct MarginsResponse {
    pub equity: SegmentMargin,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentMargin {
    #[serde(default)]
    pub net: Decimal,
    pub available: AvailableMargin,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AvailableMargin {
    #[serde(default)]
    pub live_balance: Decimal,
    #[serde(default)]
    pub cash: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_quote_envelope() {
        let body = r#"{
            "status": "success",
            "data": {
                "NSE:TATASTEEL": {
                    "instrument_token": 895745,
                    "timestamp": "2026-03-02 09:31:04",
                    "last_price": 151.35,
                    "volume": 10234567,
                    "ohlc": {"open": 150.1, "high": 151.9, "low": 149.8, "close": 149.95}
                }
            }
        }"#;

        let env: Envelope<QuoteMap> = serde_json::from_str(body).unwrap();
        assert!(env.is_success());
        let quote = &env.data.unwrap()["NSE:TATASTEEL"];
        assert_eq!(quote.instrument_token, 895745);
        assert_eq!(quote.last_price, dec!(151.35));
        assert_eq!(quote.ohlc.high, dec!(151.9));
    }

    #[test]
    fn test_parse_historical_candles() {
        let body = r#"{
            "status": "success",
            "data": {"candles": [["2026-03-02T09:15:00+0530", 150.1, 150.8, 149.9, 150.5, 182345]]}
        }"#;

        let env: Envelope<HistoricalResponse> = serde_json::from_str(body).unwrap();
        let candles = env.data.unwrap().candles;
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].4, dec!(150.5));
        assert_eq!(candles[0].5, dec!(182345));
    }

    #[test]
    fn test_parse_error_envelope() {
        let body = r#"{"status": "error", "message": "Insufficient funds", "error_type": "MarginException"}"#;
        let env: Envelope<OrderIdResponse> = serde_json::from_str(body).unwrap();
        assert!(!env.is_success());
        assert!(env.data.is_none());
        assert_eq!(env.error_type, "MarginException");
    }

    #[test]
    fn test_parse_order_history() {
        let body = r#"{"status": "success", "data": [
            {"order_id": "1001", "status": "OPEN PENDING", "average_price": 0, "filled_quantity": 0, "quantity": 250},
            {"order_id": "1001", "status": "COMPLETE", "average_price": 151.4, "filled_quantity": 250, "quantity": 250, "status_message": null}
        ]}"#;
        let env: Envelope<Vec<OrderHistoryEntry>> = serde_json::from_str(body).unwrap();
        let history = env.data.unwrap();
        assert_eq!(history.last().unwrap().status, "COMPLETE");
        assert_eq!(history.last().unwrap().filled_quantity, 250);
    }
}
