//! Kite Connect client for quotes, candles, margins and order execution.
//!
//! Kite is Zerodha's REST API for NSE/BSE equities. This client handles:
//! - Token authentication (`Authorization: token api_key:access_token`)
//! - Quotes and intraday candles, with retry on transient failures
//! - Intraday (MIS) order placement, status and cancellation
//!
//! Order placement is never retried: a timed-out POST may still have reached
//! the exchange, and the engine decides what to do with it next cycle.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::*;
use super::{MarketDataSource, OrderGateway};
use crate::error::{DataFetchError, GatewayError};
use crate::models::{Candle, Ohlc, OrderIntent, OrderState, OrderUpdate, Quote, SymbolWatch};

/// Kite Connect API base URL.
pub const KITE_URL: &str = "https://api.kite.trade";

/// NSE equity tick size.
const TICK_SIZE: Decimal = dec!(0.05);

/// Kite accepts at most 20 characters in an order tag.
const MAX_TAG_LEN: usize = 20;

/// Kite Connect client.
pub struct KiteClient {
    http: Client,
    base_url: String,
    timeout_secs: u64,
    /// Exchange-local offset used for candle ranges and quote timestamps.
    offset: FixedOffset,
    /// Instrument tokens learned from quotes, keyed by `EXCHANGE:SYMBOL`.
    tokens: RwLock<HashMap<String, u64>>,
}

/// Why a single HTTP call failed.
#[derive(Debug)]
enum CallError {
    Timeout,
    Transport(String),
    Api { status: u16, message: String },
}

impl CallError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CallError::Timeout
        } else {
            CallError::Transport(e.to_string())
        }
    }

    /// Worth another attempt: the broker did not give a definite answer.
    fn is_transient(&self) -> bool {
        match self {
            CallError::Timeout | CallError::Transport(_) => true,
            CallError::Api { status, .. } => *status >= 500 || *status == 429,
        }
    }

    fn into_data_error(self, timeout_secs: u64) -> DataFetchError {
        match self {
            CallError::Timeout => DataFetchError::Timeout(timeout_secs),
            CallError::Transport(msg) => DataFetchError::Transport(msg),
            CallError::Api { status, message } => DataFetchError::Api { status, message },
        }
    }

    fn into_gateway_error(self, timeout_secs: u64) -> GatewayError {
        match self {
            CallError::Timeout => GatewayError::Timeout(timeout_secs),
            CallError::Transport(msg) => GatewayError::Transport(msg),
            CallError::Api { status, message } if (400..500).contains(&status) && status != 429 => {
                GatewayError::Rejected(message)
            }
            CallError::Api { status, message } => {
                GatewayError::Transport(format!("{}: {}", status, message))
            }
        }
    }
}

impl KiteClient {
    /// Create a new Kite client.
    ///
    /// # Arguments
    /// * `api_key` - Kite Connect app key
    /// * `access_token` - Session token from the daily login flow
    /// * `offset` - Exchange-local UTC offset (IST is +05:30)
    /// * `timeout_secs` - Per-request timeout
    pub fn new(
        api_key: &str,
        access_token: &str,
        offset: FixedOffset,
        timeout_secs: u64,
    ) -> Result<Self> {
        Self::with_base_url(KITE_URL, api_key, access_token, offset, timeout_secs)
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(
        base_url: &str,
        api_key: &str,
        access_token: &str,
        offset: FixedOffset,
        timeout_secs: u64,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .default_headers(Self::auth_headers(api_key, access_token)?)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs,
            offset,
            tokens: RwLock::new(HashMap::new()),
        })
    }

    /// Create from environment variables:
    /// - KITE_API_KEY
    /// - KITE_ACCESS_TOKEN
    /// - KITE_BASE_URL (defaults to the production API)
    pub fn from_env(offset: FixedOffset, timeout_secs: u64) -> Result<Self> {
        let api_key = std::env::var("KITE_API_KEY").context("KITE_API_KEY not set")?;
        let access_token =
            std::env::var("KITE_ACCESS_TOKEN").context("KITE_ACCESS_TOKEN not set")?;
        let base_url = std::env::var("KITE_BASE_URL").unwrap_or_else(|_| KITE_URL.to_string());

        Self::with_base_url(&base_url, &api_key, &access_token, offset, timeout_secs)
    }

    fn auth_headers(api_key: &str, access_token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-kite-version"),
            HeaderValue::from_static("3"),
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("token {}:{}", api_key, access_token))
                .context("Invalid Kite credentials")?,
        );
        Ok(headers)
    }

    fn read_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_interval(Duration::from_secs(4))
            .with_max_elapsed_time(Some(Duration::from_secs(self.timeout_secs)))
            .build()
    }

    /// Send one request and unwrap the Kite envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        form: Option<&[(&'static str, String)]>,
    ) -> Result<T, CallError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url).query(query);
        if let Some(form) = form {
            request = request.form(form);
        }

        let response = request.send().await.map_err(CallError::from_reqwest)?;
        let status = response.status();
        let body = response.text().await.map_err(CallError::from_reqwest)?;

        if !status.is_success() {
            let message = serde_json::from_str::<KiteErrorBody>(&body)
                .map(|e| format!("{} ({})", e.message, e.error_type))
                .unwrap_or(body);
            return Err(CallError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope<T> = serde_json::from_str(&body)
            .map_err(|e| CallError::Transport(format!("malformed response from {}: {}", path, e)))?;

        if !envelope.is_success() {
            return Err(CallError::Api {
                status: StatusCode::OK.as_u16(),
                message: format!("{} ({})", envelope.message, envelope.error_type),
            });
        }

        envelope
            .data
            .ok_or_else(|| CallError::Transport(format!("empty response from {}", path)))
    }

    /// GET with retry on transient failures.
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, CallError> {
        retry(self.read_backoff(), || async move {
            self.call(Method::GET, path, query, None).await.map_err(|e| {
                if e.is_transient() {
                    debug!(path, error = ?e, "Retrying Kite request");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    async fn instrument_token(&self, watch: &SymbolWatch) -> Result<u64, DataFetchError> {
        let key = watch.instrument_key();
        if let Some(token) = self.tokens.read().await.get(&key) {
            return Ok(*token);
        }

        // Quotes carry the token; fetching one fills the cache.
        self.quote(watch).await?;
        self.tokens
            .read()
            .await
            .get(&key)
            .copied()
            .ok_or(DataFetchError::Missing(key))
    }

    fn local_time(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.offset)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }

    fn parse_local(&self, s: &str) -> Option<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok()?;
        self.offset
            .from_local_datetime(&naive)
            .single()
            .map(|t| t.with_timezone(&Utc))
    }
}

#[async_trait]
impl MarketDataSource for KiteClient {
    async fn quote(&self, watch: &SymbolWatch) -> Result<Quote, DataFetchError> {
        let key = watch.instrument_key();
        let mut quotes: QuoteMap = self
            .get("/quote", &[("i", key.clone())])
            .await
            .map_err(|e| e.into_data_error(self.timeout_secs))?;

        let q = quotes
            .remove(&key)
            .ok_or_else(|| DataFetchError::Missing(key.clone()))?;
        self.tokens.write().await.insert(key, q.instrument_token);

        let timestamp = q
            .timestamp
            .as_deref()
            .and_then(|s| self.parse_local(s))
            .unwrap_or_else(Utc::now);

        Ok(Quote {
            symbol: watch.symbol.clone(),
            last_price: q.last_price,
            ohlc: Ohlc {
                open: q.ohlc.open,
                high: q.ohlc.high,
                low: q.ohlc.low,
                close: q.ohlc.close,
            },
            volume: q.volume,
            timestamp,
        })
    }

    async fn candles(
        &self,
        watch: &SymbolWatch,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: &str,
    ) -> Result<Vec<Candle>, DataFetchError> {
        let token = self.instrument_token(watch).await?;
        let path = format!("/instruments/historical/{}/{}", token, interval);
        let data: HistoricalResponse = self
            .get(
                &path,
                &[("from", self.local_time(from)), ("to", self.local_time(to))],
            )
            .await
            .map_err(|e| e.into_data_error(self.timeout_secs))?;

        let mut candles = Vec::with_capacity(data.candles.len());
        for (ts, open, high, low, close, volume) in data.candles {
            match parse_candle_time(&ts) {
                Some(timestamp) => candles.push(Candle {
                    timestamp,
                    open,
                    high,
                    low,
                    close,
                    volume,
                }),
                None => warn!(symbol = %watch.symbol, ts = %ts, "Skipping candle with bad timestamp"),
            }
        }

        debug!(symbol = %watch.symbol, count = candles.len(), interval, "Fetched candles");
        Ok(candles)
    }

    async fn available_margin(&self) -> Result<Decimal, DataFetchError> {
        let margins: MarginsResponse = self
            .get("/user/margins", &[])
            .await
            .map_err(|e| e.into_data_error(self.timeout_secs))?;

        Ok(margins.equity.available.live_balance)
    }
}

#[async_trait]
impl OrderGateway for KiteClient {
    async fn submit(&self, intent: &OrderIntent) -> Result<String, GatewayError> {
        let form = order_form(intent);
        let ticket = intent.ticket();

        let placed: OrderIdResponse = self
            .call(Method::POST, "/orders/regular", &[], Some(form.as_slice()))
            .await
            .map_err(|e| e.into_gateway_error(self.timeout_secs))?;

        info!(
            order_id = %placed.order_id,
            kind = intent.kind(),
            symbol = %ticket.symbol,
            transaction = intent.transaction_type(),
            quantity = ticket.quantity,
            "Order placed"
        );
        Ok(placed.order_id)
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderUpdate, GatewayError> {
        let path = format!("/orders/{}", order_id);
        let history: Vec<OrderHistoryEntry> = self.get(&path, &[]).await.map_err(|e| match e {
            CallError::Api { status: 404, .. } => GatewayError::UnknownOrder(order_id.to_string()),
            CallError::Api { status, message } => {
                GatewayError::Transport(format!("{}: {}", status, message))
            }
            other => other.into_gateway_error(self.timeout_secs),
        })?;

        let latest = history
            .last()
            .ok_or_else(|| GatewayError::UnknownOrder(order_id.to_string()))?;

        Ok(OrderUpdate {
            order_id: order_id.to_string(),
            state: order_state(latest),
        })
    }

    async fn cancel(&self, order_id: &str) -> Result<(), GatewayError> {
        let path = format!("/orders/regular/{}", order_id);
        let _: OrderIdResponse = self
            .call(Method::DELETE, &path, &[], None)
            .await
            .map_err(|e| e.into_gateway_error(self.timeout_secs))?;

        info!(order_id, "Order cancelled");
        Ok(())
    }
}

/// Round to the exchange tick.
pub fn round_to_tick(price: Decimal) -> Decimal {
    (price / TICK_SIZE).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero) * TICK_SIZE
}

/// Form fields for `POST /orders/regular`.
fn order_form(intent: &OrderIntent) -> Vec<(&'static str, String)> {
    let ticket = intent.ticket();
    let tag: String = ticket.correlation_id.chars().take(MAX_TAG_LEN).collect();

    let mut form = vec![
        ("tradingsymbol", ticket.symbol.clone()),
        ("exchange", ticket.exchange.clone()),
        ("transaction_type", intent.transaction_type().to_string()),
        ("quantity", ticket.quantity.to_string()),
        ("product", "MIS".to_string()),
        ("validity", "DAY".to_string()),
        ("tag", tag),
    ];

    match intent {
        OrderIntent::Entry { limit: true, .. } => {
            form.push(("order_type", "LIMIT".to_string()));
            form.push(("price", round_to_tick(ticket.price).to_string()));
        }
        OrderIntent::StopLoss {
            at_market: false, ..
        } => {
            form.push(("order_type", "SL-M".to_string()));
            form.push(("trigger_price", round_to_tick(ticket.price).to_string()));
        }
        _ => form.push(("order_type", "MARKET".to_string())),
    }

    form
}

fn order_state(entry: &OrderHistoryEntry) -> OrderState {
    match entry.status.as_str() {
        "COMPLETE" => OrderState::Filled {
            average_price: entry.average_price,
            filled_quantity: entry.filled_quantity,
        },
        "REJECTED" => OrderState::Rejected {
            reason: entry
                .status_message
                .clone()
                .unwrap_or_else(|| "rejected by broker".to_string()),
        },
        "CANCELLED" => OrderState::Cancelled {
            average_price: entry.average_price,
            filled_quantity: entry.filled_quantity,
        },
        _ => OrderState::Pending,
    }
}

/// Candle timestamps look like `2026-03-02T09:15:00+0530`.
fn parse_candle_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderTicket, Side};

    fn ticket(side: Side, price: Decimal) -> OrderTicket {
        OrderTicket {
            correlation_id: "0123456789abcdef0123456789abcdef".to_string(),
            symbol: "TATASTEEL".to_string(),
            exchange: "NSE".to_string(),
            side,
            quantity: 250,
            price,
        }
    }

    fn field<'a>(form: &'a [(&'static str, String)], key: &str) -> Option<&'a str> {
        form.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(dec!(150.52)), dec!(150.50));
        assert_eq!(round_to_tick(dec!(150.53)), dec!(150.55));
        assert_eq!(round_to_tick(dec!(150.525)), dec!(150.55));
        assert_eq!(round_to_tick(dec!(99.95)), dec!(99.95));
    }

    #[test]
    fn test_market_entry_form() {
        let intent = OrderIntent::Entry {
            ticket: ticket(Side::Short, dec!(150.2)),
            limit: false,
        };
        let form = order_form(&intent);
        assert_eq!(field(&form, "transaction_type"), Some("SELL"));
        assert_eq!(field(&form, "order_type"), Some("MARKET"));
        assert_eq!(field(&form, "product"), Some("MIS"));
        assert_eq!(field(&form, "price"), None);
        assert_eq!(field(&form, "tag").map(str::len), Some(MAX_TAG_LEN));
    }

    #[test]
    fn test_limit_entry_and_resting_stop_forms() {
        let entry = OrderIntent::Entry {
            ticket: ticket(Side::Long, dec!(150.52)),
            limit: true,
        };
        let form = order_form(&entry);
        assert_eq!(field(&form, "order_type"), Some("LIMIT"));
        assert_eq!(field(&form, "price"), Some("150.50"));

        let stop = OrderIntent::StopLoss {
            ticket: ticket(Side::Long, dec!(148.98)),
            at_market: false,
        };
        let form = order_form(&stop);
        assert_eq!(field(&form, "transaction_type"), Some("SELL"));
        assert_eq!(field(&form, "order_type"), Some("SL-M"));
        assert_eq!(field(&form, "trigger_price"), Some("149.00"));

        let stop_now = OrderIntent::StopLoss {
            ticket: ticket(Side::Long, dec!(148.98)),
            at_market: true,
        };
        assert_eq!(field(&order_form(&stop_now), "order_type"), Some("MARKET"));
    }

    #[test]
    fn test_order_state_mapping() {
        let mut entry = OrderHistoryEntry {
            order_id: "1".to_string(),
            status: "TRIGGER PENDING".to_string(),
            status_message: None,
            average_price: Decimal::ZERO,
            filled_quantity: 0,
            quantity: 250,
        };
        assert_eq!(order_state(&entry), OrderState::Pending);

        entry.status = "COMPLETE".to_string();
        entry.average_price = dec!(151.4);
        entry.filled_quantity = 250;
        assert_eq!(
            order_state(&entry),
            OrderState::Filled {
                average_price: dec!(151.4),
                filled_quantity: 250
            }
        );

        entry.status = "REJECTED".to_string();
        entry.status_message = Some("Insufficient funds".to_string());
        assert_eq!(
            order_state(&entry),
            OrderState::Rejected {
                reason: "Insufficient funds".to_string()
            }
        );
    }

    #[test]
    fn test_cancelled_order_keeps_partial_fill() {
        let entry = OrderHistoryEntry {
            order_id: "2".to_string(),
            status: "CANCELLED".to_string(),
            status_message: None,
            average_price: dec!(150.35),
            filled_quantity: 100,
            quantity: 250,
        };
        assert_eq!(
            order_state(&entry),
            OrderState::Cancelled {
                average_price: dec!(150.35),
                filled_quantity: 100
            }
        );
    }

    #[test]
    fn test_gateway_error_classification() {
        let rejected = CallError::Api {
            status: 400,
            message: "Margin exceeds".to_string(),
        };
        assert!(rejected.into_gateway_error(30).is_rejection());

        let throttled = CallError::Api {
            status: 429,
            message: "Too many requests".to_string(),
        };
        assert!(throttled.is_transient());
        assert!(!throttled.into_gateway_error(30).is_rejection());

        assert!(matches!(
            CallError::Timeout.into_gateway_error(30),
            GatewayError::Timeout(30)
        ));
    }

    #[test]
    fn test_parse_candle_time() {
        let t = parse_candle_time("2026-03-02T09:15:00+0530").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2026, 3, 2, 3, 45, 0).unwrap());
        assert!(parse_candle_time("yesterday").is_none());
    }

    #[test]
    fn test_local_time_round_trip() {
        let ist = FixedOffset::east_opt(330 * 60).unwrap();
        let client = KiteClient::new("key", "token", ist, 5).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 3, 45, 0).unwrap();
        assert_eq!(client.local_time(at), "2026-03-02 09:15:00");
        assert_eq!(client.parse_local("2026-03-02 09:15:00"), Some(at));
    }
}
