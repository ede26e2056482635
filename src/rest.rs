//! REST gateway for the exchange control plane
//!
//! All order mutations, account reads, and listen-key lifecycle calls go
//! through the [`Gateway`] trait so the controller can be exercised against
//! a mock in tests. [`AsterRestClient`] is the production implementation:
//! signed HMAC-SHA256 requests against the futures REST API, with dry-run
//! short-circuits for every state-mutating endpoint.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use rand::Rng;
use reqwest::Method;
use serde_json::{json, Value};
use sha2::Sha256;
use uuid::Uuid;

use crate::config::BotConfig;
use crate::errors::{BotError, Result};
use crate::filters::SymbolFilters;
use crate::grid::GridSide;

const MAX_RETRY_ATTEMPTS: u32 = 5;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(32);

/// Best bid/ask returned by the ticker endpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookTicker {
    pub bid: f64,
    pub ask: f64,
}

impl BookTicker {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// One rate-limit bucket advertised by exchange info
#[derive(Debug, Clone)]
pub struct RateLimit {
    pub interval: String,
    pub interval_num: u32,
    pub limit: u32,
}

/// Symbol metadata loaded once at bootstrap
#[derive(Debug, Clone)]
pub struct ExchangeInfo {
    pub symbol: String,
    pub filters: SymbolFilters,
    pub rate_limits: Vec<RateLimit>,
}

/// Acknowledgement for a submitted order
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: u64,
    pub client_order_id: Option<String>,
    pub status: String,
}

/// A past fill from the user-trades endpoint
#[derive(Debug, Clone, Copy)]
pub struct UserTrade {
    /// Trade timestamp in epoch milliseconds
    pub time: u64,
}

/// Order type for submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderKind {
    Limit { price: String },
    Market,
}

/// Outgoing order request
///
/// Price and quantity are pre-formatted strings: they must already be
/// aligned to the symbol's tick and step sizes.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub symbol: String,
    pub side: GridSide,
    pub kind: OrderKind,
    pub quantity: String,
    pub client_order_id: Option<String>,
    pub reduce_only: bool,
}

impl NewOrder {
    pub fn market(symbol: &str, side: GridSide, quantity: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Market,
            quantity,
            client_order_id: None,
            reduce_only: false,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn is_limit(&self) -> bool {
        matches!(self.kind, OrderKind::Limit { .. })
    }

    /// Wire parameters in submission order.
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("symbol", self.symbol.clone()),
            ("side", self.side.as_str().to_string()),
        ];
        match &self.kind {
            OrderKind::Limit { price } => {
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                params.push(("price", price.clone()));
            }
            OrderKind::Market => params.push(("type", "MARKET".to_string())),
        }
        params.push(("quantity", self.quantity.clone()));
        if let Some(client_id) = &self.client_order_id {
            params.push(("newClientOrderId", client_id.clone()));
        }
        if self.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        params
    }
}

/// Exchange control-plane operations, mockable for tests
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn exchange_info(&self, symbol: &str) -> Result<ExchangeInfo>;

    async fn book_ticker(&self, symbol: &str) -> Result<BookTicker>;

    /// Idempotent from the caller's perspective: "already set" is `Ok`.
    async fn set_margin_type(&self, symbol: &str, margin_type: &str) -> Result<()>;

    /// Idempotent from the caller's perspective: "already set" is `Ok`.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    async fn new_order(&self, order: &NewOrder) -> Result<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<()>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()>;

    async fn available_balance(&self, asset: &str) -> Result<f64>;

    /// Signed position amount for the symbol; positive = long.
    async fn position_amount(&self, symbol: &str) -> Result<f64>;

    async fn account_equity(&self) -> Result<f64>;

    async fn user_trades(&self, symbol: &str, start_ms: u64) -> Result<Vec<UserTrade>>;

    async fn new_listen_key(&self) -> Result<String>;

    async fn keepalive_listen_key(&self, listen_key: &str) -> Result<()>;

    async fn close_listen_key(&self, listen_key: &str) -> Result<()>;
}

/// Run `op` up to five times, backing off exponentially from one second to a
/// 32 second cap. Only rate-limit-family failures are retried; everything
/// else surfaces immediately.
pub async fn with_retry<T, F, Fut>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_secs(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < MAX_RETRY_ATTEMPTS && err.is_retryable() => {
                warn!(
                    "{label} failed ({err}); retrying in {}s (attempt {attempt}/{MAX_RETRY_ATTEMPTS})",
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RETRY_DELAY);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

struct Credentials {
    api_key: String,
    api_secret: String,
}

/// Production REST gateway
pub struct AsterRestClient {
    http: reqwest::Client,
    rest_base: String,
    recv_window: u64,
    dry_run: bool,
    virtual_balance: f64,
    credentials: Option<Credentials>,
    /// Serializes signed requests so timestamps stay monotonic per key
    sign_lock: tokio::sync::Mutex<()>,
}

impl AsterRestClient {
    /// Build a client from config plus optional credential overrides; the
    /// `ASTER_API_KEY` / `ASTER_API_SECRET` environment variables fill in
    /// whatever the overrides leave unset. Live mode requires credentials.
    pub fn new(
        cfg: &BotConfig,
        api_key: Option<String>,
        api_secret: Option<String>,
    ) -> Result<Self> {
        let api_key = api_key.or_else(|| std::env::var("ASTER_API_KEY").ok());
        let api_secret = api_secret.or_else(|| std::env::var("ASTER_API_SECRET").ok());
        let credentials = match (api_key, api_secret) {
            (Some(api_key), Some(api_secret)) if !api_key.is_empty() && !api_secret.is_empty() => {
                Some(Credentials {
                    api_key,
                    api_secret,
                })
            }
            _ => None,
        };
        if !cfg.dry_run && credentials.is_none() {
            return Err(BotError::Config(
                "API key/secret required when dry_run is false".into(),
            ));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(15))
            .pool_max_idle_per_host(5)
            .user_agent(concat!("aster-grid-bot/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            rest_base: cfg.rest_base.clone(),
            recv_window: cfg.recv_window,
            dry_run: cfg.dry_run,
            virtual_balance: cfg.dry_run_virtual_balance,
            credentials,
            sign_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn public_get(&self, path: &str, params: &[(&'static str, String)]) -> Result<Value> {
        let mut url = format!("{}{}", self.rest_base, path);
        if !params.is_empty() {
            url.push('?');
            url.push_str(&encode_params(params));
        }
        let response = self.http.get(&url).send().await?;
        handle_response(response).await
    }

    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&'static str, String)>,
    ) -> Result<Value> {
        let creds = self.credentials.as_ref().ok_or_else(|| {
            BotError::Config("API credentials missing for signed request".into())
        })?;
        params.push(("timestamp", unix_millis().to_string()));
        params.push(("recvWindow", self.recv_window.to_string()));
        let query = encode_params(&params);
        let signature = sign_query(&query, &creds.api_secret);
        let url = format!("{}{}?{}&signature={}", self.rest_base, path, query, signature);

        let _guard = self.sign_lock.lock().await;
        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await?;
        handle_response(response).await
    }
}

#[async_trait]
impl Gateway for AsterRestClient {
    async fn exchange_info(&self, symbol: &str) -> Result<ExchangeInfo> {
        let symbol_upper = symbol.to_uppercase();
        let data = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;
        let symbols = data
            .get("symbols")
            .and_then(Value::as_array)
            .ok_or_else(|| BotError::Payload("exchangeInfo missing symbols".into()))?;
        let entry = symbols
            .iter()
            .find(|entry| entry.get("symbol").and_then(Value::as_str) == Some(symbol_upper.as_str()))
            .ok_or_else(|| {
                BotError::Payload(format!("symbol {symbol_upper} not found in exchangeInfo"))
            })?;
        let filter_entries = entry
            .get("filters")
            .and_then(Value::as_array)
            .map(|entries| entries.as_slice())
            .unwrap_or(&[]);
        let filters = parse_filters(filter_entries)?;
        let rate_limits = data
            .get("rateLimits")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .map(|rl| RateLimit {
                        interval: rl
                            .get("interval")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        interval_num: rl.get("intervalNum").and_then(value_to_u64).unwrap_or(0)
                            as u32,
                        limit: rl.get("limit").and_then(value_to_u64).unwrap_or(0) as u32,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(ExchangeInfo {
            symbol: symbol_upper,
            filters,
            rate_limits,
        })
    }

    async fn book_ticker(&self, symbol: &str) -> Result<BookTicker> {
        let data = self
            .public_get(
                "/fapi/v1/ticker/bookTicker",
                &[("symbol", symbol.to_uppercase())],
            )
            .await?;
        let bid = data
            .get("bidPrice")
            .or_else(|| data.get("b"))
            .and_then(value_to_f64)
            .ok_or_else(|| BotError::Payload("bookTicker missing bid".into()))?;
        let ask = data
            .get("askPrice")
            .or_else(|| data.get("a"))
            .and_then(value_to_f64)
            .ok_or_else(|| BotError::Payload("bookTicker missing ask".into()))?;
        Ok(BookTicker { bid, ask })
    }

    async fn set_margin_type(&self, symbol: &str, margin_type: &str) -> Result<()> {
        if self.dry_run {
            info!("[DRY] set margin type {symbol} {margin_type}");
            return Ok(());
        }
        let params = vec![
            ("symbol", symbol.to_uppercase()),
            ("marginType", margin_type.to_string()),
        ];
        match self
            .signed_request(Method::POST, "/fapi/v1/marginType", params)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_already_set() => {
                info!("Margin type already set for {symbol}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        if self.dry_run {
            info!("[DRY] set leverage {symbol} {leverage}");
            return Ok(());
        }
        let params = vec![
            ("symbol", symbol.to_uppercase()),
            ("leverage", leverage.to_string()),
        ];
        match self
            .signed_request(Method::POST, "/fapi/v1/leverage", params)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_already_set() => {
                info!("Leverage already set for {symbol}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn new_order(&self, order: &NewOrder) -> Result<OrderAck> {
        if self.dry_run {
            let ack = OrderAck {
                order_id: rand::thread_rng().gen_range(0..1_000_000_000),
                client_order_id: order.client_order_id.clone(),
                status: "NEW".to_string(),
            };
            info!(
                "[DRY] new order {} {:?} qty={} -> id={}",
                order.side.as_str(),
                order.kind,
                order.quantity,
                ack.order_id
            );
            return Ok(ack);
        }
        let data = self
            .signed_request(Method::POST, "/fapi/v1/order", order.to_params())
            .await?;
        let order_id = data
            .get("orderId")
            .and_then(value_to_u64)
            .ok_or_else(|| BotError::Payload("order ack missing orderId".into()))?;
        Ok(OrderAck {
            order_id,
            client_order_id: data
                .get("clientOrderId")
                .and_then(Value::as_str)
                .map(str::to_string),
            status: data
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("NEW")
                .to_string(),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<()> {
        if self.dry_run {
            info!("[DRY] cancel order {symbol} {order_id}");
            return Ok(());
        }
        let params = vec![
            ("symbol", symbol.to_uppercase()),
            ("orderId", order_id.to_string()),
        ];
        self.signed_request(Method::DELETE, "/fapi/v1/order", params)
            .await?;
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        if self.dry_run {
            info!("[DRY] cancel all orders {symbol}");
            return Ok(());
        }
        let params = vec![("symbol", symbol.to_uppercase())];
        self.signed_request(Method::DELETE, "/fapi/v1/allOpenOrders", params)
            .await?;
        Ok(())
    }

    async fn available_balance(&self, asset: &str) -> Result<f64> {
        if self.dry_run {
            return Ok(self.virtual_balance);
        }
        let payload = self
            .signed_request(Method::GET, "/fapi/v2/balance", Vec::new())
            .await?;
        let asset_upper = asset.to_uppercase();
        for entry in record_array(&payload, &["data"]) {
            if entry.get("asset").and_then(Value::as_str) == Some(asset_upper.as_str()) {
                return Ok(entry
                    .get("availableBalance")
                    .and_then(value_to_f64)
                    .unwrap_or(0.0));
            }
        }
        Ok(0.0)
    }

    async fn position_amount(&self, symbol: &str) -> Result<f64> {
        if self.dry_run {
            return Ok(0.0);
        }
        let payload = self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", Vec::new())
            .await?;
        let symbol_upper = symbol.to_uppercase();
        for entry in record_array(&payload, &["positions", "data", "rows"]) {
            if entry.get("symbol").and_then(Value::as_str) == Some(symbol_upper.as_str()) {
                return Ok(entry
                    .get("positionAmt")
                    .and_then(value_to_f64)
                    .unwrap_or(0.0));
            }
        }
        Ok(0.0)
    }

    async fn account_equity(&self) -> Result<f64> {
        if self.dry_run {
            return Ok(self.virtual_balance);
        }
        let payload = self
            .signed_request(Method::GET, "/fapi/v2/account", Vec::new())
            .await?;
        Ok(payload
            .get("totalMarginBalance")
            .and_then(value_to_f64)
            .unwrap_or(0.0))
    }

    async fn user_trades(&self, symbol: &str, start_ms: u64) -> Result<Vec<UserTrade>> {
        if self.dry_run {
            return Ok(Vec::new());
        }
        let params = vec![
            ("symbol", symbol.to_uppercase()),
            ("startTime", start_ms.to_string()),
        ];
        let payload = self
            .signed_request(Method::GET, "/fapi/v1/userTrades", params)
            .await?;
        Ok(record_array(&payload, &["data"])
            .into_iter()
            .filter_map(|entry| {
                entry
                    .get("time")
                    .and_then(value_to_u64)
                    .map(|time| UserTrade { time })
            })
            .collect())
    }

    async fn new_listen_key(&self) -> Result<String> {
        if self.dry_run {
            let token = format!("dry-{}", Uuid::new_v4().simple());
            info!("[DRY] new listen key {token}");
            return Ok(token);
        }
        let data = self
            .signed_request(Method::POST, "/fapi/v1/listenKey", Vec::new())
            .await?;
        Ok(data
            .get("listenKey")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn keepalive_listen_key(&self, listen_key: &str) -> Result<()> {
        if self.dry_run {
            debug!("[DRY] keepalive listen key {listen_key}");
            return Ok(());
        }
        let params = vec![("listenKey", listen_key.to_string())];
        self.signed_request(Method::PUT, "/fapi/v1/listenKey", params)
            .await?;
        Ok(())
    }

    async fn close_listen_key(&self, listen_key: &str) -> Result<()> {
        if self.dry_run {
            info!("[DRY] close listen key {listen_key}");
            return Ok(());
        }
        let params = vec![("listenKey", listen_key.to_string())];
        self.signed_request(Method::DELETE, "/fapi/v1/listenKey", params)
            .await?;
        Ok(())
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn encode_params(params: &[(&'static str, String)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

fn sign_query(query: &str, secret: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

async fn handle_response(response: reqwest::Response) -> Result<Value> {
    let status = response.status().as_u16();
    let text = response.text().await?;
    let payload: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) => {
            return Err(BotError::Rest {
                status,
                payload: json!({"error": "invalid json", "body": text}),
            })
        }
    };
    if status >= 400 {
        return Err(BotError::Rest { status, payload });
    }
    Ok(payload)
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

fn value_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

/// Locate the record list inside a payload that may be a bare array, an
/// envelope keyed by one of `keys`, or a plain object.
fn record_array<'a>(payload: &'a Value, keys: &[&str]) -> Vec<&'a Value> {
    if let Some(items) = payload.as_array() {
        return items.iter().collect();
    }
    if let Some(map) = payload.as_object() {
        for key in keys {
            if let Some(items) = map.get(*key).and_then(Value::as_array) {
                return items.iter().collect();
            }
        }
        return map.values().collect();
    }
    Vec::new()
}

fn parse_filters(entries: &[Value]) -> Result<SymbolFilters> {
    let mut tick_size = None;
    let mut step_size = None;
    let mut min_qty = None;
    let mut min_notional = None;
    for item in entries {
        let filter_type = item
            .get("filterType")
            .or_else(|| item.get("type"))
            .and_then(Value::as_str);
        match filter_type {
            Some("PRICE_FILTER") => {
                tick_size = item.get("tickSize").and_then(value_to_f64);
            }
            Some("LOT_SIZE") => {
                step_size = item.get("stepSize").and_then(value_to_f64);
                min_qty = item.get("minQty").and_then(value_to_f64);
            }
            Some("MIN_NOTIONAL") => {
                min_notional = item
                    .get("notional")
                    .or_else(|| item.get("minNotional"))
                    .and_then(value_to_f64);
            }
            _ => {}
        }
    }
    match (tick_size, step_size, min_qty, min_notional) {
        (Some(tick_size), Some(step_size), Some(min_qty), Some(min_notional)) => Ok(SymbolFilters {
            tick_size,
            step_size,
            min_qty,
            min_notional,
        }),
        _ => Err(BotError::Payload("missing symbol filters".into())),
    }
}

// ============================================================================
// Mock implementation for tests
// ============================================================================

/// Mock gateway for exercising the controller without a real exchange.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Mutex;

    pub struct MockGateway {
        pub filters: SymbolFilters,
        pub book: Mutex<BookTicker>,
        pub balance: Mutex<f64>,
        pub equity: Mutex<f64>,
        pub position: Mutex<f64>,
        /// Every order the exchange accepted, in submission order
        pub orders: Mutex<Vec<NewOrder>>,
        pub cancelled: Mutex<Vec<u64>>,
        pub cancel_all_calls: AtomicU64,
        pub keepalives: AtomicU64,
        pub trades: Mutex<Vec<UserTrade>>,
        pub fail_orders: Mutex<bool>,
        /// Error code the next `cancel_order` should fail with
        pub cancel_error_code: Mutex<Option<i64>>,
        next_order_id: AtomicU64,
        next_listen_key: AtomicU64,
    }

    impl MockGateway {
        pub fn new(filters: SymbolFilters, bid: f64, ask: f64) -> Self {
            Self {
                filters,
                book: Mutex::new(BookTicker { bid, ask }),
                balance: Mutex::new(10_000.0),
                equity: Mutex::new(10_000.0),
                position: Mutex::new(0.0),
                orders: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
                cancel_all_calls: AtomicU64::new(0),
                keepalives: AtomicU64::new(0),
                trades: Mutex::new(Vec::new()),
                fail_orders: Mutex::new(false),
                cancel_error_code: Mutex::new(None),
                next_order_id: AtomicU64::new(1),
                next_listen_key: AtomicU64::new(1),
            }
        }

        pub async fn set_book(&self, bid: f64, ask: f64) {
            *self.book.lock().await = BookTicker { bid, ask };
        }

        /// Accepted limit orders only (skips market orders).
        pub async fn limit_orders(&self) -> Vec<NewOrder> {
            self.orders
                .lock()
                .await
                .iter()
                .filter(|order| order.is_limit())
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl Gateway for MockGateway {
        async fn exchange_info(&self, symbol: &str) -> Result<ExchangeInfo> {
            Ok(ExchangeInfo {
                symbol: symbol.to_uppercase(),
                filters: self.filters,
                rate_limits: Vec::new(),
            })
        }

        async fn book_ticker(&self, _symbol: &str) -> Result<BookTicker> {
            Ok(*self.book.lock().await)
        }

        async fn set_margin_type(&self, _symbol: &str, _margin_type: &str) -> Result<()> {
            Ok(())
        }

        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<()> {
            Ok(())
        }

        async fn new_order(&self, order: &NewOrder) -> Result<OrderAck> {
            if *self.fail_orders.lock().await {
                return Err(BotError::Payload("mock order failure".into()));
            }
            self.orders.lock().await.push(order.clone());
            Ok(OrderAck {
                order_id: self.next_order_id.fetch_add(1, Ordering::SeqCst),
                client_order_id: order.client_order_id.clone(),
                status: "NEW".to_string(),
            })
        }

        async fn cancel_order(&self, _symbol: &str, order_id: u64) -> Result<()> {
            if let Some(code) = self.cancel_error_code.lock().await.take() {
                return Err(BotError::Rest {
                    status: 400,
                    payload: serde_json::json!({"code": code, "msg": "mock cancel error"}),
                });
            }
            self.cancelled.lock().await.push(order_id);
            Ok(())
        }

        async fn cancel_all_orders(&self, _symbol: &str) -> Result<()> {
            self.cancel_all_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn available_balance(&self, _asset: &str) -> Result<f64> {
            Ok(*self.balance.lock().await)
        }

        async fn position_amount(&self, _symbol: &str) -> Result<f64> {
            Ok(*self.position.lock().await)
        }

        async fn account_equity(&self) -> Result<f64> {
            Ok(*self.equity.lock().await)
        }

        async fn user_trades(&self, _symbol: &str, _start_ms: u64) -> Result<Vec<UserTrade>> {
            Ok(self.trades.lock().await.clone())
        }

        async fn new_listen_key(&self) -> Result<String> {
            let id = self.next_listen_key.fetch_add(1, Ordering::SeqCst);
            Ok(format!("mock-key-{id}"))
        }

        async fn keepalive_listen_key(&self, _listen_key: &str) -> Result<()> {
            self.keepalives.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close_listen_key(&self, _listen_key: &str) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_sign_query_known_vectors() {
        let secret = "test-secret";
        let query = "symbol=BTCUSDT&side=BUY&type=LIMIT&timeInForce=GTC&price=59980.00&quantity=0.001&timestamp=1700000000000&recvWindow=5000";
        assert_eq!(
            sign_query(query, secret),
            "261932acff2b7afaedcaa1329bd314d31f8970794e42ff38962a80e49040ee83"
        );

        let query = "symbol=BTCUSDT&timestamp=1700000000000&recvWindow=5000";
        assert_eq!(
            sign_query(query, secret),
            "c201372a9a7f79a53a289fccae4136f400d519701924c18cb6c5ecc7e2c4e6c6"
        );
    }

    #[test]
    fn test_encode_params_preserves_order() {
        let params = vec![
            ("symbol", "BTCUSDT".to_string()),
            ("side", "BUY".to_string()),
            ("quantity", "0.001".to_string()),
        ];
        assert_eq!(encode_params(&params), "symbol=BTCUSDT&side=BUY&quantity=0.001");
    }

    #[test]
    fn test_limit_order_params() {
        let order = NewOrder {
            symbol: "BTCUSDT".to_string(),
            side: GridSide::Sell,
            kind: OrderKind::Limit {
                price: "60020.00".to_string(),
            },
            quantity: "0.001".to_string(),
            client_order_id: Some("MVP21_BTCUSDT_1_42".to_string()),
            reduce_only: true,
        };
        let params = order.to_params();
        assert_eq!(
            params,
            vec![
                ("symbol", "BTCUSDT".to_string()),
                ("side", "SELL".to_string()),
                ("type", "LIMIT".to_string()),
                ("timeInForce", "GTC".to_string()),
                ("price", "60020.00".to_string()),
                ("quantity", "0.001".to_string()),
                ("newClientOrderId", "MVP21_BTCUSDT_1_42".to_string()),
                ("reduceOnly", "true".to_string()),
            ]
        );
    }

    #[test]
    fn test_market_order_params() {
        let order = NewOrder::market("BTCUSDT", GridSide::Buy, "0.004".to_string());
        let params = order.to_params();
        assert_eq!(
            params,
            vec![
                ("symbol", "BTCUSDT".to_string()),
                ("side", "BUY".to_string()),
                ("type", "MARKET".to_string()),
                ("quantity", "0.004".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_filters() {
        let entries = vec![
            json!({"filterType": "PRICE_FILTER", "tickSize": "0.01"}),
            json!({"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"}),
            json!({"filterType": "MIN_NOTIONAL", "notional": "5"}),
        ];
        let filters = parse_filters(&entries).unwrap();
        assert!((filters.tick_size - 0.01).abs() < 1e-12);
        assert!((filters.step_size - 0.001).abs() < 1e-12);
        assert!((filters.min_qty - 0.001).abs() < 1e-12);
        assert!((filters.min_notional - 5.0).abs() < 1e-12);

        // minNotional spelling variant
        let entries = vec![
            json!({"filterType": "PRICE_FILTER", "tickSize": "0.01"}),
            json!({"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"}),
            json!({"filterType": "MIN_NOTIONAL", "minNotional": "5"}),
        ];
        assert!(parse_filters(&entries).is_ok());

        // Missing LOT_SIZE fails
        let entries = vec![json!({"filterType": "PRICE_FILTER", "tickSize": "0.01"})];
        assert!(parse_filters(&entries).is_err());
    }

    #[test]
    fn test_record_array_shapes() {
        let bare = json!([{"asset": "USDT"}]);
        assert_eq!(record_array(&bare, &["data"]).len(), 1);

        let enveloped = json!({"data": [{"asset": "USDT"}, {"asset": "BTC"}]});
        assert_eq!(record_array(&enveloped, &["data"]).len(), 2);

        let object = json!({"first": {"asset": "USDT"}});
        assert_eq!(record_array(&object, &["data"]).len(), 1);

        assert!(record_array(&json!("text"), &["data"]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_backs_off_on_rate_limit() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32> = with_retry("test op", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(BotError::Rest {
                        status: 429,
                        payload: json!({"code": -1003}),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_surfaces_non_retryable_immediately() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry("test op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(BotError::Rest {
                    status: 400,
                    payload: json!({"code": -2011}),
                })
            }
        })
        .await;
        assert!(result.unwrap_err().is_duplicate_order());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry("test op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(BotError::Rest {
                    status: 503,
                    payload: json!({}),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }
}
