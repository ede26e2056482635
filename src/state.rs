//! Runtime order-table state and stream liveness clocks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::filters::Formatter;
use crate::grid::GridSide;

/// Exchange order status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    /// Parse the exchange wire representation; unknown strings are `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NEW" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" => Some(OrderStatus::Canceled),
            "EXPIRED" => Some(OrderStatus::Expired),
            "REJECTED" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }

    /// Terminal without a fill; the record is simply dropped.
    pub fn is_terminal_non_fill(&self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }
}

/// A resting order as the bot tracks it
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub level_index: usize,
    pub side: GridSide,
    pub price: f64,
    pub quantity: f64,
    pub client_order_id: String,
    pub order_id: u64,
    pub status: OrderStatus,
}

/// Order table guarded by the controller's order-lock
///
/// The two maps are kept consistent by construction: every mutation goes
/// through `track_order` or `drop_order`, which update both together.
#[derive(Debug, Default)]
pub struct RuntimeState {
    pub grid_center: f64,
    pub open_orders: HashMap<u64, OrderRecord>,
    pub by_client_id: HashMap<String, u64>,
}

impl RuntimeState {
    pub fn new(grid_center: f64) -> Self {
        Self {
            grid_center,
            open_orders: HashMap::new(),
            by_client_id: HashMap::new(),
        }
    }

    pub fn track_order(&mut self, order_id: u64, record: OrderRecord) {
        self.by_client_id
            .insert(record.client_order_id.clone(), order_id);
        self.open_orders.insert(order_id, record);
    }

    pub fn drop_order(&mut self, order_id: u64) {
        if let Some(record) = self.open_orders.remove(&order_id) {
            self.by_client_id.remove(&record.client_order_id);
        }
    }

    pub fn get_by_client_id(&self, client_id: &str) -> Option<&OrderRecord> {
        self.by_client_id
            .get(client_id)
            .and_then(|order_id| self.open_orders.get(order_id))
    }

    /// At-most-one-order-per-price check, compared at wire precision.
    pub fn order_exists(&self, side: GridSide, price: f64, fmt: &Formatter) -> bool {
        let target = fmt.price(price);
        self.open_orders
            .values()
            .any(|record| record.side == side && fmt.price(record.price) == target)
    }

    pub fn count_side(&self, side: GridSide) -> usize {
        self.open_orders
            .values()
            .filter(|record| record.side == side)
            .count()
    }
}

/// Lock-free cell for an `f64` written by one stream task and read anywhere
#[derive(Debug)]
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub(crate) fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub(crate) fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Best bid/ask and last observed mid, updated without taking the order-lock
#[derive(Debug)]
pub struct BookTop {
    bid: AtomicF64,
    ask: AtomicF64,
    mid: AtomicF64,
}

impl BookTop {
    pub fn new() -> Self {
        Self {
            bid: AtomicF64::new(0.0),
            ask: AtomicF64::new(0.0),
            mid: AtomicF64::new(0.0),
        }
    }

    pub fn update(&self, bid: f64, ask: f64) {
        self.bid.store(bid);
        self.ask.store(ask);
        self.mid.store((bid + ask) / 2.0);
    }

    pub fn store_mid(&self, mid: f64) {
        self.mid.store(mid);
    }

    pub fn bid(&self) -> Option<f64> {
        positive(self.bid.load())
    }

    pub fn ask(&self) -> Option<f64> {
        positive(self.ask.load())
    }

    pub fn mid(&self) -> Option<f64> {
        positive(self.mid.load())
    }
}

impl Default for BookTop {
    fn default() -> Self {
        Self::new()
    }
}

fn positive(value: f64) -> Option<f64> {
    (value > 0.0).then_some(value)
}

/// Monotonic clocks for stream liveness and recenter debouncing
///
/// Readings are milliseconds against a process-start epoch so that updates
/// are scalar atomic stores.
#[derive(Debug)]
pub struct StreamClocks {
    epoch: Instant,
    last_market_ms: AtomicU64,
    last_user_ms: AtomicU64,
    last_recenter_ms: AtomicU64,
}

impl StreamClocks {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_market_ms: AtomicU64::new(0),
            last_user_ms: AtomicU64::new(0),
            last_recenter_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn touch_market(&self) {
        self.last_market_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn touch_user(&self) {
        self.last_user_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn touch_recenter(&self) {
        self.last_recenter_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn market_age(&self) -> Duration {
        self.age_of(&self.last_market_ms)
    }

    pub fn user_age(&self) -> Duration {
        self.age_of(&self.last_user_ms)
    }

    pub fn recenter_age(&self) -> Duration {
        self.age_of(&self.last_recenter_ms)
    }

    fn age_of(&self, cell: &AtomicU64) -> Duration {
        let last = cell.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }
}

impl Default for StreamClocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl StreamClocks {
    fn backdate(&self, cell: &AtomicU64, age: Duration) {
        let target = self.now_ms().saturating_sub(age.as_millis() as u64);
        cell.store(target, Ordering::Relaxed);
    }

    pub(crate) fn backdate_market(&self, age: Duration) {
        self.backdate(&self.last_market_ms, age);
    }

    pub(crate) fn backdate_user(&self, age: Duration) {
        self.backdate(&self.last_user_ms, age);
    }

    pub(crate) fn backdate_recenter(&self, age: Duration) {
        self.backdate(&self.last_recenter_ms, age);
    }
}
