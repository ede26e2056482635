//! Order lifecycle controller
//!
//! The controller owns the runtime state and is the only component that
//! issues order mutations. It ingests the market book-ticker stream and the
//! authenticated user stream, keeps the in-memory order table consistent
//! with the exchange, and runs the maker-guard, fill-refill, recenter,
//! kill-switch, and maintenance loops on top of a [`Gateway`].

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::BotConfig;
use crate::errors::{BotError, Result};
use crate::events::{BookTickerEvent, OrderTradeUpdate, UserEvent};
use crate::filters::{ceil_to_tick, floor_to_tick, Formatter, SymbolFilters};
use crate::grid::{build_grid, preferred_base_quantity, GridLayout, GridLevel, GridSide};
use crate::notifier::{self, HealthSnapshot};
use crate::rest::{with_retry, Gateway, NewOrder, OrderKind};
use crate::state::{BookTop, OrderRecord, OrderStatus, RuntimeState, StreamClocks};

const CLIENT_ID_PREFIX: &str = "MVP21";
const MAKER_GUARD_MAX_STEPS: u32 = 50;
/// Minimum elapsed time between two recenters
const RECENTER_COOLDOWN: Duration = Duration::from_secs(300);
const FLATTEN_POLL_ATTEMPTS: u32 = 10;
const FLATTEN_POLL_DELAY: Duration = Duration::from_millis(500);
const MARKET_RECONNECT_DELAY: Duration = Duration::from_secs(3);
const USER_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const LISTEN_KEY_REFRESH: Duration = Duration::from_secs(30 * 60);
const ORDER_PANEL_INTERVAL: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Which stream the kill-switch found stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StallKind {
    Market,
    User,
}

impl StallKind {
    fn reason(&self) -> &'static str {
        match self {
            StallKind::Market => "market data stalled",
            StallKind::User => "user data stalled",
        }
    }
}

/// Grid market-making bot over an exchange gateway
pub struct GridBot<G: Gateway> {
    cfg: BotConfig,
    gateway: G,
    filters: SymbolFilters,
    fmt: Formatter,
    /// Best bid/ask and last mid, written by the market path without a lock
    book: BookTop,
    clocks: StreamClocks,
    layout: RwLock<GridLayout>,
    /// The order-lock: guards the order table, held only across local work
    state: Mutex<RuntimeState>,
    /// Serializes recenter/rebuild bodies
    restart_lock: Mutex<()>,
    listen_key: Mutex<Option<String>>,
    stop: watch::Sender<bool>,
}

impl<G: Gateway + 'static> GridBot<G> {
    /// Bootstrap the bot: load exchange info, configure margin and leverage,
    /// size and build the grid, acquire the base position, deploy the
    /// initial orders, and (when live) obtain a listen key.
    pub async fn bootstrap(cfg: BotConfig, gateway: G) -> Result<Self> {
        let info = gateway.exchange_info(&cfg.symbol).await?;
        let filters = info.filters;
        let fmt = Formatter::from_filters(&filters);
        info!(
            "Loaded exchange info: tick={} step={} minQty={} minNotional={}",
            filters.tick_size, filters.step_size, filters.min_qty, filters.min_notional
        );
        if cfg.mode != "ONE_WAY" {
            warn!("Configured mode {} differs from enforced ONE_WAY", cfg.mode);
        }

        with_retry("set margin type", || {
            gateway.set_margin_type(&cfg.symbol, &cfg.margin_type)
        })
        .await?;
        with_retry("set leverage", || {
            gateway.set_leverage(&cfg.symbol, cfg.leverage)
        })
        .await?;

        let ticker = gateway.book_ticker(&cfg.symbol).await?;
        let mid = ticker.mid();
        info!(
            "Initial mid price {:.4} (bid={:.4} ask={:.4})",
            mid, ticker.bid, ticker.ask
        );

        let levels_per_side = Self::determine_levels_per_side(&cfg, &gateway, mid).await?;
        let layout = build_grid(mid, &cfg, &filters, levels_per_side)?;
        info!(
            "Grid ready: center={:.4} spacing={:.4} levels/side={} (total={}) lower={:.4} upper={:.4}",
            layout.center_price,
            layout.spacing,
            layout.levels_per_side,
            layout.levels.len(),
            layout.lower_price,
            layout.upper_price
        );

        let book = BookTop::new();
        book.update(ticker.bid, ticker.ask);

        let bot = Self {
            filters,
            fmt,
            book,
            clocks: StreamClocks::new(),
            layout: RwLock::new(layout),
            state: Mutex::new(RuntimeState::new(mid)),
            restart_lock: Mutex::new(()),
            listen_key: Mutex::new(None),
            stop: watch::channel(false).0,
            cfg,
            gateway,
        };
        bot.clocks.touch_market();

        bot.establish_base_position().await?;
        bot.deploy_initial_orders().await?;
        bot.clocks.touch_recenter();

        if !bot.cfg.dry_run {
            let key = with_retry("listen key", || bot.gateway.new_listen_key()).await?;
            info!("Obtained listenKey {key}");
            *bot.listen_key.lock().await = Some(key);
        }
        Ok(bot)
    }

    /// Run until [`request_stop`](Self::request_stop) is called.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!("Starting Aster grid bot (dry_run={})", self.cfg.dry_run);
        let mut tasks: Vec<JoinHandle<()>> = vec![
            tokio::spawn(Arc::clone(&self).market_stream_loop()),
            tokio::spawn(Arc::clone(&self).kill_switch_loop()),
            tokio::spawn(Arc::clone(&self).maintenance_loop()),
        ];
        if !self.cfg.dry_run {
            tasks.push(tokio::spawn(Arc::clone(&self).user_stream_loop()));
            tasks.push(tokio::spawn(Arc::clone(&self).listen_key_keepalive_loop()));
        }
        if self.cfg.status_notify_send_key.is_some() {
            tasks.push(tokio::spawn(Arc::clone(&self).status_notifier_loop()));
        }

        let mut stop = self.stop.subscribe();
        let _ = stop.wait_for(|stopped| *stopped).await;
        self.shutdown(tasks).await;
        Ok(())
    }

    /// Signal every task to wind down.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Gateway access, mainly for inspection in tests.
    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    async fn shutdown(&self, tasks: Vec<JoinHandle<()>>) {
        for mut task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
                let _ = task.await;
            }
        }
        if !self.cfg.dry_run {
            if let Some(key) = self.listen_key.lock().await.take() {
                if let Err(err) = self.gateway.close_listen_key(&key).await {
                    warn!("Failed to close listen key: {err}");
                }
            }
        }
        info!("Bot shutdown complete");
    }

    // ------------------------------------------------------------------
    // Sizing and deployment
    // ------------------------------------------------------------------

    /// Derive levels per side from the available margin: half the budget per
    /// side, one order-notional of margin per level, clamped below by the
    /// configured minimum and above by the per-side resting-order cap.
    async fn determine_levels_per_side(cfg: &BotConfig, gateway: &G, mid: f64) -> Result<usize> {
        let reserve = cfg.margin_reserve_pct.clamp(0.0, 1.0);
        let leverage = cfg.leverage.max(1) as f64;
        let available = gateway.available_balance("USDT").await?;
        let margin_budget = (available * (1.0 - reserve)).max(0.0);
        let base_qty = preferred_base_quantity(cfg);
        let per_order_notional = if base_qty > 0.0 {
            mid * base_qty
        } else {
            cfg.per_order_quote_usd
        };
        let pair_margin = per_order_notional / leverage * 2.0;
        let min_levels = cfg.min_levels_per_side.max(1) as usize;
        if pair_margin <= 0.0 {
            warn!("Pair margin computed as {pair_margin:.4}; using min_levels_per_side");
            return Ok(min_levels);
        }
        let raw_levels = (margin_budget / pair_margin).floor() as usize;
        if raw_levels < min_levels {
            warn!("Available margin {available:.2} funds only {raw_levels} level pairs; using min_levels_per_side={min_levels}");
        }
        let mut levels = raw_levels.max(min_levels);
        if cfg.max_resting_orders_per_side > 0 {
            levels = levels.min(cfg.max_resting_orders_per_side as usize).max(1);
        }
        info!(
            "Grid sizing: available={available:.2} reserve={:.0}% perOrderNotional={per_order_notional:.2} pairMargin={pair_margin:.2} leverage={} -> levels/side={levels}",
            reserve * 100.0,
            cfg.leverage
        );
        Ok(levels)
    }

    /// Market-buy the aggregate sell-side quantity so the reduce-only sell
    /// levels have inventory to close.
    async fn establish_base_position(&self) -> Result<()> {
        let (sell_quantity, center) = {
            let layout = self.layout.read().await;
            let total: f64 = layout.sell_levels().map(|level| level.quantity).sum();
            (total, layout.center_price)
        };
        if sell_quantity <= 0.0 {
            return Ok(());
        }
        let step = self.filters.step_size;
        let quantity = self
            .fmt
            .round_quantity(((sell_quantity / step).ceil() * step).max(step));
        if quantity <= 0.0 {
            return Ok(());
        }
        info!(
            "Acquiring base position qty={} (~{:.2} USDT)",
            self.fmt.quantity(quantity),
            quantity * center
        );
        let order = NewOrder::market(&self.cfg.symbol, GridSide::Buy, self.fmt.quantity(quantity));
        if let Err(err) = with_retry("base position", || self.gateway.new_order(&order)).await {
            error!("Failed to acquire base position: {err}");
            if let Ok(position) = self.gateway.position_amount(&self.cfg.symbol).await {
                error!("Current position after failed base position attempt: {position}");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn deploy_initial_orders(&self) -> Result<()> {
        let levels: Vec<GridLevel> = self.layout.read().await.levels.clone();
        for level in levels {
            self.ensure_level_has_order(level).await?;
        }
        self.log_order_panel("deployment").await;
        Ok(())
    }

    /// Place an order for `level` unless its price point is already covered.
    async fn ensure_level_has_order(&self, level: GridLevel) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.order_exists(level.side, level.price, &self.fmt) {
                debug!(
                    "Order already exists for {} at {}, skip",
                    level.side.as_str(),
                    self.fmt.price(level.price)
                );
                return Ok(());
            }
        }
        self.submit_level_order(level).await
    }

    async fn submit_level_order(&self, level: GridLevel) -> Result<()> {
        // Final check before hitting the exchange; the pre-check in
        // ensure_level_has_order ran without the submission in flight.
        {
            let state = self.state.lock().await;
            if state.order_exists(level.side, level.price, &self.fmt) {
                debug!(
                    "Final check: order already exists for {} at {}",
                    level.side.as_str(),
                    self.fmt.price(level.price)
                );
                return Ok(());
            }
        }

        let price = self.adjust_price_for_guard(&level);
        let quantity = self.fmt.round_quantity(level.quantity);
        let client_id = self.make_client_id(&level);
        let order = NewOrder {
            symbol: self.cfg.symbol.clone(),
            side: level.side,
            kind: OrderKind::Limit {
                price: self.fmt.price(price),
            },
            quantity: self.fmt.quantity(quantity),
            client_order_id: Some(client_id.clone()),
            reduce_only: level.side == GridSide::Sell,
        };

        let ack = match with_retry("new order", || self.gateway.new_order(&order)).await {
            Ok(ack) => ack,
            Err(err) if err.is_duplicate_order() => {
                warn!(
                    "Duplicate order detected for {} at {}",
                    level.side.as_str(),
                    self.fmt.price(price)
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let record = OrderRecord {
            level_index: level.index,
            side: level.side,
            price,
            quantity,
            client_order_id: client_id,
            order_id: ack.order_id,
            status: OrderStatus::parse(&ack.status).unwrap_or(OrderStatus::New),
        };
        {
            let mut state = self.state.lock().await;
            state.track_order(ack.order_id, record);
        }
        info!(
            "Placed {} order id={} level={} price={} qty={}",
            level.side.as_str(),
            ack.order_id,
            level.index,
            self.fmt.price(price),
            self.fmt.quantity(quantity)
        );
        Ok(())
    }

    /// Step a level's price away from the top of book until it clears the
    /// maker guard distance, bounded to 50 tick steps.
    fn adjust_price_for_guard(&self, level: &GridLevel) -> f64 {
        let tick = self.filters.tick_size;
        let guard_distance = self.cfg.maker_guard_ticks as f64 * tick;
        let mut price = level.price;
        match level.side {
            GridSide::Buy => {
                if let Some(ask) = self.book.ask() {
                    price = floor_to_tick(price.min(ask - tick), tick);
                    let mut steps = 0;
                    while ask - price <= guard_distance && price > tick {
                        price = (price - tick).max(tick);
                        steps += 1;
                        if steps > MAKER_GUARD_MAX_STEPS {
                            break;
                        }
                    }
                }
            }
            GridSide::Sell => {
                if let Some(bid) = self.book.bid() {
                    price = ceil_to_tick(price.max(bid + tick), tick);
                    let mut steps = 0;
                    while price - bid <= guard_distance {
                        price += tick;
                        steps += 1;
                        if steps > MAKER_GUARD_MAX_STEPS {
                            break;
                        }
                    }
                }
            }
        }
        self.fmt.round_price(price).max(tick)
    }

    fn make_client_id(&self, level: &GridLevel) -> String {
        format!(
            "{CLIENT_ID_PREFIX}_{}_{}_{}",
            self.cfg.symbol,
            level.index,
            wall_clock_ms() % 1_000_000
        )
    }

    // ------------------------------------------------------------------
    // Market event handling
    // ------------------------------------------------------------------

    async fn process_book_ticker(&self, bid: f64, ask: f64) -> Result<()> {
        self.book.update(bid, ask);
        self.clocks.touch_market();
        let mid = (bid + ask) / 2.0;
        self.enforce_maker_guard().await?;
        self.check_recenter(mid).await
    }

    /// Cancel and re-place any resting order that has drifted inside the
    /// maker guard distance from the opposite top of book.
    async fn enforce_maker_guard(&self) -> Result<()> {
        let guard_distance = self.cfg.maker_guard_ticks as f64 * self.filters.tick_size;
        let snapshot: Vec<(u64, GridSide, f64)> = {
            let state = self.state.lock().await;
            state
                .open_orders
                .iter()
                .map(|(order_id, record)| (*order_id, record.side, record.price))
                .collect()
        };
        let bid = self.book.bid();
        let ask = self.book.ask();
        for (order_id, side, price) in snapshot {
            let violated = match side {
                GridSide::Buy => ask.is_some_and(|ask| ask - price <= guard_distance),
                GridSide::Sell => bid.is_some_and(|bid| price - bid <= guard_distance),
            };
            if violated {
                self.reposition_order(order_id).await?;
            }
        }
        Ok(())
    }

    /// Cancel a guard-violating order and re-place it at its grid level; the
    /// guard adjustment inside submission moves it back outside the top of
    /// book. An order the exchange no longer knows is just dropped.
    async fn reposition_order(&self, order_id: u64) -> Result<()> {
        let record = {
            let state = self.state.lock().await;
            match state.open_orders.get(&order_id) {
                Some(record) => record.clone(),
                None => return Ok(()),
            }
        };
        let level = {
            let layout = self.layout.read().await;
            match layout.levels.get(record.level_index) {
                Some(level) => *level,
                None => GridLevel {
                    index: record.level_index,
                    side: record.side,
                    price: record.price,
                    quantity: record.quantity,
                },
            }
        };

        match with_retry("cancel order", || {
            self.gateway.cancel_order(&self.cfg.symbol, order_id)
        })
        .await
        {
            Ok(()) => {}
            Err(err) if err.is_unknown_order() => {
                debug!("Order {order_id} already closed while repositioning, skip");
                self.state.lock().await.drop_order(order_id);
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        self.state.lock().await.drop_order(order_id);

        let replacement = GridLevel {
            index: level.index,
            side: record.side,
            price: level.price,
            quantity: level.quantity,
        };
        debug!("Repositioned order {order_id} side={}", record.side.as_str());
        self.ensure_level_has_order(replacement).await
    }

    async fn check_recenter(&self, mid: f64) -> Result<()> {
        let (center, spacing, levels_per_side) = {
            let layout = self.layout.read().await;
            (layout.center_price, layout.spacing, layout.levels_per_side)
        };
        let span = spacing * levels_per_side.max(1) as f64;
        let threshold = (self.cfg.recenter_threshold * span).max(2.0 * spacing);
        if (mid - center).abs() < threshold {
            return Ok(());
        }
        if self.clocks.recenter_age() < RECENTER_COOLDOWN {
            debug!("Recenter skipped: cooldown active");
            return Ok(());
        }
        warn!(
            "Mid {mid:.2} deviated from center {center:.2} by >= {threshold:.2}, recentering"
        );
        self.rebuild_grid("recenter", Some(mid)).await
    }

    // ------------------------------------------------------------------
    // Recenter / rebuild
    // ------------------------------------------------------------------

    /// Tear down and redeploy the grid around a fresh mid. Used both for
    /// recentering (the trigger supplies the mid) and for stall or
    /// maintenance recovery (the mid comes from a fresh ticker, falling back
    /// to the last observed one).
    async fn rebuild_grid(&self, reason: &str, mid: Option<f64>) -> Result<()> {
        let _guard = self.restart_lock.lock().await;
        let lenient = mid.is_none();
        let mid = match mid {
            Some(mid) => mid,
            None => {
                let from_ticker = match self.gateway.book_ticker(&self.cfg.symbol).await {
                    Ok(ticker) if ticker.bid > 0.0 && ticker.ask > 0.0 => Some(ticker.mid()),
                    Ok(_) => None,
                    Err(err) => {
                        error!("Unable to fetch ticker during rebuild ({reason}): {err}");
                        None
                    }
                };
                match from_ticker.or_else(|| self.book.mid()) {
                    Some(mid) => mid,
                    None => {
                        warn!("Unable to determine mid for rebuild ({reason})");
                        return Ok(());
                    }
                }
            }
        };
        warn!("Rebuilding grid due to {reason} (mid={mid:.2})");

        self.cancel_all_orders(lenient).await?;
        self.flatten_position().await?;

        let levels_per_side =
            Self::determine_levels_per_side(&self.cfg, &self.gateway, mid).await?;
        let layout = build_grid(mid, &self.cfg, &self.filters, levels_per_side)?;
        info!(
            "Rebuild complete: center {:.4} spacing {:.4} levels/side={} total={} lower {:.4} upper {:.4}",
            layout.center_price,
            layout.spacing,
            layout.levels_per_side,
            layout.levels.len(),
            layout.lower_price,
            layout.upper_price
        );
        {
            let mut state = self.state.lock().await;
            *state = RuntimeState::new(mid);
        }
        *self.layout.write().await = layout;
        self.book.store_mid(mid);

        self.establish_base_position().await?;
        self.deploy_initial_orders().await?;
        self.clocks.touch_recenter();
        self.log_order_panel(&format!("rebuild:{reason}")).await;
        Ok(())
    }

    async fn cancel_all_orders(&self, ignore_errors: bool) -> Result<()> {
        match with_retry("cancel all orders", || {
            self.gateway.cancel_all_orders(&self.cfg.symbol)
        })
        .await
        {
            Ok(()) => {}
            Err(err) if ignore_errors => warn!("Cancel all orders failed ({err}), continuing"),
            Err(err) => return Err(err),
        }
        let mut state = self.state.lock().await;
        state.open_orders.clear();
        state.by_client_id.clear();
        Ok(())
    }

    /// Close the current position with a reduce-only market order, then poll
    /// until the exchange reports flat. Rebuilding on top of an open
    /// position is never allowed, so a failed flatten is a hard error.
    async fn flatten_position(&self) -> Result<()> {
        let position = self.gateway.position_amount(&self.cfg.symbol).await?;
        let step = self.filters.step_size;
        if position.abs() < step {
            debug!("No position to flatten: {position}");
            return Ok(());
        }
        let side = if position > 0.0 {
            GridSide::Sell
        } else {
            GridSide::Buy
        };
        let quantity = self
            .fmt
            .round_quantity(((position.abs() / step).floor() * step).max(step));
        if quantity <= 0.0 {
            return Ok(());
        }
        info!(
            "Flattening position side={} qty={}",
            side.as_str(),
            self.fmt.quantity(quantity)
        );
        let order =
            NewOrder::market(&self.cfg.symbol, side, self.fmt.quantity(quantity)).reduce_only();
        with_retry("flatten position", || self.gateway.new_order(&order)).await?;
        self.wait_for_flat(step).await
    }

    async fn wait_for_flat(&self, step: f64) -> Result<()> {
        let mut remaining = 0.0;
        for attempt in 1..=FLATTEN_POLL_ATTEMPTS {
            tokio::time::sleep(FLATTEN_POLL_DELAY).await;
            remaining = self.gateway.position_amount(&self.cfg.symbol).await?;
            if remaining.abs() < step {
                debug!("Position fully flattened after {attempt} attempts");
                return Ok(());
            }
            warn!(
                "Position not fully flattened (attempt {attempt}/{FLATTEN_POLL_ATTEMPTS}): {remaining} (threshold: {step})"
            );
        }
        error!(
            "Failed to fully flatten position after {FLATTEN_POLL_ATTEMPTS} attempts. Current position: {remaining}"
        );
        Err(BotError::PositionNotFlat {
            attempts: FLATTEN_POLL_ATTEMPTS,
            remaining,
        })
    }

    // ------------------------------------------------------------------
    // User event handling
    // ------------------------------------------------------------------

    async fn handle_user_frame(&self, frame: &str) -> Result<()> {
        let Some(event) = UserEvent::from_frame(frame) else {
            return Ok(());
        };
        self.clocks.touch_user();
        match event {
            UserEvent::ListenKeyExpired => {
                error!("Listen key expired, requesting a new one");
                let key = with_retry("listen key", || self.gateway.new_listen_key()).await?;
                *self.listen_key.lock().await = Some(key);
                Ok(())
            }
            UserEvent::OrderTradeUpdate(update) => self.handle_order_trade(update).await,
            UserEvent::Other(kind) => {
                warn!("Unhandled user event type: {kind}");
                Ok(())
            }
        }
    }

    async fn handle_order_trade(&self, update: OrderTradeUpdate) -> Result<()> {
        if update.client_order_id.is_empty() || update.status.is_empty() || update.side.is_empty() {
            warn!("Invalid order trade data: missing client_id/status/side");
            return Ok(());
        }
        let Some(side) = GridSide::from_exchange(&update.side) else {
            return Ok(());
        };
        let Some(status) = OrderStatus::parse(&update.status) else {
            return Ok(());
        };

        // Resolve and mutate the record under the order-lock; the refill
        // placement happens after the lock is released.
        let filled: Option<OrderRecord> = {
            let mut state = self.state.lock().await;
            let order_id = match state.by_client_id.get(&update.client_order_id).copied() {
                Some(order_id) => Some(order_id),
                None => update
                    .order_id
                    .filter(|order_id| state.open_orders.contains_key(order_id)),
            };
            let Some(order_id) = order_id else {
                return Ok(());
            };
            let Some(record) = state.open_orders.get_mut(&order_id) else {
                return Ok(());
            };
            record.status = status;
            if status.is_terminal_non_fill() {
                state.drop_order(order_id);
                return Ok(());
            }
            if matches!(status, OrderStatus::PartiallyFilled | OrderStatus::Filled)
                && update.execution_type == "TRADE"
            {
                info!(
                    "Order {} {} status={status:?} lastFilled={:.6}",
                    record.client_order_id,
                    side.as_str(),
                    update.last_filled_qty
                );
                if status == OrderStatus::Filled {
                    let record = record.clone();
                    state.drop_order(order_id);
                    Some(record)
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let Some(record) = filled {
            self.refill_after_fill(&record, side).await?;
        }
        Ok(())
    }

    /// After a full fill, quote the opposite side one spacing away, reusing
    /// the vacated layout slot (or appending when the slot is gone).
    async fn refill_after_fill(&self, record: &OrderRecord, side: GridSide) -> Result<()> {
        let opposite = side.opposite();
        let respawn = {
            let mut layout = self.layout.write().await;
            match self.compute_relaunch_price(opposite, record.price, &layout) {
                Some(price) => {
                    let index = if record.level_index < layout.levels.len() {
                        record.level_index
                    } else {
                        layout.levels.len()
                    };
                    let level = GridLevel {
                        index,
                        side: opposite,
                        price,
                        quantity: record.quantity,
                    };
                    if index < layout.levels.len() {
                        layout.levels[index] = level;
                    } else {
                        layout.levels.push(level);
                    }
                    Some(level)
                }
                None => {
                    warn!(
                        "Failed to compute refill price for {} after {} fill at {}",
                        opposite.as_str(),
                        side.as_str(),
                        self.fmt.price(record.price)
                    );
                    None
                }
            }
        };

        if let Some(level) = respawn {
            info!(
                "Refilling {} order at {} after {} fill",
                level.side.as_str(),
                self.fmt.price(level.price),
                side.as_str()
            );
            self.ensure_level_has_order(level).await?;
            self.log_order_panel(&format!("{} fill", side.as_str())).await;
        }
        Ok(())
    }

    /// Target price for the order that replaces a fill: one spacing away on
    /// the opposite side, capped at the grid bounds. `None` when the cap
    /// leaves no room (or, for buys, lands within one tick of the fill).
    fn compute_relaunch_price(
        &self,
        side: GridSide,
        reference_price: f64,
        layout: &GridLayout,
    ) -> Option<f64> {
        let spacing = layout.spacing;
        let tick = self.filters.tick_size;
        match side {
            GridSide::Sell => {
                let raw = (reference_price + spacing).max(reference_price + tick);
                let capped = raw.min(layout.upper_price);
                if capped <= reference_price {
                    return None;
                }
                Some(ceil_to_tick(capped, tick))
            }
            GridSide::Buy => {
                let raw = (reference_price - spacing).min(reference_price - tick);
                let capped = raw.max(layout.lower_price);
                if (capped - reference_price).abs() < tick {
                    return None;
                }
                Some(floor_to_tick(capped, tick).max(tick))
            }
        }
    }

    // ------------------------------------------------------------------
    // Stream readers
    // ------------------------------------------------------------------

    async fn market_stream_loop(self: Arc<Self>) {
        let stream_path = format!("{}@bookTicker", self.cfg.symbol.to_lowercase());
        let url = format!("{}/stream?streams={}", self.cfg.ws_market, stream_path);
        info!("Connecting market stream {url}");
        let mut stop = self.stop.subscribe();
        while !*self.stop.borrow() {
            match connect_async(url.as_str()).await {
                Ok((mut ws, _)) => loop {
                    tokio::select! {
                        frame = ws.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                let Some(event) = BookTickerEvent::from_frame(&text) else {
                                    continue;
                                };
                                if event.symbol != self.cfg.symbol {
                                    continue;
                                }
                                if let Err(err) = self.process_book_ticker(event.bid, event.ask).await {
                                    self.handle_task_error("market stream", err);
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = ws.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                error!("Market stream error: {}", BotError::WebSocket(err.to_string()));
                                break;
                            }
                        },
                        _ = stop.changed() => return,
                    }
                },
                Err(err) => error!("Market stream connect failed: {err}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(MARKET_RECONNECT_DELAY) => {}
                _ = stop.wait_for(|stopped| *stopped) => return,
            }
        }
    }

    async fn user_stream_loop(self: Arc<Self>) {
        let mut stop = self.stop.subscribe();
        while !*self.stop.borrow() {
            let key = self.listen_key.lock().await.clone();
            let Some(key) = key else {
                tokio::select! {
                    _ = tokio::time::sleep(USER_RECONNECT_DELAY) => {}
                    _ = stop.wait_for(|stopped| *stopped) => return,
                }
                continue;
            };
            let url = format!("{}/ws/{}", self.cfg.ws_user, key);
            info!("Connecting user stream {url}");
            match connect_async(url.as_str()).await {
                Ok((mut ws, _)) => loop {
                    tokio::select! {
                        frame = ws.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                if let Err(err) = self.handle_user_frame(&text).await {
                                    self.handle_task_error("user stream", err);
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = ws.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                error!("User stream error: {}", BotError::WebSocket(err.to_string()));
                                break;
                            }
                        },
                        _ = stop.changed() => return,
                    }
                },
                Err(err) => error!("User stream connect failed: {err}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(USER_RECONNECT_DELAY) => {}
                _ = stop.wait_for(|stopped| *stopped) => return,
            }
        }
    }

    // ------------------------------------------------------------------
    // Watchdog, maintenance, keepalive, notifier
    // ------------------------------------------------------------------

    async fn kill_switch_loop(self: Arc<Self>) {
        let timeout = Duration::from_millis(self.cfg.kill_switch_ms);
        let interval = Duration::from_secs((self.cfg.kill_switch_ms / 4000).max(5));
        let mut stop = self.stop.subscribe();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.wait_for(|stopped| *stopped) => break,
            }
            if self.clocks.market_age() > timeout {
                self.handle_stall(StallKind::Market).await;
            } else if !self.cfg.dry_run && self.clocks.user_age() > timeout {
                self.handle_stall(StallKind::User).await;
            }
        }
    }

    async fn handle_stall(&self, kind: StallKind) {
        if *self.stop.borrow() {
            return;
        }
        let reason = kind.reason();
        warn!("Connectivity stall detected: {reason}");
        if self.attempt_soft_recovery(kind).await {
            info!("Soft recovery succeeded for {reason}");
            return;
        }
        if let Err(err) = self.rebuild_grid(reason, None).await {
            self.handle_task_error("stall recovery", err);
        }
    }

    /// Cheap recovery before a full rebuild: a REST ticker fetch for market
    /// stalls, a listen-key keepalive (or re-issue) for user stalls.
    async fn attempt_soft_recovery(&self, kind: StallKind) -> bool {
        let outcome: Result<bool> = async {
            match kind {
                StallKind::Market => {
                    let ticker = self.gateway.book_ticker(&self.cfg.symbol).await?;
                    if ticker.bid > 0.0 && ticker.ask > 0.0 {
                        self.process_book_ticker(ticker.bid, ticker.ask).await?;
                        info!(
                            "Recovered market data via REST fallback (bid={:.2} ask={:.2})",
                            ticker.bid, ticker.ask
                        );
                        return Ok(true);
                    }
                    Ok(false)
                }
                StallKind::User => {
                    if self.cfg.dry_run {
                        return Ok(false);
                    }
                    let key = self.listen_key.lock().await.clone();
                    match key {
                        Some(key) => {
                            with_retry("listen key keepalive", || {
                                self.gateway.keepalive_listen_key(&key)
                            })
                            .await?;
                        }
                        None => {
                            let key =
                                with_retry("listen key", || self.gateway.new_listen_key()).await?;
                            info!("Obtained listenKey {key} during recovery");
                            *self.listen_key.lock().await = Some(key);
                        }
                    }
                    self.clocks.touch_user();
                    Ok(true)
                }
            }
        }
        .await;
        match outcome {
            Ok(recovered) => recovered,
            Err(err) => {
                warn!("Soft recovery for {} failed: {err}", kind.reason());
                false
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let maintenance_interval = Duration::from_secs((self.cfg.kill_switch_ms / 1000).max(60));
        let mut stop = self.stop.subscribe();
        let mut last_maintenance = Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(ORDER_PANEL_INTERVAL) => {}
                _ = stop.wait_for(|stopped| *stopped) => break,
            }
            self.log_order_panel("periodic").await;
            if last_maintenance.elapsed() < maintenance_interval {
                continue;
            }
            last_maintenance = Instant::now();
            if let Some(reason) = self.maintenance_check().await {
                warn!("Maintenance: {reason}; rebuilding grid");
                if let Err(err) = self.rebuild_grid(reason, None).await {
                    self.handle_task_error("maintenance", err);
                }
            }
        }
    }

    /// A grid with no resting orders, or with one side fully consumed,
    /// cannot quote symmetrically anymore and gets rebuilt.
    async fn maintenance_check(&self) -> Option<&'static str> {
        let state = self.state.lock().await;
        if state.open_orders.is_empty() {
            return Some("maintenance-empty");
        }
        if state.count_side(GridSide::Sell) == 0 {
            return Some("maintenance-missing-sells");
        }
        if state.count_side(GridSide::Buy) == 0 {
            return Some("maintenance-missing-buys");
        }
        None
    }

    async fn listen_key_keepalive_loop(self: Arc<Self>) {
        let mut stop = self.stop.subscribe();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(LISTEN_KEY_REFRESH) => {}
                _ = stop.wait_for(|stopped| *stopped) => break,
            }
            let key = self.listen_key.lock().await.clone();
            if let Some(key) = key {
                if let Err(err) = with_retry("listen key keepalive", || {
                    self.gateway.keepalive_listen_key(&key)
                })
                .await
                {
                    error!("Listen key keepalive failed: {err}");
                }
            }
        }
    }

    async fn status_notifier_loop(self: Arc<Self>) {
        let Some(send_key) = self.cfg.status_notify_send_key.clone() else {
            return;
        };
        let interval = Duration::from_secs(self.cfg.status_notify_interval.max(10));
        let url = notifier::webhook_url(&send_key);
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                error!("Status notifier disabled: {err}");
                return;
            }
        };
        let mut stop = self.stop.subscribe();
        loop {
            let snapshot = self.health_snapshot().await;
            let (title, body) = notifier::format_notification(&snapshot, false, &self.fmt);
            if let Err(err) = notifier::post_notification(&client, &url, &title, &body).await {
                error!("Status notification failed: {err}");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.wait_for(|stopped| *stopped) => break,
            }
        }
        let snapshot = self.health_snapshot().await;
        let (title, body) = notifier::format_notification(&snapshot, true, &self.fmt);
        if let Err(err) = notifier::post_notification(&client, &url, &title, &body).await {
            error!("Final status notification failed: {err}");
        }
    }

    /// Assemble the health view the notifier reports.
    async fn health_snapshot(&self) -> HealthSnapshot {
        let mut snapshot = HealthSnapshot {
            status: if *self.stop.borrow() {
                "stopped"
            } else {
                "running"
            }
            .to_string(),
            live: !self.cfg.dry_run,
            ..HealthSnapshot::default()
        };
        let stale_after =
            Duration::from_millis(self.cfg.kill_switch_ms).max(Duration::from_secs(30));

        snapshot.last_recenter_age = Some(self.clocks.recenter_age());
        {
            let state = self.state.lock().await;
            snapshot.open_orders = state.open_orders.len();
            snapshot.buy_orders = state.count_side(GridSide::Buy);
            snapshot.sell_orders = state.count_side(GridSide::Sell);
            snapshot.grid_center = Some(state.grid_center);
        }
        snapshot.last_mid = self.book.mid();
        snapshot.best_bid = self.book.bid();
        snapshot.best_ask = self.book.ask();

        let market_age = self.clocks.market_age();
        snapshot.market_age = Some(market_age);
        if market_age > stale_after {
            snapshot.record_issue(format!("market data stale {}s", market_age.as_secs()));
        }
        if !self.cfg.dry_run {
            let user_age = self.clocks.user_age();
            snapshot.user_age = Some(user_age);
            if user_age > stale_after {
                snapshot.record_issue(format!("user stream stale {}s", user_age.as_secs()));
            }
        }
        if snapshot.open_orders == 0 {
            snapshot.record_issue("no resting orders");
        }

        match self.gateway.available_balance("USDT").await {
            Ok(balance) => snapshot.available_balance = Some(balance),
            Err(err) => {
                snapshot.record_issue("balance unavailable");
                snapshot.balance_error = Some(err.to_string());
            }
        }
        match self.gateway.account_equity().await {
            Ok(equity) => snapshot.account_equity = Some(equity),
            Err(err) => {
                snapshot.record_issue("equity unavailable");
                snapshot.equity_error = Some(err.to_string());
            }
        }

        if !self.cfg.dry_run {
            let now_ms = wall_clock_ms();
            let start_ms = now_ms.saturating_sub(3_600_000);
            match self.gateway.user_trades(&self.cfg.symbol, start_ms).await {
                Ok(trades) => {
                    snapshot.trades_last_hour = Some(trades.len());
                    if let Some(last) = trades.iter().map(|trade| trade.time).max() {
                        snapshot.last_trade_age =
                            Some(Duration::from_millis(now_ms.saturating_sub(last)));
                    }
                    if trades.is_empty() {
                        snapshot.record_issue("no trades in last hour");
                    }
                }
                Err(err) => {
                    snapshot.trade_error = Some(err.to_string());
                    snapshot.record_issue("trade history unavailable");
                }
            }
        }

        if snapshot.status != "stopped" && !snapshot.issues.is_empty() {
            snapshot.status = "stalled".to_string();
        }
        snapshot
    }

    async fn log_order_panel(&self, context: &str) {
        let snapshot: Vec<OrderRecord> = {
            let state = self.state.lock().await;
            state.open_orders.values().cloned().collect()
        };
        if snapshot.is_empty() {
            info!("Order panel [{context}]: no resting orders");
            return;
        }
        let mut buys: Vec<&OrderRecord> = snapshot
            .iter()
            .filter(|record| record.side == GridSide::Buy)
            .collect();
        buys.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        let mut sells: Vec<&OrderRecord> = snapshot
            .iter()
            .filter(|record| record.side == GridSide::Sell)
            .collect();
        sells.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));

        let mid = self.book.mid().unwrap_or(0.0);
        let bid = self.book.bid().unwrap_or(0.0);
        let ask = self.book.ask().unwrap_or(0.0);
        let mut lines = vec![format!(
            "Order panel [{context}] mid~{mid:.2} bid={bid:.2} ask={ask:.2}"
        )];
        for (label, records) in [("Buys", &buys), ("Sells", &sells)] {
            if records.is_empty() {
                lines.push(format!("  {label}: none"));
                continue;
            }
            lines.push(format!("  {label} (closest first):"));
            for record in records.iter().take(8) {
                lines.push(format!(
                    "    {} qty={}",
                    self.fmt.price(record.price),
                    self.fmt.quantity(record.quantity)
                ));
            }
            if records.len() > 8 {
                lines.push(format!(
                    "    ... {} more {} orders",
                    records.len() - 8,
                    label.to_lowercase()
                ));
            }
        }
        info!("{}", lines.join("\n"));
    }

    /// A failed flatten means an open position with no grid behind it; that
    /// is an operational incident an operator has to look at, so the bot
    /// stops instead of continuing half-armed.
    fn handle_task_error(&self, context: &str, err: BotError) {
        if matches!(err, BotError::PositionNotFlat { .. }) {
            error!("{context}: non-recoverable incident: {err}; stopping bot");
            self.request_stop();
        } else {
            error!("{context}: {err}");
        }
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::mock::MockGateway;
    use crate::rest::OrderKind;
    use std::sync::atomic::Ordering;

    fn test_filters() -> SymbolFilters {
        SymbolFilters {
            tick_size: 0.01,
            step_size: 0.001,
            min_qty: 0.001,
            min_notional: 5.0,
        }
    }

    fn test_config() -> BotConfig {
        BotConfig::from_yaml(
            r#"
symbol: BTCUSDT
mode: ONE_WAY
margin_type: CROSSED
leverage: 10
per_order_quote_usd: 60.0
maker_guard_ticks: 3
recenter_threshold: 1.0
max_open_orders: 4
max_resting_orders_per_side: 2
max_concurrent_positions_per_side: 2
kill_switch_ms: 60000
log_level: INFO
rest_base: "https://fapi.asterdex.com"
ws_market: "wss://fstream.asterdex.com"
dry_run: true
"#,
        )
        .unwrap()
    }

    async fn bootstrap_bot() -> Arc<GridBot<MockGateway>> {
        let gateway = MockGateway::new(test_filters(), 59_999.0, 60_001.0);
        Arc::new(GridBot::bootstrap(test_config(), gateway).await.unwrap())
    }

    async fn find_record(bot: &GridBot<MockGateway>, side: GridSide, price: f64) -> OrderRecord {
        let state = bot.state.lock().await;
        state
            .open_orders
            .values()
            .find(|record| record.side == side && (record.price - price).abs() < 1e-6)
            .unwrap_or_else(|| panic!("no {side:?} record at {price}"))
            .clone()
    }

    fn fill_update(record: &OrderRecord) -> OrderTradeUpdate {
        OrderTradeUpdate {
            client_order_id: record.client_order_id.clone(),
            order_id: Some(record.order_id),
            status: "FILLED".to_string(),
            side: record.side.as_str().to_string(),
            execution_type: "TRADE".to_string(),
            last_filled_qty: record.quantity,
        }
    }

    #[tokio::test]
    async fn test_bootstrap_deploys_full_grid() {
        let bot = bootstrap_bot().await;

        // Balance-derived sizing is capped at two levels per side
        let layout = bot.layout.read().await;
        assert_eq!(layout.levels_per_side, 2);
        assert_eq!(layout.levels.len(), 4);
        assert!((layout.center_price - 60_000.0).abs() < 1e-9);
        drop(layout);

        let orders = bot.gateway().orders.lock().await.clone();
        // One market buy for the base position, then four limit orders
        assert_eq!(orders.len(), 5);
        assert_eq!(orders[0].kind, OrderKind::Market);
        assert_eq!(orders[0].side, GridSide::Buy);
        // Base position covers both sell levels, snapped up to step
        assert_eq!(orders[0].quantity, "0.002");

        let limits: Vec<_> = orders.iter().filter(|order| order.is_limit()).collect();
        assert_eq!(limits.len(), 4);
        for order in &limits {
            assert_eq!(order.quantity, "0.001");
            assert_eq!(order.reduce_only, order.side == GridSide::Sell);
            assert!(order.client_order_id.as_deref().unwrap().starts_with("MVP21_BTCUSDT_"));
        }

        let state = bot.state.lock().await;
        assert_eq!(state.open_orders.len(), 4);
        assert_eq!(state.count_side(GridSide::Buy), 2);
        assert_eq!(state.count_side(GridSide::Sell), 2);
        for order_id in state.by_client_id.values() {
            assert!(state.open_orders.contains_key(order_id));
        }
    }

    #[tokio::test]
    async fn test_duplicate_submission_defense() {
        let bot = bootstrap_bot().await;
        let level = {
            let layout = bot.layout.read().await;
            layout.levels[0]
        };

        // The level already has a resting order; both calls must no-op.
        bot.ensure_level_has_order(level).await.unwrap();
        bot.ensure_level_has_order(level).await.unwrap();

        assert_eq!(bot.gateway().limit_orders().await.len(), 4);
        assert_eq!(bot.state.lock().await.open_orders.len(), 4);
    }

    #[tokio::test]
    async fn test_buy_fill_refills_sell_one_spacing_up() {
        let bot = bootstrap_bot().await;
        let record = find_record(&bot, GridSide::Buy, 59_980.0).await;

        bot.handle_order_trade(fill_update(&record)).await.unwrap();

        let state = bot.state.lock().await;
        assert_eq!(state.open_orders.len(), 4);
        // 59980 + 20 = 60000, capped at upper bound 60040
        assert!(state.order_exists(GridSide::Sell, 60_000.0, &bot.fmt));
        assert!(!state.order_exists(GridSide::Buy, 59_980.0, &bot.fmt));

        // At most one record per (side, formatted price)
        let mut seen = std::collections::HashSet::new();
        for record in state.open_orders.values() {
            assert!(seen.insert((record.side, bot.fmt.price(record.price))));
        }
    }

    #[tokio::test]
    async fn test_sell_fill_refills_buy_one_spacing_down() {
        let bot = bootstrap_bot().await;
        let record = find_record(&bot, GridSide::Sell, 60_020.0).await;

        bot.handle_order_trade(fill_update(&record)).await.unwrap();

        let state = bot.state.lock().await;
        assert_eq!(state.open_orders.len(), 4);
        assert!(state.order_exists(GridSide::Buy, 60_000.0, &bot.fmt));
    }

    #[tokio::test]
    async fn test_terminal_non_fill_drops_record() {
        let bot = bootstrap_bot().await;
        let record = find_record(&bot, GridSide::Buy, 59_960.0).await;

        let mut update = fill_update(&record);
        update.status = "CANCELED".to_string();
        update.execution_type = "CANCELED".to_string();
        bot.handle_order_trade(update).await.unwrap();

        let state = bot.state.lock().await;
        assert_eq!(state.open_orders.len(), 3);
        assert!(state.get_by_client_id(&record.client_order_id).is_none());
        // No refill for a cancel
        assert_eq!(bot.gateway().limit_orders().await.len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_order_update_is_ignored() {
        let bot = bootstrap_bot().await;
        let update = OrderTradeUpdate {
            client_order_id: "MVP21_BTCUSDT_9_999999".to_string(),
            order_id: Some(424_242),
            status: "FILLED".to_string(),
            side: "BUY".to_string(),
            execution_type: "TRADE".to_string(),
            last_filled_qty: 0.001,
        };
        bot.handle_order_trade(update).await.unwrap();
        assert_eq!(bot.state.lock().await.open_orders.len(), 4);
    }

    #[tokio::test]
    async fn test_maker_guard_leaves_distant_orders_alone() {
        let bot = bootstrap_bot().await;
        // Ask a full dollar above the closest buy; guard distance is 0.03
        bot.process_book_ticker(59_980.0, 59_981.0).await.unwrap();

        assert!(bot.gateway().cancelled.lock().await.is_empty());
        assert_eq!(bot.gateway().limit_orders().await.len(), 4);
    }

    #[tokio::test]
    async fn test_maker_guard_repositions_violating_buy() {
        let bot = bootstrap_bot().await;
        // Ask collapses to within the guard distance of the 59980 buy
        bot.process_book_ticker(59_978.0, 59_980.02).await.unwrap();

        assert_eq!(bot.gateway().cancelled.lock().await.len(), 1);
        let limits = bot.gateway().limit_orders().await;
        assert_eq!(limits.len(), 5);
        let replacement = limits.last().unwrap();
        assert_eq!(replacement.side, GridSide::Buy);
        let OrderKind::Limit { price } = &replacement.kind else {
            panic!("expected limit order");
        };
        let price: f64 = price.parse().unwrap();
        // Stepped down until ask - price > guard, i.e. at most 59979.99
        assert!(price <= 59_979.99 + 1e-9);

        let state = bot.state.lock().await;
        assert_eq!(state.open_orders.len(), 4);
        assert!(!state.order_exists(GridSide::Buy, 59_980.0, &bot.fmt));
    }

    #[tokio::test]
    async fn test_reposition_drops_locally_when_order_unknown() {
        let bot = bootstrap_bot().await;
        *bot.gateway().cancel_error_code.lock().await = Some(-2013);

        bot.process_book_ticker(59_978.0, 59_980.02).await.unwrap();

        // Cancel failed with "unknown order": dropped locally, no resubmit
        let state = bot.state.lock().await;
        assert_eq!(state.open_orders.len(), 3);
        assert!(!state.order_exists(GridSide::Buy, 59_980.0, &bot.fmt));
        drop(state);
        assert_eq!(bot.gateway().limit_orders().await.len(), 4);
    }

    #[tokio::test]
    async fn test_recenter_requires_cooldown() {
        let bot = bootstrap_bot().await;
        // Drift beyond threshold right after bootstrap: debounced
        bot.process_book_ticker(60_040.0, 60_042.0).await.unwrap();

        assert_eq!(bot.gateway().cancel_all_calls.load(Ordering::SeqCst), 0);
        assert!((bot.layout.read().await.center_price - 60_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_recenter_rebuilds_around_new_mid() {
        let bot = bootstrap_bot().await;
        bot.clocks.backdate_recenter(Duration::from_secs(400));

        // threshold = max(1.0 * 20 * 2, 2 * 20) = 40; mid 60041 drifts 41
        bot.process_book_ticker(60_040.0, 60_042.0).await.unwrap();

        assert_eq!(bot.gateway().cancel_all_calls.load(Ordering::SeqCst), 1);
        let layout = bot.layout.read().await;
        assert!((layout.center_price - 60_041.0).abs() < 1e-9);
        assert_eq!(layout.levels.len(), 4);
        drop(layout);

        let state = bot.state.lock().await;
        assert_eq!(state.open_orders.len(), 4);
        assert!((state.grid_center - 60_041.0).abs() < 1e-9);
        // Cooldown restamped
        drop(state);
        assert!(bot.clocks.recenter_age() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_small_drift_does_not_recenter() {
        let bot = bootstrap_bot().await;
        bot.clocks.backdate_recenter(Duration::from_secs(400));

        bot.process_book_ticker(60_030.0, 60_032.0).await.unwrap();
        assert_eq!(bot.gateway().cancel_all_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_market_stall_soft_recovery_via_rest() {
        let bot = bootstrap_bot().await;
        bot.clocks.backdate_market(Duration::from_secs(120));
        assert!(bot.clocks.market_age() > Duration::from_secs(60));

        bot.handle_stall(StallKind::Market).await;

        // REST ticker injected; stream clock refreshed; no rebuild
        assert!(bot.clocks.market_age() < Duration::from_secs(5));
        assert_eq!(bot.gateway().cancel_all_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_market_stall_rebuilds_when_recovery_fails() {
        let bot = bootstrap_bot().await;
        bot.clocks.backdate_market(Duration::from_secs(120));
        bot.gateway().set_book(0.0, 0.0).await;

        bot.handle_stall(StallKind::Market).await;

        // Ticker was unusable: full rebuild around the last observed mid
        assert_eq!(bot.gateway().cancel_all_calls.load(Ordering::SeqCst), 1);
        assert!((bot.layout.read().await.center_price - 60_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_refill_price_respects_grid_bounds() {
        let bot = bootstrap_bot().await;
        let layout = bot.layout.read().await;

        // Sell refill capped at the upper bound
        let price = bot
            .compute_relaunch_price(GridSide::Sell, 60_039.0, &layout)
            .unwrap();
        assert!((price - 60_040.0).abs() < 1e-9);
        // Reference at the upper bound leaves no room
        assert!(bot
            .compute_relaunch_price(GridSide::Sell, 60_040.0, &layout)
            .is_none());

        // Buy refill capped at the lower bound
        let price = bot
            .compute_relaunch_price(GridSide::Buy, 59_961.0, &layout)
            .unwrap();
        assert!((price - 59_960.0).abs() < 1e-9);
        // Within one tick of the reference after capping
        assert!(bot
            .compute_relaunch_price(GridSide::Buy, 59_960.005, &layout)
            .is_none());
    }

    #[tokio::test]
    async fn test_cancel_all_and_redeploy_restores_same_quotes() {
        let bot = bootstrap_bot().await;
        let before: std::collections::BTreeSet<(String, String, String)> = {
            let state = bot.state.lock().await;
            state
                .open_orders
                .values()
                .map(|r| {
                    (
                        r.side.as_str().to_string(),
                        bot.fmt.price(r.price),
                        bot.fmt.quantity(r.quantity),
                    )
                })
                .collect()
        };

        bot.cancel_all_orders(false).await.unwrap();
        assert!(bot.state.lock().await.open_orders.is_empty());
        bot.deploy_initial_orders().await.unwrap();

        let after: std::collections::BTreeSet<(String, String, String)> = {
            let state = bot.state.lock().await;
            state
                .open_orders
                .values()
                .map(|r| {
                    (
                        r.side.as_str().to_string(),
                        bot.fmt.price(r.price),
                        bot.fmt.quantity(r.quantity),
                    )
                })
                .collect()
        };
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_guard_adjustment_bounded_to_fifty_steps() {
        // A guard distance no price can clear within the step budget
        let mut cfg = test_config();
        cfg.maker_guard_ticks = 10_000;
        let gateway = MockGateway::new(test_filters(), 59_999.0, 60_001.0);
        let bot = GridBot::bootstrap(cfg, gateway).await.unwrap();

        let level = GridLevel {
            index: 0,
            side: GridSide::Buy,
            price: 59_980.0,
            quantity: 0.001,
        };
        let adjusted = bot.adjust_price_for_guard(&level);
        // At most 51 ticks below the ask-clamped start, never at or below zero
        assert!(adjusted >= 59_980.0 - 52.0 * 0.01);
        assert!(adjusted > 0.0);
    }

    #[tokio::test]
    async fn test_maintenance_check_detects_degenerate_grids() {
        let bot = bootstrap_bot().await;
        assert_eq!(bot.maintenance_check().await, None);

        // Drop all sells
        {
            let mut state = bot.state.lock().await;
            let sells: Vec<u64> = state
                .open_orders
                .values()
                .filter(|record| record.side == GridSide::Sell)
                .map(|record| record.order_id)
                .collect();
            for order_id in sells {
                state.drop_order(order_id);
            }
        }
        assert_eq!(
            bot.maintenance_check().await,
            Some("maintenance-missing-sells")
        );

        // Drop everything
        {
            let mut state = bot.state.lock().await;
            let all: Vec<u64> = state.open_orders.keys().copied().collect();
            for order_id in all {
                state.drop_order(order_id);
            }
        }
        assert_eq!(bot.maintenance_check().await, Some("maintenance-empty"));
    }

    #[tokio::test]
    async fn test_health_snapshot_running_and_stalled() {
        let bot = bootstrap_bot().await;

        let snapshot = bot.health_snapshot().await;
        assert_eq!(snapshot.status, "running");
        assert_eq!(snapshot.open_orders, 4);
        assert_eq!(snapshot.buy_orders, 2);
        assert_eq!(snapshot.sell_orders, 2);
        assert_eq!(snapshot.grid_center, Some(60_000.0));
        assert_eq!(snapshot.available_balance, Some(10_000.0));
        assert!(snapshot.issues.is_empty());
        assert!(!snapshot.live);

        bot.clocks.backdate_market(Duration::from_secs(120));
        let snapshot = bot.health_snapshot().await;
        assert_eq!(snapshot.status, "stalled");
        assert!(snapshot
            .issues
            .iter()
            .any(|issue| issue.starts_with("market data stale")));
    }

    #[tokio::test]
    async fn test_run_stops_on_request() {
        let bot = bootstrap_bot().await;
        let runner = tokio::spawn(Arc::clone(&bot).run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        bot.request_stop();
        let result = tokio::time::timeout(Duration::from_secs(10), runner)
            .await
            .expect("run did not stop")
            .expect("run task panicked");
        assert!(result.is_ok());
    }
}
