//! Grid layout construction
//!
//! A grid is a symmetric set of limit price levels around a mid price: buys
//! below, sells above, one spacing apart per step. The layout is immutable
//! once built except for the single slot a fill-refill overwrites.

use serde::{Deserialize, Serialize};

use crate::config::BotConfig;
use crate::errors::{BotError, Result};
use crate::filters::{ceil_to_tick, decimal_places, floor_to_tick, SymbolFilters};

/// Default base quantity per order when the config does not override it
pub const PREFERRED_BASE_QTY: f64 = 0.001;

/// Safety ceiling for the min-notional quantity bump loop
const MAX_QUANTITY_STEPS: u64 = 1_000_000;

/// Order side of a grid level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GridSide {
    Buy,
    Sell,
}

impl GridSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            GridSide::Buy => GridSide::Sell,
            GridSide::Sell => GridSide::Buy,
        }
    }

    /// Exchange wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            GridSide::Buy => "BUY",
            GridSide::Sell => "SELL",
        }
    }

    /// Parse the exchange wire representation
    pub fn from_exchange(value: &str) -> Option<Self> {
        match value {
            "BUY" => Some(GridSide::Buy),
            "SELL" => Some(GridSide::Sell),
            _ => None,
        }
    }
}

/// A single price level of the grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridLevel {
    /// Stable position within the current layout
    pub index: usize,
    pub side: GridSide,
    pub price: f64,
    pub quantity: f64,
}

/// Immutable snapshot of the currently quoted grid
#[derive(Debug, Clone)]
pub struct GridLayout {
    pub center_price: f64,
    pub lower_price: f64,
    pub upper_price: f64,
    /// Price distance between adjacent same-side levels, a whole number of
    /// ticks and at least the configured grid spacing
    pub spacing: f64,
    pub levels_per_side: usize,
    /// Buys and sells interleaved by step; refills reuse the vacated slot
    pub levels: Vec<GridLevel>,
}

impl GridLayout {
    pub fn buy_levels(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.iter().filter(|l| l.side == GridSide::Buy)
    }

    pub fn sell_levels(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.iter().filter(|l| l.side == GridSide::Sell)
    }
}

/// Base quantity preferred for each order.
pub fn preferred_base_quantity(cfg: &BotConfig) -> f64 {
    cfg.per_order_base_qty.unwrap_or(PREFERRED_BASE_QTY)
}

/// Build a grid of `levels_per_side` buys and sells around `mid_price`.
///
/// Fails on non-positive inputs, a non-positive computed buy price, or a
/// quantity that cannot satisfy the minimum notional; a partial grid is
/// never produced.
pub fn build_grid(
    mid_price: f64,
    cfg: &BotConfig,
    filters: &SymbolFilters,
    levels_per_side: usize,
) -> Result<GridLayout> {
    if mid_price <= 0.0 {
        return Err(BotError::Grid("mid price must be positive".into()));
    }
    if levels_per_side == 0 {
        return Err(BotError::Grid("levels per side must be positive".into()));
    }

    let tick = filters.tick_size;
    let spacing_units = (cfg.grid_spacing / tick).ceil().max(1.0);
    let spacing = spacing_units * tick;

    let mut levels = Vec::with_capacity(levels_per_side * 2);
    let mut lowest_price = mid_price;
    let mut highest_price = mid_price;

    for step in 1..=levels_per_side {
        let offset = spacing * step as f64;
        let buy_price = floor_to_tick(mid_price - offset, tick);
        let sell_price = ceil_to_tick(mid_price + offset, tick);
        if buy_price <= 0.0 {
            return Err(BotError::Grid(format!(
                "computed buy price {buy_price} at step {step} is non-positive"
            )));
        }

        let buy_qty = compute_quantity(cfg, buy_price, filters)?;
        let sell_qty = compute_quantity(cfg, sell_price, filters)?;

        ensure_notional("buy", step, buy_price, buy_qty, filters.min_notional)?;
        ensure_notional("sell", step, sell_price, sell_qty, filters.min_notional)?;

        levels.push(GridLevel {
            index: levels.len(),
            side: GridSide::Buy,
            price: buy_price,
            quantity: buy_qty,
        });
        levels.push(GridLevel {
            index: levels.len(),
            side: GridSide::Sell,
            price: sell_price,
            quantity: sell_qty,
        });

        lowest_price = lowest_price.min(buy_price);
        highest_price = highest_price.max(sell_price);
    }

    Ok(GridLayout {
        center_price: mid_price,
        lower_price: lowest_price,
        upper_price: highest_price,
        spacing,
        levels_per_side,
        levels,
    })
}

fn ensure_notional(
    label: &str,
    step: usize,
    price: f64,
    quantity: f64,
    min_notional: f64,
) -> Result<()> {
    let notional = price * quantity;
    if notional < min_notional {
        return Err(BotError::Grid(format!(
            "{label} level {step} notional {notional:.4} below minNotional {min_notional}"
        )));
    }
    Ok(())
}

/// Derive the order quantity at `price`: the preferred base quantity (or the
/// quote budget divided by price), snapped up to a whole number of steps,
/// raised to the minimum quantity, then bumped one step at a time until the
/// minimum notional is met.
fn compute_quantity(cfg: &BotConfig, price: f64, filters: &SymbolFilters) -> Result<f64> {
    if price <= 0.0 {
        return Err(BotError::Grid(
            "price must be positive for quantity computation".into(),
        ));
    }
    let step = filters.step_size;
    if step <= 0.0 {
        return Err(BotError::Grid("invalid step size".into()));
    }

    let preferred = preferred_base_quantity(cfg);
    let raw_qty = if preferred > 0.0 {
        preferred
    } else {
        cfg.per_order_quote_usd / price
    };

    let mut steps = (((raw_qty - 1e-12) / step).ceil().max(1.0)) as u64;
    let mut qty = steps as f64 * step;
    if qty < filters.min_qty {
        steps = ((filters.min_qty / step).ceil()) as u64;
        qty = steps as f64 * step;
    }

    while price * qty < filters.min_notional {
        steps += 1;
        qty = steps as f64 * step;
        if steps > MAX_QUANTITY_STEPS {
            return Err(BotError::Grid(
                "unable to satisfy minNotional with given parameters".into(),
            ));
        }
    }

    let decimals = decimal_places(step);
    let factor = 10f64.powi(decimals as i32);
    Ok((qty * factor).round() / factor)
}
