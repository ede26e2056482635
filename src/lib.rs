#![deny(unreachable_pub)]
//! Grid market-making bot for Aster perpetual futures
//!
//! The bot quotes a symmetric grid of resting limit orders around the mid
//! price of a single perp symbol, refills filled levels on the opposite
//! side one grid step away, and recenters the grid when the market drifts
//! beyond a configured threshold. See the `grid_bot` binary for the CLI.

pub mod config;
pub mod controller;
pub mod errors;
pub mod events;
pub mod filters;
pub mod grid;
pub mod notifier;
pub mod rest;
pub mod state;

pub use config::BotConfig;
pub use controller::GridBot;
pub use errors::{BotError, Result};
pub use filters::{Formatter, SymbolFilters};
pub use grid::{build_grid, GridLayout, GridLevel, GridSide};
pub use rest::{AsterRestClient, BookTicker, Gateway, NewOrder, OrderAck};
pub use state::{OrderRecord, OrderStatus, RuntimeState};
