//! Bot configuration loaded from a YAML file
//!
//! Environment variables override file values for the secrets
//! (`ASTER_API_KEY`, `ASTER_API_SECRET`, `ASTER_STATUS_NOTIFY_SEND_KEY`).

use std::path::Path;

use config::{Config, File, FileFormat};
use serde::Deserialize;

use crate::errors::{BotError, Result};

fn default_ws_user() -> String {
    "wss://fstream.asterdex.com".to_string()
}

fn default_grid_spacing() -> f64 {
    20.0
}

fn default_min_levels_per_side() -> u32 {
    1
}

fn default_margin_reserve_pct() -> f64 {
    0.1
}

fn default_virtual_balance() -> f64 {
    10_000.0
}

fn default_notify_interval() -> u64 {
    3600
}

fn default_recv_window() -> u64 {
    5000
}

fn default_dry_run() -> bool {
    true
}

/// Bot configuration
///
/// All fields without a serde default are required in the YAML file; loading
/// fails with a configuration error naming the missing key otherwise.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Trading symbol, e.g. "BTCUSDT"
    pub symbol: String,
    /// Position mode; only ONE_WAY is supported
    pub mode: String,
    /// Margin type, e.g. "CROSSED" or "ISOLATED"
    pub margin_type: String,
    pub leverage: u32,
    /// Per-order notional used for sizing when no base quantity is configured
    pub per_order_quote_usd: f64,
    /// Minimum distance (in ticks) a resting order keeps from the opposite
    /// side of the book
    pub maker_guard_ticks: u32,
    /// Drift threshold multiplier for recentering the grid
    pub recenter_threshold: f64,
    pub max_open_orders: u32,
    /// Upper bound on levels per side; the balance-derived level count is
    /// clamped to this when positive
    pub max_resting_orders_per_side: u32,
    pub max_concurrent_positions_per_side: u32,
    /// Stream staleness budget before the kill-switch fires
    pub kill_switch_ms: u64,
    pub log_level: String,
    /// REST base URL, e.g. "https://fapi.asterdex.com"
    pub rest_base: String,
    /// Market-data WebSocket base URL
    pub ws_market: String,
    /// User-data WebSocket base URL
    #[serde(default = "default_ws_user")]
    pub ws_user: String,
    /// Preferred base quantity per order; falls back to the built-in default
    #[serde(default)]
    pub per_order_base_qty: Option<f64>,
    /// Minimum price distance between adjacent same-side levels
    #[serde(default = "default_grid_spacing")]
    pub grid_spacing: f64,
    #[serde(default = "default_min_levels_per_side")]
    pub min_levels_per_side: u32,
    /// Fraction of the available balance kept out of grid sizing
    #[serde(default = "default_margin_reserve_pct")]
    pub margin_reserve_pct: f64,
    #[serde(default = "default_virtual_balance")]
    pub dry_run_virtual_balance: f64,
    /// ServerChan send key for status notifications
    #[serde(default)]
    pub status_notify_send_key: Option<String>,
    #[serde(
        default = "default_notify_interval",
        alias = "status_notify_interval_sec"
    )]
    pub status_notify_interval: u64,
    #[serde(default = "default_recv_window")]
    pub recv_window: u64,
    #[serde(default = "default_dry_run", alias = "dry-run")]
    pub dry_run: bool,
}

impl BotConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .build()
            .map_err(|err| BotError::Config(err.to_string()))?;
        Self::finish(raw)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let raw = Config::builder()
            .add_source(File::from_str(text, FileFormat::Yaml))
            .build()
            .map_err(|err| BotError::Config(err.to_string()))?;
        Self::finish(raw)
    }

    fn finish(raw: Config) -> Result<Self> {
        let mut cfg: BotConfig = raw
            .try_deserialize()
            .map_err(|err| BotError::Config(err.to_string()))?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    fn normalize(&mut self) {
        self.symbol = self.symbol.to_uppercase();
        self.mode = self.mode.to_uppercase();
        self.margin_type = self.margin_type.to_uppercase();
        self.log_level = self.log_level.to_uppercase();
        self.rest_base = self.rest_base.trim_end_matches('/').to_string();
        if self.status_notify_interval == 0 {
            self.status_notify_interval = default_notify_interval();
        }
        if let Ok(send_key) = std::env::var("ASTER_STATUS_NOTIFY_SEND_KEY") {
            let send_key = send_key.trim().to_string();
            if !send_key.is_empty() {
                self.status_notify_send_key = Some(send_key);
            }
        }
        if let Some(key) = &self.status_notify_send_key {
            if key.trim().is_empty() {
                self.status_notify_send_key = None;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(BotError::Config("symbol cannot be empty".into()));
        }
        if self.leverage == 0 {
            return Err(BotError::Config("leverage must be at least 1".into()));
        }
        if self.per_order_quote_usd <= 0.0 {
            return Err(BotError::Config(
                "per_order_quote_usd must be positive".into(),
            ));
        }
        if self.grid_spacing <= 0.0 {
            return Err(BotError::Config("grid_spacing must be positive".into()));
        }
        if self.kill_switch_ms == 0 {
            return Err(BotError::Config("kill_switch_ms must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.margin_reserve_pct) {
            return Err(BotError::Config(
                "margin_reserve_pct must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }
}
