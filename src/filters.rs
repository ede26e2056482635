//! Symbol filters and price/quantity arithmetic
//!
//! Every price and quantity sent to the exchange must be a multiple of the
//! symbol's tick and step sizes and satisfy the minimum notional. This module
//! holds the filter values loaded from exchange info and the rounding and
//! formatting helpers built on top of them.

/// Trading filters for a single symbol, loaded once at bootstrap
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolFilters {
    /// Price increment
    pub tick_size: f64,
    /// Quantity increment
    pub step_size: f64,
    /// Minimum order quantity
    pub min_qty: f64,
    /// Minimum order notional (price * quantity)
    pub min_notional: f64,
}

/// Round down to a multiple of `tick`. No-op for non-positive ticks.
pub fn floor_to_tick(value: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return value;
    }
    (value / tick).floor() * tick
}

/// Round up to a multiple of `tick`. No-op for non-positive ticks.
pub fn ceil_to_tick(value: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return value;
    }
    (value / tick).ceil() * tick
}

/// Number of decimal places needed to represent an increment such as 0.001.
pub fn decimal_places(value: f64) -> usize {
    let text = format!("{value:.10}");
    let trimmed = text.trim_end_matches('0');
    match trimmed.split_once('.') {
        Some((_, frac)) => frac.len(),
        None => 0,
    }
}

/// Fixed-precision formatting for outgoing prices and quantities
#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    pub price_decimals: usize,
    pub quantity_decimals: usize,
}

impl Formatter {
    pub fn from_filters(filters: &SymbolFilters) -> Self {
        Self {
            price_decimals: decimal_places(filters.tick_size),
            quantity_decimals: decimal_places(filters.step_size),
        }
    }

    pub fn price(&self, value: f64) -> String {
        format!("{:.*}", self.price_decimals, value)
    }

    pub fn quantity(&self, value: f64) -> String {
        format!("{:.*}", self.quantity_decimals, value)
    }

    pub fn round_price(&self, value: f64) -> f64 {
        round_to_decimals(value, self.price_decimals)
    }

    pub fn round_quantity(&self, value: f64) -> f64 {
        round_to_decimals(value, self.quantity_decimals)
    }
}

fn round_to_decimals(value: f64, decimals: usize) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_filters() -> SymbolFilters {
        SymbolFilters {
            tick_size: 0.01,
            step_size: 0.001,
            min_qty: 0.001,
            min_notional: 5.0,
        }
    }

    #[test]
    fn test_tick_rounding() {
        assert!((floor_to_tick(59980.027, 0.01) - 59980.02).abs() < 1e-9);
        assert!((ceil_to_tick(60019.991, 0.01) - 60020.00).abs() < 1e-9);
        // Already aligned values stay put
        assert!((floor_to_tick(60000.0, 0.01) - 60000.0).abs() < 1e-9);
        assert!((ceil_to_tick(60000.0, 0.01) - 60000.0).abs() < 1e-9);
        // Degenerate tick passes through
        assert_eq!(floor_to_tick(123.456, 0.0), 123.456);
        assert_eq!(ceil_to_tick(123.456, -1.0), 123.456);
    }

    #[test]
    fn test_decimal_places() {
        assert_eq!(decimal_places(0.01), 2);
        assert_eq!(decimal_places(0.001), 3);
        assert_eq!(decimal_places(1.0), 0);
        assert_eq!(decimal_places(0.5), 1);
    }

    #[test]
    fn test_formatter() {
        let fmt = Formatter::from_filters(&test_filters());
        assert_eq!(fmt.price_decimals, 2);
        assert_eq!(fmt.quantity_decimals, 3);
        assert_eq!(fmt.price(59980.0), "59980.00");
        assert_eq!(fmt.quantity(0.001), "0.001");
        assert_eq!(fmt.price(59979.999), "59980.00");
    }

    #[test]
    fn test_round_helpers() {
        let fmt = Formatter::from_filters(&test_filters());
        assert!((fmt.round_price(59979.9999) - 59980.0).abs() < 1e-9);
        assert!((fmt.round_quantity(0.0014999) - 0.001).abs() < 1e-9);
        assert!((fmt.round_quantity(0.0015001) - 0.002).abs() < 1e-9);
    }
}
