//! Status notifier: health snapshot formatting and webhook delivery
//!
//! The controller assembles a [`HealthSnapshot`] periodically and on
//! shutdown; this module renders it into the ServerChan form payload and
//! posts it. Delivery failures are reported to the caller but are never
//! fatal to the bot.

use std::time::Duration;

use chrono::Local;
use log::warn;
use serde_json::Value;

use crate::errors::Result;
use crate::filters::Formatter;

/// Point-in-time health view of the bot
#[derive(Debug, Default)]
pub struct HealthSnapshot {
    /// "running", "stalled", or "stopped"
    pub status: String,
    pub issues: Vec<String>,
    pub open_orders: usize,
    pub buy_orders: usize,
    pub sell_orders: usize,
    pub last_mid: Option<f64>,
    pub grid_center: Option<f64>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub available_balance: Option<f64>,
    pub account_equity: Option<f64>,
    pub market_age: Option<Duration>,
    pub user_age: Option<Duration>,
    pub last_recenter_age: Option<Duration>,
    pub trades_last_hour: Option<usize>,
    pub last_trade_age: Option<Duration>,
    pub trade_error: Option<String>,
    pub balance_error: Option<String>,
    pub equity_error: Option<String>,
    /// Whether the bot is trading live (enables the user-stream lines)
    pub live: bool,
}

impl HealthSnapshot {
    pub fn record_issue(&mut self, issue: impl Into<String>) {
        self.issues.push(issue.into());
    }
}

/// ServerChan endpoint for a send key.
pub fn webhook_url(send_key: &str) -> String {
    format!("https://sctapi.ftqq.com/{send_key}.send")
}

/// Render the notification title and body for a snapshot.
pub fn format_notification(
    snapshot: &HealthSnapshot,
    is_final: bool,
    fmt: &Formatter,
) -> (String, String) {
    let status_text = if is_final {
        "stopped"
    } else {
        snapshot.status.as_str()
    };
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");

    let fmt_price = |value: Option<f64>| match value {
        Some(value) => fmt.price(value),
        None => "n/a".to_string(),
    };
    let fmt_age = |value: Option<Duration>| match value {
        Some(age) => format!("{}s", age.as_secs()),
        None => "n/a".to_string(),
    };

    let mut lines = vec![
        format!("status: {status_text}"),
        format!("time: {timestamp}"),
        format!(
            "orders: total {} (buy {} / sell {})",
            snapshot.open_orders, snapshot.buy_orders, snapshot.sell_orders
        ),
        format!("last_mid: {}", fmt_price(snapshot.last_mid)),
        format!("grid_center: {}", fmt_price(snapshot.grid_center)),
        format!(
            "best_bid/best_ask: {} / {}",
            fmt_price(snapshot.best_bid),
            fmt_price(snapshot.best_ask)
        ),
        format!("market_age: {}", fmt_age(snapshot.market_age)),
    ];

    match snapshot.available_balance {
        Some(balance) => lines.push(format!("available_balance: {balance:.2} USDT")),
        None => lines.push("available_balance: n/a".to_string()),
    }
    match snapshot.account_equity {
        Some(equity) => lines.push(format!("account_equity: {equity:.2} USDT")),
        None => lines.push("account_equity: n/a".to_string()),
    }

    if snapshot.live {
        lines.push(format!("user_age: {}", fmt_age(snapshot.user_age)));
        let trades = match snapshot.trades_last_hour {
            Some(count) => count.to_string(),
            None => "n/a".to_string(),
        };
        lines.push(format!("trades_last_hour: {trades}"));
        lines.push(format!("last_trade_age: {}", fmt_age(snapshot.last_trade_age)));
    }

    lines.push(format!(
        "last_recenter_age: {}",
        fmt_age(snapshot.last_recenter_age)
    ));

    if !snapshot.issues.is_empty() {
        lines.push("issues:".to_string());
        lines.extend(snapshot.issues.iter().map(|issue| format!("- {issue}")));
    }
    if let Some(err) = &snapshot.trade_error {
        lines.push(format!("trade_error: {err}"));
    }
    if let Some(err) = &snapshot.balance_error {
        lines.push(format!("balance_error: {err}"));
    }
    if let Some(err) = &snapshot.equity_error {
        lines.push(format!("equity_error: {err}"));
    }
    if is_final {
        lines.push("event: shutdown".to_string());
    }

    let title = format!("Aster Bot {status_text}");
    (title, lines.join("\n"))
}

/// Post one notification. A non-2xx response or an error code inside the
/// response body is logged; only transport errors surface to the caller.
pub async fn post_notification(
    client: &reqwest::Client,
    url: &str,
    title: &str,
    body: &str,
) -> Result<()> {
    let response = client
        .post(url)
        .form(&[("title", title), ("desp", body)])
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        warn!("Status notification returned HTTP {status}");
        return Ok(());
    }
    if let Ok(data) = response.json::<Value>().await {
        let code = data.get("code").and_then(Value::as_i64);
        if !matches!(code, None | Some(0) | Some(200)) {
            warn!("Status notification returned error: {data}");
        }
    }
    Ok(())
}
