//! Trading configuration.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::broker::BarRequest;

/// Forex pairs watched when no symbols are configured.
pub const DEFAULT_SYMBOLS: [&str; 5] = ["EURUSD", "USDJPY", "GBPUSD", "USDCHF", "EURCHF"];

/// Configuration for signal evaluation and order construction.
#[derive(Debug, Clone, Serialize)]
pub struct TradingConfig {
    /// Exit a position once its unrealized P&L percentage drops below this
    pub unrealized_pnl_threshold: Decimal,

    /// Skip an instrument whose latest bar is older than this
    pub max_bar_age_minutes: i64,

    /// Bars required before any decision is made
    pub min_history: usize,

    /// Bars before the latest used for the volume average
    pub volume_window: usize,

    /// Latest volume must stay below this multiple of the window average
    pub volume_cap: f64,

    /// Units bought per entry
    pub entry_quantity: Decimal,

    /// Take-profit as a multiple of the entry limit
    pub take_profit_mult: Decimal,

    /// Stop-loss as a multiple of the entry limit
    pub stop_loss_mult: Decimal,

    /// Cancel a working order once close exceeds this fraction of high
    pub cancel_ratio: f64,

    /// Decimal places kept on order prices
    pub price_precision: i32,

    #[serde(skip)]
    pub bar_request: BarRequest,

    /// Deadline for any single gateway call
    #[serde(skip)]
    pub call_timeout: Duration,

    /// Pause after each live submission for the acknowledgement
    #[serde(skip)]
    pub ack_wait: Duration,

    /// Watch list, forex pairs or stock tickers
    pub symbols: Vec<String>,

    /// Merge market scanner results into the watch list
    pub use_scanner: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            unrealized_pnl_threshold: dec!(-5),  // Cut at -5%
            max_bar_age_minutes: 30,
            min_history: 50,
            volume_window: 49,
            volume_cap: 1.5,
            entry_quantity: dec!(1),
            take_profit_mult: dec!(1.05),        // +5%
            stop_loss_mult: dec!(0.95),          // -5%
            cancel_ratio: 0.95,
            price_precision: 5,
            bar_request: BarRequest::default(),
            call_timeout: Duration::from_secs(30),
            ack_wait: Duration::from_secs(1),
            symbols: DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
            use_scanner: false,
        }
    }
}
