//! Entry, exit and stale-order rules.
//!
//! Every rule is a pure function of a bar series, a position or an order plus
//! the current time. Nothing here talks to the gateway.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;
use tracing::{debug, info, warn};

use crate::indicators::IndicatorCalculator;
use crate::models::{truncate_to_precision, Bar, BarSeries, LiveOrder, OrderIntent, OrderSide, Position};

use super::TradingConfig;

/// What the evaluator wants done with an instrument.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Open(OrderIntent),
    Close(OrderIntent),
    Cancel,
    Hold(HoldReason),
}

/// Why no action was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    InsufficientData,
    Outdated,
    InconsistentPosition,
    NoSignal,
}

/// Summary of closes over the volume window, logged with each entry check.
#[derive(Debug, Clone, Copy)]
pub struct PriceStats {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
}

impl PriceStats {
    fn from_window(window: &[Bar], last: &Bar) -> Self {
        let closes: Vec<f64> = window.iter().map(|b| b.close).collect();
        Self {
            mean: closes.iter().mean(),
            std_dev: closes.iter().std_dev(),
            min: Statistics::min(closes.iter()),
            max: Statistics::max(closes.iter()),
            last: last.close,
        }
    }
}

/// The three breakout conditions, all of which must hold.
pub fn is_breakout(prev: &Bar, last: &Bar, mean_volume: f64, volume_cap: f64) -> bool {
    let gap_up = last.low > prev.high;
    let higher_close = last.close > prev.close;
    let volume_ok = last.volume > 0.0 && last.volume < mean_volume * volume_cap;
    gap_up && higher_close && volume_ok
}

/// Evaluates trading rules against fresh snapshots.
#[derive(Debug, Clone)]
pub struct SignalEvaluator {
    config: TradingConfig,
}

impl SignalEvaluator {
    pub fn new(config: TradingConfig) -> Self {
        Self { config }
    }

    /// Reject series that are too short or whose last bar is too old.
    pub fn check_data(&self, series: &BarSeries, now: DateTime<Utc>) -> Option<HoldReason> {
        if series.len() < self.config.min_history {
            debug!(
                instrument = %series.instrument,
                bars = series.len(),
                required = self.config.min_history,
                "Insufficient history"
            );
            return Some(HoldReason::InsufficientData);
        }

        match series.minutes_since_last(now) {
            Some(age) if age > self.config.max_bar_age_minutes => {
                info!(
                    instrument = %series.instrument,
                    age_minutes = age,
                    max_age = self.config.max_bar_age_minutes,
                    "Data is outdated"
                );
                Some(HoldReason::Outdated)
            }
            Some(_) => None,
            None => Some(HoldReason::InsufficientData),
        }
    }

    /// Breakout entry for an instrument that is not held.
    pub fn evaluate_entry(&self, series: &BarSeries, now: DateTime<Utc>) -> Decision {
        if let Some(reason) = self.check_data(series, now) {
            return Decision::Hold(reason);
        }
        let (Some(prev), Some(last)) = (series.prev(), series.last()) else {
            return Decision::Hold(HoldReason::InsufficientData);
        };

        let window = series.trailing_window(self.config.volume_window);
        let stats = PriceStats::from_window(window, last);
        debug!(
            instrument = %series.instrument,
            mean = stats.mean,
            std = stats.std_dev,
            min = stats.min,
            max = stats.max,
            last = stats.last,
            "Price summary"
        );

        let mean_volume = window.iter().map(|b| b.volume).mean();
        if !is_breakout(prev, last, mean_volume, self.config.volume_cap) {
            return Decision::Hold(HoldReason::NoSignal);
        }

        let Some(max_price) = series.max_high().and_then(Decimal::from_f64) else {
            warn!(instrument = %series.instrument, "Unusable high price");
            return Decision::Hold(HoldReason::InsufficientData);
        };

        let precision = self.config.price_precision;
        let intent = OrderIntent::bracket(
            OrderSide::Buy,
            self.config.entry_quantity,
            truncate_to_precision(max_price, precision),
            truncate_to_precision(max_price * self.config.take_profit_mult, precision),
            truncate_to_precision(max_price * self.config.stop_loss_mult, precision),
        );

        info!(
            instrument = %series.instrument,
            intent = %intent,
            volume = last.volume,
            mean_volume = mean_volume,
            "Breakout entry"
        );
        Decision::Open(intent)
    }

    /// Loss exit for a held position.
    pub fn evaluate_exit(&self, position: &Position) -> Decision {
        if position.is_flat() {
            warn!(instrument = %position.instrument, "Position is empty, skipping");
            return Decision::Hold(HoldReason::InconsistentPosition);
        }
        let Some(pct) = position.unrealized_pct() else {
            warn!(instrument = %position.instrument, "Position has zero average cost, skipping");
            return Decision::Hold(HoldReason::InconsistentPosition);
        };

        if pct < self.config.unrealized_pnl_threshold {
            let intent = OrderIntent::market(position.closing_side(), position.quantity.abs());
            info!(
                instrument = %position.instrument,
                unrealized_pct = %pct.round_dp(2),
                threshold = %self.config.unrealized_pnl_threshold,
                intent = %intent,
                "Unrealized loss beyond threshold"
            );
            return Decision::Close(intent);
        }

        debug!(
            instrument = %position.instrument,
            unrealized_pct = %pct.round_dp(2),
            "Position within threshold"
        );
        Decision::Hold(HoldReason::NoSignal)
    }

    /// Cancel a working order once price has run up close to its high.
    pub fn evaluate_open_order(&self, order: &LiveOrder, series: &BarSeries, now: DateTime<Utc>) -> Decision {
        if !order.is_active() {
            return Decision::Hold(HoldReason::NoSignal);
        }
        if let Some(reason) = self.check_data(series, now) {
            return Decision::Hold(reason);
        }

        let indicators = IndicatorCalculator::calculate(series);
        let Some(bar) = indicators.last().and_then(|row| series.bars.get(row.index)) else {
            return Decision::Hold(HoldReason::InsufficientData);
        };

        if bar.close > bar.high * self.config.cancel_ratio {
            info!(
                order_id = %order.order_id,
                instrument = %order.instrument,
                close = bar.close,
                high = bar.high,
                "Price near high, cancelling order"
            );
            return Decision::Cancel;
        }
        Decision::Hold(HoldReason::NoSignal)
    }
}
