//! OHLCV bars and bar series.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Instrument;

/// One OHLCV sample at a fixed period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Bars for one instrument, ordered oldest to newest.
#[derive(Debug, Clone)]
pub struct BarSeries {
    pub instrument: Instrument,
    pub bars: Vec<Bar>,
}

impl BarSeries {
    /// Build a series, sorting bars by time so callers can rely on ordering.
    pub fn new(instrument: Instrument, mut bars: Vec<Bar>) -> Self {
        bars.sort_by_key(|b| b.time);
        Self { instrument, bars }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    /// The bar before the last one.
    pub fn prev(&self) -> Option<&Bar> {
        self.bars.len().checked_sub(2).map(|i| &self.bars[i])
    }

    /// Up to `len` bars immediately preceding the last bar.
    pub fn trailing_window(&self, len: usize) -> &[Bar] {
        let end = self.bars.len().saturating_sub(1);
        let start = end.saturating_sub(len);
        &self.bars[start..end]
    }

    /// Highest high over the whole series.
    pub fn max_high(&self) -> Option<f64> {
        self.bars.iter().map(|b| b.high).reduce(f64::max)
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    /// Minutes elapsed between the last bar and `now`.
    pub fn minutes_since_last(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last().map(|b| (now - b.time).num_minutes())
    }
}
