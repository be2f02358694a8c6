//! Calculator for technical indicators: moving averages, MACD, Bollinger bands.

use statrs::statistics::Statistics;

use crate::models::BarSeries;

/// Short moving average window.
pub const MA_SHORT: usize = 7;
/// Long moving average window, also the Bollinger centre line.
pub const MA_LONG: usize = 21;
/// Rolling standard deviation window.
pub const SD_WINDOW: usize = 20;
pub const EMA_FAST_SPAN: f64 = 12.0;
pub const EMA_SLOW_SPAN: f64 = 26.0;
/// Centre of mass of the near-instantaneous trend EMA.
pub const TREND_EMA_COM: f64 = 0.5;

/// Indicator values for one bar. Only emitted where every field is defined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorRow {
    /// Index of the bar in the source series
    pub index: usize,
    pub close: f64,
    pub ma7: f64,
    pub ma21: f64,
    pub ema12: f64,
    pub ema26: f64,
    pub macd: f64,
    pub sd20: f64,
    pub upper_band: f64,
    pub lower_band: f64,
    pub ema: f64,
}

/// Indicators aligned bar-for-bar with the leading undefined prefix dropped.
#[derive(Debug, Clone, Default)]
pub struct IndicatorSet {
    pub rows: Vec<IndicatorRow>,
}

impl IndicatorSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn last(&self) -> Option<&IndicatorRow> {
        self.rows.last()
    }
}

/// Calculator for the indicator set used by the signal evaluator.
pub struct IndicatorCalculator;

impl IndicatorCalculator {
    /// Compute the full indicator set for a series.
    pub fn calculate(series: &BarSeries) -> IndicatorSet {
        let closes = series.closes();

        let ma7 = rolling_mean(&closes, MA_SHORT);
        let ma21 = rolling_mean(&closes, MA_LONG);
        let sd20 = rolling_std_dev(&closes, SD_WINDOW);
        let ema12 = ewm_mean(&closes, span_alpha(EMA_FAST_SPAN));
        let ema26 = ewm_mean(&closes, span_alpha(EMA_SLOW_SPAN));
        let ema = ewm_mean(&closes, com_alpha(TREND_EMA_COM));

        let rows = (0..closes.len())
            .filter_map(|i| {
                let (ma7, ma21, sd20) = (ma7[i]?, ma21[i]?, sd20[i]?);
                Some(IndicatorRow {
                    index: i,
                    close: closes[i],
                    ma7,
                    ma21,
                    ema12: ema12[i],
                    ema26: ema26[i],
                    macd: ema12[i] - ema26[i],
                    sd20,
                    upper_band: ma21 + sd20 * 2.0,
                    lower_band: ma21 - sd20 * 2.0,
                    ema: ema[i],
                })
            })
            .collect();

        IndicatorSet { rows }
    }
}

/// Arithmetic mean over a trailing window; `None` until the window fills.
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<Option<f64>> {
    rolling(values, window, |w| w.mean())
}

/// Sample standard deviation over a trailing window; `None` until the window fills.
pub fn rolling_std_dev(values: &[f64], window: usize) -> Vec<Option<f64>> {
    rolling(values, window, |w| w.std_dev())
}

fn rolling(values: &[f64], window: usize, f: impl Fn(&[f64]) -> f64) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if window == 0 || i + 1 < window {
                None
            } else {
                Some(f(&values[i + 1 - window..=i]))
            }
        })
        .collect()
}

/// Smoothing factor for a span.
pub fn span_alpha(span: f64) -> f64 {
    2.0 / (span + 1.0)
}

/// Smoothing factor for a centre of mass.
pub fn com_alpha(com: f64) -> f64 {
    1.0 / (1.0 + com)
}

/// Bias-adjusted exponentially weighted mean, defined from the first value.
///
/// Each output is `sum((1-a)^i * x[t-i]) / sum((1-a)^i)` over all prior values.
pub fn ewm_mean(values: &[f64], alpha: f64) -> Vec<f64> {
    let decay = 1.0 - alpha;
    let mut numerator = 0.0;
    let mut denominator = 0.0;

    values
        .iter()
        .map(|&x| {
            numerator = x + decay * numerator;
            denominator = 1.0 + decay * denominator;
            numerator / denominator
        })
        .collect()
}
