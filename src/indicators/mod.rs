//! Technical indicators derived from bar series.

mod calculator;

pub use calculator::IndicatorCalculator;
