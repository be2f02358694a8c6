//! Trading logic: signal rules, order queue, polling schedule, watched universe.

mod config;
mod order_queue;
mod scheduler;
mod signals;
mod universe;

pub use config::TradingConfig;
pub use order_queue::{FlushReport, OrderQueue};
pub use scheduler::PollingScheduler;
pub use signals::{Decision, HoldReason, SignalEvaluator};
pub use universe::{held_keys, InstrumentCache, Universe};
