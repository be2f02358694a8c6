//! Data models for instruments, bars, positions, orders and account values.

mod account;
mod bar;
mod instrument;
mod order;
mod position;

pub use account::{AccountSummary, AccountValue};
pub use bar::{Bar, BarSeries};
pub use instrument::{Instrument, InstrumentKey, SecType};
pub use order::{truncate_to_precision, LiveOrder, OrderIntent, OrderKind, OrderSide, OrderStatus};
pub use position::Position;
