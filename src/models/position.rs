//! Position model mirroring a holding reported by the broker portfolio.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::{Instrument, OrderSide};

/// Current holding in one instrument. Owned by the broker; read only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub instrument: Instrument,

    /// Signed quantity: positive long, negative short
    pub quantity: Decimal,

    /// Average cost per unit
    pub average_cost: Decimal,

    /// Mark-to-market P&L not yet realized
    #[serde(default)]
    pub unrealized_pnl: Decimal,

    /// Last mark price, when the gateway reports one
    #[serde(default)]
    pub market_price: Option<Decimal>,
}

impl Position {
    pub fn new(instrument: Instrument, quantity: Decimal, average_cost: Decimal) -> Self {
        Self {
            instrument,
            quantity,
            average_cost,
            unrealized_pnl: Decimal::ZERO,
            market_price: None,
        }
    }

    pub fn with_unrealized_pnl(mut self, pnl: Decimal) -> Self {
        self.unrealized_pnl = pnl;
        self
    }

    pub fn is_long(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    /// Unrealized P&L as a percentage of average cost.
    ///
    /// `None` when the average cost is zero.
    pub fn unrealized_pct(&self) -> Option<Decimal> {
        if self.average_cost.is_zero() {
            return None;
        }
        Some(dec!(100) * self.unrealized_pnl / self.average_cost)
    }

    /// Side of the order that would close this position.
    pub fn closing_side(&self) -> OrderSide {
        if self.is_long() {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }
}
