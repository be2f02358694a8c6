//! Order models: intents produced by the signal evaluator and live orders
//! mirrored from the broker's order book.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Instrument;

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" | "B" | "BOT" => Some(OrderSide::Buy),
            "SELL" | "S" | "SLD" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

/// How the order is to be worked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    /// Limit entry with attached take-profit and stop-loss exits
    Bracket {
        limit_price: Decimal,
        take_profit: Decimal,
        stop_loss: Decimal,
    },
}

/// A proposed action, owned by the order queue until flushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub side: OrderSide,
    pub quantity: Decimal,
    pub kind: OrderKind,
}

impl OrderIntent {
    pub fn market(side: OrderSide, quantity: Decimal) -> Self {
        Self {
            side,
            quantity,
            kind: OrderKind::Market,
        }
    }

    pub fn bracket(
        side: OrderSide,
        quantity: Decimal,
        limit_price: Decimal,
        take_profit: Decimal,
        stop_loss: Decimal,
    ) -> Self {
        Self {
            side,
            quantity,
            kind: OrderKind::Bracket {
                limit_price,
                take_profit,
                stop_loss,
            },
        }
    }
}

impl fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OrderKind::Market => write!(f, "{} {} MKT", self.side.as_str(), self.quantity),
            OrderKind::Bracket {
                limit_price,
                take_profit,
                stop_loss,
            } => write!(
                f,
                "{} {} LMT {} (TP {} / SL {})",
                self.side.as_str(),
                self.quantity,
                limit_price,
                take_profit,
                stop_loss
            ),
        }
    }
}

/// Broker-side order status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    PendingSubmit,
    PendingCancel,
    PreSubmitted,
    Submitted,
    Filled,
    Cancelled,
    ApiCancelled,
    Inactive,
    Rejected,
    Other(String),
}

impl OrderStatus {
    /// Map a gateway status string. Unknown statuses are kept verbatim.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().replace(['_', ' '], "").as_str() {
            "pendingsubmit" => OrderStatus::PendingSubmit,
            "pendingcancel" => OrderStatus::PendingCancel,
            "presubmitted" => OrderStatus::PreSubmitted,
            "submitted" => OrderStatus::Submitted,
            "filled" => OrderStatus::Filled,
            "cancelled" | "canceled" => OrderStatus::Cancelled,
            "apicancelled" | "apicanceled" => OrderStatus::ApiCancelled,
            "inactive" => OrderStatus::Inactive,
            "rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Other(s.to_string()),
        }
    }

    /// Filled, cancelled or rejected orders are never touched again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::ApiCancelled
                | OrderStatus::Rejected
        )
    }
}

/// Mirror of an order living in the broker's order book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveOrder {
    pub order_id: String,
    pub status: OrderStatus,
    pub instrument: Instrument,
    pub side: OrderSide,
    pub quantity: Decimal,
    /// Gateway order type (MKT, LMT, STP, ...)
    pub order_type: String,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
}

impl LiveOrder {
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Truncate `value` toward zero at `precision` decimal places.
///
/// A precision of zero or less truncates to an integer.
pub fn truncate_to_precision(value: Decimal, precision: i32) -> Decimal {
    if precision > 0 {
        value.trunc_with_scale(precision as u32)
    } else {
        value.trunc()
    }
}
