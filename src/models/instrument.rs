//! Instrument model: the join key across positions, orders and bar series.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Security type as understood by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecType {
    #[serde(rename = "STK")]
    Stock,
    /// Forex pair
    Cash,
    #[serde(rename = "FUT")]
    Future,
    #[serde(rename = "OPT")]
    Opt,
}

impl SecType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecType::Stock => "STK",
            SecType::Cash => "CASH",
            SecType::Future => "FUT",
            SecType::Opt => "OPT",
        }
    }

    /// Parse a gateway asset class string. Unknown classes are treated as stock.
    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "CASH" | "FX" => SecType::Cash,
            "FUT" => SecType::Future,
            "OPT" => SecType::Opt,
            _ => SecType::Stock,
        }
    }
}

/// A tradable security.
///
/// Loosely specified instruments (no `con_id`) are resolved by the gateway
/// into qualified ones exactly once, then cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    /// Ticker, or base currency for forex pairs
    pub symbol: String,

    pub sec_type: SecType,

    /// Routing exchange (SMART, IDEALPRO, ...)
    pub exchange: String,

    /// Quote currency
    pub currency: String,

    /// Gateway contract id, present once qualified
    #[serde(default)]
    pub con_id: Option<i64>,
}

/// Join key for instruments coming from different gateway endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstrumentKey {
    ConId(i64),
    Spec {
        symbol: String,
        sec_type: SecType,
        currency: String,
    },
}

impl Instrument {
    /// Create a stock instrument.
    pub fn stock(symbol: &str, exchange: &str, currency: &str) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            sec_type: SecType::Stock,
            exchange: exchange.to_string(),
            currency: currency.to_uppercase(),
            con_id: None,
        }
    }

    /// Create a forex instrument from a pair like "EURUSD" or "EUR.USD".
    pub fn forex(pair: &str) -> Self {
        let pair = pair.to_uppercase();
        let (base, quote) = match pair.split_once('.') {
            Some((b, q)) => (b.to_string(), q.to_string()),
            None if pair.len() == 6 && pair.is_ascii() => (pair[..3].to_string(), pair[3..].to_string()),
            None => (pair.clone(), "USD".to_string()),
        };

        Self {
            symbol: base,
            sec_type: SecType::Cash,
            exchange: "IDEALPRO".to_string(),
            currency: quote,
            con_id: None,
        }
    }

    /// Parse a watch-list entry: forex pairs are six letters or dotted, anything else is a US stock.
    pub fn parse_symbol(s: &str) -> Self {
        let s = s.trim();
        let compact: String = s.chars().filter(|c| *c != '.').collect();
        if compact.len() == 6 && compact.chars().all(|c| c.is_ascii_alphabetic()) && looks_like_pair(&compact) {
            Self::forex(s)
        } else {
            Self::stock(s, "SMART", "USD")
        }
    }

    pub fn with_con_id(mut self, con_id: i64) -> Self {
        self.con_id = Some(con_id);
        self
    }

    pub fn is_qualified(&self) -> bool {
        self.con_id.is_some()
    }

    pub fn key(&self) -> InstrumentKey {
        match self.con_id {
            Some(id) => InstrumentKey::ConId(id),
            None => self.spec_key(),
        }
    }

    /// Key ignoring the contract id, used to look up unqualified requests.
    pub fn spec_key(&self) -> InstrumentKey {
        InstrumentKey::Spec {
            symbol: self.symbol.clone(),
            sec_type: self.sec_type,
            currency: self.currency.clone(),
        }
    }
}

const CURRENCIES: [&str; 10] = ["USD", "EUR", "GBP", "JPY", "CHF", "CAD", "AUD", "NZD", "SEK", "NOK"];

fn looks_like_pair(s: &str) -> bool {
    let s = s.to_uppercase();
    CURRENCIES.contains(&&s[..3]) && CURRENCIES.contains(&&s[3..])
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sec_type {
            SecType::Cash => write!(f, "{}.{}", self.symbol, self.currency)?,
            _ => write!(f, "{}@{}", self.symbol, self.exchange)?,
        }
        if let Some(id) = self.con_id {
            write!(f, " #{}", id)?;
        }
        Ok(())
    }
}
