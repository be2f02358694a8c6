//! Account values and the per-currency summary shown at start-up.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One account value as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountValue {
    pub account: String,
    /// Value name, e.g. "NetLiquidation"
    pub tag: String,
    pub value: String,
    #[serde(default)]
    pub currency: String,
}

/// Non-empty account values grouped by currency. Informational only.
#[derive(Debug, Clone, Default)]
pub struct AccountSummary {
    pub by_currency: BTreeMap<String, Vec<AccountValue>>,
}

impl AccountSummary {
    /// Group values by currency, dropping rows without a currency, zero values,
    /// and rows whose value just repeats the account id.
    pub fn from_values(values: &[AccountValue]) -> Self {
        let mut by_currency: BTreeMap<String, Vec<AccountValue>> = BTreeMap::new();

        for v in values {
            if v.currency.is_empty() || v.value == "0.00" || v.value == v.account {
                continue;
            }
            by_currency
                .entry(v.currency.clone())
                .or_default()
                .push(v.clone());
        }

        Self { by_currency }
    }

    pub fn is_empty(&self) -> bool {
        self.by_currency.is_empty()
    }
}

impl fmt::Display for AccountSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (currency, values) in &self.by_currency {
            writeln!(f, "[{}]", currency)?;
            for v in values {
                writeln!(f, "  {:<28} {:>18}", v.tag, v.value)?;
            }
        }
        Ok(())
    }
}
