//! Watched instruments and the qualified-contract cache.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::broker::{with_timeout, BrokerGateway, ScannerSubscription};
use crate::models::{Instrument, InstrumentKey};

/// Instruments resolved by the gateway, cached for the life of the process.
#[derive(Debug, Default)]
pub struct InstrumentCache {
    resolved: HashMap<InstrumentKey, Instrument>,
}

impl InstrumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    /// Qualify `instrument` on first reference; later calls hit the cache.
    ///
    /// Returns `None` when the gateway cannot resolve it right now.
    pub async fn resolve<G>(&mut self, gateway: &G, instrument: &Instrument, timeout: Duration) -> Option<Instrument>
    where
        G: BrokerGateway + ?Sized,
    {
        let key = instrument.spec_key();
        if let Some(hit) = self.resolved.get(&key) {
            return Some(hit.clone());
        }

        let qualified = match with_timeout(timeout, gateway.qualify_contracts(std::slice::from_ref(instrument))).await {
            Ok(mut list) if !list.is_empty() => list.swap_remove(0),
            Ok(_) => {
                warn!(instrument = %instrument, "Contract not found");
                return None;
            }
            Err(e) => {
                warn!(instrument = %instrument, error = %e, "Contract qualification failed");
                return None;
            }
        };

        debug!(instrument = %qualified, "Contract qualified");
        self.resolved.insert(key, qualified.clone());
        Some(qualified)
    }
}

/// Source of instruments to evaluate for entries.
#[derive(Debug, Clone)]
pub struct Universe {
    symbols: Vec<Instrument>,
    scanner: Option<ScannerSubscription>,
}

impl Universe {
    pub fn new(symbols: &[String], scanner: Option<ScannerSubscription>) -> Self {
        Self {
            symbols: symbols.iter().map(|s| Instrument::parse_symbol(s)).collect(),
            scanner,
        }
    }

    pub fn symbols(&self) -> &[Instrument] {
        &self.symbols
    }

    /// Fixed list plus scanner results, qualified, de-duplicated and minus `held`.
    pub async fn refresh<G>(
        &self,
        gateway: &G,
        cache: &mut InstrumentCache,
        held: &HashSet<InstrumentKey>,
        timeout: Duration,
    ) -> Vec<Instrument>
    where
        G: BrokerGateway + ?Sized,
    {
        let mut candidates = self.symbols.clone();

        if let Some(subscription) = &self.scanner {
            match with_timeout(timeout, gateway.scan_market(subscription)).await {
                Ok(found) => {
                    info!(count = found.len(), scan_code = %subscription.scan_code, "Scanner results");
                    candidates.extend(found);
                }
                Err(e) => warn!(error = %e, "Market scan failed"),
            }
        }

        let mut seen = HashSet::new();
        let mut watched = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let Some(instrument) = cache.resolve(gateway, &candidate, timeout).await else {
                continue;
            };
            if is_held(&instrument, held) {
                debug!(instrument = %instrument, "Already held, skipping entry check");
                continue;
            }
            if seen.insert(instrument.key()) {
                watched.push(instrument);
            }
        }
        watched
    }
}

/// Match on contract id when known, otherwise on symbol, type and currency.
pub fn is_held(instrument: &Instrument, held: &HashSet<InstrumentKey>) -> bool {
    held.contains(&instrument.key()) || held.contains(&instrument.spec_key())
}

/// Keys of every instrument with a non-zero position.
pub fn held_keys<'a>(instruments: impl IntoIterator<Item = &'a Instrument>) -> HashSet<InstrumentKey> {
    instruments
        .into_iter()
        .flat_map(|i| [i.key(), i.spec_key()])
        .collect()
}
