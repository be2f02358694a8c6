//! Pending order intents awaiting submission.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::broker::{with_timeout, BrokerGateway};
use crate::models::{Instrument, OrderIntent};

/// Outcome counts of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub submitted: usize,
    pub simulated: usize,
    pub failed: usize,
}

/// FIFO of (instrument, intent) pairs, at most one per instrument between flushes.
#[derive(Debug, Default)]
pub struct OrderQueue {
    pending: VecDeque<(Instrument, OrderIntent)>,
}

impl OrderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, instrument: &Instrument) -> bool {
        let key = instrument.key();
        self.pending.iter().any(|(i, _)| i.key() == key)
    }

    /// Queue an intent. Returns false if the instrument already has one pending.
    pub fn enqueue(&mut self, instrument: Instrument, intent: OrderIntent) -> bool {
        if self.contains(&instrument) {
            warn!(instrument = %instrument, intent = %intent, "Intent already pending, ignoring");
            return false;
        }
        info!(instrument = %instrument, intent = %intent, "Queued order");
        self.pending.push_back((instrument, intent));
        true
    }

    /// Submit everything in FIFO order. The queue is empty afterwards whatever
    /// the individual outcomes; failures are logged and dropped.
    pub async fn flush<G>(&mut self, gateway: &G, dry_run: bool, call_timeout: Duration, ack_wait: Duration) -> FlushReport
    where
        G: BrokerGateway + ?Sized,
    {
        let mut report = FlushReport::default();
        if self.pending.is_empty() {
            return report;
        }
        info!(count = self.len(), dry_run, "Flushing order queue");

        while let Some((instrument, intent)) = self.pending.pop_front() {
            if dry_run {
                info!(instrument = %instrument, intent = %intent, "[DRY RUN] Would place order");
                report.simulated += 1;
                continue;
            }

            match with_timeout(call_timeout, gateway.submit_order(&instrument, &intent)).await {
                Ok(order) => {
                    if !ack_wait.is_zero() {
                        tokio::time::sleep(ack_wait).await;
                    }
                    info!(
                        instrument = %instrument,
                        order_id = %order.order_id,
                        status = ?order.status,
                        "Order placed"
                    );
                    report.submitted += 1;
                }
                Err(e) => {
                    error!(instrument = %instrument, intent = %intent, error = %e, "Order submission failed");
                    report.failed += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockGateway;
    use crate::models::OrderSide;
    use rust_decimal_macros::dec;

    fn intent() -> OrderIntent {
        OrderIntent::bracket(OrderSide::Buy, dec!(1), dec!(100), dec!(105), dec!(95))
    }

    fn filled_queue(n: usize) -> OrderQueue {
        let mut queue = OrderQueue::new();
        for i in 0..n {
            assert!(queue.enqueue(Instrument::stock(&format!("SYM{}", i), "SMART", "USD"), intent()));
        }
        queue
    }

    #[test]
    fn test_duplicate_instrument_is_refused() {
        let mut queue = OrderQueue::new();
        let eurusd = Instrument::forex("EURUSD");
        assert!(queue.enqueue(eurusd.clone(), intent()));
        assert!(!queue.enqueue(eurusd, OrderIntent::market(OrderSide::Sell, dec!(1))));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_flush_submits_in_order() {
        let gateway = MockGateway::new();
        let mut queue = filled_queue(3);

        let report = queue
            .flush(&gateway, false, Duration::from_secs(1), Duration::ZERO)
            .await;

        assert_eq!(report, FlushReport { submitted: 3, simulated: 0, failed: 0 });
        let symbols: Vec<String> = gateway.submitted().into_iter().map(|(i, _)| i.symbol).collect();
        assert_eq!(symbols, vec!["SYM0", "SYM1", "SYM2"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_flush_drains_even_when_every_submission_fails() {
        for n in [0, 1, 7] {
            let gateway = MockGateway::new();
            gateway.fail_submits(true);
            let mut queue = filled_queue(n);

            let report = queue
                .flush(&gateway, false, Duration::from_secs(1), Duration::ZERO)
                .await;

            assert!(queue.is_empty());
            assert_eq!(report.failed, n);
            assert_eq!(report.submitted + report.simulated, 0);
        }
    }

    #[tokio::test]
    async fn test_dry_run_never_submits() {
        let gateway = MockGateway::new();
        let mut queue = filled_queue(2);

        let report = queue
            .flush(&gateway, true, Duration::from_secs(1), Duration::ZERO)
            .await;

        assert_eq!(report.simulated, 2);
        assert!(gateway.submitted().is_empty());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_instrument_can_be_queued_again_after_flush() {
        let gateway = MockGateway::new();
        let mut queue = OrderQueue::new();
        let eurusd = Instrument::forex("EURUSD");

        queue.enqueue(eurusd.clone(), intent());
        queue.flush(&gateway, true, Duration::from_secs(1), Duration::ZERO).await;

        assert!(queue.enqueue(eurusd, intent()));
    }
}
