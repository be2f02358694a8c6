//! Bot runner: the reconciliation loop.
//!
//! Each due tick:
//! - cancels working orders whose entry thesis no longer holds
//! - queues exits for positions beyond the loss threshold
//! - refreshes the watched universe and queues breakout entries
//!
//! The order queue is flushed on every tick, due or not. A shutdown request
//! is checked between instruments, so Ctrl-C during a long tick stops it early.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::broker::{
    connect_with_retry, with_timeout, BrokerGateway, GatewayEndpoint, GatewayError, RetryPolicy,
    ScannerSubscription,
};
use crate::models::{AccountSummary, BarSeries, Instrument, InstrumentKey};
use crate::trading::{
    held_keys, Decision, FlushReport, HoldReason, InstrumentCache, OrderQueue, PollingScheduler,
    SignalEvaluator, TradingConfig, Universe,
};

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub endpoint: GatewayEndpoint,

    pub retry: RetryPolicy,

    /// Target seconds between data pulls
    pub poll_interval_secs: u64,

    /// Random spread around the poll interval (seconds)
    pub jitter_secs: u64,

    /// Compute and log decisions without placing or cancelling orders
    pub dry_run: bool,

    /// Pause between loop iterations
    pub idle_sleep: Duration,

    pub trading_config: TradingConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            endpoint: GatewayEndpoint::default(),
            retry: RetryPolicy::default(),
            poll_interval_secs: 30,
            jitter_secs: 5,
            dry_run: true,
            idle_sleep: Duration::from_secs(1),
            trading_config: TradingConfig::default(),
        }
    }
}

/// What one loop iteration did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub run_step: u64,
    pub due: bool,
    pub cancelled: usize,
    pub exits: usize,
    pub entries: usize,
    /// Instruments skipped for missing or outdated data, plus the entry step
    /// when positions are unknown
    pub skipped: usize,
    pub flush: FlushReport,
}

/// Main bot runner.
pub struct Bot {
    config: BotConfig,
    gateway: Arc<dyn BrokerGateway>,
    evaluator: SignalEvaluator,
    scheduler: PollingScheduler,
    queue: OrderQueue,
    cache: InstrumentCache,
    universe: Universe,
    run_step: u64,
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    pub fn new(config: BotConfig, gateway: Arc<dyn BrokerGateway>) -> Self {
        let scanner = config
            .trading_config
            .use_scanner
            .then(ScannerSubscription::default);
        let universe = Universe::new(&config.trading_config.symbols, scanner);

        Self {
            evaluator: SignalEvaluator::new(config.trading_config.clone()),
            scheduler: PollingScheduler::new(config.poll_interval_secs, config.jitter_secs),
            queue: OrderQueue::new(),
            cache: InstrumentCache::new(),
            universe,
            run_step: 0,
            shutdown: Arc::new(AtomicBool::new(false)),
            gateway,
            config,
        }
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Connect, loop until interrupted or an unexpected error, then disconnect.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            dry_run = self.config.dry_run,
            poll_interval = self.config.poll_interval_secs,
            symbols = self.universe.symbols().len(),
            scanner = self.config.trading_config.use_scanner,
            "Starting bot run loop"
        );

        connect_with_retry(self.gateway.as_ref(), &self.config.endpoint, &self.config.retry)
            .await
            .context("Failed to connect to gateway")?;
        self.log_account_summary().await;
        self.log_holdings().await;

        // Register shutdown handler
        let shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Cannot listen for Ctrl-C");
                return;
            }
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        let mut outcome = Ok(());
        while !self.stopping() {
            match self.tick(Utc::now()).await {
                Ok(report) if report.due => info!(
                    run_step = report.run_step,
                    cancelled = report.cancelled,
                    exits = report.exits,
                    entries = report.entries,
                    skipped = report.skipped,
                    submitted = report.flush.submitted,
                    simulated = report.flush.simulated,
                    failed = report.flush.failed,
                    "Tick complete"
                ),
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Unexpected error, stopping");
                    outcome = Err(e);
                    break;
                }
            }

            tokio::time::sleep(self.config.idle_sleep).await;
        }

        self.shutdown().await;
        outcome
    }

    /// Single iteration of the main loop at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickReport> {
        let poll = self.scheduler.poll(now.timestamp().max(0) as u64, self.run_step);
        let mut report = TickReport {
            run_step: self.run_step,
            due: poll.due,
            ..Default::default()
        };

        if poll.due {
            debug!(run_step = self.run_step, jitter = poll.jitter_secs, elapsed = poll.elapsed_secs, "Bot tick");
            self.reconcile_orders(now, &mut report).await?;
            if !self.stopping() {
                match self.reconcile_positions(&mut report).await? {
                    Some(held) => self.evaluate_entries(now, &held, &mut report).await,
                    None => {
                        warn!("Positions unknown, skipping entries this tick");
                        report.skipped += 1;
                    }
                }
            }
        }

        let trading = &self.config.trading_config;
        report.flush = self
            .queue
            .flush(self.gateway.as_ref(), self.config.dry_run, trading.call_timeout, trading.ack_wait)
            .await;

        self.run_step += 1;
        Ok(report)
    }

    /// Apply the stale-order rule to every working order.
    async fn reconcile_orders(&mut self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let Some(trades) = self.snapshot("trades", self.gateway.trades()).await? else {
            return Ok(());
        };

        for order in trades.iter().filter(|o| o.is_active()) {
            if self.stopping() {
                info!("Shutdown requested, leaving order checks");
                break;
            }
            debug!(
                order_id = %order.order_id,
                side = order.side.as_str(),
                instrument = %order.instrument,
                limit = ?order.limit_price,
                "Checking working order"
            );

            let Some(series) = self.fetch_series(&order.instrument).await else {
                report.skipped += 1;
                continue;
            };

            match self.evaluator.evaluate_open_order(order, &series, now) {
                Decision::Cancel => {
                    report.cancelled += 1;
                    if self.config.dry_run {
                        info!(order_id = %order.order_id, "[DRY RUN] Would cancel order");
                        continue;
                    }
                    let timeout = self.config.trading_config.call_timeout;
                    if let Err(e) = with_timeout(timeout, self.gateway.cancel_order(order)).await {
                        warn!(order_id = %order.order_id, error = %e, "Cancel failed");
                    }
                }
                Decision::Hold(reason) if reason != HoldReason::NoSignal => report.skipped += 1,
                _ => {}
            }
        }
        Ok(())
    }

    /// Queue exits for losing positions. Returns keys of all held instruments,
    /// or `None` when the positions snapshot is unavailable this tick.
    async fn reconcile_positions(&mut self, report: &mut TickReport) -> Result<Option<HashSet<InstrumentKey>>> {
        let Some(positions) = self.snapshot("positions", self.gateway.positions()).await? else {
            return Ok(None);
        };
        info!(count = positions.len(), "Fetched positions");

        for position in &positions {
            if let Decision::Close(intent) = self.evaluator.evaluate_exit(position) {
                if self.queue.enqueue(position.instrument.clone(), intent) {
                    report.exits += 1;
                }
            }
        }

        Ok(Some(held_keys(
            positions.iter().filter(|p| !p.is_flat()).map(|p| &p.instrument),
        )))
    }

    /// Look for breakouts across the watched universe.
    async fn evaluate_entries(&mut self, now: DateTime<Utc>, held: &HashSet<InstrumentKey>, report: &mut TickReport) {
        let timeout = self.config.trading_config.call_timeout;
        let watched = self
            .universe
            .refresh(self.gateway.as_ref(), &mut self.cache, held, timeout)
            .await;
        debug!(count = watched.len(), cached = self.cache.len(), "Evaluating entries");

        let mut evaluated = HashSet::new();
        for instrument in watched {
            if self.stopping() {
                info!("Shutdown requested, leaving entry checks");
                break;
            }
            if !evaluated.insert(instrument.key()) || self.queue.contains(&instrument) {
                continue;
            }

            let Some(series) = self.fetch_series(&instrument).await else {
                report.skipped += 1;
                continue;
            };

            match self.evaluator.evaluate_entry(&series, now) {
                Decision::Open(intent) => {
                    if self.queue.enqueue(instrument, intent) {
                        report.entries += 1;
                    }
                }
                Decision::Hold(reason) if reason != HoldReason::NoSignal => report.skipped += 1,
                _ => {}
            }
        }
    }

    /// Fresh bars for an instrument, or `None` if unavailable this tick.
    async fn fetch_series(&mut self, instrument: &Instrument) -> Option<BarSeries> {
        let trading = &self.config.trading_config;
        let qualified = self
            .cache
            .resolve(self.gateway.as_ref(), instrument, trading.call_timeout)
            .await?;

        match with_timeout(
            trading.call_timeout,
            self.gateway.historical_bars(&qualified, &trading.bar_request),
        )
        .await
        {
            Ok(bars) => {
                let series = BarSeries::new(qualified, bars);
                if series.is_empty() {
                    info!(instrument = %series.instrument, "Data unavailable: no bars returned");
                    return None;
                }
                Some(series)
            }
            Err(e) => {
                info!(instrument = %qualified, error = %e, "Data unavailable");
                None
            }
        }
    }

    /// Run a snapshot call. Transient failures skip the step; anything else is unexpected.
    async fn snapshot<T, F>(&self, what: &str, call: F) -> Result<Option<T>>
    where
        F: std::future::Future<Output = Result<T, GatewayError>>,
    {
        match with_timeout(self.config.trading_config.call_timeout, call).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_transient() => {
                warn!(snapshot = what, error = %e, "Snapshot unavailable, skipping step");
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to fetch {}", what)),
        }
    }

    /// Informational only; failures are logged.
    async fn log_account_summary(&self) {
        let timeout = self.config.trading_config.call_timeout;
        match with_timeout(timeout, self.gateway.account_values()).await {
            Ok(values) => {
                let summary = AccountSummary::from_values(&values);
                for (currency, values) in &summary.by_currency {
                    for v in values {
                        info!(currency = %currency, tag = %v.tag, value = %v.value, "Account value");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Account values unavailable"),
        }
    }

    /// Log positions and working orders once after connecting; failures are logged.
    async fn log_holdings(&self) {
        let timeout = self.config.trading_config.call_timeout;
        match with_timeout(timeout, self.gateway.positions()).await {
            Ok(positions) => {
                info!(count = positions.len(), "Positions at startup");
                for p in &positions {
                    info!(
                        instrument = %p.instrument,
                        quantity = %p.quantity,
                        average_cost = %p.average_cost,
                        unrealized_pnl = %p.unrealized_pnl,
                        "Position"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Positions unavailable"),
        }

        match with_timeout(timeout, self.gateway.open_orders()).await {
            Ok(orders) => {
                let ids: Vec<&str> = orders.iter().map(|o| o.order_id.as_str()).collect();
                info!(count = orders.len(), order_ids = ?ids, "Working orders at startup");
            }
            Err(e) => warn!(error = %e, "Working orders unavailable"),
        }
    }

    /// Graceful shutdown.
    async fn shutdown(&self) {
        info!("Shutting down bot...");
        if let Err(e) = self.gateway.disconnect().await {
            warn!(error = %e, "Disconnect failed");
        }
        info!(run_steps = self.run_step, "Bot shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockGateway;
    use crate::models::{Bar, LiveOrder, OrderKind, OrderSide, OrderStatus, Position};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use rust_decimal_macros::dec;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 14, 0, 0).unwrap()
    }

    fn breakout_bars() -> Vec<Bar> {
        let bar = |i: i64, low: f64, high: f64, close: f64, volume: f64| Bar {
            time: start() + ChronoDuration::minutes(5 * i),
            open: close,
            high,
            low,
            close,
            volume,
        };
        let mut bars: Vec<Bar> = (0..58).map(|i| bar(i, 95.0, 97.0, 96.0, 400.0)).collect();
        bars.push(bar(58, 97.0, 100.0, 98.0, 400.0));
        bars.push(bar(59, 101.0, 103.0, 102.0, 500.0));
        bars
    }

    /// Shortly after the last test bar.
    fn now() -> DateTime<Utc> {
        start() + ChronoDuration::minutes(5 * 60)
    }

    fn config(symbols: &[&str], dry_run: bool) -> BotConfig {
        let trading_config = TradingConfig {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            ack_wait: Duration::ZERO,
            call_timeout: Duration::from_millis(200),
            ..Default::default()
        };

        BotConfig {
            dry_run,
            idle_sleep: Duration::from_millis(1),
            retry: RetryPolicy {
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(2),
                max_elapsed: Duration::from_secs(1),
                max_attempts: 3,
                attempt_timeout: Duration::from_millis(100),
            },
            trading_config,
            ..Default::default()
        }
    }

    fn bot(gateway: &Arc<MockGateway>, symbols: &[&str], dry_run: bool) -> Bot {
        Bot::new(config(symbols, dry_run), gateway.clone())
    }

    #[tokio::test]
    async fn test_first_tick_places_breakout_entry() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_bars("XYZ", breakout_bars());
        let mut bot = bot(&gateway, &["XYZ"], false);

        let report = bot.tick(now()).await.unwrap();

        assert!(report.due);
        assert_eq!(report.entries, 1);
        assert_eq!(report.flush.submitted, 1);
        let submitted = gateway.submitted();
        assert_eq!(submitted[0].0.symbol, "XYZ");
        assert!(submitted[0].0.is_qualified());
        assert!(matches!(
            submitted[0].1.kind,
            OrderKind::Bracket { limit_price, .. } if limit_price == dec!(103)
        ));
        assert_eq!(bot.run_step, 1);
    }

    #[tokio::test]
    async fn test_losing_position_is_flattened() {
        let gateway = Arc::new(MockGateway::new());
        gateway.add_position(
            Position::new(Instrument::stock("ABC", "SMART", "USD").with_con_id(5), dec!(25), dec!(100))
                .with_unrealized_pnl(dec!(-6)),
        );
        let mut bot = bot(&gateway, &[], false);

        let report = bot.tick(now()).await.unwrap();

        assert_eq!(report.exits, 1);
        let (instrument, intent) = &gateway.submitted()[0];
        assert_eq!(instrument.symbol, "ABC");
        assert_eq!(intent.side, OrderSide::Sell);
        assert_eq!(intent.quantity, dec!(25));
        assert_eq!(intent.kind, OrderKind::Market);
    }

    #[tokio::test]
    async fn test_held_instrument_gets_no_entry() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_bars("XYZ", breakout_bars());
        gateway.add_position(
            Position::new(Instrument::stock("XYZ", "SMART", "USD").with_con_id(9), dec!(1), dec!(100))
                .with_unrealized_pnl(dec!(1)),
        );
        let mut bot = bot(&gateway, &["XYZ"], false);

        let report = bot.tick(now()).await.unwrap();

        assert_eq!(report.entries, 0);
        assert!(gateway.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_positions_block_entries() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_bars("XYZ", breakout_bars());
        gateway.add_position(
            Position::new(Instrument::stock("XYZ", "SMART", "USD").with_con_id(9), dec!(1), dec!(100))
                .with_unrealized_pnl(dec!(1)),
        );
        gateway.time_out_positions(true);
        let mut bot = bot(&gateway, &["XYZ"], false);

        let report = bot.tick(now()).await.unwrap();

        assert!(report.due);
        assert_eq!(report.entries, 0);
        assert_eq!(report.skipped, 1);
        assert!(gateway.submitted().is_empty());
        assert_eq!(bot.run_step, 1);
    }

    #[tokio::test]
    async fn test_shutdown_request_abandons_tick() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_bars("XYZ", breakout_bars());
        let mut bot = bot(&gateway, &["XYZ"], false);
        bot.shutdown_signal().store(true, Ordering::SeqCst);

        let report = bot.tick(now()).await.unwrap();

        assert!(report.due);
        assert_eq!(report.entries, 0);
        assert!(gateway.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal_and_disconnects() {
        let gateway = Arc::new(MockGateway::new());
        let mut bot = bot(&gateway, &[], false);
        let shutdown = bot.shutdown_signal();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.store(true, Ordering::SeqCst);
        });

        let result = tokio::time::timeout(Duration::from_secs(5), bot.run()).await;

        assert!(matches!(result, Ok(Ok(()))));
        assert!(bot.run_step > 0);
        assert!(!gateway.is_connected());
    }

    #[tokio::test]
    async fn test_run_logs_holdings_after_connect() {
        let gateway = Arc::new(MockGateway::new());
        let mut bot = bot(&gateway, &[], false);
        bot.shutdown_signal().store(true, Ordering::SeqCst);

        bot.run().await.unwrap();

        assert_eq!(gateway.snapshot_calls("positions"), 1);
        assert_eq!(gateway.snapshot_calls("open_orders"), 1);
        assert_eq!(gateway.snapshot_calls("trades"), 0);
        assert_eq!(bot.run_step, 0);
        assert!(!gateway.is_connected());
    }

    #[tokio::test]
    async fn test_stale_order_is_cancelled() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_bars("XYZ", breakout_bars());
        let order = |id: &str, status| LiveOrder {
            order_id: id.to_string(),
            status,
            instrument: Instrument::stock("XYZ", "SMART", "USD").with_con_id(9),
            side: OrderSide::Buy,
            quantity: dec!(1),
            order_type: "LMT".to_string(),
            limit_price: Some(dec!(103)),
        };
        gateway.add_order(order("1", OrderStatus::Submitted));
        gateway.add_order(order("2", OrderStatus::Filled));
        let mut bot = bot(&gateway, &[], false);

        let report = bot.tick(now()).await.unwrap();

        assert_eq!(report.cancelled, 1);
        assert_eq!(gateway.cancelled(), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_bars("XYZ", breakout_bars());
        let mut bot = bot(&gateway, &["XYZ"], true);

        let report = bot.tick(now()).await.unwrap();

        assert_eq!(report.flush.simulated, 1);
        assert!(gateway.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_missing_or_slow_data_is_skipped() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_bars("SLOW", breakout_bars());
        gateway.slow_bars("SLOW", Duration::from_secs(5));
        let mut bot = bot(&gateway, &["NONE", "SLOW"], false);

        let report = bot.tick(now()).await.unwrap();

        assert_eq!(report.skipped, 2);
        assert_eq!(report.entries, 0);
    }

    #[tokio::test]
    async fn test_queue_flushes_when_not_due() {
        let gateway = Arc::new(MockGateway::new());
        let mut bot = bot(&gateway, &[], false);

        assert!(bot.tick(now()).await.unwrap().due);

        bot.queue.enqueue(
            Instrument::stock("ABC", "SMART", "USD").with_con_id(5),
            crate::models::OrderIntent::market(OrderSide::Sell, dec!(1)),
        );
        let report = bot.tick(now() + ChronoDuration::seconds(1)).await.unwrap();

        assert!(!report.due);
        assert_eq!(report.flush.submitted, 1);
        assert!(bot.queue.is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_error_stops_run_and_disconnects() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_positions(true);
        let mut bot = bot(&gateway, &[], false);

        let result = bot.run().await;

        assert!(result.is_err());
        assert_eq!(gateway.connect_attempts(), 1);
        assert!(!gateway.is_connected());
    }
}
