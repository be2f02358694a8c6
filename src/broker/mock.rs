//! In-memory gateway for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::{AccountValue, Bar, Instrument, LiveOrder, OrderIntent, OrderKind, OrderStatus, Position};

use super::{BarRequest, BrokerGateway, GatewayEndpoint, GatewayError, GatewayResult, ScannerSubscription};

#[derive(Default)]
struct State {
    bars: HashMap<String, Vec<Bar>>,
    slow_bars: HashMap<String, Duration>,
    positions: Vec<Position>,
    orders: Vec<LiveOrder>,
    account_values: Vec<AccountValue>,
    scanner: Vec<Instrument>,
    submitted: Vec<(Instrument, OrderIntent)>,
    cancelled: Vec<String>,
    qualify_calls: usize,
    snapshot_calls: HashMap<&'static str, usize>,
    next_order_id: u64,
}

/// Scriptable [`BrokerGateway`]. Bars are keyed by instrument symbol.
pub struct MockGateway {
    state: Mutex<State>,
    connected: AtomicBool,
    connect_failures: AtomicU32,
    connect_attempts: AtomicU32,
    fail_submits: AtomicBool,
    fail_positions: AtomicBool,
    positions_timeout: AtomicBool,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            connected: AtomicBool::new(false),
            connect_failures: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            fail_submits: AtomicBool::new(false),
            fail_positions: AtomicBool::new(false),
            positions_timeout: AtomicBool::new(false),
        }
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn fail_submits(&self, fail: bool) {
        self.fail_submits.store(fail, Ordering::SeqCst);
    }

    pub fn fail_positions(&self, fail: bool) {
        self.fail_positions.store(fail, Ordering::SeqCst);
    }

    /// Make position requests time out, a transient failure.
    pub fn time_out_positions(&self, timeout: bool) {
        self.positions_timeout.store(timeout, Ordering::SeqCst);
    }

    pub fn set_bars(&self, symbol: &str, bars: Vec<Bar>) {
        self.state.lock().unwrap().bars.insert(symbol.to_uppercase(), bars);
    }

    /// Delay bar requests for `symbol` by `delay`.
    pub fn slow_bars(&self, symbol: &str, delay: Duration) {
        self.state.lock().unwrap().slow_bars.insert(symbol.to_uppercase(), delay);
    }

    pub fn add_position(&self, position: Position) {
        self.state.lock().unwrap().positions.push(position);
    }

    pub fn add_order(&self, order: LiveOrder) {
        self.state.lock().unwrap().orders.push(order);
    }

    pub fn add_account_value(&self, value: AccountValue) {
        self.state.lock().unwrap().account_values.push(value);
    }

    pub fn set_scanner_results(&self, instruments: Vec<Instrument>) {
        self.state.lock().unwrap().scanner = instruments;
    }

    pub fn submitted(&self) -> Vec<(Instrument, OrderIntent)> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn qualify_calls(&self) -> usize {
        self.state.lock().unwrap().qualify_calls
    }

    /// How often `positions`, `open_orders` or `trades` was called.
    pub fn snapshot_calls(&self, what: &str) -> usize {
        self.state.lock().unwrap().snapshot_calls.get(what).copied().unwrap_or(0)
    }

    fn count(&self, what: &'static str) {
        *self.state.lock().unwrap().snapshot_calls.entry(what).or_default() += 1;
    }
}

/// Stable fake contract id derived from the symbol.
fn fake_con_id(instrument: &Instrument) -> i64 {
    instrument
        .symbol
        .bytes()
        .chain(instrument.currency.bytes())
        .fold(7i64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as i64))
        .abs()
}

#[async_trait]
impl BrokerGateway for MockGateway {
    async fn connect(&self, _endpoint: &GatewayEndpoint) -> GatewayResult<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(GatewayError::Connectivity("connection refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn qualify_contracts(&self, instruments: &[Instrument]) -> GatewayResult<Vec<Instrument>> {
        self.state.lock().unwrap().qualify_calls += 1;
        Ok(instruments
            .iter()
            .map(|i| match i.con_id {
                Some(_) => i.clone(),
                None => i.clone().with_con_id(fake_con_id(i)),
            })
            .collect())
    }

    async fn historical_bars(&self, instrument: &Instrument, _request: &BarRequest) -> GatewayResult<Vec<Bar>> {
        let (bars, delay) = {
            let state = self.state.lock().unwrap();
            (
                state.bars.get(&instrument.symbol).cloned(),
                state.slow_bars.get(&instrument.symbol).copied(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        bars.ok_or_else(|| GatewayError::Api {
            status: 404,
            body: format!("no history for {}", instrument.symbol),
        })
    }

    async fn positions(&self) -> GatewayResult<Vec<Position>> {
        self.count("positions");
        if self.positions_timeout.load(Ordering::SeqCst) {
            return Err(GatewayError::Timeout(Duration::from_secs(30)));
        }
        if self.fail_positions.load(Ordering::SeqCst) {
            return Err(GatewayError::Decode("corrupt portfolio payload".to_string()));
        }
        Ok(self.state.lock().unwrap().positions.clone())
    }

    async fn open_orders(&self) -> GatewayResult<Vec<LiveOrder>> {
        self.count("open_orders");
        Ok(self
            .state
            .lock()
            .unwrap()
            .orders
            .iter()
            .filter(|o| o.is_active())
            .cloned()
            .collect())
    }

    async fn trades(&self) -> GatewayResult<Vec<LiveOrder>> {
        self.count("trades");
        Ok(self.state.lock().unwrap().orders.clone())
    }

    async fn account_values(&self) -> GatewayResult<Vec<AccountValue>> {
        Ok(self.state.lock().unwrap().account_values.clone())
    }

    async fn submit_order(&self, instrument: &Instrument, intent: &OrderIntent) -> GatewayResult<LiveOrder> {
        if self.fail_submits.load(Ordering::SeqCst) {
            return Err(GatewayError::Api {
                status: 400,
                body: "order rejected".to_string(),
            });
        }

        let mut state = self.state.lock().unwrap();
        state.next_order_id += 1;
        state.submitted.push((instrument.clone(), intent.clone()));

        let (order_type, limit_price) = match &intent.kind {
            OrderKind::Market => ("MKT", None),
            OrderKind::Bracket { limit_price, .. } => ("LMT", Some(*limit_price)),
        };
        Ok(LiveOrder {
            order_id: state.next_order_id.to_string(),
            status: OrderStatus::Submitted,
            instrument: instrument.clone(),
            side: intent.side,
            quantity: intent.quantity,
            order_type: order_type.to_string(),
            limit_price,
        })
    }

    async fn cancel_order(&self, order: &LiveOrder) -> GatewayResult<()> {
        let mut state = self.state.lock().unwrap();
        state.cancelled.push(order.order_id.clone());
        if let Some(o) = state.orders.iter_mut().find(|o| o.order_id == order.order_id) {
            o.status = OrderStatus::Cancelled;
        }
        Ok(())
    }

    async fn scan_market(&self, _subscription: &ScannerSubscription) -> GatewayResult<Vec<Instrument>> {
        Ok(self.state.lock().unwrap().scanner.clone())
    }
}
