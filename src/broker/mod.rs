//! Broker gateway abstraction and the Client Portal implementation.
//!
//! The trading loop only talks to [`BrokerGateway`]. Every call is bounded by
//! [`with_timeout`], and session establishment goes through
//! [`connect_with_retry`] instead of waiting on the gateway indefinitely.

mod client_portal;
#[cfg(test)]
pub mod mock;
mod types;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{AccountValue, Bar, Instrument, LiveOrder, OrderIntent, Position};

pub use client_portal::ClientPortalGateway;

/// Failure kinds surfaced by a gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway unreachable: {0}")]
    Connectivity(String),

    #[error("gateway session is not connected")]
    NotConnected,

    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway rejected request: {status} - {body}")]
    Api { status: u16, body: String },

    #[error("unexpected gateway payload: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Connectivity(_) | GatewayError::NotConnected | GatewayError::Timeout(_) => true,
            GatewayError::Http(e) => e.is_connect() || e.is_timeout(),
            GatewayError::Api { status, .. } => *status >= 500,
            GatewayError::Decode(_) => false,
        }
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Where the gateway listens.
#[derive(Debug, Clone)]
pub struct GatewayEndpoint {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
}

impl Default for GatewayEndpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            client_id: 1,
        }
    }
}

/// Parameters of a historical bar request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarRequest {
    /// How far back, e.g. "7 D"
    pub duration: String,
    /// Bar period, e.g. "5 mins"
    pub bar_size: String,
    /// TRADES, MIDPOINT, BID, ASK ...
    pub price_type: String,
    pub regular_hours_only: bool,
}

impl Default for BarRequest {
    fn default() -> Self {
        Self {
            duration: "7 D".to_string(),
            bar_size: "5 mins".to_string(),
            price_type: "MIDPOINT".to_string(),
            regular_hours_only: true,
        }
    }
}

/// Market scanner query.
#[derive(Debug, Clone)]
pub struct ScannerSubscription {
    pub instrument: String,
    pub location_code: String,
    pub scan_code: String,
    /// (filter code, value) pairs
    pub filters: Vec<(String, String)>,
}

impl Default for ScannerSubscription {
    fn default() -> Self {
        Self {
            instrument: "STK".to_string(),
            location_code: "STK.US.MAJOR".to_string(),
            scan_code: "HOT_BY_VOLUME".to_string(),
            filters: vec![
                ("changePercAbove".to_string(), "10".to_string()),
                ("priceAbove".to_string(), "10".to_string()),
                ("priceBelow".to_string(), "50".to_string()),
            ],
        }
    }
}

/// Everything the trading loop needs from a broker.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Open a session with the gateway.
    async fn connect(&self, endpoint: &GatewayEndpoint) -> GatewayResult<()>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> GatewayResult<()>;

    /// Resolve loosely specified instruments into qualified ones.
    async fn qualify_contracts(&self, instruments: &[Instrument]) -> GatewayResult<Vec<Instrument>>;

    async fn historical_bars(&self, instrument: &Instrument, request: &BarRequest) -> GatewayResult<Vec<Bar>>;

    async fn positions(&self) -> GatewayResult<Vec<Position>>;

    /// Orders still working at the broker.
    async fn open_orders(&self) -> GatewayResult<Vec<LiveOrder>>;

    /// All orders of the session, including completed ones.
    async fn trades(&self) -> GatewayResult<Vec<LiveOrder>>;

    async fn account_values(&self) -> GatewayResult<Vec<AccountValue>>;

    /// Submit an intent; returns the parent order as acknowledged by the broker.
    async fn submit_order(&self, instrument: &Instrument, intent: &OrderIntent) -> GatewayResult<LiveOrder>;

    async fn cancel_order(&self, order: &LiveOrder) -> GatewayResult<()>;

    async fn scan_market(&self, _subscription: &ScannerSubscription) -> GatewayResult<Vec<Instrument>> {
        Ok(Vec::new())
    }
}

/// Run a gateway call under a deadline; expiry maps to [`GatewayError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(limit)),
    }
}

/// Bounds for session establishment.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Give up once this much time has passed
    pub max_elapsed: Duration,
    /// Give up after this many failed attempts
    pub max_attempts: u32,
    /// Deadline for a single connection attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(300),
            max_attempts: 8,
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

/// Connect with exponential backoff; fails permanently after the attempt
/// budget or the elapsed-time budget is spent.
pub async fn connect_with_retry<G>(gateway: &G, endpoint: &GatewayEndpoint, policy: &RetryPolicy) -> GatewayResult<()>
where
    G: BrokerGateway + ?Sized,
{
    let schedule = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial_interval)
        .with_max_interval(policy.max_interval)
        .with_max_elapsed_time(Some(policy.max_elapsed))
        .build();

    let mut attempt = 0u32;
    let operation = move || {
        attempt += 1;
        let current = attempt;
        async move {
            info!(
                host = %endpoint.host,
                port = endpoint.port,
                client_id = endpoint.client_id,
                attempt = current,
                "Connecting to gateway"
            );

            let result = with_timeout(policy.attempt_timeout, gateway.connect(endpoint)).await;
            let result = result.and_then(|_| {
                if gateway.is_connected() {
                    Ok(())
                } else {
                    Err(GatewayError::NotConnected)
                }
            });

            result.map_err(|e| {
                if current >= policy.max_attempts || !e.is_transient() {
                    backoff::Error::permanent(e)
                } else {
                    backoff::Error::transient(e)
                }
            })
        }
    };

    backoff::future::retry_notify(schedule, operation, |e: GatewayError, wait: Duration| {
        warn!(error = %e, retry_in = ?wait, "Gateway connection failed");
    })
    .await
    .map_err(|e| GatewayError::Connectivity(e.to_string()))?;

    info!("Connected to gateway");
    Ok(())
}
