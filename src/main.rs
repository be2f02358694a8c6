//! Interactive Brokers breakout agent
//!
//! Polls a Client Portal gateway for positions, working orders and bars,
//! cuts positions beyond a loss threshold, cancels orders whose entry no
//! longer makes sense and places bracket orders on bar breakouts.

mod bot;
mod broker;
mod indicators;
mod models;
mod trading;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::bot::{Bot, BotConfig};
use crate::broker::{
    connect_with_retry, with_timeout, BrokerGateway, ClientPortalGateway, GatewayEndpoint, RetryPolicy,
};
use crate::indicators::IndicatorCalculator;
use crate::models::{AccountSummary, BarSeries, Instrument};
use crate::trading::{Decision, InstrumentCache, SignalEvaluator, TradingConfig};

/// Interactive Brokers breakout agent CLI.
#[derive(Parser)]
#[command(name = "ibkr-breakout")]
#[command(about = "Trade bar breakouts and cut losers through an IBKR gateway", long_about = None)]
struct Cli {
    /// Gateway host
    #[arg(long, env = "IBKR_GATEWAY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Gateway port
    #[arg(long, env = "IBKR_GATEWAY_PORT", default_value = "5000")]
    port: u16,

    /// Client id, used as the prefix of order references
    #[arg(long, env = "IBKR_CLIENT_ID", default_value = "1")]
    client_id: i32,

    /// Account to trade; defaults to the first account of the session
    #[arg(long, env = "IBKR_ACCOUNT_ID")]
    account: Option<String>,

    /// Accept the gateway's self-signed certificate
    #[arg(long, env = "IBKR_INSECURE_TLS")]
    insecure_tls: bool,

    /// Log decisions without placing or cancelling orders
    #[arg(long, env = "IBKR_DRY_RUN")]
    dry_run: bool,

    /// Connection attempts before giving up
    #[arg(long, env = "IBKR_CONNECT_ATTEMPTS", default_value = "8")]
    connect_attempts: u32,

    /// Deadline for each gateway call (seconds)
    #[arg(long, env = "IBKR_CALL_TIMEOUT", default_value = "30")]
    call_timeout: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the trading loop
    Run {
        /// Polling interval in seconds
        #[arg(short, long, env = "IBKR_POLL_INTERVAL", default_value = "30")]
        interval: u64,

        /// Exit positions whose unrealized P&L percentage falls below this
        #[arg(short, long, env = "IBKR_PNL_THRESHOLD", default_value = "-5", allow_hyphen_values = true)]
        threshold: Decimal,

        /// Comma separated watch list (forex pairs or stock tickers)
        #[arg(short, long, env = "IBKR_SYMBOLS", value_delimiter = ',')]
        symbols: Vec<String>,

        /// Add market scanner results to the watch list
        #[arg(long)]
        scanner: bool,

        /// Skip instruments whose last bar is older than this (minutes)
        #[arg(long, env = "IBKR_MAX_BAR_AGE", default_value = "30")]
        max_bar_age: i64,
    },

    /// Show account summary, positions and working orders
    Status,

    /// Show indicators and the entry decision for one instrument
    Indicators {
        /// Forex pair (EURUSD) or stock ticker
        symbol: String,

        /// Number of indicator rows to print
        #[arg(short, long, default_value = "5")]
        rows: usize,
    },

    /// Cancel every working order
    CancelAll,

    /// Show current configuration
    Config,
}

impl Cli {
    fn endpoint(&self) -> GatewayEndpoint {
        GatewayEndpoint {
            host: self.host.clone(),
            port: self.port,
            client_id: self.client_id,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.connect_attempts,
            ..Default::default()
        }
    }

    fn trading_config(&self) -> TradingConfig {
        TradingConfig {
            call_timeout: Duration::from_secs(self.call_timeout),
            ..Default::default()
        }
    }

    fn gateway(&self) -> Result<Arc<ClientPortalGateway>> {
        let gateway = ClientPortalGateway::new(self.account.clone(), self.insecure_tls)
            .context("Failed to build gateway client")?;
        Ok(Arc::new(gateway))
    }

    async fn connect(&self) -> Result<Arc<ClientPortalGateway>> {
        let gateway = self.gateway()?;
        connect_with_retry(gateway.as_ref(), &self.endpoint(), &self.retry_policy())
            .await
            .context("Failed to connect to gateway")?;
        Ok(gateway)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match &cli.command {
        Commands::Run {
            interval,
            threshold,
            symbols,
            scanner,
            max_bar_age,
        } => {
            let mut trading_config = cli.trading_config();
            trading_config.unrealized_pnl_threshold = *threshold;
            trading_config.max_bar_age_minutes = *max_bar_age;
            trading_config.use_scanner = *scanner;
            if !symbols.is_empty() {
                trading_config.symbols = symbols.iter().map(|s| s.trim().to_string()).collect();
            }

            let bot_config = BotConfig {
                endpoint: cli.endpoint(),
                retry: cli.retry_policy(),
                poll_interval_secs: *interval,
                dry_run: cli.dry_run,
                trading_config,
                ..Default::default()
            };

            info!(
                host = %cli.host,
                port = cli.port,
                interval = interval,
                threshold = %threshold,
                dry_run = cli.dry_run,
                "Starting breakout agent"
            );

            println!("\n=== IBKR Breakout Agent ===");
            println!("Gateway:          {}:{}", cli.host, cli.port);
            println!("Polling interval: {}s", interval);
            println!("P&L threshold:    {}%", threshold);
            println!("Watch list:       {}", bot_config.trading_config.symbols.join(", "));
            println!("Mode: {}", if cli.dry_run { "DRY RUN (no real orders)" } else { "LIVE TRADING" });
            println!("\nPress Ctrl+C to stop.\n");

            let mut bot = Bot::new(bot_config, cli.gateway()?);
            bot.run().await?;
        }

        Commands::Status => {
            let gateway = cli.connect().await?;
            let timeout = cli.trading_config().call_timeout;

            let values = with_timeout(timeout, gateway.account_values()).await?;
            let summary = AccountSummary::from_values(&values);
            println!("\n=== Account Summary ===");
            if summary.is_empty() {
                println!("No account values reported.");
            } else {
                print!("{}", summary);
            }

            let positions = with_timeout(timeout, gateway.positions()).await?;
            println!("\n=== Positions ({}) ===", positions.len());
            println!("{:<22} {:>12} {:>14} {:>14} {:>8}", "INSTRUMENT", "QTY", "AVG COST", "UNRL P&L", "P&L %");
            for p in &positions {
                let pct = p
                    .unrealized_pct()
                    .map(|v| format!("{:.2}", v))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<22} {:>12} {:>14.4} {:>14.2} {:>8}",
                    p.instrument.to_string(),
                    p.quantity,
                    p.average_cost,
                    p.unrealized_pnl,
                    pct
                );
            }

            let orders = with_timeout(timeout, gateway.open_orders()).await?;
            println!("\n=== Working Orders ({}) ===", orders.len());
            for o in &orders {
                println!(
                    "  #{} {} {} {} {} @ {} [{:?}]",
                    o.order_id,
                    o.side.as_str(),
                    o.quantity,
                    o.instrument,
                    o.order_type,
                    o.limit_price.map(|p| p.to_string()).unwrap_or_else(|| "MKT".to_string()),
                    o.status
                );
            }

            gateway.disconnect().await?;
        }

        Commands::Indicators { symbol, rows } => {
            let gateway = cli.connect().await?;
            let trading_config = cli.trading_config();
            let timeout = trading_config.call_timeout;

            let mut cache = InstrumentCache::new();
            let instrument = cache
                .resolve(gateway.as_ref(), &Instrument::parse_symbol(symbol), timeout)
                .await
                .with_context(|| format!("Could not qualify {}", symbol))?;

            let bars = with_timeout(timeout, gateway.historical_bars(&instrument, &trading_config.bar_request)).await?;
            let series = BarSeries::new(instrument.clone(), bars);
            let set = IndicatorCalculator::calculate(&series);
            if set.is_empty() {
                println!("\n{}: {} bars is not enough history for indicators", instrument, series.len());
            }

            println!("\n=== {} ({} bars, {} indicator rows) ===", instrument, series.len(), set.len());
            println!(
                "{:>5} {:>11} {:>11} {:>11} {:>11} {:>11} {:>11} {:>11}",
                "BAR", "CLOSE", "MA7", "MA21", "MACD", "UPPER", "LOWER", "EMA"
            );
            for row in set.rows.iter().rev().take(*rows).rev() {
                println!(
                    "{:>5} {:>11.5} {:>11.5} {:>11.5} {:>11.5} {:>11.5} {:>11.5} {:>11.5}",
                    row.index, row.close, row.ma7, row.ma21, row.macd, row.upper_band, row.lower_band, row.ema
                );
            }

            let evaluator = SignalEvaluator::new(trading_config);
            match evaluator.evaluate_entry(&series, Utc::now()) {
                Decision::Open(intent) => println!("\nEntry signal: {}", intent),
                Decision::Hold(reason) => println!("\nNo entry: {:?}", reason),
                other => println!("\nDecision: {:?}", other),
            }

            gateway.disconnect().await?;
        }

        Commands::CancelAll => {
            let gateway = cli.connect().await?;
            let timeout = cli.trading_config().call_timeout;

            let orders = with_timeout(timeout, gateway.open_orders()).await?;
            let mut cancelled = 0;
            for order in &orders {
                if cli.dry_run {
                    println!("[DRY RUN] Would cancel #{} {}", order.order_id, order.instrument);
                    continue;
                }
                match with_timeout(timeout, gateway.cancel_order(order)).await {
                    Ok(()) => {
                        cancelled += 1;
                        println!("Cancelled #{} {}", order.order_id, order.instrument);
                    }
                    Err(e) => println!("Failed to cancel #{}: {}", order.order_id, e),
                }
            }
            println!("\n{} of {} working orders cancelled.", cancelled, orders.len());

            gateway.disconnect().await?;
        }

        Commands::Config => {
            let config = cli.trading_config();
            let bot = BotConfig::default();

            println!("\n=== Gateway ===\n");
            println!("  Endpoint:             {}:{}", cli.host, cli.port);
            println!("  Client Id:            {}", cli.client_id);
            println!("  Account:              {}", cli.account.as_deref().unwrap_or("(first available)"));
            println!("  Insecure TLS:         {}", cli.insecure_tls);
            println!("  Connect Attempts:     {}", cli.connect_attempts);
            println!("  Call Timeout:         {}s", config.call_timeout.as_secs());

            println!("\n=== Loop ===\n");
            println!("  Poll Interval:        {}s (+/- {}s)", bot.poll_interval_secs, bot.jitter_secs);
            println!("  Dry Run:              {}", cli.dry_run);

            println!("\n=== Bars ===\n");
            println!("  Duration:             {}", config.bar_request.duration);
            println!("  Bar Size:             {}", config.bar_request.bar_size);
            println!("  Price Type:           {}", config.bar_request.price_type);
            println!("  Regular Hours Only:   {}", config.bar_request.regular_hours_only);

            println!("\n=== Trading ===\n");
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
