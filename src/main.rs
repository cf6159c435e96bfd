//! Cascade Lender - Main Entry Point
//!
//! Runs the lending loop live against Bitfinex or against the in-memory paper
//! exchange, plus a couple of read-only inspection commands.

use anyhow::Result;
use cascade_lender::config::Config;
use cascade_lender::exchange::{
    BitfinexGateway, Currency, LendingExchange, PaperExchange, SignedRequestClient,
};
use cascade_lender::strategy::{DecaySchedule, OfferRebalancer, PollLoop};
use cascade_lender::utils::{Clock, SystemClock};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Cascade Lender CLI
#[derive(Parser)]
#[command(name = "cascade-lender")]
#[command(version, about = "Cascading-rate margin funding bot for Bitfinex")]
struct Cli {
    /// Emit JSON logs on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Lend against an in-memory paper exchange instead of Bitfinex
    #[arg(long, global = true, env = "PAPER_TRADING")]
    paper: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the lending loop (default)
    Run(PaperArgs),

    /// Show lendbook bids worth lending into, then available balances
    Lendbook {
        /// Currency to inspect (usd or btc)
        #[arg(short, long, default_value = "usd")]
        currency: Currency,

        /// Lowest rate to show; defaults to the configured min_rate
        #[arg(short, long)]
        min_rate: Option<Decimal>,
    },

    /// Show open lend offers and the rate each would decay to now
    Offers,
}

/// Simulated account for `--paper` runs.
#[derive(Args, Debug, Clone, PartialEq)]
struct PaperArgs {
    /// Starting USD deposit balance for paper trading
    #[arg(long, default_value = "10000")]
    paper_usd: Decimal,

    /// Starting BTC deposit balance for paper trading
    #[arg(long, default_value = "0")]
    paper_btc: Decimal,

    /// Simulated USD borrower rate; paper offers at or below it fill
    #[arg(long)]
    paper_usd_market_rate: Option<Decimal>,

    /// Simulated BTC borrower rate; paper offers at or below it fill
    #[arg(long)]
    paper_btc_market_rate: Option<Decimal>,
}

impl Default for PaperArgs {
    fn default() -> Self {
        Self {
            paper_usd: Decimal::from(10_000),
            paper_btc: Decimal::ZERO,
            paper_usd_market_rate: None,
            paper_btc_market_rate: None,
        }
    }
}

/// Trading mode: Live (real money) or Paper (in-memory exchange).
#[derive(Debug, Clone, Copy, PartialEq)]
enum TradingMode {
    Live,
    Paper,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.json)?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Some(Commands::Lendbook { currency, min_rate }) => {
            show_lendbook(&config, currency, min_rate).await
        }
        Some(Commands::Offers) => show_offers(&config).await,
        Some(Commands::Run(paper_args)) => run(config, cli.paper, paper_args).await,
        None => run(config, cli.paper, PaperArgs::default()).await,
    }
}

async fn run(config: Config, paper: bool, paper_args: PaperArgs) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║              Cascade Lender v{}                         ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let mode = if paper {
        info!("📝 PAPER TRADING MODE - No funds at risk");
        TradingMode::Paper
    } else {
        warn!("⚠️  LIVE LENDING MODE - Real funds will be offered");
        TradingMode::Live
    };

    log_config(&config);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let rebalancer = OfferRebalancer::new(DecaySchedule::from_config(&config), clock.clone());

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    info!("🚀 Starting lending loop...");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let result = match mode {
        TradingMode::Paper => {
            let exchange = paper_exchange(&paper_args, clock.clone()).await;

            PollLoop::new(exchange, rebalancer, config, clock)
                .run(&shutdown)
                .await
        }
        TradingMode::Live => {
            let gateway = live_gateway(&config, clock.clone())?;
            PollLoop::new(gateway, rebalancer, config, clock)
                .run(&shutdown)
                .await
        }
    };

    match result {
        Ok(stats) => {
            info!(
                "📊 Cycles: {} | Cancelled: {} | Re-offered: {} | Skipped: {} | Lent idle: {}",
                stats.cycles,
                stats.offers_cancelled,
                stats.offers_repriced,
                stats.buckets_skipped,
                stats.offers_placed
            );
            info!("👋 Cascade Lender shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("❌ Lending loop stopped: {}", e);
            Err(e.into())
        }
    }
}

async fn paper_exchange(args: &PaperArgs, clock: Arc<dyn Clock>) -> PaperExchange {
    let exchange = PaperExchange::new(clock);
    exchange.deposit(Currency::Usd, args.paper_usd).await;
    exchange.deposit(Currency::Btc, args.paper_btc).await;
    info!(usd = %args.paper_usd, btc = %args.paper_btc, "[PAPER] Seeded deposit wallet");

    let market_rates = [
        (Currency::Usd, args.paper_usd_market_rate),
        (Currency::Btc, args.paper_btc_market_rate),
    ];
    for (currency, rate) in market_rates {
        if let Some(rate) = rate {
            exchange.set_market_rate(currency, rate).await;
            info!(%currency, %rate, "[PAPER] Offers at or below this rate will fill");
        }
    }
    exchange
}

fn live_gateway(config: &Config, clock: Arc<dyn Clock>) -> Result<BitfinexGateway> {
    config.validate_credentials()?;
    let client = SignedRequestClient::from_config(config, clock)?;
    Ok(BitfinexGateway::new(client))
}

/// Print lendbook bids at or above `min_rate`, then available balances.
async fn show_lendbook(config: &Config, currency: Currency, min_rate: Option<Decimal>) -> Result<()> {
    let gateway = live_gateway(config, Arc::new(SystemClock))?;
    let min_rate = min_rate.unwrap_or(config.currency(currency).decay.min_rate);

    let book = gateway.lendbook(currency).await?;
    println!("{} lendbook bids at or above {}%:", currency, min_rate);
    let mut shown = 0;
    for bid in book.bids_at_or_above(min_rate) {
        println!(
            "   {:>10}% {:>16} for {:>2} days",
            bid.rate, bid.amount, bid.period
        );
        shown += 1;
    }
    if shown == 0 {
        println!("   (none)");
    }

    let balances = gateway.available_balances().await?;
    println!("Available balances:");
    for c in Currency::ALL {
        println!("   {}: {}", c, balances.get(c));
    }
    Ok(())
}

/// Print open offers and the rate each would move to if rebalanced now.
async fn show_offers(config: &Config) -> Result<()> {
    let clock = Arc::new(SystemClock);
    let gateway = live_gateway(config, clock.clone())?;
    let schedule = DecaySchedule::from_config(config);
    let now = clock.now();

    let offers = gateway.list_offers().await?;
    if offers.is_empty() {
        println!("No open lend offers");
        return Ok(());
    }

    for currency in Currency::ALL {
        let open = offers.get(currency);
        if open.is_empty() {
            continue;
        }
        println!("{} offers:", currency);
        for offer in open {
            match schedule.next_rate(offer, now)? {
                Some(rate) => println!("   {} -> {}%", offer, rate),
                None => println!("   {} (unchanged)", offer),
            }
        }
    }
    Ok(())
}

/// Initialize logging to stdout and an hourly log file.
fn init_logging(json: bool) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "cascade-lender.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("cascade_lender=debug".parse()?)
        .add_directive(Level::INFO.into());

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stdout.and(file_writer))
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stdout.and(file_writer))
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(true)
            .init();
    }

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Exchange: {}", config.exchange.base_url);
    info!(
        "   Rate Limit: {} requests / {}s",
        config.rate_limit.max_requests, config.rate_limit.interval_secs
    );
    info!("   Poll Interval: {}s", config.poll.interval_secs);
    info!("   Retry Base Delay: {}ms", config.retry.base_delay_ms);
    for currency in Currency::ALL {
        let c = config.currency(currency);
        if !c.enabled {
            info!("   {}: disabled", currency);
            continue;
        }
        info!(
            "   {}: start {}% -> min {}% (-{} x{} every {}s), {} days, min amount {}",
            currency,
            c.start_rate,
            c.decay.min_rate,
            c.decay.rate_decrement,
            c.decay.decay_multiplier,
            c.decay.decrement_interval_secs,
            c.lend_period_days,
            c.minimum_amount
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_lender::utils::ManualClock;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn test_paper_flag_from_env_is_case_insensitive() {
        for (value, expected) in [("true", true), ("TRUE", true), ("1", true), ("false", false)] {
            std::env::set_var("PAPER_TRADING", value);
            let cli = Cli::try_parse_from(["cascade-lender", "run"]).unwrap();
            assert_eq!(cli.paper, expected, "PAPER_TRADING={}", value);
        }
        std::env::remove_var("PAPER_TRADING");

        let cli = Cli::try_parse_from(["cascade-lender"]).unwrap();
        assert!(!cli.paper);
        let cli = Cli::try_parse_from(["cascade-lender", "run", "--paper"]).unwrap();
        assert!(cli.paper);
    }

    #[test]
    fn test_run_parses_paper_market_rates() {
        let cli = Cli::try_parse_from([
            "cascade-lender",
            "run",
            "--paper-usd",
            "2500",
            "--paper-usd-market-rate",
            "12.5",
        ])
        .unwrap();

        match cli.command {
            Some(Commands::Run(args)) => {
                assert_eq!(args.paper_usd, dec!(2500));
                assert_eq!(args.paper_btc, Decimal::ZERO);
                assert_eq!(args.paper_usd_market_rate, Some(dec!(12.5)));
                assert_eq!(args.paper_btc_market_rate, None);
            }
            _ => panic!("expected run command"),
        }
    }

    #[tokio::test]
    async fn test_paper_exchange_fills_at_market_rate() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap(),
        ));
        let args = PaperArgs {
            paper_usd: dec!(300),
            paper_usd_market_rate: Some(dec!(12)),
            ..PaperArgs::default()
        };
        let exchange = paper_exchange(&args, clock).await;

        exchange.new_offer(Currency::Usd, dec!(100), dec!(15), 2).await.unwrap();
        exchange.new_offer(Currency::Usd, dec!(200), dec!(11), 2).await.unwrap();
        let offers = exchange.list_offers().await.unwrap();

        assert_eq!(offers.get(Currency::Usd).len(), 1);
        assert_eq!(exchange.lent(Currency::Usd).await, dec!(200));
    }
}
