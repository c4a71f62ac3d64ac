//! OHLCV commands: initialize, update-data (one-shot or daemon), interval
//! management, ticker-universe refresh, and the not-found sweeps.

use anyhow::{ensure, Result};
use async_trait::async_trait;
use clap::Args;
use std::path::PathBuf;

use crate::config::ConfigService;
use crate::daemon::{run_daemon, DaemonOptions, DaemonTask, MaintenanceCadence, ShutdownFlag};
use crate::hours::TradingHoursChecker;
use crate::limiter::WindowLimiter;
use crate::ohlcv::{IntervalScheduler, OhlcvService, TickerRegistry, YahooChartProvider};

const DEFAULT_INTERVALS: &[&str] = &["1d", "1h"];
const DEFAULT_TRADING_HOURS: &str = "09:30-16:00";
const EXTENDED_TRADING_HOURS: &str = "04:00-20:00";
const MARKET_TIMEZONE: &str = "US/Eastern";

#[derive(Debug, Args)]
pub struct InitializeArgs {
    /// Intervals to seed intervals.json with
    #[arg(long = "intervals", num_args = 1..)]
    pub intervals: Vec<String>,

    /// Skip the ticker-universe download
    #[arg(long)]
    pub no_tickers: bool,
}

#[derive(Debug, Args)]
pub struct UpdateDataArgs {
    /// Run continuously as a daemon
    #[arg(long)]
    pub daemon: bool,

    /// Hours between runs in daemon mode
    #[arg(long, default_value_t = 24)]
    pub interval: u64,

    /// Trading hours HH:MM-HH:MM in market time
    #[arg(long)]
    pub trading_hours: Option<String>,

    /// Use the extended session (04:00-20:00) as the active window
    #[arg(long)]
    pub extended_hours: bool,

    /// Registry maintenance cadence in daemon mode
    #[arg(long, default_value = "weekly")]
    pub ticker_maintenance: MaintenanceCadence,

    /// PID file to prevent multiple daemon instances
    #[arg(long)]
    pub pid_file: Option<PathBuf>,
}

impl clap::builder::ValueParserFactory for MaintenanceCadence {
    type Parser = clap::builder::ValueParser;

    fn value_parser() -> Self::Parser {
        clap::builder::ValueParser::new(|value: &str| value.parse::<MaintenanceCadence>())
    }
}

fn build_service(config: &ConfigService) -> Result<OhlcvService<YahooChartProvider>> {
    Ok(OhlcvService::new(
        config.clone(),
        YahooChartProvider::with_defaults()?,
    ))
}

fn build_limiter(config: &ConfigService) -> WindowLimiter {
    let limits = config.ohlcv_limits();
    WindowLimiter::new(limits.max_requests, limits.window)
}

fn load_intervals(config: &ConfigService) -> Result<Vec<String>> {
    let intervals = config.load_intervals();
    ensure!(
        !intervals.is_empty(),
        "no intervals found. Run 'initialize' or 'add-interval' first."
    );
    Ok(intervals)
}

pub async fn initialize(config: &ConfigService, args: &InitializeArgs) -> Result<()> {
    std::fs::create_dir_all(config.data_root())?;

    let intervals: Vec<String> = if args.intervals.is_empty() {
        DEFAULT_INTERVALS.iter().map(|s| (*s).to_string()).collect()
    } else {
        args.intervals.clone()
    };
    config.save_intervals(&intervals)?;
    println!("Seeded intervals: {}", intervals.join(", "));

    if !args.no_tickers {
        let service = build_service(config)?;
        let universe = service.download_ticker_universe().await?;
        let mut registry = TickerRegistry::new(config.clone());
        let added = universe.len();
        registry.update_current_list(universe);
        registry.save()?;
        println!("Ticker universe: {added} listed symbols, {} tracked", registry.len());
    }
    println!("Initialized working directory {}", config.base_path().display());
    Ok(())
}

struct OhlcvDaemonTask {
    service: OhlcvService<YahooChartProvider>,
    registry: TickerRegistry,
    limiter: WindowLimiter,
    intervals: Vec<String>,
    maintenance_provider: YahooChartProvider,
}

#[async_trait]
impl DaemonTask for OhlcvDaemonTask {
    async fn run_cycle(&mut self) -> Result<()> {
        IntervalScheduler::run(
            &self.service,
            &mut self.registry,
            &self.limiter,
            &self.intervals,
            None,
            None,
        )
        .await
    }

    async fn run_maintenance(&mut self) -> Result<()> {
        tracing::info!("running ticker maintenance sweeps");
        self.registry
            .confirm_not_founds(&self.maintenance_provider, &self.limiter)
            .await
    }
}

pub async fn update_data(config: &ConfigService, args: UpdateDataArgs) -> Result<()> {
    let intervals = load_intervals(config)?;
    let hours_spec = if args.extended_hours {
        EXTENDED_TRADING_HOURS
    } else {
        args.trading_hours.as_deref().unwrap_or(DEFAULT_TRADING_HOURS)
    };
    let (start, end) = TradingHoursChecker::parse_active_hours(hours_spec)?;
    let hours = TradingHoursChecker::new(start, end, MARKET_TIMEZONE)?;

    let service = build_service(config)?;
    let limiter = build_limiter(config);
    let mut registry = TickerRegistry::new(config.clone());

    if args.daemon {
        let shutdown = ShutdownFlag::new();
        shutdown.install_signal_handlers()?;
        let mut task = OhlcvDaemonTask {
            service,
            registry,
            limiter,
            intervals,
            maintenance_provider: YahooChartProvider::with_defaults()?,
        };
        let options = DaemonOptions {
            fetch_interval_hours: args.interval,
            hours,
            maintenance: args.ticker_maintenance,
            pid_file: args.pid_file,
            initial_fetch_when_empty: false,
        };
        return run_daemon(&mut task, &options, &shutdown).await;
    }

    IntervalScheduler::run(&service, &mut registry, &limiter, &intervals, None, None).await?;
    println!("Update complete for intervals: {}", intervals.join(", "));
    Ok(())
}

pub fn add_interval(config: &ConfigService, interval: &str) -> Result<()> {
    let mut intervals = config.load_intervals();
    if intervals.iter().any(|i| i == interval) {
        println!("Interval {interval} already configured");
        return Ok(());
    }
    intervals.push(interval.to_string());
    config.save_intervals(&intervals)?;
    println!("Intervals: {}", intervals.join(", "));
    Ok(())
}

pub fn remove_interval(config: &ConfigService, interval: &str) -> Result<()> {
    let mut intervals = config.load_intervals();
    intervals.retain(|i| i != interval);
    config.save_intervals(&intervals)?;
    println!("Intervals: {}", intervals.join(", "));
    Ok(())
}

pub async fn update_tickers(config: &ConfigService) -> Result<()> {
    let service = build_service(config)?;
    let universe = service.download_ticker_universe().await?;
    let mut registry = TickerRegistry::new(config.clone());
    let before = registry.len();
    registry.update_current_list(universe);
    registry.save()?;
    println!(
        "Ticker universe refreshed: {} tracked ({} new)",
        registry.len(),
        registry.len().saturating_sub(before)
    );
    Ok(())
}

pub async fn confirm_not_founds(config: &ConfigService) -> Result<()> {
    let provider = YahooChartProvider::with_defaults()?;
    let limiter = build_limiter(config);
    let mut registry = TickerRegistry::new(config.clone());
    registry.confirm_not_founds(&provider, &limiter).await?;
    println!(
        "Not-found sweep complete; {} tickers remain excluded",
        registry.not_found_count()
    );
    Ok(())
}

pub fn reparse_not_founds(config: &ConfigService) -> Result<()> {
    let mut registry = TickerRegistry::new(config.clone());
    registry.reparse_not_founds()?;
    println!(
        "Reparse complete; {} tickers remain excluded",
        registry.not_found_count()
    );
    Ok(())
}
