//! Posttrade commands: fetch-trades (one-shot or daemon), check-status,
//! list-files, check-partial, consolidate-month.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use clap::Args;
use std::io::Write;
use std::path::PathBuf;

use crate::config::{ConfigService, DATE_FMT};
use crate::daemon::{run_daemon, DaemonOptions, DaemonTask, MaintenanceCadence, ShutdownFlag};
use crate::hours::TradingHoursChecker;
use crate::storage::WriteOptions;
use crate::trades::{FetchSummary, HttpTradeFeed, PosttradeFetcher, PosttradeService};

const DEFAULT_ACTIVE_HOURS: &str = "08:30-18:00";
const MARKET_TIMEZONE: &str = "Europe/Berlin";

#[derive(Debug, Args)]
pub struct VenueArgs {
    /// Venue code (DETR = Xetra, DFRA = Frankfurt floor, DGAT = Xetra
    /// gateways, DEUR = Eurex)
    pub venue: String,

    /// Market code
    #[arg(long, default_value = "de")]
    pub market: String,

    /// Source code
    #[arg(long, default_value = "xetra")]
    pub source: String,
}

#[derive(Debug, Args)]
pub struct ListFilesArgs {
    #[command(flatten)]
    pub venue: VenueArgs,

    /// Trade date (YYYY-MM-DD, default: today)
    #[arg(long)]
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Args)]
pub struct ConsolidateArgs {
    #[command(flatten)]
    pub venue: VenueArgs,

    /// Consolidate all available months without prompting
    #[arg(long = "all")]
    pub all_months: bool,
}

#[derive(Debug, Args)]
pub struct FetchTradesArgs {
    #[command(flatten)]
    pub venue: VenueArgs,

    /// Display only, don't store
    #[arg(long)]
    pub no_store: bool,

    /// Run continuously as a daemon
    #[arg(long)]
    pub daemon: bool,

    /// Hours between runs in daemon mode
    #[arg(long, default_value_t = 1)]
    pub interval: u64,

    /// Trading hours HH:MM-HH:MM in CET/CEST
    #[arg(long)]
    pub active_hours: Option<String>,

    /// PID file to prevent multiple daemon instances
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Skip monthly consolidation after completed days
    #[arg(long)]
    pub no_consolidate: bool,
}

fn build_service(config: &ConfigService) -> Result<PosttradeService<HttpTradeFeed>> {
    let fetcher = PosttradeFetcher::with_defaults(config.trade_limits())?;
    Ok(PosttradeService::new(
        HttpTradeFeed::new(fetcher),
        config.data_root(),
        WriteOptions::default(),
    ))
}

fn print_summary(summary: &FetchSummary, market: &str, source: &str, venue: &str) {
    if summary.total_trades == 0 && summary.dates_fetched.is_empty() {
        println!("All available data already stored for {venue}");
        return;
    }
    println!("Fetched and stored trades for {venue}:");
    if !summary.dates_fetched.is_empty() {
        let dates: Vec<String> = summary
            .dates_fetched
            .iter()
            .map(|d| d.format(DATE_FMT).to_string())
            .collect();
        println!("  completed dates: {}", dates.join(", "));
    }
    if !summary.dates_partial.is_empty() {
        let dates: Vec<String> = summary
            .dates_partial
            .iter()
            .map(|d| d.format(DATE_FMT).to_string())
            .collect();
        println!("  partial dates:   {}", dates.join(", "));
        println!("  progress has been saved; re-run to resume");
    }
    println!("  total trades: {}", summary.total_trades);
    println!("  total files:  {}", summary.total_files);
    if summary.consolidated {
        println!("  monthly consolidation completed");
        println!("  daily files preserved in data/{market}/{source}/trades/venue={venue}/...");
        println!("  monthly file in data/{market}/{source}/trades_monthly/venue={venue}/...");
    }
}

struct TradesDaemonTask {
    service: PosttradeService<HttpTradeFeed>,
    venue: String,
    market: String,
    source: String,
    consolidate: bool,
}

#[async_trait]
impl DaemonTask for TradesDaemonTask {
    fn has_any_data(&self) -> bool {
        self.service
            .has_any_data(&self.venue, &self.market, &self.source)
    }

    async fn run_cycle(&mut self) -> Result<()> {
        let summary = self
            .service
            .fetch_and_store_missing_incremental(
                &self.venue,
                &self.market,
                &self.source,
                self.consolidate,
            )
            .await?;
        tracing::info!(
            venue = %self.venue,
            complete = summary.dates_fetched.len(),
            partial = summary.dates_partial.len(),
            trades = summary.total_trades,
            "cycle complete"
        );
        Ok(())
    }
}

pub async fn fetch_trades(config: &ConfigService, args: FetchTradesArgs) -> Result<()> {
    let hours_spec = args.active_hours.as_deref().unwrap_or(DEFAULT_ACTIVE_HOURS);
    let (start, end) = TradingHoursChecker::parse_active_hours(hours_spec)?;
    let hours = TradingHoursChecker::new(start, end, MARKET_TIMEZONE)?;

    let service = build_service(config)?;
    let VenueArgs {
        venue,
        market,
        source,
    } = args.venue;

    if args.no_store {
        tracing::info!(%venue, "checking missing dates (dry run mode)");
        let missing = service.get_missing_dates(&venue, &market, &source).await?;
        if missing.is_empty() {
            println!("All available data already stored for {venue}");
        } else {
            println!("Would fetch {} date(s) for {venue}:", missing.len());
            for date in missing {
                println!("  - {date}");
            }
            println!("\nRemove --no-store to fetch and store this data");
        }
        return Ok(());
    }

    if args.daemon {
        let shutdown = ShutdownFlag::new();
        shutdown.install_signal_handlers()?;
        let mut task = TradesDaemonTask {
            service,
            venue,
            market,
            source,
            consolidate: !args.no_consolidate,
        };
        let options = DaemonOptions {
            fetch_interval_hours: args.interval,
            hours,
            maintenance: MaintenanceCadence::Never,
            pid_file: args.pid_file,
            initial_fetch_when_empty: true,
        };
        return run_daemon(&mut task, &options, &shutdown).await;
    }

    let summary = service
        .fetch_and_store_missing_incremental(&venue, &market, &source, !args.no_consolidate)
        .await?;
    print_summary(&summary, &market, &source, &venue);
    Ok(())
}

pub async fn check_status(config: &ConfigService, args: &VenueArgs) -> Result<()> {
    let service = build_service(config)?;
    let today = Utc::now().date_naive();
    let yesterday = today - Days::new(1);

    println!("\nStatus for {}:", args.venue);
    println!("{}", "-".repeat(50));
    for date in [today, yesterday] {
        let api_status = match service.list_files(&args.venue, date).await {
            Ok(files) if !files.is_empty() => format!("{} files available", files.len()),
            Ok(_) => "no files".to_string(),
            Err(err) => format!("error: {err}"),
        };
        let stored = service
            .store()
            .path_builder()
            .trades_day_path(&args.market, &args.source, &args.venue, date)
            .exists();
        println!("\n{date}:");
        println!("  API:     {api_status}");
        println!(
            "  Storage: {}",
            if stored { "stored locally" } else { "not stored" }
        );
    }
    Ok(())
}

pub async fn list_files(config: &ConfigService, args: &ListFilesArgs) -> Result<()> {
    let service = build_service(config)?;
    let date = args.date.unwrap_or_else(|| Utc::now().date_naive());
    let files = service.list_files(&args.venue.venue, date).await?;
    if files.is_empty() {
        println!("No files found for {} on {date}", args.venue.venue);
    } else {
        println!("Found {} files for {} on {date}:", files.len(), args.venue.venue);
        for filename in files {
            println!("  - {filename}");
        }
    }
    Ok(())
}

pub fn check_partial(config: &ConfigService, args: &VenueArgs) -> Result<()> {
    let service = build_service(config)?;
    let report = service.check_partial_downloads(&args.venue, &args.market, &args.source)?;

    println!("\nDownload status for {}:\n", args.venue);
    if report.complete_dates.is_empty() {
        println!("No complete dates found");
    } else {
        println!("Complete dates ({}):", report.complete_dates.len());
        let tail = report.complete_dates.len().saturating_sub(10);
        for date in &report.complete_dates[tail..] {
            println!("  - {date}");
        }
        if tail > 0 {
            println!("  ... and {tail} more");
        }
    }
    println!();
    if report.partial_dates.is_empty() {
        println!("No partial downloads found");
    } else {
        println!("Partial/empty dates ({}):", report.partial_dates.len());
        for day in &report.partial_dates {
            println!("  - {}: {}", day.date, day.status);
        }
        println!("\nRe-run 'fetch-trades' to resume interrupted downloads");
    }
    println!();
    if report.months_ready.is_empty() {
        println!("No months ready for consolidation");
    } else {
        println!("Months ready for consolidation ({}):", report.months_ready.len());
        for (year, month) in &report.months_ready {
            println!("  - {year}-{month:02}");
        }
        println!("\nUse 'consolidate-month' to create monthly parquet files");
    }
    Ok(())
}

pub fn consolidate_month(config: &ConfigService, args: &ConsolidateArgs) -> Result<()> {
    let service = build_service(config)?;
    let VenueArgs {
        venue,
        market,
        source,
    } = &args.venue;
    let report = service.check_partial_downloads(venue, market, source)?;

    if report.months_ready.is_empty() {
        println!("No months found with daily data for {venue}");
        println!("Run 'fetch-trades' first to download data");
        return Ok(());
    }

    println!(
        "\nFound {} month(s) ready for consolidation:\n",
        report.months_ready.len()
    );
    for (year, month) in &report.months_ready {
        println!("  - {year}-{month:02}");
    }

    if !args.all_months && !confirm("\nConsolidate these months? [Y/n] ")? {
        println!("Cancelled");
        return Ok(());
    }

    let mut succeeded = 0;
    let mut failed = 0;
    for (year, month) in &report.months_ready {
        println!("\nConsolidating {venue} {year}-{month:02}...");
        match service.consolidate_to_monthly(venue, *year, *month, market, source) {
            Ok(()) => {
                println!("   done");
                succeeded += 1;
            }
            Err(err) => {
                eprintln!("   failed: {err}");
                failed += 1;
            }
        }
    }
    println!("\nConsolidation complete: {succeeded} succeeded, {failed} failed");
    if succeeded > 0 {
        println!("Monthly files: data/{market}/{source}/trades_monthly/venue={venue}/...");
        println!("Daily files preserved in: data/{market}/{source}/trades/venue={venue}/...");
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush().context("failed to flush stdout")?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    let answer = answer.trim().to_lowercase();
    Ok(answer.is_empty() || answer == "y" || answer == "yes")
}
