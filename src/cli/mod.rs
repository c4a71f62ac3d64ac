//! Command-line surface.
//!
//! Exit codes: 0 success, 1 user-surfaced failure (insufficient disk, lock
//! held, validation), 130 external interruption.

mod migrate;
mod ohlcv;
mod trades;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ConfigService;

#[derive(Debug, Parser)]
#[command(
    name = "parqed",
    about = "Market-data ingestion and Parquet archival engine",
    version
)]
pub struct Cli {
    /// Working directory (holds data/, tickers.json, intervals.json, ...)
    #[arg(long, global = true, default_value = ".")]
    pub wrk_dir: PathBuf,

    /// Log level (error|warn|info|debug|trace); RUST_LOG overrides
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch and store missing posttrade data for a venue
    FetchTrades(trades::FetchTradesArgs),
    /// Show API availability vs local storage for a venue
    CheckStatus(trades::VenueArgs),
    /// List available trade files for a venue/date
    ListFiles(trades::ListFilesArgs),
    /// Report partial/interrupted downloads and months ready to consolidate
    CheckPartial(trades::VenueArgs),
    /// Consolidate daily trade files into monthly parquet files
    ConsolidateMonth(trades::ConsolidateArgs),

    /// Seed the working directory: intervals, ticker universe
    Initialize(ohlcv::InitializeArgs),
    /// Update OHLCV data for every configured interval
    UpdateData(ohlcv::UpdateDataArgs),
    /// Add an interval to intervals.json
    AddInterval { interval: String },
    /// Remove an interval from intervals.json
    RemoveInterval { interval: String },
    /// Refresh the ticker universe from the exchange listings
    UpdateTickers,
    /// Re-probe globally not-found tickers with a minimal 1d request
    ConfirmNotFounds,
    /// Offline sweep reactivating tickers with recent data
    ReparseNotFounds,

    /// Legacy -> partitioned migration commands
    #[command(subcommand, name = "partition-migrate")]
    PartitionMigrate(migrate::MigrateCommand),
}

impl Command {
    /// Daemonized commands install their own signal handling; everything
    /// else is raced against Ctrl-C by `main`.
    pub fn is_daemon(&self) -> bool {
        match self {
            Command::FetchTrades(args) => args.daemon,
            Command::UpdateData(args) => args.daemon,
            _ => false,
        }
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = ConfigService::new(&cli.wrk_dir);
    match cli.command {
        Command::FetchTrades(args) => trades::fetch_trades(&config, args).await,
        Command::CheckStatus(args) => trades::check_status(&config, &args).await,
        Command::ListFiles(args) => trades::list_files(&config, &args).await,
        Command::CheckPartial(args) => trades::check_partial(&config, &args),
        Command::ConsolidateMonth(args) => trades::consolidate_month(&config, &args),

        Command::Initialize(args) => ohlcv::initialize(&config, &args).await,
        Command::UpdateData(args) => ohlcv::update_data(&config, args).await,
        Command::AddInterval { interval } => ohlcv::add_interval(&config, &interval),
        Command::RemoveInterval { interval } => ohlcv::remove_interval(&config, &interval),
        Command::UpdateTickers => ohlcv::update_tickers(&config).await,
        Command::ConfirmNotFounds => ohlcv::confirm_not_founds(&config).await,
        Command::ReparseNotFounds => ohlcv::reparse_not_founds(&config),

        Command::PartitionMigrate(command) => migrate::run(&config, command),
    }
}
