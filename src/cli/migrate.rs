//! partition-migrate subcommands: init, status, migrate, mark, verify.

use anyhow::{bail, ensure, Context, Result};
use clap::{Args, Subcommand};

use crate::config::ConfigService;
use crate::lock::RunLock;
use crate::migrate::{IntervalStatus, MigrationService};
use crate::storage::partitioned::Codec;
use crate::storage::WriteOptions;

/// Row-group sizing used by the `--fast` preset.
const FAST_ROW_GROUP_SIZE: usize = 65_536;

#[derive(Debug, Subcommand)]
pub enum MigrateCommand {
    /// Create the migration plan for a venue
    Init(InitArgs),
    /// Show plan progress
    Status,
    /// Migrate legacy ticker files into the partitioned layout
    Migrate(MigrateArgs),
    /// Manually override an interval's status
    Mark(MarkArgs),
    /// Re-verify completed intervals against the stored plan totals
    Verify,
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Venue identifier recorded in the plan
    #[arg(long, default_value = "XNAS")]
    pub venue: String,

    /// Market code for the partitioned tree
    #[arg(long, default_value = "us")]
    pub market: String,

    /// Source code for the partitioned tree
    #[arg(long, default_value = "yahoo")]
    pub source: String,

    /// Intervals to migrate (defaults to intervals.json)
    #[arg(long = "interval", num_args = 1..)]
    pub intervals: Vec<String>,

    /// Overwrite an existing plan
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    /// Venue to migrate (defaults to every venue with --all)
    pub venue: Option<String>,

    /// Single interval to migrate (defaults to all of the venue's)
    pub interval: Option<String>,

    /// Migrate every pending interval of every venue
    #[arg(long)]
    pub all: bool,

    /// Delete each legacy file after its verified migration
    #[arg(long)]
    pub delete_legacy: bool,

    /// Smoke-test cap; with this set no plan state is persisted
    #[arg(long)]
    pub max_tickers: Option<usize>,

    /// Skip fsync before the atomic rename
    #[arg(long)]
    pub no_fsync: bool,

    /// Throughput preset: --no-fsync plus a 65536-row row-group size
    #[arg(long)]
    pub fast: bool,
}

#[derive(Debug, Args)]
pub struct MarkArgs {
    pub venue: String,
    pub interval: String,
    /// pending | migrating | complete | error
    pub status: IntervalStatus,
}

impl clap::builder::ValueParserFactory for IntervalStatus {
    type Parser = clap::builder::ValueParser;

    fn value_parser() -> Self::Parser {
        clap::builder::ValueParser::new(|value: &str| value.parse::<IntervalStatus>())
    }
}

pub fn run(config: &ConfigService, command: MigrateCommand) -> Result<()> {
    match command {
        MigrateCommand::Init(args) => init(config, &args),
        MigrateCommand::Status => status(config),
        MigrateCommand::Migrate(args) => migrate(config, &args),
        MigrateCommand::Mark(args) => mark(config, &args),
        MigrateCommand::Verify => verify(config),
    }
}

fn init(config: &ConfigService, args: &InitArgs) -> Result<()> {
    let intervals = if args.intervals.is_empty() {
        config.load_intervals()
    } else {
        args.intervals.clone()
    };
    ensure!(
        !intervals.is_empty(),
        "no intervals given and intervals.json is empty"
    );

    let service = MigrationService::new(config.clone());
    let plan = service.initialize_plan(&args.venue, &args.market, &args.source, &intervals, args.force)?;
    println!(
        "Migration plan initialized for {} ({} interval(s)): {}",
        args.venue,
        intervals.len(),
        config.migration_plan_path().display()
    );
    for venue in &plan.venues {
        for (interval, state) in &venue.intervals {
            println!("  {}/{interval}: {}", venue.id, state.status);
        }
    }
    Ok(())
}

fn status(config: &ConfigService) -> Result<()> {
    let service = MigrationService::new(config.clone());
    let plan = service.load_plan()?;
    println!("Migration plan (generated {})", plan.generated_at);
    for venue in &plan.venues {
        println!("\nVenue {} ({}/{}):", venue.id, venue.market, venue.source);
        for (interval, state) in &venue.intervals {
            let verified = state
                .verification
                .verified_at
                .as_deref()
                .unwrap_or("unverified");
            println!(
                "  {interval}: {} jobs {}/{} rows legacy={} partition={} ({}, {verified})",
                state.status,
                state.jobs.completed,
                state.jobs.total,
                state.totals.legacy_rows.unwrap_or(0),
                state.totals.partition_rows.unwrap_or(0),
                state.verification.method,
            );
        }
    }
    Ok(())
}

fn write_options(args: &MigrateArgs) -> WriteOptions {
    WriteOptions {
        codec: Codec::Gzip,
        fsync: !(args.no_fsync || args.fast),
        row_group_size: args.fast.then_some(FAST_ROW_GROUP_SIZE),
    }
}

fn migrate(config: &ConfigService, args: &MigrateArgs) -> Result<()> {
    let service = MigrationService::new(config.clone()).with_write_options(write_options(args));
    let plan = service.load_plan()?;

    // Work list: (venue, interval) pairs still ahead of `complete`.
    let mut work: Vec<(String, String)> = Vec::new();
    if args.all {
        for venue in &plan.venues {
            for (interval, state) in &venue.intervals {
                if state.status != IntervalStatus::Complete {
                    work.push((venue.id.clone(), interval.clone()));
                }
            }
        }
    } else {
        let venue_id = args
            .venue
            .as_deref()
            .context("specify a venue or use --all")?;
        let venue = plan.get_venue(venue_id)?;
        match &args.interval {
            Some(interval) => {
                ensure!(
                    venue.intervals.contains_key(interval),
                    "interval {interval} not found for venue {venue_id}"
                );
                work.push((venue_id.to_string(), interval.clone()));
            }
            None => {
                for (interval, state) in &venue.intervals {
                    if state.status != IntervalStatus::Complete {
                        work.push((venue_id.to_string(), interval.clone()));
                    }
                }
            }
        }
    }
    if work.is_empty() {
        println!("Nothing to migrate; every interval is complete");
        return Ok(());
    }

    // One migration process per working directory.
    let lock = RunLock::new(config.base_path());
    if !lock.try_acquire()? {
        match lock.owner_info() {
            Some(owner) => bail!(
                "run lock is held by pid {} on {} (started {}); remove {} if stale",
                owner.pid,
                owner.host,
                owner.ts,
                config.base_path().join(crate::lock::LOCK_DIR_NAME).display()
            ),
            None => bail!("run lock is held by another process"),
        }
    }
    let result = migrate_locked(config, &service, args, &work);
    lock.release();
    result
}

fn migrate_locked(
    config: &ConfigService,
    service: &MigrationService,
    args: &MigrateArgs,
    work: &[(String, String)],
) -> Result<()> {
    let lock = RunLock::new(config.base_path());
    let recovered = lock.cleanup_tmp_files();
    if recovered > 0 {
        tracing::info!(recovered, "recovered orphaned temp partition files");
    }

    // Fail on disk space before any write.
    let mut venues: Vec<&String> = work.iter().map(|(venue, _)| venue).collect();
    venues.dedup();
    for venue_id in venues {
        let intervals: Vec<String> = work
            .iter()
            .filter(|(v, _)| v == venue_id)
            .map(|(_, i)| i.clone())
            .collect();
        let estimate = service.estimate_disk_requirements(venue_id, &intervals, args.delete_legacy)?;
        if !estimate.can_proceed {
            for limitation in &estimate.limitations {
                eprintln!("error: {limitation}");
            }
            bail!(
                "insufficient disk space on {} (required {} bytes, available {})",
                estimate.partition_root.display(),
                estimate.required_bytes,
                estimate.available_bytes
            );
        }
    }

    for (venue_id, interval) in work {
        println!("Migrating {venue_id}/{interval}...");
        let outcome =
            service.migrate_interval(venue_id, interval, args.delete_legacy, args.max_tickers)?;
        println!(
            "  {}/{} tickers, {} rows verified ({})",
            outcome.jobs_completed,
            outcome.jobs_total,
            outcome.partition_rows,
            if outcome.partial_run {
                "smoke run, nothing persisted"
            } else {
                "row_counts+checksum"
            }
        );
        if outcome.storage_activated {
            println!("  partitioned storage activated for this venue's market/source");
        }
    }
    Ok(())
}

fn mark(config: &ConfigService, args: &MarkArgs) -> Result<()> {
    let service = MigrationService::new(config.clone());
    service.mark_interval(&args.venue, &args.interval, args.status)?;
    println!("Marked {}/{} as {}", args.venue, args.interval, args.status);
    Ok(())
}

fn verify(config: &ConfigService) -> Result<()> {
    let service = MigrationService::new(config.clone());
    let reports = service.verify_plan()?;
    let mut failures = 0;
    for report in &reports {
        let actual = report
            .actual_partition_rows
            .map_or("-".to_string(), |rows| rows.to_string());
        println!(
            "{}/{}: {} plan_rows={:?} actual_rows={} {}",
            report.venue_id,
            report.interval,
            report.status,
            report.plan_partition_rows,
            actual,
            if report.ok { "ok" } else { "MISMATCH" }
        );
        if report.status == IntervalStatus::Complete && !report.ok {
            failures += 1;
        }
    }
    ensure!(failures == 0, "{failures} interval(s) failed verification");
    Ok(())
}
