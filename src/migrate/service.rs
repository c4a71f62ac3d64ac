//! Legacy -> partitioned migration coordinator.
//!
//! Drives per-interval, per-ticker copies from the legacy layout into the
//! partitioned tree, verifying each ticker by row count and checksum, and
//! persisting the plan after every unit of work so an interrupted run
//! resumes from a faithful lower bound.

use anyhow::{bail, ensure, Context, Result};
use chrono::Utc;
use polars::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::ConfigService;
use crate::ohlcv::registry::{load_ticker_map, save_ticker_map, StorageInfo};
use crate::storage::frame::PRICE_COLUMNS;
use crate::storage::partitioned::collect_named_files;
use crate::storage::{LegacyStore, PartitionedStore, StorageRequest, WriteOptions};

use super::plan::{
    IntervalStatus, MigrationInterval, MigrationPlan, MigrationVenue, PLAN_SCHEMA_VERSION,
};

pub const DATASET_NAME: &str = "stocks";
/// Partitioned output is estimated at legacy size plus 5% layout overhead.
const PARTITION_OVERHEAD_RATIO: f64 = 0.05;

type NowFn = Arc<dyn Fn() -> String + Send + Sync>;

fn default_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub jobs_total: u64,
    pub jobs_completed: u64,
    pub legacy_rows: u64,
    pub partition_rows: u64,
    pub checksums: BTreeMap<String, String>,
    pub tickers: Vec<String>,
    pub storage_activated: bool,
    pub persisted: bool,
    pub partial_run: bool,
}

#[derive(Debug, Clone)]
pub struct DiskEstimate {
    pub per_interval_legacy_bytes: BTreeMap<String, u64>,
    pub total_legacy_bytes: u64,
    pub overhead_bytes: u64,
    pub required_bytes: u64,
    pub available_bytes: u64,
    pub partition_root: PathBuf,
    pub delete_legacy: bool,
    pub projected_free_after: i128,
    pub can_proceed: bool,
    pub limitations: Vec<String>,
    pub suggest_delete_legacy: bool,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub venue_id: String,
    pub interval: String,
    pub status: IntervalStatus,
    pub plan_partition_rows: Option<u64>,
    pub actual_partition_rows: Option<u64>,
    pub ok: bool,
}

pub struct MigrationService {
    config: ConfigService,
    created_by: String,
    write_options: WriteOptions,
    now: NowFn,
}

impl MigrationService {
    pub fn new(config: ConfigService) -> Self {
        Self {
            config,
            created_by: "parqed-cli".to_string(),
            write_options: WriteOptions::default(),
            now: Arc::new(default_now),
        }
    }

    pub fn with_write_options(mut self, options: WriteOptions) -> Self {
        self.write_options = options;
        self
    }

    pub fn with_now(mut self, now: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.now = Arc::new(now);
        self
    }

    fn now(&self) -> String {
        (self.now)()
    }

    pub fn load_plan(&self) -> Result<MigrationPlan> {
        let path = self.config.migration_plan_path();
        if !path.is_file() {
            bail!(
                "migration plan not found at {}. Run partition-migrate init to create it.",
                path.display()
            );
        }
        MigrationPlan::from_file(&path)
    }

    fn partition_backend(&self) -> PartitionedStore {
        PartitionedStore::new(self.config.data_root(), self.write_options)
    }

    // -- plan lifecycle ------------------------------------------------------

    pub fn initialize_plan(
        &self,
        venue_id: &str,
        market: &str,
        source: &str,
        intervals: &[String],
        overwrite: bool,
    ) -> Result<MigrationPlan> {
        let plan_path = self.config.migration_plan_path();
        if plan_path.exists() && !overwrite {
            bail!(
                "migration plan already exists at {}. Use --force to overwrite.",
                plan_path.display()
            );
        }
        ensure!(!intervals.is_empty(), "at least one interval is required");

        let legacy_root_relative = PathBuf::from("data/legacy");
        let legacy_root_absolute = self.config.base_path().join(&legacy_root_relative);
        if !legacy_root_absolute.exists() {
            bail!(
                "legacy path does not exist: {}. Place legacy parquet files under data/legacy before initializing the migration plan.",
                legacy_root_absolute.display()
            );
        }

        let timestamp = self.now();
        let mut interval_entries = BTreeMap::new();
        for interval in intervals {
            interval_entries.insert(
                interval.clone(),
                MigrationInterval::new(
                    legacy_root_relative.join(format!("stocks_{interval}")),
                    PathBuf::from("data")
                        .join(market.to_lowercase())
                        .join(source.to_lowercase())
                        .join(format!("{DATASET_NAME}_{interval}")),
                ),
            );
        }

        let mut plan = MigrationPlan::new(
            timestamp.clone(),
            self.created_by.clone(),
            legacy_root_relative,
            vec![MigrationVenue {
                id: venue_id.to_string(),
                market: market.to_string(),
                source: source.to_string(),
                status: "pending".to_string(),
                last_updated: timestamp,
                intervals: interval_entries,
            }],
        );
        plan.write(Some(&plan_path))?;
        tracing::info!(plan = %plan_path.display(), "migration plan initialized");
        Ok(plan)
    }

    pub fn mark_interval(
        &self,
        venue_id: &str,
        interval: &str,
        status: IntervalStatus,
    ) -> Result<()> {
        let mut plan = self.load_plan()?;
        let when = self.now();
        plan.update_interval(venue_id, interval, &when, |state| {
            state.status = status;
        })?;
        plan.write(None)?;
        Ok(())
    }

    // -- migration -----------------------------------------------------------

    /// Migrate one interval's legacy ticker files into the partitioned
    /// layout.
    ///
    /// With `max_tickers` set the run is a smoke test: the copy and the
    /// verification happen, but no plan, storage-config, or registry state
    /// is persisted.
    pub fn migrate_interval(
        &self,
        venue_id: &str,
        interval: &str,
        delete_legacy: bool,
        max_tickers: Option<usize>,
    ) -> Result<MigrationOutcome> {
        let mut plan = self.load_plan()?;
        let base_path = self.config.base_path().to_path_buf();
        let venue = plan.get_venue(venue_id)?.clone();
        let interval_state = plan.get_interval(venue_id, interval)?.clone();
        let legacy_root = plan.resolve_legacy_root(&base_path);
        let legacy_path = interval_state.resolve_legacy_path(&base_path);
        let partition_root = interval_state.resolve_partition_path(&base_path);

        if !legacy_path.exists() {
            bail!("legacy path does not exist: {}", legacy_path.display());
        }
        let legacy_abs = std::path::absolute(&legacy_root)
            .with_context(|| format!("cannot resolve {}", legacy_root.display()))?;
        let partition_abs = std::path::absolute(&partition_root)
            .with_context(|| format!("cannot resolve {}", partition_root.display()))?;
        if partition_abs.starts_with(&legacy_abs) {
            bail!("partition path is inside legacy root; adjust migration plan before continuing");
        }

        let mut ticker_files: Vec<PathBuf> = std::fs::read_dir(&legacy_path)
            .with_context(|| format!("failed to list {}", legacy_path.display()))?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "parquet"))
            .collect();
        ticker_files.sort();

        let persisted = max_tickers.is_none();
        if let Some(cap) = max_tickers {
            ticker_files.truncate(cap);
        }
        let total_jobs = ticker_files.len() as u64;

        if persisted {
            let when = self.now();
            plan.update_interval(venue_id, interval, &when, |state| {
                state.status = IntervalStatus::Migrating;
                state.jobs.total = total_jobs;
                state.jobs.completed = 0;
                state.totals.legacy_rows = Some(0);
                state.totals.partition_rows = Some(0);
            })?;
            plan.write(None)?;
        }

        let legacy_backend = LegacyStore;
        let partition_backend = self.partition_backend();
        let data_root = self.config.data_root();

        let mut completed = 0u64;
        let mut total_legacy_rows = 0u64;
        let mut total_partition_rows = 0u64;
        let mut checksums = BTreeMap::new();
        let mut tickers = Vec::new();

        for ticker_file in &ticker_files {
            let ticker = ticker_file
                .file_stem()
                .and_then(|stem| stem.to_str())
                .with_context(|| format!("bad legacy file name {}", ticker_file.display()))?
                .to_string();
            tickers.push(ticker.clone());

            let legacy_request = StorageRequest::legacy(&legacy_root, interval, &ticker);
            let legacy_df = legacy_backend.read(&legacy_request)?;

            let partition_request = StorageRequest::partitioned(
                &data_root,
                &venue.market,
                &venue.source,
                DATASET_NAME,
                interval,
                &ticker,
            );
            let existing = partition_backend.read(&partition_request)?;
            let combined = if legacy_df.height() == 0 {
                tracing::warn!(%ticker, "legacy file yielded no rows");
                legacy_df.clone()
            } else {
                partition_backend.save(&partition_request, legacy_df.clone(), existing)?
            };

            let legacy_rows = legacy_df.height() as u64;
            let partition_rows = combined.height() as u64;
            if partition_rows != legacy_rows {
                bail!(
                    "row count mismatch for ticker {ticker}: legacy={legacy_rows}, partition={partition_rows}"
                );
            }
            let legacy_checksum = frame_checksum(&legacy_df)?;
            let partition_checksum = frame_checksum(&combined)?;
            if legacy_checksum != partition_checksum {
                bail!(
                    "checksum mismatch for ticker {ticker}: legacy={legacy_checksum}, partition={partition_checksum}"
                );
            }

            completed += 1;
            total_legacy_rows += legacy_rows;
            total_partition_rows += partition_rows;
            checksums.insert(ticker, partition_checksum);

            if delete_legacy && ticker_file.exists() {
                std::fs::remove_file(ticker_file)
                    .with_context(|| format!("failed to delete {}", ticker_file.display()))?;
                if let Some(parent) = ticker_file.parent() {
                    if std::fs::read_dir(parent).is_ok_and(|mut dir| dir.next().is_none()) {
                        let _ = std::fs::remove_dir(parent);
                    }
                }
            }

            if persisted {
                let when = self.now();
                plan.update_interval(venue_id, interval, &when, |state| {
                    state.jobs.completed = completed;
                    state.totals.legacy_rows = Some(total_legacy_rows);
                    state.totals.partition_rows = Some(total_partition_rows);
                })?;
                plan.write(None)?;
            }
        }

        let mut storage_activated = false;
        if persisted {
            let final_timestamp = self.now();
            plan.update_interval(venue_id, interval, &final_timestamp, |state| {
                state.status = IntervalStatus::Complete;
                state.jobs.completed = completed;
                state.totals.legacy_rows = Some(total_legacy_rows);
                state.totals.partition_rows = Some(total_partition_rows);
                state.verification.method = "row_counts+checksum".to_string();
                state.verification.verified_at = Some(final_timestamp.clone());
            })?;
            plan.write(None)?;

            let venue = plan.get_venue(venue_id)?.clone();
            if venue.all_intervals_verified() {
                self.config
                    .set_source_partition_mode(&venue.market, &venue.source, true)
                    .context("failed to finalize partitioned storage activation")?;
                storage_activated = true;
            }
            // Backfill registry storage metadata for the interval that just
            // completed so mixed-mode routing works before the venue is done.
            self.backfill_ticker_storage_metadata(&venue, &[interval.to_string()], &final_timestamp)
                .context("failed to backfill ticker metadata for migrated interval")?;
        }

        Ok(MigrationOutcome {
            jobs_total: total_jobs,
            jobs_completed: completed,
            legacy_rows: total_legacy_rows,
            partition_rows: total_partition_rows,
            checksums,
            tickers,
            storage_activated,
            persisted,
            partial_run: !persisted,
        })
    }

    // -- disk estimation -----------------------------------------------------

    pub fn estimate_disk_requirements(
        &self,
        venue_id: &str,
        intervals: &[String],
        delete_legacy: bool,
    ) -> Result<DiskEstimate> {
        let plan = self.load_plan()?;
        let base_path = self.config.base_path();

        let mut per_interval = BTreeMap::new();
        let mut total_legacy_bytes = 0u64;
        for interval in intervals {
            let state = plan.get_interval(venue_id, interval)?;
            let legacy_path = state.resolve_legacy_path(base_path);
            if !legacy_path.exists() {
                bail!("legacy path does not exist: {}", legacy_path.display());
            }
            let bytes = directory_size(&legacy_path)?;
            per_interval.insert(interval.clone(), bytes);
            total_legacy_bytes += bytes;
        }

        let partition_root = self.config.data_root();
        let usage_path = existing_ancestor(&partition_root)?;
        let available_bytes = fs2::available_space(&usage_path)
            .with_context(|| format!("unable to determine disk usage for {}", usage_path.display()))?;

        let overhead_bytes = (total_legacy_bytes as f64 * PARTITION_OVERHEAD_RATIO) as u64;
        let required_bytes = total_legacy_bytes + overhead_bytes;

        let mut limitations = Vec::new();
        let can_proceed = available_bytes >= required_bytes;
        if !can_proceed {
            limitations.push(format!(
                "partition root lacks {} additional bytes of free space",
                required_bytes - available_bytes
            ));
        }

        let potential_with_delete =
            available_bytes as i128 + if delete_legacy { 0 } else { total_legacy_bytes as i128 };
        let suggest_delete_legacy =
            !can_proceed && !delete_legacy && potential_with_delete >= required_bytes as i128;
        if suggest_delete_legacy {
            limitations.push(
                "re-run with --delete-legacy to reclaim space from legacy parquet files before continuing"
                    .to_string(),
            );
        }

        Ok(DiskEstimate {
            per_interval_legacy_bytes: per_interval,
            total_legacy_bytes,
            overhead_bytes,
            required_bytes,
            available_bytes,
            partition_root: usage_path,
            delete_legacy,
            projected_free_after: available_bytes as i128 - required_bytes as i128
                + if delete_legacy {
                    total_legacy_bytes as i128
                } else {
                    0
                },
            can_proceed,
            limitations,
            suggest_delete_legacy,
        })
    }

    // -- verification --------------------------------------------------------

    /// Offline re-verification: recount rows in each completed interval's
    /// partition tree and compare against the plan totals.
    pub fn verify_plan(&self) -> Result<Vec<VerifyReport>> {
        let plan = self.load_plan()?;
        let base_path = self.config.base_path();
        let mut reports = Vec::new();

        for venue in &plan.venues {
            for (interval, state) in &venue.intervals {
                if state.status != IntervalStatus::Complete {
                    reports.push(VerifyReport {
                        venue_id: venue.id.clone(),
                        interval: interval.clone(),
                        status: state.status,
                        plan_partition_rows: state.totals.partition_rows,
                        actual_partition_rows: None,
                        ok: false,
                    });
                    continue;
                }
                let partition_path = state.resolve_partition_path(base_path);
                let actual = count_partition_rows(&partition_path)?;
                let ok = state.totals.partition_rows == Some(actual);
                reports.push(VerifyReport {
                    venue_id: venue.id.clone(),
                    interval: interval.clone(),
                    status: state.status,
                    plan_partition_rows: state.totals.partition_rows,
                    actual_partition_rows: Some(actual),
                    ok,
                });
            }
        }
        Ok(reports)
    }

    // -- registry backfill ---------------------------------------------------

    fn collect_partitioned_tickers(&self, venue: &MigrationVenue, interval: &str) -> Vec<String> {
        let interval_root = self
            .config
            .data_root()
            .join(venue.market.trim().to_lowercase())
            .join(venue.source.trim().to_lowercase())
            .join(format!("{DATASET_NAME}_{interval}"));
        let Ok(entries) = std::fs::read_dir(&interval_root) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix("ticker="))
                    .map(str::to_string)
            })
            .collect()
    }

    fn backfill_ticker_storage_metadata(
        &self,
        venue: &MigrationVenue,
        intervals: &[String],
        verified_at: &str,
    ) -> Result<()> {
        let tickers_path = self.config.tickers_path();
        let mut tickers = load_ticker_map(&tickers_path);
        if tickers.is_empty() {
            return Ok(());
        }

        let mut changed = false;
        for interval in intervals {
            for ticker in self.collect_partitioned_tickers(venue, interval) {
                let Some(entry) = tickers.get_mut(&ticker) else {
                    continue;
                };
                let state = entry.intervals.entry(interval.clone()).or_default();
                let storage = StorageInfo {
                    mode: "partitioned".to_string(),
                    market: venue.market.trim().to_lowercase(),
                    source: venue.source.trim().to_lowercase(),
                    dataset: DATASET_NAME.to_string(),
                    root: "data".to_string(),
                    venue: venue.id.clone(),
                    verified_at: verified_at.to_string(),
                };
                if state.storage.as_ref() != Some(&storage) {
                    state.storage = Some(storage);
                    changed = true;
                }
            }
        }
        if changed {
            save_ticker_map(&tickers_path, &tickers)?;
        }
        Ok(())
    }
}

/// Deterministic, row-order-independent digest of a price frame.
///
/// Rows sort by `(stock, date)`, then columns hash in canonical order: a
/// tag byte per value (0 null / 1 present) followed by length-prefixed
/// UTF-8 for strings, 8-byte LE for numerics, and LE microseconds for
/// datetimes.
pub fn frame_checksum(df: &DataFrame) -> Result<String> {
    if df.height() == 0 {
        return Ok("empty".to_string());
    }
    let sorted = df.sort(
        ["stock", "date"],
        SortMultipleOptions::default().with_maintain_order(true),
    )?;

    let mut hasher = Sha256::new();
    for name in PRICE_COLUMNS {
        let column = sorted.column(name)?;
        match column.dtype() {
            DataType::String => {
                for value in column.str()? {
                    match value {
                        Some(text) => {
                            hasher.update([1u8]);
                            hasher.update((text.len() as u32).to_le_bytes());
                            hasher.update(text.as_bytes());
                        }
                        None => hasher.update([0u8]),
                    }
                }
            }
            DataType::Float64 => {
                for value in column.f64()? {
                    match value {
                        Some(v) => {
                            hasher.update([1u8]);
                            hasher.update(v.to_le_bytes());
                        }
                        None => hasher.update([0u8]),
                    }
                }
            }
            DataType::Int64 => {
                for value in column.i64()? {
                    match value {
                        Some(v) => {
                            hasher.update([1u8]);
                            hasher.update(v.to_le_bytes());
                        }
                        None => hasher.update([0u8]),
                    }
                }
            }
            DataType::Datetime(_, _) => {
                for value in column.datetime()?.as_datetime_iter() {
                    match value {
                        Some(dt) => {
                            hasher.update([1u8]);
                            hasher.update(dt.and_utc().timestamp_micros().to_le_bytes());
                        }
                        None => hasher.update([0u8]),
                    }
                }
            }
            other => bail!("unsupported checksum dtype {other:?} for column {name}"),
        }
    }

    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}

fn directory_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path).with_context(|| format!("failed to list {}", path.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            total += directory_size(&path)?;
        } else {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

fn existing_ancestor(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut current = absolute.as_path();
    loop {
        if current.exists() {
            return Ok(current.to_path_buf());
        }
        current = current
            .parent()
            .with_context(|| format!("unable to determine disk usage for path {}", path.display()))?;
    }
}

fn count_partition_rows(partition_path: &Path) -> Result<u64> {
    if !partition_path.exists() {
        return Ok(0);
    }
    let mut files = Vec::new();
    collect_named_files(partition_path, "data.parquet", &mut files)?;
    let mut rows = 0u64;
    for file in files {
        let df = crate::storage::partitioned::read_parquet_file(&file)?;
        rows += df.height() as u64;
    }
    Ok(rows)
}

/// Sanity gate used by the CLI before touching anything.
pub fn ensure_supported_schema(plan: &MigrationPlan) -> Result<()> {
    ensure!(
        plan.schema_version == PLAN_SCHEMA_VERSION,
        "unsupported migration plan schema_version {}",
        plan.schema_version
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::frame::empty_price_frame;
    use chrono::NaiveDate;

    fn frame(rows: &[(&str, u32, f64)]) -> DataFrame {
        let stocks: Vec<&str> = rows.iter().map(|r| r.0).collect();
        let dates: Vec<chrono::NaiveDateTime> = rows
            .iter()
            .map(|r| {
                NaiveDate::from_ymd_opt(2024, 3, r.1)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
            })
            .collect();
        let closes: Vec<f64> = rows.iter().map(|r| r.2).collect();
        crate::storage::frame::normalize_price_frame(
            df! {
                "stock" => &stocks,
                "date" => &dates,
                "open" => &closes,
                "high" => &closes,
                "low" => &closes,
                "close" => &closes,
            }
            .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn checksum_is_row_order_independent() {
        let a = frame(&[("AAA", 1, 1.0), ("AAA", 2, 2.0)]);
        let b = frame(&[("AAA", 2, 2.0), ("AAA", 1, 1.0)]);
        assert_eq!(frame_checksum(&a).unwrap(), frame_checksum(&b).unwrap());
    }

    #[test]
    fn checksum_detects_value_changes() {
        let a = frame(&[("AAA", 1, 1.0)]);
        let b = frame(&[("AAA", 1, 1.5)]);
        assert_ne!(frame_checksum(&a).unwrap(), frame_checksum(&b).unwrap());
    }

    #[test]
    fn empty_frame_hashes_to_sentinel() {
        assert_eq!(frame_checksum(&empty_price_frame()).unwrap(), "empty");
    }

    #[test]
    fn existing_ancestor_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a/b/c");
        let found = existing_ancestor(&deep).unwrap();
        assert_eq!(found, std::path::absolute(dir.path()).unwrap());
    }
}
