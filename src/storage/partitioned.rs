//! Partition-aware parquet storage: one file per ticker-month for OHLCV,
//! one file per venue-day for trades, all written atomically
//! (same-directory temp file, optional fsync, rename).

use anyhow::{ensure, Context, Result};
use chrono::NaiveDate;
use polars::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::paths::PartitionPathBuilder;

use super::frame::{
    distinct_months, distinct_tickers, empty_price_frame, filter_month, merge_and_dedupe,
    normalize_price_frame, PRICE_COLUMNS,
};
use super::recovery::safe_read_parquet;
use super::StorageRequest;

/// A partition read never silently omits files: every failed partition is
/// named with its reason.
#[derive(Debug, Error)]
#[error("failed to read {count} partition file(s) for {ticker}:\n{summary}")]
pub struct PartitionReadError {
    pub ticker: String,
    pub count: usize,
    pub summary: String,
}

impl PartitionReadError {
    fn new(ticker: &str, failures: &[(PathBuf, String)]) -> Self {
        let summary = failures
            .iter()
            .map(|(path, reason)| format!("  - {}: {reason}", path.display()))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            ticker: ticker.to_string(),
            count: failures.len(),
            summary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Uncompressed,
}

impl Codec {
    fn to_parquet(self) -> ParquetCompression {
        match self {
            Codec::Gzip => ParquetCompression::Gzip(None),
            Codec::Uncompressed => ParquetCompression::Uncompressed,
        }
    }
}

/// Write knobs shared by every parquet emit path. `fsync` and
/// `row_group_size` are throughput/durability trade-offs, not correctness
/// ones.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    pub codec: Codec,
    pub fsync: bool,
    pub row_group_size: Option<usize>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            codec: Codec::Gzip,
            fsync: true,
            row_group_size: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PartitionedStore {
    path_builder: PartitionPathBuilder,
    options: WriteOptions,
}

impl PartitionedStore {
    pub fn new(root: impl Into<PathBuf>, options: WriteOptions) -> Self {
        Self {
            path_builder: PartitionPathBuilder::new(root),
            options,
        }
    }

    pub fn path_builder(&self) -> &PartitionPathBuilder {
        &self.path_builder
    }

    /// Merge, dedup, and persist a single ticker's frame, one file per
    /// month. Returns the combined frame.
    pub fn save(
        &self,
        request: &StorageRequest,
        new_data: DataFrame,
        existing_data: DataFrame,
    ) -> Result<DataFrame> {
        validate_partition_metadata(request)?;

        if new_data.height() == 0 && existing_data.height() == 0 {
            return Ok(empty_price_frame());
        }
        if new_data.height() == 0 {
            tracing::debug!("new data empty, nothing to do");
            return Ok(existing_data);
        }

        let combined = merge_and_dedupe(vec![existing_data, new_data])?;
        assert_single_ticker(&combined, request)?;
        self.write_partitions(request, &combined)?;
        Ok(combined)
    }

    /// Read every `data.parquet` under the ticker root and merge. Hard
    /// failures on individual partitions surface as one
    /// [`PartitionReadError`].
    pub fn read(&self, request: &StorageRequest) -> Result<DataFrame> {
        validate_partition_metadata(request)?;
        let ticker_root = self.path_builder.ticker_root(
            request.market.as_deref(),
            request.source.as_deref(),
            &request.dataset,
            &request.interval,
            &request.ticker,
        )?;
        if !ticker_root.exists() {
            return Ok(empty_price_frame());
        }

        let mut partition_files = Vec::new();
        collect_named_files(&ticker_root, "data.parquet", &mut partition_files)?;
        partition_files.sort();
        if partition_files.is_empty() {
            return Ok(empty_price_frame());
        }

        let mut frames = Vec::new();
        let mut failures: Vec<(PathBuf, String)> = Vec::new();
        for path in partition_files {
            match safe_read_parquet(&path, PRICE_COLUMNS, normalize_price_frame) {
                Ok(df) => frames.push(df),
                Err(err) => {
                    tracing::error!(path = %path.display(), %err, "failed to read partition");
                    failures.push((path, err.to_string()));
                }
            }
        }
        if !failures.is_empty() {
            return Err(PartitionReadError::new(&request.ticker, &failures).into());
        }
        merge_and_dedupe(frames)
    }

    /// Append a batch of trades to the venue-day file. Merges after any
    /// existing rows; deduplication across batches is intentionally not
    /// performed here (callers do not re-submit stored minutes).
    pub fn save_trade_batch(
        &self,
        trades: &DataFrame,
        venue: &str,
        trade_date: NaiveDate,
        market: &str,
        source: &str,
    ) -> Result<()> {
        if trades.height() == 0 {
            tracing::warn!(venue, %trade_date, "no trades to store");
            return Ok(());
        }
        let out_path = self
            .path_builder
            .trades_day_path(market, source, venue, trade_date);

        let mut merged = trades.clone();
        if out_path.exists() {
            match read_parquet_file(&out_path) {
                Ok(existing) => {
                    merged = concat(
                        [existing.lazy(), trades.clone().lazy()],
                        UnionArgs {
                            rechunk: true,
                            to_supertypes: true,
                            diagonal: true,
                            ..Default::default()
                        },
                    )?
                    .collect()?;
                }
                Err(err) => {
                    tracing::warn!(path = %out_path.display(), %err, "failed to read existing file for merge, overwriting");
                }
            }
        }

        write_parquet_atomic(&out_path, &mut merged, self.options)?;
        tracing::info!(path = %out_path.display(), rows = merged.height(), "saved trades");
        Ok(())
    }

    fn write_partitions(&self, request: &StorageRequest, frame: &DataFrame) -> Result<()> {
        for (year, month) in distinct_months(frame)? {
            let mut partition = filter_month(frame, year, month)?;
            let month_start = NaiveDate::from_ymd_opt(year, month, 1)
                .with_context(|| format!("invalid partition month {year}-{month}"))?;
            let path = self.path_builder.build(
                request.market.as_deref(),
                request.source.as_deref(),
                &request.dataset,
                &request.interval,
                &request.ticker,
                month_start,
            )?;
            write_parquet_atomic(&path, &mut partition, self.options).with_context(|| {
                format!(
                    "failed to write partition file for {} month {year}-{month:02}",
                    request.ticker
                )
            })?;
        }
        Ok(())
    }
}

fn validate_partition_metadata(request: &StorageRequest) -> Result<()> {
    ensure!(
        request.market.as_deref().is_some_and(|m| !m.trim().is_empty())
            && request.source.as_deref().is_some_and(|s| !s.trim().is_empty()),
        "partitioned storage requires market and source metadata"
    );
    ensure!(
        !request.dataset.trim().is_empty(),
        "partitioned storage requires dataset metadata"
    );
    ensure!(
        !request.interval.trim().is_empty(),
        "partitioned storage requires interval metadata"
    );
    ensure!(
        !request.ticker.trim().is_empty(),
        "partitioned storage requires ticker metadata"
    );
    Ok(())
}

fn assert_single_ticker(frame: &DataFrame, request: &StorageRequest) -> Result<()> {
    let tickers = distinct_tickers(frame)?;
    ensure!(!tickers.is_empty(), "no ticker data present for partitioned save");
    ensure!(
        tickers == [request.ticker.clone()],
        "partitioned storage only supports single-ticker writes (got {tickers:?}, expected {})",
        request.ticker
    );
    Ok(())
}

pub fn read_parquet_file(path: &Path) -> Result<DataFrame> {
    let file =
        std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    ParquetReader::new(file)
        .finish()
        .with_context(|| format!("failed to read {}", path.display()))
}

/// Atomic write protocol: same-directory temp file, optional fsync, rename.
/// The temp name embeds pid/millis/uuid so concurrent writers never collide
/// and orphan recovery can identify half-finished writes.
pub fn write_parquet_atomic(path: &Path, df: &mut DataFrame, options: WriteOptions) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path {} has no parent", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("path {} has no file name", path.display()))?;

    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    let temp_name = format!(
        "{file_name}.tmp-{}-{}-{}",
        std::process::id(),
        millis,
        uuid::Uuid::new_v4().simple()
    );
    let temp_path = parent.join(temp_name);

    let mut write = || -> Result<()> {
        let file = std::fs::File::create(&temp_path)
            .with_context(|| format!("failed to create temp file {}", temp_path.display()))?;
        let mut writer = ParquetWriter::new(file).with_compression(options.codec.to_parquet());
        if let Some(row_group_size) = options.row_group_size {
            writer = writer.with_row_group_size(Some(row_group_size));
        }
        writer
            .finish(df)
            .with_context(|| format!("failed to write {}", temp_path.display()))?;

        if options.fsync {
            // Reopen to flush file contents before the rename makes them
            // visible; if fsync fails we still proceed to the rename.
            match std::fs::File::open(&temp_path) {
                Ok(file) => {
                    if let Err(err) = file.sync_all() {
                        tracing::debug!(path = %temp_path.display(), %err, "fsync failed");
                    }
                }
                Err(err) => {
                    tracing::debug!(path = %temp_path.display(), %err, "fsync reopen failed");
                }
            }
        }

        std::fs::rename(&temp_path, path).with_context(|| {
            format!(
                "failed to rename {} -> {}",
                temp_path.display(),
                path.display()
            )
        })
    };

    if let Err(err) = write() {
        if let Err(remove_err) = std::fs::remove_file(&temp_path) {
            if remove_err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %temp_path.display(), %remove_err, "failed to remove temp file");
            }
        }
        return Err(err);
    }
    Ok(())
}

/// Recursively collect files with the given name under `dir`.
pub fn collect_named_files(dir: &Path, name: &str, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_named_files(&path, name, out)?;
        } else if path.file_name().and_then(|n| n.to_str()) == Some(name) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use tempfile::TempDir;

    fn dt(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn bar_frame(rows: &[(&str, NaiveDateTime, f64)]) -> DataFrame {
        let stocks: Vec<&str> = rows.iter().map(|r| r.0).collect();
        let dates: Vec<NaiveDateTime> = rows.iter().map(|r| r.1).collect();
        let closes: Vec<f64> = rows.iter().map(|r| r.2).collect();
        df! {
            "stock" => &stocks,
            "date" => &dates,
            "open" => &closes,
            "high" => &closes,
            "low" => &closes,
            "close" => &closes,
            "volume" => &vec![Some(10i64); rows.len()],
            "sequence" => &vec![None::<i64>; rows.len()],
        }
        .unwrap()
    }

    fn store(dir: &TempDir) -> PartitionedStore {
        PartitionedStore::new(dir.path().join("data"), WriteOptions::default())
    }

    fn request(root: &Path) -> StorageRequest {
        StorageRequest::partitioned(root, "us", "yahoo", "stocks", "1d", "AAA")
    }

    #[test]
    fn save_splits_months_into_separate_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let req = request(&dir.path().join("data"));

        let frame = bar_frame(&[
            ("AAA", dt(2024, 3, 1), 1.0),
            ("AAA", dt(2024, 4, 1), 2.0),
        ]);
        let combined = store.save(&req, frame, empty_price_frame()).unwrap();
        assert_eq!(combined.height(), 2);

        let march = dir
            .path()
            .join("data/us/yahoo/stocks_1d/ticker=AAA/year=2024/month=03/data.parquet");
        let april = dir
            .path()
            .join("data/us/yahoo/stocks_1d/ticker=AAA/year=2024/month=04/data.parquet");
        assert!(march.is_file());
        assert!(april.is_file());

        // No temp files left behind.
        let mut leftovers = Vec::new();
        collect_named_files(&dir.path().join("data"), "data.parquet", &mut leftovers).unwrap();
        assert_eq!(leftovers.len(), 2);
    }

    #[test]
    fn read_merges_all_partitions() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let req = request(&dir.path().join("data"));

        store
            .save(
                &req,
                bar_frame(&[("AAA", dt(2024, 3, 1), 1.0), ("AAA", dt(2024, 4, 1), 2.0)]),
                empty_price_frame(),
            )
            .unwrap();

        let read = store.read(&req).unwrap();
        assert_eq!(read.height(), 2);
    }

    #[test]
    fn save_is_idempotent_against_read_back() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let req = request(&dir.path().join("data"));

        let frame = bar_frame(&[("AAA", dt(2024, 3, 1), 1.0), ("AAA", dt(2024, 3, 2), 2.0)]);
        store.save(&req, frame.clone(), empty_price_frame()).unwrap();
        let existing = store.read(&req).unwrap();
        let combined = store.save(&req, frame, existing).unwrap();
        assert_eq!(combined.height(), 2);
        assert_eq!(store.read(&req).unwrap().height(), 2);
    }

    #[test]
    fn save_rejects_foreign_tickers() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let req = request(&dir.path().join("data"));

        let frame = bar_frame(&[("AAA", dt(2024, 3, 1), 1.0), ("BBB", dt(2024, 3, 1), 2.0)]);
        assert!(store.save(&req, frame, empty_price_frame()).is_err());
    }

    #[test]
    fn save_requires_partition_metadata() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let req = StorageRequest::legacy(dir.path(), "1d", "AAA");
        let frame = bar_frame(&[("AAA", dt(2024, 3, 1), 1.0)]);
        assert!(store.save(&req, frame, empty_price_frame()).is_err());
    }

    #[test]
    fn failed_partition_read_names_every_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let req = request(&dir.path().join("data"));
        store
            .save(
                &req,
                bar_frame(&[("AAA", dt(2024, 3, 1), 1.0)]),
                empty_price_frame(),
            )
            .unwrap();

        // Break the partition with a schema-mismatched (but readable) file.
        let path = dir
            .path()
            .join("data/us/yahoo/stocks_1d/ticker=AAA/year=2024/month=03/data.parquet");
        let mut junk = df! { "unrelated" => &[1i64] }.unwrap();
        let file = std::fs::File::create(&path).unwrap();
        ParquetWriter::new(file).finish(&mut junk).unwrap();

        let err = store.read(&req).unwrap_err();
        let err = err.downcast_ref::<PartitionReadError>().unwrap();
        assert_eq!(err.count, 1);
        assert!(err.summary.contains("data.parquet"));
        // Preserve-and-fail: the offending file is still there.
        assert!(path.exists());
    }

    #[test]
    fn trade_batches_accrete_without_dedup() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let date = NaiveDate::from_ymd_opt(2025, 11, 4).unwrap();

        let batch = df! {
            "isin" => &["DE0007100000"],
            "price" => &[56.2],
            "volume" => &[100.0],
            "trade_time" => &[dt(2025, 11, 4)],
        }
        .unwrap();

        store
            .save_trade_batch(&batch, "DETR", date, "de", "xetra")
            .unwrap();
        store
            .save_trade_batch(&batch, "DETR", date, "de", "xetra")
            .unwrap();

        let path = dir
            .path()
            .join("data/de/xetra/trades/venue=DETR/year=2025/month=11/day=04/trades.parquet");
        let merged = read_parquet_file(&path).unwrap();
        assert_eq!(merged.height(), 2);
    }
}
