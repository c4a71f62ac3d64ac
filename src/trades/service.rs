//! Orchestration for posttrade ingestion: missing-date discovery,
//! interrupt-safe incremental fetch-and-store, and monthly consolidation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, Days, NaiveDate, Utc};
use polars::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::DATE_FMT;
use crate::storage::partitioned::{
    collect_named_files, read_parquet_file, write_parquet_atomic, Codec, WriteOptions,
};
use crate::storage::{has_any_trade_data, PartitionedStore};

use super::fetcher::{filename_date, filename_timestamp_part, PosttradeFetcher};
use super::parser::TradeParser;

/// Row-group sizing for consolidated monthly files.
const MONTHLY_ROW_GROUP_SIZE: usize = 100_000;

/// Source of listable, parseable trade files. The HTTP implementation wraps
/// the fetcher+parser pair; tests substitute an in-memory feed.
#[async_trait]
pub trait TradeFeed: Send + Sync {
    async fn list_available_files(&self, venue: &str) -> Result<Vec<String>>;
    async fn fetch_and_parse(&self, venue: &str, date: &str, filename: &str) -> Result<DataFrame>;
}

#[async_trait]
impl<T: TradeFeed + ?Sized> TradeFeed for Arc<T> {
    async fn list_available_files(&self, venue: &str) -> Result<Vec<String>> {
        (**self).list_available_files(venue).await
    }

    async fn fetch_and_parse(&self, venue: &str, date: &str, filename: &str) -> Result<DataFrame> {
        (**self).fetch_and_parse(venue, date, filename).await
    }
}

pub struct HttpTradeFeed {
    fetcher: PosttradeFetcher,
    parser: TradeParser,
}

impl HttpTradeFeed {
    pub fn new(fetcher: PosttradeFetcher) -> Self {
        Self {
            fetcher,
            parser: TradeParser,
        }
    }
}

#[async_trait]
impl TradeFeed for HttpTradeFeed {
    async fn list_available_files(&self, venue: &str) -> Result<Vec<String>> {
        self.fetcher.list_available_files(venue).await
    }

    async fn fetch_and_parse(&self, venue: &str, date: &str, filename: &str) -> Result<DataFrame> {
        tracing::info!(venue, date, filename, "fetching");
        let compressed = self.fetcher.download_file(venue, date, filename).await?;
        let jsonl = self.fetcher.decompress_gzip(&compressed)?;
        let df = self.parser.parse(&jsonl)?;
        tracing::info!(filename, rows = df.height(), "parsed trades");
        Ok(df)
    }
}

#[derive(Debug, Default, Clone)]
pub struct FetchSummary {
    pub dates_checked: Vec<NaiveDate>,
    pub dates_fetched: Vec<NaiveDate>,
    pub dates_partial: Vec<NaiveDate>,
    pub total_trades: usize,
    pub total_files: usize,
    pub consolidated: bool,
}

#[derive(Debug, Clone)]
pub struct PartialDay {
    pub date: String,
    pub status: String,
}

#[derive(Debug, Default, Clone)]
pub struct PartialReport {
    pub complete_dates: Vec<String>,
    pub partial_dates: Vec<PartialDay>,
    pub months_ready: Vec<(i32, u32)>,
}

type TodayFn = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

pub struct PosttradeService<F: TradeFeed> {
    feed: F,
    store: PartitionedStore,
    today: TodayFn,
}

impl<F: TradeFeed> PosttradeService<F> {
    pub fn new(feed: F, data_root: impl Into<PathBuf>, options: WriteOptions) -> Self {
        Self {
            feed,
            store: PartitionedStore::new(data_root, options),
            today: Arc::new(|| Utc::now().date_naive()),
        }
    }

    /// Replace the date source; tests pin "today" with this.
    pub fn with_today(mut self, today: impl Fn() -> NaiveDate + Send + Sync + 'static) -> Self {
        self.today = Arc::new(today);
        self
    }

    pub fn store(&self) -> &PartitionedStore {
        &self.store
    }

    /// Files from the rolling window whose embedded date matches `date`.
    pub async fn list_files(&self, venue: &str, date: NaiveDate) -> Result<Vec<String>> {
        let all = self.feed.list_available_files(venue).await?;
        Ok(files_for_date(&all, date))
    }

    /// Dates that are API-available (today/yesterday) but not yet stored.
    pub async fn get_missing_dates(
        &self,
        venue: &str,
        market: &str,
        source: &str,
    ) -> Result<Vec<NaiveDate>> {
        let today = (self.today)();
        let yesterday = today - Days::new(1);

        let mut available = Vec::new();
        for check_date in [today, yesterday] {
            match self.list_files(venue, check_date).await {
                Ok(files) if !files.is_empty() => {
                    tracing::debug!(venue, date = %check_date, files = files.len(), "API has files");
                    available.push(check_date);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(venue, date = %check_date, %err, "could not check date");
                }
            }
        }
        if available.is_empty() {
            tracing::info!(venue, "no dates available from API");
            return Ok(Vec::new());
        }

        let mut missing = Vec::new();
        for date in available {
            let path = self
                .store
                .path_builder()
                .trades_day_path(market, source, venue, date);
            if !path.exists() {
                tracing::info!(venue, %date, "missing, not stored locally");
                missing.push(date);
                continue;
            }
            // A stored day still counts as missing while any listed minute
            // is absent from it; the incremental loop resumes from there.
            let minutes = stored_minutes(&path);
            let files = self.list_files(venue, date).await?;
            let incomplete = files.iter().any(|f| {
                filename_timestamp_part(f).is_none_or(|ts| !minutes.contains(&ts))
            });
            if incomplete {
                tracing::info!(venue, %date, "partially stored, will resume");
                missing.push(date);
            } else {
                tracing::debug!(venue, %date, "already stored");
            }
        }
        Ok(missing)
    }

    /// Fetch and store everything missing, one file at a time.
    ///
    /// Each downloaded file is merged into the venue-day parquet before the
    /// next download starts, so an interruption loses at most the in-flight
    /// file and a re-run naturally skips already-stored minutes.
    pub async fn fetch_and_store_missing_incremental(
        &self,
        venue: &str,
        market: &str,
        source: &str,
        consolidate: bool,
    ) -> Result<FetchSummary> {
        tracing::info!(venue, "checking for missing trades (incremental mode)");
        let missing_dates = self.get_missing_dates(venue, market, source).await?;
        let mut summary = FetchSummary {
            dates_checked: missing_dates.clone(),
            ..FetchSummary::default()
        };
        if missing_dates.is_empty() {
            tracing::info!(venue, "all available data already stored");
            return Ok(summary);
        }
        tracing::info!(venue, dates = ?missing_dates, "found missing dates");

        for date in missing_dates {
            match self
                .fetch_one_date(venue, market, source, date, &mut summary)
                .await
            {
                Ok(()) => {}
                Err(err) => {
                    tracing::error!(venue, %date, %err, "failed to fetch date");
                }
            }
            if consolidate && summary.dates_fetched.last() == Some(&date) {
                tracing::info!(venue, year = date.year(), month = date.month(), "consolidating month");
                if let Err(err) =
                    self.consolidate_to_monthly(venue, date.year(), date.month(), market, source)
                {
                    // Daily storage is intact either way.
                    tracing::error!(%err, "failed to consolidate month");
                } else {
                    summary.consolidated = true;
                }
            }
        }

        tracing::info!(
            venue,
            complete = summary.dates_fetched.len(),
            trades = summary.total_trades,
            files = summary.total_files,
            "fetch summary"
        );
        if !summary.dates_partial.is_empty() {
            tracing::warn!(venue, partial = ?summary.dates_partial, "partial dates, re-run to resume");
        }
        Ok(summary)
    }

    async fn fetch_one_date(
        &self,
        venue: &str,
        market: &str,
        source: &str,
        date: NaiveDate,
        summary: &mut FetchSummary,
    ) -> Result<()> {
        let files = self.list_files(venue, date).await?;
        if files.is_empty() {
            tracing::warn!(venue, %date, "no trade files found");
            return Ok(());
        }

        let day_path = self
            .store
            .path_builder()
            .trades_day_path(market, source, venue, date);
        let existing_minutes = if day_path.exists() {
            stored_minutes(&day_path)
        } else {
            HashSet::new()
        };
        if !existing_minutes.is_empty() {
            tracing::info!(%date, minutes = existing_minutes.len(), "minute timestamps already stored");
        }

        let files_to_fetch: Vec<&String> = files
            .iter()
            .filter(|f| {
                // Unparseable names are fetched to be safe.
                filename_timestamp_part(f).is_none_or(|ts| !existing_minutes.contains(&ts))
            })
            .collect();
        if files_to_fetch.is_empty() {
            tracing::info!(%date, files = files.len(), "all files already stored, skipping");
            return Ok(());
        }
        tracing::info!(
            %date,
            to_fetch = files_to_fetch.len(),
            available = files.len(),
            "fetching remaining files"
        );

        let date_str = date.format(DATE_FMT).to_string();
        let mut fetched = 0usize;
        let mut failures = 0usize;
        let mut date_trades = 0usize;
        let total = files_to_fetch.len();

        for (i, filename) in files_to_fetch.iter().enumerate() {
            match self.feed.fetch_and_parse(venue, &date_str, filename).await {
                Ok(df) => {
                    if df.height() > 0 {
                        if let Err(err) =
                            self.store.save_trade_batch(&df, venue, date, market, source)
                        {
                            tracing::error!(%filename, %err, "failed to store file");
                            failures += 1;
                            continue;
                        }
                        date_trades += df.height();
                        summary.total_trades += df.height();
                        summary.total_files += 1;
                    }
                    fetched += 1;
                    if (i + 1) % 50 == 0 || i + 1 == total {
                        tracing::info!(%date, progress = i + 1, total, trades = date_trades, "stored");
                    }
                }
                Err(err) => {
                    // Partial progress is already persisted; keep going.
                    tracing::error!(%filename, %err, "failed to process file");
                    failures += 1;
                }
            }
        }

        if failures == 0 {
            summary.dates_fetched.push(date);
            tracing::info!(venue, %date, trades = date_trades, files = fetched, "completed date");
        } else if fetched > 0 {
            summary.dates_partial.push(date);
            tracing::warn!(
                venue,
                %date,
                fetched,
                failures,
                "partial completion, can resume"
            );
        }
        Ok(())
    }

    /// Consolidate one month's daily files into a single sorted parquet.
    /// Daily files are kept; consolidation never deletes its sources.
    pub fn consolidate_to_monthly(
        &self,
        venue: &str,
        year: i32,
        month: u32,
        market: &str,
        source: &str,
    ) -> Result<()> {
        let daily_root = self
            .store
            .path_builder()
            .trades_month_root(market, source, venue, year, month);
        if !daily_root.exists() {
            tracing::warn!(venue, year, month, "no data found for month");
            return Ok(());
        }
        let mut daily_files = Vec::new();
        collect_named_files(&daily_root, "trades.parquet", &mut daily_files)?;
        daily_files.sort();
        if daily_files.is_empty() {
            tracing::warn!(venue, year, month, "no daily files found");
            return Ok(());
        }
        tracing::info!(venue, year, month, files = daily_files.len(), "consolidating");

        let mut frames = Vec::new();
        for daily_file in &daily_files {
            match read_parquet_file(daily_file) {
                Ok(df) => frames.push(df),
                Err(err) => {
                    tracing::error!(path = %daily_file.display(), %err, "failed to read daily file");
                }
            }
        }
        if frames.is_empty() {
            tracing::error!(venue, year, month, "no data could be read for month");
            return Ok(());
        }

        let mut monthly = concat(
            frames.into_iter().map(IntoLazy::lazy).collect::<Vec<_>>(),
            UnionArgs {
                rechunk: true,
                to_supertypes: true,
                diagonal: true,
                ..Default::default()
            },
        )?
        .collect()?;
        if monthly.schema().contains("trade_time") {
            monthly = monthly.sort(["trade_time"], SortMultipleOptions::default())?;
        }

        let monthly_path = self
            .store
            .path_builder()
            .trades_monthly_path(market, source, venue, year, month);
        let rows = monthly.height();
        write_parquet_atomic(
            &monthly_path,
            &mut monthly,
            WriteOptions {
                codec: Codec::Gzip,
                fsync: true,
                row_group_size: Some(MONTHLY_ROW_GROUP_SIZE),
            },
        )?;
        tracing::info!(path = %monthly_path.display(), rows, "consolidated to monthly");
        Ok(())
    }

    /// Classify stored days: complete (a daily parquet exists), empty
    /// directories left by interrupted runs, and months with data ready for
    /// consolidation.
    pub fn check_partial_downloads(
        &self,
        venue: &str,
        market: &str,
        source: &str,
    ) -> Result<PartialReport> {
        let venue_root = self
            .store
            .path_builder()
            .trades_venue_root(market, source, venue);
        let mut report = PartialReport::default();
        if !venue_root.exists() {
            return Ok(report);
        }

        for (year, year_dir) in hive_children(&venue_root, "year")? {
            for (month, month_dir) in hive_children(&year_dir, "month")? {
                let mut month_has_data = false;
                for (day, day_dir) in hive_children(&month_dir, "day")? {
                    let date = format!("{year}-{month:02}-{day:02}");
                    if day_dir.join("trades.parquet").is_file() {
                        report.complete_dates.push(date);
                        month_has_data = true;
                    } else {
                        report.partial_dates.push(PartialDay {
                            date,
                            status: "empty_directory".to_string(),
                        });
                    }
                }
                if month_has_data {
                    report.months_ready.push((year as i32, month as u32));
                }
            }
        }
        report.complete_dates.sort();
        report.months_ready.sort_unstable();
        Ok(report)
    }

    pub fn has_any_data(&self, venue: &str, market: &str, source: &str) -> bool {
        has_any_trade_data(self.store.path_builder().root(), market, source, venue)
    }
}

/// Filter canonical filenames to those whose embedded date matches.
pub fn files_for_date(files: &[String], date: NaiveDate) -> Vec<String> {
    files
        .iter()
        .filter(|f| filename_date(f) == Some(date))
        .cloned()
        .collect()
}

/// Minute timestamps (`YYYY-MM-DDTHH_MM`) already present in a daily file.
/// An unreadable file degrades to "no data" so the caller re-fetches all.
pub fn stored_minutes(path: &Path) -> HashSet<String> {
    let read = || -> Result<HashSet<String>> {
        let path_str = path.to_string_lossy().to_string();
        let df = LazyFrame::scan_parquet(path_str.as_str().into(), ScanArgsParquet::default())?
            .select([col("trade_time")])
            .collect()
            .context("failed to read stored trade times")?;
        let ca = df.column("trade_time")?.datetime()?;
        Ok(ca
            .as_datetime_iter()
            .flatten()
            .map(|dt| dt.format("%Y-%m-%dT%H_%M").to_string())
            .collect())
    };
    match read() {
        Ok(minutes) => minutes,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "could not read existing timestamps, will download all files");
            HashSet::new()
        }
    }
}

/// Children of `dir` shaped like `{key}={value}` with a numeric value,
/// sorted by value.
fn hive_children(dir: &Path, key: &str) -> Result<Vec<(u32, PathBuf)>> {
    let prefix = format!("{key}=");
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(value) = name.strip_prefix(&prefix) {
            if let Ok(value) = value.parse::<u32>() {
                out.push((value, path));
            }
        }
    }
    out.sort_unstable_by_key(|(value, _)| *value);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_for_date_matches_embedded_date() {
        let files = vec![
            "DETR-posttrade-2025-11-04T09_00.json.gz".to_string(),
            "DETR-posttrade-2025-11-03T09_00.json.gz".to_string(),
            "garbage".to_string(),
        ];
        let date = NaiveDate::from_ymd_opt(2025, 11, 4).unwrap();
        assert_eq!(
            files_for_date(&files, date),
            vec!["DETR-posttrade-2025-11-04T09_00.json.gz".to_string()]
        );
    }

    #[test]
    fn stored_minutes_of_missing_file_is_empty() {
        assert!(stored_minutes(Path::new("/nonexistent/trades.parquet")).is_empty());
    }
}
