//! Storage backends for OHLCV bars and posttrade batches.
//!
//! Two fixed variants sit behind the [`Storage`] sum type: the legacy
//! one-file-per-ticker layout and the partitioned ticker-month layout.
//! Which one serves a given `(market, source)` is decided by
//! `storage_config.json` (most specific override wins).

pub mod frame;
pub mod legacy;
pub mod partitioned;
pub mod recovery;

use anyhow::{bail, Result};
use chrono::NaiveDate;
use polars::prelude::DataFrame;
use std::path::{Path, PathBuf};

use crate::config::ConfigService;

pub use legacy::LegacyStore;
pub use partitioned::{PartitionedStore, PartitionReadError, WriteOptions};

/// Coordinates of one ticker's data within a storage root.
#[derive(Debug, Clone)]
pub struct StorageRequest {
    pub root: PathBuf,
    pub interval: String,
    pub ticker: String,
    pub market: Option<String>,
    pub source: Option<String>,
    pub dataset: String,
}

impl StorageRequest {
    pub fn legacy(root: impl Into<PathBuf>, interval: &str, ticker: &str) -> Self {
        Self {
            root: root.into(),
            interval: interval.to_string(),
            ticker: ticker.to_string(),
            market: None,
            source: None,
            dataset: "stocks".to_string(),
        }
    }

    pub fn partitioned(
        root: impl Into<PathBuf>,
        market: &str,
        source: &str,
        dataset: &str,
        interval: &str,
        ticker: &str,
    ) -> Self {
        Self {
            root: root.into(),
            interval: interval.to_string(),
            ticker: ticker.to_string(),
            market: Some(market.to_string()),
            source: Some(source.to_string()),
            dataset: dataset.to_string(),
        }
    }

    pub fn legacy_path(&self) -> PathBuf {
        self.root
            .join(format!("stocks_{}", self.interval))
            .join(format!("{}.parquet", self.ticker))
    }
}

/// The two storage backends. No trait hierarchy: the variants are fixed.
#[derive(Debug, Clone)]
pub enum Storage {
    Legacy(LegacyStore),
    Partitioned(PartitionedStore),
}

impl Storage {
    pub fn legacy() -> Self {
        Storage::Legacy(LegacyStore)
    }

    pub fn partitioned(root: impl Into<PathBuf>, options: WriteOptions) -> Self {
        Storage::Partitioned(PartitionedStore::new(root, options))
    }

    pub fn read(&self, request: &StorageRequest) -> Result<DataFrame> {
        match self {
            Storage::Legacy(store) => store.read(request),
            Storage::Partitioned(store) => store.read(request),
        }
    }

    pub fn save(
        &self,
        request: &StorageRequest,
        new_data: DataFrame,
        existing_data: DataFrame,
    ) -> Result<DataFrame> {
        match self {
            Storage::Legacy(store) => store.save(request, new_data, existing_data),
            Storage::Partitioned(store) => store.save(request, new_data, existing_data),
        }
    }

    pub fn save_trade_batch(
        &self,
        trades: &DataFrame,
        venue: &str,
        trade_date: NaiveDate,
        market: &str,
        source: &str,
    ) -> Result<()> {
        match self {
            Storage::Legacy(_) => bail!("trade batches require partitioned storage"),
            Storage::Partitioned(store) => {
                store.save_trade_batch(trades, venue, trade_date, market, source)
            }
        }
    }
}

/// Route a `(market, source, interval, ticker)` to its backend and request
/// per the storage config.
pub fn storage_for(
    config: &ConfigService,
    market: &str,
    source: &str,
    interval: &str,
    ticker: &str,
    options: WriteOptions,
) -> (Storage, StorageRequest) {
    if config.is_partitioned_enabled(Some(market), Some(source)) {
        let root = config.data_root();
        (
            Storage::partitioned(&root, options),
            StorageRequest::partitioned(&root, market, source, "stocks", interval, ticker),
        )
    } else {
        (
            Storage::legacy(),
            StorageRequest::legacy(config.legacy_root(), interval, ticker),
        )
    }
}

/// True when any parquet data exists under the venue's daily trade tree.
pub fn has_any_trade_data(data_root: &Path, market: &str, source: &str, venue: &str) -> bool {
    let venue_root = crate::paths::PartitionPathBuilder::new(data_root)
        .trades_venue_root(market, source, venue);
    if !venue_root.exists() {
        return false;
    }
    let mut files = Vec::new();
    if partitioned::collect_named_files(&venue_root, "trades.parquet", &mut files).is_err() {
        return false;
    }
    !files.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn router_respects_storage_config() {
        let dir = TempDir::new().unwrap();
        let config = ConfigService::new(dir.path());
        config.set_partition_mode(false).unwrap();
        config
            .set_source_partition_mode("us", "yahoo", true)
            .unwrap();

        let (storage, request) =
            storage_for(&config, "us", "yahoo", "1d", "AAA", WriteOptions::default());
        assert!(matches!(storage, Storage::Partitioned(_)));
        assert_eq!(request.market.as_deref(), Some("us"));

        let (storage, request) =
            storage_for(&config, "de", "xetra", "1d", "AAA", WriteOptions::default());
        assert!(matches!(storage, Storage::Legacy(_)));
        assert!(request.market.is_none());
        assert!(request.legacy_path().starts_with(dir.path().join("data/legacy")));
    }

    #[test]
    fn legacy_storage_refuses_trade_batches() {
        let storage = Storage::legacy();
        let df = polars::df! { "isin" => &["X"] }.unwrap();
        let date = chrono::NaiveDate::from_ymd_opt(2025, 11, 4).unwrap();
        assert!(storage
            .save_trade_batch(&df, "DETR", date, "de", "xetra")
            .is_err());
    }
}
