//! Working-directory configuration: filesystem paths, the JSON documents
//! shared across runs, and rate-limit settings.
//!
//! All persisted documents are whole-file rewrites; there is no partial
//! update format. Cross-process exclusion is the run lock, not this module.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DATE_FMT: &str = "%Y-%m-%d";

/// Rate limits for the OHLCV provider (trailing-window pacing).
#[derive(Debug, Clone, Copy)]
pub struct OhlcvLimits {
    pub max_requests: usize,
    pub window: Duration,
}

/// Rate limits for the posttrade drop (burst+cooldown pacing).
///
/// The defaults were validated empirically: 0.6s delay with a 35s cooldown
/// every 30 files gave zero 429s over 810 consecutive downloads.
#[derive(Debug, Clone, Copy)]
pub struct TradeLimits {
    pub inter_request_delay: Duration,
    pub burst_size: u64,
    pub burst_cooldown: Duration,
}

impl Default for OhlcvLimits {
    fn default() -> Self {
        Self {
            max_requests: 3,
            window: Duration::from_secs(2),
        }
    }
}

impl Default for TradeLimits {
    fn default() -> Self {
        Self {
            inter_request_delay: Duration::from_millis(600),
            burst_size: 30,
            burst_cooldown: Duration::from_secs(35),
        }
    }
}

/// Storage-mode overrides: the most specific entry wins
/// (`sources["market/source"]`, then `markets[market]`, then the global
/// `partitioned` flag).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub partitioned: bool,
    #[serde(default)]
    pub markets: BTreeMap<String, bool>,
    #[serde(default)]
    pub sources: BTreeMap<String, bool>,
}

impl Default for StorageConfig {
    // New installations default to partitioned storage; an existing file
    // that omits the flag reads as legacy.
    fn default() -> Self {
        Self {
            partitioned: true,
            markets: BTreeMap::new(),
            sources: BTreeMap::new(),
        }
    }
}

impl StorageConfig {
    pub fn is_partitioned_enabled(&self, market: Option<&str>, source: Option<&str>) -> bool {
        if let (Some(market), Some(source)) = (market, source) {
            if let Some(enabled) = self.sources.get(&source_key(market, source)) {
                return *enabled;
            }
        }
        if let Some(market) = market {
            if let Some(enabled) = self.markets.get(&market_key(market)) {
                return *enabled;
            }
        }
        self.partitioned
    }
}

fn market_key(market: &str) -> String {
    market.trim().to_lowercase()
}

fn source_key(market: &str, source: &str) -> String {
    format!("{}/{}", market_key(market), source.trim().to_lowercase())
}

#[derive(Debug, Clone)]
pub struct ConfigService {
    base_path: PathBuf,
    ohlcv_limits: OhlcvLimits,
    trade_limits: TradeLimits,
}

impl ConfigService {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ohlcv_limits: OhlcvLimits::default(),
            trade_limits: TradeLimits::default(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn data_root(&self) -> PathBuf {
        self.base_path.join("data")
    }

    pub fn legacy_root(&self) -> PathBuf {
        self.data_root().join("legacy")
    }

    pub fn tickers_path(&self) -> PathBuf {
        self.base_path.join("tickers.json")
    }

    pub fn intervals_path(&self) -> PathBuf {
        self.base_path.join("intervals.json")
    }

    pub fn storage_config_path(&self) -> PathBuf {
        self.base_path.join("storage_config.json")
    }

    pub fn migration_plan_path(&self) -> PathBuf {
        self.base_path.join("migration_plan.json")
    }

    // -- limits --------------------------------------------------------------

    pub fn ohlcv_limits(&self) -> OhlcvLimits {
        self.ohlcv_limits
    }

    pub fn trade_limits(&self) -> TradeLimits {
        self.trade_limits
    }

    pub fn configure_ohlcv_limits(&mut self, max_requests: usize, window: Duration) {
        tracing::info!(max_requests, ?window, "rate limiting configured");
        self.ohlcv_limits = OhlcvLimits {
            max_requests,
            window,
        };
    }

    pub fn configure_trade_limits(&mut self, limits: TradeLimits) {
        tracing::info!(
            delay_secs = limits.inter_request_delay.as_secs_f64(),
            burst_size = limits.burst_size,
            cooldown_secs = limits.burst_cooldown.as_secs_f64(),
            "trade rate limiting configured"
        );
        self.trade_limits = limits;
    }

    // -- intervals.json ------------------------------------------------------

    pub fn load_intervals(&self) -> Vec<String> {
        let path = self.intervals_path();
        if !path.is_file() {
            return Vec::new();
        }
        match std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|text| serde_json::from_str::<Vec<String>>(&text).map_err(Into::into))
        {
            Ok(intervals) => intervals,
            Err(err) => {
                tracing::warn!(%err, "failed to decode intervals.json; defaulting to empty list");
                Vec::new()
            }
        }
    }

    pub fn save_intervals(&self, intervals: &[String]) -> Result<()> {
        write_json(&self.intervals_path(), intervals)
    }

    // -- storage_config.json -------------------------------------------------

    pub fn load_storage_config(&self) -> StorageConfig {
        let path = self.storage_config_path();
        if !path.is_file() {
            return StorageConfig::default();
        }
        match std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|text| serde_json::from_str::<StorageConfig>(&text).map_err(Into::into))
        {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(%err, "failed to decode storage_config.json; defaulting to global legacy mode");
                StorageConfig {
                    partitioned: false,
                    ..StorageConfig::default()
                }
            }
        }
    }

    pub fn save_storage_config(&self, config: &StorageConfig) -> Result<()> {
        write_json(&self.storage_config_path(), config)
    }

    pub fn set_partition_mode(&self, enabled: bool) -> Result<StorageConfig> {
        let mut config = self.load_storage_config();
        config.partitioned = enabled;
        self.save_storage_config(&config)?;
        Ok(config)
    }

    pub fn set_market_partition_mode(&self, market: &str, enabled: bool) -> Result<StorageConfig> {
        anyhow::ensure!(!market.trim().is_empty(), "market must be a non-empty string");
        let mut config = self.load_storage_config();
        config.markets.insert(market_key(market), enabled);
        self.save_storage_config(&config)?;
        Ok(config)
    }

    pub fn set_source_partition_mode(
        &self,
        market: &str,
        source: &str,
        enabled: bool,
    ) -> Result<StorageConfig> {
        anyhow::ensure!(!market.trim().is_empty(), "market must be a non-empty string");
        anyhow::ensure!(!source.trim().is_empty(), "source must be a non-empty string");
        let mut config = self.load_storage_config();
        config.sources.insert(source_key(market, source), enabled);
        self.save_storage_config(&config)?;
        Ok(config)
    }

    pub fn is_partitioned_enabled(&self, market: Option<&str>, source: Option<&str>) -> bool {
        self.load_storage_config()
            .is_partitioned_enabled(market, source)
    }

    // -- clock ---------------------------------------------------------------

    pub fn get_now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    pub fn format_date(&self, value: Option<NaiveDateTime>) -> String {
        value
            .unwrap_or_else(|| self.get_now())
            .format(DATE_FMT)
            .to_string()
    }
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn storage_config_precedence_most_specific_wins() {
        let mut config = StorageConfig {
            partitioned: false,
            ..StorageConfig::default()
        };
        config.markets.insert("us".into(), true);
        config.sources.insert("us/yahoo".into(), false);

        assert!(!config.is_partitioned_enabled(Some("us"), Some("yahoo")));
        assert!(config.is_partitioned_enabled(Some("us"), Some("other")));
        assert!(config.is_partitioned_enabled(Some("US "), None));
        assert!(!config.is_partitioned_enabled(None, None));
    }

    #[test]
    fn missing_storage_config_defaults_to_partitioned() {
        let dir = TempDir::new().unwrap();
        let config = ConfigService::new(dir.path());
        assert!(config.is_partitioned_enabled(Some("us"), Some("yahoo")));
    }

    #[test]
    fn existing_file_without_flag_reads_as_legacy() {
        let dir = TempDir::new().unwrap();
        let config = ConfigService::new(dir.path());
        std::fs::write(config.storage_config_path(), "{}").unwrap();
        assert!(!config.is_partitioned_enabled(Some("us"), Some("yahoo")));
    }

    #[test]
    fn set_source_partition_mode_round_trips() {
        let dir = TempDir::new().unwrap();
        let config = ConfigService::new(dir.path());
        config.set_partition_mode(false).unwrap();
        config
            .set_source_partition_mode("US", "Yahoo", true)
            .unwrap();

        let loaded = config.load_storage_config();
        assert_eq!(loaded.sources.get("us/yahoo"), Some(&true));
        assert!(config.is_partitioned_enabled(Some("us"), Some("yahoo")));
        assert!(!config.is_partitioned_enabled(Some("de"), Some("xetra")));
    }

    #[test]
    fn intervals_tolerate_garbage() {
        let dir = TempDir::new().unwrap();
        let config = ConfigService::new(dir.path());
        std::fs::write(config.intervals_path(), "not json").unwrap();
        assert!(config.load_intervals().is_empty());

        config
            .save_intervals(&["1d".to_string(), "1h".to_string()])
            .unwrap();
        assert_eq!(config.load_intervals(), vec!["1d", "1h"]);
    }
}
