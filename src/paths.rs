use anyhow::{bail, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use std::path::{Path, PathBuf};

/// A partition timestamp: either a plain date or a datetime that gets
/// truncated to its date.
#[derive(Debug, Clone, Copy)]
pub enum Stamp {
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl Stamp {
    fn date(self) -> NaiveDate {
        match self {
            Stamp::Date(d) => d,
            Stamp::DateTime(dt) => dt.date(),
        }
    }
}

impl From<NaiveDate> for Stamp {
    fn from(d: NaiveDate) -> Self {
        Stamp::Date(d)
    }
}

impl From<NaiveDateTime> for Stamp {
    fn from(dt: NaiveDateTime) -> Self {
        Stamp::DateTime(dt)
    }
}

/// Deterministic mapping from storage coordinates to filesystem paths.
///
/// Partitioned OHLCV data lands in Hive-style `key=value` segments, one
/// parquet file per ticker-month:
/// `{root}/{market}/{source}/{dataset}_{interval}/ticker=T/year=YYYY/month=MM/data.parquet`.
///
/// When `market` or `source` is absent the builder falls back to the legacy
/// layout `{root}/stocks_{interval}/{ticker}.parquet`, which is how callers
/// read pre-migration files.
#[derive(Debug, Clone)]
pub struct PartitionPathBuilder {
    root: PathBuf,
}

impl PartitionPathBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn build(
        &self,
        market: Option<&str>,
        source: Option<&str>,
        dataset: &str,
        interval: &str,
        ticker: &str,
        stamp: impl Into<Stamp>,
    ) -> Result<PathBuf> {
        let interval = interval.trim();
        let ticker = ticker.trim();
        let dataset = dataset.trim();
        if interval.is_empty() {
            bail!("interval is required");
        }
        if ticker.is_empty() {
            bail!("ticker is required");
        }
        let date = stamp.into().date();
        let (Some(market), Some(source)) = (nonempty(market), nonempty(source)) else {
            return Ok(self.legacy_path(interval, ticker));
        };
        Ok(self
            .root
            .join(normalize_segment(market))
            .join(normalize_segment(source))
            .join(format!("{}_{interval}", dataset.to_lowercase()))
            .join(format!("ticker={ticker}"))
            .join(format!("year={:04}", date.year()))
            .join(format!("month={:02}", date.month()))
            .join("data.parquet"))
    }

    /// Prefix up to and including the `ticker=` segment. There is no legacy
    /// equivalent, so missing market/source is an error here.
    pub fn ticker_root(
        &self,
        market: Option<&str>,
        source: Option<&str>,
        dataset: &str,
        interval: &str,
        ticker: &str,
    ) -> Result<PathBuf> {
        let interval = interval.trim();
        let ticker = ticker.trim();
        let dataset = dataset.trim();
        if interval.is_empty() {
            bail!("interval is required");
        }
        if ticker.is_empty() {
            bail!("ticker is required");
        }
        let (Some(market), Some(source)) = (nonempty(market), nonempty(source)) else {
            bail!("market and source are required for partitioned paths");
        };
        Ok(self
            .root
            .join(normalize_segment(market))
            .join(normalize_segment(source))
            .join(format!("{}_{interval}", dataset.to_lowercase()))
            .join(format!("ticker={ticker}")))
    }

    pub fn legacy_path(&self, interval: &str, ticker: &str) -> PathBuf {
        self.root
            .join(format!("stocks_{interval}"))
            .join(format!("{ticker}.parquet"))
    }

    /// Daily trade file: one per venue-day.
    pub fn trades_day_path(
        &self,
        market: &str,
        source: &str,
        venue: &str,
        date: NaiveDate,
    ) -> PathBuf {
        self.trades_venue_root(market, source, venue)
            .join(format!("year={:04}", date.year()))
            .join(format!("month={:02}", date.month()))
            .join(format!("day={:02}", date.day()))
            .join("trades.parquet")
    }

    pub fn trades_venue_root(&self, market: &str, source: &str, venue: &str) -> PathBuf {
        self.root
            .join(normalize_segment(market))
            .join(normalize_segment(source))
            .join("trades")
            .join(format!("venue={venue}"))
    }

    pub fn trades_month_root(
        &self,
        market: &str,
        source: &str,
        venue: &str,
        year: i32,
        month: u32,
    ) -> PathBuf {
        self.trades_venue_root(market, source, venue)
            .join(format!("year={year:04}"))
            .join(format!("month={month:02}"))
    }

    /// Consolidated monthly trade file, written alongside (never replacing)
    /// the daily tree.
    pub fn trades_monthly_path(
        &self,
        market: &str,
        source: &str,
        venue: &str,
        year: i32,
        month: u32,
    ) -> PathBuf {
        self.root
            .join(normalize_segment(market))
            .join(normalize_segment(source))
            .join("trades_monthly")
            .join(format!("venue={venue}"))
            .join(format!("year={year:04}"))
            .join(format!("month={month:02}"))
            .join("trades.parquet")
    }
}

fn normalize_segment(value: &str) -> String {
    value.trim().to_lowercase()
}

fn nonempty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> PartitionPathBuilder {
        PartitionPathBuilder::new("data")
    }

    #[test]
    fn partitioned_path_uses_month_granularity() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 17).unwrap();
        let path = builder()
            .build(Some("US"), Some("Yahoo"), "stocks", "1m", "AAA", date)
            .unwrap();
        assert_eq!(
            path,
            PathBuf::from("data/us/yahoo/stocks_1m/ticker=AAA/year=2024/month=03/data.parquet")
        );
    }

    #[test]
    fn datetime_stamp_truncates_to_date() {
        let dt = NaiveDate::from_ymd_opt(2024, 3, 17)
            .unwrap()
            .and_hms_opt(14, 30, 5)
            .unwrap();
        let path = builder()
            .build(Some("us"), Some("yahoo"), "stocks", "1d", "AAA", dt)
            .unwrap();
        assert!(path.ends_with("ticker=AAA/year=2024/month=03/data.parquet"));
    }

    #[test]
    fn missing_market_falls_back_to_legacy_layout() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let path = builder()
            .build(None, Some("yahoo"), "stocks", "1d", "AAA", date)
            .unwrap();
        assert_eq!(path, PathBuf::from("data/stocks_1d/AAA.parquet"));

        let path = builder()
            .build(Some("us"), Some("  "), "stocks", "1d", "AAA", date)
            .unwrap();
        assert_eq!(path, PathBuf::from("data/stocks_1d/AAA.parquet"));
    }

    #[test]
    fn ticker_root_requires_market_and_source() {
        assert!(builder()
            .ticker_root(None, None, "stocks", "1d", "AAA")
            .is_err());
        let root = builder()
            .ticker_root(Some("us"), Some("yahoo"), "stocks", "1d", "AAA")
            .unwrap();
        assert_eq!(root, PathBuf::from("data/us/yahoo/stocks_1d/ticker=AAA"));
    }

    #[test]
    fn blank_interval_or_ticker_rejected() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(builder()
            .build(Some("us"), Some("yahoo"), "stocks", " ", "AAA", date)
            .is_err());
        assert!(builder()
            .build(Some("us"), Some("yahoo"), "stocks", "1d", "", date)
            .is_err());
    }

    #[test]
    fn trade_paths() {
        let date = NaiveDate::from_ymd_opt(2025, 11, 4).unwrap();
        let daily = builder().trades_day_path("de", "xetra", "DETR", date);
        assert_eq!(
            daily,
            PathBuf::from("data/de/xetra/trades/venue=DETR/year=2025/month=11/day=04/trades.parquet")
        );
        let monthly = builder().trades_monthly_path("de", "xetra", "DETR", 2025, 11);
        assert_eq!(
            monthly,
            PathBuf::from("data/de/xetra/trades_monthly/venue=DETR/year=2025/month=11/trades.parquet")
        );
    }
}
