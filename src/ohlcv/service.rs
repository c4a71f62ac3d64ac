//! OHLCV fetch service: provider-limit clamping, normalization into the
//! canonical frame, business-day gating, and per-ticker persistence.

use anyhow::{Context, Result};
use chrono::{Datelike, Duration, NaiveDateTime, Utc, Weekday};
use polars::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{ConfigService, DATE_FMT};
use crate::storage::frame::{empty_price_frame, max_date, normalize_price_frame};
use crate::storage::{storage_for, WriteOptions};

use super::provider::{Bar, HistoryQuery, OhlcvProvider};
use super::registry::{TickerEntry, TickerMap, TickerRegistry, TickerStatus};

pub const DEFAULT_MARKET: &str = "us";
pub const DEFAULT_SOURCE: &str = "yahoo";

/// Provider-side range caps: intraday hourly data reaches back at most 729
/// days, minute data at most 7 days.
const HOURLY_INTERVALS: &[&str] = &["60m", "90m", "1h"];
const MINUTE_INTERVALS: &[&str] = &["1m", "2m", "5m", "15m", "30m"];
const HOURLY_LOOKBACK_DAYS: i64 = 729;
const MINUTE_LOOKBACK_DAYS: i64 = 7;

const NASDAQ_LISTED_URL: &str =
    "https://datahub.io/core/nasdaq-listings/_r/-/data/nasdaq-listed.csv";
const NYSE_LISTED_URL: &str =
    "https://datahub.io/core/nyse-other-listings/_r/-/data/nyse-listed.csv";

type NowFn = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub struct OhlcvService<P: OhlcvProvider> {
    config: ConfigService,
    provider: P,
    market: String,
    source: String,
    write_options: WriteOptions,
    now: NowFn,
}

impl<P: OhlcvProvider> OhlcvService<P> {
    pub fn new(config: ConfigService, provider: P) -> Self {
        Self {
            config,
            provider,
            market: DEFAULT_MARKET.to_string(),
            source: DEFAULT_SOURCE.to_string(),
            write_options: WriteOptions::default(),
            now: Arc::new(|| Utc::now().naive_utc()),
        }
    }

    pub fn with_now(mut self, now: impl Fn() -> NaiveDateTime + Send + Sync + 'static) -> Self {
        self.now = Arc::new(now);
        self
    }

    pub fn config(&self) -> &ConfigService {
        &self.config
    }

    /// The end-of-range anchor: now, snapped back to the most recent
    /// weekday at 17:00 so weekend runs do not produce empty ranges.
    pub fn get_today(&self) -> NaiveDateTime {
        let mut today = (self.now)();
        let weekday = today.weekday().num_days_from_monday();
        if weekday > 4 {
            today -= Duration::days(i64::from(weekday - 4));
        }
        today
            .date()
            .and_hms_opt(17, 0, 0)
            .unwrap_or(today)
    }

    /// Count business days in `(start, end]`, Monday through Friday.
    pub fn business_days_between(start: NaiveDateTime, end: NaiveDateTime) -> i64 {
        let delta = (end - start).num_days();
        if delta < 0 {
            return 0;
        }
        let mut business_days = (0..=delta)
            .filter(|i| {
                !matches!(
                    (start + Duration::days(*i)).weekday(),
                    Weekday::Sat | Weekday::Sun
                )
            })
            .count() as i64;
        if !matches!(start.weekday(), Weekday::Sat | Weekday::Sun) {
            business_days -= 1;
        }
        business_days
    }

    /// Fetch bars with provider range limits applied. Provider failures and
    /// empty responses both come back as an empty vec; the caller decides
    /// what that means for the registry.
    pub async fn fetch_bars(
        &self,
        stock: &str,
        start_date: NaiveDateTime,
        end_date: NaiveDateTime,
        interval: &str,
        get_all: bool,
    ) -> Vec<Bar> {
        let query = if get_all {
            let period = if HOURLY_INTERVALS.contains(&interval) {
                "729d"
            } else if MINUTE_INTERVALS.contains(&interval) {
                "8d"
            } else {
                "10y"
            };
            tracing::debug!(stock, period, interval, "fetching full history");
            HistoryQuery::Period(period.to_string())
        } else {
            let today = self.get_today();
            let mut start = start_date;
            let mut end = end_date;
            if HOURLY_INTERVALS.contains(&interval) {
                if (today - start).num_days() >= HOURLY_LOOKBACK_DAYS {
                    start = (today - Duration::days(HOURLY_LOOKBACK_DAYS))
                        .date()
                        .and_hms_opt(8, 0, 0)
                        .unwrap_or(start);
                }
                if (today - end).num_days() >= HOURLY_LOOKBACK_DAYS {
                    end = today;
                }
                if (end - start).num_days() >= HOURLY_LOOKBACK_DAYS {
                    tracing::error!(
                        stock,
                        %start,
                        %end,
                        "date range too large for this interval and cannot be clamped"
                    );
                    return Vec::new();
                }
            }
            if MINUTE_INTERVALS.contains(&interval) {
                if (today - start).num_days() >= MINUTE_LOOKBACK_DAYS {
                    start = (today - Duration::days(MINUTE_LOOKBACK_DAYS))
                        .date()
                        .and_hms_opt(0, 0, 0)
                        .unwrap_or(start);
                }
                if (today - end).num_days() >= MINUTE_LOOKBACK_DAYS {
                    end = today;
                }
            }
            tracing::debug!(stock, %start, %end, interval, "fetching range");
            HistoryQuery::Range { start, end }
        };

        match self.provider.history(stock, interval, &query).await {
            Ok(bars) => {
                tracing::debug!(stock, interval, bars = bars.len(), "provider returned");
                bars
            }
            Err(err) => {
                tracing::error!(stock, %err, "error getting data");
                Vec::new()
            }
        }
    }

    /// Bars -> canonical price frame for one ticker.
    pub fn bars_to_frame(bars: &[Bar], stock: &str) -> Result<DataFrame> {
        if bars.is_empty() {
            return Ok(empty_price_frame());
        }
        let dates: Vec<NaiveDateTime> = bars.iter().map(|b| b.date).collect();
        let df = df! {
            "stock" => &vec![stock; bars.len()],
            "date" => &dates,
            "open" => &bars.iter().map(|b| b.open).collect::<Vec<_>>(),
            "high" => &bars.iter().map(|b| b.high).collect::<Vec<_>>(),
            "low" => &bars.iter().map(|b| b.low).collect::<Vec<_>>(),
            "close" => &bars.iter().map(|b| b.close).collect::<Vec<_>>(),
            "volume" => &bars.iter().map(|b| b.volume).collect::<Vec<_>>(),
        }?;
        normalize_price_frame(df)
    }

    /// Update one `(ticker, interval)`: work out the missing range, fetch,
    /// persist, and record the outcome in the registry.
    pub async fn save_single_stock(
        &self,
        registry: &mut TickerRegistry,
        stock: &str,
        start_date: Option<NaiveDateTime>,
        end_date: Option<NaiveDateTime>,
        interval: &str,
    ) -> Result<()> {
        let (storage, request) = storage_for(
            &self.config,
            &self.market,
            &self.source,
            interval,
            stock,
            self.write_options,
        );
        let existing = storage.read(&request)?;

        let mut load_all = false;
        let mut start = start_date;
        if existing.height() == 0 {
            tracing::debug!(stock, "no stored data, will fetch full history");
            load_all = true;
        } else if start.is_none() {
            start = max_date(&existing)?;
        }
        let end = end_date.unwrap_or_else(|| self.get_today());
        let start = match start {
            Some(start) => start,
            None => {
                load_all = true;
                self.get_today()
            }
        };

        if !load_all && Self::business_days_between(start, end) <= 0 {
            tracing::debug!(stock, interval, "up to date");
            return Ok(());
        }

        let bars = self.fetch_bars(stock, start, end, interval, load_all).await;
        if bars.is_empty() {
            tracing::debug!(
                stock,
                interval,
                %start,
                %end,
                "no results, marking interval not found"
            );
            registry.update_interval_status(stock, interval, false, None, None);
            return Ok(());
        }

        let frame = Self::bars_to_frame(&bars, stock)?;
        let combined = storage.save(&request, frame, existing)?;
        let last = max_date(&combined)?;
        registry.update_interval_status(stock, interval, true, last, None);
        Ok(())
    }

    /// Download the NASDAQ/NYSE listing CSVs and build a fresh ticker
    /// universe keyed for the registry merge.
    pub async fn download_ticker_universe(&self) -> Result<TickerMap> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        let mut tickers: Vec<String> = Vec::new();
        for (url, local_name, skip_file_trailer) in [
            (NASDAQ_LISTED_URL, "nasdaq-listed.csv", true),
            (NYSE_LISTED_URL, "nyse-listed.csv", false),
        ] {
            let text = client
                .get(url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .with_context(|| format!("failed to download {url}"))?
                .text()
                .await
                .with_context(|| format!("failed to read {url}"))?;
            let local_path = self.config.base_path().join(local_name);
            std::fs::write(&local_path, &text)
                .with_context(|| format!("failed to write {}", local_path.display()))?;
            tickers.extend(parse_listing_csv(&text, skip_file_trailer));
        }

        tickers.sort_unstable();
        tickers.dedup();
        let added_date = self.get_today().format(DATE_FMT).to_string();
        Ok(tickers
            .into_iter()
            .map(|ticker| {
                (
                    ticker.clone(),
                    TickerEntry {
                        ticker,
                        added_date: added_date.clone(),
                        status: TickerStatus::Active,
                        last_checked: String::new(),
                        intervals: BTreeMap::new(),
                    },
                )
            })
            .collect())
    }
}

/// First column of an exchange listing CSV, skipping the header row, blank
/// lines, and (for NASDAQ) the `File Creation Time` trailer.
pub fn parse_listing_csv(text: &str, skip_file_trailer: bool) -> Vec<String> {
    text.lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| line.split(',').next())
        .filter(|ticker| !ticker.is_empty())
        .filter(|ticker| !(skip_file_trailer && ticker.starts_with("File")))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    struct RecordingProvider {
        bars: Vec<Bar>,
        queries: Mutex<Vec<(String, HistoryQuery)>>,
    }

    impl RecordingProvider {
        fn new(bars: Vec<Bar>) -> Self {
            Self {
                bars,
                queries: Mutex::new(Vec::new()),
            }
        }

        fn last_query(&self) -> (String, HistoryQuery) {
            self.queries.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl OhlcvProvider for RecordingProvider {
        async fn history(
            &self,
            _ticker: &str,
            interval: &str,
            query: &HistoryQuery,
        ) -> Result<Vec<Bar>, super::super::provider::ProviderError> {
            self.queries
                .lock()
                .unwrap()
                .push((interval.to_string(), query.clone()));
            Ok(self.bars.clone())
        }
    }

    fn dt(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn service(provider: RecordingProvider, now: NaiveDateTime) -> OhlcvService<RecordingProvider> {
        let dir = tempfile::tempdir().unwrap();
        OhlcvService::new(ConfigService::new(dir.path()), provider).with_now(move || now)
    }

    #[test]
    fn get_today_snaps_weekends_to_friday() {
        // 2025-01-18 is a Saturday, 2025-01-19 a Sunday.
        let saturday = service(RecordingProvider::new(vec![]), dt(2025, 1, 18, 12));
        assert_eq!(saturday.get_today(), dt(2025, 1, 17, 17));
        let sunday = service(RecordingProvider::new(vec![]), dt(2025, 1, 19, 12));
        assert_eq!(sunday.get_today(), dt(2025, 1, 17, 17));
        let tuesday = service(RecordingProvider::new(vec![]), dt(2025, 1, 14, 9));
        assert_eq!(tuesday.get_today(), dt(2025, 1, 14, 17));
    }

    #[test]
    fn business_days_span_weekdays_only() {
        type Svc = OhlcvService<RecordingProvider>;
        // Tuesday -> Wednesday: one business day.
        assert_eq!(
            Svc::business_days_between(dt(2025, 1, 14, 0), dt(2025, 1, 15, 0)),
            1
        );
        // Friday -> Monday: one business day in between.
        assert_eq!(
            Svc::business_days_between(dt(2025, 1, 17, 0), dt(2025, 1, 20, 0)),
            1
        );
        // Same day: nothing to fetch.
        assert_eq!(
            Svc::business_days_between(dt(2025, 1, 14, 0), dt(2025, 1, 14, 0)),
            0
        );
        assert_eq!(
            Svc::business_days_between(dt(2025, 1, 15, 0), dt(2025, 1, 14, 0)),
            0
        );
    }

    #[tokio::test]
    async fn hourly_start_is_clamped_to_729_days() {
        let provider = RecordingProvider::new(vec![]);
        let now = dt(2025, 1, 14, 12);
        let service = service(provider, now);
        service
            .fetch_bars("AAA", dt(2020, 1, 1, 0), now, "1h", false)
            .await;

        let (_, query) = service.provider.last_query();
        let HistoryQuery::Range { start, end } = query else {
            panic!("expected range query");
        };
        let today = service.get_today();
        assert_eq!(start, (today - Duration::days(729)).date().and_hms_opt(8, 0, 0).unwrap());
        assert_eq!(end, now);
    }

    #[tokio::test]
    async fn minute_start_is_clamped_to_7_days() {
        let now = dt(2025, 1, 14, 12);
        let service = service(RecordingProvider::new(vec![]), now);
        service
            .fetch_bars("AAA", dt(2024, 12, 1, 0), now, "5m", false)
            .await;

        let (_, query) = service.provider.last_query();
        let HistoryQuery::Range { start, .. } = query else {
            panic!("expected range query");
        };
        let today = service.get_today();
        assert_eq!(start, (today - Duration::days(7)).date().and_hms_opt(0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn get_all_uses_period_queries() {
        let now = dt(2025, 1, 14, 12);
        for (interval, expected) in [("1d", "10y"), ("1h", "729d"), ("5m", "8d")] {
            let service = service(RecordingProvider::new(vec![]), now);
            service.fetch_bars("AAA", now, now, interval, true).await;
            let (_, query) = service.provider.last_query();
            let HistoryQuery::Period(period) = query else {
                panic!("expected period query");
            };
            assert_eq!(period, expected, "interval {interval}");
        }
    }

    #[test]
    fn bars_to_frame_has_canonical_schema() {
        let bars = vec![Bar {
            date: dt(2024, 3, 1, 0),
            open: Some(1.0),
            high: Some(2.0),
            low: Some(0.5),
            close: Some(1.5),
            volume: Some(100),
        }];
        let df = OhlcvService::<RecordingProvider>::bars_to_frame(&bars, "AAA").unwrap();
        assert_eq!(
            df.get_column_names().iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            crate::storage::frame::PRICE_COLUMNS.to_vec()
        );
        assert_eq!(df.height(), 1);
        assert_eq!(df.column("sequence").unwrap().null_count(), 1);
    }

    #[test]
    fn listing_csv_parsing_skips_header_and_trailer() {
        let nasdaq = "Symbol,Name\nAAPL,Apple\n\nMSFT,Microsoft\nFile Creation Time: 0101\n";
        assert_eq!(parse_listing_csv(nasdaq, true), vec!["AAPL", "MSFT"]);

        let nyse = "ACT Symbol,Company\nIBM,IBM Corp\n";
        assert_eq!(parse_listing_csv(nyse, false), vec!["IBM"]);
    }
}
