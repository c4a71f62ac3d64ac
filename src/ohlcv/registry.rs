//! Ticker lifecycle registry.
//!
//! Tracks per-ticker, per-interval `active`/`not_found` state with a
//! 30-day cooldown before a dead symbol is probed again, plus the offline
//! reactivation sweep for tickers that came back.

use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::{write_json, ConfigService, DATE_FMT};
use crate::limiter::RateLimit;

use super::provider::{HistoryQuery, OhlcvProvider};

/// Days a `not_found` interval stays quiet before re-evaluation.
pub const NOT_FOUND_COOLDOWN_DAYS: i64 = 30;
/// A globally-not-found ticker with any interval found within this many
/// days is reactivated by the reparse sweep.
pub const REACTIVATION_WINDOW_DAYS: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickerStatus {
    #[default]
    Active,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub mode: String,
    pub market: String,
    pub source: String,
    pub dataset: String,
    pub root: String,
    pub venue: String,
    pub verified_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntervalState {
    #[serde(default)]
    pub status: TickerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_found_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_data_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_not_found_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerEntry {
    pub ticker: String,
    pub added_date: String,
    #[serde(default)]
    pub status: TickerStatus,
    #[serde(default)]
    pub last_checked: String,
    #[serde(default)]
    pub intervals: BTreeMap<String, IntervalState>,
}

pub type TickerMap = BTreeMap<String, TickerEntry>;

/// Dates in the registry are stored as strings and parsed lazily: one
/// unparseable date degrades to "cooldown expired" instead of poisoning
/// the whole document.
fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FMT).ok()
}

pub fn load_ticker_map(path: &Path) -> TickerMap {
    if !path.is_file() {
        return TickerMap::new();
    }
    match std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|text| serde_json::from_str::<TickerMap>(&text).map_err(Into::into))
    {
        Ok(map) => map,
        Err(err) => {
            tracing::warn!(%err, "failed to decode tickers.json; defaulting to empty map");
            TickerMap::new()
        }
    }
}

pub fn save_ticker_map(path: &Path, map: &TickerMap) -> Result<()> {
    write_json(path, map)
}

type TodayFn = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

pub struct TickerRegistry {
    config: ConfigService,
    tickers: TickerMap,
    today: TodayFn,
}

impl TickerRegistry {
    pub fn new(config: ConfigService) -> Self {
        let tickers = load_ticker_map(&config.tickers_path());
        Self {
            config,
            tickers,
            today: Arc::new(|| Utc::now().date_naive()),
        }
    }

    pub fn with_today(mut self, today: impl Fn() -> NaiveDate + Send + Sync + 'static) -> Self {
        self.today = Arc::new(today);
        self
    }

    fn today(&self) -> NaiveDate {
        (self.today)()
    }

    fn today_str(&self) -> String {
        self.today().format(DATE_FMT).to_string()
    }

    pub fn tickers(&self) -> &TickerMap {
        &self.tickers
    }

    pub fn len(&self) -> usize {
        self.tickers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty()
    }

    pub fn load(&mut self) {
        self.tickers = load_ticker_map(&self.config.tickers_path());
    }

    pub fn save(&self) -> Result<()> {
        save_ticker_map(&self.config.tickers_path(), &self.tickers)
    }

    pub fn replace(&mut self, tickers: TickerMap) {
        self.tickers = tickers;
    }

    /// Merge a fresh ticker universe. New tickers are added; an existing
    /// ticker that reappears in the universe while globally `not_found` is
    /// flipped back to `active`.
    pub fn update_current_list(&mut self, new_tickers: TickerMap) {
        for (ticker, metadata) in new_tickers {
            match self.tickers.get_mut(&ticker) {
                None => {
                    self.tickers.insert(ticker, metadata);
                }
                Some(existing) => {
                    if existing.status == TickerStatus::NotFound {
                        existing.status = TickerStatus::Active;
                    }
                }
            }
        }
    }

    /// Scheduler eligibility: skip only while a `not_found` interval is
    /// inside its 30-day cooldown (or the whole ticker is globally dead).
    pub fn is_active_for_interval(&self, ticker: &str, interval: &str) -> bool {
        let Some(entry) = self.tickers.get(ticker) else {
            return true;
        };
        if entry.status == TickerStatus::NotFound {
            return false;
        }
        let Some(state) = entry.intervals.get(interval) else {
            return true;
        };
        if state.status != TickerStatus::NotFound {
            return true;
        }
        let Some(last_not_found) = state.last_not_found_date.as_deref().and_then(parse_date)
        else {
            return true;
        };
        (self.today() - last_not_found).num_days() >= NOT_FOUND_COOLDOWN_DAYS
    }

    pub fn get_interval_state(&self, ticker: &str, interval: &str) -> Option<&IntervalState> {
        self.tickers.get(ticker)?.intervals.get(interval)
    }

    pub fn get_interval_storage(&self, ticker: &str, interval: &str) -> Option<&StorageInfo> {
        self.get_interval_state(ticker, interval)?.storage.as_ref()
    }

    pub fn get_last_data_date(&self, ticker: &str, interval: &str) -> Option<NaiveDate> {
        self.get_interval_state(ticker, interval)?
            .last_data_date
            .as_deref()
            .and_then(parse_date)
    }

    /// Record the outcome of one fetch for `(ticker, interval)`.
    pub fn update_interval_status(
        &mut self,
        ticker: &str,
        interval: &str,
        found_data: bool,
        last_date: Option<NaiveDateTime>,
        storage: Option<StorageInfo>,
    ) {
        let current_date = self.today_str();
        let entry = self
            .tickers
            .entry(ticker.to_string())
            .or_insert_with(|| TickerEntry {
                ticker: ticker.to_string(),
                added_date: current_date.clone(),
                status: TickerStatus::Active,
                last_checked: current_date.clone(),
                intervals: BTreeMap::new(),
            });
        let state = entry.intervals.entry(interval.to_string()).or_default();

        if found_data {
            state.status = TickerStatus::Active;
            state.last_found_date = Some(current_date.clone());
            state.last_checked = Some(current_date.clone());
            if let Some(last) = last_date {
                state.last_data_date = Some(last.format(DATE_FMT).to_string());
            }
            if storage.is_some() {
                state.storage = storage;
            }
            entry.status = TickerStatus::Active;
            entry.last_checked = current_date;
        } else {
            state.status = TickerStatus::NotFound;
            state.last_not_found_date = Some(current_date.clone());
            state.last_checked = Some(current_date.clone());
            entry.last_checked = current_date;
            if !entry.intervals.is_empty()
                && entry
                    .intervals
                    .values()
                    .all(|s| s.status == TickerStatus::NotFound)
            {
                entry.status = TickerStatus::NotFound;
            }
        }
    }

    pub fn active_tickers(&self) -> Vec<String> {
        self.tickers
            .iter()
            .filter(|(_, entry)| entry.status == TickerStatus::Active)
            .map(|(ticker, _)| ticker.clone())
            .collect()
    }

    pub fn not_found_count(&self) -> usize {
        self.tickers
            .values()
            .filter(|entry| entry.status == TickerStatus::NotFound)
            .count()
    }

    /// Probe every globally-not-found ticker with a minimal `1d` request
    /// and reactivate the ones that answer. Writes once at the end, then
    /// runs the offline reparse sweep.
    pub async fn confirm_not_founds(
        &mut self,
        provider: &dyn OhlcvProvider,
        limiter: &dyn RateLimit,
    ) -> Result<()> {
        tracing::debug!("confirming not found tickers");
        let not_found: Vec<String> = self
            .tickers
            .iter()
            .filter(|(_, entry)| entry.status == TickerStatus::NotFound)
            .map(|(ticker, _)| ticker.clone())
            .collect();
        tracing::info!(count = not_found.len(), "re-checking not-founds");

        let bar = progress_bar(not_found.len() as u64, "Re-checking not-founds");
        for ticker in not_found {
            limiter.enforce().await;
            let current_date = self.today_str();
            if let Some(entry) = self.tickers.get_mut(&ticker) {
                entry.last_checked = current_date;
            }

            let probe = HistoryQuery::Period("1d".to_string());
            match provider.history(&ticker, "1d", &probe).await {
                Ok(bars) if !bars.is_empty() => {
                    tracing::debug!(%ticker, "found again");
                    let last = bars.iter().map(|b| b.date).max();
                    self.update_interval_status(&ticker, "1d", true, last, None);
                }
                Ok(_) => {
                    tracing::debug!(%ticker, "still not found");
                }
                Err(err) => {
                    tracing::error!(%ticker, status = ?err.status(), %err, "probe failed, most likely not available anymore");
                }
            }
            bar.inc(1);
        }
        bar.finish_and_clear();

        self.save()?;
        self.reparse_not_founds()
    }

    /// Offline sweep: a globally-not-found ticker whose best interval was
    /// found within the last 90 days goes back to `active`.
    pub fn reparse_not_founds(&mut self) -> Result<()> {
        let today = self.today();
        let current_date = self.today_str();
        let mut reactivated = Vec::new();

        for (ticker, entry) in &mut self.tickers {
            if entry.status != TickerStatus::NotFound {
                continue;
            }
            let has_recent_data = entry.intervals.values().any(|state| {
                state.status == TickerStatus::Active
                    && state
                        .last_found_date
                        .as_deref()
                        .and_then(parse_date)
                        .is_some_and(|found| (today - found).num_days() <= REACTIVATION_WINDOW_DAYS)
            });
            if has_recent_data {
                entry.status = TickerStatus::Active;
                entry.last_checked = current_date.clone();
                reactivated.push(ticker.clone());
            }
        }
        for ticker in &reactivated {
            tracing::info!(%ticker, "reactivating, found recent data in intervals");
        }
        self.save()
    }
}

fn progress_bar(len: u64, prefix: &str) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("  {prefix:.bold} [{bar:30.cyan/dim}] {pos}/{len}")
            .expect("valid template")
            .progress_chars("=> "),
    );
    bar.set_prefix(prefix.to_string());
    bar
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir, today: NaiveDate) -> TickerRegistry {
        TickerRegistry::new(ConfigService::new(dir.path())).with_today(move || today)
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn unknown_ticker_is_eligible() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir, day(2025, 1, 1));
        assert!(reg.is_active_for_interval("AAA", "1d"));
    }

    #[test]
    fn cooldown_expires_exactly_on_day_thirty() {
        let dir = TempDir::new().unwrap();
        let marked = day(2025, 1, 1);

        let mut reg = registry(&dir, marked);
        reg.update_interval_status("AAA", "1h", false, None, None);
        // One interval not_found makes the whole ticker not_found; add an
        // active interval so only the interval cooldown is in play.
        reg.update_interval_status("AAA", "1d", true, None, None);

        for (offset, expected) in [(0, false), (29, false), (30, true), (31, true)] {
            let today = marked + chrono::Days::new(offset);
            let reg = TickerRegistry {
                config: ConfigService::new(dir.path()),
                tickers: reg.tickers.clone(),
                today: Arc::new(move || today),
            };
            assert_eq!(
                reg.is_active_for_interval("AAA", "1h"),
                expected,
                "offset {offset}"
            );
        }
    }

    #[test]
    fn unparseable_cooldown_date_means_retry() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir, day(2025, 1, 1));
        reg.update_interval_status("AAA", "1d", false, None, None);
        reg.update_interval_status("AAA", "1h", true, None, None);
        reg.tickers
            .get_mut("AAA")
            .unwrap()
            .intervals
            .get_mut("1d")
            .unwrap()
            .last_not_found_date = Some("not-a-date".to_string());
        assert!(reg.is_active_for_interval("AAA", "1d"));
    }

    #[test]
    fn all_intervals_not_found_promotes_global() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir, day(2025, 1, 1));
        reg.update_interval_status("AAA", "1d", false, None, None);
        assert_eq!(reg.tickers()["AAA"].status, TickerStatus::NotFound);

        // Any active interval keeps the global status active.
        reg.update_interval_status("AAA", "1h", true, None, None);
        reg.update_interval_status("AAA", "1d", false, None, None);
        assert_eq!(reg.tickers()["AAA"].status, TickerStatus::Active);

        // Globally not_found blocks every interval.
        reg.update_interval_status("AAA", "1h", false, None, None);
        assert_eq!(reg.tickers()["AAA"].status, TickerStatus::NotFound);
        assert!(!reg.is_active_for_interval("AAA", "1h"));
    }

    #[test]
    fn found_updates_last_data_date() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir, day(2025, 1, 2));
        let last = day(2025, 1, 1).and_hms_opt(16, 0, 0).unwrap();
        reg.update_interval_status("AAA", "1d", true, Some(last), None);
        assert_eq!(reg.get_last_data_date("AAA", "1d"), Some(day(2025, 1, 1)));
        let state = reg.get_interval_state("AAA", "1d").unwrap();
        assert_eq!(state.last_found_date.as_deref(), Some("2025-01-02"));
    }

    #[test]
    fn reparse_reactivates_recent_tickers() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir, day(2025, 4, 1));

        // Found 60 days ago, then the only other interval went dead and
        // dragged the global status down.
        reg.tickers.insert(
            "AAA".to_string(),
            TickerEntry {
                ticker: "AAA".to_string(),
                added_date: "2025-01-01".to_string(),
                status: TickerStatus::NotFound,
                last_checked: "2025-03-01".to_string(),
                intervals: BTreeMap::from([(
                    "1d".to_string(),
                    IntervalState {
                        status: TickerStatus::Active,
                        last_found_date: Some("2025-02-01".to_string()),
                        ..IntervalState::default()
                    },
                )]),
            },
        );
        // Found a year ago: stays dead.
        reg.tickers.insert(
            "BBB".to_string(),
            TickerEntry {
                ticker: "BBB".to_string(),
                added_date: "2024-01-01".to_string(),
                status: TickerStatus::NotFound,
                last_checked: "2024-06-01".to_string(),
                intervals: BTreeMap::from([(
                    "1d".to_string(),
                    IntervalState {
                        status: TickerStatus::Active,
                        last_found_date: Some("2024-04-01".to_string()),
                        ..IntervalState::default()
                    },
                )]),
            },
        );

        reg.reparse_not_founds().unwrap();
        assert_eq!(reg.tickers()["AAA"].status, TickerStatus::Active);
        assert_eq!(reg.tickers()["BBB"].status, TickerStatus::NotFound);
    }

    #[test]
    fn update_current_list_reactivates_and_adds() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir, day(2025, 1, 1));
        reg.update_interval_status("AAA", "1d", false, None, None);
        assert_eq!(reg.tickers()["AAA"].status, TickerStatus::NotFound);

        let mut universe = TickerMap::new();
        for ticker in ["AAA", "BBB"] {
            universe.insert(
                ticker.to_string(),
                TickerEntry {
                    ticker: ticker.to_string(),
                    added_date: "2025-01-01".to_string(),
                    status: TickerStatus::Active,
                    last_checked: String::new(),
                    intervals: BTreeMap::new(),
                },
            );
        }
        reg.update_current_list(universe);
        assert_eq!(reg.tickers()["AAA"].status, TickerStatus::Active);
        assert!(reg.tickers().contains_key("BBB"));
    }

    #[test]
    fn persistence_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir, day(2025, 1, 1));
        reg.update_interval_status("AAA", "1d", true, None, None);
        reg.save().unwrap();

        let reloaded = registry(&dir, day(2025, 1, 1));
        assert_eq!(reloaded.tickers()["AAA"].status, TickerStatus::Active);
    }
}
