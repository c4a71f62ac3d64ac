//! Trading-hours checks with timezone awareness.
//!
//! Answers "are we live now?" and "how long until the next open?" for a
//! market window given in the market's own timezone, honoring DST. The
//! clock is injectable so boundary behavior is testable against a frozen
//! time.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::str::FromStr;
use std::sync::Arc;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct TradingHoursChecker {
    start_time: NaiveTime,
    end_time: NaiveTime,
    market_tz: Tz,
    clock: Clock,
}

impl TradingHoursChecker {
    pub fn new(start_time: NaiveTime, end_time: NaiveTime, market_timezone: &str) -> Result<Self> {
        let market_tz = Tz::from_str(market_timezone)
            .ok()
            .with_context(|| format!("unknown market timezone: {market_timezone}"))?;
        Ok(Self {
            start_time,
            end_time,
            market_tz,
            clock: Arc::new(Utc::now),
        })
    }

    /// Replace the wall clock; tests freeze time with this.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn market_tz(&self) -> Tz {
        self.market_tz
    }

    fn now_market(&self) -> DateTime<Tz> {
        (self.clock)().with_timezone(&self.market_tz)
    }

    pub fn is_within_hours(&self) -> bool {
        let now = self.now_market().time();
        if self.start_time <= self.end_time {
            self.start_time <= now && now <= self.end_time
        } else {
            // Midnight-crossing window, e.g. 22:00-02:00.
            now >= self.start_time || now <= self.end_time
        }
    }

    pub fn seconds_until_active(&self) -> i64 {
        if self.is_within_hours() {
            return 0;
        }
        let now = self.now_market();
        let today_start = self.at_market_time(&now, self.start_time);
        if now.time() < self.start_time {
            (today_start - now).num_seconds()
        } else {
            (today_start + Duration::days(1) - now).num_seconds()
        }
    }

    pub fn seconds_until_close(&self) -> i64 {
        if !self.is_within_hours() {
            return 0;
        }
        let now = self.now_market();
        let mut close = self.at_market_time(&now, self.end_time);
        if close < now {
            // Midnight-crossing window whose close falls tomorrow.
            close += Duration::days(1);
        }
        (close - now).num_seconds()
    }

    pub fn next_active_time(&self) -> DateTime<Utc> {
        (self.clock)() + Duration::seconds(self.seconds_until_active())
    }

    fn at_market_time(&self, reference: &DateTime<Tz>, time: NaiveTime) -> DateTime<Tz> {
        let naive = reference.date_naive().and_time(time);
        // On a DST gap fall back to the earliest valid interpretation.
        self.market_tz
            .from_local_datetime(&naive)
            .earliest()
            .unwrap_or(*reference)
    }

    /// Parse an `"HH:MM-HH:MM"` window.
    pub fn parse_active_hours(hours: &str) -> Result<(NaiveTime, NaiveTime)> {
        let parse = |part: &str| NaiveTime::parse_from_str(part.trim(), "%H:%M");
        if let Some((start, end)) = hours.split_once('-') {
            if let (Ok(start), Ok(end)) = (parse(start), parse(end)) {
                return Ok((start, end));
            }
        }
        bail!(
            "invalid active hours format: '{hours}'; expected 'HH:MM-HH:MM' (e.g. '09:30-16:00')"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn frozen(utc: DateTime<Utc>) -> impl Fn() -> DateTime<Utc> + Send + Sync {
        move || utc
    }

    fn nyse_checker(clock_utc: DateTime<Utc>) -> TradingHoursChecker {
        TradingHoursChecker::new(
            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            "US/Eastern",
        )
        .unwrap()
        .with_clock(frozen(clock_utc))
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(
            &NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(h, min, 0)
                .unwrap(),
        )
    }

    #[test]
    fn before_open_counts_down_to_open() {
        // 08:00 EST in January (UTC-5) = 13:00 UTC; opens 09:30 -> 5400s.
        let checker = nyse_checker(utc(2025, 1, 15, 13, 0));
        assert!(!checker.is_within_hours());
        assert_eq!(checker.seconds_until_active(), 5400);
    }

    #[test]
    fn within_hours_is_zero_wait() {
        // 12:00 EST = 17:00 UTC in winter.
        let checker = nyse_checker(utc(2025, 1, 15, 17, 0));
        assert!(checker.is_within_hours());
        assert_eq!(checker.seconds_until_active(), 0);
        assert_eq!(checker.seconds_until_close(), 4 * 3600);
    }

    #[test]
    fn after_close_waits_until_tomorrow() {
        // 18:00 EST = 23:00 UTC in winter; next open 09:30 tomorrow.
        let checker = nyse_checker(utc(2025, 1, 15, 23, 0));
        assert!(!checker.is_within_hours());
        assert_eq!(checker.seconds_until_active(), (15 * 60 + 30) * 60);
    }

    #[test]
    fn dst_shifts_the_utc_window() {
        // 13:00 UTC is 09:00 EDT in July (UTC-4): 30 minutes to open.
        let checker = nyse_checker(utc(2025, 7, 15, 13, 0));
        assert_eq!(checker.seconds_until_active(), 1800);
    }

    #[test]
    fn midnight_crossing_window() {
        let checker = TradingHoursChecker::new(
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            "UTC",
        )
        .unwrap();

        let late = checker.clone().with_clock(frozen(utc(2025, 1, 15, 23, 0)));
        assert!(late.is_within_hours());
        assert_eq!(late.seconds_until_close(), 3 * 3600);

        let early = checker.clone().with_clock(frozen(utc(2025, 1, 15, 1, 0)));
        assert!(early.is_within_hours());

        let outside = checker.with_clock(frozen(utc(2025, 1, 15, 12, 0)));
        assert!(!outside.is_within_hours());
        assert_eq!(outside.seconds_until_active(), 10 * 3600);
    }

    #[test]
    fn parse_active_hours_accepts_and_rejects() {
        let (start, end) = TradingHoursChecker::parse_active_hours("09:30-16:00").unwrap();
        assert_eq!(start, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(end, NaiveTime::from_hms_opt(16, 0, 0).unwrap());

        assert!(TradingHoursChecker::parse_active_hours("0930-1600").is_err());
        assert!(TradingHoursChecker::parse_active_hours("garbage").is_err());
    }
}
