//! Interval scheduling: one pass over (interval x eligible ticker),
//! rate-limited per fetch.

use anyhow::Result;
use chrono::NaiveDateTime;
use indicatif::{ProgressBar, ProgressStyle};

use crate::limiter::RateLimit;

use super::provider::OhlcvProvider;
use super::registry::TickerRegistry;
use super::service::OhlcvService;

pub struct IntervalScheduler;

impl IntervalScheduler {
    /// Run one full update cycle: for every configured interval, fetch and
    /// store each eligible ticker. Individual ticker failures are logged
    /// and skipped; the registry is persisted once at the end.
    pub async fn run<P: OhlcvProvider>(
        service: &OhlcvService<P>,
        registry: &mut TickerRegistry,
        limiter: &dyn RateLimit,
        intervals: &[String],
        start_date: Option<NaiveDateTime>,
        end_date: Option<NaiveDateTime>,
    ) -> Result<()> {
        registry.load();
        let active = registry.active_tickers();
        tracing::info!(tickers = active.len(), "number of tickers to process");
        tracing::info!(
            excluded = registry.not_found_count(),
            "number of tickers in exclude list"
        );

        let resolved_end = end_date.unwrap_or_else(|| service.get_today());

        for interval in intervals {
            let interval_stocks: Vec<&String> = active
                .iter()
                .filter(|ticker| registry.is_active_for_interval(ticker, interval))
                .collect();
            tracing::info!(
                %interval,
                tickers = interval_stocks.len(),
                "processing interval"
            );

            let bar = progress_bar(interval_stocks.len() as u64, interval);
            for ticker in interval_stocks {
                limiter.enforce().await;
                if let Err(err) = service
                    .save_single_stock(registry, ticker, start_date, Some(resolved_end), interval)
                    .await
                {
                    tracing::error!(%ticker, %interval, %err, "failed to update ticker");
                }
                bar.inc(1);
            }
            bar.finish_and_clear();
        }

        registry.save()
    }
}

fn progress_bar(len: u64, interval: &str) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("  {prefix:.bold} [{bar:30.cyan/dim}] {pos}/{len}")
            .expect("valid template")
            .progress_chars("=> "),
    );
    bar.set_prefix(format!("interval {interval}"));
    bar
}
