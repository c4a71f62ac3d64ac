//! Ticker-centric OHLCV provider.
//!
//! The core only needs one contract: `history(ticker, range-or-period,
//! interval)` returning plain bars, with errors that can be inspected for
//! an HTTP status. [`YahooChartProvider`] implements it against the v8
//! chart endpoint.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

pub const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/115.0";
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// One OHLCV bar as returned by the provider; any field the provider omits
/// stays `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub date: NaiveDateTime,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<i64>,
}

/// Either an explicit date range or a provider-side lookback period
/// (`"10y"`, `"729d"`, `"8d"`, ...).
#[derive(Debug, Clone)]
pub enum HistoryQuery {
    Range {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    Period(String),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP {status} from provider for {ticker}")]
    Status { ticker: String, status: u16 },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[async_trait]
pub trait OhlcvProvider: Send + Sync {
    async fn history(
        &self,
        ticker: &str,
        interval: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<Bar>, ProviderError>;
}

// -- Yahoo v8 chart envelope -------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    #[allow(dead_code)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    open: Option<Vec<Option<f64>>>,
    high: Option<Vec<Option<f64>>>,
    low: Option<Vec<Option<f64>>>,
    close: Option<Vec<Option<f64>>>,
    volume: Option<Vec<Option<i64>>>,
}

pub struct YahooChartProvider {
    client: reqwest::Client,
    base_url: String,
}

impl YahooChartProvider {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(DEFAULT_BASE_URL)
    }

    async fn request(
        &self,
        ticker: &str,
        params: &[(String, String)],
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/{ticker}", self.base_url);
        // One retry on transient network failure.
        match self.client.get(&url).query(params).send().await {
            Ok(response) => Ok(response),
            Err(err) => {
                tracing::warn!(ticker, %err, "transient provider error, retrying once");
                sleep(TRANSIENT_RETRY_DELAY).await;
                Ok(self.client.get(&url).query(params).send().await?)
            }
        }
    }
}

#[async_trait]
impl OhlcvProvider for YahooChartProvider {
    async fn history(
        &self,
        ticker: &str,
        interval: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<Bar>, ProviderError> {
        let mut params: Vec<(String, String)> = vec![("interval".into(), interval.to_string())];
        match query {
            HistoryQuery::Range { start, end } => {
                params.push(("period1".into(), start.and_utc().timestamp().to_string()));
                params.push(("period2".into(), end.and_utc().timestamp().to_string()));
            }
            HistoryQuery::Period(period) => {
                params.push(("range".into(), period.clone()));
            }
        }

        let response = self.request(ticker, &params).await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(ProviderError::Status {
                ticker: ticker.to_string(),
                status,
            });
        }

        let body: ChartResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Malformed(err.to_string()))?;
        parse_chart(body)
    }
}

fn parse_chart(body: ChartResponse) -> Result<Vec<Bar>, ProviderError> {
    let Some(result) = body.chart.result.and_then(|r| r.into_iter().next()) else {
        return Ok(Vec::new());
    };
    let timestamps = result.timestamp.unwrap_or_default();
    if timestamps.is_empty() {
        return Ok(Vec::new());
    }
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();

    let series = |values: Option<Vec<Option<f64>>>| values.unwrap_or_default();
    let opens = series(quote.open);
    let highs = series(quote.high);
    let lows = series(quote.low);
    let closes = series(quote.close);
    let volumes = quote.volume.unwrap_or_default();

    let at = |values: &[Option<f64>], i: usize| values.get(i).copied().flatten();

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, ts) in timestamps.iter().enumerate() {
        let Some(date) = DateTime::from_timestamp(*ts, 0).map(|dt| dt.naive_utc()) else {
            return Err(ProviderError::Malformed(format!("bad timestamp {ts}")));
        };
        bars.push(Bar {
            date,
            open: at(&opens, i),
            high: at(&highs, i),
            low: at(&lows, i),
            close: at(&closes, i),
            volume: volumes.get(i).copied().flatten(),
        });
    }
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chart_envelope() {
        let body: ChartResponse = serde_json::from_str(
            r#"{
                "chart": {
                    "result": [{
                        "timestamp": [1709251200, 1709337600],
                        "indicators": {
                            "quote": [{
                                "open": [1.0, 2.0],
                                "high": [1.5, 2.5],
                                "low": [0.5, 1.5],
                                "close": [1.2, null],
                                "volume": [100, null]
                            }]
                        }
                    }],
                    "error": null
                }
            }"#,
        )
        .unwrap();
        let bars = parse_chart(body).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, Some(1.2));
        assert_eq!(bars[1].close, None);
        assert_eq!(bars[1].volume, None);
        assert_eq!(
            bars[0].date.format("%Y-%m-%d").to_string(),
            "2024-03-01"
        );
    }

    #[test]
    fn empty_result_yields_no_bars() {
        let body: ChartResponse =
            serde_json::from_str(r#"{"chart": {"result": null, "error": {"code": "Not Found"}}}"#)
                .unwrap();
        assert!(parse_chart(body).unwrap().is_empty());
    }
}
