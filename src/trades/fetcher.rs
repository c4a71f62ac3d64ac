//! Posttrade drop client: rolling-window listing, trading-hours filter,
//! rate-limited download, gunzip.

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

use crate::config::TradeLimits;
use crate::limiter::{BurstLimiter, RateLimit};

pub const DEFAULT_BASE_URL: &str = "https://mfs.deutsche-boerse.com/api/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_DOWNLOAD_RETRIES: u32 = 4;
const BACKOFF_BASE_SECS: u64 = 2;

/// Venue trading windows in Europe/Berlin local time, with 30-minute
/// safety margins around the observed data windows. File timestamps are
/// UTC and converted before comparison. Unknown venues skip filtering.
const VENUE_TRADING_HOURS: &[(&str, &str, &str)] = &[
    ("DETR", "08:00", "18:30"),
    ("DFRA", "08:30", "18:00"),
    ("DGAT", "08:30", "18:00"),
    ("DEUR", "08:30", "18:00"),
];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited (429) downloading {filename} after {attempts} attempts")]
    RateLimited { filename: String, attempts: u32 },

    #[error("expired download token for {filename}")]
    ExpiredToken { filename: String },

    #[error("HTTP {status} downloading {filename}")]
    Status { filename: String, status: u16 },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct ListingResponse {
    #[serde(rename = "SourcePrefix", default)]
    source_prefix: String,
    #[serde(rename = "CurrentFiles", default)]
    current_files: Vec<String>,
}

/// Client for the posttrade drop. Rate limiting is enforced *before* every
/// download per the burst+cooldown discipline; a 429 that slips through is
/// retried with bounded exponential backoff.
pub struct PosttradeFetcher {
    base_url: String,
    client: reqwest::Client,
    limiter: BurstLimiter,
    filter_empty_files: bool,
}

impl PosttradeFetcher {
    pub fn new(base_url: &str, limits: TradeLimits, filter_empty_files: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string() + "/",
            client,
            limiter: BurstLimiter::new(
                limits.inter_request_delay,
                limits.burst_size,
                limits.burst_cooldown,
            ),
            filter_empty_files,
        })
    }

    pub fn with_defaults(limits: TradeLimits) -> Result<Self> {
        Self::new(DEFAULT_BASE_URL, limits, true)
    }

    /// List every file currently retained in the rolling ~24h window,
    /// canonicalized to `{venue}-posttrade-{timestamp}.json.gz` names and
    /// filtered to venue trading hours.
    pub async fn list_available_files(&self, venue: &str) -> Result<Vec<String>> {
        let mut all_files = Vec::new();
        for file_type in ["posttrade"] {
            let prefix = format!("{venue}-{file_type}");
            let url = format!("{}{prefix}", self.base_url);
            tracing::debug!(%url, "requesting file list");

            let response = self
                .client
                .get(&url)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await
                .context("network error fetching file list")?;

            if response.status().as_u16() == 404 {
                tracing::debug!(venue, file_type, "no files found");
                continue;
            }
            let response = response
                .error_for_status()
                .context("HTTP error fetching file list")?;
            let listing: ListingResponse = response
                .json()
                .await
                .context("failed to decode file listing JSON")?;

            let total = listing.current_files.len();
            for filename in canonical_filenames(&prefix, &listing.source_prefix, listing.current_files)
            {
                if !self.filter_empty_files || is_within_trading_hours(&filename, venue) {
                    all_files.push(filename);
                }
            }
            tracing::info!(venue, file_type, total, "listed files");
            if self.filter_empty_files {
                tracing::info!(kept = all_files.len(), "filtered to trading hours");
            }
        }
        Ok(all_files)
    }

    /// Download one gzipped JSONL file, enforcing rate limits first.
    pub async fn download_file(
        &self,
        _venue: &str,
        _date: &str,
        filename: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let url = format!("{}download/{filename}", self.base_url);
        tracing::debug!(%url, "downloading");

        self.limiter.enforce().await;

        for attempt in 0..MAX_DOWNLOAD_RETRIES {
            let response = self.client.get(&url).send().await?;
            let status = response.status().as_u16();

            if status == 429 {
                if attempt + 1 == MAX_DOWNLOAD_RETRIES {
                    return Err(FetchError::RateLimited {
                        filename: filename.to_string(),
                        attempts: MAX_DOWNLOAD_RETRIES,
                    });
                }
                let delay = Duration::from_secs(BACKOFF_BASE_SECS * 2u64.pow(attempt));
                tracing::warn!(
                    filename,
                    attempt = attempt + 1,
                    ?delay,
                    "rate limited (429), backing off"
                );
                sleep(delay).await;
                continue;
            }

            if status == 400 {
                let body = response.text().await.unwrap_or_default();
                if body.contains("ExpiredToken") {
                    return Err(FetchError::ExpiredToken {
                        filename: filename.to_string(),
                    });
                }
                return Err(FetchError::Status {
                    filename: filename.to_string(),
                    status,
                });
            }

            if !(200..300).contains(&status) {
                return Err(FetchError::Status {
                    filename: filename.to_string(),
                    status,
                });
            }

            let bytes = response.bytes().await?;
            tracing::info!(filename, bytes = bytes.len(), "downloaded");
            return Ok(bytes.to_vec());
        }

        Err(FetchError::RateLimited {
            filename: filename.to_string(),
            attempts: MAX_DOWNLOAD_RETRIES,
        })
    }

    /// Gunzip a downloaded body into its JSONL string.
    pub fn decompress_gzip(&self, data: &[u8]) -> Result<String> {
        let mut decoder = GzDecoder::new(data);
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .context("failed to decompress gzip payload")?;
        tracing::debug!(compressed = data.len(), chars = text.len(), "decompressed");
        Ok(text)
    }
}

/// Strip the listing's `SourcePrefix` from each raw name and rebuild
/// `{venue}-{type}-{timestamp}` download names. Names that do not match the
/// expected shape pass through unchanged.
pub fn canonical_filenames(
    prefix: &str,
    source_prefix: &str,
    raw_filenames: Vec<String>,
) -> Vec<String> {
    raw_filenames
        .into_iter()
        .map(|raw| {
            if !source_prefix.is_empty() {
                if let Some(timestamp_part) = raw.strip_prefix(&format!("{source_prefix}-")) {
                    return format!("{prefix}-{timestamp_part}");
                }
            }
            raw
        })
        .collect()
}

/// Keep a file iff its UTC filename timestamp falls inside the venue's
/// Europe/Berlin trading window. Fails open: unknown venues and
/// unparseable names are kept.
pub fn is_within_trading_hours(filename: &str, venue: &str) -> bool {
    let Some((start, end)) = VENUE_TRADING_HOURS
        .iter()
        .find(|(v, _, _)| *v == venue)
        .map(|(_, start, end)| (*start, *end))
    else {
        tracing::warn!(venue, "unknown venue, no filtering applied");
        return true;
    };

    let Some(utc_dt) = filename_timestamp(filename) else {
        tracing::warn!(filename, "could not parse time from filename");
        return true;
    };

    let berlin: Tz = chrono_tz::Europe::Berlin;
    let local = Utc
        .from_utc_datetime(&utc_dt)
        .with_timezone(&berlin)
        .format("%H:%M")
        .to_string();

    let within = start <= local.as_str() && local.as_str() <= end;
    if !within {
        tracing::debug!(filename, %local, venue, start, end, "outside trading hours, skipping");
    }
    within
}

/// Parse `...-YYYY-MM-DDTHH_MM.json.gz` into a naive UTC timestamp.
pub fn filename_timestamp(filename: &str) -> Option<NaiveDateTime> {
    let (head, tail) = filename.rsplit_once('T')?;
    if head.len() < 10 {
        return None;
    }
    let date = NaiveDate::parse_from_str(&head[head.len() - 10..], "%Y-%m-%d").ok()?;
    let time_part = tail.split('.').next()?;
    let (hour, minute) = time_part.split_once('_')?;
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    date.and_hms_opt(hour, minute, 0)
}

/// The date embedded in a canonical filename.
pub fn filename_date(filename: &str) -> Option<NaiveDate> {
    filename_timestamp(filename).map(|dt| dt.date())
}

/// The `YYYY-MM-DDTHH_MM` timestamp part of a canonical filename, the unit
/// of minute-level resume bookkeeping.
pub fn filename_timestamp_part(filename: &str) -> Option<String> {
    filename_timestamp(filename).map(|dt| dt.format("%Y-%m-%dT%H_%M").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn canonical_names_strip_source_prefix() {
        let out = canonical_filenames(
            "DETR-posttrade",
            "DETR-posttrade-2025-11-02",
            vec![
                "DETR-posttrade-2025-11-02-2025-11-03T08_04.json.gz".to_string(),
                "unexpected-shape.json.gz".to_string(),
            ],
        );
        assert_eq!(
            out,
            vec![
                "DETR-posttrade-2025-11-03T08_04.json.gz".to_string(),
                "unexpected-shape.json.gz".to_string(),
            ]
        );
    }

    #[test]
    fn winter_utc_timestamps_convert_to_cet() {
        // UTC 08:00 in November = 09:00 CET, inside DETR 08:00-18:30.
        assert!(is_within_trading_hours(
            "DETR-posttrade-2025-11-03T08_00.json.gz",
            "DETR"
        ));
        // UTC 01:00 = 02:00 CET, outside.
        assert!(!is_within_trading_hours(
            "DETR-posttrade-2025-11-03T01_00.json.gz",
            "DETR"
        ));
        // UTC 17:30 = 18:30 CET, inclusive upper bound.
        assert!(is_within_trading_hours(
            "DETR-posttrade-2025-11-03T17_30.json.gz",
            "DETR"
        ));
    }

    #[test]
    fn summer_conversion_honors_dst() {
        // UTC 06:30 in July = 08:30 CEST, inside DETR hours; in winter the
        // same wall time would be 07:30 CET and outside.
        assert!(is_within_trading_hours(
            "DETR-posttrade-2025-07-03T06_30.json.gz",
            "DETR"
        ));
        assert!(!is_within_trading_hours(
            "DETR-posttrade-2025-12-03T06_30.json.gz",
            "DETR"
        ));
    }

    #[test]
    fn unknown_venue_and_garbage_names_fail_open() {
        assert!(is_within_trading_hours(
            "XNAS-posttrade-2025-11-03T01_00.json.gz",
            "XNAS"
        ));
        assert!(is_within_trading_hours("no-timestamp-here.json.gz", "DETR"));
    }

    #[test]
    fn filename_parsing() {
        assert_eq!(
            filename_date("DETR-posttrade-2025-11-04T09_00.json.gz"),
            NaiveDate::from_ymd_opt(2025, 11, 4)
        );
        assert_eq!(
            filename_timestamp_part("DETR-posttrade-2025-11-04T09_00.json.gz").as_deref(),
            Some("2025-11-04T09_00")
        );
        assert_eq!(filename_timestamp_part("garbage"), None);
    }

    #[test]
    fn gzip_round_trip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"isin\":\"X\"}\n").unwrap();
        let compressed = encoder.finish().unwrap();

        let fetcher =
            PosttradeFetcher::new(DEFAULT_BASE_URL, crate::config::TradeLimits::default(), true)
                .unwrap();
        let text = fetcher.decompress_gzip(&compressed).unwrap();
        assert_eq!(text, "{\"isin\":\"X\"}\n");

        assert!(fetcher.decompress_gzip(b"not gzip").is_err());
    }
}
