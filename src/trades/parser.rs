//! Posttrade JSONL parsing into a schema-stable frame.
//!
//! Every parse materializes the full 22-column schema regardless of which
//! optional fields the provider sent, so parquet files written from
//! different drops always line up.

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use polars::prelude::*;
use serde::Deserialize;

/// Canonical column order for trade frames.
pub const TRADE_COLUMNS: &[&str] = &[
    "message_id",
    "source_name",
    "isin",
    "instrument_id",
    "trans_id",
    "tick_id",
    "price",
    "volume",
    "currency",
    "quote_type",
    "trade_time",
    "distribution_time",
    "venue",
    "tick_action",
    "instrument_code",
    "market_mechanism",
    "trading_mode",
    "negotiated_flag",
    "modification_flag",
    "benchmark_flag",
    "pub_deferral",
    "algo_indicator",
];

pub fn trade_dtype(name: &str) -> DataType {
    match name {
        "price" | "volume" => DataType::Float64,
        "tick_id" => DataType::Int64,
        "trade_time" | "distribution_time" => DataType::Datetime(TimeUnit::Microseconds, None),
        "algo_indicator" => DataType::Boolean,
        _ => DataType::String,
    }
}

pub fn empty_trade_frame() -> DataFrame {
    let columns: Vec<Column> = TRADE_COLUMNS
        .iter()
        .map(|name| Column::new_empty((*name).into(), &trade_dtype(name)))
        .collect();
    DataFrame::new(0, columns).expect("empty schema frame is always valid")
}

/// One upstream trade record. Field names follow the provider's JSON keys;
/// everything is optional at parse time and the seven required fields are
/// validated afterwards.
#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "messageId")]
    message_id: Option<String>,
    #[serde(rename = "sourceName")]
    source_name: Option<String>,
    isin: Option<String>,
    #[serde(rename = "instrumentId")]
    instrument_id: Option<String>,
    #[serde(rename = "transIdCode")]
    trans_id: Option<String>,
    #[serde(rename = "tickId")]
    tick_id: Option<i64>,
    #[serde(rename = "lastTrade")]
    price: Option<f64>,
    #[serde(rename = "lastQty")]
    volume: Option<f64>,
    currency: Option<String>,
    #[serde(rename = "quotationType")]
    quote_type: Option<String>,
    #[serde(rename = "lastTradeTime")]
    trade_time: Option<String>,
    #[serde(rename = "distributionDateTime")]
    distribution_time: Option<String>,
    #[serde(rename = "executionVenueId")]
    venue: Option<String>,
    #[serde(rename = "tickActionIndicator")]
    tick_action: Option<String>,
    #[serde(rename = "instrumentIdCode")]
    instrument_code: Option<String>,
    #[serde(rename = "mmtMarketMechanism")]
    market_mechanism: Option<String>,
    #[serde(rename = "mmtTradingMode")]
    trading_mode: Option<String>,
    #[serde(rename = "mmtNegotTransPretrdWaivInd")]
    negotiated_flag: Option<String>,
    #[serde(rename = "mmtModificationInd")]
    modification_flag: Option<String>,
    #[serde(rename = "mmtBenchmarkRefprcInd")]
    benchmark_flag: Option<String>,
    #[serde(rename = "mmtPubModeDefReason")]
    pub_deferral: Option<String>,
    #[serde(rename = "mmtAlgoInd")]
    algo_indicator: Option<String>,
}

impl RawTrade {
    fn validate_required(&self, line_no: usize) -> Result<()> {
        let missing = [
            ("isin", self.isin.is_none()),
            ("price", self.price.is_none()),
            ("volume", self.volume.is_none()),
            ("currency", self.currency.is_none()),
            ("trade_time", self.trade_time.is_none()),
            ("trans_id", self.trans_id.is_none()),
            ("tick_id", self.tick_id.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect::<Vec<_>>();
        if !missing.is_empty() {
            bail!(
                "missing required fields in trade record on line {line_no}: {}",
                missing.join(", ")
            );
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct TradeParser;

impl TradeParser {
    /// Parse JSONL (one trade object per line) into the canonical frame.
    pub fn parse(&self, jsonl: &str) -> Result<DataFrame> {
        let mut trades: Vec<RawTrade> = Vec::new();
        for (idx, line) in jsonl.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let trade: RawTrade = serde_json::from_str(line)
                .with_context(|| format!("malformed trade JSON on line {}", idx + 1))?;
            trade.validate_required(idx + 1)?;
            trades.push(trade);
        }

        if trades.is_empty() {
            tracing::warn!("parsed empty trade array from JSON");
            return Ok(empty_trade_frame());
        }
        tracing::debug!(records = trades.len(), "parsed trade records");

        let n = trades.len();
        let trade_times = trades
            .iter()
            .map(|t| t.trade_time.as_deref().map(parse_event_timestamp).transpose())
            .collect::<Result<Vec<Option<NaiveDateTime>>>>()?;
        let distribution_times = trades
            .iter()
            .map(|t| {
                t.distribution_time
                    .as_deref()
                    .map(parse_event_timestamp)
                    .transpose()
            })
            .collect::<Result<Vec<Option<NaiveDateTime>>>>()?;

        let string_col = |name: &str, get: fn(&RawTrade) -> Option<&str>| -> Column {
            let values: Vec<Option<&str>> = trades.iter().map(get).collect();
            Column::new(name.into(), values)
        };

        let columns = vec![
            string_col("message_id", |t| t.message_id.as_deref()),
            string_col("source_name", |t| t.source_name.as_deref()),
            string_col("isin", |t| t.isin.as_deref()),
            string_col("instrument_id", |t| t.instrument_id.as_deref()),
            string_col("trans_id", |t| t.trans_id.as_deref()),
            Column::new(
                "tick_id".into(),
                trades.iter().map(|t| t.tick_id).collect::<Vec<_>>(),
            ),
            Column::new(
                "price".into(),
                trades.iter().map(|t| t.price).collect::<Vec<_>>(),
            ),
            Column::new(
                "volume".into(),
                trades.iter().map(|t| t.volume).collect::<Vec<_>>(),
            ),
            string_col("currency", |t| t.currency.as_deref()),
            string_col("quote_type", |t| t.quote_type.as_deref()),
            Column::new("trade_time".into(), trade_times),
            Column::new("distribution_time".into(), distribution_times),
            string_col("venue", |t| t.venue.as_deref()),
            string_col("tick_action", |t| t.tick_action.as_deref()),
            string_col("instrument_code", |t| t.instrument_code.as_deref()),
            string_col("market_mechanism", |t| t.market_mechanism.as_deref()),
            string_col("trading_mode", |t| t.trading_mode.as_deref()),
            string_col("negotiated_flag", |t| t.negotiated_flag.as_deref()),
            string_col("modification_flag", |t| t.modification_flag.as_deref()),
            string_col("benchmark_flag", |t| t.benchmark_flag.as_deref()),
            string_col("pub_deferral", |t| t.pub_deferral.as_deref()),
            Column::new(
                "algo_indicator".into(),
                trades
                    .iter()
                    .map(|t| t.algo_indicator.as_deref().map(|v| v == "H"))
                    .collect::<Vec<Option<bool>>>(),
            ),
        ];

        let df = DataFrame::new(n, columns).context("failed to build trade frame")?;
        // Microsecond columns and canonical order are already guaranteed by
        // construction; cast defensively so downstream parquet schemas stay
        // identical across drops.
        let casts: Vec<Expr> = TRADE_COLUMNS
            .iter()
            .map(|name| col(*name).cast(trade_dtype(name)).alias(*name))
            .collect();
        let selection: Vec<Expr> = TRADE_COLUMNS.iter().map(|name| col(*name)).collect();
        let df = df
            .lazy()
            .with_columns(casts)
            .select(selection)
            .collect()
            .context("failed to normalize trade frame")?;

        tracing::debug!(rows = df.height(), columns = df.width(), "parsed trades");
        Ok(df)
    }
}

/// Parse the provider's nanosecond-precision ISO-8601 timestamps (trailing
/// `Z`) into timezone-naive UTC.
fn parse_event_timestamp(value: &str) -> Result<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Ok(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .with_context(|| format!("unparseable trade timestamp: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_LINE: &str = r#"{"messageId":"1","sourceName":"XETR","isin":"DE0007100000","instrumentId":"710000","transIdCode":"T1","tickId":42,"lastTrade":56.2,"lastQty":100.0,"currency":"EUR","quotationType":"U","lastTradeTime":"2025-11-03T08:30:00.123456789Z","distributionDateTime":"2025-11-03T08:30:00.223456789Z","executionVenueId":"DETR","tickActionIndicator":"A","instrumentIdCode":"I","mmtMarketMechanism":"1","mmtTradingMode":"2","mmtNegotTransPretrdWaivInd":"-","mmtModificationInd":"-","mmtBenchmarkRefprcInd":"-","mmtPubModeDefReason":"-","mmtAlgoInd":"H"}"#;

    #[test]
    fn parses_full_record_with_stable_schema() {
        let df = TradeParser.parse(FULL_LINE).unwrap();
        assert_eq!(df.height(), 1);
        assert_eq!(df.get_column_names().iter().map(|s| s.as_str()).collect::<Vec<_>>(), TRADE_COLUMNS.to_vec());
        assert_eq!(
            *df.column("price").unwrap().dtype(),
            DataType::Float64
        );
        assert_eq!(*df.column("tick_id").unwrap().dtype(), DataType::Int64);
        assert!(matches!(
            df.column("trade_time").unwrap().dtype(),
            DataType::Datetime(_, _)
        ));
        let algo = df.column("algo_indicator").unwrap().bool().unwrap().get(0);
        assert_eq!(algo, Some(true));
    }

    #[test]
    fn missing_optional_fields_become_nulls() {
        let line = r#"{"isin":"DE0007100000","transIdCode":"T1","tickId":1,"lastTrade":1.0,"lastQty":2.0,"currency":"EUR","lastTradeTime":"2025-11-03T08:30:00Z"}"#;
        let df = TradeParser.parse(line).unwrap();
        assert_eq!(df.width(), TRADE_COLUMNS.len());
        assert_eq!(df.column("message_id").unwrap().null_count(), 1);
        assert_eq!(df.column("algo_indicator").unwrap().null_count(), 1);
        assert_eq!(df.column("distribution_time").unwrap().null_count(), 1);
    }

    #[test]
    fn non_h_algo_indicator_is_false() {
        let line = r#"{"isin":"X","transIdCode":"T","tickId":1,"lastTrade":1.0,"lastQty":1.0,"currency":"EUR","lastTradeTime":"2025-11-03T08:30:00Z","mmtAlgoInd":"N"}"#;
        let df = TradeParser.parse(line).unwrap();
        let algo = df.column("algo_indicator").unwrap().bool().unwrap().get(0);
        assert_eq!(algo, Some(false));
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let line = r#"{"transIdCode":"T1","tickId":1,"lastTrade":1.0,"lastQty":2.0,"currency":"EUR","lastTradeTime":"2025-11-03T08:30:00Z"}"#;
        let err = TradeParser.parse(line).unwrap_err();
        assert!(err.to_string().contains("isin"));
    }

    #[test]
    fn blank_lines_are_skipped_and_empty_input_yields_schema_frame() {
        let df = TradeParser.parse("\n  \n").unwrap();
        assert_eq!(df.height(), 0);
        assert_eq!(df.get_column_names().iter().map(|s| s.as_str()).collect::<Vec<_>>(), TRADE_COLUMNS.to_vec());
    }

    #[test]
    fn multiline_input_parses_every_line() {
        let two = format!("{FULL_LINE}\n{FULL_LINE}\n");
        let df = TradeParser.parse(&two).unwrap();
        assert_eq!(df.height(), 2);
    }

    #[test]
    fn nanosecond_timestamps_truncate_to_naive_utc() {
        let df = TradeParser.parse(FULL_LINE).unwrap();
        let times: Vec<NaiveDateTime> = df
            .column("trade_time")
            .unwrap()
            .datetime()
            .unwrap()
            .as_datetime_iter()
            .flatten()
            .collect();
        assert_eq!(times.len(), 1);
        assert_eq!(times[0].format("%Y-%m-%d %H:%M:%S").to_string(), "2025-11-03 08:30:00");
    }
}
