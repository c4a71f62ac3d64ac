#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime};
use parqed::config::ConfigService;
use parqed::storage::frame::normalize_price_frame;
use polars::prelude::*;
use std::path::PathBuf;

pub fn dt(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

pub fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Canonical-schema price frame from `(stock, date, close, sequence)` rows;
/// open/high/low mirror the close, volume is fixed.
pub fn price_frame(rows: &[(&str, NaiveDateTime, f64, Option<i64>)]) -> DataFrame {
    let stocks: Vec<&str> = rows.iter().map(|r| r.0).collect();
    let dates: Vec<NaiveDateTime> = rows.iter().map(|r| r.1).collect();
    let closes: Vec<f64> = rows.iter().map(|r| r.2).collect();
    let sequences: Vec<Option<i64>> = rows.iter().map(|r| r.3).collect();
    let df = df! {
        "stock" => &stocks,
        "date" => &dates,
        "open" => &closes,
        "high" => &closes,
        "low" => &closes,
        "close" => &closes,
        "volume" => &vec![Some(100i64); rows.len()],
        "sequence" => &sequences,
    }
    .unwrap();
    normalize_price_frame(df).unwrap()
}

/// Write a legacy ticker file under `data/legacy/stocks_{interval}/`.
pub fn write_legacy_file(
    config: &ConfigService,
    interval: &str,
    ticker: &str,
    mut frame: DataFrame,
) -> PathBuf {
    let path = config
        .legacy_root()
        .join(format!("stocks_{interval}"))
        .join(format!("{ticker}.parquet"));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = std::fs::File::create(&path).unwrap();
    ParquetWriter::new(file)
        .with_compression(ParquetCompression::Gzip(None))
        .finish(&mut frame)
        .unwrap();
    path
}

/// Minimal trade frame: one row per (isin, trade_time) pair.
pub fn trade_frame(rows: &[(&str, NaiveDateTime, f64)]) -> DataFrame {
    let isins: Vec<&str> = rows.iter().map(|r| r.0).collect();
    let times: Vec<NaiveDateTime> = rows.iter().map(|r| r.1).collect();
    let prices: Vec<f64> = rows.iter().map(|r| r.2).collect();
    df! {
        "isin" => &isins,
        "trade_time" => &times,
        "price" => &prices,
        "volume" => &vec![100.0; rows.len()],
        "currency" => &vec!["EUR"; rows.len()],
    }
    .unwrap()
}
