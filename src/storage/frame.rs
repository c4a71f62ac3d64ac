//! Canonical OHLCV frame: schema, normalization, and deterministic
//! merge/dedup shared by both storage backends.

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDateTime};
use polars::prelude::*;

/// Canonical column order for price frames.
pub const PRICE_COLUMNS: &[&str] = &[
    "stock", "date", "open", "high", "low", "close", "volume", "sequence",
];

/// Dedup key; on duplicates the highest `sequence` wins.
pub const PRICE_KEY: &[&str] = &["stock", "date"];

pub fn price_dtype(name: &str) -> DataType {
    match name {
        "stock" => DataType::String,
        "date" => DataType::Datetime(TimeUnit::Microseconds, None),
        "open" | "high" | "low" | "close" => DataType::Float64,
        _ => DataType::Int64,
    }
}

pub fn empty_price_frame() -> DataFrame {
    let columns: Vec<Column> = PRICE_COLUMNS
        .iter()
        .map(|name| Column::new_empty((*name).into(), &price_dtype(name)))
        .collect();
    DataFrame::new(0, columns).expect("empty schema frame is always valid")
}

/// Coerce a frame onto the canonical schema: add missing columns as typed
/// nulls, cast everything to the canonical dtypes, and project to the
/// canonical column order.
pub fn normalize_price_frame(df: DataFrame) -> Result<DataFrame> {
    if df.height() == 0 {
        return Ok(empty_price_frame());
    }
    let schema = df.schema().clone();
    let mut lf = df.lazy();
    for name in PRICE_COLUMNS {
        if !schema.contains(name) {
            lf = lf.with_column(lit(NULL).cast(price_dtype(name)).alias(*name));
        }
    }
    let casts: Vec<Expr> = PRICE_COLUMNS
        .iter()
        .map(|name| col(*name).cast(price_dtype(name)).alias(*name))
        .collect();
    let selection: Vec<Expr> = PRICE_COLUMNS.iter().map(|name| col(*name)).collect();
    lf.with_columns(casts)
        .select(selection)
        .collect()
        .context("failed to normalize price frame")
}

/// Concatenate, normalize, and deduplicate on `(stock, date)`.
///
/// Rows are stably sorted by `(stock, date, sequence)` with nulls first, so
/// keep-last retains the highest sequence and breaks ties by last-read
/// order. The result comes back sorted by `(stock, date)`.
pub fn merge_and_dedupe(frames: Vec<DataFrame>) -> Result<DataFrame> {
    let frames: Vec<DataFrame> = frames.into_iter().filter(|df| df.height() > 0).collect();
    if frames.is_empty() {
        return Ok(empty_price_frame());
    }
    let combined = concat(
        frames.into_iter().map(IntoLazy::lazy).collect::<Vec<_>>(),
        UnionArgs {
            rechunk: true,
            to_supertypes: true,
            diagonal: true,
            ..Default::default()
        },
    )?
    .collect()?;

    let normalized = normalize_price_frame(combined)?;
    let sorted = normalized.sort(
        ["stock", "date", "sequence"],
        SortMultipleOptions::default().with_maintain_order(true),
    )?;
    let subset: Vec<String> = PRICE_KEY.iter().map(|s| (*s).to_string()).collect();
    let deduped = sorted.unique_stable(Some(&subset), UniqueKeepStrategy::Last, None)?;
    Ok(deduped.sort(
        ["stock", "date"],
        SortMultipleOptions::default().with_maintain_order(true),
    )?)
}

/// Distinct tickers present in the `stock` column.
pub fn distinct_tickers(df: &DataFrame) -> Result<Vec<String>> {
    let ca = df.column("stock")?.str()?;
    let mut tickers: Vec<String> = ca.into_iter().flatten().map(str::to_string).collect();
    tickers.sort_unstable();
    tickers.dedup();
    Ok(tickers)
}

/// Timestamps of the `date` column as naive datetimes (nulls skipped).
pub fn date_values(df: &DataFrame) -> Result<Vec<NaiveDateTime>> {
    let ca = df.column("date")?.datetime()?;
    Ok(ca.as_datetime_iter().flatten().collect())
}

pub fn max_date(df: &DataFrame) -> Result<Option<NaiveDateTime>> {
    Ok(date_values(df)?.into_iter().max())
}

/// Distinct `(year, month)` pairs present in the `date` column, ascending.
pub fn distinct_months(df: &DataFrame) -> Result<Vec<(i32, u32)>> {
    let mut months: Vec<(i32, u32)> = date_values(df)?
        .into_iter()
        .map(|dt| (dt.year(), dt.month()))
        .collect();
    months.sort_unstable();
    months.dedup();
    Ok(months)
}

/// Rows of `df` whose `date` falls in the given calendar month.
pub fn filter_month(df: &DataFrame, year: i32, month: u32) -> Result<DataFrame> {
    let ca = df.column("date")?.datetime()?;
    let mask: BooleanChunked = ca
        .as_datetime_iter()
        .map(|value| {
            value.is_some_and(|dt| dt.year() == year && dt.month() == month)
        })
        .collect();
    Ok(df.filter(&mask)?)
}
