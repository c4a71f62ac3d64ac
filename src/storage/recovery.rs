//! Parquet read recovery shared by both storage backends.
//!
//! Only truly unreadable files are deleted. Files with schema issues are
//! preserved for operator inspection and surface a typed error instead.

use polars::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 2000-01-01T00:00:00Z in nanoseconds since the Unix epoch. Integer values
/// at or beyond this look like encoded timestamps and are never promoted to
/// `sequence`.
const EPOCH_2000_NS: f64 = 946_684_800_000_000_000.0;

/// Column name pandas gives an unnamed index when writing parquet. Legacy
/// files carry their old row index under this name.
const PANDAS_INDEX_COL: &str = "__index_level_0__";

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("parquet file {path} is corrupt and unreadable ({reason}); file has been deleted")]
    CorruptDeleted { path: PathBuf, reason: String },

    #[error("parquet file {path} contains no data; file preserved for operator inspection")]
    PreservedEmpty { path: PathBuf },

    #[error("parquet file {path} is missing required columns {missing:?}; file preserved for operator inspection")]
    PreservedSchemaMismatch { path: PathBuf, missing: Vec<String> },

    #[error("parquet file {path} normalization failed ({reason}); file preserved for operator inspection")]
    PreservedNormalizeFailed { path: PathBuf, reason: String },
}

/// Read a parquet file with the recovery matrix applied.
///
/// 1. Unreadable file: delete it, surface [`RecoveryError::CorruptDeleted`].
/// 2. Decodes but empty: preserve, surface [`RecoveryError::PreservedEmpty`].
/// 3. Missing required columns: attempt index/column promotion; preserve and
///    surface [`RecoveryError::PreservedSchemaMismatch`] when that fails.
/// 4. Normalizer failure: preserve, surface
///    [`RecoveryError::PreservedNormalizeFailed`].
pub fn safe_read_parquet(
    path: &Path,
    required_columns: &[&str],
    normalizer: impl Fn(DataFrame) -> anyhow::Result<DataFrame>,
) -> Result<DataFrame, RecoveryError> {
    let df = match read_parquet(path) {
        Ok(df) => df,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "unable to read parquet file, deleting corrupt file");
            remove_file_best_effort(path);
            return Err(RecoveryError::CorruptDeleted {
                path: path.to_path_buf(),
                reason: err.to_string(),
            });
        }
    };

    if df.height() == 0 {
        tracing::warn!(path = %path.display(), "read empty frame, file preserved");
        return Err(RecoveryError::PreservedEmpty {
            path: path.to_path_buf(),
        });
    }

    let df = if missing_columns(&df, required_columns).is_empty() {
        df
    } else {
        tracing::debug!(path = %path.display(), "missing columns, attempting recovery");
        let recovered = attempt_column_recovery(df, path);
        let missing = missing_columns(&recovered, required_columns);
        if !missing.is_empty() {
            tracing::warn!(path = %path.display(), ?missing, "cannot recover, file preserved");
            return Err(RecoveryError::PreservedSchemaMismatch {
                path: path.to_path_buf(),
                missing,
            });
        }
        recovered
    };

    normalizer(df).map_err(|err| {
        tracing::warn!(path = %path.display(), %err, "normalization failed, file preserved");
        RecoveryError::PreservedNormalizeFailed {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    })
}

fn read_parquet(path: &Path) -> anyhow::Result<DataFrame> {
    let file = std::fs::File::open(path)?;
    Ok(ParquetReader::new(file).finish()?)
}

fn missing_columns(df: &DataFrame, required: &[&str]) -> Vec<String> {
    let schema = df.schema();
    required
        .iter()
        .filter(|name| !schema.contains(name))
        .map(|name| (*name).to_string())
        .collect()
}

/// Recovery strategies, in order:
/// 1. Promote the pandas row index (`__index_level_0__`) to `sequence` when
///    it is integral, non-null, and not an integer-encoded timestamp.
/// 2. Promote a column literally named `index` under the same test.
///
/// A datetime-typed `index` column short-circuits strategy 1 so strategy 2
/// can reject it.
fn attempt_column_recovery(mut df: DataFrame, path: &Path) -> DataFrame {
    let mut promoted = false;
    let schema = df.schema().clone();

    if !schema.contains("sequence") && schema.contains(PANDAS_INDEX_COL) {
        let index_is_datetime = df
            .column("index")
            .is_ok_and(|c| matches!(c.dtype(), DataType::Datetime(_, _) | DataType::Date));
        if index_is_datetime {
            tracing::debug!(path = %path.display(), "skipping index promotion: 'index' column has datetime dtype");
        } else if df
            .column(PANDAS_INDEX_COL)
            .is_ok_and(promotable_to_sequence)
        {
            if df.rename(PANDAS_INDEX_COL, "sequence".into()).is_ok() {
                promoted = true;
                tracing::debug!(path = %path.display(), "promoted row index to sequence");
            }
        }
    }

    if !promoted
        && df.schema().contains("index")
        && !df.schema().contains("sequence")
        && df.column("index").is_ok_and(promotable_to_sequence)
    {
        if df.rename("index", "sequence".into()).is_ok() {
            tracing::debug!(path = %path.display(), "promoted 'index' column to sequence");
        }
    }

    df
}

/// Conservative promotion test: integral numeric values, no nulls, and not
/// datetime-like (neither by dtype nor by epoch-range heuristic).
fn promotable_to_sequence(column: &Column) -> bool {
    if matches!(column.dtype(), DataType::Date | DataType::Datetime(_, _)) {
        return false;
    }
    let Ok(floats) = column.cast(&DataType::Float64) else {
        return false;
    };
    let Ok(values) = floats.f64() else {
        return false;
    };
    if values.null_count() > 0 || values.is_empty() {
        return false;
    }
    let mut epoch_like = true;
    for value in values.into_no_null_iter() {
        if value.fract() != 0.0 {
            return false;
        }
        if value < EPOCH_2000_NS {
            epoch_like = false;
        }
    }
    !epoch_like
}

fn remove_file_best_effort(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), %err, "failed to remove file");
        }
    }
}
