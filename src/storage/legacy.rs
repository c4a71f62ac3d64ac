//! Legacy one-file-per-ticker store: `{root}/stocks_{interval}/{ticker}.parquet`.
//!
//! Pre-migration data lives here. Reads tolerate the recovery matrix by
//! degrading to an empty frame; the migration coordinator relies on that.

use anyhow::{Context, Result};
use polars::prelude::*;

use super::frame::{empty_price_frame, merge_and_dedupe, normalize_price_frame, PRICE_COLUMNS};
use super::recovery::safe_read_parquet;
use super::StorageRequest;

#[derive(Debug, Default, Clone)]
pub struct LegacyStore;

impl LegacyStore {
    pub fn read(&self, request: &StorageRequest) -> Result<DataFrame> {
        let path = request.legacy_path();
        if !path.is_file() {
            return Ok(empty_price_frame());
        }
        match safe_read_parquet(&path, PRICE_COLUMNS, normalize_price_frame) {
            Ok(df) => Ok(df),
            Err(err) => {
                // File is either deleted (corrupt) or preserved (schema issue).
                tracing::error!(path = %path.display(), %err, "failed to read legacy file");
                Ok(empty_price_frame())
            }
        }
    }

    pub fn save(
        &self,
        request: &StorageRequest,
        new_data: DataFrame,
        existing_data: DataFrame,
    ) -> Result<DataFrame> {
        if new_data.height() == 0 && existing_data.height() == 0 {
            return Ok(empty_price_frame());
        }
        if new_data.height() == 0 {
            tracing::debug!("new data empty, nothing to do");
            return Ok(existing_data);
        }

        let mut combined = merge_and_dedupe(vec![existing_data, new_data])?;

        let path = request.legacy_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = std::fs::File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        ParquetWriter::new(file)
            .with_compression(ParquetCompression::Gzip(None))
            .finish(&mut combined)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(combined)
    }
}
