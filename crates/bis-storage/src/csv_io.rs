//! CSV encoding for frames. Master files are only ever replaced atomically.

use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use bis_core::blank_to_null;
use polars::prelude::*;
use tokio::fs;

use crate::artifact::{write_atomic, WriteMode};

/// Reads every column as text; schema inference is disabled so identifiers
/// such as `0012345` keep their leading zeros.
pub fn frame_from_csv_bytes(bytes: &[u8]) -> Result<DataFrame> {
    let mut frame = CsvReader::new(Cursor::new(bytes))
        .has_header(true)
        .infer_schema(Some(0))
        .finish()
        .context("parsing csv")?;

    let renames: Vec<(String, String)> = frame
        .get_column_names()
        .iter()
        .filter(|name| name.trim() != **name)
        .map(|name| (name.to_string(), name.trim().to_string()))
        .collect();
    for (old, new) in renames {
        frame
            .rename(&old, &new)
            .with_context(|| format!("trimming csv header `{old}`"))?;
    }
    blank_to_null(frame).context("clearing blank csv cells")
}

pub fn frame_to_csv_bytes(frame: &DataFrame) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut frame = frame.clone();
    CsvWriter::new(&mut buf)
        .include_header(true)
        .finish(&mut frame)
        .context("encoding csv")?;
    Ok(buf)
}

pub async fn read_frame_csv(path: impl AsRef<Path>) -> Result<DataFrame> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    frame_from_csv_bytes(&bytes).with_context(|| format!("parsing {}", path.display()))
}

/// Encodes the whole frame first, then swaps it into place, so a failure never
/// leaves a truncated file behind.
pub async fn write_frame_csv(path: impl AsRef<Path>, frame: &DataFrame) -> Result<()> {
    let path = path.as_ref();
    let bytes = frame_to_csv_bytes(frame)?;
    write_atomic(path, &bytes, WriteMode::Replace)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
