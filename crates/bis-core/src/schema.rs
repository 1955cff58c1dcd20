//! Per-source identifier mapping and the identifier normalizer.
//!
//! Every source declares which of its columns carry the BIN and/or BBL. The
//! mapping is checked against the fetched frame before any row is touched, so a
//! renamed upstream field fails the run with the column name instead of
//! silently producing an empty join.

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{find_column, text_cells, text_series};
use crate::ident::{Bbl, Bin};

pub const BIN_COLUMN: &str = "BIN";
pub const BBL_COLUMN: &str = "BBL";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSchema {
    #[serde(default)]
    pub bin: Option<String>,
    #[serde(default)]
    pub bbl: Option<BblMapping>,
    /// Explode comma-separated BBL lists into one row per BBL.
    #[serde(default)]
    pub split_bbl_lists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BblMapping {
    Column {
        column: String,
    },
    Parts {
        borough: String,
        block: String,
        lot: String,
    },
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("source {source_id}: mapped column `{column}` not found; available columns: {available}")]
    MissingColumn {
        source_id: String,
        column: String,
        available: String,
    },
    #[error("source {source_id}: schema maps neither a BIN nor a BBL column")]
    NoIdentifier { source_id: String },
    #[error(transparent)]
    Frame(#[from] PolarsError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeStats {
    pub input_rows: usize,
    pub output_rows: usize,
    pub rejected_bin: usize,
    pub rejected_bbl: usize,
}

impl NormalizeStats {
    pub fn rejected(&self) -> usize {
        self.rejected_bin + self.rejected_bbl
    }
}

#[derive(Debug, Clone)]
enum ResolvedBbl {
    Column(String),
    Parts {
        borough: String,
        block: String,
        lot: String,
    },
}

#[derive(Debug, Clone)]
struct ResolvedSchema {
    bin: Option<String>,
    bbl: Option<ResolvedBbl>,
}

impl SourceSchema {
    pub fn maps_bin(&self) -> bool {
        self.bin.is_some()
    }

    pub fn maps_bbl(&self) -> bool {
        self.bbl.is_some()
    }

    /// Checks every mapped column against the frame header.
    pub fn validate(&self, source_id: &str, frame: &DataFrame) -> Result<(), SchemaError> {
        self.resolve(source_id, frame).map(|_| ())
    }

    /// Mapped columns are looked up first. A frame that already carries the
    /// canonical `BIN`/`BBL` column (a previously normalized export reused as a
    /// backup CSV) resolves to that column instead.
    fn resolve(&self, source_id: &str, frame: &DataFrame) -> Result<ResolvedSchema, SchemaError> {
        if self.bin.is_none() && self.bbl.is_none() {
            return Err(SchemaError::NoIdentifier {
                source_id: source_id.to_string(),
            });
        }
        let missing = |column: &str| SchemaError::MissingColumn {
            source_id: source_id.to_string(),
            column: column.to_string(),
            available: frame.get_column_names().join(", "),
        };
        let canonical = |name: &str| find_column(frame, name);

        let bin = match self.bin.as_deref() {
            None => None,
            Some(column) => Some(
                find_column(frame, column)
                    .or_else(|| canonical(BIN_COLUMN))
                    .ok_or_else(|| missing(column))?,
            ),
        };
        let bbl = match &self.bbl {
            None => None,
            Some(BblMapping::Column { column }) => Some(ResolvedBbl::Column(
                find_column(frame, column)
                    .or_else(|| canonical(BBL_COLUMN))
                    .ok_or_else(|| missing(column))?,
            )),
            Some(BblMapping::Parts {
                borough,
                block,
                lot,
            }) => {
                let parts = (
                    find_column(frame, borough),
                    find_column(frame, block),
                    find_column(frame, lot),
                );
                match parts {
                    (Some(borough), Some(block), Some(lot)) => Some(ResolvedBbl::Parts {
                        borough,
                        block,
                        lot,
                    }),
                    (borough_col, block_col, _) => match canonical(BBL_COLUMN) {
                        Some(column) => Some(ResolvedBbl::Column(column)),
                        None if borough_col.is_none() => return Err(missing(borough)),
                        None if block_col.is_none() => return Err(missing(block)),
                        None => return Err(missing(lot)),
                    },
                }
            }
        };
        Ok(ResolvedSchema { bin, bbl })
    }
}

/// Produces canonical `BIN`/`BBL` columns (placed first) from a source frame.
///
/// Rows whose mapped identifiers fail to normalize are dropped and counted;
/// only a schema that does not match the frame header is an error.
pub fn normalize_identifiers(
    source_id: &str,
    frame: &DataFrame,
    schema: &SourceSchema,
) -> Result<(DataFrame, NormalizeStats), SchemaError> {
    let resolved = schema.resolve(source_id, frame)?;

    let mut consumed: Vec<&str> = Vec::new();
    if let Some(column) = &resolved.bin {
        consumed.push(column);
    }
    if let Some(ResolvedBbl::Column(column)) = &resolved.bbl {
        consumed.push(column);
    }
    let names = frame.get_column_names();
    for name in &names {
        let replaces_bin = resolved.bin.is_some() && name.eq_ignore_ascii_case(BIN_COLUMN);
        let replaces_bbl = resolved.bbl.is_some() && name.eq_ignore_ascii_case(BBL_COLUMN);
        if replaces_bin || replaces_bbl {
            consumed.push(name);
        }
    }
    let kept: Vec<&str> = names
        .iter()
        .copied()
        .filter(|name| !consumed.contains(name))
        .collect();

    let bin_cells = resolved
        .bin
        .as_deref()
        .map(|column| text_cells(frame, column))
        .transpose()?;
    let bbl_cells = match &resolved.bbl {
        None => None,
        Some(ResolvedBbl::Column(column)) => Some((text_cells(frame, column)?, None)),
        Some(ResolvedBbl::Parts {
            borough,
            block,
            lot,
        }) => Some((
            text_cells(frame, borough)?,
            Some((text_cells(frame, block)?, text_cells(frame, lot)?)),
        )),
    };

    let mut stats = NormalizeStats {
        input_rows: frame.height(),
        ..Default::default()
    };
    let mut rows: Vec<IdxSize> = Vec::with_capacity(frame.height());
    let mut bins: Vec<Option<String>> = Vec::with_capacity(frame.height());
    let mut bbls: Vec<Option<String>> = Vec::with_capacity(frame.height());

    for row in 0..frame.height() {
        let bin = match &bin_cells {
            Some(cells) => match cells[row].as_deref().and_then(Bin::parse) {
                Some(bin) => Some(bin),
                None => {
                    stats.rejected_bin += 1;
                    continue;
                }
            },
            None => None,
        };

        let parsed: Vec<Option<Bbl>> = match &bbl_cells {
            None => vec![None],
            Some((cells, None)) => {
                let raw = cells[row].as_deref().unwrap_or_default();
                if schema.split_bbl_lists {
                    raw.split(',').filter_map(Bbl::parse).map(Some).collect()
                } else {
                    Bbl::parse(raw).map(Some).into_iter().collect()
                }
            }
            Some((boroughs, Some((blocks, lots)))) => {
                match (&boroughs[row], &blocks[row], &lots[row]) {
                    (Some(b), Some(bl), Some(l)) => {
                        Bbl::from_parts(b, bl, l).map(Some).into_iter().collect()
                    }
                    _ => Vec::new(),
                }
            }
        };
        if parsed.is_empty() {
            stats.rejected_bbl += 1;
            continue;
        }

        for bbl in parsed {
            rows.push(row as IdxSize);
            bins.push(bin.as_ref().map(|b| b.as_str().to_string()));
            bbls.push(bbl.map(|b| b.as_str().to_string()));
        }
    }

    let rest = frame
        .select(kept.iter().copied())?
        .take(&IdxCa::from_vec("row", rows))?;
    let mut columns = Vec::with_capacity(kept.len() + 2);
    if resolved.bin.is_some() {
        columns.push(text_series(BIN_COLUMN, bins));
    }
    if resolved.bbl.is_some() {
        columns.push(text_series(BBL_COLUMN, bbls));
    }
    columns.extend(rest.get_columns().iter().cloned());

    let out = DataFrame::new(columns)?;
    stats.output_rows = out.height();
    Ok((out, stats))
}
