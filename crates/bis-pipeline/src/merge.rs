//! Left joins that assemble the master frame from the footprint base.

use bis_core::{has_column, BBL_COLUMN, BIN_COLUMN};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JoinKey {
    Bin,
    Bbl,
}

impl JoinKey {
    pub fn column(self) -> &'static str {
        match self {
            JoinKey::Bin => BIN_COLUMN,
            JoinKey::Bbl => BBL_COLUMN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinStepStats {
    pub label: String,
    pub key: JoinKey,
    pub matched_rows: usize,
    pub added_columns: Vec<String>,
    /// Right-side columns already present on the left; the left copy is kept.
    pub dropped_columns: Vec<String>,
    /// Right-side rows ignored because an earlier row had the same key.
    pub duplicate_keys: usize,
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("join {label}: {side} frame has no {key} column")]
    MissingKey {
        label: String,
        side: &'static str,
        key: &'static str,
    },
    #[error("master has {actual} rows but the footprint base has {expected}")]
    RowCountDrift { expected: usize, actual: usize },
    #[error(transparent)]
    Frame(#[from] PolarsError),
}

const MATCHED: &str = "_join_matched";

/// Left join on `key`. Every left row is kept exactly once; the first right row
/// per key supplies the values, so duplicates on the right never multiply rows.
pub fn left_join(
    left: &DataFrame,
    right: &DataFrame,
    key: JoinKey,
    label: &str,
) -> Result<(DataFrame, JoinStepStats), MergeError> {
    let missing = |side: &'static str| MergeError::MissingKey {
        label: label.to_string(),
        side,
        key: key.column(),
    };
    let key_name = key.column();
    if !has_column(left, key_name) {
        return Err(missing("left"));
    }
    if !has_column(right, key_name) {
        return Err(missing("right"));
    }

    let mut added_columns = Vec::new();
    let mut dropped_columns = Vec::new();
    for name in right.get_column_names() {
        if name == key_name {
            continue;
        }
        if has_column(left, name) {
            dropped_columns.push(name.to_string());
        } else {
            added_columns.push(name.to_string());
        }
    }

    let incoming = right
        .select(std::iter::once(key_name).chain(added_columns.iter().map(String::as_str)))?
        .lazy()
        .filter(col(key_name).is_not_null())
        .collect()?;
    let subset = [key_name.to_string()];
    let deduped = incoming.unique_stable(Some(&subset[..]), UniqueKeepStrategy::First, None)?;
    let duplicate_keys = incoming.height() - deduped.height();

    let joined = left
        .clone()
        .lazy()
        .join(
            deduped.lazy().with_column(lit(true).alias(MATCHED)),
            [col(key_name)],
            [col(key_name)],
            JoinArgs::new(JoinType::Left),
        )
        .collect()?;
    let matched_rows = joined.height() - joined.column(MATCHED)?.null_count();
    let merged = joined.drop(MATCHED)?;

    let stats = JoinStepStats {
        label: label.to_string(),
        key,
        matched_rows,
        added_columns,
        dropped_columns,
        duplicate_keys,
    };
    debug!(
        label,
        matched = stats.matched_rows,
        dropped = ?stats.dropped_columns,
        duplicates = stats.duplicate_keys,
        "join step complete"
    );
    Ok((merged, stats))
}

/// The three already-aggregated inputs joined onto the footprint base.
pub struct MasterInputs<'a> {
    pub base: &'a DataFrame,
    pub parcels: &'a DataFrame,
    pub permits: &'a DataFrame,
    pub sales: &'a DataFrame,
}

/// Parcels on BBL, permits on BIN, then sales on BBL. The result has exactly
/// as many rows as the base.
pub fn merge_master(
    inputs: &MasterInputs<'_>,
) -> Result<(DataFrame, Vec<JoinStepStats>), MergeError> {
    let steps = [
        ("parcels", JoinKey::Bbl, inputs.parcels),
        ("permits", JoinKey::Bin, inputs.permits),
        ("sales", JoinKey::Bbl, inputs.sales),
    ];
    let mut master = inputs.base.clone();
    let mut stats = Vec::with_capacity(steps.len());
    for (label, key, right) in steps {
        let (next, step) = left_join(&master, right, key, label)?;
        master = next;
        stats.push(step);
    }
    check_row_count(inputs.base.height(), master.height())?;
    info!(rows = master.height(), columns = master.width(), "master frame merged");
    Ok((master, stats))
}

pub fn check_row_count(expected: usize, actual: usize) -> Result<(), MergeError> {
    if expected == actual {
        Ok(())
    } else {
        Err(MergeError::RowCountDrift { expected, actual })
    }
}
