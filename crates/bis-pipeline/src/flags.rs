use bis_core::{find_column, parse_date, text_cells};
use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::aggregate::default_sale_date_column;

pub const DAYS_TO_PERMIT: &str = "days_to_permit";
pub const RENOVATION_AFTER_SALE: &str = "renovation_after_sale";
pub const OFF_MARKET_CANDIDATE: &str = "off_market_candidate";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFlagConfig {
    #[serde(default = "default_sale_date_column")]
    pub sale_date_column: String,
    #[serde(default = "default_issuance_date_column")]
    pub issuance_date_column: String,
    #[serde(default = "default_window_days")]
    pub renovation_window_days: i64,
    #[serde(default = "default_off_market_cutoff")]
    pub off_market_cutoff: NaiveDate,
}

impl Default for DerivedFlagConfig {
    fn default() -> Self {
        Self {
            sale_date_column: default_sale_date_column(),
            issuance_date_column: default_issuance_date_column(),
            renovation_window_days: default_window_days(),
            off_market_cutoff: default_off_market_cutoff(),
        }
    }
}

fn default_issuance_date_column() -> String {
    "issuance_date".to_string()
}

fn default_window_days() -> i64 {
    365
}

fn default_off_market_cutoff() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 1).unwrap_or(NaiveDate::MIN)
}

pub fn days_to_permit(sale: Option<NaiveDate>, issuance: Option<NaiveDate>) -> Option<i64> {
    Some((issuance? - sale?).num_days())
}

pub fn renovation_after_sale(days: Option<i64>, window_days: i64) -> bool {
    days.is_some_and(|d| (0..=window_days).contains(&d))
}

/// A recent sale with no permit on record.
pub fn off_market_candidate(
    sale: Option<NaiveDate>,
    issuance: Option<NaiveDate>,
    cutoff: NaiveDate,
) -> bool {
    issuance.is_none() && sale.is_some_and(|d| d >= cutoff)
}

pub(crate) fn dates_in(frame: &DataFrame, column: &str) -> PolarsResult<Vec<Option<NaiveDate>>> {
    match find_column(frame, column) {
        Some(found) => Ok(text_cells(frame, &found)?
            .iter()
            .map(|v| v.as_deref().and_then(parse_date))
            .collect()),
        None => Ok(vec![None; frame.height()]),
    }
}

/// Appends (or replaces) the three derived columns. Row-local; order of rows is untouched.
/// `days_to_permit` is an integer column and both flags are boolean columns.
pub fn apply_derived_flags(frame: &DataFrame, config: &DerivedFlagConfig) -> PolarsResult<DataFrame> {
    let sales = dates_in(frame, &config.sale_date_column)?;
    let permits = dates_in(frame, &config.issuance_date_column)?;

    let mut days_col: Vec<Option<i64>> = Vec::with_capacity(frame.height());
    let mut renovated_col: Vec<bool> = Vec::with_capacity(frame.height());
    let mut off_market_col: Vec<bool> = Vec::with_capacity(frame.height());
    for (sale, issuance) in sales.into_iter().zip(permits) {
        let days = days_to_permit(sale, issuance);
        days_col.push(days);
        renovated_col.push(renovation_after_sale(days, config.renovation_window_days));
        off_market_col.push(off_market_candidate(sale, issuance, config.off_market_cutoff));
    }

    let mut out = frame.clone();
    out.with_column(Series::new(DAYS_TO_PERMIT, days_col))?;
    out.with_column(Series::new(RENOVATION_AFTER_SALE, renovated_col))?;
    out.with_column(Series::new(OFF_MARKET_CANDIDATE, off_market_col))?;
    Ok(out)
}
