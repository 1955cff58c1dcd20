//! One-row-per-key summaries of the many-row sources (permits per BIN, sales per BBL).
//!
//! A missing aggregation column never fails the run: the aggregate degrades to a
//! key-only frame and the merge carries nulls for that source.

use bis_core::{
    find_column, format_date, has_column, non_empty, parse_amount, parse_date, text_cells,
    text_series, BBL_COLUMN, BIN_COLUMN,
};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermitAggregateConfig {
    #[serde(default = "default_job_column")]
    pub job_column: String,
    #[serde(default = "default_permits_output")]
    pub output_column: String,
    /// Carried as the latest parseable date per BIN; `None` disables it.
    #[serde(default = "default_issuance_column")]
    pub issuance_column: Option<String>,
}

impl Default for PermitAggregateConfig {
    fn default() -> Self {
        Self {
            job_column: default_job_column(),
            output_column: default_permits_output(),
            issuance_column: default_issuance_column(),
        }
    }
}

fn default_job_column() -> String {
    "job__".to_string()
}

fn default_permits_output() -> String {
    "all_permits".to_string()
}

fn default_issuance_column() -> Option<String> {
    Some("issuance_date".to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleAggregateConfig {
    #[serde(default = "default_sale_date_column")]
    pub date_column: String,
    #[serde(default = "default_sale_price_column")]
    pub price_column: String,
    #[serde(default = "default_sale_keep_columns")]
    pub keep_columns: Vec<String>,
    /// Sales at or below this price are not arm's-length and are skipped.
    #[serde(default)]
    pub min_price: Option<f64>,
}

impl Default for SaleAggregateConfig {
    fn default() -> Self {
        Self {
            date_column: default_sale_date_column(),
            price_column: default_sale_price_column(),
            keep_columns: default_sale_keep_columns(),
            min_price: None,
        }
    }
}

pub(crate) fn default_sale_date_column() -> String {
    "sale_date".to_string()
}

pub(crate) fn default_sale_price_column() -> String {
    "sale_price".to_string()
}

fn default_sale_keep_columns() -> Vec<String> {
    vec![
        "neighborhood".to_string(),
        "building_class_at_time_of_sale".to_string(),
    ]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub input_rows: usize,
    pub excluded_rows: usize,
    pub output_rows: usize,
    pub degraded: bool,
}

const ORDER_KEY: &str = "_sale_order";

fn key_only(key: &str, input_rows: usize) -> PolarsResult<(DataFrame, AggregateStats)> {
    let frame = DataFrame::new(vec![Series::new_empty(key, &DataType::String)])?;
    let stats = AggregateStats {
        input_rows,
        excluded_rows: input_rows,
        output_rows: 0,
        degraded: true,
    };
    Ok((frame, stats))
}

fn iso_dates(frame: &DataFrame, column: &str) -> PolarsResult<Vec<Option<String>>> {
    Ok(text_cells(frame, column)?
        .into_iter()
        .map(|v| v.as_deref().and_then(parse_date).map(format_date))
        .collect())
}

/// Groups permits by BIN into a sorted, de-duplicated, `;`-joined list of job ids.
pub fn aggregate_permits(
    permits: &DataFrame,
    config: &PermitAggregateConfig,
) -> PolarsResult<(DataFrame, AggregateStats)> {
    let (true, Some(job_column)) = (
        has_column(permits, BIN_COLUMN),
        find_column(permits, &config.job_column),
    ) else {
        warn!(
            job_column = %config.job_column,
            available = %permits.get_column_names().join(", "),
            "permit aggregation columns missing; permits will be empty"
        );
        return key_only(BIN_COLUMN, permits.height());
    };
    let issuance = config
        .issuance_column
        .as_deref()
        .and_then(|name| find_column(permits, name).map(|found| (name.to_string(), found)));
    if config.issuance_column.is_some() && issuance.is_none() {
        warn!(column = ?config.issuance_column, "issuance column missing; permit dates omitted");
    }

    let jobs: Vec<Option<String>> = text_cells(permits, &job_column)?
        .into_iter()
        .map(|v| v.and_then(|job| non_empty(job.trim())))
        .collect();
    let mut columns = vec![
        permits.column(BIN_COLUMN)?.clone(),
        text_series(&job_column, jobs),
    ];
    if let Some((name, found)) = &issuance {
        columns.push(text_series(name, iso_dates(permits, found)?));
    }
    let usable = DataFrame::new(columns)?
        .lazy()
        .filter(col(BIN_COLUMN).is_not_null().and(col(&job_column).is_not_null()))
        .collect()?;
    let excluded = permits.height() - usable.height();

    let mut aggs = vec![col(&job_column)
        .unique_stable()
        .str()
        .concat(";", true)
        .alias(&config.output_column)];
    if let Some((name, _)) = &issuance {
        aggs.push(col(name).max());
    }
    // Rows are sorted by job first; values inside a group keep row order.
    let out = usable
        .lazy()
        .sort([job_column.as_str()], Default::default())
        .group_by([col(BIN_COLUMN)])
        .agg(aggs)
        .sort([BIN_COLUMN], Default::default())
        .collect()?;

    let stats = AggregateStats {
        input_rows: permits.height(),
        excluded_rows: excluded,
        output_rows: out.height(),
        degraded: false,
    };
    info!(bins = stats.output_rows, excluded = stats.excluded_rows, "aggregated permits");
    Ok((out, stats))
}

/// Keeps the most recent sale per BBL. Rows with unparsable dates are excluded
/// before sorting; among equal dates the row appearing later in the input wins.
pub fn aggregate_sales(
    sales: &DataFrame,
    config: &SaleAggregateConfig,
) -> PolarsResult<(DataFrame, AggregateStats)> {
    let (true, Some(date_column)) = (
        has_column(sales, BBL_COLUMN),
        find_column(sales, &config.date_column),
    ) else {
        warn!(
            date_column = %config.date_column,
            available = %sales.get_column_names().join(", "),
            "sale aggregation columns missing; sales will be empty"
        );
        return key_only(BBL_COLUMN, sales.height());
    };
    let price_column = find_column(sales, &config.price_column);
    if config.min_price.is_some() && price_column.is_none() {
        warn!(price_column = %config.price_column, "price column missing; min_price filter skipped");
    }

    let mut selected: Vec<String> = vec![BBL_COLUMN.to_string(), date_column.clone()];
    if let Some(price) = &price_column {
        selected.push(price.clone());
    }
    for name in &config.keep_columns {
        match find_column(sales, name) {
            Some(found) if !selected.contains(&found) => selected.push(found),
            Some(_) => {}
            None => warn!(column = %name, "configured sale column missing; skipped"),
        }
    }

    let dates = iso_dates(sales, &date_column)?;
    let bbls = text_cells(sales, BBL_COLUMN)?;
    let prices = match (config.min_price, &price_column) {
        (Some(_), Some(price)) => Some(text_cells(sales, price)?),
        _ => None,
    };
    let eligible: Vec<bool> = (0..sales.height())
        .map(|row| {
            let priced = match (config.min_price, &prices) {
                (Some(min_price), Some(prices)) => prices[row]
                    .as_deref()
                    .and_then(parse_amount)
                    .is_some_and(|p| p > min_price),
                _ => true,
            };
            bbls[row].is_some() && dates[row].is_some() && priced
        })
        .collect();
    // ISO date then input position: a total order, so ties go to the later row.
    let order: Vec<Option<String>> = dates
        .iter()
        .enumerate()
        .map(|(row, date)| date.as_ref().map(|d| format!("{d}#{row:012}")))
        .collect();

    let mut work = sales.select(selected.iter().map(String::as_str))?;
    work.with_column(text_series(&date_column, dates))?;
    work.with_column(Series::new(ORDER_KEY, order))?;
    let work = work.filter(&BooleanChunked::from_slice("eligible", &eligible))?;
    let excluded = sales.height() - work.height();

    let subset = [BBL_COLUMN.to_string()];
    let out = work
        .lazy()
        .sort([ORDER_KEY], Default::default())
        .collect()?
        .unique_stable(Some(&subset[..]), UniqueKeepStrategy::Last, None)?
        .lazy()
        .sort([BBL_COLUMN], Default::default())
        .collect()?
        .drop(ORDER_KEY)?;

    let stats = AggregateStats {
        input_rows: sales.height(),
        excluded_rows: excluded,
        output_rows: out.height(),
        degraded: false,
    };
    info!(bbls = stats.output_rows, excluded = stats.excluded_rows, "aggregated sales");
    Ok((out, stats))
}
