//! Lead scoring and the renovation summary computed from a finished master frame.

use std::cmp::Reverse;

use bis_core::{find_column, parse_amount, text_cells};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::aggregate::{default_sale_date_column, default_sale_price_column};
use crate::flags::{dates_in, DerivedFlagConfig, DAYS_TO_PERMIT, OFF_MARKET_CANDIDATE, RENOVATION_AFTER_SALE};

pub const LEAD_SCORE: &str = "lead_score";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadScoreConfig {
    #[serde(default = "default_sale_price_column")]
    pub price_column: String,
    #[serde(default = "default_zoning_column")]
    pub zoning_column: String,
    #[serde(default = "default_sale_date_column")]
    pub sale_date_column: String,
    #[serde(default = "default_price_threshold")]
    pub price_threshold: f64,
    #[serde(default = "default_min_score")]
    pub min_score: u32,
}

impl Default for LeadScoreConfig {
    fn default() -> Self {
        Self {
            price_column: default_sale_price_column(),
            zoning_column: default_zoning_column(),
            sale_date_column: default_sale_date_column(),
            price_threshold: default_price_threshold(),
            min_score: default_min_score(),
        }
    }
}

fn default_zoning_column() -> String {
    "zonedist1".to_string()
}

fn default_price_threshold() -> f64 {
    1_000_000.0
}

fn default_min_score() -> u32 {
    2
}

fn text_in(frame: &DataFrame, column: &str) -> PolarsResult<Vec<Option<String>>> {
    match find_column(frame, column) {
        Some(found) => text_cells(frame, &found),
        None => Ok(vec![None; frame.height()]),
    }
}

fn is_true(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// Two points for an off-market candidate, one for a sale above the price
/// threshold, one for residential zoning.
pub fn lead_score(off_market: bool, price: Option<f64>, zoning: Option<&str>, config: &LeadScoreConfig) -> u32 {
    let mut score = 0;
    if off_market {
        score += 2;
    }
    if price.is_some_and(|p| p > config.price_threshold) {
        score += 1;
    }
    if zoning.is_some_and(|z| z.trim_start().starts_with('R')) {
        score += 1;
    }
    score
}

pub fn score_leads(master: &DataFrame, config: &LeadScoreConfig) -> PolarsResult<DataFrame> {
    let off_market = text_in(master, OFF_MARKET_CANDIDATE)?;
    let prices = text_in(master, &config.price_column)?;
    let zoning = text_in(master, &config.zoning_column)?;
    let scores: Vec<u32> = (0..master.height())
        .map(|row| {
            lead_score(
                is_true(off_market[row].as_deref()),
                prices[row].as_deref().and_then(parse_amount),
                zoning[row].as_deref(),
                config,
            )
        })
        .collect();
    let mut out = master.clone();
    out.with_column(Series::new(LEAD_SCORE, scores))?;
    Ok(out)
}

/// Rows scoring at least `min_score`, best first; ties go to the most recent sale.
pub fn top_leads(
    scored: &DataFrame,
    config: &LeadScoreConfig,
    min_score: u32,
) -> PolarsResult<DataFrame> {
    let scores: Vec<u32> = text_in(scored, LEAD_SCORE)?
        .into_iter()
        .map(|v| v.and_then(|s| s.trim().parse().ok()).unwrap_or(0))
        .collect();
    let dates = dates_in(scored, &config.sale_date_column)?;
    let mut picked: Vec<usize> = (0..scored.height()).filter(|&r| scores[r] >= min_score).collect();
    // Option orders None first, so rows without a sale date sink to the bottom
    picked.sort_by_key(|&r| (Reverse(scores[r]), Reverse(dates[r])));
    let rows: Vec<IdxSize> = picked.into_iter().map(|r| r as IdxSize).collect();
    scored.take(&IdxCa::from_vec("row", rows))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenovationSummary {
    pub total_sales: usize,
    pub sales_with_permits: usize,
    pub renovated_within_window: usize,
    pub pct_renovated: f64,
    pub median_days_to_permit: Option<f64>,
    pub window_days: i64,
}

impl RenovationSummary {
    pub fn from_master(master: &DataFrame, config: &DerivedFlagConfig) -> PolarsResult<Self> {
        let sale_dates = dates_in(master, &config.sale_date_column)?;
        let renovated = text_in(master, RENOVATION_AFTER_SALE)?;
        let mut days: Vec<i64> = text_in(master, DAYS_TO_PERMIT)?
            .into_iter()
            .filter_map(|v| v.and_then(|s| s.trim().parse::<i64>().ok()))
            .filter(|d| *d >= 0)
            .collect();
        days.sort_unstable();

        let total_sales = sale_dates.iter().filter(|d| d.is_some()).count();
        let renovated_within_window = renovated.iter().filter(|v| is_true(v.as_deref())).count();
        let pct_renovated = if total_sales == 0 {
            0.0
        } else {
            renovated_within_window as f64 / total_sales as f64 * 100.0
        };
        Ok(Self {
            total_sales,
            sales_with_permits: days.len(),
            renovated_within_window,
            pct_renovated,
            median_days_to_permit: median(&days),
            window_days: config.renovation_window_days,
        })
    }

    pub fn to_markdown(&self) -> String {
        let median = match self.median_days_to_permit {
            Some(days) => format!("{days:.1}"),
            None => "n/a".to_string(),
        };
        let lines = [
            "## Renovation after sale".to_string(),
            String::new(),
            format!("- Properties with a sale: {}", self.total_sales),
            format!("- Sales followed by a permit: {}", self.sales_with_permits),
            format!(
                "- Renovated within {} days: {} ({:.1}%)",
                self.window_days, self.renovated_within_window, self.pct_renovated
            ),
            format!("- Median days from sale to permit: {median}"),
        ];
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

fn median(sorted: &[i64]) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let mid = n / 2;
    Some(if n % 2 == 1 {
        sorted[mid] as f64
    } else {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flags as a freshly derived master carries them: typed, not text.
    fn master() -> DataFrame {
        DataFrame::new(vec![
            Series::new("BIN", &["1", "2", "3", "4"]),
            Series::new("zonedist1", &[Some("R6"), Some("C4-2"), Some("R5"), None]),
            Series::new(
                "sale_date",
                &[Some("2023-05-01"), Some("2022-01-01"), Some("2023-09-01"), None],
            ),
            Series::new(
                "sale_price",
                &[Some("1500000"), Some("2000000"), Some("$900,000"), None],
            ),
            Series::new(DAYS_TO_PERMIT, &[None, Some(100i64), None, None]),
            Series::new(RENOVATION_AFTER_SALE, &[false, true, false, false]),
            Series::new(OFF_MARKET_CANDIDATE, &[true, false, true, false]),
        ])
        .unwrap()
    }

    fn bins(frame: &DataFrame) -> Vec<Option<String>> {
        text_cells(frame, "BIN").unwrap()
    }

    fn some(values: &[&str]) -> Vec<Option<String>> {
        values.iter().map(|v| Some(v.to_string())).collect()
    }

    #[test]
    fn score_components_add_up() {
        let config = LeadScoreConfig::default();
        assert_eq!(lead_score(true, Some(1_500_000.0), Some("R6"), &config), 4);
        assert_eq!(lead_score(false, Some(1_000_000.0), Some("M1-1"), &config), 0);
        assert_eq!(lead_score(false, None, Some("R3-2"), &config), 1);
    }

    #[test]
    fn top_leads_sort_by_score_then_recent_sale() {
        let config = LeadScoreConfig::default();
        let scored = score_leads(&master(), &config).unwrap();
        assert_eq!(text_cells(&scored, LEAD_SCORE).unwrap(), some(&["4", "1", "3", "0"]));

        let top = top_leads(&scored, &config, 2).unwrap();
        assert_eq!(bins(&top), some(&["1", "3"]));

        let all = top_leads(&scored, &config, 0).unwrap();
        assert_eq!(bins(&all), some(&["1", "3", "2", "4"]));
    }

    #[test]
    fn flags_read_back_from_csv_text_score_the_same() {
        let config = LeadScoreConfig::default();
        let typed = master();
        let columns = typed
            .get_column_names()
            .into_iter()
            .map(|name| Series::new(name, text_cells(&typed, name).unwrap()))
            .collect();
        let text = DataFrame::new(columns).unwrap();
        let scored = score_leads(&text, &config).unwrap();
        assert_eq!(text_cells(&scored, LEAD_SCORE).unwrap(), some(&["4", "1", "3", "0"]));
        let summary = RenovationSummary::from_master(&text, &DerivedFlagConfig::default()).unwrap();
        assert_eq!(summary.renovated_within_window, 1);
    }

    #[test]
    fn renovation_summary_counts_and_median() {
        let summary =
            RenovationSummary::from_master(&master(), &DerivedFlagConfig::default()).unwrap();
        assert_eq!(summary.total_sales, 3);
        assert_eq!(summary.sales_with_permits, 1);
        assert_eq!(summary.renovated_within_window, 1);
        assert!((summary.pct_renovated - 33.333).abs() < 0.01);
        assert_eq!(summary.median_days_to_permit, Some(100.0));
        assert!(summary.to_markdown().contains("Renovated within 365 days: 1 (33.3%)"));
    }

    #[test]
    fn median_of_even_count_averages_the_middle() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[1, 3, 10, 20]), Some(6.5));
    }
}
