//! Lenient cell parsers shared by aggregation and flag stages.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
];

/// Parses the date formats seen across the NYC open-data feeds. Unparsable input is `None`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(date);
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ts.date());
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.date_naive())
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Parses money-like text (`$1,250,000`, `500000.0`).
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_feed_date_shapes() {
        assert_eq!(parse_date("2023-06-01"), Some(ymd(2023, 6, 1)));
        assert_eq!(parse_date("06/01/2023"), Some(ymd(2023, 6, 1)));
        assert_eq!(parse_date("2023-06-01T00:00:00.000"), Some(ymd(2023, 6, 1)));
        assert_eq!(parse_date("2023-06-01 13:45:00"), Some(ymd(2023, 6, 1)));
        assert_eq!(parse_date("2023-06-01T10:00:00Z"), Some(ymd(2023, 6, 1)));
    }

    #[test]
    fn unparsable_dates_are_none() {
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date("not a date"), None);
        assert_eq!(parse_date("2023-13-40"), None);
    }

    #[test]
    fn amounts_ignore_currency_punctuation() {
        assert_eq!(parse_amount("$1,250,000"), Some(1_250_000.0));
        assert_eq!(parse_amount("500000.0"), Some(500_000.0));
        assert_eq!(parse_amount("-"), None);
        assert_eq!(parse_amount(""), None);
    }
}
