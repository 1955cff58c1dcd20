//! Helpers over the string-valued `polars` frames every pipeline stage passes around.
//!
//! Source data arrives as text (CSV cells, JSON scalars), so frames built here
//! hold `String` columns only. Blank cells are stored as nulls.

use std::collections::HashMap;

use polars::prelude::*;

/// Maps blank text to `None`.
pub fn non_empty(value: impl Into<String>) -> Option<String> {
    let value = value.into();
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// A `String` series with blank values stored as nulls.
pub fn text_series(name: &str, values: Vec<Option<String>>) -> Series {
    let values: Vec<Option<String>> = values.into_iter().map(|v| v.and_then(non_empty)).collect();
    Series::new(name, values)
}

/// Builds a frame from field/value records. Columns are the union of record
/// keys in first-seen order; a key missing from a record is a null cell.
pub fn frame_from_records<I>(records: I) -> PolarsResult<DataFrame>
where
    I: IntoIterator<Item = Vec<(String, Option<String>)>>,
{
    let mut names: Vec<String> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut cells: Vec<Vec<Option<String>>> = Vec::new();
    let mut height = 0usize;

    for record in records {
        for (key, value) in record {
            let idx = *index.entry(key.clone()).or_insert_with(|| {
                names.push(key);
                cells.push(vec![None; height]);
                names.len() - 1
            });
            // A key repeated inside one record keeps its last value.
            if cells[idx].len() > height {
                cells[idx][height] = value;
            } else {
                cells[idx].push(value);
            }
        }
        height += 1;
        for column in &mut cells {
            column.resize(height, None);
        }
    }

    let columns = names
        .iter()
        .zip(cells)
        .map(|(name, values)| text_series(name, values))
        .collect();
    DataFrame::new(columns)
}

/// Rewrites whitespace-only cells of every `String` column to null.
pub fn blank_to_null(frame: DataFrame) -> PolarsResult<DataFrame> {
    let columns = frame
        .get_columns()
        .iter()
        .map(|series| -> PolarsResult<Series> {
            if series.dtype() != &DataType::String {
                return Ok(series.clone());
            }
            let values: Vec<Option<&str>> = series
                .str()?
                .into_iter()
                .map(|v| v.filter(|text| !text.trim().is_empty()))
                .collect();
            Ok(Series::new(series.name(), values))
        })
        .collect::<PolarsResult<Vec<_>>>()?;
    DataFrame::new(columns)
}

/// Resolves a column name; an exact match wins over a case-insensitive one.
pub fn find_column(frame: &DataFrame, name: &str) -> Option<String> {
    let names = frame.get_column_names();
    names
        .iter()
        .find(|c| **c == name)
        .or_else(|| names.iter().find(|c| c.eq_ignore_ascii_case(name)))
        .map(|c| c.to_string())
}

pub fn has_column(frame: &DataFrame, name: &str) -> bool {
    frame.get_column_names().contains(&name)
}

/// Cells of one column rendered as text. Typed columns (flags, scores) are
/// cast so callers read a reloaded CSV and a freshly derived frame alike.
pub fn text_cells(frame: &DataFrame, name: &str) -> PolarsResult<Vec<Option<String>>> {
    let series = frame.column(name)?.cast(&DataType::String)?;
    let values = series
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect();
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, Option<&str>)]) -> Vec<(String, Option<String>)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    #[test]
    fn records_union_columns_in_first_seen_order() {
        let frame = frame_from_records(vec![
            record(&[("a", Some("1")), ("b", Some("x"))]),
            record(&[("c", Some("z")), ("a", Some("2"))]),
        ])
        .unwrap();
        assert_eq!(frame.get_column_names(), &["a", "b", "c"]);
        assert_eq!(frame.height(), 2);
        assert_eq!(
            text_cells(&frame, "b").unwrap(),
            vec![Some("x".to_string()), None]
        );
        assert_eq!(
            text_cells(&frame, "c").unwrap(),
            vec![None, Some("z".to_string())]
        );
    }

    #[test]
    fn blank_cells_become_null() {
        let frame = frame_from_records(vec![record(&[("a", Some("  ")), ("b", Some("v"))])]).unwrap();
        assert_eq!(frame.column("a").unwrap().null_count(), 1);

        let raw = DataFrame::new(vec![Series::new("a", &["", " x "])]).unwrap();
        let cleaned = blank_to_null(raw).unwrap();
        assert_eq!(
            text_cells(&cleaned, "a").unwrap(),
            vec![None, Some(" x ".to_string())]
        );
    }

    #[test]
    fn column_lookup_prefers_exact_name() {
        let frame = DataFrame::new(vec![
            Series::new("bin", &["1"]),
            Series::new("BIN", &["2"]),
            Series::new("Sale_Date", &["3"]),
        ])
        .unwrap();
        assert_eq!(find_column(&frame, "BIN").as_deref(), Some("BIN"));
        assert_eq!(find_column(&frame, "sale_date").as_deref(), Some("Sale_Date"));
        assert_eq!(find_column(&frame, "lot"), None);
        assert!(has_column(&frame, "bin"));
        assert!(!has_column(&frame, "sale_date"));
    }

    #[test]
    fn typed_columns_are_read_as_text() {
        let frame = DataFrame::new(vec![
            Series::new("days", &[Some(151i64), None]),
            Series::new("flag", &[true, false]),
        ])
        .unwrap();
        assert_eq!(
            text_cells(&frame, "days").unwrap(),
            vec![Some("151".to_string()), None]
        );
        assert_eq!(
            text_cells(&frame, "flag").unwrap(),
            vec![Some("true".to_string()), Some("false".to_string())]
        );
    }
}
