//! Core data model for the BIN/BBL linkage pipeline.

pub mod frame;
pub mod ident;
pub mod schema;
pub mod value;

pub use frame::{
    blank_to_null, find_column, frame_from_records, has_column, non_empty, text_cells,
    text_series,
};
pub use ident::{borough_code, Bbl, Bin, BBL_LEN, BIN_LEN};
pub use schema::{
    normalize_identifiers, BblMapping, NormalizeStats, SchemaError, SourceSchema, BBL_COLUMN,
    BIN_COLUMN,
};
pub use value::{format_date, parse_amount, parse_date};

pub const CRATE_NAME: &str = "bis-core";
