//! Canonical NYC building (BIN) and tax-lot (BBL) identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const BIN_LEN: usize = 7;
pub const BBL_LEN: usize = 10;
const BLOCK_LEN: usize = 5;
const LOT_LEN: usize = 4;

/// Building Identification Number: 7 digits, borough digit first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bin(String);

/// Borough-Block-Lot: 1-digit borough, 5-digit block, 4-digit lot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bbl(String);

impl Bin {
    /// Returns `None` for non-numeric input, more than 7 digits, or a placeholder
    /// BIN whose six trailing digits are all zero (`1000000`, `3000000`, ...).
    pub fn parse(raw: &str) -> Option<Self> {
        let padded = zero_pad(integer_digits(raw)?, BIN_LEN)?;
        if padded[1..].bytes().all(|b| b == b'0') {
            return None;
        }
        Some(Self(padded))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Bbl {
    pub fn parse(raw: &str) -> Option<Self> {
        zero_pad(integer_digits(raw)?, BBL_LEN).map(Self)
    }

    pub fn from_parts(borough: &str, block: &str, lot: &str) -> Option<Self> {
        let borough = borough_code(borough)?;
        let block = zero_pad(integer_digits(block)?, BLOCK_LEN)?;
        let lot = zero_pad(integer_digits(lot)?, LOT_LEN)?;
        let bbl = format!("{borough}{block}{lot}");
        (bbl.len() == BBL_LEN).then_some(Self(bbl))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Bin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for Bbl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Borough digit from a numeric code or a borough name / two-letter abbreviation.
pub fn borough_code(raw: &str) -> Option<char> {
    if let Some(digits) = integer_digits(raw) {
        let trimmed = digits.trim_start_matches('0');
        return match trimmed {
            "1" | "2" | "3" | "4" | "5" => trimmed.chars().next(),
            _ => None,
        };
    }
    let upper = raw.trim().to_ascii_uppercase();
    match upper.as_str() {
        "MANHATTAN" | "MN" => Some('1'),
        "BRONX" | "BX" => Some('2'),
        "BROOKLYN" | "BK" => Some('3'),
        "QUEENS" | "QN" => Some('4'),
        "STATEN ISLAND" | "SI" => Some('5'),
        _ => None,
    }
}

/// Trims and strips a trailing `.0…` float artifact; the remainder must be ASCII digits.
fn integer_digits(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let digits = match trimmed.split_once('.') {
        Some((int, frac)) if !frac.is_empty() && frac.bytes().all(|b| b == b'0') => int,
        Some(_) => return None,
        None => trimmed,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(digits)
}

fn zero_pad(digits: &str, width: usize) -> Option<String> {
    (digits.len() <= width).then(|| format!("{digits:0>width$}"))
}
