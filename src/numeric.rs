//! Numbers as the tax portal exports them: `.` groups thousands and `,`
//! separates decimals (`"1.234,56"`).

use tracing::debug;

use crate::table::Cell;

/// Drops `.` thousands separators and turns the `,` decimal separator into `.`.
pub fn clean_locale_number(raw: &str) -> String {
    raw.trim().replace('.', "").replace(',', ".")
}

pub fn parse_locale_number(raw: &str) -> Option<f64> {
    let cleaned = clean_locale_number(raw);
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|n| !n.is_nan())
}

/// Numeric value of a cell for arithmetic. Anything that is not a number,
/// including empty cells, counts as zero.
pub fn normalize_amount(cell: &Cell) -> f64 {
    match cell {
        Cell::Number(n) if !n.is_nan() => *n,
        Cell::Number(_) | Cell::Empty => 0.0,
        Cell::Text(s) => parse_locale_number(s).unwrap_or_else(|| {
            debug!("coercing non-numeric amount {:?} to 0", s);
            0.0
        }),
    }
}
