//! Bank statement against accounting book reconciliation. Entries pair up
//! when they share a date and an amount rounded to cents.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use thiserror::Error;
use time::{
    format_description::BorrowedFormatItem,
    macros::{date, format_description},
    Date, Duration,
};
use tracing::{debug, info};

use crate::{
    table::{self, Cell, Table},
    Result,
};

/// Accepted textual dates, tried in order. Only the part before a space or
/// `T` is parsed, so timestamps reduce to their date.
const DATE_FORMATS: [&[BorrowedFormatItem<'static>]; 4] = [
    format_description!("[year]-[month]-[day]"),
    format_description!("[year]/[month]/[day]"),
    format_description!("[day]-[month]-[year]"),
    format_description!("[day]/[month]/[year]"),
];

/// Day zero of spreadsheet serial dates.
const SERIAL_EPOCH: Date = date!(1899 - 12 - 30);
/// Serial of 9999-12-31.
const MAX_SERIAL: f64 = 2_958_465.0;

pub const REPORT_COLUMNS: [&str; 9] = [
    "fecha_banco",
    "monto_banco",
    "glosa_banco",
    "referencia_banco",
    "fecha_libro",
    "monto_libro",
    "glosa_libro",
    "referencia_libro",
    "match",
];

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("unsupported file extension {0:?}")]
    UnsupportedFormat(String),
}

/// Column names recognised for each field, matched case-insensitively. The
/// first alias present in a table wins.
#[derive(Debug, Clone)]
pub struct ColumnAliases {
    pub date: Vec<String>,
    pub amount: Vec<String>,
    pub description: Vec<String>,
    pub reference: Vec<String>,
}

fn names(aliases: &[&str]) -> Vec<String> {
    aliases.iter().map(|s| s.to_string()).collect()
}

impl Default for ColumnAliases {
    fn default() -> Self {
        Self {
            date: names(&["fecha", "Fecha", "date", "transaction_date"]),
            amount: names(&["monto", "Monto", "amount", "importe"]),
            description: names(&["glosa", "Glosa", "description", "detalle", "Descripción"]),
            reference: names(&["referencia", "Ref", "doc", "Documento"]),
        }
    }
}

/// One movement of a bank statement or an accounting book. Fields that are
/// absent or do not parse are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    pub date: Option<Date>,
    pub amount: Option<f64>,
    pub description: Option<String>,
    pub reference: Option<String>,
}

impl Entry {
    /// `date|amount` with the amount rounded to cents. Entries without a
    /// date or an amount have no key and never match.
    pub fn key(&self) -> Option<String> {
        let (date, amount) = (self.date?, self.amount?);
        let cents = (amount * 100.0).round() / 100.0;
        // Avoids a distinct "-0.00" key.
        let cents = if cents == 0.0 { 0.0 } else { cents };
        Some(format!("{}|{:.2}", date, cents))
    }

    fn cells(entry: Option<&Entry>) -> Vec<Cell> {
        let Some(e) = entry else {
            return vec![Cell::Empty; 4];
        };
        vec![
            e.date.map_or(Cell::Empty, |d| Cell::text(d.to_string())),
            e.amount.map_or(Cell::Empty, Cell::Number),
            e.description.clone().map_or(Cell::Empty, Cell::text),
            e.reference.clone().map_or(Cell::Empty, Cell::text),
        ]
    }
}

#[derive(Debug)]
pub struct ReconcileReport {
    pub output: PathBuf,
    pub rows: usize,
    pub matched: usize,
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Loads a statement or book from `.csv`, `.xls` or `.xlsx`.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Table> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ReconcileError::NotFound(path.to_path_buf()).into());
    }
    match extension(path).as_str() {
        "csv" => read_csv(path),
        "xls" | "xlsx" => table::read_xlsx(path),
        other => Err(ReconcileError::UnsupportedFormat(other.to_string()).into()),
    }
}

fn read_csv(path: &Path) -> Result<Table> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let columns = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let mut table = Table::new(columns);
    for record in rdr.records() {
        table.push_row(record?.iter().map(Cell::text).collect());
    }
    Ok(table)
}

fn find_column(table: &Table, aliases: &[String]) -> Option<usize> {
    aliases.iter().find_map(|alias| {
        let alias = alias.to_lowercase();
        table
            .columns()
            .iter()
            .position(|c| c.trim().to_lowercase() == alias)
    })
}

/// Parses a textual date in one of [`DATE_FORMATS`] or a spreadsheet serial
/// number.
pub fn parse_date(cell: &Cell) -> Option<Date> {
    match cell {
        Cell::Empty => None,
        Cell::Number(n) if (1.0..=MAX_SERIAL).contains(n) => {
            SERIAL_EPOCH.checked_add(Duration::days(n.floor() as i64))
        }
        Cell::Number(_) => None,
        Cell::Text(s) => {
            let day = s.trim().split([' ', 'T']).next().unwrap_or_default();
            DATE_FORMATS
                .iter()
                .find_map(|format| Date::parse(day, format).ok())
        }
    }
}

pub fn parse_amount(cell: &Cell) -> Option<f64> {
    let n = match cell {
        Cell::Empty => return None,
        Cell::Number(n) => *n,
        Cell::Text(s) => s.trim().parse::<f64>().ok()?,
    };
    n.is_finite().then_some(n)
}

fn text(cell: &Cell) -> Option<String> {
    match cell {
        Cell::Empty => None,
        other => Some(other.as_key()).filter(|s| !s.is_empty()),
    }
}

/// Maps a loaded table onto [`Entry`] values using `aliases`.
pub fn normalize(table: &Table, aliases: &ColumnAliases) -> Vec<Entry> {
    let date = find_column(table, &aliases.date);
    let amount = find_column(table, &aliases.amount);
    let description = find_column(table, &aliases.description);
    let reference = find_column(table, &aliases.reference);
    debug!(?date, ?amount, ?description, ?reference, "resolved columns");

    table
        .rows()
        .iter()
        .map(|row| Entry {
            date: date.and_then(|c| parse_date(&row[c])),
            amount: amount.and_then(|c| parse_amount(&row[c])),
            description: description.and_then(|c| text(&row[c])),
            reference: reference.and_then(|c| text(&row[c])),
        })
        .collect()
}

/// Outer join of `bank` and `book` on [`Entry::key`], laid out as
/// [`REPORT_COLUMNS`]. Keys come out in ascending order; entries sharing a
/// key pair up every way. Entries without a key follow, bank first.
pub fn reconcile(bank: &[Entry], book: &[Entry]) -> Table {
    let mut keyed: BTreeMap<String, (Vec<&Entry>, Vec<&Entry>)> = BTreeMap::new();
    let mut bank_unkeyed = Vec::new();
    let mut book_unkeyed = Vec::new();
    for e in bank {
        match e.key() {
            Some(key) => keyed.entry(key).or_default().0.push(e),
            None => bank_unkeyed.push(e),
        }
    }
    for e in book {
        match e.key() {
            Some(key) => keyed.entry(key).or_default().1.push(e),
            None => book_unkeyed.push(e),
        }
    }

    let mut table = Table::new(REPORT_COLUMNS.iter().map(|c| c.to_string()).collect());
    for (bank, book) in keyed.values() {
        match (bank.as_slice(), book.as_slice()) {
            ([], book) => book.iter().for_each(|&l| table.push_row(row(None, Some(l)))),
            (bank, []) => bank.iter().for_each(|&b| table.push_row(row(Some(b), None))),
            (bank, book) => {
                for &b in bank {
                    for &l in book {
                        table.push_row(row(Some(b), Some(l)));
                    }
                }
            }
        }
    }
    for b in bank_unkeyed {
        table.push_row(row(Some(b), None));
    }
    for l in book_unkeyed {
        table.push_row(row(None, Some(l)));
    }
    table
}

fn row(bank: Option<&Entry>, book: Option<&Entry>) -> Vec<Cell> {
    let matched = bank.is_some() && book.is_some();
    let mut cells = Entry::cells(bank);
    cells.extend(Entry::cells(book));
    cells.push(Cell::text(matched.to_string()));
    cells
}

/// Number of report rows flagged as matched.
pub fn matched_rows(report: &Table) -> usize {
    let Some(flag) = report.column_index("match") else {
        return 0;
    };
    report
        .rows()
        .iter()
        .filter(|r| r[flag].as_key() == "true")
        .count()
}

/// Writes the report as `.xlsx` or `.csv`, creating missing parent folders.
/// Any other extension is rejected before anything is written.
pub fn write_report<P: AsRef<Path>>(report: &Table, path: P) -> Result<()> {
    let path = path.as_ref();
    match extension(path).as_str() {
        "xlsx" => table::write_xlsx(report, path),
        "csv" => write_csv(report, path),
        other => Err(ReconcileError::UnsupportedFormat(other.to_string()).into()),
    }
}

fn write_csv(report: &Table, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    wtr.write_record(report.columns())?;
    for r in report.rows() {
        wtr.write_record(r.iter().map(Cell::as_key))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Loads both sides, reconciles them and writes the report to `output`.
pub fn reconcile_files(
    bank: &Path,
    book: &Path,
    output: &Path,
    aliases: &ColumnAliases,
) -> Result<ReconcileReport> {
    let bank_entries = normalize(&load(bank)?, aliases);
    let book_entries = normalize(&load(book)?, aliases);
    let report = reconcile(&bank_entries, &book_entries);
    write_report(&report, output)?;

    let matched = matched_rows(&report);
    info!(
        "reconciled {} bank and {} book entries: {} matched row(s) → {}",
        bank_entries.len(),
        book_entries.len(),
        matched,
        output.display()
    );
    Ok(ReconcileReport {
        output: output.to_path_buf(),
        rows: report.len(),
        matched,
    })
}
