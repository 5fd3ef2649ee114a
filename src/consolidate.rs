//! Merges the monthly CSV exports of one account and ledger type into a
//! single spreadsheet laid out like the header template.

use std::{
    borrow::Cow,
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use encoding_rs::{UTF_8, WINDOWS_1252};
use tracing::{debug, info, warn};

use crate::{
    ledger::{LedgerKind, SOURCE_FILE_COLUMN},
    numeric::parse_locale_number,
    table::{self, Cell, Table},
    Result,
};

/// Fraction of rows that must look shifted before a file is realigned.
const SHIFT_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextEncoding {
    Utf8,
    Windows1252,
}

/// Tried in order; the first pair that yields at least two columns wins.
/// Strict UTF-8 goes first on purpose, unlike older tools that tried Latin-1
/// first: Windows-1252 decodes any byte sequence, so it would never fail and
/// would silently mangle UTF-8 exports. It still covers Latin-1 files.
const READ_ATTEMPTS: [(TextEncoding, u8); 4] = [
    (TextEncoding::Utf8, b';'),
    (TextEncoding::Utf8, b','),
    (TextEncoding::Windows1252, b';'),
    (TextEncoding::Windows1252, b','),
];

const SNIFF_DELIMITERS: [u8; 4] = [b';', b',', b'\t', b'|'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsolidationWarning {
    MissingFolder(PathBuf),
    HeaderTemplate { path: PathBuf, error: String },
    NoCsvFiles(PathBuf),
    UnreadableFile { file: String, error: String },
    NoMatchingColumns { file: String },
    NoValidFiles(PathBuf),
}

impl fmt::Display for ConsolidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingFolder(dir) => write!(f, "folder not found: {}", dir.display()),
            Self::HeaderTemplate { path, error } => {
                write!(f, "failed to load headers from {}: {}", path.display(), error)
            }
            Self::NoCsvFiles(dir) => write!(f, "no CSV files in {}", dir.display()),
            Self::UnreadableFile { file, error } => write!(f, "{}: {}", file, error),
            Self::NoMatchingColumns { file } => {
                write!(f, "{}: no expected column matches; skipped", file)
            }
            Self::NoValidFiles(dir) => write!(f, "no usable files in {}", dir.display()),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConsolidationReport {
    /// Path of the written spreadsheet, if anything was written.
    pub output: Option<PathBuf>,
    pub rows: usize,
    pub files: Vec<String>,
    pub warnings: Vec<ConsolidationWarning>,
}

impl ConsolidationReport {
    fn warn(&mut self, warning: ConsolidationWarning) {
        warn!("{}", warning);
        self.warnings.push(warning);
    }
}

/// Consolidates every CSV under `source_dir` into `output`.
///
/// A missing folder, an unreadable header template, or the absence of usable
/// files only produce warnings; no spreadsheet is written in those cases.
/// Errors are returned only when writing the output fails.
pub fn consolidate_ledger(
    source_dir: &Path,
    header_template: &Path,
    kind: LedgerKind,
    output: &Path,
) -> Result<ConsolidationReport> {
    let mut report = ConsolidationReport::default();

    if !source_dir.is_dir() {
        report.warn(ConsolidationWarning::MissingFolder(source_dir.to_path_buf()));
        return Ok(report);
    }

    let canonical = match table::read_header_row(header_template, kind.template_sheet()) {
        Ok(headers) => headers,
        Err(e) => {
            report.warn(ConsolidationWarning::HeaderTemplate {
                path: header_template.to_path_buf(),
                error: format!("{:#}", e),
            });
            return Ok(report);
        }
    };

    let files = list_csv_files(source_dir)?;
    if files.is_empty() {
        report.warn(ConsolidationWarning::NoCsvFiles(source_dir.to_path_buf()));
        return Ok(report);
    }

    let mut tables = Vec::with_capacity(files.len());
    for path in &files {
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let export = match read_export(path) {
            Ok(export) => export,
            Err(e) => {
                report.warn(ConsolidationWarning::UnreadableFile {
                    file,
                    error: format!("{:#}", e),
                });
                continue;
            }
        };
        match prepare_export(export, &canonical, &file) {
            Some(prepared) => {
                debug!(file = %file, rows = prepared.len(), "accepted export");
                report.files.push(file);
                tables.push(prepared);
            }
            None => report.warn(ConsolidationWarning::NoMatchingColumns { file }),
        }
    }

    let merged = concat(&tables, &canonical);
    if merged.is_empty() {
        report.warn(ConsolidationWarning::NoValidFiles(source_dir.to_path_buf()));
        return Ok(report);
    }

    table::write_xlsx(&merged, output)?;
    info!(
        "consolidated {} ({} rows from {} files)",
        output.display(),
        merged.len(),
        report.files.len()
    );
    report.rows = merged.len();
    report.output = Some(output.to_path_buf());
    Ok(report)
}

fn list_csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        let is_csv = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if is_csv && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn decode(bytes: &[u8], encoding: TextEncoding) -> Option<Cow<'_, str>> {
    match encoding {
        TextEncoding::Utf8 => {
            let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
            UTF_8.decode_without_bom_handling_and_without_replacement(bytes)
        }
        TextEncoding::Windows1252 => {
            WINDOWS_1252.decode_without_bom_handling_and_without_replacement(bytes)
        }
    }
}

/// Reads one exported CSV, guessing its encoding and delimiter.
pub fn read_export(path: &Path) -> Result<Table> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    for (encoding, delimiter) in READ_ATTEMPTS {
        let Some(text) = decode(&bytes, encoding) else {
            continue;
        };
        match parse_delimited(&text, delimiter) {
            Ok(table) if table.width() >= 2 => return Ok(table),
            Ok(_) => {}
            Err(e) => debug!(
                "{:?} with {:?} failed: {:#}",
                encoding, delimiter as char, e
            ),
        }
    }

    let text = String::from_utf8_lossy(&bytes);
    let delimiter = sniff_delimiter(&text);
    parse_delimited(&text, delimiter).context("no encoding/delimiter combination worked")
}

fn sniff_delimiter(text: &str) -> u8 {
    let first_line = text.lines().next().unwrap_or_default();
    SNIFF_DELIMITERS
        .into_iter()
        .max_by_key(|d| first_line.bytes().filter(|b| b == d).count())
        .filter(|d| first_line.as_bytes().contains(d))
        .unwrap_or(b',')
}

/// Parses delimited text whose first record is the header. Short rows are
/// padded; long rows are accepted only when the surplus fields are empty.
fn parse_delimited(text: &str, delimiter: u8) -> Result<Table> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());
    let columns: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let width = columns.len();
    let mut table = Table::new(columns);
    for (n, record) in rdr.records().enumerate() {
        let record = record?;
        if record.len() > width && record.iter().skip(width).any(|f| !f.is_empty()) {
            return Err(Error::msg(format!(
                "row {} has {} fields, expected {}",
                n + 1,
                record.len(),
                width
            )));
        }
        table.push_row(record.iter().take(width).map(Cell::text).collect());
    }
    Ok(table)
}

/// Cleans up one export and lines it up with the canonical headers.
/// Returns `None` when the file shares no column with them.
pub fn prepare_export(mut export: Table, canonical: &[String], file: &str) -> Option<Table> {
    if strip_repeated_header(&mut export) {
        debug!(file, "dropped repeated header row");
    }
    if repair_column_shift(&mut export) {
        warn!(file, "columns look shifted; realigned");
    }

    let present: Vec<String> = canonical
        .iter()
        .filter(|c| export.column_index(c).is_some())
        .cloned()
        .collect();
    if present.is_empty() {
        return None;
    }

    let mut prepared = export.select(&present);
    coerce_numeric_columns(&mut prepared);
    let provenance = vec![Cell::text(file); prepared.len()];
    prepared.add_column(SOURCE_FILE_COLUMN, provenance);
    Some(prepared)
}

/// Removes the first data row when it repeats the column names.
pub fn strip_repeated_header(table: &mut Table) -> bool {
    let Some(first) = table.rows().first() else {
        return false;
    };
    let repeats = first.len() == table.width()
        && first
            .iter()
            .zip(table.columns())
            .all(|(cell, column)| cell.as_key() == column.trim());
    if repeats {
        table.rows_mut().remove(0);
    }
    repeats
}

/// Some exports arrive with every value one column to the right of its
/// label. When more than 80% of the rows after the first have an empty first
/// column and a populated second one, those rows are moved one column left.
pub fn repair_column_shift(table: &mut Table) -> bool {
    if table.width() < 2 || table.len() < 3 {
        return false;
    }
    let body = &table.rows()[1..];
    let shifted = body
        .iter()
        .filter(|row| row[0].is_empty() && !row[1].is_empty())
        .count();
    if (shifted as f64 / body.len() as f64) <= SHIFT_THRESHOLD {
        return false;
    }
    for row in table.rows_mut().iter_mut().skip(1) {
        row.remove(0);
        row.push(Cell::Empty);
    }
    true
}

/// Converts a text column to numbers when every non-empty value parses as a
/// locale number. Columns with any other value are left untouched.
fn coerce_numeric_columns(table: &mut Table) {
    for c in 0..table.width() {
        let mut parsed = Vec::with_capacity(table.len());
        let mut convertible = false;
        for row in table.rows() {
            match &row[c] {
                Cell::Text(s) => match parse_locale_number(s) {
                    Some(n) => {
                        parsed.push(Cell::Number(n));
                        convertible = true;
                    }
                    None => {
                        convertible = false;
                        break;
                    }
                },
                other => parsed.push(other.clone()),
            }
        }
        if convertible && parsed.len() == table.len() {
            for (row, value) in table.rows_mut().iter_mut().zip(parsed) {
                row[c] = value;
            }
        }
    }
}

/// Stacks prepared exports under the union of their columns, in canonical
/// order, with the provenance column last.
pub fn concat(tables: &[Table], canonical: &[String]) -> Table {
    let mut columns: Vec<String> = canonical
        .iter()
        .filter(|c| tables.iter().any(|t| t.column_index(c).is_some()))
        .cloned()
        .collect();
    columns.push(SOURCE_FILE_COLUMN.to_string());

    let mut merged = Table::new(columns.clone());
    for t in tables {
        for row in t.select(&columns).rows() {
            merged.push_row(row.clone());
        }
    }
    merged
}
