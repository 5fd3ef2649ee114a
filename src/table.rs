use std::{fs, path::Path};

use anyhow::{Context, Error};
use calamine::{open_workbook, open_workbook_auto, Data, Reader, Xlsx};
use rust_xlsxwriter::Workbook;

use crate::Result;

const XLSX_MAX_ROWS: usize = 1_048_576;
const XLSX_MAX_COLUMNS: usize = 16_384;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
}

impl Cell {
    /// Builds a text cell; the empty string becomes `Cell::Empty`.
    pub fn text(s: impl Into<String>) -> Self {
        let s = s.into();
        if s.is_empty() {
            Cell::Empty
        } else {
            Cell::Text(s)
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }

    /// Trimmed textual form. Whole numbers render without a fractional part,
    /// so a document type read back from a spreadsheet as `61.0` yields `"61"`.
    pub fn as_key(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.trim().to_string(),
            Cell::Number(n) => format_number(*n),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl From<&Data> for Cell {
    fn from(data: &Data) -> Self {
        match data {
            Data::Empty => Cell::Empty,
            Data::Int(i) => Cell::Number(*i as f64),
            Data::Float(f) => Cell::Number(*f),
            Data::String(s) => Cell::text(s.clone()),
            Data::DateTime(dt) => Cell::Number(dt.as_f64()),
            other => Cell::text(other.to_string()),
        }
    }
}

/// Rows of cells under a list of column names. Every row is exactly as wide
/// as the header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row);
        }
        table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut Vec<Vec<Cell>> {
        &mut self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Appends a row, padding with empty cells or dropping the excess so it
    /// matches the header width.
    pub fn push_row(&mut self, mut row: Vec<Cell>) {
        row.resize(self.columns.len(), Cell::Empty);
        self.rows.push(row);
    }

    pub fn cell(&self, row: usize, column: usize) -> &Cell {
        &self.rows[row][column]
    }

    pub fn add_column(&mut self, name: impl Into<String>, values: Vec<Cell>) {
        debug_assert_eq!(values.len(), self.rows.len());
        self.columns.push(name.into());
        let mut values = values.into_iter();
        for row in &mut self.rows {
            row.push(values.next().unwrap_or(Cell::Empty));
        }
    }

    /// Projects onto `columns` in the given order. Columns this table lacks
    /// come out empty.
    pub fn select(&self, columns: &[String]) -> Table {
        let indices: Vec<Option<usize>> = columns.iter().map(|c| self.column_index(c)).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                indices
                    .iter()
                    .map(|i| i.map(|i| row[i].clone()).unwrap_or(Cell::Empty))
                    .collect()
            })
            .collect();
        Table {
            columns: columns.to_vec(),
            rows,
        }
    }
}

/// Reads the first row of `sheet` as a list of trimmed column names.
pub fn read_header_row<P: AsRef<Path>>(path: P, sheet: &str) -> Result<Vec<String>> {
    let path = path.as_ref();
    let mut workbook: Xlsx<_> = open_workbook(path)
        .with_context(|| format!("failed to open workbook {}", path.display()))?;
    let range = workbook
        .worksheet_range(sheet)
        .with_context(|| format!("missing sheet {:?} in {}", sheet, path.display()))?;
    let headers = range
        .headers()
        .with_context(|| format!("sheet {:?} has no header row", sheet))?;
    Ok(headers
        .into_iter()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect())
}

/// Reads the first worksheet of an `.xlsx` (or legacy `.xls`) workbook,
/// taking its first row as column names.
pub fn read_xlsx<P: AsRef<Path>>(path: P) -> Result<Table> {
    let path = path.as_ref();
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("failed to open workbook {}", path.display()))?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .with_context(|| format!("{} has no worksheets", path.display()))?;
    let range = workbook.worksheet_range(&sheet)?;
    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(Table::default());
    };
    let columns = header.iter().map(|d| d.to_string().trim().to_string()).collect();
    let mut table = Table::new(columns);
    for r in rows {
        table.push_row(r.iter().map(Cell::from).collect());
    }
    Ok(table)
}

pub fn write_xlsx<P: AsRef<Path>>(table: &Table, path: P) -> Result<()> {
    let path = path.as_ref();
    if table.width() > XLSX_MAX_COLUMNS || table.len() + 1 > XLSX_MAX_ROWS {
        return Err(Error::msg(format!(
            "table of {} rows x {} columns does not fit in a worksheet",
            table.len(),
            table.width()
        )));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    for (c, name) in table.columns().iter().enumerate() {
        worksheet.write_string(0, c as u16, name)?;
    }
    for (r, row) in table.rows().iter().enumerate() {
        let r = (r + 1) as u32;
        for (c, cell) in row.iter().enumerate() {
            match cell {
                Cell::Empty => {}
                Cell::Text(s) => {
                    worksheet.write_string(r, c as u16, s)?;
                }
                Cell::Number(n) => {
                    worksheet.write_number(r, c as u16, *n)?;
                }
            }
        }
    }
    workbook
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
