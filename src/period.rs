use std::fmt;

use thiserror::Error;
use time::{format_description::BorrowedFormatItem, macros::format_description, Date, Month};

static PERIOD_FMT: &[BorrowedFormatItem] = format_description!("[year]-[month]");

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeriodError {
    #[error("month {0} is out of range (1..=12)")]
    InvalidMonth(u8),
    #[error("year {0} is out of range")]
    InvalidYear(i32),
}

/// A calendar month, stored as the first day of that month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth(Date);

impl YearMonth {
    pub fn new(year: i32, month: u8) -> Result<Self, PeriodError> {
        let month = Month::try_from(month).map_err(|_| PeriodError::InvalidMonth(month))?;
        let date =
            Date::from_calendar_date(year, month, 1).map_err(|_| PeriodError::InvalidYear(year))?;
        Ok(Self(date))
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u8 {
        u8::from(self.0.month())
    }

    pub fn succ(&self) -> Option<Self> {
        let month = self.0.month();
        let year = if month == Month::December {
            self.year() + 1
        } else {
            self.year()
        };
        Date::from_calendar_date(year, month.next(), 1).ok().map(Self)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = self.0.format(PERIOD_FMT).map_err(|_| fmt::Error)?;
        f.write_str(&label)
    }
}

/// Inclusive range of months. Construction puts the bounds in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: YearMonth,
    end: YearMonth,
}

impl DateRange {
    pub fn new(
        start_year: i32,
        start_month: u8,
        end_year: i32,
        end_month: u8,
    ) -> Result<Self, PeriodError> {
        let start = YearMonth::new(start_year, start_month)?;
        let end = YearMonth::new(end_year, end_month)?;
        Ok(if start > end {
            Self {
                start: end,
                end: start,
            }
        } else {
            Self { start, end }
        })
    }

    pub fn start(&self) -> YearMonth {
        self.start
    }

    pub fn end(&self) -> YearMonth {
        self.end
    }

    pub fn months(&self) -> impl Iterator<Item = YearMonth> {
        let end = self.end;
        std::iter::successors(Some(self.start), move |m| m.succ().filter(|next| *next <= end))
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} → {}", self.start, self.end)
    }
}
