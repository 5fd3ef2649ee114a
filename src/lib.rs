use anyhow::Error;

pub mod calculate;
pub mod config;
pub mod consolidate;
pub mod interrupt;
pub mod ledger;
pub mod numeric;
pub mod orchestrate;
pub mod period;
pub mod reconcile;
pub mod session;
pub mod table;
pub mod webdriver;

pub type Result<T> = std::result::Result<T, Error>;

pub use calculate::{MissingColumnError, NetEffect};
pub use config::{Account, ConfigError, Overrides, Settings};
pub use consolidate::{consolidate_ledger, ConsolidationReport, ConsolidationWarning};
pub use interrupt::{is_interrupted, Interrupt, Interrupted};
pub use ledger::LedgerKind;
pub use orchestrate::{run, RunSummary};
pub use period::{DateRange, YearMonth};
