use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use thiserror::Error;

/// Column appended to every consolidated row with the name of its source CSV.
pub const SOURCE_FILE_COLUMN: &str = "Archivo.Origen";

/// Which side of the purchase/sales register (RCV) a ledger belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerKind {
    Sales,
    Purchases,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown ledger type {0:?} (expected sales/venta or purchases/compra)")]
pub struct UnknownLedgerKind(pub String);

impl LedgerKind {
    pub const ALL: [LedgerKind; 2] = [LedgerKind::Sales, LedgerKind::Purchases];

    /// Label of the portal tab, also used in debug artifact names.
    pub fn tab_label(&self) -> &'static str {
        match self {
            LedgerKind::Sales => "VENTA",
            LedgerKind::Purchases => "COMPRA",
        }
    }

    /// Lowercase route name the portal uses for the tab (`#venta/`, `ui-sref='venta'`).
    pub fn route(&self) -> &'static str {
        match self {
            LedgerKind::Sales => "venta",
            LedgerKind::Purchases => "compra",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            LedgerKind::Sales => "Venta",
            LedgerKind::Purchases => "Compra",
        }
    }

    /// Sheet of the header template holding the canonical column list.
    pub fn template_sheet(&self) -> &'static str {
        match self {
            LedgerKind::Sales => "Libro Venta",
            LedgerKind::Purchases => "Libro de Compra",
        }
    }

    pub fn export_dir(&self, account_dir: &Path) -> PathBuf {
        account_dir.join(format!("RCV_{}", self.title()))
    }

    pub fn consolidated_path(&self, account_dir: &Path, account_id: &str) -> PathBuf {
        account_dir.join(format!("Consolidado_{} - {}.xlsx", self.title(), account_id))
    }

    pub fn calculated_path(&self, account_dir: &Path, account_id: &str) -> PathBuf {
        account_dir.join(format!("Calculado_{} - {}.xlsx", self.title(), account_id))
    }

    /// Normalises a list of user-supplied names, dropping duplicates and
    /// keeping first-seen order. An empty list means both kinds.
    pub fn parse_list<S: AsRef<str>>(items: &[S]) -> Result<Vec<LedgerKind>, UnknownLedgerKind> {
        if items.is_empty() {
            return Ok(Self::ALL.to_vec());
        }
        let mut kinds = Vec::with_capacity(2);
        for item in items {
            let kind = item.as_ref().parse::<LedgerKind>()?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }
}

impl FromStr for LedgerKind {
    type Err = UnknownLedgerKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let k = s.trim().to_lowercase();
        if k.starts_with("vent") || k.starts_with("sale") {
            Ok(LedgerKind::Sales)
        } else if k.starts_with("compr") || k.starts_with("purchase") {
            Ok(LedgerKind::Purchases)
        } else {
            Err(UnknownLedgerKind(s.to_string()))
        }
    }
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.route())
    }
}

/// Folder holding everything produced for one account.
pub fn account_dir(base_dir: &Path, account_id: &str) -> PathBuf {
    base_dir.join(format!("SII_{}", account_id))
}
