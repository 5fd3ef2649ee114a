use std::collections::BTreeSet;

use thiserror::Error;

use crate::{
    numeric::normalize_amount,
    table::{Cell, Table},
};

pub const TOTAL_COLUMN: &str = "Total Neto";
pub const SIGN_COLUMN: &str = "Signo Doc";
pub const EFFECT_COLUMN: &str = "Efecto Neto";

/// Document type 61 is a credit note; it reverses the effect of the
/// document it corrects.
pub const CREDIT_NOTE: &str = "61";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("missing required columns: {}", .columns.join(", "))]
pub struct MissingColumnError {
    pub columns: Vec<String>,
}

/// Computes the signed net effect of every ledger row:
/// `(exempt + net) * sign`, where `sign` is -1 for reversing document types.
#[derive(Debug, Clone)]
pub struct NetEffect {
    pub exempt_column: String,
    pub net_column: String,
    pub document_type_column: String,
    reversing_types: BTreeSet<String>,
}

impl Default for NetEffect {
    fn default() -> Self {
        Self {
            exempt_column: "Monto Exento".to_string(),
            net_column: "Monto Neto".to_string(),
            document_type_column: "Tipo Doc".to_string(),
            reversing_types: BTreeSet::from([CREDIT_NOTE.to_string()]),
        }
    }
}

impl NetEffect {
    pub fn with_reversing_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.reversing_types = types
            .into_iter()
            .map(|t| t.as_ref().trim().to_string())
            .collect();
        self
    }

    pub fn sign_for(&self, document_type: &Cell) -> f64 {
        if self.reversing_types.contains(&document_type.as_key()) {
            -1.0
        } else {
            1.0
        }
    }

    /// Returns a copy of `table` with both amount columns normalised and
    /// the total, sign and effect columns appended. Row order is preserved.
    pub fn apply(&self, table: &Table) -> Result<Table, MissingColumnError> {
        let lookup = |name: &String| table.column_index(name).ok_or_else(|| name.clone());
        let (exempt, net, doc_type) = match (
            lookup(&self.exempt_column),
            lookup(&self.net_column),
            lookup(&self.document_type_column),
        ) {
            (Ok(exempt), Ok(net), Ok(doc_type)) => (exempt, net, doc_type),
            (exempt, net, doc_type) => {
                let columns = [exempt, net, doc_type]
                    .into_iter()
                    .filter_map(|r| r.err())
                    .collect();
                return Err(MissingColumnError { columns });
            }
        };

        let mut out = table.clone();
        let mut totals = Vec::with_capacity(out.len());
        let mut signs = Vec::with_capacity(out.len());
        let mut effects = Vec::with_capacity(out.len());
        for row in out.rows_mut() {
            let exempt_amount = normalize_amount(&row[exempt]);
            let net_amount = normalize_amount(&row[net]);
            row[exempt] = Cell::Number(exempt_amount);
            row[net] = Cell::Number(net_amount);

            let total = exempt_amount + net_amount;
            let sign = self.sign_for(&row[doc_type]);
            totals.push(Cell::Number(total));
            signs.push(Cell::Number(sign));
            effects.push(Cell::Number(total * sign));
        }
        out.add_column(TOTAL_COLUMN, totals);
        out.add_column(SIGN_COLUMN, signs);
        out.add_column(EFFECT_COLUMN, effects);
        Ok(out)
    }
}
