//! YAML run configuration, merged with command-line overrides and validated
//! before anything touches the network.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::{
    calculate::CREDIT_NOTE,
    ledger::{LedgerKind, UnknownLedgerKind},
    period::{DateRange, PeriodError},
};

pub const DEFAULT_HEADER_TEMPLATE: &str = "Encabezados.xlsx";
const DEFAULT_CHROMEDRIVER: &str = "chromedriver";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid period: {0}")]
    Period(#[from] PeriodError),
    #[error(transparent)]
    LedgerKind(#[from] UnknownLedgerKind),
    #[error("no valid accounts/credentials (or the account filter matched none)")]
    NoAccounts,
}

#[derive(Debug, Deserialize)]
pub struct RawConfig {
    pub base_dir: Option<PathBuf>,
    pub header_template: Option<PathBuf>,
    pub chromedriver_path: Option<PathBuf>,
    pub chrome_binary: Option<PathBuf>,
    pub headless: Option<bool>,
    pub run_extraction: Option<bool>,
    pub period: RawPeriod,
    #[serde(default)]
    pub ledger_types: Vec<String>,
    #[serde(default)]
    pub accounts: Vec<RawAccount>,
    pub credentials: Option<RawAccount>,
    pub reversing_document_types: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct RawPeriod {
    pub start_year: i32,
    pub start_month: u8,
    pub end_year: i32,
    pub end_month: u8,
}

#[derive(Debug, Deserialize)]
pub struct RawAccount {
    #[serde(default, deserialize_with = "scalar_string")]
    pub taxpayer_id: String,
    #[serde(default, deserialize_with = "scalar_string")]
    pub secret: String,
}

/// Accepts any YAML scalar; taxpayer ids are often written unquoted.
fn scalar_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = serde_yaml::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_yaml::Value::String(s) => s,
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        _ => String::new(),
    })
}

/// Values given on the command line; each one beats the YAML.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub headless: Option<bool>,
    pub chrome_binary: Option<PathBuf>,
    pub chromedriver: Option<PathBuf>,
    pub account: Option<String>,
    pub ledger_types: Vec<String>,
    pub skip_extraction: bool,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    pub taxpayer_id: String,
    pub secret: String,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("taxpayer_id", &self.taxpayer_id)
            .field("secret", &"***")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub base_dir: PathBuf,
    pub header_template: PathBuf,
    pub chromedriver: PathBuf,
    pub chrome_binary: Option<PathBuf>,
    pub headless: bool,
    pub run_extraction: bool,
    pub range: DateRange,
    pub ledger_kinds: Vec<LedgerKind>,
    pub accounts: Vec<Account>,
    pub reversing_types: Vec<String>,
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P, overrides: Overrides) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text, overrides)
    }

    pub fn from_yaml(text: &str, overrides: Overrides) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text)?;
        Self::resolve(raw, overrides)
    }

    pub fn resolve(raw: RawConfig, overrides: Overrides) -> Result<Self, ConfigError> {
        let p = &raw.period;
        let range = DateRange::new(p.start_year, p.start_month, p.end_year, p.end_month)?;

        let ledger_kinds = if overrides.ledger_types.is_empty() {
            LedgerKind::parse_list(&raw.ledger_types)?
        } else {
            LedgerKind::parse_list(&overrides.ledger_types)?
        };

        let accounts = select_accounts(&raw, overrides.account.as_deref());
        if accounts.is_empty() {
            return Err(ConfigError::NoAccounts);
        }

        let base_dir = raw.base_dir.unwrap_or_else(|| PathBuf::from("."));
        let header_template = match raw.header_template {
            Some(p) if p.is_dir() => p.join(DEFAULT_HEADER_TEMPLATE),
            Some(p) => p,
            None => base_dir.join(DEFAULT_HEADER_TEMPLATE),
        };

        Ok(Self {
            base_dir,
            header_template,
            chromedriver: overrides
                .chromedriver
                .or(raw.chromedriver_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CHROMEDRIVER)),
            chrome_binary: overrides.chrome_binary.or(raw.chrome_binary),
            headless: overrides.headless.or(raw.headless).unwrap_or(true),
            run_extraction: !overrides.skip_extraction && raw.run_extraction.unwrap_or(true),
            range,
            ledger_kinds,
            accounts,
            reversing_types: raw
                .reversing_document_types
                .unwrap_or_else(|| vec![CREDIT_NOTE.to_string()]),
        })
    }
}

/// Taxpayer ids compare without dots or dashes: `76.123.456-7` == `761234567`.
fn normalize_id(id: &str) -> String {
    id.chars().filter(|c| *c != '.' && *c != '-').collect()
}

fn select_accounts(raw: &RawConfig, filter: Option<&str>) -> Vec<Account> {
    let listed: Vec<&RawAccount> = if raw.accounts.is_empty() {
        raw.credentials.iter().collect()
    } else {
        raw.accounts.iter().collect()
    };
    let wanted = filter.map(normalize_id);
    listed
        .into_iter()
        .map(|a| Account {
            taxpayer_id: a.taxpayer_id.trim().to_string(),
            secret: a.secret.trim().to_string(),
        })
        .filter(|a| {
            wanted
                .as_ref()
                .map_or(true, |w| normalize_id(&a.taxpayer_id) == *w)
        })
        .filter(|a| !a.taxpayer_id.is_empty() && !a.secret.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
base_dir: /data/rcv
chromedriver_path: /opt/chromedriver
headless: false
period:
  start_year: 2024
  start_month: 6
  end_year: 2024
  end_month: 1
ledger_types: [compra]
accounts:
  - taxpayer_id: 76.123.456-7
    secret: hunter2
  - taxpayer_id: 11111111-1
    secret: ""
"#;

    #[test]
    fn resolves_sample() {
        let settings = Settings::from_yaml(SAMPLE, Overrides::default()).unwrap();
        assert_eq!(settings.base_dir, PathBuf::from("/data/rcv"));
        assert_eq!(
            settings.header_template,
            PathBuf::from("/data/rcv/Encabezados.xlsx")
        );
        assert_eq!(settings.chromedriver, PathBuf::from("/opt/chromedriver"));
        assert!(!settings.headless);
        assert!(settings.run_extraction);
        assert_eq!(settings.range.start().to_string(), "2024-01");
        assert_eq!(settings.ledger_kinds, vec![LedgerKind::Purchases]);
        assert_eq!(settings.accounts.len(), 1);
        assert_eq!(settings.reversing_types, vec!["61"]);
    }

    #[test]
    fn overrides_win() {
        let overrides = Overrides {
            headless: Some(true),
            ledger_types: vec!["venta".to_string()],
            skip_extraction: true,
            account: Some("761234567".to_string()),
            ..Overrides::default()
        };
        let settings = Settings::from_yaml(SAMPLE, overrides).unwrap();
        assert!(settings.headless);
        assert!(!settings.run_extraction);
        assert_eq!(settings.ledger_kinds, vec![LedgerKind::Sales]);
        assert_eq!(settings.accounts[0].taxpayer_id, "76.123.456-7");
    }

    #[test]
    fn filter_matching_nothing_is_fatal() {
        let overrides = Overrides {
            account: Some("99999999-9".to_string()),
            ..Overrides::default()
        };
        assert!(matches!(
            Settings::from_yaml(SAMPLE, overrides),
            Err(ConfigError::NoAccounts)
        ));
    }

    #[test]
    fn single_credentials_and_numeric_id() {
        let yaml = r#"
period: { start_year: 2023, start_month: 1, end_year: 2023, end_month: 3 }
credentials:
  taxpayer_id: 123456785
  secret: s3cret
"#;
        let settings = Settings::from_yaml(yaml, Overrides::default()).unwrap();
        assert_eq!(settings.accounts[0].taxpayer_id, "123456785");
        assert_eq!(settings.ledger_kinds, LedgerKind::ALL.to_vec());
        assert!(settings.headless);
    }

    #[test]
    fn invalid_month_is_fatal() {
        let yaml = r#"
period: { start_year: 2023, start_month: 13, end_year: 2023, end_month: 3 }
credentials: { taxpayer_id: 1-9, secret: x }
"#;
        assert!(matches!(
            Settings::from_yaml(yaml, Overrides::default()),
            Err(ConfigError::Period(PeriodError::InvalidMonth(13)))
        ));
    }

    #[test]
    fn missing_period_is_fatal() {
        let yaml = "credentials: { taxpayer_id: 1-9, secret: x }\n";
        assert!(matches!(
            Settings::from_yaml(yaml, Overrides::default()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn unknown_ledger_type_is_fatal() {
        let yaml = r#"
period: { start_year: 2023, start_month: 1, end_year: 2023, end_month: 3 }
ledger_types: [boletas]
credentials: { taxpayer_id: 1-9, secret: x }
"#;
        assert!(matches!(
            Settings::from_yaml(yaml, Overrides::default()),
            Err(ConfigError::LedgerKind(_))
        ));
    }

    #[test]
    fn debug_hides_secret() {
        let account = Account {
            taxpayer_id: "1-9".to_string(),
            secret: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", account).contains("hunter2"));
    }
}
