use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing::{error, info, info_span, warn};

use crate::{
    calculate::NetEffect,
    config::{Account, Settings},
    consolidate::{consolidate_ledger, ConsolidationWarning},
    interrupt::{is_interrupted, Interrupt},
    ledger::{account_dir, LedgerKind},
    session::{Extraction, ExtractionReport},
    table::{read_xlsx, write_xlsx},
    webdriver::{Browser, ChromeOptions, ChromeSession},
    Result,
};

/// What happened to one ledger of one account.
#[derive(Debug)]
pub struct LedgerOutcome {
    pub taxpayer_id: String,
    pub kind: LedgerKind,
    pub extraction: Option<ExtractionReport>,
    pub consolidated: Option<PathBuf>,
    pub calculated: Option<PathBuf>,
    pub rows: usize,
    pub warnings: Vec<ConsolidationWarning>,
    pub errors: Vec<String>,
}

impl LedgerOutcome {
    fn new(account: &Account, kind: LedgerKind) -> Self {
        Self {
            taxpayer_id: account.taxpayer_id.clone(),
            kind,
            extraction: None,
            consolidated: None,
            calculated: None,
            rows: 0,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub ledgers: Vec<LedgerOutcome>,
    pub failed_accounts: Vec<(String, String)>,
}

impl RunSummary {
    pub fn calculated(&self) -> impl Iterator<Item = &Path> {
        self.ledgers.iter().filter_map(|l| l.calculated.as_deref())
    }
}

pub fn debug_dir(base_dir: &Path) -> PathBuf {
    base_dir.join("debug")
}

/// Runs every account and ledger type with a real Chrome session.
pub fn run(settings: &Settings, interrupt: &Interrupt) -> Result<RunSummary> {
    run_with(settings, interrupt, ChromeSession::start)
}

/// Same as [`run`], with the browser supplied by `launch`. Only an interrupt
/// ends the run early; any other failure is recorded and the next ledger or
/// account is processed.
pub fn run_with<B, F>(settings: &Settings, interrupt: &Interrupt, mut launch: F) -> Result<RunSummary>
where
    B: Browser,
    F: FnMut(&ChromeOptions) -> Result<B>,
{
    let mut summary = RunSummary::default();
    info!(
        "{} account(s), {} ledger type(s), {}",
        settings.accounts.len(),
        settings.ledger_kinds.len(),
        settings.range
    );

    for account in &settings.accounts {
        interrupt.check()?;
        let span = info_span!("account", id = %account.taxpayer_id);
        let _guard = span.enter();

        if let Err(e) = process_account(settings, account, interrupt, &mut launch, &mut summary) {
            if is_interrupted(&e) {
                return Err(e);
            }
            error!("account {} failed: {:#}", account.taxpayer_id, e);
            summary
                .failed_accounts
                .push((account.taxpayer_id.clone(), format!("{:#}", e)));
        }
    }
    Ok(summary)
}

fn process_account<B, F>(
    settings: &Settings,
    account: &Account,
    interrupt: &Interrupt,
    launch: &mut F,
    summary: &mut RunSummary,
) -> Result<()>
where
    B: Browser,
    F: FnMut(&ChromeOptions) -> Result<B>,
{
    let dir = account_dir(&settings.base_dir, &account.taxpayer_id);
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    for &kind in &settings.ledger_kinds {
        interrupt.check()?;
        let span = info_span!("ledger", kind = %kind);
        let _guard = span.enter();

        let mut outcome = LedgerOutcome::new(account, kind);
        if let Err(e) = process_ledger(settings, account, kind, &dir, interrupt, launch, &mut outcome) {
            if is_interrupted(&e) {
                return Err(e);
            }
            error!("{} failed: {:#}", kind.tab_label(), e);
            outcome.errors.push(format!("{:#}", e));
        }
        summary.ledgers.push(outcome);
    }
    Ok(())
}

fn process_ledger<B, F>(
    settings: &Settings,
    account: &Account,
    kind: LedgerKind,
    dir: &Path,
    interrupt: &Interrupt,
    launch: &mut F,
    outcome: &mut LedgerOutcome,
) -> Result<()>
where
    B: Browser,
    F: FnMut(&ChromeOptions) -> Result<B>,
{
    let export_dir = kind.export_dir(dir);

    if settings.run_extraction {
        match extract(settings, account, kind, &export_dir, interrupt, launch) {
            Ok(report) => {
                if !report.failed.is_empty() {
                    warn!("{} month(s) failed", report.failed.len());
                }
                outcome.extraction = Some(report);
            }
            Err(e) if is_interrupted(&e) => return Err(e),
            // Whatever was downloaded earlier is still worth consolidating.
            Err(e) => {
                error!("extraction failed: {:#}", e);
                outcome.errors.push(format!("extraction: {:#}", e));
            }
        }
    }

    interrupt.check()?;
    let consolidated_path = kind.consolidated_path(dir, &account.taxpayer_id);
    let report = consolidate_ledger(&export_dir, &settings.header_template, kind, &consolidated_path)?;
    outcome.warnings = report.warnings;
    let Some(consolidated) = report.output else {
        warn!("nothing consolidated; skipping calculation");
        return Ok(());
    };
    outcome.consolidated = Some(consolidated.clone());

    let calculated_path = kind.calculated_path(dir, &account.taxpayer_id);
    outcome.rows = calculate(&consolidated, &calculated_path, &settings.reversing_types)?;
    info!("calculated ledger → {}", calculated_path.display());
    outcome.calculated = Some(calculated_path);
    Ok(())
}

fn extract<B, F>(
    settings: &Settings,
    account: &Account,
    kind: LedgerKind,
    export_dir: &Path,
    interrupt: &Interrupt,
    launch: &mut F,
) -> Result<ExtractionReport>
where
    B: Browser,
    F: FnMut(&ChromeOptions) -> Result<B>,
{
    let options = ChromeOptions {
        headless: settings.headless,
        chrome_binary: settings.chrome_binary.clone(),
        chromedriver: settings.chromedriver.clone(),
        download_dir: export_dir.to_path_buf(),
    };
    let mut browser = launch(&options).context("failed to start the browser")?;
    let mut extraction = Extraction::new(
        &mut browser,
        account,
        kind,
        export_dir.to_path_buf(),
        debug_dir(&settings.base_dir),
    )
    .with_interrupt(interrupt.clone());
    let report = extraction.run(&settings.range)?;
    Ok(report)
}

/// Adds the net-effect columns to a consolidated ledger and writes the
/// result next to it. Returns the number of rows written.
pub fn calculate(consolidated: &Path, output: &Path, reversing_types: &[String]) -> Result<usize> {
    let table = read_xlsx(consolidated)?;
    let calculated = NetEffect::default()
        .with_reversing_types(reversing_types)
        .apply(&table)
        .with_context(|| format!("cannot calculate {}", consolidated.display()))?;
    write_xlsx(&calculated, output)?;
    Ok(calculated.len())
}
