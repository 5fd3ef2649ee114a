use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use rcv_fetch::{is_interrupted, orchestrate, Interrupt, Overrides, RunSummary, Settings};

const EXIT_FAILURE: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

/// Downloads the purchase/sales register (RCV) from the tax portal and
/// consolidates it into one spreadsheet per account and ledger type.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Run Chrome without a window
    #[arg(long, overrides_with = "no_headless")]
    headless: bool,

    /// Show the Chrome window
    #[arg(long, overrides_with = "headless")]
    no_headless: bool,

    /// Only process this taxpayer id
    #[arg(long)]
    account: Option<String>,

    /// Ledger types to process, e.g. `venta,compra`
    #[arg(long, value_delimiter = ',')]
    types: Vec<String>,

    #[arg(long)]
    chrome_binary: Option<PathBuf>,

    #[arg(long)]
    chromedriver: Option<PathBuf>,

    /// Consolidate and calculate what is already on disk
    #[arg(long)]
    skip_extraction: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        let headless = match (self.headless, self.no_headless) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        Overrides {
            headless,
            chrome_binary: self.chrome_binary.clone(),
            chromedriver: self.chromedriver.clone(),
            account: self.account.clone(),
            ledger_types: self.types.clone(),
            skip_extraction: self.skip_extraction,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "rcv_fetch=debug"
    } else {
        "rcv_fetch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let settings = match Settings::load(&cli.config, cli.overrides()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let interrupt = Interrupt::new();
    let handle = interrupt.clone();
    if let Err(e) = ctrlc::set_handler(move || handle.trigger()) {
        warn!("failed to install the Ctrl-C handler: {}", e);
    }

    match orchestrate::run(&settings, &interrupt) {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::SUCCESS
        }
        Err(e) if is_interrupted(&e) => {
            warn!("interrupted by user");
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!("\n=== RCV SUMMARY ===\n");
    for ledger in &summary.ledgers {
        let months = ledger
            .extraction
            .as_ref()
            .map(|r| format!("{} month(s) downloaded, {} failed", r.downloaded.len(), r.failed.len()))
            .unwrap_or_else(|| "no extraction".to_string());
        let output = ledger
            .calculated
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "nothing written".to_string());
        println!(
            "{} {}: {}; {} row(s) → {}",
            ledger.taxpayer_id,
            ledger.kind.tab_label(),
            months,
            ledger.rows,
            output
        );
        for e in &ledger.errors {
            println!("  error: {}", e);
        }
    }
    for (id, e) in &summary.failed_accounts {
        println!("{}: FAILED ({})", id, e);
    }
}
