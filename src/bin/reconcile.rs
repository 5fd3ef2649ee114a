use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use rcv_fetch::reconcile::{reconcile_files, ColumnAliases};

/// Pairs bank statement movements with accounting book entries that share
/// the same date and amount.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Bank statement (.csv, .xls or .xlsx)
    bank: PathBuf,

    /// Accounting book (.csv, .xls or .xlsx)
    book: PathBuf,

    /// Report to write (.xlsx or .csv)
    output: PathBuf,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
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

    match reconcile_files(&cli.bank, &cli.book, &cli.output, &ColumnAliases::default()) {
        Ok(report) => {
            println!(
                "{} row(s), {} matched → {}",
                report.rows,
                report.matched,
                report.output.display()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
