use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use std::path::PathBuf;

use skiptracer::config::VendorProfile;
use skiptracer::exporter::{self, MatchKey, MatchStrategy, MergeOptions};
use skiptracer::logging;

/// Merge a saved contacts snapshot into a spreadsheet without placing a new order
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Original contact spreadsheet (CSV or XLSX)
    input: PathBuf,

    /// Contacts snapshot written by a previous run (*.contacts.json)
    contacts: PathBuf,

    /// Merged CSV to write [default: <input>.enriched.csv]
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Vendor profile, used for the default source label
    #[arg(long, env = "SKIPTRACER_VENDOR_CONFIG")]
    vendor_config: Option<PathBuf>,

    /// Columns a contact must agree on with a row (first-name, last-name, zip, address)
    #[arg(long, value_delimiter = ',')]
    match_on: Vec<MatchKey>,

    /// Match the i-th contact to the i-th row
    #[arg(long)]
    positional: bool,

    /// Fill rows left unmatched by key in order
    #[arg(long)]
    fallback_positional: bool,

    /// Prefix of the "<Source> Updated Date & Time" column [default: vendor name]
    #[arg(long)]
    source_label: Option<String>,

    /// Value for the timestamp column [default: now]
    #[arg(long)]
    timestamp: Option<String>,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.debug, false);

    let source_label = match (&args.source_label, &args.vendor_config) {
        (Some(label), _) => label.clone(),
        (None, Some(path)) => VendorProfile::load(path)?.name,
        (None, None) => VendorProfile::default().name,
    };

    let contacts = exporter::load_snapshot(&args.contacts)?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| exporter::default_output_path(&args.input));

    let options = MergeOptions {
        strategy: MatchStrategy::from_switches(&args.match_on, args.positional, args.fallback_positional),
        source_label,
        timestamp: args
            .timestamp
            .clone()
            .unwrap_or_else(|| Local::now().format("%Y-%m-%d %H:%M:%S").to_string()),
    };

    let report = exporter::export(&args.input, &output, &contacts, &options)
        .with_context(|| format!("Failed to merge {} into {}", args.contacts.display(), args.input.display()))?;

    println!(
        "Merged {} contacts into {}: {} matched, {} appended, {} rows",
        contacts.len(),
        output.display(),
        report.matched,
        report.appended,
        report.rows_total
    );
    Ok(())
}
