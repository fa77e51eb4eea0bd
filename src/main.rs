use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use skiptracer::config::{Credentials, VendorProfile};
use skiptracer::errors::WorkflowError;
use skiptracer::exporter::{self, MatchKey, MatchStrategy, MergeOptions};
use skiptracer::importer::{self, ImportMode};
use skiptracer::logging;
use skiptracer::models::GroupId;
use skiptracer::poller::{PollPolicy, SystemClock};
use skiptracer::tui::WorkflowTUI;
use skiptracer::vendor::{HttpVendor, VendorAdapter};
use skiptracer::workflow::{run_workflow, RunOptions};

#[derive(Parser, Debug)]
#[command(author, version, about = "Skip-trace a contact spreadsheet through a vendor portal and merge the results back")]
struct Args {
    /// Contact spreadsheet to import (CSV or XLSX)
    input: PathBuf,

    /// Merged CSV to write [default: <input>.enriched.csv]
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// TOML file with the vendor's URLs, endpoints, fields and selectors
    #[arg(long, env = "SKIPTRACER_VENDOR_CONFIG")]
    vendor_config: Option<PathBuf>,

    /// Import into a new group with this name
    #[arg(long, conflicts_with = "group_id", required_unless_present = "group_id")]
    group_name: Option<String>,

    /// Import into this existing group
    #[arg(long)]
    group_id: Option<String>,

    /// Trace only these vendor contact ids (comma separated)
    #[arg(long, value_delimiter = ',')]
    contact_ids: Option<Vec<String>>,

    /// Name of the skip-trace list [default: "MM/DD/YYYY - <group id>"]
    #[arg(long)]
    list_name: Option<String>,

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

    /// Seconds before the second status check; doubles after each check
    #[arg(long, default_value = "15")]
    poll_interval: u64,

    /// Upper bound in seconds for the delay between status checks
    #[arg(long, default_value = "120")]
    poll_max_interval: u64,

    /// Maximum number of status checks
    #[arg(long, default_value = "40")]
    poll_attempts: u32,

    /// Random extra delay as a fraction of each delay
    #[arg(long, default_value = "0.2")]
    poll_jitter: f64,

    /// Minutes to wait for the vendor to list the imported contacts
    #[arg(long, default_value = "5")]
    import_wait: u64,

    /// Minutes the whole run may take
    #[arg(long, default_value = "45")]
    run_budget: u64,

    /// Write every vendor response into this directory
    #[arg(long)]
    dump_dir: Option<PathBuf>,

    /// Do not keep a JSON copy of the extracted contacts
    #[arg(long)]
    no_snapshot: bool,

    /// Plain log output instead of the step display
    #[arg(long)]
    plain: bool,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let use_tui = !args.plain && io::stdout().is_terminal();
    logging::init(args.debug, use_tui);

    match run(args, use_tui) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<WorkflowError>() {
                Some(failure) => eprintln!("Error: step '{}' failed: {}", failure.step(), failure),
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

fn minutes(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(60))
}

fn run(args: Args, use_tui: bool) -> Result<()> {
    let profile = match &args.vendor_config {
        Some(path) => VendorProfile::load(path)?,
        None => VendorProfile::default(),
    };
    let credentials = Credentials::from_env()?;

    if let Some(dir) = &args.dump_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create dump directory: {}", dir.display()))?;
    }

    let mode = match (&args.group_name, &args.group_id) {
        (Some(name), _) => ImportMode::CreateGroup(name.clone()),
        (None, Some(id)) => ImportMode::ExistingGroup(GroupId::new(id.clone())),
        (None, None) => anyhow::bail!("either --group-name or --group-id is required"),
    };

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| exporter::default_output_path(&args.input));
    let run_budget = minutes(args.run_budget);

    let options = RunOptions {
        input: args.input.clone(),
        output,
        mode,
        contact_ids: args.contact_ids.clone(),
        list_name: args.list_name.clone(),
        import_wait: PollPolicy {
            budget: minutes(args.import_wait),
            ..importer::import_wait_policy()
        },
        poll: PollPolicy {
            interval: Duration::from_secs(args.poll_interval),
            max_interval: Duration::from_secs(args.poll_max_interval.max(args.poll_interval)),
            max_attempts: args.poll_attempts,
            budget: run_budget,
            jitter: args.poll_jitter,
        },
        run_budget,
        merge: MergeOptions {
            strategy: MatchStrategy::from_switches(&args.match_on, args.positional, args.fallback_positional),
            source_label: args.source_label.clone().unwrap_or_else(|| profile.name.clone()),
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        },
        snapshot: !args.no_snapshot,
    };

    let mut vendor = HttpVendor::new(profile, args.dump_dir.clone())?;
    let mut clock = SystemClock::new();
    let mut tui = use_tui.then(WorkflowTUI::new);

    if let Some(tui) = tui.as_mut() {
        tui.show_plan(vendor.name(), &options.input.display().to_string())?;
    }

    let result = run_workflow(&mut vendor, &credentials, &options, &mut clock, tui.as_mut());

    if let Some(tui) = tui.as_mut() {
        let written = options.output.display().to_string();
        tui.show_final_summary(result.as_ref().ok().map(|_| written.as_str()))?;
    }

    let summary = result?;
    if !use_tui {
        println!("Group:    {}", summary.group_id);
        println!("Order:    {} ({} status checks)", summary.order_id, summary.poll_attempts);
        println!(
            "Contacts: {} extracted, {} matched, {} appended",
            summary.contacts, summary.report.matched, summary.report.appended
        );
        println!("Output:   {}", summary.output.display());
        if let Some(snapshot) = &summary.snapshot {
            println!("Snapshot: {}", snapshot.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_minute_counts_saturate() {
        assert_eq!(minutes(45), Duration::from_secs(2700));
        assert_eq!(minutes(u64::MAX), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn group_flags_are_exclusive_and_required() {
        assert!(Args::try_parse_from(["skiptracer", "leads.csv"]).is_err());
        assert!(Args::try_parse_from(["skiptracer", "leads.csv", "--group-name", "a", "--group-id", "1"]).is_err());
        let args = Args::try_parse_from(["skiptracer", "leads.csv", "--group-id", "C1", "--run-budget", "999999999999999999"]).unwrap();
        assert_eq!(minutes(args.run_budget), Duration::from_secs(u64::MAX));
    }
}
