use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Credentials;
use crate::errors::{Result, Step, WorkflowError};
use crate::exporter::{self, MergeOptions, MergeReport};
use crate::extractor;
use crate::importer::{self, ImportMode};
use crate::models::{GroupId, OrderId};
use crate::order::{self, OrderRequest};
use crate::poller::{Clock, PollPolicy};
use crate::tui::WorkflowTUI;
use crate::vendor::VendorAdapter;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub mode: ImportMode,
    /// Trace only these vendor contact ids instead of the whole group.
    pub contact_ids: Option<Vec<String>>,
    pub list_name: Option<String>,
    /// Wait for the vendor to list the imported contacts.
    pub import_wait: PollPolicy,
    pub poll: PollPolicy,
    /// Wall-clock budget for the whole run; also caps the poll budget.
    pub run_budget: Duration,
    pub merge: MergeOptions,
    /// Keep a JSON copy of the extracted contacts beside the output.
    pub snapshot: bool,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub group_id: GroupId,
    pub order_id: OrderId,
    pub poll_attempts: u32,
    pub contacts: usize,
    pub report: MergeReport,
    pub output: PathBuf,
    pub snapshot: Option<PathBuf>,
}

/// Forwards progress to the TUI when there is one. Drawing errors never
/// stop a run.
struct Progress<'a> {
    tui: Option<&'a mut WorkflowTUI>,
}

impl Progress<'_> {
    fn start(&mut self, step: Step) {
        info!("Step: {}", step);
        if let Some(tui) = self.tui.as_deref_mut() {
            let _ = tui.start_step(step);
        }
    }

    fn activity(&mut self, detail: String) {
        if let Some(tui) = self.tui.as_deref_mut() {
            let _ = tui.update_activity(detail);
        }
    }

    fn done(&mut self, step: Step, detail: String) {
        debug!("Step '{}' done: {}", step, detail);
        if let Some(tui) = self.tui.as_deref_mut() {
            let _ = tui.complete_step(step, detail);
        }
    }

    fn fail(&mut self, error: &WorkflowError) {
        if let Some(tui) = self.tui.as_deref_mut() {
            let _ = tui.fail_step(error.step(), error.to_string());
        }
    }
}

fn check_budget<C: Clock + ?Sized>(clock: &C, budget: Duration, step: Step) -> Result<Duration> {
    let remaining = budget.saturating_sub(clock.elapsed());
    if remaining.is_zero() {
        return Err(WorkflowError::RunBudgetExceeded { step });
    }
    Ok(remaining)
}

/// Runs login → probe → import → order → poll → extract → export and stops
/// at the first failing step.
pub fn run_workflow<A, C>(
    adapter: &mut A,
    credentials: &Credentials,
    options: &RunOptions,
    clock: &mut C,
    tui: Option<&mut WorkflowTUI>,
) -> Result<RunSummary>
where
    A: VendorAdapter + ?Sized,
    C: Clock + ?Sized,
{
    let mut progress = Progress { tui };
    let result = run_steps(adapter, credentials, options, clock, &mut progress);
    if let Err(e) = &result {
        progress.fail(e);
    }
    result
}

fn run_steps<A, C>(
    adapter: &mut A,
    credentials: &Credentials,
    options: &RunOptions,
    clock: &mut C,
    progress: &mut Progress<'_>,
) -> Result<RunSummary>
where
    A: VendorAdapter + ?Sized,
    C: Clock + ?Sized,
{
    // Nothing is paid for until we know the output can be written
    exporter::ensure_distinct(&options.input, &options.output)?;

    check_budget(clock, options.run_budget, Step::Authenticate)?;
    progress.start(Step::Authenticate);
    adapter.login(credentials)?;
    progress.done(Step::Authenticate, format!("signed in as {}", credentials.username));

    check_budget(clock, options.run_budget, Step::Probe)?;
    progress.start(Step::Probe);
    let surface = adapter.probe()?;
    progress.done(Step::Probe, format!("{:?} surface", surface));

    let remaining = check_budget(clock, options.run_budget, Step::Import)?;
    progress.start(Step::Import);
    let wait = options.import_wait.capped_at(remaining);
    let imported = importer::import_contacts(adapter, &options.input, &options.mode, &wait, clock)?;
    let listed = match imported.listed {
        Some(n) => format!(", {} listed", n),
        None => String::new(),
    };
    progress.done(
        Step::Import,
        format!("{} rows into group {}{}", imported.rows, imported.group_id, listed),
    );

    check_budget(clock, options.run_budget, Step::Order)?;
    progress.start(Step::Order);
    let mut request = OrderRequest::new(imported.group_id.clone());
    if let Some(ids) = &options.contact_ids {
        request = request.with_contacts(ids.clone());
    }
    if let Some(name) = &options.list_name {
        request = request.with_list_name(name.clone());
    }
    let order_id = order::place_order(adapter, &request)?;
    progress.done(Step::Order, format!("order {} ('{}')", order_id, request.list_name));

    let remaining = check_budget(clock, options.run_budget, Step::Poll)?;
    progress.start(Step::Poll);
    let policy = options.poll.capped_at(remaining);
    let poll_attempts = order::wait_for_order(adapter, &order_id, &policy, clock, |attempt, status| {
        progress.activity(format!("attempt {}/{}: {}", attempt, policy.max_attempts, status));
    })?;
    progress.done(Step::Poll, format!("completed after {} checks", poll_attempts));

    check_budget(clock, options.run_budget, Step::Extract)?;
    progress.start(Step::Extract);
    let reply = adapter
        .fetch_contacts(&imported.group_id, surface)
        .map_err(|e| WorkflowError::Extraction(format!("contact listing unreachable: {:#}", e)))?;
    let contacts = extractor::extract(&reply, adapter.profile())?;
    progress.done(Step::Extract, format!("{} contacts", contacts.len()));

    let snapshot = if options.snapshot {
        let path = exporter::snapshot_path(&options.output);
        match exporter::save_snapshot(&path, &contacts) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Contacts snapshot not written: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    check_budget(clock, options.run_budget, Step::Export)?;
    progress.start(Step::Export);
    let report = exporter::export(&options.input, &options.output, &contacts, &options.merge)?;
    progress.done(
        Step::Export,
        format!("{} matched, {} appended", report.matched, report.appended),
    );

    Ok(RunSummary {
        group_id: imported.group_id,
        order_id,
        poll_attempts,
        contacts: contacts.len(),
        report,
        output: options.output.clone(),
        snapshot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VendorProfile;
    use crate::exporter::MatchStrategy;
    use crate::importer::Upload;
    use crate::order::WizardStep;
    use crate::poller::tests::FakeClock;
    use crate::session::Reply;
    use crate::vendor::Surface;
    use std::collections::VecDeque;

    fn json(status: u16, body: &str) -> Reply {
        Reply {
            status,
            url: "https://app.acme.test/api".into(),
            content_type: "application/json".into(),
            body: body.into(),
        }
    }

    /// Answers every call from canned replies and records what was asked.
    struct ScriptedVendor {
        profile: VendorProfile,
        statuses: VecDeque<Reply>,
        imports: VecDeque<Reply>,
        groups: Reply,
        contacts: Reply,
        calls: Vec<String>,
        login_ok: bool,
    }

    impl ScriptedVendor {
        fn new() -> Self {
            Self {
                profile: VendorProfile {
                    name: "Acme".into(),
                    ..Default::default()
                },
                statuses: VecDeque::from(vec![
                    json(200, r#"{"status": "processing"}"#),
                    json(200, r#"{"status": "completed"}"#),
                ]),
                imports: VecDeque::from(vec![json(200, r#"{"total": 2}"#)]),
                groups: json(200, "[]"),
                contacts: json(
                    200,
                    r#"[{"firstName": "John", "lastName": "Doe", "phone": "616-555-1212"}]"#,
                ),
                calls: Vec::new(),
                login_ok: true,
            }
        }
    }

    impl VendorAdapter for ScriptedVendor {
        fn name(&self) -> &str {
            &self.profile.name
        }

        fn profile(&self) -> &VendorProfile {
            &self.profile
        }

        fn login(&mut self, _credentials: &Credentials) -> Result<()> {
            self.calls.push("login".into());
            if self.login_ok {
                Ok(())
            } else {
                Err(WorkflowError::Authentication("bad password".into()))
            }
        }

        fn probe(&mut self) -> Result<Surface> {
            self.calls.push("probe".into());
            Ok(Surface::Api)
        }

        fn upload_file(&mut self, upload: &Upload) -> anyhow::Result<Reply> {
            self.calls.push(format!("upload {}", upload.file_name));
            Ok(json(200, r#"{"id": "F1"}"#))
        }

        fn save_import(&mut self, file_id: &str, _mode: &ImportMode) -> anyhow::Result<Reply> {
            self.calls.push(format!("save {}", file_id));
            Ok(json(200, r#"{"id": 4242}"#))
        }

        fn list_groups(&mut self) -> anyhow::Result<Reply> {
            self.calls.push("groups".into());
            Ok(self.groups.clone())
        }

        fn import_status(&mut self, group: &GroupId) -> anyhow::Result<Option<Reply>> {
            self.calls.push(format!("import status {}", group));
            Ok(Some(
                self.imports
                    .pop_front()
                    .unwrap_or_else(|| json(200, r#"{"total": 0}"#)),
            ))
        }

        fn wizard_step(&mut self, step: WizardStep, _request: &OrderRequest, _order: Option<&OrderId>) -> anyhow::Result<Reply> {
            self.calls.push(step.label().into());
            Ok(match step {
                WizardStep::PlaceOrder => json(200, r#"{"id": "O-9"}"#),
                _ => json(200, "{}"),
            })
        }

        fn order_status(&mut self, _order: &OrderId) -> anyhow::Result<Reply> {
            self.calls.push("status".into());
            Ok(self
                .statuses
                .pop_front()
                .unwrap_or_else(|| json(200, r#"{"status": "processing"}"#)))
        }

        fn fetch_contacts(&mut self, group: &GroupId, _surface: Surface) -> anyhow::Result<Reply> {
            self.calls.push(format!("contacts {}", group));
            Ok(self.contacts.clone())
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "agent@example.com".into(),
            password: "hunter2".into(),
        }
    }

    fn options(dir: &std::path::Path) -> RunOptions {
        let input = dir.join("leads.csv");
        std::fs::write(&input, "First Name,Last Name,Zip\nJohn,Doe,49503\nMary,Major,49506\n").unwrap();
        RunOptions {
            output: exporter::default_output_path(&input),
            input,
            mode: ImportMode::CreateGroup("March leads".into()),
            contact_ids: None,
            list_name: None,
            import_wait: PollPolicy {
                interval: Duration::from_secs(5),
                max_interval: Duration::from_secs(5),
                max_attempts: 3,
                budget: Duration::from_secs(60),
                jitter: 0.0,
            },
            poll: PollPolicy {
                interval: Duration::from_secs(10),
                max_interval: Duration::from_secs(60),
                max_attempts: 5,
                budget: Duration::from_secs(600),
                jitter: 0.0,
            },
            run_budget: Duration::from_secs(3600),
            merge: MergeOptions {
                strategy: MatchStrategy::default(),
                source_label: "Acme".into(),
                timestamp: "2024-03-07 10:00:00".into(),
            },
            snapshot: true,
        }
    }

    #[test]
    fn full_run_enriches_matching_row() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        let mut vendor = ScriptedVendor::new();
        let mut clock = FakeClock::default();

        let summary = run_workflow(&mut vendor, &credentials(), &opts, &mut clock, None).unwrap();

        assert_eq!(summary.group_id, GroupId::new("4242"));
        assert_eq!(summary.order_id, OrderId::new("O-9"));
        assert_eq!(summary.poll_attempts, 2);
        assert_eq!(summary.report.matched, 1);
        assert_eq!(
            vendor.calls,
            [
                "login",
                "probe",
                "upload leads.csv",
                "save F1",
                "import status 4242",
                "select contacts",
                "place order",
                "accept terms",
                "name list",
                "status",
                "status",
                "contacts 4242",
            ]
        );

        let written = std::fs::read_to_string(&opts.output).unwrap();
        let mut lines = written.lines();
        assert_eq!(
            lines.next(),
            Some("First Name,Last Name,Zip,Phone,Mobile Phone,Landline,Email,Acme Updated Date & Time")
        );
        assert_eq!(lines.next(), Some("John,Doe,49503,616-555-1212,,,,2024-03-07 10:00:00"));
        assert_eq!(lines.next(), Some("Mary,Major,49506,,,,,"));
        assert!(summary.snapshot.unwrap().exists());
    }

    #[test]
    fn order_waits_until_import_lists_contacts() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        let mut vendor = ScriptedVendor {
            imports: VecDeque::from(vec![
                json(200, r#"{"total": 0}"#),
                json(200, r#"{"status": "processing"}"#),
                json(200, r#"{"total": 2}"#),
            ]),
            ..ScriptedVendor::new()
        };
        let mut clock = FakeClock::default();

        run_workflow(&mut vendor, &credentials(), &opts, &mut clock, None).unwrap();

        let first_order_call = vendor.calls.iter().position(|c| c == "select contacts").unwrap();
        let waits = vendor.calls[..first_order_call]
            .iter()
            .filter(|c| c.starts_with("import status"))
            .count();
        assert_eq!(waits, 3);
        assert_eq!(clock.sleeps[..2], [Duration::from_secs(5), Duration::from_secs(5)]);
    }

    #[test]
    fn import_that_never_lists_contacts_places_no_order() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        let mut vendor = ScriptedVendor {
            imports: VecDeque::new(),
            ..ScriptedVendor::new()
        };

        let err = run_workflow(&mut vendor, &credentials(), &opts, &mut FakeClock::default(), None).unwrap_err();

        assert!(matches!(err, WorkflowError::Import(ref msg) if msg.contains("after 3 checks")));
        assert_eq!(vendor.calls.iter().filter(|c| c.starts_with("import status")).count(), 3);
        assert!(!vendor.calls.iter().any(|c| c == "select contacts"));
    }

    #[test]
    fn unknown_existing_group_fails_before_upload() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.mode = ImportMode::ExistingGroup(GroupId::new("C404"));
        let mut vendor = ScriptedVendor::new();

        let err = run_workflow(&mut vendor, &credentials(), &opts, &mut FakeClock::default(), None).unwrap_err();

        assert_eq!(err.step(), Step::Import);
        assert_eq!(vendor.calls, ["login", "probe", "groups", "groups"]);
    }

    #[test]
    fn existing_group_is_confirmed_then_filled() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.mode = ImportMode::ExistingGroup(GroupId::new("C77"));
        let mut vendor = ScriptedVendor {
            groups: json(200, r#"[{"id": "C77", "name": "Old leads"}]"#),
            ..ScriptedVendor::new()
        };

        let summary = run_workflow(&mut vendor, &credentials(), &opts, &mut FakeClock::default(), None).unwrap();

        assert_eq!(summary.group_id, GroupId::new("C77"));
        assert_eq!(
            vendor.calls[..6],
            ["login", "probe", "groups", "upload leads.csv", "save F1", "import status C77"]
        );
    }

    #[test]
    fn failed_login_stops_before_import() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        let mut vendor = ScriptedVendor {
            login_ok: false,
            ..ScriptedVendor::new()
        };

        let err = run_workflow(&mut vendor, &credentials(), &opts, &mut FakeClock::default(), None).unwrap_err();

        assert_eq!(err.step(), Step::Authenticate);
        assert_eq!(vendor.calls, ["login"]);
        assert!(!opts.output.exists());
    }

    #[test]
    fn vendor_failure_status_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        let mut vendor = ScriptedVendor {
            statuses: VecDeque::from(vec![json(200, r#"{"status": "Cancelled"}"#)]),
            ..ScriptedVendor::new()
        };

        let err = run_workflow(&mut vendor, &credentials(), &opts, &mut FakeClock::default(), None).unwrap_err();

        assert!(matches!(err, WorkflowError::PollFailed { ref status, .. } if status == "cancelled"));
        assert!(!vendor.calls.iter().any(|c| c.starts_with("contacts")));
        assert!(!opts.output.exists());
    }

    #[test]
    fn pending_order_times_out_within_run_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.run_budget = Duration::from_secs(45);
        let mut vendor = ScriptedVendor {
            statuses: VecDeque::new(),
            ..ScriptedVendor::new()
        };
        let mut clock = FakeClock::default();

        let err = run_workflow(&mut vendor, &credentials(), &opts, &mut clock, None).unwrap_err();

        match err {
            WorkflowError::PollTimeout { attempts, elapsed, .. } => {
                // Checks at 0s, 10s, 30s and a last one when the budget runs out at 45s
                assert_eq!(attempts, 4);
                assert_eq!(elapsed, Duration::from_secs(45));
            }
            other => panic!("expected a poll timeout, got {:?}", other),
        }
        assert_eq!(clock.now, Duration::from_secs(45));
    }

    #[test]
    fn exhausted_run_budget_names_the_next_step() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        let mut clock = FakeClock {
            now: Duration::from_secs(3600),
            ..Default::default()
        };

        let err = run_workflow(&mut ScriptedVendor::new(), &credentials(), &opts, &mut clock, None).unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::RunBudgetExceeded {
                step: Step::Authenticate
            }
        ));
    }

    #[test]
    fn output_equal_to_input_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.output = opts.input.clone();
        let mut vendor = ScriptedVendor::new();

        let err = run_workflow(&mut vendor, &credentials(), &opts, &mut FakeClock::default(), None).unwrap_err();

        assert_eq!(err.step(), Step::Export);
        assert!(vendor.calls.is_empty());
    }
}
