use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::{Result, WorkflowError};
use crate::models::GroupId;
use crate::poller::{self, Check, Clock, PollOutcome, PollPolicy};
use crate::session::Reply;
use crate::table::{self, CanonicalField, Table};
use crate::vendor::{json_field, json_items, VendorAdapter};

/// Where imported contacts go. There is no implicit default.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportMode {
    CreateGroup(String),
    ExistingGroup(GroupId),
}

/// The file as it is sent to the vendor.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub group_id: GroupId,
    pub rows: usize,
    /// Contacts the vendor reported in the group once it was ready. `None`
    /// when the profile has no import-status endpoint.
    pub listed: Option<usize>,
}

/// How long to wait for the vendor to process an import.
pub fn import_wait_policy() -> PollPolicy {
    PollPolicy {
        interval: Duration::from_secs(5),
        max_interval: Duration::from_secs(20),
        max_attempts: 12,
        budget: Duration::from_secs(5 * 60),
        jitter: 0.1,
    }
}

/// Group-list lookups: the first call plus one retry.
fn lookup_policy() -> PollPolicy {
    PollPolicy {
        interval: Duration::from_secs(3),
        max_interval: Duration::from_secs(3),
        max_attempts: 2,
        budget: Duration::from_secs(60),
        jitter: 0.0,
    }
}

/// Copies alias columns into missing canonical columns. Returns the names
/// of the columns that were added.
pub fn normalize_headers(table: &mut Table) -> Vec<&'static str> {
    let mut added = Vec::new();
    for field in CanonicalField::ALL {
        if table.column(field.header()).is_some() {
            continue;
        }
        let Some(source) = field.aliases().iter().find_map(|alias| table.column(alias)) else {
            continue;
        };
        debug!("Mapping column '{}' to '{}'", table.headers[source], field.header());
        let target = table.ensure_column(field.header());
        for row in &mut table.rows {
            row[target] = row[source].clone();
        }
        added.push(field.header());
    }
    added
}

/// Reads the input file and builds the normalised CSV upload from it.
pub fn prepare_upload(path: &Path) -> Result<(Table, Upload)> {
    let mut table = table::read_table(path).map_err(|e| WorkflowError::Import(format!("{:#}", e)))?;
    if table.rows.is_empty() {
        return Err(WorkflowError::Import(format!("{} has no data rows", path.display())));
    }

    let added = normalize_headers(&mut table);
    if !added.is_empty() {
        info!("Added canonical columns for upload: {}", added.join(", "));
    }
    for field in [CanonicalField::FirstName, CanonicalField::LastName, CanonicalField::StreetAddress] {
        if table.find_field(field).is_none() {
            warn!("No '{}' column found; the vendor may reject the file", field.header());
        }
    }

    let bytes = table
        .to_csv_bytes()
        .map_err(|e| WorkflowError::Import(format!("could not encode upload: {:#}", e)))?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("contacts");
    let upload = Upload {
        file_name: format!("{}.csv", stem),
        content_type: "text/csv".to_string(),
        bytes,
    };
    Ok((table, upload))
}

/// Uploads `path`, files its contacts under a group according to `mode` and
/// waits under `wait` until the vendor lists contacts in that group.
pub fn import_contacts<A, C>(
    adapter: &mut A,
    path: &Path,
    mode: &ImportMode,
    wait: &PollPolicy,
    clock: &mut C,
) -> Result<ImportOutcome>
where
    A: VendorAdapter + ?Sized,
    C: Clock + ?Sized,
{
    let (table, upload) = prepare_upload(path)?;

    // An unknown group must fail before anything is sent
    if let ImportMode::ExistingGroup(id) = mode {
        find_group(adapter, clock, |group, fields| {
            json_field(group, &fields.group_id).and_then(GroupId::from_json).as_ref() == Some(id)
        })
        .ok_or_else(|| WorkflowError::Import(format!("group {} is not in the group list", id)))?;
    }

    info!("Uploading {} ({} rows)", upload.file_name, table.rows.len());
    let reply = adapter
        .upload_file(&upload)
        .map_err(|e| WorkflowError::Import(format!("upload failed: {:#}", e)))?;
    let file_id = read_file_id(&reply, &adapter.profile().fields.file_id)?;
    debug!("Upload accepted as file {}", file_id);

    let reply = adapter
        .save_import(&file_id, mode)
        .map_err(|e| WorkflowError::Import(format!("saving import failed: {:#}", e)))?;
    if !reply.is_success() {
        return Err(WorkflowError::Import(format!("saving import answered HTTP {}", reply.status)));
    }

    let group_id = match mode {
        ImportMode::CreateGroup(name) => {
            let field = adapter.profile().fields.group_id.clone();
            let saved = reply
                .json()
                .and_then(|body| json_field(&body, &field).and_then(GroupId::from_json));
            match saved {
                Some(id) => id,
                None => {
                    debug!("Save response carries no '{}'; looking the group up by name", field);
                    find_group(adapter, clock, |group, fields| {
                        json_field(group, &fields.group_name).and_then(Value::as_str) == Some(name.as_str())
                    })
                    .ok_or_else(|| WorkflowError::Import(format!("group '{}' not found after import", name)))?
                }
            }
        }
        ImportMode::ExistingGroup(id) => id.clone(),
    };

    let listed = wait_for_import(adapter, &group_id, wait, clock)?;
    info!("Imported {} rows into group {}", table.rows.len(), group_id);
    Ok(ImportOutcome {
        group_id,
        rows: table.rows.len(),
        listed,
    })
}

/// Polls the import-status endpoint until the group lists at least one
/// contact. Returns the count, or `None` when the profile has no such
/// endpoint.
fn wait_for_import<A, C>(adapter: &mut A, group: &GroupId, policy: &PollPolicy, clock: &mut C) -> Result<Option<usize>>
where
    A: VendorAdapter + ?Sized,
    C: Clock + ?Sized,
{
    let outcome = poller::poll(policy, clock, |attempt| {
        let Some(reply) = adapter.import_status(group)? else {
            return Ok(Check::Ready(None));
        };
        if !reply.is_success() {
            anyhow::bail!("import status answered HTTP {}", reply.status);
        }
        let body = reply
            .json()
            .ok_or_else(|| anyhow::anyhow!("import status is not JSON"))?;
        let size = group_size(&body, &adapter.profile().fields);
        debug!("Group {} lists {} contacts (check {})", group, size, attempt);
        Ok(if size > 0 {
            Check::Ready(Some(size))
        } else {
            Check::Pending("no contacts listed yet".to_string())
        })
    });

    match outcome {
        PollOutcome::Completed { value, .. } => Ok(value),
        PollOutcome::Failed { status, .. } => Err(WorkflowError::Import(status)),
        PollOutcome::TimedOut { attempts, elapsed } => Err(WorkflowError::Import(format!(
            "group {} still lists no contacts after {} checks in {}s",
            group,
            attempts,
            elapsed.as_secs()
        ))),
    }
}

/// The contact count a group answers with: the configured count field, or
/// the length of its contact array.
fn group_size(body: &Value, fields: &crate::config::ResponseFields) -> usize {
    let counted = json_field(body, &fields.group_size).and_then(|v| match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    });
    match counted {
        Some(n) => n as usize,
        None => json_items(body, &fields.contacts).map_or(0, Vec::len),
    }
}

fn read_file_id(reply: &Reply, field: &str) -> Result<String> {
    if !reply.is_success() {
        return Err(WorkflowError::Import(format!("upload answered HTTP {}", reply.status)));
    }
    reply
        .json()
        .and_then(|body| match json_field(&body, field)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| WorkflowError::Import(format!("upload response lacks '{}'", field)))
}

/// Searches the group list for the first group `matches` accepts.
fn find_group<A, C, M>(adapter: &mut A, clock: &mut C, matches: M) -> Option<GroupId>
where
    A: VendorAdapter + ?Sized,
    C: Clock + ?Sized,
    M: Fn(&Value, &crate::config::ResponseFields) -> bool,
{
    let outcome = poller::poll(&lookup_policy(), clock, |attempt| {
        debug!("Reading group list (attempt {})", attempt);
        let reply = adapter.list_groups()?;
        if !reply.is_success() {
            anyhow::bail!("group list answered HTTP {}", reply.status);
        }
        let body = reply
            .json()
            .ok_or_else(|| anyhow::anyhow!("group list is not JSON"))?;
        let fields = &adapter.profile().fields;
        let found = json_items(&body, &fields.groups)
            .into_iter()
            .flatten()
            .find(|group| matches(*group, fields))
            .and_then(|group| json_field(group, &fields.group_id).and_then(GroupId::from_json));
        Ok(match found {
            Some(id) => Check::Ready(id),
            None => Check::Pending("group not listed yet".to_string()),
        })
    });

    match outcome {
        PollOutcome::Completed { value, .. } => Some(value),
        _ => None,
    }
}
