//! Merge-back of extracted contacts into the original spreadsheet.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::errors::{Result, WorkflowError};
use crate::models::{join_phones, Contact};
use crate::table::{self, CanonicalField, Table};

pub const PHONE_COLUMN: &str = "Phone";
pub const MOBILE_COLUMN: &str = "Mobile Phone";
pub const LANDLINE_COLUMN: &str = "Landline";
pub const EMAIL_COLUMN: &str = "Email";

pub fn timestamp_column(source_label: &str) -> String {
    format!("{} Updated Date & Time", source_label)
}

/// A column both the spreadsheet row and the contact must agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKey {
    FirstName,
    LastName,
    Zip,
    Address,
}

impl MatchKey {
    pub const DEFAULT: [MatchKey; 2] = [MatchKey::FirstName, MatchKey::LastName];

    fn field(&self) -> CanonicalField {
        match self {
            MatchKey::FirstName => CanonicalField::FirstName,
            MatchKey::LastName => CanonicalField::LastName,
            MatchKey::Zip => CanonicalField::Zip,
            MatchKey::Address => CanonicalField::StreetAddress,
        }
    }

    fn contact_value(&self, contact: &Contact) -> Option<String> {
        let value = match self {
            MatchKey::FirstName => contact.first_name.clone(),
            MatchKey::LastName => contact.last_name.clone(),
            MatchKey::Zip => contact.zip_code()?,
            MatchKey::Address => contact.address.clone(),
        };
        Some(value.trim().to_lowercase()).filter(|v| !v.is_empty())
    }

    fn agrees(&self, row_value: &str, contact_value: &str) -> bool {
        match self {
            MatchKey::Zip => zip5(row_value) == zip5(contact_value),
            MatchKey::Address => same_street(row_value, contact_value),
            MatchKey::FirstName | MatchKey::LastName => row_value == contact_value,
        }
    }
}

/// Comma-separated address parts with punctuation dropped and whitespace
/// collapsed: "12 Main St., Grand Rapids" gives `["12 main st", "grand rapids"]`.
fn address_parts(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|part| {
            part.chars()
                .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|part| !part.is_empty())
        .collect()
}

/// True when one address is the other with trailing parts (city, state, zip)
/// left off. Parts compare whole, so "2 Main St" never matches "12 Main St".
fn same_street(a: &str, b: &str) -> bool {
    let (a, b) = (address_parts(a), address_parts(b));
    let shared = a.len().min(b.len());
    shared > 0 && a[..shared] == b[..shared]
}

fn zip5(value: &str) -> &str {
    match value.get(..5) {
        Some(head) if head.chars().all(|c| c.is_ascii_digit()) => head,
        _ => value,
    }
}

impl FromStr for MatchKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match key.as_str() {
            "firstname" | "first" => Ok(MatchKey::FirstName),
            "lastname" | "last" => Ok(MatchKey::LastName),
            "zip" | "zipcode" => Ok(MatchKey::Zip),
            "address" | "streetaddress" => Ok(MatchKey::Address),
            _ => Err(format!(
                "unknown match key '{}' (expected first-name, last-name, zip or address)",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchStrategy {
    Keys(Vec<MatchKey>),
    Positional,
    KeysThenPositional(Vec<MatchKey>),
}

impl MatchStrategy {
    /// Strategy from command-line style switches. No keys means the default
    /// First Name + Last Name.
    pub fn from_switches(keys: &[MatchKey], positional: bool, fallback_positional: bool) -> Self {
        let keys = if keys.is_empty() {
            MatchKey::DEFAULT.to_vec()
        } else {
            keys.to_vec()
        };
        match (positional, fallback_positional) {
            (true, _) => MatchStrategy::Positional,
            (false, true) => MatchStrategy::KeysThenPositional(keys),
            (false, false) => MatchStrategy::Keys(keys),
        }
    }
}

impl Default for MatchStrategy {
    fn default() -> Self {
        MatchStrategy::Keys(MatchKey::DEFAULT.to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub strategy: MatchStrategy,
    /// Prefix of the `<Source> Updated Date & Time` column.
    pub source_label: String,
    /// Written verbatim into every enriched row. Fixed per run so that
    /// re-exports produce identical files.
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub matched: usize,
    pub appended: usize,
    pub rows_total: usize,
}

struct Columns {
    phone: usize,
    mobile: usize,
    landline: usize,
    email: usize,
    timestamp: usize,
}

impl Columns {
    fn ensure(table: &mut Table, source_label: &str) -> Self {
        Self {
            phone: table.ensure_column(PHONE_COLUMN),
            mobile: table.ensure_column(MOBILE_COLUMN),
            landline: table.ensure_column(LANDLINE_COLUMN),
            email: table.ensure_column(EMAIL_COLUMN),
            timestamp: table.ensure_column(&timestamp_column(source_label)),
        }
    }

    /// Writes the contact's values into `row`. Cells the contact has no
    /// value for keep what the spreadsheet already holds.
    fn fill(&self, row: &mut [String], contact: &Contact, timestamp: &str) {
        let values = [
            (self.phone, join_phones(&contact.phones)),
            (self.mobile, join_phones(&contact.mobile_phones)),
            (self.landline, join_phones(&contact.landlines)),
            (self.email, contact.email.clone().unwrap_or_default()),
        ];
        for (col, value) in values {
            if !value.trim().is_empty() {
                row[col] = value;
            }
        }
        row[self.timestamp] = timestamp.to_string();
    }

    /// True when `row` already holds exactly the contact's enrichment values.
    fn holds(&self, row: &[String], contact: &Contact) -> bool {
        row[self.phone] == join_phones(&contact.phones)
            && row[self.mobile] == join_phones(&contact.mobile_phones)
            && row[self.landline] == join_phones(&contact.landlines)
            && row[self.email] == contact.email.clone().unwrap_or_default()
    }
}

/// Columns an appended row is written with, and found again by: the name
/// columns plus any address-like match key.
fn identity_fields(keys: &[MatchKey]) -> Vec<CanonicalField> {
    let mut fields = vec![CanonicalField::FirstName, CanonicalField::MiddleName, CanonicalField::LastName];
    if keys.contains(&MatchKey::Zip) {
        fields.push(CanonicalField::Zip);
    }
    if keys.contains(&MatchKey::Address) {
        fields.push(CanonicalField::StreetAddress);
    }
    fields
}

fn identity_value(field: CanonicalField, contact: &Contact) -> String {
    match field {
        CanonicalField::FirstName => contact.first_name.clone(),
        CanonicalField::MiddleName => contact.middle_name.clone(),
        CanonicalField::LastName => contact.last_name.clone(),
        CanonicalField::Zip => contact.zip_code().unwrap_or_default(),
        CanonicalField::StreetAddress => contact.address.clone(),
        _ => String::new(),
    }
}

/// Finds a free row written for `contact` by an earlier merge. Used for
/// contacts that lack a match key, which key matching can never place.
fn find_identity_row(
    table: &Table,
    columns: &Columns,
    contact: &Contact,
    keys: &[MatchKey],
    row_taken: &[bool],
) -> Option<usize> {
    let mut wanted = Vec::new();
    for field in identity_fields(keys) {
        match table.find_field(field) {
            Some(col) => wanted.push((col, identity_value(field, contact).trim().to_lowercase())),
            None if field == CanonicalField::MiddleName => {}
            None => return None,
        }
    }
    let nameless = wanted.iter().all(|(_, value)| value.is_empty());

    table.rows.iter().enumerate().position(|(r, row)| {
        !row_taken[r]
            && wanted
                .iter()
                .all(|(col, value)| row[*col].trim().to_lowercase() == *value)
            && (!nameless || columns.holds(row, contact))
    })
}

/// Merges `contacts` into `table` in place.
pub fn merge(table: &mut Table, contacts: &[Contact], options: &MergeOptions) -> MergeReport {
    let columns = Columns::ensure(table, &options.source_label);
    let (keys, positional): (&[MatchKey], bool) = match &options.strategy {
        MatchStrategy::Keys(keys) => (keys.as_slice(), false),
        MatchStrategy::Positional => (&[], true),
        MatchStrategy::KeysThenPositional(keys) => (keys.as_slice(), true),
    };

    let mut row_taken = vec![false; table.rows.len()];
    let mut assignment: Vec<Option<usize>> = vec![None; contacts.len()];
    let mut keyless = Vec::new();

    if !keys.is_empty() {
        let key_columns: Option<Vec<usize>> = keys.iter().map(|k| table.find_field(k.field())).collect();
        match key_columns {
            Some(key_columns) => {
                for (c, contact) in contacts.iter().enumerate() {
                    let Some(wanted) = keys
                        .iter()
                        .map(|k| k.contact_value(contact))
                        .collect::<Option<Vec<String>>>()
                    else {
                        keyless.push(c);
                        continue;
                    };
                    let found = table.rows.iter().enumerate().position(|(r, row)| {
                        !row_taken[r]
                            && keys.iter().zip(&key_columns).zip(&wanted).all(|((key, &col), value)| {
                                let cell = row[col].trim().to_lowercase();
                                !cell.is_empty() && key.agrees(&cell, value)
                            })
                    });
                    if let Some(r) = found {
                        row_taken[r] = true;
                        assignment[c] = Some(r);
                    }
                }
            }
            None => debug!("Spreadsheet lacks a match-key column; no key matches possible"),
        }
    }

    for c in keyless {
        match find_identity_row(table, &columns, &contacts[c], keys, &row_taken) {
            Some(r) => {
                row_taken[r] = true;
                assignment[c] = Some(r);
            }
            None => debug!("{} lacks a match key and has no row yet", contacts[c].display_name()),
        }
    }

    if positional {
        let mut free_rows = (0..table.rows.len()).filter(|r| !row_taken[*r]).collect::<Vec<_>>().into_iter();
        for slot in assignment.iter_mut().filter(|slot| slot.is_none()) {
            match free_rows.next() {
                Some(r) => {
                    row_taken[r] = true;
                    *slot = Some(r);
                }
                None => break,
            }
        }
    }

    let mut report = MergeReport::default();
    let leftovers: Vec<&Contact> = contacts
        .iter()
        .zip(&assignment)
        .filter_map(|(contact, slot)| match slot {
            Some(r) => {
                columns.fill(&mut table.rows[*r], contact, &options.timestamp);
                report.matched += 1;
                None
            }
            None => Some(contact),
        })
        .collect();

    if !leftovers.is_empty() {
        append_contacts(table, &leftovers, keys, &options.timestamp, &options.source_label);
        report.appended = leftovers.len();
    }

    report.rows_total = table.rows.len();
    report
}

/// Adds one row per contact. Only identity and enrichment columns are
/// filled; identity columns are created when missing so a later merge of the
/// same contacts finds these rows again.
fn append_contacts(table: &mut Table, contacts: &[&Contact], keys: &[MatchKey], timestamp: &str, source_label: &str) {
    let identity: Vec<(usize, CanonicalField)> = identity_fields(keys)
        .into_iter()
        .filter_map(|field| match table.find_field(field) {
            Some(col) => Some((col, field)),
            // Middle names are only written where the sheet already has them
            None if field == CanonicalField::MiddleName => None,
            None => Some((table.ensure_column(field.header()), field)),
        })
        .collect();

    // Identity columns may have just been appended after the enrichment ones
    let columns = Columns::ensure(table, source_label);
    for contact in contacts {
        let mut row = table.blank_row();
        for (col, field) in &identity {
            row[*col] = identity_value(*field, contact);
        }
        columns.fill(&mut row, contact, timestamp);
        table.push_row(row);
    }
}

/// `<input stem>.enriched.csv` beside the input.
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("contacts");
    input.with_file_name(format!("{}.enriched.csv", stem))
}

/// `<output stem>.contacts.json` beside the output.
pub fn snapshot_path(output: &Path) -> PathBuf {
    let stem = output.file_stem().and_then(|s| s.to_str()).unwrap_or("contacts");
    output.with_file_name(format!("{}.contacts.json", stem))
}

pub fn save_snapshot(path: &Path, contacts: &[Contact]) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(contacts)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write contacts snapshot: {}", path.display()))?;
    info!("Saved {} contacts to {}", contacts.len(), path.display());
    Ok(())
}

pub fn load_snapshot(path: &Path) -> anyhow::Result<Vec<Contact>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read contacts snapshot: {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse contacts snapshot: {}", path.display()))
}

/// Fails when `output` would replace `input`.
pub fn ensure_distinct(input: &Path, output: &Path) -> Result<()> {
    let same = match (input.canonicalize(), output.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => input == output,
    };
    if same {
        return Err(WorkflowError::Export(format!(
            "refusing to overwrite the input file {}",
            input.display()
        )));
    }
    Ok(())
}

/// Reads `input`, merges `contacts` and writes the result to `output`.
pub fn export(input: &Path, output: &Path, contacts: &[Contact], options: &MergeOptions) -> Result<MergeReport> {
    ensure_distinct(input, output)?;

    let mut table = table::read_table(input).map_err(|e| WorkflowError::Export(format!("{:#}", e)))?;
    let report = merge(&mut table, contacts, options);
    table::write_csv_atomic(&table, output).map_err(|e| WorkflowError::Export(format!("{:#}", e)))?;

    info!(
        "Merged {} contacts into {} ({} matched, {} appended)",
        contacts.len(),
        output.display(),
        report.matched,
        report.appended
    );
    Ok(report)
}
