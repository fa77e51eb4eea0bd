use anyhow::{bail, Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A spreadsheet held as plain strings. Every row has exactly
/// `headers.len()` cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Well-known contact columns, found in arbitrary spreadsheets by alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalField {
    FirstName,
    MiddleName,
    LastName,
    StreetAddress,
    City,
    State,
    Zip,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 7] = [
        CanonicalField::FirstName,
        CanonicalField::MiddleName,
        CanonicalField::LastName,
        CanonicalField::StreetAddress,
        CanonicalField::City,
        CanonicalField::State,
        CanonicalField::Zip,
    ];

    pub fn header(&self) -> &'static str {
        match self {
            CanonicalField::FirstName => "First Name",
            CanonicalField::MiddleName => "Middle Name",
            CanonicalField::LastName => "Last Name",
            CanonicalField::StreetAddress => "Street Address",
            CanonicalField::City => "City",
            CanonicalField::State => "State",
            CanonicalField::Zip => "Zip",
        }
    }

    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            CanonicalField::FirstName => &["firstname", "first", "fname", "given name"],
            CanonicalField::MiddleName => &["middlename", "middle", "mname"],
            CanonicalField::LastName => &["lastname", "last", "lname", "surname", "family name"],
            CanonicalField::StreetAddress => &[
                "address",
                "street",
                "property address",
                "property street",
                "addr",
            ],
            CanonicalField::City => &["town", "municipality", "property city"],
            CanonicalField::State => &["province", "region", "property state"],
            CanonicalField::Zip => &["zipcode", "zip code", "postal code", "postal", "property zip"],
        }
    }
}

impl Table {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        let wanted = name.trim().to_lowercase();
        self.headers
            .iter()
            .position(|h| h.trim().to_lowercase() == wanted)
    }

    /// Locates a canonical field: exact header first, then its aliases.
    pub fn find_field(&self, field: CanonicalField) -> Option<usize> {
        self.column(field.header())
            .or_else(|| field.aliases().iter().find_map(|alias| self.column(alias)))
    }

    /// Returns the index of `name` (case-insensitive), appending an empty
    /// column if absent.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(index) = self.column(name) {
            return index;
        }
        self.headers.push(name.to_string());
        for row in &mut self.rows {
            row.push(String::new());
        }
        self.headers.len() - 1
    }

    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
    }

    pub fn blank_row(&self) -> Vec<String> {
        vec![String::new(); self.headers.len()]
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to flush CSV buffer: {}", e))
    }
}

pub fn is_excel(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("xlsx" | "xls" | "xlsm" | "xlsb" | "ods")
    )
}

/// Loads a CSV, or the first sheet of an Excel workbook.
pub fn read_table(path: &Path) -> Result<Table> {
    let table = if is_excel(path) {
        read_excel(path)?
    } else {
        read_csv(path)?
    };
    info!(
        "Loaded {} rows ({} columns) from {}",
        table.rows.len(),
        table.headers.len(),
        path.display()
    );
    Ok(table)
}

pub fn read_csv(path: &Path) -> Result<Table> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open input file: {}", path.display()))?;

    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);
    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("Failed to read header row of {}", path.display()))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut table = Table::new(headers);
    for result in reader.records() {
        let record = result?;
        if record.len() > table.headers.len() {
            debug!(
                "Record at line {:?} has {} fields but header has {}, extra fields dropped",
                record.position().map(|p| p.line()),
                record.len(),
                table.headers.len()
            );
        }
        let mut row: Vec<String> = record.iter().map(str::to_string).collect();
        row.truncate(table.headers.len());
        table.push_row(row);
    }

    Ok(table)
}

fn read_excel(path: &Path) -> Result<Table> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("Failed to open Excel file: {}", path.display()))?;
    let range = match workbook.worksheet_range_at(0) {
        Some(range) => range.with_context(|| format!("Failed to read first sheet of {}", path.display()))?,
        None => bail!("Excel file contains no sheets: {}", path.display()),
    };

    let mut rows = range.rows();
    let headers: Vec<String> = match rows.next() {
        Some(header) => header.iter().map(cell_text).collect(),
        None => return Ok(Table::default()),
    };

    let mut table = Table::new(headers);
    for row in rows {
        let cells: Vec<String> = row.iter().map(cell_text).collect();
        if cells.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        table.push_row(cells);
    }
    Ok(table)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        // Zips and phone numbers come through as floats
        Data::Float(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
        Data::Float(n) => n.to_string(),
        Data::Int(n) => n.to_string(),
        Data::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
        other => other.to_string(),
    }
}

/// Writes `table` to `output_path` via a temporary sibling file, so the
/// target only ever holds a complete CSV.
pub fn write_csv_atomic(table: &Table, output_path: &Path) -> Result<()> {
    let tmp_path = temp_sibling(output_path);
    {
        let file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create output file: {}", tmp_path.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(&table.headers)?;
        for row in &table.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
    }

    if let Err(e) = fs::rename(&tmp_path, output_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e).with_context(|| format!("Failed to move output into place: {}", output_path.display()));
    }

    info!("Saved {} rows to {}", table.rows.len(), output_path.display());
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "output.csv".into());
    name.push(".partial");
    path.with_file_name(name)
}
