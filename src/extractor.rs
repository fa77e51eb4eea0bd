//! Maps a vendor contact listing to [`Contact`] records.
//!
//! The JSON mapping is the primary path. Scraping the HTML contact grid is a
//! fallback with the same interface, used when the deployment only serves
//! pages.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::config::{HtmlLayout, VendorProfile};
use crate::errors::{Result, WorkflowError};
use crate::models::Contact;
use crate::session::Reply;
use crate::vendor::json_items;

pub trait ContactParser {
    fn parse(&self, body: &str) -> Result<Vec<Contact>>;
}

/// Contacts from a JSON array, or from an object holding the array under
/// `items_field`.
pub struct JsonContacts {
    pub items_field: String,
}

impl ContactParser for JsonContacts {
    fn parse(&self, body: &str) -> Result<Vec<Contact>> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| WorkflowError::Extraction(format!("contact listing is not valid JSON: {}", e)))?;
        let items = json_items(&value, &self.items_field).ok_or_else(|| {
            WorkflowError::Extraction(format!(
                "contact listing is neither an array nor holds one under '{}'",
                self.items_field
            ))
        })?;

        Ok(items
            .iter()
            .filter(|item| item.is_object())
            .map(contact_from_json)
            .filter(|contact| !contact.is_empty())
            .collect())
    }
}

fn contact_from_json(item: &Value) -> Contact {
    let text = |key: &str| {
        item.get(key)
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };
    let zip = match item.get("zip") {
        Some(Value::Number(n)) => n.to_string(),
        _ => text("zip"),
    };
    let email = Some(text("email")).filter(|e| !e.is_empty());

    Contact {
        first_name: text("firstName"),
        middle_name: text("middleName"),
        last_name: text("lastName"),
        address: text("address"),
        zip,
        phones: phone_list(item.get("phone")),
        mobile_phones: phone_list(item.get("mobilePhone")),
        landlines: phone_list(item.get("landlinePhone")),
        email,
    }
}

/// A phone field may hold one number or a list of them.
fn phone_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// Contacts scraped from the HTML contact grid.
pub struct HtmlContacts {
    pub layout: HtmlLayout,
}

fn phone_regex() -> &'static Regex {
    static PHONE: OnceLock<Regex> = OnceLock::new();
    PHONE.get_or_init(|| Regex::new(r"\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}").expect("valid phone regex"))
}

impl HtmlContacts {
    fn selector(css: &str) -> Result<Selector> {
        Selector::parse(css)
            .map_err(|e| WorkflowError::Extraction(format!("invalid selector '{}': {:?}", css, e)))
    }

    fn cell_text(cells: &[ElementRef], index: Option<usize>) -> Option<String> {
        let cell = cells.get(index?)?;
        let text = cell.text().collect::<Vec<_>>().join(" ");
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        Some(text).filter(|t| !t.is_empty())
    }

    fn phones(cells: &[ElementRef], index: Option<usize>) -> Vec<String> {
        Self::cell_text(cells, index)
            .map(|text| {
                phone_regex()
                    .find_iter(&text)
                    .map(|m| m.as_str().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl ContactParser for HtmlContacts {
    fn parse(&self, body: &str) -> Result<Vec<Contact>> {
        let document = Html::parse_document(body);
        let row_selector = Self::selector(&self.layout.row_selector)?;
        let cell_selector = Self::selector(&self.layout.cell_selector)?;

        let mut contacts = Vec::new();
        for row in document.select(&row_selector) {
            let cells: Vec<ElementRef> = row.select(&cell_selector).collect();
            if cells.is_empty() {
                // Header rows use <th>
                continue;
            }

            let mut contact = Contact::default();
            if let Some(name) = Self::cell_text(&cells, Some(self.layout.name_column)) {
                split_name(&name, &mut contact);
            }
            contact.phones = Self::phones(&cells, self.layout.phone_column);
            contact.mobile_phones = Self::phones(&cells, self.layout.mobile_column);
            contact.landlines = Self::phones(&cells, self.layout.landline_column);
            contact.email = Self::cell_text(&cells, self.layout.email_column).filter(|e| e.contains('@'));

            if contact.is_empty() {
                debug!("Skipping grid row without contact data");
                continue;
            }
            contacts.push(contact);
        }
        Ok(contacts)
    }
}

/// "John Q Public" → first "John", middle "Q", last "Public". A single word
/// is taken as the first name.
fn split_name(name: &str, contact: &mut Contact) {
    let parts: Vec<&str> = name.split_whitespace().collect();
    match parts.as_slice() {
        [] => {}
        [only] => contact.first_name = only.to_string(),
        [first, middle @ .., last] => {
            contact.first_name = first.to_string();
            contact.middle_name = middle.join(" ");
            contact.last_name = last.to_string();
        }
    }
}

/// Picks the parser for the reply's content type and runs it. An empty
/// result is an error.
pub fn extract(reply: &Reply, profile: &VendorProfile) -> Result<Vec<Contact>> {
    if !reply.is_success() {
        return Err(WorkflowError::Extraction(format!(
            "contact listing answered HTTP {}",
            reply.status
        )));
    }

    let parser: Box<dyn ContactParser> = if reply.is_json() {
        Box::new(JsonContacts {
            items_field: profile.fields.contacts.clone(),
        })
    } else {
        Box::new(HtmlContacts {
            layout: profile.html.clone(),
        })
    };

    let contacts = parser.parse(&reply.body)?;
    if contacts.is_empty() {
        return Err(WorkflowError::Extraction(format!(
            "no contacts found in the {} listing",
            if reply.is_json() { "JSON" } else { "HTML" }
        )));
    }

    let with_data = contacts.iter().filter(|c| c.has_phone_or_email()).count();
    info!("Extracted {} contacts ({} with phone or email)", contacts.len(), with_data);
    Ok(contacts)
}
