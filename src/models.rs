use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;

/// Vendor-side group identifier. Opaque: numeric on some surfaces,
/// prefixed (`C123456`) on others.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(String);

/// Vendor-side identifier of a skip-trace order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(String);

macro_rules! opaque_id {
    ($name:ident) => {
        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Reads an id out of a JSON value. Strings and integers are
            /// accepted; empty strings, nulls and everything else are not.
            pub fn from_json(value: &Value) -> Option<Self> {
                match value {
                    Value::String(s) if !s.trim().is_empty() => Some(Self(s.trim().to_string())),
                    Value::Number(n) if n.is_i64() || n.is_u64() => Some(Self(n.to_string())),
                    _ => None,
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(GroupId);
opaque_id!(OrderId);

/// A contact record as extracted from the vendor. The schema is fixed no
/// matter which surface the data came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Contact {
    pub first_name: String,
    pub middle_name: String,
    pub last_name: String,
    pub address: String,
    pub zip: String,
    pub phones: Vec<String>,
    pub mobile_phones: Vec<String>,
    pub landlines: Vec<String>,
    pub email: Option<String>,
}

fn zip_regex() -> &'static Regex {
    static ZIP: OnceLock<Regex> = OnceLock::new();
    ZIP.get_or_init(|| Regex::new(r"\b\d{5}(?:-\d{4})?\b").expect("valid zip regex"))
}

impl Contact {
    /// Zip code of the contact: the explicit field, else the first zip found
    /// in the address.
    pub fn zip_code(&self) -> Option<String> {
        if !self.zip.trim().is_empty() {
            return Some(self.zip.trim().to_string());
        }
        zip_regex()
            .find(&self.address)
            .map(|m| m.as_str().to_string())
    }

    pub fn has_phone_or_email(&self) -> bool {
        !self.phones.is_empty()
            || !self.mobile_phones.is_empty()
            || !self.landlines.is_empty()
            || self.email.as_deref().is_some_and(|e| !e.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.first_name.is_empty()
            && self.last_name.is_empty()
            && self.address.is_empty()
            && !self.has_phone_or_email()
    }

    pub fn display_name(&self) -> String {
        [&self.first_name, &self.middle_name, &self.last_name]
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Joins phone numbers with `", "`, dropping blanks and later duplicates.
pub fn join_phones(phones: &[String]) -> String {
    let mut seen: Vec<&str> = Vec::new();
    for phone in phones {
        let phone = phone.trim();
        if !phone.is_empty() && !seen.contains(&phone) {
            seen.push(phone);
        }
    }
    seen.join(", ")
}

/// Order status as classified against a [`StatusVocabulary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    Completed,
    Failed(String),
    Pending(String),
}

/// The words the vendor uses for terminal order states. Matching is
/// case-insensitive on whole words. A word right after "not", "no" or
/// "never" (one filler word allowed, as in "not yet completed") is ignored.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatusVocabulary {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

impl Default for StatusVocabulary {
    fn default() -> Self {
        Self {
            completed: ["completed", "complete", "done", "finished", "success"]
                .into_iter()
                .map(String::from)
                .collect(),
            failed: ["failed", "cancelled", "canceled", "error", "timeout"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl StatusVocabulary {
    /// Classifies a status string. Failure words win over completion words,
    /// so "completed with error" is never read as success.
    pub fn classify(&self, raw: &str) -> OrderStatus {
        let text = raw.trim().to_lowercase();
        let words: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let has = |vocab: &[String]| {
            words.iter().enumerate().any(|(i, word)| {
                vocab.iter().any(|v| v.to_lowercase() == *word) && !negated(&words[..i])
            })
        };

        if has(&self.failed) {
            OrderStatus::Failed(text)
        } else if has(&self.completed) {
            OrderStatus::Completed
        } else {
            OrderStatus::Pending(text)
        }
    }
}

const NEGATIONS: [&str; 3] = ["not", "no", "never"];

fn negated(preceding: &[&str]) -> bool {
    preceding.iter().rev().take(2).any(|w| NEGATIONS.contains(w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_accept_strings_and_numbers() {
        assert_eq!(GroupId::from_json(&json!("C123456")), Some(GroupId::new("C123456")));
        assert_eq!(GroupId::from_json(&json!(123456)), Some(GroupId::new("123456")));
        assert_eq!(OrderId::from_json(&json!("  ")), None);
        assert_eq!(OrderId::from_json(&json!(null)), None);
        assert_eq!(OrderId::from_json(&json!(1.5)), None);
    }

    #[test]
    fn zip_falls_back_to_address() {
        let contact = Contact {
            address: "12 Main St, Grand Rapids, MI 49503".into(),
            ..Default::default()
        };
        assert_eq!(contact.zip_code().as_deref(), Some("49503"));

        let explicit = Contact {
            zip: " 49506 ".into(),
            address: "12 Main St, 49503".into(),
            ..Default::default()
        };
        assert_eq!(explicit.zip_code().as_deref(), Some("49506"));
    }

    #[test]
    fn join_phones_keeps_first_occurrence_order() {
        let phones = vec![
            "616-555-1212".to_string(),
            " ".to_string(),
            "616-555-0000".to_string(),
            "616-555-1212".to_string(),
        ];
        assert_eq!(join_phones(&phones), "616-555-1212, 616-555-0000");
    }

    #[test]
    fn classify_status_words() {
        let vocab = StatusVocabulary::default();
        assert_eq!(vocab.classify("Completed"), OrderStatus::Completed);
        assert_eq!(vocab.classify("DONE"), OrderStatus::Completed);
        assert_eq!(vocab.classify("cancelled"), OrderStatus::Failed("cancelled".into()));
        assert_eq!(
            vocab.classify("completed with error"),
            OrderStatus::Failed("completed with error".into())
        );
        assert_eq!(vocab.classify("processing"), OrderStatus::Pending("processing".into()));
        // "incomplete" must not read as "complete"
        assert_eq!(vocab.classify("incomplete"), OrderStatus::Pending("incomplete".into()));
    }

    #[test]
    fn negated_status_words_do_not_count() {
        let vocab = StatusVocabulary::default();
        assert_eq!(vocab.classify("Not completed"), OrderStatus::Pending("not completed".into()));
        assert_eq!(vocab.classify("not yet done"), OrderStatus::Pending("not yet done".into()));
        assert_eq!(vocab.classify("completed, no error"), OrderStatus::Completed);
        assert_eq!(
            vocab.classify("failed: not complete"),
            OrderStatus::Failed("failed: not complete".into())
        );
    }
}
