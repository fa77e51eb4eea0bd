//! The skip-trace order wizard and the wait for its completion.

use chrono::{Local, NaiveDate};
use std::fmt;
use tracing::{info, warn};

use crate::config::VendorProfile;
use crate::errors::{Result, WorkflowError};
use crate::models::{GroupId, OrderId, OrderStatus};
use crate::poller::{self, Check, Clock, PollOutcome, PollPolicy};
use crate::session::Reply;
use crate::vendor::{json_field, VendorAdapter};

/// The wizard screens, in the only order the vendor accepts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WizardStep {
    SelectContacts,
    PlaceOrder,
    AcceptTerms,
    NameList,
}

impl WizardStep {
    pub const SEQUENCE: [WizardStep; 4] = [
        WizardStep::SelectContacts,
        WizardStep::PlaceOrder,
        WizardStep::AcceptTerms,
        WizardStep::NameList,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            WizardStep::SelectContacts => "select contacts",
            WizardStep::PlaceOrder => "place order",
            WizardStep::AcceptTerms => "accept terms",
            WizardStep::NameList => "name list",
        }
    }
}

impl fmt::Display for WizardStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub group_id: GroupId,
    /// Explicit contacts to trace; the whole group when `None`.
    pub contact_ids: Option<Vec<String>>,
    pub list_name: String,
}

impl OrderRequest {
    pub fn new(group_id: GroupId) -> Self {
        let list_name = default_list_name(Local::now().date_naive(), &group_id);
        Self {
            group_id,
            contact_ids: None,
            list_name,
        }
    }

    pub fn with_contacts(mut self, contact_ids: Vec<String>) -> Self {
        self.contact_ids = Some(contact_ids);
        self
    }

    pub fn with_list_name(mut self, name: impl Into<String>) -> Self {
        self.list_name = name.into();
        self
    }
}

/// `"MM/DD/YYYY - <group id>"`
pub fn default_list_name(date: NaiveDate, group_id: &GroupId) -> String {
    format!("{} - {}", date.format("%m/%d/%Y"), group_id)
}

/// Walks the wizard and returns the id of the placed order. Stops at the
/// first step that is not confirmed.
pub fn place_order<A: VendorAdapter + ?Sized>(adapter: &mut A, request: &OrderRequest) -> Result<OrderId> {
    let mut order_id: Option<OrderId> = None;

    for step in WizardStep::SEQUENCE {
        info!("Order wizard: {}", step);
        let reply = adapter
            .wizard_step(step, request, order_id.as_ref())
            .map_err(|e| WorkflowError::Order {
                step,
                reason: format!("{:#}", e),
            })?;

        if !reply.is_success() {
            return Err(WorkflowError::Order {
                step,
                reason: format!("HTTP {}", reply.status),
            });
        }

        if step == WizardStep::PlaceOrder {
            let field = &adapter.profile().fields.order_id;
            let id = reply
                .json()
                .and_then(|body| json_field(&body, field).and_then(OrderId::from_json));
            match id {
                Some(id) => {
                    info!("Placed order {}", id);
                    order_id = Some(id);
                }
                None => {
                    return Err(WorkflowError::Order {
                        step,
                        reason: format!("response carries no order id in field '{}'", field),
                    })
                }
            }
        }
    }

    order_id.ok_or(WorkflowError::Order {
        step: WizardStep::PlaceOrder,
        reason: "wizard finished without an order id".to_string(),
    })
}

/// Reads the order status out of a status response.
pub fn read_status(reply: &Reply, profile: &VendorProfile) -> anyhow::Result<OrderStatus> {
    if !reply.is_success() {
        anyhow::bail!("status endpoint answered HTTP {}", reply.status);
    }
    let body = reply
        .json()
        .ok_or_else(|| anyhow::anyhow!("status response is not JSON"))?;
    let raw = json_field(&body, &profile.fields.status)
        .and_then(|value| match value {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        })
        .ok_or_else(|| anyhow::anyhow!("status response lacks field '{}'", profile.fields.status))?;
    Ok(profile.statuses.classify(&raw))
}

/// Polls the order until the vendor reports it complete. Returns the number
/// of status checks made.
pub fn wait_for_order<A, C, F>(
    adapter: &mut A,
    order_id: &OrderId,
    policy: &PollPolicy,
    clock: &mut C,
    mut on_attempt: F,
) -> Result<u32>
where
    A: VendorAdapter + ?Sized,
    C: Clock + ?Sized,
    F: FnMut(u32, &str),
{
    let outcome = poller::poll(policy, clock, |attempt| {
        let reply = adapter.order_status(order_id)?;
        let status = read_status(&reply, adapter.profile());
        let shown = match &status {
            Ok(OrderStatus::Completed) => "completed".to_string(),
            Ok(OrderStatus::Failed(text)) | Ok(OrderStatus::Pending(text)) => text.clone(),
            Err(_) => "unreadable".to_string(),
        };
        on_attempt(attempt, &shown);
        Ok(match status? {
            OrderStatus::Completed => Check::Ready(()),
            OrderStatus::Failed(text) => Check::Failed(text),
            OrderStatus::Pending(text) => Check::Pending(text),
        })
    });

    match outcome {
        PollOutcome::Completed { attempts, .. } => {
            info!("Order {} completed after {} status checks", order_id, attempts);
            Ok(attempts)
        }
        PollOutcome::Failed { status, .. } => Err(WorkflowError::PollFailed {
            order_id: order_id.clone(),
            status,
        }),
        PollOutcome::TimedOut { attempts, elapsed } => {
            warn!("Order {} still not complete; giving up", order_id);
            Err(WorkflowError::PollTimeout {
                order_id: order_id.clone(),
                attempts,
                elapsed,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_reply(status: u16, body: &str) -> Reply {
        Reply {
            status,
            url: "https://app.acme.test/api".into(),
            content_type: "application/json".into(),
            body: body.into(),
        }
    }

    #[test]
    fn list_name_uses_us_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(
            default_list_name(date, &GroupId::new("C123456")),
            "03/07/2024 - C123456"
        );
    }

    #[test]
    fn wizard_sequence_is_fixed() {
        let labels: Vec<&str> = WizardStep::SEQUENCE.iter().map(|s| s.label()).collect();
        assert_eq!(labels, ["select contacts", "place order", "accept terms", "name list"]);
    }

    #[test]
    fn status_is_classified_with_profile_vocabulary() {
        let profile = VendorProfile::default();
        let status = read_status(&json_reply(200, r#"{"status":"Completed"}"#), &profile).unwrap();
        assert_eq!(status, OrderStatus::Completed);

        let status = read_status(&json_reply(200, r#"{"status":"Processing"}"#), &profile).unwrap();
        assert_eq!(status, OrderStatus::Pending("processing".into()));
    }

    #[test]
    fn unreadable_status_is_an_error_not_a_guess() {
        let profile = VendorProfile::default();
        assert!(read_status(&json_reply(500, "{}"), &profile).is_err());
        assert!(read_status(&json_reply(200, r#"{"state":"done"}"#), &profile).is_err());
        let html = Reply {
            content_type: "text/html".into(),
            ..json_reply(200, "<p>done</p>")
        };
        assert!(read_status(&html, &profile).is_err());
    }
}
