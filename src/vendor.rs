//! The vendor adapter boundary.
//!
//! Nothing outside this module knows an endpoint path or how a request body
//! is shaped. Response field names, HTML layout and status words come from
//! the same [`VendorProfile`], exposed through [`VendorAdapter::profile`].

use anyhow::{Context, Result as AnyResult};
use reqwest::blocking::multipart;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use tracing::info;

use crate::auth;
use crate::config::{Credentials, VendorProfile};
use crate::errors::{Result, WorkflowError};
use crate::importer::{ImportMode, Upload};
use crate::models::{GroupId, OrderId};
use crate::order::{OrderRequest, WizardStep};
use crate::session::{Reply, Session};

/// Which vendor surface carries the contact data, decided once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Api,
    Html,
}

pub trait VendorAdapter {
    fn name(&self) -> &str;
    fn profile(&self) -> &VendorProfile;

    fn login(&mut self, credentials: &Credentials) -> Result<()>;
    /// Detects which surface this deployment serves.
    fn probe(&mut self) -> Result<Surface>;

    fn upload_file(&mut self, upload: &Upload) -> AnyResult<Reply>;
    fn save_import(&mut self, file_id: &str, mode: &ImportMode) -> AnyResult<Reply>;
    fn list_groups(&mut self) -> AnyResult<Reply>;
    /// How far the vendor got with an import. `None` when the deployment
    /// offers no way to tell.
    fn import_status(&mut self, group: &GroupId) -> AnyResult<Option<Reply>>;

    fn wizard_step(&mut self, step: WizardStep, request: &OrderRequest, order: Option<&OrderId>) -> AnyResult<Reply>;
    fn order_status(&mut self, order: &OrderId) -> AnyResult<Reply>;

    fn fetch_contacts(&mut self, group: &GroupId, surface: Surface) -> AnyResult<Reply>;
}

/// Adapter for a vendor reached over plain HTTP with a cookie session.
pub struct HttpVendor {
    session: Session,
    profile: VendorProfile,
}

impl HttpVendor {
    pub fn new(profile: VendorProfile, dump_dir: Option<PathBuf>) -> AnyResult<Self> {
        let session = Session::new(&profile)
            .context("Failed to build HTTP client")?
            .with_dump_dir(dump_dir);
        Ok(Self { session, profile })
    }

    fn url(&self, path: &str, group: Option<&GroupId>, order: Option<&OrderId>) -> String {
        self.profile
            .url(path, group.map(GroupId::as_str), order.map(OrderId::as_str))
    }
}

impl VendorAdapter for HttpVendor {
    fn name(&self) -> &str {
        &self.profile.name
    }

    fn profile(&self) -> &VendorProfile {
        &self.profile
    }

    fn login(&mut self, credentials: &Credentials) -> Result<()> {
        auth::login(&mut self.session, &self.profile, credentials)
    }

    fn probe(&mut self) -> Result<Surface> {
        let url = self.url(&self.profile.endpoints.probe, None, None);
        let reply = self
            .session
            .get(&url, "probe")
            .map_err(|e| WorkflowError::Probe(format!("{} unreachable: {}", url, e)))?;

        if !reply.is_success() {
            return Err(WorkflowError::Probe(format!(
                "{} answered HTTP {}",
                url, reply.status
            )));
        }

        let surface = if reply.is_json() && reply.json().is_some() {
            Surface::Api
        } else {
            Surface::Html
        };
        info!("{} serves the {:?} surface", self.profile.name, surface);
        Ok(surface)
    }

    fn upload_file(&mut self, upload: &Upload) -> AnyResult<Reply> {
        let url = self.url(&self.profile.endpoints.upload, None, None);
        let part = multipart::Part::bytes(upload.bytes.clone())
            .file_name(upload.file_name.clone())
            .mime_str(&upload.content_type)?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("fileName", upload.file_name.clone())
            .text("contentType", upload.content_type.clone());
        Ok(self.session.post_multipart(&url, form, "upload")?)
    }

    fn save_import(&mut self, file_id: &str, mode: &ImportMode) -> AnyResult<Reply> {
        let url = self.url(&self.profile.endpoints.import_save, None, None);
        let body = match mode {
            ImportMode::CreateGroup(name) => json!({
                "fileId": file_id,
                "groupName": name,
                "mode": "new",
            }),
            ImportMode::ExistingGroup(group) => json!({
                "fileId": file_id,
                "groupId": group.as_str(),
                "mode": "existing",
            }),
        };
        Ok(self.session.post_json(&url, &body, "import save")?)
    }

    fn list_groups(&mut self) -> AnyResult<Reply> {
        let url = self.url(&self.profile.endpoints.groups, None, None);
        Ok(self.session.get(&url, "groups")?)
    }

    fn import_status(&mut self, group: &GroupId) -> AnyResult<Option<Reply>> {
        if self.profile.endpoints.import_status.trim().is_empty() {
            return Ok(None);
        }
        let url = self.url(&self.profile.endpoints.import_status, Some(group), None);
        Ok(Some(self.session.get(&url, "import status")?))
    }

    fn wizard_step(&mut self, step: WizardStep, request: &OrderRequest, order: Option<&OrderId>) -> AnyResult<Reply> {
        let endpoints = &self.profile.endpoints;
        let path = match step {
            WizardStep::SelectContacts => &endpoints.select_contacts,
            WizardStep::PlaceOrder => &endpoints.place_order,
            WizardStep::AcceptTerms => &endpoints.accept_terms,
            WizardStep::NameList => &endpoints.name_list,
        };
        let url = self.url(path, Some(&request.group_id), order);

        let mut body = Map::new();
        body.insert("groupId".into(), Value::String(request.group_id.to_string()));
        if let Some(order) = order {
            body.insert("orderId".into(), Value::String(order.to_string()));
        }
        match step {
            WizardStep::SelectContacts | WizardStep::PlaceOrder => {
                if let Some(ids) = &request.contact_ids {
                    body.insert("contactIds".into(), json!(ids));
                }
            }
            WizardStep::AcceptTerms => {
                body.insert("accepted".into(), Value::Bool(true));
            }
            WizardStep::NameList => {
                body.insert("name".into(), Value::String(request.list_name.clone()));
            }
        }

        Ok(self.session.post_json(&url, &Value::Object(body), step.label())?)
    }

    fn order_status(&mut self, order: &OrderId) -> AnyResult<Reply> {
        let url = self.url(&self.profile.endpoints.order_status, None, Some(order));
        Ok(self.session.get(&url, "order status")?)
    }

    fn fetch_contacts(&mut self, group: &GroupId, surface: Surface) -> AnyResult<Reply> {
        let path = match surface {
            Surface::Api => &self.profile.endpoints.contacts_api,
            Surface::Html => &self.profile.endpoints.contacts_page,
        };
        let url = self.url(path, Some(group), None);
        Ok(self.session.get(&url, "contacts")?)
    }
}

/// Reads `field` from a JSON object body. Dotted paths (`data.id`) descend
/// into nested objects.
pub fn json_field<'a>(body: &'a Value, field: &str) -> Option<&'a Value> {
    field
        .split('.')
        .try_fold(body, |value, key| value.get(key))
}

/// The array a listing answers with: the body itself, or the array stored
/// under `field`.
pub fn json_items<'a>(body: &'a Value, field: &str) -> Option<&'a Vec<Value>> {
    body.as_array()
        .or_else(|| json_field(body, field).and_then(Value::as_array))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_field_follows_dotted_paths() {
        let body = json!({"data": {"order": {"id": 991}}, "id": "top"});
        assert_eq!(json_field(&body, "id"), Some(&json!("top")));
        assert_eq!(json_field(&body, "data.order.id"), Some(&json!(991)));
        assert_eq!(json_field(&body, "data.missing"), None);
    }

    #[test]
    fn json_items_accepts_bare_and_wrapped_arrays() {
        let bare = json!([{"id": 1}, {"id": 2}]);
        let wrapped = json!({"items": [{"id": 1}], "count": 1});
        assert_eq!(json_items(&bare, "items").map(Vec::len), Some(2));
        assert_eq!(json_items(&wrapped, "items").map(Vec::len), Some(1));
        assert_eq!(json_items(&wrapped, "contacts"), None);
    }
}
