use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::auth::LoginPredicate;
use crate::models::StatusVocabulary;

pub const USERNAME_VAR: &str = "SKIPTRACER_USERNAME";
pub const PASSWORD_VAR: &str = "SKIPTRACER_PASSWORD";

/// Vendor login credentials, read from the environment.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let read = |name: &str| -> Result<String> {
            std::env::var(name)
                .map_err(|_| anyhow::anyhow!("{} environment variable required", name))
                .and_then(|value| {
                    if value.trim().is_empty() {
                        anyhow::bail!("{} cannot be empty", name);
                    }
                    Ok(value)
                })
        };

        Ok(Self {
            username: read(USERNAME_VAR)?,
            password: read(PASSWORD_VAR)?,
        })
    }
}

/// Everything that is specific to one vendor deployment: URLs, endpoint
/// paths, response field names, HTML layout and status words.
///
/// Endpoint paths are relative to `base_url` and may contain the
/// placeholders `{group_id}` and `{order_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VendorProfile {
    /// Human-readable vendor name, also used for the
    /// `<Source> Updated Date & Time` column unless overridden.
    pub name: String,
    pub base_url: String,
    pub login_url: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub login: LoginSettings,
    pub endpoints: Endpoints,
    pub fields: ResponseFields,
    pub html: HtmlLayout,
    pub statuses: StatusVocabulary,
}

impl Default for VendorProfile {
    fn default() -> Self {
        Self {
            name: "Vendor".to_string(),
            base_url: "https://app.example.com".to_string(),
            login_url: "https://login.example.com/".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36".to_string(),
            request_timeout_secs: 30,
            login: LoginSettings::default(),
            endpoints: Endpoints::default(),
            fields: ResponseFields::default(),
            html: HtmlLayout::default(),
            statuses: StatusVocabulary::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginSettings {
    pub username_field: String,
    pub password_field: String,
    pub max_attempts: u32,
    pub success: LoginPredicate,
}

impl Default for LoginSettings {
    fn default() -> Self {
        Self {
            username_field: "username".to_string(),
            password_field: "password".to_string(),
            max_attempts: 2,
            success: LoginPredicate::RedirectUrlContains {
                pattern: "app.example.com".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub probe: String,
    pub upload: String,
    pub import_save: String,
    pub groups: String,
    pub select_contacts: String,
    pub place_order: String,
    pub accept_terms: String,
    pub name_list: String,
    pub order_status: String,
    pub contacts_api: String,
    pub contacts_page: String,
    /// Read after an import until the group lists contacts. Empty disables
    /// the wait.
    pub import_status: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            probe: "/api/contact-groups".to_string(),
            upload: "/api/contacts/upload".to_string(),
            import_save: "/api/contacts/import/save".to_string(),
            groups: "/api/contact-groups".to_string(),
            select_contacts: "/api/skip-tracing/select-contacts".to_string(),
            place_order: "/api/skip-tracing/place-order".to_string(),
            accept_terms: "/api/skip-tracing/orders/{order_id}/accept".to_string(),
            name_list: "/api/skip-tracing/orders/{order_id}/name".to_string(),
            order_status: "/api/skip-tracing/orders/{order_id}".to_string(),
            contacts_api: "/api/contact-groups/{group_id}/contacts".to_string(),
            contacts_page: "/contacts?groupId={group_id}".to_string(),
            import_status: "/api/contact-groups/{group_id}/contacts".to_string(),
        }
    }
}

/// Names of the JSON fields the vendor answers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseFields {
    pub file_id: String,
    /// Field holding the group array when the group list is an object.
    pub groups: String,
    pub group_id: String,
    pub group_name: String,
    pub order_id: String,
    pub status: String,
    /// Field holding the contact array when the listing is an object.
    pub contacts: String,
    /// Contact count in the import-status response. The length of the
    /// contact array is used when it is absent.
    pub group_size: String,
}

impl Default for ResponseFields {
    fn default() -> Self {
        Self {
            file_id: "id".to_string(),
            groups: "items".to_string(),
            group_id: "id".to_string(),
            group_name: "name".to_string(),
            order_id: "id".to_string(),
            status: "status".to_string(),
            contacts: "items".to_string(),
            group_size: "total".to_string(),
        }
    }
}

/// Where contact data sits in the HTML contact grid. Column indexes are
/// zero-based positions of the cells matched by `cell_selector` in a row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HtmlLayout {
    pub row_selector: String,
    pub cell_selector: String,
    pub name_column: usize,
    pub phone_column: Option<usize>,
    pub mobile_column: Option<usize>,
    pub landline_column: Option<usize>,
    pub email_column: Option<usize>,
}

impl Default for HtmlLayout {
    fn default() -> Self {
        Self {
            row_selector: "table tr".to_string(),
            cell_selector: "td".to_string(),
            name_column: 0,
            phone_column: Some(1),
            mobile_column: None,
            landline_column: None,
            email_column: Some(2),
        }
    }
}

impl VendorProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vendor profile: {}", path.display()))?;
        let profile: VendorProfile = toml::from_str(&text)
            .with_context(|| format!("Failed to parse vendor profile: {}", path.display()))?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, url) in [("base_url", &self.base_url), ("login_url", &self.login_url)] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("{} must start with http:// or https://", name);
            }
        }
        if self.login.max_attempts == 0 {
            anyhow::bail!("login.max_attempts must be at least 1");
        }
        Ok(())
    }

    /// Absolute URL for an endpoint path, with placeholders filled in.
    pub fn url(&self, path: &str, group_id: Option<&str>, order_id: Option<&str>) -> String {
        let mut path = path.to_string();
        if let Some(group_id) = group_id {
            path = path.replace("{group_id}", &urlencoding::encode(group_id));
        }
        if let Some(order_id) = order_id {
            path = path.replace("{order_id}", &urlencoding::encode(order_id));
        }
        if path.starts_with("http://") || path.starts_with("https://") {
            path
        } else {
            format!("{}{}", self.base_url.trim_end_matches('/'), path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_profile_keeps_defaults() {
        let profile: VendorProfile = toml::from_str(
            r#"
            name = "Acme Leads"
            base_url = "https://app.acme.test"

            [login.success]
            kind = "token_in_redirect"
            param = "token"

            [html]
            row_selector = "div.grid-row"
            cell_selector = "div.cell"
            email_column = 4
            "#,
        )
        .unwrap();

        assert_eq!(profile.name, "Acme Leads");
        assert_eq!(profile.fields.order_id, "id");
        assert_eq!(profile.login.max_attempts, 2);
        assert!(matches!(
            profile.login.success,
            LoginPredicate::TokenInRedirect { ref param } if param == "token"
        ));
        assert_eq!(profile.html.email_column, Some(4));
        assert_eq!(profile.html.phone_column, Some(1));
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn example_profile_parses() {
        let profile: VendorProfile = toml::from_str(include_str!("../vendor.example.toml")).unwrap();
        assert!(profile.validate().is_ok());
        assert_eq!(profile.fields.order_id, "orderId");
        assert_eq!(profile.html.landline_column, Some(2));
        assert_eq!(profile.fields.group_size, "contactCount");
        assert_eq!(
            profile.url(&profile.endpoints.import_status, Some("C1"), None),
            "https://app.acme-leads.test/api/v2/groups/C1"
        );
        assert_eq!(
            profile.url(&profile.endpoints.order_status, None, Some("991")),
            "https://app.acme-leads.test/api/v2/skip-trace/order/991"
        );
    }

    #[test]
    fn url_fills_and_encodes_placeholders() {
        let profile = VendorProfile {
            base_url: "https://app.acme.test/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            profile.url("/api/orders/{order_id}", None, Some("A 1")),
            "https://app.acme.test/api/orders/A%201"
        );
        assert_eq!(
            profile.url("/contacts?groupId={group_id}", Some("C123"), None),
            "https://app.acme.test/contacts?groupId=C123"
        );
        assert_eq!(
            profile.url("https://other.test/x", None, None),
            "https://other.test/x"
        );
    }

    #[test]
    fn validate_rejects_bad_urls() {
        let profile = VendorProfile {
            base_url: "app.acme.test".to_string(),
            ..Default::default()
        };
        assert!(profile.validate().is_err());
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials {
            username: "agent@example.com".into(),
            password: "hunter2".into(),
        };
        let shown = format!("{:?}", creds);
        assert!(shown.contains("agent@example.com"));
        assert!(!shown.contains("hunter2"));
    }
}
