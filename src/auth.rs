use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Credentials, VendorProfile};
use crate::errors::{Result, WorkflowError};
use crate::session::{Reply, Session};

/// The one signal that tells a successful login apart from a failed one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoginPredicate {
    /// The final URL after redirects contains `pattern`.
    RedirectUrlContains { pattern: String },
    /// The final URL carries a bearer token in query parameter `param`.
    TokenInRedirect { param: String },
    /// `pattern` is a regex whose first capture group is the bearer token.
    TokenInBody { pattern: String },
    /// A GET of `path` after login answers 2xx with `marker` in the body.
    Probe { path: String, marker: String },
}

/// What a predicate concluded from the login response.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Confirmed { bearer: Option<String> },
    /// The predicate needs a follow-up request before it can decide.
    NeedsProbe { path: String, marker: String },
    Rejected(String),
}

impl LoginPredicate {
    pub fn evaluate(&self, reply: &Reply) -> Result<Verdict> {
        let verdict = match self {
            LoginPredicate::RedirectUrlContains { pattern } => {
                if reply.url.contains(pattern.as_str()) {
                    Verdict::Confirmed { bearer: None }
                } else {
                    Verdict::Rejected(format!("landed on {} instead of a URL containing '{}'", reply.url, pattern))
                }
            }
            LoginPredicate::TokenInRedirect { param } => {
                let token = Url::parse(&reply.url).ok().and_then(|url| {
                    url.query_pairs()
                        .find(|(key, _)| key == param.as_str())
                        .map(|(_, value)| value.into_owned())
                });
                match token {
                    Some(token) if !token.is_empty() => Verdict::Confirmed { bearer: Some(token) },
                    _ => Verdict::Rejected(format!("no '{}' parameter in {}", param, reply.url)),
                }
            }
            LoginPredicate::TokenInBody { pattern } => {
                let regex = Regex::new(pattern).map_err(|e| {
                    WorkflowError::Authentication(format!("invalid token pattern '{}': {}", pattern, e))
                })?;
                match regex.captures(&reply.body).and_then(|c| c.get(1)) {
                    Some(token) => Verdict::Confirmed {
                        bearer: Some(token.as_str().to_string()),
                    },
                    None => Verdict::Rejected("token pattern not found in login response".to_string()),
                }
            }
            LoginPredicate::Probe { path, marker } => Verdict::NeedsProbe {
                path: path.clone(),
                marker: marker.clone(),
            },
        };
        Ok(verdict)
    }
}

/// Base64 of the password, as the vendor's login form does client-side.
/// Obfuscation only.
pub fn encode_password(password: &str) -> String {
    STANDARD.encode(password.as_bytes())
}

/// Logs in, trying at most `profile.login.max_attempts` times.
pub fn login(session: &mut Session, profile: &VendorProfile, credentials: &Credentials) -> Result<()> {
    let attempts = profile.login.max_attempts.max(1);
    let mut last_reason = String::from("no attempt made");

    for attempt in 1..=attempts {
        info!("Logging in as {} (attempt {}/{})", credentials.username, attempt, attempts);
        match attempt_login(session, profile, credentials)? {
            Verdict::Confirmed { bearer } => {
                if let Some(token) = bearer {
                    debug!("Login yielded a bearer token");
                    session.set_bearer(token);
                }
                info!("Login confirmed");
                return Ok(());
            }
            Verdict::Rejected(reason) => {
                warn!("Login attempt {} not confirmed: {}", attempt, reason);
                last_reason = reason;
            }
            Verdict::NeedsProbe { path, .. } => {
                last_reason = format!("probe of {} was never run", path);
            }
        }
    }

    Err(WorkflowError::Authentication(format!(
        "not confirmed after {} attempt(s): {}",
        attempts, last_reason
    )))
}

fn attempt_login(session: &mut Session, profile: &VendorProfile, credentials: &Credentials) -> Result<Verdict> {
    // Picks up session cookies and any CSRF cookie before the form post
    match session.get(&profile.login_url, "login page") {
        Ok(reply) if !reply.is_success() => {
            return Ok(Verdict::Rejected(format!("login page answered HTTP {}", reply.status)));
        }
        Ok(_) => {}
        Err(e) => return Ok(Verdict::Rejected(format!("login page unreachable: {}", e))),
    }

    let encoded = encode_password(&credentials.password);
    let form = [
        (profile.login.username_field.as_str(), credentials.username.as_str()),
        (profile.login.password_field.as_str(), encoded.as_str()),
    ];
    let reply = match session.post_form(&profile.login_url, &form, "login submit") {
        Ok(reply) => reply,
        Err(e) => return Ok(Verdict::Rejected(format!("login form post failed: {}", e))),
    };

    match profile.login.success.evaluate(&reply)? {
        Verdict::NeedsProbe { path, marker } => Ok(probe(session, profile, &path, &marker)),
        verdict => Ok(verdict),
    }
}

fn probe(session: &mut Session, profile: &VendorProfile, path: &str, marker: &str) -> Verdict {
    let url = profile.url(path, None, None);
    match session.get(&url, "login probe") {
        Ok(reply) if reply.is_success() && reply.body.to_lowercase().contains(&marker.to_lowercase()) => {
            Verdict::Confirmed { bearer: None }
        }
        Ok(reply) => Verdict::Rejected(format!(
            "probe {} answered HTTP {} without '{}'",
            url, reply.status, marker
        )),
        Err(e) => Verdict::Rejected(format!("probe {} failed: {}", url, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(url: &str, body: &str) -> Reply {
        Reply {
            status: 200,
            url: url.to_string(),
            content_type: "text/html".to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn password_is_plain_base64() {
        assert_eq!(encode_password("hunter2"), "aHVudGVyMg==");
        assert_eq!(encode_password(""), "");
    }

    #[test]
    fn redirect_predicate() {
        let predicate = LoginPredicate::RedirectUrlContains {
            pattern: "app.acme.test".into(),
        };
        assert_eq!(
            predicate.evaluate(&reply("https://app.acme.test/dashboard", "")).unwrap(),
            Verdict::Confirmed { bearer: None }
        );
        assert!(matches!(
            predicate.evaluate(&reply("https://login.acme.test/?error=1", "")).unwrap(),
            Verdict::Rejected(_)
        ));
    }

    #[test]
    fn token_in_redirect_extracts_bearer() {
        let predicate = LoginPredicate::TokenInRedirect { param: "token".into() };
        assert_eq!(
            predicate
                .evaluate(&reply("https://app.acme.test/?token=abc%2Bdef&x=1", ""))
                .unwrap(),
            Verdict::Confirmed {
                bearer: Some("abc+def".into())
            }
        );
        assert!(matches!(
            predicate.evaluate(&reply("https://app.acme.test/?token=", "")).unwrap(),
            Verdict::Rejected(_)
        ));
    }

    #[test]
    fn token_in_body_uses_first_capture() {
        let predicate = LoginPredicate::TokenInBody {
            pattern: r#""token":"([^"]+)""#.into(),
        };
        assert_eq!(
            predicate
                .evaluate(&reply("https://login.acme.test/", r#"{"token":"t-1"}"#))
                .unwrap(),
            Verdict::Confirmed {
                bearer: Some("t-1".into())
            }
        );
    }

    #[test]
    fn broken_token_pattern_is_an_authentication_error() {
        let predicate = LoginPredicate::TokenInBody { pattern: "(".into() };
        let err = predicate.evaluate(&reply("https://x.test/", "")).unwrap_err();
        assert!(matches!(err, WorkflowError::Authentication(_)));
    }
}
