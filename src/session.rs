use anyhow::Result;
use reqwest::blocking::{multipart, Client, RequestBuilder};
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::VendorProfile;

/// A fully read HTTP response.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    /// Final URL after redirects.
    pub url: String,
    pub content_type: String,
    pub body: String,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_json(&self) -> bool {
        self.content_type.contains("json")
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.body).ok()
    }
}

/// The single cookie-carrying HTTP session a run owns.
pub struct Session {
    client: Client,
    bearer: Option<String>,
    dump_dir: Option<PathBuf>,
    dump_count: usize,
}

impl Session {
    pub fn new(profile: &VendorProfile) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8"),
        );
        headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        if let Ok(origin) = HeaderValue::from_str(profile.base_url.trim_end_matches('/')) {
            headers.insert(header::ORIGIN, origin.clone());
            headers.insert(header::REFERER, origin);
        }

        let client = Client::builder()
            .user_agent(profile.user_agent.clone())
            .timeout(Duration::from_secs(profile.request_timeout_secs))
            .cookie_store(true)
            .default_headers(headers)
            .build()?;

        Ok(Session {
            client,
            bearer: None,
            dump_dir: None,
            dump_count: 0,
        })
    }

    /// Writes every response body into `dir` as it arrives.
    pub fn with_dump_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.dump_dir = dir;
        self
    }

    pub fn set_bearer(&mut self, token: String) {
        self.bearer = Some(token);
    }

    pub fn get(&mut self, url: &str, label: &str) -> reqwest::Result<Reply> {
        let request = self.client.get(url);
        self.send(request, label)
    }

    pub fn post_form(&mut self, url: &str, form: &[(&str, &str)], label: &str) -> reqwest::Result<Reply> {
        let request = self.client.post(url).form(form);
        self.send(request, label)
    }

    pub fn post_json<T: Serialize + ?Sized>(&mut self, url: &str, body: &T, label: &str) -> reqwest::Result<Reply> {
        let request = self.client.post(url).json(body);
        self.send(request, label)
    }

    pub fn post_multipart(&mut self, url: &str, form: multipart::Form, label: &str) -> reqwest::Result<Reply> {
        let request = self.client.post(url).multipart(form);
        self.send(request, label)
    }

    fn send(&mut self, mut request: RequestBuilder, label: &str) -> reqwest::Result<Reply> {
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send()?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text()?;

        debug!("{} -> HTTP {} ({} bytes, {})", label, status, body.len(), content_type);
        self.dump(label, &body);

        Ok(Reply {
            status,
            url,
            content_type,
            body,
        })
    }

    fn dump(&mut self, label: &str, body: &str) {
        let Some(dir) = &self.dump_dir else {
            return;
        };
        self.dump_count += 1;
        let safe_label: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{:02}-{}.txt", self.dump_count, safe_label));
        let written = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, body));
        if let Err(e) = written {
            warn!("Could not dump response to {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn bearer_token_is_sent_after_set() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/ping")
                .header("authorization", "Bearer abc123");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":true}"#);
        });

        let mut session = Session::new(&VendorProfile::default()).unwrap();
        session.set_bearer("abc123".to_string());
        let reply = session.get(&server.url("/api/ping"), "ping").unwrap();

        mock.assert();
        assert!(reply.is_success());
        assert!(reply.is_json());
        assert_eq!(reply.json().unwrap()["ok"], true);
    }

    #[test]
    fn cookies_persist_between_requests() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/set");
            then.status(200).header("set-cookie", "sid=42; Path=/").body("ok");
        });
        let echo = server.mock(|when, then| {
            when.method(GET).path("/check").header("cookie", "sid=42");
            then.status(200).body("seen");
        });

        let mut session = Session::new(&VendorProfile::default()).unwrap();
        session.get(&server.url("/set"), "set").unwrap();
        let reply = session.get(&server.url("/check"), "check").unwrap();

        echo.assert();
        assert_eq!(reply.body, "seen");
    }

    #[test]
    fn responses_are_dumped_when_requested() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/page");
            then.status(200).body("<html>grid</html>");
        });
        let dir = tempfile::tempdir().unwrap();

        let mut session = Session::new(&VendorProfile::default())
            .unwrap()
            .with_dump_dir(Some(dir.path().to_path_buf()));
        session.get(&server.url("/page"), "contacts page").unwrap();

        let dumped = std::fs::read_to_string(dir.path().join("01-contacts_page.txt")).unwrap();
        assert_eq!(dumped, "<html>grid</html>");
    }
}
