//! Sessions backed by an FGP browser daemon.
//!
//! Every navigation is one daemon call (`<service>.open`, `.submit`,
//! `.follow`, `.close`); the daemon keeps the browser state between calls.
//! The daemon is started on first use.

use crate::error::SessionError;
use crate::session::{Anchor, Document, Form, Session, SessionFactory};
use crate::yaml::RunFlags;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// One browser session held by the daemon.
#[derive(Debug)]
pub struct DaemonSession {
    service: String,
    flags: RunFlags,
    closed: bool,
}

impl DaemonSession {
    /// Create a session on the `service` daemon.
    pub fn new(service: &str, flags: RunFlags) -> Self {
        Self {
            service: service.to_string(),
            flags,
            closed: false,
        }
    }

    /// Get the daemon service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    fn call(&self, action: &str, params: Value) -> Result<Value, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }

        let method = method_name(&self.service, action);
        tracing::trace!(service = %self.service, method = %method, "Calling daemon");

        let response = fgp_daemon::client::call_auto_start(&self.service, &method, params)
            .map_err(|e| SessionError::Daemon(format!("{method}: {e:#}")))?;

        if !response.ok {
            let error = response.error.map(|e| e.message).unwrap_or_default();
            return Err(SessionError::Daemon(format!("{method} returned error: {error}")));
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    fn navigate(&self, action: &str, params: Value) -> Result<Document, SessionError> {
        let result = self.call(action, params)?;
        parse_document(result)
    }
}

fn method_name(service: &str, action: &str) -> String {
    format!("{service}.{action}")
}

fn open_params(url: &str, flags: &RunFlags) -> Value {
    json!({
        "url": url,
        "javascript": flags.javascript,
        "mobile": flags.mobile_user_agent,
        "lenient_cookies": flags.lenient_cookie_quotes,
    })
}

/// Turn a daemon result into a document; the daemon reports HTTP failures
/// as a `status` field next to the page.
fn parse_document(result: Value) -> Result<Document, SessionError> {
    if let Some(status) = result.get("status").and_then(Value::as_u64) {
        if status >= 400 {
            let url = result
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Err(SessionError::Status {
                url,
                status: status as u16,
            });
        }
    }

    serde_json::from_value(result).map_err(|e| SessionError::Malformed(e.to_string()))
}

impl Session for DaemonSession {
    fn open(&mut self, url: &str) -> Result<Document, SessionError> {
        if url.trim().is_empty() {
            return Err(SessionError::InvalidAddress(url.to_string()));
        }
        self.navigate("open", open_params(url, &self.flags))
    }

    fn submit_form(
        &mut self,
        form: &Form,
        fields: &BTreeMap<String, String>,
    ) -> Result<Document, SessionError> {
        self.navigate("submit", json!({ "form": form.selector, "fields": fields }))
    }

    fn follow_link(&mut self, anchor: &Anchor) -> Result<Document, SessionError> {
        self.navigate("follow", json!({ "href": anchor.href, "text": anchor.text }))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.call("close", json!({})) {
            tracing::warn!(service = %self.service, error = %err, "Failed to close daemon session");
        }
        self.closed = true;
    }
}

/// Opens one [`DaemonSession`] per workflow run or fan-out worker.
#[derive(Debug, Clone)]
pub struct DaemonSessionFactory {
    service: String,
}

impl DaemonSessionFactory {
    /// Use the daemon registered as `service` (e.g. `browser`).
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }
}

impl Default for DaemonSessionFactory {
    fn default() -> Self {
        Self::new("browser")
    }
}

impl SessionFactory for DaemonSessionFactory {
    fn open_session(&self, flags: &RunFlags) -> Result<Box<dyn Session>, SessionError> {
        Ok(Box::new(DaemonSession::new(&self.service, flags.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names() {
        assert_eq!(method_name("browser", "open"), "browser.open");
        assert_eq!(method_name("browser", "follow"), "browser.follow");
    }

    #[test]
    fn test_open_params_carry_flags() {
        let flags = RunFlags {
            javascript: true,
            lenient_cookie_quotes: true,
            ..RunFlags::default()
        };

        let params = open_params("https://example.test/", &flags);

        assert_eq!(params["url"], "https://example.test/");
        assert_eq!(params["javascript"], true);
        assert_eq!(params["mobile"], false);
        assert_eq!(params["lenient_cookies"], true);
    }

    #[test]
    fn test_parse_document() {
        let doc = parse_document(json!({ "url": "https://example.test/", "html": "<p>hi</p>" })).unwrap();
        assert_eq!(doc, Document::new("https://example.test/", "<p>hi</p>"));

        let err = parse_document(json!({ "url": "https://example.test/x", "status": 404 })).unwrap_err();
        assert!(matches!(err, SessionError::Status { status: 404, .. }));

        let err = parse_document(json!({ "content": "no url" })).unwrap_err();
        assert!(matches!(err, SessionError::Malformed(_)));
    }

    #[test]
    fn test_closed_session_makes_no_calls() {
        let mut session = DaemonSession::new("browser", RunFlags::default());
        session.closed = true;

        assert!(matches!(
            session.open("https://example.test/"),
            Err(SessionError::Closed)
        ));
        session.close();
    }

    #[test]
    fn test_empty_url_rejected() {
        let mut session = DaemonSession::new("browser", RunFlags::default());
        assert!(matches!(session.open("  "), Err(SessionError::InvalidAddress(_))));
    }
}
