//! The browsing session shared by the steps of one workflow run.
//!
//! The engine never looks inside a session: steps drive it, the workflow
//! opens it through a [`SessionFactory`] and closes it through a
//! [`SessionGuard`].

use crate::error::SessionError;
use crate::yaml::RunFlags;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A page as returned by the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Location the session ended up at
    pub url: String,

    /// Rendered markup or text
    #[serde(default, alias = "html")]
    pub content: String,
}

impl Document {
    /// Create a document.
    pub fn new(url: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content: content.into(),
        }
    }
}

/// A form on the current page, identified by a selector or name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Form {
    pub selector: String,
}

impl Form {
    /// Create a form reference.
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
        }
    }
}

/// A link discovered on a page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Anchor {
    pub href: String,

    #[serde(default)]
    pub text: String,
}

impl Anchor {
    /// Create an anchor.
    pub fn new(href: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            text: text.into(),
        }
    }
}

/// Stateful navigation capability.
///
/// Calls are expected to move the session's "current page", which later
/// steps rely on.
pub trait Session: Send {
    fn open(&mut self, url: &str) -> Result<Document, SessionError>;

    fn submit_form(
        &mut self,
        form: &Form,
        fields: &BTreeMap<String, String>,
    ) -> Result<Document, SessionError>;

    fn follow_link(&mut self, anchor: &Anchor) -> Result<Document, SessionError>;

    /// Release the session. Called exactly once by [`SessionGuard`].
    fn close(&mut self);
}

/// Creates sessions for workflow runs and fan-out workers.
pub trait SessionFactory: Send + Sync {
    fn open_session(&self, flags: &RunFlags) -> Result<Box<dyn Session>, SessionError>;
}

/// Scoped ownership of a session: closes it exactly once when dropped,
/// including during unwinding.
pub struct SessionGuard {
    session: Option<Box<dyn Session>>,
}

impl SessionGuard {
    /// Take ownership of `session`.
    pub fn new(session: Box<dyn Session>) -> Self {
        Self {
            session: Some(session),
        }
    }

    /// Open a session from `factory` and take ownership of it.
    pub fn acquire(factory: &dyn SessionFactory, flags: &RunFlags) -> Result<Self, SessionError> {
        factory.open_session(flags).map(Self::new)
    }

    /// Get the guarded session.
    pub fn session(&mut self) -> &mut dyn Session {
        // Only `Drop` takes the session out.
        self.session
            .as_deref_mut()
            .expect("session is present until the guard is dropped")
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            tracing::debug!("Closing session");
            session.close();
        }
    }
}

/// Shared counters observed by [`StaticSession`] instances.
#[derive(Debug, Default)]
pub struct SessionStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
    requests: Mutex<Vec<String>>,
}

impl SessionStats {
    /// Number of sessions opened.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of sessions closed.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Every URL requested so far, in request order.
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn record(&self, url: &str) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(url.to_string());
        }
    }
}

/// A session serving canned pages, for tests and offline replays.
///
/// `open` and `follow_link` look the URL (or href) up in the page map;
/// `submit_form` looks up `"<selector>"` and renders `{field}` placeholders
/// with the submitted values if the page contains them.
#[derive(Clone)]
pub struct StaticSession {
    pages: Arc<HashMap<String, String>>,
    stats: Arc<SessionStats>,
    current: Option<String>,
    closed: bool,
}

impl StaticSession {
    /// Create a session serving `pages`.
    pub fn new(pages: HashMap<String, String>) -> Self {
        Self {
            pages: Arc::new(pages),
            stats: Arc::new(SessionStats::default()),
            current: None,
            closed: false,
        }
    }

    /// Get the shared counters.
    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    /// URL of the page the session is on.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    fn fetch(&mut self, url: &str) -> Result<Document, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        self.stats.record(url);
        let content = self.pages.get(url).ok_or_else(|| SessionError::Status {
            url: url.to_string(),
            status: 404,
        })?;
        self.current = Some(url.to_string());
        Ok(Document::new(url, content.clone()))
    }
}

impl Session for StaticSession {
    fn open(&mut self, url: &str) -> Result<Document, SessionError> {
        if url.trim().is_empty() {
            return Err(SessionError::InvalidAddress(url.to_string()));
        }
        self.fetch(url)
    }

    fn submit_form(
        &mut self,
        form: &Form,
        fields: &BTreeMap<String, String>,
    ) -> Result<Document, SessionError> {
        let mut doc = self.fetch(&form.selector)?;
        for (name, value) in fields {
            doc.content = doc.content.replace(&format!("{{{name}}}"), value);
        }
        Ok(doc)
    }

    fn follow_link(&mut self, anchor: &Anchor) -> Result<Document, SessionError> {
        self.fetch(&anchor.href)
    }

    fn close(&mut self) {
        self.closed = true;
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out [`StaticSession`]s over one shared page map.
pub struct StaticSessionFactory {
    template: StaticSession,
}

impl StaticSessionFactory {
    /// Create a factory serving `pages`.
    pub fn new(pages: HashMap<String, String>) -> Self {
        Self {
            template: StaticSession::new(pages),
        }
    }

    /// Counters shared by every session this factory opened.
    pub fn stats(&self) -> Arc<SessionStats> {
        self.template.stats()
    }
}

impl SessionFactory for StaticSessionFactory {
    fn open_session(&self, _flags: &RunFlags) -> Result<Box<dyn Session>, SessionError> {
        self.template.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.template.clone()))
    }
}
