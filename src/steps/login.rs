use super::template_error;
use crate::error::{MatcherError, StepError};
use crate::session::{Document, Form, Session};
use crate::step::{Credentials, LoginCapable, LoginSnapshot, Step};
use crate::template::TemplateVars;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Logs in by opening a page and submitting a form.
///
/// `login_url` and every field value are templates over `username`,
/// `password` and `base_url`. After submission the resulting page must
/// match `success_marker`; a match on `confirmation_marker` means the site
/// wants an out-of-band identity check.
#[derive(Clone, Serialize, Deserialize)]
pub struct FormLogin {
    #[serde(default = "default_name")]
    name: String,

    login_url: String,
    form: Form,

    #[serde(default = "default_fields")]
    fields: BTreeMap<String, String>,

    success_marker: String,

    #[serde(default)]
    confirmation_marker: Option<String>,

    #[serde(default)]
    credentials: Option<Credentials>,
}

fn default_name() -> String {
    "login".to_string()
}

fn default_fields() -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert("username".to_string(), "{{username}}".to_string());
    fields.insert("password".to_string(), "{{password}}".to_string());
    fields
}

impl FormLogin {
    /// Snapshot kind produced by this step.
    pub const KIND: &'static str = "login";

    /// Create a login step submitting `form` at `login_url`.
    pub fn new(login_url: &str, form: Form, success_marker: &str) -> Self {
        Self {
            name: default_name(),
            login_url: login_url.to_string(),
            form,
            fields: default_fields(),
            success_marker: success_marker.to_string(),
            confirmation_marker: None,
            credentials: None,
        }
    }

    /// Set the step name.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set the form fields, as templates.
    pub fn with_fields(mut self, fields: BTreeMap<String, String>) -> Self {
        self.fields = fields;
        self
    }

    /// Fail with a confirmation request when `marker` shows up.
    pub fn with_confirmation_marker(mut self, marker: &str) -> Self {
        self.confirmation_marker = Some(marker.to_string());
        self
    }

    /// Rebuild the step, credentials included, from a snapshot.
    pub fn from_snapshot(snapshot: &LoginSnapshot) -> Result<Self, StepError> {
        if snapshot.kind != Self::KIND {
            return Err(StepError::failed(format!(
                "cannot log in from a `{}` snapshot",
                snapshot.kind
            )));
        }
        snapshot
            .restore()
            .map_err(|e| StepError::failed(format!("unusable login snapshot: {e}")))
    }

    /// Check that both markers are valid patterns.
    pub fn validate(&self) -> Result<(), MatcherError> {
        let markers = std::iter::once(&self.success_marker).chain(&self.confirmation_marker);
        for marker in markers {
            Regex::new(marker).map_err(|source| MatcherError::Pattern {
                pattern: marker.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn vars(&self) -> TemplateVars {
        let mut vars = TemplateVars::new();
        if let Some(credentials) = &self.credentials {
            vars.set("username", credentials.username.as_str());
            vars.set("password", credentials.password.as_str());
            vars.set_opt("base_url", credentials.base_url.as_deref());
        }
        vars
    }

    fn check(&self, doc: &Document) -> Result<(), StepError> {
        if let Some(marker) = &self.confirmation_marker {
            if marker_regex(marker)?.is_match(&doc.content) {
                return Err(StepError::IdentityConfirmationRequired(format!(
                    "{} asks for identity confirmation",
                    doc.url
                )));
            }
        }

        if !marker_regex(&self.success_marker)?.is_match(&doc.content) {
            return Err(StepError::InvalidCredentials(format!(
                "`{}` not found after login at {}",
                self.success_marker, doc.url
            )));
        }

        Ok(())
    }
}

fn marker_regex(marker: &str) -> Result<Regex, StepError> {
    Regex::new(marker).map_err(|e| StepError::failed(format!("invalid marker `{marker}`: {e}")))
}

impl fmt::Debug for FormLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormLogin")
            .field("name", &self.name)
            .field("login_url", &self.login_url)
            .field("form", &self.form)
            .field("success_marker", &self.success_marker)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl Step for FormLogin {
    type Input = ();
    type Output = Document;

    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, _input: &(), session: &mut dyn Session) -> Result<Document, StepError> {
        let vars = self.vars();

        let url = vars.render(&self.login_url).map_err(template_error)?;
        session.open(&url)?;

        let fields = vars.render_fields(&self.fields).map_err(template_error)?;
        let doc = session.submit_form(&self.form, &fields)?;

        self.check(&doc)?;
        tracing::debug!(step = %self.name, url = %doc.url, "Logged in");

        Ok(doc)
    }

    fn as_login(&mut self) -> Option<&mut dyn LoginCapable> {
        Some(self)
    }
}

impl LoginCapable for FormLogin {
    fn set_credentials(&mut self, credentials: &Credentials) {
        self.credentials = Some(credentials.clone());
    }

    fn snapshot(&self) -> Result<LoginSnapshot, serde_json::Error> {
        LoginSnapshot::capture(Self::KIND, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StaticSession;
    use std::collections::HashMap;

    fn session(after_submit: &str) -> StaticSession {
        let mut pages = HashMap::new();
        pages.insert("https://id.example.test/signin".to_string(), "<form>".to_string());
        pages.insert("form#signin".to_string(), after_submit.to_string());
        StaticSession::new(pages)
    }

    fn step() -> FormLogin {
        let mut login = FormLogin::new("{{base_url}}/signin", Form::new("form#signin"), r"Sign out")
            .with_confirmation_marker("Enter the code");
        login.set_credentials(
            &Credentials::new("jane", "hunter2").with_base_url("https://id.example.test"),
        );
        login
    }

    #[test]
    fn test_login_success() {
        let mut session = session("Hi {username}! <a>Sign out</a>");

        let doc = step().run(&(), &mut session).unwrap();

        assert_eq!(doc.content, "Hi jane! <a>Sign out</a>");
        assert_eq!(session.current(), Some("form#signin"));
    }

    #[test]
    fn test_login_rejected() {
        let mut session = session("Unknown user");

        let err = step().run(&(), &mut session).unwrap_err();
        assert!(matches!(err, StepError::InvalidCredentials(_)));
    }

    #[test]
    fn test_identity_confirmation() {
        let mut session = session("Enter the code we sent you. <a>Sign out</a>");

        let err = step().run(&(), &mut session).unwrap_err();
        assert!(matches!(err, StepError::IdentityConfirmationRequired(_)));
    }

    #[test]
    fn test_missing_base_url_is_template_error() {
        let mut login = FormLogin::new("{{base_url}}/signin", Form::new("form#signin"), "Sign out");
        login.set_credentials(&Credentials::new("jane", "hunter2"));

        let err = login.run(&(), &mut session("Sign out")).unwrap_err();
        assert!(matches!(err, StepError::Template(_)));
    }

    #[test]
    fn test_snapshot_restores_credentials() {
        let snapshot = step().snapshot().unwrap();
        assert_eq!(snapshot.kind, FormLogin::KIND);

        let mut restored = FormLogin::from_snapshot(&snapshot).unwrap();
        let doc = restored.run(&(), &mut session("Sign out {password}")).unwrap();
        assert_eq!(doc.content, "Sign out hunter2");

        let foreign = LoginSnapshot::capture("oauth", &()).unwrap();
        assert!(FormLogin::from_snapshot(&foreign).is_err());
    }

    #[test]
    fn test_debug_hides_password() {
        assert!(!format!("{:?}", step()).contains("hunter2"));
    }

    #[test]
    fn test_params_from_json() {
        let login: FormLogin = serde_json::from_value(serde_json::json!({
            "login_url": "https://id.example.test/signin",
            "form": { "selector": "form#signin" },
            "success_marker": "Sign out"
        }))
        .unwrap();

        assert_eq!(login.name(), "login");
        assert_eq!(login.fields, default_fields());
        assert!(login.validate().is_ok());
        assert!(FormLogin::new("x", Form::new("f"), "(").validate().is_err());
    }
}
