use super::FormLogin;
use crate::error::StepError;
use crate::fanout::{partition, FanOut, FanOutConfig, SeenGuard, Task};
use crate::matcher::{IdentitySanitizer, PagePart, Record, Sanitizer, SequenceMatcher};
use crate::session::{Anchor, Session, SessionFactory, SessionGuard};
use crate::step::{LoginSnapshot, NeedsLoginSnapshot, Step};
use crate::yaml::RunFlags;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Replays a login on a fresh worker session from its snapshot.
pub type Relogin = Arc<dyn Fn(&LoginSnapshot, &mut dyn Session) -> Result<(), StepError> + Send + Sync>;

/// Re-login for [`FormLogin`] snapshots.
pub fn form_relogin() -> Relogin {
    Arc::new(|snapshot: &LoginSnapshot, session: &mut dyn Session| -> Result<(), StepError> {
        FormLogin::from_snapshot(snapshot)?.run(&(), session).map(|_| ())
    })
}

/// Follows every link from the previous step and extracts one record per
/// page, spreading the links over parallel workers.
///
/// Each worker opens its own session from the factory and, when the
/// workflow logged in, replays the login from the injected snapshot before
/// following its links. The replay is picked by the snapshot's kind; only
/// [`FormLogin`] snapshots are known out of the box.
pub struct FanOutExtract {
    name: String,
    parts: Arc<Vec<PagePart>>,
    sanitizer: Arc<dyn Sanitizer>,
    factory: Arc<dyn SessionFactory>,
    flags: RunFlags,
    config: FanOutConfig,
    snapshot: Option<LoginSnapshot>,
    relogins: BTreeMap<String, Relogin>,
}

impl FanOutExtract {
    /// Create a fan-out extraction over `parts`.
    pub fn new(parts: Vec<PagePart>, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            name: "fan_out_extract".to_string(),
            parts: Arc::new(parts),
            sanitizer: Arc::new(IdentitySanitizer),
            factory,
            flags: RunFlags::default(),
            config: FanOutConfig::default(),
            snapshot: None,
            relogins: BTreeMap::from([(FormLogin::KIND.to_string(), form_relogin())]),
        }
    }

    /// Set the step name.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Clean captured values with `sanitizer`.
    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn Sanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// Session flags for the worker sessions.
    pub fn with_flags(mut self, flags: RunFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the fan-out tuning.
    pub fn with_config(mut self, config: FanOutConfig) -> Self {
        self.config = config;
        self
    }

    /// Re-authenticate workers with `relogin` for snapshots of `kind`.
    pub fn with_relogin(mut self, kind: &str, relogin: Relogin) -> Self {
        self.relogins.insert(kind.to_string(), relogin);
        self
    }

    /// Get the fan-out tuning.
    pub fn config(&self) -> &FanOutConfig {
        &self.config
    }

    /// Get the injected login snapshot.
    pub fn snapshot(&self) -> Option<&LoginSnapshot> {
        self.snapshot.as_ref()
    }

    fn relogin(&self) -> Result<Option<(LoginSnapshot, Relogin)>, StepError> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(None);
        };
        let relogin = self.relogins.get(&snapshot.kind).ok_or_else(|| {
            StepError::failed(format!("cannot log in from a `{}` snapshot", snapshot.kind))
        })?;
        Ok(Some((snapshot.clone(), relogin.clone())))
    }

    fn batch_task(
        &self,
        batch: Vec<Anchor>,
        visited: &Arc<SeenGuard<String>>,
        relogin: &Option<(LoginSnapshot, Relogin)>,
    ) -> Task<Record, StepError> {
        let parts = self.parts.clone();
        let sanitizer = self.sanitizer.clone();
        let factory = self.factory.clone();
        let flags = self.flags.clone();
        let relogin = relogin.clone();
        let visited = visited.clone();

        Box::new(move || -> Result<Vec<Record>, StepError> {
            let mut guard = SessionGuard::acquire(factory.as_ref(), &flags)?;
            let session = guard.session();

            if let Some((snapshot, relogin)) = &relogin {
                relogin(snapshot, &mut *session)?;
            }

            let mut records = Vec::with_capacity(batch.len());
            for anchor in &batch {
                let doc = session.follow_link(anchor)?;
                if !visited.claim(doc.url.clone()) {
                    tracing::debug!(href = %anchor.href, url = %doc.url, "Page already extracted, skipping");
                    continue;
                }

                let record = SequenceMatcher::new(&parts, &doc.content)
                    .with_sanitizer(sanitizer.as_ref())
                    .retrieve_information();
                if record.is_empty() {
                    tracing::warn!(url = %doc.url, "Nothing extracted from page");
                    continue;
                }
                records.push(record);
            }

            Ok(records)
        })
    }
}

impl fmt::Debug for FanOutExtract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanOutExtract")
            .field("name", &self.name)
            .field("parts", &self.parts.len())
            .field("flags", &self.flags)
            .field("config", &self.config)
            .field("snapshot", &self.snapshot)
            .field("relogins", &self.relogins.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Step for FanOutExtract {
    type Input = Vec<Anchor>;
    type Output = Vec<Record>;

    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, input: &Vec<Anchor>, _session: &mut dyn Session) -> Result<Vec<Record>, StepError> {
        let scheduled = SeenGuard::new();
        let anchors: Vec<Anchor> = input
            .iter()
            .filter(|anchor| scheduled.claim(anchor.href.clone()))
            .cloned()
            .collect();

        let relogin = self.relogin()?;
        let fan_out = FanOut::for_items(self.config.clone(), anchors.len());
        let visited = Arc::new(SeenGuard::new());
        let tasks = partition(&anchors, self.config.items_per_worker)
            .into_iter()
            .map(|batch| self.batch_task(batch, &visited, &relogin))
            .collect::<Vec<_>>();

        tracing::info!(
            step = %self.name,
            links = anchors.len(),
            batches = tasks.len(),
            workers = fan_out.workers(),
            relogin = self.snapshot.is_some(),
            "Fanning out"
        );

        Ok(fan_out.execute(tasks)?)
    }

    fn as_snapshot_consumer(&mut self) -> Option<&mut dyn NeedsLoginSnapshot> {
        Some(self)
    }
}

impl NeedsLoginSnapshot for FanOutExtract {
    fn accept_snapshot(&mut self, snapshot: LoginSnapshot) {
        self.snapshot = Some(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FanOutError, SessionError};
    use crate::session::{Form, StaticSession, StaticSessionFactory};
    use crate::step::{Credentials, LoginCapable};
    use crate::error::WorkflowError;
    use crate::steps::{CollectLinks, OpenPage};
    use crate::workflow::Workflow;
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;

    fn parts() -> Vec<PagePart> {
        vec![
            PagePart::info("name", "<h1>", ".*?", "</h1>").unwrap(),
            PagePart::info("phone", "tel:", r"[0-9]+", "\"").unwrap(),
        ]
    }

    fn contact_pages(count: usize) -> HashMap<String, String> {
        (0..count)
            .map(|i| {
                (
                    format!("/contacts/{i}"),
                    format!("<h1>Contact {i}</h1><a href=\"tel:555{i:04}\">call</a>"),
                )
            })
            .collect()
    }

    fn anchors(count: usize) -> Vec<Anchor> {
        (0..count)
            .map(|i| Anchor::new(format!("/contacts/{i}"), format!("Contact {i}")))
            .collect()
    }

    fn config() -> FanOutConfig {
        FanOutConfig {
            poll_timeout: Duration::from_secs(5),
            ..FanOutConfig::default()
        }
    }

    #[test]
    fn test_twenty_five_links() {
        let factory = Arc::new(StaticSessionFactory::new(contact_pages(25)));
        let mut step = FanOutExtract::new(parts(), factory.clone()).with_config(config());

        let records = step
            .run(&anchors(25), &mut StaticSession::new(HashMap::new()))
            .unwrap();

        assert_eq!(records.len(), 25);
        let names: HashSet<&str> = records.iter().map(|r| r["name"].as_str()).collect();
        assert_eq!(names.len(), 25);
        assert!(names.contains("Contact 24"));
        assert!(records.iter().any(|r| r["phone"] == "5550007"));

        // Two workers, three batches of at most ten links, one session each.
        assert_eq!(FanOut::for_items(config(), 25).workers(), 2);
        assert_eq!(factory.stats().opened(), 3);
        assert_eq!(factory.stats().closed(), 3);
    }

    #[test]
    fn test_duplicate_links_extracted_once() {
        let factory = Arc::new(StaticSessionFactory::new(contact_pages(3)));
        let mut step = FanOutExtract::new(parts(), factory.clone()).with_config(config());

        let mut links = anchors(3);
        links.push(Anchor::new("/contacts/0", "Contact 0 again"));

        let records = step.run(&links, &mut StaticSession::new(HashMap::new())).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(factory.stats().requests().len(), 3);
    }

    #[test]
    fn test_missing_page_fails_aggregation() {
        let factory = Arc::new(StaticSessionFactory::new(contact_pages(5)));
        let mut step = FanOutExtract::new(parts(), factory.clone()).with_config(config());

        let err = step
            .run(&anchors(8), &mut StaticSession::new(HashMap::new()))
            .unwrap_err();

        let StepError::Aggregation(inner) = err else {
            panic!("expected an aggregation failure");
        };
        assert!(matches!(
            *inner,
            FanOutError::Task {
                source: StepError::Session(SessionError::Status { status: 404, .. }),
                ..
            }
        ));
        assert_eq!(factory.stats().closed(), 1);
    }

    #[test]
    fn test_workers_log_in_from_snapshot() {
        let mut pages = contact_pages(12);
        pages.insert("https://crm.example.test/login".to_string(), "<form>".to_string());
        pages.insert(
            "#login".to_string(),
            "Welcome {username} | Sign out <a href=\"/contacts/0\">0</a> <a href=\"/contacts/11\">11</a>"
                .to_string(),
        );
        let factory = Arc::new(StaticSessionFactory::new(pages));

        let mut workflow = Workflow::builder("crm")
            .then(FormLogin::new("{{base_url}}/login", Form::new("#login"), "Sign out"))
            .then(CollectLinks::anchors())
            .then(FanOutExtract::new(parts(), factory.clone()).with_config(config()))
            .build(factory.clone())
            .unwrap();

        let credentials = Credentials::new("jane", "pw").with_base_url("https://crm.example.test");
        let records = workflow.execute_with_credentials(&credentials).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(factory.stats().opened(), 2);
        assert_eq!(factory.stats().closed(), 2);

        let requests = factory.stats().requests();
        let logins = requests.iter().filter(|url| url.ends_with("/login")).count();
        assert_eq!(logins, 2);
    }

    #[test]
    fn test_worker_login_rejected() {
        let mut pages = contact_pages(2);
        pages.insert("https://crm.example.test/login".to_string(), "<form>".to_string());
        pages.insert("#login".to_string(), "Session expired".to_string());
        let factory = Arc::new(StaticSessionFactory::new(pages));

        let mut login = FormLogin::new("{{base_url}}/login", Form::new("#login"), "Sign out");
        login.set_credentials(&Credentials::new("jane", "pw").with_base_url("https://crm.example.test"));
        let mut step = FanOutExtract::new(parts(), factory.clone()).with_config(config());
        step.accept_snapshot(login.snapshot().unwrap());

        let err = step
            .run(&anchors(2), &mut StaticSession::new(HashMap::new()))
            .unwrap_err();

        let StepError::Aggregation(inner) = err else {
            panic!("expected an aggregation failure");
        };
        assert!(matches!(
            *inner,
            FanOutError::Task {
                source: StepError::InvalidCredentials(_),
                ..
            }
        ));
    }

    fn listing_pages(count: usize) -> HashMap<String, String> {
        let links: String = (0..count)
            .map(|i| format!("<a href=\"/contacts/{i}\">Contact {i}</a>"))
            .collect();
        let mut pages = contact_pages(count);
        pages.insert("https://crm.example.test/contacts".to_string(), links);
        pages.insert("https://crm.example.test/login".to_string(), "<form>".to_string());
        pages
    }

    fn worker_login() -> FormLogin {
        let mut login = FormLogin::new("{{base_url}}/login", Form::new("#login"), "Sign out")
            .with_confirmation_marker("confirm your identity");
        login.set_credentials(&Credentials::new("jane", "pw").with_base_url("https://crm.example.test"));
        login
    }

    fn listing_workflow(factory: Arc<StaticSessionFactory>, step: FanOutExtract) -> Workflow<Vec<Record>> {
        Workflow::builder("crm")
            .then(OpenPage::new("https://crm.example.test/contacts"))
            .then(CollectLinks::anchors())
            .then(step)
            .build(factory)
            .unwrap()
    }

    #[test]
    fn test_worker_confirmation_stops_workflow() {
        let mut pages = listing_pages(3);
        pages.insert("#login".to_string(), "Please confirm your identity".to_string());
        let factory = Arc::new(StaticSessionFactory::new(pages));

        let step = FanOutExtract::new(parts(), factory.clone()).with_config(config());
        let mut workflow = listing_workflow(factory.clone(), step)
            .with_login_snapshot(worker_login().snapshot().unwrap());

        let err = workflow.execute().unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::IdentityConfirmationRequired { ref step, .. } if step == "fan_out_extract"
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_worker_bad_credentials_stop_workflow() {
        let mut pages = listing_pages(3);
        pages.insert("#login".to_string(), "Wrong password".to_string());
        let factory = Arc::new(StaticSessionFactory::new(pages));

        let step = FanOutExtract::new(parts(), factory.clone()).with_config(config());
        let mut workflow = listing_workflow(factory.clone(), step)
            .with_login_snapshot(worker_login().snapshot().unwrap());

        let err = workflow.execute().unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::InvalidCredentials { ref step, .. } if step == "fan_out_extract"
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_custom_relogin_kind() {
        let mut pages = listing_pages(4);
        pages.insert("https://crm.example.test/auth/abc".to_string(), "ok".to_string());
        let factory = Arc::new(StaticSessionFactory::new(pages));

        fn token_login(snapshot: &LoginSnapshot, session: &mut dyn Session) -> Result<(), StepError> {
            let token: String = snapshot.restore().map_err(|e| StepError::failed(e.to_string()))?;
            session.open(&format!("https://crm.example.test/auth/{token}"))?;
            Ok(())
        }
        let step = FanOutExtract::new(parts(), factory.clone())
            .with_config(config())
            .with_relogin("token", Arc::new(token_login));
        let mut workflow = listing_workflow(factory.clone(), step)
            .with_login_snapshot(LoginSnapshot::capture("token", &"abc").unwrap());

        let records = workflow.execute().unwrap();

        assert_eq!(records.len(), 4);
        let requests = factory.stats().requests();
        let auths = requests.iter().filter(|url| url.ends_with("/auth/abc")).count();
        assert_eq!(auths, factory.stats().opened() - 1);
        assert!(!requests.iter().any(|url| url.ends_with("/login")));
    }

    #[test]
    fn test_unknown_snapshot_kind_fails_before_fan_out() {
        let factory = Arc::new(StaticSessionFactory::new(contact_pages(2)));
        let mut step = FanOutExtract::new(parts(), factory.clone()).with_config(config());
        step.accept_snapshot(LoginSnapshot::capture("token", &"abc").unwrap());

        let err = step
            .run(&anchors(2), &mut StaticSession::new(HashMap::new()))
            .unwrap_err();

        assert_eq!(err.to_string(), "cannot log in from a `token` snapshot");
        assert_eq!(factory.stats().opened(), 0);
    }
}
