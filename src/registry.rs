//! Instantiates workflows from descriptions.

use crate::error::RegistryError;
use crate::matcher::{compile_parts, PagePart, PagePartDef, Sanitizer, TextSanitizer};
use crate::session::SessionFactory;
use crate::step::{Stage, Step, StepCell};
use crate::steps::{CollectLinks, ExtractRecords, FanOutExtract, FormLogin, OpenPage, Relogin};
use crate::workflow::Workflow;
use crate::yaml::{StepDefinition, WorkflowDescription};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a constructor gets to build one stage.
pub struct BuildContext<'a> {
    /// Position of the step in the description
    pub index: usize,
    pub definition: &'a StepDefinition,
    pub description: &'a WorkflowDescription,
    pub factory: &'a Arc<dyn SessionFactory>,
    /// Worker re-logins by snapshot kind
    pub relogins: &'a BTreeMap<String, Relogin>,
}

impl BuildContext<'_> {
    /// Display name of the step being built.
    pub fn name(&self) -> &str {
        self.definition.display_name()
    }

    /// Deserialize the step's params; missing params read as `{}`.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, RegistryError> {
        let params = match &self.definition.params {
            Value::Null => Value::Object(Default::default()),
            params => params.clone(),
        };
        serde_json::from_value(params).map_err(|source| RegistryError::Params {
            index: self.index,
            kind: self.definition.kind.clone(),
            source,
        })
    }

    /// Compile part definitions, reporting errors against this step.
    pub fn parts(&self, defs: &[PagePartDef]) -> Result<Vec<PagePart>, RegistryError> {
        compile_parts(defs).map_err(|source| RegistryError::Matcher {
            index: self.index,
            source,
        })
    }
}

type Constructor = Box<dyn Fn(&BuildContext<'_>) -> Result<Box<dyn Stage>, RegistryError> + Send + Sync>;

/// Maps step kinds to constructors.
///
/// ```rust
/// use fgp_pipeline::{parse_yaml, Document, StaticSessionFactory, StepRegistry};
/// use std::collections::HashMap;
/// use std::sync::Arc;
///
/// let description = parse_yaml(r#"
/// name: home
/// steps:
///   - kind: open
///     params: { url: "https://example.test/" }
/// "#).unwrap();
///
/// let mut pages = HashMap::new();
/// pages.insert("https://example.test/".to_string(), "hello".to_string());
///
/// let mut workflow = StepRegistry::with_builtins()
///     .build::<Document>(&description, Arc::new(StaticSessionFactory::new(pages)))
///     .unwrap();
/// assert_eq!(workflow.execute().unwrap().content, "hello");
/// ```
pub struct StepRegistry {
    constructors: BTreeMap<String, Constructor>,
    relogins: BTreeMap<String, Relogin>,
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl StepRegistry {
    /// A registry with no kinds at all.
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
            relogins: BTreeMap::new(),
        }
    }

    /// A registry knowing the steps of [`crate::steps`].
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("open", build_open);
        registry.register(FormLogin::KIND, build_login);
        registry.register("collect_links", build_collect_links);
        registry.register("extract", build_extract);
        registry.register("fan_out_extract", build_fan_out_extract);
        registry
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register<F>(&mut self, kind: &str, constructor: F)
    where
        F: Fn(&BuildContext<'_>) -> Result<Box<dyn Stage>, RegistryError> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.to_string(), Box::new(constructor));
    }

    /// Replay logins from snapshots of `kind` with `relogin` in every
    /// fan-out step this registry builds.
    pub fn register_relogin(&mut self, kind: &str, relogin: Relogin) {
        self.relogins.insert(kind.to_string(), relogin);
    }

    /// Registered step kinds, in order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Instantiate every step of `description` and assemble them into a
    /// workflow producing `R`.
    pub fn build<R: 'static>(
        &self,
        description: &WorkflowDescription,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Workflow<R>, RegistryError> {
        tracing::debug!(workflow = %description.name, steps = description.steps.len(), "Building workflow");

        let mut stages = Vec::with_capacity(description.steps.len());
        for (index, definition) in description.steps.iter().enumerate() {
            let constructor = self
                .constructors
                .get(&definition.kind)
                .ok_or_else(|| RegistryError::UnknownKind(definition.kind.clone()))?;

            let ctx = BuildContext {
                index,
                definition,
                description,
                factory: &factory,
                relogins: &self.relogins,
            };
            stages.push(constructor(&ctx)?);
        }

        let workflow = Workflow::from_stages(
            &description.name,
            stages,
            factory,
            description.flags.clone(),
        )?;

        Ok(match &description.description {
            Some(desc) => workflow.with_description(desc),
            None => workflow,
        })
    }
}

fn stage<S: Step + 'static>(step: S) -> Box<dyn Stage> {
    Box::new(StepCell::new(step))
}

fn build_open(ctx: &BuildContext<'_>) -> Result<Box<dyn Stage>, RegistryError> {
    let step: OpenPage = ctx.params()?;
    Ok(stage(step.with_name(ctx.name())))
}

fn build_login(ctx: &BuildContext<'_>) -> Result<Box<dyn Stage>, RegistryError> {
    let step: FormLogin = ctx.params()?;
    step.validate().map_err(|source| RegistryError::Matcher {
        index: ctx.index,
        source,
    })?;
    Ok(stage(step.with_name(ctx.name())))
}

#[derive(Deserialize)]
struct LinkParams {
    #[serde(default)]
    pattern: Option<String>,
}

fn build_collect_links(ctx: &BuildContext<'_>) -> Result<Box<dyn Stage>, RegistryError> {
    let params: LinkParams = ctx.params()?;
    let step = match params.pattern {
        Some(pattern) => CollectLinks::new(&pattern).map_err(|source| RegistryError::Matcher {
            index: ctx.index,
            source,
        })?,
        None => CollectLinks::anchors(),
    };
    Ok(stage(step.with_name(ctx.name())))
}

#[derive(Deserialize)]
struct ExtractParams {
    parts: Vec<PagePartDef>,

    #[serde(default)]
    multiple: bool,

    #[serde(default)]
    allow_empty: bool,

    /// Strip markup from captured values
    #[serde(default)]
    plain_text: bool,
}

impl ExtractParams {
    fn sanitizer(&self) -> Option<Arc<dyn Sanitizer>> {
        self.plain_text.then(|| Arc::new(TextSanitizer) as Arc<dyn Sanitizer>)
    }
}

fn build_extract(ctx: &BuildContext<'_>) -> Result<Box<dyn Stage>, RegistryError> {
    let params: ExtractParams = ctx.params()?;
    let parts = ctx.parts(&params.parts)?;

    let mut step = if params.multiple {
        ExtractRecords::multiple(parts)
    } else {
        ExtractRecords::single(parts)
    };
    if let Some(sanitizer) = params.sanitizer() {
        step = step.with_sanitizer(sanitizer);
    }

    Ok(stage(step.allow_empty(params.allow_empty).with_name(ctx.name())))
}

fn build_fan_out_extract(ctx: &BuildContext<'_>) -> Result<Box<dyn Stage>, RegistryError> {
    let params: ExtractParams = ctx.params()?;
    let parts = ctx.parts(&params.parts)?;

    let mut step = FanOutExtract::new(parts, ctx.factory.clone())
        .with_flags(ctx.description.flags.clone())
        .with_config(ctx.description.fan_out.to_config());
    if let Some(sanitizer) = params.sanitizer() {
        step = step.with_sanitizer(sanitizer);
    }
    for (kind, relogin) in ctx.relogins {
        step = step.with_relogin(kind, relogin.clone());
    }

    Ok(stage(step.with_name(ctx.name())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MatcherError, WorkflowError};
    use crate::matcher::Record;
    use crate::session::{Document, StaticSessionFactory};
    use crate::step::Credentials;
    use crate::yaml::parse_yaml;
    use std::collections::HashMap;

    const CONTACTS: &str = r##"
name: crm-contacts
description: Every contact of the CRM
fan_out:
  poll_timeout_secs: 5
  items_per_worker: 2
steps:
  - kind: login
    params:
      login_url: "{{base_url}}/login"
      form: { selector: "#login" }
      success_marker: "Sign out"
  - kind: collect_links
    name: contact-links
    params:
      pattern: 'href="(?P<href>/contacts/\d+)"'
  - kind: fan_out_extract
    params:
      plain_text: true
      parts:
        - role: info
          key: name
          before: "<h1>"
          value: ".*?"
          after: "</h1>"
"##;

    fn crm_pages() -> HashMap<String, String> {
        let mut pages = HashMap::new();
        pages.insert("https://crm.example.test/login".to_string(), "<form>".to_string());
        pages.insert(
            "#login".to_string(),
            r##"Sign out <a href="/contacts/1">1</a> <a href="/contacts/2">2</a> <a href="/contacts/3">3</a>"##
                .to_string(),
        );
        for i in 1..=3 {
            pages.insert(format!("/contacts/{i}"), format!("<h1><b>Contact</b> {i}</h1>"));
        }
        pages
    }

    #[test]
    fn test_build_and_run_description() {
        let description = parse_yaml(CONTACTS).unwrap();
        let factory = Arc::new(StaticSessionFactory::new(crm_pages()));

        let mut workflow = StepRegistry::with_builtins()
            .build::<Vec<Record>>(&description, factory.clone())
            .unwrap();

        assert_eq!(workflow.name(), "crm-contacts");
        assert_eq!(workflow.description(), Some("Every contact of the CRM"));
        let names: Vec<&str> = workflow.stages().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["login", "contact-links", "fan_out_extract"]);

        let credentials = Credentials::new("jane", "pw").with_base_url("https://crm.example.test");
        let mut records = workflow.execute_with_credentials(&credentials).unwrap();
        records.sort();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["name"], "Contact 1");
        // One session for the run, one per batch of two links.
        assert_eq!(factory.stats().opened(), 3);
        assert_eq!(factory.stats().closed(), 3);
    }

    #[test]
    fn test_unknown_kind() {
        let description = parse_yaml("name: x\nsteps:\n  - kind: teleport\n").unwrap();

        let err = StepRegistry::with_builtins()
            .build::<Document>(&description, Arc::new(StaticSessionFactory::new(HashMap::new())))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownKind(ref kind) if kind == "teleport"));
    }

    #[test]
    fn test_invalid_params() {
        let description = parse_yaml("name: x\nsteps:\n  - kind: open\n").unwrap();

        let err = StepRegistry::with_builtins()
            .build::<Document>(&description, Arc::new(StaticSessionFactory::new(HashMap::new())))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Params { index: 0, ref kind, .. } if kind == "open"));
    }

    #[test]
    fn test_invalid_patterns() {
        let factory: Arc<dyn SessionFactory> = Arc::new(StaticSessionFactory::new(HashMap::new()));
        let registry = StepRegistry::with_builtins();

        let yaml = r##"
name: x
steps:
  - kind: open
    params: { url: "https://example.test/" }
  - kind: collect_links
    params: { pattern: 'href="([^"]+)"' }
"##;
        let err = registry
            .build::<Document>(&parse_yaml(yaml).unwrap(), factory.clone())
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Matcher { index: 1, source: MatcherError::MissingGroup { .. } }
        ));

        let yaml = r##"
name: x
steps:
  - kind: login
    params:
      login_url: "https://example.test/login"
      form: { selector: "#login" }
      success_marker: "(unclosed"
"##;
        let err = registry
            .build::<Document>(&parse_yaml(yaml).unwrap(), factory)
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Matcher { index: 0, source: MatcherError::Pattern { .. } }
        ));
    }

    #[test]
    fn test_incompatible_steps() {
        let yaml = r##"
name: x
steps:
  - kind: open
    params: { url: "https://example.test/" }
  - kind: open
    name: again
    params: { url: "https://example.test/" }
"##;
        let err = StepRegistry::with_builtins()
            .build::<Document>(
                &parse_yaml(yaml).unwrap(),
                Arc::new(StaticSessionFactory::new(HashMap::new())),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            RegistryError::Workflow(WorkflowError::Incompatible { index: 1, ref step, .. }) if step == "again"
        ));
    }

    #[test]
    fn test_custom_kind() {
        struct Title;

        impl Step for Title {
            type Input = Document;
            type Output = String;

            fn name(&self) -> &str {
                "title"
            }

            fn run(
                &mut self,
                input: &Document,
                _session: &mut dyn crate::session::Session,
            ) -> Result<String, crate::error::StepError> {
                Ok(input.content.lines().next().unwrap_or_default().to_string())
            }
        }

        let mut registry = StepRegistry::with_builtins();
        registry.register("title", |_ctx| Ok(stage(Title)));
        assert!(registry.kinds().any(|kind| kind == "title"));

        let yaml = r##"
name: x
steps:
  - kind: open
    params: { url: "https://example.test/" }
  - kind: title
"##;
        let mut pages = HashMap::new();
        pages.insert("https://example.test/".to_string(), "Inbox\nrest".to_string());

        let mut workflow = registry
            .build::<String>(
                &parse_yaml(yaml).unwrap(),
                Arc::new(StaticSessionFactory::new(pages)),
            )
            .unwrap();
        assert_eq!(workflow.execute().unwrap(), "Inbox");
    }

    #[test]
    fn test_registered_relogin_reaches_fan_out() {
        use crate::error::StepError;
        use crate::session::Session;
        use crate::step::LoginSnapshot;

        let mut registry = StepRegistry::with_builtins();
        registry.register_relogin(
            "token",
            Arc::new(|snapshot: &LoginSnapshot, session: &mut dyn Session| -> Result<(), StepError> {
                let token: String = snapshot.restore().map_err(|e| StepError::failed(e.to_string()))?;
                session.open(&format!("https://example.test/auth/{token}"))?;
                Ok(())
            }),
        );

        let yaml = r##"
name: tokens
steps:
  - kind: open
    params: { url: "https://example.test/list" }
  - kind: collect_links
  - kind: fan_out_extract
    params:
      parts:
        - { role: info, key: name, before: "<h1>", value: ".*?", after: "</h1>" }
"##;
        let mut pages = HashMap::new();
        pages.insert(
            "https://example.test/list".to_string(),
            r#"<a href="/a">A</a><a href="/b">B</a>"#.to_string(),
        );
        pages.insert("https://example.test/auth/t0k".to_string(), "ok".to_string());
        pages.insert("/a".to_string(), "<h1>Ada</h1>".to_string());
        pages.insert("/b".to_string(), "<h1>Bob</h1>".to_string());
        let factory = Arc::new(StaticSessionFactory::new(pages));

        let mut workflow = registry
            .build::<Vec<Record>>(&parse_yaml(yaml).unwrap(), factory.clone())
            .unwrap()
            .with_login_snapshot(LoginSnapshot::capture("token", &"t0k").unwrap());
        let records = workflow.execute().unwrap();

        assert_eq!(records.len(), 2);
        assert!(factory
            .stats()
            .requests()
            .contains(&"https://example.test/auth/t0k".to_string()));
    }
}
