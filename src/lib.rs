//! # fgp-pipeline
//!
//! Typed extraction pipelines over FGP browser sessions.
//!
//! A workflow is an ordered chain of steps sharing one browsing session:
//! log in, navigate, then pull records out of loosely structured pages with
//! a positional Sequence Matcher. Link lists can be fanned out to parallel
//! workers that each re-authenticate from the login snapshot.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fgp_pipeline::{
//!     CollectLinks, Credentials, DaemonSessionFactory, FanOutExtract, Form, FormLogin, PagePart,
//!     Workflow,
//! };
//! use std::sync::Arc;
//!
//! let factory = Arc::new(DaemonSessionFactory::new("browser"));
//! let parts = vec![PagePart::info("name", "<h1>", ".*?", "</h1>")?];
//!
//! let mut workflow = Workflow::builder("contacts")
//!     .then(FormLogin::new("{{base_url}}/login", Form::new("#login"), "Sign out"))
//!     .then(CollectLinks::anchors())
//!     .then(FanOutExtract::new(parts, factory.clone()))
//!     .build(factory)?;
//!
//! let credentials = Credentials::new("jane", "secret").with_base_url("https://crm.example.com");
//! let records = workflow.execute_with_credentials(&credentials)?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## YAML Definition
//!
//! ```yaml
//! name: contacts
//! fan_out:
//!   items_per_worker: 10
//! steps:
//!   - kind: login
//!     params:
//!       login_url: "{{base_url}}/login"
//!       form: { selector: "#login" }
//!       success_marker: "Sign out"
//!   - kind: collect_links
//!   - kind: fan_out_extract
//!     params:
//!       parts:
//!         - role: info
//!           key: name
//!           before: "<h1>"
//!           value: ".*?"
//!           after: "</h1>"
//! ```

mod daemon;
mod error;
mod executor;
pub mod fanout;
pub mod matcher;
mod registry;
mod session;
mod step;
pub mod steps;
mod template;
mod workflow;
pub mod yaml;

pub use daemon::{DaemonSession, DaemonSessionFactory};
pub use error::{
    ContractViolation, FanOutError, MatcherError, RegistryError, SessionError, StepError,
    WorkflowError,
};
pub use fanout::{FanOut, FanOutConfig, SeenGuard, TimeoutPolicy};
pub use matcher::{
    IdentitySanitizer, PagePart, PagePartDef, Record, Sanitizer, SequenceMatcher, TextSanitizer,
};
pub use registry::{BuildContext, StepRegistry};
pub use session::{
    Anchor, Document, Form, Session, SessionFactory, SessionGuard, SessionStats, StaticSession,
    StaticSessionFactory,
};
pub use step::{
    Credentials, LoginCapable, LoginSnapshot, NeedsLoginSnapshot, Stage, StageValue, Step,
    StepCell, StepStatus, TypeTag,
};
pub use steps::{CollectLinks, ExtractRecords, FanOutExtract, FormLogin, OpenPage, Relogin};
pub use template::TemplateVars;
pub use workflow::{Workflow, WorkflowBuilder};
pub use yaml::{parse_yaml, FanOutSettings, RunFlags, StepDefinition, WorkflowDescription};

/// Re-export common types
pub use serde_json::Value;
