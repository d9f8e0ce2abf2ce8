//! YAML workflow descriptions.

use crate::fanout::{FanOutConfig, TimeoutPolicy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Declarative definition of a workflow: ordered steps plus run flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDescription {
    /// Workflow name
    pub name: String,

    /// Description of what this workflow extracts
    #[serde(default)]
    pub description: Option<String>,

    /// Session options for the run
    #[serde(default)]
    pub flags: RunFlags,

    /// Fan-out tuning for steps that extract in parallel
    #[serde(default)]
    pub fan_out: FanOutSettings,

    /// Steps to execute, in order
    pub steps: Vec<StepDefinition>,
}

/// One step of a description, instantiated by the
/// [`StepRegistry`](crate::StepRegistry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Registered step kind (e.g. `open`, `login`, `extract`)
    pub kind: String,

    /// Display name; defaults to the kind
    #[serde(default)]
    pub name: Option<String>,

    /// Kind-specific parameters
    #[serde(default)]
    pub params: Value,
}

impl StepDefinition {
    /// Get the step name, falling back to its kind.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }
}

/// Options handed to the [`SessionFactory`](crate::SessionFactory).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunFlags {
    /// Render pages with scripting enabled
    pub javascript: bool,

    /// Present a mobile user agent
    pub mobile_user_agent: bool,

    /// Accept cookies with unbalanced quotes
    pub lenient_cookie_quotes: bool,
}

/// Fan-out settings as written in a description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanOutSettings {
    /// Upper bound on each wait for the next finished task
    pub poll_timeout_secs: u64,

    /// Overall bound on the whole aggregation
    pub deadline_secs: Option<u64>,

    /// Items handled per worker thread
    pub items_per_worker: usize,

    pub policy: TimeoutPolicy,
}

impl Default for FanOutSettings {
    fn default() -> Self {
        let config = FanOutConfig::default();
        Self {
            poll_timeout_secs: config.poll_timeout.as_secs(),
            deadline_secs: None,
            items_per_worker: config.items_per_worker,
            policy: config.policy,
        }
    }
}

impl FanOutSettings {
    /// Convert to a fan-out config.
    pub fn to_config(&self) -> FanOutConfig {
        FanOutConfig {
            poll_timeout: Duration::from_secs(self.poll_timeout_secs),
            deadline: self.deadline_secs.map(Duration::from_secs),
            items_per_worker: self.items_per_worker.max(1),
            policy: self.policy,
            ..FanOutConfig::default()
        }
    }
}

/// Parse a workflow description from a YAML string.
///
/// # Example
///
/// ```rust
/// use fgp_pipeline::parse_yaml;
///
/// let yaml = r#"
/// name: contacts
/// steps:
///   - kind: open
///     params:
///       url: https://example.test/contacts
/// "#;
///
/// let description = parse_yaml(yaml).unwrap();
/// assert_eq!(description.name, "contacts");
/// assert_eq!(description.steps.len(), 1);
/// ```
pub fn parse_yaml(yaml: &str) -> Result<WorkflowDescription> {
    let description: WorkflowDescription =
        serde_yaml::from_str(yaml).context("Failed to parse workflow YAML")?;

    validate(&description)?;

    Ok(description)
}

/// Load and parse a workflow description from a YAML file.
///
/// ```rust,no_run
/// use fgp_pipeline::yaml::load_file;
///
/// let description = load_file("contacts.yaml")?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_file(path: impl AsRef<Path>) -> Result<WorkflowDescription> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;

    parse_yaml(&content)
        .with_context(|| format!("Failed to parse workflow file: {}", path.display()))
}

fn validate(description: &WorkflowDescription) -> Result<()> {
    if description.name.is_empty() {
        anyhow::bail!("Workflow name cannot be empty");
    }

    if description.steps.is_empty() {
        anyhow::bail!("Workflow must have at least one step");
    }

    for (i, step) in description.steps.iter().enumerate() {
        if step.kind.is_empty() {
            anyhow::bail!("Step {} has empty kind", i);
        }
    }

    if description.fan_out.items_per_worker == 0 {
        anyhow::bail!("fan_out.items_per_worker must be at least 1");
    }

    if description.fan_out.poll_timeout_secs == 0 {
        anyhow::bail!("fan_out.poll_timeout_secs must be at least 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_description_with_defaults() {
        let yaml = r#"
name: contacts
description: Address book export
steps:
  - kind: open
    params:
      url: https://example.test/
  - kind: extract
    name: contact-card
"#;

        let description = parse_yaml(yaml).unwrap();
        assert_eq!(description.name, "contacts");
        assert_eq!(description.description.as_deref(), Some("Address book export"));
        assert_eq!(description.flags, RunFlags::default());
        assert_eq!(description.fan_out, FanOutSettings::default());
        assert_eq!(description.steps[0].display_name(), "open");
        assert_eq!(description.steps[1].display_name(), "contact-card");
        assert!(description.steps[1].params.is_null());
    }

    #[test]
    fn test_parse_flags_and_fan_out() {
        let yaml = r#"
name: calendar
flags:
  mobile_user_agent: true
  lenient_cookie_quotes: true
fan_out:
  poll_timeout_secs: 5
  deadline_secs: 30
  policy: all_or_nothing
steps:
  - kind: open
"#;

        let description = parse_yaml(yaml).unwrap();
        assert!(!description.flags.javascript);
        assert!(description.flags.mobile_user_agent);
        assert!(description.flags.lenient_cookie_quotes);

        let config = description.fan_out.to_config();
        assert_eq!(config.poll_timeout, Duration::from_secs(5));
        assert_eq!(config.deadline, Some(Duration::from_secs(30)));
        assert_eq!(config.items_per_worker, 10);
        assert_eq!(config.policy, TimeoutPolicy::AllOrNothing);
    }

    #[test]
    fn test_validate_empty_name() {
        let yaml = r#"
name: ""
steps:
  - kind: open
"#;

        let result = parse_yaml(yaml);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("name cannot be empty"));
    }

    #[test]
    fn test_validate_no_steps() {
        let yaml = r#"
name: empty
steps: []
"#;

        let result = parse_yaml(yaml);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("at least one step"));
    }

    #[test]
    fn test_validate_empty_kind() {
        let yaml = r#"
name: broken
steps:
  - kind: ""
"#;

        assert!(parse_yaml(yaml)
            .unwrap_err()
            .to_string()
            .contains("Step 0 has empty kind"));
    }

    #[test]
    fn test_validate_fan_out_settings() {
        let yaml = r#"
name: broken
fan_out:
  items_per_worker: 0
steps:
  - kind: open
"#;
        assert!(parse_yaml(yaml)
            .unwrap_err()
            .to_string()
            .contains("items_per_worker must be at least 1"));

        let yaml = r#"
name: broken
fan_out:
  poll_timeout_secs: 0
steps:
  - kind: open
"#;
        assert!(parse_yaml(yaml)
            .unwrap_err()
            .to_string()
            .contains("poll_timeout_secs must be at least 1"));
    }
}
