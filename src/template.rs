//! Variables and template rendering for step parameters.

use anyhow::{Context as _, Result};
use handlebars::Handlebars;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Named values that `{{ name }}` placeholders resolve against.
#[derive(Debug, Default, Clone)]
pub struct TemplateVars {
    variables: HashMap<String, Value>,
}

impl TemplateVars {
    /// Create an empty variable set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.variables.insert(name.to_string(), value.into());
    }

    /// Set a variable only when a value is present.
    pub fn set_opt(&mut self, name: &str, value: Option<&str>) {
        if let Some(value) = value {
            self.set(name, value);
        }
    }

    /// Get a variable.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Render a template. Strings without `{{` are returned unchanged.
    ///
    /// Output is not HTML-escaped: rendered values end up in URLs and
    /// form fields, not in markup.
    pub fn render(&self, template: &str) -> Result<String> {
        if !template.contains("{{") {
            return Ok(template.to_string());
        }

        let mut hb = Handlebars::new();
        hb.set_strict_mode(true);
        hb.register_escape_fn(handlebars::no_escape);

        hb.render_template(template, &self.variables)
            .with_context(|| format!("Failed to render template `{template}`"))
    }

    /// Render every value of a field map.
    pub fn render_fields(
        &self,
        fields: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        fields
            .iter()
            .map(|(name, template)| Ok((name.clone(), self.render(template)?)))
            .collect()
    }
}
