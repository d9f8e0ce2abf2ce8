use crate::error::StepError;
use crate::session::{Document, Session};
use crate::step::Step;
use serde::{Deserialize, Serialize};

/// Opens a fixed URL; usually the first step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPage {
    #[serde(default = "default_name")]
    name: String,

    url: String,
}

fn default_name() -> String {
    "open".to_string()
}

impl OpenPage {
    /// Create a step opening `url`.
    pub fn new(url: &str) -> Self {
        Self {
            name: default_name(),
            url: url.to_string(),
        }
    }

    /// Set the step name.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Get the URL to open.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Step for OpenPage {
    type Input = ();
    type Output = Document;

    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, _input: &(), session: &mut dyn Session) -> Result<Document, StepError> {
        Ok(session.open(&self.url)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::session::StaticSession;
    use std::collections::HashMap;

    #[test]
    fn test_open_page() {
        let mut pages = HashMap::new();
        pages.insert("https://example.test/a".to_string(), "A".to_string());
        let mut session = StaticSession::new(pages);

        let mut step = OpenPage::new("https://example.test/a");
        assert_eq!(step.run(&(), &mut session).unwrap().content, "A");

        let mut missing = OpenPage::new("https://example.test/b").with_name("missing");
        assert_eq!(missing.name(), "missing");
        assert!(matches!(
            missing.run(&(), &mut session),
            Err(StepError::Session(SessionError::Status { status: 404, .. }))
        ));
    }
}
