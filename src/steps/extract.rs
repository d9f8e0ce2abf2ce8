use crate::error::StepError;
use crate::matcher::{IdentitySanitizer, PagePart, Record, Sanitizer, SequenceMatcher};
use crate::session::{Document, Session};
use crate::step::Step;
use std::fmt;
use std::sync::Arc;

/// Extracts records from the page produced by the previous step.
pub struct ExtractRecords {
    name: String,
    parts: Vec<PagePart>,
    multiple: bool,
    allow_empty: bool,
    sanitizer: Arc<dyn Sanitizer>,
}

impl ExtractRecords {
    fn with_parts(parts: Vec<PagePart>, multiple: bool) -> Self {
        Self {
            name: "extract".to_string(),
            parts,
            multiple,
            allow_empty: false,
            sanitizer: Arc::new(IdentitySanitizer),
        }
    }

    /// One record per page.
    pub fn single(parts: Vec<PagePart>) -> Self {
        Self::with_parts(parts, false)
    }

    /// As many consecutive records as the page holds.
    pub fn multiple(parts: Vec<PagePart>) -> Self {
        Self::with_parts(parts, true)
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

    /// Succeed with no records instead of failing.
    pub fn allow_empty(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    /// Get the page parts.
    pub fn parts(&self) -> &[PagePart] {
        &self.parts
    }

    fn extract(&self, content: &str) -> Vec<Record> {
        let matcher = SequenceMatcher::new(&self.parts, content).with_sanitizer(self.sanitizer.as_ref());
        if self.multiple {
            matcher.retrieve_multiple_information()
        } else {
            let record = matcher.retrieve_information();
            if record.is_empty() {
                Vec::new()
            } else {
                vec![record]
            }
        }
    }
}

impl fmt::Debug for ExtractRecords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractRecords")
            .field("name", &self.name)
            .field("parts", &self.parts.len())
            .field("multiple", &self.multiple)
            .field("allow_empty", &self.allow_empty)
            .finish_non_exhaustive()
    }
}

impl Step for ExtractRecords {
    type Input = Document;
    type Output = Vec<Record>;

    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, input: &Document, _session: &mut dyn Session) -> Result<Vec<Record>, StepError> {
        let records = self.extract(&input.content);
        if records.is_empty() && !self.allow_empty {
            return Err(StepError::failed(format!("no records found at {}", input.url)));
        }

        tracing::debug!(step = %self.name, url = %input.url, records = records.len(), "Extracted records");
        Ok(records)
    }
}
