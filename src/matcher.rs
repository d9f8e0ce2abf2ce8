//! Positional field extraction from loosely structured text.
//!
//! A [`SequenceMatcher`] walks an ordered list of [`PagePart`]s over a text
//! buffer. Each part is searched in what is left of the buffer after the
//! previous match, so a part can only ever match text that comes after every
//! part matched before it. That is how the N-th occurrence of an otherwise
//! ambiguous pattern is singled out without a document parser.

use crate::error::MatcherError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Extracted fields, keyed by field name.
pub type Record = BTreeMap<String, String>;

/// Serializable form of a [`PagePart`], as written in workflow descriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum PagePartDef {
    /// Advances the position without capturing anything.
    Filler { pattern: String },

    /// Captures `value` between `before` and `after` (all regex fragments).
    Info {
        key: String,
        #[serde(default)]
        before: String,
        value: String,
        #[serde(default)]
        after: String,
    },

    /// Captures group 2 of a hand-written three-group pattern.
    InfoPattern { key: String, pattern: String },
}

/// One compiled element of a matcher definition.
#[derive(Debug, Clone)]
pub struct PagePart {
    key: Option<String>,
    regex: Regex,
    def: PagePartDef,
}

impl PagePart {
    /// A part that must match but is not captured.
    pub fn filler(pattern: &str) -> Result<Self, MatcherError> {
        Ok(Self {
            key: None,
            regex: compile(pattern)?,
            def: PagePartDef::Filler {
                pattern: pattern.to_string(),
            },
        })
    }

    /// Build an info part from its three context fragments.
    ///
    /// `value` is wrapped in a capture group unless it already contains
    /// exactly one, so both `"(.*?)"` and `".*?"` capture the same text.
    pub fn info(key: &str, before: &str, value: &str, after: &str) -> Result<Self, MatcherError> {
        let value_groups = compile(value)?.captures_len() - 1;
        let pattern = if value_groups == 1 {
            format!("({before}){value}({after})")
        } else {
            format!("({before})({value})({after})")
        };

        let regex = compile(&pattern)?;
        let found = regex.captures_len() - 1;
        if found != 3 {
            return Err(MatcherError::GroupCount {
                key: key.to_string(),
                found,
            });
        }

        Ok(Self {
            key: Some(key.to_string()),
            regex,
            def: PagePartDef::Info {
                key: key.to_string(),
                before: before.to_string(),
                value: value.to_string(),
                after: after.to_string(),
            },
        })
    }

    /// Build an info part from a full pattern. Only patterns with exactly
    /// three capture groups record a value; others just advance the position.
    pub fn info_pattern(key: &str, pattern: &str) -> Result<Self, MatcherError> {
        Ok(Self {
            key: Some(key.to_string()),
            regex: compile(pattern)?,
            def: PagePartDef::InfoPattern {
                key: key.to_string(),
                pattern: pattern.to_string(),
            },
        })
    }

    /// Field name for info parts, `None` for fillers.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Get the compiled pattern.
    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    /// Get the definition the part was compiled from.
    pub fn definition(&self) -> &PagePartDef {
        &self.def
    }
}

impl TryFrom<PagePartDef> for PagePart {
    type Error = MatcherError;

    fn try_from(def: PagePartDef) -> Result<Self, Self::Error> {
        match def {
            PagePartDef::Filler { pattern } => Self::filler(&pattern),
            PagePartDef::Info {
                key,
                before,
                value,
                after,
            } => Self::info(&key, &before, &value, &after),
            PagePartDef::InfoPattern { key, pattern } => Self::info_pattern(&key, &pattern),
        }
    }
}

/// Compile a list of part definitions.
pub fn compile_parts(defs: &[PagePartDef]) -> Result<Vec<PagePart>, MatcherError> {
    defs.iter().cloned().map(PagePart::try_from).collect()
}

fn compile(pattern: &str) -> Result<Regex, MatcherError> {
    Regex::new(pattern).map_err(|source| MatcherError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Cleans captured values before they are recorded.
pub trait Sanitizer: Send + Sync {
    fn clean(&self, raw: &str) -> String;
}

/// Records captured values verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentitySanitizer;

impl Sanitizer for IdentitySanitizer {
    fn clean(&self, raw: &str) -> String {
        raw.to_string()
    }
}

/// Turns captured markup into plain text: drops tags, decodes the common
/// entities and collapses whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextSanitizer;

impl Sanitizer for TextSanitizer {
    fn clean(&self, raw: &str) -> String {
        static TAG_RE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

        let text = TAG_RE.replace_all(raw, " ");
        let text = text
            .replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&amp;", "&");

        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// Outcome of one pass over the parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scan {
    pub fields: Record,

    /// Byte offset (into the full text) of each matched part's end, in
    /// part order. Non-decreasing.
    pub ends: Vec<usize>,

    /// Offset where the pass stopped consuming.
    pub consumed: usize,
}

/// Runs an ordered list of parts over one text buffer.
///
/// ```rust
/// use fgp_pipeline::{PagePart, SequenceMatcher};
///
/// let parts = vec![
///     PagePart::info("name", "Name: ", "(.*?)", ";").unwrap(),
///     PagePart::info("phone", "Phone: ", "(.*)", "$").unwrap(),
/// ];
/// let fields = SequenceMatcher::new(&parts, "Name: Jane Doe; Phone: 555").retrieve_information();
///
/// assert_eq!(fields["name"], "Jane Doe");
/// assert_eq!(fields["phone"], "555");
/// ```
pub struct SequenceMatcher<'a> {
    parts: &'a [PagePart],
    text: &'a str,
    sanitizer: &'a dyn Sanitizer,
}

impl<'a> SequenceMatcher<'a> {
    /// Create a matcher over `text`.
    pub fn new(parts: &'a [PagePart], text: &'a str) -> Self {
        Self {
            parts,
            text,
            sanitizer: &IdentitySanitizer,
        }
    }

    /// Clean captured values with `sanitizer`.
    pub fn with_sanitizer(mut self, sanitizer: &'a dyn Sanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// Extract one record. Parts that never match are simply absent.
    pub fn retrieve_information(&self) -> Record {
        self.scan().fields
    }

    /// Extract consecutive records by repeating the pass where the previous
    /// one stopped, until a pass matches nothing or makes no progress.
    pub fn retrieve_multiple_information(&self) -> Vec<Record> {
        let mut records = Vec::new();
        let mut pos = 0;

        loop {
            let scan = self.scan_from(pos);
            if scan.ends.is_empty() || scan.consumed == pos {
                break;
            }
            pos = scan.consumed;
            if !scan.fields.is_empty() {
                records.push(scan.fields);
            }
        }

        records
    }

    /// One pass from the start of the text.
    pub fn scan(&self) -> Scan {
        self.scan_from(0)
    }

    fn scan_from(&self, start: usize) -> Scan {
        let mut scan = Scan {
            consumed: start,
            ..Scan::default()
        };

        for part in self.parts {
            let remaining = &self.text[scan.consumed..];
            let Some(caps) = part.regex.captures(remaining) else {
                tracing::trace!(pattern = part.pattern(), "Part not found, skipping");
                continue;
            };

            if let (Some(key), 4) = (part.key(), caps.len()) {
                if let Some(value) = caps.get(2) {
                    let value = self.sanitizer.clean(value.as_str());
                    if !value.is_empty() {
                        scan.fields.entry(key.to_string()).or_insert(value);
                    }
                }
            }

            scan.consumed += caps.get(0).map_or(0, |m| m.end());
            scan.ends.push(scan.consumed);
        }

        scan
    }
}
