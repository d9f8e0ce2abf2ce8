use crate::error::{MatcherError, StepError};
use crate::fanout::SeenGuard;
use crate::session::{Anchor, Document, Session};
use crate::step::Step;
use regex::Regex;

const ANCHOR_PATTERN: &str = r#"(?s)<a\s[^>]*href="(?P<href>[^"]+)"[^>]*>(?P<text>.*?)</a>"#;

/// Collects links from the page produced by the previous step.
///
/// The pattern must have an `href` group and may have a `text` group.
/// Links are returned in page order, each href once.
#[derive(Debug, Clone)]
pub struct CollectLinks {
    name: String,
    pattern: Regex,
}

impl CollectLinks {
    /// Create a step collecting links matched by `pattern`.
    pub fn new(pattern: &str) -> Result<Self, MatcherError> {
        let regex = Regex::new(pattern).map_err(|source| MatcherError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        if !regex.capture_names().flatten().any(|name| name == "href") {
            return Err(MatcherError::MissingGroup {
                pattern: pattern.to_string(),
                group: "href".to_string(),
            });
        }

        Ok(Self {
            name: "collect_links".to_string(),
            pattern: regex,
        })
    }

    /// Every `<a href="...">` on the page.
    pub fn anchors() -> Self {
        Self {
            name: "collect_links".to_string(),
            pattern: Regex::new(ANCHOR_PATTERN).expect("valid regex"),
        }
    }

    /// Set the step name.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Get the link pattern.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Apply the pattern to `content`.
    pub fn collect(&self, content: &str) -> Vec<Anchor> {
        let seen = SeenGuard::new();
        self.pattern
            .captures_iter(content)
            .filter_map(|caps| {
                let href = caps.name("href")?.as_str().trim();
                let text = caps.name("text").map_or("", |m| m.as_str().trim());
                (!href.is_empty() && seen.claim(href.to_string())).then(|| Anchor::new(href, text))
            })
            .collect()
    }
}

impl Step for CollectLinks {
    type Input = Document;
    type Output = Vec<Anchor>;

    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, input: &Document, _session: &mut dyn Session) -> Result<Vec<Anchor>, StepError> {
        let anchors = self.collect(&input.content);
        tracing::debug!(step = %self.name, url = %input.url, links = anchors.len(), "Collected links");
        Ok(anchors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StaticSession;
    use std::collections::HashMap;

    #[test]
    fn test_collect_anchors() {
        let page = Document::new(
            "https://example.test/list",
            r#"<a href="/c/1">Jane</a> <a class="x" href="/c/2">
John</a> <a href="/c/1">Jane again</a> <span>/c/3</span>"#,
        );

        let anchors = CollectLinks::anchors()
            .run(&page, &mut StaticSession::new(HashMap::new()))
            .unwrap();

        assert_eq!(
            anchors,
            vec![Anchor::new("/c/1", "Jane"), Anchor::new("/c/2", "John")]
        );
    }

    #[test]
    fn test_custom_pattern() {
        let links = CollectLinks::new(r"contact=(?P<href>\d+)").unwrap();
        let anchors = links.collect("contact=7 contact=8 contact=7");

        assert_eq!(anchors.len(), 2);
        assert_eq!(anchors[1].href, "8");
        assert_eq!(anchors[1].text, "");
    }

    #[test]
    fn test_pattern_needs_href_group() {
        assert!(matches!(
            CollectLinks::new(r"contact=(\d+)"),
            Err(MatcherError::MissingGroup { ref group, .. }) if group == "href"
        ));
        assert!(matches!(
            CollectLinks::new(r"(?P<href>"),
            Err(MatcherError::Pattern { .. })
        ));
    }
}
