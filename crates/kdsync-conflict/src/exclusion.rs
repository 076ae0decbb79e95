//! Exclusion templates
//!
//! Glob templates matched against item names (and, for templates with a
//! separator, full relative paths). Plain templates exclude silently: the
//! item is recorded as `Excluded`. Warning templates come from the user
//! and blacklist the item permanently with `custom-template-exclusion`,
//! so it shows up in the blacklist listing.

use glob::{MatchOptions, Pattern};
use tracing::warn;

use kdsync_core::config::ExclusionsConfig;
use kdsync_core::domain::RelativePath;

/// How a matching template treats the item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionKind {
    /// Recorded as `Excluded`
    Silent,
    /// Blacklisted with `custom-template-exclusion`
    Warn,
}

/// A template that matched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionMatch {
    pub template: String,
    pub kind: ExclusionKind,
}

#[derive(Debug, Clone)]
struct Template {
    source: String,
    pattern: Pattern,
    whole_path: bool,
}

impl Template {
    fn compile(source: &str) -> Option<Self> {
        match Pattern::new(source) {
            Ok(pattern) => Some(Self {
                source: source.to_string(),
                pattern,
                whole_path: source.contains('/'),
            }),
            Err(e) => {
                warn!(template = %source, error = %e, "Skipping invalid exclusion template");
                None
            }
        }
    }

    fn matches(&self, path: &RelativePath) -> bool {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        if self.whole_path {
            self.pattern.matches_with(path.as_str(), options)
        } else {
            self.pattern.matches_with(path.file_name(), options)
        }
    }
}

/// Compiled exclusion templates
#[derive(Debug, Clone)]
pub struct ExclusionMatcher {
    silent: Vec<Template>,
    warn: Vec<Template>,
}

impl ExclusionMatcher {
    pub fn new(config: &ExclusionsConfig) -> Self {
        Self {
            silent: config
                .templates
                .iter()
                .filter_map(|t| Template::compile(t))
                .collect(),
            warn: config
                .warn_templates
                .iter()
                .filter_map(|t| Template::compile(t))
                .collect(),
        }
    }

    /// First template matching `path`, warning templates first
    pub fn check(&self, path: &RelativePath) -> Option<ExclusionMatch> {
        if path.is_root() {
            return None;
        }
        if let Some(t) = self.warn.iter().find(|t| t.matches(path)) {
            return Some(ExclusionMatch {
                template: t.source.clone(),
                kind: ExclusionKind::Warn,
            });
        }
        self.silent
            .iter()
            .find(|t| t.matches(path))
            .map(|t| ExclusionMatch {
                template: t.source.clone(),
                kind: ExclusionKind::Silent,
            })
    }

    /// Whether any template matches `path`
    pub fn is_excluded(&self, path: &RelativePath) -> bool {
        self.check(path).is_some()
    }

    pub fn template_count(&self) -> usize {
        self.silent.len() + self.warn.len()
    }
}

impl Default for ExclusionMatcher {
    fn default() -> Self {
        Self::new(&ExclusionsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    #[test]
    fn test_default_templates() {
        let matcher = ExclusionMatcher::default();
        assert!(matcher.is_excluded(&path("notes.txt~")));
        assert!(matcher.is_excluded(&path("docs/~$report.docx")));
        assert!(matcher.is_excluded(&path("docs/.~lock.report.odt#")));
        assert!(matcher.is_excluded(&path(".DS_Store")));
        assert!(matcher.is_excluded(&path("photos/Thumbs.db")));
        assert!(matcher.is_excluded(&path("movie.mkv.part")));
        assert!(matcher.is_excluded(&path(".Trash-1000")));
        assert!(!matcher.is_excluded(&path("notes.txt")));
        assert!(!matcher.is_excluded(&path("docs/report.docx")));
    }

    #[test]
    fn test_templates_match_the_name_not_the_parent() {
        let matcher = ExclusionMatcher::default();
        assert!(!matcher.is_excluded(&path("Thumbs.db/inside.txt")));
    }

    #[test]
    fn test_path_templates() {
        let matcher = ExclusionMatcher::new(&ExclusionsConfig {
            templates: vec!["build/*".to_string()],
            warn_templates: vec![],
        });
        assert!(matcher.is_excluded(&path("build/out.o")));
        assert!(!matcher.is_excluded(&path("src/build/out.o")));
    }

    #[test]
    fn test_warn_templates_take_precedence() {
        let matcher = ExclusionMatcher::new(&ExclusionsConfig {
            templates: vec!["*.log".to_string()],
            warn_templates: vec!["*.log".to_string()],
        });
        let found = matcher.check(&path("app.log")).unwrap();
        assert_eq!(found.kind, ExclusionKind::Warn);
        assert_eq!(found.template, "*.log");
    }

    #[test]
    fn test_invalid_templates_are_skipped() {
        let matcher = ExclusionMatcher::new(&ExclusionsConfig {
            templates: vec!["[bad".to_string(), "*.tmp".to_string()],
            warn_templates: vec![],
        });
        assert_eq!(matcher.template_count(), 1);
    }
}
