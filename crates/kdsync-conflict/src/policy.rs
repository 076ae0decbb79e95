//! Policy engine for conflict resolution
//!
//! Maps a detected conflict to the policy that resolves it. The default
//! comes from the conflict kind, adjusted by the configured edit-edit
//! winner; glob rules from configuration override it for matching paths
//! in first-match-wins order. With `auto_resolve` off every conflict is
//! left to the user.

use glob::Pattern;
use tracing::{debug, trace, warn};

use kdsync_core::config::{ConflictRule, ConflictsConfig, EditEditWinner};
use kdsync_core::domain::{ConflictKind, ConflictPolicy, RelativePath};

use crate::error::ConflictError;

/// Whether `policy` can resolve a conflict of `kind`
///
/// Policies that would discard unsynced local content are only accepted
/// where the content survives elsewhere.
pub fn policy_applies(kind: ConflictKind, policy: ConflictPolicy) -> bool {
    use ConflictKind::*;
    use ConflictPolicy::*;
    match policy {
        Manual => true,
        RenameLocalAndDownloadRemote | KeepBoth => {
            matches!(kind, EditEdit | CreateCreate | EditForbidden)
        }
        CancelLocalOperation => matches!(kind, RenameRace | MoveIntoDeletedParent),
        RestoreToOriginalLocation => matches!(kind, DeleteEdit | MoveIntoDeletedParent),
        RescueToRoot => matches!(kind, EditDelete | CreateInDeletedParent),
    }
}

/// Validates a rule's glob pattern
pub fn validate_rule(rule: &ConflictRule) -> Result<(), ConflictError> {
    Pattern::new(&rule.pattern).map_err(|e| ConflictError::InvalidPattern {
        pattern: rule.pattern.clone(),
        reason: e.to_string(),
    })?;
    Ok(())
}

/// Engine that evaluates conflict resolution rules
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    rules: Vec<(Pattern, ConflictPolicy)>,
    edit_edit_winner: EditEditWinner,
    auto_resolve: bool,
}

impl PolicyEngine {
    /// Creates a PolicyEngine from the conflict configuration
    ///
    /// Invalid rules are logged and skipped.
    pub fn new(config: &ConflictsConfig) -> Self {
        let rules: Vec<(Pattern, ConflictPolicy)> = config
            .rules
            .iter()
            .filter_map(|rule| match Pattern::new(&rule.pattern) {
                Ok(pattern) => Some((pattern, rule.policy)),
                Err(e) => {
                    warn!(
                        pattern = %rule.pattern,
                        error = %e,
                        "Skipping invalid conflict rule pattern"
                    );
                    None
                }
            })
            .collect();

        debug!(
            rules_count = rules.len(),
            edit_edit_winner = ?config.edit_edit_winner,
            auto_resolve = config.auto_resolve,
            "PolicyEngine initialized"
        );

        Self {
            rules,
            edit_edit_winner: config.edit_edit_winner,
            auto_resolve: config.auto_resolve,
        }
    }

    /// Policy used for `kind` when no rule matches
    pub fn default_policy(&self, kind: ConflictKind) -> ConflictPolicy {
        match (kind, self.edit_edit_winner) {
            (ConflictKind::EditEdit, EditEditWinner::Local) => ConflictPolicy::KeepBoth,
            _ => kind.default_policy(),
        }
    }

    /// Evaluates the policy for a conflict of `kind` at `path`
    ///
    /// The first rule whose glob matches the path and whose policy applies
    /// to the kind wins; otherwise the kind's default is used.
    pub fn evaluate(&self, kind: ConflictKind, path: &RelativePath) -> ConflictPolicy {
        if !self.auto_resolve {
            return ConflictPolicy::Manual;
        }

        for (pattern, policy) in &self.rules {
            if !pattern.matches(path.as_str()) {
                continue;
            }
            if policy_applies(kind, *policy) {
                trace!(
                    path = %path,
                    pattern = %pattern,
                    policy = %policy,
                    "Conflict rule matched"
                );
                return *policy;
            }
            trace!(
                path = %path,
                pattern = %pattern,
                policy = %policy,
                kind = %kind,
                "Conflict rule matched but does not apply to this kind"
            );
        }

        let policy = self.default_policy(kind);
        trace!(path = %path, kind = %kind, policy = %policy, "No conflict rule matched, using default");
        policy
    }

    /// Returns the number of compiled rules
    pub fn rules_count(&self) -> usize {
        self.rules.len()
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(&ConflictsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    fn config(rules: Vec<ConflictRule>) -> ConflictsConfig {
        ConflictsConfig {
            rules,
            ..ConflictsConfig::default()
        }
    }

    #[test]
    fn test_defaults_per_kind() {
        let engine = PolicyEngine::default();
        for kind in ConflictKind::ALL {
            assert_eq!(engine.evaluate(kind, &path("a.txt")), kind.default_policy());
        }
    }

    #[test]
    fn test_local_winner_keeps_both() {
        let engine = PolicyEngine::new(&ConflictsConfig {
            edit_edit_winner: EditEditWinner::Local,
            ..ConflictsConfig::default()
        });
        assert_eq!(
            engine.evaluate(ConflictKind::EditEdit, &path("a.txt")),
            ConflictPolicy::KeepBoth
        );
        assert_eq!(
            engine.evaluate(ConflictKind::CreateCreate, &path("a.txt")),
            ConflictPolicy::RenameLocalAndDownloadRemote
        );
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let engine = PolicyEngine::new(&config(vec![
            ConflictRule {
                pattern: "*.docx".to_string(),
                policy: ConflictPolicy::Manual,
            },
            ConflictRule {
                pattern: "*".to_string(),
                policy: ConflictPolicy::KeepBoth,
            },
        ]));
        assert_eq!(engine.rules_count(), 2);
        assert_eq!(
            engine.evaluate(ConflictKind::EditEdit, &path("report.docx")),
            ConflictPolicy::Manual
        );
        assert_eq!(
            engine.evaluate(ConflictKind::EditEdit, &path("notes.txt")),
            ConflictPolicy::KeepBoth
        );
    }

    #[test]
    fn test_rule_with_inapplicable_policy_is_passed_over() {
        let engine = PolicyEngine::new(&config(vec![ConflictRule {
            pattern: "**/*".to_string(),
            policy: ConflictPolicy::KeepBoth,
        }]));
        assert_eq!(
            engine.evaluate(ConflictKind::EditDelete, &path("dir/a.txt")),
            ConflictPolicy::RescueToRoot
        );
    }

    #[test]
    fn test_invalid_rule_is_skipped() {
        let engine = PolicyEngine::new(&config(vec![ConflictRule {
            pattern: "[invalid".to_string(),
            policy: ConflictPolicy::Manual,
        }]));
        assert_eq!(engine.rules_count(), 0);
        assert!(validate_rule(&ConflictRule {
            pattern: "[invalid".to_string(),
            policy: ConflictPolicy::Manual,
        })
        .is_err());
    }

    #[test]
    fn test_auto_resolve_off_defers_to_user() {
        let engine = PolicyEngine::new(&ConflictsConfig {
            auto_resolve: false,
            ..ConflictsConfig::default()
        });
        assert_eq!(
            engine.evaluate(ConflictKind::RenameRace, &path("a")),
            ConflictPolicy::Manual
        );
    }

    #[test]
    fn test_applicability_table() {
        assert!(policy_applies(ConflictKind::EditEdit, ConflictPolicy::KeepBoth));
        assert!(!policy_applies(
            ConflictKind::EditEdit,
            ConflictPolicy::CancelLocalOperation
        ));
        assert!(policy_applies(
            ConflictKind::MoveIntoDeletedParent,
            ConflictPolicy::CancelLocalOperation
        ));
        for kind in ConflictKind::ALL {
            assert!(policy_applies(kind, kind.default_policy()));
            assert!(policy_applies(kind, ConflictPolicy::Manual));
        }
    }
}
