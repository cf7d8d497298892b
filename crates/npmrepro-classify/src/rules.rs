//! Known-benign difference patterns.
//!
//! Rules are independent predicates over (package name, change). A change is benign when
//! any rule matches; the table order only decides which rule id gets reported.

use crate::parse::{ChangeKind, ChangeRecord};

/// Bumped whenever a rule is added, removed or changed. Stored with every verdict.
pub const RULESET_VERSION: u32 = 1;

pub struct BenignRule {
    pub id: &'static str,
    pub description: &'static str,
    matches: fn(&str, &ChangeRecord) -> bool,
}

impl BenignRule {
    pub fn matches(&self, package_name: &str, change: &ChangeRecord) -> bool {
        (self.matches)(package_name, change)
    }
}

pub const BENIGN_RULES: &[BenignRule] = &[
    BenignRule {
        id: "published-changelog",
        description: "CHANGELOG.md added to the published archive",
        matches: |_, c| c.kind == ChangeKind::Added && c.path == "/CHANGELOG.md",
    },
    BenignRule {
        id: "published-npmignore",
        description: ".npmignore added to the published archive",
        matches: |_, c| c.kind == ChangeKind::Added && c.path == "/.npmignore",
    },
    BenignRule {
        id: "tsbuildinfo",
        description: "incremental TypeScript build metadata differs",
        matches: |_, c| c.kind == ChangeKind::Modified && c.file_name() == "tsconfig.tsbuildinfo",
    },
    BenignRule {
        id: "types-publisher-metadata",
        description: "@types package metadata regenerated by the types publisher",
        matches: |name, c| {
            name.starts_with("@types/")
                && c.kind == ChangeKind::Modified
                && matches!(c.path.as_str(), "/package.json" | "/README.md" | "/LICENSE")
        },
    },
];

/// Id of the first rule that explains `change`.
pub fn first_matching_rule(package_name: &str, change: &ChangeRecord) -> Option<&'static str> {
    BENIGN_RULES
        .iter()
        .find(|rule| rule.matches(package_name, change))
        .map(|rule| rule.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, kind: ChangeKind, path: &str) -> Option<&'static str> {
        first_matching_rule(name, &ChangeRecord::new(kind, path))
    }

    #[test]
    fn changelog_only_counts_when_added_at_the_root() {
        assert_eq!(
            rule("x", ChangeKind::Added, "/CHANGELOG.md"),
            Some("published-changelog")
        );
        assert_eq!(rule("x", ChangeKind::Modified, "/CHANGELOG.md"), None);
        assert_eq!(rule("x", ChangeKind::Removed, "/CHANGELOG.md"), None);
        assert_eq!(rule("x", ChangeKind::Added, "/docs/CHANGELOG.md"), None);
        assert_eq!(
            rule("x", ChangeKind::Added, "/.npmignore"),
            Some("published-npmignore")
        );
    }

    #[test]
    fn tsbuildinfo_matches_at_any_depth() {
        assert_eq!(
            rule("x", ChangeKind::Modified, "/tsconfig.tsbuildinfo"),
            Some("tsbuildinfo")
        );
        assert_eq!(
            rule("x", ChangeKind::Modified, "/dist/tsconfig.tsbuildinfo"),
            Some("tsbuildinfo")
        );
        assert_eq!(rule("x", ChangeKind::Added, "/tsconfig.tsbuildinfo"), None);
    }

    #[test]
    fn types_metadata_is_scoped_to_types_packages() {
        for path in ["/package.json", "/README.md", "/LICENSE"] {
            assert_eq!(
                rule("@types/node", ChangeKind::Modified, path),
                Some("types-publisher-metadata")
            );
            assert_eq!(rule("left-pad", ChangeKind::Modified, path), None);
        }
        assert_eq!(rule("@types/node", ChangeKind::Modified, "/index.d.ts"), None);
        assert_eq!(rule("@types/node", ChangeKind::Modified, "/ts4.8/README.md"), None);
    }

    #[test]
    fn rule_ids_are_unique() {
        let mut ids: Vec<_> = BENIGN_RULES.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), BENIGN_RULES.len());
    }
}
