use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::store::{AuditRecord, Category};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Selector {
    /// Every tracked package.
    All,
    /// Latest record failed; optionally only kinds starting with the given prefix.
    Failed(Option<String>),
    Mismatched,
    Stale,
    Name(String),
}

impl Selector {
    pub fn parse(token: &str) -> Self {
        let token = token.trim().to_ascii_lowercase();
        match token.as_str() {
            "all" => Selector::All,
            "failed" => Selector::Failed(None),
            "mismatched" => Selector::Mismatched,
            "stale" => Selector::Stale,
            _ => match token.strip_prefix("failed:") {
                Some(kind) if !kind.is_empty() => Selector::Failed(Some(kind.to_string())),
                _ => Selector::Name(token),
            },
        }
    }

    fn matches(&self, record: &AuditRecord) -> bool {
        match self {
            Selector::All | Selector::Name(_) => false,
            Selector::Failed(prefix) => match (record.category(), prefix) {
                (Category::Failed(_), None) => true,
                (Category::Failed(kind), Some(prefix)) => kind.as_string().starts_with(prefix.as_str()),
                _ => false,
            },
            Selector::Mismatched => record.category() == Category::RealMismatch,
            Selector::Stale => record.is_stale(),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::All => f.write_str("all"),
            Selector::Failed(None) => f.write_str("failed"),
            Selector::Failed(Some(kind)) => write!(f, "failed:{kind}"),
            Selector::Mismatched => f.write_str("mismatched"),
            Selector::Stale => f.write_str("stale"),
            Selector::Name(name) => f.write_str(name),
        }
    }
}

/// Expands selectors into package names, first occurrence order, no duplicates.
pub(crate) fn select(
    selectors: &[Selector],
    tracked: &[String],
    latest: &BTreeMap<String, &AuditRecord>,
) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    let mut push = |name: &str| {
        let name = name.to_ascii_lowercase();
        if seen.insert(name.clone()) {
            out.push(name);
        }
    };
    for selector in selectors {
        match selector {
            Selector::All => tracked.iter().for_each(|n| push(n)),
            Selector::Name(name) => push(name),
            _ => latest
                .iter()
                .filter(|(_, r)| selector.matches(r))
                .for_each(|(name, _)| push(name)),
        }
    }
    out
}
