//! Artifact Diff Classifier: compares a rebuilt package with the published one and
//! decides whether the difference is real or one of the known benign patterns.

pub mod allowlist;
pub mod classify;
pub mod diff;
pub mod parse;
pub mod rules;
pub mod tree;

pub use allowlist::KnownMismatches;
pub use classify::{classify_changes, ClassifiedChange, Classifier, ClassifyError, Verdict};
pub use parse::{ChangeKind, ChangeRecord};
pub use rules::{BenignRule, BENIGN_RULES, RULESET_VERSION};
