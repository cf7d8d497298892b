use std::fmt;
use std::path::Path;

use npmrepro_contracts::{AuditErrorKind, VERDICT_SCHEMA_VERSION};
use npmrepro_runner_common::CommandRunner;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::allowlist::KnownMismatches;
use crate::diff::{run_diff, DiffRun};
use crate::parse::{parse_diff, ChangeKind, ChangeRecord};
use crate::rules::{first_matching_rule, RULESET_VERSION};
use crate::tree::{comparable_root, strip_top_level};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedChange {
    pub kind: ChangeKind,
    pub path: String,
    /// Id of the benign rule explaining this change, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub schema_version: String,
    pub package: String,
    pub version: String,
    pub content_matches: bool,
    pub is_known_benign_mismatch: bool,
    /// Decided by the known-mismatch list without running the diff.
    #[serde(default)]
    pub allow_listed: bool,
    #[serde(default)]
    pub changes: Vec<ClassifiedChange>,
    pub ruleset_version: u32,
}

impl Verdict {
    fn new(package: &str, version: &str) -> Self {
        Self {
            schema_version: VERDICT_SCHEMA_VERSION.to_string(),
            package: package.to_string(),
            version: version.to_string(),
            content_matches: true,
            is_known_benign_mismatch: false,
            allow_listed: false,
            changes: Vec::new(),
            ruleset_version: RULESET_VERSION,
        }
    }

    pub fn known_mismatch(package: &str, version: &str) -> Self {
        Self {
            content_matches: false,
            is_known_benign_mismatch: true,
            allow_listed: true,
            ..Self::new(package, version)
        }
    }

    /// A difference no rule explains.
    pub fn is_real_mismatch(&self) -> bool {
        !self.content_matches && !self.is_known_benign_mismatch
    }
}

#[derive(Debug)]
pub enum ClassifyError {
    /// The comparison tool failed without producing anything to classify.
    DiffProducedNoOutput { status: String, stderr: String },
    Other(anyhow::Error),
}

impl ClassifyError {
    pub fn kind(&self) -> AuditErrorKind {
        match self {
            ClassifyError::DiffProducedNoOutput { .. } => AuditErrorKind::DiffProducedNoOutput,
            ClassifyError::Other(_) => AuditErrorKind::UnexpectedError,
        }
    }
}

impl fmt::Display for ClassifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassifyError::DiffProducedNoOutput { status, stderr } => {
                write!(f, "diff produced no output ({status})")?;
                let stderr = stderr.trim();
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
            ClassifyError::Other(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for ClassifyError {}

impl From<anyhow::Error> for ClassifyError {
    fn from(err: anyhow::Error) -> Self {
        ClassifyError::Other(err)
    }
}

/// Judges all-or-nothing: the mismatch is benign only if every change matches a rule.
pub fn classify_changes(package: &str, version: &str, changes: Vec<ChangeRecord>) -> Verdict {
    let mut verdict = Verdict::new(package, version);
    if changes.is_empty() {
        return verdict;
    }
    verdict.content_matches = false;
    verdict.changes = changes
        .into_iter()
        .map(|c| ClassifiedChange {
            rule: first_matching_rule(package, &c).map(str::to_string),
            kind: c.kind,
            path: c.path,
        })
        .collect();
    verdict.is_known_benign_mismatch = verdict.changes.iter().all(|c| c.rule.is_some());
    verdict
}

pub struct Classifier<R: CommandRunner> {
    runner: R,
    known: KnownMismatches,
}

impl<R: CommandRunner> Classifier<R> {
    pub fn new(runner: R, known: KnownMismatches) -> Self {
        Self { runner, known }
    }

    pub fn known_mismatches(&self) -> &KnownMismatches {
        &self.known
    }

    /// Compares two extracted trees, each still wrapped in its top-level directory.
    pub fn classify(
        &self,
        built_tree: &Path,
        published_tree: &Path,
        package: &str,
        version: &str,
    ) -> Result<Verdict, ClassifyError> {
        if let Some(verdict) = self.short_circuit(package, version) {
            return Ok(verdict);
        }
        let built = strip_top_level(built_tree)?;
        let published = strip_top_level(published_tree)?;
        self.compare_roots(&built, &published, package, version)
    }

    /// Same as [`Classifier::classify`] but accepts `.tgz` archives (or directories) and
    /// extracts archives below `scratch`.
    pub fn classify_archives(
        &self,
        built: &Path,
        published: &Path,
        scratch: &Path,
        package: &str,
        version: &str,
    ) -> Result<Verdict, ClassifyError> {
        if let Some(verdict) = self.short_circuit(package, version) {
            return Ok(verdict);
        }
        let built = comparable_root(built, &scratch.join("built"))?;
        let published = comparable_root(published, &scratch.join("published"))?;
        self.compare_roots(&built, &published, package, version)
    }

    fn short_circuit(&self, package: &str, version: &str) -> Option<Verdict> {
        if self.known.contains(package, version) {
            info!(package, version, "known mismatch; skipping diff");
            return Some(Verdict::known_mismatch(package, version));
        }
        None
    }

    fn compare_roots(
        &self,
        built: &Path,
        published: &Path,
        package: &str,
        version: &str,
    ) -> Result<Verdict, ClassifyError> {
        let changes = match run_diff(&self.runner, built, published)? {
            DiffRun::Identical => Vec::new(),
            DiffRun::NoOutput { status, stderr } => {
                return Err(ClassifyError::DiffProducedNoOutput { status, stderr });
            }
            DiffRun::Differences(text) => {
                let mut changes = parse_diff(&text, built, published);
                if changes.is_empty() {
                    warn!(package, version, "diff reported differences but none were parsed");
                    changes.push(ChangeRecord::new(ChangeKind::Modified, "/"));
                }
                changes
            }
        };
        debug!(package, version, changes = changes.len(), "diff parsed");
        Ok(classify_changes(package, version, changes))
    }
}
