//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for schema/version strings that
//! appear in machine-readable I/O: the records the sandboxed resolver hands back to
//! the host, the per-package result files, and the embedded report payload.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const BUILD_OUTCOME_SCHEMA_VERSION: &str = "npmrepro.build-outcome@0.1.0";
pub const BUILD_FAILURE_SCHEMA_VERSION: &str = "npmrepro.build-failure@0.1.0";
pub const AUDIT_RECORD_SCHEMA_VERSION: &str = "npmrepro.audit-record@0.1.0";
pub const KNOWN_MISMATCHES_SCHEMA_VERSION: &str = "npmrepro.known-mismatches@0.1.0";
pub const CONFIG_SCHEMA_VERSION: &str = "npmrepro.config@0.1.0";
pub const REPORT_SCHEMA_VERSION: &str = "npmrepro.report@0.1.0";
pub const VERDICT_SCHEMA_VERSION: &str = "npmrepro.verdict@0.1.0";

/// File names inside the host-visible sandbox output directory.
pub const OUTCOME_FILE_NAME: &str = "outcome.json";
pub const FAILURE_FILE_NAME: &str = "failure.json";

/// Failure codes reported by the build resolver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum BuildErrorKind {
    CloneFailed,
    NoTagMatch,
    InstallFailed,
    BuildScriptFailed,
    PackFailed,
    PackOutputUnparsed,
    UnexpectedError,
}

impl BuildErrorKind {
    pub const ALL: [BuildErrorKind; 7] = [
        BuildErrorKind::CloneFailed,
        BuildErrorKind::NoTagMatch,
        BuildErrorKind::InstallFailed,
        BuildErrorKind::BuildScriptFailed,
        BuildErrorKind::PackFailed,
        BuildErrorKind::PackOutputUnparsed,
        BuildErrorKind::UnexpectedError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BuildErrorKind::CloneFailed => "clone-failed",
            BuildErrorKind::NoTagMatch => "no-tag-match",
            BuildErrorKind::InstallFailed => "install-failed",
            BuildErrorKind::BuildScriptFailed => "build-script-failed",
            BuildErrorKind::PackFailed => "pack-failed",
            BuildErrorKind::PackOutputUnparsed => "pack-output-unparsed",
            BuildErrorKind::UnexpectedError => "unexpected-error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

/// Failure codes stored in per-package result records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum AuditErrorKind {
    NoRepository,
    NotGit,
    RegFetchFailed,
    PublishedFetchFailed,
    Build(BuildErrorKind),
    DiffProducedNoOutput,
    UnexpectedError,
}

impl AuditErrorKind {
    pub fn as_string(self) -> String {
        match self {
            AuditErrorKind::NoRepository => "no-repository".to_string(),
            AuditErrorKind::NotGit => "not-git".to_string(),
            AuditErrorKind::RegFetchFailed => "reg-fetch-failed".to_string(),
            AuditErrorKind::PublishedFetchFailed => "published-fetch-failed".to_string(),
            AuditErrorKind::Build(code) => format!("build:{}", code.as_str()),
            AuditErrorKind::DiffProducedNoOutput => "diff-produced-no-output".to_string(),
            AuditErrorKind::UnexpectedError => "unexpected-error".to_string(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some(code) = s.strip_prefix("build:") {
            return BuildErrorKind::parse(code).map(AuditErrorKind::Build);
        }
        match s {
            "no-repository" => Some(AuditErrorKind::NoRepository),
            "not-git" => Some(AuditErrorKind::NotGit),
            "reg-fetch-failed" => Some(AuditErrorKind::RegFetchFailed),
            "published-fetch-failed" => Some(AuditErrorKind::PublishedFetchFailed),
            "diff-produced-no-output" => Some(AuditErrorKind::DiffProducedNoOutput),
            "unexpected-error" => Some(AuditErrorKind::UnexpectedError),
            _ => None,
        }
    }

    /// True for failures that a rerun cannot fix without the package changing upstream.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AuditErrorKind::NoRepository
                | AuditErrorKind::NotGit
                | AuditErrorKind::Build(BuildErrorKind::NoTagMatch)
        )
    }
}

#[derive(Debug, Clone)]
pub struct ErrorKindParseError {
    value: String,
}

impl fmt::Display for ErrorKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown error kind {:?}", self.value)
    }
}

impl std::error::Error for ErrorKindParseError {}

impl fmt::Display for BuildErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildErrorKind {
    type Err = ErrorKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ErrorKindParseError {
            value: s.to_string(),
        })
    }
}

impl From<BuildErrorKind> for String {
    fn from(kind: BuildErrorKind) -> Self {
        kind.as_str().to_string()
    }
}

impl TryFrom<String> for BuildErrorKind {
    type Error = ErrorKindParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for AuditErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl FromStr for AuditErrorKind {
    type Err = ErrorKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ErrorKindParseError {
            value: s.to_string(),
        })
    }
}

impl From<AuditErrorKind> for String {
    fn from(kind: AuditErrorKind) -> Self {
        kind.as_string()
    }
}

impl TryFrom<String> for AuditErrorKind {
    type Error = ErrorKindParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BuildErrorKind> for AuditErrorKind {
    fn from(code: BuildErrorKind) -> Self {
        AuditErrorKind::Build(code)
    }
}
