//! On-disk layout of the data directory and the per-(package, version) result records.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use npmrepro_classify::{ClassifiedChange, Verdict, RULESET_VERSION};
use npmrepro_contracts::{AuditErrorKind, AUDIT_RECORD_SCHEMA_VERSION};
use npmrepro_resolver::BuildSuccess;
use serde::{Deserialize, Serialize};

use crate::util::{unix_now, write_atomic};

/// Version placeholder for failures that happen before the registry answered.
pub(crate) const UNKNOWN_VERSION: &str = "unknown";

#[derive(Debug, Clone)]
pub(crate) struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn record_path(&self, package: &str, version: &str) -> PathBuf {
        self.results_dir()
            .join(encode_name(package))
            .join(format!("{}.json", encode_name(version)))
    }

    pub fn log_path(&self, package: &str) -> PathBuf {
        self.root.join("logs").join(format!("{}.log", encode_name(package)))
    }

    pub fn work_dir(&self, package: &str) -> PathBuf {
        self.root.join("work").join(encode_name(package))
    }

    pub fn report_path(&self) -> PathBuf {
        self.root.join("report.html")
    }
}

/// Keeps scoped names (`@babel/types`) a single path component.
pub(crate) fn encode_name(name: &str) -> String {
    name.replace('/', "__")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BuildInfo {
    pub package_manager: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdirectory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    pub used_clean_publish: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_case: Option<String>,
}

impl From<&BuildSuccess> for BuildInfo {
    fn from(s: &BuildSuccess) -> Self {
        Self {
            package_manager: s.package_manager.as_str().to_string(),
            subdirectory: s.subdirectory.clone(),
            tag: s.tag.clone(),
            build_strategy: s.build_strategy.map(|b| b.as_str().to_string()),
            build_command: s.build_command.clone(),
            used_clean_publish: s.used_clean_publish,
            special_case: (!s.special_cases.is_empty()).then(|| s.special_cases.join(",")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AuditRecord {
    pub schema_version: String,
    pub package: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
    pub content_matches: bool,
    pub is_known_benign_mismatch: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<AuditErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildInfo>,
    #[serde(default)]
    pub changes: Vec<ClassifiedChange>,
    pub ruleset_version: u32,
    pub audited_at: u64,
    pub tool_version: String,
}

/// Report grouping of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Category {
    Matched,
    BenignMismatch,
    RealMismatch,
    Failed(AuditErrorKind),
}

impl Category {
    pub fn label(self) -> String {
        match self {
            Category::Matched => "matched".to_string(),
            Category::BenignMismatch => "benign-mismatch".to_string(),
            Category::RealMismatch => "real-mismatch".to_string(),
            Category::Failed(kind) => kind.as_string(),
        }
    }
}

impl AuditRecord {
    fn base(package: &str, version: &str) -> Self {
        Self {
            schema_version: AUDIT_RECORD_SCHEMA_VERSION.to_string(),
            package: package.to_string(),
            version: version.to_string(),
            published_at: None,
            content_matches: false,
            is_known_benign_mismatch: false,
            error_kind: None,
            error_detail: None,
            build: None,
            changes: Vec::new(),
            ruleset_version: RULESET_VERSION,
            audited_at: unix_now(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// A failed audit never carries a diff verdict.
    pub fn failed(
        package: &str,
        version: Option<&str>,
        kind: AuditErrorKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            error_kind: Some(kind),
            error_detail: Some(detail.into()),
            ..Self::base(package, version.unwrap_or(UNKNOWN_VERSION))
        }
    }

    pub fn from_verdict(verdict: Verdict, published_at: Option<String>, build: BuildInfo) -> Self {
        Self {
            published_at,
            content_matches: verdict.content_matches,
            is_known_benign_mismatch: verdict.is_known_benign_mismatch && !verdict.content_matches,
            build: Some(build),
            changes: verdict.changes,
            ruleset_version: verdict.ruleset_version,
            ..Self::base(&verdict.package, &verdict.version)
        }
    }

    pub fn category(&self) -> Category {
        match self.error_kind {
            Some(kind) => Category::Failed(kind),
            None if self.content_matches => Category::Matched,
            None if self.is_known_benign_mismatch => Category::BenignMismatch,
            None => Category::RealMismatch,
        }
    }

    /// Classified under an older rule set. Failed records are never stale.
    pub fn is_stale(&self) -> bool {
        self.error_kind.is_none() && self.ruleset_version < RULESET_VERSION
    }

    pub fn is_problem(&self) -> bool {
        !matches!(self.category(), Category::Matched | Category::BenignMismatch)
    }
}

pub(crate) fn write_record(layout: &DataLayout, record: &AuditRecord) -> Result<PathBuf> {
    let path = layout.record_path(&record.package, &record.version);
    let mut bytes = serde_json::to_vec_pretty(record)?;
    bytes.push(b'\n');
    write_atomic(&path, &bytes)?;
    Ok(path)
}

pub(crate) fn read_record(path: &Path) -> Result<AuditRecord> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let record: AuditRecord =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
    if record.schema_version != AUDIT_RECORD_SCHEMA_VERSION {
        bail!(
            "{}: unsupported schema_version {:?} (expected {AUDIT_RECORD_SCHEMA_VERSION:?})",
            path.display(),
            record.schema_version
        );
    }
    Ok(record)
}

/// Every stored record, sorted by package then audit time.
pub(crate) fn load_records(layout: &DataLayout) -> Result<Vec<AuditRecord>> {
    let dir = layout.results_dir();
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for pkg in std::fs::read_dir(&dir).with_context(|| format!("read_dir {}", dir.display()))? {
        let pkg = pkg?.path();
        if !pkg.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&pkg).with_context(|| format!("read_dir {}", pkg.display()))? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                match read_record(&path) {
                    Ok(r) => out.push(r),
                    Err(err) => tracing::warn!("skipping unreadable record: {err:#}"),
                }
            }
        }
    }
    out.sort_by(|a, b| {
        (a.package.as_str(), a.audited_at, a.version.as_str())
            .cmp(&(b.package.as_str(), b.audited_at, b.version.as_str()))
    });
    Ok(out)
}

/// Most recently audited record per package.
pub(crate) fn latest_records(records: &[AuditRecord]) -> BTreeMap<String, &AuditRecord> {
    let mut out: BTreeMap<String, &AuditRecord> = BTreeMap::new();
    for r in records {
        let key = r.package.to_ascii_lowercase();
        match out.get(&key) {
            Some(prev) if prev.audited_at > r.audited_at => {}
            _ => {
                out.insert(key, r);
            }
        }
    }
    out
}

/// Tracked package names: one per line, `#` starts a comment, case-insensitive.
pub(crate) fn read_tracked_packages(path: &Path) -> Result<Vec<String>> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let mut seen = BTreeSet::new();
    Ok(text
        .lines()
        .map(|l| l.split('#').next().unwrap_or("").trim().to_ascii_lowercase())
        .filter(|l| !l.is_empty())
        .filter(|l| seen.insert(l.clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use npmrepro_classify::{classify_changes, ChangeKind, ChangeRecord};
    use npmrepro_contracts::BuildErrorKind;

    fn build_info() -> BuildInfo {
        BuildInfo {
            package_manager: "npm".to_string(),
            subdirectory: None,
            tag: Some("v1.0.0".to_string()),
            build_strategy: None,
            build_command: None,
            used_clean_publish: false,
            special_case: None,
        }
    }

    #[test]
    fn scoped_names_stay_one_component() {
        let layout = DataLayout::new("/data");
        assert_eq!(
            layout.record_path("@babel/types", "7.1.0"),
            PathBuf::from("/data/results/@babel__types/7.1.0.json")
        );
        assert_eq!(
            layout.log_path("@babel/types"),
            PathBuf::from("/data/logs/@babel__types.log")
        );
    }

    #[test]
    fn failed_records_carry_kind_and_no_verdict() {
        let r = AuditRecord::failed(
            "x",
            Some("1.0.0"),
            BuildErrorKind::NoTagMatch.into(),
            "none of [1.0.0, v1.0.0]",
        );
        assert_eq!(r.category(), Category::Failed(AuditErrorKind::Build(BuildErrorKind::NoTagMatch)));
        assert!(!r.content_matches && !r.is_known_benign_mismatch);
        assert!(r.build.is_none());
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["error_kind"], "build:no-tag-match");

        let r = AuditRecord::failed("x", None, AuditErrorKind::RegFetchFailed, "404");
        assert_eq!(r.version, UNKNOWN_VERSION);
    }

    #[test]
    fn matching_verdict_is_never_benign() {
        let v = classify_changes("x", "1.0.0", Vec::new());
        let r = AuditRecord::from_verdict(v, None, build_info());
        assert_eq!(r.category(), Category::Matched);
        assert!(!r.is_known_benign_mismatch);

        let v = classify_changes(
            "x",
            "1.0.0",
            vec![ChangeRecord::new(ChangeKind::Added, "/CHANGELOG.md")],
        );
        let r = AuditRecord::from_verdict(v, None, build_info());
        assert_eq!(r.category(), Category::BenignMismatch);
    }

    #[test]
    fn records_round_trip_and_latest_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(tmp.path());
        let mut old = AuditRecord::failed("Left-Pad", Some("1.2.0"), AuditErrorKind::NotGit, "svn");
        old.audited_at = 10;
        let mut new = AuditRecord::from_verdict(
            classify_changes("left-pad", "1.3.0", Vec::new()),
            None,
            build_info(),
        );
        new.audited_at = 20;
        write_record(&layout, &old).unwrap();
        write_record(&layout, &new).unwrap();

        let records = load_records(&layout).unwrap();
        assert_eq!(records.len(), 2);
        let latest = latest_records(&records);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest["left-pad"].version, "1.3.0");
    }

    #[test]
    fn stale_means_older_rules_and_no_error() {
        let mut r = AuditRecord::from_verdict(
            classify_changes("x", "1.0.0", Vec::new()),
            None,
            build_info(),
        );
        assert!(!r.is_stale());
        r.ruleset_version = 0;
        assert!(r.is_stale());
        r.error_kind = Some(AuditErrorKind::UnexpectedError);
        assert!(!r.is_stale());
    }

    #[test]
    fn tracked_packages_skip_comments_and_duplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("packages.txt");
        std::fs::write(&path, "# top packages\nLodash\nreact # ui\n\nlodash\n@babel/types\n")
            .unwrap();
        assert_eq!(
            read_tracked_packages(&path).unwrap(),
            vec!["lodash", "react", "@babel/types"]
        );
        assert!(read_tracked_packages(&tmp.path().join("missing.txt"))
            .unwrap()
            .is_empty());
    }
}
