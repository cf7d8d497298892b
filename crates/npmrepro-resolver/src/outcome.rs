use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use npmrepro_contracts::{
    BuildErrorKind, BUILD_FAILURE_SCHEMA_VERSION, BUILD_OUTCOME_SCHEMA_VERSION, FAILURE_FILE_NAME,
    OUTCOME_FILE_NAME,
};
use serde::{Deserialize, Serialize};

use crate::package_manager::PackageManager;
use crate::strategy::BuildStrategy;

/// Immutable input to one resolver run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub package_name: String,
    pub repository_url: String,
    pub target_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
    /// `repository.directory` from the registry, tried before heuristic subdirectories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdirectory_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSuccess {
    pub artifact_path: PathBuf,
    pub package_manager: PackageManager,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdirectory: Option<String>,
    /// `None` only for packages whose content is packed without a release tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_strategy: Option<BuildStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    pub used_clean_publish: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub special_cases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFailure {
    pub error_kind: BuildErrorKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Success(BuildSuccess),
    Failure(BuildFailure),
}

impl BuildOutcome {
    pub fn failure(error_kind: BuildErrorKind, detail: impl Into<String>) -> Self {
        BuildOutcome::Failure(BuildFailure {
            error_kind,
            detail: detail.into(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BuildOutcome::Success(_))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OutcomeFile {
    schema_version: String,
    #[serde(flatten)]
    success: BuildSuccess,
}

#[derive(Debug, Serialize, Deserialize)]
struct FailureFile {
    schema_version: String,
    #[serde(flatten)]
    failure: BuildFailure,
}

/// Writes the host-visible record for `outcome` into `out_dir`.
///
/// On success the archive must already be in `out_dir`; its path is stored relative to
/// it. On failure any archive left behind is removed so the directory never holds both.
pub fn write_outcome(out_dir: &Path, outcome: &BuildOutcome) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("create dir: {}", out_dir.display()))?;
    match outcome {
        BuildOutcome::Success(success) => {
            let file_name = success
                .artifact_path
                .file_name()
                .context("artifact path has no file name")?;
            if !out_dir.join(file_name).is_file() {
                bail!(
                    "artifact {} is not inside {}",
                    success.artifact_path.display(),
                    out_dir.display()
                );
            }
            let mut success = success.clone();
            success.artifact_path = PathBuf::from(file_name);
            let doc = OutcomeFile {
                schema_version: BUILD_OUTCOME_SCHEMA_VERSION.to_string(),
                success,
            };
            write_json(&out_dir.join(OUTCOME_FILE_NAME), &doc)
        }
        BuildOutcome::Failure(failure) => {
            for entry in std::fs::read_dir(out_dir)
                .with_context(|| format!("read_dir {}", out_dir.display()))?
            {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "tgz") || path.ends_with(OUTCOME_FILE_NAME)
                {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("remove {}", path.display()))?;
                }
            }
            let doc = FailureFile {
                schema_version: BUILD_FAILURE_SCHEMA_VERSION.to_string(),
                failure: failure.clone(),
            };
            write_json(&out_dir.join(FAILURE_FILE_NAME), &doc)
        }
    }
}

/// Reads back what [`write_outcome`] left in `out_dir`.
pub fn read_outcome(out_dir: &Path) -> Result<BuildOutcome> {
    let failure_path = out_dir.join(FAILURE_FILE_NAME);
    if failure_path.is_file() {
        let bytes = std::fs::read(&failure_path)
            .with_context(|| format!("read {}", failure_path.display()))?;
        let doc: FailureFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {}", failure_path.display()))?;
        if doc.schema_version != BUILD_FAILURE_SCHEMA_VERSION {
            bail!(
                "unsupported failure record schema_version: {} (expected {BUILD_FAILURE_SCHEMA_VERSION})",
                doc.schema_version
            );
        }
        return Ok(BuildOutcome::Failure(doc.failure));
    }

    let outcome_path = out_dir.join(OUTCOME_FILE_NAME);
    if !outcome_path.is_file() {
        bail!("resolver left neither {OUTCOME_FILE_NAME} nor {FAILURE_FILE_NAME} in {}", out_dir.display());
    }
    let bytes = std::fs::read(&outcome_path)
        .with_context(|| format!("read {}", outcome_path.display()))?;
    let doc: OutcomeFile = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse {}", outcome_path.display()))?;
    if doc.schema_version != BUILD_OUTCOME_SCHEMA_VERSION {
        bail!(
            "unsupported outcome schema_version: {} (expected {BUILD_OUTCOME_SCHEMA_VERSION})",
            doc.schema_version
        );
    }
    let mut success = doc.success;
    success.artifact_path = out_dir.join(&success.artifact_path);
    if !success.artifact_path.is_file() {
        bail!("artifact missing: {}", success.artifact_path.display());
    }
    Ok(BuildOutcome::Success(success))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    std::fs::write(path, &bytes).with_context(|| format!("write {}", path.display()))
}
