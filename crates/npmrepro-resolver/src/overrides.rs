//! Per-repository release quirks, keyed by exact repository URL.

use std::path::{Path, PathBuf};

use npmrepro_registry::repository_key;
use npmrepro_runner_common::CommandSpec;

use crate::candidates::PackageName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoOverride {
    /// Run `make prepublish` at the repository root after the generic build.
    MakePrepublish,
    /// Pack from a staging directory instead of the package subdirectory.
    /// `{name}` expands to the full package name.
    StagedOutput { dir: &'static str },
}

#[derive(Debug, Clone, Copy)]
pub struct OverrideEntry {
    pub repository: &'static str,
    pub action: RepoOverride,
}

pub const REPOSITORY_OVERRIDES: &[OverrideEntry] = &[
    OverrideEntry {
        repository: "https://github.com/babel/babel",
        action: RepoOverride::MakePrepublish,
    },
    OverrideEntry {
        repository: "https://github.com/facebook/react",
        action: RepoOverride::StagedOutput {
            dir: "build/node_modules/{name}",
        },
    },
];

pub fn overrides_for(repository_url: &str) -> Vec<RepoOverride> {
    let key = repository_key(repository_url);
    REPOSITORY_OVERRIDES
        .iter()
        .filter(|e| e.repository == key)
        .map(|e| e.action)
        .collect()
}

impl RepoOverride {
    pub fn as_str(self) -> &'static str {
        match self {
            RepoOverride::MakePrepublish => "make-prepublish",
            RepoOverride::StagedOutput { .. } => "staged-output",
        }
    }

    pub fn command(self, repo_root: &Path) -> Option<CommandSpec> {
        match self {
            RepoOverride::MakePrepublish => {
                Some(CommandSpec::new("make", repo_root).arg("prepublish"))
            }
            RepoOverride::StagedOutput { .. } => None,
        }
    }

    pub fn staged_dir(self, repo_root: &Path, name: &PackageName) -> Option<PathBuf> {
        match self {
            RepoOverride::StagedOutput { dir } => {
                Some(repo_root.join(dir.replace("{name}", name.full())))
            }
            RepoOverride::MakePrepublish => None,
        }
    }
}
