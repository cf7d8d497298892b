//! Build-script discovery as an ordered list of attempts.

use std::path::Path;

use npmrepro_runner_common::CommandSpec;
use serde::{Deserialize, Serialize};

use crate::candidates::PackageName;
use crate::package_manager::PackageManager;

pub const BUILD_SCRIPT: &str = "build";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStrategy {
    /// `build` declared by the package's own manifest, run in its directory.
    Subdirectory,
    /// Root `build` with the package name as a filter argument.
    RootFiltered,
    /// Root `build` with no arguments (builds everything).
    Root,
}

impl BuildStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStrategy::Subdirectory => "subdirectory",
            BuildStrategy::RootFiltered => "root-filtered",
            BuildStrategy::Root => "root",
        }
    }

    pub fn command(
        self,
        pm: PackageManager,
        repo_root: &Path,
        package_dir: &Path,
        name: &PackageName,
    ) -> CommandSpec {
        match self {
            BuildStrategy::Subdirectory => pm.run_script_command(package_dir, BUILD_SCRIPT, &[]),
            BuildStrategy::RootFiltered => {
                pm.run_script_command(repo_root, BUILD_SCRIPT, &[name.full()])
            }
            BuildStrategy::Root => pm.run_script_command(repo_root, BUILD_SCRIPT, &[]),
        }
    }
}

/// Attempts to make, in order; the first one that exits zero wins.
///
/// `subdirectory_has_build` is `None` when the package root is the repository root.
/// An empty plan means no build step is needed.
pub fn plan_build(root_has_build: bool, subdirectory_has_build: Option<bool>) -> Vec<BuildStrategy> {
    let has_subdirectory = subdirectory_has_build.is_some();
    let root_attempts = if has_subdirectory {
        vec![BuildStrategy::RootFiltered, BuildStrategy::Root]
    } else {
        vec![BuildStrategy::Root]
    };

    let mut plan = Vec::new();
    if subdirectory_has_build == Some(true) {
        plan.push(BuildStrategy::Subdirectory);
    }
    if root_has_build {
        plan.extend(root_attempts);
    }
    plan
}
