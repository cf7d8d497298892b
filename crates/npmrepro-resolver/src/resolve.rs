use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use npmrepro_contracts::BuildErrorKind;
use npmrepro_registry::archive::pack_dir_tgz;
use npmrepro_runner_common::{CommandOutput, CommandRunner, CommandSpec};
use tracing::{debug, info, warn};

use crate::candidates::{
    first_matching_tag, locate_subdirectory, subdirectory_candidates, tag_candidates, PackageName,
};
use crate::manifest::{read_manifest, Manifest, CLEAN_PUBLISH, MANIFEST_FILE};
use crate::outcome::{BuildOutcome, BuildRequest, BuildSuccess};
use crate::overrides::overrides_for;
use crate::package_manager::PackageManager;
use crate::strategy::{plan_build, BuildStrategy, BUILD_SCRIPT};

const REPO_DIR: &str = "repo";
const CLEAN_PUBLISH_DIR: &str = "clean-publish";
const BUILD_OUTPUT_DIR: &str = "build";
const TYPE_DEFINITIONS_CASE: &str = "type-definitions";

/// A classified stage failure. Anything that escapes as `anyhow::Error` is unexpected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub kind: BuildErrorKind,
    pub detail: String,
}

impl StageFailure {
    pub fn new(kind: BuildErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl From<anyhow::Error> for StageFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::new(BuildErrorKind::UnexpectedError, format!("{err:#}"))
    }
}

type StageResult<T> = Result<T, StageFailure>;

/// Reproduces a package archive from its source repository.
///
/// Everything is written below `scratch_dir`; only the final archive is copied to
/// `output_dir`.
pub struct Resolver<R: CommandRunner> {
    runner: R,
    scratch_dir: PathBuf,
    output_dir: PathBuf,
}

struct BuildRun {
    strategy: BuildStrategy,
    command: String,
}

impl<R: CommandRunner> Resolver<R> {
    pub fn new(runner: R, scratch_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            scratch_dir: scratch_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn resolve(&self, request: &BuildRequest) -> BuildOutcome {
        match self.try_resolve(request) {
            Ok(success) => {
                info!(
                    package = %request.package_name,
                    version = %request.target_version,
                    artifact = %success.artifact_path.display(),
                    "build reproduced"
                );
                BuildOutcome::Success(success)
            }
            Err(failure) => {
                warn!(
                    package = %request.package_name,
                    version = %request.target_version,
                    kind = failure.kind.as_str(),
                    "build failed"
                );
                BuildOutcome::failure(failure.kind, failure.detail)
            }
        }
    }

    fn try_resolve(&self, request: &BuildRequest) -> StageResult<BuildSuccess> {
        let name = PackageName::parse(&request.package_name);
        let version = request.target_version.trim();
        let repo_root = self.scratch_dir.join(REPO_DIR);

        self.clone_repository(&request.repository_url, &repo_root)?;

        if name.is_type_definitions() {
            return self.pack_type_definitions(request, &name, &repo_root);
        }

        let tag = self.checkout_release_tag(&name, version, &repo_root)?;

        let candidates = subdirectory_candidates(&name, request.subdirectory_hint.as_deref());
        let subdirectory = locate_subdirectory(&repo_root, &candidates);
        let package_dir = match &subdirectory {
            Some(rel) => repo_root.join(rel),
            None => repo_root.clone(),
        };
        let shown = subdirectory
            .as_ref()
            .map_or_else(|| ".".to_string(), |p| p.display().to_string());
        info!(package = name.full(), step = "locate", subdirectory = %shown, "package root located");

        let pm = PackageManager::detect(&repo_root);
        self.install(pm, &repo_root, request.published_at.as_deref())?;
        if subdirectory.is_some() {
            self.install(pm, &package_dir, request.published_at.as_deref())?;
        }

        let root_manifest = read_manifest(&repo_root)?.unwrap_or_default();
        let sub_manifest = match subdirectory {
            Some(_) => Some(read_manifest(&package_dir)?.unwrap_or_default()),
            None => None,
        };
        let plan = plan_build(
            root_manifest.has_script(BUILD_SCRIPT),
            sub_manifest.as_ref().map(|m| m.has_script(BUILD_SCRIPT)),
        );
        let build = self.run_build(pm, &plan, &repo_root, &package_dir, &name)?;

        let mut special_cases = Vec::new();
        let mut pack_dir = package_dir.clone();
        for action in overrides_for(&request.repository_url) {
            info!(package = name.full(), step = "override", action = action.as_str(), "applying repository override");
            special_cases.push(action.as_str().to_string());
            if let Some(cmd) = action.command(&repo_root) {
                self.run_checked(&cmd, BuildErrorKind::BuildScriptFailed)?;
            }
            if let Some(dir) = action.staged_dir(&repo_root, &name) {
                pack_dir = dir;
            }
        }

        let build_output = pack_dir.join(BUILD_OUTPUT_DIR);
        if build_output.join(MANIFEST_FILE).is_file() {
            debug!(dir = %build_output.display(), "packing from build output directory");
            pack_dir = build_output;
        }

        let used_clean_publish = root_manifest.uses_clean_publish()
            || sub_manifest.as_ref().is_some_and(Manifest::uses_clean_publish);
        let artifact = if used_clean_publish {
            self.clean_publish_pack(&name, version, &pack_dir)?
        } else {
            self.native_pack(pm, &pack_dir)?
        };
        let artifact_path = self.emit(&artifact)?;

        Ok(BuildSuccess {
            artifact_path,
            package_manager: pm,
            subdirectory: subdirectory.map(|p| p.to_string_lossy().replace('\\', "/")),
            tag: Some(tag),
            build_strategy: build.as_ref().map(|b| b.strategy),
            build_command: build.map(|b| b.command),
            used_clean_publish,
            special_cases,
        })
    }

    fn clone_repository(&self, url: &str, repo_root: &Path) -> StageResult<()> {
        if repo_root.exists() {
            std::fs::remove_dir_all(repo_root)
                .with_context(|| format!("remove stale checkout: {}", repo_root.display()))?;
        }
        std::fs::create_dir_all(&self.scratch_dir)
            .with_context(|| format!("create dir: {}", self.scratch_dir.display()))?;
        info!(step = "clone", url, "cloning repository");
        let cmd = CommandSpec::new("git", &self.scratch_dir)
            .args(["clone", "--quiet", url])
            .arg(repo_root.to_string_lossy())
            .env("GIT_TERMINAL_PROMPT", "0");
        self.run_checked(&cmd, BuildErrorKind::CloneFailed)?;
        Ok(())
    }

    fn checkout_release_tag(
        &self,
        name: &PackageName,
        version: &str,
        repo_root: &Path,
    ) -> StageResult<String> {
        let list = CommandSpec::new("git", repo_root).args(["tag", "--list"]);
        let output = self.runner.run(&list)?;
        if !output.success() {
            return Err(StageFailure::new(
                BuildErrorKind::UnexpectedError,
                format!("{list}: {}", output.describe()),
            ));
        }
        let tags: BTreeSet<String> = output
            .stdout_lossy()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        let candidates = tag_candidates(name, version);
        let Some(tag) = first_matching_tag(&candidates, &tags) else {
            return Err(StageFailure::new(
                BuildErrorKind::NoTagMatch,
                format!(
                    "none of [{}] exists among {} tag(s)",
                    candidates.join(", "),
                    tags.len()
                ),
            ));
        };
        info!(package = name.full(), step = "checkout", tag, "release tag found");

        let checkout = CommandSpec::new("git", repo_root)
            .args(["-c", "advice.detachedHead=false", "checkout", "--quiet"])
            .arg(format!("refs/tags/{tag}"));
        self.run_checked(&checkout, BuildErrorKind::UnexpectedError)?;
        Ok(tag.to_string())
    }

    fn install(&self, pm: PackageManager, dir: &Path, published_at: Option<&str>) -> StageResult<()> {
        let cmd = pm.install_command(dir, published_at);
        info!(step = "install", command = %cmd, "installing dependencies");
        self.run_checked(&cmd, BuildErrorKind::InstallFailed)?;
        Ok(())
    }

    /// Runs the planned attempts in order until one exits zero.
    fn run_build(
        &self,
        pm: PackageManager,
        plan: &[BuildStrategy],
        repo_root: &Path,
        package_dir: &Path,
        name: &PackageName,
    ) -> StageResult<Option<BuildRun>> {
        if plan.is_empty() {
            info!(package = name.full(), step = "build", "no build script; packing sources");
            return Ok(None);
        }
        let mut attempts = Vec::new();
        for &strategy in plan {
            let cmd = strategy.command(pm, repo_root, package_dir, name);
            info!(step = "build", strategy = strategy.as_str(), command = %cmd, "running build script");
            let output = self.runner.run(&cmd)?;
            if output.success() {
                return Ok(Some(BuildRun {
                    strategy,
                    command: cmd.command_line(),
                }));
            }
            warn!(strategy = strategy.as_str(), status = %output.status_label(), "build attempt failed");
            attempts.push(format!("[{}] {cmd}: {}", strategy.as_str(), output.describe()));
        }
        Err(StageFailure::new(
            BuildErrorKind::BuildScriptFailed,
            attempts.join("\n"),
        ))
    }

    /// `@types/*`: the unscoped directory of the upstream repository is packed as-is.
    fn pack_type_definitions(
        &self,
        request: &BuildRequest,
        name: &PackageName,
        repo_root: &Path,
    ) -> StageResult<BuildSuccess> {
        let candidates = subdirectory_candidates(name, request.subdirectory_hint.as_deref());
        // Older DefinitelyTyped revisions carry no per-package manifest.
        let unscoped = PathBuf::from("types").join(name.sub());
        let Some(subdirectory) = locate_subdirectory(repo_root, &candidates)
            .or_else(|| repo_root.join(&unscoped).is_dir().then_some(unscoped))
        else {
            return Err(StageFailure::new(
                BuildErrorKind::PackFailed,
                format!("no types/{} directory for {}", name.sub(), name.full()),
            ));
        };
        info!(package = name.full(), step = "locate", subdirectory = %subdirectory.display(), "type definitions located");
        let pm = PackageManager::Npm;
        let artifact = self.native_pack(pm, &repo_root.join(&subdirectory))?;
        let artifact_path = self.emit(&artifact)?;
        Ok(BuildSuccess {
            artifact_path,
            package_manager: pm,
            subdirectory: Some(subdirectory.to_string_lossy().replace('\\', "/")),
            tag: None,
            build_strategy: None,
            build_command: None,
            used_clean_publish: false,
            special_cases: vec![TYPE_DEFINITIONS_CASE.to_string()],
        })
    }

    fn native_pack(&self, pm: PackageManager, pack_dir: &Path) -> StageResult<PathBuf> {
        let cmd = pm.pack_command(pack_dir);
        info!(step = "pack", command = %cmd, "packing");
        let output = self.run_checked(&cmd, BuildErrorKind::PackFailed)?;
        let stdout = output.stdout_lossy();
        let Some(reported) = pm.parse_pack_output(&stdout) else {
            return Err(StageFailure::new(
                BuildErrorKind::PackOutputUnparsed,
                format!("{pm} pack printed no archive path:\n{}", output.describe()),
            ));
        };
        let path = pack_dir.join(&reported);
        if !path.is_file() {
            return Err(StageFailure::new(
                BuildErrorKind::PackFailed,
                format!("{pm} pack reported {reported} but {} does not exist", path.display()),
            ));
        }
        Ok(path)
    }

    fn clean_publish_pack(
        &self,
        name: &PackageName,
        version: &str,
        pack_dir: &Path,
    ) -> StageResult<PathBuf> {
        let temp_dir = self.scratch_dir.join(CLEAN_PUBLISH_DIR);
        if temp_dir.exists() {
            std::fs::remove_dir_all(&temp_dir)
                .with_context(|| format!("remove {}", temp_dir.display()))?;
        }
        let cmd = CommandSpec::new("npx", pack_dir)
            .args(["--yes", CLEAN_PUBLISH, "--without-publish", "--temp-dir"])
            .arg(temp_dir.to_string_lossy());
        info!(step = "pack", command = %cmd, "running clean-publish");
        self.run_checked(&cmd, BuildErrorKind::PackFailed)?;

        let out = self
            .scratch_dir
            .join(format!("{}-{version}.tgz", name.file_stem()));
        pack_dir_tgz(&temp_dir, "package", &out).map_err(|err| {
            StageFailure::new(
                BuildErrorKind::PackFailed,
                format!("compress clean-publish output: {err:#}"),
            )
        })?;
        Ok(out)
    }

    /// Copies the archive into the host-visible output directory.
    fn emit(&self, artifact: &Path) -> StageResult<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("create dir: {}", self.output_dir.display()))?;
        let file_name = artifact
            .file_name()
            .with_context(|| format!("archive path has no file name: {}", artifact.display()))?;
        let dest = self.output_dir.join(file_name);
        std::fs::copy(artifact, &dest)
            .with_context(|| format!("copy {} -> {}", artifact.display(), dest.display()))?;
        Ok(dest)
    }

    fn run_checked(&self, cmd: &CommandSpec, kind: BuildErrorKind) -> StageResult<CommandOutput> {
        let output = self.runner.run(cmd)?;
        if output.success() {
            Ok(output)
        } else {
            Err(StageFailure::new(kind, format!("{cmd}: {}", output.describe())))
        }
    }
}
