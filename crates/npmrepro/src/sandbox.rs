//! Runs the build resolver behind the sandbox boundary: the host passes a request and a
//! bind-mounted output directory and reads back either an archive or a failure record.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use npmrepro_contracts::BuildErrorKind;
use npmrepro_resolver::{read_outcome, write_outcome, BuildOutcome, BuildRequest, Resolver};
use npmrepro_runner_common::sandbox_backend::EffectiveSandboxBackend;
use npmrepro_runner_common::{CommandRunner, CommandSpec, SystemRunner};

use crate::log::{PackageLog, TranscriptRunner};
use crate::util::reset_dir;

const RESOLVER_BIN: &str = "npmrepro-resolver";
const CONTAINER_OUT_DIR: &str = "/out";

pub(crate) trait BuildSandbox: Send + Sync {
    /// Builds `request` using `work_dir` for everything it writes.
    fn build(&self, request: &BuildRequest, work_dir: &Path, log: &PackageLog) -> Result<BuildOutcome>;
}

/// Host-visible output directory of one sandbox run.
pub(crate) fn sandbox_out_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("sandbox")
}

pub(crate) fn sandbox_for(
    backend: EffectiveSandboxBackend,
    image: &str,
) -> Box<dyn BuildSandbox> {
    match backend {
        EffectiveSandboxBackend::Docker => Box::new(DockerSandbox::new(SystemRunner, image)),
        EffectiveSandboxBackend::None => Box::new(HostSandbox::new(SystemRunner)),
    }
}

/// One throwaway container per build.
pub(crate) struct DockerSandbox<R: CommandRunner> {
    runner: R,
    image: String,
}

impl<R: CommandRunner> DockerSandbox<R> {
    pub fn new(runner: R, image: impl Into<String>) -> Self {
        Self {
            runner,
            image: image.into(),
        }
    }

    fn command(&self, request: &BuildRequest, out_dir: &Path) -> CommandSpec {
        let mut cmd = CommandSpec::new("docker", out_dir)
            .args(["run", "--rm", "-v"])
            .arg(format!("{}:{CONTAINER_OUT_DIR}", out_dir.display()))
            .arg(&self.image)
            .arg(RESOLVER_BIN)
            .args(["--package-name", request.package_name.as_str()])
            .args(["--repository-url", request.repository_url.as_str()])
            .args(["--version", request.target_version.as_str()]);
        if let Some(at) = &request.published_at {
            cmd = cmd.args(["--published-at", at.as_str()]);
        }
        if let Some(hint) = &request.subdirectory_hint {
            cmd = cmd.args(["--subdirectory-hint", hint.as_str()]);
        }
        cmd.args(["--out-dir", CONTAINER_OUT_DIR, "--log-level", "info"])
    }
}

impl<R: CommandRunner> BuildSandbox for DockerSandbox<R> {
    fn build(&self, request: &BuildRequest, work_dir: &Path, log: &PackageLog) -> Result<BuildOutcome> {
        let out_dir = sandbox_out_dir(work_dir);
        reset_dir(&out_dir)?;
        // docker resolves relative bind mounts against its own cwd, not ours.
        let out_dir = out_dir
            .canonicalize()
            .with_context(|| format!("canonicalize {}", out_dir.display()))?;

        let cmd = self.command(request, &out_dir);
        log.step(format!("sandbox: docker image {}", self.image));
        let output = TranscriptRunner::new(&self.runner, log).run(&cmd)?;

        match read_outcome(&out_dir) {
            Ok(outcome) => Ok(outcome),
            // A container that died before writing anything still yields a build failure.
            Err(err) if !output.success() => Ok(BuildOutcome::failure(
                BuildErrorKind::UnexpectedError,
                format!("{err:#}; {}: {}", cmd.command_line(), output.describe()),
            )),
            Err(err) => Err(err),
        }
    }
}

/// Runs the resolver in-process. Only selected when weaker isolation was accepted.
pub(crate) struct HostSandbox<R: CommandRunner> {
    runner: R,
}

impl<R: CommandRunner> HostSandbox<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> BuildSandbox for HostSandbox<R> {
    fn build(&self, request: &BuildRequest, work_dir: &Path, log: &PackageLog) -> Result<BuildOutcome> {
        let out_dir = sandbox_out_dir(work_dir);
        reset_dir(&out_dir)?;
        log.step("sandbox: host (no isolation)");

        let runner = TranscriptRunner::new(&self.runner, log);
        let resolver = Resolver::new(runner, work_dir.join("scratch"), &out_dir);
        let outcome = resolver.resolve(request);
        write_outcome(&out_dir, &outcome)?;
        read_outcome(&out_dir)
    }
}
