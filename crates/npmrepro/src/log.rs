//! Per-package plain-text log: every pipeline step, every external command with its
//! captured output, and the final error chain.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use npmrepro_runner_common::{CommandOutput, CommandRunner, CommandSpec};

pub(crate) struct PackageLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl PackageLog {
    /// Truncates any log left by an earlier run.
    pub fn create(path: &Path, package: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create log dir: {}", parent.display()))?;
        }
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let log = Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        };
        log.line(&format!(
            "npmrepro {} audit of {package} (started at {})",
            env!("CARGO_PKG_VERSION"),
            crate::util::unix_now()
        ));
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn step(&self, msg: impl AsRef<str>) {
        self.line(&format!("[step] {}", msg.as_ref()));
    }

    pub fn transition(&self, from: impl AsRef<str>, to: impl AsRef<str>) {
        self.line(&format!("[state] {} -> {}", from.as_ref(), to.as_ref()));
    }

    pub fn command(&self, cmd: &CommandSpec, result: &Result<CommandOutput>) {
        let body = match result {
            Ok(out) => out.describe(),
            Err(err) => format!("spawn failed: {err:#}\n"),
        };
        self.line(&format!("[exec] {cmd}\n{body}"));
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        self.line(&format!("[error] {}", msg.as_ref()));
    }

    // Log write failures never fail the audit.
    fn line(&self, text: &str) {
        let Ok(mut file) = self.file.lock() else {
            return;
        };
        let _ = writeln!(file, "{}", text.trim_end());
        let _ = file.flush();
    }
}

/// Wraps a runner and copies every invocation and its output into a [`PackageLog`].
pub(crate) struct TranscriptRunner<'a, R: CommandRunner> {
    inner: R,
    log: &'a PackageLog,
}

impl<'a, R: CommandRunner> TranscriptRunner<'a, R> {
    pub fn new(inner: R, log: &'a PackageLog) -> Self {
        Self { inner, log }
    }
}

impl<R: CommandRunner> CommandRunner for TranscriptRunner<'_, R> {
    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let result = self.inner.run(cmd);
        self.log.command(cmd, &result);
        result
    }
}
