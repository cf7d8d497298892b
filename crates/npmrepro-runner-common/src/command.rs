use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use serde::Serialize;

/// Output bytes kept per stream when a command result is rendered for logs.
pub const LOG_TAIL_BYTES: usize = 16 * 1024;

/// One external process invocation: program, argv, working directory and extra env.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl AsRef<Path>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.as_ref().to_path_buf(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// `program arg arg` without the working directory.
    pub fn command_line(&self) -> String {
        let mut out = self.program.clone();
        for a in &self.args {
            out.push(' ');
            if a.is_empty() || a.contains(char::is_whitespace) || a.contains('"') {
                out.push_str(&format!("{a:?}"));
            } else {
                out.push_str(a);
            }
        }
        out
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (cwd: {})", self.command_line(), self.cwd.display())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            status: Some(code),
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn status_label(&self) -> String {
        match self.status {
            Some(code) => format!("exit {code}"),
            None => "killed by signal".to_string(),
        }
    }

    /// Status plus the tails of both streams, for failure details and log files.
    pub fn describe(&self) -> String {
        let mut out = self.status_label();
        for (label, bytes) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            if bytes.is_empty() {
                continue;
            }
            out.push_str(&format!("\n--- {label} ---\n"));
            out.push_str(&String::from_utf8_lossy(&tail_truncate(bytes, LOG_TAIL_BYTES)));
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

/// Narrow seam for every external process the resolver and classifier spawn.
///
/// `Err` means the process could not be started at all; a non-zero exit is an `Ok`
/// output the caller has to inspect.
pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        (**self).run(cmd)
    }
}

/// Spawns real processes with stdin closed and both output streams captured.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        tracing::debug!(command = %cmd.command_line(), cwd = %cmd.cwd.display(), "spawn");
        let mut proc = Command::new(&cmd.program);
        proc.args(&cmd.args)
            .current_dir(&cmd.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in &cmd.env {
            proc.env(k, v);
        }
        let out = proc.output().with_context(|| format!("spawn {cmd}"))?;
        let out = CommandOutput {
            status: out.status.code(),
            stdout: out.stdout,
            stderr: out.stderr,
        };
        tracing::debug!(command = %cmd.command_line(), status = %out.status_label(), "exited");
        Ok(out)
    }
}

pub fn tail_truncate(b: &[u8], limit: usize) -> Vec<u8> {
    if b.len() <= limit {
        return b.to_vec();
    }
    let start = b.len() - limit;
    let mut out = Vec::new();
    out.extend_from_slice(b"...<truncated>...\n");
    out.extend_from_slice(&b[start..]);
    out
}
