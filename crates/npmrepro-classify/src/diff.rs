use std::path::Path;

use anyhow::Result;
use npmrepro_runner_common::{CommandRunner, CommandSpec};

/// Raw result of one recursive comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffRun {
    Identical,
    Differences(String),
    /// The tool failed without printing anything to parse.
    NoOutput { status: String, stderr: String },
}

pub fn diff_command(built: &Path, published: &Path) -> CommandSpec {
    let cwd = built.parent().unwrap_or(built);
    CommandSpec::new("diff", cwd)
        .args(["-r", "-u"])
        .arg(built.to_string_lossy())
        .arg(published.to_string_lossy())
}

/// Runs `diff -r -u built published`: exit 0 is identical, 1 is "differences found".
pub fn run_diff<R: CommandRunner + ?Sized>(
    runner: &R,
    built: &Path,
    published: &Path,
) -> Result<DiffRun> {
    let cmd = diff_command(built, published);
    let output = runner.run(&cmd)?;
    match output.status {
        Some(0) => Ok(DiffRun::Identical),
        Some(1) => Ok(DiffRun::Differences(output.stdout_lossy())),
        _ if output.stdout.iter().all(u8::is_ascii_whitespace) => Ok(DiffRun::NoOutput {
            status: output.status_label(),
            stderr: output.stderr_lossy(),
        }),
        _ => {
            tracing::warn!(status = %output.status_label(), "diff reported trouble; parsing partial output");
            Ok(DiffRun::Differences(output.stdout_lossy()))
        }
    }
}
