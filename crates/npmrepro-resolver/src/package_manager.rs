use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use npmrepro_runner_common::CommandSpec;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
}

/// Yarn 1: `success Wrote tarball to "/abs/path/pkg-v1.0.0.tgz".`
static YARN_CLASSIC_PACK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"Wrote tarball to "([^"]+)""#).expect("valid regex"));

/// Yarn 2+: `➤ YN0000: Package archive generated in /abs/path/package.tgz`
static YARN_BERRY_PACK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Package archive generated in (\S+)").expect("valid regex"));

impl PackageManager {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Yarn => "yarn",
            PackageManager::Pnpm => "pnpm",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "npm" => Some(PackageManager::Npm),
            "yarn" => Some(PackageManager::Yarn),
            "pnpm" => Some(PackageManager::Pnpm),
            _ => None,
        }
    }

    /// Lockfile presence at the repository root decides; npm is the fallback.
    pub fn detect(repo_root: &Path) -> Self {
        if repo_root.join("yarn.lock").is_file() {
            PackageManager::Yarn
        } else if repo_root.join("pnpm-lock.yaml").is_file() {
            PackageManager::Pnpm
        } else {
            PackageManager::Npm
        }
    }

    /// Whether installs can be pinned to a point in time.
    pub fn supports_time_pinning(self) -> bool {
        matches!(self, PackageManager::Npm)
    }

    pub fn install_command(self, cwd: &Path, published_at: Option<&str>) -> CommandSpec {
        let cmd = CommandSpec::new(self.as_str(), cwd).arg("install");
        match published_at {
            Some(ts) if self.supports_time_pinning() && !ts.trim().is_empty() => {
                cmd.arg(format!("--before={}", ts.trim()))
            }
            _ => cmd,
        }
    }

    pub fn run_script_command(self, cwd: &Path, script: &str, args: &[&str]) -> CommandSpec {
        let cmd = CommandSpec::new(self.as_str(), cwd).args(["run", script]);
        if args.is_empty() {
            return cmd;
        }
        match self {
            PackageManager::Npm => cmd.arg("--").args(args.iter().copied()),
            PackageManager::Yarn | PackageManager::Pnpm => cmd.args(args.iter().copied()),
        }
    }

    pub fn pack_command(self, cwd: &Path) -> CommandSpec {
        CommandSpec::new(self.as_str(), cwd).arg("pack")
    }

    /// Extracts the archive path from the pack command's stdout.
    ///
    /// npm-compatible managers print the file name as the last non-empty line; yarn prints
    /// one of two sentences depending on its major version. pnpm is assumed to follow npm.
    pub fn parse_pack_output(self, stdout: &str) -> Option<String> {
        match self {
            PackageManager::Yarn => YARN_CLASSIC_PACK
                .captures(stdout)
                .or_else(|| YARN_BERRY_PACK.captures(stdout))
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string()),
            PackageManager::Npm | PackageManager::Pnpm => stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .last()
                .map(str::to_string),
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_prefers_yarn_then_pnpm() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(PackageManager::detect(tmp.path()), PackageManager::Npm);
        std::fs::write(tmp.path().join("pnpm-lock.yaml"), b"").unwrap();
        assert_eq!(PackageManager::detect(tmp.path()), PackageManager::Pnpm);
        std::fs::write(tmp.path().join("yarn.lock"), b"").unwrap();
        assert_eq!(PackageManager::detect(tmp.path()), PackageManager::Yarn);
    }

    #[test]
    fn install_is_pinned_only_for_npm() {
        let dir = Path::new("/repo");
        let ts = Some("2020-05-10T16:37:30.776Z");
        assert_eq!(
            PackageManager::Npm.install_command(dir, ts).command_line(),
            "npm install --before=2020-05-10T16:37:30.776Z"
        );
        assert_eq!(
            PackageManager::Npm.install_command(dir, None).command_line(),
            "npm install"
        );
        assert_eq!(
            PackageManager::Yarn.install_command(dir, ts).command_line(),
            "yarn install"
        );
    }

    #[test]
    fn script_arguments_follow_manager_conventions() {
        let dir = Path::new("/repo");
        assert_eq!(
            PackageManager::Npm
                .run_script_command(dir, "build", &["@babel/types"])
                .command_line(),
            "npm run build -- @babel/types"
        );
        assert_eq!(
            PackageManager::Yarn
                .run_script_command(dir, "build", &["react"])
                .command_line(),
            "yarn run build react"
        );
        assert_eq!(
            PackageManager::Pnpm.run_script_command(dir, "build", &[]).command_line(),
            "pnpm run build"
        );
    }

    #[test]
    fn parses_npm_pack_output() {
        let out = "\nnpm notice ignored on stdout\nsafe-buffer-5.2.1.tgz\n\n";
        assert_eq!(
            PackageManager::Npm.parse_pack_output(out).as_deref(),
            Some("safe-buffer-5.2.1.tgz")
        );
        assert_eq!(PackageManager::Npm.parse_pack_output("  \n"), None);
    }

    #[test]
    fn parses_both_yarn_pack_formats() {
        let classic = "yarn pack v1.22.19\nsuccess Wrote tarball to \"/w/repo/left-pad-v1.3.0.tgz\".\nDone in 0.10s.\n";
        assert_eq!(
            PackageManager::Yarn.parse_pack_output(classic).as_deref(),
            Some("/w/repo/left-pad-v1.3.0.tgz")
        );
        let berry = "➤ YN0000: + package.json\n➤ YN0000: Package archive generated in /w/repo/package.tgz\n➤ YN0000: Done in 0s 12ms\n";
        assert_eq!(
            PackageManager::Yarn.parse_pack_output(berry).as_deref(),
            Some("/w/repo/package.tgz")
        );
        assert_eq!(PackageManager::Yarn.parse_pack_output("left-pad.tgz\n"), None);
    }
}
