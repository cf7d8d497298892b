//! Settings resolution: CLI flag, then environment, then `npmrepro.json`, then defaults.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use npmrepro_contracts::CONFIG_SCHEMA_VERSION;
use npmrepro_registry::DEFAULT_REGISTRY_URL;
use npmrepro_runner_common::sandbox_backend::{SandboxBackend, ENV_SANDBOX_BACKEND};
use serde::Deserialize;

pub(crate) const CONFIG_FILE_NAME: &str = "npmrepro.json";
pub(crate) const ENV_DATA_DIR: &str = "NPMREPRO_DATA_DIR";
pub(crate) const ENV_REGISTRY_URL: &str = "NPMREPRO_REGISTRY_URL";

pub(crate) const DEFAULT_DATA_DIR: &str = "npmrepro-data";
pub(crate) const DEFAULT_JOBS: usize = 5;
pub(crate) const DEFAULT_SANDBOX_IMAGE: &str = "npmrepro-sandbox:latest";
const DEFAULT_TRACKED_PACKAGES: &str = "packages.txt";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    schema_version: String,
    #[serde(default)]
    registry_url: Option<String>,
    #[serde(default)]
    sandbox_image: Option<String>,
    #[serde(default)]
    sandbox_backend: Option<String>,
    #[serde(default)]
    jobs: Option<usize>,
    #[serde(default)]
    known_mismatches: Option<PathBuf>,
    #[serde(default)]
    tracked_packages: Option<PathBuf>,
}

/// Values given on the command line; `None` means "not given".
#[derive(Debug, Default, Clone)]
pub(crate) struct CliOverrides {
    pub registry_url: Option<String>,
    pub sandbox_image: Option<String>,
    pub sandbox_backend: Option<SandboxBackend>,
    pub jobs: Option<usize>,
    pub known_mismatches: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Settings {
    pub data_dir: PathBuf,
    pub registry_url: String,
    pub sandbox_image: String,
    /// Requested backend; `None` leaves the choice to the environment and the default.
    pub sandbox_backend: Option<SandboxBackend>,
    pub jobs: usize,
    pub known_mismatches: Option<PathBuf>,
    pub tracked_packages: PathBuf,
}

impl Settings {
    pub fn resolve(data_dir: Option<PathBuf>, cli: CliOverrides) -> Result<Self> {
        Self::resolve_with_env(data_dir, cli, |key| {
            std::env::var(key).ok().filter(|v| !v.trim().is_empty())
        })
    }

    fn resolve_with_env(
        data_dir: Option<PathBuf>,
        cli: CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let data_dir = data_dir
            .or_else(|| env(ENV_DATA_DIR).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let file = load_config_file(&data_dir)?;

        let registry_url = cli
            .registry_url
            .or_else(|| env(ENV_REGISTRY_URL))
            .or(file.registry_url)
            .unwrap_or_else(|| DEFAULT_REGISTRY_URL.to_string());

        let file_backend = match file.sandbox_backend.as_deref() {
            Some(raw) => Some(
                raw.parse::<SandboxBackend>()
                    .with_context(|| format!("{CONFIG_FILE_NAME}: sandbox_backend"))?,
            ),
            None => None,
        };
        // The environment variable is read by the backend resolver itself; the config
        // file only applies when neither the flag nor the variable is set.
        let sandbox_backend = match cli.sandbox_backend {
            Some(b) => Some(b),
            None if env(ENV_SANDBOX_BACKEND).is_some() => None,
            None => file_backend,
        };

        let jobs = cli.jobs.or(file.jobs).unwrap_or(DEFAULT_JOBS);
        if jobs == 0 {
            bail!("jobs must be at least 1");
        }

        let known_mismatches = cli
            .known_mismatches
            .or_else(|| file.known_mismatches.map(|p| data_dir.join(p)));
        let tracked_packages = data_dir.join(
            file.tracked_packages
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TRACKED_PACKAGES)),
        );

        Ok(Self {
            sandbox_image: cli
                .sandbox_image
                .or(file.sandbox_image)
                .unwrap_or_else(|| DEFAULT_SANDBOX_IMAGE.to_string()),
            data_dir,
            registry_url,
            sandbox_backend,
            jobs,
            known_mismatches,
            tracked_packages,
        })
    }
}

fn load_config_file(data_dir: &Path) -> Result<ConfigFile> {
    let path = data_dir.join(CONFIG_FILE_NAME);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigFile::default()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let file: ConfigFile =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
    if file.schema_version != CONFIG_SCHEMA_VERSION {
        bail!(
            "{}: unsupported schema_version {:?} (expected {CONFIG_SCHEMA_VERSION:?})",
            path.display(),
            file.schema_version
        );
    }
    Ok(file)
}
