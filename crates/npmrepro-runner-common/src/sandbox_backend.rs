use std::fmt;
use std::str::FromStr;

use anyhow::Context;

pub const ENV_SANDBOX_BACKEND: &str = "NPMREPRO_SANDBOX_BACKEND";
pub const ENV_ACCEPT_WEAKER_ISOLATION: &str = "NPMREPRO_I_ACCEPT_WEAKER_ISOLATION";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxBackend {
    Auto,
    Docker,
    None,
}

impl SandboxBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxBackend::Auto => "auto",
            SandboxBackend::Docker => "docker",
            SandboxBackend::None => "none",
        }
    }
}

impl fmt::Display for SandboxBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SandboxBackendParseError {
    value: String,
}

impl fmt::Display for SandboxBackendParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid sandbox backend {:?} (expected one of: auto, docker, none)",
            self.value
        )
    }
}

impl std::error::Error for SandboxBackendParseError {}

impl FromStr for SandboxBackend {
    type Err = SandboxBackendParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.to_ascii_lowercase();
        match s.as_str() {
            "auto" => Ok(SandboxBackend::Auto),
            "docker" => Ok(SandboxBackend::Docker),
            "container" => Ok(SandboxBackend::Docker),
            "none" => Ok(SandboxBackend::None),
            _ => Err(SandboxBackendParseError { value: s }),
        }
    }
}

#[cfg(feature = "clap")]
impl clap::ValueEnum for SandboxBackend {
    fn value_variants<'a>() -> &'a [Self] {
        const ALL: [SandboxBackend; 3] = [
            SandboxBackend::Auto,
            SandboxBackend::Docker,
            SandboxBackend::None,
        ];
        &ALL
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            SandboxBackend::Auto => Some(clap::builder::PossibleValue::new("auto")),
            SandboxBackend::Docker => {
                Some(clap::builder::PossibleValue::new("docker").alias("container"))
            }
            SandboxBackend::None => Some(clap::builder::PossibleValue::new("none")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectiveSandboxBackend {
    Docker,
    None,
}

impl EffectiveSandboxBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            EffectiveSandboxBackend::Docker => "docker",
            EffectiveSandboxBackend::None => "none",
        }
    }

    pub fn is_isolated(self) -> bool {
        matches!(self, EffectiveSandboxBackend::Docker)
    }
}

impl fmt::Display for EffectiveSandboxBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn parse_bool_env(name: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Ok(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Ok(false),
        other => anyhow::bail!(
            "invalid environment variable {name}={other:?} (expected one of: 1, 0, true, false, yes, no)"
        ),
    }
}

fn read_sandbox_backend_env() -> anyhow::Result<Option<SandboxBackend>> {
    let Ok(raw) = std::env::var(ENV_SANDBOX_BACKEND) else {
        return Ok(None);
    };
    let backend = SandboxBackend::from_str(&raw)
        .with_context(|| format!("invalid environment variable {ENV_SANDBOX_BACKEND}={raw:?}"))?;
    Ok(Some(backend))
}

fn read_accept_weaker_isolation_env() -> anyhow::Result<Option<bool>> {
    let Ok(raw) = std::env::var(ENV_ACCEPT_WEAKER_ISOLATION) else {
        return Ok(None);
    };
    Ok(Some(parse_bool_env(ENV_ACCEPT_WEAKER_ISOLATION, &raw)?))
}

fn resolve_sandbox_backend_with_env(
    requested: Option<SandboxBackend>,
    cli_accept_weaker_isolation: bool,
    env_backend: Option<SandboxBackend>,
    env_accept_weaker_isolation: Option<bool>,
) -> anyhow::Result<EffectiveSandboxBackend> {
    let accept_weaker_isolation =
        cli_accept_weaker_isolation || env_accept_weaker_isolation.unwrap_or(false);

    let requested = match requested {
        Some(v) => v,
        None => env_backend.unwrap_or(SandboxBackend::Auto),
    };

    let effective = match requested {
        SandboxBackend::Auto | SandboxBackend::Docker => EffectiveSandboxBackend::Docker,
        SandboxBackend::None => EffectiveSandboxBackend::None,
    };

    if !effective.is_isolated() && !accept_weaker_isolation {
        anyhow::bail!(
            "package builds run untrusted code and fail closed without a container; effective sandbox backend is {effective}\n\n\
fix:\n  - use a container backend: --sandbox-backend=docker (default), or\n  - explicitly accept weaker isolation: --i-accept-weaker-isolation (or set {ENV_ACCEPT_WEAKER_ISOLATION}=1)"
        );
    }

    Ok(effective)
}

/// Resolves the backend from (in order) the explicit request, the environment and the
/// default, refusing to run builds unisolated unless that was accepted.
pub fn resolve_sandbox_backend(
    requested: Option<SandboxBackend>,
    cli_accept_weaker_isolation: bool,
) -> anyhow::Result<EffectiveSandboxBackend> {
    let env_backend = read_sandbox_backend_env()?;
    let env_accept_weaker_isolation = read_accept_weaker_isolation_env()?;
    resolve_sandbox_backend_with_env(
        requested,
        cli_accept_weaker_isolation,
        env_backend,
        env_accept_weaker_isolation,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_backend_from_str() {
        assert_eq!(
            SandboxBackend::from_str("auto").unwrap(),
            SandboxBackend::Auto
        );
        assert_eq!(
            SandboxBackend::from_str(" Docker ").unwrap(),
            SandboxBackend::Docker
        );
        assert_eq!(
            SandboxBackend::from_str("container").unwrap(),
            SandboxBackend::Docker
        );
        assert_eq!(
            SandboxBackend::from_str("none").unwrap(),
            SandboxBackend::None
        );
        assert!(SandboxBackend::from_str("vm").is_err());
    }

    #[test]
    fn auto_resolves_to_docker() {
        let backend = resolve_sandbox_backend_with_env(None, false, None, None).unwrap();
        assert_eq!(backend, EffectiveSandboxBackend::Docker);

        let backend =
            resolve_sandbox_backend_with_env(None, false, Some(SandboxBackend::Auto), None)
                .unwrap();
        assert_eq!(backend, EffectiveSandboxBackend::Docker);
    }

    #[test]
    fn none_requires_acceptance() {
        let err = resolve_sandbox_backend_with_env(Some(SandboxBackend::None), false, None, None)
            .unwrap_err();
        assert!(format!("{err:#}").contains("fail closed"));

        let backend =
            resolve_sandbox_backend_with_env(Some(SandboxBackend::None), true, None, None)
                .unwrap();
        assert_eq!(backend, EffectiveSandboxBackend::None);

        let backend = resolve_sandbox_backend_with_env(
            None,
            false,
            Some(SandboxBackend::None),
            Some(true),
        )
        .unwrap();
        assert_eq!(backend, EffectiveSandboxBackend::None);
    }

    #[test]
    fn explicit_request_beats_environment() {
        let backend = resolve_sandbox_backend_with_env(
            Some(SandboxBackend::Docker),
            false,
            Some(SandboxBackend::None),
            None,
        )
        .unwrap();
        assert_eq!(backend, EffectiveSandboxBackend::Docker);
    }
}
