//! npm registry collaborator: packument lookup, repository descriptors, and the
//! published-artifact download.

use std::collections::BTreeMap;
use std::io::Read as _;
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use url::Url;

pub mod archive;
pub mod repository;

pub use repository::{
    git_repository, normalize_repository_url, repository_key, GitRepository, RepositoryField,
    RepositoryIssue,
};

pub const DEFAULT_REGISTRY_URL: &str = "https://registry.npmjs.org/";

#[derive(Debug, Clone, Deserialize)]
pub struct Packument {
    pub name: String,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub versions: BTreeMap<String, VersionDoc>,
    #[serde(default)]
    pub time: BTreeMap<String, String>,
    #[serde(default)]
    pub repository: Option<RepositoryField>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionDoc {
    pub version: String,
    #[serde(default)]
    pub repository: Option<RepositoryField>,
    pub dist: Dist,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Dist {
    pub tarball: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
}

/// Everything the audit pipeline needs to know about one published version.
#[derive(Debug, Clone, Serialize)]
pub struct PackageVersionInfo {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositoryField>,
    pub dist: Dist,
}

impl PackageVersionInfo {
    pub fn git_repository(&self) -> Result<GitRepository, RepositoryIssue> {
        git_repository(self.repository.as_ref())
    }
}

impl Packument {
    pub fn latest_version(&self) -> Option<&str> {
        self.dist_tags.get("latest").map(String::as_str)
    }

    pub fn version_info(&self, version: &str) -> Result<PackageVersionInfo> {
        let doc = self
            .versions
            .get(version)
            .with_context(|| format!("{}: version {version} not in packument", self.name))?;
        Ok(PackageVersionInfo {
            name: self.name.clone(),
            version: doc.version.clone(),
            published_at: self.time.get(version).cloned(),
            repository: doc.repository.clone().or_else(|| self.repository.clone()),
            dist: doc.dist.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RegistryClient {
    registry_root: Url,
}

impl RegistryClient {
    pub fn from_url(registry_url: &str) -> Result<Self> {
        let raw = registry_url.trim();
        // Checked before parsing: `Url::parse` appends `/` to a host-only URL.
        if !raw.ends_with('/') {
            anyhow::bail!(
                "registry url must end with '/': got {raw:?} (example: https://registry.npmjs.org/)"
            );
        }
        let registry_root = Url::parse(raw)
            .with_context(|| format!("invalid registry url: {registry_url:?} (expected URL)"))?;
        Ok(Self { registry_root })
    }

    pub fn registry_root(&self) -> &Url {
        &self.registry_root
    }

    pub fn packument_url(&self, package_name: &str) -> Result<Url> {
        let rel = packument_relative_path(package_name)?;
        self.registry_root
            .join(&rel)
            .with_context(|| format!("registry url join: {rel:?}"))
    }

    pub fn fetch_packument(&self, package_name: &str) -> Result<Packument> {
        let url = self.packument_url(package_name)?;
        let bytes = fetch_bytes(&url)?;
        serde_json::from_slice(&bytes).with_context(|| format!("parse packument: {}", url.as_str()))
    }

    /// Latest version, its publish timestamp and repository descriptor.
    pub fn latest(&self, package_name: &str) -> Result<PackageVersionInfo> {
        let doc = self.fetch_packument(package_name)?;
        let latest = doc
            .latest_version()
            .with_context(|| format!("{package_name}: packument has no dist-tags.latest"))?
            .to_string();
        doc.version_info(&latest)
    }

    pub fn version_info(&self, package_name: &str, version: &str) -> Result<PackageVersionInfo> {
        self.fetch_packument(package_name)?.version_info(version)
    }
}

fn packument_relative_path(package_name: &str) -> Result<String> {
    let name = package_name.trim();
    if name.is_empty() {
        anyhow::bail!("package name must be non-empty");
    }
    if !name.is_ascii() {
        anyhow::bail!("package name must be ASCII: got {:?}", name);
    }
    for b in name.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'@' | b'/' => {}
            _ => anyhow::bail!("package name contains invalid characters: {:?}", name),
        }
    }
    match name.strip_prefix('@') {
        Some(scoped) => {
            let Some((scope, sub)) = scoped.split_once('/') else {
                anyhow::bail!("scoped package name must look like @scope/name: {:?}", name);
            };
            if scope.is_empty() || sub.is_empty() || sub.contains('/') {
                anyhow::bail!("scoped package name must look like @scope/name: {:?}", name);
            }
            Ok(format!("@{scope}%2f{sub}"))
        }
        None => {
            if name.contains('/') || name.contains('@') {
                anyhow::bail!("package name contains invalid characters: {:?}", name);
            }
            Ok(name.to_string())
        }
    }
}

/// Downloads `dist.tarball` to `out`, verifying a `sha512-` integrity string when present.
pub fn download_tarball(dist: &Dist, out: &Path) -> Result<()> {
    let url = Url::parse(&dist.tarball)
        .with_context(|| format!("invalid tarball url: {:?}", dist.tarball))?;
    let bytes = fetch_bytes(&url)?;
    if let Some(integrity) = dist.integrity.as_deref() {
        verify_integrity(&bytes, integrity)
            .with_context(|| format!("verify {}", url.as_str()))?;
    }
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir: {}", parent.display()))?;
    }
    std::fs::write(out, &bytes).with_context(|| format!("write: {}", out.display()))?;
    Ok(())
}

/// Checks `bytes` against every `sha512-<base64>` entry of a subresource-integrity string.
///
/// Returns `Ok(false)` when the string carries no sha512 entry and nothing was checked.
pub fn verify_integrity(bytes: &[u8], integrity: &str) -> Result<bool> {
    let mut checked = false;
    for item in integrity.split_whitespace() {
        let Some(expected) = item.strip_prefix("sha512-") else {
            continue;
        };
        let expected = expected.split('?').next().unwrap_or(expected);
        let actual = base64::engine::general_purpose::STANDARD.encode(Sha512::digest(bytes));
        if actual != expected {
            anyhow::bail!("integrity mismatch: expected sha512-{expected} got sha512-{actual}");
        }
        checked = true;
    }
    Ok(checked)
}

fn fetch_bytes(url: &Url) -> Result<Vec<u8>> {
    match url.scheme() {
        "file" => {
            let path = url.to_file_path().map_err(|_| {
                anyhow::anyhow!("file url could not be converted to a path: {:?}", url)
            })?;
            std::fs::read(&path).with_context(|| format!("read {}", path.display()))
        }
        "http" | "https" => {
            tracing::debug!(url = %url, "GET");
            let resp = ureq::get(url.as_str())
                .header("Accept", "application/json")
                .call()
                .map_err(|e| anyhow::anyhow!("http GET {}: {e}", url))?;
            let mut reader = resp.into_body().into_reader();
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).context("read http response")?;
            Ok(buf)
        }
        other => anyhow::bail!("unsupported url scheme {other:?} for {}", url.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_names_are_encoded() {
        assert_eq!(
            packument_relative_path("@babel/types").unwrap(),
            "@babel%2ftypes"
        );
        assert_eq!(packument_relative_path("safe-buffer").unwrap(), "safe-buffer");
        assert!(packument_relative_path("@babel").is_err());
        assert!(packument_relative_path("a/b").is_err());
        assert!(packument_relative_path("").is_err());
        assert!(packument_relative_path("bad name").is_err());
    }

    #[test]
    fn registry_url_must_end_with_slash() {
        assert!(RegistryClient::from_url("https://registry.npmjs.org").is_err());
        assert!(RegistryClient::from_url("https://host/npm").is_err());
        assert!(RegistryClient::from_url(" https://host/npm/ ").is_ok());
        let client = RegistryClient::from_url(DEFAULT_REGISTRY_URL).unwrap();
        assert_eq!(
            client.packument_url("@types/node").unwrap().as_str(),
            "https://registry.npmjs.org/@types%2fnode"
        );
    }

    #[test]
    fn integrity_is_checked_only_for_sha512() {
        let bytes = b"hello";
        let good = format!(
            "sha512-{}",
            base64::engine::general_purpose::STANDARD.encode(Sha512::digest(bytes))
        );
        assert!(verify_integrity(bytes, &good).unwrap());
        assert!(!verify_integrity(bytes, "sha1-abcdef").unwrap());
        assert!(verify_integrity(b"other", &good).is_err());
    }

    #[test]
    fn packument_version_info_falls_back_to_top_level_repository() {
        let doc: Packument = serde_json::from_str(
            r#"{
              "name": "safe-buffer",
              "dist-tags": {"latest": "5.2.1"},
              "time": {"5.2.1": "2020-05-10T16:37:30.776Z"},
              "repository": {"type": "git", "url": "git://github.com/feross/safe-buffer.git"},
              "versions": {
                "5.2.1": {
                  "version": "5.2.1",
                  "dist": {"tarball": "https://registry.npmjs.org/safe-buffer/-/safe-buffer-5.2.1.tgz"}
                }
              }
            }"#,
        )
        .unwrap();
        let info = doc.version_info(doc.latest_version().unwrap()).unwrap();
        assert_eq!(info.published_at.as_deref(), Some("2020-05-10T16:37:30.776Z"));
        assert_eq!(
            info.git_repository().unwrap().url,
            "https://github.com/feross/safe-buffer.git"
        );
        assert!(doc.version_info("9.9.9").is_err());
    }
}
