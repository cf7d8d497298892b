use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use npmrepro_contracts::KNOWN_MISMATCHES_SCHEMA_VERSION;
use serde::{Deserialize, Serialize};

/// Versions whose published archive is known to differ from any rebuild, for reasons
/// unrelated to tampering.
const BUILTIN: &[(&str, &[&str])] = &[("safe-buffer", &["5.2.1"])];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownMismatches {
    #[serde(default)]
    packages: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Deserialize)]
struct KnownMismatchesFile {
    schema_version: String,
    #[serde(default)]
    packages: BTreeMap<String, Vec<String>>,
}

impl KnownMismatches {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut out = Self::empty();
        for (name, versions) in BUILTIN {
            for version in *versions {
                out.insert(name, version);
            }
        }
        out
    }

    /// Built-in entries plus those from `path`, if given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut out = Self::builtin();
        if let Some(path) = path {
            out.merge_file(path)?;
        }
        Ok(out)
    }

    pub fn merge_file(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let doc: KnownMismatchesFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {}", path.display()))?;
        if doc.schema_version != KNOWN_MISMATCHES_SCHEMA_VERSION {
            bail!(
                "{}: unsupported schema_version {:?} (expected {KNOWN_MISMATCHES_SCHEMA_VERSION:?})",
                path.display(),
                doc.schema_version
            );
        }
        for (name, versions) in doc.packages {
            for version in versions {
                self.insert(&name, &version);
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, name: &str, version: &str) {
        self.packages
            .entry(name.trim().to_ascii_lowercase())
            .or_default()
            .insert(version.trim().to_string());
    }

    pub fn contains(&self, name: &str, version: &str) -> bool {
        self.packages
            .get(&name.trim().to_ascii_lowercase())
            .is_some_and(|versions| versions.contains(version.trim()))
    }

    pub fn len(&self) -> usize {
        self.packages.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
