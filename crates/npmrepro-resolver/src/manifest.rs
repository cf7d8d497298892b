use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

pub const MANIFEST_FILE: &str = "package.json";

/// Marker package / config key of the post-processing tool that strips dev-only fields
/// before publishing.
pub const CLEAN_PUBLISH: &str = "clean-publish";

/// The subset of `package.json` the resolver inspects.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, Value>,
    #[serde(default, rename = "devDependencies")]
    pub dev_dependencies: BTreeMap<String, Value>,
    #[serde(default, rename = "clean-publish")]
    pub clean_publish: Option<Value>,
}

impl Manifest {
    pub fn has_script(&self, script: &str) -> bool {
        self.scripts
            .get(script)
            .and_then(Value::as_str)
            .is_some_and(|s| !s.trim().is_empty())
    }

    pub fn uses_clean_publish(&self) -> bool {
        self.dev_dependencies.contains_key(CLEAN_PUBLISH) || self.clean_publish.is_some()
    }
}

/// Reads `<dir>/package.json`; `Ok(None)` when the directory has no manifest.
pub fn read_manifest(dir: &Path) -> Result<Option<Manifest>> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let manifest =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(manifest))
}
