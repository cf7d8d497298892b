//! Ordered guesses for where a package lives inside its repository and which git tag
//! marks its release. Each list is evaluated left to right and the first hit wins.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::manifest::MANIFEST_FILE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageName {
    full: String,
    scope: Option<String>,
    sub: String,
}

impl PackageName {
    /// Splits `@scope/name`; anything else is an unscoped name.
    pub fn parse(name: &str) -> Self {
        let full = name.trim().to_string();
        if let Some(rest) = full.strip_prefix('@') {
            if let Some((scope, sub)) = rest.split_once('/') {
                if !scope.is_empty() && !sub.is_empty() {
                    return Self {
                        scope: Some(scope.to_string()),
                        sub: sub.to_string(),
                        full,
                    };
                }
            }
        }
        Self {
            sub: full.clone(),
            scope: None,
            full,
        }
    }

    pub fn full(&self) -> &str {
        &self.full
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// The name without its scope (`types` for `@babel/types`).
    pub fn sub(&self) -> &str {
        &self.sub
    }

    pub fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }

    /// `@types/*` packages, which are generated from a single upstream repository.
    pub fn is_type_definitions(&self) -> bool {
        self.scope.as_deref() == Some("types")
    }

    /// File-name form used by package managers for tarballs (`babel-types`).
    pub fn file_stem(&self) -> String {
        match &self.scope {
            Some(scope) => format!("{scope}-{}", self.sub),
            None => self.sub.clone(),
        }
    }
}

/// Candidate package roots relative to the repository root, highest priority first.
///
/// A declared `repository.directory` hint leads, then the bare name and `packages/<name>`;
/// scoped names widen to the unscoped name and the hyphen-joined `<scope>-<name>` form
/// (`packages/babel-types` for `@babel/types`).
pub fn subdirectory_candidates(name: &PackageName, hint: Option<&str>) -> Vec<PathBuf> {
    let mut out: Vec<String> = Vec::new();
    if let Some(hint) = hint.and_then(normalize_hint) {
        out.push(hint);
    }
    if name.is_type_definitions() {
        out.push(format!("types/{}", name.sub()));
    }
    out.push(name.full().to_string());
    out.push(format!("packages/{}", name.full()));
    if let Some(scope) = name.scope() {
        let sub = name.sub();
        out.push(sub.to_string());
        out.push(format!("packages/{sub}"));
        out.push(format!("{scope}-{sub}"));
        out.push(format!("packages/{scope}-{sub}"));
    }
    dedup_preserving_order(out)
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

/// `None` when the hint names the repository root (`""`, `"."`, `"./"`).
fn normalize_hint(hint: &str) -> Option<String> {
    let parts: Vec<&str> = hint
        .trim()
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// First candidate directory (relative to `repo_root`) that contains a manifest.
pub fn locate_subdirectory(repo_root: &Path, candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates
        .iter()
        .find(|rel| repo_root.join(rel).join(MANIFEST_FILE).is_file())
        .cloned()
}

/// Candidate git tag names for `version`, highest priority first.
///
/// For scoped names the unscoped variants come before the full-name variants.
pub fn tag_candidates(name: &PackageName, version: &str) -> Vec<String> {
    let version = version.trim();
    let mut out = vec![version.to_string(), format!("v{version}")];
    let mut names = vec![name.sub()];
    if name.is_scoped() {
        names.push(name.full());
    }
    for n in names {
        out.push(format!("{n}-{version}"));
        out.push(format!("{n}-v{version}"));
        out.push(format!("{n}@{version}"));
        out.push(format!("{n}/{version}"));
    }
    dedup_preserving_order(out)
}

pub fn first_matching_tag<'a>(candidates: &'a [String], tags: &BTreeSet<String>) -> Option<&'a str> {
    candidates
        .iter()
        .find(|c| tags.contains(c.as_str()))
        .map(String::as_str)
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    items
        .into_iter()
        .filter(|s| seen.insert(s.clone()))
        .collect()
}
