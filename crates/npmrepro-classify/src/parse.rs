//! Turns `diff -r -u` text into normalized change records.
//!
//! "Only in" notices are not patch syntax, so they are pulled out first; what remains is
//! read as a unified patch, one record per file header pair. Hunk bodies are skipped by
//! their line counts so content lines that look like headers are never misread.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    /// Present only in the published artifact.
    Added,
    /// Present only in the built artifact.
    Removed,
    Modified,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::Modified => "modified",
        }
    }
}

/// One differing path, rooted at the stripped top-level directory (`/lib/index.js`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub path: String,
}

impl ChangeRecord {
    pub fn new(kind: ChangeKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    /// Last path component (`tsconfig.tsbuildinfo` for `/lib/tsconfig.tsbuildinfo`).
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

const ONLY_IN: &str = "Only in ";
const BINARY_FILES: &str = "Binary files ";

pub fn parse_diff(text: &str, built_root: &Path, published_root: &Path) -> Vec<ChangeRecord> {
    let roots = Roots::new(built_root, published_root);
    let mut out = Vec::new();
    let mut patch_lines = Vec::new();

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix(ONLY_IN) {
            if let Some(record) = roots.only_in(rest) {
                out.push(record);
            }
        } else {
            patch_lines.push(line);
        }
    }
    out.extend(parse_patch(&patch_lines, &roots));

    let mut seen = BTreeSet::new();
    out.retain(|r| seen.insert(r.clone()));
    out
}

fn parse_patch(lines: &[&str], roots: &Roots) -> Vec<ChangeRecord> {
    let mut out = Vec::new();
    let mut old_left = 0usize;
    let mut new_left = 0usize;
    let mut pending_old: Option<&str> = None;

    for &line in lines {
        if old_left > 0 || new_left > 0 {
            match line.as_bytes().first() {
                Some(b'-') => old_left = old_left.saturating_sub(1),
                Some(b'+') => new_left = new_left.saturating_sub(1),
                Some(b'\\') => {}
                _ => {
                    old_left = old_left.saturating_sub(1);
                    new_left = new_left.saturating_sub(1);
                }
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("--- ") {
            pending_old = Some(header_path(rest));
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            let path = roots
                .relative(header_path(rest))
                .or_else(|| pending_old.take().and_then(|p| roots.relative(p)));
            pending_old = None;
            if let Some(path) = path {
                out.push(ChangeRecord::new(ChangeKind::Modified, path));
            }
        } else if let Some((old, new)) = parse_hunk_header(line) {
            old_left = old;
            new_left = new;
        } else if let Some(rest) = line.strip_prefix(BINARY_FILES) {
            if let Some(path) = roots.binary_files(rest) {
                out.push(ChangeRecord::new(ChangeKind::Modified, path));
            }
        } else if let Some(path) = roots.type_conflict(line) {
            out.push(ChangeRecord::new(ChangeKind::Modified, path));
        }
    }
    out
}

/// Strips the tab-separated timestamp from a `---`/`+++` header.
fn header_path(rest: &str) -> &str {
    rest.split('\t').next().unwrap_or(rest).trim_end()
}

/// `@@ -l[,s] +l[,s] @@` -> (old line count, new line count).
fn parse_hunk_header(line: &str) -> Option<(usize, usize)> {
    let rest = line.strip_prefix("@@ -")?;
    let (ranges, _) = rest.split_once(" @@")?;
    let (old, new) = ranges.split_once(" +")?;
    Some((range_len(old)?, range_len(new)?))
}

fn range_len(range: &str) -> Option<usize> {
    match range.split_once(',') {
        Some((_, len)) => len.parse().ok(),
        None => range.parse::<usize>().ok().map(|_| 1),
    }
}

struct Roots {
    built: String,
    published: String,
}

impl Roots {
    fn new(built: &Path, published: &Path) -> Self {
        Self {
            built: built.to_string_lossy().trim_end_matches('/').to_string(),
            published: published.to_string_lossy().trim_end_matches('/').to_string(),
        }
    }

    /// Side the absolute path belongs to plus the path rooted at that side.
    fn locate(&self, path: &str) -> Option<(ChangeKind, String)> {
        // Longer root first so nested roots cannot shadow each other.
        let mut sides = [
            (ChangeKind::Removed, self.built.as_str()),
            (ChangeKind::Added, self.published.as_str()),
        ];
        sides.sort_by_key(|(_, root)| std::cmp::Reverse(root.len()));
        for (kind, root) in sides {
            if let Some(rest) = path.strip_prefix(root) {
                if rest.is_empty() || rest.starts_with('/') {
                    let rel = rest.trim_start_matches('/');
                    return Some((kind, format!("/{rel}")));
                }
            }
        }
        None
    }

    fn relative(&self, path: &str) -> Option<String> {
        self.locate(path).map(|(_, rel)| rel)
    }

    /// `Only in <dir>: <name>`
    fn only_in(&self, rest: &str) -> Option<ChangeRecord> {
        let (dir, name) = rest.split_once(": ")?;
        let (kind, rel_dir) = self.locate(dir)?;
        let path = if rel_dir == "/" {
            format!("/{name}")
        } else {
            format!("{rel_dir}/{name}")
        };
        Some(ChangeRecord::new(kind, path))
    }

    /// `Binary files <a> and <b> differ`
    fn binary_files(&self, rest: &str) -> Option<String> {
        let rest = rest.strip_suffix(" differ")?;
        let marker = format!(" and {}", self.published);
        let built_path = match rest.find(&marker) {
            Some(i) => &rest[..i],
            None => rest.split_once(" and ")?.0,
        };
        self.relative(built_path)
    }

    /// `File <a> is a directory while file <b> is a regular file`
    fn type_conflict(&self, line: &str) -> Option<String> {
        let rest = line.strip_prefix("File ")?;
        let (path, _) = rest.split_once(" is a ")?;
        if !line.contains(" while file ") {
            return None;
        }
        self.relative(path)
    }
}
