use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Extracts a gzip-compressed tarball (the registry's `.tgz` format) into `out_dir`.
///
/// Only regular files and directories are materialized; links and device entries are
/// skipped. Absolute paths and `..` components are rejected.
pub fn extract_tgz(path: &Path, out_dir: &Path) -> Result<()> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let gz = GzDecoder::new(f);
    let mut ar = tar::Archive::new(gz);
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("create dest dir: {}", out_dir.display()))?;
    for entry in ar.entries().context("read tar entries")? {
        let mut entry = entry.context("read tar entry")?;
        let entry_path = entry.path().context("read tar entry path")?.into_owned();
        let rel = sanitize_rel_path(&entry_path)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out_path = out_dir.join(&rel);
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            std::fs::create_dir_all(&out_path)
                .with_context(|| format!("create dir: {}", out_path.display()))?;
            continue;
        }
        if !entry_type.is_file() {
            tracing::debug!(path = %entry_path.display(), "skipping non-file tar entry");
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir: {}", parent.display()))?;
        }
        entry
            .unpack(&out_path)
            .with_context(|| format!("unpack {}", out_path.display()))?;
    }
    Ok(())
}

/// Packs every regular file under `src_dir` into a deterministic `.tgz` whose entries
/// all live under `top_level/`, the layout package managers produce.
pub fn pack_dir_tgz(src_dir: &Path, top_level: &str, out: &Path) -> Result<()> {
    if !src_dir.is_dir() {
        bail!("pack source is not a directory: {}", src_dir.display());
    }
    let mut files = Vec::new();
    collect_files(src_dir, Path::new(""), &mut files)?;
    files.sort_by(|a, b| {
        a.as_os_str()
            .as_encoded_bytes()
            .cmp(b.as_os_str().as_encoded_bytes())
    });

    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir: {}", parent.display()))?;
    }
    let f = File::create(out).with_context(|| format!("create {}", out.display()))?;
    let gz = GzEncoder::new(BufWriter::new(f), Compression::default());
    let mut builder = tar::Builder::new(gz);
    builder.mode(tar::HeaderMode::Deterministic);
    for rel in &files {
        let bytes = std::fs::read(src_dir.join(rel))
            .with_context(|| format!("read {}", src_dir.join(rel).display()))?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        let entry_path = Path::new(top_level).join(rel);
        builder
            .append_data(&mut header, &entry_path, std::io::Cursor::new(bytes))
            .with_context(|| format!("append tar entry: {}", entry_path.display()))?;
    }
    let gz = builder.into_inner().context("finish tar")?;
    let mut w = gz.finish().context("finish gzip")?;
    w.flush().context("flush archive")?;
    Ok(())
}

fn collect_files(root: &Path, rel: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let dir = root.join(rel);
    for entry in std::fs::read_dir(&dir).with_context(|| format!("read_dir {}", dir.display()))? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let child = rel.join(entry.file_name());
        if ty.is_dir() {
            collect_files(root, &child, out)?;
        } else if ty.is_file() {
            out.push(child);
        }
    }
    Ok(())
}

fn sanitize_rel_path(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(_) | Component::RootDir => {
                bail!("invalid archive path (absolute): {}", path.display())
            }
            Component::ParentDir => bail!("invalid archive path (..): {}", path.display()),
            Component::CurDir => {}
            Component::Normal(p) => out.push(p),
        }
    }
    Ok(out)
}
