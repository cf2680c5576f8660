//! Tar stream packing and unpacking.
//!
//! [`pack`] walks a local tree and writes one header per entry, with entry
//! names rehomed under a caller-chosen base. [`unpack`] reads a stream
//! sequentially and recreates it under a destination root, rejecting any
//! entry that would land outside the expected prefix.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use tar::{Archive, Builder, EntryType, Header};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum TarError {
    #[error("tar contents corrupted: {0}")]
    Corrupted(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Walk(#[from] walkdir::Error),
}

/// Counts of what [`unpack`] wrote.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnpackStats {
    pub files: u64,
    pub dirs: u64,
    pub links: u64,
    pub bytes: u64,
}

/// Pack `src` (a file or a directory tree) into a tar stream on `writer`.
///
/// Entry names are `dest_base` followed by the path relative to `src`.
/// Empty directories get a header of their own; symbolic links are stored,
/// never followed. Returns the writer once the archive is finished.
pub fn pack<W: Write>(src: &Path, dest_base: &str, writer: W) -> Result<W, TarError> {
    let base = dest_base.trim_matches('/');
    let mut builder = Builder::new(writer);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| TarError::Corrupted(e.to_string()))?;
        let name = if rel.as_os_str().is_empty() {
            PathBuf::from(base)
        } else {
            Path::new(base).join(rel)
        };

        let meta = entry.path().symlink_metadata()?;
        let file_type = meta.file_type();
        let mut header = Header::new_gnu();
        header.set_metadata(&meta);

        if file_type.is_dir() {
            if fs::read_dir(entry.path())?.next().is_none() {
                header.set_size(0);
                builder.append_data(&mut header, &name, io::empty())?;
            }
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            header.set_size(0);
            builder.append_link(&mut header, &name, &target)?;
        } else if file_type.is_file() {
            let file = File::open(entry.path())?;
            builder.append_data(&mut header, &name, file)?;
        } else {
            tracing::debug!(path = %entry.path().display(), "skipping special file");
        }
    }

    Ok(builder.into_inner()?)
}

/// Unpack a tar stream under `dest_root`.
///
/// Every entry name is normalized first (see [`normalize_entry_name`]) and
/// must equal `prefix` or live below it. The first entry that does not is
/// reported as [`TarError::Corrupted`] and nothing is written for it. The
/// reader is drained to end of stream after the last entry.
pub fn unpack<R: Read>(reader: R, dest_root: &Path, prefix: &str) -> Result<UnpackStats, TarError> {
    let prefix = normalize_entry_name(prefix);
    fs::create_dir_all(dest_root)?;
    let root = dest_root.canonicalize()?;
    let mut stats = UnpackStats::default();

    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let name = normalize_entry_name(&raw);

        if name.is_empty() || !within_prefix(&name, &prefix) {
            return Err(TarError::Corrupted(format!(
                "entry `{raw}` is outside `{prefix}`"
            )));
        }
        let dest = root.join(&name);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&dest)?;
                confine(&root, &dest, &raw)?;
                stats.dirs += 1;
            }
            EntryType::Symlink => {
                let link = entry
                    .link_name()?
                    .ok_or_else(|| TarError::Corrupted(format!("symlink `{raw}` has no target")))?
                    .into_owned();
                prepare_parent(&root, &dest, &raw)?;
                replace_existing(&dest)?;
                make_symlink(&link, &dest)?;
                stats.links += 1;
            }
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                prepare_parent(&root, &dest, &raw)?;
                replace_existing(&dest)?;
                let mut out = File::create(&dest)?;
                stats.bytes += io::copy(&mut entry, &mut out)?;
                out.flush()?;
                stats.files += 1;
            }
            other => {
                tracing::debug!(entry = %raw, kind = ?other, "skipping unsupported tar entry");
            }
        }
    }

    let mut rest = archive.into_inner();
    io::copy(&mut rest, &mut io::sink())?;
    Ok(stats)
}

/// Normalize an entry name: collapse `.`/`..` and repeated separators, then
/// drop any leading `../` sequences and the leading `/`.
///
/// The result never contains a `..` component.
pub fn normalize_entry_name(name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                // Popping past the start is the leading-`../` case; drop it.
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn within_prefix(name: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || name == prefix
        || name
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Create the parent of `dest` and check it resolves inside `root`.
fn prepare_parent(root: &Path, dest: &Path, raw: &str) -> Result<(), TarError> {
    let parent = dest.parent().unwrap_or(root);
    fs::create_dir_all(parent)?;
    confine(root, parent, raw)
}

/// Reject `path` when symlinks already on disk send it outside `root`.
fn confine(root: &Path, path: &Path, raw: &str) -> Result<(), TarError> {
    let resolved = path.canonicalize()?;
    if resolved.starts_with(root) && !has_parent_component(path) {
        Ok(())
    } else {
        Err(TarError::Corrupted(format!(
            "entry `{raw}` resolves outside the destination"
        )))
    }
}

fn has_parent_component(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

/// Remove a file or link at `dest` so the new entry replaces it without
/// writing through an old symlink.
fn replace_existing(dest: &Path) -> io::Result<()> {
    match dest.symlink_metadata() {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => fs::remove_file(dest),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn make_symlink(link: &Path, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, dest)
}

#[cfg(not(unix))]
fn make_symlink(link: &Path, dest: &Path) -> io::Result<()> {
    tracing::warn!(
        link = %link.display(),
        dest = %dest.display(),
        "symlinks are not supported on this platform, skipping"
    );
    Ok(())
}
