//! Deterministic layer tarballs
//!
//! Entries are written in sorted path order with zeroed mtimes and owners and
//! normalized modes, so identical trees always produce identical bytes (and
//! therefore identical diff_ids and digests).

use crate::error::{KilnError, KilnResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tar::{EntryType, Header};
use tracing::debug;

/// Incremental builder for an uncompressed layer tarball
pub struct LayerArchive {
    builder: tar::Builder<Vec<u8>>,
    dirs: BTreeSet<String>,
}

impl LayerArchive {
    /// Create an empty archive
    pub fn new() -> Self {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        Self {
            builder,
            dirs: BTreeSet::new(),
        }
    }

    /// Append a whole directory tree. Paths inside the archive are relative to
    /// `root`, so a scratch tree laid out as `<root>/srv/...` lands at `/srv`.
    pub fn append_tree(&mut self, root: &Path) -> KilnResult<()> {
        for entry in walkdir::WalkDir::new(root)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter()
        {
            let entry = entry.map_err(|e| {
                KilnError::Internal(format!("walking {}: {}", root.display(), e))
            })?;
            let path = entry.path();
            if path == root {
                continue;
            }
            let rel = path
                .strip_prefix(root)
                .map_err(|e| KilnError::Internal(e.to_string()))?;
            let rel_path = normalize_archive_path(rel)?;

            let metadata = fs::symlink_metadata(path)
                .map_err(|e| KilnError::io(format!("reading {}", path.display()), e))?;
            let file_type = metadata.file_type();

            if file_type.is_dir() {
                self.append_dir(&rel_path)?;
            } else if file_type.is_file() {
                let mode = if metadata.permissions().mode() & 0o111 != 0 {
                    0o755
                } else {
                    0o644
                };
                let mut header = base_header(EntryType::Regular, mode);
                header.set_size(metadata.len());
                let file = File::open(path)
                    .map_err(|e| KilnError::io(format!("opening {}", path.display()), e))?;
                self.builder
                    .append_data(&mut header, &rel_path, file)
                    .map_err(|e| KilnError::io(format!("archiving {}", rel_path), e))?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(path)
                    .map_err(|e| KilnError::io(format!("reading link {}", path.display()), e))?;
                let mut header = base_header(EntryType::Symlink, 0o777);
                header.set_size(0);
                self.builder
                    .append_link(&mut header, &rel_path, &target)
                    .map_err(|e| KilnError::io(format!("archiving link {}", rel_path), e))?;
            } else {
                debug!(path = %path.display(), "skipping special file");
            }
        }
        Ok(())
    }

    /// Append a regular file from memory, creating parent directory entries
    pub fn append_file(&mut self, path: &str, data: &[u8], mode: u32) -> KilnResult<()> {
        let path = path.trim_start_matches('/');
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.append_parents(parent)?;
        }
        let mut header = base_header(EntryType::Regular, mode);
        header.set_size(data.len() as u64);
        self.builder
            .append_data(&mut header, path, data)
            .map_err(|e| KilnError::io(format!("archiving {}", path), e))
    }

    fn append_parents(&mut self, dir: &str) -> KilnResult<()> {
        let mut current = String::new();
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            let owned = current.clone();
            self.append_dir(&owned)?;
        }
        Ok(())
    }

    fn append_dir(&mut self, path: &str) -> KilnResult<()> {
        if !self.dirs.insert(path.to_string()) {
            return Ok(());
        }
        let mut header = base_header(EntryType::Directory, 0o755);
        header.set_size(0);
        self.builder
            .append_data(&mut header, format!("{}/", path), std::io::empty())
            .map_err(|e| KilnError::io(format!("archiving {}", path), e))
    }

    /// Finish the archive and return the uncompressed tar bytes
    pub fn finish(self) -> KilnResult<Vec<u8>> {
        self.builder
            .into_inner()
            .map_err(|e| KilnError::io("finishing layer archive", e))
    }
}

impl Default for LayerArchive {
    fn default() -> Self {
        Self::new()
    }
}

fn base_header(entry_type: EntryType, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn normalize_archive_path(rel: &Path) -> KilnResult<String> {
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() || parts.iter().any(|p| p == "..") {
        return Err(KilnError::Internal(format!(
            "invalid archive path: {}",
            rel.display()
        )));
    }
    Ok(parts.join("/"))
}

/// Gzip-compress tar bytes. The gzip header carries no timestamp.
pub fn compress(tar_bytes: &[u8]) -> KilnResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(tar_bytes)
        .map_err(|e| KilnError::io("compressing layer", e))?;
    encoder
        .finish()
        .map_err(|e| KilnError::io("compressing layer", e))
}

/// Decompress a gzip layer blob
pub fn decompress(blob: &[u8]) -> KilnResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(blob);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| KilnError::io("decompressing layer", e))?;
    Ok(out)
}

/// List entry paths of an uncompressed tarball, in archive order
pub fn entry_paths(tar_bytes: &[u8]) -> KilnResult<Vec<String>> {
    let mut archive = tar::Archive::new(tar_bytes);
    let mut paths = Vec::new();
    for entry in archive
        .entries()
        .map_err(|e| KilnError::io("reading layer archive", e))?
    {
        let entry = entry.map_err(|e| KilnError::io("reading layer entry", e))?;
        let path = entry
            .path()
            .map_err(|e| KilnError::io("reading layer entry path", e))?;
        paths.push(path.to_string_lossy().trim_end_matches('/').to_string());
    }
    Ok(paths)
}
