//! Deterministic ZIP output
//!
//! The same files always produce the same bytes: entries are sorted by name and
//! every entry gets the same timestamp (1980-01-01 00:00:00), the same
//! permission bits (regular file, 0644) and Deflate compression.

use std::io::{Cursor, Seek, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::error::{Error, Result};

/// Permission bits for every entry
const ENTRY_PERMISSIONS: u32 = 0o644;

/// Characters not allowed in archive file names
const FORBIDDEN_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// One downloaded file ready for archiving
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Entry name inside the archive
    pub name: String,
    /// File contents
    pub data: Vec<u8>,
}

fn entry_options() -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(ENTRY_PERMISSIONS)
}

/// Write `entries` as a ZIP archive, sorted by name
pub fn write_archive_to<W: Write + Seek>(writer: W, mut entries: Vec<ArchiveEntry>) -> Result<W> {
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut zip = ZipWriter::new(writer);
    for entry in &entries {
        zip.start_file(entry.name.as_str(), entry_options())?;
        zip.write_all(&entry.data)?;
        debug!(name = %entry.name, bytes = entry.data.len(), "Archived entry");
    }
    Ok(zip.finish()?)
}

/// Write `entries` as an in-memory ZIP archive
pub fn write_archive(entries: Vec<ArchiveEntry>) -> Result<Vec<u8>> {
    Ok(write_archive_to(Cursor::new(Vec::new()), entries)?.into_inner())
}

/// Write archive bytes to `path` atomically
///
/// The bytes go to a sibling `.part` file first, which is renamed into place,
/// so an interrupted write never leaves a truncated archive under `path`.
pub async fn save_archive(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(path)?;
    if let Err(e) = tokio::fs::write(&partial, bytes).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e.into());
    }
    tokio::fs::rename(&partial, path).await?;
    info!(path = ?path, bytes = bytes.len(), "Archive saved");
    Ok(())
}

fn partial_path(path: &Path) -> Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        Error::Io(std::io::Error::other(format!(
            "archive path {} has no file name",
            path.display()
        )))
    })?;
    let mut partial = name.to_os_string();
    partial.push(".part");
    Ok(path.with_file_name(partial))
}

/// File name for an item's archive: unsafe characters become spaces,
/// whitespace runs collapse, and `.zip` is appended
pub fn archive_file_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| {
            if FORBIDDEN_CHARS.contains(&c) || c.is_control() {
                ' '
            } else {
                c
            }
        })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        "untitled.zip".to_string()
    } else {
        format!("{collapsed}.zip")
    }
}
