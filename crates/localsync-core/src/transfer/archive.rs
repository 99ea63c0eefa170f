//! Folder archiving for transfers.
//!
//! Directory trees travel as a single tar stream so the streaming engine
//! only ever handles one file. The tree is packed into a temporary archive
//! before sending (preserving relative paths under the top-level folder
//! name) and unpacked into the download directory after the stream has been
//! verified. Item counts are computed up front so the receiving side can
//! show them on the acceptance prompt.
//!
//! The tar crate does blocking I/O, so packing and unpacking run on the
//! blocking thread pool.

use std::path::{Component, Path, PathBuf};

use tempfile::TempPath;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::protocol::ItemCount;

/// Count files and folders under a directory tree.
///
/// # Errors
///
/// Returns an error if the directory cannot be walked.
pub fn count_items(path: &Path) -> Result<ItemCount> {
    let mut files = 0;
    let mut folders = 0;

    for entry in WalkDir::new(path).min_depth(1) {
        let entry = entry.map_err(|e| Error::InvalidPath(format!("walk failed: {e}")))?;
        if entry.file_type().is_dir() {
            folders += 1;
        } else {
            files += 1;
        }
    }

    Ok(ItemCount { files, folders })
}

/// Pack a directory into a temporary tar archive.
///
/// Returns the temporary archive path (deleted on drop) and the top-level
/// folder name preserved inside the archive.
///
/// # Errors
///
/// Returns an error if the path is not a directory or archiving fails.
pub async fn pack_directory(path: &Path) -> Result<(TempPath, String)> {
    if !path.is_dir() {
        return Err(Error::InvalidPath(format!(
            "not a directory: {}",
            path.display()
        )));
    }

    let folder_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| Error::InvalidPath(format!("no folder name in {}", path.display())))?;

    let source = path.to_path_buf();
    let archive_name = folder_name.clone();

    let temp_path = tokio::task::spawn_blocking(move || -> Result<TempPath> {
        let temp_file = tempfile::NamedTempFile::new()?;
        {
            let mut builder = tar::Builder::new(temp_file.as_file());
            builder.append_dir_all(&archive_name, &source)?;
            builder.finish()?;
        }
        Ok(temp_file.into_temp_path())
    })
    .await
    .map_err(|e| Error::Internal(format!("archive task failed: {e}")))??;

    Ok((temp_path, folder_name))
}

/// Unpack a received tar archive into the destination directory.
///
/// Entries containing parent-directory components are rejected before any
/// extraction happens, so a hostile archive cannot write outside `dest_dir`.
///
/// # Errors
///
/// Returns an error if the archive is malformed, contains escaping paths,
/// or extraction fails.
pub async fn unpack_archive(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let archive_path = archive_path.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&archive_path)?;
        let mut archive = tar::Archive::new(file);
        archive.set_overwrite(true);

        for entry in archive.entries()? {
            let mut entry = entry?;

            let entry_type = entry.header().entry_type();
            if entry_type.is_block_special() || entry_type.is_character_special() {
                // Device nodes have no business inside a file transfer
                continue;
            }

            let rel = entry.path()?.to_path_buf();
            if rel.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(Error::InvalidPath(format!(
                    "archive entry escapes destination: {}",
                    rel.display()
                )));
            }

            entry.unpack_in(&dest_dir)?;
        }

        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(format!("unpack task failed: {e}")))?
}

/// Destination path for a folder's unpacked root inside the download dir.
#[must_use]
pub fn unpacked_root(dest_dir: &Path, folder_name: &str) -> PathBuf {
    dest_dir.join(folder_name)
}
