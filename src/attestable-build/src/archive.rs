// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! Tar packing and unpacking for source, vendor and output archives.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tar::{Archive, Builder, HeaderMode};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("could not pack {path:?} into {archive:?}")]
    Pack {
        path: PathBuf,
        archive: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not unpack {archive:?} into {dest:?}")]
    Unpack {
        archive: PathBuf,
        dest: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive task panicked")]
    Join(#[from] tokio::task::JoinError),
}

/// Pack every entry under `root` into `archive`, skipping the root-relative
/// paths in `exclude`.
pub fn pack_dir(root: &Path, archive: &Path, exclude: &[PathBuf]) -> Result<(), ArchiveError> {
    let pack_err = |path: &Path, source| ArchiveError::Pack {
        path: path.to_path_buf(),
        archive: archive.to_path_buf(),
        source,
    };

    let file = File::create(archive).map_err(|e| pack_err(root, e))?;
    let mut builder = Builder::new(BufWriter::new(file));
    builder.follow_symlinks(false);

    let mut entries = Vec::new();
    collect_entries(root, Path::new(""), exclude, &mut entries).map_err(|e| pack_err(root, e))?;
    entries.sort();

    for relative in &entries {
        let full = root.join(relative);
        builder
            .append_path_with_name(&full, relative)
            .map_err(|e| pack_err(&full, e))?;
    }

    finish(builder).map_err(|e| pack_err(root, e))?;
    debug!(?archive, entries = entries.len(), "Packed directory");
    Ok(())
}

fn collect_entries(
    root: &Path,
    relative: &Path,
    exclude: &[PathBuf],
    out: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(root.join(relative))? {
        let entry = entry?;
        let path = relative.join(entry.file_name());
        if exclude.iter().any(|skip| skip == &path) {
            continue;
        }
        let is_dir = entry.file_type()?.is_dir();
        out.push(path.clone());
        if is_dir {
            collect_entries(root, &path, exclude, out)?;
        }
    }
    Ok(())
}

/// Pack exactly the given root-relative entries into `archive` with
/// deterministic headers. A directory contributes its own entry only, never
/// its contents.
pub fn pack_entries(root: &Path, entries: &[String], archive: &Path) -> Result<(), ArchiveError> {
    let pack_err = |path: &Path, source| ArchiveError::Pack {
        path: path.to_path_buf(),
        archive: archive.to_path_buf(),
        source,
    };

    let file = File::create(archive).map_err(|e| pack_err(root, e))?;
    let mut builder = Builder::new(BufWriter::new(file));
    builder.mode(HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    for relative in entries {
        let full = root.join(relative);
        let is_dir = std::fs::symlink_metadata(&full)
            .map_err(|e| pack_err(&full, e))?
            .is_dir();
        let result = if is_dir {
            builder.append_dir(relative, &full)
        } else {
            builder.append_path_with_name(&full, relative)
        };
        result.map_err(|e| pack_err(&full, e))?;
    }

    finish(builder).map_err(|e| pack_err(root, e))?;
    debug!(?archive, entries = entries.len(), "Packed entries");
    Ok(())
}

fn finish(builder: Builder<BufWriter<File>>) -> std::io::Result<()> {
    let mut writer = builder.into_inner()?;
    writer.flush()?;
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()
}

/// Unpack `archive` into `dest`, creating it if needed.
pub fn unpack(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let unpack_err = |source| ArchiveError::Unpack {
        archive: archive.to_path_buf(),
        dest: dest.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(dest).map_err(unpack_err)?;
    let file = File::open(archive).map_err(unpack_err)?;
    let mut tar = Archive::new(file);
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);
    tar.unpack(dest).map_err(unpack_err)?;
    debug!(?archive, ?dest, "Unpacked archive");
    Ok(())
}

pub async fn pack_dir_async(root: PathBuf, archive: PathBuf, exclude: Vec<PathBuf>) -> Result<(), ArchiveError> {
    tokio::task::spawn_blocking(move || pack_dir(&root, &archive, &exclude)).await?
}

pub async fn pack_entries_async(root: PathBuf, entries: Vec<String>, archive: PathBuf) -> Result<(), ArchiveError> {
    tokio::task::spawn_blocking(move || pack_entries(&root, &entries, &archive)).await?
}

pub async fn unpack_async(archive: PathBuf, dest: PathBuf) -> Result<(), ArchiveError> {
    tokio::task::spawn_blocking(move || unpack(&archive, &dest)).await?
}

/// Names of every entry in a tar archive, in archive order, without
/// trailing slashes.
pub fn list_entries(archive: &Path) -> std::io::Result<Vec<String>> {
    let mut tar = Archive::new(File::open(archive)?);
    let mut names = Vec::new();
    for entry in tar.entries()? {
        let entry = entry?;
        let name = entry.path()?.to_string_lossy().trim_end_matches('/').to_string();
        names.push(name);
    }
    Ok(names)
}

/// Names of the regular files in a tar archive, in archive order.
pub fn list_files(archive: &Path) -> std::io::Result<Vec<String>> {
    let mut tar = Archive::new(File::open(archive)?);
    let mut names = Vec::new();
    for entry in tar.entries()? {
        let entry = entry?;
        if entry.header().entry_type().is_file() {
            names.push(entry.path()?.to_string_lossy().into_owned());
        }
    }
    Ok(names)
}
