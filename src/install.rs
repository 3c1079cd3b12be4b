//! Applying a package's data tar onto the target filesystem.
//!
//! Entries are applied in archive order with their recorded mode, owner,
//! mtime and PAX xattrs. A destination that is already owned by another
//! installed package aborts the install unless one of the escape hatches
//! holds: same origin, the prior package is listed in the new package's
//! `replaces`, or the bytes are identical. Device-node creation failures
//! can be downgraded to warnings for backends without mknod.

use std::io::{self, Read};

use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::db::{FileRecord, InstalledDb};
use crate::engine::CancelToken;
use crate::expand::pax_xattrs;
use crate::fs::{NodeKind, RootFs};
use crate::index::Package;

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("package {package} control checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        package: String,
        expected: String,
        actual: String,
    },

    #[error("unsafe path {0:?} in package archive")]
    UnsafePath(String),

    #[error(
        "file {path} already provided by package {prior} (origin {prior_origin}), \
         refusing overwrite from {package}"
    )]
    OverlapConflict {
        path: String,
        prior: String,
        prior_origin: String,
        package: String,
    },

    #[error("operation cancelled")]
    Cancelled,
}

/// Policy switches for one apply pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    /// Downgrade device-node creation failures to warnings.
    pub ignore_mknod_errors: bool,
}

/// Apply a package's decompressed data tar onto `fs`, checking overlaps
/// against `db`. Returns the file records to register for the package.
///
/// The records are not added to `db` here; the caller owns that step so a
/// failed apply leaves the database untouched.
pub fn apply_package_data<R: Read>(
    fs: &dyn RootFs,
    db: &InstalledDb,
    pkg: &Package,
    data_tar: R,
    opts: InstallOptions,
    cancel: &CancelToken,
) -> Result<Vec<FileRecord>, InstallError> {
    let mut archive = tar::Archive::new(data_tar);
    let mut records: Vec<FileRecord> = Vec::new();

    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        let mut entry = entry?;
        let raw_path = entry.path()?.to_string_lossy().into_owned();
        let Some(path) = normalize_entry_path(&raw_path)? else {
            continue;
        };

        let header = entry.header();
        let mode = header.mode()? & 0o7777;
        let uid = header.uid()? as u32;
        let gid = header.gid()? as u32;
        let mtime = header.mtime()? as i64;
        let kind = header.entry_type();
        let link_target = entry
            .link_name()?
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let device = (
            header.device_major().ok().flatten().unwrap_or(0),
            header.device_minor().ok().flatten().unwrap_or(0),
        );
        let xattrs = pax_xattrs(&mut entry)?;

        let mut record = FileRecord {
            path: path.clone(),
            dir: false,
            mode,
            uid,
            gid,
            size: 0,
            checksum: Vec::new(),
            link_target: link_target.clone(),
            xattrs: xattrs.clone(),
        };

        match kind {
            tar::EntryType::Directory => {
                apply_directory(fs, &path, mode, uid, gid, mtime)?;
                record.dir = true;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut data)?;
                check_overlap(fs, db, pkg, &path, &data)?;

                fs.write_file(&path, &data, mode)?;
                fs.chown(&path, uid, gid)?;
                fs.set_mtime(&path, mtime)?;
                record.size = data.len() as u64;
                record.checksum = Sha1::digest(&data).to_vec();
            }
            tar::EntryType::Symlink => {
                if fs.exists(&path) {
                    fs.remove(&path)?;
                }
                fs.symlink(&link_target, &path)?;
            }
            tar::EntryType::Link => {
                let Some(target) = normalize_entry_path(&link_target)? else {
                    continue;
                };
                if fs.exists(&path) {
                    fs.remove(&path)?;
                }
                fs.hardlink(&target, &path)?;
                record.link_target = target;
            }
            tar::EntryType::Char | tar::EntryType::Block | tar::EntryType::Fifo => {
                let node_kind = match kind {
                    tar::EntryType::Char => NodeKind::CharDevice,
                    tar::EntryType::Block => NodeKind::BlockDevice,
                    _ => NodeKind::Fifo,
                };
                match fs.mknod(&path, node_kind, mode, device.0, device.1) {
                    Ok(()) => {}
                    Err(e) if opts.ignore_mknod_errors => {
                        tracing::warn!(path = %path, error = %e, "ignoring mknod failure");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            other => {
                tracing::debug!(path = %path, kind = ?other, "skipping unsupported tar entry type");
                continue;
            }
        }

        for (name, value) in &xattrs {
            fs.set_xattr(&path, name, value)?;
        }
        records.push(record);
    }

    Ok(records)
}

/// Directories are created with the recorded mode; when one already exists
/// with a different mode the stricter (fewer permission bits) wins.
fn apply_directory(
    fs: &dyn RootFs,
    path: &str,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: i64,
) -> io::Result<()> {
    match fs.stat(path) {
        Ok(info) if info.is_dir() => {
            let stricter = info.mode & mode;
            if stricter != info.mode {
                fs.chmod(path, stricter)?;
            }
        }
        _ => {
            fs.mkdir_all(path, mode)?;
            fs.chown(path, uid, gid)?;
            fs.set_mtime(path, mtime)?;
        }
    }
    Ok(())
}

fn check_overlap(
    fs: &dyn RootFs,
    db: &InstalledDb,
    pkg: &Package,
    path: &str,
    new_data: &[u8],
) -> Result<(), InstallError> {
    if !fs.exists(path) {
        return Ok(());
    }
    let Some((prior, _)) = db.owner_of(path) else {
        // Present on disk but unowned: free to overwrite.
        return Ok(());
    };
    if prior.name == pkg.name {
        return Ok(());
    }
    if !prior.origin.is_empty() && prior.origin == pkg.origin {
        return Ok(());
    }
    if pkg.replaces.iter().any(|r| *r == prior.name) {
        return Ok(());
    }
    let old_data = fs.read_file(path).unwrap_or_default();
    if old_data == new_data {
        return Ok(());
    }
    Err(InstallError::OverlapConflict {
        path: path.to_string(),
        prior: prior.name.clone(),
        prior_origin: prior.origin.clone(),
        package: pkg.name.clone(),
    })
}

/// Reject absolute paths and any `..` traversal; returns `None` for
/// entries that resolve to nothing (`.`, `./`).
fn normalize_entry_path(raw: &str) -> Result<Option<String>, InstallError> {
    let trimmed = raw.trim_start_matches("./").trim_start_matches('/');
    let trimmed = trimmed.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.split('/').any(|part| part == ".." || part.is_empty()) {
        return Err(InstallError::UnsafePath(raw.to_string()));
    }
    Ok(Some(trimmed.to_string()))
}
