//! The installed-package database (`lib/apk/db/installed`).
//!
//! One stanza per package, blank-line separated. Package lines mirror the
//! APKINDEX letters; file lines follow, grouped under their directory:
//!
//! ```text
//! F:usr/bin            directory
//! M:0:0:755            directory owner and mode
//! R:hello              file (basename within the last F: directory)
//! a:0:0:755            file owner and mode
//! S:20                 file size in bytes
//! Z:Q1...              file checksum
//! ```
//!
//! At most one record may claim a path across all installed packages; the
//! exceptions (same origin, `replaces`, identical content) are enforced by
//! the installer, not here.

use std::collections::HashMap;
use std::fmt::Write as _;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::index::{parse_index_records, Package};

/// What a single applied tar entry became on the target filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub dir: bool,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// SHA1 of the file contents; empty for directories and special files.
    pub checksum: Vec<u8>,
    pub link_target: String,
    pub xattrs: Vec<(String, Vec<u8>)>,
}

/// One installed package and the files it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub package: Package,
    pub files: Vec<FileRecord>,
}

/// The persistent installed database.
#[derive(Debug, Clone, Default)]
pub struct InstalledDb {
    pub packages: Vec<InstalledPackage>,
}

impl InstalledDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a package with this name is already installed.
    pub fn contains(&self, name: &str) -> bool {
        self.packages.iter().any(|p| p.package.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&InstalledPackage> {
        self.packages.iter().find(|p| p.package.name == name)
    }

    /// The installed package owning `path`, with its record.
    pub fn owner_of(&self, path: &str) -> Option<(&Package, &FileRecord)> {
        for entry in &self.packages {
            if let Some(record) = entry.files.iter().find(|f| !f.dir && f.path == path) {
                return Some((&entry.package, record));
            }
        }
        None
    }

    /// Record a package and its applied files. Re-adding a package of the
    /// same name replaces the prior entry.
    pub fn add(&mut self, package: Package, files: Vec<FileRecord>) {
        self.packages.retain(|p| p.package.name != package.name);
        self.packages.push(InstalledPackage { package, files });
    }

    /// Render the database into its on-disk text form.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.packages {
            for line in entry.package.to_index_record() {
                out.push_str(&line);
                out.push('\n');
            }

            let mut current_dir = "";
            for file in &entry.files {
                if file.dir {
                    let _ = writeln!(out, "F:{}", file.path);
                    let _ = writeln!(out, "M:{}:{}:{:o}", file.uid, file.gid, file.mode);
                    current_dir = &file.path;
                    continue;
                }
                let (dir, base) = split_path(&file.path);
                if dir != current_dir {
                    let _ = writeln!(out, "F:{dir}");
                    current_dir = dir;
                }
                let _ = writeln!(out, "R:{base}");
                if !file.link_target.is_empty() {
                    let _ = writeln!(out, "a:{}:{}:{:o}:{}", file.uid, file.gid, file.mode, file.link_target);
                } else {
                    let _ = writeln!(out, "a:{}:{}:{:o}", file.uid, file.gid, file.mode);
                }
                let _ = writeln!(out, "S:{}", file.size);
                if !file.checksum.is_empty() {
                    let _ = writeln!(out, "Z:Q1{}", BASE64.encode(&file.checksum));
                }
            }
            out.push('\n');
        }
        out
    }

    /// Parse the on-disk text form back into a database.
    pub fn parse(text: &str) -> Self {
        let mut db = Self::new();
        for stanza in text.split("\n\n").filter(|s| !s.trim().is_empty()) {
            // Package lines come first; the file section starts at the
            // first F:/R: line. Splitting by position keeps the per-file
            // S: lines from shadowing the package-record S: line.
            let lines: Vec<&str> = stanza.lines().filter(|l| !l.is_empty()).collect();
            let file_start = lines
                .iter()
                .position(|l| l.starts_with("F:") || l.starts_with("R:"))
                .unwrap_or(lines.len());
            let (pkg_lines, file_lines) = lines.split_at(file_start);

            let mut record_text = pkg_lines.join("\n");
            record_text.push('\n');
            let Some(package) = parse_index_records(&record_text).into_iter().next() else {
                continue;
            };

            let mut files = Vec::new();
            let mut current_dir = String::new();
            for line in file_lines {
                let Some((letter, value)) = line.split_once(':') else {
                    continue;
                };
                match letter {
                    "F" => {
                        current_dir = value.to_string();
                        files.push(FileRecord {
                            path: current_dir.clone(),
                            dir: true,
                            mode: 0o755,
                            ..Default::default()
                        });
                    }
                    "M" => {
                        if let Some(rec) = files.last_mut() {
                            if rec.dir {
                                if let Some((uid, gid, mode)) = parse_perms(value) {
                                    rec.uid = uid;
                                    rec.gid = gid;
                                    rec.mode = mode;
                                }
                            }
                        }
                    }
                    "R" => {
                        let path = if current_dir.is_empty() {
                            value.to_string()
                        } else {
                            format!("{current_dir}/{value}")
                        };
                        files.push(FileRecord {
                            path,
                            ..Default::default()
                        });
                    }
                    "a" => {
                        if let Some(rec) = files.last_mut() {
                            let mut parts = value.splitn(4, ':');
                            let uid = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                            let gid = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                            let mode = parts
                                .next()
                                .and_then(|s| u32::from_str_radix(s, 8).ok())
                                .unwrap_or(0);
                            rec.uid = uid;
                            rec.gid = gid;
                            rec.mode = mode;
                            if let Some(target) = parts.next() {
                                rec.link_target = target.to_string();
                            }
                        }
                    }
                    "S" => {
                        if let Some(rec) = files.last_mut() {
                            rec.size = value.parse().unwrap_or(0);
                        }
                    }
                    "Z" => {
                        if let Some(rec) = files.last_mut() {
                            if let Some(b64) = value.strip_prefix("Q1") {
                                rec.checksum = BASE64.decode(b64).unwrap_or_default();
                            }
                        }
                    }
                    _ => {}
                }
            }
            db.packages.push(InstalledPackage { package, files });
        }
        db
    }

    /// Quick index from path to owning package name, for diagnostics.
    pub fn path_owners(&self) -> HashMap<&str, &str> {
        let mut map = HashMap::new();
        for entry in &self.packages {
            for file in &entry.files {
                if !file.dir {
                    map.insert(file.path.as_str(), entry.package.name.as_str());
                }
            }
        }
        map
    }
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

fn parse_perms(value: &str) -> Option<(u32, u32, u32)> {
    let mut parts = value.splitn(3, ':');
    let uid = parts.next()?.parse().ok()?;
    let gid = parts.next()?.parse().ok()?;
    let mode = u32::from_str_radix(parts.next()?, 8).ok()?;
    Some((uid, gid, mode))
}
