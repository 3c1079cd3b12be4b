//! APK stream splitting and expansion.
//!
//! An `.apk` is a concatenation of two or three non-multistream gzip
//! members: an optional signature, the control section, and the package
//! data. Splitting has to count *raw compressed* bytes per member, because
//! the package checksum is SHA1 over the raw bytes of the control member.
//! The reader below tees exactly the bytes the gzip decoder consumes into
//! per-member `stream.N.tar.gz` files, so member boundaries fall out of the
//! decode itself.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::bufread::GzDecoder;
use sha1::{Digest, Sha1};
use tempfile::TempDir;
use thiserror::Error;

use crate::index::Package;
use crate::tarfs::XATTR_PAX_PREFIX;

#[derive(Error, Debug)]
pub enum ExpandError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid number of gzip streams: {0}")]
    InvalidStreamCount(usize),

    #[error("gzip member {index} is not a valid tar stream: {source}")]
    InvalidTar { index: usize, source: io::Error },

    #[error("control section has no .PKGINFO entry")]
    MissingPkginfo,
}

struct MemberSink {
    file: File,
    path: PathBuf,
    sha1: Sha1,
    written: u64,
    error: Option<io::Error>,
}

impl MemberSink {
    fn create(dir: &Path, index: usize) -> io::Result<Self> {
        let path = dir.join(format!("stream.{index}.tar.gz"));
        Ok(Self {
            file: File::create(&path)?,
            path,
            sha1: Sha1::new(),
            written: 0,
            error: None,
        })
    }

    fn tee(&mut self, chunk: &[u8]) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.file.write_all(chunk) {
            self.error = Some(e);
            return;
        }
        self.sha1.update(chunk);
        self.written += chunk.len() as u64;
    }

    fn finish(mut self) -> io::Result<(PathBuf, [u8; 20], u64)> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.file.flush()?;
        Ok((self.path, self.sha1.finalize().into(), self.written))
    }
}

/// BufRead adapter that counts consumed bytes and tees them into the
/// current member sink. The gzip decoder consumes exactly the bytes of the
/// member it decodes, so whatever flows through `consume` between two sink
/// swaps is exactly one raw member.
struct TeeReader<R: Read> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    cap: usize,
    sink: Option<MemberSink>,
}

impl<R: Read> TeeReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0u8; 64 * 1024],
            pos: 0,
            cap: 0,
            sink: None,
        }
    }

    fn has_more(&mut self) -> io::Result<bool> {
        Ok(!self.fill_buf()?.is_empty())
    }
}

impl<R: Read> Read for TeeReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl<R: Read> BufRead for TeeReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.pos >= self.cap {
            self.cap = self.inner.read(&mut self.buf)?;
            self.pos = 0;
        }
        Ok(&self.buf[self.pos..self.cap])
    }

    fn consume(&mut self, amt: usize) {
        if let Some(sink) = &mut self.sink {
            sink.tee(&self.buf[self.pos..self.pos + amt]);
        }
        self.pos += amt;
    }
}

/// An `.apk` divided into its raw gzip members, staged as files in an owned
/// temporary directory. The directory is removed on drop.
#[derive(Debug)]
pub struct ExpandedApk {
    temp: TempDir,
    /// Whether the archive carried a signature member.
    pub signed: bool,
    /// Total raw bytes across all members (the input size).
    pub size: u64,
    /// The signature member, when present.
    pub signature_file: Option<PathBuf>,
    /// The control member (`.PKGINFO` plus install scripts).
    pub control_file: PathBuf,
    /// The package data member.
    pub data_file: PathBuf,
    /// SHA1 over the raw compressed bytes of the control member; this is
    /// the package checksum recorded in indexes.
    pub control_checksum: [u8; 20],
}

impl ExpandedApk {
    /// Split an APK stream into its members.
    pub fn split<R: Read>(source: R) -> Result<Self, ExpandError> {
        let temp = TempDir::with_prefix("split-apk")?;

        let mut reader = TeeReader::new(source);
        let mut members: Vec<(PathBuf, [u8; 20], u64)> = Vec::new();

        while reader.has_more()? {
            reader.sink = Some(MemberSink::create(temp.path(), members.len())?);
            let mut decoder = GzDecoder::new(&mut reader);
            io::copy(&mut decoder, &mut io::sink())?;
            drop(decoder);
            let sink = reader.sink.take().expect("member sink present");
            members.push(sink.finish()?);
        }

        let signed = match members.len() {
            2 => false,
            3 => true,
            n => return Err(ExpandError::InvalidStreamCount(n)),
        };
        for (i, (path, _, _)) in members.iter().enumerate() {
            validate_tar_member(path).map_err(|source| ExpandError::InvalidTar { index: i, source })?;
        }

        let size = members.iter().map(|(_, _, n)| n).sum();
        let control_index = usize::from(signed);
        let control_checksum = members[control_index].1;
        let data_file = members[control_index + 1].0.clone();
        let control_file = members[control_index].0.clone();
        let signature_file = signed.then(|| members[0].0.clone());

        Ok(Self {
            temp,
            signed,
            size,
            signature_file,
            control_file,
            data_file,
            control_checksum,
        })
    }

    /// The temporary directory holding the member files.
    pub fn temp_dir(&self) -> &Path {
        self.temp.path()
    }

    /// Reader over the decompressed control tar.
    pub fn control_data(&self) -> io::Result<impl Read> {
        let file = File::open(&self.control_file)?;
        Ok(flate2::read::GzDecoder::new(BufReader::new(file)))
    }

    /// Reader over the decompressed data tar.
    pub fn package_data(&self) -> io::Result<impl Read> {
        let file = File::open(&self.data_file)?;
        Ok(flate2::read::GzDecoder::new(BufReader::new(file)))
    }

    /// Parse `.PKGINFO` from the control section into a [`Package`]. The
    /// checksum field is filled from the control member digest.
    pub fn pkginfo(&self) -> Result<Package, ExpandError> {
        let mut archive = tar::Archive::new(self.control_data()?);
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.to_string_lossy() != ".PKGINFO" {
                continue;
            }
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            let mut pkg = parse_pkginfo(&text);
            pkg.checksum = self.control_checksum.to_vec();
            return Ok(pkg);
        }
        Err(ExpandError::MissingPkginfo)
    }

    /// The install scripts carried in the control section: every entry
    /// other than `.PKGINFO`, as `(name, contents)`. Running them is the
    /// caller's policy; the engine only records them.
    pub fn scripts(&self) -> Result<Vec<(String, Vec<u8>)>, ExpandError> {
        let mut archive = tar::Archive::new(self.control_data()?);
        let mut scripts = Vec::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            if name == ".PKGINFO" || entry.header().entry_type().is_dir() {
                continue;
            }
            let mut body = Vec::new();
            entry.read_to_end(&mut body)?;
            scripts.push((name, body));
        }
        Ok(scripts)
    }
}

fn validate_tar_member(path: &Path) -> io::Result<()> {
    let file = File::open(path)?;
    let decoder = flate2::read::GzDecoder::new(BufReader::new(file));
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        io::copy(&mut entry, &mut io::sink())?;
    }
    Ok(())
}

/// Parse the ini-style `key = value` stream of a `.PKGINFO`. Keys may
/// repeat (`depend`, `provides`, `install_if`, `replaces`, `triggers`).
pub fn parse_pkginfo(text: &str) -> Package {
    let mut pkg = Package::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "pkgname" => pkg.name = value.to_string(),
            "pkgver" => pkg.version = value.to_string(),
            "arch" => pkg.arch = value.to_string(),
            "pkgdesc" => pkg.description = value.to_string(),
            "license" => pkg.license = value.to_string(),
            "origin" => pkg.origin = value.to_string(),
            "maintainer" => pkg.maintainer = value.to_string(),
            "url" => pkg.url = value.to_string(),
            "commit" => pkg.repo_commit = value.to_string(),
            "size" => pkg.installed_size = value.parse().unwrap_or(0),
            "builddate" => pkg.build_time = value.parse().unwrap_or(0),
            "provider_priority" => pkg.provider_priority = value.parse().unwrap_or(0),
            "depend" => pkg.depends.push(value.to_string()),
            "provides" => pkg.provides.push(value.to_string()),
            "install_if" => pkg.install_if.push(value.to_string()),
            "replaces" => pkg.replaces.push(value.to_string()),
            "triggers" => pkg.triggers.extend(value.split_whitespace().map(String::from)),
            _ => {}
        }
    }
    pkg
}

/// Collect the PAX xattr records of a tar entry as `(name, value)` pairs.
pub fn pax_xattrs<R: Read>(entry: &mut tar::Entry<'_, R>) -> io::Result<Vec<(String, Vec<u8>)>> {
    let mut xattrs = Vec::new();
    if let Some(pax) = entry.pax_extensions()? {
        for ext in pax {
            let ext = ext?;
            if let Ok(key) = ext.key() {
                if let Some(attr) = key.strip_prefix(XATTR_PAX_PREFIX) {
                    xattrs.push((attr.to_string(), ext.value_bytes().to_vec()));
                }
            }
        }
    }
    Ok(xattrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;

    fn gz_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in entries {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, &content[..]).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn test_apk(signed: bool) -> Vec<u8> {
        let pkginfo = b"pkgname = hello\npkgver = 2.12.1-r0\narch = x86_64\n\
origin = hello\nsize = 1024\ndepend = libc\ndepend = libm\nprovides = cmd:hello=2.12.1-r0\n";
        let mut apk = Vec::new();
        if signed {
            apk.extend(gz_tar(&[(".SIGN.RSA.test.rsa.pub", &b"not a real signature"[..])]));
        }
        apk.extend(gz_tar(&[(".PKGINFO", &pkginfo[..])]));
        apk.extend(gz_tar(&[("usr/bin/hello", &b"#!/bin/sh\necho hello\n"[..])]));
        apk
    }

    #[test]
    fn test_split_three_members() {
        let apk = test_apk(true);
        let expanded = ExpandedApk::split(&apk[..]).unwrap();
        assert!(expanded.signed);
        assert_eq!(expanded.size, apk.len() as u64, "member sizes must sum to input size");
        assert!(expanded.signature_file.is_some());

        let on_disk: u64 = [
            expanded.signature_file.as_ref().unwrap(),
            &expanded.control_file,
            &expanded.data_file,
        ]
        .iter()
        .map(|p| fs::metadata(p).unwrap().len())
        .sum();
        assert_eq!(on_disk, apk.len() as u64);
    }

    #[test]
    fn test_split_two_members() {
        let expanded = ExpandedApk::split(&test_apk(false)[..]).unwrap();
        assert!(!expanded.signed);
        assert!(expanded.signature_file.is_none());
    }

    #[test]
    fn test_control_checksum_is_raw_member_sha1() {
        let apk = test_apk(true);
        let expanded = ExpandedApk::split(&apk[..]).unwrap();

        let control_raw = fs::read(&expanded.control_file).unwrap();
        let digest: [u8; 20] = Sha1::digest(&control_raw).into();
        assert_eq!(expanded.control_checksum, digest);
    }

    #[test]
    fn test_truncated_input_fails() {
        let apk = test_apk(true);
        let truncated = &apk[..apk.len() - 7];
        assert!(ExpandedApk::split(truncated).is_err());
    }

    #[test]
    fn test_single_member_rejected() {
        let one = gz_tar(&[(".PKGINFO", &b"pkgname = x\n"[..])]);
        match ExpandedApk::split(&one[..]) {
            Err(ExpandError::InvalidStreamCount(1)) => {}
            other => panic!("expected InvalidStreamCount(1), got {other:?}"),
        }
    }

    #[test]
    fn test_pkginfo_repeated_keys() {
        let expanded = ExpandedApk::split(&test_apk(false)[..]).unwrap();
        let pkg = expanded.pkginfo().unwrap();
        assert_eq!(pkg.name, "hello");
        assert_eq!(pkg.version, "2.12.1-r0");
        assert_eq!(pkg.arch, "x86_64");
        assert_eq!(pkg.depends, vec!["libc", "libm"]);
        assert_eq!(pkg.provides, vec!["cmd:hello=2.12.1-r0"]);
        assert_eq!(pkg.installed_size, 1024);
        assert_eq!(pkg.checksum, expanded.control_checksum.to_vec());
    }

    #[test]
    fn test_scripts_listed() {
        let pkginfo = b"pkgname = s\npkgver = 1-r0\n";
        let mut apk = Vec::new();
        apk.extend(gz_tar(&[
            (".PKGINFO", &pkginfo[..]),
            (".post-install", &b"#!/bin/sh\ntrue\n"[..]),
        ]));
        apk.extend(gz_tar(&[("etc/s.conf", &b"x=1\n"[..])]));

        let expanded = ExpandedApk::split(&apk[..]).unwrap();
        let scripts = expanded.scripts().unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].0, ".post-install");
        assert_eq!(scripts[0].1, b"#!/bin/sh\ntrue\n");
    }

    #[test]
    fn test_temp_dir_released_on_drop() {
        let expanded = ExpandedApk::split(&test_apk(false)[..]).unwrap();
        let dir = expanded.temp_dir().to_path_buf();
        assert!(dir.exists());
        drop(expanded);
        assert!(!dir.exists());
    }
}
