//! Repository index loading: fetch `APKINDEX.tar.gz`, verify its RSA-SHA1
//! signature against a keyring, and parse the record stream into packages.
//!
//! A repository line is `[@name ]<base-url>`; the optional `@name` pins the
//! repository so only atoms tagged with that pin draw from it. The index
//! URL is `<base>/<arch>/APKINDEX.tar.gz`. Verification hashes everything
//! after the first gzip member (the signature member) because that is the
//! byte range Alpine signs.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::cache::{CacheError, CacheTransport};
use crate::fetch::FetchError;
use crate::sign;
use crate::version::{Atom, Version};
use crate::INDEX_FILENAME;

/// Keyring: key file name (as it appears in `.SIGN.RSA.<name>`) to PEM
/// public key bytes.
pub type Keyring = BTreeMap<String, Vec<u8>>;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("repository index not found for architecture {arch} at {url}")]
    NotFound { arch: String, url: String },

    #[error("unexpected status code {status} when getting repository index at {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("invalid repository line {0:?}")]
    InvalidRepositoryLine(String),

    #[error("invalid package URL {0:?}")]
    InvalidUrl(String),

    #[error("repository scheme {0:?} not supported")]
    UnsupportedScheme(String),

    #[error("repository index has no signature section")]
    MissingSignature,

    #[error("no key found to verify signature for keyfile {key_name}; tried all other keys as well")]
    NoMatchingKey { key_name: String },

    #[error("no keys provided to verify signature")]
    EmptyKeyring,

    #[error("index archive has no APKINDEX entry")]
    MissingIndexEntry,

    #[error(transparent)]
    Sign(#[from] sign::SignError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single package as described by an `APKINDEX` record or a `.PKGINFO`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub arch: String,
    pub description: String,
    pub license: String,
    pub origin: String,
    pub maintainer: String,
    pub url: String,
    /// SHA1 of the control section's raw bytes (the `Q1…` checksum).
    #[serde(default)]
    pub checksum: Vec<u8>,
    pub depends: Vec<String>,
    pub provides: Vec<String>,
    pub install_if: Vec<String>,
    pub replaces: Vec<String>,
    pub triggers: Vec<String>,
    /// Compressed archive size in bytes.
    pub size: u64,
    pub installed_size: u64,
    pub provider_priority: u64,
    /// Build time, unix seconds.
    pub build_time: i64,
    pub repo_commit: String,
    /// Base URL of the repository this package was parsed from (no arch
    /// component); empty for packages not tied to a repository.
    #[serde(default)]
    pub repo_base: String,
}

impl Package {
    /// The archive filename as published in a repository.
    pub fn filename(&self) -> String {
        format!("{}-{}.apk", self.name, self.version)
    }

    /// Full download URL of the archive within its repository.
    pub fn archive_url(&self, arch: &str) -> String {
        format!("{}/{}/{}", self.repo_base, arch, self.filename())
    }

    /// The `Q1`-prefixed human-readable checksum.
    pub fn checksum_string(&self) -> String {
        format!("Q1{}", BASE64.encode(&self.checksum))
    }

    /// Parsed form of the version field.
    pub fn parsed_version(&self) -> Option<Version> {
        Version::parse(&self.version).ok()
    }

    /// The dependency atoms of this package.
    pub fn depend_atoms(&self) -> Vec<Atom> {
        self.depends.iter().map(|d| Atom::parse(d)).collect()
    }

    /// Render this package as APKINDEX record lines (no trailing blank).
    pub fn to_index_record(&self) -> Vec<String> {
        let mut out = vec![
            format!("P:{}", self.name),
            format!("V:{}", self.version),
            format!("A:{}", self.arch),
            format!("L:{}", self.license),
            format!("T:{}", self.description),
            format!("o:{}", self.origin),
            format!("m:{}", self.maintainer),
            format!("U:{}", self.url),
            format!("D:{}", self.depends.join(" ")),
            format!("p:{}", self.provides.join(" ")),
            format!("c:{}", self.repo_commit),
            format!("i:{}", self.install_if.join(" ")),
            format!("t:{}", self.build_time),
            format!("S:{}", self.size),
            format!("I:{}", self.installed_size),
            format!("k:{}", self.provider_priority),
        ];
        if !self.checksum.is_empty() {
            out.push(format!("C:{}", self.checksum_string()));
        }
        out
    }
}

/// One loaded repository: its pin name (empty when untagged), base URL,
/// architecture, and parsed packages.
#[derive(Debug, Clone)]
pub struct NamedIndex {
    pub name: String,
    pub base_url: String,
    pub arch: String,
    pub packages: Vec<Arc<Package>>,
}

/// Split a repository line into `(pin name, base url)`.
pub fn split_repository_line(line: &str) -> Result<(String, String), IndexError> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix('@') {
        let mut parts = rest.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(name), Some(url)) => Ok((name.to_string(), url.to_string())),
            _ => Err(IndexError::InvalidRepositoryLine(line.to_string())),
        }
    } else {
        Ok((String::new(), line.to_string()))
    }
}

/// Full URL of the index file for a repository base and arch.
pub fn index_url(base: &str, arch: &str) -> String {
    format!("{}/{}/{}", base.trim_end_matches('/'), arch, INDEX_FILENAME)
}

/// Options for [`load_repository`].
pub struct IndexOptions<'a> {
    pub keyring: &'a Keyring,
    pub arch: &'a str,
    pub ignore_signatures: bool,
}

/// Fetch, verify and parse one repository's index.
///
/// `file://` URLs and bare paths are read directly; `http(s)://` goes
/// through the supplied cache transport.
pub fn load_repository(
    repo_line: &str,
    cache: &CacheTransport,
    opts: &IndexOptions<'_>,
) -> Result<NamedIndex, IndexError> {
    let (name, base) = split_repository_line(repo_line)?;
    let url_text = index_url(&base, opts.arch);
    tracing::debug!(repo = %base, arch = opts.arch, "loading repository index");

    let bytes = match Url::parse(&url_text) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
            let mut resp = cache.fetch(&url)?;
            match resp.status {
                200 => {
                    let mut buf = Vec::new();
                    resp.body.read_to_end(&mut buf)?;
                    buf
                }
                404 => {
                    return Err(IndexError::NotFound {
                        arch: opts.arch.to_string(),
                        url: url_text,
                    })
                }
                status => {
                    return Err(IndexError::UnexpectedStatus {
                        status,
                        url: url_text,
                    })
                }
            }
        }
        Ok(url) if url.scheme() == "file" => std::fs::read(url.path())?,
        Ok(url) => return Err(IndexError::UnsupportedScheme(url.scheme().to_string())),
        // Bare paths don't parse as URLs; treat them as local files.
        Err(_) => std::fs::read(&url_text)?,
    };

    if !opts.ignore_signatures {
        verify_index_signature(&bytes, opts.keyring)?;
    }

    let packages = parse_index_archive(&bytes)?
        .into_iter()
        .map(|mut p| {
            p.repo_base = base.clone();
            Arc::new(p)
        })
        .collect();

    Ok(NamedIndex {
        name,
        base_url: base,
        arch: opts.arch.to_string(),
        packages,
    })
}

/// Verify the signature member of an index archive against the keyring.
/// The named key is tried first, then every other key.
pub fn verify_index_signature(index: &[u8], keyring: &Keyring) -> Result<(), IndexError> {
    let (key_name, signature, payload_start) =
        sign::split_signature(index)?.ok_or(IndexError::MissingSignature)?;
    if keyring.is_empty() {
        return Err(IndexError::EmptyKeyring);
    }

    let digest = sign::sha1_digest(&index[payload_start..]);

    if let Some(key) = keyring.get(&key_name) {
        if sign::verify_digest(&digest, &signature, key).is_ok() {
            return Ok(());
        }
        tracing::warn!(key = %key_name, "named key failed to verify index, trying others");
    }
    for (name, key) in keyring {
        if *name != key_name && sign::verify_digest(&digest, &signature, key).is_ok() {
            return Ok(());
        }
    }
    Err(IndexError::NoMatchingKey { key_name })
}

/// Decompress an index archive and parse its `APKINDEX` entry.
pub fn parse_index_archive(index: &[u8]) -> Result<Vec<Package>, IndexError> {
    let decoder = flate2::bufread::MultiGzDecoder::new(index);
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() != "APKINDEX" {
            continue;
        }
        let mut text = String::new();
        entry.read_to_string(&mut text)?;
        return Ok(parse_index_records(&text));
    }
    Err(IndexError::MissingIndexEntry)
}

/// Parse the blank-line-separated `<letter>:<value>` record stream.
pub fn parse_index_records(text: &str) -> Vec<Package> {
    let mut packages = Vec::new();
    let mut current: Option<Package> = None;

    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            if let Some(pkg) = current.take() {
                packages.push(pkg);
            }
            continue;
        }
        let Some((letter, value)) = line.split_once(':') else {
            continue;
        };
        let pkg = current.get_or_insert_with(Package::default);
        match letter {
            "P" => pkg.name = value.to_string(),
            "V" => pkg.version = value.to_string(),
            "A" => pkg.arch = value.to_string(),
            "L" => pkg.license = value.to_string(),
            "T" => pkg.description = value.to_string(),
            "o" => pkg.origin = value.to_string(),
            "m" => pkg.maintainer = value.to_string(),
            "U" => pkg.url = value.to_string(),
            "D" => pkg.depends = space_list(value),
            "p" => pkg.provides = space_list(value),
            "c" => pkg.repo_commit = value.to_string(),
            "i" => pkg.install_if = space_list(value),
            "t" => pkg.build_time = value.parse().unwrap_or(0),
            "S" => pkg.size = value.parse().unwrap_or(0),
            "I" => pkg.installed_size = value.parse().unwrap_or(0),
            "k" => pkg.provider_priority = value.parse().unwrap_or(0),
            "C" => {
                if let Some(b64) = value.strip_prefix("Q1") {
                    pkg.checksum = BASE64.decode(b64).unwrap_or_default();
                }
            }
            _ => {}
        }
    }
    if let Some(pkg) = current.take() {
        packages.push(pkg);
    }
    packages
}

fn space_list(value: &str) -> Vec<String> {
    value.split_whitespace().map(String::from).collect()
}

/// Render packages into APKINDEX text (records separated by blank lines).
pub fn render_index_records(packages: &[Package]) -> String {
    let mut out = String::new();
    for pkg in packages {
        for line in pkg.to_index_record() {
            out.push_str(&line);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}
