//! The engine facade: configuration, index loading, resolution and
//! installation against a target root.
//!
//! The engine is safe for concurrent reads; mutations of one target root
//! (install, database writes) are serialized by taking `&self` methods in
//! plan order on a single thread. Index fetches for distinct repositories
//! run in parallel and join before the provides map is built.

use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use url::Url;

use crate::cache::CacheTransport;
use crate::db::InstalledDb;
use crate::error::Error;
use crate::expand::ExpandedApk;
use crate::fetch::{Fetcher, HttpClient};
use crate::fs::RootFs;
use crate::index::{self, IndexError, IndexOptions, Keyring, NamedIndex, Package};
use crate::install::{self, InstallError, InstallOptions};
use crate::resolver::{Plan, Resolver, World};
use crate::version::Atom;
use crate::{INSTALLED_DB_PATH, SCRIPTS_TAR_PATH, TRIGGERS_PATH, WORLD_PATH};

/// Cooperative cancellation: a flag plus an optional deadline. Cloned
/// tokens share state. Long-running engine operations poll between
/// packages and between archive entries, so cancellation never leaves a
/// half-written file behind.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    deadline: std::sync::Mutex<Option<Instant>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        let token = Self::new();
        *token.inner.deadline.lock().unwrap() = Some(deadline);
        token
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        let deadline = self.inner.deadline.lock().unwrap();
        deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Construction surface of the engine.
pub struct ApkConfig {
    /// The target root all installs apply to.
    pub root: Arc<dyn RootFs>,
    /// On-disk cache directory for indexes and archives.
    pub cache_dir: PathBuf,
    /// Public keys trusted to sign repository indexes.
    pub keyring: Keyring,
    /// Package architecture, e.g. `x86_64`.
    pub arch: String,
    pub ignore_signatures: bool,
    pub ignore_mknod_errors: bool,
    pub offline: bool,
    /// Override the HTTP transport (tests, instrumented clients).
    pub fetcher: Option<Arc<dyn Fetcher>>,
}

impl ApkConfig {
    pub fn new(root: Arc<dyn RootFs>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            root,
            cache_dir: cache_dir.into(),
            keyring: Keyring::new(),
            arch: crate::arch::current().to_string(),
            ignore_signatures: false,
            ignore_mknod_errors: false,
            offline: false,
            fetcher: None,
        }
    }
}

/// Outcome of loading a set of repositories: the indexes that loaded plus
/// per-repository failures. A bad repository never hides a good one.
pub struct IndexLoad {
    pub indexes: Vec<NamedIndex>,
    pub failures: Vec<(String, IndexError)>,
}

/// Result of installing a plan.
#[derive(Debug, Default)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub skipped: Vec<String>,
}

/// The assembled package engine.
pub struct Apk {
    root: Arc<dyn RootFs>,
    cache_dir: PathBuf,
    keyring: Keyring,
    arch: String,
    ignore_signatures: bool,
    ignore_mknod_errors: bool,
    offline: bool,
    fetcher: Arc<dyn Fetcher>,
}

impl Apk {
    pub fn new(config: ApkConfig) -> Self {
        let fetcher = config
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpClient::new()));
        Self {
            root: config.root,
            cache_dir: config.cache_dir,
            keyring: config.keyring,
            arch: config.arch,
            ignore_signatures: config.ignore_signatures,
            ignore_mknod_errors: config.ignore_mknod_errors,
            offline: config.offline,
            fetcher,
        }
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    /// Create the database and configuration directories under the root.
    pub fn init_db(&self) -> Result<(), Error> {
        for dir in ["etc/apk", "lib/apk/db", "var/cache/apk"] {
            self.root.mkdir_all(dir, 0o755)?;
        }
        if !self.root.exists(INSTALLED_DB_PATH) {
            self.root.write_file(INSTALLED_DB_PATH, b"", 0o644)?;
        }
        Ok(())
    }

    /// Fetch, verify and parse the given repository lines in parallel.
    pub fn load_indexes(&self, repos: &[String], cancel: &CancelToken) -> Result<IndexLoad, Error> {
        cancel.check()?;
        let opts = IndexOptions {
            keyring: &self.keyring,
            arch: &self.arch,
            ignore_signatures: self.ignore_signatures,
        };

        let mut results: Vec<Option<Result<NamedIndex, IndexError>>> = Vec::new();
        results.resize_with(repos.len(), || None);

        std::thread::scope(|scope| {
            for (slot, repo) in results.iter_mut().zip(repos) {
                let cache = CacheTransport::new(Arc::clone(&self.fetcher), &self.cache_dir)
                    .etag_required(true)
                    .offline(self.offline);
                let opts = &opts;
                scope.spawn(move || {
                    *slot = Some(index::load_repository(repo, &cache, opts));
                });
            }
        });

        let mut load = IndexLoad {
            indexes: Vec::new(),
            failures: Vec::new(),
        };
        for (repo, result) in repos.iter().zip(results) {
            match result.expect("index worker finished") {
                Ok(idx) => {
                    tracing::debug!(repo = %repo, packages = idx.packages.len(), "loaded index");
                    load.indexes.push(idx);
                }
                Err(e) => {
                    tracing::warn!(repo = %repo, error = %e, "failed to load repository");
                    load.failures.push((repo.clone(), e));
                }
            }
        }
        cancel.check()?;
        Ok(load)
    }

    /// Resolve a world against loaded indexes into an ordered plan.
    pub fn resolve(&self, world: &World, indexes: &[NamedIndex]) -> Result<Plan, Error> {
        let resolver = Resolver::new(indexes, world);
        Ok(resolver.resolve(world)?)
    }

    /// Read the installed database from the target root. A missing file is
    /// an empty database.
    pub fn installed(&self) -> Result<InstalledDb, Error> {
        if !self.root.exists(INSTALLED_DB_PATH) {
            return Ok(InstalledDb::new());
        }
        let text = String::from_utf8_lossy(&self.root.read_file(INSTALLED_DB_PATH)?).into_owned();
        Ok(InstalledDb::parse(&text))
    }

    /// Persist the world atoms to `etc/apk/world`.
    pub fn write_world(&self, atoms: &[Atom]) -> Result<(), Error> {
        self.root.mkdir_all("etc/apk", 0o755)?;
        let mut text = String::new();
        for atom in atoms {
            text.push_str(&atom.to_string());
            text.push('\n');
        }
        self.root.write_file(WORLD_PATH, text.as_bytes(), 0o644)?;
        Ok(())
    }

    /// Install a resolved plan in order. Already-installed packages are
    /// skipped; the installed database is rewritten after every package so
    /// cancellation between packages stays consistent.
    pub fn install(&self, plan: &Plan, cancel: &CancelToken) -> Result<InstallReport, Error> {
        self.init_db()?;
        let mut db = self.installed()?;
        let mut report = InstallReport::default();
        let cache = CacheTransport::new(Arc::clone(&self.fetcher), &self.cache_dir)
            .offline(self.offline);

        for pkg in &plan.packages {
            cancel.check()?;
            if db
                .get(&pkg.name)
                .is_some_and(|p| p.package.version == pkg.version)
            {
                tracing::debug!(pkg = %pkg.name, version = %pkg.version, "already installed");
                report.skipped.push(pkg.name.clone());
                continue;
            }

            tracing::debug!(pkg = %pkg.name, version = %pkg.version, "installing");
            self.install_one(pkg, &cache, &mut db, cancel)?;
            self.root
                .write_file(INSTALLED_DB_PATH, db.render().as_bytes(), 0o644)?;
            report.installed.push(pkg.name.clone());
        }
        Ok(report)
    }

    fn install_one(
        &self,
        pkg: &Package,
        cache: &CacheTransport,
        db: &mut InstalledDb,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        let url_text = pkg.archive_url(&self.arch);
        let url = Url::parse(&url_text)
            .map_err(|_| Error::Index(IndexError::InvalidUrl(url_text.clone())))?;

        let mut resp = cache.fetch(&url)?;
        if resp.status != 200 {
            return Err(Error::Index(IndexError::UnexpectedStatus {
                status: resp.status,
                url: url_text,
            }));
        }

        let expanded = ExpandedApk::split(&mut resp.body)?;
        if !pkg.checksum.is_empty() && expanded.control_checksum[..] != pkg.checksum[..] {
            return Err(Error::Install(InstallError::ChecksumMismatch {
                package: pkg.name.clone(),
                expected: pkg.checksum_string(),
                actual: format!("Q1{}", BASE64.encode(expanded.control_checksum)),
            }));
        }

        let records = install::apply_package_data(
            self.root.as_ref(),
            db,
            pkg,
            expanded.package_data()?,
            InstallOptions {
                ignore_mknod_errors: self.ignore_mknod_errors,
            },
            cancel,
        )?;

        self.record_scripts(pkg, &expanded)?;
        self.record_triggers(pkg)?;
        db.add(pkg.clone(), records);
        Ok(())
    }

    /// Append the package's install scripts to `lib/apk/db/scripts.tar`.
    /// Execution is the caller's policy; the engine only records them.
    fn record_scripts(&self, pkg: &Package, expanded: &ExpandedApk) -> Result<(), Error> {
        let scripts = expanded.scripts()?;
        if scripts.is_empty() {
            return Ok(());
        }

        // Existing entries are carried over; rewriting the whole archive
        // keeps the file a plain tar without append-trailer seams.
        let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
        if self.root.exists(SCRIPTS_TAR_PATH) {
            let existing = self.root.read_file(SCRIPTS_TAR_PATH)?;
            let mut archive = tar::Archive::new(&existing[..]);
            for entry in archive.entries()? {
                let mut entry = entry?;
                let name = entry.path()?.to_string_lossy().into_owned();
                let mut body = Vec::new();
                entry.read_to_end(&mut body)?;
                entries.push((name, body));
            }
        }

        let prefix = format!("{}-{}", pkg.name, pkg.version);
        entries.retain(|(name, _)| !name.starts_with(&prefix));
        for (name, body) in scripts {
            // script names carry their leading dot (".post-install")
            entries.push((format!("{prefix}{name}"), body));
        }

        let mut builder = tar::Builder::new(Vec::new());
        for (name, body) in &entries {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(body.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, &body[..])?;
        }
        let bytes = builder.into_inner()?;
        self.root.write_file(SCRIPTS_TAR_PATH, &bytes, 0o644)?;
        Ok(())
    }

    /// Record the package's trigger paths in `lib/apk/db/triggers`.
    fn record_triggers(&self, pkg: &Package) -> Result<(), Error> {
        if pkg.triggers.is_empty() {
            return Ok(());
        }
        let mut text = if self.root.exists(TRIGGERS_PATH) {
            String::from_utf8_lossy(&self.root.read_file(TRIGGERS_PATH)?).into_owned()
        } else {
            String::new()
        };
        text.push_str(&format!(
            "{} {}\n",
            pkg.checksum_string(),
            pkg.triggers.join(" ")
        ));
        self.root.write_file(TRIGGERS_PATH, text.as_bytes(), 0o644)?;
        Ok(())
    }
}
