//! End-to-end engine scenarios against an in-memory root and a
//! directory-backed fake repository. No network.

use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::EncodePublicKey;
use url::Url;

use alpk::db::InstalledDb;
use alpk::engine::{Apk, ApkConfig, CancelToken};
use alpk::expand::ExpandedApk;
use alpk::fetch::{FetchError, Fetcher, HttpResponse};
use alpk::fs::{MemFs, RootFs};
use alpk::index::{render_index_records, Keyring, Package};
use alpk::resolver::World;
use alpk::sign::{sign_index, KeySigner};
use alpk::Error;

/// Serves files from a directory; etags are the hex SHA1 of the content.
struct DirFetcher {
    root: PathBuf,
    hits: AtomicU32,
}

impl DirFetcher {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            hits: AtomicU32::new(0),
        }
    }

    fn respond(&self, url: &Url, with_body: bool) -> HttpResponse {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let target = self.root.join(url.path().trim_start_matches('/'));
        match std::fs::read(&target) {
            Ok(data) => {
                let etag = hex::encode(alpk::sign::sha1_digest(&data));
                HttpResponse {
                    status: 200,
                    etag: Some(format!("\"{etag}\"")),
                    content_length: Some(data.len() as u64),
                    body: Box::new(Cursor::new(if with_body { data } else { Vec::new() })),
                }
            }
            Err(_) => HttpResponse {
                status: 404,
                etag: None,
                content_length: None,
                body: Box::new(Cursor::new(Vec::new())),
            },
        }
    }
}

impl Fetcher for DirFetcher {
    fn get(&self, url: &Url) -> Result<HttpResponse, FetchError> {
        Ok(self.respond(url, true))
    }

    fn head(&self, url: &Url) -> Result<HttpResponse, FetchError> {
        Ok(self.respond(url, false))
    }
}

/// A transport that refuses every request, for offline assertions.
struct DeadFetcher;

impl Fetcher for DeadFetcher {
    fn get(&self, _: &Url) -> Result<HttpResponse, FetchError> {
        Err(FetchError::Io(std::io::Error::other("network disabled")))
    }

    fn head(&self, _: &Url) -> Result<HttpResponse, FetchError> {
        Err(FetchError::Io(std::io::Error::other("network disabled")))
    }
}

enum Item<'a> {
    Dir(&'a str, u32),
    File(&'a str, &'a [u8], u32),
}

fn gz_tar(items: &[Item<'_>]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for item in items {
        let mut header = tar::Header::new_ustar();
        match item {
            Item::Dir(name, mode) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(*mode);
                header.set_uid(0);
                header.set_gid(0);
                header.set_cksum();
                builder.append_data(&mut header, name, std::io::empty()).unwrap();
            }
            Item::File(name, content, mode) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(content.len() as u64);
                header.set_mode(*mode);
                header.set_uid(0);
                header.set_gid(0);
                header.set_cksum();
                builder.append_data(&mut header, name, &content[..]).unwrap();
            }
        }
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Build an unsigned 2-member apk and return it with its control checksum.
fn build_apk(pkg: &Package, files: &[Item<'_>]) -> (Vec<u8>, Vec<u8>) {
    let mut pkginfo = format!(
        "pkgname = {}\npkgver = {}\narch = {}\norigin = {}\nsize = {}\n",
        pkg.name, pkg.version, pkg.arch, pkg.origin, pkg.installed_size
    );
    for dep in &pkg.depends {
        pkginfo.push_str(&format!("depend = {dep}\n"));
    }
    for p in &pkg.provides {
        pkginfo.push_str(&format!("provides = {p}\n"));
    }

    let mut apk = gz_tar(&[Item::File(".PKGINFO", pkginfo.as_bytes(), 0o644)]);
    apk.extend(gz_tar(files));

    let expanded = ExpandedApk::split(&apk[..]).unwrap();
    let checksum = expanded.control_checksum.to_vec();
    (apk, checksum)
}

struct TestRepo {
    dir: tempfile::TempDir,
    keyring: Keyring,
    base_url: String,
}

impl TestRepo {
    /// Lay out `<dir>/main/x86_64/` with the given packages and a signed
    /// index; returns the repo plus the keyring trusting its signer.
    fn build(packages: &mut [(Package, Vec<Item<'_>>)]) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let arch_dir = dir.path().join("main/x86_64");
        std::fs::create_dir_all(&arch_dir)?;

        let mut indexed: Vec<Package> = Vec::new();
        for (pkg, files) in packages.iter_mut() {
            let (apk, checksum) = build_apk(pkg, files);
            pkg.checksum = checksum;
            std::fs::write(arch_dir.join(pkg.filename()), &apk)?;
            indexed.push(pkg.clone());
        }

        let index_text = render_index_records(&indexed);
        let unsigned = gz_tar(&[Item::File("APKINDEX", index_text.as_bytes(), 0o644)]);

        // small keys keep debug-mode keygen fast; fine for tests
        let mut rng = rand::thread_rng();
        let key = rsa::RsaPrivateKey::new(&mut rng, 1024)?;
        let priv_pem = key.to_pkcs1_pem(Default::default())?.to_string();
        let pub_pem = key
            .to_public_key()
            .to_public_key_pem(Default::default())?
            .into_bytes();
        let signer = KeySigner::from_pem("test.rsa", priv_pem.as_bytes(), None)?;
        let signed = sign_index(&signer, &unsigned)?;
        std::fs::write(arch_dir.join("APKINDEX.tar.gz"), &signed)?;

        let mut keyring = Keyring::new();
        keyring.insert("test.rsa.pub".to_string(), pub_pem);

        Ok(Self {
            dir,
            keyring,
            base_url: "https://repo.test/main".to_string(),
        })
    }

    fn engine(&self, root: Arc<dyn RootFs>, cache: &std::path::Path) -> Apk {
        self.engine_with(root, cache, Arc::new(DirFetcher::new(self.dir.path().into())), false)
    }

    fn engine_with(
        &self,
        root: Arc<dyn RootFs>,
        cache: &std::path::Path,
        fetcher: Arc<dyn Fetcher>,
        offline: bool,
    ) -> Apk {
        let mut config = ApkConfig::new(root, cache);
        config.keyring = self.keyring.clone();
        config.arch = "x86_64".to_string();
        config.fetcher = Some(fetcher);
        config.offline = offline;
        Apk::new(config)
    }
}

fn hello_package() -> (Package, Vec<Item<'static>>) {
    let pkg = Package {
        name: "hello".into(),
        version: "2.12.1-r0".into(),
        arch: "x86_64".into(),
        origin: "hello".into(),
        installed_size: 4096,
        ..Default::default()
    };
    let files = vec![
        Item::Dir("usr", 0o755),
        Item::Dir("usr/bin", 0o755),
        Item::File("usr/bin/hello", b"#!/bin/sh\necho hello world\n", 0o755),
    ];
    (pkg, files)
}

#[test]
fn test_install_hello_end_to_end() -> Result<()> {
    let mut packages = vec![hello_package()];
    let repo = TestRepo::build(&mut packages)?;
    let cache = tempfile::tempdir()?;

    let root = MemFs::new();
    let apk = repo.engine(Arc::new(root.clone()), cache.path());

    let cancel = CancelToken::new();
    let load = apk.load_indexes(&[repo.base_url.clone()], &cancel)?;
    assert!(load.failures.is_empty(), "failures: {:?}", load.failures);
    assert_eq!(load.indexes.len(), 1);

    let world = World::from_names(&["hello"]);
    let plan = apk.resolve(&world, &load.indexes)?;
    assert_eq!(plan.packages.len(), 1);
    assert_eq!(plan.packages[0].name, "hello");
    assert_eq!(plan.packages[0].version, "2.12.1-r0");

    let report = apk.install(&plan, &cancel)?;
    assert_eq!(report.installed, vec!["hello".to_string()]);

    let st = root.stat("usr/bin/hello")?;
    assert_eq!(st.mode, 0o755);
    assert_eq!(
        root.read_file("usr/bin/hello")?,
        b"#!/bin/sh\necho hello world\n"
    );

    let db = apk.installed()?;
    assert!(db.contains("hello"));
    let entry = db.get("hello").unwrap();
    assert_eq!(entry.package.version, "2.12.1-r0");
    let paths: Vec<&str> = entry.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["usr", "usr/bin", "usr/bin/hello"]);

    // installing the same plan again is a no-op
    let report = apk.install(&plan, &cancel)?;
    assert_eq!(report.skipped, vec!["hello".to_string()]);
    assert!(report.installed.is_empty());
    Ok(())
}

#[test]
fn test_corrupt_signature_hides_repository() -> Result<()> {
    let mut packages = vec![hello_package()];
    let repo = TestRepo::build(&mut packages)?;

    // flip bytes in the signed payload
    let index_path = repo.dir.path().join("main/x86_64/APKINDEX.tar.gz");
    let mut bytes = std::fs::read(&index_path)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&index_path, &bytes)?;

    let cache = tempfile::tempdir()?;
    let apk = repo.engine(Arc::new(MemFs::new()), cache.path());
    let load = apk.load_indexes(&[repo.base_url.clone()], &CancelToken::new())?;
    assert!(load.indexes.is_empty(), "corrupt index must not load");
    assert_eq!(load.failures.len(), 1);
    Ok(())
}

#[test]
fn test_offline_with_warm_cache() -> Result<()> {
    let mut packages = vec![hello_package()];
    let repo = TestRepo::build(&mut packages)?;
    let cache = tempfile::tempdir()?;

    // first run online to warm the cache
    {
        let apk = repo.engine(Arc::new(MemFs::new()), cache.path());
        let cancel = CancelToken::new();
        let load = apk.load_indexes(&[repo.base_url.clone()], &cancel)?;
        let plan = apk.resolve(&World::from_names(&["hello"]), &load.indexes)?;
        apk.install(&plan, &cancel)?;
    }

    // second run offline against a dead transport and a fresh root
    let root = MemFs::new();
    let apk = repo.engine_with(
        Arc::new(root.clone()),
        cache.path(),
        Arc::new(DeadFetcher),
        true,
    );
    let cancel = CancelToken::new();
    let load = apk.load_indexes(&[repo.base_url.clone()], &cancel)?;
    assert!(load.failures.is_empty(), "offline load failed: {:?}", load.failures);
    let plan = apk.resolve(&World::from_names(&["hello"]), &load.indexes)?;
    apk.install(&plan, &cancel)?;
    assert!(root.exists("usr/bin/hello"));
    Ok(())
}

#[test]
fn test_offline_with_cold_cache_fails() -> Result<()> {
    let mut packages = vec![hello_package()];
    let repo = TestRepo::build(&mut packages)?;
    let cache = tempfile::tempdir()?;

    let apk = repo.engine_with(
        Arc::new(MemFs::new()),
        cache.path(),
        Arc::new(DeadFetcher),
        true,
    );
    let load = apk.load_indexes(&[repo.base_url.clone()], &CancelToken::new())?;
    assert!(load.indexes.is_empty());
    assert_eq!(load.failures.len(), 1);
    Ok(())
}

#[test]
fn test_conflicting_world_constraints() -> Result<()> {
    let mut a = Package {
        name: "a".into(),
        version: "1-r0".into(),
        arch: "x86_64".into(),
        origin: "a".into(),
        depends: vec!["c=1.0".into()],
        ..Default::default()
    };
    let mut b = Package {
        name: "b".into(),
        version: "1-r0".into(),
        arch: "x86_64".into(),
        origin: "b".into(),
        depends: vec!["c>=2.0".into()],
        ..Default::default()
    };
    let c1 = Package {
        name: "c".into(),
        version: "1.0".into(),
        arch: "x86_64".into(),
        origin: "c".into(),
        ..Default::default()
    };
    let c2 = Package {
        name: "c".into(),
        version: "2.0".into(),
        arch: "x86_64".into(),
        origin: "c".into(),
        ..Default::default()
    };
    a.installed_size = 1;
    b.installed_size = 1;

    let mut packages = vec![
        (a, vec![Item::File("usr/share/a", b"a", 0o644)]),
        (b, vec![Item::File("usr/share/b", b"b", 0o644)]),
        (c1, vec![Item::File("usr/share/c1", b"c", 0o644)]),
        (c2, vec![Item::File("usr/share/c2", b"c", 0o644)]),
    ];
    let repo = TestRepo::build(&mut packages)?;
    let cache = tempfile::tempdir()?;
    let apk = repo.engine(Arc::new(MemFs::new()), cache.path());

    let load = apk.load_indexes(&[repo.base_url.clone()], &CancelToken::new())?;
    let result = apk.resolve(&World::from_names(&["a", "b"]), &load.indexes);
    match result {
        Err(err @ Error::Resolve(_)) => {
            assert!(err.is_resolution_failure());
            assert!(err.to_string().contains("c>=2.0"), "got: {err}");
        }
        other => panic!("expected resolver error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_checksum_mismatch_aborts_install() -> Result<()> {
    let mut packages = vec![hello_package()];
    let repo = TestRepo::build(&mut packages)?;

    // tamper with the archive after the index was built
    let apk_path = repo.dir.path().join("main/x86_64/hello-2.12.1-r0.apk");
    let (tampered, _) = build_apk(
        &Package {
            name: "hello".into(),
            version: "2.12.1-r0".into(),
            arch: "x86_64".into(),
            origin: "imposter".into(),
            ..Default::default()
        },
        &[Item::File("usr/bin/hello", b"evil", 0o755)],
    );
    std::fs::write(&apk_path, &tampered)?;

    let cache = tempfile::tempdir()?;
    let root = MemFs::new();
    let apk = repo.engine(Arc::new(root.clone()), cache.path());
    let cancel = CancelToken::new();
    let load = apk.load_indexes(&[repo.base_url.clone()], &cancel)?;
    let plan = apk.resolve(&World::from_names(&["hello"]), &load.indexes)?;

    let err = apk.install(&plan, &cancel).unwrap_err();
    assert!(err.to_string().contains("checksum"), "got: {err}");
    assert!(!root.exists("usr/bin/hello"));
    Ok(())
}

#[test]
fn test_world_file_written() -> Result<()> {
    let mut packages = vec![hello_package()];
    let repo = TestRepo::build(&mut packages)?;
    let cache = tempfile::tempdir()?;
    let root = MemFs::new();
    let apk = repo.engine(Arc::new(root.clone()), cache.path());

    let world = World::from_names(&["hello", "tool>=1.2@edge"]);
    apk.write_world(&world.atoms)?;
    let mut text = String::new();
    root.open("etc/apk/world")?.read_to_string(&mut text)?;
    assert_eq!(text, "hello\ntool>=1.2@edge\n");
    Ok(())
}

#[test]
fn test_dependency_chain_install_order() -> Result<()> {
    let app = Package {
        name: "app".into(),
        version: "1.0-r0".into(),
        arch: "x86_64".into(),
        origin: "app".into(),
        depends: vec!["lib".into()],
        ..Default::default()
    };
    let lib = Package {
        name: "lib".into(),
        version: "2.0-r0".into(),
        arch: "x86_64".into(),
        origin: "lib".into(),
        ..Default::default()
    };

    let mut packages = vec![
        (app, vec![Item::File("usr/bin/app", b"app", 0o755)]),
        (lib, vec![Item::File("usr/lib/lib.so", b"lib", 0o755)]),
    ];
    let repo = TestRepo::build(&mut packages)?;
    let cache = tempfile::tempdir()?;
    let root = MemFs::new();
    let apk = repo.engine(Arc::new(root.clone()), cache.path());
    let cancel = CancelToken::new();

    let load = apk.load_indexes(&[repo.base_url.clone()], &cancel)?;
    let plan = apk.resolve(&World::from_names(&["app"]), &load.indexes)?;
    let names: Vec<&str> = plan.packages.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["lib", "app"]);

    let report = apk.install(&plan, &cancel)?;
    assert_eq!(report.installed, vec!["lib".to_string(), "app".to_string()]);

    // database stanza order matches plan order
    let mut text = String::new();
    root.open(alpk::INSTALLED_DB_PATH)?.read_to_string(&mut text)?;
    let db = InstalledDb::parse(&text);
    let db_names: Vec<&str> = db.packages.iter().map(|p| p.package.name.as_str()).collect();
    assert_eq!(db_names, vec!["lib", "app"]);
    Ok(())
}

#[test]
fn test_cancellation_between_packages() -> Result<()> {
    let mut packages = vec![hello_package()];
    let repo = TestRepo::build(&mut packages)?;
    let cache = tempfile::tempdir()?;
    let apk = repo.engine(Arc::new(MemFs::new()), cache.path());

    let cancel = CancelToken::new();
    let load = apk.load_indexes(&[repo.base_url.clone()], &cancel)?;
    let plan = apk.resolve(&World::from_names(&["hello"]), &load.indexes)?;

    cancel.cancel();
    let err = apk.install(&plan, &cancel).unwrap_err();
    assert!(matches!(err, Error::Cancelled | Error::Install(_)));
    Ok(())
}
