//! Target-root filesystem abstraction.
//!
//! The installer mutates a target root only through [`RootFs`], so the
//! engine can drive a real chroot-style backend, an image builder, or the
//! in-memory [`MemFs`] below. Paths are forward-slash and relative to the
//! root ("etc/passwd", not "/etc/passwd").
//!
//! `MemFs` implements the full surface including xattrs, symlinks,
//! hardlinks and device nodes; it backs the test-suite and is useful for
//! assembling images without touching disk.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};

/// What kind of node a path holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
}

/// Stat result for one path.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }
}

/// The filesystem operations the installer needs from a target root.
pub trait RootFs: Send + Sync {
    fn mkdir_all(&self, path: &str, mode: u32) -> io::Result<()>;
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>>;
    /// Create or truncate a regular file and write `data` to it.
    fn write_file(&self, path: &str, data: &[u8], mode: u32) -> io::Result<()>;
    fn remove(&self, path: &str) -> io::Result<()>;
    fn stat(&self, path: &str) -> io::Result<FileInfo>;
    fn read_dir(&self, path: &str) -> io::Result<Vec<String>>;
    fn symlink(&self, target: &str, link: &str) -> io::Result<()>;
    fn read_link(&self, path: &str) -> io::Result<String>;
    fn hardlink(&self, target: &str, link: &str) -> io::Result<()>;
    fn mknod(&self, path: &str, kind: NodeKind, mode: u32, major: u32, minor: u32)
        -> io::Result<()>;
    fn chmod(&self, path: &str, mode: u32) -> io::Result<()>;
    fn chown(&self, path: &str, uid: u32, gid: u32) -> io::Result<()>;
    fn set_mtime(&self, path: &str, mtime: i64) -> io::Result<()>;
    fn set_xattr(&self, path: &str, name: &str, value: &[u8]) -> io::Result<()>;
    fn list_xattrs(&self, path: &str) -> io::Result<Vec<(String, Vec<u8>)>>;

    /// Read a whole file into memory.
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.open(path)?.read_to_end(&mut out)?;
        Ok(out)
    }

    fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: i64,
    data: Arc<Vec<u8>>,
    link_target: String,
    device: (u32, u32),
    xattrs: BTreeMap<String, Vec<u8>>,
}

impl Node {
    fn new(kind: NodeKind, mode: u32) -> Self {
        Self {
            kind,
            mode,
            uid: 0,
            gid: 0,
            mtime: 0,
            data: Arc::new(Vec::new()),
            link_target: String::new(),
            device: (0, 0),
            xattrs: BTreeMap::new(),
        }
    }
}

/// In-memory [`RootFs`].
#[derive(Default, Clone)]
pub struct MemFs {
    nodes: Arc<Mutex<BTreeMap<String, Node>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn insert(&self, path: &str, node: Node) {
        self.nodes.lock().unwrap().insert(Self::normalize(path), node);
    }

    fn with_node<T>(
        &self,
        path: &str,
        f: impl FnOnce(&mut Node) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(&Self::normalize(path))
            .ok_or_else(|| not_found(path))?;
        f(node)
    }
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such path {path:?}"))
}

impl RootFs for MemFs {
    fn mkdir_all(&self, path: &str, mode: u32) -> io::Result<()> {
        let path = Self::normalize(path);
        if path.is_empty() {
            return Ok(());
        }
        let mut nodes = self.nodes.lock().unwrap();
        let mut partial = String::new();
        for part in path.split('/') {
            if !partial.is_empty() {
                partial.push('/');
            }
            partial.push_str(part);
            match nodes.get(&partial) {
                Some(node) if node.kind == NodeKind::Dir => {}
                Some(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{partial:?} exists and is not a directory"),
                    ))
                }
                None => {
                    nodes.insert(partial.clone(), Node::new(NodeKind::Dir, mode));
                }
            }
        }
        Ok(())
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        self.with_node(path, |node| match node.kind {
            NodeKind::File => Ok(Box::new(Cursor::new(ArcData(Arc::clone(&node.data))))
                as Box<dyn Read + Send>),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{path:?} is not a regular file"),
            )),
        })
    }

    fn write_file(&self, path: &str, data: &[u8], mode: u32) -> io::Result<()> {
        let mut node = Node::new(NodeKind::File, mode);
        node.data = Arc::new(data.to_vec());
        self.insert(path, node);
        Ok(())
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        self.nodes
            .lock()
            .unwrap()
            .remove(&Self::normalize(path))
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    fn stat(&self, path: &str) -> io::Result<FileInfo> {
        self.with_node(path, |node| {
            Ok(FileInfo {
                kind: node.kind,
                mode: node.mode,
                uid: node.uid,
                gid: node.gid,
                size: node.data.len() as u64,
                mtime: node.mtime,
            })
        })
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<String>> {
        let prefix = Self::normalize(path);
        let nodes = self.nodes.lock().unwrap();
        let mut children: Vec<String> = nodes
            .keys()
            .filter(|k| match prefix.as_str() {
                "" => !k.contains('/'),
                p => {
                    k.starts_with(p)
                        && k.len() > p.len() + 1
                        && k.as_bytes()[p.len()] == b'/'
                        && !k[p.len() + 1..].contains('/')
                }
            })
            .cloned()
            .collect();
        children.sort();
        Ok(children)
    }

    fn symlink(&self, target: &str, link: &str) -> io::Result<()> {
        let mut node = Node::new(NodeKind::Symlink, 0o777);
        node.link_target = target.to_string();
        self.insert(link, node);
        Ok(())
    }

    fn read_link(&self, path: &str) -> io::Result<String> {
        self.with_node(path, |node| match node.kind {
            NodeKind::Symlink => Ok(node.link_target.clone()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{path:?} is not a symlink"),
            )),
        })
    }

    fn hardlink(&self, target: &str, link: &str) -> io::Result<()> {
        let existing = self.with_node(target, |node| Ok(node.clone()))?;
        self.insert(link, existing);
        Ok(())
    }

    fn mknod(
        &self,
        path: &str,
        kind: NodeKind,
        mode: u32,
        major: u32,
        minor: u32,
    ) -> io::Result<()> {
        let mut node = Node::new(kind, mode);
        node.device = (major, minor);
        self.insert(path, node);
        Ok(())
    }

    fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        self.with_node(path, |node| {
            node.mode = mode;
            Ok(())
        })
    }

    fn chown(&self, path: &str, uid: u32, gid: u32) -> io::Result<()> {
        self.with_node(path, |node| {
            node.uid = uid;
            node.gid = gid;
            Ok(())
        })
    }

    fn set_mtime(&self, path: &str, mtime: i64) -> io::Result<()> {
        self.with_node(path, |node| {
            node.mtime = mtime;
            Ok(())
        })
    }

    fn set_xattr(&self, path: &str, name: &str, value: &[u8]) -> io::Result<()> {
        self.with_node(path, |node| {
            node.xattrs.insert(name.to_string(), value.to_vec());
            Ok(())
        })
    }

    fn list_xattrs(&self, path: &str) -> io::Result<Vec<(String, Vec<u8>)>> {
        self.with_node(path, |node| {
            Ok(node.xattrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        })
    }
}

/// Lets a `Cursor` read shared bytes without copying them per open.
struct ArcData(Arc<Vec<u8>>);

impl AsRef<[u8]> for ArcData {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip() {
        let fs = MemFs::new();
        fs.mkdir_all("etc/apk", 0o755).unwrap();
        fs.write_file("etc/apk/world", b"busybox\n", 0o644).unwrap();
        assert_eq!(fs.read_file("etc/apk/world").unwrap(), b"busybox\n");

        let st = fs.stat("etc/apk/world").unwrap();
        assert_eq!(st.mode, 0o644);
        assert_eq!(st.size, 8);
        assert!(fs.stat("etc/apk").unwrap().is_dir());
    }

    #[test]
    fn test_mkdir_all_intermediate() {
        let fs = MemFs::new();
        fs.mkdir_all("a/b/c", 0o700).unwrap();
        assert!(fs.stat("a").unwrap().is_dir());
        assert!(fs.stat("a/b").unwrap().is_dir());
        assert_eq!(fs.stat("a/b/c").unwrap().mode, 0o700);
    }

    #[test]
    fn test_read_dir() {
        let fs = MemFs::new();
        fs.mkdir_all("usr/bin", 0o755).unwrap();
        fs.write_file("usr/bin/hello", b"x", 0o755).unwrap();
        fs.write_file("usr/bin/env", b"y", 0o755).unwrap();
        assert_eq!(
            fs.read_dir("usr/bin").unwrap(),
            vec!["usr/bin/env".to_string(), "usr/bin/hello".to_string()]
        );
        assert_eq!(fs.read_dir("").unwrap(), vec!["usr".to_string()]);
    }

    #[test]
    fn test_symlink_and_hardlink() {
        let fs = MemFs::new();
        fs.write_file("bin/busybox", b"real", 0o755).unwrap();
        fs.symlink("busybox", "bin/sh").unwrap();
        assert_eq!(fs.read_link("bin/sh").unwrap(), "busybox");

        fs.hardlink("bin/busybox", "bin/ash").unwrap();
        assert_eq!(fs.read_file("bin/ash").unwrap(), b"real");
    }

    #[test]
    fn test_xattrs() {
        let fs = MemFs::new();
        fs.write_file("bin/ping", b"x", 0o755).unwrap();
        fs.set_xattr("bin/ping", "security.capability", b"\x01\x00").unwrap();
        let xattrs = fs.list_xattrs("bin/ping").unwrap();
        assert_eq!(xattrs, vec![("security.capability".to_string(), b"\x01\x00".to_vec())]);
    }

    #[test]
    fn test_chown_chmod_mtime() {
        let fs = MemFs::new();
        fs.write_file("f", b"", 0o600).unwrap();
        fs.chmod("f", 0o640).unwrap();
        fs.chown("f", 100, 101).unwrap();
        fs.set_mtime("f", 1700000000).unwrap();
        let st = fs.stat("f").unwrap();
        assert_eq!((st.mode, st.uid, st.gid, st.mtime), (0o640, 100, 101, 1700000000));
    }

    #[test]
    fn test_remove_and_missing() {
        let fs = MemFs::new();
        fs.write_file("f", b"", 0o600).unwrap();
        fs.remove("f").unwrap();
        assert!(!fs.exists("f"));
        assert!(fs.remove("f").is_err());
        assert!(fs.open("f").is_err());
    }
}
