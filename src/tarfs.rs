//! Random-access read-only view over a tar stream.
//!
//! The archive is scanned once through a 1 MiB buffered reader; every
//! entry's header metadata and the absolute offset of its data region are
//! recorded. After that, `open` hands out independent bounded readers, each
//! owning a fresh stream from the supplied factory, so multiple readers can
//! be live at the same time.

use std::collections::HashMap;
use std::io::{self, BufReader, Read, Seek, SeekFrom};

/// PAX record prefix under which tar archives carry extended attributes.
pub const XATTR_PAX_PREFIX: &str = "SCHILY.xattr.";

/// A seekable byte stream over the underlying tar file.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// Factory producing a fresh stream over the same tar bytes.
pub type OpenStream = dyn Fn() -> io::Result<Box<dyn ReadSeek>> + Send + Sync;

/// What kind of filesystem object a tar entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Hardlink,
    CharDevice,
    BlockDevice,
    Fifo,
}

/// Header metadata for one archive member.
#[derive(Debug, Clone)]
pub struct TarEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    pub link_target: Option<String>,
    pub device: Option<(u32, u32)>,
    pub xattrs: Vec<(String, Vec<u8>)>,
    /// Absolute offset of the entry's data region in the tar stream.
    pub offset: u64,
    dir: String,
}

impl TarEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// Read-only random-access view over a tar archive.
pub struct TarFs {
    open_stream: Box<OpenStream>,
    entries: Vec<TarEntry>,
    index: HashMap<String, usize>,
}

impl TarFs {
    /// Scan the archive once and build the entry index.
    pub fn new(open_stream: Box<OpenStream>) -> io::Result<Self> {
        let stream = open_stream()?;
        let mut archive = tar::Archive::new(BufReader::with_capacity(1 << 20, stream));

        let mut entries = Vec::new();
        let mut index = HashMap::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry
                .path()?
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string();
            let header = entry.header();

            let kind = match header.entry_type() {
                tar::EntryType::Directory => EntryKind::Dir,
                tar::EntryType::Symlink => EntryKind::Symlink,
                tar::EntryType::Link => EntryKind::Hardlink,
                tar::EntryType::Char => EntryKind::CharDevice,
                tar::EntryType::Block => EntryKind::BlockDevice,
                tar::EntryType::Fifo => EntryKind::Fifo,
                _ => EntryKind::File,
            };

            let link_target = entry
                .link_name()?
                .map(|p| p.to_string_lossy().into_owned());
            let device = match (header.device_major(), header.device_minor()) {
                (Ok(Some(major)), Ok(Some(minor))) => Some((major, minor)),
                _ => None,
            };

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

            let record = TarEntry {
                dir: parent_of(&name),
                kind,
                size: entry.header().size()?,
                mode: entry.header().mode()?,
                uid: entry.header().uid()?,
                gid: entry.header().gid()?,
                mtime: entry.header().mtime()?,
                link_target,
                device,
                xattrs,
                offset: entry.raw_file_position(),
                name,
            };
            index.insert(record.name.clone(), entries.len());
            entries.push(record);
        }

        Ok(Self {
            open_stream,
            entries,
            index,
        })
    }

    /// All entries in archive order.
    pub fn entries(&self) -> &[TarEntry] {
        &self.entries
    }

    /// Header metadata for one entry. `"."` resolves to a synthesized root
    /// directory when the archive does not carry one.
    pub fn stat(&self, name: &str) -> io::Result<TarEntry> {
        if let Some(&i) = self.index.get(name) {
            return Ok(self.entries[i].clone());
        }
        if name == "." {
            return Ok(TarEntry {
                name: ".".to_string(),
                kind: EntryKind::Dir,
                size: 0,
                mode: 0o755,
                uid: 0,
                gid: 0,
                mtime: 0,
                link_target: None,
                device: None,
                xattrs: Vec::new(),
                offset: 0,
                dir: String::new(),
            });
        }
        Err(not_found(name))
    }

    /// The children of a directory, sorted by name.
    pub fn read_dir(&self, name: &str) -> Vec<&TarEntry> {
        let mut children: Vec<&TarEntry> = self
            .entries
            .iter()
            .filter(|e| e.dir == name)
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        children
    }

    /// Open one entry for reading. The returned handle owns its own stream
    /// and is bounded to the entry's data region.
    pub fn open(&self, name: &str) -> io::Result<TarFile> {
        let &i = self.index.get(name).ok_or_else(|| not_found(name))?;
        let entry = &self.entries[i];

        let mut handle = (self.open_stream)()?;
        if entry.size > 0 {
            handle.seek(SeekFrom::Start(entry.offset))?;
        }
        Ok(TarFile {
            handle,
            offset: entry.offset,
            size: entry.size,
            pos: 0,
        })
    }
}

fn parent_of(name: &str) -> String {
    match name.rfind('/') {
        Some(i) => name[..i].to_string(),
        None => ".".to_string(),
    }
}

fn not_found(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no tar entry {name:?}"))
}

/// A bounded reader over one entry's data region.
///
/// Seeks are translated to absolute offsets in the underlying stream and
/// validated against the entry bounds.
pub struct TarFile {
    handle: Box<dyn ReadSeek>,
    offset: u64,
    size: u64,
    pos: u64,
}

impl TarFile {
    /// Total size of the entry.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Positioned read at `off` within the entry; fills as much of `buf` as
    /// the entry bounds allow and returns the count.
    pub fn read_at(&mut self, buf: &mut [u8], off: u64) -> io::Result<usize> {
        if off >= self.size {
            return Ok(0);
        }
        let avail = (self.size - off) as usize;
        let want = buf.len().min(avail);
        self.handle.seek(SeekFrom::Start(self.offset + off))?;
        self.handle.read_exact(&mut buf[..want])?;
        // Restore the sequential cursor.
        self.handle.seek(SeekFrom::Start(self.offset + self.pos))?;
        Ok(want)
    }
}

impl Read for TarFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size.saturating_sub(self.pos);
        if remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(remaining as usize);
        let n = self.handle.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for TarFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(off) => {
                if off > self.size {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("offset {off} greater than file size {}", self.size),
                    ));
                }
                off as i64
            }
            SeekFrom::End(off) => {
                let target = self.size as i64 + off;
                if target < 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("offset {off} outside file of size {}", self.size),
                    ));
                }
                target
            }
            SeekFrom::Current(off) => self.pos as i64 + off,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of entry",
            ));
        }
        self.pos = target as u64;
        self.handle.seek(SeekFrom::Start(self.offset + self.pos))?;
        Ok(self.pos)
    }
}
