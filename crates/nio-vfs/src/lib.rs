//! In-memory hierarchical filesystem backing the sandboxed program's file
//! descriptors.
//!
//! Content is stored as raw bytes; text is only decoded (UTF-8) at the
//! boundary, in [`Vfs::read_to_string`]. Three reserved stream files always
//! exist: `/dev/stdin`, `/dev/stdout` and `/dev/stderr`. They are created empty
//! by [`Vfs::new`] and are never reset by anything except the caller.

use std::collections::BTreeMap;
use std::fmt;

pub const ROOT: &str = "/";
pub const DEV_DIR: &str = "/dev";
pub const STDIN_PATH: &str = "/dev/stdin";
pub const STDOUT_PATH: &str = "/dev/stdout";
pub const STDERR_PATH: &str = "/dev/stderr";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

impl StdStream {
    pub const ALL: [StdStream; 3] = [StdStream::Stdin, StdStream::Stdout, StdStream::Stderr];

    pub fn path(self) -> &'static str {
        match self {
            StdStream::Stdin => STDIN_PATH,
            StdStream::Stdout => STDOUT_PATH,
            StdStream::Stderr => STDERR_PATH,
        }
    }

    /// File descriptor number the stream is bound to inside an instance.
    pub fn fd(self) -> u32 {
        match self {
            StdStream::Stdin => 0,
            StdStream::Stdout => 1,
            StdStream::Stderr => 2,
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        StdStream::ALL.into_iter().find(|s| s.path() == path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VfsError {
    NotFound(String),
    NotADirectory(String),
    IsADirectory(String),
    AlreadyExists(String),
    NotEmpty(String),
    InvalidPath(String),
    InvalidUtf8(String),
    Reserved(String),
    /// The file could not grow to the requested size.
    TooLarge(String),
}

impl VfsError {
    pub fn path(&self) -> &str {
        match self {
            VfsError::NotFound(p)
            | VfsError::NotADirectory(p)
            | VfsError::IsADirectory(p)
            | VfsError::AlreadyExists(p)
            | VfsError::NotEmpty(p)
            | VfsError::InvalidPath(p)
            | VfsError::InvalidUtf8(p)
            | VfsError::Reserved(p)
            | VfsError::TooLarge(p) => p,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VfsError::NotFound(_))
    }
}

impl fmt::Display for VfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VfsError::NotFound(p) => write!(f, "no such file or directory: {p:?}"),
            VfsError::NotADirectory(p) => write!(f, "not a directory: {p:?}"),
            VfsError::IsADirectory(p) => write!(f, "is a directory: {p:?}"),
            VfsError::AlreadyExists(p) => write!(f, "already exists: {p:?}"),
            VfsError::NotEmpty(p) => write!(f, "directory not empty: {p:?}"),
            VfsError::InvalidPath(p) => write!(f, "invalid path: {p:?}"),
            VfsError::InvalidUtf8(p) => write!(f, "file is not valid utf-8: {p:?}"),
            VfsError::Reserved(p) => write!(f, "reserved stream cannot be removed: {p:?}"),
            VfsError::TooLarge(p) => write!(f, "file too large: {p:?}"),
        }
    }
}

impl std::error::Error for VfsError {}

pub type Result<T> = std::result::Result<T, VfsError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub kind: NodeKind,
    pub len: u64,
    /// Stable per-path identifier, usable as an inode number.
    pub ino: u64,
}

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug, Clone)]
pub struct Vfs {
    nodes: BTreeMap<String, (u64, Node)>,
    next_ino: u64,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub fn new() -> Self {
        let mut vfs = Vfs {
            nodes: BTreeMap::new(),
            next_ino: 1,
        };
        vfs.insert(ROOT.to_string(), Node::Dir);
        vfs.insert(DEV_DIR.to_string(), Node::Dir);
        for stream in StdStream::ALL {
            vfs.insert(stream.path().to_string(), Node::File(Vec::new()));
        }
        vfs
    }

    /// Resolves `path` against `/`, collapsing `.`, `..` and repeated slashes.
    ///
    /// `..` at the root stays at the root.
    pub fn normalize(path: &str) -> Result<String> {
        if path.is_empty() || path.contains('\0') {
            return Err(VfsError::InvalidPath(path.to_string()));
        }
        let mut parts: Vec<&str> = Vec::new();
        for component in path.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                other => parts.push(other),
            }
        }
        if parts.is_empty() {
            return Ok(ROOT.to_string());
        }
        let mut out = String::with_capacity(path.len() + 1);
        for part in parts {
            out.push('/');
            out.push_str(part);
        }
        Ok(out)
    }

    pub fn exists(&self, path: &str) -> bool {
        match Self::normalize(path) {
            Ok(p) => self.nodes.contains_key(&p),
            Err(_) => false,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.metadata(path)
            .is_ok_and(|m| m.kind == NodeKind::Directory)
    }

    pub fn is_file(&self, path: &str) -> bool {
        self.metadata(path).is_ok_and(|m| m.kind == NodeKind::File)
    }

    pub fn metadata(&self, path: &str) -> Result<Metadata> {
        let norm = Self::normalize(path)?;
        match self.nodes.get(&norm) {
            Some((ino, Node::File(data))) => Ok(Metadata {
                kind: NodeKind::File,
                len: data.len() as u64,
                ino: *ino,
            }),
            Some((ino, Node::Dir)) => Ok(Metadata {
                kind: NodeKind::Directory,
                len: 0,
                ino: *ino,
            }),
            None => Err(VfsError::NotFound(norm)),
        }
    }

    pub fn len(&self, path: &str) -> Result<u64> {
        let norm = Self::normalize(path)?;
        self.file(&norm).map(|data| data.len() as u64)
    }

    /// Full content of a file. Fails with [`VfsError::NotFound`] for a path that
    /// was never written.
    pub fn read(&self, path: &str) -> Result<&[u8]> {
        let norm = Self::normalize(path)?;
        self.file(&norm)
    }

    pub fn read_to_string(&self, path: &str) -> Result<String> {
        let norm = Self::normalize(path)?;
        let data = self.file(&norm)?;
        String::from_utf8(data.to_vec()).map_err(|_| VfsError::InvalidUtf8(norm))
    }

    /// Up to `max` bytes starting at `offset`; empty at or past end of file.
    pub fn read_at(&self, path: &str, offset: u64, max: usize) -> Result<&[u8]> {
        let data = self.read(path)?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(max).min(data.len());
        Ok(&data[start..end])
    }

    /// Replaces the content of `path`, creating the file if needed.
    pub fn write(&mut self, path: &str, data: impl AsRef<[u8]>) -> Result<()> {
        let norm = Self::normalize(path)?;
        let buf = self.file_mut_or_create(&norm)?;
        buf.clear();
        buf.extend_from_slice(data.as_ref());
        Ok(())
    }

    /// Concatenates `data` onto `path`, creating the file if needed.
    pub fn append(&mut self, path: &str, data: impl AsRef<[u8]>) -> Result<()> {
        let norm = Self::normalize(path)?;
        self.file_mut_or_create(&norm)?
            .extend_from_slice(data.as_ref());
        Ok(())
    }

    /// Writes `data` at `offset` of an existing file, zero-filling any gap.
    pub fn write_at(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<()> {
        let norm = Self::normalize(path)?;
        let buf = self.file_mut(&norm)?;
        let start = usize::try_from(offset).map_err(|_| VfsError::TooLarge(norm.clone()))?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| VfsError::TooLarge(norm.clone()))?;
        if buf.len() < end {
            buf.try_reserve_exact(end - buf.len())
                .map_err(|_| VfsError::TooLarge(norm.clone()))?;
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Creates an empty file; fails if anything already exists at `path`.
    pub fn create_new(&mut self, path: &str) -> Result<()> {
        let norm = Self::normalize(path)?;
        if self.nodes.contains_key(&norm) {
            return Err(VfsError::AlreadyExists(norm));
        }
        self.check_parent(&norm)?;
        self.insert(norm, Node::File(Vec::new()));
        Ok(())
    }

    pub fn truncate(&mut self, path: &str) -> Result<()> {
        let norm = Self::normalize(path)?;
        self.file_mut(&norm)?.clear();
        Ok(())
    }

    pub fn create_dir(&mut self, path: &str) -> Result<()> {
        let norm = Self::normalize(path)?;
        if self.nodes.contains_key(&norm) {
            return Err(VfsError::AlreadyExists(norm));
        }
        self.check_parent(&norm)?;
        self.insert(norm, Node::Dir);
        Ok(())
    }

    pub fn create_dir_all(&mut self, path: &str) -> Result<()> {
        let norm = Self::normalize(path)?;
        let mut cur = String::new();
        for part in norm.split('/').filter(|p| !p.is_empty()) {
            cur.push('/');
            cur.push_str(part);
            match self.nodes.get(&cur) {
                Some((_, Node::Dir)) => {}
                Some((_, Node::File(_))) => return Err(VfsError::NotADirectory(cur)),
                None => self.insert(cur.clone(), Node::Dir),
            }
        }
        Ok(())
    }

    /// Names of the direct children of a directory, sorted.
    pub fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let norm = Self::normalize(path)?;
        match self.nodes.get(&norm) {
            Some((_, Node::Dir)) => {}
            Some((_, Node::File(_))) => return Err(VfsError::NotADirectory(norm)),
            None => return Err(VfsError::NotFound(norm)),
        }
        Ok(self.children(&norm).map(str::to_string).collect())
    }

    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        let norm = Self::normalize(path)?;
        if StdStream::from_path(&norm).is_some() {
            return Err(VfsError::Reserved(norm));
        }
        match self.nodes.get(&norm) {
            Some((_, Node::File(_))) => {
                self.nodes.remove(&norm);
                Ok(())
            }
            Some((_, Node::Dir)) => Err(VfsError::IsADirectory(norm)),
            None => Err(VfsError::NotFound(norm)),
        }
    }

    pub fn remove_dir(&mut self, path: &str) -> Result<()> {
        let norm = Self::normalize(path)?;
        match self.nodes.get(&norm) {
            Some((_, Node::Dir)) => {}
            Some((_, Node::File(_))) => return Err(VfsError::NotADirectory(norm)),
            None => return Err(VfsError::NotFound(norm)),
        }
        if norm == ROOT || self.children(&norm).next().is_some() {
            return Err(VfsError::NotEmpty(norm));
        }
        self.nodes.remove(&norm);
        Ok(())
    }

    /// Content of a reserved stream.
    pub fn stream(&self, stream: StdStream) -> &[u8] {
        match self.nodes.get(stream.path()) {
            Some((_, Node::File(data))) => data,
            _ => &[],
        }
    }

    pub fn stream_len(&self, stream: StdStream) -> usize {
        self.stream(stream).len()
    }

    pub fn clear_stream(&mut self, stream: StdStream) {
        if let Some((_, Node::File(data))) = self.nodes.get_mut(stream.path()) {
            data.clear();
        }
    }

    fn insert(&mut self, path: String, node: Node) {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(path, (ino, node));
    }

    fn children<'a>(&'a self, dir: &str) -> impl Iterator<Item = &'a str> + 'a {
        let prefix = if dir == ROOT {
            ROOT.to_string()
        } else {
            format!("{dir}/")
        };
        let skip = prefix.len();
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .filter_map(move |(k, _)| {
                let rest = &k[skip..];
                (!rest.is_empty() && !rest.contains('/')).then_some(rest)
            })
    }

    fn check_parent(&self, norm: &str) -> Result<()> {
        let parent = match norm.rfind('/') {
            Some(0) => ROOT,
            Some(idx) => &norm[..idx],
            None => return Err(VfsError::InvalidPath(norm.to_string())),
        };
        match self.nodes.get(parent) {
            Some((_, Node::Dir)) => Ok(()),
            Some((_, Node::File(_))) => Err(VfsError::NotADirectory(parent.to_string())),
            None => Err(VfsError::NotFound(parent.to_string())),
        }
    }

    fn file(&self, norm: &str) -> Result<&[u8]> {
        match self.nodes.get(norm) {
            Some((_, Node::File(data))) => Ok(data),
            Some((_, Node::Dir)) => Err(VfsError::IsADirectory(norm.to_string())),
            None => Err(VfsError::NotFound(norm.to_string())),
        }
    }

    fn file_mut(&mut self, norm: &str) -> Result<&mut Vec<u8>> {
        match self.nodes.get_mut(norm) {
            Some((_, Node::File(data))) => Ok(data),
            Some((_, Node::Dir)) => Err(VfsError::IsADirectory(norm.to_string())),
            None => Err(VfsError::NotFound(norm.to_string())),
        }
    }

    fn file_mut_or_create(&mut self, norm: &str) -> Result<&mut Vec<u8>> {
        if !self.nodes.contains_key(norm) {
            self.check_parent(norm)?;
            self.insert(norm.to_string(), Node::File(Vec::new()));
        }
        self.file_mut(norm)
    }
}
