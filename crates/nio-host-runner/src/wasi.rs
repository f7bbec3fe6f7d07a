//! A `wasi_snapshot_preview1` host backed by an in-memory [`Vfs`].
//!
//! Only the calls a command-style program needs are provided: argument and
//! environment discovery, stream and file I/O through a single preopened `/`,
//! clocks, randomness and `proc_exit`. Any other import resolves to a trap.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context as _, Result};
use nio_contracts::{MEMORY_EXPORT, WASI_PREVIEW1_MODULE};
use nio_vfs::{NodeKind, StdStream, Vfs, VfsError, ROOT};
use serde::Serialize;
use wasmtime::{
    AsContext, AsContextMut, Caller, Extern, Linker, Memory, StoreLimits, StoreLimitsBuilder,
};

use crate::config::RunnerLimits;

const FILETYPE_CHARACTER_DEVICE: u8 = 2;
const FILETYPE_DIRECTORY: u8 = 3;
const FILETYPE_REGULAR_FILE: u8 = 4;

const OFLAGS_CREAT: u16 = 1;
const OFLAGS_DIRECTORY: u16 = 2;
const OFLAGS_EXCL: u16 = 4;
const OFLAGS_TRUNC: u16 = 8;

const FDFLAGS_APPEND: u16 = 1;

const WHENCE_SET: i32 = 0;
const WHENCE_CUR: i32 = 1;
const WHENCE_END: i32 = 2;

const CLOCK_REALTIME: i32 = 0;
const CLOCK_MONOTONIC: i32 = 1;
const CLOCK_PROCESS_CPUTIME: i32 = 2;
const CLOCK_THREAD_CPUTIME: i32 = 3;

const FDSTAT_SIZE: usize = 24;
const FILESTAT_SIZE: usize = 64;
const PRESTAT_SIZE: usize = 8;

const RNG_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Largest size a guest may grow a regular file to.
const MAX_FILE_BYTES: usize = 1 << 30;

/// The errno subset this host reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum Errno {
    Success = 0,
    Acces = 2,
    Badf = 8,
    Exist = 20,
    Fault = 21,
    Fbig = 22,
    Inval = 28,
    Isdir = 31,
    Ilseq = 25,
    Noent = 44,
    Notdir = 54,
    Notempty = 55,
    Overflow = 61,
    Perm = 63,
    Spipe = 70,
}

impl From<VfsError> for Errno {
    fn from(err: VfsError) -> Self {
        match err {
            VfsError::NotFound(_) => Errno::Noent,
            VfsError::NotADirectory(_) => Errno::Notdir,
            VfsError::IsADirectory(_) => Errno::Isdir,
            VfsError::AlreadyExists(_) => Errno::Exist,
            VfsError::NotEmpty(_) => Errno::Notempty,
            VfsError::InvalidPath(_) => Errno::Inval,
            VfsError::InvalidUtf8(_) => Errno::Ilseq,
            VfsError::Reserved(_) => Errno::Perm,
            VfsError::TooLarge(_) => Errno::Fbig,
        }
    }
}

/// Either an errno returned to the guest or a trap that aborts it.
#[derive(Debug)]
pub(crate) enum HostError {
    Errno(Errno),
    Trap(anyhow::Error),
}

impl From<Errno> for HostError {
    fn from(errno: Errno) -> Self {
        HostError::Errno(errno)
    }
}

impl From<VfsError> for HostError {
    fn from(err: VfsError) -> Self {
        HostError::Errno(err.into())
    }
}

fn finish(res: std::result::Result<(), HostError>) -> Result<i32> {
    match res {
        Ok(()) => Ok(Errno::Success as i32),
        Err(HostError::Errno(errno)) => Ok(errno as i32),
        Err(HostError::Trap(err)) => Err(err),
    }
}

/// Raised by `proc_exit` to unwind the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcExit(pub u32);

impl fmt::Display for ProcExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc_exit({})", self.0)
    }
}

impl std::error::Error for ProcExit {}

/// Per-execution I/O counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoStats {
    pub bytes_read: u64,
    pub bytes_written_stdout: u64,
    pub bytes_written_stderr: u64,
    pub files_opened: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FdKind {
    Stream(StdStream),
    File,
    Directory,
}

impl FdKind {
    fn filetype(self) -> u8 {
        match self {
            FdKind::Stream(_) => FILETYPE_CHARACTER_DEVICE,
            FdKind::File => FILETYPE_REGULAR_FILE,
            FdKind::Directory => FILETYPE_DIRECTORY,
        }
    }
}

#[derive(Debug, Clone)]
struct OpenFile {
    path: String,
    kind: FdKind,
    offset: u64,
    append: bool,
    preopen: Option<String>,
}

impl OpenFile {
    fn stream(stream: StdStream) -> Self {
        OpenFile {
            path: stream.path().to_string(),
            kind: FdKind::Stream(stream),
            offset: 0,
            append: stream != StdStream::Stdin,
            preopen: None,
        }
    }
}

/// Store data for one instance: the VFS it owns for the duration of the
/// run, its fd table, and its limits.
pub(crate) struct WasiHost {
    vfs: Vfs,
    fds: BTreeMap<u32, OpenFile>,
    next_fd: u32,
    args: Vec<String>,
    env: Vec<String>,
    limits: StoreLimits,
    max_output_bytes: Option<usize>,
    max_file_bytes: usize,
    io: IoStats,
    rng: u64,
    started: Instant,
}

impl WasiHost {
    pub(crate) fn new(
        vfs: Vfs,
        args: Vec<String>,
        env: &[(String, String)],
        limits: &RunnerLimits,
    ) -> Self {
        let mut fds = BTreeMap::new();
        for stream in StdStream::ALL {
            fds.insert(stream.fd(), OpenFile::stream(stream));
        }
        fds.insert(
            3,
            OpenFile {
                path: ROOT.to_string(),
                kind: FdKind::Directory,
                offset: 0,
                append: false,
                preopen: Some(ROOT.to_string()),
            },
        );

        let mut store_limits = StoreLimitsBuilder::new().instances(1);
        if let Some(bytes) = limits.max_memory_bytes {
            store_limits = store_limits.memory_size(bytes);
        }

        WasiHost {
            vfs,
            fds,
            next_fd: 4,
            args,
            env: env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            limits: store_limits.build(),
            max_output_bytes: limits.max_output_bytes,
            max_file_bytes: limits
                .max_memory_bytes
                .map_or(MAX_FILE_BYTES, |bytes| bytes.min(MAX_FILE_BYTES)),
            io: IoStats::default(),
            rng: RNG_SEED,
            started: Instant::now(),
        }
    }

    pub(crate) fn limiter(&mut self) -> &mut StoreLimits {
        &mut self.limits
    }

    pub(crate) fn io(&self) -> IoStats {
        self.io
    }

    pub(crate) fn into_vfs(self) -> Vfs {
        self.vfs
    }

    fn open(&self, fd: u32) -> std::result::Result<&OpenFile, Errno> {
        self.fds.get(&fd).ok_or(Errno::Badf)
    }

    fn dir_path(&self, fd: u32) -> std::result::Result<String, Errno> {
        let file = self.open(fd)?;
        if file.kind != FdKind::Directory {
            return Err(Errno::Notdir);
        }
        Ok(file.path.clone())
    }

    fn resolve(&self, dirfd: u32, path: &str) -> std::result::Result<String, Errno> {
        let base = self.dir_path(dirfd)?;
        let joined = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{base}/{path}")
        };
        Ok(Vfs::normalize(&joined)?)
    }

    fn random_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(len + 8);
        while bytes.len() < len {
            let word = self.next_random();
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes.truncate(len);
        bytes
    }

    fn next_random(&mut self) -> u64 {
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        x
    }

    pub(crate) fn fd_read(&mut self, fd: u32, max: usize) -> std::result::Result<Vec<u8>, Errno> {
        let file = self.fds.get_mut(&fd).ok_or(Errno::Badf)?;
        if file.kind == FdKind::Directory {
            return Err(Errno::Isdir);
        }
        let data = self.vfs.read_at(&file.path, file.offset, max)?.to_vec();
        file.offset += data.len() as u64;
        self.io.bytes_read += data.len() as u64;
        Ok(data)
    }

    pub(crate) fn fd_write(
        &mut self,
        fd: u32,
        data: &[u8],
    ) -> std::result::Result<usize, HostError> {
        let file = self.fds.get_mut(&fd).ok_or(Errno::Badf)?;
        let stream = match file.kind {
            FdKind::Directory => return Err(Errno::Isdir.into()),
            FdKind::Stream(StdStream::Stdin) => return Err(Errno::Badf.into()),
            FdKind::Stream(stream) => Some(stream),
            FdKind::File => None,
        };

        if let (Some(stream), Some(cap)) = (stream, self.max_output_bytes) {
            let written = self.io.bytes_written_stdout + self.io.bytes_written_stderr;
            if written.saturating_add(data.len() as u64) > cap as u64 {
                let name = match stream {
                    StdStream::Stderr => "stderr",
                    _ => "stdout",
                };
                return Err(HostError::Trap(anyhow!(
                    "{name} exceeded cap of {cap} bytes"
                )));
            }
        }

        if stream.is_none() {
            let start = if file.append {
                self.vfs.len(&file.path)?
            } else {
                file.offset
            };
            let end = start.saturating_add(data.len() as u64);
            if end > self.max_file_bytes as u64 {
                return Err(Errno::Fbig.into());
            }
        }

        if file.append {
            self.vfs.append(&file.path, data)?;
            file.offset = self.vfs.len(&file.path)?;
        } else {
            self.vfs.write_at(&file.path, file.offset, data)?;
            file.offset += data.len() as u64;
        }

        match stream {
            Some(StdStream::Stdout) => self.io.bytes_written_stdout += data.len() as u64,
            Some(StdStream::Stderr) => self.io.bytes_written_stderr += data.len() as u64,
            _ => {}
        }
        Ok(data.len())
    }

    pub(crate) fn fd_seek(
        &mut self,
        fd: u32,
        delta: i64,
        whence: i32,
    ) -> std::result::Result<u64, Errno> {
        let file = self.fds.get_mut(&fd).ok_or(Errno::Badf)?;
        match file.kind {
            FdKind::Stream(_) => return Err(Errno::Spipe),
            FdKind::Directory => return Err(Errno::Isdir),
            FdKind::File => {}
        }
        let base = match whence {
            WHENCE_SET => 0,
            WHENCE_CUR => file.offset,
            WHENCE_END => self.vfs.len(&file.path)?,
            _ => return Err(Errno::Inval),
        };
        let target = i128::from(base) + i128::from(delta);
        let target = u64::try_from(target).map_err(|_| Errno::Inval)?;
        file.offset = target;
        Ok(target)
    }

    pub(crate) fn fd_close(&mut self, fd: u32) -> std::result::Result<(), Errno> {
        self.fds.remove(&fd).map(|_| ()).ok_or(Errno::Badf)
    }

    pub(crate) fn path_open(
        &mut self,
        dirfd: u32,
        path: &str,
        oflags: u16,
        fdflags: u16,
    ) -> std::result::Result<u32, Errno> {
        let full = self.resolve(dirfd, path)?;
        let exists = self.vfs.exists(&full);

        if oflags & OFLAGS_DIRECTORY != 0 && !self.vfs.is_dir(&full) {
            return Err(if exists { Errno::Notdir } else { Errno::Noent });
        }
        if exists && oflags & OFLAGS_CREAT != 0 && oflags & OFLAGS_EXCL != 0 {
            return Err(Errno::Exist);
        }

        let open = if let Some(stream) = StdStream::from_path(&full) {
            // Streams stay append-only whatever flags the guest passes.
            OpenFile::stream(stream)
        } else if self.vfs.is_dir(&full) {
            if oflags & OFLAGS_TRUNC != 0 {
                return Err(Errno::Isdir);
            }
            OpenFile {
                path: full,
                kind: FdKind::Directory,
                offset: 0,
                append: false,
                preopen: None,
            }
        } else {
            if !exists {
                if oflags & OFLAGS_CREAT == 0 {
                    return Err(Errno::Noent);
                }
                self.vfs.create_new(&full)?;
            } else if oflags & OFLAGS_TRUNC != 0 {
                self.vfs.truncate(&full)?;
            }
            OpenFile {
                path: full,
                kind: FdKind::File,
                offset: 0,
                append: fdflags & FDFLAGS_APPEND != 0,
                preopen: None,
            }
        };

        let fd = self.next_fd;
        self.next_fd = self.next_fd.checked_add(1).ok_or(Errno::Overflow)?;
        self.fds.insert(fd, open);
        self.io.files_opened += 1;
        Ok(fd)
    }

    fn fdstat(&self, fd: u32) -> std::result::Result<[u8; FDSTAT_SIZE], Errno> {
        let file = self.open(fd)?;
        let mut buf = [0u8; FDSTAT_SIZE];
        buf[0] = file.kind.filetype();
        let flags: u16 = if file.append { FDFLAGS_APPEND } else { 0 };
        buf[2..4].copy_from_slice(&flags.to_le_bytes());
        buf[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
        buf[16..24].copy_from_slice(&u64::MAX.to_le_bytes());
        Ok(buf)
    }

    fn filestat_of(
        &self,
        path: &str,
        filetype: Option<u8>,
    ) -> std::result::Result<[u8; FILESTAT_SIZE], Errno> {
        let meta = self.vfs.metadata(path)?;
        let filetype = filetype.unwrap_or(match meta.kind {
            NodeKind::File => FILETYPE_REGULAR_FILE,
            NodeKind::Directory => FILETYPE_DIRECTORY,
        });
        let mut buf = [0u8; FILESTAT_SIZE];
        buf[8..16].copy_from_slice(&meta.ino.to_le_bytes());
        buf[16] = filetype;
        buf[24..32].copy_from_slice(&1u64.to_le_bytes());
        buf[32..40].copy_from_slice(&meta.len.to_le_bytes());
        Ok(buf)
    }

    fn fd_filestat(&self, fd: u32) -> std::result::Result<[u8; FILESTAT_SIZE], Errno> {
        let file = self.open(fd)?;
        self.filestat_of(&file.path, Some(file.kind.filetype()))
    }

    fn clock_nanos(&self, id: i32) -> std::result::Result<u64, Errno> {
        match id {
            CLOCK_REALTIME => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_err(|_| Errno::Inval)?;
                u64::try_from(now.as_nanos()).map_err(|_| Errno::Overflow)
            }
            CLOCK_MONOTONIC | CLOCK_PROCESS_CPUTIME | CLOCK_THREAD_CPUTIME => {
                u64::try_from(self.started.elapsed().as_nanos()).map_err(|_| Errno::Overflow)
            }
            _ => Err(Errno::Inval),
        }
    }
}

fn memory(caller: &mut Caller<'_, WasiHost>) -> Result<Memory> {
    caller
        .get_export(MEMORY_EXPORT)
        .and_then(Extern::into_memory)
        .context("instance does not export linear memory")
}

fn guest_range(
    mem: &Memory,
    store: impl AsContext,
    ptr: u32,
    len: usize,
) -> std::result::Result<usize, Errno> {
    let start = ptr as usize;
    let end = start.checked_add(len).ok_or(Errno::Fault)?;
    if end > mem.data_size(store) {
        return Err(Errno::Fault);
    }
    Ok(start)
}

fn read_guest(
    mem: &Memory,
    store: impl AsContext,
    ptr: u32,
    len: u32,
) -> std::result::Result<Vec<u8>, Errno> {
    let store = store.as_context();
    let start = guest_range(mem, &store, ptr, len as usize)?;
    let mut buf = vec![0u8; len as usize];
    mem.read(&store, start, &mut buf).map_err(|_| Errno::Fault)?;
    Ok(buf)
}

fn write_guest(
    mem: &Memory,
    mut store: impl AsContextMut,
    ptr: u32,
    bytes: &[u8],
) -> std::result::Result<(), Errno> {
    let mut store = store.as_context_mut();
    let start = guest_range(mem, &store, ptr, bytes.len())?;
    mem.write(&mut store, start, bytes).map_err(|_| Errno::Fault)
}

fn write_u32(
    mem: &Memory,
    store: impl AsContextMut,
    ptr: u32,
    value: u32,
) -> std::result::Result<(), Errno> {
    write_guest(mem, store, ptr, &value.to_le_bytes())
}

fn write_u64(
    mem: &Memory,
    store: impl AsContextMut,
    ptr: u32,
    value: u64,
) -> std::result::Result<(), Errno> {
    write_guest(mem, store, ptr, &value.to_le_bytes())
}

fn read_iovecs(
    mem: &Memory,
    store: impl AsContext,
    iovs: u32,
    count: u32,
) -> std::result::Result<Vec<(u32, u32)>, Errno> {
    let byte_len = count.checked_mul(8).ok_or(Errno::Fault)?;
    let raw = read_guest(mem, store, iovs, byte_len)?;
    Ok(raw
        .chunks_exact(8)
        .map(|chunk| {
            let ptr = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let len = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            (ptr, len)
        })
        .collect())
}

fn read_path(
    mem: &Memory,
    store: impl AsContext,
    ptr: u32,
    len: u32,
) -> std::result::Result<String, Errno> {
    String::from_utf8(read_guest(mem, store, ptr, len)?).map_err(|_| Errno::Ilseq)
}

fn table_sizes(strings: &[String]) -> (u32, u32) {
    let bytes: usize = strings.iter().map(|s| s.len() + 1).sum();
    (strings.len() as u32, bytes as u32)
}

fn write_table(
    caller: &mut Caller<'_, WasiHost>,
    mem: &Memory,
    strings: &[String],
    ptrs: u32,
    buf: u32,
) -> std::result::Result<(), HostError> {
    let mut cursor = buf;
    for (i, s) in strings.iter().enumerate() {
        let slot = (i as u32)
            .checked_mul(4)
            .and_then(|off| ptrs.checked_add(off))
            .ok_or(Errno::Fault)?;
        write_u32(mem, &mut *caller, slot, cursor)?;
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        write_guest(mem, &mut *caller, cursor, &bytes)?;
        cursor = cursor.checked_add(bytes.len() as u32).ok_or(Errno::Fault)?;
    }
    Ok(())
}

fn wasi_fd_read(
    caller: &mut Caller<'_, WasiHost>,
    mem: &Memory,
    fd: u32,
    iovs: u32,
    iovs_len: u32,
    nread: u32,
) -> std::result::Result<(), HostError> {
    let iovecs = read_iovecs(mem, &*caller, iovs, iovs_len)?;
    let wanted: usize = iovecs.iter().map(|(_, len)| *len as usize).sum();
    let data = caller.data_mut().fd_read(fd, wanted)?;
    let mut rest = data.as_slice();
    for (ptr, len) in iovecs {
        if rest.is_empty() {
            break;
        }
        let n = rest.len().min(len as usize);
        write_guest(mem, &mut *caller, ptr, &rest[..n])?;
        rest = &rest[n..];
    }
    write_u32(mem, &mut *caller, nread, data.len() as u32)?;
    Ok(())
}

fn wasi_fd_write(
    caller: &mut Caller<'_, WasiHost>,
    mem: &Memory,
    fd: u32,
    iovs: u32,
    iovs_len: u32,
    nwritten: u32,
) -> std::result::Result<(), HostError> {
    let iovecs = read_iovecs(mem, &*caller, iovs, iovs_len)?;
    let mut data = Vec::new();
    for (ptr, len) in iovecs {
        data.extend(read_guest(mem, &*caller, ptr, len)?);
    }
    let n = caller.data_mut().fd_write(fd, &data)?;
    write_u32(mem, &mut *caller, nwritten, n as u32)?;
    Ok(())
}

/// Registers the supported preview1 imports on `linker`.
pub(crate) fn add_to_linker(linker: &mut Linker<WasiHost>) -> Result<()> {
    let m = WASI_PREVIEW1_MODULE;

    linker.func_wrap(m, "args_sizes_get", |mut caller: Caller<'_, WasiHost>, argc: i32, size: i32| {
        let mem = memory(&mut caller)?;
        let (count, bytes) = table_sizes(&caller.data().args);
        finish((|| {
            write_u32(&mem, &mut caller, argc as u32, count)?;
            write_u32(&mem, &mut caller, size as u32, bytes)?;
            Ok(())
        })())
    })?;

    linker.func_wrap(m, "args_get", |mut caller: Caller<'_, WasiHost>, argv: i32, buf: i32| {
        let mem = memory(&mut caller)?;
        let args = caller.data().args.clone();
        finish(write_table(&mut caller, &mem, &args, argv as u32, buf as u32))
    })?;

    linker.func_wrap(
        m,
        "environ_sizes_get",
        |mut caller: Caller<'_, WasiHost>, count_ptr: i32, size_ptr: i32| {
            let mem = memory(&mut caller)?;
            let (count, bytes) = table_sizes(&caller.data().env);
            finish((|| {
                write_u32(&mem, &mut caller, count_ptr as u32, count)?;
                write_u32(&mem, &mut caller, size_ptr as u32, bytes)?;
                Ok(())
            })())
        },
    )?;

    linker.func_wrap(m, "environ_get", |mut caller: Caller<'_, WasiHost>, environ: i32, buf: i32| {
        let mem = memory(&mut caller)?;
        let env = caller.data().env.clone();
        finish(write_table(&mut caller, &mem, &env, environ as u32, buf as u32))
    })?;

    linker.func_wrap(
        m,
        "fd_read",
        |mut caller: Caller<'_, WasiHost>, fd: i32, iovs: i32, iovs_len: i32, nread: i32| {
            let mem = memory(&mut caller)?;
            finish(wasi_fd_read(
                &mut caller,
                &mem,
                fd as u32,
                iovs as u32,
                iovs_len as u32,
                nread as u32,
            ))
        },
    )?;

    linker.func_wrap(
        m,
        "fd_write",
        |mut caller: Caller<'_, WasiHost>, fd: i32, iovs: i32, iovs_len: i32, nwritten: i32| {
            let mem = memory(&mut caller)?;
            finish(wasi_fd_write(
                &mut caller,
                &mem,
                fd as u32,
                iovs as u32,
                iovs_len as u32,
                nwritten as u32,
            ))
        },
    )?;

    linker.func_wrap(
        m,
        "fd_seek",
        |mut caller: Caller<'_, WasiHost>, fd: i32, delta: i64, whence: i32, out: i32| {
            let mem = memory(&mut caller)?;
            finish((|| {
                let offset = caller.data_mut().fd_seek(fd as u32, delta, whence)?;
                write_u64(&mem, &mut caller, out as u32, offset)?;
                Ok(())
            })())
        },
    )?;

    linker.func_wrap(m, "fd_tell", |mut caller: Caller<'_, WasiHost>, fd: i32, out: i32| {
        let mem = memory(&mut caller)?;
        finish((|| {
            let offset = caller.data_mut().fd_seek(fd as u32, 0, WHENCE_CUR)?;
            write_u64(&mem, &mut caller, out as u32, offset)?;
            Ok(())
        })())
    })?;

    linker.func_wrap(m, "fd_close", |mut caller: Caller<'_, WasiHost>, fd: i32| {
        finish(caller.data_mut().fd_close(fd as u32).map_err(HostError::from))
    })?;

    linker.func_wrap(m, "fd_fdstat_get", |mut caller: Caller<'_, WasiHost>, fd: i32, out: i32| {
        let mem = memory(&mut caller)?;
        finish((|| {
            let stat = caller.data().fdstat(fd as u32)?;
            write_guest(&mem, &mut caller, out as u32, &stat)?;
            Ok(())
        })())
    })?;

    linker.func_wrap(
        m,
        "fd_fdstat_set_flags",
        |mut caller: Caller<'_, WasiHost>, fd: i32, flags: i32| {
            let host = caller.data_mut();
            finish(match host.fds.get_mut(&(fd as u32)) {
                Some(file) if matches!(file.kind, FdKind::Stream(_)) => Ok(()),
                Some(file) => {
                    file.append = (flags as u16) & FDFLAGS_APPEND != 0;
                    Ok(())
                }
                None => Err(Errno::Badf.into()),
            })
        },
    )?;

    linker.func_wrap(m, "fd_filestat_get", |mut caller: Caller<'_, WasiHost>, fd: i32, out: i32| {
        let mem = memory(&mut caller)?;
        finish((|| {
            let stat = caller.data().fd_filestat(fd as u32)?;
            write_guest(&mem, &mut caller, out as u32, &stat)?;
            Ok(())
        })())
    })?;

    linker.func_wrap(m, "fd_prestat_get", |mut caller: Caller<'_, WasiHost>, fd: i32, out: i32| {
        let mem = memory(&mut caller)?;
        finish((|| {
            let file = caller.data().open(fd as u32)?;
            let name = file.preopen.as_ref().ok_or(Errno::Badf)?;
            let mut buf = [0u8; PRESTAT_SIZE];
            buf[4..8].copy_from_slice(&(name.len() as u32).to_le_bytes());
            write_guest(&mem, &mut caller, out as u32, &buf)?;
            Ok(())
        })())
    })?;

    linker.func_wrap(
        m,
        "fd_prestat_dir_name",
        |mut caller: Caller<'_, WasiHost>, fd: i32, ptr: i32, len: i32| {
            let mem = memory(&mut caller)?;
            finish((|| {
                let file = caller.data().open(fd as u32)?;
                let name = file.preopen.clone().ok_or(Errno::Badf)?;
                if (len as u32 as usize) < name.len() {
                    return Err(Errno::Overflow.into());
                }
                write_guest(&mem, &mut caller, ptr as u32, name.as_bytes())?;
                Ok(())
            })())
        },
    )?;

    linker.func_wrap(
        m,
        "path_open",
        |mut caller: Caller<'_, WasiHost>,
         dirfd: i32,
         _dirflags: i32,
         path_ptr: i32,
         path_len: i32,
         oflags: i32,
         _rights_base: i64,
         _rights_inheriting: i64,
         fdflags: i32,
         out: i32| {
            let mem = memory(&mut caller)?;
            finish((|| {
                let path = read_path(&mem, &caller, path_ptr as u32, path_len as u32)?;
                let fd = caller
                    .data_mut()
                    .path_open(dirfd as u32, &path, oflags as u16, fdflags as u16)?;
                write_u32(&mem, &mut caller, out as u32, fd)?;
                Ok(())
            })())
        },
    )?;

    linker.func_wrap(
        m,
        "path_filestat_get",
        |mut caller: Caller<'_, WasiHost>,
         dirfd: i32,
         _flags: i32,
         path_ptr: i32,
         path_len: i32,
         out: i32| {
            let mem = memory(&mut caller)?;
            finish((|| {
                let path = read_path(&mem, &caller, path_ptr as u32, path_len as u32)?;
                let host = caller.data();
                let full = host.resolve(dirfd as u32, &path)?;
                let filetype = StdStream::from_path(&full).map(|_| FILETYPE_CHARACTER_DEVICE);
                let stat = host.filestat_of(&full, filetype)?;
                write_guest(&mem, &mut caller, out as u32, &stat)?;
                Ok(())
            })())
        },
    )?;

    linker.func_wrap(
        m,
        "path_create_directory",
        |mut caller: Caller<'_, WasiHost>, dirfd: i32, path_ptr: i32, path_len: i32| {
            let mem = memory(&mut caller)?;
            finish((|| {
                let path = read_path(&mem, &caller, path_ptr as u32, path_len as u32)?;
                let host = caller.data_mut();
                let full = host.resolve(dirfd as u32, &path)?;
                host.vfs.create_dir(&full)?;
                Ok(())
            })())
        },
    )?;

    linker.func_wrap(
        m,
        "path_unlink_file",
        |mut caller: Caller<'_, WasiHost>, dirfd: i32, path_ptr: i32, path_len: i32| {
            let mem = memory(&mut caller)?;
            finish((|| {
                let path = read_path(&mem, &caller, path_ptr as u32, path_len as u32)?;
                let host = caller.data_mut();
                let full = host.resolve(dirfd as u32, &path)?;
                host.vfs.remove_file(&full)?;
                Ok(())
            })())
        },
    )?;

    linker.func_wrap(
        m,
        "path_remove_directory",
        |mut caller: Caller<'_, WasiHost>, dirfd: i32, path_ptr: i32, path_len: i32| {
            let mem = memory(&mut caller)?;
            finish((|| {
                let path = read_path(&mem, &caller, path_ptr as u32, path_len as u32)?;
                let host = caller.data_mut();
                let full = host.resolve(dirfd as u32, &path)?;
                if full == ROOT {
                    return Err(Errno::Acces.into());
                }
                host.vfs.remove_dir(&full)?;
                Ok(())
            })())
        },
    )?;

    linker.func_wrap(
        m,
        "clock_time_get",
        |mut caller: Caller<'_, WasiHost>, id: i32, _precision: i64, out: i32| {
            let mem = memory(&mut caller)?;
            finish((|| {
                let nanos = caller.data().clock_nanos(id)?;
                write_u64(&mem, &mut caller, out as u32, nanos)?;
                Ok(())
            })())
        },
    )?;

    linker.func_wrap(m, "random_get", |mut caller: Caller<'_, WasiHost>, buf: i32, len: i32| {
        let mem = memory(&mut caller)?;
        finish((|| {
            let len = len as u32 as usize;
            guest_range(&mem, &caller, buf as u32, len)?;
            let bytes = caller.data_mut().random_bytes(len);
            write_guest(&mem, &mut caller, buf as u32, &bytes)?;
            Ok(())
        })())
    })?;

    linker.func_wrap(m, "sched_yield", |_caller: Caller<'_, WasiHost>| -> i32 {
        Errno::Success as i32
    })?;

    linker.func_wrap(m, "proc_exit", |_caller: Caller<'_, WasiHost>, code: i32| -> Result<()> {
        Err(anyhow::Error::new(ProcExit(code as u32)))
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(vfs: Vfs) -> WasiHost {
        WasiHost::new(vfs, vec!["nio".to_string()], &[], &RunnerLimits::default())
    }

    #[test]
    fn stdin_is_read_from_the_start_each_instance() {
        let mut vfs = Vfs::new();
        vfs.append(StdStream::Stdin.path(), "one\n").expect("append");
        let mut first = host(vfs);
        assert_eq!(first.fd_read(0, 64).expect("read"), b"one\n");
        assert!(first.fd_read(0, 64).expect("read at eof").is_empty());

        let mut vfs = first.into_vfs();
        vfs.append(StdStream::Stdin.path(), "two\n").expect("append");
        let mut second = host(vfs);
        assert_eq!(second.fd_read(0, 64).expect("read"), b"one\ntwo\n");
        assert_eq!(second.io().bytes_read, 8);
    }

    #[test]
    fn stdout_and_stderr_append() {
        let mut vfs = Vfs::new();
        vfs.append(StdStream::Stdout.path(), "before\n").expect("append");
        let mut h = host(vfs);
        h.fd_write(1, b"after\n").expect("write stdout");
        h.fd_write(2, b"oops\n").expect("write stderr");
        let io = h.io();
        let vfs = h.into_vfs();
        assert_eq!(vfs.stream(StdStream::Stdout), b"before\nafter\n");
        assert_eq!(vfs.stream(StdStream::Stderr), b"oops\n");
        assert_eq!(io.bytes_written_stdout, 6);
        assert_eq!(io.bytes_written_stderr, 5);
    }

    #[test]
    fn writing_to_stdin_is_badf() {
        let mut h = host(Vfs::new());
        match h.fd_write(0, b"x") {
            Err(HostError::Errno(Errno::Badf)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn output_cap_traps() {
        let limits = RunnerLimits {
            max_output_bytes: Some(4),
            ..RunnerLimits::default()
        };
        let mut h = WasiHost::new(Vfs::new(), Vec::new(), &[], &limits);
        h.fd_write(1, b"abcd").expect("within cap");
        match h.fd_write(2, b"e") {
            Err(HostError::Trap(err)) => {
                assert!(err.to_string().contains("stderr exceeded cap"), "trap={err}")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn path_open_creates_and_truncates() {
        let mut h = host(Vfs::new());
        assert_eq!(h.path_open(3, "out.txt", 0, 0), Err(Errno::Noent));

        let fd = h.path_open(3, "out.txt", OFLAGS_CREAT, 0).expect("create");
        h.fd_write(fd, b"hello world").expect("write");
        h.fd_close(fd).expect("close");

        let fd = h.path_open(3, "/out.txt", 0, 0).expect("reopen");
        assert_eq!(h.fd_seek(fd, -5, WHENCE_END), Ok(6));
        assert_eq!(h.fd_read(fd, 64).expect("read"), b"world");

        let fd = h.path_open(3, "out.txt", OFLAGS_CREAT | OFLAGS_TRUNC, 0).expect("trunc");
        h.fd_write(fd, b"hi").expect("write");
        assert_eq!(h.io().files_opened, 3);
        assert_eq!(h.into_vfs().read("/out.txt").expect("read"), b"hi");
    }

    #[test]
    fn far_seek_then_write_is_fbig() {
        let mut h = host(Vfs::new());
        let fd = h.path_open(3, "big.bin", OFLAGS_CREAT, 0).expect("create");
        assert_eq!(h.fd_seek(fd, 1 << 42, WHENCE_SET), Ok(1 << 42));
        match h.fd_write(fd, b"x") {
            Err(HostError::Errno(Errno::Fbig)) => {}
            other => panic!("unexpected: {other:?}"),
        }
        h.fd_seek(fd, 0, WHENCE_SET).expect("rewind");
        assert_eq!(h.fd_write(fd, b"ok").expect("write in range"), 2);
        assert_eq!(h.into_vfs().read("/big.bin").expect("read"), b"ok");
    }

    #[test]
    fn file_growth_follows_memory_cap() {
        let limits = RunnerLimits {
            max_memory_bytes: Some(8),
            ..RunnerLimits::default()
        };
        let mut h = WasiHost::new(Vfs::new(), Vec::new(), &[], &limits);
        let fd = h
            .path_open(3, "log.txt", OFLAGS_CREAT, FDFLAGS_APPEND)
            .expect("create");
        h.fd_write(fd, b"12345678").expect("up to the cap");
        match h.fd_write(fd, b"9") {
            Err(HostError::Errno(Errno::Fbig)) => {}
            other => panic!("unexpected: {other:?}"),
        }
        // Output streams are governed by the output cap instead.
        h.fd_write(1, b"0123456789").expect("stdout");
    }

    #[test]
    fn path_open_flags_are_checked() {
        let mut vfs = Vfs::new();
        vfs.write("/a.txt", "x").expect("write");
        let mut h = host(vfs);
        assert_eq!(
            h.path_open(3, "a.txt", OFLAGS_CREAT | OFLAGS_EXCL, 0),
            Err(Errno::Exist)
        );
        assert_eq!(h.path_open(3, "a.txt", OFLAGS_DIRECTORY, 0), Err(Errno::Notdir));
        assert_eq!(h.path_open(3, "missing", OFLAGS_DIRECTORY, 0), Err(Errno::Noent));
        assert_eq!(h.path_open(1, "a.txt", 0, 0), Err(Errno::Notdir));
        assert_eq!(h.path_open(99, "a.txt", 0, 0), Err(Errno::Badf));
        assert_eq!(h.path_open(3, "nodir/b.txt", OFLAGS_CREAT, 0), Err(Errno::Noent));
    }

    #[test]
    fn reopened_stdout_stays_append_only() {
        let mut vfs = Vfs::new();
        vfs.append(StdStream::Stdout.path(), "kept\n").expect("append");
        let mut h = host(vfs);
        let fd = h
            .path_open(3, "dev/stdout", OFLAGS_TRUNC, 0)
            .expect("open stdout by path");
        h.fd_write(fd, b"more\n").expect("write");
        assert_eq!(h.fd_seek(fd, 0, WHENCE_SET), Err(Errno::Spipe));
        assert_eq!(h.into_vfs().stream(StdStream::Stdout), b"kept\nmore\n");
    }

    #[test]
    fn fdstat_reports_character_devices() {
        let h = host(Vfs::new());
        let stat = h.fdstat(1).expect("fdstat");
        assert_eq!(stat[0], FILETYPE_CHARACTER_DEVICE);
        assert_eq!(u16::from_le_bytes([stat[2], stat[3]]), FDFLAGS_APPEND);
        assert_eq!(h.fdstat(3).expect("fdstat")[0], FILETYPE_DIRECTORY);
        assert_eq!(h.fdstat(7), Err(Errno::Badf));
    }

    #[test]
    fn filestat_reports_size() {
        let mut vfs = Vfs::new();
        vfs.write("/data.bin", [0u8; 10]).expect("write");
        let h = host(vfs);
        let stat = h.filestat_of("/data.bin", None).expect("filestat");
        assert_eq!(stat[16], FILETYPE_REGULAR_FILE);
        assert_eq!(u64::from_le_bytes(stat[32..40].try_into().expect("8 bytes")), 10);
    }

    #[test]
    fn random_is_deterministic_per_instance() {
        let mut a = host(Vfs::new());
        let mut b = host(Vfs::new());
        let xs: Vec<u64> = (0..4).map(|_| a.next_random()).collect();
        let ys: Vec<u64> = (0..4).map(|_| b.next_random()).collect();
        assert_eq!(xs, ys);
        assert_ne!(xs[0], xs[1]);
        assert_eq!(a.random_bytes(3).len(), 3);
    }
}
