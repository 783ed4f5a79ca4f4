//! `SyscallNode`: the per-call-site node type, and the closed set of
//! supported syscalls, modeled as a tagged `enum` rather than a class
//! hierarchy.

use std::ffi::CString;

use scg_backend::{SendPtr, SubmissionSpec};

use crate::epoch::EpochList;
use crate::error::ScgError;
use crate::node::{EdgeType, NodeBase, NodeId, NodeType, Next};
use crate::value_pool::ValuePool;

bitflags::bitflags! {
    /// The `flags` argument of `open`/`openat`, typed instead of a bare
    /// `i32` so a mismatched `check_args` reconciliation prints which named
    /// bits disagree rather than two opaque integers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct OFlags: i32 {
        const RDONLY = libc::O_RDONLY;
        const WRONLY = libc::O_WRONLY;
        const RDWR = libc::O_RDWR;
        const CREAT = libc::O_CREAT;
        const EXCL = libc::O_EXCL;
        const TRUNC = libc::O_TRUNC;
        const APPEND = libc::O_APPEND;
        const NONBLOCK = libc::O_NONBLOCK;
        const DIRECT = libc::O_DIRECT;
        const DIRECTORY = libc::O_DIRECTORY;
        const SYNC = libc::O_SYNC;
        const CLOEXEC = libc::O_CLOEXEC;
    }
}

impl OFlags {
    pub fn from_raw(flags: i32) -> Self {
        OFlags::from_bits_retain(flags)
    }

    pub fn raw(self) -> i32 {
        self.bits()
    }
}

/// Lifecycle of one `(node, epoch)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallStage {
    NotReady,
    ArgReady,
    Prepared,
    OnTheFly,
    Finished,
}

/// Readiness of a caller-supplied argument generator: `Some(args)` mirrors
/// `arggen(...) -> true` with outputs filled; `None` mirrors `-> false`,
/// "not ready yet."
pub type ArgGen<Args> = Box<dyn FnMut(&[u32]) -> Option<Args>>;
/// Invoked once per epoch after completion with the final return code.
pub type RcSave = Box<dyn FnMut(&[u32], i64)>;

/// The arguments actually observed at the wrapped entry point, passed to
/// [`SyscallKind::check_args`] for reconciliation against anything already
/// predicted by `arggen`.
pub enum ActualArgs {
    Open {
        pathname: CString,
        flags: OFlags,
        mode: libc::mode_t,
    },
    Openat {
        dirfd: i32,
        pathname: CString,
        flags: OFlags,
        mode: libc::mode_t,
    },
    Close {
        fd: i32,
    },
    Pread {
        fd: i32,
        buf: *mut u8,
        count: usize,
        offset: i64,
    },
    Pwrite {
        fd: i32,
        buf: *const u8,
        count: usize,
        offset: i64,
    },
    Lseek {
        fd: i32,
        offset: i64,
        whence: i32,
    },
    Fstat {
        fd: i32,
        statbuf: *mut libc::stat,
    },
    Fstatat {
        dirfd: i32,
        pathname: CString,
        flags: i32,
        statbuf: *mut libc::stat,
    },
}

fn mismatch<T: PartialEq + std::fmt::Debug>(
    node_id: NodeId,
    syscall: &'static str,
    field: &'static str,
    prev: &T,
    actual: &T,
) -> Result<(), ScgError> {
    if prev != actual {
        return Err(ScgError::ArgumentMismatch {
            node_id: node_id.0,
            syscall,
            detail: format!("{field}: recorded {prev:?}, actual {actual:?}"),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------
// open
// ---------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenArgs {
    pub pathname: CString,
    pub flags: OFlags,
    pub mode: libc::mode_t,
}

pub struct OpenNode {
    pub args: ValuePool<OpenArgs>,
    pub arggen: ArgGen<OpenArgs>,
    pub rcsave: RcSave,
}

// ---------------------------------------------------------------------
// openat
// ---------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenatArgs {
    pub dirfd: i32,
    pub pathname: CString,
    pub flags: OFlags,
    pub mode: libc::mode_t,
}

pub struct OpenatNode {
    pub args: ValuePool<OpenatArgs>,
    pub arggen: ArgGen<OpenatArgs>,
    pub rcsave: RcSave,
}

// ---------------------------------------------------------------------
// close
// ---------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseArgs {
    pub fd: i32,
}

pub struct CloseNode {
    pub args: ValuePool<CloseArgs>,
    pub arggen: ArgGen<CloseArgs>,
    pub rcsave: RcSave,
}

// ---------------------------------------------------------------------
// pread
// ---------------------------------------------------------------------

/// Predicted arguments for a `pread`, known at pre-issue time. The
/// destination buffer address is tracked separately in `user_buf` since it
/// may only become known at interception time (`buf_ready` is false until
/// then).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreadArgs {
    pub fd: i32,
    pub count: usize,
    pub offset: i64,
    pub buf_ready: bool,
    /// Destination address, meaningful only when `buf_ready` is true; a
    /// plugin arggen that doesn't know the buffer yet leaves this null.
    pub buf: *mut u8,
    /// For linked chains: skip the internal-buffer-to-caller-buffer memcpy
    /// because a downstream node consumes the internal buffer directly.
    pub skip_memcpy: bool,
}

pub struct PreadNode {
    pub args: ValuePool<PreadArgs>,
    pub user_buf: ValuePool<*mut u8>,
    /// Recyclable aligned scratch buffers used when `buf_ready` was false at
    /// pre-issue time. Bounded at `pre_issue_depth + 1` per node.
    pub internal_bufs: ValuePool<Box<[u8]>>,
    pub free_bufs: Vec<Box<[u8]>>,
    pub buf_cap: usize,
    pub alloc_size: usize,
    pub arggen: ArgGen<PreadArgs>,
    pub rcsave: RcSave,
}

// ---------------------------------------------------------------------
// pwrite
// ---------------------------------------------------------------------

/// Unlike [`PreadArgs`], `buf` here is unconditional: a plain stored
/// argument for `pwrite`, not something that can only become known at
/// interception time. A plugin that doesn't yet know the source buffer
/// simply isn't ready (its arggen returns `None`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PwriteArgs {
    pub fd: i32,
    pub buf: *const u8,
    pub count: usize,
    pub offset: i64,
}

pub struct PwriteNode {
    pub args: ValuePool<PwriteArgs>,
    pub arggen: ArgGen<PwriteArgs>,
    pub rcsave: RcSave,
}

// ---------------------------------------------------------------------
// lseek
// ---------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LseekArgs {
    pub fd: i32,
    pub offset: i64,
    pub whence: i32,
}

pub struct LseekNode {
    pub args: ValuePool<LseekArgs>,
    pub arggen: ArgGen<LseekArgs>,
    pub rcsave: RcSave,
}

// ---------------------------------------------------------------------
// fstat / fstatat
// ---------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FstatArgs {
    pub fd: i32,
}

pub struct FstatNode {
    pub args: ValuePool<FstatArgs>,
    pub user_stat: ValuePool<*mut libc::stat>,
    pub internal_bufs: ValuePool<Box<libc::statx>>,
    pub free_bufs: Vec<Box<libc::statx>>,
    pub buf_cap: usize,
    pub arggen: ArgGen<FstatArgs>,
    pub rcsave: RcSave,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FstatatArgs {
    pub dirfd: i32,
    pub pathname: CString,
    pub flags: i32,
}

pub struct FstatatNode {
    pub args: ValuePool<FstatatArgs>,
    pub user_stat: ValuePool<*mut libc::stat>,
    pub internal_bufs: ValuePool<Box<libc::statx>>,
    pub free_bufs: Vec<Box<libc::statx>>,
    pub buf_cap: usize,
    pub arggen: ArgGen<FstatatArgs>,
    pub rcsave: RcSave,
}

/// Project the fields the original `stat` ABI provides out of a `statx`
/// buffer, since a backend may only expose the modern extended-stat
/// operation.
pub fn project_statx_to_stat(statx: &libc::statx, out: &mut libc::stat) {
    // SAFETY: `libc::stat` is a POD struct; zeroing then field-by-field
    // assignment below never reads uninitialized memory.
    unsafe {
        std::ptr::write_bytes(out, 0, 1);
    }
    out.st_dev = libc::makedev(statx.stx_dev_major, statx.stx_dev_minor);
    out.st_ino = statx.stx_ino;
    out.st_mode = statx.stx_mode as libc::mode_t;
    out.st_nlink = statx.stx_nlink as libc::nlink_t;
    out.st_uid = statx.stx_uid;
    out.st_gid = statx.stx_gid;
    out.st_rdev = libc::makedev(statx.stx_rdev_major, statx.stx_rdev_minor);
    out.st_size = statx.stx_size as libc::off_t;
    out.st_blksize = statx.stx_blksize as libc::blksize_t;
    out.st_blocks = statx.stx_blocks as libc::blkcnt_t;
    out.st_atime = statx.stx_atime.tv_sec;
    out.st_atime_nsec = statx.stx_atime.tv_nsec as i64;
    out.st_mtime = statx.stx_mtime.tv_sec;
    out.st_mtime_nsec = statx.stx_mtime.tv_nsec as i64;
    out.st_ctime = statx.stx_ctime.tv_sec;
    out.st_ctime_nsec = statx.stx_ctime.tv_nsec as i64;
}

/// The closed set of supported syscall node kinds.
pub enum SyscallKind {
    Open(OpenNode),
    Openat(OpenatNode),
    Close(CloseNode),
    Pread(PreadNode),
    Pwrite(PwriteNode),
    Lseek(LseekNode),
    Fstat(FstatNode),
    Fstatat(FstatatNode),
}

impl SyscallKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            SyscallKind::Open(_) => "open",
            SyscallKind::Openat(_) => "openat",
            SyscallKind::Close(_) => "close",
            SyscallKind::Pread(_) => "pread",
            SyscallKind::Pwrite(_) => "pwrite",
            SyscallKind::Lseek(_) => "lseek",
            SyscallKind::Fstat(_) => "fstat",
            SyscallKind::Fstatat(_) => "fstatat",
        }
    }

    /// `Syscall-Pure` vs `Syscall-SideEffecting`.
    pub fn node_type(&self) -> NodeType {
        match self {
            SyscallKind::Pread(_) | SyscallKind::Fstat(_) | SyscallKind::Fstatat(_) => {
                NodeType::SyscallPure
            }
            _ => NodeType::SyscallSideEffecting,
        }
    }

    /// `lseek` is never pre-issued asynchronously.
    pub fn is_asyncable(&self) -> bool {
        !matches!(self, SyscallKind::Lseek(_))
    }

    /// Invoke the caller-supplied `arggen` for raw counters `epoch_raw`,
    /// installing any produced arguments into this node's pools. Returns
    /// `true` iff arguments became ready.
    pub fn generate_args(&mut self, epoch: &EpochList, epoch_raw: &[u32]) -> bool {
        match self {
            SyscallKind::Open(n) => match (n.arggen)(epoch_raw) {
                Some(a) => {
                    n.args.set(epoch, a);
                    true
                }
                None => false,
            },
            SyscallKind::Openat(n) => match (n.arggen)(epoch_raw) {
                Some(a) => {
                    n.args.set(epoch, a);
                    true
                }
                None => false,
            },
            SyscallKind::Close(n) => match (n.arggen)(epoch_raw) {
                Some(a) => {
                    n.args.set(epoch, a);
                    true
                }
                None => false,
            },
            SyscallKind::Pread(n) => match (n.arggen)(epoch_raw) {
                Some(a) => {
                    // A plugin that already knows the destination address
                    // (buf_ready) hands it over now, since check_args won't
                    // run on this node until the frontier actually reaches
                    // it -- long after peek-ahead needs the pointer.
                    if a.buf_ready {
                        n.user_buf.set(epoch, a.buf);
                    }
                    n.args.set(epoch, a);
                    true
                }
                None => false,
            },
            SyscallKind::Pwrite(n) => match (n.arggen)(epoch_raw) {
                Some(a) => {
                    n.args.set(epoch, a);
                    true
                }
                None => false,
            },
            SyscallKind::Lseek(_) => {
                // lseek is never asynchronously pre-issued (see
                // SubmissionSpec::is_asyncable), so its args are never
                // speculatively generated during peek-ahead -- only
                // check_args, on the real interception path, populates
                // n.args. This keeps every lseek node a hard peek barrier.
                false
            }
            SyscallKind::Fstat(n) => match (n.arggen)(epoch_raw) {
                Some(a) => {
                    n.args.set(epoch, a);
                    true
                }
                None => false,
            },
            SyscallKind::Fstatat(n) => match (n.arggen)(epoch_raw) {
                Some(a) => {
                    n.args.set(epoch, a);
                    true
                }
                None => false,
            },
        }
    }

    pub fn args_ready(&self, epoch: &EpochList) -> bool {
        match self {
            SyscallKind::Open(n) => n.args.has(epoch),
            SyscallKind::Openat(n) => n.args.has(epoch),
            SyscallKind::Close(n) => n.args.has(epoch),
            SyscallKind::Pread(n) => n.args.has(epoch),
            SyscallKind::Pwrite(n) => n.args.has(epoch),
            SyscallKind::Lseek(n) => n.args.has(epoch),
            SyscallKind::Fstat(n) => n.args.has(epoch),
            SyscallKind::Fstatat(n) => n.args.has(epoch),
        }
    }

    /// Reconcile the arguments seen at actual syscall interception with
    /// whatever was already installed by a prior [`Self::generate_args`].
    /// Destination buffer pointers are never part of the comparison: they
    /// may only become known at interception time.
    pub fn check_args(
        &mut self,
        epoch: &EpochList,
        node_id: NodeId,
        actual: ActualArgs,
    ) -> Result<(), ScgError> {
        match (self, actual) {
            (SyscallKind::Open(n), ActualArgs::Open { pathname, flags, mode }) => {
                if n.args.has(epoch) {
                    let prev = n.args.get(epoch);
                    mismatch(node_id, "open", "pathname", &prev.pathname, &pathname)?;
                    mismatch(node_id, "open", "flags", &prev.flags, &flags)?;
                    mismatch(node_id, "open", "mode", &prev.mode, &mode)?;
                } else {
                    n.args.set(epoch, OpenArgs { pathname, flags, mode });
                }
            }
            (SyscallKind::Openat(n), ActualArgs::Openat { dirfd, pathname, flags, mode }) => {
                if n.args.has(epoch) {
                    let prev = n.args.get(epoch);
                    mismatch(node_id, "openat", "dirfd", &prev.dirfd, &dirfd)?;
                    mismatch(node_id, "openat", "pathname", &prev.pathname, &pathname)?;
                    mismatch(node_id, "openat", "flags", &prev.flags, &flags)?;
                    mismatch(node_id, "openat", "mode", &prev.mode, &mode)?;
                } else {
                    n.args.set(epoch, OpenatArgs { dirfd, pathname, flags, mode });
                }
            }
            (SyscallKind::Close(n), ActualArgs::Close { fd }) => {
                if n.args.has(epoch) {
                    let prev = n.args.get(epoch);
                    mismatch(node_id, "close", "fd", &prev.fd, &fd)?;
                } else {
                    n.args.set(epoch, CloseArgs { fd });
                }
            }
            (SyscallKind::Pread(n), ActualArgs::Pread { fd, buf, count, offset }) => {
                if n.args.has(epoch) {
                    let prev = n.args.get(epoch);
                    mismatch(node_id, "pread", "fd", &prev.fd, &fd)?;
                    mismatch(node_id, "pread", "count", &prev.count, &count)?;
                    mismatch(node_id, "pread", "offset", &prev.offset, &offset)?;
                } else {
                    n.args.set(
                        epoch,
                        PreadArgs {
                            fd,
                            count,
                            offset,
                            buf_ready: true,
                            buf,
                            skip_memcpy: false,
                        },
                    );
                }
                if n.user_buf.has(epoch) {
                    let prev_buf = *n.user_buf.get(epoch);
                    mismatch(node_id, "pread", "buf", &prev_buf, &buf)?;
                } else {
                    n.user_buf.set(epoch, buf);
                }
            }
            (SyscallKind::Pwrite(n), ActualArgs::Pwrite { fd, buf, count, offset }) => {
                if n.args.has(epoch) {
                    let prev = n.args.get(epoch);
                    mismatch(node_id, "pwrite", "fd", &prev.fd, &fd)?;
                    mismatch(node_id, "pwrite", "buf", &prev.buf, &buf)?;
                    mismatch(node_id, "pwrite", "count", &prev.count, &count)?;
                    mismatch(node_id, "pwrite", "offset", &prev.offset, &offset)?;
                } else {
                    n.args.set(epoch, PwriteArgs { fd, buf, count, offset });
                }
            }
            (SyscallKind::Lseek(n), ActualArgs::Lseek { fd, offset, whence }) => {
                if n.args.has(epoch) {
                    let prev = n.args.get(epoch);
                    mismatch(node_id, "lseek", "fd", &prev.fd, &fd)?;
                    mismatch(node_id, "lseek", "offset", &prev.offset, &offset)?;
                    mismatch(node_id, "lseek", "whence", &prev.whence, &whence)?;
                } else {
                    n.args.set(epoch, LseekArgs { fd, offset, whence });
                }
            }
            (SyscallKind::Fstat(n), ActualArgs::Fstat { fd, statbuf }) => {
                if n.args.has(epoch) {
                    let prev = n.args.get(epoch);
                    mismatch(node_id, "fstat", "fd", &prev.fd, &fd)?;
                } else {
                    n.args.set(epoch, FstatArgs { fd });
                }
                n.user_stat.set(epoch, statbuf);
            }
            (SyscallKind::Fstatat(n), ActualArgs::Fstatat { dirfd, pathname, flags, statbuf }) => {
                if n.args.has(epoch) {
                    let prev = n.args.get(epoch);
                    mismatch(node_id, "fstatat", "dirfd", &prev.dirfd, &dirfd)?;
                    mismatch(node_id, "fstatat", "pathname", &prev.pathname, &pathname)?;
                    mismatch(node_id, "fstatat", "flags", &prev.flags, &flags)?;
                } else {
                    n.args.set(epoch, FstatatArgs { dirfd, pathname, flags });
                }
                n.user_stat.set(epoch, statbuf);
            }
            (kind, _) => {
                return Err(ScgError::WrongNodeType {
                    graph_id: 0,
                    node_id: node_id.0,
                    expected: kind.type_name(),
                });
            }
        }
        Ok(())
    }

    fn acquire_buf(free_list: &mut Vec<Box<[u8]>>, size: usize) -> Box<[u8]> {
        free_list
            .pop()
            .filter(|b| b.len() == size)
            .unwrap_or_else(|| vec![0u8; size].into_boxed_slice())
    }

    fn acquire_statx(free_list: &mut Vec<Box<libc::statx>>) -> Box<libc::statx> {
        free_list
            .pop()
            .unwrap_or_else(|| Box::new(unsafe { std::mem::zeroed() }))
    }

    /// Populate a [`SubmissionSpec`] for this node's args at `epoch`, for a
    /// backend to fill in its own submission record (ring SQE or pool work
    /// item).
    pub fn fill_submission(&mut self, epoch: &EpochList, node_id: NodeId) -> SubmissionSpec {
        match self {
            SyscallKind::Open(n) => {
                let a = n.args.get(epoch);
                SubmissionSpec::Open {
                    pathname: a.pathname.clone(),
                    flags: a.flags.raw(),
                    mode: a.mode,
                }
            }
            SyscallKind::Openat(n) => {
                let a = n.args.get(epoch);
                SubmissionSpec::Openat {
                    dirfd: a.dirfd,
                    pathname: a.pathname.clone(),
                    flags: a.flags.raw(),
                    mode: a.mode,
                }
            }
            SyscallKind::Close(n) => {
                let a = n.args.get(epoch);
                SubmissionSpec::Close { fd: a.fd }
            }
            SyscallKind::Pread(n) => {
                let a = n.args.get(epoch).clone();
                let ptr = if a.buf_ready {
                    *n.user_buf.get(epoch)
                } else {
                    let buf = Self::acquire_buf(&mut n.free_bufs, n.alloc_size);
                    let ptr = buf.as_ptr() as *mut u8;
                    n.internal_bufs.set(epoch, buf);
                    ptr
                };
                SubmissionSpec::Pread {
                    fd: a.fd,
                    buf: SendPtr(ptr),
                    count: a.count,
                    offset: a.offset,
                }
            }
            SyscallKind::Pwrite(n) => {
                let a = n.args.get(epoch).clone();
                SubmissionSpec::Pwrite {
                    fd: a.fd,
                    buf: SendPtr(a.buf as *mut u8),
                    count: a.count,
                    offset: a.offset,
                }
            }
            SyscallKind::Lseek(n) => {
                let a = n.args.get(epoch);
                SubmissionSpec::Lseek {
                    fd: a.fd,
                    offset: a.offset,
                    whence: a.whence,
                }
            }
            SyscallKind::Fstat(n) => {
                let fd = n.args.get(epoch).fd;
                let mut buf = Self::acquire_statx(&mut n.free_bufs);
                let ptr = buf.as_mut() as *mut libc::statx;
                n.internal_bufs.set(epoch, buf);
                SubmissionSpec::Fstat {
                    fd,
                    statx_buf: SendPtr(ptr),
                }
            }
            SyscallKind::Fstatat(n) => {
                let a = n.args.get(epoch).clone();
                let mut buf = Self::acquire_statx(&mut n.free_bufs);
                let ptr = buf.as_mut() as *mut libc::statx;
                n.internal_bufs.set(epoch, buf);
                SubmissionSpec::Fstatat {
                    dirfd: a.dirfd,
                    pathname: a.pathname,
                    flags: a.flags,
                    statx_buf: SendPtr(ptr),
                }
            }
        }
        .tap_log(node_id)
    }

    /// Perform the call synchronously (no pre-issue happened), returning
    /// the raw return code. `output_buf` is the caller-provided destination
    /// for `pread`/`fstat`/`fstatat`; unused for the others.
    pub fn syscall_sync(&mut self, epoch: &EpochList, output_buf: *mut libc::c_void) -> i64 {
        match self {
            SyscallKind::Open(n) => {
                let a = n.args.get(epoch);
                unsafe { libc::open(a.pathname.as_ptr(), a.flags.raw(), a.mode as libc::c_uint) as i64 }
            }
            SyscallKind::Openat(n) => {
                let a = n.args.get(epoch);
                unsafe {
                    libc::openat(a.dirfd, a.pathname.as_ptr(), a.flags.raw(), a.mode as libc::c_uint)
                        as i64
                }
            }
            SyscallKind::Close(n) => {
                let a = n.args.get(epoch);
                unsafe { libc::close(a.fd) as i64 }
            }
            SyscallKind::Pread(n) => {
                let a = n.args.get(epoch).clone();
                let dst = if output_buf.is_null() {
                    *n.user_buf.get(epoch) as *mut libc::c_void
                } else {
                    output_buf
                };
                unsafe { libc::pread(a.fd, dst, a.count, a.offset) as i64 }
            }
            SyscallKind::Pwrite(n) => {
                let a = n.args.get(epoch).clone();
                unsafe { libc::pwrite(a.fd, a.buf as *const libc::c_void, a.count, a.offset) as i64 }
            }
            SyscallKind::Lseek(n) => {
                let a = n.args.get(epoch);
                unsafe { libc::lseek(a.fd, a.offset, a.whence) as i64 }
            }
            SyscallKind::Fstat(n) => {
                let a = n.args.get(epoch);
                let mut statx_buf: libc::statx = unsafe { std::mem::zeroed() };
                let rc = unsafe {
                    libc::statx(
                        a.fd,
                        b"\0".as_ptr() as *const libc::c_char,
                        libc::AT_EMPTY_PATH,
                        libc::STATX_ALL,
                        &mut statx_buf,
                    )
                };
                if rc == 0 && !output_buf.is_null() {
                    project_statx_to_stat(&statx_buf, unsafe { &mut *(output_buf as *mut libc::stat) });
                }
                rc as i64
            }
            SyscallKind::Fstatat(n) => {
                let a = n.args.get(epoch);
                let mut statx_buf: libc::statx = unsafe { std::mem::zeroed() };
                let rc = unsafe {
                    libc::statx(
                        a.dirfd,
                        a.pathname.as_ptr(),
                        a.flags,
                        libc::STATX_ALL,
                        &mut statx_buf,
                    )
                };
                if rc == 0 && !output_buf.is_null() {
                    project_statx_to_stat(&statx_buf, unsafe { &mut *(output_buf as *mut libc::stat) });
                }
                rc as i64
            }
        }
    }

    /// Post-process an asynchronously filled internal buffer into the
    /// caller's output buffer, if applicable (`pread`/`fstat`/`fstatat`).
    pub fn reflect_result(&mut self, epoch: &EpochList, output_buf: *mut libc::c_void) {
        match self {
            SyscallKind::Pread(n) => {
                let a = n.args.get(epoch).clone();
                if !a.buf_ready && !a.skip_memcpy && n.internal_bufs.has(epoch) {
                    let buf = n.internal_bufs.get(epoch);
                    let dst = if output_buf.is_null() {
                        *n.user_buf.get(epoch)
                    } else {
                        output_buf as *mut u8
                    };
                    if !dst.is_null() {
                        let len = buf.len().min(a.count);
                        unsafe {
                            std::ptr::copy_nonoverlapping(buf.as_ptr(), dst, len);
                        }
                    }
                }
            }
            SyscallKind::Fstat(n) => {
                if let Some(buf) = n.internal_bufs_peek(epoch) {
                    let dst = if output_buf.is_null() {
                        *n.user_stat.get(epoch)
                    } else {
                        output_buf as *mut libc::stat
                    };
                    if !dst.is_null() {
                        project_statx_to_stat(buf, unsafe { &mut *dst });
                    }
                }
            }
            SyscallKind::Fstatat(n) => {
                if let Some(buf) = n.internal_bufs_peek(epoch) {
                    let dst = if output_buf.is_null() {
                        *n.user_stat.get(epoch)
                    } else {
                        output_buf as *mut libc::stat
                    };
                    if !dst.is_null() {
                        project_statx_to_stat(buf, unsafe { &mut *dst });
                    }
                }
            }
            _ => {}
        }
    }

    /// Invoke the `rcsave` callback then drop this epoch's state from every
    /// pool owned by this node, returning recyclable buffers to their
    /// free-lists.
    pub fn remove_one_epoch(&mut self, epoch: &EpochList, epoch_raw: &[u32], rc: i64) {
        match self {
            SyscallKind::Open(n) => {
                (n.rcsave)(epoch_raw, rc);
                n.args.remove(epoch);
            }
            SyscallKind::Openat(n) => {
                (n.rcsave)(epoch_raw, rc);
                n.args.remove(epoch);
            }
            SyscallKind::Close(n) => {
                (n.rcsave)(epoch_raw, rc);
                n.args.remove(epoch);
            }
            SyscallKind::Pread(n) => {
                (n.rcsave)(epoch_raw, rc);
                n.args.remove(epoch);
                if n.user_buf.has(epoch) {
                    n.user_buf.remove(epoch);
                }
                if n.internal_bufs.has(epoch) {
                    let buf = n.internal_bufs.remove(epoch);
                    if n.free_bufs.len() < n.buf_cap {
                        n.free_bufs.push(buf);
                    }
                }
            }
            SyscallKind::Pwrite(n) => {
                (n.rcsave)(epoch_raw, rc);
                n.args.remove(epoch);
            }
            SyscallKind::Lseek(n) => {
                (n.rcsave)(epoch_raw, rc);
                n.args.remove(epoch);
            }
            SyscallKind::Fstat(n) => {
                (n.rcsave)(epoch_raw, rc);
                n.args.remove(epoch);
                if n.user_stat.has(epoch) {
                    n.user_stat.remove(epoch);
                }
                if n.internal_bufs.has(epoch) {
                    let buf = n.internal_bufs.remove(epoch);
                    if n.free_bufs.len() < n.buf_cap {
                        n.free_bufs.push(buf);
                    }
                }
            }
            SyscallKind::Fstatat(n) => {
                (n.rcsave)(epoch_raw, rc);
                n.args.remove(epoch);
                if n.user_stat.has(epoch) {
                    n.user_stat.remove(epoch);
                }
                if n.internal_bufs.has(epoch) {
                    let buf = n.internal_bufs.remove(epoch);
                    if n.free_bufs.len() < n.buf_cap {
                        n.free_bufs.push(buf);
                    }
                }
            }
        }
    }

    /// Reset every pool owned by this node, recycling buffers that fit
    /// under their free-list cap.
    pub fn reset_value_pools(&mut self) {
        match self {
            SyscallKind::Open(n) => {
                n.args.reset();
            }
            SyscallKind::Openat(n) => {
                n.args.reset();
            }
            SyscallKind::Close(n) => {
                n.args.reset();
            }
            SyscallKind::Pread(n) => {
                n.args.reset();
                n.user_buf.reset();
                for buf in n.internal_bufs.reset() {
                    if n.free_bufs.len() < n.buf_cap {
                        n.free_bufs.push(buf);
                    }
                }
            }
            SyscallKind::Pwrite(n) => {
                n.args.reset();
            }
            SyscallKind::Lseek(n) => {
                n.args.reset();
            }
            SyscallKind::Fstat(n) => {
                n.args.reset();
                n.user_stat.reset();
                for buf in n.internal_bufs.reset() {
                    if n.free_bufs.len() < n.buf_cap {
                        n.free_bufs.push(buf);
                    }
                }
            }
            SyscallKind::Fstatat(n) => {
                n.args.reset();
                n.user_stat.reset();
                for buf in n.internal_bufs.reset() {
                    if n.free_bufs.len() < n.buf_cap {
                        n.free_bufs.push(buf);
                    }
                }
            }
        }
    }
}

trait TapLog {
    fn tap_log(self, node_id: NodeId) -> Self;
}

impl TapLog for SubmissionSpec {
    fn tap_log(self, node_id: NodeId) -> Self {
        log::trace!("prepared submission for node {}: {}", node_id.0, self.name());
        self
    }
}

impl FstatNode {
    fn internal_bufs_peek(&self, epoch: &EpochList) -> Option<&libc::statx> {
        if self.internal_bufs.has(epoch) {
            Some(self.internal_bufs.get(epoch))
        } else {
            None
        }
    }
}

impl FstatatNode {
    fn internal_bufs_peek(&self, epoch: &EpochList) -> Option<&libc::statx> {
        if self.internal_bufs.has(epoch) {
            Some(self.internal_bufs.get(epoch))
        } else {
            None
        }
    }
}

/// A syscall node in the graph: common fields plus a [`SyscallKind`].
pub struct SyscallNode {
    pub base: NodeBase,
    pub kind: SyscallKind,
    pub next: Next,
    pub edge_type: EdgeType,
    /// Chain-link hint for the ring backend: "the submission immediately
    /// following me in the same batch must complete after I do".
    pub link_next: bool,
    pub stage: ValuePool<SyscallStage>,
    pub rc: ValuePool<i64>,
}

impl SyscallNode {
    pub fn new(id: NodeId, name: impl Into<String>, kind: SyscallKind, assoc_dims: &[usize]) -> Self {
        let node_type = kind.node_type();
        SyscallNode {
            base: NodeBase::new(id, name, node_type, assoc_dims),
            kind,
            next: Next::End,
            edge_type: EdgeType::Must,
            link_next: false,
            stage: ValuePool::new(assoc_dims),
            rc: ValuePool::new(assoc_dims),
        }
    }

    pub fn id(&self) -> NodeId {
        self.base.id
    }

    pub fn set_next(&mut self, next: Next, weak_edge: bool, link_next: bool) {
        self.next = next;
        self.edge_type = if weak_edge { EdgeType::Weak } else { EdgeType::Must };
        self.link_next = link_next;
    }

    pub fn stage_at(&self, epoch: &EpochList) -> SyscallStage {
        if self.stage.has(epoch) {
            *self.stage.get(epoch)
        } else {
            SyscallStage::NotReady
        }
    }

    /// Attempt to bring this node's args to `ArgReady` for `epoch` by
    /// calling the plugin's `arggen`. Returns `true` on success.
    pub fn generate_args(&mut self, epoch: &EpochList, epoch_raw: &[u32]) -> bool {
        if self.kind.generate_args(epoch, epoch_raw) {
            self.stage.set(epoch, SyscallStage::ArgReady);
            true
        } else {
            false
        }
    }

    /// Drive the `NotReady --(CheckArgs)--> ArgReady` transition, or simply
    /// validate consistency if args were already predicted.
    pub fn check_args(&mut self, epoch: &EpochList, actual: ActualArgs) -> Result<(), ScgError> {
        self.kind.check_args(epoch, self.base.id, actual)?;
        if self.stage_at(epoch) == SyscallStage::NotReady {
            self.stage.set(epoch, SyscallStage::ArgReady);
        }
        Ok(())
    }

    pub fn reset_value_pools(&mut self) {
        self.kind.reset_value_pools();
        self.stage.reset();
        self.rc.reset();
    }
}
