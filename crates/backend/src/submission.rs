//! The argument bundle a frontier node hands to a [`crate::Backend`] when
//! preparing or filling in a submission. One variant per supported
//! syscall.

use std::ffi::CString;

/// A raw pointer that is safe to move across the worker-pool backend's
/// thread boundary: the node that owns the pointee guarantees the buffer
/// outlives the in-flight request (it isn't freed until `complete_one`
/// reports completion and the node's `remove_one_epoch` runs).
#[derive(Clone, Copy)]
pub struct SendPtr<T>(pub *mut T);

// SAFETY: the pointee is owned by a `SyscallNode`'s value pool for the
// lifetime of the in-flight request; no two threads dereference it
// concurrently (the worker writes, the submitting thread only reads after
// the matching completion is observed).
unsafe impl<T> Send for SendPtr<T> {}

impl<T> SendPtr<T> {
    pub fn as_ptr(self) -> *mut T {
        self.0
    }
}

/// Arguments for one pending syscall submission, as handed from a
/// `SyscallNode` to a backend's `prepare`/`fill_*` step.
#[derive(Clone)]
pub enum SubmissionSpec {
    Open {
        pathname: CString,
        flags: i32,
        mode: libc::mode_t,
    },
    Openat {
        dirfd: i32,
        pathname: CString,
        flags: i32,
        mode: libc::mode_t,
    },
    Close {
        fd: i32,
    },
    Pread {
        fd: i32,
        buf: SendPtr<u8>,
        count: usize,
        offset: i64,
    },
    Pwrite {
        fd: i32,
        buf: SendPtr<u8>,
        count: usize,
        offset: i64,
    },
    /// `lseek` is never pre-issued asynchronously but still routes through
    /// the same submission type so callers have one place to reason about
    /// every syscall kind.
    Lseek {
        fd: i32,
        offset: i64,
        whence: i32,
    },
    Fstat {
        fd: i32,
        statx_buf: SendPtr<libc::statx>,
    },
    Fstatat {
        dirfd: i32,
        pathname: CString,
        flags: i32,
        statx_buf: SendPtr<libc::statx>,
    },
}

impl SubmissionSpec {
    /// Human-readable syscall name, used in `debug!`/`trace!` logging.
    pub fn name(&self) -> &'static str {
        match self {
            SubmissionSpec::Open { .. } => "open",
            SubmissionSpec::Openat { .. } => "openat",
            SubmissionSpec::Close { .. } => "close",
            SubmissionSpec::Pread { .. } => "pread",
            SubmissionSpec::Pwrite { .. } => "pwrite",
            SubmissionSpec::Lseek { .. } => "lseek",
            SubmissionSpec::Fstat { .. } => "fstat",
            SubmissionSpec::Fstatat { .. } => "fstatat",
        }
    }

    /// Whether this syscall may ever be asynchronously pre-issued. `lseek`
    /// always returns `false`; every other kind returns `true` (foreactability
    /// past a weak edge is a separate, node-type-level decision made by the
    /// peek algorithm, not here).
    pub fn is_asyncable(&self) -> bool {
        !matches!(self, SubmissionSpec::Lseek { .. })
    }
}
