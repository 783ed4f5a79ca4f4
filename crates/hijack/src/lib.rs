//! Linker-`--wrap` entry points for the eight POSIX calls a syscall graph
//! can pre-issue. Each `__wrap_*` symbol here is meant to replace the real
//! libc symbol at link time (`-Wl,--wrap=open`, etc.); when no graph is
//! active on the calling thread it falls straight through to `__real_*`,
//! the symbol the linker redirects the original call to.
//!
//! Each wrapper follows the same shape: check for an active graph, and if
//! none is active call straight through to the real function; otherwise
//! resolve the frontier node, reconcile arguments against it, and issue.

use std::ffi::CStr;

use libc::{c_char, c_int, c_void};

use scg_core::error::OrFatal;
use scg_core::syscall::ActualArgs;
use scg_core::{OFlags, SCGraph};

extern "C" {
    fn __real_open(pathname: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int;
    fn __real_open64(pathname: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int;
    fn __real_openat(dirfd: c_int, pathname: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int;
    fn __real_openat64(dirfd: c_int, pathname: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int;
    fn __real_close(fd: c_int) -> c_int;
    fn __real_pread(fd: c_int, buf: *mut c_void, count: libc::size_t, offset: libc::off_t) -> libc::ssize_t;
    fn __real_pread64(fd: c_int, buf: *mut c_void, count: libc::size_t, offset: libc::off64_t) -> libc::ssize_t;
    fn __real_pwrite(fd: c_int, buf: *const c_void, count: libc::size_t, offset: libc::off_t) -> libc::ssize_t;
    fn __real_pwrite64(fd: c_int, buf: *const c_void, count: libc::size_t, offset: libc::off64_t) -> libc::ssize_t;
    fn __real_lseek(fd: c_int, offset: libc::off_t, whence: c_int) -> libc::off_t;
    fn __real_lseek64(fd: c_int, offset: libc::off64_t, whence: c_int) -> libc::off64_t;
    fn __real_fstat(fd: c_int, statbuf: *mut libc::stat) -> c_int;
    fn __real_fstatat(dirfd: c_int, pathname: *const c_char, statbuf: *mut libc::stat, flags: c_int) -> c_int;
}

/// Borrow a `CStr` from a raw pathname pointer and clone it into an owned
/// `CString` for `ActualArgs`. Panics (via `fatal`-style abort further up
/// the call) only if the pointer is not nul-terminated valid UTF-8-agnostic
/// C string, which would already be undefined behavior in the caller.
unsafe fn owned_path(pathname: *const c_char) -> std::ffi::CString {
    CStr::from_ptr(pathname).to_owned()
}

/// Resolve the graph's frontier node, reconcile `actual` against it, and
/// issue. Returns `None` when no graph is active on this thread, in which
/// case the caller must fall through to the real syscall.
unsafe fn dispatch(actual: ActualArgs, output_buf: *mut c_void) -> Option<i64> {
    SCGraph::with_active(|g| {
        let node_id = g.get_frontier().or_fatal();
        g.check_args(node_id, actual).or_fatal();
        g.issue(node_id, output_buf)
    })
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_open(pathname: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
    let actual = ActualArgs::Open { pathname: owned_path(pathname), flags: OFlags::from_raw(flags), mode };
    match dispatch(actual, std::ptr::null_mut()) {
        Some(rc) => rc as c_int,
        None => __real_open(pathname, flags, mode),
    }
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_open64(pathname: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
    let actual = ActualArgs::Open { pathname: owned_path(pathname), flags: OFlags::from_raw(flags), mode };
    match dispatch(actual, std::ptr::null_mut()) {
        Some(rc) => rc as c_int,
        None => __real_open64(pathname, flags, mode),
    }
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_openat(
    dirfd: c_int,
    pathname: *const c_char,
    flags: c_int,
    mode: libc::mode_t,
) -> c_int {
    let actual = ActualArgs::Openat { dirfd, pathname: owned_path(pathname), flags: OFlags::from_raw(flags), mode };
    match dispatch(actual, std::ptr::null_mut()) {
        Some(rc) => rc as c_int,
        None => __real_openat(dirfd, pathname, flags, mode),
    }
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_openat64(
    dirfd: c_int,
    pathname: *const c_char,
    flags: c_int,
    mode: libc::mode_t,
) -> c_int {
    let actual = ActualArgs::Openat { dirfd, pathname: owned_path(pathname), flags: OFlags::from_raw(flags), mode };
    match dispatch(actual, std::ptr::null_mut()) {
        Some(rc) => rc as c_int,
        None => __real_openat64(dirfd, pathname, flags, mode),
    }
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_close(fd: c_int) -> c_int {
    let actual = ActualArgs::Close { fd };
    match dispatch(actual, std::ptr::null_mut()) {
        Some(rc) => rc as c_int,
        None => __real_close(fd),
    }
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_pread(
    fd: c_int,
    buf: *mut c_void,
    count: libc::size_t,
    offset: libc::off_t,
) -> libc::ssize_t {
    let actual = ActualArgs::Pread { fd, buf: buf as *mut u8, count, offset: offset as i64 };
    match dispatch(actual, buf) {
        Some(rc) => rc as libc::ssize_t,
        None => __real_pread(fd, buf, count, offset),
    }
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_pread64(
    fd: c_int,
    buf: *mut c_void,
    count: libc::size_t,
    offset: libc::off64_t,
) -> libc::ssize_t {
    let actual = ActualArgs::Pread { fd, buf: buf as *mut u8, count, offset: offset as i64 };
    match dispatch(actual, buf) {
        Some(rc) => rc as libc::ssize_t,
        None => __real_pread64(fd, buf, count, offset),
    }
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_pwrite(
    fd: c_int,
    buf: *const c_void,
    count: libc::size_t,
    offset: libc::off_t,
) -> libc::ssize_t {
    let actual = ActualArgs::Pwrite { fd, buf: buf as *const u8, count, offset: offset as i64 };
    match dispatch(actual, std::ptr::null_mut()) {
        Some(rc) => rc as libc::ssize_t,
        None => __real_pwrite(fd, buf, count, offset),
    }
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_pwrite64(
    fd: c_int,
    buf: *const c_void,
    count: libc::size_t,
    offset: libc::off64_t,
) -> libc::ssize_t {
    let actual = ActualArgs::Pwrite { fd, buf: buf as *const u8, count, offset: offset as i64 };
    match dispatch(actual, std::ptr::null_mut()) {
        Some(rc) => rc as libc::ssize_t,
        None => __real_pwrite64(fd, buf, count, offset),
    }
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_lseek(fd: c_int, offset: libc::off_t, whence: c_int) -> libc::off_t {
    let actual = ActualArgs::Lseek { fd, offset: offset as i64, whence };
    match dispatch(actual, std::ptr::null_mut()) {
        Some(rc) => rc as libc::off_t,
        None => __real_lseek(fd, offset, whence),
    }
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_lseek64(fd: c_int, offset: libc::off64_t, whence: c_int) -> libc::off64_t {
    let actual = ActualArgs::Lseek { fd, offset: offset as i64, whence };
    match dispatch(actual, std::ptr::null_mut()) {
        Some(rc) => rc as libc::off64_t,
        None => __real_lseek64(fd, offset, whence),
    }
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_fstat(fd: c_int, statbuf: *mut libc::stat) -> c_int {
    let actual = ActualArgs::Fstat { fd, statbuf };
    match dispatch(actual, statbuf as *mut c_void) {
        Some(rc) => rc as c_int,
        None => __real_fstat(fd, statbuf),
    }
}

/// `__fxstatat`-equivalent. glibc's public `fstatat` always targets
/// `AT_SYMLINK_NOFOLLOW`/`AT_EMPTY_PATH` via its `flags` argument, passed
/// straight through as `ActualArgs::Fstatat::flags`.
#[no_mangle]
pub unsafe extern "C" fn __wrap_fstatat(
    dirfd: c_int,
    pathname: *const c_char,
    statbuf: *mut libc::stat,
    flags: c_int,
) -> c_int {
    let actual = ActualArgs::Fstatat { dirfd, pathname: owned_path(pathname), flags, statbuf };
    match dispatch(actual, statbuf as *mut c_void) {
        Some(rc) => rc as c_int,
        None => __real_fstatat(dirfd, pathname, statbuf, flags),
    }
}
