//! Shared harness for the end-to-end scenario tests.
//!
//! `scg-hijack`'s `__wrap_*` functions fall through to a `__real_*` symbol
//! that a production build gets from the linker's `--wrap` pass redirecting
//! the original libc symbol. These tests link `scg-hijack` as an ordinary
//! `rlib` instead, so they provide the `__real_*` symbols themselves —
//! straight pass-throughs to the actual libc calls, making the wrappers
//! behave exactly as they would once actually linked with `--wrap`.

use std::os::raw::{c_char, c_void};

#[no_mangle]
pub unsafe extern "C" fn __real_open(pathname: *const c_char, flags: libc::c_int, mode: libc::mode_t) -> libc::c_int {
    libc::open(pathname, flags, mode as libc::c_uint)
}

#[no_mangle]
pub unsafe extern "C" fn __real_open64(pathname: *const c_char, flags: libc::c_int, mode: libc::mode_t) -> libc::c_int {
    libc::open(pathname, flags, mode as libc::c_uint)
}

#[no_mangle]
pub unsafe extern "C" fn __real_openat(
    dirfd: libc::c_int,
    pathname: *const c_char,
    flags: libc::c_int,
    mode: libc::mode_t,
) -> libc::c_int {
    libc::openat(dirfd, pathname, flags, mode as libc::c_uint)
}

#[no_mangle]
pub unsafe extern "C" fn __real_openat64(
    dirfd: libc::c_int,
    pathname: *const c_char,
    flags: libc::c_int,
    mode: libc::mode_t,
) -> libc::c_int {
    libc::openat(dirfd, pathname, flags, mode as libc::c_uint)
}

#[no_mangle]
pub unsafe extern "C" fn __real_close(fd: libc::c_int) -> libc::c_int {
    libc::close(fd)
}

#[no_mangle]
pub unsafe extern "C" fn __real_pread(
    fd: libc::c_int,
    buf: *mut c_void,
    count: libc::size_t,
    offset: libc::off_t,
) -> libc::ssize_t {
    libc::pread(fd, buf, count, offset)
}

#[no_mangle]
pub unsafe extern "C" fn __real_pread64(
    fd: libc::c_int,
    buf: *mut c_void,
    count: libc::size_t,
    offset: libc::off64_t,
) -> libc::ssize_t {
    libc::pread64(fd, buf, count, offset)
}

#[no_mangle]
pub unsafe extern "C" fn __real_pwrite(
    fd: libc::c_int,
    buf: *const c_void,
    count: libc::size_t,
    offset: libc::off_t,
) -> libc::ssize_t {
    libc::pwrite(fd, buf, count, offset)
}

#[no_mangle]
pub unsafe extern "C" fn __real_pwrite64(
    fd: libc::c_int,
    buf: *const c_void,
    count: libc::size_t,
    offset: libc::off64_t,
) -> libc::ssize_t {
    libc::pwrite64(fd, buf, count, offset)
}

#[no_mangle]
pub unsafe extern "C" fn __real_lseek(fd: libc::c_int, offset: libc::off_t, whence: libc::c_int) -> libc::off_t {
    libc::lseek(fd, offset, whence)
}

#[no_mangle]
pub unsafe extern "C" fn __real_lseek64(
    fd: libc::c_int,
    offset: libc::off64_t,
    whence: libc::c_int,
) -> libc::off64_t {
    libc::lseek64(fd, offset, whence)
}

#[no_mangle]
pub unsafe extern "C" fn __real_fstat(fd: libc::c_int, statbuf: *mut libc::stat) -> libc::c_int {
    libc::fstat(fd, statbuf)
}

#[no_mangle]
pub unsafe extern "C" fn __real_fstatat(
    dirfd: libc::c_int,
    pathname: *const c_char,
    statbuf: *mut libc::stat,
    flags: libc::c_int,
) -> libc::c_int {
    libc::fstatat(dirfd, pathname, statbuf, flags)
}

/// Opt the test process into pre-issue. Idempotent; every scenario sets it
/// before its first `enter_scgraph` so it doesn't matter which test in a
/// binary runs first.
pub fn enable_foreactor() {
    std::env::set_var("USE_FOREACTOR", "yes");
}

/// Configure the io_uring-backed knobs for `graph_id`. Each scenario uses
/// its own id so concurrently-running tests in the same binary never step
/// on each other's environment variables.
pub fn set_ring_env(graph_id: u32, depth: usize, queue_len: usize) {
    std::env::set_var(format!("DEPTH_{graph_id}"), depth.to_string());
    std::env::set_var(format!("QUEUE_{graph_id}"), queue_len.to_string());
}

/// Configure the worker-pool-backed knobs for `graph_id`.
pub fn set_pool_env(graph_id: u32, depth: usize, queue_len: usize, uthreads: usize) {
    set_ring_env(graph_id, depth, queue_len);
    std::env::set_var(format!("UTHREADS_{graph_id}"), uthreads.to_string());
}
