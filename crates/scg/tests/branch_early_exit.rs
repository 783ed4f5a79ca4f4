//! Scenario 2 (branch with early exit): `open -> pwrite -> branch -> {close |
//! pread -> close}`, with the edge into the branch marked weak. Runs the
//! graph twice through the same node set, once for each branch outcome, and
//! checks both observed byte sequences match what a synchronous caller
//! would see — which can only hold if peek never pre-issues `close` (side
//! effecting) past the weak edge before the branch decision is actually
//! known.

mod common;

use std::cell::Cell;
use std::ffi::CString;
use std::os::raw::c_void;
use std::rc::Rc;

use scg_core::syscall::{CloseArgs, OpenArgs, PreadArgs, PwriteArgs};
use scg_core::OFlags;

const GRAPH_ID: u32 = 2;
const DATA: &[u8] = b"WXYZ";

#[test]
fn skips_or_takes_the_optional_read_without_misordering_close() {
    let _ = env_logger::try_init();
    common::enable_foreactor();
    common::set_ring_env(GRAPH_ID, 2, 16);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("branch.txt");
    let pathname = CString::new(path.to_str().unwrap()).unwrap();

    scg::create_scgraph(GRAPH_ID, 0);

    let fd_cell = Rc::new(Cell::new(-1i32));
    let take_read = Rc::new(Cell::new(false));

    {
        let pathname = pathname.clone();
        let fd_cell = fd_cell.clone();
        scg::add_syscall_open(
            GRAPH_ID,
            0,
            "open",
            &[],
            Box::new(move |_| {
                Some(OpenArgs {
                    pathname: pathname.clone(),
                    flags: OFlags::CREAT | OFlags::RDWR,
                    mode: 0o600,
                })
            }),
            Box::new(move |_, rc| fd_cell.set(rc as i32)),
            true,
        );
    }

    {
        let fd_cell = fd_cell.clone();
        scg::add_syscall_pwrite(
            GRAPH_ID,
            1,
            "pwrite",
            &[],
            Box::new(move |_| {
                let fd = fd_cell.get();
                (fd >= 0).then(|| PwriteArgs { fd, buf: DATA.as_ptr(), count: DATA.len(), offset: 0 })
            }),
            Box::new(|_, _| {}),
            false,
        );
    }

    {
        let take_read = take_read.clone();
        scg::add_branch_node(GRAPH_ID, 2, "read?", &[], 2, Box::new(move |_| Some(take_read.get() as i32)), false);
    }

    {
        let fd_cell = fd_cell.clone();
        scg::add_syscall_pread(
            GRAPH_ID,
            3,
            "pread",
            &[],
            4,
            Box::new(move |_| {
                let fd = fd_cell.get();
                (fd >= 0).then(|| PreadArgs {
                    fd,
                    count: 4,
                    offset: 0,
                    buf_ready: false,
                    buf: std::ptr::null_mut(),
                    skip_memcpy: false,
                })
            }),
            Box::new(|_, _| {}),
            false,
        );
    }

    {
        let fd_cell = fd_cell.clone();
        scg::add_syscall_close(
            GRAPH_ID,
            4,
            "close",
            &[],
            Box::new(move |_| {
                let fd = fd_cell.get();
                (fd >= 0).then_some(CloseArgs { fd })
            }),
            Box::new(|_, _| {}),
            false,
        );
    }

    scg::syscall_set_next(GRAPH_ID, 0, Some(1), false, false);
    // The edge into the optional-read branch is the weak one: whichever way
    // the decision goes, `close` must not be pre-issued before it is known.
    scg::syscall_set_next(GRAPH_ID, 1, Some(2), true, false);
    scg::branch_append_child(GRAPH_ID, 2, 4, None); // decision 0: skip straight to close
    scg::branch_append_child(GRAPH_ID, 2, 3, None); // decision 1: read first
    scg::syscall_set_next(GRAPH_ID, 3, Some(4), false, false);
    scg::set_scgraph_built(GRAPH_ID);

    for &read_this_time in &[false, true] {
        take_read.set(read_this_time);

        scg::enter_scgraph(GRAPH_ID);

        let fd = unsafe { scg_hijack::__wrap_open(pathname.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
        assert!(fd > 0);

        let written = unsafe { scg_hijack::__wrap_pwrite(fd, DATA.as_ptr() as *const c_void, DATA.len(), 0) };
        assert_eq!(written, DATA.len() as isize);

        if read_this_time {
            let mut buf = [0u8; 4];
            let n = unsafe { scg_hijack::__wrap_pread(fd, buf.as_mut_ptr() as *mut c_void, 4, 0) };
            assert_eq!(n, 4);
            assert_eq!(&buf, DATA);
        }

        let closed = unsafe { scg_hijack::__wrap_close(fd) };
        assert_eq!(closed, 0, "close must reconcile against the real fd, never a stale pre-issued one");

        scg::leave_scgraph(GRAPH_ID);
    }

    assert_eq!(std::fs::read(&path).unwrap(), DATA);
}
