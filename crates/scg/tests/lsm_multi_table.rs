//! Scenario 4 (LSM-style multi-table `Get`): scan candidate table files from
//! newest to oldest, `openat -> pread(4 KiB page) -> close`, looping via a
//! branch until the last candidate. `pre_issue_depth = 4`. A reference run
//! of this scenario describes a 4-level, 8-files-per-level pyramid (32
//! candidates); this test keeps the same "open, read a page, maybe continue
//! to the next candidate" shape with 4 candidates so the fixture stays
//! small.
//!
//! Every candidate's `fd` only exists for the lifetime of its own
//! openat/pread/close triple, and with `pre_issue_depth = 4` the peek-ahead
//! walk can have several candidates' opens prepared concurrently — so,
//! unlike the simple chain, the fd hand-off from `openat`'s `rcsave` to the
//! following `pread`/`close` must be keyed by epoch rather than a single
//! shared cell.

mod common;

use std::cell::RefCell;
use std::ffi::CString;
use std::os::raw::c_void;
use std::rc::Rc;

use scg_core::syscall::{CloseArgs, OpenatArgs, PreadArgs};
use scg_core::OFlags;

const GRAPH_ID: u32 = 4;
const K: u32 = 4;
const PAGE: usize = 4096;

#[test]
fn scans_candidates_and_matches_synchronous_reads() {
    let _ = env_logger::try_init();
    common::enable_foreactor();
    common::set_ring_env(GRAPH_ID, 4, 16);

    let dir = tempfile::tempdir().unwrap();
    let mut paths = Vec::new();
    for i in 0..K {
        let path = dir.path().join(format!("table_{i}.sst"));
        std::fs::write(&path, vec![i as u8; PAGE]).unwrap();
        paths.push(CString::new(path.to_str().unwrap()).unwrap());
    }
    let paths = Rc::new(paths);

    scg::create_scgraph(GRAPH_ID, 1);

    // fd per in-flight candidate epoch, since several opens can be prepared
    // ahead of the frontier at once.
    let fds: Rc<RefCell<std::collections::HashMap<u32, i32>>> = Rc::new(RefCell::new(std::collections::HashMap::new()));

    {
        let paths = paths.clone();
        scg::add_syscall_openat(
            GRAPH_ID,
            0,
            "openat",
            &[0],
            Box::new(move |epoch_raw| {
                let i = epoch_raw[0];
                Some(OpenatArgs {
                    dirfd: libc::AT_FDCWD,
                    pathname: paths[i as usize].clone(),
                    flags: OFlags::RDONLY,
                    mode: 0,
                })
            }),
            {
                let fds = fds.clone();
                Box::new(move |epoch_raw, rc| {
                    fds.borrow_mut().insert(epoch_raw[0], rc as i32);
                })
            },
            true,
        );
    }

    {
        let fds = fds.clone();
        scg::add_syscall_pread(
            GRAPH_ID,
            1,
            "pread",
            &[0],
            PAGE,
            Box::new(move |epoch_raw| {
                let fd = *fds.borrow().get(&epoch_raw[0])?;
                Some(PreadArgs { fd, count: PAGE, offset: 0, buf_ready: false, buf: std::ptr::null_mut(), skip_memcpy: false })
            }),
            Box::new(|_, _| {}),
            false,
        );
    }

    {
        let fds = fds.clone();
        scg::add_syscall_close(
            GRAPH_ID,
            2,
            "close",
            &[0],
            Box::new(move |epoch_raw| {
                let fd = *fds.borrow().get(&epoch_raw[0])?;
                Some(CloseArgs { fd })
            }),
            {
                let fds = fds.clone();
                Box::new(move |epoch_raw, _| {
                    fds.borrow_mut().remove(&epoch_raw[0]);
                })
            },
            false,
        );
    }

    scg::add_branch_node(
        GRAPH_ID,
        3,
        "more candidates?",
        &[0],
        2,
        Box::new(|epoch_raw| Some(if epoch_raw[0] + 1 < K { 0 } else { 1 })),
        false,
    );

    scg::syscall_set_next(GRAPH_ID, 0, Some(1), false, false);
    scg::syscall_set_next(GRAPH_ID, 1, Some(2), false, false);
    scg::syscall_set_next(GRAPH_ID, 2, Some(3), false, false);
    scg::branch_append_child(GRAPH_ID, 3, 0, Some(0));
    scg::branch_append_end_node(GRAPH_ID, 3);
    scg::set_scgraph_built(GRAPH_ID);

    scg::enter_scgraph(GRAPH_ID);

    for i in 0..K {
        let fd = unsafe { scg_hijack::__wrap_openat(libc::AT_FDCWD, paths[i as usize].as_ptr(), libc::O_RDONLY, 0) };
        assert!(fd > 0, "candidate {i}");

        let mut buf = [0u8; PAGE];
        let n = unsafe { scg_hijack::__wrap_pread(fd, buf.as_mut_ptr() as *mut c_void, PAGE, 0) };
        assert_eq!(n, PAGE as isize, "candidate {i}");
        assert!(buf.iter().all(|&b| b == i as u8), "candidate {i} returned the wrong page");

        let closed = unsafe { scg_hijack::__wrap_close(fd) };
        assert_eq!(closed, 0, "candidate {i}");
    }

    scg::leave_scgraph(GRAPH_ID);
}
