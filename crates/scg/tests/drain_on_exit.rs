//! Scenario 6 (drain on exit): enter a graph, read only part way through a
//! loop so several later iterations are left prepared or in flight, then
//! leave without consuming them. `leave_scgraph` must drain everything it
//! started and reset the graph to a clean, reusable state — checked here by
//! running the *same* graph a second time, start to finish, and getting
//! correct data back.

mod common;

use std::os::raw::c_void;
use std::os::unix::io::AsRawFd;

use scg_core::syscall::PreadArgs;

const GRAPH_ID: u32 = 6;
const N: u32 = 32;
const BLOCK: usize = 64;
const STOP_EARLY_AT: usize = 5;

fn build_graph(fd: i32) {
    scg::add_syscall_pread(
        GRAPH_ID,
        0,
        "pread",
        &[0],
        BLOCK,
        Box::new(move |epoch_raw| {
            let i = epoch_raw[0] as i64;
            Some(PreadArgs {
                fd,
                count: BLOCK,
                offset: i * BLOCK as i64,
                buf_ready: false,
                buf: std::ptr::null_mut(),
                skip_memcpy: false,
            })
        }),
        Box::new(|_, _| {}),
        true,
    );
    scg::add_branch_node(
        GRAPH_ID,
        1,
        "more?",
        &[0],
        2,
        Box::new(|epoch_raw| Some(if epoch_raw[0] + 1 < N { 0 } else { 1 })),
        false,
    );
    scg::syscall_set_next(GRAPH_ID, 0, Some(1), false, false);
    scg::branch_append_child(GRAPH_ID, 1, 0, Some(0));
    scg::branch_append_end_node(GRAPH_ID, 1);
    scg::set_scgraph_built(GRAPH_ID);
}

fn run_n_reads(fd: i32, count: usize, contents: &[u8]) {
    scg::enter_scgraph(GRAPH_ID);
    for i in 0..count {
        let mut buf = [0u8; BLOCK];
        let n = unsafe {
            scg_hijack::__wrap_pread(fd, buf.as_mut_ptr() as *mut c_void, BLOCK, (i * BLOCK) as libc::off_t)
        };
        assert_eq!(n, BLOCK as isize, "iteration {i}");
        assert_eq!(&buf[..], &contents[i * BLOCK..(i + 1) * BLOCK], "iteration {i}");
    }
    scg::leave_scgraph(GRAPH_ID);
}

#[test]
fn leaving_mid_loop_drains_cleanly_and_the_graph_is_reusable() {
    let _ = env_logger::try_init();
    common::enable_foreactor();
    // A wide ring relative to how far we read lets several later iterations
    // sit prepared/in-flight when we leave early.
    common::set_ring_env(GRAPH_ID, 16, 32);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drain.bin");
    let mut contents = vec![0u8; BLOCK * N as usize];
    for i in 0..N as usize {
        contents[i * BLOCK..(i + 1) * BLOCK].fill((i % 256) as u8);
    }
    std::fs::write(&path, &contents).unwrap();

    let file = std::fs::File::open(&path).unwrap();
    let fd = file.as_raw_fd();

    scg::create_scgraph(GRAPH_ID, 1);
    build_graph(fd);

    // First pass: stop well short of N, leaving outstanding pre-issued work
    // for `leave_scgraph` to drain.
    run_n_reads(fd, STOP_EARLY_AT, &contents);

    // Second pass, from scratch on the same graph: if the drain or the
    // reset left any stale state (a dangling prepared entry, a leftover
    // epoch), this full run would either panic or return wrong bytes.
    run_n_reads(fd, N as usize, &contents);
}
