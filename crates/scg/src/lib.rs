//! The plugin-facing graph-construction API: one call per node, id-based
//! in shape (plugin code is expected to be generated rather than
//! hand-written) but expressed as an ordinary Rust library instead of an
//! `extern "C"` surface.
//!
//! A per-thread registry of graphs keyed by a plugin-chosen `graph_id`, a
//! backend chosen once at [`create_scgraph`] time from
//! [`scg_config::graph_config`], and `enter_scgraph`/`leave_scgraph` driving
//! [`SCGraph::register_active`] / [`SCGraph::unregister_active`] plus the
//! drain-and-reset `leave_scgraph` performs before unregistering.

use std::cell::RefCell;

use hashbrown::HashMap;

use scg_backend::Backend;
use scg_backend_pool::PoolBackend;
use scg_backend_uring::UringBackend;
use scg_core::branch::{BranchNode, DecisionGen};
use scg_core::error::OrFatal;
use scg_core::node::{Next, NodeId};
use scg_core::syscall::{
    ArgGen, CloseArgs, CloseNode, FstatArgs, FstatNode, FstatatArgs, FstatatNode, LseekArgs,
    LseekNode, OpenArgs, OpenNode, OpenatArgs, OpenatNode, PreadArgs, PreadNode, PwriteArgs,
    PwriteNode, RcSave, SyscallKind, SyscallNode,
};
use scg_core::value_pool::ValuePool;
use scg_core::SCGraph;

thread_local! {
    /// One [`SCGraph`] per hijacked host function per thread.
    /// `Box`ed so a graph's address never moves once it may be registered
    /// active (see [`SCGraph::register_active`]'s safety contract).
    static GRAPHS: RefCell<HashMap<u32, Box<SCGraph>>> = RefCell::new(HashMap::new());
}

fn with_graph<R>(graph_id: u32, f: impl FnOnce(&mut SCGraph) -> R) -> R {
    GRAPHS.with(|cell| {
        let mut graphs = cell.borrow_mut();
        let graph = graphs
            .get_mut(&graph_id)
            .unwrap_or_else(|| panic!("graph_id {graph_id} not found"));
        f(graph)
    })
}

/// Whether the host process opted into asynchronous pre-issue at all
/// (`USE_FOREACTOR=yes`). Plugins check this before bothering to build a
/// graph at all.
pub fn use_foreactor() -> bool {
    scg_config::use_foreactor()
}

pub fn has_scgraph(graph_id: u32) -> bool {
    GRAPHS.with(|cell| cell.borrow().contains_key(&graph_id))
}

/// Create a new, empty graph for `graph_id`, selecting and constructing its
/// backend from `scg_config::graph_config(graph_id)`: the worker-pool
/// backend if `UTHREADS_<graph_id>` is set, the io_uring backend otherwise.
/// Fatal (panics) if `graph_id` already exists, or if the environment
/// configuration for it is missing or invalid — both are plugin-construction
/// mistakes, not runtime conditions to recover from.
pub fn create_scgraph(graph_id: u32, total_dims: usize) {
    GRAPHS.with(|cell| {
        if cell.borrow().contains_key(&graph_id) {
            panic!("graph_id {graph_id} already exists");
        }
    });

    let cfg = scg_config::graph_config(graph_id).or_fatal();
    let backend: Box<dyn Backend> = match cfg.thread_pool_size {
        Some(nthreads) => {
            log::debug!("graph {graph_id}: using worker-pool backend ({nthreads} threads)");
            Box::new(PoolBackend::new(nthreads, cfg.uring_queue_len, true))
        }
        None => {
            log::debug!("graph {graph_id}: using io_uring backend");
            let ring = UringBackend::new(cfg.uring_queue_len as u32, cfg.sqe_async_flag)
                .unwrap_or_else(|e| panic!("graph {graph_id}: failed to create io_uring instance: {e}"));
            Box::new(ring)
        }
    };

    let graph = SCGraph::new(graph_id, total_dims, backend, cfg.pre_issue_depth);
    GRAPHS.with(|cell| {
        cell.borrow_mut().insert(graph_id, Box::new(graph));
    });
}

pub fn set_scgraph_built(graph_id: u32) {
    with_graph(graph_id, |g| g.set_built().or_fatal());
}

/// Register `graph_id`'s graph as this thread's active graph, so the
/// hijacked entry points in `scg-hijack` can find its frontier. No-op when
/// pre-issue was never enabled for this process.
pub fn enter_scgraph(graph_id: u32) {
    if !use_foreactor() {
        return;
    }
    GRAPHS.with(|cell| {
        let mut graphs = cell.borrow_mut();
        let graph = graphs
            .get_mut(&graph_id)
            .unwrap_or_else(|| panic!("graph_id {graph_id} not found"));
        assert!(graph.is_built(), "graph {graph_id} entered before being marked built");
        graph.register_active().or_fatal();
    });
}

/// Drain outstanding backend work, reset frontier/epoch state to the
/// start, and unregister as this thread's active graph.
pub fn leave_scgraph(graph_id: u32) {
    if !use_foreactor() {
        return;
    }
    with_graph(graph_id, |g| {
        g.clear_all_reqs().or_fatal();
        g.reset_to_start();
        g.unregister_active();
    });
}

pub fn syscall_set_next(graph_id: u32, from: u32, to: Option<u32>, weak: bool, link: bool) {
    let next = to.map(|id| Next::Node(NodeId(id))).unwrap_or(Next::End);
    with_graph(graph_id, |g| g.syscall_set_next(NodeId(from), next, weak, link).or_fatal());
}

pub fn branch_append_child(graph_id: u32, branch: u32, child: u32, back_edge_dim: Option<usize>) {
    with_graph(graph_id, |g| {
        g.branch_append_child(NodeId(branch), NodeId(child), back_edge_dim).or_fatal()
    });
}

pub fn branch_append_end_node(graph_id: u32, branch: u32) {
    with_graph(graph_id, |g| g.branch_append_end_node(NodeId(branch)).or_fatal());
}

pub fn add_branch_node(
    graph_id: u32,
    node_id: u32,
    name: impl Into<String>,
    assoc_dims: &[usize],
    num_children: usize,
    arggen: DecisionGen,
    is_start: bool,
) {
    let node = BranchNode::new(NodeId(node_id), name, num_children, assoc_dims, arggen);
    with_graph(graph_id, |g| g.add_branch_node(node, is_start).or_fatal());
}

pub fn add_syscall_open(
    graph_id: u32,
    node_id: u32,
    name: impl Into<String>,
    assoc_dims: &[usize],
    arggen: ArgGen<OpenArgs>,
    rcsave: RcSave,
    is_start: bool,
) {
    let inner = OpenNode { args: ValuePool::new(assoc_dims), arggen, rcsave };
    let node = SyscallNode::new(NodeId(node_id), name, SyscallKind::Open(inner), assoc_dims);
    with_graph(graph_id, |g| g.add_syscall_node(node, is_start).or_fatal());
}

pub fn add_syscall_openat(
    graph_id: u32,
    node_id: u32,
    name: impl Into<String>,
    assoc_dims: &[usize],
    arggen: ArgGen<OpenatArgs>,
    rcsave: RcSave,
    is_start: bool,
) {
    let inner = OpenatNode { args: ValuePool::new(assoc_dims), arggen, rcsave };
    let node = SyscallNode::new(NodeId(node_id), name, SyscallKind::Openat(inner), assoc_dims);
    with_graph(graph_id, |g| g.add_syscall_node(node, is_start).or_fatal());
}

pub fn add_syscall_close(
    graph_id: u32,
    node_id: u32,
    name: impl Into<String>,
    assoc_dims: &[usize],
    arggen: ArgGen<CloseArgs>,
    rcsave: RcSave,
    is_start: bool,
) {
    let inner = CloseNode { args: ValuePool::new(assoc_dims), arggen, rcsave };
    let node = SyscallNode::new(NodeId(node_id), name, SyscallKind::Close(inner), assoc_dims);
    with_graph(graph_id, |g| g.add_syscall_node(node, is_start).or_fatal());
}

pub fn add_syscall_pwrite(
    graph_id: u32,
    node_id: u32,
    name: impl Into<String>,
    assoc_dims: &[usize],
    arggen: ArgGen<PwriteArgs>,
    rcsave: RcSave,
    is_start: bool,
) {
    let inner = PwriteNode { args: ValuePool::new(assoc_dims), arggen, rcsave };
    let node = SyscallNode::new(NodeId(node_id), name, SyscallKind::Pwrite(inner), assoc_dims);
    with_graph(graph_id, |g| g.add_syscall_node(node, is_start).or_fatal());
}

pub fn add_syscall_lseek(
    graph_id: u32,
    node_id: u32,
    name: impl Into<String>,
    assoc_dims: &[usize],
    arggen: ArgGen<LseekArgs>,
    rcsave: RcSave,
    is_start: bool,
) {
    let inner = LseekNode { args: ValuePool::new(assoc_dims), arggen, rcsave };
    let node = SyscallNode::new(NodeId(node_id), name, SyscallKind::Lseek(inner), assoc_dims);
    with_graph(graph_id, |g| g.add_syscall_node(node, is_start).or_fatal());
}

/// `pread` additionally needs `pre_alloc_buf_size`, the scratch-buffer
/// allocation size used when the destination isn't yet known at pre-issue
/// time.
#[allow(clippy::too_many_arguments)]
pub fn add_syscall_pread(
    graph_id: u32,
    node_id: u32,
    name: impl Into<String>,
    assoc_dims: &[usize],
    pre_alloc_buf_size: usize,
    arggen: ArgGen<PreadArgs>,
    rcsave: RcSave,
    is_start: bool,
) {
    let buf_cap = with_graph(graph_id, |g| g.pre_issue_depth() + 1);
    let inner = PreadNode {
        args: ValuePool::new(assoc_dims),
        user_buf: ValuePool::new(assoc_dims),
        internal_bufs: ValuePool::new(assoc_dims),
        free_bufs: Vec::new(),
        buf_cap,
        alloc_size: pre_alloc_buf_size,
        arggen,
        rcsave,
    };
    let node = SyscallNode::new(NodeId(node_id), name, SyscallKind::Pread(inner), assoc_dims);
    with_graph(graph_id, |g| g.add_syscall_node(node, is_start).or_fatal());
}

pub fn add_syscall_fstat(
    graph_id: u32,
    node_id: u32,
    name: impl Into<String>,
    assoc_dims: &[usize],
    arggen: ArgGen<FstatArgs>,
    rcsave: RcSave,
    is_start: bool,
) {
    let buf_cap = with_graph(graph_id, |g| g.pre_issue_depth() + 1);
    let inner = FstatNode {
        args: ValuePool::new(assoc_dims),
        user_stat: ValuePool::new(assoc_dims),
        internal_bufs: ValuePool::new(assoc_dims),
        free_bufs: Vec::new(),
        buf_cap,
        arggen,
        rcsave,
    };
    let node = SyscallNode::new(NodeId(node_id), name, SyscallKind::Fstat(inner), assoc_dims);
    with_graph(graph_id, |g| g.add_syscall_node(node, is_start).or_fatal());
}

#[allow(clippy::too_many_arguments)]
pub fn add_syscall_fstatat(
    graph_id: u32,
    node_id: u32,
    name: impl Into<String>,
    assoc_dims: &[usize],
    arggen: ArgGen<FstatatArgs>,
    rcsave: RcSave,
    is_start: bool,
) {
    let buf_cap = with_graph(graph_id, |g| g.pre_issue_depth() + 1);
    let inner = FstatatNode {
        args: ValuePool::new(assoc_dims),
        user_stat: ValuePool::new(assoc_dims),
        internal_bufs: ValuePool::new(assoc_dims),
        free_bufs: Vec::new(),
        buf_cap,
        arggen,
        rcsave,
    };
    let node = SyscallNode::new(NodeId(node_id), name, SyscallKind::Fstatat(inner), assoc_dims);
    with_graph(graph_id, |g| g.add_syscall_node(node, is_start).or_fatal());
}
