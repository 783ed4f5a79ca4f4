//! [`SCGraph`]: the node container, frontier/peek state, and the
//! peek-ahead pre-issue algorithm that is the heart of this crate.

use std::cell::RefCell;
use std::ptr::NonNull;

use hashbrown::HashMap;

use scg_backend::{Backend, EntryId, DEFAULT_EPOCH_BITS};

use crate::branch::BranchNode;
use crate::epoch::{EpochList, MAX_DIMS};
use crate::error::{OrFatal, ScgError};
use crate::node::{EdgeType, Next, NodeId, NodeType};
use crate::syscall::{ActualArgs, SyscallNode, SyscallStage};

/// Either kind of node a graph can hold: a closed tagged set one level up
/// from [`crate::syscall::SyscallKind`].
pub enum GraphNode {
    Syscall(SyscallNode),
    Branch(BranchNode),
}

impl GraphNode {
    fn id(&self) -> NodeId {
        match self {
            GraphNode::Syscall(n) => n.id(),
            GraphNode::Branch(n) => n.id(),
        }
    }

    fn node_type(&self) -> NodeType {
        match self {
            GraphNode::Syscall(n) => n.kind.node_type(),
            GraphNode::Branch(_) => NodeType::Branch,
        }
    }

    fn assoc_dims(&self) -> &[usize] {
        match self {
            GraphNode::Syscall(n) => &n.base.assoc_dims,
            GraphNode::Branch(n) => &n.base.assoc_dims,
        }
    }

    fn reset_value_pools(&mut self) {
        match self {
            GraphNode::Syscall(n) => n.reset_value_pools(),
            GraphNode::Branch(n) => n.reset_value_pools(),
        }
    }
}

fn epoch_raw(epoch: &EpochList) -> smallvec::SmallVec<[u32; MAX_DIMS]> {
    (0..epoch.dims()).map(|d| epoch.at(d)).collect()
}

/// Syscall graph describing one wrapped host function's I/O: the node set,
/// the frontier (next syscall the host function will issue), and the
/// peekhead (farthest node the pre-issue walker has considered so far).
///
/// One `SCGraph` is built once per plugin-described function and re-used
/// (via [`SCGraph::reset_to_start`]) across every invocation of that
/// function. All state here is meant to be owned and driven from a single
/// thread — see [`SCGraph::register_active`].
pub struct SCGraph {
    graph_id: u32,
    total_dims: usize,
    nodes: HashMap<NodeId, GraphNode>,
    pre_issue_depth: usize,
    backend: Box<dyn Backend>,
    entry_bits: u32,
    built: bool,

    initial_frontier: Option<NodeId>,
    frontier: Next,
    frontier_epoch: EpochList,

    peekhead: Next,
    peekhead_edge: EdgeType,
    peekhead_epoch: EpochList,
    /// Negative when the peekhead has not yet been seated relative to the
    /// current frontier.
    peekhead_distance: i64,
    peekhead_hit_end: bool,

    num_prepared: usize,
    prepared_distance: i64,
    /// Entries prepared but not yet submitted, in prepare order, so that a
    /// successful `submit_all` knows which `(node, epoch)` pairs to flip to
    /// `OnTheFly`. The backend itself only ever sees `EntryId`/
    /// `SubmissionSpec` values — node/epoch bookkeeping is the graph's job,
    /// not the backend's.
    prepared_entries: Vec<(NodeId, EpochList)>,
    /// `(node, epoch)` for every entry currently submitted to the backend,
    /// keyed by the same `EntryId` raw value the backend will hand back on
    /// completion.
    in_flight_epochs: HashMap<u64, (NodeId, EpochList)>,
}

impl SCGraph {
    /// A new, empty graph. `total_dims` is fixed for the graph's lifetime.
    /// `pre_issue_depth` bounds how many nodes past the frontier the peek
    /// walker considers per [`SCGraph::issue`] call.
    pub fn new(graph_id: u32, total_dims: usize, backend: Box<dyn Backend>, pre_issue_depth: usize) -> Self {
        assert!(total_dims <= MAX_DIMS, "graph has more than {MAX_DIMS} dimensions");
        SCGraph {
            graph_id,
            total_dims,
            nodes: HashMap::new(),
            pre_issue_depth,
            backend,
            entry_bits: DEFAULT_EPOCH_BITS,
            built: false,
            initial_frontier: None,
            frontier: Next::End,
            frontier_epoch: EpochList::zero(total_dims),
            peekhead: Next::End,
            peekhead_edge: EdgeType::Must,
            peekhead_epoch: EpochList::zero(total_dims),
            peekhead_distance: -1,
            peekhead_hit_end: false,
            num_prepared: 0,
            prepared_distance: -1,
            prepared_entries: Vec::new(),
            in_flight_epochs: HashMap::new(),
        }
    }

    pub fn graph_id(&self) -> u32 {
        self.graph_id
    }

    pub fn total_dims(&self) -> usize {
        self.total_dims
    }

    /// How many nodes past the frontier the peek walker considers per
    /// [`SCGraph::issue`] call. Plugin-facing node constructors size their
    /// recyclable internal buffer pools off this (bounded at
    /// `pre_issue_depth + 1` entries per node).
    pub fn pre_issue_depth(&self) -> usize {
        self.pre_issue_depth
    }

    /// Override the number of bits reserved for the epoch-sum component of
    /// [`EntryId`] encoding. Must be called before any node reaches
    /// `Prepared`. Defaults to [`DEFAULT_EPOCH_BITS`].
    pub fn set_entry_id_bits(&mut self, bits: u32) {
        self.entry_bits = bits;
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    // -----------------------------------------------------------------
    // Construction (plugin-facing API, one call per node)
    // -----------------------------------------------------------------

    pub fn add_syscall_node(&mut self, node: SyscallNode, is_start: bool) -> Result<(), ScgError> {
        let id = node.id();
        if self.nodes.contains_key(&id) {
            return Err(ScgError::DuplicateNodeId {
                graph_id: self.graph_id,
                node_id: id.0,
            });
        }
        self.nodes.insert(id, GraphNode::Syscall(node));
        self.maybe_set_start(id, is_start);
        Ok(())
    }

    pub fn add_branch_node(&mut self, node: BranchNode, is_start: bool) -> Result<(), ScgError> {
        let id = node.id();
        if self.nodes.contains_key(&id) {
            return Err(ScgError::DuplicateNodeId {
                graph_id: self.graph_id,
                node_id: id.0,
            });
        }
        self.nodes.insert(id, GraphNode::Branch(node));
        self.maybe_set_start(id, is_start);
        Ok(())
    }

    fn maybe_set_start(&mut self, id: NodeId, is_start: bool) {
        if is_start {
            assert!(
                self.initial_frontier.is_none(),
                "graph {} already has an initial frontier node",
                self.graph_id
            );
            self.initial_frontier = Some(id);
            self.frontier = Next::Node(id);
        }
    }

    pub fn syscall_node_mut(&mut self, id: NodeId) -> Result<&mut SyscallNode, ScgError> {
        match self.nodes.get_mut(&id) {
            Some(GraphNode::Syscall(n)) => Ok(n),
            Some(GraphNode::Branch(_)) => Err(ScgError::WrongNodeType {
                graph_id: self.graph_id,
                node_id: id.0,
                expected: "syscall",
            }),
            None => Err(ScgError::UnknownNodeId {
                graph_id: self.graph_id,
                node_id: id.0,
            }),
        }
    }

    pub fn branch_node_mut(&mut self, id: NodeId) -> Result<&mut BranchNode, ScgError> {
        match self.nodes.get_mut(&id) {
            Some(GraphNode::Branch(n)) => Ok(n),
            Some(GraphNode::Syscall(_)) => Err(ScgError::WrongNodeType {
                graph_id: self.graph_id,
                node_id: id.0,
                expected: "branch",
            }),
            None => Err(ScgError::UnknownNodeId {
                graph_id: self.graph_id,
                node_id: id.0,
            }),
        }
    }

    /// Link `from`'s forward edge to `to`. `weak` marks an edge the host
    /// function may return early on without ever reaching `to`. `link`
    /// hints to the ring backend that the submission immediately following
    /// this one in the same batch must complete after it does.
    pub fn syscall_set_next(&mut self, from: NodeId, to: Next, weak: bool, link: bool) -> Result<(), ScgError> {
        let node = self.syscall_node_mut(from)?;
        node.set_next(to, weak, link);
        Ok(())
    }

    /// Register a child on a branch node, optionally as a back-edge closing
    /// loop dimension `back_edge_dim`.
    pub fn branch_append_child(&mut self, branch: NodeId, child: NodeId, back_edge_dim: Option<usize>) -> Result<(), ScgError> {
        let node = self.branch_node_mut(branch)?;
        node.append_child(Some(child), back_edge_dim);
        Ok(())
    }

    /// Register a branch child that terminates the graph.
    pub fn branch_append_end_node(&mut self, branch: NodeId) -> Result<(), ScgError> {
        let node = self.branch_node_mut(branch)?;
        node.append_child(None, None);
        Ok(())
    }

    /// Marks construction complete. Fatal to call twice, or before an
    /// initial frontier has been designated.
    pub fn set_built(&mut self) -> Result<(), ScgError> {
        if self.built {
            return Err(ScgError::AlreadyBuilt(self.graph_id));
        }
        if self.initial_frontier.is_none() {
            return Err(ScgError::MissingStart(self.graph_id));
        }
        self.built = true;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Active-graph registration
    // -----------------------------------------------------------------

    /// Install `self` as the thread's active graph. Fails with
    /// [`ScgError::NestedGraphActive`] if another graph is already active
    /// on this thread: at most one active graph is supported per thread,
    /// and nesting is rejected outright rather than stacked.
    ///
    /// # Safety
    /// The caller must ensure `self` is not moved or dropped until
    /// [`SCGraph::unregister_active`] is called — typically by keeping it
    /// pinned in a `Box` for the duration of the wrapped host function.
    pub fn register_active(&mut self) -> Result<(), ScgError> {
        ACTIVE_GRAPH.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_some() {
                return Err(ScgError::NestedGraphActive);
            }
            *slot = NonNull::new(self as *mut SCGraph);
            Ok(())
        })
    }

    /// Clear the thread-local active-graph pointer. Idempotent.
    pub fn unregister_active(&mut self) {
        ACTIVE_GRAPH.with(|cell| {
            let mut slot = cell.borrow_mut();
            if *slot == NonNull::new(self as *mut SCGraph) {
                *slot = None;
            }
        });
    }

    /// Run `f` against the currently active graph on this thread, if any.
    /// Used by the hijacked POSIX entry points to find the frontier node
    /// without requiring their own reference to a specific graph.
    pub fn with_active<R>(f: impl FnOnce(&mut SCGraph) -> R) -> Option<R> {
        let ptr = ACTIVE_GRAPH.with(|cell| *cell.borrow());
        // SAFETY: `register_active`'s caller contract guarantees the
        // pointee outlives every call that can observe it in the slot.
        ptr.map(|mut p| unsafe { f(p.as_mut()) })
    }

    // -----------------------------------------------------------------
    // Lifecycle: reset, drain
    // -----------------------------------------------------------------

    /// Drain outstanding backend work without resetting graph position —
    /// used on wrapper exit before the position itself is reset. Draining
    /// is mandatory, not best-effort.
    pub fn clear_all_reqs(&mut self) -> Result<(), ScgError> {
        self.backend.clean_up()?;
        self.prepared_entries.clear();
        self.in_flight_epochs.clear();
        self.num_prepared = 0;
        self.prepared_distance = -1;
        Ok(())
    }

    /// Restore frontier to the initial node, zero every epoch counter,
    /// clear peek state, and reset every node's value pools (returning
    /// recyclable buffers to their free-lists).
    pub fn reset_to_start(&mut self) {
        self.num_prepared = 0;
        self.prepared_distance = -1;

        self.frontier = self
            .initial_frontier
            .map(Next::Node)
            .unwrap_or(Next::End);
        self.frontier_epoch.reset();

        self.peekhead = Next::End;
        self.peekhead_edge = EdgeType::Must;
        self.peekhead_epoch.reset();
        self.peekhead_distance = -1;
        self.peekhead_hit_end = false;

        for node in self.nodes.values_mut() {
            node.reset_value_pools();
        }
    }

    // -----------------------------------------------------------------
    // Frontier / interception entry points
    // -----------------------------------------------------------------

    /// Walk past any already-decided branch nodes starting at the current
    /// frontier, generating branch decisions as needed, advancing
    /// `frontier_epoch` on back-edges taken, and return the id of the
    /// frontier `SyscallNode`.
    pub fn get_frontier(&mut self) -> Result<NodeId, ScgError> {
        loop {
            let cur = match self.frontier {
                Next::Node(id) => id,
                Next::End => return Err(ScgError::FrontierAtEnd),
            };
            if !matches!(self.nodes.get(&cur), Some(GraphNode::Branch(_))) {
                return Ok(cur);
            }
            let raw = epoch_raw(&self.frontier_epoch);
            let frontier_epoch = &mut self.frontier_epoch;
            let branch = match self.nodes.get_mut(&cur) {
                Some(GraphNode::Branch(n)) => n,
                _ => unreachable!(),
            };
            if !branch.has_decision(frontier_epoch) && !branch.generate_decision(frontier_epoch, &raw) {
                return Err(ScgError::DecisionNotReady {
                    graph_id: self.graph_id,
                    node_id: cur.0,
                });
            }
            let child = branch
                .pick_branch(frontier_epoch, true)
                .expect("decision just confirmed present");
            self.frontier = child.target.map(Next::Node).unwrap_or(Next::End);
        }
    }

    /// Reconcile arguments actually observed at syscall interception with
    /// anything already predicted for this node at the current frontier
    /// epoch.
    pub fn check_args(&mut self, node_id: NodeId, actual: ActualArgs) -> Result<(), ScgError> {
        let epoch = self.frontier_epoch.clone();
        let node = self.syscall_node_mut(node_id)?;
        node.check_args(&epoch, actual)
    }

    /// Drive one frontier step: peek-ahead pre-issue, then frontier advance
    /// and result delivery. Returns the syscall's raw return code.
    pub fn issue(&mut self, node_id: NodeId, output_buf: *mut libc::c_void) -> i64 {
        debug_assert_eq!(self.frontier, Next::Node(node_id));

        if self.pre_issue_depth > 0 && !self.peekhead_hit_end {
            self.peek_and_prepare();
        }

        if self.num_prepared > 0
            && (self.num_prepared >= self.pre_issue_depth / 2 || self.prepared_distance <= 1)
        {
            self.flush_prepared();
        }

        let epoch = self.frontier_epoch.clone();
        let stage = {
            let node = self.syscall_node_mut(node_id).or_fatal();
            node.stage_at(&epoch)
        };

        let rc = match stage {
            SyscallStage::NotReady => {
                panic!("node {} issued before CheckArgs brought it to ArgReady", node_id.0)
            }
            SyscallStage::Prepared => {
                panic!(
                    "node {} reached Issue while Prepared but not yet submitted; \
                     the frontier must always be flushed before its own result is needed",
                    node_id.0
                )
            }
            SyscallStage::ArgReady => {
                log::trace!("sync-call node {}", node_id.0);
                let node = self.syscall_node_mut(node_id).or_fatal();
                let rc = node.kind.syscall_sync(&epoch, output_buf);
                node.rc.set(&epoch, rc);
                node.stage.set(&epoch, SyscallStage::Finished);
                rc
            }
            // `Finished` is reachable here if completion-harvesting during
            // an earlier wait already delivered this node's own result
            // incidentally.
            SyscallStage::OnTheFly | SyscallStage::Finished => {
                if stage == SyscallStage::OnTheFly {
                    self.drain_until(node_id, &epoch);
                }
                let node = self.syscall_node_mut(node_id).or_fatal();
                node.kind.reflect_result(&epoch, output_buf);
                *node.rc.get(&epoch)
            }
        };
        rc.tap_advance(self, node_id, &epoch)
    }

    /// Block on `backend.complete_one` until the completion for
    /// `(node_id, epoch)` is observed, updating every node the backend
    /// reports along the way — not just the one being waited on.
    fn drain_until(&mut self, node_id: NodeId, epoch: &EpochList) {
        loop {
            let (entry_id, rc) = self.backend.complete_one().or_fatal();
            let (done_node, done_epoch) = self
                .in_flight_epochs
                .remove(&entry_id.raw())
                .unwrap_or_else(|| panic!("completion for unknown entry id {:?}", entry_id));
            if let Ok(n) = self.syscall_node_mut(done_node) {
                n.rc.set(&done_epoch, rc);
                n.stage.set(&done_epoch, SyscallStage::Finished);
            }
            if done_node == node_id && done_epoch.same_as(epoch) {
                break;
            }
        }
    }

    fn flush_prepared(&mut self) {
        let submitted = self.backend.submit_all().or_fatal();
        debug_assert_eq!(submitted, self.prepared_entries.len());
        for (node_id, epoch) in self.prepared_entries.drain(..) {
            let epoch_sum = {
                let node = self.nodes.get(&node_id).expect("prepared node vanished");
                epoch.sum(node.assoc_dims())
            };
            let entry_id = EntryId::with_width(node_id.0, epoch_sum, self.entry_bits).or_fatal();
            if let Ok(n) = self.syscall_node_mut(node_id) {
                n.stage.set(&epoch, SyscallStage::OnTheFly);
            }
            self.in_flight_epochs.insert(entry_id.raw(), (node_id, epoch));
        }
        self.num_prepared = 0;
        self.prepared_distance = -1;
    }

    /// The peek-ahead pre-issue walk. Mirrors a classic lookahead-with-
    /// decision-barrier shape, including the within-this-call-only "has
    /// crossed a weak edge" flag (`weak_state`) that resets fresh on every
    /// `issue` call but accumulates across every node the walk visits in
    /// that one call.
    fn peek_and_prepare(&mut self) {
        if self.peekhead_distance < 0 {
            let frontier_id = match self.frontier {
                Next::Node(id) => id,
                Next::End => return,
            };
            let node = self.syscall_node_mut(frontier_id).or_fatal();
            self.peekhead = node.next;
            self.peekhead_edge = node.edge_type;
            self.peekhead_epoch.copy_from(&self.frontier_epoch);
            self.peekhead_distance = 0;
        }

        if matches!(self.peekhead, Next::End) {
            self.peekhead_hit_end = true;
            return;
        }

        let mut budget = self.pre_issue_depth as i64 - self.peekhead_distance;
        let mut weak_state = false;

        while budget > 0 {
            budget -= 1;

            // Walk past any already-resolved (or now-resolvable) branch
            // nodes; stop at a decision barrier without moving peekhead.
            let mut decision_barrier = false;
            loop {
                let cur = match self.peekhead {
                    Next::Node(id) => id,
                    Next::End => break,
                };
                if !matches!(self.nodes.get(&cur), Some(GraphNode::Branch(_))) {
                    break;
                }
                let raw = epoch_raw(&self.peekhead_epoch);
                let peek_epoch = &mut self.peekhead_epoch;
                let branch = match self.nodes.get_mut(&cur) {
                    Some(GraphNode::Branch(n)) => n,
                    _ => unreachable!(),
                };
                if !branch.has_decision(peek_epoch) && !branch.generate_decision(peek_epoch, &raw) {
                    decision_barrier = true;
                    break;
                }
                let child = branch
                    .pick_branch(peek_epoch, false)
                    .expect("decision just confirmed present");
                self.peekhead = child.target.map(Next::Node).unwrap_or(Next::End);
            }

            if decision_barrier {
                break;
            }
            let cur_id = match self.peekhead {
                Next::Node(id) => id,
                Next::End => {
                    self.peekhead_hit_end = true;
                    break;
                }
            };

            let stage_ready = {
                let node = self.syscall_node_mut(cur_id).or_fatal();
                node.stage_at(&self.peekhead_epoch) == SyscallStage::ArgReady
            };
            if !stage_ready {
                let raw = epoch_raw(&self.peekhead_epoch);
                let peek_epoch = self.peekhead_epoch.clone();
                let node = self.syscall_node_mut(cur_id).or_fatal();
                if !node.generate_args(&peek_epoch, &raw) {
                    break;
                }
            }

            if self.peekhead_edge == EdgeType::Weak {
                weak_state = true;
            }
            let node_type = self.nodes.get(&cur_id).expect("peekhead node vanished").node_type();
            let foreactable = !weak_state || node_type == NodeType::SyscallPure;
            if !foreactable {
                break;
            }
            // `lseek` is never pre-issued asynchronously, regardless of the
            // foreactability rule.
            let asyncable = {
                let node = self.syscall_node_mut(cur_id).or_fatal();
                node.kind.is_asyncable()
            };
            if !asyncable {
                break;
            }

            let peek_epoch = self.peekhead_epoch.clone();
            let node = self.syscall_node_mut(cur_id).or_fatal();
            let spec = node.kind.fill_submission(&peek_epoch, cur_id);
            let epoch_sum = peek_epoch.sum(&node.base.assoc_dims);
            let link_next = node.link_next;
            let entry_id = match EntryId::with_width(cur_id.0, epoch_sum, self.entry_bits) {
                Ok(id) => id,
                Err(e) => ScgError::from(e).fatal(),
            };
            self.backend.prepare(entry_id, spec, link_next).or_fatal();
            let node = self.syscall_node_mut(cur_id).or_fatal();
            node.stage.set(&peek_epoch, SyscallStage::Prepared);
            self.prepared_entries.push((cur_id, peek_epoch.clone()));
            log::trace!("prepared node {} at epoch-sum {}", cur_id.0, epoch_sum);

            let (next, edge) = {
                let node = self.syscall_node_mut(cur_id).or_fatal();
                (node.next, node.edge_type)
            };
            self.peekhead = next;
            self.peekhead_edge = edge;
            self.peekhead_distance += 1;
            if self.num_prepared == 0 {
                self.prepared_distance = self.peekhead_distance;
            }
            self.num_prepared += 1;
        }
    }
}

trait TapAdvance {
    fn tap_advance(self, graph: &mut SCGraph, node_id: NodeId, epoch: &EpochList) -> Self;
}

impl TapAdvance for i64 {
    fn tap_advance(self, graph: &mut SCGraph, node_id: NodeId, epoch: &EpochList) -> Self {
        let next = graph.syscall_node_mut(node_id).or_fatal().next;
        graph.frontier = next;
        graph.peekhead_distance -= 1;
        graph.prepared_distance -= 1;
        let raw = epoch_raw(epoch);
        let node = graph.syscall_node_mut(node_id).or_fatal();
        node.kind.remove_one_epoch(epoch, &raw, self);
        self
    }
}

thread_local! {
    static ACTIVE_GRAPH: RefCell<Option<NonNull<SCGraph>>> = const { RefCell::new(None) };
}
