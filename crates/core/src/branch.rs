//! `BranchNode`: a decision point with a fixed set of children, any subset
//! of which may be back-edges into an enclosing loop.

use crate::epoch::EpochList;
use crate::node::{NodeBase, NodeId, NodeType};
use crate::value_pool::ValuePool;

/// One outgoing edge of a [`BranchNode`]. `back_edge_dim` identifies the
/// loop dimension this edge closes, if any — traversing it increments that
/// dimension's counter (loop dimensions are discovered from back-pointing
/// branch edges).
#[derive(Clone, Copy, Debug)]
pub struct BranchChild {
    pub target: Option<NodeId>,
    pub back_edge_dim: Option<usize>,
}

/// Produces the integer decision for an epoch from the raw loop counters.
/// Returns `None` when the decision cannot be made yet.
pub type DecisionGen = Box<dyn FnMut(&[u32]) -> Option<i32>>;

pub struct BranchNode {
    pub base: NodeBase,
    pub children: Vec<BranchChild>,
    pub decision: ValuePool<i32>,
    pub arggen: DecisionGen,
}

impl BranchNode {
    pub fn new(
        id: NodeId,
        name: impl Into<String>,
        num_children: usize,
        assoc_dims: &[usize],
        arggen: DecisionGen,
    ) -> Self {
        BranchNode {
            base: NodeBase::new(id, name, NodeType::Branch, assoc_dims),
            children: Vec::with_capacity(num_children),
            decision: ValuePool::new(assoc_dims),
            arggen,
        }
    }

    pub fn id(&self) -> NodeId {
        self.base.id
    }

    /// Register a child at the next free slot. `back_edge_dim` is `Some(d)`
    /// when this edge closes loop dimension `d`.
    pub fn append_child(&mut self, target: Option<NodeId>, back_edge_dim: Option<usize>) {
        self.children.push(BranchChild {
            target,
            back_edge_dim,
        });
    }

    pub fn has_decision(&self, epoch: &EpochList) -> bool {
        self.decision.has(epoch)
    }

    /// Invoke the plugin's decision generator for `epoch`, installing the
    /// result. Returns `true` iff a decision became available.
    pub fn generate_decision(&mut self, epoch: &EpochList, epoch_raw: &[u32]) -> bool {
        match (self.arggen)(epoch_raw) {
            Some(d) => {
                self.decision.set(epoch, d);
                true
            }
            None => false,
        }
    }

    /// Resolve which child to take for `epoch`. Returns `None` if the
    /// decision for this epoch isn't ready. Always increments the
    /// corresponding dimension on `epoch` in place if the chosen edge is a
    /// back-edge. `do_remove` additionally drops the decision entry for this
    /// epoch — set by the real frontier advance, left unset while only
    /// peeking, since peeking must not consume a decision the frontier will
    /// need to re-traverse later.
    pub fn pick_branch(&mut self, epoch: &mut EpochList, do_remove: bool) -> Option<BranchChild> {
        if !self.decision.has(epoch) {
            return None;
        }
        let idx = *self.decision.get(epoch);
        let child = self
            .children
            .get(idx as usize)
            .copied()
            .unwrap_or_else(|| panic!("branch node {} decision {idx} out of range", self.base.id.0));
        if do_remove {
            self.decision.remove(epoch);
        }
        if let Some(dim) = child.back_edge_dim {
            epoch.increment(dim);
        }
        Some(child)
    }

    pub fn remove_one_epoch(&mut self, epoch: &EpochList) {
        if self.decision.has(epoch) {
            self.decision.remove(epoch);
        }
    }

    pub fn reset_value_pools(&mut self) {
        self.decision.reset();
    }
}
