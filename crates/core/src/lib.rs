//! Syscall graph data model and peek-ahead pre-issue engine.
//!
//! This crate owns the plugin-facing graph shape (nodes, edges, loop
//! dimensions) and the `SCGraph` state machine that decides, on every
//! intercepted POSIX call, whether to run it synchronously or reflect a
//! result an earlier peek-ahead already obtained from a [`scg_backend::Backend`].
//! It depends on `scg-backend` for the asynchronous-execution contract but
//! knows nothing about any particular backend implementation, and nothing
//! about how POSIX calls get intercepted in the first place — see `scg-hijack`
//! for that.

pub mod branch;
pub mod epoch;
pub mod error;
pub mod graph;
pub mod node;
pub mod syscall;
pub mod value_pool;

pub use branch::{BranchChild, BranchNode, DecisionGen};
pub use epoch::{EpochList, MAX_DIMS};
pub use error::{OrFatal, ScgError};
pub use graph::{GraphNode, SCGraph};
pub use node::{EdgeType, Next, NodeBase, NodeId, NodeType};
pub use syscall::{ActualArgs, ArgGen, OFlags, RcSave, SyscallKind, SyscallNode, SyscallStage};
pub use value_pool::ValuePool;
