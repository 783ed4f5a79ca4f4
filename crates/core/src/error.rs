//! Error taxonomy for the syscall-graph core.
//!
//! Every variant here is a *fatal* condition: a plugin-construction mistake
//! or a broken precondition discovered at syscall-interception time. None of
//! these represent a POSIX call returning an error code — that raw return
//! value is never wrapped, it is surfaced to the caller untouched.

use scg_backend::BackendError;

#[derive(Debug, thiserror::Error)]
pub enum ScgError {
    #[error("graph id {0} is already registered")]
    DuplicateGraphId(u32),

    #[error("graph {graph_id} already has a node with id {node_id}")]
    DuplicateNodeId { graph_id: u32, node_id: u32 },

    #[error("graph {graph_id} has no node with id {node_id}")]
    UnknownNodeId { graph_id: u32, node_id: u32 },

    #[error("node {node_id} in graph {graph_id} is not a {expected} node")]
    WrongNodeType {
        graph_id: u32,
        node_id: u32,
        expected: &'static str,
    },

    #[error("graph {0} was built with no node flagged as the initial frontier")]
    MissingStart(u32),

    #[error("graph {0} was entered but has not been marked built")]
    NotBuilt(u32),

    #[error("missing environment configuration for graph {graph_id}: {var}")]
    MissingEnvConfig { graph_id: u32, var: &'static str },

    #[error(
        "check_args mismatch on node {node_id} ({syscall}): {detail}"
    )]
    ArgumentMismatch {
        node_id: u32,
        syscall: &'static str,
        detail: String,
    },

    #[error("a graph is already active on this thread; nested enter_scgraph is rejected")]
    NestedGraphActive,

    #[error("no graph is currently active on this thread")]
    NoActiveGraph,

    #[error("graph {0} was already built; graph construction calls are one-shot")]
    AlreadyBuilt(u32),

    #[error("graph exhausted: frontier walked past the end of the syscall graph")]
    FrontierAtEnd,

    #[error("branch node {node_id} in graph {graph_id} could not generate a decision when required")]
    DecisionNotReady { graph_id: u32, node_id: u32 },

    #[error(transparent)]
    EntryIdOverflow(#[from] scg_backend::EpochSumOverflow),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ScgError {
    /// Terminate the process with this error's descriptive message:
    /// plugin-misuse and precondition-violation errors are fatal by design,
    /// not recoverable return codes.
    pub fn fatal(self) -> ! {
        log::error!("fatal scgraph error: {self}");
        panic!("fatal scgraph error: {self}");
    }
}

/// Convenience for call sites that must abort immediately on any error.
/// Covers any error type this module's taxonomy can absorb via `From`, so
/// backend and entry-id errors route through the same fatal path as
/// `ScgError` itself.
pub trait OrFatal<T> {
    fn or_fatal(self) -> T;
}

impl<T, E> OrFatal<T> for Result<T, E>
where
    ScgError: From<E>,
{
    fn or_fatal(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => ScgError::from(e).fatal(),
        }
    }
}
