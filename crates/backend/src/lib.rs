//! Shared contract between the syscall-graph core and its two
//! asynchronous-execution backends (a kernel io_uring ring, and a
//! user-space worker-thread pool).

mod entry_id;
mod error;
mod submission;

pub use entry_id::{EntryId, EpochSumOverflow, DEFAULT_EPOCH_BITS};
pub use error::BackendError;
pub use submission::{SendPtr, SubmissionSpec};

/// A pluggable asynchronous-execution engine. The core treats the ring and
/// worker-pool implementations interchangeably through this trait.
///
/// Implementations must preserve the order `prepare` calls arrive in when
/// building a batch ("implementations must not reorder").
pub trait Backend {
    /// Record an intention to submit `spec` under identity `id`. Does not
    /// yet perform any I/O. `link_next` carries the chain-link hint: when
    /// set, the next entry prepared after this one in the same batch must
    /// not start until this one completes. The ring backend translates this
    /// into a hard-link SQE flag; the worker-pool backend has no use for it
    /// and ignores it.
    fn prepare(&mut self, id: EntryId, spec: SubmissionSpec, link_next: bool) -> Result<(), BackendError>;

    /// Dispatch every prepared entry as one batch, in prepare order, and
    /// clear the prepared list. Returns the number of entries submitted.
    fn submit_all(&mut self) -> Result<usize, BackendError>;

    /// Block until at least one in-flight entry completes; return its
    /// identity and raw return code. May return completions for entries
    /// other than the one the caller is specifically waiting on — the
    /// caller is expected to loop, updating bookkeeping for every entry it
    /// sees, until its own is observed.
    fn complete_one(&mut self) -> Result<(EntryId, i64), BackendError>;

    /// Discard the prepared list and drain every in-flight entry (calling
    /// `complete_one` until none remain). Used on wrapper exit; draining is
    /// mandatory, not best-effort.
    fn clean_up(&mut self) -> Result<(), BackendError>;

    /// How many entries are prepared but not yet submitted.
    fn num_prepared(&self) -> usize;

    /// How many entries are submitted and awaiting completion.
    fn num_in_flight(&self) -> usize;
}
