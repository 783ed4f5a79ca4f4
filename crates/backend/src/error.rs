/// Errors a [`crate::Backend`] can report. Both variants are fatal to the
/// current host-function invocation: the caller does not try to recover,
/// since outstanding in-flight state would otherwise be left inconsistent.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend rejected submission batch: {reason}")]
    SubmitFailed { reason: String },

    #[error("backend wait for completion failed: {reason}")]
    WaitFailed { reason: String },
}
