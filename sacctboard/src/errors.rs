// Error kinds that the orchestrator maps to distinct process exit codes.
// Everything else travels as plain anyhow errors and exits 1.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The accounting command exhausted its retries for one window.
    #[error("sacct failed after {attempts} attempts: {reason}")]
    AccountingFailed { attempts: u32, reason: String },

    /// Another process holds the per-cluster state lock.
    #[error("state lock for cluster {0} is held by another process")]
    Locked(String),

    /// Configuration that cannot be acted on (bad dates and the like).
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}
