//! Error types for store operations.

/// Boxed error produced by collaborator callbacks (expiry, veto, valve,
/// remap closures, mapping sources).
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the store facade.
///
/// Internal allocation pressure (`OversizeMapping` in the backing map) is not
/// represented here; it is remediated by the oversize protocol and only
/// becomes a [`StoreError::StoreAccess`] once every remediation step has been
/// exhausted.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A key or value failed validation. No side effects were applied.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The backing map or arena failed the operation.
    #[error("store access failure: {0}")]
    StoreAccess(String),

    /// A tier contract was violated by the caller.
    #[error("precondition violated: {0}")]
    PreconditionViolated(&'static str),
}

impl StoreError {
    /// Wrap a collaborator failure as a store access error.
    pub(crate) fn access(context: &str, cause: DynError) -> Self {
        StoreError::StoreAccess(format!("{context}: {cause}"))
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
