//! Error types for the Helm operator

use thiserror::Error;

/// Main error type for release reconciliation
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A chart source failed transiently (download, mirror, object store)
    #[error("chart unavailable: {0}")]
    ChartUnavailable(String),

    /// The deployed release is owned by a different HelmRelease resource
    #[error("ownership conflict: {0}")]
    OwnershipConflict(String),

    /// The deployed release is in a transient state that forbids an upgrade
    #[error("upgrade disallowed: {0}")]
    UpgradeDisallowed(String),

    /// A Helm action (install/upgrade/test/rollback/uninstall) failed
    #[error("helm action failed: {0}")]
    ActionFailure(String),

    /// The v2 to v3 release conversion failed
    #[error("migration failed: {0}")]
    MigrationFailure(String),

    /// Credential envelope could not be decoded
    #[error("credential decode failed: {0}")]
    Decode(String),

    /// Malformed input that should never occur (bad queue key, missing field)
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// I/O error from cache, lock, or subprocess plumbing
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Multiple failures accumulated over one reconciliation
    #[error("{0}")]
    Aggregate(ErrorCollection),
}

impl Error {
    /// Create a chart unavailable error with the given message
    pub fn chart_unavailable(msg: impl Into<String>) -> Self {
        Self::ChartUnavailable(msg.into())
    }

    /// Create an ownership conflict error with the given message
    pub fn ownership_conflict(msg: impl Into<String>) -> Self {
        Self::OwnershipConflict(msg.into())
    }

    /// Create an upgrade disallowed error with the given message
    pub fn upgrade_disallowed(msg: impl Into<String>) -> Self {
        Self::UpgradeDisallowed(msg.into())
    }

    /// Create an action failure with the given message
    pub fn action_failure(msg: impl Into<String>) -> Self {
        Self::ActionFailure(msg.into())
    }

    /// Create a migration failure with the given message
    pub fn migration_failure(msg: impl Into<String>) -> Self {
        Self::MigrationFailure(msg.into())
    }

    /// Create a decode error with the given message
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create an invariant error with the given message
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }
}

/// Collection of errors accumulated while the action loop runs.
///
/// The loop keeps going through its transitions (install -> uninstall,
/// upgrade -> rollback) and appends every failure it encounters; the sync
/// returns the collection as one aggregate error iff it is non-empty, which
/// is what puts the work item back on the queue.
#[derive(Debug, Default)]
pub struct ErrorCollection(Vec<Error>);

impl ErrorCollection {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an error
    pub fn push(&mut self, err: Error) {
        self.0.push(err);
    }

    /// Returns true if no errors were collected
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of collected errors
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Consume the collection, returning `Ok(())` when empty and the
    /// aggregate error otherwise
    pub fn into_result(self) -> Result<(), Error> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(self))
        }
    }

    /// The collected errors
    pub fn errors(&self) -> &[Error] {
        &self.0
    }
}

impl std::fmt::Display for ErrorCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for err in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a failed upgrade followed by a failed rollback surfaces both
    /// failures in one aggregate, in order.
    #[test]
    fn collection_aggregates_in_order() {
        let mut errs = ErrorCollection::new();
        errs.push(Error::action_failure("upgrade failed: timed out"));
        errs.push(Error::action_failure("rollback failed: no revision"));

        assert_eq!(errs.len(), 2);
        let msg = errs.to_string();
        let upgrade_at = msg.find("upgrade failed").unwrap();
        let rollback_at = msg.find("rollback failed").unwrap();
        assert!(upgrade_at < rollback_at, "order must be preserved");
    }

    /// Story: a clean reconciliation produces no aggregate error, which is
    /// what lets the work queue forget the item.
    #[test]
    fn empty_collection_is_ok() {
        assert!(ErrorCollection::new().into_result().is_ok());
    }

    #[test]
    fn non_empty_collection_is_err() {
        let mut errs = ErrorCollection::new();
        errs.push(Error::chart_unavailable("connection refused"));
        let err = errs.into_result().unwrap_err();
        assert!(err.to_string().contains("chart unavailable"));
    }

    /// Error kinds map to distinct handling in the controller: transient
    /// kinds re-queue, invariant kinds are forgotten.
    #[test]
    fn error_kinds_are_distinguishable() {
        match Error::upgrade_disallowed("status 'pending-install'") {
            Error::UpgradeDisallowed(msg) => assert!(msg.contains("pending-install")),
            _ => panic!("expected UpgradeDisallowed"),
        }
        match Error::invariant("expected string in workqueue") {
            Error::Invariant(_) => {}
            _ => panic!("expected Invariant"),
        }
    }
}
