use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the reconcilers. The dispatcher only cares about one
/// distinction: fatal errors park the PVC until an operator intervenes,
/// everything else is retried with backoff.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to encode or decode the results annotation: {0}")]
    Results(#[from] serde_json::Error),

    #[error("reconcile deadline exceeded")]
    DeadlineExceeded,

    #[error("{0}")]
    Fatal(String),
}

impl Error {
    pub fn fatal(message: impl Into<String>) -> Self {
        Error::Fatal(message.into())
    }

    /// Fatal errors are not retried; the PVC stays parked until the operator
    /// clears the offending state. A malformed results annotation counts as
    /// fatal since retrying cannot repair it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_) | Error::Results(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_is_fatal() {
        assert!(Error::fatal("unsupported mode 'nfs'").is_fatal());
    }

    #[test]
    fn deadline_is_retryable() {
        assert!(!Error::DeadlineExceeded.is_fatal());
    }
}
