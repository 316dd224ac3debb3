//! Error types for the broker cache.

use std::time::Duration;

use thiserror::Error;

/// Errors reported by the underlying broker client.
///
/// These come from the open, send and close calls made through the
/// [`transport`](crate::transport) traits. The cache never retries them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Opening a session to the namespace failed
    #[error("Connection to namespace {namespace} failed: {reason}")]
    ConnectFailed { namespace: String, reason: String },

    /// The broker rejected the supplied credentials
    #[error("Broker rejected credentials for namespace {namespace}")]
    Unauthorized { namespace: String },

    /// The broker refused the message or the sender
    #[error("Broker rejected request: {0}")]
    Rejected(String),

    /// The broker-side resource is already closed
    #[error("Broker resource closed: {0}")]
    Closed(String),

    /// Any other transport failure
    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Create a connect failure for a namespace.
    pub fn connect_failed(namespace: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            namespace: namespace.into(),
            reason: reason.into(),
        }
    }

    /// Create a rejection error.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Create a closed-resource error.
    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    /// Create a generic transport error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Which cache key a lookup failed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingKey {
    /// No connection is cached for the namespace
    Namespace(String),
    /// No sender is cached for the destination under the namespace
    Destination { namespace: String, destination: String },
}

impl std::fmt::Display for MissingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Namespace(namespace) => write!(f, "no connection for namespace '{}'", namespace),
            Self::Destination {
                namespace,
                destination,
            } => write!(
                f,
                "no sender for destination '{}' in namespace '{}'",
                destination, namespace
            ),
        }
    }
}

/// Outcome of a disposal pass that had at least one failure.
///
/// Every resource gets a disposal attempt; `first` is the earliest failure
/// observed, the counts describe the whole pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    /// First disposal error observed
    pub first: TransportError,
    /// Number of disposal calls that failed
    pub failed: usize,
    /// Number of disposal calls attempted (senders and sessions)
    pub attempted: usize,
}

impl std::fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} disposals failed, first: {}",
            self.failed, self.attempted, self.first
        )
    }
}

/// Broker cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The referenced namespace or destination has no cached entry
    #[error("Not found: {0}")]
    NotFound(MissingKey),

    /// Operation attempted against a torn-down connection or sender
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The underlying broker call failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A deadline elapsed before the broker answered
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// One or more disposals failed during teardown
    #[error("Teardown incomplete: {0}")]
    Teardown(TeardownFailure),
}

impl CacheError {
    /// Create a not-found error for a namespace.
    pub fn namespace_not_found(namespace: impl Into<String>) -> Self {
        Self::NotFound(MissingKey::Namespace(namespace.into()))
    }

    /// Create a not-found error for a destination.
    pub fn destination_not_found(
        namespace: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self::NotFound(MissingKey::Destination {
            namespace: namespace.into(),
            destination: destination.into(),
        })
    }

    /// Create an invalid-state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether this is an `InvalidState` error.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }
}

/// Collects disposal results without stopping at the first failure.
#[derive(Debug, Default)]
pub(crate) struct DisposalTally {
    first: Option<TransportError>,
    failed: usize,
    attempted: usize,
}

impl DisposalTally {
    pub(crate) fn record(&mut self, result: Result<(), TransportError>) {
        self.attempted += 1;
        if let Err(e) = result {
            self.failed += 1;
            if self.first.is_none() {
                self.first = Some(e);
            }
        }
    }

    /// Fold another tally into this one, keeping the earlier first failure.
    pub(crate) fn merge(&mut self, other: DisposalTally) {
        self.attempted += other.attempted;
        self.failed += other.failed;
        if self.first.is_none() {
            self.first = other.first;
        }
    }

    pub(crate) fn attempted(&self) -> usize {
        self.attempted
    }

    pub(crate) fn into_result(self) -> Result<(), CacheError> {
        match self.first {
            None => Ok(()),
            Some(first) => Err(CacheError::Teardown(TeardownFailure {
                first,
                failed: self.failed,
                attempted: self.attempted,
            })),
        }
    }
}
