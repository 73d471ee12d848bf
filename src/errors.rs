//! Notification Error Hierarchy
//!
//! Errors are split by the layer that raised them: the store transport, a
//! rejected store request, the watch stream, or local configuration.
//! Every variant carries owned context only, so errors can be cloned into
//! a dispatcher's error sink while also being logged.

use std::time::Duration;

use config::ConfigError;
use tonic::Code;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Connection or transport failure talking to the store
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Store rejected a put/delete/txn request
    #[error("Write rejected: {0}")]
    Write(String),

    /// Store rejected a get/range request
    #[error("Read rejected: {0}")]
    Read(String),

    /// Lease grant, renewal or revocation failure
    #[error("Lease error: {0}")]
    Lease(String),

    /// Watch stream failure (canceled by the store, protocol error)
    #[error("Watch error: {0}")]
    Watch(String),

    /// Requested revision was compacted away by the store
    #[error("Revision {requested} has been compacted (compact revision: {compact_revision})")]
    Compacted { requested: i64, compact_revision: i64 },

    /// Stored checkpoint value is not a decimal revision
    #[error("Malformed revision checkpoint: {0}")]
    Checkpoint(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration source failures
    #[error("Config error: {0}")]
    Config(String),

    /// Configuration validation failures
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Single attempt of a retried task exceeded its timeout
    #[error("Retry timeout after {0:?}")]
    RetryTimeout(Duration),

    /// Retry policy exhaustion
    #[error("{0}")]
    RetryTaskFailed(String),
}

impl Error {
    /// Transport level failures are worth retrying; rejected requests are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::RetryTimeout(_) | Error::Watch(_))
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

/// Which kind of store request produced an error, used to pick between
/// [`Error::Write`], [`Error::Read`], [`Error::Lease`] and [`Error::Watch`]
/// for rejected requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Write,
    Read,
    Lease,
    Watch,
}

impl Op {
    pub(crate) fn rejected(
        self,
        message: String,
    ) -> Error {
        match self {
            Op::Write => Error::Write(message),
            Op::Read => Error::Read(message),
            Op::Lease => Error::Lease(message),
            Op::Watch => Error::Watch(message),
        }
    }
}

/// Classify a gRPC status returned by the store
pub(crate) fn from_status(
    op: Op,
    status: &tonic::Status,
) -> Error {
    match status.code() {
        // Service unavailable, not ready, or deadline exceeded: transport level
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
            Error::StoreUnavailable(status.message().to_string())
        }
        _ => op.rejected(format!("{:?}: {}", status.code(), status.message())),
    }
}

/// Classify an etcd client error for the given request kind
pub(crate) fn from_etcd(
    op: Op,
    e: etcd_client::Error,
) -> Error {
    use etcd_client::Error as E;

    match e {
        E::TransportError(e) => Error::StoreUnavailable(e.to_string()),
        E::IoError(e) => Error::StoreUnavailable(e.to_string()),
        E::InvalidUri(e) => Error::InvalidConfig(e.to_string()),
        E::GRpcStatus(status) => from_status(op, &status),
        E::LeaseKeepAliveError(msg) => Error::Lease(msg),
        E::WatchError(msg) => Error::Watch(msg),
        E::InvalidArgs(msg) => Error::InvalidArgument(msg),
        other => op.rejected(other.to_string()),
    }
}
