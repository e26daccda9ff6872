//! Error types for transport operations.

use std::io;
use std::time::Duration;

use crate::wire::WireError;

/// Errors surfaced by transport operations.
///
/// Service-level failures are not transport errors: a remote handler that
/// throws is reported inside the [`ResponseMessage`](crate::ResponseMessage)
/// as an [`ErrorDescriptor`](crate::ErrorDescriptor).
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Destination URI scheme is neither `https` nor `poll`.
    #[error("unknown destination scheme: {scheme}")]
    UnknownScheme {
        /// The scheme that was not recognised.
        scheme: String,
    },

    /// A destination or subscription URI could not be used.
    #[error("invalid endpoint: {message}")]
    InvalidEndpoint {
        /// Details about the rejected URI or thumbprint.
        message: String,
    },

    /// The dialled server presented a leaf certificate whose thumbprint does
    /// not match the pinned one. Fatal to the call, never retried.
    #[error("unknown server thumbprint {presented} (pinned {pinned})")]
    UnknownServerThumbprint {
        /// The thumbprint the caller pinned.
        pinned: String,
        /// The thumbprint the server actually presented.
        presented: String,
    },

    /// An accepted client's thumbprint is not in the trust set.
    #[error("untrusted client thumbprint {thumbprint}")]
    UntrustedClient {
        /// The rejected thumbprint.
        thumbprint: String,
    },

    /// Unexpected token, malformed preamble, bad length, or decode failure.
    /// The stream carrying the violation is destroyed, never pooled.
    #[error("protocol violation: {message}")]
    ProtocolViolation {
        /// What was observed on the wire.
        message: String,
    },

    /// An I/O deadline elapsed while a request was in flight. The stream is
    /// destroyed.
    #[error("transport timeout after {after:?}")]
    TransportTimeout {
        /// The deadline that was exceeded.
        after: Duration,
    },

    /// A request sat in a pending-request queue beyond its deadline without
    /// any poller claiming it.
    #[error("no poller claimed request {request_id} before its deadline")]
    PollingTimeout {
        /// Id of the request that timed out.
        request_id: String,
    },

    /// The runtime was disposed while the operation was outstanding.
    #[error("runtime is shut down")]
    Shutdown,

    /// Envelope encode or decode failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Underlying socket or TLS failure.
    #[error("i/o error: {message}")]
    Io {
        /// Description of the underlying failure.
        message: String,
    },
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io {
            message: err.to_string(),
        }
    }
}

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
