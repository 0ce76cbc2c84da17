//! Crate-wide error kinds.
//!
//! Election errors never escape the scheduler (see [`crate::scheduler`]);
//! this enum exists for the startup path and for the ingress forwarder,
//! which does surface [`Error::DownstreamFailure`] to callers verbatim.

use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("election backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("downstream remote-write endpoint returned {status}")]
    DownstreamFailure {
        status: http::StatusCode,
        body: Bytes,
    },

    #[error("shutting down")]
    Shutdown,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
