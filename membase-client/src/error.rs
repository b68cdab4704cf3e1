//! Client error type.

use std::io;

use protocol_membase::{ParseError, Status};

/// Errors returned by the membase client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection was closed before a response was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server returned a non-zero status.
    #[error("server error ({}): {message}", .status.as_str())]
    Server { status: Status, message: String },

    /// The response opaque did not match the request in flight.
    #[error("response for a different request (opaque {got}, expected {expected})")]
    OpaqueMismatch { expected: u32, got: u32 },

    /// The response type did not match the expected type for the command.
    #[error("unexpected response")]
    UnexpectedResponse,

    /// Wire protocol parse error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    /// I/O error on the connection.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The vbucket map rejected the topology.
    #[error("vbucket map error: {0}")]
    Map(#[from] vbmap::MapError),

    /// The dispatch queue is at capacity; the operation was not enqueued.
    #[error("dispatch queue full")]
    QueueFull,

    /// The caller's wait for a result expired. The operation may still
    /// complete on the worker; its result is discarded.
    #[error("timed out waiting for dispatch result")]
    WaitTimeout,

    /// The dispatcher worker has exited.
    #[error("dispatcher is shut down")]
    DispatcherGone,

    /// "Not my vbucket" kept recurring after repeated topology refreshes.
    #[error("vbucket {vbucket} still not owned after {attempts} attempts")]
    RetriesExhausted { vbucket: u16, attempts: u32 },

    /// SASL authentication was rejected.
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl Error {
    /// The server status, when this error carries one.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for the topology-change status that drives re-dispatch
    /// instead of failure.
    pub fn is_not_my_vbucket(&self) -> bool {
        self.status() == Some(Status::NotMyVbucket)
    }

    pub(crate) fn from_fail(status: Status, message: &[u8]) -> Self {
        Error::Server {
            status,
            message: String::from_utf8_lossy(message).into_owned(),
        }
    }
}
