//! Contains the `Error` and `Result` types used throughout this crate.

use std::net::SocketAddr;

use thiserror::Error;

/// The result type returned by all fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error produced by the request-execution engine.
///
/// `Clone`, so a single underlying failure (e.g. a connection closing) can be handed to every
/// pending request it affects without each needing its own copy of the originating I/O error.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // -- Transport errors --
    /// The connection carrying the request was closed (gracefully or otherwise) before a
    /// response arrived.
    #[error("connection to {address} closed")]
    ConnectionClosed {
        /// The address of the connection that closed.
        address: SocketAddr,
    },

    /// Writing the request frame to the socket failed.
    #[error("failed to write request to {address}: {message}")]
    WriteFailed {
        /// The address of the connection the write was attempted on.
        address: SocketAddr,
        /// A description of the underlying I/O failure.
        message: String,
    },

    /// The request's deadline elapsed before a response was received.
    #[error("request timed out")]
    Timeout,

    /// The connection has no free stream id; the caller should try another connection rather
    /// than count this against the request's retry budget.
    #[error("connection to {address} has no free stream id")]
    Busy {
        /// The address of the saturated connection.
        address: SocketAddr,
    },

    // -- Protocol errors --
    /// A frame could not be parsed according to the wire protocol.
    #[error("malformed frame from {address}: {message}")]
    FrameMalformed {
        /// The address the malformed frame was read from.
        address: SocketAddr,
        /// A description of the parse failure.
        message: String,
    },

    /// A response frame referenced a stream id with no pending request.
    #[error("unsolicited or stale stream id {stream_id} from {address}")]
    UnknownStreamId {
        /// The address the frame was read from.
        address: SocketAddr,
        /// The offending stream id.
        stream_id: u16,
    },

    /// The server reported a protocol-level failure.
    #[error("server error: {message}")]
    ServerError {
        /// The message the server attached to the error.
        message: String,
    },

    // -- Routing errors --
    /// Every host in the query plan was exhausted without producing a usable connection.
    #[error("no host was available to serve this request")]
    NoHostAvailable,

    /// The target processor's request intake was at capacity.
    #[error("request intake queue is full")]
    QueueFull,

    /// The processor (or the whole manager) has begun or completed shutdown.
    #[error("driver is shutting down")]
    Shutdown,

    // -- Server-side errors, passed through --
    /// Not enough replicas were alive to satisfy the requested consistency level.
    #[error("unavailable: {message}")]
    Unavailable {
        /// Server-supplied detail.
        message: String,
    },

    /// The coordinator timed out waiting for replicas to acknowledge a write.
    #[error("write timeout: {message}")]
    WriteTimeout {
        /// Server-supplied detail.
        message: String,
        /// The kind of write that timed out, used by the retry policy to judge idempotence.
        write_type: WriteType,
    },

    /// The coordinator timed out waiting for replicas to respond to a read.
    #[error("read timeout: {message}")]
    ReadTimeout {
        /// Server-supplied detail.
        message: String,
    },

    /// The coordinator rejected the request because it is overloaded.
    #[error("overloaded: {message}")]
    Overloaded {
        /// Server-supplied detail.
        message: String,
    },

    /// The statement was not prepared on the connection that received it.
    #[error("statement not prepared on {address}")]
    Unprepared {
        /// The connection missing the prepared statement.
        address: SocketAddr,
        /// The opaque id identifying the statement to re-prepare.
        id: Vec<u8>,
    },

    // -- Lifecycle errors --
    /// A configuration option was out of its valid range.
    #[error("invalid option: {message}")]
    InvalidOption {
        /// A description of the invalid option.
        message: String,
    },

    /// An operation was attempted on a handle that was already closed.
    #[error("handle already closed")]
    AlreadyClosed,

    /// An invariant internal to the driver was violated; this always indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// A description of the violated invariant.
        message: String,
    },
}

/// Distinguishes write failures the retry policy may consider provably idempotent-safe from
/// those it must not retry blindly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteType {
    /// A simple write to one or more partitions.
    Simple,
    /// A write to the distributed batch log prior to replaying a logged batch; safe to retry
    /// even for non-idempotent statements because the coordinator has not yet applied it.
    BatchLog,
    /// A write as part of a logged batch.
    Batch,
    /// A write performed as part of an unlogged batch.
    UnloggedBatch,
    /// A counter write; never safe to retry blindly.
    Counter,
}

impl Error {
    pub(crate) fn connection_closed(address: SocketAddr) -> Self {
        Error::ConnectionClosed { address }
    }

    /// Returns `true` if this error occurred before the coordinator could have accepted the
    /// write, making it safe for the retry policy to consider retrying even a non-idempotent
    /// statement.
    pub fn is_safe_to_retry_non_idempotent(&self) -> bool {
        matches!(
            self,
            Error::WriteTimeout {
                write_type: WriteType::BatchLog,
                ..
            } | Error::ConnectionClosed { .. }
                | Error::WriteFailed { .. }
        )
    }

    /// Returns `true` if this error is a transport-level failure (as opposed to a protocol or
    /// server-side error).
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed { .. } | Error::WriteFailed { .. } | Error::Timeout | Error::Busy { .. }
        )
    }
}
