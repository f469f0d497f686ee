//! The request/response types that cross from a caller's thread onto a processor's thread.

use std::{net::SocketAddr, time::Duration};

use tokio::sync::oneshot;

use crate::error::Result;

/// An opaque statement to execute against the cluster.
///
/// The wire encoding of the statement body is a non-goal of this crate (spec Non-goal N-1): the
/// bytes in `body` are handed to [`Connection::send`](crate::cmap::conn::Connection::send)
/// unmodified, and callers are expected to have already serialized them according to whatever
/// protocol version the cluster negotiated.
#[derive(Debug, Clone)]
pub struct Statement {
    /// The opcode to send the statement under.
    pub opcode: u8,
    /// The pre-encoded statement body.
    pub body: Vec<u8>,
    /// The keyspace to route and execute against, if different from the connection default.
    pub keyspace: Option<String>,
    /// The token used to select replicas, if the statement carries a routing key.
    pub routing_token: Option<i64>,
    /// Whether retrying this statement against a different host is safe even when the retry
    /// policy cannot prove the original attempt did not apply.
    pub is_idempotent: bool,
}

/// A successful reply to a [`Statement`].
#[derive(Debug, Clone)]
pub struct Response {
    /// The opcode the server replied with.
    pub opcode: u8,
    /// The raw reply body.
    pub body: Vec<u8>,
}

/// A statement handed off to a [`RequestProcessor`](crate::processor::RequestProcessor) for
/// execution, paired with the channel its result is delivered on.
///
/// This is the one type that crosses the boundary from a caller's thread onto a processor's
/// thread, over that processor's bounded request-intake queue; everything else the processor
/// touches while executing the request (the query plan, retry bookkeeping, per-attempt deadline)
/// is built fresh on the processor's own thread in [`crate::router`].
pub struct RequestFuture {
    pub(crate) statement: Statement,
    pub(crate) deadline: Duration,
    pub(crate) reply: oneshot::Sender<Result<Response>>,
}

impl RequestFuture {
    /// Builds a new request and the receiver its caller should await.
    pub fn new(statement: Statement, deadline: Duration) -> (Self, oneshot::Receiver<Result<Response>>) {
        let (tx, rx) = oneshot::channel();
        (
            RequestFuture {
                statement,
                deadline,
                reply: tx,
            },
            rx,
        )
    }

}

/// Per-attempt bookkeeping the router keeps alongside a [`RequestFuture`] while it is in flight.
/// Not `Send`; lives entirely on the processor thread executing the request.
#[derive(Debug, Default)]
pub(crate) struct ExecutionState {
    pub(crate) attempts: u32,
    pub(crate) tried_hosts: Vec<SocketAddr>,
}

impl ExecutionState {
    pub(crate) fn record_attempt(&mut self, address: SocketAddr) {
        self.attempts += 1;
        self.tried_hosts.push(address);
    }
}
