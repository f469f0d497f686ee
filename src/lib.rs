#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]

mod cmap;
pub mod error;
pub mod event;
pub mod host;
mod manager;
pub mod options;
pub mod policy;
mod processor;
pub mod request;
mod router;
pub(crate) mod runtime;
pub mod topology;

use std::{future::Future, net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use tokio::net::TcpStream;

pub use crate::{
    error::{Error, Result},
    manager::ProcessorManager,
    options::DriverOptions,
};
use crate::{
    cmap::conn::Transport,
    event::{EventEmitter, EventHandler},
    host::Host,
    request::{RequestFuture, Response, Statement},
    topology::TokenMap,
};

/// A boxed future that is not required to be `Send`.
///
/// Used for the connector this crate hands to each `RequestProcessor`: the future it returns is
/// driven entirely on that processor's own single-threaded `LocalSet`, so it never needs to cross
/// a thread boundary once it is running — only the factory producing it does.
pub(crate) type BoxLocalFuture<T> = Pin<Box<dyn Future<Output = T>>>;

/// A handle to a running driver: the fixed pool of I/O processor threads plus whatever hooks the
/// embedding application uses to keep topology current.
///
/// This is the crate's embedding surface (spec §6); everything else — parsing a control
/// connection's gossip stream, authentication handshakes, TLS negotiation — is left to the
/// caller, which is expected to call [`Driver::notify_host_add`] and friends as it learns about
/// the cluster.
pub struct Driver {
    manager: Arc<ProcessorManager>,
}

impl Driver {
    /// Starts the driver's fixed pool of [`RequestProcessor`](crate::processor::RequestProcessor)
    /// threads. No network I/O happens until the caller seeds the topology with
    /// [`Driver::notify_host_add`] for each contact point.
    pub fn connect(options: DriverOptions) -> Self {
        Self::connect_with_events(options, None)
    }

    /// Like [`Driver::connect`], additionally routing lifecycle events to `events`.
    pub fn connect_with_events(options: DriverOptions, events: Option<EventHandler>) -> Self {
        let options = Arc::new(options);
        let emitter = EventEmitter::new(events);
        let connector: crate::cmap::pool::Connector = Arc::new(|address: SocketAddr| {
            Box::pin(async move {
                TcpStream::connect(address)
                    .await
                    .map(|stream| Box::new(stream) as Box<dyn Transport>)
                    .map_err(|err| Error::WriteFailed {
                        address,
                        message: err.to_string(),
                    })
            }) as BoxLocalFuture<Result<Box<dyn Transport>>>
        });

        let manager = Arc::new(ProcessorManager::new(options, emitter, connector));
        Self { manager }
    }

    /// Submits `statement` for execution and returns its result once a processor has run it to
    /// completion (or exhausted its retries).
    pub async fn execute(&self, statement: Statement) -> Result<Response> {
        self.execute_with_timeout(statement, Duration::from_secs(12)).await
    }

    /// Like [`Driver::execute`], with an explicit overall deadline for this one statement.
    pub async fn execute_with_timeout(
        &self,
        statement: Statement,
        deadline: Duration,
    ) -> Result<Response> {
        let (request, rx) = RequestFuture::new(statement, deadline);
        self.manager.submit(request)?;
        rx.await.unwrap_or(Err(Error::Shutdown))
    }

    /// Notifies every processor that `host` has joined the cluster.
    pub fn notify_host_add(&self, host: Host) {
        self.manager.notify_host_add(host);
    }

    /// Notifies every processor that `host` has left the cluster.
    pub fn notify_host_remove(&self, host: Host) {
        self.manager.notify_host_remove(host);
    }

    /// Notifies every processor of a new default keyspace.
    pub fn notify_keyspace(&self, keyspace: impl Into<String>) {
        self.manager.notify_keyspace(Arc::<str>::from(keyspace.into()));
    }

    /// Installs a new token ring snapshot, visible to the next routing decision on every
    /// processor.
    pub fn notify_token_map(&self, token_map: TokenMap) {
        self.manager.notify_token_map(token_map);
    }

    /// Stops accepting new work, waits for every in-flight request to finish, and joins every
    /// processor thread. Idempotent; safe to call more than once or let `Drop` do it.
    pub fn close(&self) {
        self.manager.close();
        self.manager.close_handles();
        self.manager.join();
    }
}
