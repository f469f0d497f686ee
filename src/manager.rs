//! Owns the fixed array of [`RequestProcessor`]s and fans topology changes out to all of them.
//!
//! Grounded directly on the original driver's `RequestProcessorManager`: an atomically-indexed
//! round-robin counter over a fixed array of worker threads, and `notify_*` methods that
//! broadcast a topology change to every thread's event queue. The original's `Protected`
//! friend-key idiom (gating `add_request_processor` to only the `Session` that owns the manager)
//! has no equivalent here — this crate builds its fixed processor array once at construction
//! time instead of growing it after the fact, so there is nothing left to protect.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use crate::{
    cmap::pool::Connector,
    error::{Error, Result},
    event::EventEmitter,
    host::Host,
    options::DriverOptions,
    processor::RequestProcessor,
    request::RequestFuture,
    topology::{Payload, TokenMap, TokenMapHandle},
};

/// Dispatches requests across a fixed set of [`RequestProcessor`] threads and fans topology
/// updates out to all of them.
pub struct ProcessorManager {
    processors: Vec<Arc<RequestProcessor>>,
    next: AtomicUsize,
    token_map: TokenMapHandle,
    closed: AtomicBool,
}

impl ProcessorManager {
    /// Spawns `options.num_threads` processors, each with its own copy of every host's pool.
    pub(crate) fn new(options: Arc<DriverOptions>, events: EventEmitter, connector: Connector) -> Self {
        let token_map = TokenMapHandle::new(TokenMap::default());

        let processors = (0..options.num_threads.max(1))
            .map(|index| {
                Arc::new(RequestProcessor::spawn(
                    index,
                    options.clone(),
                    token_map.clone(),
                    events.clone(),
                    connector.clone(),
                ))
            })
            .collect();

        Self {
            processors,
            next: AtomicUsize::new(0),
            token_map,
            closed: AtomicBool::new(false),
        }
    }

    /// Submits `request` to the next processor in round-robin order.
    ///
    /// Deliberately does not scan for a less-loaded processor on [`Error::QueueFull`]: the
    /// atomic counter is the only coordination point between submitting threads, and keeping it
    /// that way trades a theoretically better balance for a dispatch path that touches no shared
    /// state beyond a single fetch-add.
    pub fn submit(&self, request: RequestFuture) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.processors.len();
        self.processors[index].submit(request)
    }

    /// The shared, lock-free handle to the current token ring snapshot.
    pub fn token_map(&self) -> &TokenMapHandle {
        &self.token_map
    }

    /// Notifies every processor that `host` has joined and should have a pool created for it.
    pub fn notify_host_add(&self, host: Host) {
        for processor in &self.processors {
            processor.notify(Payload::AddPool { host: host.clone() });
        }
    }

    /// Notifies every processor that `host` has left and its pool should be torn down.
    ///
    /// The original driver's `IOWorker::remove_pool_q()` builds this same payload but never
    /// enqueues it, so a removed host's pool is never actually closed by any worker thread — a
    /// latent bug fixed here by always enqueueing, matching `add_pool_q()`'s behavior.
    pub fn notify_host_remove(&self, host: Host) {
        for processor in &self.processors {
            processor.notify(Payload::RemovePool { host: host.clone() });
        }
    }

    /// Notifies every processor that the default keyspace has changed.
    pub fn notify_keyspace(&self, keyspace: impl Into<Arc<str>>) {
        let keyspace = keyspace.into();
        for processor in &self.processors {
            processor.notify(Payload::KeyspaceUpdate {
                keyspace: keyspace.clone(),
            });
        }
    }

    /// Installs `new_map` as the current token ring snapshot and wakes every processor so the
    /// next routing decision on each sees it.
    pub fn notify_token_map(&self, new_map: TokenMap) {
        self.token_map.store(new_map);
        for processor in &self.processors {
            processor.notify(Payload::TokenMapUpdate);
        }
    }

    /// Stops every processor from accepting new requests. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for processor in &self.processors {
            processor.close();
        }
    }

    /// Drops every processor's intake queue handles, letting each run loop drain and exit.
    /// Idempotent; safe to call before or after [`ProcessorManager::close`].
    pub fn close_handles(&self) {
        for processor in &self.processors {
            processor.close_handles();
        }
    }

    /// Blocks until every processor thread has exited. Idempotent.
    pub fn join(&self) {
        for processor in &self.processors {
            processor.join();
        }
    }
}

impl Drop for ProcessorManager {
    fn drop(&mut self) {
        self.close();
        self.close_handles();
        self.join();
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;
    use crate::{cmap::pool::Connector, event::EventEmitter};

    /// A connector that always fails instantly, so pools never produce a live connection and
    /// every routed request resolves quickly with `NoHostAvailable` rather than hanging.
    fn refusing_connector() -> Connector {
        Arc::new(|address: SocketAddr| {
            Box::pin(async move {
                Err(Error::WriteFailed {
                    address,
                    message: "refused".into(),
                })
            }) as crate::BoxLocalFuture<Result<Box<dyn crate::cmap::conn::Transport>>>
        })
    }

    fn manager(num_threads: usize) -> ProcessorManager {
        let options = Arc::new(
            DriverOptions::builder()
                .contact_points(vec![])
                .num_threads(num_threads)
                .build(),
        );
        ProcessorManager::new(options, EventEmitter::default(), refusing_connector())
    }

    #[test]
    fn close_rejects_new_submissions_immediately() {
        let mgr = manager(1);
        mgr.close();

        let (request, _rx) = RequestFuture::new(
            crate::request::Statement {
                opcode: 0x01,
                body: Vec::new(),
                keyspace: None,
                routing_token: None,
                is_idempotent: true,
            },
            std::time::Duration::from_secs(1),
        );
        assert!(matches!(mgr.submit(request), Err(Error::Shutdown)));

        mgr.close_handles();
        mgr.join();
    }

    #[test]
    fn shutdown_sequence_is_idempotent() {
        let mgr = manager(2);
        mgr.close();
        mgr.close();
        mgr.close_handles();
        mgr.close_handles();
        mgr.join();
        mgr.join();
    }
}

