//! A single I/O processor: one dedicated OS thread running a current-thread `tokio` runtime,
//! owning a disjoint copy of every host's connection pool.
//!
//! Grounded on the original driver's `IOWorker`: a `uv_loop_t` pinned to its own `uv_thread_t`,
//! fed by two single-producer queues (`request_future_queue_`, `event_queue_`). Here the two
//! queues are bounded `tokio::mpsc` channels instead of lock-free SPSC rings, and the owned state
//! is `Rc<RefCell<_>>` rather than requiring no synchronization primitive at all, but the shape —
//! one thread, two intake queues, no cross-thread locking once inside it — is the same.

use std::{
    cell::RefCell,
    collections::HashMap,
    net::SocketAddr,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
};

use tokio::sync::mpsc;

use crate::{
    cmap::pool::{Connector, HostPool},
    error::{Error, Result},
    event::{DriverEvent, EventEmitter},
    host::HostStatus,
    options::DriverOptions,
    request::RequestFuture,
    router::Router,
    runtime,
    topology::{Payload, TokenMapHandle},
};

/// One I/O processor thread plus the handles needed to feed and shut it down.
///
/// Held behind `Arc` by the [`ProcessorManager`](crate::manager::ProcessorManager); the intake
/// senders are further wrapped so `close_handles` can drop them without needing `&mut self`,
/// mirroring the original's separate `close()` (stop accepting new work) and `close_handles()`
/// (release the queue handles so the loop's `recv` finally returns `None`) steps.
pub(crate) struct RequestProcessor {
    index: usize,
    request_tx: Mutex<Option<mpsc::Sender<RequestFuture>>>,
    event_tx: Mutex<Option<mpsc::Sender<Payload>>>,
    draining: Arc<AtomicBool>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    events: EventEmitter,
}

impl RequestProcessor {
    pub(crate) fn spawn(
        index: usize,
        options: Arc<DriverOptions>,
        token_map: TokenMapHandle,
        events: EventEmitter,
        connector: Connector,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::channel(options.queue_size_io);
        let (event_tx, event_rx) = mpsc::channel(options.queue_size_event);
        let draining = Arc::new(AtomicBool::new(false));

        let loop_events = events.clone();
        let thread = thread::Builder::new()
            .name(format!("wcdriver-io-{index}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build processor runtime");
                let local = tokio::task::LocalSet::new();
                local.block_on(
                    &runtime,
                    run_loop(options, token_map, loop_events, connector, request_rx, event_rx),
                );
            })
            .expect("failed to spawn processor thread");

        Self {
            index,
            request_tx: Mutex::new(Some(request_tx)),
            event_tx: Mutex::new(Some(event_tx)),
            draining,
            thread: Mutex::new(Some(thread)),
            events,
        }
    }

    /// Hands a request off to this processor's intake queue. Fails with [`Error::QueueFull`] if
    /// the queue is at capacity, or [`Error::Shutdown`] if the processor has begun closing —
    /// never blocks, matching the "never scan past a full queue" design note.
    pub(crate) fn submit(&self, request: RequestFuture) -> Result<()> {
        if self.draining.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let guard = self.request_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.try_send(request).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    let index = self.index;
                    self.events
                        .emit(|| DriverEvent::RequestIntakeFull { processor_index: index });
                    Error::QueueFull
                }
                mpsc::error::TrySendError::Closed(_) => Error::Shutdown,
            }),
            None => Err(Error::Shutdown),
        }
    }

    /// Fans a topology/keyspace event out to this processor. Best-effort: if the event queue is
    /// full, the event is dropped, since every event here is either idempotent
    /// (`TokenMapUpdate`) or will be re-sent on the next full topology refresh.
    pub(crate) fn notify(&self, payload: Payload) {
        if let Some(tx) = self.event_tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(payload);
        }
    }

    /// Stops accepting new requests. In-flight requests continue to completion.
    pub(crate) fn close(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Drops this processor's intake sender handles, allowing its run loop to observe both
    /// queues closed and exit once any in-flight work finishes draining.
    pub(crate) fn close_handles(&self) {
        self.request_tx.lock().unwrap().take();
        self.event_tx.lock().unwrap().take();
    }

    /// Blocks until the processor's thread has exited. Idempotent: a second call is a no-op.
    pub(crate) fn join(&self) {
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

async fn run_loop(
    options: Arc<DriverOptions>,
    token_map: TokenMapHandle,
    events: EventEmitter,
    connector: Connector,
    mut request_rx: mpsc::Receiver<RequestFuture>,
    mut event_rx: mpsc::Receiver<Payload>,
) {
    let pools: Rc<RefCell<HashMap<SocketAddr, HostPool>>> = Rc::new(RefCell::new(HashMap::new()));
    let router = Rc::new(Router::new(
        options.policies.clone(),
        token_map,
        options.request_timeout,
    ));
    let mut maintenance = runtime::Interval::new(options.maintenance_interval);

    loop {
        tokio::select! {
            biased;

            _ = maintenance.tick() => {
                for pool in pools.borrow().values() {
                    pool.on_maintenance_tick();
                }
            }

            payload = event_rx.recv() => {
                match payload {
                    Some(payload) => handle_payload(&pools, &options, &connector, &events, payload),
                    None => break,
                }
            }

            request = request_rx.recv() => {
                match request {
                    Some(request) => {
                        let router = router.clone();
                        let pools = pools.clone();
                        runtime::spawn_local(async move {
                            router.execute(pools, request).await;
                        });
                    }
                    None => break,
                }
            }
        }
    }

    for (_, pool) in pools.borrow_mut().drain() {
        pool.close();
    }
}

fn handle_payload(
    pools: &Rc<RefCell<HashMap<SocketAddr, HostPool>>>,
    options: &DriverOptions,
    connector: &Connector,
    events: &EventEmitter,
    payload: Payload,
) {
    match payload {
        Payload::AddPool { host } => {
            let address = host.address();
            events.emit(|| DriverEvent::HostStatusChanged {
                address,
                status: host.status(),
            });
            let pool = HostPool::new(
                host,
                connector.clone(),
                options.core_connections_per_host,
                options.max_connections_per_host,
                options.max_streams_per_connection,
                options.reconnect_wait,
                options.reconnect_wait_max,
                events.clone(),
            );
            pools.borrow_mut().insert(address, pool);
        }
        Payload::RemovePool { host } => {
            let address = host.address();
            if let Some(pool) = pools.borrow_mut().remove(&address) {
                pool.close();
            }
            events.emit(|| DriverEvent::HostStatusChanged {
                address,
                status: HostStatus::Removed,
            });
        }
        // The token map behind `TokenMapHandle` is already updated by the time either event
        // arrives; both exist only to wake a processor blocked on its event queue so routing
        // decisions made after this point see the new snapshot.
        Payload::KeyspaceUpdate { .. } | Payload::TokenMapUpdate => {}
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::{
        event::EventEmitter,
        host::Host,
        options::DriverOptions,
        request::{RequestFuture, Statement},
        topology::TokenMap,
    };

    fn echo_connector() -> Connector {
        Arc::new(|_address: SocketAddr| {
            Box::pin(async move {
                let (client, mut server) = tokio::io::duplex(4096);
                tokio::task::spawn_local(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut header = [0u8; 7];
                    loop {
                        if server.read_exact(&mut header).await.is_err() {
                            return;
                        }
                        let length = u32::from_be_bytes([header[3], header[4], header[5], header[6]]);
                        let mut body = vec![0u8; length as usize];
                        if server.read_exact(&mut body).await.is_err() {
                            return;
                        }
                        if server.write_all(&header).await.is_err() || server.write_all(&body).await.is_err() {
                            return;
                        }
                    }
                });
                Ok(Box::new(client) as Box<dyn crate::cmap::conn::Transport>)
            }) as crate::BoxLocalFuture<Result<Box<dyn crate::cmap::conn::Transport>>>
        })
    }

    #[test]
    fn happy_path_request_completes() {
        let options = Arc::new(
            DriverOptions::builder()
                .contact_points(vec!["127.0.0.1:9042".parse().unwrap()])
                .build(),
        );
        let token_map = TokenMapHandle::new(TokenMap::default());
        let processor = RequestProcessor::spawn(
            0,
            options,
            token_map,
            EventEmitter::default(),
            echo_connector(),
        );

        let host = Host::new("127.0.0.1:9042".parse().unwrap(), "dc1", "rack1", vec![]);
        processor.notify(Payload::AddPool { host });

        // Give the processor a moment to construct the pool and its core connection before the
        // request arrives, since pool construction happens asynchronously on its own loop tick.
        std::thread::sleep(Duration::from_millis(50));

        let (request, rx) = RequestFuture::new(
            Statement {
                opcode: 0x01,
                body: b"ping".to_vec(),
                keyspace: None,
                routing_token: None,
                is_idempotent: true,
            },
            Duration::from_secs(2),
        );
        processor.submit(request).unwrap();

        let response = std::thread::spawn(move || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
                .block_on(rx)
        })
        .join()
        .unwrap()
        .unwrap()
        .unwrap();

        assert_eq!(response.body, b"ping");

        processor.close();
        processor.close_handles();
        processor.join();
    }
}
