//! Observability: injectable event handlers plus, when the `tracing-unstable` feature is
//! enabled, structured `tracing` spans and events emitted alongside them.

use std::{net::SocketAddr, sync::Arc};

use crate::host::HostStatus;

/// A lifecycle event emitted by the driver's connection and topology management.
///
/// Deliberately coarse-grained: this crate does not replicate the teacher's full command-level
/// event taxonomy (a non-goal — query bodies are opaque to this driver), but still surfaces the
/// pool/connection/topology transitions an operator needs to build dashboards or alerts on.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum DriverEvent {
    /// A new connection to `address` finished startup negotiation and is ready for requests.
    ConnectionReady {
        /// The connection's peer address.
        address: SocketAddr,
    },
    /// A connection to `address` closed, gracefully or otherwise.
    ConnectionClosed {
        /// The connection's peer address.
        address: SocketAddr,
    },
    /// A host's health status changed.
    HostStatusChanged {
        /// The host whose status changed.
        address: SocketAddr,
        /// The status it transitioned to.
        status: HostStatus,
    },
    /// A processor's request-intake queue was full and a request was rejected.
    RequestIntakeFull {
        /// Which processor (by index) rejected the request.
        processor_index: usize,
    },
}

/// A destination for [`DriverEvent`]s.
///
/// Mirrors the teacher's `EventHandler<T>`: implicit [`From`] conversions for a `tokio` channel
/// sender, plus explicit constructors for plain and async callbacks, so a caller can plug in
/// whichever shape fits their application without this crate committing to one.
#[derive(Clone)]
#[non_exhaustive]
pub enum EventHandler {
    /// A synchronous callback, invoked inline on the processor thread that produced the event.
    Callback(Arc<dyn Fn(DriverEvent) + Send + Sync>),
    /// A `tokio` channel sender; events are sent with `try_send` so a slow consumer never blocks
    /// the processor loop. A full channel silently drops the event.
    TokioMpsc(tokio::sync::mpsc::Sender<DriverEvent>),
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EventHandler").finish()
    }
}

impl From<tokio::sync::mpsc::Sender<DriverEvent>> for EventHandler {
    fn from(value: tokio::sync::mpsc::Sender<DriverEvent>) -> Self {
        Self::TokioMpsc(value)
    }
}

impl EventHandler {
    /// Builds a handler from a plain callback.
    pub fn callback(f: impl Fn(DriverEvent) + Send + Sync + 'static) -> Self {
        Self::Callback(Arc::new(f))
    }

    pub(crate) fn handle(&self, event: DriverEvent) {
        match self {
            Self::Callback(cb) => (cb)(event),
            Self::TokioMpsc(sender) => {
                let _ = sender.try_send(event);
            }
        }
    }
}

#[cfg(feature = "tracing-unstable")]
fn trace_event(event: &DriverEvent) {
    match event {
        DriverEvent::ConnectionReady { address } => {
            tracing::debug!(target: "wcdriver::connection", %address, "connection ready");
        }
        DriverEvent::ConnectionClosed { address } => {
            tracing::debug!(target: "wcdriver::connection", %address, "connection closed");
        }
        DriverEvent::HostStatusChanged { address, status } => {
            tracing::info!(target: "wcdriver::topology", %address, ?status, "host status changed");
        }
        DriverEvent::RequestIntakeFull { processor_index } => {
            tracing::warn!(target: "wcdriver::processor", processor_index, "request intake queue full");
        }
    }
}

/// A no-op emitter used when no [`EventHandler`] is configured.
#[derive(Clone, Debug, Default)]
pub(crate) struct EventEmitter(Option<EventHandler>);

impl EventEmitter {
    pub(crate) fn new(handler: Option<EventHandler>) -> Self {
        Self(handler)
    }

    pub(crate) fn emit(&self, event: impl FnOnce() -> DriverEvent) {
        #[cfg(feature = "tracing-unstable")]
        {
            let event = event();
            trace_event(&event);
            if let Some(handler) = &self.0 {
                handler.handle(event);
            }
        }
        #[cfg(not(feature = "tracing-unstable"))]
        {
            if let Some(handler) = &self.0 {
                handler.handle(event());
            }
        }
    }
}
