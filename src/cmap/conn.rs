//! A single multiplexed connection to one host.

use std::{
    cell::RefCell,
    collections::HashMap,
    io,
    net::SocketAddr,
    rc::Rc,
    time::Instant,
};

use bytes::{Buf, BufMut, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{oneshot, Mutex as AsyncMutex},
};

use crate::{
    cmap::stream_id::{StreamId, StreamIdAllocator},
    error::{Error, Result},
    runtime,
};

/// The transport a [`Connection`] is built on.
///
/// Kept as a trait object rather than a concrete `TcpStream` so tests can substitute an
/// in-memory duplex stream; this crate does not implement TLS itself (a non-goal), but a caller
/// may hand in any type satisfying this bound, including a TLS-wrapped stream.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

/// A single in-flight request's frame, as read off the wire.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub(crate) opcode: u8,
    pub(crate) body: Vec<u8>,
}

/// The minimal per-frame wire header this driver speaks: a stream id, an opcode, and a body
/// length. Full protocol framing (compression negotiation, flag bits, etc.) is out of scope;
/// callers are expected to have already negotiated those out of band.
struct Header {
    stream_id: u16,
    opcode: u8,
    length: u32,
}

const HEADER_LEN: usize = 7;

impl Header {
    fn encode(&self, out: &mut BytesMut) {
        out.put_u16(self.stream_id);
        out.put_u8(self.opcode);
        out.put_u32(self.length);
    }

    fn decode(buf: &[u8]) -> Self {
        let mut buf = buf;
        Header {
            stream_id: buf.get_u16(),
            opcode: buf.get_u8(),
            length: buf.get_u32(),
        }
    }
}

/// The lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    /// The TCP handshake has completed but startup negotiation has not.
    Connecting,
    /// The connection is ready to accept new requests.
    Ready,
    /// The connection is draining in-flight requests before closing.
    Closing,
    /// The connection is closed; every pending request has been failed.
    Closed,
}

struct Pending {
    stream_id: StreamId,
    reply: oneshot::Sender<Result<Frame>>,
    deadline: Instant,
}

struct Shared {
    state: ConnectionState,
    stream_ids: StreamIdAllocator,
    pending: HashMap<u16, Pending>,
}

impl Shared {
    fn fail_one(&mut self, stream_id_value: u16, err: &Error) {
        if let Some(pending) = self.pending.remove(&stream_id_value) {
            self.stream_ids.release(pending.stream_id);
            let _ = pending.reply.send(Err(err.clone()));
        }
    }

    fn fail_all(&mut self, err: &Error) {
        self.state = ConnectionState::Closed;
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(err.clone()));
        }
    }
}

/// One multiplexed TCP connection to a single host.
///
/// Owned exclusively by the [`RequestProcessor`](crate::processor::RequestProcessor) thread that
/// created it; all internal state is `Rc<RefCell<_>>` rather than behind a lock, since nothing
/// outside that one thread ever touches it (spec invariant I-OWN). A background read loop, spawned
/// with [`runtime::spawn_local`], shares the same `Rc` and demultiplexes replies to the waiter
/// registered for their stream id.
///
/// The write half lives behind its own `Rc<AsyncMutex<_>>`, separate from `shared`: a write is
/// held across an `.await` on the socket, and two requests on the same connection routinely write
/// concurrently (that is the entire point of multiplexing), so an `std::cell::RefCell` guard can't
/// be the thing spanning that await without panicking the moment a second writer shows up while
/// the first is still suspended mid-write. The async mutex queues the second writer instead.
pub(crate) struct Connection {
    address: SocketAddr,
    shared: Rc<RefCell<Shared>>,
    write_half: Rc<AsyncMutex<Box<dyn AsyncWrite + Unpin>>>,
    read_loop: runtime::JoinHandle<()>,
}

impl Connection {
    /// Wraps `transport` as a new, freshly-negotiated connection with `max_streams` concurrent
    /// stream ids available.
    pub(crate) fn new(address: SocketAddr, transport: Box<dyn Transport>, max_streams: u16) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);

        let shared = Rc::new(RefCell::new(Shared {
            state: ConnectionState::Connecting,
            stream_ids: StreamIdAllocator::new(max_streams),
            pending: HashMap::new(),
        }));
        let write_half: Rc<AsyncMutex<Box<dyn AsyncWrite + Unpin>>> =
            Rc::new(AsyncMutex::new(Box::new(write_half)));

        let read_loop = runtime::spawn_local(Self::read_loop(address, shared.clone(), read_half));

        Self {
            address,
            shared,
            write_half,
            read_loop,
        }
    }

    /// The host this connection talks to.
    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    /// Marks startup negotiation complete; the connection now accepts requests.
    pub(crate) fn mark_ready(&self) {
        self.shared.borrow_mut().state = ConnectionState::Ready;
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.shared.borrow().state
    }

    /// The number of requests currently awaiting a reply.
    pub(crate) fn in_flight(&self) -> usize {
        self.shared.borrow().stream_ids.in_use_count()
    }

    /// Returns `true` if every stream id is currently allocated — [`HostPool::acquire`]
    /// (crate::cmap::pool::HostPool::acquire) excludes a saturated connection from selection so
    /// the router advances to the next host instead of hitting [`Error::Busy`].
    pub(crate) fn is_saturated(&self) -> bool {
        self.shared.borrow().stream_ids.is_exhausted()
    }

    /// Sends `body` under opcode `opcode`, failing the pending entry with [`Error::Timeout`] if
    /// no reply has arrived by `deadline`, and returns a future resolving to the matching reply.
    ///
    /// Fails immediately with [`Error::Busy`] if every stream id is currently allocated, distinct
    /// from [`Error::ConnectionClosed`] so the retry policy never burns the request's retry budget
    /// on mere saturation — [`HostPool::acquire`](crate::cmap::pool::HostPool::acquire) already
    /// filters saturated connections out before this is reached, so this is a defensive fallback
    /// against a connection saturating between acquisition and send.
    pub(crate) async fn send(&self, opcode: u8, body: &[u8], deadline: Instant) -> Result<Frame> {
        let (stream_id, rx) = {
            let mut shared = self.shared.borrow_mut();
            if shared.state != ConnectionState::Ready {
                return Err(Error::connection_closed(self.address));
            }
            let stream_id = shared
                .stream_ids
                .allocate()
                .ok_or(Error::Busy { address: self.address })?;
            let (tx, rx) = oneshot::channel();
            shared.pending.insert(
                stream_id.value,
                Pending {
                    stream_id,
                    reply: tx,
                    deadline,
                },
            );
            (stream_id, rx)
        };

        if let Err(err) = self.write_frame(stream_id, opcode, body).await {
            self.shared.borrow_mut().fail_one(stream_id.value, &err);
            return Err(err);
        }

        rx.await
            .unwrap_or_else(|_| Err(Error::connection_closed(self.address)))
    }

    async fn write_frame(&self, stream_id: StreamId, opcode: u8, body: &[u8]) -> Result<()> {
        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        Header {
            stream_id: stream_id.value,
            opcode,
            length: body.len() as u32,
        }
        .encode(&mut out);
        out.extend_from_slice(body);

        let mut write_half = self.write_half.lock().await;
        write_half
            .write_all(&out)
            .await
            .map_err(|err| Error::WriteFailed {
                address: self.address,
                message: err.to_string(),
            })
    }

    /// Scans pending requests for ones whose own deadline has passed and fails them in place,
    /// freeing their stream ids. Driven by the processor's periodic maintenance tick rather than
    /// a timer per request, matching the driver's coarse periodic deadline-scan design — exact
    /// timing is not required, but no entry outlives its deadline by more than one tick.
    pub(crate) fn expire_pending(&self) {
        let now = Instant::now();
        let mut shared = self.shared.borrow_mut();
        let expired: Vec<u16> = shared
            .pending
            .iter()
            .filter(|(_, pending)| now >= pending.deadline)
            .map(|(id, _)| *id)
            .collect();
        for stream_id_value in expired {
            shared.fail_one(stream_id_value, &Error::Timeout);
        }
    }

    /// Begins shutdown: the background read loop is stopped and every in-flight request fails
    /// immediately. In-flight requests are not drained gracefully here; the caller
    /// ([`HostPool`](crate::cmap::pool::HostPool)) decides whether to wait for them to finish
    /// naturally before calling this.
    pub(crate) fn close(&self) {
        self.read_loop.abort();
        self.shared
            .borrow_mut()
            .fail_all(&Error::connection_closed(self.address));
    }

    async fn read_loop(
        address: SocketAddr,
        shared: Rc<RefCell<Shared>>,
        mut read_half: impl AsyncRead + Unpin,
    ) {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        loop {
            match Self::read_one_frame(address, &mut read_half, &mut buf).await {
                Ok(Some((header, body))) => {
                    let mut shared_ref = shared.borrow_mut();
                    if let Some(pending) = shared_ref.pending.remove(&header.stream_id) {
                        shared_ref.stream_ids.release(pending.stream_id);
                        drop(shared_ref);
                        let _ = pending.reply.send(Ok(Frame {
                            opcode: header.opcode,
                            body,
                        }));
                    }
                    // An unsolicited or already-timed-out stream id is dropped silently; the
                    // original waiter, if any, has already been failed by `expire_pending`.
                }
                Ok(None) => {
                    shared
                        .borrow_mut()
                        .fail_all(&Error::connection_closed(address));
                    return;
                }
                Err(err) => {
                    shared.borrow_mut().fail_all(&err);
                    return;
                }
            }
        }
    }

    async fn read_one_frame(
        address: SocketAddr,
        read_half: &mut (impl AsyncRead + Unpin),
        buf: &mut BytesMut,
    ) -> Result<Option<(Header, Vec<u8>)>> {
        buf.clear();
        buf.resize(HEADER_LEN, 0);
        if let Err(err) = read_half.read_exact(buf).await {
            return if err.kind() == io::ErrorKind::UnexpectedEof {
                Ok(None)
            } else {
                Err(Error::WriteFailed {
                    address,
                    message: err.to_string(),
                })
            };
        }
        let header = Header::decode(buf);
        let mut body = vec![0u8; header.length as usize];
        read_half
            .read_exact(&mut body)
            .await
            .map_err(|err| Error::FrameMalformed {
                address,
                message: err.to_string(),
            })?;
        Ok(Some((header, body)))
    }
}
