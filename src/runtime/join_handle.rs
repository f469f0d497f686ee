use std::{
    future::Future,
    ops::DerefMut,
    pin::Pin,
    task::{Context, Poll},
};

/// A handle to a spawned task.
///
/// `Local` wraps a `tokio::task::JoinHandle` produced by `spawn_local`; it is the only variant
/// today, but kept as an enum (mirroring how the teacher crate models its own
/// `AsyncJoinHandle`) so a future non-`LocalSet` spawn path has somewhere to live without
/// changing callers.
#[derive(Debug)]
pub(crate) enum JoinHandle<T> {
    Local(tokio::task::JoinHandle<T>),
}

impl<T> Future for JoinHandle<T> {
    type Output = std::result::Result<T, tokio::task::JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.deref_mut() {
            Self::Local(handle) => Pin::new(handle).poll(cx),
        }
    }
}

impl<T> JoinHandle<T> {
    pub(crate) fn abort(&self) {
        match self {
            Self::Local(handle) => handle.abort(),
        }
    }
}
