//! A thin abstraction over the async runtime used by the request-execution engine.
//!
//! The engine is built directly on `tokio`, but funnels task spawning and time handling through
//! this module so that every other module talks to one narrow surface instead of `tokio`
//! directly. That keeps the choice of runtime, and any future need to swap timer behavior in
//! tests, contained to one place.

mod interval;
mod join_handle;

use std::{future::Future, time::Duration};

pub(crate) use interval::Interval;
pub(crate) use join_handle::JoinHandle;

/// Spawns `future` onto the current thread's `tokio` executor.
///
/// Used for work that must not outlive the thread it was spawned from (e.g. a connection's
/// read loop, which shares `Rc`-based state with the `RequestProcessor` that owns it).
pub(crate) fn spawn_local<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
{
    JoinHandle::Local(tokio::task::spawn_local(future))
}

/// Sleeps for `duration`, yielding control back to the executor.
pub(crate) async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await
}

/// Runs `future` to completion or until `duration` elapses, whichever comes first.
pub(crate) async fn timeout<F: Future>(duration: Duration, future: F) -> Option<F::Output> {
    tokio::time::timeout(duration, future).await.ok()
}
