//! Configuration surface for the driver, built with [`typed_builder`].
//!
//! Field defaults mirror the original C++ driver's `Config` (contact points aside, which that
//! driver resolves via DNS and this crate takes as already-resolved addresses): one I/O thread,
//! 1024/256-deep intake queues, one core connection per host growing to two, and a 2-second base
//! reconnect wait.

use std::{net::SocketAddr, time::Duration};

use typed_builder::TypedBuilder;

use crate::policy::Policies;

/// Options controlling the driver's threading, pooling, and routing behavior.
///
/// ```rust
/// # use wcdriver::options::DriverOptions;
/// # use std::time::Duration;
/// let options = DriverOptions::builder()
///     .contact_points(vec!["127.0.0.1:9042".parse().unwrap()])
///     .num_threads(4usize)
///     .request_timeout(Duration::from_secs(5))
///     .build();
/// ```
#[derive(Clone, Debug, TypedBuilder)]
#[builder(doc)]
pub struct DriverOptions {
    /// The initial set of hosts used to discover the rest of the cluster's topology.
    pub contact_points: Vec<SocketAddr>,

    /// The number of [`RequestProcessor`](crate::processor::RequestProcessor) threads to run.
    /// Each owns an independent, disjoint copy of every host's connection pool.
    #[builder(default = 1usize)]
    pub num_threads: usize,

    /// The depth of each processor's bounded request-intake queue.
    #[builder(default = 1024usize)]
    pub queue_size_io: usize,

    /// The depth of each processor's bounded topology/event-intake queue.
    #[builder(default = 256usize)]
    pub queue_size_event: usize,

    /// The number of connections each host's pool maintains under normal conditions.
    #[builder(default = 1usize)]
    pub core_connections_per_host: usize,

    /// The maximum number of connections each host's pool may grow to.
    #[builder(default = 2usize)]
    pub max_connections_per_host: usize,

    /// The number of concurrent in-flight requests a single connection may multiplex.
    #[builder(default = 32768u16)]
    pub max_streams_per_connection: u16,

    /// The base delay before the first reconnect attempt after a connection is lost.
    #[builder(default = Duration::from_millis(2000))]
    pub reconnect_wait: Duration,

    /// The upper bound the exponential reconnect backoff is capped at.
    #[builder(default = Duration::from_secs(60))]
    pub reconnect_wait_max: Duration,

    /// How long a request may remain unanswered before it is failed with
    /// [`Error::Timeout`](crate::error::Error::Timeout).
    #[builder(default = Duration::from_secs(12))]
    pub request_timeout: Duration,

    /// How often each processor scans its connections for expired requests.
    #[builder(default = Duration::from_millis(200))]
    pub maintenance_interval: Duration,

    /// The keyspace new connections should switch to immediately after startup.
    #[builder(default, setter(strip_option))]
    pub default_keyspace: Option<String>,

    /// The load-balancing and retry policies consulted for every request.
    #[builder(default)]
    pub policies: Policies,
}
