//! Connection pooling: a single multiplexed [`Connection`](conn::Connection) to a host, and the
//! [`HostPool`](pool::HostPool) that manages a host's set of connections with reconnection.

pub(crate) mod conn;
pub(crate) mod pool;
pub(crate) mod stream_id;
