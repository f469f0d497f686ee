//! Pluggable host-selection and retry policies.
//!
//! Both traits are object-safe and `Send + Sync` so a single `Arc<dyn _>` can be shared across
//! every [`RequestProcessor`](crate::processor::RequestProcessor) without per-processor copies;
//! neither trait has an async method, since a policy only ever inspects state already resident
//! on the processor's thread (its [`TokenMapHandle`](crate::topology::TokenMapHandle) and the
//! hosts passed to it) and never performs I/O itself.

use std::sync::Arc;

use crate::{
    error::{Error, WriteType},
    host::{Host, HostStatus},
    topology::TokenMapHandle,
};

/// Chooses the order in which hosts are tried for a single request.
pub trait LoadBalancingPolicy: Send + Sync + std::fmt::Debug {
    /// Returns the hosts to try, in order, for a request against `keyspace` with an optional
    /// routing token. Implementations should return replicas first (when a routing token is
    /// available) followed by the remaining hosts, so a caller that exhausts the plan has tried
    /// every live host exactly once.
    fn query_plan(
        &self,
        keyspace: &str,
        routing_token: Option<i64>,
        token_map: &TokenMapHandle,
    ) -> Vec<Host>;
}

/// Prefers token-owning replicas, falling back to every other known host.
///
/// Grounded on the driver's token-aware routing requirement (spec §3); unlike a datacenter-aware
/// variant this makes no locality distinction, matching the Non-goal that scopes multi-DC
/// policies out. Hosts the control connection has marked `Down` are excluded from new routing
/// decisions per spec §3's `HostStatus` contract, though their pools may still be reconnecting in
/// the background.
#[derive(Debug, Default)]
pub struct TokenAwarePolicy;

impl LoadBalancingPolicy for TokenAwarePolicy {
    fn query_plan(
        &self,
        keyspace: &str,
        routing_token: Option<i64>,
        token_map: &TokenMapHandle,
    ) -> Vec<Host> {
        let snapshot = token_map.load();

        let mut plan = match routing_token {
            Some(token) => snapshot.replicas(keyspace, token),
            None => Vec::new(),
        };
        plan.retain(|host| host.status() == HostStatus::Up);

        for host in snapshot.hosts() {
            if host.status() == HostStatus::Up && !plan.iter().any(|h| h == host) {
                plan.push(host.clone());
            }
        }
        plan
    }
}

/// The outcome a [`RetryPolicy`] chooses after a request attempt fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry against the same host that produced the error.
    RetrySame,
    /// Retry against the next host in the query plan.
    RetryNext,
    /// Give up and surface the error to the caller.
    Rethrow,
}

/// Decides whether a failed attempt should be retried, and against which host.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// `attempts` counts the attempt that just failed (the first attempt is `1`).
    fn on_error(&self, error: &Error, attempts: u32, is_idempotent: bool) -> RetryDecision;
}

/// Retries transport-level failures against the next host, retries provably-safe server-side
/// timeouts against the same host once, and gives up on everything else.
///
/// Grounded on spec §3's retry/failover requirement and the `WriteType`-driven idempotence check
/// in [`Error::is_safe_to_retry_non_idempotent`].
#[derive(Debug)]
pub struct DefaultRetryPolicy {
    max_retries: u32,
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self { max_retries: 1 }
    }
}

impl DefaultRetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn on_error(&self, error: &Error, attempts: u32, is_idempotent: bool) -> RetryDecision {
        if attempts > self.max_retries {
            return RetryDecision::Rethrow;
        }

        match error {
            _ if error.is_transport_error() => RetryDecision::RetryNext,
            Error::Overloaded { .. } => RetryDecision::RetryNext,
            Error::ReadTimeout { .. } => RetryDecision::RetrySame,
            Error::WriteTimeout { write_type, .. } => {
                if *write_type == WriteType::BatchLog
                    || is_idempotent
                    || error.is_safe_to_retry_non_idempotent()
                {
                    RetryDecision::RetrySame
                } else {
                    RetryDecision::Rethrow
                }
            }
            Error::Unavailable { .. } => RetryDecision::RetryNext,
            _ => RetryDecision::Rethrow,
        }
    }
}

/// The pair of policies a [`Router`](crate::router::Router) consults for every request.
#[derive(Clone, Debug)]
pub struct Policies {
    pub load_balancing: Arc<dyn LoadBalancingPolicy>,
    pub retry: Arc<dyn RetryPolicy>,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            load_balancing: Arc::new(TokenAwarePolicy),
            retry: Arc::new(DefaultRetryPolicy::default()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;
    use crate::topology::TokenMap;

    fn host(address: &str) -> Host {
        let address: SocketAddr = address.parse().unwrap();
        Host::new(address, "dc1", "rack1", vec![])
    }

    #[test]
    fn token_aware_plan_excludes_down_hosts() {
        let up = host("10.0.0.1:9042");
        let down = host("10.0.0.2:9042");
        down.set_status(HostStatus::Down);

        let ring = vec![(0, up.clone()), (100, down.clone())];
        let map = TokenMap::new(ring, std::collections::HashMap::new());
        let token_map = TokenMapHandle::new(map);

        let plan = TokenAwarePolicy.query_plan("ks", None, &token_map);
        assert_eq!(plan, vec![up]);
    }

    #[test]
    fn retries_transport_errors_against_the_next_host() {
        let policy = DefaultRetryPolicy::new(2);
        let decision = policy.on_error(
            &Error::ConnectionClosed {
                address: "127.0.0.1:9042".parse().unwrap(),
            },
            1,
            false,
        );
        assert_eq!(decision, RetryDecision::RetryNext);
    }

    #[test]
    fn busy_is_treated_as_a_transport_error() {
        let policy = DefaultRetryPolicy::new(2);
        let decision = policy.on_error(
            &Error::Busy {
                address: "127.0.0.1:9042".parse().unwrap(),
            },
            1,
            false,
        );
        assert_eq!(decision, RetryDecision::RetryNext);
    }

    #[test]
    fn batch_log_timeout_is_always_retried_same_host() {
        let policy = DefaultRetryPolicy::new(1);
        let decision = policy.on_error(
            &Error::WriteTimeout {
                message: "timed out".into(),
                write_type: WriteType::BatchLog,
            },
            1,
            false,
        );
        assert_eq!(decision, RetryDecision::RetrySame);
    }

    #[test]
    fn non_idempotent_write_timeout_is_not_retried() {
        let policy = DefaultRetryPolicy::new(1);
        let decision = policy.on_error(
            &Error::WriteTimeout {
                message: "timed out".into(),
                write_type: WriteType::Simple,
            },
            1,
            false,
        );
        assert_eq!(decision, RetryDecision::Rethrow);
    }

    #[test]
    fn exhausted_retry_budget_rethrows() {
        let policy = DefaultRetryPolicy::new(1);
        let decision = policy.on_error(&Error::Timeout, 2, true);
        assert_eq!(decision, RetryDecision::Rethrow);
    }
}
