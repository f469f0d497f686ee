//! Host selection, connection acquisition, and retry/failover for a single request.
//!
//! Runs entirely inline on the processor loop thread that owns `pools`; there is no separate
//! router task or channel hop, matching spec's requirement that routing add no cross-thread
//! latency to the hot path.

use std::{
    cell::RefCell,
    collections::HashMap,
    net::SocketAddr,
    rc::Rc,
    time::{Duration, Instant},
};

use crate::{
    cmap::pool::HostPool,
    error::Error,
    policy::{Policies, RetryDecision},
    request::{ExecutionState, RequestFuture, Response},
    runtime,
    topology::TokenMapHandle,
};

/// Executes one [`RequestFuture`] to completion: selects a query plan, acquires a connection for
/// each candidate host in turn, and applies the configured retry policy to transport and
/// server-side failures until the request succeeds, is exhausted, or is rethrown.
pub(crate) struct Router {
    policies: Policies,
    token_map: TokenMapHandle,
    request_timeout: Duration,
}

impl Router {
    pub(crate) fn new(policies: Policies, token_map: TokenMapHandle, request_timeout: Duration) -> Self {
        Self {
            policies,
            token_map,
            request_timeout,
        }
    }

    /// Runs `request` to completion, delivering its outcome on `request.reply`. Never panics on
    /// a disconnected reply channel; a caller that dropped its receiver simply has its result
    /// discarded.
    pub(crate) async fn execute(
        &self,
        pools: Rc<RefCell<HashMap<SocketAddr, HostPool>>>,
        request: RequestFuture,
    ) {
        let RequestFuture {
            statement,
            deadline,
            reply,
        } = request;

        let keyspace = statement.keyspace.as_deref().unwrap_or_default();
        let mut plan = self
            .policies
            .load_balancing
            .query_plan(keyspace, statement.routing_token, &self.token_map)
            .into_iter();

        let overall_deadline = Instant::now() + deadline.min(self.request_timeout);
        let mut state = ExecutionState::default();
        let mut current_host = plan.next();

        loop {
            if reply.is_closed() {
                return;
            }

            let Some(host) = current_host.clone() else {
                let _ = reply.send(Err(Error::NoHostAvailable));
                return;
            };

            let conn = pools
                .borrow()
                .get(&host.address())
                .and_then(|pool| pool.acquire());

            let Some(conn) = conn else {
                current_host = plan.next();
                continue;
            };

            state.record_attempt(host.address());

            let remaining = overall_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let _ = reply.send(Err(Error::Timeout));
                return;
            }

            // `runtime::timeout` drops the `send` future the instant `remaining` elapses without
            // giving the connection a chance to release the stream id it already allocated; the
            // same `overall_deadline` handed to `send` lets the connection's own maintenance-tick
            // scan (`Connection::expire_pending`) reclaim that slot independently once it passes.
            let outcome = runtime::timeout(
                remaining,
                conn.send(statement.opcode, &statement.body, overall_deadline),
            )
            .await;

            match outcome {
                None => {
                    let _ = reply.send(Err(Error::Timeout));
                    return;
                }
                Some(Ok(frame)) => {
                    let _ = reply.send(Ok(Response {
                        opcode: frame.opcode,
                        body: frame.body,
                    }));
                    return;
                }
                Some(Err(err)) => {
                    match self
                        .policies
                        .retry
                        .on_error(&err, state.attempts, statement.is_idempotent)
                    {
                        RetryDecision::RetrySame => continue,
                        RetryDecision::RetryNext => {
                            current_host = plan.next();
                            continue;
                        }
                        RetryDecision::Rethrow => {
                            let _ = reply.send(Err(err));
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashMap, net::SocketAddr, time::Duration};

    use super::*;
    use crate::{
        cmap::{conn::Transport, pool::Connector},
        event::EventEmitter,
        host::Host,
        policy::{DefaultRetryPolicy, LoadBalancingPolicy},
        request::Statement,
        topology::TokenMap,
    };

    fn host(address: &str) -> Host {
        Host::new(address.parse().unwrap(), "dc1", "rack1", vec![])
    }

    fn statement() -> Statement {
        Statement {
            opcode: 0x01,
            body: b"ping".to_vec(),
            keyspace: None,
            routing_token: None,
            is_idempotent: true,
        }
    }

    /// Always yields `hosts`, in order, regardless of keyspace or routing token — enough to drive
    /// a fixed failover sequence in a test without needing a real token ring.
    #[derive(Debug)]
    struct FixedPlan(Vec<Host>);

    impl LoadBalancingPolicy for FixedPlan {
        fn query_plan(&self, _keyspace: &str, _routing_token: Option<i64>, _token_map: &TokenMapHandle) -> Vec<Host> {
            self.0.clone()
        }
    }

    fn refusing_connector() -> Connector {
        Arc::new(|address: SocketAddr| {
            Box::pin(async move {
                Err(Error::WriteFailed {
                    address,
                    message: "refused".into(),
                })
            }) as crate::BoxLocalFuture<Result<Box<dyn Transport>>>
        })
    }

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
                Ok(Box::new(client) as Box<dyn Transport>)
            }) as crate::BoxLocalFuture<Result<Box<dyn Transport>>>
        })
    }

    fn pool_map_with(host: Host, connector: Connector) -> Rc<RefCell<HashMap<SocketAddr, HostPool>>> {
        let mut map = HashMap::new();
        let address = host.address();
        let pool = HostPool::new(
            host,
            connector,
            1,
            1,
            32,
            Duration::from_secs(30),
            Duration::from_secs(60),
            EventEmitter::default(),
        );
        map.insert(address, pool);
        Rc::new(RefCell::new(map))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn exhausted_plan_fails_with_no_host_available() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let pools: Rc<RefCell<HashMap<SocketAddr, HostPool>>> = Rc::new(RefCell::new(HashMap::new()));
                let policies = Policies {
                    load_balancing: Arc::new(FixedPlan(Vec::new())),
                    retry: Arc::new(DefaultRetryPolicy::default()),
                };
                let router = Router::new(policies, TokenMapHandle::new(TokenMap::default()), Duration::from_secs(5));

                let (request, rx) = RequestFuture::new(statement(), Duration::from_secs(2));
                router.execute(pools, request).await;
                assert!(matches!(rx.await.unwrap(), Err(Error::NoHostAvailable)));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failover_skips_a_refusing_host_and_succeeds_on_the_next() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let bad = host("10.0.0.1:9042");
                let good = host("10.0.0.2:9042");

                let mut pools = HashMap::new();
                pools.insert(
                    bad.address(),
                    HostPool::new(
                        bad.clone(),
                        refusing_connector(),
                        1,
                        1,
                        32,
                        Duration::from_secs(30),
                        Duration::from_secs(60),
                        EventEmitter::default(),
                    ),
                );
                pools.insert(
                    good.address(),
                    HostPool::new(
                        good.clone(),
                        echo_connector(),
                        1,
                        1,
                        32,
                        Duration::from_secs(30),
                        Duration::from_secs(60),
                        EventEmitter::default(),
                    ),
                );
                // Let both pools' core connections settle before routing.
                tokio::time::sleep(Duration::from_millis(10)).await;
                let pools = Rc::new(RefCell::new(pools));

                let policies = Policies {
                    load_balancing: Arc::new(FixedPlan(vec![bad, good])),
                    retry: Arc::new(DefaultRetryPolicy::default()),
                };
                let router = Router::new(policies, TokenMapHandle::new(TokenMap::default()), Duration::from_secs(5));

                let (request, rx) = RequestFuture::new(statement(), Duration::from_secs(2));
                router.execute(pools, request).await;
                let response = rx.await.unwrap().unwrap();
                assert_eq!(response.body, b"ping");
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dropped_receiver_does_not_panic() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let host = host("10.0.0.1:9042");
                let pools = pool_map_with(host.clone(), echo_connector());
                tokio::time::sleep(Duration::from_millis(10)).await;

                let policies = Policies {
                    load_balancing: Arc::new(FixedPlan(vec![host])),
                    retry: Arc::new(DefaultRetryPolicy::default()),
                };
                let router = Router::new(policies, TokenMapHandle::new(TokenMap::default()), Duration::from_secs(5));

                let (request, rx) = RequestFuture::new(statement(), Duration::from_secs(2));
                drop(rx);
                router.execute(pools, request).await;
            })
            .await;
    }
}
