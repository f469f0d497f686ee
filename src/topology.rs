//! The token ring snapshot and the fan-out events processors exchange as it changes.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;

use crate::host::{Host, Token};

/// An immutable snapshot mapping ring tokens to the hosts that own them.
///
/// A `TokenMap` is never mutated in place; the control connection builds a brand new one on
/// every topology change and swaps it in wholesale, so a [`TokenMapHandle`] read during routing
/// always sees a single atomic, internally-consistent snapshot (spec invariant I-TOK).
#[derive(Debug, Default)]
pub struct TokenMap {
    /// Ring tokens in ascending order, each paired with the host that owns it.
    ring: Vec<(Token, Host)>,
    keyspace_replication: HashMap<Arc<str>, ReplicationStrategy>,
}

/// How a keyspace's replicas are chosen relative to the ring.
#[derive(Clone, Debug)]
pub enum ReplicationStrategy {
    /// One replica per distinct datacenter count, walking the ring clockwise.
    SimpleStrategy { replication_factor: usize },
    /// A configurable replica count per datacenter.
    NetworkTopologyStrategy {
        replication_factor: HashMap<Arc<str>, usize>,
    },
}

impl TokenMap {
    /// Builds a new snapshot from a set of owned tokens. `ring` need not be pre-sorted.
    pub fn new(
        mut ring: Vec<(Token, Host)>,
        keyspace_replication: HashMap<Arc<str>, ReplicationStrategy>,
    ) -> Self {
        ring.sort_by_key(|(token, _)| *token);
        Self {
            ring,
            keyspace_replication,
        }
    }

    /// Returns the replicas responsible for `routing_token` in `keyspace`, walking the ring
    /// clockwise from the first token greater than or equal to it and skipping hosts already
    /// seen until either the strategy's replication factor is satisfied or the ring is
    /// exhausted.
    pub fn replicas(&self, keyspace: &str, routing_token: Token) -> Vec<Host> {
        if self.ring.is_empty() {
            return Vec::new();
        }
        let replication_factor = match self.keyspace_replication.get(keyspace) {
            Some(ReplicationStrategy::SimpleStrategy { replication_factor }) => {
                *replication_factor
            }
            Some(ReplicationStrategy::NetworkTopologyStrategy { replication_factor }) => {
                replication_factor.values().sum()
            }
            None => 1,
        };

        let start = self
            .ring
            .partition_point(|(token, _)| *token < routing_token);

        let mut replicas = Vec::with_capacity(replication_factor);
        for i in 0..self.ring.len() {
            let (_, host) = &self.ring[(start + i) % self.ring.len()];
            if replicas.iter().any(|h: &Host| h == host) {
                continue;
            }
            replicas.push(host.clone());
            if replicas.len() == replication_factor {
                break;
            }
        }
        replicas
    }

    /// Every host with at least one owned token, in ring order. Used by policies that fall back
    /// to a full scan (e.g. when a statement carries no routing key).
    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.ring.iter().map(|(_, host)| host)
    }
}

/// A lock-free, swap-on-write handle to the current [`TokenMap`].
///
/// Cloning a handle is cheap (an `Arc` bump); every clone observes the same sequence of
/// snapshots. Held by the [`Router`](crate::router::Router) on each processor.
#[derive(Clone, Debug, Default)]
pub struct TokenMapHandle(Arc<ArcSwap<TokenMap>>);

impl TokenMapHandle {
    pub fn new(initial: TokenMap) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(initial)))
    }

    /// Replaces the snapshot wholesale. Called only by the control connection.
    pub fn store(&self, new_map: TokenMap) {
        self.0.store(Arc::new(new_map));
    }

    /// Returns a cheap, atomically-consistent reference to the current snapshot.
    pub fn load(&self) -> arc_swap::Guard<Arc<TokenMap>> {
        self.0.load()
    }
}

/// An event fanned out from the control connection to every processor's event intake queue.
///
/// Mirrors the original driver's `Payload`, extended with the keyspace and token-map update
/// variants the original only handled as side effects of pool add/remove.
#[derive(Clone, Debug)]
pub enum Payload {
    /// A pool for `host` should be created (or re-created) on this processor.
    AddPool { host: Host },
    /// The pool for `host` on this processor should be closed and dropped.
    RemovePool { host: Host },
    /// The default keyspace for new connections has changed.
    KeyspaceUpdate { keyspace: Arc<str> },
    /// The token ring has changed; the processor's [`TokenMapHandle`] already reflects it by the
    /// time this event is observed, so this variant exists purely to wake processors blocked
    /// waiting on their event queue.
    TokenMapUpdate,
}
