//! The [`Host`] identity and the health status the control connection maintains for it.

use std::{
    hash::{Hash, Hasher},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

/// A single cluster node's endpoint identity and replication topology placement.
///
/// Hosts are created by the control connection and shared read-only with every
/// [`RequestProcessor`](crate::processor::RequestProcessor); identity and equality are by
/// `address` alone, matching spec: two `Host` values with the same address are the same host
/// even if their datacenter/rack/tokens fields have since diverged in separately-held copies.
#[derive(Clone, Debug)]
pub struct Host {
    address: SocketAddr,
    datacenter: Arc<str>,
    rack: Arc<str>,
    tokens: Arc<[Token]>,
    status: Arc<AtomicU8>,
}

/// A single token owned by a [`Host`] in the ring.
pub type Token = i64;

/// The health status the control connection maintains for a [`Host`].
///
/// Mutation of a host's status is reserved to the control connection; every other reader only
/// ever observes it, and only through an event traveling on a processor's event intake queue, so
/// it is never observed concurrently with a routing decision being made against the same host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HostStatus {
    /// The host is healthy and should be considered for routing.
    Up = 0,
    /// The host is known to be unreachable; existing pools may keep trying to reconnect, but it
    /// is not considered for new routing decisions.
    Down = 1,
    /// The host has left the cluster; its pool should be torn down entirely.
    Removed = 2,
}

impl HostStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HostStatus::Up,
            1 => HostStatus::Down,
            _ => HostStatus::Removed,
        }
    }
}

impl Host {
    /// Creates a new, healthy [`Host`].
    pub fn new(
        address: SocketAddr,
        datacenter: impl Into<Arc<str>>,
        rack: impl Into<Arc<str>>,
        tokens: impl Into<Arc<[Token]>>,
    ) -> Self {
        Self {
            address,
            datacenter: datacenter.into(),
            rack: rack.into(),
            tokens: tokens.into(),
            status: Arc::new(AtomicU8::new(HostStatus::Up as u8)),
        }
    }

    /// The endpoint this host's pool connects to. This is the host's identity.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The datacenter this host belongs to, used by the default load-balancing policy to prefer
    /// local-DC replicas.
    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    /// The rack this host belongs to within its datacenter.
    pub fn rack(&self) -> &str {
        &self.rack
    }

    /// The tokens this host owns in the ring.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// The host's current health status.
    pub fn status(&self) -> HostStatus {
        HostStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Updates this host's health status. Reserved for the control connection; every clone of a
    /// `Host` shares the same underlying status cell, so this is visible to every processor the
    /// next time it observes a routing-relevant event.
    pub fn set_status(&self, status: HostStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}
