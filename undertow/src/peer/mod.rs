use std::borrow::Borrow;
use std::net::SocketAddr;
use std::ops::Deref;

use rand::RngCore;

pub mod connection;

/// Client identifier prefix in the conventional Azureus style.
pub const CLIENT_PREFIX: &[u8; 8] = b"-UW0001-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerId([u8; 20]);

/// Peer address as supplied by the tracker.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: Option<PeerId>,
    pub addr: SocketAddr,
}

impl PeerId {
    pub fn new(peer_id: [u8; 20]) -> Self {
        Self(peer_id)
    }

    /// Client prefix plus random tail, from an explicit byte source so
    /// identifiers are reproducible under a seeded generator.
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut peer_id = [0; 20];
        peer_id[..CLIENT_PREFIX.len()].copy_from_slice(CLIENT_PREFIX);
        rng.fill_bytes(&mut peer_id[CLIENT_PREFIX.len()..]);
        Self::new(peer_id)
    }

    pub fn random() -> Self {
        Self::generate(&mut rand::thread_rng())
    }
}

impl Borrow<[u8]> for PeerId {
    fn borrow(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl Deref for PeerId {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Peer {
    pub fn new(id: Option<PeerId>, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}
