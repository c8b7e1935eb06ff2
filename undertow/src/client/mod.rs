use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;

use crate::peer::connection::{DownloadedPiece, PeerConnection, PieceWork};
use crate::peer::{Peer, PeerId};
use crate::storage::PieceStore;
use crate::torrent::TorrentMetadata;
use crate::tracker::{AnnounceParameters, TrackerClient, TrackerEvent};

type Result<T> = std::result::Result<T, ClientError>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Tracker error: {0}")]
    Tracker(#[from] crate::tracker::TrackerError),
    #[error("No peer completed the handshake")]
    NoPeers,
    #[error("No connected peer can supply the remaining pieces, {downloaded}/{total} downloaded")]
    Stalled { downloaded: usize, total: usize },
}

#[derive(Debug)]
pub struct Config {
    /// Port advertised to the tracker for incoming connections.
    pub listen_port: u16,
    /// Cap on concurrently connected peers.
    pub max_peers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            max_peers: 10,
        }
    }
}

/// Orders the pieces available from at least one peer rarest-first:
/// ascending availability count, piece index as the tie break.
fn rarest_first(availability: &[usize]) -> Vec<u32> {
    let mut indices: Vec<u32> = (0..availability.len() as u32)
        .filter(|&index| availability[index as usize] > 0)
        .collect();
    indices.sort_by_key(|&index| (availability[index as usize], index));
    indices
}

fn piece_availability(connections: &[PeerConnection], piece_count: usize) -> Vec<usize> {
    let mut counts = vec![0; piece_count];
    for connection in connections {
        for (index, count) in counts.iter_mut().enumerate() {
            if connection.has_piece(index as u32) {
                *count += 1;
            }
        }
    }
    counts
}

/// Drives one leeching session: announce, connect, then schedule piece
/// downloads across the connected peers until the store is complete.
pub struct Client {
    client_id: PeerId,
    config: Config,
    tracker_client: Box<dyn TrackerClient>,
}

impl Client {
    pub fn new(client_id: PeerId, config: Config, tracker_client: Box<dyn TrackerClient>) -> Self {
        Self {
            client_id,
            config,
            tracker_client,
        }
    }

    pub fn download(&self, meta: &TorrentMetadata, store: &PieceStore) -> Result<()> {
        let mut params = AnnounceParameters::new(&meta.info_hash);
        params
            .set_port(self.config.listen_port)
            .set_uploaded(0)
            .set_downloaded(0)
            .set_left(meta.total_length as usize)
            .set_event(Some(TrackerEvent::Started));
        let response = self.tracker_client.announce(&meta.announce, params)?;
        info!("tracker returned {} peers", response.peers.len());

        let mut connections = self.connect(meta, &response.peers);
        if connections.is_empty() {
            return Err(ClientError::NoPeers);
        }
        let availability = piece_availability(&connections, meta.piece_count());

        while !store.is_complete() {
            let before = store.downloaded_count();
            let received = self.download_all(meta, store, &mut connections, &availability);
            info!(
                "round finished: {} pieces received, progress {:.1}%",
                received.len(),
                store.progress()
            );
            if store.downloaded_count() == before {
                return Err(ClientError::Stalled {
                    downloaded: store.downloaded_count(),
                    total: meta.piece_count(),
                });
            }
        }
        Ok(())
    }

    /// Handshakes up to `max_peers` of the supplied addresses concurrently.
    /// A peer failing to connect, handshake, or produce a bitfield is
    /// logged and dropped, never fatal to the session.
    pub fn connect(&self, meta: &TorrentMetadata, peers: &[Peer]) -> Vec<PeerConnection> {
        let candidates = &peers[..peers.len().min(self.config.max_peers)];
        let client_id = &self.client_id;
        thread::scope(|scope| {
            let handles: Vec<_> = candidates
                .iter()
                .map(|peer| {
                    scope.spawn(move || {
                        let stream = match TcpStream::connect_timeout(&peer.addr, CONNECT_TIMEOUT) {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!("peer {}: connect failed: {e}", peer.addr);
                                return None;
                            }
                        };
                        match PeerConnection::establish(
                            stream,
                            &meta.info_hash,
                            client_id,
                            meta.piece_count(),
                        ) {
                            Ok(connection) => Some(connection),
                            Err(e) => {
                                warn!("peer {}: dropped: {e}", peer.addr);
                                None
                            }
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| handle.join().ok().flatten())
                .collect()
        })
    }

    /// One scheduling round: the remaining pieces, rarest first, are split
    /// into evenly sized slices across the active peers and downloaded
    /// concurrently. Returns the merged results sorted by piece index; a
    /// failing peer contributes nothing but never aborts its siblings.
    pub fn download_all(
        &self,
        meta: &TorrentMetadata,
        store: &PieceStore,
        connections: &mut [PeerConnection],
        availability: &[usize],
    ) -> Vec<DownloadedPiece> {
        let remaining: Vec<u32> = rarest_first(availability)
            .into_iter()
            .filter(|&index| !store.is_downloaded(index as usize))
            .collect();
        if remaining.is_empty() || connections.is_empty() {
            return Vec::new();
        }

        let slice_size = remaining.len().div_ceil(connections.len());
        let assignments: Vec<Vec<PieceWork>> = remaining
            .chunks(slice_size)
            .map(|chunk| {
                chunk
                    .iter()
                    .map(|&index| PieceWork {
                        index,
                        length: meta.piece_size(index as usize) as u32,
                    })
                    .collect()
            })
            .collect();

        let mut results: Vec<DownloadedPiece> = thread::scope(|scope| {
            let handles: Vec<_> = connections
                .iter_mut()
                .zip(assignments)
                .map(|(connection, work)| {
                    scope.spawn(move || {
                        let addr = connection.addr();
                        match connection.download_pieces(&work, store) {
                            Ok(pieces) => pieces,
                            Err(e) => {
                                warn!("peer {addr}: download failed: {e}");
                                Vec::new()
                            }
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap_or_default())
                .collect()
        });
        results.sort_by_key(|piece| piece.index);
        results
    }
}
