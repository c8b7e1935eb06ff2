use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use bytes::{Buf, BufMut};
use log::{debug, warn};
use thiserror::Error;

use crate::peer::connection::ConnectionError::{Frame, HandshakeFailed, UnexpectedMessage};
use crate::peer::connection::HandshakeMessageError::{ProtocolString, ProtocolStringLen};
use crate::peer::PeerId;
use crate::storage::PieceStore;
use crate::util::{Bitfield, Sha1};

type Result<T> = std::result::Result<T, ConnectionError>;

static BIT_TORRENT_PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Bound on every blocking receive; expiry abandons the current piece
/// attempt, not the session.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Outstanding whole-piece requests kept in flight per peer.
pub const PIPELINE_DEPTH: usize = 10;

#[derive(Error, Debug)]
pub enum HandshakeMessageError {
    #[error("Invalid protocol string(pstr) length, expected 19, but got {0}")]
    ProtocolStringLen(u8),
    #[error("Unexpected protocol string, expected \"BitTorrent protocol\", but got {0}")]
    ProtocolString(String),
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("BitTorrent handshake failed {0}")]
    HandshakeFailed(String),
    #[error("Error in parsing handshake response {0}")]
    HandshakeResponse(#[from] HandshakeMessageError),
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("Malformed message frame: {0}")]
    Frame(String),
    #[error("Piece store error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error(transparent)]
    IoKind(#[from] io::Error),
}

#[derive(Debug, PartialEq, Clone)]
struct HandshakeMessage {
    extension_bytes: [u8; 8],
    info_hash: Sha1,
    peer_id: PeerId,
}

impl HandshakeMessage {
    fn new(extension_bytes: [u8; 8], info_hash: Sha1, peer_id: PeerId) -> Self {
        Self {
            extension_bytes,
            info_hash,
            peer_id,
        }
    }

    fn to_bytes(&self) -> Box<[u8; 68]> {
        let mut res = Box::new([0; 68]);
        res[0] = 19u8;
        res[1..20].copy_from_slice(BIT_TORRENT_PROTOCOL_STRING.as_slice());
        res[20..28].copy_from_slice(self.extension_bytes.as_slice());
        res[28..48].copy_from_slice(self.info_hash.as_slice());
        res[48..68].copy_from_slice(self.peer_id.as_slice());
        res
    }

    fn from_bytes(raw: Box<[u8; 68]>) -> std::result::Result<Self, HandshakeMessageError> {
        let pstr_len = raw[0];
        if pstr_len != 19 {
            return Err(ProtocolStringLen(pstr_len));
        }
        let pstr = &raw[1..20];
        if pstr != BIT_TORRENT_PROTOCOL_STRING {
            return Err(ProtocolString(String::from_utf8_lossy(pstr).to_string()));
        }
        let mut extension_bytes = [0; 8];
        extension_bytes.copy_from_slice(&raw[20..28]);
        let mut info_hash: Sha1 = [0; 20];
        info_hash.copy_from_slice(&raw[28..48]);
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&raw[48..68]);

        Ok(Self::new(extension_bytes, info_hash, PeerId::new(peer_id)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
}

impl MessageKind {
    fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(MessageKind::Choke),
            1 => Some(MessageKind::Unchoke),
            2 => Some(MessageKind::Interested),
            5 => Some(MessageKind::Bitfield),
            6 => Some(MessageKind::Request),
            7 => Some(MessageKind::Piece),
            _ => None,
        }
    }

    fn id(self) -> u8 {
        self as u8
    }
}

/// One framed peer-wire message: `<u32 length><u8 id><payload>`.
#[derive(Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }

    pub fn request(index: u32, begin: u32, length: u32) -> Self {
        let mut payload = Vec::with_capacity(12);
        payload.put_u32(index);
        payload.put_u32(begin);
        payload.put_u32(length);
        Self {
            kind: MessageKind::Request,
            payload,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(4 + 1 + self.payload.len());
        frame.put_u32(1 + self.payload.len() as u32);
        frame.put_u8(self.kind.id());
        frame.put_slice(&self.payload);
        frame
    }
}

enum Incoming {
    KeepAlive,
    Unknown(u8),
    Frame(Message),
}

fn read_incoming<R: Read>(stream: &mut R) -> Result<Incoming> {
    let mut length_prefix = [0u8; 4];
    stream.read_exact(&mut length_prefix)?;
    let length = u32::from_be_bytes(length_prefix) as usize;
    if length == 0 {
        return Ok(Incoming::KeepAlive);
    }
    let mut frame = vec![0u8; length];
    stream.read_exact(&mut frame)?;
    let id = frame[0];
    match MessageKind::from_id(id) {
        Some(kind) => Ok(Incoming::Frame(Message {
            kind,
            payload: frame.split_off(1),
        })),
        None => Ok(Incoming::Unknown(id)),
    }
}

fn send_message<W: Write>(stream: &mut W, message: &Message) -> Result<()> {
    stream.write_all(&message.serialize())?;
    Ok(())
}

/// Read errors that end this peer's usefulness without being a protocol
/// violation: the per-read timeout and the remote closing the socket.
fn is_session_end(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::UnexpectedEof
    )
}

/// A piece assignment: index plus the logical size of that piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceWork {
    pub index: u32,
    pub length: u32,
}

/// A piece received from a peer and accepted by the piece store.
#[derive(Debug, PartialEq, Eq)]
pub struct DownloadedPiece {
    pub index: u32,
    pub data: Vec<u8>,
}

/// One TCP session with one remote peer. The remote bitfield is read once
/// after the handshake and treated as fixed for the whole session.
pub struct PeerConnection {
    stream: TcpStream,
    addr: SocketAddr,
    remote_id: PeerId,
    bitfield: Bitfield,
    choked: bool,
}

impl PeerConnection {
    /// Performs the 68-byte handshake and the mandatory bitfield exchange.
    pub fn establish(
        mut stream: TcpStream,
        info_hash: &Sha1,
        peer_id: &PeerId,
        piece_count: usize,
    ) -> Result<Self> {
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let addr = stream.peer_addr()?;

        let request = HandshakeMessage::new([0; 8], *info_hash, peer_id.clone());
        stream.write_all(request.to_bytes().as_ref())?;

        let mut raw = Box::new([0u8; 68]);
        stream.read_exact(raw.as_mut()).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                HandshakeFailed("peer closed the connection before 68 bytes".to_string())
            } else {
                ConnectionError::from(e)
            }
        })?;
        let response = HandshakeMessage::from_bytes(raw)?;
        if response.info_hash != *info_hash {
            return Err(HandshakeFailed(format!(
                "info hash mismatch, peer answered for {}",
                hex::encode(response.info_hash)
            )));
        }

        let bitfield = loop {
            match read_incoming(&mut stream)? {
                Incoming::KeepAlive => continue,
                Incoming::Unknown(id) => {
                    return Err(UnexpectedMessage(format!(
                        "expected bitfield, got message id {id}"
                    )))
                }
                Incoming::Frame(message) => {
                    if message.kind != MessageKind::Bitfield {
                        return Err(UnexpectedMessage(format!(
                            "expected bitfield, got {:?}",
                            message.kind
                        )));
                    }
                    if message.payload.len() < piece_count.div_ceil(8) {
                        return Err(Frame(format!(
                            "bitfield of {} bytes cannot cover {piece_count} pieces",
                            message.payload.len()
                        )));
                    }
                    break Bitfield::from_bytes(message.payload, piece_count);
                }
            }
        };

        debug!(
            "peer {addr}: handshake complete, remote id {}, {} pieces advertised",
            String::from_utf8_lossy(&response.peer_id[..8]),
            bitfield.count_ones()
        );
        Ok(Self {
            stream,
            addr,
            remote_id: response.peer_id,
            bitfield,
            choked: true,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn remote_id(&self) -> &PeerId {
        &self.remote_id
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.get(index as usize)
    }

    /// Downloads the subset of `work` this peer advertises and the store
    /// still needs, whole pieces in ascending index order, keeping up to
    /// [`PIPELINE_DEPTH`] requests in flight. Returns the pieces that
    /// arrived and passed verification; pieces the peer cannot supply (or
    /// that time out) are omitted, not errors.
    pub fn download_pieces(
        &mut self,
        work: &[PieceWork],
        store: &PieceStore,
    ) -> Result<Vec<DownloadedPiece>> {
        let mut wanted: Vec<PieceWork> = work
            .iter()
            .copied()
            .filter(|piece| self.has_piece(piece.index) && !store.is_downloaded(piece.index as usize))
            .collect();
        wanted.sort_unstable_by_key(|piece| piece.index);
        let mut queue: VecDeque<PieceWork> = wanted.into();

        let mut received = Vec::new();
        if queue.is_empty() {
            return Ok(received);
        }

        send_message(&mut self.stream, &Message::new(MessageKind::Interested))?;

        let mut pending: VecDeque<PieceWork> = VecDeque::new();
        while !queue.is_empty() || !pending.is_empty() {
            if !self.choked {
                // Top the pipeline back up after every satisfied request.
                while pending.len() < PIPELINE_DEPTH {
                    let Some(piece) = queue.pop_front() else {
                        break;
                    };
                    send_message(&mut self.stream, &Message::request(piece.index, 0, piece.length))?;
                    pending.push_back(piece);
                }
            }

            let incoming = match read_incoming(&mut self.stream) {
                Ok(incoming) => incoming,
                Err(ConnectionError::IoKind(e)) if is_session_end(&e) => {
                    warn!(
                        "peer {}: receive failed ({e}), abandoning {} queued and {} in-flight pieces",
                        self.addr,
                        queue.len(),
                        pending.len()
                    );
                    break;
                }
                Err(e) => return Err(e),
            };
            let message = match incoming {
                Incoming::KeepAlive => continue,
                Incoming::Unknown(id) => {
                    debug!("peer {}: ignoring message id {id}", self.addr);
                    continue;
                }
                Incoming::Frame(message) => message,
            };
            match message.kind {
                MessageKind::Choke => {
                    // Responses to in-flight requests will not arrive;
                    // queue them again for after the next unchoke.
                    self.choked = true;
                    while let Some(piece) = pending.pop_back() {
                        queue.push_front(piece);
                    }
                    debug!("peer {}: choked", self.addr);
                }
                MessageKind::Unchoke => {
                    self.choked = false;
                    debug!("peer {}: unchoked", self.addr);
                }
                MessageKind::Piece => {
                    let mut payload = message.payload.as_slice();
                    if payload.len() < 8 {
                        return Err(Frame(format!(
                            "piece payload of {} bytes",
                            payload.len()
                        )));
                    }
                    let index = payload.get_u32();
                    let begin = payload.get_u32();
                    if begin != 0 {
                        warn!(
                            "peer {}: block for piece {index} at offset {begin}, expected a whole piece",
                            self.addr
                        );
                        continue;
                    }
                    let Some(position) = pending.iter().position(|piece| piece.index == index)
                    else {
                        warn!("peer {}: piece {index} was never requested", self.addr);
                        continue;
                    };
                    let Some(piece) = pending.remove(position) else {
                        continue;
                    };
                    if payload.len() != piece.length as usize {
                        warn!(
                            "peer {}: piece {index} arrived with {} bytes, expected {}",
                            self.addr,
                            payload.len(),
                            piece.length
                        );
                        continue;
                    }
                    let block = payload.to_vec();
                    if store.write_and_verify(index as usize, &block)? {
                        received.push(DownloadedPiece { index, data: block });
                    } else {
                        warn!("peer {}: piece {index} failed verification", self.addr);
                    }
                }
                MessageKind::Interested | MessageKind::Bitfield | MessageKind::Request => {
                    debug!(
                        "peer {}: ignoring {:?} message mid-session",
                        self.addr, message.kind
                    );
                }
            }
        }
        Ok(received)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::path::PathBuf;
    use std::thread;

    use bytes::{BufMut, BytesMut};
    use rand::RngCore;
    use sha1::{Digest, Sha1 as Sha1Hasher};
    use url::Url;

    use crate::torrent::{FileEntry, TorrentMetadata};

    use super::*;

    #[test]
    fn handshake_message_as_bytes() {
        let mut extensions_bytes = [0; 8];
        rand::thread_rng().fill_bytes(&mut extensions_bytes);
        let mut info_hash = [0; 20];
        rand::thread_rng().fill_bytes(&mut info_hash);
        let peer_id = PeerId::random();

        let mut bytes = BytesMut::with_capacity(68);
        bytes.put_u8(19u8);
        bytes.extend_from_slice(BIT_TORRENT_PROTOCOL_STRING);
        bytes.extend_from_slice(extensions_bytes.as_slice());
        bytes.extend_from_slice(info_hash.as_slice());
        bytes.extend_from_slice(peer_id.as_ref());

        let message = HandshakeMessage::new(extensions_bytes, info_hash, peer_id);
        let message_bytes = message.to_bytes();

        assert_eq!(bytes.as_ref(), message_bytes.as_slice());
    }

    #[test]
    fn handshake_message_from_bytes() {
        let mut extensions_bytes = [0; 8];
        rand::thread_rng().fill_bytes(&mut extensions_bytes);
        let mut info_hash = [0; 20];
        rand::thread_rng().fill_bytes(&mut info_hash);
        let peer_id = PeerId::random();

        let message = HandshakeMessage::new(extensions_bytes, info_hash, peer_id);
        let message_from_bytes = HandshakeMessage::from_bytes(message.to_bytes()).unwrap();

        assert_eq!(message_from_bytes, message);
    }

    #[test]
    fn handshake_message_rejects_foreign_protocol() {
        let mut raw = HandshakeMessage::new([0; 8], [1; 20], PeerId::random()).to_bytes();
        raw[1..20].copy_from_slice(b"BitTorrent protocoX");
        assert!(matches!(
            HandshakeMessage::from_bytes(raw),
            Err(ProtocolString(_))
        ));
    }

    #[test]
    fn request_message_layout() {
        let frame = Message::request(2, 0, 16384).serialize();
        assert_eq!(
            frame,
            vec![0, 0, 0, 13, 6, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 64, 0]
        );
    }

    #[test]
    fn read_keep_alive() {
        let mut cursor = Cursor::new(vec![0, 0, 0, 0]);
        assert!(matches!(
            read_incoming(&mut cursor),
            Ok(Incoming::KeepAlive)
        ));
    }

    #[test]
    fn read_unknown_message_id() {
        // A `have` message, which this client does not process.
        let mut cursor = Cursor::new(vec![0, 0, 0, 5, 4, 0, 0, 0, 9]);
        assert!(matches!(
            read_incoming(&mut cursor),
            Ok(Incoming::Unknown(4))
        ));
    }

    #[test]
    fn read_framed_message() {
        let mut cursor = Cursor::new(vec![0, 0, 0, 2, 5, 0b1010_0000]);
        match read_incoming(&mut cursor).unwrap() {
            Incoming::Frame(message) => {
                assert_eq!(message.kind, MessageKind::Bitfield);
                assert_eq!(message.payload, vec![0b1010_0000]);
            }
            _ => panic!("expected a framed message"),
        }
    }

    #[test]
    fn read_truncated_frame() {
        let mut cursor = Cursor::new(vec![0, 0, 0, 9, 7, 0]);
        assert!(matches!(
            read_incoming(&mut cursor),
            Err(ConnectionError::IoKind(_))
        ));
    }

    fn test_metadata(pieces: &[&[u8]], piece_length: u32) -> TorrentMetadata {
        let total_length = pieces.iter().map(|p| p.len() as u64).sum();
        TorrentMetadata {
            announce: Url::parse("http://tracker.local/announce").unwrap(),
            name: "out.bin".to_string(),
            total_length,
            piece_length,
            piece_hashes: pieces
                .iter()
                .map(|piece| Sha1Hasher::digest(piece).into())
                .collect(),
            info_hash: [0x21; 20],
            files: vec![FileEntry {
                path: PathBuf::from("out.bin"),
                length: total_length,
            }],
        }
    }

    /// Serves one scripted remote peer: handshake, bitfield, unchoke after
    /// interested, then answers whole-piece requests from `pieces`.
    pub(crate) fn spawn_scripted_peer(
        listener: TcpListener,
        info_hash: Sha1,
        bitfield: Vec<u8>,
        pieces: Vec<Vec<u8>>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();

            let mut handshake = [0u8; 68];
            stream.read_exact(&mut handshake).unwrap();
            let reply = HandshakeMessage::new([0; 8], info_hash, PeerId::random());
            stream.write_all(reply.to_bytes().as_ref()).unwrap();

            send_message(
                &mut stream,
                &Message {
                    kind: MessageKind::Bitfield,
                    payload: bitfield,
                },
            )
            .unwrap();

            // interested
            let mut interested = [0u8; 5];
            stream.read_exact(&mut interested).unwrap();
            assert_eq!(interested, [0, 0, 0, 1, 2]);
            send_message(&mut stream, &Message::new(MessageKind::Unchoke)).unwrap();

            let served: usize = pieces.iter().filter(|piece| !piece.is_empty()).count();
            for _ in 0..served {
                let mut request = [0u8; 17];
                stream.read_exact(&mut request).unwrap();
                let mut body = &request[5..];
                let index = body.get_u32();
                let begin = body.get_u32();
                let length = body.get_u32();
                assert_eq!(begin, 0);
                let piece = &pieces[index as usize];
                assert_eq!(length as usize, piece.len());

                let mut payload = Vec::with_capacity(8 + piece.len());
                payload.put_u32(index);
                payload.put_u32(0);
                payload.put_slice(piece);
                send_message(
                    &mut stream,
                    &Message {
                        kind: MessageKind::Piece,
                        payload,
                    },
                )
                .unwrap();
            }
        })
    }

    #[test]
    fn establish_and_download_from_scripted_peer() {
        let meta = test_metadata(&[b"ABCD" as &[u8], b"EFG"], 4);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let script = spawn_scripted_peer(
            listener,
            meta.info_hash,
            vec![0b1100_0000],
            vec![b"ABCD".to_vec(), b"EFG".to_vec()],
        );

        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(&meta, dir.path()).unwrap();

        let stream = TcpStream::connect(addr).unwrap();
        let mut connection =
            PeerConnection::establish(stream, &meta.info_hash, &PeerId::random(), 2).unwrap();
        assert!(connection.has_piece(0));
        assert!(connection.has_piece(1));
        assert!(!connection.has_piece(2));

        let work = [
            PieceWork {
                index: 1,
                length: 3,
            },
            PieceWork {
                index: 0,
                length: 4,
            },
        ];
        let received = connection.download_pieces(&work, &store).unwrap();
        let indices: Vec<u32> = received.iter().map(|piece| piece.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert!(store.is_complete());
        script.join().unwrap();
    }

    #[test]
    fn establish_rejects_foreign_info_hash() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let script = spawn_scripted_peer(listener, [0x77; 20], vec![0], vec![]);

        let stream = TcpStream::connect(addr).unwrap();
        let result = PeerConnection::establish(stream, &[0x21; 20], &PeerId::random(), 2);
        assert!(matches!(result, Err(ConnectionError::HandshakeFailed(_))));
        let _ = script.join();
    }

    #[test]
    fn download_skips_pieces_the_peer_does_not_have() {
        let meta = test_metadata(&[b"ABCD" as &[u8], b"EFG"], 4);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // Only piece 0 is advertised; piece 1 never gets served.
        let script = spawn_scripted_peer(
            listener,
            meta.info_hash,
            vec![0b1000_0000],
            vec![b"ABCD".to_vec(), Vec::new()],
        );

        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(&meta, dir.path()).unwrap();

        let stream = TcpStream::connect(addr).unwrap();
        let mut connection =
            PeerConnection::establish(stream, &meta.info_hash, &PeerId::random(), 2).unwrap();

        let work = [
            PieceWork {
                index: 0,
                length: 4,
            },
            PieceWork {
                index: 1,
                length: 3,
            },
        ];
        let received = connection.download_pieces(&work, &store).unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].index, 0);
        assert!(store.is_downloaded(0));
        assert!(!store.is_downloaded(1));
        script.join().unwrap();
    }
}
