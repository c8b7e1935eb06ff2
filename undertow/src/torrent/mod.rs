use std::path::PathBuf;

use sha1::{Digest, Sha1 as Sha1Hasher};
use thiserror::Error;
use url::Url;

use bencode::{BencodeDict, BencodeInt, BencodeList, BencodeString, Document};

use crate::torrent::TorrentError::{InvalidField, InvalidPiecesLength, MissingField};
use crate::util::Sha1;

type Result<T> = std::result::Result<T, TorrentError>;

#[derive(Error, Debug)]
pub enum TorrentError {
    #[error("Bencode error: {0}")]
    Bencode(#[from] bencode::BencodeError),
    #[error("Url error: {0}")]
    Url(#[from] url::ParseError),
    #[error("Missing field: {0}")]
    MissingField(String),
    #[error("Invalid field: {0}")]
    InvalidField(String),
    #[error("Pieces buffer of {0} bytes is not a positive multiple of 20")]
    InvalidPiecesLength(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

/// Immutable description of one torrent, built once from the raw metadata
/// buffer before any network activity starts.
#[derive(Debug)]
pub struct TorrentMetadata {
    pub announce: Url,
    pub name: String,
    pub total_length: u64,
    pub piece_length: u32,
    pub piece_hashes: Vec<Sha1>,
    pub info_hash: Sha1,
    pub files: Vec<FileEntry>,
}

macro_rules! bss {
    ($bytes:expr) => {
        $bytes.as_slice()
    };
}

impl TorrentMetadata {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let document = Document::parse(data)?;
        // Hash the verbatim info bytes; the decoded tree is not byte-stable.
        let info_hash: Sha1 = Sha1Hasher::digest(document.info_slice()?).into();

        let mut root: BencodeDict = document.into_value().try_into()?;
        let announce = Url::parse(&String::try_from(
            root.remove(bss!(b"announce"))
                .ok_or_else(|| MissingField("announce".to_string()))?,
        )?)?;
        let mut info: BencodeDict = root
            .remove(bss!(b"info"))
            .ok_or_else(|| MissingField("info".to_string()))?
            .try_into()?;

        let name = String::try_from(
            info.remove(bss!(b"name"))
                .ok_or_else(|| MissingField("info.name".to_string()))?,
        )?;

        let piece_length: BencodeInt = info
            .remove(bss!(b"piece length"))
            .ok_or_else(|| MissingField("info.piece length".to_string()))?
            .try_into()?;
        if piece_length <= 0 {
            return Err(InvalidField(format!(
                "piece length must be positive, got {piece_length}"
            )));
        }
        let piece_length = u32::try_from(piece_length)
            .map_err(|_| InvalidField(format!("piece length {piece_length} overflows u32")))?;

        let pieces: BencodeString = info
            .remove(bss!(b"pieces"))
            .ok_or_else(|| MissingField("info.pieces".to_string()))?
            .try_into()?;
        if pieces.is_empty() || pieces.len() % 20 != 0 {
            return Err(InvalidPiecesLength(pieces.len()));
        }
        let piece_hashes = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash: Sha1 = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = match (info.remove(bss!(b"length")), info.remove(bss!(b"files"))) {
            (Some(length), None) => {
                // Single file mode
                vec![FileEntry {
                    path: PathBuf::from(&name),
                    length: parse_length(length.try_into()?)?,
                }]
            }
            (None, Some(files)) => {
                // Multi file mode, entries nested under the torrent name
                let files: BencodeList = files.try_into()?;
                if files.is_empty() {
                    return Err(InvalidField("files list is empty".to_string()));
                }
                files
                    .into_iter()
                    .map(|file| FileEntry::from_bencode(file.try_into()?, &name))
                    .collect::<Result<_>>()?
            }
            (Some(_), Some(_)) => {
                return Err(InvalidField(
                    "both 'length' and 'files' present".to_string(),
                ))
            }
            (None, None) => return Err(MissingField("info.length or info.files".to_string())),
        };
        let total_length = files.iter().map(|file| file.length).sum();

        Ok(TorrentMetadata {
            announce,
            name,
            total_length,
            piece_length,
            piece_hashes,
            info_hash,
            files,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn piece_hash(&self, index: usize) -> &Sha1 {
        &self.piece_hashes[index]
    }

    /// Logical size of a piece: `piece_length` everywhere except the final
    /// piece, which covers the remainder of `total_length` when that is not
    /// itself a full piece.
    pub fn piece_size(&self, index: usize) -> usize {
        if index + 1 == self.piece_count() {
            let remainder = self.total_length % u64::from(self.piece_length);
            if remainder != 0 {
                return remainder as usize;
            }
        }
        self.piece_length as usize
    }
}

impl FileEntry {
    fn from_bencode(mut dict: BencodeDict, torrent_name: &str) -> Result<Self> {
        let length = parse_length(
            dict.remove(bss!(b"length"))
                .ok_or_else(|| MissingField("files.length".to_string()))?
                .try_into()?,
        )?;
        let segments: BencodeList = dict
            .remove(bss!(b"path"))
            .ok_or_else(|| MissingField("files.path".to_string()))?
            .try_into()?;
        if segments.is_empty() {
            return Err(InvalidField("file path has no segments".to_string()));
        }
        let mut path = PathBuf::from(torrent_name);
        for segment in segments {
            path.push(String::try_from(segment)?);
        }
        Ok(FileEntry { path, length })
    }
}

fn parse_length(length: BencodeInt) -> Result<u64> {
    u64::try_from(length).map_err(|_| InvalidField(format!("negative file length {length}")))
}
