use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use log::debug;
use sha1::{Digest, Sha1 as Sha1Hasher};
use thiserror::Error;

use crate::storage::StorageError::OutOfRange;
use crate::torrent::TorrentMetadata;
use crate::util::{Bitfield, Sha1};

type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Piece index {index} out of range, torrent has {count} pieces")]
    OutOfRange { index: usize, count: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

struct FileSlot {
    file: File,
    /// Absolute offset of this file's first byte within the torrent.
    start: u64,
    length: u64,
}

struct StoreState {
    downloaded: Bitfield,
    files: Vec<FileSlot>,
}

/// Verified-piece persistence: owns the monotonic per-piece downloaded
/// bitset and the pre-allocated output files. All peer tasks share one
/// store; every mutating path runs under one coarse lock so overlapping
/// file writes never interleave and state reads never observe a partial
/// update.
pub struct PieceStore {
    piece_length: u64,
    piece_hashes: Vec<Sha1>,
    state: Mutex<StoreState>,
}

impl PieceStore {
    /// Creates every output file under `output_dir` at its full declared
    /// length before any piece arrives, failing fast on an unwritable path.
    pub fn new(meta: &TorrentMetadata, output_dir: &Path) -> Result<Self> {
        let mut files = Vec::with_capacity(meta.files.len());
        let mut start = 0u64;
        for entry in &meta.files {
            let path = output_dir.join(&entry.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            file.set_len(entry.length)?;
            files.push(FileSlot {
                file,
                start,
                length: entry.length,
            });
            start += entry.length;
        }
        Ok(Self {
            piece_length: u64::from(meta.piece_length),
            piece_hashes: meta.piece_hashes.clone(),
            state: Mutex::new(StoreState {
                downloaded: Bitfield::new(meta.piece_count()),
                files,
            }),
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn is_downloaded(&self, index: usize) -> bool {
        self.state.lock().unwrap().downloaded.get(index)
    }

    pub fn downloaded_count(&self) -> usize {
        self.state.lock().unwrap().downloaded.count_ones()
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded_count() == self.piece_count()
    }

    /// Percentage of verified pieces, recomputed from the live bit count.
    pub fn progress(&self) -> f64 {
        self.downloaded_count() as f64 / self.piece_count() as f64 * 100.0
    }

    /// Checks `data` against the expected piece hash and, on a match,
    /// writes it into every file region the piece's absolute byte range
    /// intersects. Returns `Ok(false)` on a hash mismatch without touching
    /// any state; a piece that is already downloaded returns `Ok(true)`
    /// without re-hashing or re-writing.
    pub fn write_and_verify(&self, index: usize, data: &[u8]) -> Result<bool> {
        if index >= self.piece_count() {
            return Err(OutOfRange {
                index,
                count: self.piece_count(),
            });
        }
        let mut state = self.state.lock().unwrap();
        if state.downloaded.get(index) {
            return Ok(true);
        }

        let digest: Sha1 = Sha1Hasher::digest(data).into();
        if digest != self.piece_hashes[index] {
            debug!(
                "piece {index}: digest {} does not match expected {}",
                hex::encode(digest),
                hex::encode(self.piece_hashes[index])
            );
            return Ok(false);
        }

        let piece_start = index as u64 * self.piece_length;
        let piece_end = piece_start + data.len() as u64;
        for slot in &mut state.files {
            let overlap_start = piece_start.max(slot.start);
            let overlap_end = piece_end.min(slot.start + slot.length);
            if overlap_start >= overlap_end {
                continue;
            }
            slot.file.seek(SeekFrom::Start(overlap_start - slot.start))?;
            slot.file.write_all(
                &data[(overlap_start - piece_start) as usize..(overlap_end - piece_start) as usize],
            )?;
        }
        state.downloaded.set(index);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use url::Url;

    use crate::torrent::FileEntry;

    use super::*;

    fn metadata(files: Vec<(&str, u64)>, pieces: &[&[u8]], piece_length: u32) -> TorrentMetadata {
        TorrentMetadata {
            announce: Url::parse("http://tracker.local/announce").unwrap(),
            name: "test".to_string(),
            total_length: files.iter().map(|(_, length)| length).sum(),
            piece_length,
            piece_hashes: pieces
                .iter()
                .map(|piece| Sha1Hasher::digest(piece).into())
                .collect(),
            info_hash: [0; 20],
            files: files
                .into_iter()
                .map(|(path, length)| FileEntry {
                    path: PathBuf::from(path),
                    length,
                })
                .collect(),
        }
    }

    #[test]
    fn rejects_piece_with_wrong_hash() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata(vec![("out.bin", 7)], &[b"ABCD" as &[u8], b"EFG"], 4);
        let store = PieceStore::new(&meta, dir.path()).unwrap();

        assert_eq!(store.write_and_verify(0, b"XXXX").unwrap(), false);
        assert!(!store.is_downloaded(0));
        assert_eq!(store.downloaded_count(), 0);
    }

    #[test]
    fn accepts_piece_with_matching_hash() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata(vec![("out.bin", 7)], &[b"ABCD" as &[u8], b"EFG"], 4);
        let store = PieceStore::new(&meta, dir.path()).unwrap();

        assert_eq!(store.write_and_verify(0, b"ABCD").unwrap(), true);
        assert!(store.is_downloaded(0));
        assert!(!store.is_complete());

        assert_eq!(store.write_and_verify(1, b"EFG").unwrap(), true);
        assert!(store.is_complete());
        assert_eq!(
            fs::read(dir.path().join("out.bin")).unwrap(),
            b"ABCDEFG".to_vec()
        );
    }

    #[test]
    fn write_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata(vec![("out.bin", 7)], &[b"ABCD" as &[u8], b"EFG"], 4);
        let store = PieceStore::new(&meta, dir.path()).unwrap();

        assert_eq!(store.write_and_verify(0, b"ABCD").unwrap(), true);
        assert_eq!(store.write_and_verify(0, b"ABCD").unwrap(), true);
        assert_eq!(store.downloaded_count(), 1);
        let mut on_disk = fs::read(dir.path().join("out.bin")).unwrap();
        on_disk.truncate(4);
        assert_eq!(on_disk, b"ABCD".to_vec());
    }

    #[test]
    fn out_of_range_index() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata(vec![("out.bin", 7)], &[b"ABCD" as &[u8], b"EFG"], 4);
        let store = PieceStore::new(&meta, dir.path()).unwrap();

        assert!(matches!(
            store.write_and_verify(2, b"ABCD"),
            Err(StorageError::OutOfRange { index: 2, count: 2 })
        ));
    }

    #[test]
    fn piece_straddling_two_files() {
        let dir = tempfile::tempdir().unwrap();
        // Files of 3 and 5 bytes; piece 0 covers a.bin and two bytes of
        // b.bin, piece 1 covers the rest of b.bin.
        let meta = metadata(
            vec![("a.bin", 3), ("b.bin", 5)],
            &[b"ABCDE" as &[u8], b"FGH"],
            5,
        );
        let store = PieceStore::new(&meta, dir.path()).unwrap();

        assert_eq!(store.write_and_verify(0, b"ABCDE").unwrap(), true);
        assert_eq!(store.write_and_verify(1, b"FGH").unwrap(), true);
        assert!(store.is_complete());
        assert_eq!(fs::read(dir.path().join("a.bin")).unwrap(), b"ABC".to_vec());
        assert_eq!(
            fs::read(dir.path().join("b.bin")).unwrap(),
            b"DEFGH".to_vec()
        );
    }

    #[test]
    fn files_are_preallocated() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata(
            vec![("album/a.bin", 3), ("album/b/c.bin", 5)],
            &[b"ABCDE" as &[u8], b"FGH"],
            5,
        );
        let _store = PieceStore::new(&meta, dir.path()).unwrap();
        assert_eq!(
            fs::metadata(dir.path().join("album/a.bin")).unwrap().len(),
            3
        );
        assert_eq!(
            fs::metadata(dir.path().join("album/b/c.bin")).unwrap().len(),
            5
        );
    }

    #[test]
    fn unwritable_output_path_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata(vec![("out.bin", 7)], &[b"ABCD" as &[u8], b"EFG"], 4);
        // The parent of the output path is a regular file.
        let blocked = dir.path().join("blocked");
        fs::write(&blocked, b"x").unwrap();
        assert!(matches!(
            PieceStore::new(&meta, &blocked),
            Err(StorageError::Io(_))
        ));
    }

    #[test]
    fn progress_tracks_bit_count() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata(vec![("out.bin", 7)], &[b"ABCD" as &[u8], b"EFG"], 4);
        let store = PieceStore::new(&meta, dir.path()).unwrap();

        assert_eq!(store.progress(), 0.0);
        store.write_and_verify(0, b"ABCD").unwrap();
        assert_eq!(store.progress(), 50.0);
        store.write_and_verify(1, b"EFG").unwrap();
        assert_eq!(store.progress(), 100.0);
    }
}
