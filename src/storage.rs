use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use crate::{
    conf::Conf,
    error::{Error, Result},
    piece_count, Bitfield, PeerId, PieceIndex,
};

/// Information about the shared file's on-disk layout: the piece geometry
/// and the path this peer reads it from or writes it to.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces the file is split into.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece, which may differ from the normal piece
    /// length if the file size is not an exact multiple of the piece length.
    pub last_piece_len: u32,
    /// The total length of the shared file.
    pub file_len: u64,
    /// Where the file lives: the shared file itself for a seed, or the
    /// peer's own `peer_<id>` download directory for a leech.
    pub path: PathBuf,
}

impl StorageInfo {
    pub fn new(conf: &Conf, peer_id: PeerId, is_seed: bool, root: &Path) -> Self {
        let piece_count = piece_count(conf.file_len, conf.piece_len);
        let last_piece_len =
            (conf.file_len - conf.piece_len as u64 * (piece_count - 1) as u64) as u32;
        let path = if is_seed {
            root.join(&conf.file_name)
        } else {
            root.join(format!("peer_{}", peer_id)).join(&conf.file_name)
        };
        Self {
            piece_count,
            piece_len: conf.piece_len,
            last_piece_len,
            file_len: conf.file_len,
            path,
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index >= self.piece_count {
            return Err(Error::InvalidPieceIndex(index));
        }
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else {
            Ok(self.piece_len)
        }
    }

    fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }
}

/// The peer's authoritative record of which pieces it holds and their bytes.
///
/// Pieces live in memory for serving requests and are mirrored to the file
/// with positioned writes as they arrive. There is exactly one store per
/// peer; concurrent access is serialized by the peer's lock.
pub(crate) struct PieceStore {
    info: StorageInfo,
    have: Bitfield,
    pieces: HashMap<PieceIndex, Vec<u8>>,
    file: File,
}

impl PieceStore {
    /// Creates the store of a peer that starts with the complete file,
    /// loading every piece into memory up front. A file shorter than the
    /// configured size is a fatal startup error.
    pub fn seed(info: StorageInfo) -> Result<Self> {
        let file = File::open(&info.path)?;
        let mut pieces = HashMap::with_capacity(info.piece_count);
        for index in 0..info.piece_count {
            let mut buf = vec![0; info.piece_len(index)? as usize];
            file.read_exact_at(&mut buf, info.piece_offset(index))?;
            pieces.insert(index, buf);
        }
        Ok(Self {
            have: Bitfield::repeat(true, info.piece_count),
            info,
            pieces,
            file,
        })
    }

    /// Creates the store of a peer that starts empty, setting up its
    /// `peer_<id>` download directory if it doesn't exist yet.
    pub fn leech(info: StorageInfo) -> Result<Self> {
        if let Some(dir) = info.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&info.path)?;
        Ok(Self {
            have: Bitfield::repeat(false, info.piece_count),
            pieces: HashMap::new(),
            info,
            file,
        })
    }

    pub fn info(&self) -> &StorageInfo {
        &self.info
    }

    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn is_complete(&self) -> bool {
        self.have.all()
    }

    /// Returns the bytes of a held piece, for answering a request.
    pub fn piece(&self, index: PieceIndex) -> Result<&[u8]> {
        self.pieces
            .get(&index)
            .map(Vec::as_slice)
            .ok_or(Error::PieceNotAvailable(index))
    }

    /// Records a received piece: validates it against the file layout,
    /// writes it to the file at its offset, and marks it held.
    ///
    /// Receiving a piece twice is allowed; the second copy overwrites the
    /// first.
    pub fn write_piece(&mut self, index: PieceIndex, data: Vec<u8>) -> Result<()> {
        let expected_len = self.info.piece_len(index)? as usize;
        if data.len() != expected_len {
            return Err(Error::InvalidPieceLen {
                index,
                len: data.len(),
            });
        }
        self.file.write_all_at(&data, self.info.piece_offset(index))?;
        self.pieces.insert(index, data);
        self.have.set(index, true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn test_conf(file_len: u64, piece_len: u32) -> Conf {
        Conf {
            preferred_neighbor_count: 2,
            unchoke_interval: Duration::from_secs(5),
            optimistic_unchoke_interval: Duration::from_secs(15),
            file_name: "shared.dat".to_string(),
            file_len,
            piece_len,
        }
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("pieceswarm-storage-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn geometry_with_ragged_tail() {
        let info = StorageInfo::new(&test_conf(10, 4), 1001, true, Path::new("."));
        assert_eq!(info.piece_count, 3);
        assert_eq!(info.piece_len(0).unwrap(), 4);
        assert_eq!(info.piece_len(1).unwrap(), 4);
        assert_eq!(info.piece_len(2).unwrap(), 2);
        assert!(info.piece_len(3).is_err());
    }

    #[test]
    fn seed_preloads_all_pieces() {
        let root = scratch_dir("seed");
        fs::write(root.join("shared.dat"), b"ABCDEFGHIJKLMNOP").unwrap();

        let info = StorageInfo::new(&test_conf(16, 4), 1001, true, &root);
        let store = PieceStore::seed(info).unwrap();

        assert!(store.is_complete());
        assert_eq!(store.piece(0).unwrap(), b"ABCD");
        assert_eq!(store.piece(3).unwrap(), b"MNOP");

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn leech_writes_pieces_at_their_offsets() {
        let root = scratch_dir("leech");

        let info = StorageInfo::new(&test_conf(10, 4), 1002, false, &root);
        let mut store = PieceStore::leech(info).unwrap();
        assert!(!store.is_complete());
        assert!(store.piece(0).is_err());

        // out of order, with a 2-byte tail written at offset 8
        store.write_piece(2, b"IJ".to_vec()).unwrap();
        store.write_piece(0, b"ABCD".to_vec()).unwrap();
        store.write_piece(1, b"EFGH".to_vec()).unwrap();

        assert!(store.is_complete());
        assert_eq!(
            fs::read(root.join("peer_1002").join("shared.dat")).unwrap(),
            b"ABCDEFGHIJ"
        );

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn have_tracks_stored_pieces() {
        let root = scratch_dir("have");

        let info = StorageInfo::new(&test_conf(10, 4), 1003, false, &root);
        let mut store = PieceStore::leech(info).unwrap();
        assert!(store.have().not_any());

        store.write_piece(1, b"EFGH".to_vec()).unwrap();
        assert!(store.have()[1]);
        assert!(!store.have()[0]);
        assert_eq!(store.piece(1).unwrap().len(), 4);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn rejects_invalid_pieces() {
        let root = scratch_dir("invalid");

        let info = StorageInfo::new(&test_conf(10, 4), 1004, false, &root);
        let mut store = PieceStore::leech(info).unwrap();

        // wrong length for the tail piece
        assert!(store.write_piece(2, b"IJKL".to_vec()).is_err());
        // index past the end of the file
        assert!(store.write_piece(3, b"ABCD".to_vec()).is_err());
        assert!(!store.have().any());

        let _ = fs::remove_dir_all(&root);
    }
}
