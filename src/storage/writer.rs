use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace};

use super::error::StorageError;
use super::file::{global_spans, validate_paths, FileEntry, FileSpan, V2PieceMap};
use crate::metainfo::{verify_proof, PieceLayerCache, TorrentInfo};

/// Which hash view verifies pieces for this torrent, fixed at
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    V1,
    V2,
    /// Both views verify every piece; disagreement is fatal.
    Hybrid,
}

/// Result of a verify-and-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Verified and persisted.
    Written,
    /// The piece was already on disk; nothing touched.
    Duplicate,
    /// The hash check failed; the piece must be downloaded again and
    /// the contributing peer debited.
    HashMismatch,
}

/// Everything needed to check one piece against its file's merkle root.
#[derive(Debug, Clone)]
struct V2Proof {
    pieces_root: [u8; 32],
    /// Piece index within its file.
    local_index: u32,
    uncles: Vec<[u8; 32]>,
}

/// Writes verified pieces to their file regions.
///
/// Hashing runs on the blocking pool; file I/O is async and writes to
/// disjoint files proceed concurrently. A piece is written at most
/// once, and only after its hash checks out.
pub struct StorageWriter {
    base_dir: PathBuf,
    files: Vec<FileEntry>,
    piece_length: u64,
    piece_sizes: Vec<u32>,
    hash_kind: HashKind,
    v1_pieces: Option<Arc<Vec<[u8; 20]>>>,
    v2_proofs: Option<Arc<Vec<V2Proof>>>,
    v2_map: Option<V2PieceMap>,
    handles: DashMap<usize, Arc<tokio::sync::Mutex<File>>>,
    written: Mutex<HashSet<u32>>,
}

impl StorageWriter {
    /// Builds the writer for a parsed torrent.
    ///
    /// For v2 and hybrid torrents the per-piece merkle proofs are
    /// materialized up front from the piece-layer cache, so the verify
    /// path never touches the cache again.
    pub fn new(
        base_dir: PathBuf,
        torrent: &TorrentInfo,
        layer_cache: &PieceLayerCache,
    ) -> Result<Self, StorageError> {
        let files: Vec<FileEntry> = torrent.files.iter().map(FileEntry::from).collect();
        validate_paths(&files)?;

        let piece_count = torrent.piece_count();
        let piece_sizes: Vec<u32> = (0..piece_count)
            .map(|piece| torrent.piece_size(piece) as u32)
            .collect();

        let v1_pieces = torrent.v1_pieces.clone().map(Arc::new);

        let has_v2 = torrent.piece_layers.is_some();
        let hash_kind = match (v1_pieces.is_some(), has_v2) {
            (true, true) => HashKind::Hybrid,
            (false, true) => HashKind::V2,
            _ => HashKind::V1,
        };

        let (v2_map, v2_proofs) = if has_v2 {
            let map = V2PieceMap::new(&files, torrent.piece_length);
            let proofs = build_proofs(&map, &files, torrent, layer_cache)?;
            (Some(map), Some(Arc::new(proofs)))
        } else {
            (None, None)
        };

        Ok(Self {
            base_dir,
            files,
            piece_length: torrent.piece_length,
            piece_sizes,
            hash_kind,
            v1_pieces,
            v2_proofs,
            v2_map,
            handles: DashMap::new(),
            written: Mutex::new(HashSet::new()),
        })
    }

    pub fn hash_kind(&self) -> HashKind {
        self.hash_kind
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_sizes.len() as u32
    }

    pub fn piece_size(&self, piece: u32) -> Option<u32> {
        self.piece_sizes.get(piece as usize).copied()
    }

    pub fn written_count(&self) -> usize {
        self.written.lock().len()
    }

    /// Creates every data file, sized to its final length.
    pub async fn preallocate(&self) -> Result<(), StorageError> {
        for (file_index, file) in self.files.iter().enumerate() {
            if file.is_padding {
                continue;
            }
            let handle = self.open(file_index).await?;
            let file_lock = handle.lock().await;
            file_lock.set_len(self.files[file_index].length).await?;
        }
        Ok(())
    }

    /// Checks which pieces already sit on disk, marking the valid ones
    /// as written. The on-disk files are the only resume state there
    /// is; a piece that fails to read or verify is simply missing.
    pub async fn scan_existing(&self) -> Vec<u32> {
        let mut have = Vec::new();

        for piece in 0..self.piece_count() {
            let Ok(data) = self.read_existing_piece(piece).await else {
                continue;
            };
            if self.verify(piece, data).await.unwrap_or(false) {
                self.written.lock().insert(piece);
                have.push(piece);
            }
        }

        if !have.is_empty() {
            debug!(pieces = have.len(), "found verified pieces on disk");
        }
        have
    }

    /// Like [`Self::read_piece`], but never creates missing files.
    async fn read_existing_piece(&self, piece: u32) -> Result<Bytes, StorageError> {
        let spans = self.piece_spans(piece)?;
        let mut out = Vec::new();

        for span in spans {
            if self.files[span.file_index].is_padding {
                out.extend(std::iter::repeat_n(0u8, span.length as usize));
                continue;
            }

            let path = self.base_dir.join(&self.files[span.file_index].path);
            let mut file = File::open(&path).await?;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let mut buf = vec![0u8; span.length as usize];
            file.read_exact(&mut buf).await?;
            out.extend_from_slice(&buf);
        }

        Ok(Bytes::from(out))
    }

    /// Verifies a piece off-thread, then writes it.
    ///
    /// `HashMismatch` is a recoverable outcome, not an error: the
    /// caller resets the piece and debits the peer. A hybrid torrent
    /// whose two views disagree fails with
    /// [`StorageError::HybridMismatch`] instead, and nothing reaches
    /// the disk either way.
    pub async fn verify_and_write(
        &self,
        piece: u32,
        data: Bytes,
    ) -> Result<VerifyOutcome, StorageError> {
        let expected = self
            .piece_size(piece)
            .ok_or(StorageError::InvalidPieceIndex(piece))?;
        if data.len() != expected as usize {
            return Err(StorageError::InvalidPieceIndex(piece));
        }

        if self.written.lock().contains(&piece) {
            return Ok(VerifyOutcome::Duplicate);
        }

        if !self.verify(piece, data.clone()).await? {
            debug!(piece, "piece failed hash verification");
            return Ok(VerifyOutcome::HashMismatch);
        }

        // claim the piece before touching the disk
        if !self.written.lock().insert(piece) {
            return Ok(VerifyOutcome::Duplicate);
        }

        self.write_piece(piece, &data).await?;
        trace!(piece, "piece written");
        Ok(VerifyOutcome::Written)
    }

    async fn verify(&self, piece: u32, data: Bytes) -> Result<bool, StorageError> {
        let kind = self.hash_kind;
        let v1 = self.v1_pieces.clone();
        let proofs = self.v2_proofs.clone();
        let piece_length = self.piece_length;
        let index = piece as usize;

        let verdict = tokio::task::spawn_blocking(move || -> Result<bool, StorageError> {
            let v1_ok = v1
                .as_ref()
                .and_then(|pieces| pieces.get(index))
                .map(|expected| Sha1::digest(&data).as_slice() == expected.as_slice());

            let v2_ok = proofs
                .as_ref()
                .and_then(|proofs| proofs.get(index))
                .map(|proof| {
                    verify_proof(
                        &data,
                        proof.local_index,
                        piece_length,
                        &proof.uncles,
                        &proof.pieces_root,
                    )
                });

            match kind {
                HashKind::V1 => v1_ok.ok_or(StorageError::InvalidPieceIndex(piece)),
                HashKind::V2 => v2_ok.ok_or(StorageError::MissingMerkleData(piece)),
                HashKind::Hybrid => match (v1_ok, v2_ok) {
                    (Some(a), Some(b)) if a != b => Err(StorageError::HybridMismatch(piece)),
                    (Some(a), Some(b)) => Ok(a && b),
                    _ => Err(StorageError::MissingMerkleData(piece)),
                },
            }
        })
        .await
        .map_err(|_| StorageError::WorkerFailed)?;

        verdict
    }

    /// File regions a whole piece occupies.
    fn piece_spans(&self, piece: u32) -> Result<Vec<FileSpan>, StorageError> {
        let size = self
            .piece_size(piece)
            .ok_or(StorageError::InvalidPieceIndex(piece))? as u64;

        // hybrid torrents use the global layout: padding keeps it
        // aligned with the per-file v2 numbering
        if self.v1_pieces.is_some() {
            let start = piece as u64 * self.piece_length;
            return Ok(global_spans(&self.files, start, size));
        }

        let map = self
            .v2_map
            .as_ref()
            .ok_or(StorageError::InvalidPieceIndex(piece))?;
        map.piece_span(&self.files, piece)
            .map(|span| vec![span])
            .ok_or(StorageError::InvalidPieceIndex(piece))
    }

    async fn write_piece(&self, piece: u32, data: &[u8]) -> Result<(), StorageError> {
        let spans = self.piece_spans(piece)?;
        let mut cursor = 0usize;

        for span in spans {
            let chunk = &data[cursor..cursor + span.length as usize];
            cursor += span.length as usize;

            // padding bytes are zero by construction and never stored
            if self.files[span.file_index].is_padding {
                continue;
            }

            let handle = self.open(span.file_index).await?;
            let mut file = handle.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;
            file.write_all(chunk).await?;
        }

        Ok(())
    }

    /// Reads one block for upload. Padding regions read back as zeros.
    pub async fn read_block(
        &self,
        piece: u32,
        begin: u32,
        length: u32,
    ) -> Result<Bytes, StorageError> {
        let size = self
            .piece_size(piece)
            .ok_or(StorageError::InvalidPieceIndex(piece))?;
        if begin as u64 + length as u64 > size as u64 {
            return Err(StorageError::InvalidBlockRange {
                piece,
                offset: begin,
            });
        }

        let spans = if self.v1_pieces.is_some() {
            let start = piece as u64 * self.piece_length + begin as u64;
            global_spans(&self.files, start, length as u64)
        } else {
            let map = self
                .v2_map
                .as_ref()
                .ok_or(StorageError::InvalidPieceIndex(piece))?;
            let span = map
                .piece_span(&self.files, piece)
                .ok_or(StorageError::InvalidPieceIndex(piece))?;
            vec![FileSpan {
                file_index: span.file_index,
                file_offset: span.file_offset + begin as u64,
                length: length as u64,
            }]
        };

        let mut out = Vec::with_capacity(length as usize);
        for span in spans {
            if self.files[span.file_index].is_padding {
                out.extend(std::iter::repeat_n(0u8, span.length as usize));
                continue;
            }

            let handle = self.open(span.file_index).await?;
            let mut file = handle.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let mut buf = vec![0u8; span.length as usize];
            file.read_exact(&mut buf).await?;
            out.extend_from_slice(&buf);
        }

        Ok(Bytes::from(out))
    }

    /// Reads a whole piece back, e.g. to serve uploads.
    pub async fn read_piece(&self, piece: u32) -> Result<Bytes, StorageError> {
        let size = self
            .piece_size(piece)
            .ok_or(StorageError::InvalidPieceIndex(piece))?;
        self.read_block(piece, 0, size).await
    }

    async fn open(&self, file_index: usize) -> Result<Arc<tokio::sync::Mutex<File>>, StorageError> {
        if let Some(handle) = self.handles.get(&file_index) {
            return Ok(handle.clone());
        }

        let path = self.base_dir.join(&self.files[file_index].path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;

        let handle = Arc::new(tokio::sync::Mutex::new(file));
        self.handles.insert(file_index, handle.clone());
        Ok(handle)
    }
}

/// Materializes the merkle proof for every v2 piece.
fn build_proofs(
    map: &V2PieceMap,
    files: &[FileEntry],
    torrent: &TorrentInfo,
    layer_cache: &PieceLayerCache,
) -> Result<Vec<V2Proof>, StorageError> {
    let mut proofs = Vec::with_capacity(map.total_pieces() as usize);

    for &(file_index, first, count) in map.ranges() {
        let file = &files[file_index];
        let pieces_root = file
            .pieces_root
            .ok_or(StorageError::MissingMerkleData(first))?;

        if count == 1 {
            // a file no longer than one piece has no layer entry: its
            // pieces root is the piece hash itself
            proofs.push(V2Proof {
                pieces_root,
                local_index: 0,
                uncles: Vec::new(),
            });
            continue;
        }

        let layer = torrent
            .piece_layers
            .as_ref()
            .and_then(|layers| layers.get(&file.path))
            .ok_or(StorageError::MissingMerkleData(first))?;

        let tree =
            layer_cache.get_or_build(&file.path, layer, torrent.piece_length, &pieces_root)?;

        for local in 0..count {
            let uncles = tree
                .proof(0, local as usize)
                .ok_or(StorageError::MissingMerkleData(first + local))?;
            proofs.push(V2Proof {
                pieces_root,
                local_index: local,
                uncles,
            });
        }
    }

    Ok(proofs)
}
