use std::path::{Component, Path, PathBuf};

use super::error::StorageError;
use crate::metainfo::FileSpec;

/// A file on disk as storage sees it.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    /// Position in the torrent's contiguous byte space.
    pub offset: u64,
    /// Merkle root of the file (v2/hybrid).
    pub pieces_root: Option<[u8; 32]>,
    /// BEP-47 padding: occupies byte space, never touches disk.
    pub is_padding: bool,
}

impl FileEntry {
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.offset + self.length
    }
}

impl From<&FileSpec> for FileEntry {
    fn from(spec: &FileSpec) -> Self {
        Self {
            path: spec.path.clone(),
            length: spec.length,
            offset: spec.offset,
            pieces_root: spec.pieces_root,
            is_padding: spec.is_padding(),
        }
    }
}

/// One contiguous region of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

/// Rejects absolute paths and parent-directory components before any
/// file is created under the download directory.
pub(crate) fn validate_paths(files: &[FileEntry]) -> Result<(), StorageError> {
    for file in files {
        for component in file.path.components() {
            match component {
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::PathTraversal(
                        file.path.display().to_string(),
                    ));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Walks the files overlapping `[start, start + length)` in the
/// torrent's global byte space. Used for v1 pieces, which may span
/// files (padding files included; the writer skips them).
pub(crate) fn global_spans(files: &[FileEntry], start: u64, length: u64) -> Vec<FileSpan> {
    let mut spans = Vec::new();
    let mut cursor = start;
    let mut remaining = length;

    for (file_index, file) in files.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        if !file.contains(cursor) {
            continue;
        }

        let file_offset = cursor - file.offset;
        let available = file.length - file_offset;
        let take = remaining.min(available);

        spans.push(FileSpan {
            file_index,
            file_offset,
            length: take,
        });
        cursor += take;
        remaining -= take;
    }

    spans
}

/// Maps between global piece indices and per-file piece numbering for
/// v2 torrents, where every piece belongs to exactly one file.
#[derive(Debug, Clone)]
pub struct V2PieceMap {
    /// (file index, first global piece, piece count), data files only.
    ranges: Vec<(usize, u32, u32)>,
    piece_length: u64,
    total_pieces: u32,
}

impl V2PieceMap {
    pub fn new(files: &[FileEntry], piece_length: u64) -> Self {
        let mut ranges = Vec::new();
        let mut next_piece = 0u32;

        for (file_index, file) in files.iter().enumerate() {
            if file.is_padding || file.length == 0 {
                continue;
            }
            let count = file.length.div_ceil(piece_length) as u32;
            ranges.push((file_index, next_piece, count));
            next_piece += count;
        }

        Self {
            ranges,
            piece_length,
            total_pieces: next_piece,
        }
    }

    pub fn total_pieces(&self) -> u32 {
        self.total_pieces
    }

    /// (file index, first global piece, piece count) per data file.
    pub fn ranges(&self) -> &[(usize, u32, u32)] {
        &self.ranges
    }

    /// Global piece index to (file index, file-local piece index).
    pub fn locate(&self, piece: u32) -> Option<(usize, u32)> {
        self.ranges
            .iter()
            .find(|&&(_, first, count)| piece >= first && piece < first + count)
            .map(|&(file_index, first, _)| (file_index, piece - first))
    }

    /// The single span a v2 piece occupies, `None` on a bad index.
    pub fn piece_span(&self, files: &[FileEntry], piece: u32) -> Option<FileSpan> {
        let (file_index, local) = self.locate(piece)?;
        let file = files.get(file_index)?;

        let file_offset = local as u64 * self.piece_length;
        let length = (file.length - file_offset).min(self.piece_length);

        Some(FileSpan {
            file_index,
            file_offset,
            length,
        })
    }
}

#[cfg(test)]
mod unit {
    use super::*;

    fn entry(offset: u64, length: u64, padding: bool) -> FileEntry {
        FileEntry {
            path: PathBuf::from(format!("f{offset}")),
            length,
            offset,
            pieces_root: None,
            is_padding: padding,
        }
    }

    #[test]
    fn spans_cross_file_boundaries() {
        let files = vec![entry(0, 700, false), entry(700, 300, true), entry(1000, 500, false)];

        let spans = global_spans(&files, 600, 500);
        assert_eq!(
            spans,
            vec![
                FileSpan { file_index: 0, file_offset: 600, length: 100 },
                FileSpan { file_index: 1, file_offset: 0, length: 300 },
                FileSpan { file_index: 2, file_offset: 0, length: 100 },
            ]
        );
    }

    #[test]
    fn v2_map_skips_padding() {
        let files = vec![entry(0, 40_000, false), entry(40_000, 9_152, true), entry(49_152, 20_000, false)];
        let map = V2PieceMap::new(&files, 16_384);

        // 3 pieces for the first file, 2 for the last, none for padding
        assert_eq!(map.total_pieces(), 5);
        assert_eq!(map.locate(0), Some((0, 0)));
        assert_eq!(map.locate(2), Some((0, 2)));
        assert_eq!(map.locate(3), Some((2, 0)));
        assert_eq!(map.locate(5), None);

        let span = map.piece_span(&files, 2).unwrap();
        assert_eq!(span.length, 40_000 - 2 * 16_384);
        let span = map.piece_span(&files, 4).unwrap();
        assert_eq!(span.file_offset, 16_384);
        assert_eq!(span.length, 20_000 - 16_384);
    }

    #[test]
    fn traversal_is_rejected() {
        let bad = FileEntry {
            path: PathBuf::from("../escape"),
            length: 1,
            offset: 0,
            pieces_root: None,
            is_padding: false,
        };
        assert!(validate_paths(&[bad]).is_err());
    }
}
