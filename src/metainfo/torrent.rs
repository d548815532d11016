use std::collections::HashMap;
use std::path::PathBuf;

use bytes::Bytes;

use super::error::MetainfoError;
use super::file_tree::FileTree;
use super::info_hash::InfoHash;
use crate::bencode::{decode, encode, Value};
use crate::constants::BLOCK_LEN;

/// One file of a torrent, in layout order.
///
/// `offset` is the file's position in the torrent's contiguous byte space,
/// which is what v1 piece hashes cover. BEP-47 padding files occupy that
/// space but are never created on disk.
#[derive(Debug, Clone)]
pub struct FileSpec {
    /// Path relative to the download directory, torrent name included.
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
    /// Merkle root of the file (v2/hybrid torrents).
    pub pieces_root: Option<[u8; 32]>,
    /// BEP-47 attribute string ("p" padding, "x" executable, "h" hidden).
    pub attr: Option<String>,
    /// BEP-47 symlink target, if the entry is a symlink.
    pub symlink_path: Option<Vec<String>>,
    /// BEP-47 whole-file SHA-1, when the torrent carries one.
    pub sha1: Option<[u8; 20]>,
}

impl FileSpec {
    pub fn is_padding(&self) -> bool {
        self.attr.as_deref().is_some_and(|a| a.contains('p'))
    }
}

/// Parsed torrent metadata, immutable after construction.
///
/// Hybrid torrents carry both the v1 flat piece hashes and the v2 per-file
/// merkle data side by side; which one drives verification is decided by
/// the storage layer at session construction.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub name: String,
    pub piece_length: u64,
    pub files: Vec<FileSpec>,
    /// Total bytes in piece space, padding included.
    pub total_length: u64,
    /// v1 flat SHA-1 piece hashes, when the torrent has a v1 view.
    pub v1_pieces: Option<Vec<[u8; 20]>>,
    /// v2 piece-layer strings keyed by file path, when the torrent has a
    /// v2 view. Files no longer than one piece have no entry; their
    /// `pieces_root` is the piece hash itself.
    pub piece_layers: Option<HashMap<PathBuf, Bytes>>,
    pub is_hybrid: bool,
    pub private: bool,
    pub info_hash_v1: Option<InfoHash>,
    pub info_hash_v2: Option<InfoHash>,
    pub announce: Option<String>,
    pub announce_list: Vec<Vec<String>>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
    raw_info: Bytes,
}

impl TorrentInfo {
    /// Parses a `.torrent` file.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let root = decode(data)?;
        let dict = root.as_dict().ok_or(MetainfoError::InvalidField("root"))?;

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingField("info"))?;
        let raw_info = Bytes::from(encode(info_value));

        let info = info_value
            .as_dict()
            .ok_or(MetainfoError::InvalidField("info"))?;

        let name = info
            .get(b"name".as_slice())
            .and_then(|v| v.as_str())
            .ok_or(MetainfoError::MissingField("name"))?
            .to_string();

        let piece_length = info
            .get(b"piece length".as_slice())
            .and_then(|v| v.as_int())
            .filter(|&l| l > 0)
            .ok_or(MetainfoError::MissingField("piece length"))? as u64;

        let meta_version = info.get(b"meta version".as_slice()).and_then(|v| v.as_int());
        if let Some(version) = meta_version {
            if version != 2 {
                return Err(MetainfoError::UnsupportedVersion(version));
            }
        }

        let has_v2 = meta_version == Some(2) && info.contains_key(b"file tree".as_slice());
        let has_v1 = info.contains_key(b"pieces".as_slice());

        if !has_v1 && !has_v2 {
            return Err(MetainfoError::MissingField("pieces or file tree"));
        }

        if has_v2 && (piece_length < BLOCK_LEN as u64 || !piece_length.is_power_of_two()) {
            return Err(MetainfoError::InvalidPieceLength(piece_length));
        }

        let v1_pieces = if has_v1 {
            Some(parse_v1_pieces(info.get(b"pieces".as_slice()).expect("checked"))?)
        } else {
            None
        };

        let files = if has_v2 {
            let tree_value = info
                .get(b"file tree".as_slice())
                .ok_or(MetainfoError::MissingField("file tree"))?;
            flatten_v2_files(&name, FileTree::from_bencode(tree_value)?)
        } else {
            parse_v1_files(&name, info)?
        };

        if files.is_empty() {
            return Err(MetainfoError::MissingField("length or files"));
        }

        let total_length: u64 = files.iter().map(|f| f.length).sum();

        let piece_layers = if has_v2 {
            Some(parse_piece_layers(&name, dict.get(b"piece layers".as_slice()))?)
        } else {
            None
        };

        let is_hybrid = has_v1 && has_v2;
        if is_hybrid {
            let v1_count = v1_pieces.as_ref().expect("v1 present").len() as u64;
            let v2_count: u64 = files
                .iter()
                .filter(|f| !f.is_padding() && f.length > 0)
                .map(|f| f.length.div_ceil(piece_length))
                .sum();
            if v1_count != v2_count {
                return Err(MetainfoError::HybridMismatch("piece counts"));
            }
        }

        let private = info
            .get(b"private".as_slice())
            .and_then(|v| v.as_int())
            .is_some_and(|v| v == 1);

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        let announce_list = dict
            .get(b"announce-list".as_slice())
            .and_then(|v| v.as_list())
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| {
                        tier.as_list().map(|urls| {
                            urls.iter()
                                .filter_map(|u| u.as_str().map(String::from))
                                .collect()
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let comment = dict
            .get(b"comment".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);
        let created_by = dict
            .get(b"created by".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);
        let creation_date = dict
            .get(b"creation date".as_slice())
            .and_then(|v| v.as_int());

        Ok(Self {
            name,
            piece_length,
            files,
            total_length,
            info_hash_v1: has_v1.then(|| InfoHash::v1_from_info(&raw_info)),
            info_hash_v2: has_v2.then(|| InfoHash::v2_from_info(&raw_info)),
            v1_pieces,
            piece_layers,
            is_hybrid,
            private,
            announce,
            announce_list,
            comment,
            created_by,
            creation_date,
            raw_info,
        })
    }

    /// The identity used on the wire: v1 hash when present, truncated v2
    /// hash otherwise.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash_v1
            .or(self.info_hash_v2)
            .expect("a torrent has at least one info hash")
    }

    /// Number of pieces in the torrent.
    ///
    /// For v2-only torrents this is the per-file piece count summed in
    /// file order, which is also the global piece numbering the engine
    /// uses.
    pub fn piece_count(&self) -> u32 {
        if let Some(pieces) = &self.v1_pieces {
            return pieces.len() as u32;
        }
        self.files
            .iter()
            .filter(|f| !f.is_padding() && f.length > 0)
            .map(|f| f.length.div_ceil(self.piece_length) as u32)
            .sum()
    }

    /// Length of piece `index` in the torrent's global layout.
    pub fn piece_size(&self, index: u32) -> u64 {
        if self.v1_pieces.is_some() {
            let start = index as u64 * self.piece_length;
            return self.piece_length.min(self.total_length.saturating_sub(start));
        }
        // v2: the last piece of each file may be short
        let mut remaining = index;
        for file in self.files.iter().filter(|f| !f.is_padding() && f.length > 0) {
            let count = file.length.div_ceil(self.piece_length) as u32;
            if remaining < count {
                let offset = remaining as u64 * self.piece_length;
                return self.piece_length.min(file.length - offset);
            }
            remaining -= count;
        }
        0
    }

    /// The raw bencoded info dictionary, e.g. for metadata exchange.
    pub fn raw_info(&self) -> &Bytes {
        &self.raw_info
    }

    /// All tracker URLs, primary first, deduplicated.
    pub fn trackers(&self) -> Vec<String> {
        let mut urls = Vec::new();
        if let Some(announce) = &self.announce {
            urls.push(announce.clone());
        }
        for tier in &self.announce_list {
            for url in tier {
                if !urls.contains(url) {
                    urls.push(url.clone());
                }
            }
        }
        urls
    }

    /// Re-encodes the torrent to canonical bencode.
    ///
    /// The info dictionary is emitted byte-for-byte as parsed, so info
    /// hashes survive a parse/encode round trip.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MetainfoError> {
        let mut root = Value::dict();

        if let Some(announce) = &self.announce {
            root.insert("announce", Value::string(announce));
        }
        if !self.announce_list.is_empty() {
            let tiers = self
                .announce_list
                .iter()
                .map(|tier| Value::List(tier.iter().map(|u| Value::string(u)).collect()))
                .collect();
            root.insert("announce-list", Value::List(tiers));
        }
        if let Some(comment) = &self.comment {
            root.insert("comment", Value::string(comment));
        }
        if let Some(created_by) = &self.created_by {
            root.insert("created by", Value::string(created_by));
        }
        if let Some(date) = self.creation_date {
            root.insert("creation date", Value::Integer(date));
        }
        root.insert("info", decode(&self.raw_info)?);

        if let Some(layers) = &self.piece_layers {
            let mut dict = Value::dict();
            for (path, hashes) in layers {
                let key = path
                    .components()
                    .skip(1) // the torrent name is not part of the key
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                dict.insert(&key, Value::Bytes(hashes.clone()));
            }
            root.insert("piece layers", dict);
        }

        Ok(encode(&root))
    }
}

fn parse_v1_pieces(value: &Value) -> Result<Vec<[u8; 20]>, MetainfoError> {
    let raw = value
        .as_bytes()
        .ok_or(MetainfoError::InvalidField("pieces"))?;
    if raw.is_empty() || raw.len() % 20 != 0 {
        return Err(MetainfoError::InvalidField("pieces"));
    }
    Ok(raw
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

fn parse_v1_files(
    name: &str,
    info: &std::collections::BTreeMap<Bytes, Value>,
) -> Result<Vec<FileSpec>, MetainfoError> {
    // single-file form
    if let Some(length) = info.get(b"length".as_slice()).and_then(|v| v.as_int()) {
        return Ok(vec![FileSpec {
            path: PathBuf::from(name),
            length: length as u64,
            offset: 0,
            pieces_root: None,
            attr: None,
            symlink_path: None,
            sha1: None,
        }]);
    }

    let list = info
        .get(b"files".as_slice())
        .and_then(|v| v.as_list())
        .ok_or(MetainfoError::MissingField("length or files"))?;

    let mut files = Vec::with_capacity(list.len());
    let mut offset = 0u64;

    for entry in list {
        let file = entry
            .as_dict()
            .ok_or(MetainfoError::InvalidField("files"))?;

        let length = file
            .get(b"length".as_slice())
            .and_then(|v| v.as_int())
            .ok_or(MetainfoError::MissingField("file length"))? as u64;

        let components = file
            .get(b"path".as_slice())
            .and_then(|v| v.as_list())
            .ok_or(MetainfoError::MissingField("file path"))?;

        let path: PathBuf = std::iter::once(name.to_string())
            .chain(
                components
                    .iter()
                    .filter_map(|p| p.as_str().map(String::from)),
            )
            .collect();

        let attr = file
            .get(b"attr".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        let symlink_path = file
            .get(b"symlink path".as_slice())
            .and_then(|v| v.as_list())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.as_str().map(String::from))
                    .collect()
            });

        let sha1 = file
            .get(b"sha1".as_slice())
            .and_then(|v| v.as_bytes())
            .filter(|b| b.len() == 20)
            .map(|b| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(b);
                hash
            });

        files.push(FileSpec {
            path,
            length,
            offset,
            pieces_root: None,
            attr,
            symlink_path,
            sha1,
        });
        offset += length;
    }

    Ok(files)
}

fn flatten_v2_files(name: &str, tree: FileTree) -> Vec<FileSpec> {
    let mut files = Vec::new();
    let mut offset = 0u64;

    for (path, entry) in tree.flatten() {
        files.push(FileSpec {
            path: PathBuf::from(name).join(path),
            length: entry.length,
            offset,
            pieces_root: entry.pieces_root,
            attr: entry.attr,
            symlink_path: entry.symlink_path,
            sha1: None,
        });
        offset += files.last().expect("just pushed").length;
    }

    files
}

fn parse_piece_layers(
    name: &str,
    value: Option<&Value>,
) -> Result<HashMap<PathBuf, Bytes>, MetainfoError> {
    let mut layers = HashMap::new();

    let Some(dict) = value.map(|v| {
        v.as_dict()
            .ok_or(MetainfoError::InvalidField("piece layers"))
    }) else {
        return Ok(layers);
    };

    for (key, hashes) in dict? {
        let rel = std::str::from_utf8(key)
            .map_err(|_| MetainfoError::InvalidField("piece layers key"))?;
        let raw = hashes
            .as_bytes()
            .ok_or(MetainfoError::InvalidField("piece layers value"))?;
        if raw.is_empty() || raw.len() % 32 != 0 {
            return Err(MetainfoError::InvalidField("piece layers value"));
        }

        let mut path = PathBuf::from(name);
        for part in rel.split('/') {
            path.push(part);
        }
        layers.insert(path, raw.clone());
    }

    Ok(layers)
}
