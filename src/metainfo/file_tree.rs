//! The BitTorrent v2 file tree (BEP-52).

use std::collections::BTreeMap;
use std::path::PathBuf;

use super::error::MetainfoError;
use crate::bencode::Value;

/// A leaf of the v2 file tree: one file.
#[derive(Debug, Clone)]
pub struct FileTreeEntry {
    pub length: u64,
    /// Root of the file's merkle tree; absent for empty files.
    pub pieces_root: Option<[u8; 32]>,
    /// BEP-47 attributes, e.g. "p" (padding), "x" (executable).
    pub attr: Option<String>,
    /// BEP-47 symlink target components, if the entry is a symlink.
    pub symlink_path: Option<Vec<String>>,
}

impl FileTreeEntry {
    pub fn is_padding(&self) -> bool {
        self.attr.as_deref().is_some_and(|a| a.contains('p'))
    }
}

/// The nested directory structure of a v2 torrent.
///
/// Directories are maps of name to subtree; a file node is a dictionary
/// whose empty-string key carries the file description.
#[derive(Debug, Clone)]
pub enum FileTree {
    File(FileTreeEntry),
    Directory(BTreeMap<String, FileTree>),
}

impl FileTree {
    /// Parses the `file tree` dictionary of a v2 info dict.
    pub fn from_bencode(value: &Value) -> Result<Self, MetainfoError> {
        let dict = value
            .as_dict()
            .ok_or(MetainfoError::InvalidField("file tree"))?;

        if let Some(info) = dict.get(b"".as_slice()) {
            let file = info
                .as_dict()
                .ok_or(MetainfoError::InvalidField("file tree entry"))?;

            let length = file
                .get(b"length".as_slice())
                .and_then(|v| v.as_int())
                .ok_or(MetainfoError::MissingField("length"))? as u64;

            let pieces_root = file
                .get(b"pieces root".as_slice())
                .and_then(|v| v.as_bytes())
                .filter(|b| b.len() == 32)
                .map(|b| {
                    let mut root = [0u8; 32];
                    root.copy_from_slice(b);
                    root
                });

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

            return Ok(FileTree::File(FileTreeEntry {
                length,
                pieces_root,
                attr,
                symlink_path,
            }));
        }

        let mut children = BTreeMap::new();
        for (key, child) in dict {
            let name = std::str::from_utf8(key)
                .map_err(|_| MetainfoError::InvalidField("file tree key"))?;
            if name.is_empty() {
                continue;
            }
            children.insert(name.to_string(), FileTree::from_bencode(child)?);
        }

        Ok(FileTree::Directory(children))
    }

    /// Flattens the tree into `(path, entry)` pairs in tree order.
    pub fn flatten(&self) -> Vec<(PathBuf, FileTreeEntry)> {
        let mut files = Vec::new();
        self.walk(PathBuf::new(), &mut files);
        files
    }

    fn walk(&self, path: PathBuf, out: &mut Vec<(PathBuf, FileTreeEntry)>) {
        match self {
            FileTree::File(entry) => out.push((path, entry.clone())),
            FileTree::Directory(children) => {
                for (name, child) in children {
                    child.walk(path.join(name), out);
                }
            }
        }
    }
}
