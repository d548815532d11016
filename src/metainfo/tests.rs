use super::*;
use crate::bencode::{encode, Value};
use bytes::Bytes;
use std::path::PathBuf;

fn v1_single_file(name: &str, length: i64, piece_length: i64, pieces: &[u8]) -> Vec<u8> {
    let mut info = Value::dict();
    info.insert("name", Value::string(name));
    info.insert("piece length", Value::Integer(piece_length));
    info.insert("pieces", Value::bytes(pieces));
    info.insert("length", Value::Integer(length));

    let mut root = Value::dict();
    root.insert("announce", Value::string("udp://tracker.example:6969"));
    root.insert("info", info);
    encode(&root)
}

fn test_file_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn parse_single_file_v1() {
    let data = v1_single_file("linux.iso", 40960, 16384, &[0xaa; 60]);
    let torrent = TorrentInfo::from_bytes(&data).unwrap();

    assert_eq!(torrent.name, "linux.iso");
    assert_eq!(torrent.piece_length, 16384);
    assert_eq!(torrent.total_length, 40960);
    assert_eq!(torrent.piece_count(), 3);
    assert_eq!(torrent.piece_size(0), 16384);
    assert_eq!(torrent.piece_size(2), 40960 - 2 * 16384);
    assert_eq!(torrent.files.len(), 1);
    assert_eq!(torrent.files[0].path, PathBuf::from("linux.iso"));
    assert!(!torrent.is_hybrid);
    assert!(torrent.info_hash_v1.is_some());
    assert!(torrent.info_hash_v2.is_none());
    assert_eq!(torrent.trackers(), vec!["udp://tracker.example:6969"]);
}

#[test]
fn parse_multi_file_v1_with_padding() {
    let mut pad = Value::dict();
    pad.insert("length", Value::Integer(100));
    pad.insert("attr", Value::string("p"));
    pad.insert(
        "path",
        Value::List(vec![Value::string(".pad"), Value::string("100")]),
    );

    let mut real = Value::dict();
    real.insert("length", Value::Integer(900));
    real.insert("path", Value::List(vec![Value::string("a.txt")]));

    let mut info = Value::dict();
    info.insert("name", Value::string("bundle"));
    info.insert("piece length", Value::Integer(16384));
    info.insert("pieces", Value::bytes(&[0u8; 20]));
    info.insert("files", Value::List(vec![real, pad]));

    let mut root = Value::dict();
    root.insert("info", info);

    let torrent = TorrentInfo::from_bytes(&encode(&root)).unwrap();
    assert_eq!(torrent.files.len(), 2);
    assert!(!torrent.files[0].is_padding());
    assert!(torrent.files[1].is_padding());
    assert_eq!(torrent.files[1].offset, 900);
    assert_eq!(torrent.total_length, 1000);
}

#[test]
fn reject_missing_info() {
    let mut root = Value::dict();
    root.insert("announce", Value::string("http://x/"));
    assert!(matches!(
        TorrentInfo::from_bytes(&encode(&root)),
        Err(MetainfoError::MissingField("info"))
    ));
}

#[test]
fn reject_bad_v2_piece_length() {
    let mut entry = Value::dict();
    entry.insert("length", Value::Integer(100));
    let mut file_node = Value::dict();
    file_node.insert("", entry);
    let mut tree = Value::dict();
    tree.insert("a.txt", file_node);

    let mut info = Value::dict();
    info.insert("name", Value::string("x"));
    info.insert("piece length", Value::Integer(10_000)); // not a power of two
    info.insert("meta version", Value::Integer(2));
    info.insert("file tree", tree);

    let mut root = Value::dict();
    root.insert("info", info);

    assert!(matches!(
        TorrentInfo::from_bytes(&encode(&root)),
        Err(MetainfoError::InvalidPieceLength(10_000))
    ));
}

fn v2_torrent(name: &str, file_name: &str, data: &[u8], piece_length: u64) -> Vec<u8> {
    let tree = MerkleTree::from_file_bytes(data, piece_length);
    let pieces_root = tree.root();

    let piece_count = (data.len() as u64).div_ceil(piece_length) as usize;
    let mut layer = Vec::with_capacity(piece_count * 32);
    for i in 0..piece_count {
        let start = i * piece_length as usize;
        let end = (start + piece_length as usize).min(data.len());
        layer.extend_from_slice(&piece_subtree_root(&data[start..end], piece_length));
    }

    let mut entry = Value::dict();
    entry.insert("length", Value::Integer(data.len() as i64));
    entry.insert("pieces root", Value::bytes(&pieces_root));
    let mut file_node = Value::dict();
    file_node.insert("", entry);
    let mut file_tree = Value::dict();
    file_tree.insert(file_name, file_node);

    let mut info = Value::dict();
    info.insert("name", Value::string(name));
    info.insert("piece length", Value::Integer(piece_length as i64));
    info.insert("meta version", Value::Integer(2));
    info.insert("file tree", file_tree);

    let mut layers = Value::dict();
    if piece_count > 1 {
        layers.insert(file_name, Value::Bytes(Bytes::from(layer)));
    }

    let mut root = Value::dict();
    root.insert("info", info);
    root.insert("piece layers", layers);
    encode(&root)
}

#[test]
fn parse_v2_and_verify_pieces() {
    let piece_length = 32768u64;
    let data = test_file_bytes(80_000); // 3 pieces, last one short
    let raw = v2_torrent("pack", "big.bin", &data, piece_length);

    let torrent = TorrentInfo::from_bytes(&raw).unwrap();
    assert!(torrent.info_hash_v2.is_some());
    assert!(torrent.info_hash_v1.is_none());
    assert!(!torrent.is_hybrid);
    assert_eq!(torrent.piece_count(), 3);
    assert_eq!(torrent.piece_size(2), 80_000 - 2 * 32768);

    let file = &torrent.files[0];
    assert_eq!(file.path, PathBuf::from("pack").join("big.bin"));
    let pieces_root = file.pieces_root.unwrap();

    let layers = torrent.piece_layers.as_ref().unwrap();
    let layer = layers.get(&file.path).unwrap();

    let cache = PieceLayerCache::default();
    let tree = cache
        .get_or_build(&file.path, layer, piece_length, &pieces_root)
        .unwrap();

    // every piece proves against the root through the cached tree
    for index in 0..3u32 {
        let start = index as usize * piece_length as usize;
        let end = (start + piece_length as usize).min(data.len());
        let uncles = tree.proof(0, index as usize).unwrap();
        assert!(verify_proof(
            &data[start..end],
            index,
            piece_length,
            &uncles,
            &pieces_root,
        ));
        // a flipped byte must not verify
        let mut bad = data[start..end].to_vec();
        bad[0] ^= 0xff;
        assert!(!verify_proof(&bad, index, piece_length, &uncles, &pieces_root));
    }
}

#[test]
fn hybrid_piece_count_mismatch_rejected() {
    let piece_length = 32768u64;
    let data = test_file_bytes(80_000);
    let raw = v2_torrent("pack", "big.bin", &data, piece_length);

    // graft a v1 view with the wrong piece count onto the v2 torrent
    let root = crate::bencode::decode(&raw).unwrap();
    let mut dict = root.into_dict().unwrap();
    let info = dict.get_mut(b"info".as_slice()).unwrap();
    info.insert("pieces", Value::bytes(&[0u8; 40])); // 2 pieces, should be 3
    let rebuilt = encode(&Value::Dict(dict));

    assert!(matches!(
        TorrentInfo::from_bytes(&rebuilt),
        Err(MetainfoError::HybridMismatch(_))
    ));
}

#[test]
fn round_trip_preserves_fields_and_hash() {
    let data = v1_single_file("linux.iso", 40960, 16384, &[0xaa; 60]);
    let first = TorrentInfo::from_bytes(&data).unwrap();
    let second = TorrentInfo::from_bytes(&first.to_bytes().unwrap()).unwrap();

    assert_eq!(first.name, second.name);
    assert_eq!(first.piece_length, second.piece_length);
    assert_eq!(first.total_length, second.total_length);
    assert_eq!(first.announce, second.announce);
    assert_eq!(
        first.info_hash_v1.unwrap().wire(),
        second.info_hash_v1.unwrap().wire()
    );
}

#[test]
fn select_layer_matches_piece_size() {
    assert_eq!(select_layer(16384), 0);
    assert_eq!(select_layer(32768), 1);
    assert_eq!(select_layer(1 << 20), 6);
}

#[test]
fn file_tree_root_agrees_with_piece_layer_tree() {
    let piece_length = 32768u64;
    let data = test_file_bytes(100_000);

    let full = MerkleTree::from_file_bytes(&data, piece_length);

    let piece_count = (data.len() as u64).div_ceil(piece_length) as usize;
    let roots: Vec<[u8; 32]> = (0..piece_count)
        .map(|i| {
            let start = i * piece_length as usize;
            let end = (start + piece_length as usize).min(data.len());
            piece_subtree_root(&data[start..end], piece_length)
        })
        .collect();
    let reduced = MerkleTree::from_piece_layer(roots, piece_length);

    assert_eq!(full.root(), reduced.root());
    assert_eq!(full.depth(), reduced.depth() + select_layer(piece_length) as usize);
}

#[test]
fn layer_cache_evicts_by_bytes() {
    // capacity fits one tree only
    let cache = PieceLayerCache::new(200);

    let leaves_a = vec![[1u8; 32]; 4];
    let root_a = MerkleTree::from_piece_layer(leaves_a.clone(), 16384).root();
    let mut raw_a = Vec::new();
    for leaf in &leaves_a {
        raw_a.extend_from_slice(leaf);
    }

    let leaves_b = vec![[2u8; 32]; 4];
    let root_b = MerkleTree::from_piece_layer(leaves_b.clone(), 16384).root();
    let mut raw_b = Vec::new();
    for leaf in &leaves_b {
        raw_b.extend_from_slice(leaf);
    }

    let path_a = PathBuf::from("a");
    let path_b = PathBuf::from("b");

    cache.get_or_build(&path_a, &raw_a, 16384, &root_a).unwrap();
    assert!(cache.get(&path_a).is_some());

    cache.get_or_build(&path_b, &raw_b, 16384, &root_b).unwrap();
    assert!(cache.get(&path_a).is_none());
    assert!(cache.get(&path_b).is_some());
    assert!(cache.memory_used() <= 224);
}

#[test]
fn layer_cache_rejects_root_mismatch() {
    let cache = PieceLayerCache::default();
    let raw = [7u8; 64];
    assert!(matches!(
        cache.get_or_build(&PathBuf::from("f"), &raw, 16384, &[0u8; 32]),
        Err(MetainfoError::PieceLayerMismatch(_))
    ));
}
