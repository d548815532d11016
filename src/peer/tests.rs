use super::hashes;
use super::*;
use crate::constants::BLOCK_LEN;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

fn addr(port: u16) -> SocketAddr {
    format!("10.0.0.1:{port}").parse().unwrap()
}

// ----------------------------------------------------------------------
// wire messages
// ----------------------------------------------------------------------

#[test]
fn message_round_trips() {
    let samples = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have(42),
        Message::Bitfield(Bytes::from_static(&[0b1010_0000])),
        Message::Request(BlockInfo {
            index: 3,
            begin: 16384,
            len: 16384,
        }),
        Message::Piece(Block {
            index: 3,
            begin: 16384,
            data: Bytes::from_static(b"block bytes"),
        }),
        Message::Cancel(BlockInfo {
            index: 3,
            begin: 16384,
            len: 16384,
        }),
        Message::Port(6881),
        Message::Suggest(7),
        Message::HaveAll,
        Message::HaveNone,
        Message::Reject(BlockInfo {
            index: 1,
            begin: 0,
            len: 16384,
        }),
        Message::AllowedFast(9),
        Message::Extended {
            id: 0,
            payload: Bytes::from_static(b"d1:md6:ut_pexi1eee"),
        },
        Message::HashRequest(HashRequest {
            pieces_root: [0xab; 32],
            base_layer: 2,
            index: 4,
            length: 4,
            proof_layers: 3,
        }),
        Message::Hashes {
            pieces_root: [0xcd; 32],
            base_layer: 2,
            index: 0,
            hashes: vec![[1; 32], [2; 32]],
            proofs: vec![[3; 32]],
        },
        Message::HashReject(HashRequest {
            pieces_root: [0xef; 32],
            base_layer: 0,
            index: 8,
            length: 8,
            proof_layers: 0,
        }),
    ];

    for message in samples {
        let encoded = message.encode();
        let decoded = Message::decode(encoded).unwrap();
        assert_eq!(decoded, message);
    }
}

#[test]
fn piece_decode_is_bounds_checked() {
    // claims 100 payload bytes but the frame carries none
    let mut frame = vec![0, 0, 0, 100, 7];
    frame.extend_from_slice(&3u32.to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes());
    assert!(Message::decode(Bytes::from(frame)).is_err());
}

#[test]
fn hash_request_constraints_are_enforced() {
    let bad_length = Message::HashRequest(HashRequest {
        pieces_root: [0; 32],
        base_layer: 0,
        index: 0,
        length: 3, // not a power of two
        proof_layers: 0,
    })
    .encode();
    assert!(Message::decode(bad_length).is_err());

    let bad_index = Message::HashRequest(HashRequest {
        pieces_root: [0; 32],
        base_layer: 0,
        index: 5, // not a multiple of length
        length: 4,
        proof_layers: 0,
    })
    .encode();
    assert!(Message::decode(bad_index).is_err());

    let too_long = Message::HashRequest(HashRequest {
        pieces_root: [0; 32],
        base_layer: 0,
        index: 0,
        length: 1024, // above the 512 cap
        proof_layers: 0,
    })
    .encode();
    assert!(Message::decode(too_long).is_err());
}

#[test]
fn handshake_reserved_bits() {
    let handshake = Handshake::new([1; 20], [2; 20]);
    let decoded = Handshake::decode(&handshake.encode()).unwrap();

    assert!(decoded.reserved.extension_protocol());
    assert!(decoded.reserved.fast());
    assert!(decoded.reserved.v2());
    assert!(!decoded.reserved.dht());
    assert!(!decoded.reserved.ltep_reserved());
    assert_eq!(decoded.info_hash, [1; 20]);
    assert_eq!(decoded.peer_id, [2; 20]);

    assert!(Handshake::decode(b"not a handshake").is_err());
}

// ----------------------------------------------------------------------
// bitfield
// ----------------------------------------------------------------------

#[test]
fn bitfield_wire_validation() {
    let full = Bitfield::full(10);
    assert_eq!(full.count(), 10);

    let parsed = Bitfield::from_wire(&full.to_bytes(), 10).unwrap();
    assert!(parsed.is_complete());

    // wrong length
    assert!(Bitfield::from_wire(&Bytes::from_static(&[0xff]), 10).is_err());
    // spare bits set
    assert!(Bitfield::from_wire(&Bytes::from_static(&[0xff, 0xff]), 10).is_err());
}

#[test]
fn bitfield_set_and_diff() {
    let mut ours = Bitfield::empty(9);
    ours.set(0);
    ours.set(8);
    assert!(ours.has(0) && ours.has(8) && !ours.has(4));
    assert_eq!(ours.count(), 2);

    let theirs = Bitfield::full(9);
    let fresh: Vec<usize> = theirs.newer_than(&ours).collect();
    assert_eq!(fresh, vec![1, 2, 3, 4, 5, 6, 7]);
}

// ----------------------------------------------------------------------
// fast extension
// ----------------------------------------------------------------------

#[test]
fn allowed_fast_set_is_deterministic_and_bounded() {
    let info_hash = [0xaa; 20];
    let ip = "93.184.216.34".parse().unwrap();

    let first = allowed_fast_set(&info_hash, ip, 1000);
    let second = allowed_fast_set(&info_hash, ip, 1000);
    assert_eq!(first, second);
    assert_eq!(first.len(), 10);
    assert!(first.iter().all(|&piece| piece < 1000));

    // small torrents get every piece at most once
    let tiny = allowed_fast_set(&info_hash, ip, 4);
    assert_eq!(tiny.len(), 4);

    assert!(allowed_fast_set(&info_hash, ip, 0).is_empty());
}

// ----------------------------------------------------------------------
// extension handshake
// ----------------------------------------------------------------------

#[test]
fn extension_handshake_round_trip() {
    let mut ours = ExtensionHandshake::ours(6881, 250);
    ours.extensions.insert("ut_metadata".into(), 3);

    let decoded = ExtensionHandshake::decode(&ours.encode()).unwrap();
    assert_eq!(decoded.port, Some(6881));
    assert_eq!(decoded.request_queue, Some(250));
    assert_eq!(decoded.id_for("ut_metadata"), Some(3));
    assert!(decoded.client.unwrap().starts_with("undertow"));

    assert!(ExtensionHandshake::decode(b"i1e").is_err());
}

// ----------------------------------------------------------------------
// v2 hash transfer
// ----------------------------------------------------------------------

#[test]
fn hash_server_serves_verifiable_ranges() {
    use crate::metainfo::MerkleTree;

    // a piece layer of 8 hashes, piece length one block
    let leaves: Vec<[u8; 32]> = (0..8u8)
        .map(|i| {
            let mut hash = [0u8; 32];
            hash[0] = i;
            hash
        })
        .collect();
    let tree = std::sync::Arc::new(MerkleTree::from_piece_layer(leaves, BLOCK_LEN as u64));
    let root = tree.root();

    let server = HashServer::new(0);
    server.register(root, tree);

    let request = HashRequest {
        pieces_root: root,
        base_layer: 0,
        index: 4,
        length: 2,
        proof_layers: 2,
    };
    let (hashes, proofs) = server.respond(&request).unwrap();
    assert_eq!(hashes.len(), 2);
    assert_eq!(proofs.len(), 2);
    assert!(hashes::verify_hashes(&root, 4, &hashes, &proofs));

    // unknown root is rejected
    let unknown = HashRequest {
        pieces_root: [9; 32],
        ..request
    };
    assert!(server.respond(&unknown).is_none());
}

#[test]
fn hash_ledger_matches_and_expires() {
    let ledger = HashRequestLedger::new();
    let request = HashRequest {
        pieces_root: [5; 32],
        base_layer: 0,
        index: 0,
        length: 4,
        proof_layers: 1,
    };

    assert!(ledger.record(request));
    assert_eq!(ledger.pending_count(), 1);

    let matched = ledger.complete(&[5; 32], 0, 0, 4);
    assert_eq!(matched, Some(request));
    assert_eq!(ledger.pending_count(), 0);

    // unmatched responses find nothing
    assert!(ledger.complete(&[5; 32], 0, 0, 4).is_none());
}

// ----------------------------------------------------------------------
// scheduler
// ----------------------------------------------------------------------

fn ready_peer(scheduler: &mut PieceScheduler, peer: SocketAddr) {
    scheduler.peer_connected(peer);
    scheduler.peer_bitfield(peer, Bitfield::full(scheduler.piece_count()));
    scheduler.peer_unchoked(peer);
    scheduler.set_interested(peer, true);
}

#[test]
fn one_assignee_per_block_outside_endgame() {
    // plenty of blocks so endgame stays off
    let mut scheduler = PieceScheduler::new(vec![BLOCK_LEN; 30]);
    let (a, b) = (addr(1), addr(2));
    ready_peer(&mut scheduler, a);
    ready_peer(&mut scheduler, b);

    let now = Instant::now();
    let first = scheduler.next_requests(a, now);
    let second = scheduler.next_requests(b, now);

    assert!(!first.is_empty() && !second.is_empty());
    for info in &first {
        assert!(!second.contains(info), "block assigned twice: {info:?}");
    }
}

#[test]
fn rarest_piece_wins_with_partial_tiebreak() {
    let mut scheduler = PieceScheduler::new(vec![BLOCK_LEN; 4]);
    let (a, b, c) = (addr(1), addr(2), addr(3));

    // piece 3 is rare: only peer a has it
    scheduler.peer_connected(a);
    scheduler.peer_bitfield(a, Bitfield::full(4));
    for peer in [b, c] {
        scheduler.peer_connected(peer);
        let mut bits = Bitfield::full(4);
        bits.unset(3);
        scheduler.peer_bitfield(peer, bits);
    }
    scheduler.peer_unchoked(a);
    scheduler.set_interested(a, true);

    let picked = scheduler.next_requests(a, Instant::now());
    assert_eq!(picked[0].index, 3);
}

#[test]
fn pipeline_budget_limits_requests() {
    // many single-block pieces, one peer
    let mut scheduler = PieceScheduler::new(vec![BLOCK_LEN; 100]);
    let a = addr(1);
    ready_peer(&mut scheduler, a);

    let requests = scheduler.next_requests(a, Instant::now());
    // fresh peers start at the pipeline floor
    assert_eq!(requests.len(), 4);
    assert_eq!(scheduler.outstanding(a), 4);

    // nothing more until something resolves
    assert!(scheduler.next_requests(a, Instant::now()).is_empty());
}

#[test]
fn timeout_withdraws_block_and_throttles_peer() {
    let mut scheduler = PieceScheduler::new(vec![BLOCK_LEN; 50]);
    let a = addr(1);
    ready_peer(&mut scheduler, a);

    for round in 0..3 {
        let requests = scheduler.next_requests(a, Instant::now());
        assert!(!requests.is_empty(), "round {round}");

        let late = Instant::now() + Duration::from_secs(11);
        let cancels = scheduler.sweep_timeouts(late);

        // every expired request comes back as a cancel for this peer
        let mut withdrawn: Vec<BlockInfo> = cancels
            .iter()
            .map(|SchedulerCommand::Cancel(who, info)| {
                assert_eq!(*who, a);
                *info
            })
            .collect();
        withdrawn.sort_by_key(|info| info.index);
        let mut expected = requests.clone();
        expected.sort_by_key(|info| info.index);
        assert_eq!(withdrawn, expected);
        assert_eq!(scheduler.outstanding(a), 0);
    }

    // three consecutive timeout rounds collapse the pipeline to one
    let requests = scheduler.next_requests(a, Instant::now());
    assert_eq!(requests.len(), 1);
}

#[test]
fn block_arrival_assembles_piece() {
    let piece_size = 3 * BLOCK_LEN;
    let mut scheduler = PieceScheduler::new(vec![piece_size, piece_size, piece_size, piece_size]);
    let a = addr(1);
    ready_peer(&mut scheduler, a);

    let now = Instant::now();
    let requests = scheduler.next_requests(a, now);
    assert_eq!(requests.len(), 4);

    let mut completed = None;
    for info in requests.iter().take(3) {
        let block = Block {
            index: info.index,
            begin: info.begin,
            data: Bytes::from(vec![info.begin as u8; info.len as usize]),
        };
        let (cancels, done) = scheduler.on_block(a, &block, now);
        assert!(cancels.is_empty());
        if done.is_some() {
            completed = done;
        }
    }

    let (piece, data) = completed.expect("three blocks complete the piece");
    assert_eq!(data.len(), piece_size as usize);
    assert_eq!(scheduler.piece_status(piece), PieceStatus::Downloaded);

    scheduler.mark_verified(piece);
    assert_eq!(scheduler.piece_status(piece), PieceStatus::Verified);
    scheduler.mark_written(piece);
    assert_eq!(scheduler.piece_status(piece), PieceStatus::Written);
    assert!(scheduler.our_bitfield().has(piece as usize));
}

#[test]
fn failed_piece_resets_to_missing() {
    let mut scheduler = PieceScheduler::new(vec![BLOCK_LEN]);
    let a = addr(1);
    ready_peer(&mut scheduler, a);

    let now = Instant::now();
    let info = scheduler.next_requests(a, now)[0];
    let block = Block {
        index: info.index,
        begin: info.begin,
        data: Bytes::from(vec![0; info.len as usize]),
    };
    let (_, completed) = scheduler.on_block(a, &block, now);
    assert!(completed.is_some());

    scheduler.mark_failed(info.index);
    assert_eq!(scheduler.piece_status(info.index), PieceStatus::Missing);
    assert_eq!(scheduler.blocks_remaining(), 1);

    // the piece is pickable again
    assert_eq!(scheduler.next_requests(a, now)[0].index, info.index);
}

#[test]
fn endgame_duplicates_up_to_three_and_cancels_losers() {
    // three blocks total puts the scheduler straight into endgame
    let mut scheduler = PieceScheduler::new(vec![3 * BLOCK_LEN]);
    let peers: Vec<SocketAddr> = (1..=10).map(addr).collect();
    for &peer in &peers {
        ready_peer(&mut scheduler, peer);
    }

    let now = Instant::now();
    let mut assignments: std::collections::HashMap<BlockInfo, Vec<SocketAddr>> =
        std::collections::HashMap::new();
    for &peer in &peers {
        for info in scheduler.next_requests(peer, now) {
            assignments.entry(info).or_default().push(peer);
        }
    }
    assert!(scheduler.in_endgame());

    // every block on at most three peers
    for (info, holders) in &assignments {
        assert!(
            holders.len() <= 3,
            "block {info:?} on {} peers",
            holders.len()
        );
    }

    // first arrival wins, the other assignees get cancels
    let (info, holders) = assignments
        .iter()
        .find(|(_, holders)| holders.len() == 3)
        .expect("a triplicated block");
    let winner = holders[0];
    let block = Block {
        index: info.index,
        begin: info.begin,
        data: Bytes::from(vec![1; info.len as usize]),
    };
    let (cancels, _) = scheduler.on_block(winner, &block, now);

    let cancelled: Vec<SocketAddr> = cancels
        .iter()
        .map(|SchedulerCommand::Cancel(who, cancelled_info)| {
            assert_eq!(cancelled_info, info);
            *who
        })
        .collect();
    assert_eq!(cancelled.len(), 2);
    assert!(!cancelled.contains(&winner));

    // a duplicate arrival from a cancelled peer changes nothing
    let (cancels, completed) = scheduler.on_block(holders[1], &block, now);
    assert!(cancels.is_empty());
    assert!(completed.is_none());
}

// ----------------------------------------------------------------------
// peer pool
// ----------------------------------------------------------------------

fn dummy_handle(peer: SocketAddr) -> ConnectionHandle {
    let (commands, _rx) = mpsc::channel(1);
    ConnectionHandle {
        addr: peer,
        peer_id: PeerId::generate(),
        reserved: Reserved::ours(),
        commands,
    }
}

#[test]
fn pool_dedupes_and_caps_at_limit() {
    let mut pool = PeerPool::new(1000, 25, 3);

    // 2000 additions over 1000 unique endpoints
    for _ in 0..2 {
        for host in 0..1000u32 {
            let peer: SocketAddr = format!(
                "10.{}.{}.{}:6881",
                host >> 16,
                (host >> 8) & 0xff,
                host & 0xff
            )
            .parse()
            .unwrap();
            pool.add_peer(peer, source::TRACKER);
        }
    }
    assert_eq!(pool.len(), 1000);

    // the table is full; a plain newcomer only enters by outranking the
    // floor, and the cap holds either way
    pool.add_peer(addr(9999), source::DHT);
    assert!(pool.len() <= 1000);
}

#[test]
fn pool_bans_after_three_failures() {
    let mut pool = PeerPool::new(10, 5, 3);
    let peer = addr(1);
    pool.add_peer(peer, source::TRACKER);

    for _ in 0..2 {
        pool.mark_connect_failed(peer);
        assert_eq!(pool.get(&peer).unwrap().status, PeerPoolStatus::Disconnected);
    }
    pool.mark_connect_failed(peer);
    assert_eq!(pool.get(&peer).unwrap().status, PeerPoolStatus::Banned);

    // banned peers are never dialed again
    assert!(pool.connect_candidates().is_empty());
}

#[test]
fn pool_rank_prefers_proven_peers() {
    let mut pool = PeerPool::new(10, 1, 3);
    let (good, bad) = (addr(1), addr(2));
    pool.add_peer(good, source::TRACKER);
    pool.add_peer(bad, source::TRACKER);

    pool.mark_connected(good, PeerId::generate(), dummy_handle(good));
    pool.mark_disconnected(good, 5000, 0);
    pool.mark_hash_failure(bad);
    pool.mark_hash_failure(bad);

    let candidates = pool.connect_candidates();
    assert_eq!(candidates, vec![good]);
}

#[test]
fn shutdown_keeps_handles_for_the_terminal_sweep() {
    let mut pool = PeerPool::new(100, 25, 3);

    let peers: Vec<SocketAddr> = (1..=25).map(addr).collect();
    for &peer in &peers {
        pool.add_peer(peer, source::TRACKER);
        assert!(pool.mark_connected(peer, PeerId::generate(), dummy_handle(peer)));
    }
    assert_eq!(pool.active_count(), 25);

    let handles = pool.begin_shutdown();
    assert_eq!(handles.len(), 25);

    // close events arrive during the drain; the handles must survive
    for &peer in &peers {
        pool.mark_disconnected(peer, 0, 0);
        assert!(pool.get(&peer).unwrap().connection.is_some());
    }

    // exactly the 25 connections fall to the sweep, and only once
    assert_eq!(pool.sweep(), 25);
    assert_eq!(pool.sweep(), 0);
}

#[test]
fn disconnect_outside_shutdown_frees_the_slot() {
    let mut pool = PeerPool::new(100, 2, 3);
    let (a, b, c) = (addr(1), addr(2), addr(3));
    for peer in [a, b, c] {
        pool.add_peer(peer, source::TRACKER);
    }

    let dialed = pool.connect_candidates();
    assert_eq!(dialed.len(), 2);
    for peer in dialed {
        pool.mark_connected(peer, PeerId::generate(), dummy_handle(peer));
    }
    assert!(pool.connect_candidates().is_empty());

    let first = pool.connected_handles()[0].addr;
    pool.mark_disconnected(first, 0, 0);
    assert!(pool.get(&first).unwrap().connection.is_none());

    // the freed slot is refillable at once
    assert_eq!(pool.connect_candidates().len(), 1);
}

// ----------------------------------------------------------------------
// connection FSM over loopback TCP
// ----------------------------------------------------------------------

async fn connected_pair(num_pieces: usize) -> (PeerConnection, PeerConnection) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen_addr = listener.local_addr().unwrap();
    let info_hash = [7u8; 20];

    let acceptor = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        PeerConnection::inbound(
            PeerTransport::tcp(stream),
            info_hash,
            PeerId::generate(),
            num_pieces,
        )
        .await
        .unwrap()
    });

    let stream = TcpStream::connect(listen_addr).await.unwrap();
    let dialer = PeerConnection::outbound(
        PeerTransport::tcp(stream),
        info_hash,
        PeerId::generate(),
        num_pieces,
    )
    .await
    .unwrap();

    (dialer, acceptor.await.unwrap())
}

#[tokio::test]
async fn handshake_reaches_ready_on_both_ends() {
    let (dialer, acceptor) = connected_pair(8).await;

    assert_eq!(dialer.state, PeerState::Ready);
    assert_eq!(acceptor.state, PeerState::Ready);
    assert!(dialer.peer_reserved.fast());
    assert!(dialer.peer_reserved.v2());
    assert!(dialer.peer_choking && !dialer.am_interested);
}

#[tokio::test]
async fn mismatched_info_hash_is_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen_addr = listener.local_addr().unwrap();

    let acceptor = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        PeerConnection::inbound(
            PeerTransport::tcp(stream),
            [1u8; 20],
            PeerId::generate(),
            8,
        )
        .await
    });

    let stream = TcpStream::connect(listen_addr).await.unwrap();
    let dialer = PeerConnection::outbound(
        PeerTransport::tcp(stream),
        [2u8; 20],
        PeerId::generate(),
        8,
    )
    .await;

    assert!(matches!(
        acceptor.await.unwrap(),
        Err(PeerError::InfoHashMismatch)
    ));
    drop(dialer);
}

#[tokio::test]
async fn bitfield_only_as_first_message() {
    let (mut dialer, mut acceptor) = connected_pair(8).await;

    dialer
        .send(Message::Bitfield(Bitfield::full(8).to_bytes()))
        .await
        .unwrap();
    let first = acceptor.receive().await.unwrap();
    assert!(matches!(first, Message::Bitfield(_)));
    assert!(acceptor.peer_bitfield.as_ref().unwrap().is_complete());

    dialer.send(Message::Interested).await.unwrap();
    assert!(matches!(
        acceptor.receive().await.unwrap(),
        Message::Interested
    ));
    assert!(acceptor.peer_interested);

    // a second bitfield closes the connection with a protocol error
    dialer
        .send(Message::Bitfield(Bitfield::empty(8).to_bytes()))
        .await
        .unwrap();
    assert!(matches!(
        acceptor.receive().await,
        Err(PeerError::Protocol(_))
    ));
}

#[tokio::test]
async fn request_while_choked_is_dropped_unless_allowed_fast() {
    let (mut dialer, mut acceptor) = connected_pair(8).await;

    // acceptor chokes the dialer (the default); a plain request is
    // absorbed without an event
    dialer
        .send(Message::Request(BlockInfo {
            index: 0,
            begin: 0,
            len: BLOCK_LEN,
        }))
        .await
        .unwrap();
    dialer.send(Message::Interested).await.unwrap();

    let next = acceptor.receive().await.unwrap();
    assert!(matches!(next, Message::Interested));
    assert!(acceptor.incoming_requests.is_empty());

    // the same request lands once the piece is allowed fast
    acceptor.send(Message::AllowedFast(0)).await.unwrap();
    assert!(matches!(
        dialer.receive().await.unwrap(),
        Message::AllowedFast(0)
    ));

    dialer
        .send(Message::Request(BlockInfo {
            index: 0,
            begin: 0,
            len: BLOCK_LEN,
        }))
        .await
        .unwrap();
    assert!(matches!(
        acceptor.receive().await.unwrap(),
        Message::Request(_)
    ));
    assert_eq!(acceptor.incoming_requests.len(), 1);
}

#[tokio::test]
async fn piece_message_settles_outstanding_request() {
    let (mut dialer, mut acceptor) = connected_pair(8).await;

    let info = BlockInfo {
        index: 2,
        begin: 0,
        len: 4,
    };
    dialer.send(Message::Request(info)).await.unwrap();
    assert_eq!(dialer.outstanding, vec![info]);

    // the acceptor allows the piece and serves it
    acceptor.fast.allow_outgoing(2);
    let _ = acceptor.receive().await.unwrap();
    acceptor
        .send(Message::Piece(Block {
            index: 2,
            begin: 0,
            data: Bytes::from_static(b"data"),
        }))
        .await
        .unwrap();

    let piece = dialer.receive().await.unwrap();
    assert!(matches!(piece, Message::Piece(_)));
    assert!(dialer.outstanding.is_empty());
    assert_eq!(dialer.bytes_downloaded, 4);
}

#[tokio::test]
async fn close_is_one_shot() {
    let (mut dialer, _acceptor) = connected_pair(8).await;

    assert!(!dialer.is_closed());
    dialer.close();
    assert!(dialer.is_closed());
    assert_eq!(dialer.state, PeerState::Closed);

    // a second close is a no-op, and sends fail silently
    dialer.close();
    dialer.send(Message::Interested).await.unwrap();
}
