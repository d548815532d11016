use super::*;
use crate::bencode::{encode, Value};
use crate::config::EngineConfig;
use crate::metainfo::{PieceLayerCache, TorrentInfo};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;

// ----------------------------------------------------------------------
// event bus
// ----------------------------------------------------------------------

fn stats_event(downloaded: u64) -> Event {
    Event::StatsUpdate {
        downloaded,
        uploaded: 0,
        download_rate: 0,
        upload_rate: 0,
        peers: 0,
        progress: 0.0,
    }
}

#[tokio::test]
async fn bus_delivers_in_publish_order() {
    let bus = EventBus::new();
    let mut rx = bus.subscribe_all();

    for i in 0..5 {
        bus.publish(stats_event(i));
    }

    for expected in 0..5 {
        match rx.recv().await.unwrap() {
            Event::StatsUpdate { downloaded, .. } => assert_eq!(downloaded, expected),
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn bus_filters_by_name() {
    let bus = EventBus::new();
    let mut pieces = bus.subscribe("piece.completed");
    let mut failures = bus.subscribe("piece.hash_failed");

    bus.publish(Event::PieceCompleted {
        index: 3,
        size: 16384,
        completed_count: 1,
        total_count: 2,
    });
    bus.publish(Event::PieceHashFailed { index: 9 });

    match pieces.recv().await.unwrap() {
        Event::PieceCompleted { index, .. } => assert_eq!(index, 3),
        other => panic!("unexpected event {other:?}"),
    }
    match failures.recv().await.unwrap() {
        Event::PieceHashFailed { index } => assert_eq!(index, 9),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(pieces.try_recv().is_err());
}

#[test]
fn bus_prunes_dead_subscribers() {
    let bus = EventBus::new();
    drop(bus.subscribe_all());
    // publishing into a dead subscriber must not error or accumulate
    bus.publish(stats_event(0));
    bus.publish(stats_event(1));
}

// ----------------------------------------------------------------------
// discovery boundary
// ----------------------------------------------------------------------

#[test]
fn compact_v4_parsing() {
    let mut data = Vec::new();
    data.extend_from_slice(&[127, 0, 0, 1]);
    data.extend_from_slice(&6881u16.to_be_bytes());
    data.extend_from_slice(&[10, 0, 0, 2]);
    data.extend_from_slice(&51413u16.to_be_bytes());
    data.push(0xff); // trailing garbage is ignored

    let peers = parse_compact_v4(&data);
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[0], "127.0.0.1:6881".parse().unwrap());
    assert_eq!(peers[1], "10.0.0.2:51413".parse().unwrap());
}

#[test]
fn compact_v6_parsing() {
    let mut data = Vec::new();
    data.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
    data.extend_from_slice(&6881u16.to_be_bytes());

    let peers = parse_compact_v6(&data);
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0], "[::1]:6881".parse().unwrap());
}

// ----------------------------------------------------------------------
// end-to-end loopback transfer
// ----------------------------------------------------------------------

fn single_file_torrent(name: &str, data: &[u8], piece_length: usize) -> TorrentInfo {
    use sha1::{Digest, Sha1};

    let mut pieces = Vec::new();
    for chunk in data.chunks(piece_length) {
        let hash: [u8; 20] = Sha1::digest(chunk).into();
        pieces.extend_from_slice(&hash);
    }

    let mut info = Value::dict();
    info.insert("name", Value::string(name));
    info.insert("piece length", Value::Integer(piece_length as i64));
    info.insert("pieces", Value::bytes(&pieces));
    info.insert("length", Value::Integer(data.len() as i64));

    let mut root = Value::dict();
    root.insert("info", info);

    TorrentInfo::from_bytes(&encode(&root)).unwrap()
}

fn transfer_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

struct Swarm {
    seeder: Session,
    leecher: Session,
    seeder_dir: tempfile::TempDir,
    leecher_dir: tempfile::TempDir,
    file_rel: std::path::PathBuf,
}

/// One seeder with the file on disk, one empty leecher.
async fn two_session_swarm(data: &[u8], piece_length: usize, prefer_utp: bool) -> Swarm {
    let torrent = single_file_torrent("transfer.bin", data, piece_length);
    let file_rel = std::path::PathBuf::from("transfer.bin");

    let seeder_dir = tempfile::tempdir().unwrap();
    std::fs::write(seeder_dir.path().join(&file_rel), data).unwrap();

    let leecher_dir = tempfile::tempdir().unwrap();

    let seeder = Session::start(
        torrent.clone(),
        EngineConfig {
            download_dir: seeder_dir.path().to_path_buf(),
            listen_port: 0,
            prefer_utp,
            ..EngineConfig::default()
        },
        SharedResources::new(PieceLayerCache::default()),
    )
    .await
    .unwrap();
    assert_eq!(seeder.state(), SessionState::Seeding);

    let leecher = Session::start(
        torrent,
        EngineConfig {
            download_dir: leecher_dir.path().to_path_buf(),
            listen_port: 0,
            prefer_utp,
            ..EngineConfig::default()
        },
        SharedResources::new(PieceLayerCache::default()),
    )
    .await
    .unwrap();
    assert_eq!(leecher.state(), SessionState::Downloading);

    Swarm {
        seeder,
        leecher,
        seeder_dir,
        leecher_dir,
        file_rel,
    }
}

#[tokio::test]
async fn loopback_transfer_over_tcp() {
    let piece_length = 65536;
    let data = transfer_payload(4 * piece_length);
    let swarm = two_session_swarm(&data, piece_length, false).await;

    // the embedder's accept loop: hand inbound connections to the seeder
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seed_addr = listener.local_addr().unwrap();
    let accept = tokio::spawn({
        let seeder = swarm.seeder.clone();
        async move {
            while let Ok((stream, _)) = listener.accept().await {
                if seeder.add_incoming(stream).await.is_err() {
                    break;
                }
            }
        }
    });

    let mut completed = swarm.leecher.events().subscribe("session.completed");
    let mut pieces = swarm.leecher.events().subscribe("piece.completed");

    swarm.leecher.add_peers(vec![seed_addr]).await.unwrap();

    timeout(Duration::from_secs(60), completed.recv())
        .await
        .expect("transfer finished in time")
        .expect("event delivered");

    assert_eq!(swarm.leecher.state(), SessionState::Seeding);

    // exactly one piece.completed per piece
    let mut seen = Vec::new();
    while let Ok(event) = pieces.try_recv() {
        if let Event::PieceCompleted { index, .. } = event {
            seen.push(index);
        }
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3]);

    // the files agree byte for byte
    let seeded = std::fs::read(swarm.seeder_dir.path().join(&swarm.file_rel)).unwrap();
    let leeched = std::fs::read(swarm.leecher_dir.path().join(&swarm.file_rel)).unwrap();
    assert_eq!(seeded, leeched);

    accept.abort();
    swarm.leecher.stop().await.unwrap();
    swarm.seeder.stop().await.unwrap();
}

#[tokio::test]
async fn loopback_transfer_over_utp() {
    let piece_length = 32768;
    let data = transfer_payload(3 * piece_length);
    let swarm = two_session_swarm(&data, piece_length, true).await;

    let seed_addr = swarm
        .seeder
        .utp_listen_addr()
        .expect("seeder bound a utp socket");
    // the udp socket binds 0.0.0.0; dial loopback at its port
    let seed_addr = std::net::SocketAddr::new("127.0.0.1".parse().unwrap(), seed_addr.port());

    let mut completed = swarm.leecher.events().subscribe("session.completed");
    swarm.leecher.add_peers(vec![seed_addr]).await.unwrap();

    timeout(Duration::from_secs(60), completed.recv())
        .await
        .expect("utp transfer finished in time")
        .expect("event delivered");

    let seeded = std::fs::read(swarm.seeder_dir.path().join(&swarm.file_rel)).unwrap();
    let leeched = std::fs::read(swarm.leecher_dir.path().join(&swarm.file_rel)).unwrap();
    assert_eq!(seeded, leeched);

    swarm.leecher.stop().await.unwrap();
    swarm.seeder.stop().await.unwrap();
}

#[tokio::test]
async fn pause_resume_and_stop_lifecycle() {
    let piece_length = 16384;
    let data = transfer_payload(piece_length);
    let torrent = single_file_torrent("solo.bin", &data, piece_length);

    let dir = tempfile::tempdir().unwrap();
    let session = Session::start(
        torrent,
        EngineConfig {
            download_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        },
        SharedResources::new(PieceLayerCache::default()),
    )
    .await
    .unwrap();

    let mut events = session.events().subscribe_all();

    session.pause().await.unwrap();
    session.resume().await.unwrap();
    session
        .report_tracker("udp://tracker.example:6969".into(), Ok(12))
        .await
        .unwrap();
    session.stop().await.unwrap();
    assert_eq!(session.state(), SessionState::Stopped);

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert!(names.contains(&"session.paused"));
    assert!(names.contains(&"session.resumed"));
    assert!(names.contains(&"tracker.success"));
    assert!(names.contains(&"session.stopped"));
}
