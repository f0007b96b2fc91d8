//! Whole-swarm scenarios over real sockets on loopback.
//!
//! Each test gets its own scratch directory and its own port range so the
//! scenarios can run in parallel. Short unchoke intervals keep the swarms
//! fast; completion is observed through the leeches' files reaching the
//! seed's exact bytes.

use std::{fs, path::Path, path::PathBuf, time::Duration};

use pretty_assertions::assert_eq;

use pieceswarm::{
    conf::{Conf, PeerEntry},
    engine,
};

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("pieceswarm-e2e-{}-{}", tag, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn swarm_conf(file_len: u64, piece_len: u32) -> Conf {
    Conf {
        preferred_neighbor_count: 2,
        unchoke_interval: Duration::from_secs(1),
        optimistic_unchoke_interval: Duration::from_secs(1),
        file_name: "shared.dat".to_string(),
        file_len,
        piece_len,
    }
}

fn entry(id: u32, port: u16, has_file: bool) -> PeerEntry {
    PeerEntry {
        id,
        host: "127.0.0.1".to_string(),
        port,
        has_file,
    }
}

/// Polls a leech's file until it matches the expected bytes, for up to 30
/// seconds.
async fn wait_for_download(root: &Path, peer_id: u32, expected: &[u8]) -> bool {
    let path = root.join(format!("peer_{}", peer_id)).join("shared.dat");
    for _ in 0..300 {
        if let Ok(bytes) = fs::read(&path) {
            if bytes == expected {
                return true;
            }
        }
        tokio::time::delay_for(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test(threaded_scheduler)]
async fn single_seed_single_leech() {
    let root = scratch_dir("pair");
    let payload = b"ABCDEFGHIJKLMNOP";
    fs::write(root.join("shared.dat"), payload).unwrap();

    let manifest = vec![entry(1001, 62001, true), entry(1002, 62002, false)];
    tokio::spawn(engine::run(swarm_conf(16, 4), manifest, root.clone()));

    assert!(
        wait_for_download(&root, 1002, payload).await,
        "leech never completed the download"
    );
    assert_eq!(
        fs::read(root.join("peer_1002").join("shared.dat")).unwrap(),
        payload.to_vec()
    );

    let _ = fs::remove_dir_all(&root);
}

#[tokio::test(threaded_scheduler)]
async fn ragged_final_piece() {
    let root = scratch_dir("ragged");
    // 10 bytes in 4-byte pieces: the last piece is only 2 bytes and lands
    // at offset 8
    let payload = b"ABCDEFGHIJ";
    fs::write(root.join("shared.dat"), payload).unwrap();

    let manifest = vec![entry(1001, 62011, true), entry(1002, 62012, false)];
    tokio::spawn(engine::run(swarm_conf(10, 4), manifest, root.clone()));

    assert!(
        wait_for_download(&root, 1002, payload).await,
        "leech never completed the download"
    );

    let _ = fs::remove_dir_all(&root);
}

#[tokio::test(threaded_scheduler)]
async fn one_seed_two_leeches() {
    let root = scratch_dir("trio");
    let payload = b"ABCDEFGHIJKLMNOP";
    fs::write(root.join("shared.dat"), payload).unwrap();

    // the second leech connects to both the seed and the first leech, so
    // pieces announced by the first leech become a second source for it
    let manifest = vec![
        entry(1001, 62021, true),
        entry(1002, 62022, false),
        entry(1003, 62023, false),
    ];
    tokio::spawn(engine::run(swarm_conf(16, 4), manifest, root.clone()));

    assert!(
        wait_for_download(&root, 1002, payload).await,
        "first leech never completed the download"
    );
    assert!(
        wait_for_download(&root, 1003, payload).await,
        "second leech never completed the download"
    );

    let _ = fs::remove_dir_all(&root);
}

#[tokio::test(threaded_scheduler)]
async fn swarm_with_larger_file() {
    let root = scratch_dir("larger");
    // 6 KiB in 19 pieces; exercises many request/piece/have rounds and a
    // ragged tail
    let payload: Vec<u8> = (0..6100u32).map(|i| (i % 251) as u8).collect();
    fs::write(root.join("shared.dat"), &payload).unwrap();

    let manifest = vec![entry(1001, 62031, true), entry(1002, 62032, false)];
    tokio::spawn(engine::run(swarm_conf(6100, 331), manifest, root.clone()));

    assert!(
        wait_for_download(&root, 1002, &payload).await,
        "leech never completed the download"
    );

    let _ = fs::remove_dir_all(&root);
}
