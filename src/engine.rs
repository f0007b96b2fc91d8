//! Brings a swarm up from the two input files: the common configuration and
//! the peer manifest.

use std::path::{Path, PathBuf};

use futures::future;
use tokio::task::JoinHandle;

use crate::{
    conf::{Conf, PeerEntry},
    error::{Error, Result},
    peer::Peer,
    PeerId,
};

/// Starts every peer in the manifest inside this process and runs the swarm
/// until all peer tasks finish.
///
/// Peers keep their listeners open for life, so in practice this runs until
/// the process is stopped; it returns early only if a peer fails to start.
/// `root` is the directory holding the shared file and the per-peer
/// download directories.
pub async fn run(conf: Conf, manifest: Vec<PeerEntry>, root: impl Into<PathBuf>) -> Result<()> {
    let root = root.into();
    let mut tasks = Vec::with_capacity(manifest.len());
    for index in 0..manifest.len() {
        tasks.push(start_peer(&conf, &manifest, index, &root).await?);
    }
    for res in future::join_all(tasks).await {
        join_result(res);
    }
    Ok(())
}

/// Starts only the manifest peer with the given id, for deployments that
/// run each peer in its own process or on its own host.
pub async fn run_one(
    conf: Conf,
    manifest: Vec<PeerEntry>,
    peer_id: PeerId,
    root: impl Into<PathBuf>,
) -> Result<()> {
    let root = root.into();
    let index = manifest
        .iter()
        .position(|entry| entry.id == peer_id)
        .ok_or_else(|| Error::Manifest(format!("peer {} is not in the manifest", peer_id)))?;
    let task = start_peer(&conf, &manifest, index, &root).await?;
    join_result(task.await);
    Ok(())
}

/// Creates one peer, binds its listener, and spawns its supervisor task.
///
/// The listener is bound before the task is spawned so that by the time a
/// later manifest entry dials this peer, it is guaranteed to be accepting.
async fn start_peer(
    conf: &Conf,
    manifest: &[PeerEntry],
    index: usize,
    root: &Path,
) -> Result<JoinHandle<Result<()>>> {
    let entry = &manifest[index];
    let peer = Peer::new(entry, conf, root)?;
    let listener = peer.bind().await?;
    // a peer dials exactly the peers listed above its own entry
    let neighbors = manifest[..index]
        .iter()
        .map(|entry| (entry.host.clone(), entry.port))
        .collect();
    Ok(tokio::spawn(peer.start(listener, neighbors)))
}

fn join_result(res: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("peer task failed: {}", e),
        Err(e) => log::error!("peer task panicked: {}", e),
    }
}
