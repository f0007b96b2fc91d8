use std::path::PathBuf;

use clap::Parser;

use pieceswarm::{conf, engine, error::Result};

/// Runs a file sharing swarm from a common configuration file and a peer
/// manifest.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the common configuration file.
    #[arg(long, default_value = "Common.cfg")]
    common: PathBuf,

    /// Path to the peer manifest.
    #[arg(long, default_value = "PeerInfo.txt")]
    manifest: PathBuf,

    /// Run only this manifest peer instead of all of them, for spreading
    /// the swarm over several processes or hosts.
    #[arg(long)]
    peer_id: Option<u32>,

    /// Directory holding the shared file and the per-peer download
    /// directories.
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Log level filter.
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,
}

fn init_logger(level: log::LevelFilter) {
    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{:5} [{}] {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()
        .expect("logger already initialized");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.log_level);

    let conf = conf::Conf::load(&cli.common)?;
    let manifest = conf::load_manifest(&cli.manifest)?;

    match cli.peer_id {
        Some(peer_id) => engine::run_one(conf, manifest, peer_id, cli.dir).await,
        None => engine::run(conf, manifest, cli.dir).await,
    }
}
