use std::{net::SocketAddr, path::PathBuf};

use anyhow::{bail, Context};
use bittorrent_engine::{
    logging::init_tracing,
    metainfo::Metainfo,
    source::{MetadataSource, Resolved},
    Client, Config, TorrentEvent, TorrentStatus,
};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "bittorrent")]
#[command(about = "Downloads and seeds torrents over the BitTorrent wire protocol")]
struct Cli {
    #[arg(long, global = true, default_value_t = Level::INFO)]
    log_level: Level,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prints what a metainfo file, url or magnet link describes.
    Info { source: String },
    /// Downloads a torrent and exits once it is complete.
    Download {
        /// A metainfo file, an http(s) url to one, or a magnet link.
        source: String,
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// Listening port, the first free one of 6881-6889 by default.
        #[arg(long)]
        port: Option<u16>,
        /// Peers to connect to in addition to the ones trackers return.
        #[arg(long = "peer")]
        peers: Vec<SocketAddr>,
        /// Keep seeding after the download completes, until interrupted.
        #[arg(long)]
        seed: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level);

    match cli.command {
        Command::Info { source } => info_command(&source).await,
        Command::Download {
            source,
            output,
            port,
            peers,
            seed,
        } => download_command(&source, output, port, peers, seed).await,
    }
}

async fn info_command(source: &str) -> anyhow::Result<()> {
    let source = MetadataSource::parse(source).context("parsing the source")?;
    match source.load().await.context("loading the metadata")? {
        Resolved::Metainfo(metainfo) => print_metainfo(&metainfo),
        Resolved::Magnet(link) => {
            println!("Info Hash: {}", link.info_hash);
            if let Some(name) = link.name {
                println!("Name: {name}");
            }
            for tracker in link.trackers {
                println!("Tracker URL: {tracker}");
            }
        }
    }
    Ok(())
}

fn print_metainfo(metainfo: &Metainfo) {
    let info = &metainfo.info;
    println!("Name: {}", info.name);
    println!("Info Hash: {}", metainfo.info_hash);
    for tracker in &metainfo.announce {
        println!("Tracker URL: {tracker}");
    }
    println!("Length: {}", info.total_length());
    println!("Piece Length: {}", info.piece_length);
    println!("Private: {}", info.is_private());
    println!("Files:");
    for entry in info.file_entries() {
        println!("  {} ({} bytes)", entry.path.display(), entry.length);
    }
    println!("Piece Hashes:");
    for hash in &info.pieces.0 {
        println!("{}", hex::encode(hash));
    }
}

async fn download_command(
    source: &str,
    output: PathBuf,
    port: Option<u16>,
    peers: Vec<SocketAddr>,
    seed: bool,
) -> anyhow::Result<()> {
    let source = MetadataSource::parse(source).context("parsing the source")?;
    let mut config = Config {
        download_dir: output,
        ..Config::default()
    };
    if let Some(port) = port {
        config.listen_ports = port..=port;
    }
    let client = Client::new(config).await.context("starting the client")?;
    let torrent = client.add_torrent(source);
    let mut events = torrent.subscribe();
    if !peers.is_empty() {
        torrent.add_peers(peers).await?;
    }
    // the status may have moved on before we subscribed
    match torrent.status() {
        TorrentStatus::Error(error) => bail!("torrent failed: {error}"),
        TorrentStatus::Complete if !seed => {
            torrent.shutdown().await?;
            return Ok(());
        }
        _ => {}
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(TorrentEvent::Progress(progress)) => {
                    let stats = torrent.stats();
                    info!(
                        progress = %format!("{:.1}%", progress * 100.0),
                        pieces = stats.pieces_completed,
                        of = stats.pieces_total,
                        peers = stats.peers,
                        "downloading"
                    );
                }
                Ok(TorrentEvent::StatusChanged(TorrentStatus::Error(error))) => {
                    bail!("torrent failed: {error}")
                }
                Ok(TorrentEvent::StatusChanged(TorrentStatus::Complete)) => {
                    info!("download complete");
                    if !seed {
                        break;
                    }
                    info!("seeding, press ctrl-c to stop");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    torrent.shutdown().await?;
    Ok(())
}
