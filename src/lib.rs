pub mod bencode;
pub mod bitfield;
mod client;
pub mod config;
pub mod extensions;
pub mod logging;
pub mod magnet;
pub mod messages;
pub mod metainfo;
pub mod peer;
pub mod piece;
mod request_manager;
pub mod source;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use client::{Client, ClientError};
pub use config::{Config, PeerConfig, TrackerConfig};
pub use magnet::MagnetLink;
pub use metainfo::{InfoHash, Metainfo};
pub use source::MetadataSource;
pub use torrent::{
    TorrentError, TorrentEvent, TorrentHandle, TorrentStatus, TransferStats,
};

/// Largest block requested from or served to a peer.
pub(crate) const BLOCK_MAX: u32 = 1 << 14;
