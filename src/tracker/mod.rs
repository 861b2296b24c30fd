//! Peer discovery through trackers. Every announce url gets its own task, which announces
//! `started`, then keeps announcing at the interval the tracker asks for, sends `completed` once
//! the download finishes and `stopped` when the torrent shuts down. Discovered peers go to the
//! torrent's mailbox.

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use strum::Display;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bencode::BencodeError,
    config::TrackerConfig,
    metainfo::InfoHash,
    torrent::{TorrentMsg, TorrentStatus, TransferStats},
};

pub mod http;
pub mod udp;

use http::HttpTracker;
use udp::UdpTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Event {
    /// A regular announce.
    None,
    Completed,
    Started,
    Stopped,
}

impl Event {
    /// The event code of the udp announce.
    pub fn udp_code(self) -> u32 {
        match self {
            Event::None => 0,
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
    pub numwant: u32,
    /// Echoed back if a previous announce returned one.
    pub tracker_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnounceResponse {
    pub interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
    /// Seeders.
    pub complete: Option<u32>,
    /// Leechers.
    pub incomplete: Option<u32>,
    pub tracker_id: Option<String>,
}

#[derive(Debug)]
pub enum Tracker {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Tracker {
    pub fn from_url(url: &url::Url, config: &TrackerConfig) -> Result<Self, TrackerError> {
        match url.scheme() {
            "http" | "https" => Ok(Self::Http(HttpTracker::new(url.clone(), config.timeout)?)),
            "udp" => Ok(Self::Udp(UdpTracker::new(url.clone(), config.timeout)?)),
            _ => Err(TrackerError::UnsupportedScheme(url.to_string())),
        }
    }

    pub fn url(&self) -> &url::Url {
        match self {
            Self::Http(tracker) => tracker.url(),
            Self::Udp(tracker) => tracker.url(),
        }
    }

    pub async fn announce(
        &mut self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        match self {
            Self::Http(tracker) => tracker.announce(request).await,
            Self::Udp(tracker) => tracker.announce(request).await,
        }
    }
}

/// What an announce task needs from its torrent.
#[derive(Debug, Clone)]
pub(crate) struct AnnounceContext {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub config: TrackerConfig,
    pub stats: watch::Receiver<TransferStats>,
    pub status: watch::Receiver<TorrentStatus>,
    pub torrent_tx: mpsc::Sender<TorrentMsg>,
    pub cancel: CancellationToken,
}

impl AnnounceContext {
    fn request(&self, event: Event, tracker_id: Option<String>) -> AnnounceRequest {
        let stats = self.stats.borrow();
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: stats.uploaded,
            downloaded: stats.downloaded,
            left: stats.left,
            event,
            numwant: self.config.numwant,
            tracker_id,
        }
    }
}

pub(crate) fn spawn_announcers(urls: &[url::Url], ctx: AnnounceContext) {
    for url in urls {
        match Tracker::from_url(url, &ctx.config) {
            Ok(tracker) => {
                tokio::spawn(announce_loop(tracker, ctx.clone()));
            }
            Err(error) => warn!(%url, %error, "skipping tracker"),
        }
    }
}

async fn announce_loop(mut tracker: Tracker, mut ctx: AnnounceContext) {
    let mut event = Event::Started;
    let mut tracker_id = None;
    // `completed` is only for downloads that finish while we run
    let mut downloading = false;
    let mut completed_sent = false;

    loop {
        let request = ctx.request(event, tracker_id.clone());
        let wait = match tracker.announce(&request).await {
            Ok(response) => {
                info!(
                    url = %tracker.url(),
                    %event,
                    peers = response.peers.len(),
                    seeders = ?response.complete,
                    leechers = ?response.incomplete,
                    "announced"
                );
                if response.tracker_id.is_some() {
                    tracker_id = response.tracker_id;
                }
                if event == Event::Completed {
                    completed_sent = true;
                }
                event = Event::None;
                if !response.peers.is_empty()
                    && ctx
                        .torrent_tx
                        .send(TorrentMsg::AddPeers(response.peers))
                        .await
                        .is_err()
                {
                    return;
                }
                response.interval.unwrap_or(ctx.config.default_interval)
            }
            Err(error) => {
                warn!(url = %tracker.url(), %event, %error, "announce failed");
                ctx.config.retry_interval
            }
        };

        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    let request = ctx.request(Event::Stopped, tracker_id);
                    if let Err(error) = tracker.announce(&request).await {
                        debug!(url = %tracker.url(), %error, "stopped announce failed");
                    }
                    return;
                }
                _ = &mut sleep => break,
                changed = ctx.status.changed(), if !completed_sent => {
                    if changed.is_err() {
                        completed_sent = true;
                        continue;
                    }
                    let status = ctx.status.borrow_and_update().clone();
                    match status {
                        TorrentStatus::Ready => downloading = true,
                        TorrentStatus::Complete if downloading => {
                            event = Event::Completed;
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Peers in the compact form: 4 address bytes then 2 port bytes each, big endian.
pub fn compact_peers_v4(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            SocketAddr::new(ip.into(), u16::from_be_bytes([chunk[4], chunk[5]]))
        })
        .collect()
}

/// Like [`compact_peers_v4`] with 16 address bytes.
pub fn compact_peers_v6(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let ip = Ipv6Addr::from(octets);
            SocketAddr::new(ip.into(), u16::from_be_bytes([chunk[16], chunk[17]]))
        })
        .collect()
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("There is no tracker protocol for `{0}`.")]
    UnsupportedScheme(String),
    #[error("The tracker url `{0}` lacks a host or port.")]
    InvalidUrl(String),
    #[error("Failed to encode the announce query with the error: `{0}`")]
    Query(#[from] serde_urlencoded::ser::Error),
    #[error("Something failed with requesting the tracker-response: `{0}`")]
    Reqwest(#[from] reqwest::Error),
    #[error("The tracker `{url}` answered with status {status}.")]
    HttpStatus { url: String, status: u16 },
    #[error("Failed with error: `{error}` to deserialize tracker response from `{url}`")]
    InvalidResponse { error: BencodeError, url: String },
    #[error("The tracker refused the announce: `{0}`")]
    Failure(String),
    #[error("Failed to talk to the tracker with the error: `{0}`")]
    Io(#[from] std::io::Error),
    #[error("The tracker didn't answer in time.")]
    Timeout,
    #[error("The tracker answered transaction {got:#x} instead of {expected:#x}.")]
    TransactionMismatch { expected: u32, got: u32 },
    #[error("The tracker answered with the unexpected action {0}.")]
    UnexpectedAction(u32),
    #[error("The tracker response of {0} bytes is too short.")]
    ShortResponse(usize),
}
