//! The torrent actor. One task per torrent owns every piece of torrent level state: the session
//! table, the pieces, the request manager and the extension registry. Connection tasks,
//! trackers and the [`TorrentHandle`] talk to it through its mailbox only, so each message is
//! handled start to finish without anything else touching the state in between.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use strum::Display;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch},
    time::MissedTickBehavior,
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, error, info, instrument};

use crate::{
    config::Config,
    extensions::ExtensionRegistry,
    messages::handshake::{Handshake, HandshakeCodec},
    metainfo::{InfoHash, Metainfo},
    peer::{session::PeerSession, PeerCommand, PeerEvent, UploadView},
    source::{MetadataSource, Resolved},
    tracker::{self, AnnounceContext},
};

mod download;
pub mod error;
mod extension;
mod peers;

use download::Download;
pub use error::TorrentError;

const MAILBOX_SIZE: usize = 64;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TorrentStatus {
    /// The metadata isn't known yet.
    Loading,
    Ready,
    Complete,
    Error(String),
}

/// Lifecycle notifications, fanned out to every [`TorrentHandle::subscribe`]r.
#[derive(Debug, Clone, PartialEq)]
pub enum TorrentEvent {
    InfoHashKnown(InfoHash),
    StatusChanged(TorrentStatus),
    PeerConnected(SocketAddr),
    PeerDisconnected(SocketAddr),
    PieceCompleted(u32),
    /// Verified bytes over total bytes.
    Progress(f64),
    RateChanged { download: f64, upload: f64 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferStats {
    pub downloaded: u64,
    pub uploaded: u64,
    /// Bytes still missing. 0 while the metadata is unknown.
    pub left: u64,
    /// Bytes per second, summed over all sessions.
    pub download_rate: f64,
    pub upload_rate: f64,
    pub peers: usize,
    pub pieces_completed: usize,
    pub pieces_total: usize,
}

pub(crate) enum TorrentMsg {
    FromPeer { addr: SocketAddr, event: PeerEvent },
    AddPeers(Vec<SocketAddr>),
    /// A connection accepted by the client whose handshake named this torrent.
    Inbound {
        addr: SocketAddr,
        framed: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    },
    Reconnect(SocketAddr),
    Shutdown,
}

/// Cheap to clone. Dropping every handle does not stop the torrent, [`TorrentHandle::shutdown`]
/// does.
#[derive(Debug, Clone)]
pub struct TorrentHandle {
    tx: mpsc::Sender<TorrentMsg>,
    events: broadcast::Sender<TorrentEvent>,
    status: watch::Receiver<TorrentStatus>,
    info_hash: watch::Receiver<Option<InfoHash>>,
    stats: watch::Receiver<TransferStats>,
}

impl std::fmt::Debug for TorrentMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FromPeer { addr, event } => write!(f, "FromPeer({addr}, {event:?})"),
            Self::AddPeers(peers) => write!(f, "AddPeers({})", peers.len()),
            Self::Inbound { addr, .. } => write!(f, "Inbound({addr})"),
            Self::Reconnect(addr) => write!(f, "Reconnect({addr})"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl TorrentHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<TorrentEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> TorrentStatus {
        self.status.borrow().clone()
    }

    pub fn info_hash(&self) -> Option<InfoHash> {
        *self.info_hash.borrow()
    }

    pub fn stats(&self) -> TransferStats {
        self.stats.borrow().clone()
    }

    /// Resolves once the info hash is known, `None` if the torrent failed before that.
    pub async fn wait_for_info_hash(&self) -> Option<InfoHash> {
        let mut info_hash = self.info_hash.clone();
        let known = info_hash.wait_for(Option::is_some).await.ok()?;
        *known
    }

    /// Waits for a status matching `done`. `None` if the torrent stopped without reaching one.
    pub async fn wait_until(
        &self,
        mut done: impl FnMut(&TorrentStatus) -> bool,
    ) -> Option<TorrentStatus> {
        let mut status = self.status.clone();
        let reached = status.wait_for(|status| done(status)).await.ok()?;
        Some(reached.clone())
    }

    /// Hands peers to the torrent, it connects to the ones it has room for.
    pub async fn add_peers(&self, peers: Vec<SocketAddr>) -> Result<(), TorrentError> {
        self.send(TorrentMsg::AddPeers(peers)).await
    }

    /// Stops every session and announces `stopped` to the trackers.
    pub async fn shutdown(&self) -> Result<(), TorrentError> {
        self.send(TorrentMsg::Shutdown).await
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<TorrentMsg> {
        self.tx.clone()
    }

    async fn send(&self, msg: TorrentMsg) -> Result<(), TorrentError> {
        self.tx.send(msg).await.map_err(|_| TorrentError::ActorGone)
    }
}

struct Channels {
    tx: mpsc::Sender<TorrentMsg>,
    rx: mpsc::Receiver<TorrentMsg>,
    events: broadcast::Sender<TorrentEvent>,
    status_tx: watch::Sender<TorrentStatus>,
    info_hash_tx: watch::Sender<Option<InfoHash>>,
    stats_tx: watch::Sender<TransferStats>,
}

impl Channels {
    fn new() -> (Self, TorrentHandle) {
        let (tx, rx) = mpsc::channel(MAILBOX_SIZE);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, status) = watch::channel(TorrentStatus::Loading);
        let (info_hash_tx, info_hash) = watch::channel(None);
        let (stats_tx, stats) = watch::channel(TransferStats::default());
        let handle = TorrentHandle {
            tx: tx.clone(),
            events: events.clone(),
            status,
            info_hash,
            stats,
        };
        let channels = Self {
            tx,
            rx,
            events,
            status_tx,
            info_hash_tx,
            stats_tx,
        };
        (channels, handle)
    }
}

/// Starts the actor for a torrent. Loading the source happens on the actor task, a failure
/// shows up as [`TorrentStatus::Error`].
pub fn spawn(
    source: MetadataSource,
    config: Arc<Config>,
    client_id: [u8; 20],
    listen_port: u16,
) -> TorrentHandle {
    let (channels, handle) = Channels::new();
    tokio::spawn(async move {
        let resolved = match source.load().await {
            Ok(resolved) => resolved,
            Err(error) => {
                error!(%error, "failed to load the torrent metadata");
                let status = TorrentStatus::Error(error.to_string());
                channels.status_tx.send_replace(status.clone());
                let _ = channels.events.send(TorrentEvent::StatusChanged(status));
                return;
            }
        };
        Torrent::new(channels, config, client_id, listen_port, &resolved)
            .run(resolved)
            .await
    });
    handle
}

pub(crate) struct Torrent {
    config: Arc<Config>,
    client_id: [u8; 20],
    listen_port: u16,
    info_hash: InfoHash,
    announce: Vec<url::Url>,
    tx: mpsc::Sender<TorrentMsg>,
    rx: mpsc::Receiver<TorrentMsg>,
    events: broadcast::Sender<TorrentEvent>,
    status_tx: watch::Sender<TorrentStatus>,
    info_hash_tx: watch::Sender<Option<InfoHash>>,
    stats_tx: watch::Sender<TransferStats>,
    uploads_tx: watch::Sender<Option<UploadView>>,
    metainfo: Option<Metainfo>,
    download: Option<Download>,
    peers: HashMap<SocketAddr, PeerSession>,
    extensions: ExtensionRegistry,
    stats: TransferStats,
    trackers: CancellationToken,
    shutting_down: bool,
}

impl Torrent {
    fn new(
        channels: Channels,
        config: Arc<Config>,
        client_id: [u8; 20],
        listen_port: u16,
        resolved: &Resolved,
    ) -> Self {
        let (info_hash, announce) = match resolved {
            Resolved::Metainfo(metainfo) => (metainfo.info_hash, metainfo.announce.clone()),
            Resolved::Magnet(link) => (link.info_hash, link.trackers.clone()),
        };
        let (uploads_tx, _) = watch::channel(None);
        Self {
            config,
            client_id,
            listen_port,
            info_hash,
            announce,
            tx: channels.tx,
            rx: channels.rx,
            events: channels.events,
            status_tx: channels.status_tx,
            info_hash_tx: channels.info_hash_tx,
            stats_tx: channels.stats_tx,
            uploads_tx,
            metainfo: None,
            download: None,
            peers: HashMap::new(),
            extensions: ExtensionRegistry::with_defaults(),
            stats: TransferStats::default(),
            trackers: CancellationToken::new(),
            shutting_down: false,
        }
    }

    #[instrument(name = "torrent", skip_all, fields(info_hash = %self.info_hash))]
    async fn run(mut self, resolved: Resolved) {
        self.info_hash_tx.send_replace(Some(self.info_hash));
        self.emit(TorrentEvent::InfoHashKnown(self.info_hash));
        if let Resolved::Metainfo(metainfo) = &resolved {
            // nothing is verified before setup, the first announce reports the whole length
            self.stats.left = metainfo.info.total_length();
            self.stats.pieces_total = metainfo.info.piece_count();
            self.publish_stats();
        }
        self.start_trackers();

        match resolved {
            Resolved::Metainfo(metainfo) => {
                if let Err(error) = self.setup(*metainfo).await {
                    self.fail(error);
                }
            }
            Resolved::Magnet(link) => {
                info!("waiting for metadata from peers");
                self.add_peers(link.peers);
            }
        }

        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        while !self.is_stopped() {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = tick.tick() => self.on_tick(),
            }
        }
        self.stop();
    }

    async fn handle(&mut self, msg: TorrentMsg) {
        match msg {
            TorrentMsg::FromPeer { addr, event } => self.on_peer_event(addr, event).await,
            TorrentMsg::AddPeers(peers) => self.add_peers(peers),
            TorrentMsg::Inbound {
                addr,
                framed,
                handshake,
            } => self.accept(addr, framed, handshake),
            TorrentMsg::Reconnect(addr) => self.reconnect(addr),
            TorrentMsg::Shutdown => {
                info!("shutting down");
                self.shutting_down = true;
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.shutting_down || matches!(*self.status_tx.borrow(), TorrentStatus::Error(_))
    }

    fn stop(&mut self) {
        self.trackers.cancel();
        for session in self.peers.values() {
            let _ = session.command(PeerCommand::Shutdown);
        }
    }

    fn start_trackers(&mut self) {
        if self.announce.is_empty() {
            debug!("no trackers to announce to");
            return;
        }
        tracker::spawn_announcers(
            &self.announce,
            AnnounceContext {
                info_hash: self.info_hash,
                peer_id: self.client_id,
                port: self.listen_port,
                config: self.config.tracker.clone(),
                stats: self.stats_tx.subscribe(),
                status: self.status_tx.subscribe(),
                torrent_tx: self.tx.clone(),
                cancel: self.trackers.clone(),
            },
        );
    }

    fn status(&self) -> TorrentStatus {
        self.status_tx.borrow().clone()
    }

    fn set_status(&mut self, status: TorrentStatus) {
        if *self.status_tx.borrow() == status {
            return;
        }
        info!(%status, "status changed");
        self.status_tx.send_replace(status.clone());
        self.emit(TorrentEvent::StatusChanged(status));
    }

    fn fail(&mut self, error: TorrentError) {
        error!(%error, "torrent failed");
        self.set_status(TorrentStatus::Error(error.to_string()));
    }

    fn emit(&self, event: TorrentEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn publish_stats(&mut self) {
        self.stats.peers = self.peers.values().filter(|s| s.peer_id.is_some()).count();
        if let Some(download) = &self.download {
            self.stats.left = download.left();
            self.stats.pieces_completed = download.completed.cardinality();
            self.stats.pieces_total = download.pieces.len();
        }
        self.stats_tx.send_replace(self.stats.clone());
    }
}

#[cfg(test)]
impl Torrent {
    /// An actor whose loop isn't running, its handlers are driven by hand.
    pub(super) fn detached(config: Config, resolved: &Resolved) -> Self {
        let (channels, _) = Channels::new();
        Self::new(channels, Arc::new(config), [0xaa; 20], 6881, resolved)
    }

    /// A set up torrent over a single file that isn't on disk yet.
    pub(super) async fn downloading(
        dir: &std::path::Path,
        piece_length: u64,
        content: &[u8],
    ) -> Self {
        let metainfo = Metainfo::from_info(crate::metainfo::Info::single_file(
            "data.bin",
            piece_length,
            content,
        ));
        let mut config = Config {
            download_dir: dir.to_path_buf(),
            ..Config::default()
        };
        config.peer.reconnect_delay = None;
        let mut torrent =
            Self::detached(config, &Resolved::Metainfo(Box::new(metainfo.clone())));
        torrent.setup(metainfo).await.expect("sets up");
        torrent
    }

    /// Registers a session as if its handshake just completed.
    pub(super) fn insert_active(
        &mut self,
        addr: SocketAddr,
    ) -> mpsc::UnboundedReceiver<PeerCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = PeerSession::new(addr, true);
        session.activate([addr.port() as u8; 20], true, tx);
        if let Some(download) = &self.download {
            session.resolve_availability(download.pieces.len());
        }
        self.peers.insert(addr, session);
        rx
    }
}

/// Everything the torrent told a connection task so far.
#[cfg(test)]
pub(super) fn sent(rx: &mut mpsc::UnboundedReceiver<PeerCommand>) -> Vec<PeerCommand> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[cfg(test)]
mod test_torrent {
    use std::time::Duration;

    use bytes::{Buf, BufMut, BytesMut};
    use tokio::{net::UdpSocket, time::timeout};

    use super::*;
    use crate::{metainfo::Info, BLOCK_MAX};

    #[tokio::test]
    async fn first_announce_reports_the_whole_length() {
        let server = UdpSocket::bind("127.0.0.1:0").await.expect("binds");
        let port = server.local_addr().expect("bound").port();
        let content = vec![3u8; 3 * BLOCK_MAX as usize];
        let mut metainfo =
            Metainfo::from_info(Info::single_file("data.bin", 2 * BLOCK_MAX as u64, &content));
        metainfo.announce =
            vec![url::Url::parse(&format!("udp://127.0.0.1:{port}/announce")).expect("valid")];
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            download_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let handle = spawn(
            MetadataSource::Metainfo(Box::new(metainfo)),
            Arc::new(config),
            [0xaa; 20],
            6881,
        );

        let mut buf = [0u8; 2048];
        let (len, from) = timeout(Duration::from_secs(5), server.recv_from(&mut buf))
            .await
            .expect("connects in time")
            .expect("connect");
        let mut packet = &buf[..len];
        // protocol id and action
        packet.advance(12);
        let transaction_id = packet.get_u32();
        let mut reply = BytesMut::new();
        reply.put_u32(0);
        reply.put_u32(transaction_id);
        reply.put_u64(7);
        server.send_to(&reply, from).await.expect("sends");

        let (len, _) = timeout(Duration::from_secs(5), server.recv_from(&mut buf))
            .await
            .expect("announces in time")
            .expect("announce");
        let mut packet = &buf[..len];
        // connection id, action, transaction id, info hash and peer id
        packet.advance(8 + 4 + 4 + 20 + 20);
        let downloaded = packet.get_u64();
        let left = packet.get_u64();
        assert_eq!(downloaded, 0);
        assert_eq!(left, content.len() as u64);

        handle.shutdown().await.expect("running");
    }

    #[tokio::test]
    async fn setup_of_missing_data_is_ready() {
        let dir = tempfile::tempdir().expect("tempdir");
        let content = vec![5u8; 2 * BLOCK_MAX as usize];
        let torrent = Torrent::downloading(dir.path(), BLOCK_MAX as u64, &content).await;
        assert_eq!(torrent.status(), TorrentStatus::Ready);
        let stats = torrent.stats_tx.borrow().clone();
        assert_eq!(stats.left, content.len() as u64);
        assert_eq!(stats.pieces_total, 2);
        assert_eq!(stats.pieces_completed, 0);
    }
}
