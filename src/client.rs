//! The client shares one peer id and one listening socket between all of its torrents.
//! Inbound connections are routed to a torrent by the info hash of their handshake.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    ops::RangeInclusive,
    sync::Arc,
    time::Duration,
};

use futures_util::StreamExt;
use rand::{distr::Alphanumeric, Rng};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    messages::handshake::HandshakeCodec,
    metainfo::InfoHash,
    source::MetadataSource,
    torrent::{self, TorrentHandle, TorrentMsg},
};

type Registry = Arc<Mutex<HashMap<InfoHash, mpsc::Sender<TorrentMsg>>>>;

pub struct Client {
    config: Arc<Config>,
    peer_id: [u8; 20],
    listen_addr: SocketAddr,
    torrents: Registry,
    accept_task: JoinHandle<()>,
}

impl Client {
    /// Binds the first free port of the configured range and starts accepting peers.
    pub async fn new(config: Config) -> Result<Self, ClientError> {
        let peer_id = generate_peer_id(&config.client_prefix);
        let listener = bind(config.listen_ports.clone()).await?;
        let listen_addr = listener.local_addr()?;
        info!(%listen_addr, peer_id = %String::from_utf8_lossy(&peer_id), "client listening");

        let torrents = Registry::default();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            torrents.clone(),
            config.peer.connect_timeout,
        ));
        Ok(Self {
            config: Arc::new(config),
            peer_id,
            listen_addr,
            torrents,
            accept_task,
        })
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts a torrent. It accepts inbound peers as soon as its info hash is known.
    pub fn add_torrent(&self, source: MetadataSource) -> TorrentHandle {
        let handle = torrent::spawn(
            source,
            self.config.clone(),
            self.peer_id,
            self.listen_addr.port(),
        );
        let torrents = self.torrents.clone();
        let registered = handle.clone();
        tokio::spawn(async move {
            if let Some(info_hash) = registered.wait_for_info_hash().await {
                debug!(%info_hash, "registered torrent for inbound peers");
                torrents.lock().await.insert(info_hash, registered.sender());
            }
        });
        handle
    }

    /// Info hashes of the torrents currently accepting inbound peers.
    pub async fn torrents(&self) -> Vec<InfoHash> {
        self.torrents.lock().await.keys().copied().collect()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// The configured prefix padded with random alphanumeric characters to 20 bytes.
fn generate_peer_id(prefix: &str) -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = &prefix.as_bytes()[..prefix.len().min(20)];
    peer_id[..prefix.len()].copy_from_slice(prefix);
    for (byte, random) in peer_id[prefix.len()..]
        .iter_mut()
        .zip(rand::rng().sample_iter(Alphanumeric))
    {
        *byte = random;
    }
    peer_id
}

async fn bind(ports: RangeInclusive<u16>) -> Result<TcpListener, ClientError> {
    for port in ports.clone() {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => return Ok(listener),
            Err(error) => debug!(port, %error, "port unavailable"),
        }
    }
    Err(ClientError::NoFreePort {
        start: *ports.start(),
        end: *ports.end(),
    })
}

async fn accept_loop(listener: TcpListener, torrents: Registry, handshake_timeout: Duration) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(connection) => connection,
            Err(error) => {
                warn!(%error, "failed to accept a connection");
                continue;
            }
        };
        let torrents = torrents.clone();
        tokio::spawn(async move {
            if let Err(error) = route_inbound(stream, addr, torrents, handshake_timeout).await {
                debug!(peer = %addr, %error, "dropping inbound connection");
            }
        });
    }
}

async fn route_inbound(
    stream: TcpStream,
    addr: SocketAddr,
    torrents: Registry,
    handshake_timeout: Duration,
) -> Result<(), ClientError> {
    let mut framed = Framed::new(stream, HandshakeCodec);
    let handshake = tokio::time::timeout(handshake_timeout, framed.next())
        .await
        .map_err(|_| ClientError::HandshakeTimeout)?
        .ok_or(ClientError::NoHandshake)?
        .map_err(ClientError::Handshake)?;

    let info_hash = handshake.info_hash;
    // a torrent with a full mailbox must not hold up the others
    let sender = torrents.lock().await.get(&info_hash).cloned();
    let Some(sender) = sender else {
        return Err(ClientError::UnknownTorrent(info_hash));
    };
    let inbound = TorrentMsg::Inbound {
        addr,
        framed,
        handshake,
    };
    if sender.send(inbound).await.is_err() {
        torrents.lock().await.remove(&info_hash);
        return Err(ClientError::UnknownTorrent(info_hash));
    }
    Ok(())
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("None of the ports {start}..={end} could be bound.")]
    NoFreePort { start: u16, end: u16 },
    #[error("Failed with the io error: `{0}`")]
    Io(#[from] std::io::Error),
    #[error("The remote didn't send its handshake in time.")]
    HandshakeTimeout,
    #[error("The remote closed the connection before its handshake.")]
    NoHandshake,
    #[error("Failed to read the handshake with the error: `{0}`")]
    Handshake(std::io::Error),
    #[error("No running torrent has the info hash {0}.")]
    UnknownTorrent(InfoHash),
}

#[cfg(test)]
mod test_client {
    use futures_util::SinkExt;
    use tokio::time::timeout;

    use super::*;
    use crate::messages::handshake::Handshake;

    /// Dials `listener` and sends a handshake for `info_hash`. Returns the accepted side and the
    /// dialing side, which has to stay open.
    async fn handshaking(
        listener: &TcpListener,
        info_hash: InfoHash,
    ) -> (TcpStream, SocketAddr, Framed<TcpStream, HandshakeCodec>) {
        let remote = TcpStream::connect(listener.local_addr().expect("bound"))
            .await
            .expect("connects");
        let mut remote = Framed::new(remote, HandshakeCodec);
        remote
            .send(Handshake::new(info_hash, [1; 20]))
            .await
            .expect("sends");
        let (stream, addr) = listener.accept().await.expect("accepts");
        (stream, addr, remote)
    }

    #[test]
    fn peer_id_has_prefix_and_random_tail() {
        let peer_id = generate_peer_id("-NT0010-");
        assert_eq!(&peer_id[..8], b"-NT0010-");
        assert!(peer_id[8..].iter().all(u8::is_ascii_alphanumeric));
        assert_ne!(generate_peer_id("-NT0010-"), peer_id);
    }

    #[tokio::test]
    async fn binds_a_free_port() {
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("binds");
        let port = taken.local_addr().expect("bound").port();
        let config = Config {
            listen_ports: 0..=0,
            ..Config::default()
        };
        let client = Client::new(config).await.expect("starts");
        assert_ne!(client.listen_addr().port(), 0);
        assert_ne!(client.listen_addr().port(), port);
    }

    #[tokio::test]
    async fn full_mailbox_does_not_stall_other_torrents() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("binds");
        let (busy, idle) = (InfoHash([1; 20]), InfoHash([2; 20]));
        let (busy_tx, _busy_rx) = mpsc::channel(1);
        busy_tx
            .send(TorrentMsg::Shutdown)
            .await
            .expect("room for one");
        let (idle_tx, mut idle_rx) = mpsc::channel(1);
        let torrents = Registry::new(Mutex::new(HashMap::from([
            (busy, busy_tx),
            (idle, idle_tx),
        ])));

        let (stream, addr, _busy_remote) = handshaking(&listener, busy).await;
        let stuck = tokio::spawn(route_inbound(
            stream,
            addr,
            torrents.clone(),
            Duration::from_secs(5),
        ));
        // let it get to the full mailbox
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (stream, addr, _idle_remote) = handshaking(&listener, idle).await;
        timeout(
            Duration::from_secs(5),
            route_inbound(stream, addr, torrents.clone(), Duration::from_secs(5)),
        )
        .await
        .expect("not blocked by the busy torrent")
        .expect("routed");
        assert!(matches!(
            idle_rx.try_recv(),
            Ok(TorrentMsg::Inbound { .. })
        ));
        assert_eq!(
            timeout(Duration::from_secs(1), torrents.lock())
                .await
                .expect("registry free")
                .len(),
            2
        );
        assert!(!stuck.is_finished());
        stuck.abort();
    }

    #[tokio::test]
    async fn unknown_info_hash_is_refused() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("binds");
        let (stream, addr, _remote) = handshaking(&listener, InfoHash([3; 20])).await;
        let result = route_inbound(stream, addr, Registry::default(), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ClientError::UnknownTorrent(hash)) if hash == InfoHash([3; 20])));
    }
}
