use std::net::SocketAddr;

use bytes::Bytes;
use tokio::{net::TcpStream, sync::mpsc, time::Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::{
    bencode,
    extensions::{handshake::ExtendedHandshake, HANDSHAKE_ID},
    messages::{
        handshake::{Handshake, HandshakeCodec},
        payloads::{BasicExtensionPayload, BitfieldPayload},
        PeerMessage,
    },
    peer::{
        run_peer,
        session::{PeerSession, SessionState},
        Connection, PeerCommand, PeerContext, PeerEvent,
    },
    torrent::{Torrent, TorrentEvent, TorrentMsg, TorrentStatus},
};

impl Torrent {
    pub(super) async fn on_peer_event(&mut self, addr: SocketAddr, event: PeerEvent) {
        if let PeerEvent::Connected {
            peer_id,
            supports_extensions,
            sender,
        } = event
        {
            return self.on_connected(addr, peer_id, supports_extensions, sender);
        }
        if let PeerEvent::Disconnected { error } = event {
            return self.on_disconnected(addr, error);
        }
        let n_pieces = self.download.as_ref().map(|d| d.pieces.len());
        let Some(session) = self.peers.get_mut(&addr) else {
            trace!(peer = %addr, ?event, "event from an unknown peer");
            return;
        };

        match event {
            PeerEvent::Handshaking => session.state = SessionState::Handshaking,
            PeerEvent::Choke => {
                // outstanding requests stay, the remote may still answer them
                trace!(peer = %addr, "choked");
                session.choked = true;
            }
            PeerEvent::Unchoke => {
                trace!(peer = %addr, "unchoked");
                session.choked = false;
                self.fill(addr);
            }
            PeerEvent::Interested => {
                session.peer_interested = true;
                if session.am_choking {
                    session.am_choking = false;
                    if let Err(error) = session.send(PeerMessage::Unchoke) {
                        debug!(peer = %addr, %error, "failed to send unchoke");
                    }
                }
            }
            PeerEvent::NotInterested => session.peer_interested = false,
            PeerEvent::Have(index) => {
                if !session.record_have(index, n_pieces) {
                    warn!(peer = %addr, piece = index, "have for a piece that doesn't exist");
                    return self.drop_peer(addr);
                }
                self.update_interest(addr);
                self.fill(addr);
            }
            PeerEvent::Bitfield(payload) => {
                session.record_bitfield(payload, n_pieces);
                self.update_interest(addr);
                self.fill(addr);
            }
            PeerEvent::Block(block) => self.on_block(addr, block).await,
            PeerEvent::Extended(payload) => self.on_extended(addr, payload).await,
            PeerEvent::Transfer {
                uploaded,
                download,
                upload,
            } => {
                self.stats.uploaded += uploaded;
                if let Some(change) = download {
                    session.download_rate = change.current;
                    self.stats.download_rate = (self.stats.download_rate + change.delta()).max(0.0);
                }
                if let Some(change) = upload {
                    session.upload_rate = change.current;
                    self.stats.upload_rate = (self.stats.upload_rate + change.delta()).max(0.0);
                }
                if download.is_some() || upload.is_some() {
                    self.emit(TorrentEvent::RateChanged {
                        download: self.stats.download_rate,
                        upload: self.stats.upload_rate,
                    });
                }
                self.publish_stats();
            }
            PeerEvent::Connected { .. } | PeerEvent::Disconnected { .. } => {}
        }
    }

    fn on_connected(
        &mut self,
        addr: SocketAddr,
        peer_id: [u8; 20],
        supports_extensions: bool,
        sender: mpsc::UnboundedSender<PeerCommand>,
    ) {
        let duplicate = self
            .peers
            .values()
            .any(|session| session.addr != addr && session.peer_id == Some(peer_id));
        let Some(session) = self.peers.get_mut(&addr).filter(|_| !duplicate) else {
            debug!(peer = %addr, duplicate, "closing unexpected connection");
            let _ = sender.send(PeerCommand::Shutdown);
            return;
        };
        session.activate(peer_id, supports_extensions, sender);
        if let Some(download) = &self.download {
            session.resolve_availability(download.pieces.len());
        }
        info!(peer = %addr, supports_extensions, "session active");
        self.emit(TorrentEvent::PeerConnected(addr));
        self.publish_stats();

        if supports_extensions {
            self.send_extended_handshake(addr);
        }
        if let (Some(download), Some(session)) = (&self.download, self.peers.get(&addr)) {
            let bitfield = BitfieldPayload::from(&download.completed);
            if let Err(error) = session.send(PeerMessage::Bitfield(bitfield)) {
                debug!(peer = %addr, %error, "failed to send bitfield");
            }
        }
    }

    fn send_extended_handshake(&mut self, addr: SocketAddr) {
        let handshake = ExtendedHandshake {
            m: self.extensions.local_table(),
            p: Some(self.listen_port),
            v: Some(format!("bittorrent-engine {}", env!("CARGO_PKG_VERSION"))),
            metadata_size: self.metainfo.as_ref().map(|m| m.info_bytes.len() as u64),
            reqq: Some(self.config.peer.max_outstanding_requests as u32),
            yourip: Some(ExtendedHandshake::compact_ip(addr.ip())),
        };
        let data = match bencode::encode(&handshake) {
            Ok(data) => Bytes::from(data),
            Err(error) => {
                warn!(%error, "failed to encode the extended handshake");
                return;
            }
        };
        let Some(session) = self.peers.get(&addr) else {
            return;
        };
        let message = PeerMessage::Extended(BasicExtensionPayload {
            extension_id: HANDSHAKE_ID,
            data,
        });
        if let Err(error) = session.send(message) {
            debug!(peer = %addr, %error, "failed to send extended handshake");
        }
    }

    fn on_disconnected(&mut self, addr: SocketAddr, error: Option<String>) {
        let Some(mut session) = self.peers.remove(&addr) else {
            return;
        };
        match &error {
            Some(error) => debug!(peer = %addr, %error, "peer disconnected"),
            None => debug!(peer = %addr, "peer disconnected"),
        }
        if let Some(download) = self.download.as_mut() {
            session.release_all(&mut download.pieces);
            download.release_idle();
        }
        for handler in self.extensions.handlers_mut() {
            handler.on_disconnect(addr);
        }
        self.stats.download_rate = (self.stats.download_rate - session.download_rate).max(0.0);
        self.stats.upload_rate = (self.stats.upload_rate - session.upload_rate).max(0.0);
        if session.peer_id.is_some() {
            self.emit(TorrentEvent::PeerDisconnected(addr));
        }
        self.publish_stats();

        let redial = session.outbound
            && session.am_interested
            && self.status() != TorrentStatus::Complete;
        if let Some(delay) = self.config.peer.reconnect_delay.filter(|_| redial) {
            debug!(peer = %addr, ?delay, "scheduling reconnect");
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(TorrentMsg::Reconnect(addr)).await;
            });
        }
        self.refresh_all();
    }

    /// Recomputes whether we want something from a session after its availability changed:
    /// interested iff it has a piece we lack.
    pub(super) fn update_interest(&mut self, addr: SocketAddr) {
        let Some(download) = &self.download else {
            return;
        };
        let Some(session) = self.peers.get_mut(&addr) else {
            return;
        };
        if session.state != SessionState::Active {
            return;
        }
        let interested = session
            .availability()
            .is_some_and(|peer_has| download.wants_from(peer_has));
        set_interest(session, interested);
    }

    /// Like [`Torrent::update_interest`], but interest is only regained for a session that
    /// would get a piece assigned right away.
    fn refresh_interest(&mut self, addr: SocketAddr) {
        let Some(download) = &self.download else {
            return;
        };
        let Some(session) = self.peers.get_mut(&addr) else {
            return;
        };
        if session.state != SessionState::Active {
            return;
        }
        let Some(peer_has) = session.availability() else {
            return;
        };
        let interested = if session.am_interested {
            download.wants_from(peer_has)
        } else {
            download.can_assign(peer_has)
        };
        set_interest(session, interested);
    }

    /// Requests as much from a session as it is ready for.
    pub(super) fn fill(&mut self, addr: SocketAddr) {
        let Some(download) = self.download.as_mut() else {
            return;
        };
        let Some(session) = self.peers.get_mut(&addr) else {
            return;
        };
        let max = self.config.peer.max_outstanding_requests;
        let now = Instant::now();
        while session.is_ready(max) {
            let Some(peer_has) = session.availability() else {
                break;
            };
            let Some(index) =
                download
                    .requests
                    .select_piece(peer_has, &download.completed, &download.pieces)
            else {
                if session.num_outstanding() == 0 {
                    trace!(peer = %addr, "nothing to request, losing interest");
                    set_interest(session, false);
                }
                break;
            };
            let requests = session.request_piece(&mut download.pieces[index], max, now);
            if requests.is_empty() {
                break;
            }
            trace!(peer = %addr, piece = index, count = requests.len(), "requesting chunks");
            for request in requests {
                if let Err(error) = session.send(PeerMessage::Request(request)) {
                    // the disconnect event gives the chunks back
                    debug!(peer = %addr, %error, "failed to send request");
                    return;
                }
            }
        }
    }

    /// Re-evaluates interest and requests for every session, after work was given back or a
    /// piece completed.
    pub(super) fn refresh_all(&mut self) {
        let addrs = self.peers.keys().copied().collect::<Vec<_>>();
        for addr in addrs {
            self.refresh_interest(addr);
            self.fill(addr);
        }
    }

    pub(super) fn drop_peer(&mut self, addr: SocketAddr) {
        if let Some(session) = self.peers.get(&addr) {
            let _ = session.command(PeerCommand::Shutdown);
        }
    }

    pub(super) fn add_peers(&mut self, peers: Vec<SocketAddr>) {
        if self.status() == TorrentStatus::Complete {
            trace!(count = peers.len(), "complete, not dialing new peers");
            return;
        }
        for addr in peers {
            if self.peers.len() >= self.config.peer.max_peers {
                debug!("peer limit reached");
                break;
            }
            if !self.peers.contains_key(&addr) {
                self.connect(addr);
            }
        }
    }

    pub(super) fn reconnect(&mut self, addr: SocketAddr) {
        if self.status() == TorrentStatus::Complete || self.peers.contains_key(&addr) {
            return;
        }
        if self.peers.len() < self.config.peer.max_peers {
            self.connect(addr);
        }
    }

    fn connect(&mut self, addr: SocketAddr) {
        debug!(peer = %addr, "connecting");
        self.peers.insert(addr, PeerSession::new(addr, true));
        tokio::spawn(run_peer(self.peer_context(), addr, Connection::Outbound));
    }

    pub(super) fn accept(
        &mut self,
        addr: SocketAddr,
        framed: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    ) {
        if self.peers.contains_key(&addr) || self.peers.len() >= self.config.peer.max_peers {
            debug!(peer = %addr, "refusing inbound connection");
            return;
        }
        debug!(peer = %addr, "accepted inbound connection");
        self.peers.insert(addr, PeerSession::new(addr, false));
        tokio::spawn(run_peer(
            self.peer_context(),
            addr,
            Connection::Inbound { framed, handshake },
        ));
    }

    fn peer_context(&self) -> PeerContext {
        PeerContext {
            info_hash: self.info_hash,
            client_id: self.client_id,
            config: self.config.peer.clone(),
            torrent_tx: self.tx.clone(),
            uploads: self.uploads_tx.subscribe(),
        }
    }
}

fn set_interest(session: &mut PeerSession, interested: bool) {
    if interested == session.am_interested {
        return;
    }
    session.am_interested = interested;
    let message = if interested {
        PeerMessage::Interested
    } else {
        PeerMessage::NotInterested
    };
    if let Err(error) = session.send(message) {
        debug!(peer = %session.addr, %error, "failed to send interest");
    }
}
