//! One task per remote peer. The task owns the socket, the torrent owns the decisions: remote
//! messages are forwarded as [`PeerEvent`]s, and the torrent answers with [`PeerCommand`]s.
//! Uploads are the exception, they are served right here from an [`UploadView`] of the storage.

use std::{collections::VecDeque, net::SocketAddr, pin::Pin, sync::Arc};

use futures_core::Stream;
use futures_util::stream::SplitSink;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_util::codec::Framed;
use tracing::debug;

use crate::{
    bitfield::Bitfield,
    config::PeerConfig,
    messages::{
        handshake::{Handshake, HandshakeCodec},
        payloads::{
            BasicExtensionPayload, BitfieldPayload, RequestPiecePayload, ResponsePiecePayload,
        },
        MessageFramer, PeerMessage,
    },
    metainfo::InfoHash,
    storage::Storage,
    torrent::TorrentMsg,
};

mod conn;
pub mod error;
mod event_loop;
pub mod rate;
pub mod session;

pub use error::PeerError;
pub use rate::RateChange;

type PeerWriter = SplitSink<Framed<TcpStream, MessageFramer>, PeerMessage>;
pub(crate) type BoxedMsgStream = Pin<Box<dyn Stream<Item = Msg> + Send>>;

/// Sent by the torrent to a connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    Send(PeerMessage),
    Shutdown,
}

/// Sent by a connection task to its torrent.
#[derive(Debug)]
pub enum PeerEvent {
    Handshaking,
    Connected {
        peer_id: [u8; 20],
        supports_extensions: bool,
        sender: mpsc::UnboundedSender<PeerCommand>,
    },
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(BitfieldPayload),
    Block(ResponsePiecePayload),
    Extended(BasicExtensionPayload),
    Transfer {
        uploaded: u64,
        download: Option<RateChange>,
        upload: Option<RateChange>,
    },
    Disconnected {
        error: Option<String>,
    },
}

/// What a connection task needs to serve REQUESTs without asking the torrent.
#[derive(Debug, Clone)]
pub struct UploadView {
    pub storage: Arc<Storage>,
    pub piece_length: u64,
    pub total_length: u64,
    pub have: Bitfield,
}

impl UploadView {
    /// Stream offset of a request, if it asks for data we have.
    fn locate(&self, request: &RequestPiecePayload) -> Option<u64> {
        let index = request.index as usize;
        if index >= self.have.len() || !self.have.is_set(index) {
            return None;
        }
        let piece_offset = request.index as u64 * self.piece_length;
        let piece_len = self.piece_length.min(self.total_length - piece_offset);
        let end = request.begin as u64 + request.length as u64;
        (end <= piece_len).then_some(piece_offset + request.begin as u64)
    }
}

/// Shared by every connection task of one torrent.
#[derive(Debug, Clone)]
pub(crate) struct PeerContext {
    pub info_hash: InfoHash,
    pub client_id: [u8; 20],
    pub config: PeerConfig,
    pub torrent_tx: mpsc::Sender<TorrentMsg>,
    pub uploads: watch::Receiver<Option<UploadView>>,
}

pub enum Connection {
    Outbound,
    /// Accepted by the listener, which already read the remote handshake.
    Inbound {
        framed: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    },
}

/// this enum is used to select between the different streams a peer task receives from
#[derive(Debug)]
pub(crate) enum Msg {
    Data(std::io::Result<PeerMessage>),
    Command(PeerCommand),
    /// The remote closed the socket.
    Closed,
}

pub(crate) struct Peer {
    addr: SocketAddr,
    ctx: PeerContext,
    peer_writer: PeerWriter,
    upload_queue: VecDeque<RequestPiecePayload>,
    downloaded: u64,
    uploaded: u64,
    /// Uploaded bytes not yet reported to the torrent.
    uploaded_unreported: u64,
    download_history: rate::RateHistory,
    upload_history: rate::RateHistory,
    last_sent: Instant,
}

/// Runs a connection to the end and reports how it ended.
pub(crate) async fn run_peer(ctx: PeerContext, addr: SocketAddr, connection: Connection) {
    let torrent_tx = ctx.torrent_tx.clone();
    let result = match Peer::establish(ctx, addr, connection).await {
        Ok((peer, stream)) => peer.run(stream).await,
        Err(error) => Err(error),
    };
    let error = match result {
        Ok(()) => None,
        Err(error) => {
            debug!(%addr, %error, "peer session ended");
            Some(error.to_string())
        }
    };
    // the torrent may already be gone
    let _ = torrent_tx
        .send(TorrentMsg::FromPeer {
            addr,
            event: PeerEvent::Disconnected { error },
        })
        .await;
}
