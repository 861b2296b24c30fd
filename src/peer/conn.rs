use std::{collections::VecDeque, net::SocketAddr};

use futures_util::{
    stream::{self, unfold, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{net::TcpStream, sync::mpsc, time::Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info};

use crate::{
    messages::{
        handshake::{Handshake, HandshakeCodec},
        MessageFramer,
    },
    peer::{
        error::PeerError, rate::RateHistory, BoxedMsgStream, Connection, Msg, Peer, PeerCommand,
        PeerContext, PeerEvent,
    },
    torrent::TorrentMsg,
};

type PeerReader = SplitStream<Framed<TcpStream, MessageFramer>>;

impl Peer {
    /// Connects (or takes over an accepted connection), exchanges handshakes and registers the
    /// session with the torrent.
    pub(super) async fn establish(
        ctx: PeerContext,
        addr: SocketAddr,
        connection: Connection,
    ) -> Result<(Self, BoxedMsgStream), PeerError> {
        let ours = Handshake::new(ctx.info_hash, ctx.client_id);
        let (framed, theirs) = match connection {
            Connection::Outbound => {
                let tcp = tokio::time::timeout(ctx.config.connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| PeerError::ConnectTimeout(addr))?
                    .map_err(|error| PeerError::FailedToConnect { error, addr })?;
                send_torrent(&ctx, addr, PeerEvent::Handshaking).await?;

                let mut framed = Framed::new(tcp, HandshakeCodec);
                framed.send(ours).await.map_err(PeerError::Handshake)?;
                let theirs = tokio::time::timeout(ctx.config.connect_timeout, framed.next())
                    .await
                    .map_err(|_| PeerError::ConnectTimeout(addr))?
                    .ok_or(PeerError::NoHandshake)?
                    .map_err(PeerError::Handshake)?;
                (framed, theirs)
            }
            Connection::Inbound {
                mut framed,
                handshake,
            } => {
                framed.send(ours).await.map_err(PeerError::Handshake)?;
                (framed, handshake)
            }
        };

        if theirs.info_hash != ctx.info_hash {
            return Err(PeerError::InfoHashMismatch {
                expected: ctx.info_hash,
                got: theirs.info_hash,
            });
        }
        if theirs.peer_id == ctx.client_id {
            return Err(PeerError::SelfConnection);
        }
        info!(%addr, peer_id = %String::from_utf8_lossy(&theirs.peer_id), "peer connected");

        // whatever followed the handshake stays buffered for the message framer
        let framed = framed.map_codec(|_| MessageFramer);
        let (peer_writer, peer_reader) = framed.split();

        let (sender, command_rx) = mpsc::unbounded_channel();
        send_torrent(
            &ctx,
            addr,
            PeerEvent::Connected {
                peer_id: theirs.peer_id,
                supports_extensions: theirs.supports_extensions(),
                sender,
            },
        )
        .await?;

        let receiver_stream = get_stream(peer_reader, command_rx);
        let rate_window = ctx.config.rate_window;
        Ok((
            Self {
                addr,
                ctx,
                peer_writer,
                upload_queue: VecDeque::new(),
                downloaded: 0,
                uploaded: 0,
                uploaded_unreported: 0,
                download_history: RateHistory::new(rate_window),
                upload_history: RateHistory::new(rate_window),
                last_sent: Instant::now(),
            },
            receiver_stream,
        ))
    }

    pub(super) async fn send_torrent(&self, event: PeerEvent) -> Result<(), PeerError> {
        send_torrent(&self.ctx, self.addr, event).await
    }
}

async fn send_torrent(ctx: &PeerContext, addr: SocketAddr, event: PeerEvent) -> Result<(), PeerError> {
    ctx.torrent_tx
        .send(TorrentMsg::FromPeer { addr, event })
        .await
        .map_err(|_| PeerError::TorrentGone)
}

fn get_stream(
    framed_rx: PeerReader,
    command_rx: mpsc::UnboundedReceiver<PeerCommand>,
) -> BoxedMsgStream {
    // the reader ending has to be seen even though the command stream stays open
    let peer_msg_stream = framed_rx
        .map(Msg::Data)
        .chain(stream::once(async { Msg::Closed }));

    let torrent_stream = unfold(command_rx, |mut rx| async move {
        let Some(command) = rx.recv().await else {
            debug!("torrent dropped the command channel");
            return None;
        };
        Some((Msg::Command(command), rx))
    });

    Box::pin(stream::select(peer_msg_stream, torrent_stream))
}
