use futures_util::{SinkExt, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::{
    messages::{
        payloads::{RequestPiecePayload, ResponsePiecePayload},
        PeerMessage,
    },
    peer::{error::PeerError, rate::SAMPLE_INTERVAL, BoxedMsgStream, Msg, Peer, PeerCommand, PeerEvent},
};

/// Largest block we serve. Peers asking for more get nothing.
const MAX_UPLOAD_REQUEST: u32 = 1 << 17;
/// Queued upload requests per peer, further requests are dropped.
const MAX_UPLOAD_QUEUE: usize = 256;

impl Peer {
    pub(super) async fn run(mut self, mut receiver_stream: BoxedMsgStream) -> Result<(), PeerError> {
        let keepalive_interval = self.ctx.config.keepalive_interval;
        let keepalive = tokio::time::sleep(keepalive_interval);
        tokio::pin!(keepalive);
        let mut rate_tick = tokio::time::interval(SAMPLE_INTERVAL);
        rate_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = receiver_stream.next() => match message {
                    Some(Msg::Data(Ok(message))) => self.handle_message(message).await?,
                    Some(Msg::Data(Err(error))) => return Err(PeerError::Protocol(error)),
                    Some(Msg::Command(PeerCommand::Send(message))) => self.send_peer(message).await?,
                    Some(Msg::Command(PeerCommand::Shutdown)) => {
                        debug!(addr = %self.addr, "shutting down peer");
                        return Ok(());
                    }
                    Some(Msg::Closed) | None => return Err(PeerError::PeerDisconnected),
                },
                _ = &mut keepalive => self.send_peer(PeerMessage::KeepAlive).await?,
                _ = rate_tick.tick() => self.sample_rates().await?,
                _ = std::future::ready(()), if !self.upload_queue.is_empty() => {
                    self.serve_next_upload().await?
                }
            }
            // a keepalive is only due after a quiet interval on our side
            keepalive
                .as_mut()
                .reset(self.last_sent + keepalive_interval);
        }
    }

    async fn handle_message(&mut self, message: PeerMessage) -> Result<(), PeerError> {
        match message {
            PeerMessage::KeepAlive => trace!(addr = %self.addr, "received keepalive"),
            PeerMessage::Choke => self.send_torrent(PeerEvent::Choke).await?,
            PeerMessage::Unchoke => self.send_torrent(PeerEvent::Unchoke).await?,
            PeerMessage::Interested => self.send_torrent(PeerEvent::Interested).await?,
            PeerMessage::NotInterested => self.send_torrent(PeerEvent::NotInterested).await?,
            PeerMessage::Have(have_payload) => {
                self.send_torrent(PeerEvent::Have(have_payload.piece_index))
                    .await?
            }
            PeerMessage::Bitfield(bitfield_payload) => {
                self.send_torrent(PeerEvent::Bitfield(bitfield_payload))
                    .await?
            }
            PeerMessage::Request(request) => self.queue_upload(request),
            PeerMessage::Cancel(request) => self.upload_queue.retain(|queued| *queued != request),
            PeerMessage::Piece(block) => {
                self.downloaded += block.block.len() as u64;
                self.send_torrent(PeerEvent::Block(block)).await?
            }
            PeerMessage::Port(port) => trace!(addr = %self.addr, port = port.port, "ignoring dht port"),
            PeerMessage::Extended(payload) => self.send_torrent(PeerEvent::Extended(payload)).await?,
        }
        Ok(())
    }

    fn queue_upload(&mut self, request: RequestPiecePayload) {
        if request.length == 0 || request.length > MAX_UPLOAD_REQUEST {
            debug!(addr = %self.addr, ?request, "dropping request of invalid size");
            return;
        }
        if self.upload_queue.len() >= MAX_UPLOAD_QUEUE {
            debug!(addr = %self.addr, "upload queue full, dropping request");
            return;
        }
        if !self.upload_queue.contains(&request) {
            self.upload_queue.push_back(request);
        }
    }

    /// Answers the oldest queued request. Requests for data we don't have are dropped, as are
    /// requests the storage fails on.
    async fn serve_next_upload(&mut self) -> Result<(), PeerError> {
        let Some(request) = self.upload_queue.pop_front() else {
            return Ok(());
        };
        let view = self.ctx.uploads.borrow().clone();
        let Some((view, offset)) = view.and_then(|view| view.locate(&request).map(|o| (view, o)))
        else {
            debug!(addr = %self.addr, ?request, "dropping request for data we don't have");
            return Ok(());
        };
        // busy files are retried by the storage itself
        let block = match view.storage.read_range(offset, request.length as u64).await {
            Ok(block) => block,
            Err(error) => {
                warn!(addr = %self.addr, ?request, %error, "failed to read block for upload");
                return Ok(());
            }
        };
        self.uploaded += block.len() as u64;
        self.uploaded_unreported += block.len() as u64;
        self.send_peer(PeerMessage::Piece(ResponsePiecePayload {
            index: request.index,
            begin: request.begin,
            block,
        }))
        .await
    }

    async fn sample_rates(&mut self) -> Result<(), PeerError> {
        let now = Instant::now();
        let download = self.download_history.record(now, self.downloaded);
        let upload = self.upload_history.record(now, self.uploaded);
        if download.is_none() && upload.is_none() && self.uploaded_unreported == 0 {
            return Ok(());
        }
        let uploaded = std::mem::take(&mut self.uploaded_unreported);
        self.send_torrent(PeerEvent::Transfer {
            uploaded,
            download,
            upload,
        })
        .await
    }

    pub(super) async fn send_peer(&mut self, message: PeerMessage) -> Result<(), PeerError> {
        let msg_type = format!("{:?}", message.id());
        self.peer_writer
            .send(message)
            .await
            .map_err(|error| PeerError::SendToPeer { error, msg_type })?;
        self.last_sent = Instant::now();
        Ok(())
    }
}
