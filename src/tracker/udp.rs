//! The udp tracker protocol (BEP 15). A connect exchange yields a connection id, valid for a
//! minute, which every announce has to carry.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::{net::UdpSocket, time::Instant};
use tracing::trace;

use crate::tracker::{compact_peers_v4, AnnounceRequest, AnnounceResponse, TrackerError};

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const CONNECTION_TTL: Duration = Duration::from_secs(60);
const MAX_PACKET: usize = 2048;

#[derive(Debug)]
pub struct UdpTracker {
    url: url::Url,
    /// `host:port`, resolved on every announce.
    host: String,
    timeout: Duration,
    /// Identifies us to the tracker across ip changes.
    key: u32,
    connection: Option<(u64, Instant)>,
}

impl UdpTracker {
    pub fn new(url: url::Url, timeout: Duration) -> Result<Self, TrackerError> {
        let (Some(host), Some(port)) = (url.host_str(), url.port()) else {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        };
        Ok(Self {
            host: format!("{host}:{port}"),
            url,
            timeout,
            key: rand::random(),
            connection: None,
        })
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }

    pub async fn announce(
        &mut self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.host).await?;

        let connection_id = match self.connection {
            Some((id, since)) if since.elapsed() < CONNECTION_TTL => id,
            _ => {
                let transaction_id = rand::random();
                socket.send(&encode_connect(transaction_id)).await?;
                let id = parse_connect(&self.receive(&socket).await?, transaction_id)?;
                trace!(url = %self.url, "udp tracker connected");
                self.connection = Some((id, Instant::now()));
                id
            }
        };

        let transaction_id = rand::random();
        let packet = encode_announce(connection_id, transaction_id, self.key, request);
        socket.send(&packet).await?;
        let result = parse_announce(&self.receive(&socket).await?, transaction_id);
        if result.is_err() {
            // start over with a fresh connection id
            self.connection = None;
        }
        result
    }

    async fn receive(&self, socket: &UdpSocket) -> Result<Vec<u8>, TrackerError> {
        let mut buf = vec![0; MAX_PACKET];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| TrackerError::Timeout)??;
        buf.truncate(len);
        Ok(buf)
    }
}

fn encode_connect(transaction_id: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u64(PROTOCOL_ID);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);
    buf.freeze()
}

fn encode_announce(
    connection_id: u64,
    transaction_id: u32,
    key: u32,
    request: &AnnounceRequest,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(98);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(transaction_id);
    buf.put_slice(&request.info_hash.0);
    buf.put_slice(&request.peer_id);
    buf.put_u64(request.downloaded);
    buf.put_u64(request.left);
    buf.put_u64(request.uploaded);
    buf.put_u32(request.event.udp_code());
    // ip address, 0 lets the tracker use the sender's
    buf.put_u32(0);
    buf.put_u32(key);
    buf.put_i32(i32::try_from(request.numwant).unwrap_or(-1));
    buf.put_u16(request.port);
    buf.freeze()
}

/// Checks the common response header and returns the body after it.
fn response_body(
    mut packet: &[u8],
    action: u32,
    transaction_id: u32,
    min_body: usize,
) -> Result<&[u8], TrackerError> {
    if packet.len() < 8 {
        return Err(TrackerError::ShortResponse(packet.len()));
    }
    let len = packet.len();
    let got_action = packet.get_u32();
    let got_transaction = packet.get_u32();
    if got_transaction != transaction_id {
        return Err(TrackerError::TransactionMismatch {
            expected: transaction_id,
            got: got_transaction,
        });
    }
    if got_action == ACTION_ERROR {
        return Err(TrackerError::Failure(
            String::from_utf8_lossy(packet).into_owned(),
        ));
    }
    if got_action != action {
        return Err(TrackerError::UnexpectedAction(got_action));
    }
    if packet.len() < min_body {
        return Err(TrackerError::ShortResponse(len));
    }
    Ok(packet)
}

fn parse_connect(packet: &[u8], transaction_id: u32) -> Result<u64, TrackerError> {
    let mut body = response_body(packet, ACTION_CONNECT, transaction_id, 8)?;
    Ok(body.get_u64())
}

fn parse_announce(packet: &[u8], transaction_id: u32) -> Result<AnnounceResponse, TrackerError> {
    let mut body = response_body(packet, ACTION_ANNOUNCE, transaction_id, 12)?;
    let interval = body.get_u32();
    let leechers = body.get_u32();
    let seeders = body.get_u32();
    Ok(AnnounceResponse {
        interval: Some(Duration::from_secs(interval as u64)),
        peers: compact_peers_v4(body),
        complete: Some(seeders),
        incomplete: Some(leechers),
        tracker_id: None,
    })
}
