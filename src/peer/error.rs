use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::metainfo::InfoHash;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Failed to establish a tcp connection to the address `{addr}` with error: `{error}`")]
    FailedToConnect { error: io::Error, addr: SocketAddr },
    #[error("Timed out connecting to `{0}`.")]
    ConnectTimeout(SocketAddr),
    #[error("Failed to exchange handshakes with the error: `{0}`.")]
    Handshake(io::Error),
    #[error("The remote closed the connection before completing the handshake.")]
    NoHandshake,
    #[error("The remote peer handshaked for the torrent `{got}` instead of `{expected}`.")]
    InfoHashMismatch { expected: InfoHash, got: InfoHash },
    #[error("Refusing to connect to ourselves.")]
    SelfConnection,
    #[error("Failed to send a message with type {msg_type} to the remote peer with the error: `{error}`.")]
    SendToPeer { error: io::Error, msg_type: String },
    #[error("The remote peer sent an invalid message: `{0}`")]
    Protocol(io::Error),
    #[error("The torrent this peer belongs to stopped.")]
    TorrentGone,
    #[error("The peer unexpectedly disconnected.")]
    PeerDisconnected,
}
