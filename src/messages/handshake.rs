use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::metainfo::InfoHash;

pub const HANDSHAKE_LEN: usize = 68;
const PROTOCOL: &[u8; 20] = b"\x13BitTorrent protocol";
/// Bit 0x10 of reserved byte 5 advertises the extension protocol.
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: [u8; 20]) -> Self {
        let mut reserved = [0; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }
}

/// Codec for the 68 byte preamble. Once it is through, the connection switches to
/// [`MessageFramer`](super::MessageFramer) keeping whatever is left in the read buffer.
#[derive(Debug, Default)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HANDSHAKE_LEN {
            src.reserve(HANDSHAKE_LEN - src.len());
            return Ok(None);
        }
        if &src[..PROTOCOL.len()] != PROTOCOL {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "The handshake doesn't start with the BitTorrent protocol preamble.",
            ));
        }
        src.advance(PROTOCOL.len());

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id,
        }))
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_slice(PROTOCOL);
        dst.put_slice(&item.reserved);
        dst.put_slice(&item.info_hash.0);
        dst.put_slice(&item.peer_id);
        Ok(())
    }
}
