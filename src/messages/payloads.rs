use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::bitfield::Bitfield;

/// A message body that can be read from and written to the wire.
pub trait Payload: Sized {
    fn from_be_bytes(data: &[u8]) -> io::Result<Self>;
    fn encoded_len(&self) -> usize;
    fn put_be_bytes(&self, dst: &mut BytesMut);
}

fn invalid(what: &str, len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Invalid {what} payload of length {len}."),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HavePayload {
    pub piece_index: u32,
}

impl Payload for HavePayload {
    fn from_be_bytes(mut data: &[u8]) -> io::Result<Self> {
        if data.len() != 4 {
            return Err(invalid("have", data.len()));
        }
        Ok(Self {
            piece_index: data.get_u32(),
        })
    }

    fn encoded_len(&self) -> usize {
        4
    }

    fn put_be_bytes(&self, dst: &mut BytesMut) {
        dst.put_u32(self.piece_index);
    }
}

/// The packed availability as sent by the remote. The number of pieces is only known to the
/// torrent, so conversion into a [`Bitfield`] happens there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitfieldPayload {
    pub pieces_available: Bytes,
}

impl BitfieldPayload {
    pub fn to_bitfield(&self, n_pieces: usize) -> Bitfield {
        Bitfield::from_bytes(&self.pieces_available, n_pieces)
    }
}

impl From<&Bitfield> for BitfieldPayload {
    fn from(bitfield: &Bitfield) -> Self {
        Self {
            pieces_available: Bytes::from(bitfield.to_bytes()),
        }
    }
}

impl Payload for BitfieldPayload {
    fn from_be_bytes(data: &[u8]) -> io::Result<Self> {
        Ok(Self {
            pieces_available: Bytes::copy_from_slice(data),
        })
    }

    fn encoded_len(&self) -> usize {
        self.pieces_available.len()
    }

    fn put_be_bytes(&self, dst: &mut BytesMut) {
        dst.extend_from_slice(&self.pieces_available);
    }
}

/// Body of both REQUEST and CANCEL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestPiecePayload {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl RequestPiecePayload {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }
}

impl Payload for RequestPiecePayload {
    fn from_be_bytes(mut data: &[u8]) -> io::Result<Self> {
        if data.len() != 12 {
            return Err(invalid("request", data.len()));
        }
        Ok(Self {
            index: data.get_u32(),
            begin: data.get_u32(),
            length: data.get_u32(),
        })
    }

    fn encoded_len(&self) -> usize {
        12
    }

    fn put_be_bytes(&self, dst: &mut BytesMut) {
        dst.put_u32(self.index);
        dst.put_u32(self.begin);
        dst.put_u32(self.length);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePiecePayload {
    pub index: u32,
    pub begin: u32,
    pub block: Bytes,
}

impl Payload for ResponsePiecePayload {
    fn from_be_bytes(mut data: &[u8]) -> io::Result<Self> {
        if data.len() < 8 {
            return Err(invalid("piece", data.len()));
        }
        let index = data.get_u32();
        let begin = data.get_u32();
        Ok(Self {
            index,
            begin,
            block: Bytes::copy_from_slice(data),
        })
    }

    fn encoded_len(&self) -> usize {
        8 + self.block.len()
    }

    fn put_be_bytes(&self, dst: &mut BytesMut) {
        dst.put_u32(self.index);
        dst.put_u32(self.begin);
        dst.extend_from_slice(&self.block);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPayload {
    pub port: u16,
}

impl Payload for PortPayload {
    fn from_be_bytes(mut data: &[u8]) -> io::Result<Self> {
        if data.len() != 2 {
            return Err(invalid("port", data.len()));
        }
        Ok(Self {
            port: data.get_u16(),
        })
    }

    fn encoded_len(&self) -> usize {
        2
    }

    fn put_be_bytes(&self, dst: &mut BytesMut) {
        dst.put_u16(self.port);
    }
}

/// This Payload is merely a holder for the extended message ID and data.
/// Resolving the ID to an extension needs the per-connection extension table, which lives in
/// the torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicExtensionPayload {
    pub extension_id: u8,
    pub data: Bytes,
}

impl Payload for BasicExtensionPayload {
    fn from_be_bytes(data: &[u8]) -> io::Result<Self> {
        let Some((&extension_id, rest)) = data.split_first() else {
            return Err(invalid("extended", 0));
        };
        Ok(Self {
            extension_id,
            data: Bytes::copy_from_slice(rest),
        })
    }

    fn encoded_len(&self) -> usize {
        1 + self.data.len()
    }

    fn put_be_bytes(&self, dst: &mut BytesMut) {
        dst.put_u8(self.extension_id);
        dst.extend_from_slice(&self.data);
    }
}
