use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::payloads::{
    BasicExtensionPayload, BitfieldPayload, HavePayload, Payload, PortPayload,
    RequestPiecePayload, ResponsePiecePayload,
};

pub mod handshake;
pub mod payloads;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// The index which that downloader just completed and checked the hash of.
    Have(HavePayload),
    Bitfield(BitfieldPayload),
    Request(RequestPiecePayload),
    Piece(ResponsePiecePayload),
    Cancel(RequestPiecePayload),
    /// DHT port, read and ignored.
    Port(PortPayload),
    Extended(BasicExtensionPayload),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = io::Error;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        Ok(match id {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            9 => Port,
            20 => Extended,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Invalid message type: {id}"),
                ))
            }
        })
    }
}

impl PeerMessage {
    /// `None` for the keepalive, which has no id byte.
    pub fn id(&self) -> Option<MessageId> {
        Some(match self {
            PeerMessage::KeepAlive => return None,
            PeerMessage::Choke => MessageId::Choke,
            PeerMessage::Unchoke => MessageId::Unchoke,
            PeerMessage::Interested => MessageId::Interested,
            PeerMessage::NotInterested => MessageId::NotInterested,
            PeerMessage::Have(_) => MessageId::Have,
            PeerMessage::Bitfield(_) => MessageId::Bitfield,
            PeerMessage::Request(_) => MessageId::Request,
            PeerMessage::Piece(_) => MessageId::Piece,
            PeerMessage::Cancel(_) => MessageId::Cancel,
            PeerMessage::Port(_) => MessageId::Port,
            PeerMessage::Extended(_) => MessageId::Extended,
        })
    }

    fn payload_len(&self) -> usize {
        match self {
            PeerMessage::Have(p) => p.encoded_len(),
            PeerMessage::Bitfield(p) => p.encoded_len(),
            PeerMessage::Request(p) | PeerMessage::Cancel(p) => p.encoded_len(),
            PeerMessage::Piece(p) => p.encoded_len(),
            PeerMessage::Port(p) => p.encoded_len(),
            PeerMessage::Extended(p) => p.encoded_len(),
            _ => 0,
        }
    }

    fn put_payload(&self, dst: &mut BytesMut) {
        match self {
            PeerMessage::Have(p) => p.put_be_bytes(dst),
            PeerMessage::Bitfield(p) => p.put_be_bytes(dst),
            PeerMessage::Request(p) | PeerMessage::Cancel(p) => p.put_be_bytes(dst),
            PeerMessage::Piece(p) => p.put_be_bytes(dst),
            PeerMessage::Port(p) => p.put_be_bytes(dst),
            PeerMessage::Extended(p) => p.put_be_bytes(dst),
            _ => {}
        }
    }

    fn from_parts(id: MessageId, data: &[u8]) -> io::Result<Self> {
        let expect_empty = |msg: PeerMessage| {
            if data.is_empty() {
                Ok(msg)
            } else {
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("The message {id:?} must not carry a payload."),
                ))
            }
        };
        match id {
            MessageId::Choke => expect_empty(PeerMessage::Choke),
            MessageId::Unchoke => expect_empty(PeerMessage::Unchoke),
            MessageId::Interested => expect_empty(PeerMessage::Interested),
            MessageId::NotInterested => expect_empty(PeerMessage::NotInterested),
            MessageId::Have => Ok(PeerMessage::Have(HavePayload::from_be_bytes(data)?)),
            MessageId::Bitfield => Ok(PeerMessage::Bitfield(BitfieldPayload::from_be_bytes(
                data,
            )?)),
            MessageId::Request => Ok(PeerMessage::Request(RequestPiecePayload::from_be_bytes(
                data,
            )?)),
            MessageId::Piece => Ok(PeerMessage::Piece(ResponsePiecePayload::from_be_bytes(
                data,
            )?)),
            MessageId::Cancel => Ok(PeerMessage::Cancel(RequestPiecePayload::from_be_bytes(
                data,
            )?)),
            MessageId::Port => Ok(PeerMessage::Port(PortPayload::from_be_bytes(data)?)),
            MessageId::Extended => Ok(PeerMessage::Extended(
                BasicExtensionPayload::from_be_bytes(data)?,
            )),
        }
    }
}

#[derive(Debug, Default)]
pub struct MessageFramer;

const MAX: usize = 8 * 1024 * 1024;

impl Decoder for MessageFramer {
    type Item = PeerMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            // Not enough data to read the length marker.
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length == 0 {
            src.advance(4);
            return Ok(Some(PeerMessage::KeepAlive));
        }

        // Check that the length is not too large to avoid a denial of
        // service attack where the peer makes us run out of memory.
        if length > MAX {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Frame of length {length} is too large."),
            ));
        }

        if src.len() < 4 + length {
            // The full frame has not yet arrived. Nothing is consumed until it has.
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        let id = MessageId::try_from(src[4])?;
        let message = PeerMessage::from_parts(id, &src[5..4 + length]);
        src.advance(4 + length);
        message.map(Some)
    }
}

impl Encoder<PeerMessage> for MessageFramer {
    type Error = io::Error;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let Some(id) = item.id() else {
            dst.put_u32(0);
            return Ok(());
        };
        let length = 1 + item.payload_len();
        // Don't send a message that is longer than the other end will accept.
        if length > MAX {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Frame of length {length} is too large."),
            ));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(id as u8);
        item.put_payload(dst);
        Ok(())
    }
}
