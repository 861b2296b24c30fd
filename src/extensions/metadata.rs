//! `ut_metadata`: fetching the info dictionary from peers, and serving it once we have it.

use std::{collections::HashMap, net::SocketAddr};

use bytes::Bytes;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use tracing::{debug, info, warn};

use crate::{
    bencode,
    bitfield::Bitfield,
    extensions::{
        handshake::ExtendedHandshake, ExtensionAction, ExtensionContext, ExtensionError,
        ExtensionHandler, ExtensionType,
    },
    metainfo::InfoHash,
};

/// The metadata is handled in blocks of 16KiB (16384 Bytes).
pub const METADATA_PIECE_SIZE: usize = 16384;
/// Larger announced sizes are refused.
const MAX_METADATA_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum MetadataMsgType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataMsg {
    pub msg_type: MetadataMsgType,
    #[serde(rename = "piece")]
    pub piece_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
}

impl MetadataMsg {
    pub fn request(piece_index: u32) -> Self {
        Self {
            msg_type: MetadataMsgType::Request,
            piece_index,
            total_size: None,
        }
    }

    pub fn reject(piece_index: u32) -> Self {
        Self {
            msg_type: MetadataMsgType::Reject,
            piece_index,
            total_size: None,
        }
    }
}

/// Collects the pieces of the info dictionary.
#[derive(Debug)]
struct MetadataAssembler {
    size: usize,
    buf: Vec<u8>,
    received: Bitfield,
    requested: Bitfield,
}

impl MetadataAssembler {
    fn new(size: usize) -> Self {
        let n_pieces = size.div_ceil(METADATA_PIECE_SIZE);
        Self {
            size,
            buf: vec![0; size],
            received: Bitfield::new(n_pieces),
            requested: Bitfield::new(n_pieces),
        }
    }

    fn piece_len(&self, index: usize) -> usize {
        METADATA_PIECE_SIZE.min(self.size - index * METADATA_PIECE_SIZE)
    }

    /// A random piece that is neither received nor requested, marked requested.
    fn next_piece(&mut self) -> Option<u32> {
        let index = self
            .received
            .or(&self.requested)
            .unset_indices()
            .choose(&mut rand::rng())?;
        self.requested.set(index);
        Some(index as u32)
    }

    fn release(&mut self, index: u32) {
        if (index as usize) < self.requested.len() {
            self.requested.unset(index as usize);
        }
    }

    fn insert(&mut self, index: u32, data: &[u8]) -> Result<(), ExtensionError> {
        let i = index as usize;
        if i >= self.received.len() || data.len() != self.piece_len(i) {
            return Err(ExtensionError::InvalidMetadataPiece(index));
        }
        let start = i * METADATA_PIECE_SIZE;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.received.set(i);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.received.is_complete()
    }

    fn reset(&mut self) {
        self.received.clear();
        self.requested.clear();
    }
}

#[derive(Debug, Default)]
pub struct MetadataExchange {
    assembler: Option<MetadataAssembler>,
    /// The pieces each peer was asked for.
    requested_from: HashMap<SocketAddr, Vec<u32>>,
    /// Peers able to serve the metadata.
    sources: Vec<SocketAddr>,
}

impl MetadataExchange {
    fn request_from(&mut self, peer: SocketAddr) -> Result<ExtensionAction, ExtensionError> {
        let Some(index) = self.assembler.as_mut().and_then(MetadataAssembler::next_piece) else {
            return Ok(ExtensionAction::Nothing);
        };
        debug!(%peer, piece = index, "requesting metadata piece");
        self.requested_from.entry(peer).or_default().push(index);
        Ok(ExtensionAction::SendPeer {
            peer,
            payload: bencode::encode(&MetadataMsg::request(index))?,
        })
    }

    fn forget_request(&mut self, peer: SocketAddr, index: u32) {
        if let Some(pieces) = self.requested_from.get_mut(&peer) {
            pieces.retain(|&piece| piece != index);
        }
    }

    fn serve(&self, info_bytes: Option<&Bytes>, index: u32) -> Result<Vec<u8>, ExtensionError> {
        let start = index as usize * METADATA_PIECE_SIZE;
        let Some(info_bytes) = info_bytes.filter(|bytes| start < bytes.len()) else {
            return Ok(bencode::encode(&MetadataMsg::reject(index))?);
        };
        let end = (start + METADATA_PIECE_SIZE).min(info_bytes.len());
        let mut payload = bencode::encode(&MetadataMsg {
            msg_type: MetadataMsgType::Data,
            piece_index: index,
            total_size: Some(info_bytes.len() as u64),
        })?;
        payload.extend_from_slice(&info_bytes[start..end]);
        Ok(payload)
    }

    fn on_data(
        &mut self,
        ctx: &ExtensionContext<'_>,
        index: u32,
        data: &[u8],
    ) -> Result<ExtensionAction, ExtensionError> {
        self.forget_request(ctx.peer, index);
        let Some(assembler) = self.assembler.as_mut() else {
            return Ok(ExtensionAction::Nothing);
        };
        assembler.insert(index, data)?;
        if !assembler.is_complete() {
            return self.request_from(ctx.peer);
        }

        if InfoHash::of(&assembler.buf) != ctx.info_hash {
            warn!("assembled metadata doesn't match the info hash, starting over");
            assembler.reset();
            self.requested_from.clear();
            let actions = self
                .sources
                .clone()
                .into_iter()
                .map(|peer| self.request_from(peer))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(ExtensionAction::Multiple(actions));
        }

        info!(size = assembler.size, "metadata complete");
        let bytes = Bytes::from(std::mem::take(&mut assembler.buf));
        self.assembler = None;
        self.requested_from.clear();
        self.sources.clear();
        Ok(ExtensionAction::MetadataComplete(bytes))
    }
}

impl ExtensionHandler for MetadataExchange {
    fn ext_type(&self) -> ExtensionType {
        ExtensionType::Metadata
    }

    fn handle_message(
        &mut self,
        ctx: &ExtensionContext<'_>,
        data: &[u8],
    ) -> Result<ExtensionAction, ExtensionError> {
        let (msg, consumed): (MetadataMsg, usize) = bencode::decode_prefix(data)?;
        match msg.msg_type {
            MetadataMsgType::Request => Ok(ExtensionAction::SendPeer {
                peer: ctx.peer,
                payload: self.serve(ctx.info_bytes, msg.piece_index)?,
            }),
            MetadataMsgType::Data if ctx.info_bytes.is_some() => Ok(ExtensionAction::Nothing),
            MetadataMsgType::Data => self.on_data(ctx, msg.piece_index, &data[consumed..]),
            MetadataMsgType::Reject => {
                debug!(peer = %ctx.peer, piece = msg.piece_index, "metadata request rejected");
                self.forget_request(ctx.peer, msg.piece_index);
                if let Some(assembler) = self.assembler.as_mut() {
                    assembler.release(msg.piece_index);
                }
                Ok(ExtensionAction::Nothing)
            }
        }
    }

    fn on_handshake(
        &mut self,
        ctx: &ExtensionContext<'_>,
        handshake: &ExtendedHandshake,
    ) -> ExtensionAction {
        if ctx.info_bytes.is_some()
            || !handshake
                .remote_table()
                .contains_key(&ExtensionType::Metadata.to_string())
        {
            return ExtensionAction::Nothing;
        }
        if self.assembler.is_none() {
            match handshake.metadata_size {
                Some(size) if size > 0 && size <= MAX_METADATA_SIZE => {
                    debug!(size, "sizing metadata");
                    self.assembler = Some(MetadataAssembler::new(size as usize));
                }
                Some(size) => {
                    warn!(peer = %ctx.peer, size, "{}", ExtensionError::InvalidMetadataSize(size));
                    return ExtensionAction::Nothing;
                }
                None => return ExtensionAction::Nothing,
            }
        }
        if !self.sources.contains(&ctx.peer) {
            self.sources.push(ctx.peer);
        }
        self.request_from(ctx.peer).unwrap_or_else(|error| {
            warn!(%error, "failed to build metadata request");
            ExtensionAction::Nothing
        })
    }

    fn on_disconnect(&mut self, peer: SocketAddr) {
        self.sources.retain(|&source| source != peer);
        let Some(pieces) = self.requested_from.remove(&peer) else {
            return;
        };
        if let Some(assembler) = self.assembler.as_mut() {
            for index in pieces {
                assembler.release(index);
            }
        }
    }
}

#[cfg(test)]
mod test_metadata {
    use super::*;

    fn info_bytes() -> Bytes {
        Bytes::from((0..40_000u32).map(|i| (i % 256) as u8).collect::<Vec<_>>())
    }

    fn handshake(size: u64) -> ExtendedHandshake {
        ExtendedHandshake {
            m: HashMap::from([("ut_metadata".to_string(), 1)]),
            metadata_size: Some(size),
            ..Default::default()
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn payload(action: ExtensionAction) -> Vec<u8> {
        match action {
            ExtensionAction::SendPeer { payload, .. } => payload,
            other => panic!("expected a message to send, got {other:?}"),
        }
    }

    #[test]
    fn fetches_metadata_from_a_peer() {
        let info = info_bytes();
        let info_hash = InfoHash::of(&info);
        let mut seeder = MetadataExchange::default();
        let mut leecher = MetadataExchange::default();
        let leecher_ctx = ExtensionContext {
            peer: addr(1),
            info_hash,
            info_bytes: None,
        };
        let seeder_ctx = ExtensionContext {
            peer: addr(2),
            info_hash,
            info_bytes: Some(&info),
        };

        let mut action = leecher.on_handshake(&leecher_ctx, &handshake(info.len() as u64));
        for _ in 0..3 {
            let request = payload(action);
            let (msg, _): (MetadataMsg, usize) =
                bencode::decode_prefix(&request).expect("decodes");
            assert_eq!(msg.msg_type, MetadataMsgType::Request);

            let data = payload(seeder.handle_message(&seeder_ctx, &request).expect("serves"));
            action = leecher.handle_message(&leecher_ctx, &data).expect("accepts");
        }
        assert_eq!(action, ExtensionAction::MetadataComplete(info));
    }

    #[test]
    fn rejected_pieces_are_requested_again() {
        let info = info_bytes();
        let info_hash = InfoHash::of(&info);
        let mut leecher = MetadataExchange::default();
        let ctx = |port| ExtensionContext {
            peer: addr(port),
            info_hash,
            info_bytes: None,
        };
        // a seeder without metadata rejects everything
        let empty = MetadataExchange::default();
        for port in 1..=3 {
            let request = payload(leecher.on_handshake(&ctx(port), &handshake(info.len() as u64)));
            let (msg, _): (MetadataMsg, usize) =
                bencode::decode_prefix(&request).expect("decodes");
            let reject = empty.serve(None, msg.piece_index).expect("encodes");
            assert_eq!(
                leecher.handle_message(&ctx(port), &reject).expect("accepts"),
                ExtensionAction::Nothing
            );
        }
        // all three pieces were handed back, so a fourth peer still gets a request
        assert!(matches!(
            leecher.on_handshake(&ctx(4), &handshake(info.len() as u64)),
            ExtensionAction::SendPeer { .. }
        ));
    }

    #[test]
    fn disconnect_releases_requested_pieces() {
        let info_hash = InfoHash([1; 20]);
        let mut leecher = MetadataExchange::default();
        let ctx = |port| ExtensionContext {
            peer: addr(port),
            info_hash,
            info_bytes: None,
        };
        // a single piece
        leecher.on_handshake(&ctx(1), &handshake(100));
        assert_eq!(
            leecher.on_handshake(&ctx(2), &handshake(100)),
            ExtensionAction::Nothing
        );
        leecher.on_disconnect(addr(1));
        assert!(matches!(
            leecher.on_handshake(&ctx(2), &handshake(100)),
            ExtensionAction::SendPeer { .. }
        ));
    }

    #[test]
    fn hash_mismatch_starts_over() {
        let info = info_bytes();
        let mut seeder = MetadataExchange::default();
        let mut leecher = MetadataExchange::default();
        let leecher_ctx = ExtensionContext {
            peer: addr(1),
            info_hash: InfoHash([0; 20]),
            info_bytes: None,
        };
        let seeder_ctx = ExtensionContext {
            peer: addr(2),
            info_hash: InfoHash::of(&info),
            info_bytes: Some(&info),
        };

        let mut action = leecher.on_handshake(&leecher_ctx, &handshake(info.len() as u64));
        for _ in 0..3 {
            let data = payload(
                seeder
                    .handle_message(&seeder_ctx, &payload(action))
                    .expect("serves"),
            );
            action = leecher.handle_message(&leecher_ctx, &data).expect("accepts");
        }
        let ExtensionAction::Multiple(actions) = action else {
            panic!("expected new requests, got {action:?}");
        };
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ExtensionAction::SendPeer { peer, .. } if peer == addr(1)));
    }

    #[test]
    fn out_of_range_requests_are_rejected() {
        let info = info_bytes();
        let mut seeder = MetadataExchange::default();
        let ctx = ExtensionContext {
            peer: addr(1),
            info_hash: InfoHash::of(&info),
            info_bytes: Some(&info),
        };
        let request = bencode::encode(&MetadataMsg::request(3)).expect("encodes");
        let reply = payload(seeder.handle_message(&ctx, &request).expect("answers"));
        let msg: MetadataMsg = bencode::decode(&reply).expect("only a dictionary");
        assert_eq!(msg, MetadataMsg::reject(3));

        let request = bencode::encode(&MetadataMsg::request(2)).expect("encodes");
        let reply = payload(seeder.handle_message(&ctx, &request).expect("answers"));
        let (msg, consumed): (MetadataMsg, usize) =
            bencode::decode_prefix(&reply).expect("decodes");
        assert_eq!(msg.total_size, Some(40_000));
        assert_eq!(&reply[consumed..], &info[2 * METADATA_PIECE_SIZE..]);
    }
}
