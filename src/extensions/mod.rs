//! The extension protocol. Handlers are registered per torrent, the one registered at position
//! `i` is advertised to peers with the message id `i + 1` (0 is the extended handshake).

use std::{collections::HashMap, net::SocketAddr};

use bytes::Bytes;
use strum::Display;
use thiserror::Error;

use crate::{
    bencode::BencodeError,
    extensions::{handshake::ExtendedHandshake, metadata::MetadataExchange},
    metainfo::InfoHash,
};

pub mod handshake;
pub mod metadata;

/// The extended message id of the handshake.
pub const HANDSHAKE_ID: u8 = 0;

/// Represents an action the torrent should take after an extension message is handled.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionAction {
    /// Send a message of this extension to a remote peer.
    SendPeer { peer: SocketAddr, payload: Vec<u8> },
    /// The complete and verified info dictionary arrived.
    MetadataComplete(Bytes),
    /// Multiple actions
    Multiple(Vec<ExtensionAction>),
    /// Do nothing.
    Nothing,
}

/// Enum that represents the currently supported Extensions
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionType {
    #[strum(to_string = "ut_metadata")]
    Metadata,
}

/// What a handler may look at while handling a message.
#[derive(Debug, Clone, Copy)]
pub struct ExtensionContext<'a> {
    pub peer: SocketAddr,
    pub info_hash: InfoHash,
    /// The raw info dictionary, once the torrent has it.
    pub info_bytes: Option<&'a Bytes>,
}

/// The core trait for handling extension-specific logic.
pub trait ExtensionHandler: Send + Sync + std::fmt::Debug {
    fn ext_type(&self) -> ExtensionType;

    /// Called when an extended message with this handler's id arrives.
    fn handle_message(
        &mut self,
        ctx: &ExtensionContext<'_>,
        data: &[u8],
    ) -> Result<ExtensionAction, ExtensionError>;

    /// Called once the remote's extended handshake arrived. Lets a handler start talking.
    fn on_handshake(
        &mut self,
        _ctx: &ExtensionContext<'_>,
        _handshake: &ExtendedHandshake,
    ) -> ExtensionAction {
        ExtensionAction::Nothing
    }

    fn on_disconnect(&mut self, _peer: SocketAddr) {}
}

#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    handlers: Vec<Box<dyn ExtensionHandler>>,
}

impl ExtensionRegistry {
    /// A registry with every extension this crate implements.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(Box::new(MetadataExchange::default()));
        registry
    }

    /// Adds a handler, returning the id peers have to use to reach it.
    pub fn register(&mut self, handler: Box<dyn ExtensionHandler>) -> u8 {
        self.handlers.push(handler);
        self.handlers.len() as u8
    }

    /// The `m` dictionary of our extended handshake.
    pub fn local_table(&self) -> HashMap<String, i64> {
        self.handlers
            .iter()
            .enumerate()
            .map(|(i, handler)| (handler.ext_type().to_string(), i as i64 + 1))
            .collect()
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Box<dyn ExtensionHandler>> {
        let index = (id as usize).checked_sub(1)?;
        self.handlers.get_mut(index)
    }

    pub fn handlers_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn ExtensionHandler>> {
        self.handlers.iter_mut()
    }
}

#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("The remote peer doesn't support the extension `{0}`.")]
    Unsupported(String),
    #[error("The remote peer sent the unknown extended message id {0}.")]
    UnknownId(u8),
    #[error("Failed to decode the extension message with the error: `{0}`")]
    Bencode(#[from] BencodeError),
    #[error("Refusing metadata of {0} bytes.")]
    InvalidMetadataSize(u64),
    #[error("The metadata piece {0} doesn't exist or has the wrong length.")]
    InvalidMetadataPiece(u32),
}

#[cfg(test)]
mod test_registry {
    use super::*;

    #[test]
    fn ids_follow_registration_order() {
        let mut registry = ExtensionRegistry::with_defaults();
        assert_eq!(
            registry.local_table(),
            HashMap::from([("ut_metadata".to_string(), 1)])
        );
        assert!(registry.get_mut(HANDSHAKE_ID).is_none());
        assert_eq!(
            registry.get_mut(1).map(|handler| handler.ext_type()),
            Some(ExtensionType::Metadata)
        );
        assert!(registry.get_mut(2).is_none());
    }
}
