use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{
    bencode,
    extensions::{
        handshake::ExtendedHandshake, ExtensionAction, ExtensionContext, ExtensionError,
        ExtensionType, HANDSHAKE_ID,
    },
    messages::{payloads::BasicExtensionPayload, PeerMessage},
    metainfo::Metainfo,
    torrent::{Torrent, TorrentError},
};

impl Torrent {
    /// Dispatches an extended message by the id we advertised for it. Anything malformed ends
    /// the session.
    pub(super) async fn on_extended(&mut self, addr: SocketAddr, payload: BasicExtensionPayload) {
        let result = if payload.extension_id == HANDSHAKE_ID {
            self.on_extended_handshake(addr, &payload.data)
        } else {
            self.dispatch_extension(addr, payload.extension_id, &payload.data)
        };
        let actions = match result {
            Ok(actions) => actions,
            Err(error) => {
                warn!(peer = %addr, %error, "invalid extension message, dropping peer");
                return self.drop_peer(addr);
            }
        };
        for (ext_type, action) in actions {
            self.perform(ext_type, action).await;
        }
    }

    fn on_extended_handshake(
        &mut self,
        addr: SocketAddr,
        data: &[u8],
    ) -> Result<Vec<(ExtensionType, ExtensionAction)>, ExtensionError> {
        let handshake: ExtendedHandshake = bencode::decode(data)?;
        let Some(session) = self.peers.get_mut(&addr) else {
            return Ok(Vec::new());
        };
        session.extensions = handshake.remote_table();
        session.metadata_size = handshake.metadata_size;
        session.client_name = handshake.v.clone();
        debug!(
            peer = %addr,
            client = ?handshake.v,
            extensions = ?session.extensions,
            our_ip = ?handshake.your_ip(),
            "received extended handshake"
        );

        let ctx = ExtensionContext {
            peer: addr,
            info_hash: self.info_hash,
            info_bytes: self.metainfo.as_ref().map(|m| &m.info_bytes),
        };
        let mut actions = Vec::new();
        for handler in self.extensions.handlers_mut() {
            let action = handler.on_handshake(&ctx, &handshake);
            flatten(handler.ext_type(), action, &mut actions);
        }
        Ok(actions)
    }

    fn dispatch_extension(
        &mut self,
        addr: SocketAddr,
        id: u8,
        data: &[u8],
    ) -> Result<Vec<(ExtensionType, ExtensionAction)>, ExtensionError> {
        let ctx = ExtensionContext {
            peer: addr,
            info_hash: self.info_hash,
            info_bytes: self.metainfo.as_ref().map(|m| &m.info_bytes),
        };
        let handler = self
            .extensions
            .get_mut(id)
            .ok_or(ExtensionError::UnknownId(id))?;
        let ext_type = handler.ext_type();
        let action = handler.handle_message(&ctx, data)?;
        let mut actions = Vec::new();
        flatten(ext_type, action, &mut actions);
        Ok(actions)
    }

    async fn perform(&mut self, ext_type: ExtensionType, action: ExtensionAction) {
        match action {
            ExtensionAction::SendPeer { peer, payload } => {
                match self.send_extension(peer, ext_type, payload) {
                    Ok(()) => {}
                    Err(TorrentError::Extension(error)) => {
                        warn!(%peer, %error, "not sending extension message")
                    }
                    Err(error) => debug!(%peer, %error, "failed to send extension message"),
                }
            }
            ExtensionAction::MetadataComplete(info_bytes) => self.on_metadata(info_bytes).await,
            // flattened before
            ExtensionAction::Multiple(_) | ExtensionAction::Nothing => {}
        }
    }

    /// Sends a message of `ext_type` with the id the remote advertised for it.
    pub(super) fn send_extension(
        &self,
        addr: SocketAddr,
        ext_type: ExtensionType,
        payload: Vec<u8>,
    ) -> Result<(), TorrentError> {
        let session = self
            .peers
            .get(&addr)
            .ok_or(TorrentError::PeerNotConnected(addr))?;
        let name = ext_type.to_string();
        let extension_id = *session
            .extensions
            .get(&name)
            .ok_or(ExtensionError::Unsupported(name))?;
        session.send(PeerMessage::Extended(BasicExtensionPayload {
            extension_id,
            data: Bytes::from(payload),
        }))
    }

    async fn on_metadata(&mut self, info_bytes: Bytes) {
        if self.download.is_some() {
            return;
        }
        let metainfo = match Metainfo::from_metadata(info_bytes, self.info_hash, self.announce.clone())
        {
            Ok(metainfo) => metainfo,
            Err(error) => {
                warn!(%error, "received metadata is unusable");
                return;
            }
        };
        info!(name = %metainfo.info.name, "received metadata from peers");
        if let Err(error) = self.setup(metainfo).await {
            self.fail(error);
        }
    }
}

fn flatten(
    ext_type: ExtensionType,
    action: ExtensionAction,
    out: &mut Vec<(ExtensionType, ExtensionAction)>,
) {
    match action {
        ExtensionAction::Multiple(actions) => {
            for action in actions {
                flatten(ext_type, action, out);
            }
        }
        ExtensionAction::Nothing => {}
        action => out.push((ext_type, action)),
    }
}
