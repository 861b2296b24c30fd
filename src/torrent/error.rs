use std::net::SocketAddr;

use thiserror::Error;

use crate::{
    extensions::ExtensionError, metainfo::MetainfoError, source::SourceError,
    storage::StorageError,
};

#[derive(Error, Debug)]
pub enum TorrentError {
    #[error("The peer `{0}` has no running connection.")]
    PeerNotConnected(SocketAddr),
    #[error("Failed to load the metadata with the error: `{0}`")]
    Source(#[from] SourceError),
    #[error("The metadata is invalid: `{0}`")]
    Metainfo(#[from] MetainfoError),
    #[error("Failed to access the storage with the error: `{0}`")]
    Storage(#[from] StorageError),
    #[error("Failed to handle an extension message with the error: `{0}`")]
    Extension(#[from] ExtensionError),
    #[error("The torrent task is no longer running.")]
    ActorGone,
}
