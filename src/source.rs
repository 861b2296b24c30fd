//! Where the initial metadata of a torrent comes from.

use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::{
    magnet::{MagnetLink, MagnetLinkError},
    metainfo::{Metainfo, MetainfoError},
};

#[derive(Debug, Clone)]
pub enum MetadataSource {
    File(PathBuf),
    Http(url::Url),
    Magnet(MagnetLink),
    /// Metainfo that is already parsed.
    Metainfo(Box<Metainfo>),
}

/// What a source resolves to: either everything, or just enough to fetch the rest from peers.
#[derive(Debug, Clone)]
pub enum Resolved {
    Metainfo(Box<Metainfo>),
    Magnet(MagnetLink),
}

impl MetadataSource {
    /// Plain paths and `file:` urls are files, `http(s):` urls are downloaded, `magnet:` links
    /// are parsed.
    pub fn parse(source: &str) -> Result<Self, SourceError> {
        let url = match url::Url::parse(source) {
            Ok(url) => url,
            // not a url at all, so a relative or absolute path
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                return Ok(Self::File(PathBuf::from(source)))
            }
            Err(error) => return Err(SourceError::InvalidUrl(error)),
        };
        match url.scheme() {
            "magnet" => Ok(Self::Magnet(MagnetLink::from_url(source)?)),
            "http" | "https" => Ok(Self::Http(url)),
            "file" => url
                .to_file_path()
                .map(Self::File)
                .map_err(|()| SourceError::UnsupportedScheme(source.to_string())),
            // windows drive letters parse as a one letter scheme
            scheme if scheme.len() == 1 => Ok(Self::File(PathBuf::from(source))),
            _ => Err(SourceError::UnsupportedScheme(source.to_string())),
        }
    }

    pub async fn load(self) -> Result<Resolved, SourceError> {
        match self {
            Self::File(path) => {
                debug!(path = %path.display(), "reading metainfo file");
                let bytes =
                    tokio::fs::read(&path)
                        .await
                        .map_err(|error| SourceError::ReadFile {
                            path: path.clone(),
                            error,
                        })?;
                Ok(Resolved::Metainfo(Box::new(Metainfo::from_bytes(&bytes)?)))
            }
            Self::Http(url) => {
                debug!(%url, "downloading metainfo");
                // redirects are followed and gzip/deflate bodies decoded by the client
                let response = reqwest::get(url.clone()).await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(SourceError::HttpStatus {
                        url: url.to_string(),
                        status: status.as_u16(),
                    });
                }
                let bytes = response.bytes().await?;
                Ok(Resolved::Metainfo(Box::new(Metainfo::from_bytes(&bytes)?)))
            }
            Self::Magnet(magnet_link) => Ok(Resolved::Magnet(magnet_link)),
            Self::Metainfo(metainfo) => Ok(Resolved::Metainfo(metainfo)),
        }
    }
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to parse the metadata source with the error: `{0}`")]
    InvalidUrl(url::ParseError),
    #[error("There is no metadata loader for `{0}`.")]
    UnsupportedScheme(String),
    #[error("Failed to read the metainfo file `{path}` with the error: `{error}`")]
    ReadFile {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("The metainfo request to `{url}` answered with status {status}.")]
    HttpStatus { url: String, status: u16 },
    #[error("Something failed with requesting the metainfo: `{0}`")]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Metainfo(#[from] MetainfoError),
    #[error(transparent)]
    Magnet(#[from] MagnetLinkError),
}
