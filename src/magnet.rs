use std::net::SocketAddr;

use data_encoding::BASE32;
use thiserror::Error;
use tracing::warn;

use crate::metainfo::{parse_trackers, InfoHash};

const INFO_HASH_PREFIX: &str = "urn:btih:";

#[derive(Debug, Clone, PartialEq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    /// `dn`, the display name.
    pub name: Option<String>,
    /// Every `tr` parameter, in order.
    pub trackers: Vec<url::Url>,
    /// Peers given with `x.pe`.
    pub peers: Vec<SocketAddr>,
}

impl MagnetLink {
    pub fn from_url(url: &str) -> Result<Self, MagnetLinkError> {
        let url = url::Url::parse(url)?;
        if url.scheme() != "magnet" {
            return Err(MagnetLinkError::NoMagnetLink);
        }
        if url.query().is_none() {
            return Err(MagnetLinkError::NoQueryFound);
        }

        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();
        let mut peers = Vec::new();
        // query_pairs keeps repeated keys, which `tr` relies on
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" if info_hash.is_none() => {
                    if let Some(hash) = value.strip_prefix(INFO_HASH_PREFIX) {
                        info_hash = Some(decode_info_hash(hash)?);
                    }
                }
                "dn" => name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                "x.pe" => match value.parse() {
                    Ok(addr) => peers.push(addr),
                    Err(_) => warn!(peer = %value, "ignoring invalid peer address"),
                },
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or(MagnetLinkError::NoInfoHash)?,
            name,
            trackers: parse_trackers(trackers),
            peers,
        })
    }
}

/// Accepts the 40 character hex form and the 32 character base32 form.
fn decode_info_hash(hash: &str) -> Result<InfoHash, MagnetLinkError> {
    let bytes = match hash.len() {
        40 => hex::decode(hash).ok(),
        32 => BASE32.decode(hash.to_ascii_uppercase().as_bytes()).ok(),
        _ => None,
    };
    bytes
        .and_then(|bytes| bytes.try_into().ok())
        .map(InfoHash)
        .ok_or_else(|| MagnetLinkError::InvalidInfoHash(hash.to_string()))
}

#[derive(Error, Debug)]
pub enum MagnetLinkError {
    #[error("Failed to parse the provided string to a valid url with the error: `{0}`")]
    InvalidUrl(#[from] url::ParseError),
    #[error("The provided link is no magnet link.")]
    NoMagnetLink,
    #[error("No query was provided.")]
    NoQueryFound,
    #[error("The magnet link has no `xt=urn:btih:` parameter.")]
    NoInfoHash,
    #[error("`{0}` is neither a 40 character hex nor a 32 character base32 info hash.")]
    InvalidInfoHash(String),
}

#[cfg(test)]
mod test_magnetlink {
    use super::*;

    #[test]
    fn parse() {
        let magnet_link = MagnetLink::from_url(
            "magnet:?xt=urn:btih:ad42ce8109f54c99613ce38f9b4d87e70f24a165&dn=magnet1.gif&tr=http%3A%2F%2Fbittorrent-test-tracker.codecrafters.io%2Fannounce"
        ).expect("is valid");
        assert_eq!(
            magnet_link.info_hash,
            InfoHash([
                173, 66, 206, 129, 9, 245, 76, 153, 97, 60, 227, 143, 155, 77, 135, 231, 15, 36,
                161, 101
            ])
        );
        assert_eq!(
            magnet_link.trackers,
            vec![
                url::Url::parse("http://bittorrent-test-tracker.codecrafters.io/announce")
                    .expect("is valid")
            ]
        );
        assert_eq!(magnet_link.name, Some("magnet1.gif".to_owned()));
    }

    #[test]
    fn keeps_every_tracker() {
        let magnet_link = MagnetLink::from_url(
            "magnet:?xt=urn:btih:ad42ce8109f54c99613ce38f9b4d87e70f24a165&tr=udp%3A%2F%2Fa.example%3A80&tr=http%3A%2F%2Fb.example%2Fannounce",
        )
        .expect("is valid");
        assert_eq!(magnet_link.trackers.len(), 2);
        assert_eq!(magnet_link.trackers[0].scheme(), "udp");
        assert_eq!(magnet_link.name, None);
    }

    #[test]
    fn direct_peers() {
        let magnet_link = MagnetLink::from_url(
            "magnet:?xt=urn:btih:ad42ce8109f54c99613ce38f9b4d87e70f24a165&x.pe=127.0.0.1%3A6881&x.pe=nonsense",
        )
        .expect("is valid");
        assert_eq!(
            magnet_link.peers,
            vec!["127.0.0.1:6881".parse::<SocketAddr>().expect("valid")]
        );
    }

    #[test]
    fn base32_hash() {
        let magnet_link = MagnetLink::from_url("magnet:?xt=urn:btih:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA")
            .expect("is valid");
        assert_eq!(magnet_link.info_hash, InfoHash([0; 20]));
    }

    #[test]
    fn missing_hash() {
        assert!(matches!(
            MagnetLink::from_url("magnet:?dn=foo"),
            Err(MagnetLinkError::NoInfoHash)
        ));
        assert!(matches!(
            MagnetLink::from_url("magnet:?xt=urn:btih:1234"),
            Err(MagnetLinkError::InvalidInfoHash(_))
        ));
        assert!(matches!(
            MagnetLink::from_url("http://example.com/?xt=urn:btih:1234"),
            Err(MagnetLinkError::NoMagnetLink)
        ));
    }
}
