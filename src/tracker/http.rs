use std::{fmt, net::SocketAddr, time::Duration};

use serde::{
    de::{self, SeqAccess, Visitor},
    Deserialize, Deserializer, Serialize,
};
use tracing::{trace, warn};

use crate::{
    bencode,
    tracker::{
        compact_peers_v4, compact_peers_v6, AnnounceRequest, AnnounceResponse, Event, TrackerError,
    },
};

#[derive(Debug)]
pub struct HttpTracker {
    url: url::Url,
    client: reqwest::Client,
}

/// The query parameters that need no byte escaping.
#[derive(Debug, Serialize)]
struct AnnounceQuery<'a> {
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    compact: u8,
    numwant: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trackerid: Option<&'a str>,
}

impl HttpTracker {
    pub fn new(url: url::Url, timeout: Duration) -> Result<Self, TrackerError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("bittorrent-engine/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { url, client })
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }

    /// The announce url with the request appended to whatever query it already has.
    pub fn announce_url(&self, request: &AnnounceRequest) -> Result<url::Url, TrackerError> {
        let query = AnnounceQuery {
            port: request.port,
            uploaded: request.uploaded,
            downloaded: request.downloaded,
            left: request.left,
            compact: 1,
            numwant: request.numwant,
            event: (request.event != Event::None).then(|| request.event.to_string()),
            trackerid: request.tracker_id.as_deref(),
        };
        let mut url_encoded = format!(
            "info_hash={}&peer_id={}&",
            escape_bytes_url(&request.info_hash.0),
            escape_bytes_url(&request.peer_id)
        );
        url_encoded.push_str(&serde_urlencoded::to_string(&query)?);

        let mut url = self.url.clone();
        let full = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{existing}&{url_encoded}"),
            _ => url_encoded,
        };
        url.set_query(Some(&full));
        Ok(url)
    }

    pub async fn announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let url = self.announce_url(request)?;
        trace!(%url, "http announce");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::HttpStatus {
                url: self.url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;
        parse_response(&body, &self.url)
    }
}

fn escape_bytes_url(bytes: &[u8; 20]) -> String {
    bytes
        .iter()
        .map(|b| {
            if b.is_ascii_alphanumeric() {
                (*b as char).to_string()
            } else {
                format!("%{}", hex::encode([*b]))
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct HttpResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(rename = "warning message")]
    warning_message: Option<String>,
    /// Seconds the client should wait between regular announces.
    interval: Option<u64>,
    #[serde(rename = "tracker id")]
    tracker_id: Option<String>,
    complete: Option<u32>,
    incomplete: Option<u32>,
    #[serde(default, deserialize_with = "peers_v4")]
    peers: Vec<SocketAddr>,
    #[serde(default, deserialize_with = "peers_v6")]
    peers6: Vec<SocketAddr>,
}

pub(crate) fn parse_response(
    body: &[u8],
    url: &url::Url,
) -> Result<AnnounceResponse, TrackerError> {
    let response: HttpResponse =
        bencode::decode(body).map_err(|error| TrackerError::InvalidResponse {
            error,
            url: url.to_string(),
        })?;
    if let Some(reason) = response.failure_reason {
        return Err(TrackerError::Failure(reason));
    }
    if let Some(warning) = response.warning_message {
        warn!(%url, %warning, "tracker warning");
    }
    let mut peers = response.peers;
    peers.extend(response.peers6);
    Ok(AnnounceResponse {
        interval: response.interval.map(Duration::from_secs),
        peers,
        complete: response.complete,
        incomplete: response.incomplete,
        tracker_id: response.tracker_id,
    })
}

/// A peer of the non-compact form.
#[derive(Debug, Deserialize)]
struct DictPeer {
    ip: String,
    port: u16,
}

/// Peers either as a compact byte string of `addr_len` sized entries or as a list of
/// dictionaries.
struct PeersVisitor {
    addr_len: usize,
}

impl<'de> Visitor<'de> for PeersVisitor {
    type Value = Vec<SocketAddr>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            "a string of multiples of {} bytes or a list of peers",
            self.addr_len
        )
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v.len() % self.addr_len != 0 {
            return Err(de::Error::custom(format!(
                "Bytes which length is a multiple of {}. Got {:?}",
                self.addr_len,
                v.len()
            )));
        }
        Ok(match self.addr_len {
            6 => compact_peers_v4(v),
            _ => compact_peers_v6(v),
        })
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut peers = Vec::new();
        while let Some(peer) = seq.next_element::<DictPeer>()? {
            match peer.ip.parse() {
                Ok(ip) => peers.push(SocketAddr::new(ip, peer.port)),
                // host names aren't resolved
                Err(_) => trace!(ip = %peer.ip, "skipping peer without an ip address"),
            }
        }
        Ok(peers)
    }
}

fn peers_v4<'de, D>(deserializer: D) -> Result<Vec<SocketAddr>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(PeersVisitor { addr_len: 6 })
}

fn peers_v6<'de, D>(deserializer: D) -> Result<Vec<SocketAddr>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(PeersVisitor { addr_len: 18 })
}
