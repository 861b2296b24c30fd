//! Tunables of the engine. Everything has a sensible default.

use std::{ops::RangeInclusive, path::PathBuf, time::Duration};

/// Client wide configuration, shared by every torrent it runs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Azureus style prefix of the local peer id, padded with random characters to 20 bytes.
    pub client_prefix: String,
    /// Ports tried in order when binding the listener. `0..=0` lets the OS choose.
    pub listen_ports: RangeInclusive<u16>,
    /// Where downloaded files are placed.
    pub download_dir: PathBuf,
    pub peer: PeerConfig,
    pub tracker: TrackerConfig,
    /// How often the torrent checks for stalled requests.
    pub tick_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Requests in flight per session before it stops being ready.
    pub max_outstanding_requests: usize,
    /// Idle time after which a keepalive is sent.
    pub keepalive_interval: Duration,
    /// Delay before redialing a peer we were still interested in. `None` disables reconnects.
    pub reconnect_delay: Option<Duration>,
    /// Backoff when the storage behind an upload is busy.
    pub upload_retry_delay: Duration,
    pub upload_retry_limit: u32,
    /// Requests unanswered for this long are cancelled and handed out again.
    pub request_timeout: Option<Duration>,
    /// Window of the transfer rate history.
    pub rate_window: Duration,
    pub connect_timeout: Duration,
    /// Sessions per torrent, further discovered peers are ignored.
    pub max_peers: usize,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Number of peers asked for per announce.
    pub numwant: u32,
    pub timeout: Duration,
    /// Used when a tracker doesn't send an interval.
    pub default_interval: Duration,
    /// Wait before retrying a failed announce.
    pub retry_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_prefix: "-NT0010-".to_string(),
            listen_ports: 6881..=6889,
            download_dir: PathBuf::from("."),
            peer: PeerConfig::default(),
            tracker: TrackerConfig::default(),
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_outstanding_requests: 10,
            keepalive_interval: Duration::from_secs(120),
            reconnect_delay: Some(Duration::from_millis(5000)),
            upload_retry_delay: Duration::from_millis(10),
            upload_retry_limit: 500,
            request_timeout: Some(Duration::from_secs(60)),
            rate_window: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            max_peers: 50,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            numwant: 200,
            timeout: Duration::from_secs(15),
            default_interval: Duration::from_secs(1800),
            retry_interval: Duration::from_secs(60),
        }
    }
}
