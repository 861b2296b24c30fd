use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// The dictionary exchanged as extended message 0.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExtendedHandshake {
    /// Extension names to the message ids the sender wants to receive them with. 0 disables.
    #[serde(default)]
    pub m: HashMap<String, i64>,
    /// Local TCP listen port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<u16>,
    /// Client name and version (as a utf-8 string).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    /// Size of the info dictionary, sent by peers that can serve it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<u64>,
    /// An integer, the number of outstanding request messages this client supports without dropping any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reqq: Option<u32>,
    /// Our address as the sender sees it, 4 or 16 bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yourip: Option<ByteBuf>,
}

impl ExtendedHandshake {
    /// The ids usable towards the sender, disabled and out of range entries left out.
    pub fn remote_table(&self) -> HashMap<String, u8> {
        self.m
            .iter()
            .filter_map(|(name, &id)| {
                u8::try_from(id)
                    .ok()
                    .filter(|&id| id != 0)
                    .map(|id| (name.clone(), id))
            })
            .collect()
    }

    pub fn your_ip(&self) -> Option<IpAddr> {
        let bytes: &[u8] = self.yourip.as_deref()?;
        if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
            return Some(Ipv4Addr::from(octets).into());
        }
        <[u8; 16]>::try_from(bytes)
            .ok()
            .map(|octets| Ipv6Addr::from(octets).into())
    }

    pub fn compact_ip(ip: IpAddr) -> ByteBuf {
        match ip {
            IpAddr::V4(ip) => ByteBuf::from(ip.octets().to_vec()),
            IpAddr::V6(ip) => ByteBuf::from(ip.octets().to_vec()),
        }
    }
}
