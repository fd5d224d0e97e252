//! Server peer lists.
//!
//! `server.peers.subscribe` returns `[[ip, hostname, [feature, ...]], ...]`
//! where features are short tags such as `v1.4`, `s50002`, `t50001` or
//! `p10000`. Servers relay whatever their peers announced, so entries are
//! parsed leniently: anything that does not fit is logged and skipped.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::connection::join_host_port;

/// One entry of a server's peer list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// IP address or .onion name
    pub addr: String,

    /// Host name
    pub host: String,

    /// Feature tags, e.g. `s50002`
    pub features: Vec<String>,
}

impl PeerInfo {
    pub fn is_onion(&self) -> bool {
        self.addr.ends_with(".onion")
    }
}

/// Parse a `server.peers.subscribe` result.
pub fn parse_peers(value: Value) -> Vec<PeerInfo> {
    let entries = match value {
        Value::Array(entries) => entries,
        other => {
            debug!(value = %other, "Peer list is not an array");
            return Vec::new();
        }
    };

    entries.into_iter().filter_map(parse_peer).collect()
}

fn parse_peer(entry: Value) -> Option<PeerInfo> {
    // Well-formed entries decode in one step
    if let Ok((addr, host, features)) =
        <(String, String, Vec<String>)>::deserialize(&entry)
    {
        return Some(PeerInfo {
            addr,
            host,
            features,
        });
    }

    let fields = match entry.as_array() {
        Some(fields) if fields.len() == 3 => fields,
        _ => {
            debug!(peer = %entry, "Bad peer data");
            return None;
        }
    };

    let Some(addr) = fields[0].as_str() else {
        debug!(peer = %entry, "Bad peer IP data");
        return None;
    };
    let Some(host) = fields[1].as_str() else {
        debug!(peer = %entry, "Bad peer hostname");
        return None;
    };
    let Some(raw_features) = fields[2].as_array() else {
        debug!(peer = %entry, "Bad peer feature data");
        return None;
    };

    let features = raw_features
        .iter()
        .filter_map(|feature| match feature.as_str() {
            Some(feature) => Some(feature.to_string()),
            None => {
                debug!(feature = %feature, "Bad peer feature tag");
                None
            }
        })
        .collect();

    Some(PeerInfo {
        addr: addr.to_string(),
        host: host.to_string(),
        features,
    })
}

/// Usable peer addresses, as `host:port`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerAddrs {
    /// Peers reachable over TLS. May include onion hosts when requested.
    pub tls: Vec<String>,

    /// Onion peers offering plain TCP only
    pub tcp_only_onion: Vec<String>,
}

/// Sort peers by how they can be reached.
///
/// The first `s<port>` tag of a peer yields a TLS address. A `t<port>` tag
/// is kept only for onion peers, and only used if the peer has no TLS
/// port; Tor already encrypts the hop. Tags without a numeric port are
/// ignored, since the default port depends on the network. Onion peers
/// are skipped entirely unless `include_onion`.
pub fn ssl_peer_addrs(peers: &[PeerInfo], include_onion: bool) -> PeerAddrs {
    let mut addrs = PeerAddrs::default();

    'peers: for peer in peers {
        let is_onion = peer.is_onion();
        if is_onion && !include_onion {
            continue;
        }

        let mut tcp_onion = None;
        for feature in &peer.features {
            let mut chars = feature.chars();
            let Some(transport) = chars.next() else {
                continue;
            };
            let port = chars.as_str();
            if port.is_empty() || port.parse::<u16>().is_err() {
                continue;
            }

            match transport {
                's' => {
                    addrs.tls.push(join_host_port(&peer.host, port));
                    continue 'peers;
                }
                't' if is_onion => {
                    tcp_onion = Some(join_host_port(&peer.host, port));
                }
                _ => {}
            }
        }

        if let Some(addr) = tcp_onion {
            addrs.tcp_only_onion.push(addr);
        }
    }

    addrs
}
