//! # Tracker Announce
//!
//! Peer discovery happens over plain HTTP: a GET to the announce URL with
//! the torrent's info-hash and our peer id, answered with a bencoded
//! dictionary. The keys consumed here are `interval` (advisory re-announce
//! period), `peers` (a list of `{peer id, ip, port}` dictionaries) and
//! `failure reason`, which terminates the download when present.
//!
//! The info-hash is raw binary and must be percent-encoded byte by byte;
//! the peer id is URL-safe ASCII by construction and is sent verbatim.

use crate::peer::Peer;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_bytes::ByteBuf;
use url::Url;

use std::str;
use std::time::Duration;

// Port reported to the tracker; nothing listens on it, this client only
// downloads.
const TRACKER_PORT: u16 = 6889;
const TRACKER_TIMEOUT_SECS: u64 = 15;

/// Decoded announce response.
#[derive(Debug)]
pub struct TrackerResponse {
    /// Suggested seconds between announces, when the tracker sent one
    pub interval: Option<u64>,
    /// Endpoints advertised for this torrent
    pub peers: Vec<Peer>,
}

/// BencodeTrackerResponse structure.
#[derive(Deserialize)]
struct BencodeTrackerResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    peers: Vec<BencodePeer>,
}

/// BencodePeer structure (dictionary form of the peers list).
#[derive(Deserialize)]
struct BencodePeer {
    #[serde(rename = "peer id", default)]
    peer_id: Option<ByteBuf>,
    ip: String,
    port: u16,
}

/// Announce to the tracker and collect the advertised peers.
///
/// # Arguments
///
/// * `announce` - The tracker URL from the metainfo.
/// * `info_hash` - The 20-byte SHA-1 hash of the info dictionary.
/// * `peer_id` - Our 20-byte ASCII peer id.
/// * `left` - Number of bytes still to download.
///
pub fn announce(announce: &str, info_hash: &[u8], peer_id: &[u8], left: u32) -> Result<TrackerResponse> {
    let url = build_announce_url(announce, info_hash, peer_id, left)?;

    // Build blocking HTTP client
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(TRACKER_TIMEOUT_SECS))
        .build()
    {
        Ok(client) => client,
        Err(_) => return Err(anyhow!("could not build tracker http client")),
    };

    // Send GET request to the tracker
    let body = match client.get(&url).send() {
        Ok(response) => match response.bytes() {
            Ok(bytes) => bytes,
            Err(_) => return Err(anyhow!("could not read tracker response")),
        },
        Err(_) => return Err(anyhow!("could not reach tracker")),
    };

    // Deserialize bencoded tracker response
    let bencode = match serde_bencode::de::from_bytes::<BencodeTrackerResponse>(&body) {
        Ok(bencode) => bencode,
        Err(_) => return Err(anyhow!("could not decode tracker response")),
    };

    if let Some(reason) = bencode.failure_reason {
        return Err(anyhow!("tracker rejected announce: {reason}"));
    }

    let peers = bencode
        .peers
        .into_iter()
        .map(|peer| Peer {
            ip: peer.ip,
            port: peer.port,
            peer_id: peer.peer_id.map(|id| id.to_vec()),
        })
        .collect();

    Ok(TrackerResponse {
        interval: bencode.interval,
        peers,
    })
}

/// Compose the announce URL with its query parameters.
fn build_announce_url(announce: &str, info_hash: &[u8], peer_id: &[u8], left: u32) -> Result<String> {
    // Validate tracker URL from torrent
    if Url::parse(announce).is_err() {
        return Err(anyhow!("could not parse tracker url"));
    }

    let peer_id = match str::from_utf8(peer_id) {
        Ok(peer_id) => peer_id,
        Err(_) => return Err(anyhow!("peer id is not ascii")),
    };

    // Build query string manually: the info-hash is binary and must be
    // percent-encoded whole, which Url::query_pairs_mut would mangle
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&event=started",
        percent_encode_binary(info_hash),
        peer_id,
        TRACKER_PORT,
        left
    );

    let mut url = announce.to_string();
    if url.contains('?') {
        url.push('&');
    } else {
        url.push('?');
    }
    url.push_str(&query);

    Ok(url)
}

/// Each byte is encoded as %XX where XX is its hexadecimal representation.
fn percent_encode_binary(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
    }

    encoded
}
