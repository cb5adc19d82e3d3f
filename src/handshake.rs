//! # BitTorrent Handshake
//!
//! The handshake is the fixed 68-byte frame exchanged immediately after the
//! TCP connection is established:
//!
//! ```text
//! <pstrlen=19><"BitTorrent protocol"><8 reserved bytes><info_hash><peer_id>
//! ```
//!
//! It pins both sides to the same protocol and the same torrent: a peer whose
//! handshake carries a different info-hash belongs to another swarm and is
//! rejected. The remote peer id in the last 20 bytes identifies the peer for
//! the rest of the session.

use anyhow::{anyhow, Result};

const PROTOCOL_ID: &[u8] = b"BitTorrent protocol";

/// Total size of a handshake frame on the wire.
pub const HANDSHAKE_LEN: usize = 68;

/// A parsed or to-be-sent handshake frame.
pub struct Handshake {
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: Vec<u8>,
    /// 20-byte identifier of the sending peer
    pub peer_id: Vec<u8>,
}

impl Handshake {
    pub fn new(info_hash: Vec<u8>, peer_id: Vec<u8>) -> Handshake {
        Handshake { info_hash, peer_id }
    }

    /// Serialize the handshake into its 68-byte wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut serialized: Vec<u8> = Vec::with_capacity(HANDSHAKE_LEN);

        serialized.push(PROTOCOL_ID.len() as u8);
        serialized.extend_from_slice(PROTOCOL_ID);
        serialized.extend_from_slice(&[0; 8]);
        serialized.extend_from_slice(&self.info_hash);
        serialized.extend_from_slice(&self.peer_id);

        serialized
    }
}

/// Parse an inbound handshake frame and validate it against our info-hash.
///
/// Checks, in order: the buffer holds a whole frame, the protocol length
/// byte is 19, the protocol identifier matches, and the info-hash equals
/// `info_hash`. The remote peer id is returned in the parsed handshake.
pub fn parse_handshake(buf: &[u8], info_hash: &[u8]) -> Result<Handshake> {
    if buf.len() < HANDSHAKE_LEN {
        return Err(anyhow!("handshake received from peer is too short"));
    }
    if buf[0] as usize != PROTOCOL_ID.len() {
        return Err(anyhow!("handshake received from peer has a bad protocol length"));
    }
    if &buf[1..20] != PROTOCOL_ID {
        return Err(anyhow!("handshake received from peer has a bad protocol identifier"));
    }
    if &buf[28..48] != info_hash {
        return Err(anyhow!("handshake received from peer has a different info hash"));
    }

    Ok(Handshake {
        info_hash: buf[28..48].to_vec(),
        peer_id: buf[48..68].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO_HASH: [u8; 20] = [0xAA; 20];
    const PEER_ID: &[u8; 20] = b"-LI1000-aaaabbbbcccc";

    #[test]
    fn serialized_handshake_parses_back_to_the_same_fields() {
        let handshake = Handshake::new(INFO_HASH.to_vec(), PEER_ID.to_vec());
        let frame = handshake.serialize();
        assert_eq!(frame.len(), HANDSHAKE_LEN);

        let parsed = parse_handshake(&frame, &INFO_HASH).unwrap();
        assert_eq!(parsed.info_hash, INFO_HASH.to_vec());
        assert_eq!(parsed.peer_id, PEER_ID.to_vec());
    }

    #[test]
    fn rejects_a_truncated_frame() {
        let frame = Handshake::new(INFO_HASH.to_vec(), PEER_ID.to_vec()).serialize();
        assert!(parse_handshake(&frame[..67], &INFO_HASH).is_err());
    }

    #[test]
    fn rejects_a_bad_protocol_length() {
        let mut frame = Handshake::new(INFO_HASH.to_vec(), PEER_ID.to_vec()).serialize();
        frame[0] = 18;
        assert!(parse_handshake(&frame, &INFO_HASH).is_err());
    }

    #[test]
    fn rejects_a_bad_protocol_identifier() {
        let mut frame = Handshake::new(INFO_HASH.to_vec(), PEER_ID.to_vec()).serialize();
        frame[1] = b'b';
        assert!(parse_handshake(&frame, &INFO_HASH).is_err());
    }

    #[test]
    fn rejects_a_foreign_info_hash() {
        let frame = Handshake::new(vec![0xBB; 20], PEER_ID.to_vec()).serialize();
        assert!(parse_handshake(&frame, &INFO_HASH).is_err());
    }
}
