//! # Peer Connection
//!
//! One `Client` wraps the TCP connection to a single remote peer and tracks
//! where the session stands in its lifecycle:
//!
//! ```text
//! Handshaking -> Connected -> Interested -> { Choked <-> Unchoked } -> Disconnected
//! ```
//!
//! The connection starts `Handshaking`, becomes `Connected` once the 68-byte
//! handshake validates, and `Interested` after we declare interest. From
//! there the remote peer drives the choke state; requests are only sent
//! while `Unchoked`. `Disconnected` is terminal.
//!
//! Reads go through a buffered reader, so a frame split across TCP segments
//! is collected transparently and bytes past one frame are kept for the
//! next.

use crate::handshake::{parse_handshake, Handshake, HANDSHAKE_LEN};
use crate::message::{Message, MESSAGE_INTERESTED, MESSAGE_KEEPALIVE, MESSAGE_REQUEST};
use crate::peer::Peer;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, WriteBytesExt};

use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

const DIAL_TIMEOUT_SECS: u64 = 15;

/// Lifecycle of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Connected,
    Interested,
    Choked,
    Unchoked,
    Disconnected,
}

/// Connection to a single remote peer.
pub struct Client {
    /// Endpoint this session talks to
    peer: Peer,
    /// Our 20-byte peer id
    peer_id: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: Vec<u8>,
    /// Buffered connection; writes go through the underlying stream
    reader: BufReader<TcpStream>,
    state: SessionState,
}

impl Client {
    /// Dial the peer. The session starts in `Handshaking`.
    pub fn connect(peer: Peer, peer_id: Vec<u8>, info_hash: Vec<u8>) -> Result<Client> {
        let peer_socket = peer.socket_addr()?;
        let conn =
            match TcpStream::connect_timeout(&peer_socket, Duration::from_secs(DIAL_TIMEOUT_SECS)) {
                Ok(conn) => conn,
                Err(_) => return Err(anyhow!("could not connect to peer {}", peer.dial_addr())),
            };

        info!("Connected to peer {}", peer.dial_addr());

        Ok(Client {
            peer,
            peer_id,
            info_hash,
            reader: BufReader::new(conn),
            state: SessionState::Handshaking,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_unchoked(&self) -> bool {
        self.state == SessionState::Unchoked
    }

    /// Address of the remote peer, for log lines.
    pub fn peer_addr(&self) -> String {
        self.peer.dial_addr()
    }

    /// Set read and write timeouts on the connection. A read that times out
    /// surfaces as an ordinary read failure and ends the session.
    pub fn set_timeouts(&self, secs: u64) -> Result<()> {
        let conn = self.reader.get_ref();

        if conn
            .set_read_timeout(Some(Duration::from_secs(secs)))
            .is_err()
        {
            return Err(anyhow!("could not set read timeout"));
        }
        if conn
            .set_write_timeout(Some(Duration::from_secs(secs)))
            .is_err()
        {
            return Err(anyhow!("could not set write timeout"));
        }

        Ok(())
    }

    fn send(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.reader.get_mut().write_all(buf)
    }

    /// Exchange and validate handshakes.
    ///
    /// Sends our handshake, then reads exactly one 68-byte frame back and
    /// validates the protocol identifier and info-hash. On success the
    /// session is `Connected`, and the remote id is recorded if the tracker
    /// did not announce one.
    pub fn handshake_with_peer(&mut self) -> Result<()> {
        let handshake = Handshake::new(self.info_hash.clone(), self.peer_id.clone());
        if self.send(&handshake.serialize()).is_err() {
            return Err(anyhow!("could not send handshake to peer"));
        }

        let mut handshake_buf = [0u8; HANDSHAKE_LEN];
        if self.reader.read_exact(&mut handshake_buf).is_err() {
            return Err(anyhow!("could not read handshake received from peer"));
        }

        let remote = parse_handshake(&handshake_buf, &self.info_hash)?;
        if self.peer.peer_id.is_none() {
            self.peer.peer_id = Some(remote.peer_id);
        }

        self.state = SessionState::Connected;
        Ok(())
    }

    /// Read one framed message from the peer.
    pub fn read_message(&mut self) -> Result<Message> {
        let message = Message::read_from(&mut self.reader)?;

        if message.id == MESSAGE_KEEPALIVE {
            info!("Receive KEEP_ALIVE from peer {}", self.peer.dial_addr());
        }

        Ok(message)
    }

    /// Declare interest in downloading from this peer.
    pub fn send_interested(&mut self) -> Result<()> {
        let message_encoded = Message::new(MESSAGE_INTERESTED).serialize()?;

        info!("Send MESSAGE_INTERESTED to peer {}", self.peer.dial_addr());

        if self.send(&message_encoded).is_err() {
            return Err(anyhow!("could not send MESSAGE_INTERESTED to peer"));
        }

        self.state = SessionState::Interested;
        Ok(())
    }

    /// Request one block of a piece.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index.
    /// * `begin` - Byte offset of the block within the piece.
    /// * `length` - Block size in bytes.
    ///
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        let mut payload: Vec<u8> = vec![];
        payload.write_u32::<BigEndian>(index)?;
        payload.write_u32::<BigEndian>(begin)?;
        payload.write_u32::<BigEndian>(length)?;

        let message_encoded = Message::new_with_payload(MESSAGE_REQUEST, payload).serialize()?;

        info!(
            "Send MESSAGE_REQUEST for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer.dial_addr()
        );

        if self.send(&message_encoded).is_err() {
            return Err(anyhow!("could not send MESSAGE_REQUEST to peer"));
        }

        Ok(())
    }

    /// The peer paused us; requests stay on hold until the next unchoke.
    pub fn mark_choked(&mut self) {
        info!("Receive MESSAGE_CHOKE from peer {}", self.peer.dial_addr());
        self.state = SessionState::Choked;
    }

    /// The peer will now answer our requests.
    pub fn mark_unchoked(&mut self) {
        info!("Receive MESSAGE_UNCHOKE from peer {}", self.peer.dial_addr());
        self.state = SessionState::Unchoked;
    }

    /// Close the connection; the session cannot be revived.
    pub fn disconnect(&mut self) {
        let _ = self.reader.get_ref().shutdown(Shutdown::Both);
        self.state = SessionState::Disconnected;
    }
}
