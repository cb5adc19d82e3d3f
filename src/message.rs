//! # Peer Wire Messages
//!
//! After the handshake, every message on a peer connection uses the same
//! framing:
//!
//! ```text
//! <length prefix: u32 big-endian><message id: u8><payload>
//! ```
//!
//! A length prefix of zero is a keep-alive and carries neither id nor
//! payload. Unrecognized ids are read and discarded by their length prefix,
//! so the stream stays in sync no matter what a peer sends.
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | — |
//! | 1 | UNCHOKE | — |
//! | 2 | INTERESTED | — |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | piece availability bits |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block data |

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use std::io::Read;

pub type MessageId = u8;
pub type MessagePayload = Vec<u8>;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
/// Special value for the zero-length keep-alive frame (never on the wire).
pub const MESSAGE_KEEPALIVE: MessageId = 255;

// A frame longer than this is a protocol violation, not a message to buffer.
const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Default, Debug, PartialEq, Eq)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: MessagePayload,
}

impl Message {
    /// Build a new message without a payload.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a new message with a payload.
    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Self {
        Message { id, payload }
    }

    /// Serialize the message into its framed wire form.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut serialized: Vec<u8> = vec![];

        // Keep-alives are an empty frame
        if self.id == MESSAGE_KEEPALIVE {
            serialized.write_u32::<BigEndian>(0)?;
            return Ok(serialized);
        }

        serialized.write_u32::<BigEndian>(1 + self.payload.len() as u32)?;
        serialized.push(self.id);
        serialized.extend_from_slice(&self.payload);

        Ok(serialized)
    }

    /// Read exactly one framed message from `reader`.
    ///
    /// TCP gives no message boundaries, so the frame may arrive across any
    /// number of segments; both reads below block until the length prefix
    /// and then the whole frame have been collected, and bytes past the
    /// frame are left in the reader for the next call.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Message> {
        let frame_len = match reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(_) => return Err(anyhow!("could not read message length received from peer")),
        };

        if frame_len == 0 {
            return Ok(Message::new(MESSAGE_KEEPALIVE));
        }
        if frame_len > MAX_FRAME_LEN {
            return Err(anyhow!(
                "message received from peer is too large ({frame_len} bytes)"
            ));
        }

        let mut frame: Vec<u8> = vec![0; frame_len];
        if reader.read_exact(&mut frame).is_err() {
            return Err(anyhow!("could not read message received from peer"));
        }

        Ok(Message {
            id: frame[0],
            payload: frame[1..].to_vec(),
        })
    }
}
