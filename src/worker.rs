//! # Peer Session Worker
//!
//! One worker per discovered peer, each on its own thread. A worker dials
//! the peer, handshakes, declares interest, then loops on inbound messages:
//!
//! 1. On `unchoke` with no piece claimed, it pops the next piece from the
//!    shared queue (an empty queue ends the session cleanly).
//! 2. It requests one block at a time, appending each `piece` message's
//!    block to the claimed piece until the piece is complete.
//! 3. A completed piece is SHA-1 verified and written at its offset in the
//!    output file; the completion counter then advances.
//!
//! Failure handling is local to the session: a piece that fails its hash or
//! its write goes back to the queue and the connection survives, while any
//! I/O or protocol error returns the claimed piece and ends the session.
//! A `choke` merely pauses requests; the claimed piece and the block cursor
//! are kept for the next `unchoke`.

use crate::client::{Client, SessionState};
use crate::message::{
    Message, MESSAGE_BITFIELD, MESSAGE_CHOKE, MESSAGE_HAVE, MESSAGE_KEEPALIVE, MESSAGE_PIECE,
    MESSAGE_UNCHOKE,
};
use crate::peer::Peer;
use crate::piece::Piece;
use crate::queue::WorkQueue;
use crate::storage::OutputFile;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use byteorder::{BigEndian, ReadBytesExt};
use indicatif::ProgressBar;

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const HANDSHAKE_TIMEOUT_SECS: u64 = 15;
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Position of the session within the blocks of its claimed piece.
///
/// `in_flight` is true while a request is outstanding; a choke drops the
/// outstanding request on the peer side, so the same block is re-requested
/// on the next unchoke.
struct BlockCursor {
    index: usize,
    offset: u32,
    in_flight: bool,
}

impl BlockCursor {
    fn rewind(&mut self) {
        self.index = 0;
        self.offset = 0;
        self.in_flight = false;
    }
}

/// Downloads pieces from a single peer until the queue drains or the
/// session fails.
pub struct Worker {
    peer: Peer,
    peer_id: Vec<u8>,
    info_hash: Vec<u8>,
    queue: Arc<WorkQueue>,
    output: Arc<OutputFile>,
    live_peers: Arc<AtomicUsize>,
    progress: ProgressBar,
}

impl Worker {
    pub fn new(
        peer: Peer,
        peer_id: Vec<u8>,
        info_hash: Vec<u8>,
        queue: Arc<WorkQueue>,
        output: Arc<OutputFile>,
        live_peers: Arc<AtomicUsize>,
        progress: ProgressBar,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            queue,
            output,
            live_peers,
            progress,
        }
    }

    /// Run the session to completion. Every fault is session-local: nothing
    /// escapes to the coordinator.
    pub fn run(&self) {
        let live = self.live_peers.fetch_add(1, Ordering::SeqCst) + 1;
        self.progress.set_message(format!("{live} peers"));

        self.run_session();

        let live = self.live_peers.fetch_sub(1, Ordering::SeqCst) - 1;
        self.progress.set_message(format!("{live} peers"));
    }

    fn run_session(&self) {
        let mut client = match Client::connect(
            self.peer.clone(),
            self.peer_id.clone(),
            self.info_hash.clone(),
        ) {
            Ok(client) => client,
            Err(e) => {
                debug!("{e}");
                return;
            }
        };

        let mut claimed: Option<Piece> = None;
        let result = self.exchange(&mut client, &mut claimed);

        // A piece still claimed on the way out goes back to the queue; from
        // any other session's view it is either queued or held, never lost.
        if let Some(piece) = claimed.take() {
            debug!("Returning piece {} to the queue", piece.index);
            self.queue.requeue(piece);
        }
        if let Err(e) = result {
            debug!("Session with peer {} ended: {e}", client.peer_addr());
        }
        client.disconnect();
    }

    /// Message loop of the session. `claimed` stays owned by the caller so
    /// the piece can be recovered whatever error pops out of here.
    fn exchange(&self, client: &mut Client, claimed: &mut Option<Piece>) -> Result<()> {
        client.set_timeouts(HANDSHAKE_TIMEOUT_SECS)?;
        client.handshake_with_peer()?;
        client.send_interested()?;
        client.set_timeouts(REQUEST_TIMEOUT_SECS)?;

        let mut cursor = BlockCursor {
            index: 0,
            offset: 0,
            in_flight: false,
        };

        while client.state() != SessionState::Disconnected {
            let message = client.read_message()?;

            match message.id {
                MESSAGE_CHOKE => {
                    client.mark_choked();
                    // The peer discards pending requests when it chokes
                    cursor.in_flight = false;
                }
                MESSAGE_UNCHOKE => {
                    client.mark_unchoked();
                    match claimed.as_ref() {
                        Some(piece) => {
                            if !cursor.in_flight {
                                client.send_request(
                                    piece.index,
                                    cursor.offset,
                                    piece.block_sizes[cursor.index],
                                )?;
                                cursor.in_flight = true;
                            }
                        }
                        None => self.claim_next(client, claimed, &mut cursor)?,
                    }
                }
                MESSAGE_PIECE => self.assemble_block(client, message, claimed, &mut cursor)?,
                // No piece-availability accounting: every peer is assumed to
                // hold the whole file
                MESSAGE_HAVE | MESSAGE_BITFIELD => {}
                MESSAGE_KEEPALIVE => {}
                id => debug!("Ignoring message {id} from peer {}", client.peer_addr()),
            }
        }

        Ok(())
    }

    /// Pop the next piece and request its first block. An empty queue ends
    /// the session cleanly.
    fn claim_next(
        &self,
        client: &mut Client,
        claimed: &mut Option<Piece>,
        cursor: &mut BlockCursor,
    ) -> Result<()> {
        match self.queue.pop() {
            Some(piece) => {
                debug!(
                    "Claimed piece {} ({} still queued)",
                    piece.index,
                    self.queue.queued()
                );
                cursor.rewind();
                let index = piece.index;
                let first_block = piece.block_sizes[0];
                *claimed = Some(piece);

                client.send_request(index, 0, first_block)?;
                cursor.in_flight = true;
                Ok(())
            }
            None => {
                info!(
                    "No pieces left to claim, ending session with peer {}",
                    client.peer_addr()
                );
                client.disconnect();
                Ok(())
            }
        }
    }

    /// Consume one `piece` message: validate it against the claimed piece
    /// and the block cursor, append the block, then either request the next
    /// block or finalize the piece.
    fn assemble_block(
        &self,
        client: &mut Client,
        message: Message,
        claimed: &mut Option<Piece>,
        cursor: &mut BlockCursor,
    ) -> Result<()> {
        // The piece stays in the claimed slot throughout: an error below ends
        // the session, and the slot is what gets drained back into the queue.
        let Some(piece) = claimed.as_mut() else {
            return Err(anyhow!("received an unsolicited piece message from peer"));
        };
        cursor.in_flight = false;

        if message.payload.len() < 8 {
            return Err(anyhow!("received invalid MESSAGE_PIECE from peer"));
        }

        let mut header = Cursor::new(&message.payload[0..8]);
        let index = header.read_u32::<BigEndian>()?;
        let begin = header.read_u32::<BigEndian>()?;
        let block = &message.payload[8..];

        if index != piece.index {
            return Err(anyhow!(
                "received block for piece {index}, expected piece {}",
                piece.index
            ));
        }
        if begin as usize != piece.content.len() {
            return Err(anyhow!(
                "received block at offset {begin}, expected offset {}",
                piece.content.len()
            ));
        }
        let expected_len = piece.block_sizes[cursor.index] as usize;
        if block.len() != expected_len {
            return Err(anyhow!(
                "received block of {} bytes, expected {expected_len}",
                block.len()
            ));
        }

        info!(
            "Download piece {} [{}:{}] from peer {}",
            index,
            begin,
            begin as usize + block.len(),
            client.peer_addr()
        );

        piece.content.extend_from_slice(block);
        cursor.offset += piece.block_sizes[cursor.index];
        cursor.index += 1;

        // More blocks to fetch: request the next one unless the peer choked
        // us while this block was in flight
        if cursor.index < piece.block_sizes.len() {
            let index = piece.index;
            let next_block = piece.block_sizes[cursor.index];

            if client.is_unchoked() {
                client.send_request(index, cursor.offset, next_block)?;
                cursor.in_flight = true;
            }
            return Ok(());
        }

        if let Some(piece) = claimed.take() {
            return self.finalize(client, piece, claimed, cursor);
        }
        Ok(())
    }

    /// Verify a fully assembled piece and write it into the output file.
    ///
    /// Hash or write failures return the piece to the queue but keep the
    /// session: the peer may still serve other pieces correctly.
    fn finalize(
        &self,
        client: &mut Client,
        piece: Piece,
        claimed: &mut Option<Piece>,
        cursor: &mut BlockCursor,
    ) -> Result<()> {
        if !verify_piece(&piece) {
            warn!(
                "Piece {} from peer {} failed hash verification",
                piece.index,
                client.peer_addr()
            );
            self.queue.requeue(piece);
            return Ok(());
        }

        if let Err(e) = self.output.write_piece(piece.file_offset, &piece.content) {
            warn!("{e}, returning piece {} to the queue", piece.index);
            self.queue.requeue(piece);
            return Ok(());
        }

        self.queue.increment_completed();
        self.progress.inc(piece.length as u64);
        info!(
            "Completed piece {} ({} done, {} remaining)",
            piece.index,
            self.queue.completed(),
            self.queue.remaining()
        );

        if client.is_unchoked() {
            self.claim_next(client, claimed, cursor)?;
        }
        Ok(())
    }
}

/// Compare the SHA-1 of the assembled content against the expected digest.
fn verify_piece(piece: &Piece) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(&piece.content);
    hasher.finish().to_vec() == piece.expected_hash
}
