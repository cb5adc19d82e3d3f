//! # Piece Plan
//!
//! A torrent file is downloaded piece by piece. Each piece is the unit of
//! SHA-1 verification and carries everything a peer session needs to fetch
//! it: its index, its byte length, the expected hash, the offset at which it
//! lands in the output file, and the sizes of the 16 KiB blocks it is
//! requested in.
//!
//! The plan is derived deterministically from the metainfo: one full-length
//! piece per `piece_length` chunk of the file, plus one shorter trailing
//! piece when the file length is not a multiple of `piece_length`.

use anyhow::{anyhow, Result};

/// Size of the blocks a piece is requested in (16 KiB).
pub const BLOCK_SIZE: u32 = 16384;

/// A single unit of download work.
///
/// `content` accumulates block data during assembly and is empty while the
/// piece sits in the work queue.
#[derive(Default, Debug, Clone)]
pub struct Piece {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Length of the piece in bytes (the last piece may be shorter)
    pub length: u32,
    /// Expected SHA-1 digest of the piece content (20 bytes)
    pub expected_hash: Vec<u8>,
    /// Byte offset of the piece within the output file
    pub file_offset: u64,
    /// Sizes of the blocks to request, summing to `length`
    pub block_sizes: Vec<u32>,
    /// Assembled block data, empty until the piece is claimed
    pub content: Vec<u8>,
}

impl Piece {
    /// Build a new piece with its block layout computed from `length`.
    pub fn new(index: u32, length: u32, expected_hash: Vec<u8>, file_offset: u64) -> Piece {
        Piece {
            index,
            length,
            expected_hash,
            file_offset,
            block_sizes: compute_block_sizes(length),
            content: Vec::new(),
        }
    }

    /// Drop any partially assembled content so the piece can be downloaded
    /// again from its first block.
    pub fn reset(&mut self) {
        self.content.clear();
    }
}

/// Full 16 KiB blocks followed by the remainder, when there is one.
fn compute_block_sizes(length: u32) -> Vec<u32> {
    let full_blocks = length / BLOCK_SIZE;
    let final_block = length % BLOCK_SIZE;

    let mut sizes: Vec<u32> = vec![BLOCK_SIZE; full_blocks as usize];
    if final_block > 0 {
        sizes.push(final_block);
    }

    sizes
}

/// Build the ordered list of pieces covering the whole file.
///
/// # Arguments
///
/// * `total_length` - Size of the file in bytes.
/// * `piece_length` - Size of each piece except possibly the last.
/// * `hashes` - One 20-byte SHA-1 digest per piece, in piece order.
///
pub fn build_plan(total_length: u32, piece_length: u32, hashes: &[Vec<u8>]) -> Result<Vec<Piece>> {
    if piece_length == 0 {
        return Err(anyhow!("torrent has an invalid piece length"));
    }

    let full_pieces = total_length / piece_length;
    let final_piece_bytes = total_length % piece_length;
    let nb_pieces = full_pieces as usize + (final_piece_bytes > 0) as usize;

    // The metainfo must carry exactly one hash per piece
    if hashes.len() != nb_pieces {
        return Err(anyhow!("torrent piece hashes do not match the file length"));
    }

    let mut plan: Vec<Piece> = Vec::with_capacity(nb_pieces);
    for index in 0..full_pieces {
        plan.push(Piece::new(
            index,
            piece_length,
            hashes[index as usize].clone(),
            index as u64 * piece_length as u64,
        ));
    }

    if final_piece_bytes > 0 {
        plan.push(Piece::new(
            full_pieces,
            final_piece_bytes,
            hashes[full_pieces as usize].clone(),
            full_pieces as u64 * piece_length as u64,
        ));
    }

    Ok(plan)
}
