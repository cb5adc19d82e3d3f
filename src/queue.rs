//! # Piece Work Queue
//!
//! Shared FIFO of pieces still to be downloaded, plus a completion counter.
//! All peer sessions pop work from the same queue; a piece that fails on one
//! session is pushed back to the tail so another session can retry it.
//!
//! At any instant `queued + in_flight + completed == total`, where
//! `in_flight` is the number of pieces currently claimed by sessions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::piece::Piece;

/// Thread-safe FIFO of outstanding pieces.
pub struct WorkQueue {
    pieces: Mutex<VecDeque<Piece>>,
    completed: AtomicUsize,
    total: usize,
}

impl WorkQueue {
    /// Build the queue from the full download plan.
    pub fn new(plan: Vec<Piece>) -> WorkQueue {
        let total = plan.len();

        WorkQueue {
            pieces: Mutex::new(VecDeque::from(plan)),
            completed: AtomicUsize::new(0),
            total,
        }
    }

    /// Remove and return the piece at the head, if any remain.
    pub fn pop(&self) -> Option<Piece> {
        self.pieces.lock().unwrap().pop_front()
    }

    /// Append a piece to the tail.
    pub fn insert(&self, piece: Piece) {
        self.pieces.lock().unwrap().push_back(piece);
    }

    /// Clear a failed piece and put it back at the tail so another session
    /// can download it from its first block.
    pub fn requeue(&self, mut piece: Piece) {
        piece.reset();
        self.insert(piece);
    }

    /// Record one more verified and written piece.
    pub fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of pieces verified and written so far.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Number of pieces not yet completed, including those claimed by
    /// sessions.
    pub fn remaining(&self) -> usize {
        self.total - self.completed()
    }

    /// Number of pieces currently sitting in the queue.
    pub fn queued(&self) -> usize {
        self.pieces.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn piece(index: u32) -> Piece {
        Piece::new(index, 16_384, vec![index as u8; 20], index as u64 * 16_384)
    }

    fn queue_of(count: u32) -> WorkQueue {
        WorkQueue::new((0..count).map(piece).collect())
    }

    #[test]
    fn pop_returns_pieces_in_fifo_order() {
        let queue = queue_of(3);

        assert_eq!(queue.pop().unwrap().index, 0);
        assert_eq!(queue.pop().unwrap().index, 1);
        assert_eq!(queue.pop().unwrap().index, 2);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn requeued_piece_goes_to_the_tail() {
        let queue = queue_of(3);

        let failed = queue.pop().unwrap();
        queue.requeue(failed);

        assert_eq!(queue.pop().unwrap().index, 1);
        assert_eq!(queue.pop().unwrap().index, 2);
        assert_eq!(queue.pop().unwrap().index, 0);
    }

    #[test]
    fn requeue_clears_partial_content() {
        let queue = queue_of(1);

        let mut claimed = queue.pop().unwrap();
        claimed.content.extend_from_slice(b"half a block");
        queue.requeue(claimed);

        assert!(queue.pop().unwrap().content.is_empty());
    }

    #[test]
    fn counters_track_queued_claimed_and_completed_pieces() {
        let queue = queue_of(3);
        assert_eq!(queue.remaining(), 3);
        assert_eq!(queue.completed(), 0);

        // One piece claimed, one completed: 1 queued + 1 in flight + 1 done
        let _claimed = queue.pop().unwrap();
        let done = queue.pop().unwrap();
        drop(done);
        queue.increment_completed();

        assert_eq!(queue.queued(), 1);
        assert_eq!(queue.completed(), 1);
        assert_eq!(queue.remaining(), 2);
        assert_eq!(queue.queued() + 1 + queue.completed(), 3);
    }

    #[test]
    fn concurrent_pops_hand_out_each_piece_exactly_once() {
        let queue = Arc::new(queue_of(100));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            let seen = Arc::clone(&seen);
            handles.push(thread::spawn(move || {
                while let Some(piece) = queue.pop() {
                    seen.lock().unwrap().push(piece.index);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut indexes = seen.lock().unwrap().clone();
        indexes.sort_unstable();
        assert_eq!(indexes, (0..100).collect::<Vec<u32>>());
    }
}
