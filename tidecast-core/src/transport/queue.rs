//! Output queue between the reactor and the player thread.
//!
//! The reactor pushes verified pieces in playback order; the player blocks
//! in [`OutputQueue::pop`] until data or end of stream arrives. One mutex
//! and one condition variable guard all shared state.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::piece::PieceIndex;

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<(PieceIndex, Bytes)>,
    bytes: usize,
    finished: bool,
    seek_pending: bool,
    consumed: u64,
}

/// Bounded, ordered sequence of `(piece, bytes)` awaiting the player.
///
/// The bound is enforced by the producer, which stops pushing once
/// [`OutputQueue::byte_len`] exceeds its buffer size.
#[derive(Debug, Default)]
pub struct OutputQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a piece and wakes the player. Returns false, dropping the
    /// data, while a seek is waiting to be applied.
    pub fn push(&self, piece: PieceIndex, data: Bytes) -> bool {
        let mut state = self.state.lock();
        if state.seek_pending {
            return false;
        }
        state.bytes += data.len();
        state.items.push_back((piece, data));
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Blocks until a piece is available. `None` means end of stream.
    pub fn pop(&self) -> Option<(PieceIndex, Bytes)> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = Self::take(&mut state) {
                return Some(item);
            }
            if state.finished && !state.seek_pending {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Like [`OutputQueue::pop`] but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<(PieceIndex, Bytes)> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = Self::take(&mut state) {
                return Some(item);
            }
            if state.finished && !state.seek_pending {
                return None;
            }
            if self.ready.wait_for(&mut state, timeout).timed_out() {
                return Self::take(&mut state);
            }
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<(PieceIndex, Bytes)> {
        Self::take(&mut self.state.lock())
    }

    fn take(state: &mut QueueState) -> Option<(PieceIndex, Bytes)> {
        let item = state.items.pop_front()?;
        state.bytes -= item.1.len();
        state.consumed += item.1.len() as u64;
        Some(item)
    }

    /// Marks the end of the stream; readers drain what is left and then see EOF.
    pub fn finish(&self) {
        self.state.lock().finished = true;
        self.ready.notify_all();
    }

    /// Drops buffered data and clears the end-of-stream and seek flags.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        state.bytes = 0;
        state.finished = false;
        state.seek_pending = false;
        drop(state);
        self.ready.notify_all();
    }

    /// Drops buffered data and refuses pushes until the producer resets.
    pub fn request_seek(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        state.bytes = 0;
        state.finished = false;
        state.seek_pending = true;
        drop(state);
        self.ready.notify_all();
    }

    /// Bytes waiting in the queue.
    pub fn byte_len(&self) -> usize {
        self.state.lock().bytes
    }

    /// Pieces waiting in the queue.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn seek_pending(&self) -> bool {
        self.state.lock().seek_pending
    }

    /// Total bytes handed to the player so far.
    pub fn consumed_bytes(&self) -> u64 {
        self.state.lock().consumed
    }

    /// Piece indices currently queued, front first.
    pub fn pieces(&self) -> Vec<PieceIndex> {
        self.state
            .lock()
            .items
            .iter()
            .map(|(piece, _)| *piece)
            .collect()
    }
}
