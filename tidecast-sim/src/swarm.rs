//! Simulated neighbours and local piece storage.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tidecast_core::{Bitfield, ChunkRequest, PeerId, PieceIndex, PieceSource};

use crate::clock::DeterministicRng;

/// How one simulated neighbour behaves.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSpec {
    /// Upload rate towards us in bytes per second
    pub upload_rate: u64,
    /// Probability of holding any given piece
    pub coverage: f64,
    /// Sends data that fails the hash check
    pub corrupt: bool,
}

impl PeerSpec {
    pub fn new(upload_rate: u64, coverage: f64) -> Self {
        Self {
            upload_rate,
            coverage,
            corrupt: false,
        }
    }

    pub fn corrupt(mut self) -> Self {
        self.corrupt = true;
        self
    }
}

/// Transfer in progress from one neighbour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub request: ChunkRequest,
    pub remaining: u64,
}

/// What a neighbour delivered during one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub bytes: u64,
    /// Set when the last byte of the request arrived
    pub completed: Option<ChunkRequest>,
}

/// One simulated neighbour.
#[derive(Debug, Clone)]
pub struct SimPeer {
    pub id: PeerId,
    pub spec: PeerSpec,
    /// Pieces the neighbour really has, whatever we were told
    pub holds: Bitfield,
    pub transfer: Option<Transfer>,
    /// Fractional bytes carried between steps
    credit: f64,
}

impl SimPeer {
    /// Neighbour holding each piece of `pieces` with its coverage probability.
    pub fn new(
        id: PeerId,
        spec: PeerSpec,
        piece_count: u32,
        pieces: impl IntoIterator<Item = u32>,
        rng: &mut DeterministicRng,
    ) -> Self {
        let mut holds = Bitfield::new(piece_count);
        for piece in pieces {
            if rng.random_bool(spec.coverage) {
                holds.set_piece(PieceIndex(piece));
            }
        }
        Self {
            id,
            spec,
            holds,
            transfer: None,
            credit: 0.0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.transfer.is_none()
    }

    pub fn start(&mut self, request: ChunkRequest) {
        self.transfer = Some(Transfer {
            request,
            remaining: u64::from(request.length),
        });
    }

    /// Drops the transfer if it carries `request`.
    pub fn cancel(&mut self, request: &ChunkRequest) -> bool {
        if self.transfer.is_some_and(|t| t.request == *request) {
            self.transfer = None;
            self.credit = 0.0;
            return true;
        }
        false
    }

    /// Moves up to `seconds` worth of bytes of the current transfer.
    pub fn transmit(&mut self, seconds: f64) -> Option<Delivery> {
        let transfer = self.transfer.as_mut()?;
        self.credit += self.spec.upload_rate as f64 * seconds;
        let bytes = (self.credit.floor() as u64).min(transfer.remaining);
        self.credit -= bytes as f64;
        transfer.remaining -= bytes;

        let completed = (transfer.remaining == 0).then_some(transfer.request);
        if completed.is_some() {
            self.transfer = None;
            self.credit = 0.0;
        }
        Some(Delivery { bytes, completed })
    }
}

/// Local piece storage read by the transporter.
#[derive(Debug, Default)]
pub struct SimStore {
    pieces: Mutex<HashMap<PieceIndex, Bytes>>,
}

impl SimStore {
    pub fn store(&self, piece: PieceIndex, data: Bytes) {
        self.pieces.lock().insert(piece, data);
    }

    pub fn discard(&self, piece: PieceIndex) {
        self.pieces.lock().remove(&piece);
    }

    pub fn len(&self) -> usize {
        self.pieces.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.lock().is_empty()
    }
}

impl PieceSource for SimStore {
    fn piece_data(&self, piece: PieceIndex) -> Option<Bytes> {
        self.pieces.lock().get(&piece).cloned()
    }
}

/// Payload of a simulated piece; the first byte names the piece.
pub fn piece_payload(piece: PieceIndex, len: u32) -> Bytes {
    Bytes::from(vec![piece.as_u32() as u8; len as usize])
}
