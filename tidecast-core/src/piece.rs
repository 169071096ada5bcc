//! Piece and chunk coordinates shared by every picker component.

use std::fmt;

use bytes::Bytes;

use crate::peer::PeerId;

/// Zero-based index of a piece within the content object.
///
/// Content is divided into fixed-size pieces; each piece has a sequential
/// index in `[0, N)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as usize for vector addressing.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PieceIndex {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

/// Sub-piece byte range transferred on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRequest {
    pub piece: PieceIndex,
    pub offset: u32,
    pub length: u32,
}

impl ChunkRequest {
    /// Creates a chunk request for `length` bytes at `offset` inside `piece`.
    pub fn new(piece: PieceIndex, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }
}

impl fmt::Display for ChunkRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}+{}", self.piece, self.offset, self.length)
    }
}

/// Errors raised for malformed piece coordinates.
///
/// These map to the *InvalidPiece* error kind: the offending input is
/// rejected and the picker state is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PieceError {
    #[error("Piece {index} out of range (piece count {piece_count})")]
    OutOfRange { index: PieceIndex, piece_count: u32 },

    #[error("Invalid bitfield size: expected {expected} bytes, got {actual}")]
    BitfieldLength { expected: usize, actual: usize },

    #[error("Bitfield covers {actual} pieces, expected {expected}")]
    BitfieldPieceCount { expected: u32, actual: u32 },

    #[error("Bitfield has spare bits set beyond piece {piece_count}")]
    BitfieldSpareBits { piece_count: u32 },

    #[error("Unknown peer {peer}")]
    UnknownPeer { peer: PeerId },

    #[error("Chunk {request} exceeds piece bounds")]
    ChunkOutOfBounds { request: ChunkRequest },

    #[error("Invalid priority {priority} for piece {index}")]
    InvalidPriority { index: PieceIndex, priority: i32 },
}

/// Bitfield representing which pieces a peer holds.
///
/// Bits are stored most significant bit first, matching the layout peers
/// exchange on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: u32,
}

impl Bitfield {
    /// Create empty bitfield for given number of pieces.
    pub fn new(piece_count: u32) -> Self {
        let byte_count = piece_count.div_ceil(8);
        Self {
            bits: vec![0u8; byte_count as usize],
            piece_count,
        }
    }

    /// Create bitfield with every piece set.
    pub fn full(piece_count: u32) -> Self {
        let mut bitfield = Self::new(piece_count);
        for index in 0..piece_count {
            bitfield.set_piece(PieceIndex(index));
        }
        bitfield
    }

    /// Create bitfield from raw bytes received from a peer.
    ///
    /// # Errors
    /// - `PieceError::BitfieldLength` - Byte count does not match piece count
    /// - `PieceError::BitfieldSpareBits` - Trailing bits past the last piece are set
    pub fn from_bytes(data: Bytes, piece_count: u32) -> Result<Self, PieceError> {
        let expected = piece_count.div_ceil(8) as usize;
        if data.len() != expected {
            return Err(PieceError::BitfieldLength {
                expected,
                actual: data.len(),
            });
        }

        let spare = (expected * 8) as u32 - piece_count;
        if spare > 0 {
            let mask = (1u8 << spare) - 1;
            if data[expected - 1] & mask != 0 {
                return Err(PieceError::BitfieldSpareBits { piece_count });
            }
        }

        Ok(Self {
            bits: data.to_vec(),
            piece_count,
        })
    }

    /// Create bitfield from a string of `0`/`1` characters.
    ///
    /// Any character other than `1` clears the bit.
    pub fn from_bit_str(pattern: &str) -> Self {
        let mut bitfield = Self::new(pattern.len() as u32);
        for (index, ch) in pattern.chars().enumerate() {
            if ch == '1' {
                bitfield.set_piece(PieceIndex(index as u32));
            }
        }
        bitfield
    }

    /// Number of pieces this bitfield covers.
    pub fn len(&self) -> u32 {
        self.piece_count
    }

    /// Whether the bitfield covers zero pieces.
    pub fn is_empty(&self) -> bool {
        self.piece_count == 0
    }

    /// Check if the bit for a specific piece is set.
    pub fn has_piece(&self, piece_index: PieceIndex) -> bool {
        let index = piece_index.as_u32();
        if index >= self.piece_count {
            return false;
        }

        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8); // MSB first

        (self.bits[byte_index] & (1 << bit_index)) != 0
    }

    /// Mark piece as available. Returns whether the bit changed.
    pub fn set_piece(&mut self, piece_index: PieceIndex) -> bool {
        let index = piece_index.as_u32();
        if index >= self.piece_count {
            return false;
        }

        let byte_index = (index / 8) as usize;
        let mask = 1 << (7 - (index % 8));
        let changed = self.bits[byte_index] & mask == 0;
        self.bits[byte_index] |= mask;
        changed
    }

    /// Mark piece as unavailable. Returns whether the bit changed.
    pub fn clear_piece(&mut self, piece_index: PieceIndex) -> bool {
        let index = piece_index.as_u32();
        if index >= self.piece_count {
            return false;
        }

        let byte_index = (index / 8) as usize;
        let mask = 1 << (7 - (index % 8));
        let changed = self.bits[byte_index] & mask != 0;
        self.bits[byte_index] &= !mask;
        changed
    }

    /// Get raw bytes for transmission.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Count total number of set pieces.
    pub fn count(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    /// Whether every piece is set.
    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    /// Iterates over the indices of set pieces in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.piece_count)
            .map(PieceIndex)
            .filter(|piece| self.has_piece(*piece))
    }
}

/// Half-open run of pieces that may wrap around inside `[base, base + span)`.
///
/// A range is described by its first piece and its length, so a range that
/// wraps past the last piece is unambiguous: `[lo, N) ∪ [base, hi)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceRange {
    start: u32,
    len: u32,
    base: u32,
    span: u32,
}

impl PieceRange {
    /// Creates a range of `len` pieces starting at `start`, wrapping inside
    /// `[base, base + span)`. The length is capped at `span`.
    pub fn new(start: u32, len: u32, base: u32, span: u32) -> Self {
        let span = span.max(1);
        let start = base + start.saturating_sub(base) % span;
        Self {
            start,
            len: len.min(span),
            base,
            span,
        }
    }

    /// Creates a range that never wraps.
    pub fn linear(start: u32, end: u32) -> Self {
        let len = end.saturating_sub(start);
        Self {
            start,
            len,
            base: start,
            span: len.max(1),
        }
    }

    /// Range with no pieces.
    pub fn empty() -> Self {
        Self {
            start: 0,
            len: 0,
            base: 0,
            span: 1,
        }
    }

    /// First piece of the range.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Exclusive end, normalized into the wrap space.
    pub fn end(&self) -> u32 {
        self.nth(self.len)
    }

    /// Number of pieces in the range.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the range holds no pieces.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the range wraps past the top of its span.
    pub fn wraps(&self) -> bool {
        self.start + self.len > self.base + self.span
    }

    /// Position of `piece` relative to the start, if it lies in the range.
    pub fn offset_of(&self, piece: u32) -> Option<u32> {
        if piece < self.base || piece >= self.base + self.span {
            return None;
        }
        let rel = (piece + self.span - self.start) % self.span;
        (rel < self.len).then_some(rel)
    }

    /// Whether `piece` lies in the range.
    pub fn contains(&self, piece: u32) -> bool {
        self.offset_of(piece).is_some()
    }

    /// The `n`-th piece counted from the start, wrapping as needed.
    pub fn nth(&self, n: u32) -> u32 {
        let rel = (self.start - self.base + n) % self.span;
        self.base + rel
    }

    /// Sub-range covering positions `[from, to)` relative to the start.
    pub fn slice(&self, from: u32, to: u32) -> Self {
        let to = to.min(self.len);
        let from = from.min(to);
        Self {
            start: self.nth(from),
            len: to - from,
            base: self.base,
            span: self.span,
        }
    }

    /// Iterates the range in playback order.
    pub fn iter(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.len).map(move |n| PieceIndex(self.nth(n)))
    }
}
