//! Playback state and piece geometry of the selected stream.
//!
//! [`VideoStatus`] answers every "where are we" question the picker, monitor
//! and live hook ask: which pieces are worth downloading, which are urgent,
//! which are still valid inside a live window. It is owned and mutated by the
//! buffer transporter; all other components read it.

use crate::config::{ConfigError, PickerConfig, StreamDescriptor, StreamMode};
use crate::piece::{PieceIndex, PieceRange};

/// Placeholder bitrate for bulk downloads (1 Mbit/s).
pub const BULK_PLACEHOLDER_BITRATE: f64 = 131_072.0;

/// Placeholder bitrate for streams (512 Kbit/s).
pub const STREAMING_PLACEHOLDER_BITRATE: f64 = 65_536.0;

/// Where the current bitrate value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitrateSource {
    /// Assumed until anything better is known
    Placeholder,
    /// Declared by the content metadata
    Metadata,
    /// Reported by an out-of-band media analyser
    Analyser,
    /// Measured from the player's consumption rate
    Measured,
}

impl BitrateSource {
    /// Whether the value came from the content itself and must not be
    /// overridden by measurements.
    pub fn is_authoritative(self) -> bool {
        matches!(self, Self::Metadata | Self::Analyser)
    }
}

#[derive(Debug, Clone, Copy)]
struct HighRangeLimits {
    min_seconds: f64,
    max_seconds: f64,
    step_seconds: f64,
    min_pieces: u32,
    max_pieces: u32,
    step_pieces: u32,
}

/// Playback position, mode flags and range arithmetic of one stream.
#[derive(Debug, Clone)]
pub struct VideoStatus {
    mode: StreamMode,
    piece_length: u32,
    piece_count: u32,
    pieces_per_layer: u32,
    layers: u32,
    content_length: u64,
    file_length: u64,
    first_piece: u32,
    last_piece: u32,
    first_piece_offset: u32,
    last_piece_end: u32,
    wraparound: bool,
    wraparound_delta: u32,
    playback_pos: u32,
    live_startpos: Option<u32>,
    playing: bool,
    paused: bool,
    autoresume: bool,
    prebuffering: bool,
    dropping: bool,
    pausable: bool,
    bitrate: f64,
    bitrate_source: BitrateSource,
    high_range_seconds: f64,
    high_range_pieces: u32,
    limits: HighRangeLimits,
    prebuffer_seconds: f64,
    mid_range_factor: u32,
    quality: u32,
    filename: Option<String>,
    mimetype: String,
}

impl VideoStatus {
    /// Builds the status for a validated descriptor.
    ///
    /// # Errors
    /// - `ConfigError::InvalidValue` - Descriptor or options are inconsistent
    pub fn new(descriptor: &StreamDescriptor, config: &PickerConfig) -> Result<Self, ConfigError> {
        descriptor.validate()?;
        config.validate()?;

        let piece_length = u64::from(descriptor.piece_length);
        let pieces_per_layer = descriptor.pieces_per_layer();
        let live = descriptor.mode == StreamMode::Live;

        let (first_piece, last_piece, first_piece_offset, last_piece_end) = if live {
            (0, pieces_per_layer - 1, 0, descriptor.piece_length)
        } else {
            let end = descriptor.file_offset + descriptor.file_length - 1;
            (
                (descriptor.file_offset / piece_length) as u32,
                (end / piece_length) as u32,
                (descriptor.file_offset % piece_length) as u32,
                (end % piece_length) as u32 + 1,
            )
        };

        let span = last_piece - first_piece + 1;
        let wraparound_delta = descriptor.live_delta.unwrap_or_else(|| (span / 8).max(4));

        let (bitrate, bitrate_source) = match descriptor.bitrate {
            Some(bitrate) => (bitrate as f64, BitrateSource::Metadata),
            None if descriptor.mode == StreamMode::Bulk => {
                (BULK_PLACEHOLDER_BITRATE, BitrateSource::Placeholder)
            }
            None => (STREAMING_PLACEHOLDER_BITRATE, BitrateSource::Placeholder),
        };

        Ok(Self {
            mode: descriptor.mode,
            piece_length: descriptor.piece_length,
            piece_count: descriptor.piece_count,
            pieces_per_layer,
            layers: descriptor.layers,
            content_length: descriptor.content_length,
            file_length: descriptor.file_length,
            first_piece,
            last_piece,
            first_piece_offset,
            last_piece_end,
            wraparound: live && descriptor.wraparound,
            wraparound_delta,
            playback_pos: first_piece,
            live_startpos: None,
            playing: false,
            paused: false,
            autoresume: false,
            prebuffering: false,
            dropping: live,
            pausable: descriptor.pausable,
            bitrate,
            bitrate_source,
            high_range_seconds: config.buffer_seconds,
            high_range_pieces: config.high_range_min_pieces,
            limits: HighRangeLimits {
                min_seconds: config.buffer_seconds,
                max_seconds: config.high_range_max_seconds,
                step_seconds: config.high_range_step_seconds,
                min_pieces: config.high_range_min_pieces,
                max_pieces: config.high_range_max_pieces,
                step_pieces: config.high_range_step_pieces,
            },
            prebuffer_seconds: config.prebuffer_seconds,
            mid_range_factor: config.mid_range_factor,
            quality: 0,
            filename: descriptor.filename.clone(),
            mimetype: descriptor.mimetype.clone(),
        })
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn is_live(&self) -> bool {
        self.mode == StreamMode::Live
    }

    pub fn is_vod(&self) -> bool {
        self.mode == StreamMode::Vod
    }

    pub fn is_bulk(&self) -> bool {
        self.mode == StreamMode::Bulk
    }

    /// VOD or live: a playback position drives picking.
    pub fn is_streaming(&self) -> bool {
        self.mode != StreamMode::Bulk
    }

    pub fn wraparound(&self) -> bool {
        self.wraparound
    }

    pub fn wraparound_delta(&self) -> u32 {
        self.wraparound_delta
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    pub fn pieces_per_layer(&self) -> u32 {
        self.pieces_per_layer
    }

    pub fn first_piece(&self) -> u32 {
        self.first_piece
    }

    pub fn last_piece(&self) -> u32 {
        self.last_piece
    }

    /// Pieces covered by the selected file in the base layer.
    pub fn movie_numpieces(&self) -> u32 {
        self.last_piece - self.first_piece + 1
    }

    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn mimetype(&self) -> &str {
        &self.mimetype
    }

    /// Real size of a piece; only the final piece of the content may be short.
    pub fn piece_size(&self, piece: PieceIndex) -> u32 {
        let start = u64::from(piece.as_u32()) * u64::from(self.piece_length);
        let remaining = self.content_length.saturating_sub(start);
        remaining.min(u64::from(self.piece_length)) as u32
    }

    /// Bytes `[skip, end)` of `piece` that belong to the selected file.
    pub fn file_bytes_of(&self, piece: PieceIndex) -> (u32, u32) {
        let base = self.base_piece(piece);
        if self.wraparound {
            return (0, self.piece_size(piece));
        }
        let skip = if base == self.first_piece {
            self.first_piece_offset
        } else {
            0
        };
        let end = if base == self.last_piece {
            self.last_piece_end
        } else {
            self.piece_size(piece)
        };
        (skip, end.max(skip))
    }

    /// Piece and in-piece offset covering byte `byte_pos` of the file.
    pub fn piece_for_byte(&self, byte_pos: u64) -> (PieceIndex, u32) {
        let piece_length = u64::from(self.piece_length);
        let absolute = u64::from(self.first_piece) * piece_length
            + u64::from(self.first_piece_offset)
            + byte_pos;
        (
            PieceIndex((absolute / piece_length) as u32),
            (absolute % piece_length) as u32,
        )
    }

    pub fn playback_pos(&self) -> u32 {
        self.playback_pos
    }

    /// Moves playback to `piece`, normalized into the stream.
    pub fn set_playback_pos(&mut self, piece: u32) {
        self.playback_pos = if self.wraparound {
            self.normalize(i64::from(piece))
        } else {
            piece.clamp(self.first_piece, self.last_piece + 1)
        };
    }

    /// Advances playback by one piece. VOD may step one past the last piece,
    /// which marks the end of the file.
    pub fn inc_playback_pos(&mut self) -> u32 {
        self.playback_pos = if self.wraparound {
            self.normalize(i64::from(self.playback_pos) + 1)
        } else {
            (self.playback_pos + 1).min(self.last_piece + 1)
        };
        self.playback_pos
    }

    /// Whether VOD playback has passed the last piece.
    pub fn at_end(&self) -> bool {
        !self.wraparound && self.playback_pos > self.last_piece
    }

    pub fn live_startpos(&self) -> Option<u32> {
        self.live_startpos
    }

    /// Fixes the live hook-in point and moves playback there.
    ///
    /// Returns the pieces that were valid before and are not any more.
    pub fn set_live_startpos(&mut self, piece: u32) -> Vec<PieceIndex> {
        let old = self.valid_range();
        let piece = self.normalize(i64::from(piece));
        self.live_startpos = Some(piece);
        self.playback_pos = piece;
        let new = self.valid_range();
        old.iter().filter(|p| !new.contains(p.as_u32())).collect()
    }

    /// Leaves live mode and plays the content as a finite file from the start.
    pub fn switch_to_vod(&mut self) {
        self.mode = StreamMode::Vod;
        self.wraparound = false;
        self.dropping = false;
        self.live_startpos = Some(self.first_piece);
        self.playback_pos = self.first_piece;
    }

    pub fn playing(&self) -> bool {
        self.playing
    }

    pub fn set_playing(&mut self, playing: bool) {
        self.playing = playing;
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool, autoresume: bool) {
        self.paused = paused;
        self.autoresume = paused && autoresume;
    }

    pub fn autoresume(&self) -> bool {
        self.autoresume
    }

    pub fn prebuffering(&self) -> bool {
        self.prebuffering
    }

    pub fn set_prebuffering(&mut self, prebuffering: bool) {
        self.prebuffering = prebuffering;
    }

    pub fn dropping(&self) -> bool {
        self.dropping
    }

    pub fn set_dropping(&mut self, dropping: bool) {
        self.dropping = dropping;
    }

    pub fn pausable(&self) -> bool {
        self.pausable
    }

    pub fn quality(&self) -> u32 {
        self.quality
    }

    pub fn set_quality(&mut self, quality: u32) {
        self.quality = quality.min(self.layers - 1);
    }

    /// Bitrate in bytes per second.
    pub fn bitrate(&self) -> f64 {
        self.bitrate
    }

    pub fn bitrate_source(&self) -> BitrateSource {
        self.bitrate_source
    }

    /// Whether the bitrate is anything but the placeholder.
    pub fn bitrate_confirmed(&self) -> bool {
        self.bitrate_source != BitrateSource::Placeholder
    }

    /// Replaces the bitrate. Non-positive values are ignored.
    pub fn set_bitrate(&mut self, bytes_per_second: f64, source: BitrateSource) {
        if bytes_per_second.is_finite() && bytes_per_second > 0.0 {
            self.bitrate = bytes_per_second;
            self.bitrate_source = source;
        }
    }

    /// Wraps (live) or clamps (otherwise) a piece index into the stream.
    pub fn normalize(&self, piece: i64) -> u32 {
        let first = i64::from(self.first_piece);
        let last = i64::from(self.last_piece);
        if self.wraparound {
            let span = last - first + 1;
            (first + (piece - first).rem_euclid(span)) as u32
        } else {
            piece.clamp(first, last) as u32
        }
    }

    /// Pieces `[lo, hi)`; `hi < lo` wraps as `[lo, last] ∪ [first, hi)`.
    pub fn generate_range(&self, lo: u32, hi: u32) -> PieceRange {
        let span = self.movie_numpieces();
        let len = if hi >= lo {
            hi - lo
        } else {
            (self.last_piece + 1 - lo) + hi.saturating_sub(self.first_piece)
        };
        if lo > self.last_piece {
            return PieceRange::empty();
        }
        PieceRange::new(lo, len, self.first_piece, span)
    }

    /// Pieces needed from here on, in playback order.
    pub fn download_range(&self) -> PieceRange {
        match self.mode {
            StreamMode::Bulk => PieceRange::linear(0, self.piece_count),
            StreamMode::Vod => self.generate_range(self.playback_pos, self.last_piece + 1),
            StreamMode::Live => {
                if self.live_startpos.is_none() {
                    return PieceRange::empty();
                }
                if !self.wraparound {
                    let end = (self.playback_pos + self.wraparound_delta + 1).min(self.last_piece + 1);
                    return self.generate_range(self.playback_pos, end);
                }
                PieceRange::new(
                    self.playback_pos,
                    self.wraparound_delta + 1,
                    self.first_piece,
                    self.movie_numpieces(),
                )
            }
        }
    }

    /// Pieces that are meaningful to hold right now.
    pub fn valid_range(&self) -> PieceRange {
        match self.mode {
            StreamMode::Bulk => PieceRange::linear(0, self.piece_count),
            StreamMode::Vod => PieceRange::linear(self.first_piece, self.last_piece + 1),
            StreamMode::Live if !self.wraparound => {
                let start = self.playback_pos.saturating_sub(self.wraparound_delta).max(self.first_piece);
                let end = (self.playback_pos + self.wraparound_delta + 1).min(self.last_piece + 1);
                PieceRange::linear(start, end)
            }
            StreamMode::Live => {
                let start = self.normalize(
                    i64::from(self.playback_pos) - i64::from(self.wraparound_delta),
                );
                PieceRange::new(
                    start,
                    2 * self.wraparound_delta + 1,
                    self.first_piece,
                    self.movie_numpieces(),
                )
            }
        }
    }

    /// Base-layer index of any layer's piece.
    pub fn base_piece(&self, piece: PieceIndex) -> u32 {
        piece.as_u32() % self.pieces_per_layer
    }

    /// Piece of `layer` covering the same bytes as `piece`.
    pub fn get_respective_piece(&self, piece: PieceIndex, layer: u32) -> PieceIndex {
        PieceIndex(self.base_piece(piece) + layer * self.pieces_per_layer)
    }

    pub fn in_download_range(&self, piece: PieceIndex) -> bool {
        if self.is_bulk() {
            return piece.as_u32() < self.piece_count;
        }
        self.download_range().contains(self.base_piece(piece))
    }

    pub fn in_valid_range(&self, piece: PieceIndex) -> bool {
        if self.is_bulk() {
            return piece.as_u32() < self.piece_count;
        }
        self.valid_range().contains(self.base_piece(piece))
    }

    pub fn in_high_range(&self, piece: PieceIndex) -> bool {
        self.is_streaming() && self.high_range().contains(self.base_piece(piece))
    }

    /// Pieces needed to play `seconds` of video at the current bitrate.
    pub fn time_to_pieces(&self, seconds: f64) -> u32 {
        let pieces = (seconds * self.bitrate / f64::from(self.piece_length)).ceil();
        if pieces.is_finite() && pieces > 0.0 {
            pieces.min(f64::from(u32::MAX)) as u32
        } else {
            0
        }
    }

    /// Length of the high range in pieces.
    pub fn high_range_length(&self) -> u32 {
        let wanted = self
            .time_to_pieces(self.high_range_seconds)
            .max(self.high_range_pieces)
            .min(self.limits.max_pieces);
        wanted.min(self.download_range().len())
    }

    /// Pieces that must arrive before their deadline.
    pub fn high_range(&self) -> PieceRange {
        if !self.is_streaming() {
            return PieceRange::empty();
        }
        let high = self.high_range_length();
        self.download_range().slice(0, high)
    }

    /// Pieces right after the high range, up to `μ · H` from the start.
    pub fn mid_range(&self) -> PieceRange {
        let high = self.high_range_length();
        self.download_range()
            .slice(high, high.saturating_mul(self.mid_range_factor))
    }

    /// Remainder of the download range after the mid range.
    pub fn low_range(&self) -> PieceRange {
        let range = self.download_range();
        let mid_end = self.high_range_length().saturating_mul(self.mid_range_factor);
        range.slice(mid_end, range.len())
    }

    /// Pieces gathered before playback may start.
    pub fn prebuffer_pieces(&self) -> u32 {
        self.time_to_pieces(self.prebuffer_seconds).max(1)
    }

    /// The first pieces ahead of the playback position that prebuffering waits for.
    pub fn prebuffer_range(&self) -> PieceRange {
        self.download_range().slice(0, self.prebuffer_pieces())
    }

    pub fn high_range_seconds(&self) -> f64 {
        self.high_range_seconds
    }

    pub fn high_range_pieces(&self) -> u32 {
        self.high_range_pieces
    }

    /// Sets the high range size, clamped to its limits.
    pub fn set_high_range(&mut self, seconds: Option<f64>, pieces: Option<u32>) {
        if let Some(seconds) = seconds {
            self.high_range_seconds = seconds.clamp(self.limits.min_seconds, self.limits.max_seconds);
        }
        if let Some(pieces) = pieces {
            self.high_range_pieces = pieces.clamp(self.limits.min_pieces, self.limits.max_pieces);
        }
    }

    /// Widens the high range by `factor` steps.
    pub fn increase_high_range(&mut self, factor: u32) {
        let seconds = self.high_range_seconds + f64::from(factor) * self.limits.step_seconds;
        let pieces = self
            .high_range_pieces
            .saturating_add(factor.saturating_mul(self.limits.step_pieces));
        self.set_high_range(Some(seconds), Some(pieces));
    }

    /// Narrows the high range by `factor` steps.
    pub fn decrease_high_range(&mut self, factor: u32) {
        let seconds = self.high_range_seconds - f64::from(factor) * self.limits.step_seconds;
        let pieces = self
            .high_range_pieces
            .saturating_sub(factor.saturating_mul(self.limits.step_pieces));
        self.set_high_range(Some(seconds), Some(pieces));
    }

    /// Piece falling off the trailing edge of the live window.
    pub fn live_piece_to_invalidate(&self) -> PieceIndex {
        PieceIndex(self.normalize(
            i64::from(self.playback_pos) - i64::from(self.wraparound_delta),
        ))
    }
}
