//! Piece selection for bulk, VOD and live downloads.
//!
//! [`PiecePicker`] owns the interest index, the local `have` state and the
//! peer table. Each call to [`PiecePicker::pick`] runs the decision cascade
//! for one request opportunity on one connection:
//!
//! 1. finish a partial piece when partials take precedence,
//! 2. for streams, pick from the prebuffer window and then the
//!    high, mid and low ranges around the playback position,
//! 3. otherwise walk the levels rarest-first.
//!
//! Peers with deadline misses on record are kept off high-range pieces that
//! some other well-behaved peer can serve.

pub mod interest;

use std::collections::HashSet;
use std::time::Instant;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

pub use interest::{BLOCKED, IndexViolation, InterestIndex};

use crate::config::{ConfigError, PickerConfig};
use crate::peer::{
    Interest, InterestChange, PeerCapabilities, PeerId, PeerRecord, PeerTable,
};
use crate::piece::{Bitfield, PieceError, PieceIndex, PieceRange};
use crate::stats::{PickStage, PickStats};
use crate::video::VideoStatus;

/// Caller-side constraints of one pick.
#[derive(Clone, Copy)]
pub struct PickOptions<'a> {
    /// Extra filter; pieces it rejects are never returned
    pub want: Option<&'a dyn Fn(PieceIndex) -> bool>,
    /// Prefer finishing started pieces over anything else
    pub complete_first: bool,
    /// Pieces downloading slowly elsewhere; avoided unless nothing else fits
    pub slow_pieces: Option<&'a HashSet<PieceIndex>>,
    /// Whether the caller will request the returned piece
    pub will_request: bool,
}

impl Default for PickOptions<'_> {
    fn default() -> Self {
        Self {
            want: None,
            complete_first: false,
            slow_pieces: None,
            will_request: true,
        }
    }
}

impl std::fmt::Debug for PickOptions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PickOptions")
            .field("want", &self.want.is_some())
            .field("complete_first", &self.complete_first)
            .field("slow_pieces", &self.slow_pieces.map_or(0, HashSet::len))
            .field("will_request", &self.will_request)
            .finish()
    }
}

/// Rarity-first piece picker with a streaming overlay.
#[derive(Debug)]
pub struct PiecePicker {
    config: PickerConfig,
    index: InterestIndex,
    peers: PeerTable,
    stats: PickStats,
}

impl PiecePicker {
    /// Creates a picker for `piece_count` pieces.
    ///
    /// # Errors
    /// - `ConfigError::InvalidValue` - Options out of range or no pieces
    pub fn new(piece_count: u32, config: PickerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        if piece_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "piece_count",
                reason: "must be positive".to_string(),
            });
        }
        let mut rng = match config.rng_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_os_rng(),
        };
        let index_rng = ChaCha8Rng::seed_from_u64(rng.random());
        let index = InterestIndex::new(piece_count, config.priority_step, index_rng);

        Ok(Self {
            config,
            index,
            peers: PeerTable::new(),
            stats: PickStats::default(),
        })
    }

    pub fn config(&self) -> &PickerConfig {
        &self.config
    }

    pub fn index(&self) -> &InterestIndex {
        &self.index
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Mutable table access for the request monitor.
    pub fn peers_mut(&mut self) -> &mut PeerTable {
        &mut self.peers
    }

    pub fn peer(&self, peer: PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer)
    }

    /// Mutable access to one record, for counters the picker does not manage.
    pub fn peer_mut(&mut self, peer: PeerId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(peer)
    }

    pub fn stats(&self) -> &PickStats {
        &self.stats
    }

    pub fn piece_count(&self) -> u32 {
        self.index.num_pieces()
    }

    /// Whether `piece` is held locally.
    pub fn has(&self, piece: PieceIndex) -> bool {
        self.index.has(piece)
    }

    /// Lowest level still considered "common"; one less per connected seed.
    pub fn priority_cutoff(&self) -> u32 {
        self.config
            .rarest_first_priority_cutoff
            .saturating_sub(self.index.seeds())
    }

    /// Checks that `piece` addresses this content.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    pub fn validate_piece(&self, piece: PieceIndex) -> Result<(), PieceError> {
        if piece.as_u32() >= self.piece_count() {
            return Err(PieceError::OutOfRange {
                index: piece,
                piece_count: self.piece_count(),
            });
        }
        Ok(())
    }

    fn record_mut(&mut self, peer: PeerId) -> Result<&mut PeerRecord, PieceError> {
        self.peers
            .get_mut(peer)
            .ok_or(PieceError::UnknownPeer { peer })
    }

    /// Registers a new connection. Returns false if the id is taken.
    pub fn add_peer(&mut self, peer: PeerId, capabilities: PeerCapabilities, now: Instant) -> bool {
        let record = PeerRecord::new(
            peer,
            capabilities,
            self.piece_count(),
            self.config.short_term_rate_window(),
            now,
        );
        let added = self.peers.insert(record);
        if added {
            debug!(%peer, ?capabilities, "Peer connected");
        }
        added
    }

    /// `peer` announced `piece`.
    ///
    /// When the announcement completes the peer's bitfield, its counts are
    /// shifted out of the index and it is treated as a seed from then on.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    /// - `PieceError::UnknownPeer` - Peer not registered
    pub fn got_have(
        &mut self,
        peer: PeerId,
        piece: PieceIndex,
    ) -> Result<Vec<InterestChange>, PieceError> {
        self.validate_piece(piece)?;
        let wanted = self.index.is_wanted(piece);
        let record = self
            .peers
            .get_mut(peer)
            .ok_or(PieceError::UnknownPeer { peer })?;
        if record.is_seed || !record.bitfield.set_piece(piece) {
            return Ok(Vec::new());
        }

        let was_interesting = record.is_interesting();
        if wanted {
            record.interesting.insert(piece);
        }
        let mut changes = Vec::new();
        if !was_interesting && record.is_interesting() {
            changes.push(InterestChange {
                peer,
                interest: Interest::Interested,
            });
        }
        let complete = record.bitfield.is_complete();
        if complete {
            record.is_seed = true;
        }

        self.index.register_have(piece)?;

        if complete {
            debug!(%peer, "Peer completed its download");
            if !self.index.became_seed() {
                let held: Vec<PieceIndex> = (0..self.piece_count()).map(PieceIndex).collect();
                for held_piece in held {
                    self.index.register_lost(held_piece)?;
                }
                self.index.got_seed();
            }
        }
        Ok(changes)
    }

    /// `peer` sent its full bitfield.
    ///
    /// # Errors
    /// - `PieceError::BitfieldPieceCount` - Bitfield covers the wrong piece count
    /// - `PieceError::UnknownPeer` - Peer not registered
    pub fn got_bitfield(
        &mut self,
        peer: PeerId,
        bitfield: &Bitfield,
    ) -> Result<Vec<InterestChange>, PieceError> {
        if bitfield.len() != self.piece_count() {
            return Err(PieceError::BitfieldPieceCount {
                expected: self.piece_count(),
                actual: bitfield.len(),
            });
        }
        if !self.peers.contains(peer) {
            return Err(PieceError::UnknownPeer { peer });
        }
        if bitfield.is_complete() {
            return self.got_seed(peer);
        }

        let mut changes = Vec::new();
        for piece in bitfield.iter_set() {
            changes.extend(self.got_have(peer, piece)?);
        }
        Ok(changes)
    }

    /// `peer` announced that it holds everything. Seeds are not counted per
    /// piece; they tighten the priority cutoff instead.
    ///
    /// # Errors
    /// - `PieceError::UnknownPeer` - Peer not registered
    pub fn got_seed(&mut self, peer: PeerId) -> Result<Vec<InterestChange>, PieceError> {
        let piece_count = self.piece_count();
        let record = self
            .peers
            .get_mut(peer)
            .ok_or(PieceError::UnknownPeer { peer })?;
        if record.is_seed {
            return Ok(Vec::new());
        }

        let counted: Vec<PieceIndex> = record.bitfield.iter_set().collect();
        let was_interesting = record.is_interesting();
        record.bitfield = Bitfield::full(piece_count);
        record.is_seed = true;
        record.interesting = (0..piece_count)
            .map(PieceIndex)
            .filter(|piece| self.index.is_wanted(*piece))
            .collect();
        let now_interesting = record.is_interesting();

        for piece in counted {
            self.index.register_lost(piece)?;
        }
        self.index.got_seed();
        debug!(%peer, seeds = self.index.seeds(), cutoff = self.priority_cutoff(), "Seed connected");

        Ok(if !was_interesting && now_interesting {
            vec![InterestChange {
                peer,
                interest: Interest::Interested,
            }]
        } else {
            Vec::new()
        })
    }

    /// Forgets a connection, withdrawing its pieces from the counts.
    ///
    /// # Errors
    /// - `PieceError::UnknownPeer` - Peer not registered
    pub fn lost_peer(&mut self, peer: PeerId) -> Result<PeerRecord, PieceError> {
        let record = self
            .peers
            .remove(peer)
            .ok_or(PieceError::UnknownPeer { peer })?;
        if record.is_seed {
            self.index.lost_seed();
        } else {
            for piece in record.bitfield.iter_set() {
                self.index.register_lost(piece)?;
            }
        }
        debug!(%peer, seed = record.is_seed, "Peer disconnected");
        Ok(record)
    }

    /// Records the choke state the peer applies to us.
    ///
    /// # Errors
    /// - `PieceError::UnknownPeer` - Peer not registered
    pub fn set_choked(&mut self, peer: PeerId, choked: bool) -> Result<(), PieceError> {
        self.record_mut(peer)?.choked = choked;
        Ok(())
    }

    /// A chunk of `piece` arrived: the piece is now partial.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    pub fn mark_started(&mut self, piece: PieceIndex) -> Result<bool, PieceError> {
        self.index.mark_started(piece)
    }

    /// Playback skipped `piece`: whatever arrived of it is no longer a partial.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    pub fn abandon(&mut self, piece: PieceIndex) -> Result<bool, PieceError> {
        let abandoned = self.index.abandon(piece)?;
        if abandoned {
            for record in self.peers.iter_mut() {
                record.active_requests.retain(|request| request.piece != piece);
            }
        }
        Ok(abandoned)
    }

    fn update_interest(&mut self, piece: PieceIndex, wanted: bool) -> Vec<InterestChange> {
        let mut changes = Vec::new();
        for peer in self.peers.ids() {
            let Some(record) = self.peers.get_mut(peer) else {
                continue;
            };
            let was_interesting = record.is_interesting();
            if wanted && record.has(piece) {
                record.interesting.insert(piece);
            } else if !wanted {
                record.interesting.remove(&piece);
            }
            match (was_interesting, record.is_interesting()) {
                (false, true) => changes.push(InterestChange {
                    peer,
                    interest: Interest::Interested,
                }),
                (true, false) => changes.push(InterestChange {
                    peer,
                    interest: Interest::NotInterested,
                }),
                _ => {}
            }
        }
        changes
    }

    /// `piece` passed its hash check and is now held locally.
    ///
    /// Requests for the piece on every connection are dropped.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    pub fn complete(&mut self, piece: PieceIndex) -> Result<Vec<InterestChange>, PieceError> {
        if !self.index.mark_have(piece)? {
            return Ok(Vec::new());
        }
        for record in self.peers.iter_mut() {
            record.active_requests.retain(|request| request.piece != piece);
        }
        Ok(self.update_interest(piece, false))
    }

    /// Changes the priority class of `piece`; `BLOCKED` removes it from selection.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    /// - `PieceError::InvalidPriority` - Priority below `BLOCKED`
    pub fn set_priority(
        &mut self,
        piece: PieceIndex,
        priority: i32,
    ) -> Result<Vec<InterestChange>, PieceError> {
        let was_wanted = self.index.is_wanted(piece);
        if !self.index.set_priority(piece, priority)? {
            return Ok(Vec::new());
        }
        let wanted = self.index.is_wanted(piece);
        if wanted == was_wanted {
            return Ok(Vec::new());
        }
        Ok(self.update_interest(piece, wanted))
    }

    /// Discards `piece` from a live window: it ceases to exist at every
    /// counted neighbour and, if held, becomes wanted again.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    pub fn invalidate(&mut self, piece: PieceIndex) -> Result<Vec<InterestChange>, PieceError> {
        self.validate_piece(piece)?;
        let mut changes = Vec::new();
        for peer in self.peers.ids() {
            let Some(record) = self.peers.get_mut(peer) else {
                continue;
            };
            if record.is_seed || !record.bitfield.clear_piece(piece) {
                continue;
            }
            let was_interesting = record.is_interesting();
            record.interesting.remove(&piece);
            if was_interesting && !record.is_interesting() {
                changes.push(InterestChange {
                    peer,
                    interest: Interest::NotInterested,
                });
            }
            self.index.register_lost(piece)?;
        }

        if self.index.invalidate(piece)? {
            self.stats.invalidated += 1;
            trace!(%piece, "Invalidated piece");
            changes.extend(self.update_interest(piece, true));
        }
        Ok(changes)
    }

    /// `piece` failed its hash check: it goes to the back of its level and
    /// loses its partial status.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    pub fn hash_failed(&mut self, piece: PieceIndex) -> Result<(), PieceError> {
        self.index.bump(piece)?;
        for record in self.peers.iter_mut() {
            record.active_requests.retain(|request| request.piece != piece);
        }
        Ok(())
    }

    /// Chooses the next piece to request from `peer`, or `None`.
    ///
    /// Never returns a piece already held or blocked.
    ///
    /// # Errors
    /// - `PieceError::UnknownPeer` - Peer not registered
    pub fn pick(
        &mut self,
        peer: PeerId,
        video: &VideoStatus,
        options: &PickOptions<'_>,
    ) -> Result<Option<PieceIndex>, PieceError> {
        let record = self.peers.get(peer).ok_or(PieceError::UnknownPeer { peer })?;

        let mut choice = self.pick_with(record, video, options, true);
        let mut retried = false;
        if choice.is_none()
            && !video.is_live()
            && options.slow_pieces.is_some_and(|slow| !slow.is_empty())
        {
            choice = self.pick_with(record, video, options, false);
            retried = choice.is_some();
        }

        if let Some((piece, stage)) = choice {
            trace!(%peer, %piece, ?stage, "Picked piece");
            if options.will_request {
                self.stats.record(stage);
                if retried {
                    self.stats.slow_retries += 1;
                }
            }
        }
        Ok(choice.map(|(piece, _)| piece))
    }

    /// Whether `peer` must leave `piece` to someone better behaved.
    fn is_barred_from(&self, peer: &PeerRecord, piece: PieceIndex, video: &VideoStatus) -> bool {
        peer.is_barred()
            && video.in_high_range(piece)
            && self
                .peers
                .iter()
                .any(|other| other.id != peer.id && !other.is_barred() && other.has(piece))
    }

    fn pick_with(
        &self,
        peer: &PeerRecord,
        video: &VideoStatus,
        options: &PickOptions<'_>,
        exclude_slow: bool,
    ) -> Option<(PieceIndex, PickStage)> {
        if video.is_live() && video.live_startpos().is_none() {
            return None;
        }

        let allowed = |piece: PieceIndex| -> bool {
            peer.has(piece)
                && self.index.is_wanted(piece)
                && options.want.is_none_or(|want| want(piece))
                && !(exclude_slow && options.slow_pieces.is_some_and(|slow| slow.contains(&piece)))
                && !self.is_barred_from(peer, piece, video)
        };
        let in_range = |piece: PieceIndex| -> bool {
            if video.is_live() {
                video.in_download_range(piece)
            } else {
                video.in_valid_range(piece)
            }
        };

        let mut best: Option<(u32, PieceIndex)> = None;
        for &started in self.index.started() {
            let piece = PieceIndex(started);
            if !allowed(piece) || !in_range(piece) {
                continue;
            }
            if let Some(value) = self.index.interest_value(piece)
                && best.is_none_or(|(best_value, _)| value < best_value)
            {
                best = Some((value, piece));
            }
        }

        let random_phase = self.index.numgot() < self.config.rarest_first_cutoff;
        if let Some((_, piece)) = best
            && (options.complete_first
                || (random_phase && self.index.levels().len() as u32 > self.priority_cutoff()))
        {
            return Some((piece, PickStage::Partial));
        }

        if video.is_streaming()
            && let Some(choice) = self.pick_streaming(video, &allowed)
        {
            return Some(choice);
        }

        let levels = self.index.levels();
        let bound = best.map_or(levels.len(), |(value, _)| value as usize);
        for level in &levels[..bound.min(levels.len())] {
            for &candidate in level {
                let piece = PieceIndex(candidate);
                if allowed(piece) && in_range(piece) {
                    return Some((piece, PickStage::Bulk));
                }
            }
        }
        best.map(|(_, piece)| (piece, PickStage::Partial))
    }

    fn pick_streaming(
        &self,
        video: &VideoStatus,
        allowed: &dyn Fn(PieceIndex) -> bool,
    ) -> Option<(PieceIndex, PickStage)> {
        if video.prebuffering()
            && let Some(piece) = self.pick_rarest_small_range(video, video.prebuffer_range(), allowed)
        {
            return Some((piece, PickStage::High));
        }

        let high = video.high_range();
        let choice = if video.is_live() {
            self.pick_rarest_small_range(video, high, allowed)
        } else {
            self.pick_first(video, high, allowed)
        };
        if let Some(piece) = choice {
            return Some((piece, PickStage::High));
        }

        if let Some(piece) = self.pick_rarest(video, video.mid_range(), allowed) {
            return Some((piece, PickStage::Mid));
        }
        self.pick_rarest(video, video.low_range(), allowed)
            .map(|piece| (piece, PickStage::Low))
    }

    /// First missing piece of the high range in playback order.
    ///
    /// When the current quality layer is fully held, the same positions of
    /// the next layer are tried, up to the top layer.
    fn pick_first(
        &self,
        video: &VideoStatus,
        range: PieceRange,
        allowed: &dyn Fn(PieceIndex) -> bool,
    ) -> Option<PieceIndex> {
        for layer in video.quality()..video.layers() {
            let mut layer_complete = true;
            for base in range.iter() {
                let piece = video.get_respective_piece(base, layer);
                if self.index.has(piece) {
                    continue;
                }
                layer_complete = false;
                if allowed(piece) {
                    return Some(piece);
                }
            }
            if !layer_complete {
                return None;
            }
        }
        None
    }

    /// Rarest allowed piece of a short range. Ties go to the earlier slot in
    /// the shared level, which is uniformly random.
    fn pick_rarest_small_range(
        &self,
        video: &VideoStatus,
        range: PieceRange,
        allowed: &dyn Fn(PieceIndex) -> bool,
    ) -> Option<PieceIndex> {
        range
            .iter()
            .map(|base| video.get_respective_piece(base, video.quality()))
            .filter(|piece| allowed(*piece))
            .filter_map(|piece| {
                let value = self.index.interest_value(piece)?;
                let slot = self.index.position_in_level(piece)?;
                Some(((value, slot), piece))
            })
            .min_by_key(|(key, _)| *key)
            .map(|(_, piece)| piece)
    }

    /// Rarest allowed piece of any range, choosing the cheaper of scanning
    /// the range or walking the levels.
    fn pick_rarest(
        &self,
        video: &VideoStatus,
        range: PieceRange,
        allowed: &dyn Fn(PieceIndex) -> bool,
    ) -> Option<PieceIndex> {
        if range.is_empty() {
            return None;
        }
        if range.len() as usize <= self.index.num_wanted() {
            return self.pick_rarest_small_range(video, range, allowed);
        }
        let quality = video.quality();
        self.index
            .levels()
            .iter()
            .flatten()
            .map(|&piece| PieceIndex(piece))
            .find(|&piece| {
                piece.as_u32() / video.pieces_per_layer() == quality
                    && range.contains(video.base_piece(piece))
                    && allowed(piece)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamDescriptor;

    fn picker(pieces: u32) -> PiecePicker {
        PiecePicker::new(pieces, PickerConfig::for_testing()).unwrap()
    }

    fn bulk(pieces: u32) -> VideoStatus {
        VideoStatus::new(
            &StreamDescriptor::bulk(16_384, pieces),
            &PickerConfig::default(),
        )
        .unwrap()
    }

    fn vod(pieces: u32) -> VideoStatus {
        VideoStatus::new(
            &StreamDescriptor::vod(16_384, pieces).with_bitrate(65_536),
            &PickerConfig::default(),
        )
        .unwrap()
    }

    fn connect(picker: &mut PiecePicker, id: u64, bits: &str) -> PeerId {
        let peer = PeerId(id);
        picker.add_peer(peer, PeerCapabilities::default(), Instant::now());
        picker
            .got_bitfield(peer, &Bitfield::from_bit_str(bits))
            .unwrap();
        peer
    }

    #[test]
    fn test_rarest_piece_picked_first() {
        let mut picker = picker(5);
        let video = bulk(5);
        let peer = connect(&mut picker, 1, "11110");
        connect(&mut picker, 2, "11100");
        connect(&mut picker, 3, "11000");
        connect(&mut picker, 4, "10000");
        let choice = picker.pick(peer, &video, &PickOptions::default()).unwrap();
        assert_eq!(choice, Some(PieceIndex(3)));
        assert_eq!(picker.stats().bulk, 1);
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let mut picker = picker(5);
        let video = bulk(5);
        let err = picker
            .pick(PeerId(9), &video, &PickOptions::default())
            .unwrap_err();
        assert_eq!(err, PieceError::UnknownPeer { peer: PeerId(9) });
    }

    #[test]
    fn test_held_and_blocked_pieces_never_picked() {
        let mut picker = picker(3);
        let video = bulk(3);
        let peer = connect(&mut picker, 1, "111");
        picker.complete(PieceIndex(0)).unwrap();
        picker.set_priority(PieceIndex(1), BLOCKED).unwrap();
        let choice = picker.pick(peer, &video, &PickOptions::default()).unwrap();
        assert_eq!(choice, Some(PieceIndex(2)));
        picker.complete(PieceIndex(2)).unwrap();
        assert_eq!(
            picker.pick(peer, &video, &PickOptions::default()).unwrap(),
            None
        );
    }

    #[test]
    fn test_want_filter_and_will_request() {
        let mut picker = picker(4);
        let video = bulk(4);
        let peer = connect(&mut picker, 1, "1111");
        let only_two = |piece: PieceIndex| piece == PieceIndex(2);
        let options = PickOptions {
            want: Some(&only_two),
            will_request: false,
            ..PickOptions::default()
        };
        assert_eq!(
            picker.pick(peer, &video, &options).unwrap(),
            Some(PieceIndex(2))
        );
        assert_eq!(picker.stats().total(), 0);
    }

    #[test]
    fn test_partial_completed_first_when_asked() {
        let mut picker = picker(6);
        let video = bulk(6);
        let peer = connect(&mut picker, 1, "111111");
        connect(&mut picker, 2, "000011");
        picker.mark_started(PieceIndex(5)).unwrap();
        let options = PickOptions {
            complete_first: true,
            ..PickOptions::default()
        };
        assert_eq!(
            picker.pick(peer, &video, &options).unwrap(),
            Some(PieceIndex(5))
        );
        assert_eq!(picker.stats().partial, 1);
    }

    #[test]
    fn test_partial_wins_in_random_phase_above_cutoff() {
        let mut picker = picker(40);
        let video = bulk(40);
        let peer = connect(&mut picker, 1, &"1".repeat(40));
        // Lift piece 7 above the cutoff with extra holders
        for id in 2..6 {
            picker.add_peer(PeerId(id), PeerCapabilities::default(), Instant::now());
            picker.got_have(PeerId(id), PieceIndex(7)).unwrap();
        }
        picker.mark_started(PieceIndex(7)).unwrap();
        assert!(picker.index().levels().len() as u32 > picker.priority_cutoff());
        assert_eq!(
            picker.pick(peer, &video, &PickOptions::default()).unwrap(),
            Some(PieceIndex(7))
        );

        // Once a piece is held, rarity wins over the partial
        let other = picker.index().levels()[0][0];
        picker.complete(PieceIndex(other)).unwrap();
        let choice = picker
            .pick(peer, &video, &PickOptions::default())
            .unwrap()
            .unwrap();
        assert_ne!(choice, PieceIndex(7));
        assert_eq!(picker.index().holders(choice), 0);
    }

    #[test]
    fn test_slow_pieces_retried_outside_live() {
        let mut picker = picker(2);
        let video = bulk(2);
        let peer = connect(&mut picker, 1, "10");
        let slow: HashSet<PieceIndex> = [PieceIndex(0)].into_iter().collect();
        let options = PickOptions {
            slow_pieces: Some(&slow),
            ..PickOptions::default()
        };
        assert_eq!(
            picker.pick(peer, &video, &options).unwrap(),
            Some(PieceIndex(0))
        );
        assert_eq!(picker.stats().slow_retries, 1);
    }

    #[test]
    fn test_vod_picks_high_range_in_order() {
        let mut picker = picker(100);
        let mut video = vod(100);
        video.set_playing(true);
        video.set_playback_pos(10);
        let peer = connect(&mut picker, 1, &"1".repeat(100));
        for expected in 10..13 {
            let piece = picker
                .pick(peer, &video, &PickOptions::default())
                .unwrap()
                .unwrap();
            assert_eq!(piece, PieceIndex(expected));
            picker.complete(piece).unwrap();
        }
        assert_eq!(picker.stats().high, 3);
    }

    #[test]
    fn test_vod_falls_through_to_mid_range() {
        let mut picker = picker(100);
        let video = vod(100);
        // Peer only holds pieces past the 20 piece high range
        let bits: String = (0..100).map(|i| if i >= 20 { '1' } else { '0' }).collect();
        let peer = connect(&mut picker, 1, &bits);
        let piece = picker
            .pick(peer, &video, &PickOptions::default())
            .unwrap()
            .unwrap();
        assert!(video.mid_range().contains(piece.as_u32()));
        assert_eq!(picker.stats().mid, 1);
    }

    #[test]
    fn test_prebuffer_window_picked_rarest() {
        let mut picker = picker(100);
        let mut video = vod(100);
        video.set_prebuffering(true);
        let peer = connect(&mut picker, 1, &"1".repeat(100));
        // Everything inside the 40 piece prebuffer window except piece 33 is common
        for id in 2..4 {
            let bits: String = (0..100).map(|i| if i == 33 { '0' } else { '1' }).collect();
            connect(&mut picker, id, &bits);
        }
        assert_eq!(
            picker.pick(peer, &video, &PickOptions::default()).unwrap(),
            Some(PieceIndex(33))
        );
    }

    #[test]
    fn test_barred_peer_kept_off_high_range() {
        let mut picker = picker(10);
        let video = vod(10);
        let good = connect(&mut picker, 1, "1000000000");
        let slow = connect(&mut picker, 2, "1000000000");
        picker.peer_mut(slow).unwrap().bad_performance = 2;

        assert_eq!(
            picker.pick(slow, &video, &PickOptions::default()).unwrap(),
            None
        );
        assert_eq!(
            picker.pick(good, &video, &PickOptions::default()).unwrap(),
            Some(PieceIndex(0))
        );
        picker.lost_peer(good).unwrap();
        assert_eq!(
            picker.pick(slow, &video, &PickOptions::default()).unwrap(),
            Some(PieceIndex(0))
        );
    }

    #[test]
    fn test_live_before_hook_in_picks_nothing() {
        let mut picker = picker(100);
        let mut video = VideoStatus::new(
            &StreamDescriptor::live(16_384, 100),
            &PickerConfig::default(),
        )
        .unwrap();
        let peer = connect(&mut picker, 1, &"1".repeat(100));
        assert_eq!(
            picker.pick(peer, &video, &PickOptions::default()).unwrap(),
            None
        );
        video.set_live_startpos(50);
        let piece = picker
            .pick(peer, &video, &PickOptions::default())
            .unwrap()
            .unwrap();
        assert!(video.in_download_range(piece));
    }

    #[test]
    fn test_quality_escalates_when_base_layer_held() {
        let mut picker = picker(20);
        let video = VideoStatus::new(
            &StreamDescriptor::vod(16_384, 20)
                .with_bitrate(65_536)
                .with_layers(2),
            &PickerConfig::default(),
        )
        .unwrap();
        let peer = connect(&mut picker, 1, &"1".repeat(20));
        for piece in 0..10 {
            picker.complete(PieceIndex(piece)).unwrap();
        }
        let piece = picker
            .pick(peer, &video, &PickOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(piece, PieceIndex(10));
    }

    #[test]
    fn test_interest_transitions() {
        let mut picker = picker(2);
        picker.add_peer(PeerId(1), PeerCapabilities::default(), Instant::now());
        let changes = picker.got_have(PeerId(1), PieceIndex(0)).unwrap();
        assert_eq!(
            changes,
            vec![InterestChange {
                peer: PeerId(1),
                interest: Interest::Interested
            }]
        );
        assert!(picker.got_have(PeerId(1), PieceIndex(0)).unwrap().is_empty());
        let changes = picker.complete(PieceIndex(0)).unwrap();
        assert_eq!(
            changes,
            vec![InterestChange {
                peer: PeerId(1),
                interest: Interest::NotInterested
            }]
        );
    }

    #[test]
    fn test_seed_handling_keeps_counts_consistent() {
        let mut picker = picker(4);
        let peer = connect(&mut picker, 1, "0110");
        connect(&mut picker, 2, "1111");
        assert_eq!(picker.index().seeds(), 1);
        assert_eq!(picker.priority_cutoff(), 2);
        assert_eq!(picker.index().holders(PieceIndex(1)), 1);

        // Peer 1 completes incrementally and is shifted out of the counts
        picker.got_have(peer, PieceIndex(0)).unwrap();
        picker.got_have(peer, PieceIndex(3)).unwrap();
        assert!(picker.peer(peer).unwrap().is_seed);
        assert_eq!(picker.index().seeds(), 2);
        assert_eq!(picker.index().holders(PieceIndex(1)), 0);
        picker.index().check_consistency().unwrap();

        picker.lost_peer(peer).unwrap();
        picker.lost_peer(PeerId(2)).unwrap();
        assert_eq!(picker.index().seeds(), 0);
        picker.index().check_consistency().unwrap();
    }

    #[test]
    fn test_invalidate_clears_swarm_and_local_copy() {
        let mut picker = picker(10);
        let peer = connect(&mut picker, 1, "0011000000");
        picker.complete(PieceIndex(2)).unwrap();
        let changes = picker.invalidate(PieceIndex(2)).unwrap();
        assert!(changes.is_empty());
        assert!(!picker.has(PieceIndex(2)));
        assert!(!picker.peer(peer).unwrap().has(PieceIndex(2)));
        assert_eq!(picker.index().holders(PieceIndex(2)), 0);
        assert_eq!(picker.stats().invalidated, 1);

        let changes = picker.invalidate(PieceIndex(3)).unwrap();
        assert_eq!(
            changes,
            vec![InterestChange {
                peer,
                interest: Interest::NotInterested
            }]
        );
        assert_eq!(picker.stats().invalidated, 1);
        picker.index().check_consistency().unwrap();
    }

    #[test]
    fn test_bitfield_length_checked() {
        let mut picker = picker(10);
        picker.add_peer(PeerId(1), PeerCapabilities::default(), Instant::now());
        let err = picker
            .got_bitfield(PeerId(1), &Bitfield::new(20))
            .unwrap_err();
        assert!(matches!(err, PieceError::BitfieldPieceCount { .. }));
    }

    #[test]
    fn test_bitfield_error_reports_piece_counts() {
        // same byte count, one piece short
        let mut picker = picker(100);
        picker.add_peer(PeerId(1), PeerCapabilities::default(), Instant::now());
        let err = picker
            .got_bitfield(PeerId(1), &Bitfield::from_bit_str(&"1".repeat(99)))
            .unwrap_err();
        assert_eq!(
            err,
            PieceError::BitfieldPieceCount {
                expected: 100,
                actual: 99
            }
        );
        assert_eq!(err.to_string(), "Bitfield covers 99 pieces, expected 100");
        assert_eq!(picker.index().holders(PieceIndex(0)), 0);
    }
}
