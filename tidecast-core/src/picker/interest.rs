//! Rarity-ordered index of the pieces we still want.
//!
//! Pieces live in *levels*: `levels[i]` holds every wanted piece whose
//! interest value `priority * step + holders` equals `i`. Walking levels from
//! the bottom yields rarest-first order; the order inside a level is kept
//! uniformly random by inserting each arriving piece at a random slot.
//!
//! Holder counts are stored with a global offset so a peer completing its
//! download shifts every piece down one level without touching the pieces.

use std::collections::HashSet;

use rand::Rng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::piece::{PieceError, PieceIndex};

/// Priority class of a piece that must never be downloaded.
pub const BLOCKED: i32 = -1;

/// Structural defect found by [`InterestIndex::check_consistency`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Interest index violation at piece {piece}: {reason}")]
pub struct IndexViolation {
    pub piece: PieceIndex,
    pub reason: String,
}

/// Levels of wanted pieces plus the counters that place them.
#[derive(Debug, Clone)]
pub struct InterestIndex {
    num_pieces: u32,
    priority_step: u32,
    levels: Vec<Vec<u32>>,
    pos_in_level: Vec<u32>,
    raw_holders: Vec<u32>,
    seed_shift: u32,
    have: Vec<bool>,
    priority: Vec<i32>,
    crosscount: Vec<u32>,
    crosscount2: Vec<u32>,
    numgot: u32,
    started: Vec<u32>,
    removed_partials: HashSet<u32>,
    seeds: u32,
    rng: ChaCha8Rng,
}

impl InterestIndex {
    /// Creates an index with every piece wanted, unheld and shuffled into level 0.
    pub fn new(num_pieces: u32, priority_step: u32, mut rng: ChaCha8Rng) -> Self {
        let mut initial: Vec<u32> = (0..num_pieces).collect();
        initial.shuffle(&mut rng);
        let mut pos_in_level = vec![0u32; num_pieces as usize];
        for (pos, &piece) in initial.iter().enumerate() {
            pos_in_level[piece as usize] = pos as u32;
        }

        Self {
            num_pieces,
            priority_step,
            levels: vec![initial],
            pos_in_level,
            raw_holders: vec![0; num_pieces as usize],
            seed_shift: 0,
            have: vec![false; num_pieces as usize],
            priority: vec![0; num_pieces as usize],
            crosscount: vec![num_pieces],
            crosscount2: vec![num_pieces],
            numgot: 0,
            started: Vec::new(),
            removed_partials: HashSet::new(),
            seeds: 0,
            rng,
        }
    }

    fn check(&self, piece: PieceIndex) -> Result<usize, PieceError> {
        if piece.as_u32() >= self.num_pieces {
            return Err(PieceError::OutOfRange {
                index: piece,
                piece_count: self.num_pieces,
            });
        }
        Ok(piece.as_usize())
    }

    fn holders_at(&self, i: usize) -> u32 {
        self.raw_holders[i] - self.seed_shift
    }

    fn in_levels_at(&self, i: usize) -> bool {
        !self.have[i] && self.priority[i] >= 0
    }

    fn level_at(&self, i: usize) -> usize {
        // Only meaningful for pieces with priority >= 0
        self.priority[i].max(0) as usize * self.priority_step as usize
            + self.holders_at(i) as usize
    }

    fn add_count(counts: &mut Vec<u32>, index: usize, delta: i32) {
        if counts.len() <= index {
            counts.resize(index + 1, 0);
        }
        counts[index] = counts[index].saturating_add_signed(delta);
    }

    fn trim_counts(counts: &mut Vec<u32>) {
        while counts.len() > 1 && counts.last() == Some(&0) {
            counts.pop();
        }
    }

    fn trim_levels(&mut self) {
        while self.levels.last().is_some_and(Vec::is_empty) {
            self.levels.pop();
        }
    }

    fn remove_from_level(&mut self, i: usize) {
        let level = self.level_at(i);
        let pos = self.pos_in_level[i] as usize;
        let slots = &mut self.levels[level];
        slots.swap_remove(pos);
        if let Some(&moved) = slots.get(pos) {
            self.pos_in_level[moved as usize] = pos as u32;
        }
    }

    fn insert_random(&mut self, i: usize) {
        let level = self.level_at(i);
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Vec::new);
        }
        let len = self.levels[level].len();
        let slot = self.rng.random_range(0..=len);
        let slots = &mut self.levels[level];
        if slot == len {
            slots.push(i as u32);
        } else {
            let displaced = slots[slot];
            slots.push(displaced);
            slots[slot] = i as u32;
            self.pos_in_level[displaced as usize] = len as u32;
        }
        self.pos_in_level[i] = slot as u32;
    }

    /// One more non-seed peer holds `piece`.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    pub fn register_have(&mut self, piece: PieceIndex) -> Result<(), PieceError> {
        let i = self.check(piece)?;
        let holders = self.holders_at(i) as usize;
        let had = usize::from(self.have[i]);
        let moves = self.in_levels_at(i);

        if moves {
            self.remove_from_level(i);
        }
        self.raw_holders[i] += 1;
        Self::add_count(&mut self.crosscount, holders, -1);
        Self::add_count(&mut self.crosscount, holders + 1, 1);
        Self::add_count(&mut self.crosscount2, holders + had, -1);
        Self::add_count(&mut self.crosscount2, holders + had + 1, 1);
        if moves {
            self.insert_random(i);
        }
        Ok(())
    }

    /// One non-seed peer no longer holds `piece`. Returns false if the
    /// count was already zero.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    pub fn register_lost(&mut self, piece: PieceIndex) -> Result<bool, PieceError> {
        let i = self.check(piece)?;
        let holders = self.holders_at(i) as usize;
        if holders == 0 {
            tracing::trace!(%piece, "Ignoring loss of piece without holders");
            return Ok(false);
        }
        let had = usize::from(self.have[i]);
        let moves = self.in_levels_at(i);

        if moves {
            self.remove_from_level(i);
        }
        self.raw_holders[i] -= 1;
        Self::add_count(&mut self.crosscount, holders, -1);
        Self::add_count(&mut self.crosscount, holders - 1, 1);
        Self::add_count(&mut self.crosscount2, holders + had, -1);
        Self::add_count(&mut self.crosscount2, holders + had - 1, 1);
        Self::trim_counts(&mut self.crosscount);
        Self::trim_counts(&mut self.crosscount2);
        if moves {
            self.insert_random(i);
        }
        self.trim_levels();
        Ok(true)
    }

    /// `piece` is now held locally. Returns false if it already was.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    pub fn mark_have(&mut self, piece: PieceIndex) -> Result<bool, PieceError> {
        let i = self.check(piece)?;
        if self.have[i] {
            return Ok(false);
        }
        if self.in_levels_at(i) {
            self.remove_from_level(i);
        }
        let holders = self.holders_at(i) as usize;
        self.have[i] = true;
        self.numgot += 1;
        Self::add_count(&mut self.crosscount2, holders, -1);
        Self::add_count(&mut self.crosscount2, holders + 1, 1);
        Self::trim_counts(&mut self.crosscount2);
        self.started.retain(|&p| p != piece.as_u32());
        self.removed_partials.remove(&piece.as_u32());
        self.trim_levels();
        Ok(true)
    }

    /// Reclassifies `piece`. Returns false if the priority did not change.
    ///
    /// Blocking a partial shelves its progress; unblocking resumes it.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    /// - `PieceError::InvalidPriority` - Priority below `BLOCKED`
    pub fn set_priority(&mut self, piece: PieceIndex, priority: i32) -> Result<bool, PieceError> {
        let i = self.check(piece)?;
        if priority < BLOCKED {
            return Err(PieceError::InvalidPriority {
                index: piece,
                priority,
            });
        }
        let old = self.priority[i];
        if old == priority {
            return Ok(false);
        }

        if self.in_levels_at(i) {
            self.remove_from_level(i);
        }
        self.priority[i] = priority;

        if priority == BLOCKED {
            let before = self.started.len();
            self.started.retain(|&p| p != piece.as_u32());
            if self.started.len() != before {
                self.removed_partials.insert(piece.as_u32());
            }
        } else if !self.have[i] {
            self.insert_random(i);
            if old == BLOCKED && self.removed_partials.remove(&piece.as_u32()) {
                self.started.push(piece.as_u32());
            }
        }
        self.trim_levels();
        Ok(true)
    }

    /// Forgets that `piece` is held locally and puts it back into its level.
    /// Returns false if it was not held.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    pub fn invalidate(&mut self, piece: PieceIndex) -> Result<bool, PieceError> {
        let i = self.check(piece)?;
        if !self.have[i] {
            return Ok(false);
        }
        let holders = self.holders_at(i) as usize;
        self.have[i] = false;
        self.numgot -= 1;
        Self::add_count(&mut self.crosscount2, holders + 1, -1);
        Self::add_count(&mut self.crosscount2, holders, 1);
        Self::trim_counts(&mut self.crosscount2);
        if self.priority[i] >= 0 {
            self.insert_random(i);
        }
        Ok(true)
    }

    /// Moves `piece` to the end of its level so others are tried first.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    pub fn bump(&mut self, piece: PieceIndex) -> Result<(), PieceError> {
        let i = self.check(piece)?;
        if self.in_levels_at(i) {
            let level = self.level_at(i);
            let pos = self.pos_in_level[i] as usize;
            let slots = &mut self.levels[level];
            slots.remove(pos);
            slots.push(i as u32);
            for (offset, &moved) in slots[pos..].iter().enumerate() {
                self.pos_in_level[moved as usize] = (pos + offset) as u32;
            }
        }
        self.started.retain(|&p| p != piece.as_u32());
        Ok(())
    }

    /// Records that a chunk of `piece` arrived. Returns true if newly started.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    pub fn mark_started(&mut self, piece: PieceIndex) -> Result<bool, PieceError> {
        let i = self.check(piece)?;
        if !self.in_levels_at(i) || self.started.contains(&piece.as_u32()) {
            return Ok(false);
        }
        self.started.push(piece.as_u32());
        Ok(true)
    }

    /// Forgets partial progress on `piece`. Returns true if it was started.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    pub fn abandon(&mut self, piece: PieceIndex) -> Result<bool, PieceError> {
        self.check(piece)?;
        let before = self.started.len();
        self.started.retain(|&p| p != piece.as_u32());
        Ok(self.started.len() != before)
    }

    /// A seed connected; counts are unaffected.
    pub fn got_seed(&mut self) {
        self.seeds += 1;
    }

    /// A seed disconnected.
    pub fn lost_seed(&mut self) {
        self.seeds = self.seeds.saturating_sub(1);
    }

    /// A counted peer now holds every piece: its contribution is removed from
    /// every count by shifting the whole index down one level.
    ///
    /// Returns false, leaving the index untouched, if some piece has no
    /// holder and the shift would be inconsistent.
    pub fn became_seed(&mut self) -> bool {
        if self.crosscount.first().is_some_and(|&zero| zero > 0)
            || self.levels.first().is_some_and(|level| !level.is_empty())
        {
            return false;
        }
        self.seeds += 1;
        self.seed_shift += 1;
        if !self.levels.is_empty() {
            self.levels.remove(0);
        }
        self.crosscount.remove(0);
        if self.crosscount.is_empty() {
            self.crosscount.push(0);
        }
        if !self.crosscount2.is_empty() {
            self.crosscount2.remove(0);
        }
        if self.crosscount2.is_empty() {
            self.crosscount2.push(0);
        }
        true
    }

    pub fn num_pieces(&self) -> u32 {
        self.num_pieces
    }

    pub fn priority_step(&self) -> u32 {
        self.priority_step
    }

    pub fn levels(&self) -> &[Vec<u32>] {
        &self.levels
    }

    /// Non-seed peers holding `piece`.
    pub fn holders(&self, piece: PieceIndex) -> u32 {
        self.check(piece)
            .map(|i| self.holders_at(i))
            .unwrap_or_default()
    }

    pub fn priority(&self, piece: PieceIndex) -> i32 {
        self.check(piece)
            .map(|i| self.priority[i])
            .unwrap_or(BLOCKED)
    }

    /// Whether `piece` is held locally.
    pub fn has(&self, piece: PieceIndex) -> bool {
        self.check(piece).map(|i| self.have[i]).unwrap_or(false)
    }

    /// Whether `piece` is still wanted: not held and not blocked.
    pub fn is_wanted(&self, piece: PieceIndex) -> bool {
        self.check(piece)
            .map(|i| self.in_levels_at(i))
            .unwrap_or(false)
    }

    /// Level of a wanted piece.
    pub fn interest_value(&self, piece: PieceIndex) -> Option<u32> {
        let i = self.check(piece).ok()?;
        self.in_levels_at(i).then(|| self.level_at(i) as u32)
    }

    /// Slot of a wanted piece inside its level.
    pub fn position_in_level(&self, piece: PieceIndex) -> Option<u32> {
        let i = self.check(piece).ok()?;
        self.in_levels_at(i).then(|| self.pos_in_level[i])
    }

    /// Pieces held locally.
    pub fn numgot(&self) -> u32 {
        self.numgot
    }

    /// Whether every piece is held.
    pub fn is_complete(&self) -> bool {
        self.numgot == self.num_pieces
    }

    /// Wanted pieces over all levels.
    pub fn num_wanted(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Pieces with at least one received chunk.
    pub fn started(&self) -> &[u32] {
        &self.started
    }

    /// Blocked partials waiting for their priority to be restored.
    pub fn removed_partials(&self) -> &HashSet<u32> {
        &self.removed_partials
    }

    pub fn seeds(&self) -> u32 {
        self.seeds
    }

    /// `crosscount[k]`: pieces held by exactly `k` non-seed peers.
    pub fn crosscount(&self) -> &[u32] {
        &self.crosscount
    }

    /// `crosscount2[k]`: pieces held by exactly `k` holders counting ourselves.
    pub fn crosscount2(&self) -> &[u32] {
        &self.crosscount2
    }

    /// Complete copies of the content visible in the swarm, excluding us.
    ///
    /// The integer part is the count of the rarest piece plus connected
    /// seeds; the fraction is the share of pieces above that count.
    pub fn distributed_copies(&self) -> f64 {
        if self.num_pieces == 0 {
            return f64::from(self.seeds);
        }
        let Some((rarest, &count)) = self.crosscount.iter().enumerate().find(|(_, c)| **c > 0)
        else {
            return f64::from(self.seeds);
        };
        let above = f64::from(self.num_pieces - count) / f64::from(self.num_pieces);
        f64::from(self.seeds) + rarest as f64 + above
    }

    /// Verifies membership, slot and level placement of every piece.
    ///
    /// # Errors
    /// - `IndexViolation` - First inconsistency found
    pub fn check_consistency(&self) -> Result<(), IndexViolation> {
        let violation = |piece: usize, reason: String| IndexViolation {
            piece: PieceIndex(piece as u32),
            reason,
        };

        let mut seen = vec![false; self.num_pieces as usize];
        for (level, slots) in self.levels.iter().enumerate() {
            for (pos, &piece) in slots.iter().enumerate() {
                let i = piece as usize;
                if i >= seen.len() {
                    return Err(violation(i, "index out of range".to_string()));
                }
                if seen[i] {
                    return Err(violation(i, "listed twice".to_string()));
                }
                seen[i] = true;
                if !self.in_levels_at(i) {
                    return Err(violation(i, "held or blocked piece in levels".to_string()));
                }
                if self.pos_in_level[i] as usize != pos {
                    return Err(violation(
                        i,
                        format!("slot {} recorded as {}", pos, self.pos_in_level[i]),
                    ));
                }
                if self.level_at(i) != level {
                    return Err(violation(
                        i,
                        format!("in level {} but interest value {}", level, self.level_at(i)),
                    ));
                }
            }
        }
        for (i, listed) in seen.iter().enumerate() {
            if !listed && self.in_levels_at(i) {
                return Err(violation(i, "wanted piece missing from levels".to_string()));
            }
        }

        let mut crosscount = vec![0u32; self.crosscount.len().max(1)];
        let mut crosscount2 = vec![0u32; self.crosscount2.len().max(1)];
        for i in 0..self.num_pieces as usize {
            Self::add_count(&mut crosscount, self.holders_at(i) as usize, 1);
            Self::add_count(
                &mut crosscount2,
                self.holders_at(i) as usize + usize::from(self.have[i]),
                1,
            );
        }
        Self::trim_counts(&mut crosscount);
        Self::trim_counts(&mut crosscount2);
        let mut stored = self.crosscount.clone();
        let mut stored2 = self.crosscount2.clone();
        Self::trim_counts(&mut stored);
        Self::trim_counts(&mut stored2);
        if crosscount != stored || crosscount2 != stored2 {
            return Err(violation(0, "crosscount histogram out of date".to_string()));
        }
        Ok(())
    }
}
