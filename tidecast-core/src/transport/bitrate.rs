//! Bitrate prediction and piece deadlines from playback history.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Sample {
    seq: u64,
    source_ts: Option<f64>,
    local: Instant,
}

/// Sliding history of played pieces used to derive the source bitrate and
/// the wall-clock deadline of pieces ahead of the playback position.
///
/// Sequence numbers are absolute: they keep growing across a live wrap.
#[derive(Debug, Clone)]
pub struct BitratePredictor {
    history: VecDeque<Sample>,
    window: Duration,
    piece_length: u32,
    start: Option<(u64, Instant)>,
    credited: Duration,
}

impl BitratePredictor {
    pub fn new(piece_length: u32, window: Duration) -> Self {
        Self {
            history: VecDeque::new(),
            window,
            piece_length,
            start: None,
            credited: Duration::ZERO,
        }
    }

    /// Forgets history and the playback anchor.
    pub fn reset(&mut self) {
        self.history.clear();
        self.start = None;
        self.credited = Duration::ZERO;
    }

    /// Anchors deadlines: piece `seq` is due at `now`.
    pub fn set_start(&mut self, seq: u64, now: Instant) {
        self.start = Some((seq, now));
        self.credited = Duration::ZERO;
    }

    pub fn start(&self) -> Option<(u64, Instant)> {
        self.start
    }

    /// Records that piece `seq` was handed to the player at `now`.
    pub fn record(&mut self, seq: u64, source_ts: Option<f64>, now: Instant) {
        self.history.push_back(Sample {
            seq,
            source_ts,
            local: now,
        });
        while let Some(front) = self.history.front() {
            if now.saturating_duration_since(front.local) <= self.window {
                break;
            }
            self.history.pop_front();
        }
    }

    /// Shifts deadlines back by time spent paused.
    pub fn addtime(&mut self, paused: Duration) {
        self.credited += paused;
    }

    /// Bytes per second implied by the source timestamps in the history.
    pub fn bitrate(&self) -> Option<f64> {
        let mut stamped = self
            .history
            .iter()
            .filter_map(|s| s.source_ts.map(|ts| (s.seq, ts)));
        let (first_seq, first_ts) = stamped.next()?;
        let (last_seq, last_ts) = stamped.last()?;
        let elapsed = last_ts - first_ts;
        if last_seq <= first_seq || elapsed <= 0.0 {
            return None;
        }
        Some((last_seq - first_seq) as f64 * f64::from(self.piece_length) / elapsed)
    }

    /// Playback time since the anchor, excluding credited pauses.
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        let (_, anchor) = self.start?;
        Some(
            now.saturating_duration_since(anchor)
                .saturating_sub(self.credited),
        )
    }

    /// Seconds until piece `seq` must be in the player, minus `skew`.
    ///
    /// `+inf` before the anchor is set; negative once the deadline passed.
    pub fn due_in(&self, seq: u64, bitrate: f64, skew: Duration, now: Instant) -> f64 {
        let (Some((start_seq, _)), Some(elapsed)) = (self.start, self.elapsed(now)) else {
            return f64::INFINITY;
        };
        if bitrate <= 0.0 {
            return f64::INFINITY;
        }
        let ahead = seq as f64 - start_seq as f64;
        ahead * f64::from(self.piece_length) / bitrate - elapsed.as_secs_f64() - skew.as_secs_f64()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}
