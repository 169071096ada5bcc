//! Statistics gathered by the picker, monitor and transporter.

use std::time::Duration;

/// Cascade stage that produced a pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickStage {
    /// Completing a piece with chunks already received
    Partial,
    /// Prebuffer window or high range
    High,
    /// Between the high range and `μ · H`
    Mid,
    /// Rest of the download range
    Low,
    /// Rarest-first walk over all levels
    Bulk,
}

/// Counters of picks that led to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PickStats {
    pub partial: u64,
    pub high: u64,
    pub mid: u64,
    pub low: u64,
    pub bulk: u64,
    /// Picks that only succeeded after allowing slow pieces
    pub slow_retries: u64,
    /// Locally held pieces discarded from a live window
    pub invalidated: u64,
}

impl PickStats {
    /// Counts a pick made at `stage`.
    pub fn record(&mut self, stage: PickStage) {
        match stage {
            PickStage::Partial => self.partial += 1,
            PickStage::High => self.high += 1,
            PickStage::Mid => self.mid += 1,
            PickStage::Low => self.low += 1,
            PickStage::Bulk => self.bulk += 1,
        }
    }

    /// Picks over all stages.
    pub fn total(&self) -> u64 {
        self.partial + self.high + self.mid + self.low + self.bulk
    }
}

/// Counters of the request monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorStats {
    /// Periodic scans performed
    pub checks: u64,
    /// Requests cancelled for missing their deadline
    pub cancelled: u64,
    /// Of those, requests cancelled because the peer sent nothing
    pub stalled: u64,
}

/// Counters of the buffer transporter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub pieces_pushed: u64,
    pub bytes_pushed: u64,
    pub pieces_dropped: u64,
    pub underruns: u64,
    pub pauses: u64,
    pub resumes: u64,
    /// Time spent paused waiting for data
    pub stall_time: Duration,
    /// Time from start to the first playable byte
    pub prebuffer_time: Option<Duration>,
}

impl TransportStats {
    /// Share of pieces dropped among those played or dropped.
    pub fn drop_ratio(&self) -> f64 {
        let total = self.pieces_pushed + self.pieces_dropped;
        if total == 0 {
            return 0.0;
        }
        self.pieces_dropped as f64 / total as f64
    }
}
