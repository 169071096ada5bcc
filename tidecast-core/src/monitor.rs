//! Deadline monitor for in-flight chunk requests.
//!
//! Every tick the monitor looks at each connection's outstanding requests
//! for high-range pieces and cancels those that cannot arrive in time at the
//! peer's current rate. Each cancellation counts as a deadline miss against
//! the peer, which keeps it off urgent pieces until it delivers again.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{DelayThresholds, PickerConfig};
use crate::peer::{InterestChange, PeerId, PeerTable};
use crate::piece::{ChunkRequest, PieceIndex};
use crate::stats::MonitorStats;
use crate::video::VideoStatus;

/// A request the wire layer must cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelRequest {
    pub peer: PeerId,
    pub request: ChunkRequest,
}

/// Outbound side of the wire layer.
pub trait WireSink: Send {
    /// Sends `Cancel` for every request of the batch and frees the
    /// connection's pending-request entries.
    fn cancel_requests(&mut self, batch: &[CancelRequest]);

    /// Our interest in some peers changed.
    fn interest_changed(&mut self, _changes: &[InterestChange]) {}
}

impl WireSink for Vec<CancelRequest> {
    fn cancel_requests(&mut self, batch: &[CancelRequest]) {
        self.extend_from_slice(batch);
    }
}

impl WireSink for mpsc::UnboundedSender<Vec<CancelRequest>> {
    fn cancel_requests(&mut self, batch: &[CancelRequest]) {
        if self.send(batch.to_vec()).is_err() {
            debug!(count = batch.len(), "Cancel receiver dropped");
        }
    }
}

/// Tracks issue times of outstanding requests and cancels doomed ones.
#[derive(Debug)]
pub struct RequestMonitor {
    playing: DelayThresholds,
    buffering: DelayThresholds,
    outstanding: HashMap<ChunkRequest, Instant>,
    stats: MonitorStats,
}

impl RequestMonitor {
    pub fn new(config: &PickerConfig) -> Self {
        Self {
            playing: config.playing_delays,
            buffering: config.buffering_delays,
            outstanding: HashMap::new(),
            stats: MonitorStats::default(),
        }
    }

    /// The wire layer committed `request`; the first issue time is kept.
    pub fn request_committed(&mut self, request: ChunkRequest, now: Instant) {
        self.outstanding.entry(request).or_insert(now);
    }

    /// `request` was answered or abandoned.
    pub fn request_done(&mut self, request: &ChunkRequest) -> bool {
        self.outstanding.remove(request).is_some()
    }

    /// Drops every request for `piece`.
    pub fn purge_piece(&mut self, piece: PieceIndex) {
        self.outstanding.retain(|request, _| request.piece != piece);
    }

    pub fn issue_time(&self, request: &ChunkRequest) -> Option<Instant> {
        self.outstanding.get(request).copied()
    }

    pub fn is_outstanding(&self, request: &ChunkRequest) -> bool {
        self.outstanding.contains_key(request)
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// Issue times of all outstanding requests.
    pub fn outstanding(&self) -> impl Iterator<Item = (&ChunkRequest, &Instant)> {
        self.outstanding.iter()
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    /// Thresholds for the current playback mode.
    pub fn thresholds(&self, video: &VideoStatus) -> DelayThresholds {
        if Self::is_playing(video) {
            self.playing
        } else {
            self.buffering
        }
    }

    fn is_playing(video: &VideoStatus) -> bool {
        video.playing() && !video.prebuffering() && !video.paused()
    }

    /// Scans every connection and cancels requests that will miss their
    /// deadline. `piece_due` gives seconds until a piece is needed.
    ///
    /// The batch goes to `wire` in one call; its keys are freed right after.
    pub fn check(
        &mut self,
        peers: &mut PeerTable,
        video: &VideoStatus,
        piece_due: &dyn Fn(PieceIndex) -> f64,
        wire: &mut dyn WireSink,
        now: Instant,
    ) -> Vec<CancelRequest> {
        self.stats.checks += 1;
        let playing = Self::is_playing(video);
        let thresholds = self.thresholds(video);
        let mut batch = Vec::new();

        for id in peers.ids() {
            let Some(peer) = peers.get_mut(id) else {
                continue;
            };
            if peer.active_requests.is_empty() {
                continue;
            }

            let rate = peer.rate.rate(now);
            let download_time = peer.in_flight_bytes() as f64 / rate;
            let mut requests: Vec<ChunkRequest> = peer.active_requests.iter().copied().collect();
            requests.sort_unstable_by_key(|request| (request.piece, request.offset));

            for request in requests {
                let Some(&issued) = self.outstanding.get(&request) else {
                    continue;
                };
                let age = now.saturating_duration_since(issued).as_secs_f64();
                if age < thresholds.min_delay || !video.in_high_range(request.piece) {
                    continue;
                }

                let stalled = peer.rate.is_idle(now);
                let doomed = stalled || {
                    let max_left = thresholds.max_delay - age;
                    let deadline = if playing {
                        piece_due(request.piece).min(max_left)
                    } else {
                        max_left
                    };
                    deadline < download_time - thresholds.offset
                };
                if !doomed {
                    continue;
                }

                peer.active_requests.remove(&request);
                peer.bad_performance += 1;
                self.stats.cancelled += 1;
                if stalled {
                    self.stats.stalled += 1;
                }
                debug!(
                    peer = %id,
                    %request,
                    age,
                    rate,
                    stalled,
                    bad_performance = peer.bad_performance,
                    "Cancelling request that will miss its deadline"
                );
                batch.push(CancelRequest { peer: id, request });
            }
        }

        if !batch.is_empty() {
            wire.cancel_requests(&batch);
            for cancel in &batch {
                let still_active = peers
                    .iter()
                    .any(|peer| peer.active_requests.contains(&cancel.request));
                if !still_active {
                    self.outstanding.remove(&cancel.request);
                }
            }
        }
        batch
    }
}
