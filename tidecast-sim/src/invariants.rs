//! Properties checked against the session while a simulation runs.

use std::fmt;
use std::time::Duration;

use tidecast_core::{PeerId, PieceIndex, PlaybackState, StreamingSession};

/// Violation of a simulation invariant.
#[derive(Debug, Clone, PartialEq)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: String,
    /// Detailed description of the violation
    pub description: String,
    /// Simulated time of the violation
    pub at: Duration,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invariant '{}' violated at {:?}: {}",
            self.invariant, self.at, self.description
        )
    }
}

/// Point in a step at which invariants run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPhase {
    /// Right after the once-a-second housekeeping
    Housekeeping,
    /// After picking, at the end of the step
    EndOfStep,
}

/// A piece handed to a peer during the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PickRecord {
    pub peer: PeerId,
    pub piece: PieceIndex,
}

/// What an invariant gets to look at.
pub struct SimulationView<'a> {
    pub session: &'a StreamingSession,
    pub phase: CheckPhase,
    pub elapsed: Duration,
    /// Playback state when the phase began
    pub previous_state: PlaybackState,
    pub picks: &'a [PickRecord],
    /// Pieces pushed to the player this step, in order
    pub pushed: &'a [PieceIndex],
    /// Last piece pushed in an earlier step
    pub last_pushed: Option<PieceIndex>,
}

impl SimulationView<'_> {
    fn violation(&self, invariant: &dyn Invariant, description: String) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.name().to_string(),
            description,
            at: self.elapsed,
        }
    }
}

/// Trait for checking simulation invariants.
pub trait Invariant: Send + Sync {
    /// Checks if invariant holds for current state.
    ///
    /// # Errors
    /// Returns `InvariantViolation` if the invariant condition is not met.
    fn check(&self, view: &SimulationView<'_>) -> Result<(), InvariantViolation>;

    /// Returns name of this invariant.
    fn name(&self) -> &str;
}

/// Levels and holder counts agree with the peer records.
pub struct IndexConsistencyInvariant;

impl Invariant for IndexConsistencyInvariant {
    fn check(&self, view: &SimulationView<'_>) -> Result<(), InvariantViolation> {
        let picker = view.session.picker();
        let index = picker.index();
        if let Err(e) = index.check_consistency() {
            return Err(view.violation(self, e.to_string()));
        }
        for piece in (0..picker.piece_count()).map(PieceIndex) {
            let counted = picker
                .peers()
                .iter()
                .filter(|peer| !peer.is_seed && peer.has(piece))
                .count() as u32;
            if counted != index.holders(piece) {
                return Err(view.violation(
                    self,
                    format!(
                        "piece {piece} held by {counted} peers but indexed with {}",
                        index.holders(piece)
                    ),
                ));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "IndexConsistency"
    }
}

/// A peer with deadline misses never takes a high-range piece that a
/// well-behaved peer also has.
pub struct BarredPeerInvariant;

impl Invariant for BarredPeerInvariant {
    fn check(&self, view: &SimulationView<'_>) -> Result<(), InvariantViolation> {
        if view.phase != CheckPhase::EndOfStep {
            return Ok(());
        }
        let picker = view.session.picker();
        let video = view.session.video();
        for pick in view.picks {
            let Some(record) = picker.peer(pick.peer) else {
                continue;
            };
            if !record.is_barred() || !video.in_high_range(pick.piece) {
                continue;
            }
            let better = picker
                .peers()
                .iter()
                .find(|other| other.id != pick.peer && !other.is_barred() && other.has(pick.piece));
            if let Some(better) = better {
                return Err(view.violation(
                    self,
                    format!(
                        "barred peer {} picked high-range piece {} that {} holds",
                        pick.peer, pick.piece, better.id
                    ),
                ));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "BarredPeer"
    }
}

/// The player receives pieces in playback order.
pub struct OutputOrderInvariant;

impl Invariant for OutputOrderInvariant {
    fn check(&self, view: &SimulationView<'_>) -> Result<(), InvariantViolation> {
        let video = view.session.video();
        let span = i64::from(video.movie_numpieces());
        let mut previous = view.last_pushed;
        for &piece in view.pushed {
            if let Some(prev) = previous {
                let step = i64::from(piece.as_u32()) - i64::from(prev.as_u32());
                let in_order = if video.wraparound() {
                    let forward = step.rem_euclid(span);
                    forward > 0 && forward < span / 2
                } else {
                    step > 0
                };
                if !in_order {
                    return Err(view.violation(
                        self,
                        format!("piece {piece} delivered after {prev}"),
                    ));
                }
            }
            previous = Some(piece);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "OutputOrder"
    }
}

/// Housekeeping resumes an auto-resumable pause exactly when the high
/// range is held again.
pub struct AutoresumeInvariant;

impl Invariant for AutoresumeInvariant {
    fn check(&self, view: &SimulationView<'_>) -> Result<(), InvariantViolation> {
        if view.phase != CheckPhase::Housekeeping {
            return Ok(());
        }
        let picker = view.session.picker();
        let video = view.session.video();
        let sustainable = video.high_range().iter().all(|p| picker.has(p));
        let state = view.session.snapshot().state;

        if state == PlaybackState::Paused && video.autoresume() && sustainable {
            return Err(view.violation(
                self,
                format!(
                    "still paused at piece {} with the high range held",
                    video.playback_pos()
                ),
            ));
        }
        if view.previous_state == PlaybackState::Paused
            && state == PlaybackState::Playing
            && !sustainable
        {
            return Err(view.violation(
                self,
                format!(
                    "resumed at piece {} with high-range pieces missing",
                    video.playback_pos()
                ),
            ));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "Autoresume"
    }
}

/// A wrapping live window always spans `2 * delta + 1` pieces centred on
/// the playback position.
pub struct LiveWindowInvariant;

impl Invariant for LiveWindowInvariant {
    fn check(&self, view: &SimulationView<'_>) -> Result<(), InvariantViolation> {
        let video = view.session.video();
        if !video.is_live() || !video.wraparound() {
            return Ok(());
        }
        let delta = video.wraparound_delta();
        let expected_start =
            video.normalize(i64::from(video.playback_pos()) - i64::from(delta));
        let valid = video.valid_range();
        if valid.start() != expected_start || valid.len() != 2 * delta + 1 {
            return Err(view.violation(
                self,
                format!(
                    "window starts at {} with {} pieces, expected {expected_start} with {}",
                    valid.start(),
                    valid.len(),
                    2 * delta + 1
                ),
            ));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "LiveWindow"
    }
}

/// Every invariant the simulation knows about.
pub fn default_invariants() -> Vec<Box<dyn Invariant>> {
    vec![
        Box::new(IndexConsistencyInvariant),
        Box::new(BarredPeerInvariant),
        Box::new(OutputOrderInvariant),
        Box::new(AutoresumeInvariant),
        Box::new(LiveWindowInvariant),
    ]
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use tidecast_core::{
        Bitfield, ChunkRequest, PeerCapabilities, PickerConfig, StreamDescriptor, VodEvent,
    };
    use tokio::sync::mpsc;

    use super::*;
    use crate::swarm::SimStore;

    fn session(descriptor: &StreamDescriptor) -> (StreamingSession, mpsc::UnboundedReceiver<VodEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = StreamingSession::new(
            descriptor,
            PickerConfig::for_testing(),
            Arc::new(SimStore::default()),
            tx,
            Instant::now(),
        )
        .unwrap();
        (session, rx)
    }

    fn view<'a>(
        session: &'a StreamingSession,
        picks: &'a [PickRecord],
        pushed: &'a [PieceIndex],
        last_pushed: Option<PieceIndex>,
    ) -> SimulationView<'a> {
        SimulationView {
            session,
            phase: CheckPhase::EndOfStep,
            elapsed: Duration::from_secs(3),
            previous_state: PlaybackState::Idle,
            picks,
            pushed,
            last_pushed,
        }
    }

    #[test]
    fn test_out_of_order_delivery_is_reported() {
        let (session, _rx) = session(&StreamDescriptor::vod(16_384, 20).with_bitrate(65_536));
        let pushed = [PieceIndex(4), PieceIndex(5), PieceIndex(5)];
        let violation = OutputOrderInvariant
            .check(&view(&session, &[], &pushed, Some(PieceIndex(3))))
            .unwrap_err();
        assert_eq!(violation.invariant, "OutputOrder");
        assert_eq!(violation.at, Duration::from_secs(3));
        assert!(violation.to_string().contains("piece 5 delivered after 5"));

        let ordered = [PieceIndex(4), PieceIndex(6)];
        assert!(
            OutputOrderInvariant
                .check(&view(&session, &[], &ordered, Some(PieceIndex(3))))
                .is_ok()
        );
    }

    #[test]
    fn test_wrapping_delivery_crosses_index_boundary() {
        let descriptor = StreamDescriptor::live(16_384, 100)
            .with_bitrate(65_536)
            .with_live_delta(10);
        let (session, _rx) = session(&descriptor);
        let pushed = [PieceIndex(99), PieceIndex(0), PieceIndex(1)];
        assert!(
            OutputOrderInvariant
                .check(&view(&session, &[], &pushed, Some(PieceIndex(98))))
                .is_ok()
        );
        let backwards = [PieceIndex(97)];
        assert!(
            OutputOrderInvariant
                .check(&view(&session, &[], &backwards, Some(PieceIndex(98))))
                .is_err()
        );
        assert!(LiveWindowInvariant.check(&view(&session, &[], &[], None)).is_ok());
    }

    #[test]
    fn test_barred_pick_with_better_holder_is_reported() {
        let (mut session, _rx) = session(&StreamDescriptor::vod(16_384, 20).with_bitrate(65_536));
        let now = Instant::now();
        let mut bits = Bitfield::new(20);
        bits.set_piece(PieceIndex(0));
        for id in [1, 2] {
            session.on_peer_connected(PeerId(id), PeerCapabilities::default(), now);
            session.on_bitfield(PeerId(id), &bits).unwrap();
        }
        session.start_playback(0, now).unwrap();
        let picks = [PickRecord {
            peer: PeerId(2),
            piece: PieceIndex(0),
        }];
        assert!(BarredPeerInvariant.check(&view(&session, &picks, &[], None)).is_ok());

        // the request never moves a byte and is cancelled as stalled
        let request = ChunkRequest::new(PieceIndex(0), 0, 16_384);
        session.on_request_committed(PeerId(2), request, now).unwrap();
        let mut sink = Vec::new();
        let cancelled = session.check_deadlines(&mut sink, now + Duration::from_secs(10));
        assert_eq!(cancelled.len(), 1);
        assert!(session.picker().peer(PeerId(2)).unwrap().is_barred());

        let violation = BarredPeerInvariant
            .check(&view(&session, &picks, &[], None))
            .unwrap_err();
        assert_eq!(violation.invariant, "BarredPeer");
        assert!(
            IndexConsistencyInvariant
                .check(&view(&session, &picks, &[], None))
                .is_ok()
        );
    }
}
