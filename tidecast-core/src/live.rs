//! Choosing where to join a live stream.
//!
//! Until playback has a position, the session asks once a second where the
//! swarm currently is: the newest piece that at least half of the non-empty
//! neighbours hold, backed off by the prebuffer size so there is data to
//! gather before the player starts.

use tracing::{debug, info};

use crate::peer::InterestChange;
use crate::picker::PiecePicker;
use crate::piece::{PieceError, PieceIndex};
use crate::transport::BufferTransporter;
use crate::video::VideoStatus;

/// Result of one hook-in attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    /// Not a live stream, or the position is already fixed
    Inactive,
    /// Not enough neighbours agree yet
    Waiting,
    /// Playback position fixed at `startpos`
    HookedIn {
        startpos: PieceIndex,
        invalidated: Vec<PieceIndex>,
        interest_changes: Vec<InterestChange>,
    },
    /// The stream is complete; it is played as a finite file
    SwitchedToVod,
}

/// Newest base-layer piece held by at least `max(1, nonempty / 2)`
/// non-empty neighbours, adjusted for wrap-around.
pub fn frontier(picker: &PiecePicker, video: &VideoStatus) -> Option<u32> {
    let peers: Vec<_> = picker.peers().iter().filter(|p| !p.is_empty()).collect();
    if peers.is_empty() {
        return None;
    }
    let threshold = (peers.len() / 2).max(1);
    let qualifies = |piece: u32| {
        peers
            .iter()
            .filter(|peer| peer.has(PieceIndex(piece)))
            .count()
            >= threshold
    };

    let first = video.first_piece();
    let last = video.last_piece();
    let newest = (first..=last).rev().find(|&p| qualifies(p))?;

    // Both ends present: the stream wrapped, and the high pieces are the old ones.
    if video.wraparound() && newest == last && qualifies(first) {
        let half = first + video.movie_numpieces() / 2;
        if let Some(wrapped) = (first..half).rev().find(|&p| qualifies(p)) {
            return Some(wrapped);
        }
    }
    Some(newest)
}

/// Whether the stream turned out to be complete and should play as VOD.
///
/// Never true for a wrapping stream: its piece space is reused, so a seed or
/// the last index says nothing about the stream having ended.
fn complete_stream(picker: &PiecePicker, video: &VideoStatus) -> bool {
    if video.wraparound() {
        return false;
    }
    picker.index().seeds() > 0 || picker.has(PieceIndex(video.last_piece()))
}

/// Tries to fix the live playback position.
///
/// Pieces that leave the valid window when playback jumps to the hook-in
/// point are invalidated in the picker. A non-wrapping stream with a seed or
/// its last piece present switches to VOD instead; wrapping streams never do.
///
/// # Errors
/// - `PieceError::OutOfRange` - Window bookkeeping produced a bad index
pub fn try_hook_in(
    picker: &mut PiecePicker,
    transporter: &mut BufferTransporter,
) -> Result<HookOutcome, PieceError> {
    let video = transporter.video();
    if !video.is_live() || video.live_startpos().is_some() {
        return Ok(HookOutcome::Inactive);
    }

    if complete_stream(picker, video) {
        info!("Live stream is complete, playing as VOD");
        transporter.switch_to_vod();
        return Ok(HookOutcome::SwitchedToVod);
    }

    let Some(newest) = frontier(picker, video) else {
        debug!(
            neighbours = picker.peers().nonempty_count(),
            "No live hook-in point yet"
        );
        return Ok(HookOutcome::Waiting);
    };
    let fudge = i64::from(video.prebuffer_pieces());
    let startpos = if video.wraparound() {
        video.normalize(i64::from(newest) - fudge)
    } else {
        newest.saturating_sub(fudge as u32).max(video.first_piece())
    };

    let invalidated = transporter.set_live_startpos(startpos);
    let mut interest_changes = Vec::new();
    for &piece in &invalidated {
        interest_changes.extend(picker.invalidate(piece)?);
    }
    info!(
        newest,
        startpos,
        invalidated = invalidated.len(),
        "Hooked into live stream"
    );
    Ok(HookOutcome::HookedIn {
        startpos: PieceIndex(startpos),
        invalidated,
        interest_changes,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::{PickerConfig, StreamDescriptor};
    use crate::peer::{PeerCapabilities, PeerId};
    use crate::piece::Bitfield;
    use crate::transport::PieceSource;

    struct NoData;

    impl PieceSource for NoData {
        fn piece_data(&self, _piece: PieceIndex) -> Option<Bytes> {
            None
        }
    }

    fn setup(descriptor: StreamDescriptor) -> (PiecePicker, BufferTransporter) {
        let config = PickerConfig::for_testing();
        let now = Instant::now();
        let video = VideoStatus::new(&descriptor, &config).unwrap();
        let picker = PiecePicker::new(descriptor.piece_count, config.clone()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transporter = BufferTransporter::new(video, config, Arc::new(NoData), tx, now);
        (picker, transporter)
    }

    fn add_peer_with(picker: &mut PiecePicker, id: u64, pieces: impl IntoIterator<Item = u32>) {
        let n = picker.piece_count();
        let mut bitfield = Bitfield::new(n);
        for piece in pieces {
            bitfield.set_piece(PieceIndex(piece));
        }
        picker.add_peer(PeerId(id), PeerCapabilities::default(), Instant::now());
        picker.got_bitfield(PeerId(id), &bitfield).unwrap();
    }

    fn live_descriptor() -> StreamDescriptor {
        // 4 pieces per second, prebuffer of 40 pieces
        StreamDescriptor::live(16_384, 1000)
            .with_bitrate(65_536)
            .with_live_delta(125)
    }

    #[test]
    fn test_waits_without_neighbours() {
        let (mut picker, mut transporter) = setup(live_descriptor());
        assert_eq!(
            try_hook_in(&mut picker, &mut transporter).unwrap(),
            HookOutcome::Waiting
        );
    }

    #[test]
    fn test_frontier_needs_half_of_neighbours() {
        let (mut picker, transporter) = setup(live_descriptor());
        add_peer_with(&mut picker, 1, 400..560);
        add_peer_with(&mut picker, 2, 400..540);
        add_peer_with(&mut picker, 3, 400..530);
        add_peer_with(&mut picker, 4, 400..520);
        // threshold 2: 539 is held by peers 1 and 2
        assert_eq!(frontier(&picker, transporter.video()), Some(539));
    }

    #[test]
    fn test_frontier_unwraps_across_index_boundary() {
        let (mut picker, transporter) = setup(live_descriptor());
        add_peer_with(&mut picker, 1, (900..1000).chain(0..30));
        assert_eq!(frontier(&picker, transporter.video()), Some(29));
    }

    #[test]
    fn test_hook_in_backs_off_and_invalidates_old_window() {
        let (mut picker, mut transporter) = setup(live_descriptor());
        add_peer_with(&mut picker, 1, 400..541);

        let outcome = try_hook_in(&mut picker, &mut transporter).unwrap();
        let HookOutcome::HookedIn {
            startpos,
            invalidated,
            ..
        } = outcome
        else {
            panic!("expected hook-in, got {outcome:?}");
        };
        assert_eq!(startpos, PieceIndex(500));
        assert_eq!(transporter.video().playback_pos(), 500);
        // the initial window around piece 0 is gone entirely
        assert_eq!(invalidated.len(), 251);
        assert!(invalidated.contains(&PieceIndex(875)));
        assert!(invalidated.contains(&PieceIndex(125)));
        assert!(picker.peer(PeerId(1)).unwrap().has(PieceIndex(500)));

        assert_eq!(
            try_hook_in(&mut picker, &mut transporter).unwrap(),
            HookOutcome::Inactive
        );
    }

    #[test]
    fn test_finite_live_with_seed_switches_to_vod() {
        let (mut picker, mut transporter) = setup(live_descriptor().without_wraparound());
        picker.add_peer(PeerId(9), PeerCapabilities::default(), Instant::now());
        picker.got_seed(PeerId(9)).unwrap();
        assert_eq!(
            try_hook_in(&mut picker, &mut transporter).unwrap(),
            HookOutcome::SwitchedToVod
        );
        assert!(transporter.video().is_vod());
        assert_eq!(transporter.video().playback_pos(), 0);
    }

    #[test]
    fn test_wrapping_live_ignores_seeds() {
        let (mut picker, mut transporter) = setup(live_descriptor());
        picker.add_peer(PeerId(9), PeerCapabilities::default(), Instant::now());
        picker.got_seed(PeerId(9)).unwrap();
        let outcome = try_hook_in(&mut picker, &mut transporter).unwrap();
        assert!(matches!(outcome, HookOutcome::HookedIn { .. }));
    }
}
