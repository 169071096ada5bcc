//! Wire-layer facade over one streaming download.
//!
//! [`StreamingSession`] binds the picker, the request monitor and the
//! buffer transporter of a single content object. Every method is meant to
//! run on the reactor thread; the only state shared with other threads is
//! the transporter's output queue.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{ConfigError, PickerConfig, StreamDescriptor};
use crate::live::{self, HookOutcome};
use crate::monitor::{CancelRequest, RequestMonitor, WireSink};
use crate::peer::{InterestChange, PeerCapabilities, PeerId};
use crate::picker::{PickOptions, PiecePicker};
use crate::piece::{Bitfield, ChunkRequest, PieceError, PieceIndex};
use crate::stats::{MonitorStats, PickStats, TransportStats};
use crate::transport::{
    BufferTransporter, PieceSource, PlaybackState, RefillOutcome, TransportError, VodEvent,
};
use crate::video::{BitrateSource, VideoStatus};

/// Point-in-time view of a session for status reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: PlaybackState,
    pub playback_pos: u32,
    pub piece_count: u32,
    pub pieces_held: u32,
    pub peers: usize,
    pub seeds: u32,
    pub outstanding_requests: usize,
    pub distributed_copies: f64,
    pub bitrate: f64,
    pub bitrate_source: BitrateSource,
    pub high_range_len: u32,
    pub queued_bytes: usize,
    pub picks: PickStats,
    pub monitor: MonitorStats,
    pub transport: TransportStats,
}

/// One streaming download driven by wire-layer events and periodic ticks.
#[derive(Debug)]
pub struct StreamingSession {
    picker: PiecePicker,
    monitor: RequestMonitor,
    transporter: BufferTransporter,
    contributors: HashMap<PieceIndex, BTreeSet<PeerId>>,
}

impl StreamingSession {
    /// Builds the components for `descriptor`.
    ///
    /// # Errors
    /// - `ConfigError::InvalidValue` - Options or descriptor are inconsistent
    pub fn new(
        descriptor: &StreamDescriptor,
        config: PickerConfig,
        source: Arc<dyn PieceSource>,
        events: mpsc::UnboundedSender<VodEvent>,
        now: Instant,
    ) -> Result<Self, ConfigError> {
        let video = VideoStatus::new(descriptor, &config)?;
        let picker = PiecePicker::new(descriptor.piece_count, config.clone())?;
        let monitor = RequestMonitor::new(&config);
        let transporter = BufferTransporter::new(video, config, source, events, now);
        debug!(
            pieces = descriptor.piece_count,
            mode = ?descriptor.mode,
            "Streaming session created"
        );
        Ok(Self {
            picker,
            monitor,
            transporter,
            contributors: HashMap::new(),
        })
    }

    pub fn picker(&self) -> &PiecePicker {
        &self.picker
    }

    pub fn monitor(&self) -> &RequestMonitor {
        &self.monitor
    }

    pub fn transporter(&self) -> &BufferTransporter {
        &self.transporter
    }

    pub fn video(&self) -> &VideoStatus {
        self.transporter.video()
    }

    // Wire events

    pub fn on_peer_connected(
        &mut self,
        peer: PeerId,
        capabilities: PeerCapabilities,
        now: Instant,
    ) -> bool {
        self.picker.add_peer(peer, capabilities, now)
    }

    /// # Errors
    /// - `PieceError` - Unknown peer or index out of range
    pub fn on_have(
        &mut self,
        peer: PeerId,
        piece: PieceIndex,
    ) -> Result<Vec<InterestChange>, PieceError> {
        self.picker.got_have(peer, piece)
    }

    /// # Errors
    /// - `PieceError` - Unknown peer or bitfield of the wrong length
    pub fn on_bitfield(
        &mut self,
        peer: PeerId,
        bitfield: &Bitfield,
    ) -> Result<Vec<InterestChange>, PieceError> {
        self.picker.got_bitfield(peer, bitfield)
    }

    /// # Errors
    /// - `PieceError::UnknownPeer` - Peer not registered
    pub fn on_seed(&mut self, peer: PeerId) -> Result<Vec<InterestChange>, PieceError> {
        self.picker.got_seed(peer)
    }

    /// # Errors
    /// - `PieceError::UnknownPeer` - Peer not registered
    pub fn on_choke(&mut self, peer: PeerId) -> Result<(), PieceError> {
        self.picker.set_choked(peer, true)
    }

    /// # Errors
    /// - `PieceError::UnknownPeer` - Peer not registered
    pub fn on_unchoke(&mut self, peer: PeerId) -> Result<(), PieceError> {
        self.picker.set_choked(peer, false)
    }

    /// A connection closed. Its requests leave the outstanding map unless
    /// another connection carries the same request.
    ///
    /// # Errors
    /// - `PieceError::UnknownPeer` - Peer not registered
    pub fn on_lost_peer(&mut self, peer: PeerId) -> Result<(), PieceError> {
        let record = self.picker.lost_peer(peer)?;
        for request in &record.active_requests {
            let duplicated = self
                .picker
                .peers()
                .iter()
                .any(|other| other.active_requests.contains(request));
            if !duplicated {
                self.monitor.request_done(request);
            }
        }
        for peers in self.contributors.values_mut() {
            peers.remove(&peer);
        }
        Ok(())
    }

    fn check_request(&self, request: &ChunkRequest) -> Result<(), PieceError> {
        self.picker.validate_piece(request.piece)?;
        let size = self.video().piece_size(request.piece);
        let end = u64::from(request.offset) + u64::from(request.length);
        if request.length == 0 || end > u64::from(size) {
            return Err(PieceError::ChunkOutOfBounds { request: *request });
        }
        Ok(())
    }

    /// The wire layer sent `request` to `peer`; its deadline clock starts.
    ///
    /// # Errors
    /// - `PieceError::UnknownPeer` - Peer not registered
    /// - `PieceError::ChunkOutOfBounds` - Request outside its piece
    pub fn on_request_committed(
        &mut self,
        peer: PeerId,
        request: ChunkRequest,
        now: Instant,
    ) -> Result<(), PieceError> {
        self.check_request(&request)?;
        let record = self
            .picker
            .peer_mut(peer)
            .ok_or(PieceError::UnknownPeer { peer })?;
        record.active_requests.insert(request);
        self.monitor.request_committed(request, now);
        Ok(())
    }

    /// A requested chunk arrived intact. The peer earns back one deadline
    /// miss and the piece becomes partial.
    ///
    /// Transfer rates are fed separately by [`Self::on_bytes_downloaded`].
    ///
    /// # Errors
    /// - `PieceError::UnknownPeer` - Peer not registered
    /// - `PieceError::ChunkOutOfBounds` - Chunk outside its piece
    pub fn on_chunk_received(
        &mut self,
        peer: PeerId,
        request: ChunkRequest,
    ) -> Result<(), PieceError> {
        self.check_request(&request)?;
        let record = self
            .picker
            .peer_mut(peer)
            .ok_or(PieceError::UnknownPeer { peer })?;
        record.bad_performance = record.bad_performance.saturating_sub(1);
        record.active_requests.remove(&request);

        self.contributors
            .entry(request.piece)
            .or_default()
            .insert(peer);
        self.picker.mark_started(request.piece)?;

        let duplicated = self
            .picker
            .peers()
            .iter()
            .any(|other| other.active_requests.contains(&request));
        if !duplicated {
            self.monitor.request_done(&request);
        }
        Ok(())
    }

    /// Raw byte progress on a connection.
    ///
    /// # Errors
    /// - `PieceError::UnknownPeer` - Peer not registered
    pub fn on_bytes_downloaded(
        &mut self,
        peer: PeerId,
        bytes: u64,
        now: Instant,
    ) -> Result<(), PieceError> {
        let record = self
            .picker
            .peer_mut(peer)
            .ok_or(PieceError::UnknownPeer { peer })?;
        record.rate.update(bytes, now);
        Ok(())
    }

    /// `piece` passed its hash check and is stored.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    pub fn on_piece_complete(
        &mut self,
        piece: PieceIndex,
        now: Instant,
    ) -> Result<Vec<InterestChange>, PieceError> {
        let changes = self.picker.complete(piece)?;
        self.monitor.purge_piece(piece);
        self.contributors.remove(&piece);
        self.transporter.on_piece_complete(piece, now);
        Ok(changes)
    }

    /// `piece` failed its hash check. Returns the peers that sent chunks of
    /// it so the embedding layer can decide whether to ban them.
    ///
    /// # Errors
    /// - `PieceError::OutOfRange` - Index past the piece count
    pub fn on_piece_failed_hash(&mut self, piece: PieceIndex) -> Result<Vec<PeerId>, PieceError> {
        self.picker.hash_failed(piece)?;
        self.monitor.purge_piece(piece);
        let contributors: Vec<PeerId> = self
            .contributors
            .remove(&piece)
            .map(|peers| peers.into_iter().collect())
            .unwrap_or_default();
        for &peer in &contributors {
            if let Some(record) = self.picker.peer_mut(peer) {
                record.hash_failures += 1;
            }
        }
        warn!(%piece, contributors = contributors.len(), "Piece failed hash check");
        Ok(contributors)
    }

    // Picking

    /// Next piece to request from `peer`.
    ///
    /// # Errors
    /// - `PieceError::UnknownPeer` - Peer not registered
    pub fn pick_next(
        &mut self,
        peer: PeerId,
        options: &PickOptions<'_>,
    ) -> Result<Option<PieceIndex>, PieceError> {
        self.picker.pick(peer, self.transporter.video(), options)
    }

    /// # Errors
    /// - `PieceError` - Index out of range or priority below `BLOCKED`
    pub fn set_priority(
        &mut self,
        piece: PieceIndex,
        priority: i32,
    ) -> Result<Vec<InterestChange>, PieceError> {
        self.picker.set_priority(piece, priority)
    }

    // Periodic tasks

    /// Cancels requests that will miss their deadline.
    pub fn check_deadlines(&mut self, wire: &mut dyn WireSink, now: Instant) -> Vec<CancelRequest> {
        let transporter = &self.transporter;
        let piece_due = |piece: PieceIndex| transporter.piece_due(piece, now);
        self.monitor.check(
            self.picker.peers_mut(),
            transporter.video(),
            &piece_due,
            wire,
            now,
        )
    }

    /// Ends prebuffering when possible, then tops up the output queue.
    ///
    /// # Errors
    /// - `PieceError` - Live window bookkeeping rejected a piece
    pub fn refill(&mut self, now: Instant) -> Result<RefillOutcome, PieceError> {
        self.transporter.check_prebuffer(&self.picker, now);
        let outcome = self.transporter.refill(&mut self.picker, now)?;
        for piece in outcome.dropped.iter().chain(&outcome.invalidated) {
            self.monitor.purge_piece(*piece);
            self.contributors.remove(piece);
        }
        Ok(outcome)
    }

    pub fn tick_second(&mut self, now: Instant) {
        self.transporter.tick_second(now);
    }

    /// Tries to join a live stream.
    ///
    /// # Errors
    /// - `PieceError` - Window bookkeeping rejected a piece
    pub fn live_hook(&mut self) -> Result<HookOutcome, PieceError> {
        let outcome = live::try_hook_in(&mut self.picker, &mut self.transporter)?;
        if let HookOutcome::HookedIn { invalidated, .. } = &outcome {
            for piece in invalidated {
                self.monitor.purge_piece(*piece);
            }
        }
        Ok(outcome)
    }

    pub fn autoresume(&mut self, now: Instant) -> bool {
        self.transporter.autoresume(&self.picker, now)
    }

    // Playback control

    /// # Errors
    /// - `TransportError` - Already playing or position past the file
    pub fn start_playback(&mut self, byte_pos: u64, now: Instant) -> Result<(), TransportError> {
        self.transporter.start(byte_pos, now)
    }

    pub fn stop_playback(&mut self) {
        self.transporter.stop();
    }

    /// # Errors
    /// - `TransportError::InvalidState` - Not playing
    pub fn pause(&mut self, now: Instant) -> Result<(), TransportError> {
        self.transporter.pause(false, now)
    }

    /// # Errors
    /// - `TransportError::InvalidState` - Not paused
    pub fn resume(&mut self, now: Instant) -> Result<(), TransportError> {
        self.transporter.resume(now)
    }

    /// Bitrate reported by a media analyser.
    pub fn set_bitrate(&mut self, bytes_per_second: f64) {
        self.transporter
            .set_bitrate(bytes_per_second, BitrateSource::Analyser);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let video = self.video();
        let index = self.picker.index();
        SessionSnapshot {
            state: self.transporter.state(),
            playback_pos: video.playback_pos(),
            piece_count: self.picker.piece_count(),
            pieces_held: index.numgot(),
            peers: self.picker.peers().len(),
            seeds: index.seeds(),
            outstanding_requests: self.monitor.outstanding_len(),
            distributed_copies: index.distributed_copies(),
            bitrate: video.bitrate(),
            bitrate_source: video.bitrate_source(),
            high_range_len: video.high_range().len(),
            queued_bytes: self.transporter.queue().byte_len(),
            picks: self.picker.stats().clone(),
            monitor: self.monitor.stats().clone(),
            transport: self.transporter.stats().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::peer::Interest;

    const PIECE: u32 = 16_384;

    #[derive(Default)]
    struct Store(Mutex<HashMap<PieceIndex, Bytes>>);

    impl PieceSource for Store {
        fn piece_data(&self, piece: PieceIndex) -> Option<Bytes> {
            self.0.lock().get(&piece).cloned()
        }
    }

    fn session(pieces: u32) -> (StreamingSession, Arc<Store>, mpsc::UnboundedReceiver<VodEvent>, Instant) {
        let now = Instant::now();
        let store = Arc::new(Store::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let descriptor = StreamDescriptor::vod(PIECE, pieces).with_bitrate(65_536);
        let session =
            StreamingSession::new(&descriptor, PickerConfig::for_testing(), store.clone(), tx, now)
                .unwrap();
        (session, store, rx, now)
    }

    #[test]
    fn test_invalid_descriptor_is_refused() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = StreamingSession::new(
            &StreamDescriptor::vod(0, 10),
            PickerConfig::default(),
            Arc::new(Store::default()),
            tx,
            Instant::now(),
        );
        assert!(matches!(result, Err(ConfigError::InvalidValue { field: "piece_length", .. })));
    }

    #[test]
    fn test_have_reports_interest() {
        let (mut session, _store, _rx, now) = session(10);
        let peer = PeerId(1);
        assert!(session.on_peer_connected(peer, PeerCapabilities::default(), now));
        let changes = session.on_have(peer, PieceIndex(3)).unwrap();
        assert_eq!(
            changes,
            vec![InterestChange {
                peer,
                interest: Interest::Interested
            }]
        );
        let changes = session.on_piece_complete(PieceIndex(3), now).unwrap();
        assert_eq!(changes[0].interest, Interest::NotInterested);
    }

    #[test]
    fn test_request_lifecycle() {
        let (mut session, _store, _rx, now) = session(10);
        let peer = PeerId(1);
        session.on_peer_connected(peer, PeerCapabilities::default(), now);
        session.on_have(peer, PieceIndex(2)).unwrap();

        let bad = ChunkRequest::new(PieceIndex(2), PIECE - 10, 100);
        assert!(matches!(
            session.on_request_committed(peer, bad, now),
            Err(PieceError::ChunkOutOfBounds { .. })
        ));

        let request = ChunkRequest::new(PieceIndex(2), 0, 8192);
        session.on_request_committed(peer, request, now).unwrap();
        assert!(session.monitor().is_outstanding(&request));
        session.picker.peer_mut(peer).unwrap().bad_performance = 2;

        session.on_chunk_received(peer, request).unwrap();
        assert!(!session.monitor().is_outstanding(&request));
        let record = session.picker().peer(peer).unwrap();
        assert_eq!(record.bad_performance, 1);
        assert!(record.active_requests.is_empty());
        assert_eq!(session.picker().index().started(), &[2]);
    }

    #[test]
    fn test_lost_peer_keeps_requests_another_peer_carries() {
        let (mut session, _store, _rx, now) = session(10);
        let request = ChunkRequest::new(PieceIndex(4), 0, 8192);
        for id in [1, 2] {
            session.on_peer_connected(PeerId(id), PeerCapabilities::default(), now);
            session.on_have(PeerId(id), PieceIndex(4)).unwrap();
            session.on_request_committed(PeerId(id), request, now).unwrap();
        }
        session.on_lost_peer(PeerId(1)).unwrap();
        assert!(session.monitor().is_outstanding(&request));
        session.on_lost_peer(PeerId(2)).unwrap();
        assert!(!session.monitor().is_outstanding(&request));
        assert!(matches!(
            session.on_lost_peer(PeerId(2)),
            Err(PieceError::UnknownPeer { .. })
        ));
    }

    #[test]
    fn test_hash_failure_blames_contributors() {
        let (mut session, _store, _rx, now) = session(10);
        for id in [1, 2, 3] {
            session.on_peer_connected(PeerId(id), PeerCapabilities::default(), now);
            session.on_have(PeerId(id), PieceIndex(5)).unwrap();
        }
        session
            .on_chunk_received(PeerId(3), ChunkRequest::new(PieceIndex(5), 0, 8192))
            .unwrap();
        session
            .on_chunk_received(PeerId(1), ChunkRequest::new(PieceIndex(5), 8192, 8192))
            .unwrap();

        let blamed = session.on_piece_failed_hash(PieceIndex(5)).unwrap();
        assert_eq!(blamed, vec![PeerId(1), PeerId(3)]);
        assert_eq!(session.picker().peer(PeerId(1)).unwrap().hash_failures, 1);
        assert_eq!(session.picker().peer(PeerId(2)).unwrap().hash_failures, 0);
        assert!(session.picker().index().started().is_empty());
    }

    #[test]
    fn test_playback_through_session() {
        let (mut session, store, mut rx, now) = session(8);
        for piece in 0..8 {
            store
                .0
                .lock()
                .insert(PieceIndex(piece), Bytes::from(vec![piece as u8; PIECE as usize]));
            session.on_piece_complete(PieceIndex(piece), now).unwrap();
        }
        session.start_playback(0, now).unwrap();
        let outcome = session.refill(now + Duration::from_millis(100)).unwrap();
        assert_eq!(outcome.pushed.len(), 8);
        assert!(outcome.finished);
        assert!(matches!(rx.try_recv().unwrap(), VodEvent::Start { complete: true, .. }));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.state, PlaybackState::Playing);
        assert_eq!(snapshot.pieces_held, 8);
        assert_eq!(snapshot.transport.pieces_pushed, 8);
        assert!(snapshot.transport.prebuffer_time.is_some());
    }
}
