//! Delivery of verified pieces to the video player.
//!
//! [`BufferTransporter`] owns the [`VideoStatus`] of the stream and is the
//! only component that moves the playback position. It waits for enough
//! data before playback starts, keeps the [`OutputQueue`] topped up on a
//! periodic refill, pauses on underrun when the download cannot keep up and
//! drops late pieces of live streams instead of stalling.

pub mod bitrate;
pub mod events;
pub mod queue;
pub mod stream;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

pub use bitrate::BitratePredictor;
pub use events::VodEvent;
pub use queue::OutputQueue;
pub use stream::{PlayerStream, StreamCommand};

use crate::config::PickerConfig;
use crate::peer::{InterestChange, RateEstimator};
use crate::picker::PiecePicker;
use crate::piece::{PieceError, PieceIndex};
use crate::stats::TransportStats;
use crate::video::{BitrateSource, VideoStatus};

/// Smallest output buffer regardless of bitrate.
const MIN_BUFFER_BYTES: usize = 256 * 1024;

/// Playback time before an empty queue counts as an underrun.
const UNDERRUN_GRACE: Duration = Duration::from_secs(1);

/// Errors from transporter operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: PlaybackState,
    },

    #[error("Seek to byte {position} past end of file ({length} bytes)")]
    SeekPastEnd { position: u64, length: u64 },
}

/// Where the transporter is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Prebuffering,
    Playing,
    Paused,
    Stopped,
}

/// Access to verified piece data held by the storage layer.
pub trait PieceSource: Send + Sync {
    /// Bytes of a locally held piece.
    fn piece_data(&self, piece: PieceIndex) -> Option<Bytes>;

    /// Whether the data may be played. Live sources check signatures here.
    fn validates(&self, _piece: PieceIndex, _data: &Bytes) -> bool {
        true
    }

    /// Source timestamp of the piece in seconds, when the stream carries one.
    fn source_timestamp(&self, _piece: PieceIndex) -> Option<f64> {
        None
    }
}

/// What one refill pass did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RefillOutcome {
    pub pushed: Vec<PieceIndex>,
    pub dropped: Vec<PieceIndex>,
    /// Pieces that left the live window and were discarded
    pub invalidated: Vec<PieceIndex>,
    pub interest_changes: Vec<InterestChange>,
    pub underrun: bool,
    pub paused: bool,
    pub finished: bool,
}

/// Feeds the player from local storage in playback order.
pub struct BufferTransporter {
    config: PickerConfig,
    video: VideoStatus,
    source: Arc<dyn PieceSource>,
    queue: Arc<OutputQueue>,
    events: mpsc::UnboundedSender<VodEvent>,
    commands_tx: mpsc::UnboundedSender<StreamCommand>,
    commands_rx: mpsc::UnboundedReceiver<StreamCommand>,
    predictor: BitratePredictor,
    download_rate: RateEstimator,
    playback_rate: RateEstimator,
    stopped: bool,
    start_fired: bool,
    start_byte: u64,
    skip_bytes: u32,
    played: u64,
    started_at: Option<Instant>,
    playback_started: Option<Instant>,
    paused_at: Option<Instant>,
    last_consumed: u64,
    stats: TransportStats,
}

impl std::fmt::Debug for BufferTransporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferTransporter")
            .field("state", &self.state())
            .field("playback_pos", &self.video.playback_pos())
            .field("queued_bytes", &self.queue.byte_len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl BufferTransporter {
    pub fn new(
        video: VideoStatus,
        config: PickerConfig,
        source: Arc<dyn PieceSource>,
        events: mpsc::UnboundedSender<VodEvent>,
        now: Instant,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let predictor = BitratePredictor::new(video.piece_length(), config.bitrate_history_window());
        let period = config.short_term_rate_window();
        Self {
            video,
            source,
            queue: Arc::new(OutputQueue::new()),
            events,
            commands_tx,
            commands_rx,
            predictor,
            download_rate: RateEstimator::new(period, now),
            playback_rate: RateEstimator::new(period, now),
            stopped: false,
            start_fired: false,
            start_byte: 0,
            skip_bytes: 0,
            played: 0,
            started_at: None,
            playback_started: None,
            paused_at: None,
            last_consumed: 0,
            stats: TransportStats::default(),
            config,
        }
    }

    pub fn video(&self) -> &VideoStatus {
        &self.video
    }

    pub fn queue(&self) -> &Arc<OutputQueue> {
        &self.queue
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    pub fn predictor(&self) -> &BitratePredictor {
        &self.predictor
    }

    pub fn state(&self) -> PlaybackState {
        if self.stopped {
            PlaybackState::Stopped
        } else if !self.video.playing() {
            PlaybackState::Idle
        } else if self.video.prebuffering() {
            PlaybackState::Prebuffering
        } else if self.video.paused() {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        }
    }

    /// Output buffer bound: `max(256 KiB, 2 pieces, buffer_seconds of video)`.
    pub fn max_buffer(&self) -> usize {
        let by_time = (self.config.buffer_seconds * self.video.bitrate()) as usize;
        MIN_BUFFER_BYTES
            .max(2 * self.video.piece_length() as usize)
            .max(by_time)
    }

    /// Begins playback at byte `byte_pos` of the file and enters prebuffering.
    ///
    /// Live streams ignore the position and play from the hook-in point.
    ///
    /// # Errors
    /// - `TransportError::InvalidState` - Already started
    /// - `TransportError::SeekPastEnd` - Position beyond the file
    pub fn start(&mut self, byte_pos: u64, now: Instant) -> Result<(), TransportError> {
        let state = self.state();
        if !matches!(state, PlaybackState::Idle | PlaybackState::Stopped) {
            return Err(TransportError::InvalidState {
                operation: "start",
                state,
            });
        }

        if !self.video.is_live() {
            let length = self.video.file_length();
            if byte_pos > length {
                return Err(TransportError::SeekPastEnd {
                    position: byte_pos,
                    length,
                });
            }
            if byte_pos == length {
                self.video.set_playback_pos(self.video.last_piece() + 1);
                self.skip_bytes = 0;
            } else {
                let (piece, offset) = self.video.piece_for_byte(byte_pos);
                self.video.set_playback_pos(piece.as_u32());
                self.skip_bytes = offset;
            }
        }

        self.start_byte = byte_pos;
        self.video.set_playing(true);
        self.video.set_prebuffering(true);
        self.video.set_paused(false, false);
        self.stopped = false;
        self.played = 0;
        self.predictor.reset();
        self.started_at = Some(now);
        self.playback_started = None;
        self.paused_at = None;
        self.queue.reset();

        info!(
            byte_pos,
            piece = self.video.playback_pos(),
            mode = ?self.video.mode(),
            "Playback requested, prebuffering"
        );
        Ok(())
    }

    /// Halts delivery and discards queued data.
    pub fn stop(&mut self) {
        if matches!(self.state(), PlaybackState::Idle | PlaybackState::Stopped) {
            return;
        }
        self.queue.reset();
        self.video.set_playing(false);
        self.video.set_prebuffering(false);
        self.video.set_paused(false, false);
        self.playback_started = None;
        self.paused_at = None;
        self.stopped = true;
        info!(piece = self.video.playback_pos(), "Playback stopped");
    }

    /// Pauses the player.
    ///
    /// # Errors
    /// - `TransportError::InvalidState` - Not playing
    pub fn pause(&mut self, autoresume: bool, now: Instant) -> Result<(), TransportError> {
        let state = self.state();
        if state != PlaybackState::Playing {
            return Err(TransportError::InvalidState {
                operation: "pause",
                state,
            });
        }
        self.video.set_paused(true, autoresume);
        self.paused_at = Some(now);
        self.stats.pauses += 1;
        self.emit(VodEvent::Pause { autoresume });
        info!(autoresume, piece = self.video.playback_pos(), "Playback paused");
        Ok(())
    }

    /// Resumes a paused player, crediting the pause to the deadline clock.
    ///
    /// # Errors
    /// - `TransportError::InvalidState` - Not paused
    pub fn resume(&mut self, now: Instant) -> Result<(), TransportError> {
        let state = self.state();
        if state != PlaybackState::Paused {
            return Err(TransportError::InvalidState {
                operation: "resume",
                state,
            });
        }
        if let Some(paused_at) = self.paused_at.take() {
            let paused = now.saturating_duration_since(paused_at);
            self.predictor.addtime(paused);
            self.stats.stall_time += paused;
        }
        self.video.set_paused(false, false);
        self.stats.resumes += 1;
        self.emit(VodEvent::Resume);
        info!(piece = self.video.playback_pos(), "Playback resumed");
        Ok(())
    }

    /// Resumes an auto-resumable pause once the high range is held again.
    pub fn autoresume(&mut self, picker: &PiecePicker, now: Instant) -> bool {
        if self.state() != PlaybackState::Paused || !self.video.autoresume() {
            return false;
        }
        if !self.sustainable(picker) {
            return false;
        }
        self.resume(now).is_ok()
    }

    /// Ends prebuffering when enough is held and the download outpaces
    /// playback. Returns true on the transition, which fires
    /// [`VodEvent::Start`] the first time.
    pub fn check_prebuffer(&mut self, picker: &PiecePicker, now: Instant) -> bool {
        if self.state() != PlaybackState::Prebuffering {
            return false;
        }
        if self.video.is_live() && self.video.live_startpos().is_none() {
            return false;
        }

        let range = self.video.prebuffer_range();
        let held = range.iter().filter(|&p| picker.has(p)).count() as u32;
        if held < range.len() {
            trace!(held, wanted = range.len(), "Prebuffering");
            return false;
        }
        if !self.enough_buffer(picker, now) {
            return false;
        }

        self.video.set_prebuffering(false);
        self.playback_started = Some(now);
        self.predictor.set_start(self.played, now);
        if let Some(started_at) = self.started_at {
            let elapsed = now.saturating_duration_since(started_at);
            if self.stats.prebuffer_time.is_none() {
                self.stats.prebuffer_time = Some(elapsed);
            }
        }
        info!(piece = self.video.playback_pos(), held, "Prebuffering done");

        if !self.start_fired {
            self.start_fired = true;
            let complete = self.file_complete(picker);
            let length = (!self.video.is_live()).then(|| self.video.file_length());
            let stream = PlayerStream::new(
                Arc::clone(&self.queue),
                self.commands_tx.clone(),
                self.start_byte,
                length,
            );
            self.emit(VodEvent::Start {
                complete,
                filename: self.video.filename().map(str::to_string),
                mimetype: self.video.mimetype().to_string(),
                stream,
                length,
                bitrate: self.video.bitrate(),
            });
        }
        true
    }

    fn file_complete(&self, picker: &PiecePicker) -> bool {
        !self.video.is_live()
            && (self.video.first_piece()..=self.video.last_piece())
                .all(|p| picker.has(PieceIndex(p)))
    }

    /// Whether the remaining download is expected to finish before playback
    /// of the remaining file. Live streams cannot be estimated.
    fn enough_buffer(&mut self, picker: &PiecePicker, now: Instant) -> bool {
        if self.video.wraparound() {
            return true;
        }
        let range = self.video.download_range();
        let missing = range.iter().filter(|&p| !picker.has(p)).count() as f64;
        if missing == 0.0 {
            return true;
        }
        let piece_length = f64::from(self.video.piece_length());
        let rate = self.download_rate.rate(now);
        let download_time = if rate > 0.0 {
            missing * piece_length / rate
        } else {
            f64::INFINITY
        };
        let playback_time = f64::from(range.len()) * piece_length / self.video.bitrate();
        trace!(download_time, playback_time, "Buffer estimate");
        download_time <= playback_time
    }

    /// Whether every piece of the high range is held.
    fn sustainable(&self, picker: &PiecePicker) -> bool {
        self.video.high_range().iter().all(|p| picker.has(p))
    }

    /// Seconds until `piece` must be in the player, minus the deadline skew.
    ///
    /// `+inf` while not playing; `-1` for pieces playback already passed.
    pub fn piece_due(&self, piece: PieceIndex, now: Instant) -> f64 {
        if !self.video.playing() || self.video.prebuffering() {
            return f64::INFINITY;
        }
        if self.video.at_end() {
            return -1.0;
        }
        let pos = i64::from(self.video.playback_pos());
        let base = i64::from(self.video.base_piece(piece));
        let distance = if self.video.wraparound() {
            let span = i64::from(self.video.movie_numpieces());
            let forward = (base - pos).rem_euclid(span);
            if forward > span / 2 { forward - span } else { forward }
        } else {
            base - pos
        };
        if distance < 0 {
            return -1.0;
        }
        let now = self.paused_at.unwrap_or(now);
        let rate = self
            .predictor
            .bitrate()
            .unwrap_or_else(|| self.video.bitrate());
        self.predictor.due_in(
            self.played + distance as u64,
            rate,
            self.config.deadline_skew(),
            now,
        )
    }

    /// A piece passed its hash check; feeds the download rate.
    pub fn on_piece_complete(&mut self, piece: PieceIndex, now: Instant) {
        let size = self.video.piece_size(piece);
        self.download_rate.update(u64::from(size), now);
    }

    /// Applies seek and close requests from the player.
    pub fn handle_commands(&mut self, now: Instant) {
        while let Ok(command) = self.commands_rx.try_recv() {
            match command {
                StreamCommand::Seek(byte_pos) => {
                    debug!(byte_pos, "Player seek");
                    self.stop();
                    if let Err(e) = self.start(byte_pos, now) {
                        warn!(error = %e, "Seek rejected");
                        self.queue.reset();
                        self.queue.finish();
                    }
                }
                StreamCommand::Close => {
                    debug!("Player closed the stream");
                    self.stop();
                }
            }
        }
    }

    /// Moves held pieces into the output queue.
    ///
    /// # Errors
    /// - `PieceError` - Live window bookkeeping rejected a piece
    pub fn refill(
        &mut self,
        picker: &mut PiecePicker,
        now: Instant,
    ) -> Result<RefillOutcome, PieceError> {
        self.handle_commands(now);
        let mut outcome = RefillOutcome::default();
        if self.state() != PlaybackState::Playing {
            return Ok(outcome);
        }
        if self.video.at_end() {
            self.finish(&mut outcome);
            return Ok(outcome);
        }

        let playing_for = self
            .playback_started
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        if self.queue.byte_len() == 0 && playing_for > UNDERRUN_GRACE {
            outcome.underrun = true;
            self.stats.underruns += 1;
            debug!(piece = self.video.playback_pos(), "Output queue ran dry");
            if !self.sustainable(picker) {
                if self.video.pausable() {
                    self.video.increase_high_range(1);
                    warn!(
                        high_range_seconds = self.video.high_range_seconds(),
                        "Download cannot sustain playback, pausing"
                    );
                    match self.pause(true, now) {
                        Ok(()) => {
                            outcome.paused = true;
                            return Ok(outcome);
                        }
                        Err(e) => warn!(error = %e, "Underrun pause rejected"),
                    }
                } else {
                    trace!("Unpausable stream stalled");
                }
            }
        }

        let max_buffer = self.max_buffer();
        for _ in 0..=self.video.movie_numpieces() {
            if self.queue.byte_len() > max_buffer {
                break;
            }
            if self.video.at_end() {
                self.finish(&mut outcome);
                break;
            }
            let piece = PieceIndex(self.video.playback_pos());

            let mut invalid = false;
            if picker.has(piece) {
                if let Some(data) = self.source.piece_data(piece) {
                    if self.source.validates(piece, &data) {
                        if !self.push(piece, data, now) {
                            break;
                        }
                        outcome.pushed.push(piece);
                        self.advance(picker, &mut outcome)?;
                        continue;
                    }
                    warn!(%piece, "Held piece failed validation");
                    invalid = true;
                } else {
                    warn!(%piece, "Held piece missing from storage");
                    invalid = true;
                }
            }

            if !self.video.dropping() {
                break;
            }
            let late = self.piece_due(piece, now) < 0.0;
            let gap = self.queue.is_empty() && self.held_ahead(picker);
            if !(invalid || late || gap) {
                break;
            }
            picker.abandon(piece)?;
            self.stats.pieces_dropped += 1;
            outcome.dropped.push(piece);
            debug!(%piece, late, gap, invalid, "Dropped piece");
            self.advance(picker, &mut outcome)?;
        }
        Ok(outcome)
    }

    fn held_ahead(&self, picker: &PiecePicker) -> bool {
        self.video.high_range().iter().skip(1).any(|p| picker.has(p))
    }

    fn push(&mut self, piece: PieceIndex, data: Bytes, now: Instant) -> bool {
        let (skip, end) = self.video.file_bytes_of(piece);
        let skip = skip.max(self.skip_bytes) as usize;
        let end = (end as usize).min(data.len());
        let data = data.slice(skip.min(end)..end);
        let len = data.len();
        if !self.queue.push(piece, data) {
            return false;
        }
        self.predictor
            .record(self.played, self.source.source_timestamp(piece), now);
        self.stats.pieces_pushed += 1;
        self.stats.bytes_pushed += len as u64;
        trace!(%piece, len, "Pushed piece");
        true
    }

    /// Steps past the playback piece. A wrapped stream discards the piece
    /// leaving the trailing edge of the window first.
    fn advance(
        &mut self,
        picker: &mut PiecePicker,
        outcome: &mut RefillOutcome,
    ) -> Result<(), PieceError> {
        if self.video.wraparound() {
            let stale = self.video.live_piece_to_invalidate();
            outcome.interest_changes.extend(picker.invalidate(stale)?);
            outcome.invalidated.push(stale);
        }
        self.video.inc_playback_pos();
        self.played += 1;
        self.skip_bytes = 0;
        Ok(())
    }

    fn finish(&mut self, outcome: &mut RefillOutcome) {
        if !self.queue.is_finished() {
            info!(pushed = self.stats.pieces_pushed, "End of file reached");
        }
        self.queue.finish();
        outcome.finished = true;
    }

    /// Once-a-second housekeeping: measures the player's consumption and
    /// adopts it as the bitrate when nothing better is known.
    pub fn tick_second(&mut self, now: Instant) {
        let consumed = self.queue.consumed_bytes();
        let delta = consumed.saturating_sub(self.last_consumed);
        self.last_consumed = consumed;
        if self.state() != PlaybackState::Playing {
            return;
        }
        self.playback_rate.update(delta, now);
        let rate = self.playback_rate.rate(now);
        if !self.video.bitrate_source().is_authoritative()
            && rate > self.config.min_playback_rate_bps as f64
        {
            debug!(rate, "Adopting measured playback rate");
            self.video.set_bitrate(rate, BitrateSource::Measured);
        }
    }

    /// Bitrate reported by a media analyser or other external source.
    pub fn set_bitrate(&mut self, bytes_per_second: f64, source: BitrateSource) {
        self.video.set_bitrate(bytes_per_second, source);
    }

    /// Fixes the live hook-in point. Returns pieces that left the valid range.
    pub fn set_live_startpos(&mut self, piece: u32) -> Vec<PieceIndex> {
        self.video.set_live_startpos(piece)
    }

    /// Plays a live stream that turned out to be complete as a finite file.
    pub fn switch_to_vod(&mut self) {
        self.video.switch_to_vod();
    }

    /// Resizes the high range, clamped to its limits.
    pub fn set_high_range(&mut self, seconds: Option<f64>, pieces: Option<u32>) {
        self.video.set_high_range(seconds, pieces);
    }

    /// Chooses which quality layer is played.
    pub fn set_quality(&mut self, quality: u32) {
        self.video.set_quality(quality);
    }

    fn emit(&self, event: VodEvent) {
        let name = event.name();
        if self.events.send(event).is_err() {
            debug!(event = name, "No listener for player event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Read;

    use parking_lot::Mutex;

    use super::*;
    use crate::config::StreamDescriptor;

    const PIECE: u32 = 16_384;

    #[derive(Default)]
    struct MemorySource {
        pieces: Mutex<HashMap<u32, Bytes>>,
    }

    impl MemorySource {
        fn put(&self, piece: u32) {
            let data = Bytes::from(vec![(piece % 251) as u8; PIECE as usize]);
            self.pieces.lock().insert(piece, data);
        }
    }

    impl PieceSource for MemorySource {
        fn piece_data(&self, piece: PieceIndex) -> Option<Bytes> {
            self.pieces.lock().get(&piece.as_u32()).cloned()
        }
    }

    struct Harness {
        picker: PiecePicker,
        transporter: BufferTransporter,
        source: Arc<MemorySource>,
        events: mpsc::UnboundedReceiver<VodEvent>,
        t0: Instant,
    }

    impl Harness {
        fn new(descriptor: StreamDescriptor) -> Self {
            let config = PickerConfig::for_testing();
            let t0 = Instant::now();
            let video = VideoStatus::new(&descriptor, &config).unwrap();
            let picker = PiecePicker::new(descriptor.piece_count, config.clone()).unwrap();
            let source = Arc::new(MemorySource::default());
            let (tx, events) = mpsc::unbounded_channel();
            let transporter = BufferTransporter::new(video, config, source.clone(), tx, t0);
            Self {
                picker,
                transporter,
                source,
                events,
                t0,
            }
        }

        fn at(&self, millis: u64) -> Instant {
            self.t0 + Duration::from_millis(millis)
        }

        fn deliver(&mut self, piece: u32, now: Instant) {
            self.source.put(piece);
            self.picker.complete(PieceIndex(piece)).unwrap();
            self.transporter.on_piece_complete(PieceIndex(piece), now);
        }
    }

    fn vod_harness() -> Harness {
        Harness::new(StreamDescriptor::vod(PIECE, 100).with_bitrate(65_536))
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut h = vod_harness();
        h.transporter.start(0, h.t0).unwrap();
        assert_eq!(h.transporter.state(), PlaybackState::Prebuffering);
        assert!(matches!(
            h.transporter.start(0, h.t0),
            Err(TransportError::InvalidState { operation: "start", .. })
        ));
    }

    #[test]
    fn test_start_past_end_is_rejected() {
        let mut h = vod_harness();
        let length = h.transporter.video().file_length();
        assert!(matches!(
            h.transporter.start(length + 1, h.t0),
            Err(TransportError::SeekPastEnd { .. })
        ));
    }

    #[test]
    fn test_prebuffer_waits_for_window_then_fires_start_once() {
        let mut h = vod_harness();
        h.transporter.start(0, h.t0).unwrap();

        // 10 s at 64 KiB/s over 16 KiB pieces
        assert_eq!(h.transporter.video().prebuffer_pieces(), 40);
        for piece in 0..39 {
            let now = h.at(100 * u64::from(piece));
            h.deliver(piece, now);
            assert!(!h.transporter.check_prebuffer(&h.picker, now));
        }
        let now = h.at(3_900);
        h.deliver(39, now);
        assert!(h.transporter.check_prebuffer(&h.picker, now));
        assert_eq!(h.transporter.state(), PlaybackState::Playing);

        match h.events.try_recv().unwrap() {
            VodEvent::Start {
                complete,
                length,
                bitrate,
                ..
            } => {
                assert!(!complete);
                assert_eq!(length, Some(100 * u64::from(PIECE)));
                assert_eq!(bitrate, 65_536.0);
            }
            other => panic!("unexpected event {other:?}"),
        }

        h.transporter.stop();
        h.transporter.start(0, now).unwrap();
        assert!(h.transporter.check_prebuffer(&h.picker, now));
        assert!(h.events.try_recv().is_err());
    }

    #[test]
    fn test_refill_pushes_in_order_up_to_buffer_bound() {
        let mut h = vod_harness();
        for piece in 0..60 {
            h.deliver(piece, h.t0);
        }
        h.transporter.start(0, h.t0).unwrap();
        assert!(h.transporter.check_prebuffer(&h.picker, h.t0));

        let outcome = h.transporter.refill(&mut h.picker, h.t0).unwrap();
        // five seconds of video bound the queue; the push crossing it is the last
        assert_eq!(h.transporter.max_buffer(), 327_680);
        assert_eq!(outcome.pushed.len(), 21);
        assert_eq!(outcome.pushed[0], PieceIndex(0));
        assert_eq!(outcome.pushed[20], PieceIndex(20));
        assert_eq!(h.transporter.video().playback_pos(), 21);
        assert!(outcome.dropped.is_empty());

        while h.transporter.queue().try_pop().is_some() {}
        let now = h.at(500);
        let outcome = h.transporter.refill(&mut h.picker, now).unwrap();
        assert_eq!(outcome.pushed.len(), 21);
        assert!(!outcome.underrun);
    }

    #[test]
    fn test_vod_refill_finishes_at_end_of_file() {
        let mut h = Harness::new(StreamDescriptor::vod(PIECE, 4).with_bitrate(65_536));
        for piece in [0, 1, 3] {
            h.deliver(piece, h.t0);
        }
        h.transporter.start(0, h.t0).unwrap();
        // the prebuffer window covers the whole file
        assert!(!h.transporter.check_prebuffer(&h.picker, h.t0));
        h.deliver(2, h.t0);
        assert!(h.transporter.check_prebuffer(&h.picker, h.t0));
        let outcome = h.transporter.refill(&mut h.picker, h.t0).unwrap();
        assert!(outcome.finished);
        assert_eq!(outcome.pushed.len(), 4);

        let VodEvent::Start { mut stream, .. } = h.events.try_recv().unwrap() else {
            panic!("expected start");
        };
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 4 * PIECE as usize);
    }

    #[test]
    fn test_start_mid_piece_trims_first_piece() {
        let mut h = Harness::new(StreamDescriptor::vod(PIECE, 4).with_bitrate(65_536));
        for piece in 0..4 {
            h.deliver(piece, h.t0);
        }
        h.transporter.start(u64::from(PIECE) + 100, h.t0).unwrap();
        assert_eq!(h.transporter.video().playback_pos(), 1);
        assert!(h.transporter.check_prebuffer(&h.picker, h.t0));
        h.transporter.refill(&mut h.picker, h.t0).unwrap();
        assert_eq!(
            h.transporter.stats().bytes_pushed,
            3 * u64::from(PIECE) - 100
        );
    }

    #[test]
    fn test_underrun_pauses_and_autoresume() {
        let mut h = vod_harness();
        for piece in 0..40 {
            h.deliver(piece, h.t0);
        }
        h.transporter.start(0, h.t0).unwrap();
        assert!(h.transporter.check_prebuffer(&h.picker, h.t0));
        let outcome = h.transporter.refill(&mut h.picker, h.t0).unwrap();
        assert_eq!(outcome.pushed.len(), 21);

        // VOD waits at the first missing piece
        while h.transporter.queue().try_pop().is_some() {}
        let now = h.at(500);
        let outcome = h.transporter.refill(&mut h.picker, now).unwrap();
        assert_eq!(outcome.pushed.len(), 19);
        assert_eq!(h.transporter.video().playback_pos(), 40);

        while h.transporter.queue().try_pop().is_some() {}
        let now = h.at(2_000);
        let outcome = h.transporter.refill(&mut h.picker, now).unwrap();
        assert!(outcome.underrun);
        assert!(outcome.paused);
        assert_eq!(h.transporter.state(), PlaybackState::Paused);
        assert_eq!(h.transporter.video().high_range_seconds(), 15.0);
        assert!(matches!(h.events.try_recv().unwrap(), VodEvent::Start { .. }));
        assert!(matches!(
            h.events.try_recv().unwrap(),
            VodEvent::Pause { autoresume: true }
        ));

        assert!(!h.transporter.autoresume(&h.picker, h.at(3_000)));
        let high = h.transporter.video().high_range();
        assert_eq!(high.len(), 60);
        for piece in high.iter() {
            h.deliver(piece.as_u32(), h.at(3_000));
        }
        assert!(h.transporter.autoresume(&h.picker, h.at(5_000)));
        assert_eq!(h.transporter.state(), PlaybackState::Playing);
        assert_eq!(h.transporter.stats().stall_time, Duration::from_secs(3));
        assert!(matches!(h.events.try_recv().unwrap(), VodEvent::Resume));
    }

    #[test]
    fn test_piece_due_before_and_during_playback() {
        let mut h = vod_harness();
        let piece = PieceIndex(50);
        assert!(h.transporter.piece_due(piece, h.t0).is_infinite());

        for p in 0..40 {
            h.deliver(p, h.t0);
        }
        h.transporter.start(0, h.t0).unwrap();
        assert!(h.transporter.check_prebuffer(&h.picker, h.t0));
        // 50 pieces at 4 pieces per second, minus the 0.1 s skew, 2 s in
        let due = h.transporter.piece_due(piece, h.at(2_000));
        assert!((due - 10.4).abs() < 1e-6);

        h.transporter.refill(&mut h.picker, h.t0).unwrap();
        assert_eq!(h.transporter.piece_due(PieceIndex(3), h.t0), -1.0);
    }

    #[test]
    fn test_live_refill_drops_late_pieces_and_invalidates_trailing_edge() {
        let mut h = Harness::new(
            StreamDescriptor::live(PIECE, 100)
                .with_bitrate(65_536)
                .with_live_delta(10)
                .unpausable(),
        );
        h.transporter.start(0, h.t0).unwrap();
        assert!(!h.transporter.check_prebuffer(&h.picker, h.t0));
        h.transporter.set_live_startpos(50);
        for piece in 50..61 {
            h.deliver(piece, h.t0);
        }
        assert!(h.transporter.check_prebuffer(&h.picker, h.t0));

        let outcome = h.transporter.refill(&mut h.picker, h.t0).unwrap();
        assert_eq!(outcome.pushed.len(), 11);
        assert_eq!(outcome.invalidated.first(), Some(&PieceIndex(40)));
        assert_eq!(h.transporter.video().playback_pos(), 61);

        // 62 arrives but 61 never does; once 61 is late it is skipped
        h.deliver(62, h.t0);
        while h.transporter.queue().try_pop().is_some() {}
        let now = h.at(3_000);
        let outcome = h.transporter.refill(&mut h.picker, now).unwrap();
        assert_eq!(outcome.dropped, vec![PieceIndex(61)]);
        assert_eq!(outcome.pushed, vec![PieceIndex(62)]);
        assert_eq!(h.transporter.stats().pieces_dropped, 1);
        // piece 50 left the window when playback passed 60
        assert!(!h.picker.has(PieceIndex(50)));
    }

    #[test]
    fn test_live_underrun_pauses_and_autoresumes() {
        let mut h = Harness::new(
            StreamDescriptor::live(PIECE, 100)
                .with_bitrate(65_536)
                .with_live_delta(10),
        );
        h.transporter.start(0, h.t0).unwrap();
        h.transporter.set_live_startpos(50);
        for piece in 50..61 {
            h.deliver(piece, h.t0);
        }
        assert!(h.transporter.check_prebuffer(&h.picker, h.t0));
        let outcome = h.transporter.refill(&mut h.picker, h.t0).unwrap();
        assert_eq!(outcome.pushed.len(), 11);
        let seconds = h.transporter.video().high_range_seconds();

        // 61 is missing, so the high range cannot be held
        while h.transporter.queue().try_pop().is_some() {}
        let now = h.at(2_000);
        let outcome = h.transporter.refill(&mut h.picker, now).unwrap();
        assert!(outcome.underrun);
        assert!(outcome.paused);
        assert!(outcome.dropped.is_empty());
        assert_eq!(h.transporter.state(), PlaybackState::Paused);
        assert_eq!(h.transporter.video().playback_pos(), 61);
        assert!(h.transporter.video().high_range_seconds() > seconds);
        assert!(matches!(h.events.try_recv().unwrap(), VodEvent::Start { .. }));
        assert!(matches!(
            h.events.try_recv().unwrap(),
            VodEvent::Pause { autoresume: true }
        ));

        assert!(!h.transporter.autoresume(&h.picker, h.at(3_000)));
        let high = h.transporter.video().high_range();
        assert!(!high.is_empty());
        for piece in high.iter() {
            h.deliver(piece.as_u32(), h.at(3_000));
        }
        assert!(h.transporter.autoresume(&h.picker, h.at(4_000)));
        assert_eq!(h.transporter.state(), PlaybackState::Playing);
        assert_eq!(h.transporter.stats().stall_time, Duration::from_secs(2));
        assert!(matches!(h.events.try_recv().unwrap(), VodEvent::Resume));
    }
}
