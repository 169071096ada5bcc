//! Step-driven swarm simulation around one streaming session.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tidecast_core::{
    CancelRequest, ChunkRequest, ConfigError, HookOutcome, PeerCapabilities, PeerId, PickOptions,
    PickerConfig, PieceError, PieceIndex, PlaybackState, PlayerStream, SessionSnapshot,
    StreamDescriptor, StreamingSession, TransportError, VodEvent,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::clock::{DeterministicClock, DeterministicRng};
use crate::invariants::{
    CheckPhase, Invariant, InvariantViolation, PickRecord, SimulationView, default_invariants,
};
use crate::swarm::{PeerSpec, SimPeer, SimStore, piece_payload};

/// Maximum number of invariant violations before stopping simulation.
const MAX_INVARIANT_VIOLATIONS: usize = 10;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Errors that can occur during simulation.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Piece error: {0}")]
    Piece(#[from] PieceError),

    #[error("Playback error: {0}")]
    Transport(#[from] TransportError),

    /// Clock asked to move in a way it cannot
    #[error("Invalid time step: {reason}")]
    InvalidTimeStep { reason: String },

    /// Too many invariant violations occurred
    #[error("Too many invariant violations: {count}")]
    TooManyInvariantViolations { count: usize },
}

/// Source of a live stream: one new piece every `piece_interval`.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSourceConfig {
    pub piece_interval: Duration,
    /// Newest piece when the simulation starts
    pub frontier: u32,
    /// Pieces behind the frontier the neighbours already hold
    pub window: u32,
}

/// Everything needed to reproduce a run.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub seed: u64,
    pub descriptor: StreamDescriptor,
    pub picker: PickerConfig,
    pub peers: Vec<PeerSpec>,
    pub step: Duration,
    pub live: Option<LiveSourceConfig>,
    pub max_violations: usize,
}

impl SimulationConfig {
    /// Neighbours holding parts of a finite file.
    pub fn vod(seed: u64, descriptor: StreamDescriptor, peers: Vec<PeerSpec>) -> Self {
        Self {
            seed,
            descriptor,
            picker: PickerConfig::default(),
            peers,
            step: Duration::from_millis(100),
            live: None,
            max_violations: MAX_INVARIANT_VIOLATIONS,
        }
    }

    /// Neighbours following a live source.
    pub fn live(
        seed: u64,
        descriptor: StreamDescriptor,
        peers: Vec<PeerSpec>,
        source: LiveSourceConfig,
    ) -> Self {
        Self {
            live: Some(source),
            ..Self::vod(seed, descriptor, peers)
        }
    }
}

/// Result of a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    /// Seed used for reproduction
    pub seed: u64,
    pub duration: Duration,
    /// Pieces pushed to the player, in order
    pub pushed: Vec<PieceIndex>,
    /// Pieces discarded from the trailing edge of the live window
    pub invalidated: Vec<PieceIndex>,
    /// Live hook-in point, once found
    pub hooked_at: Option<PieceIndex>,
    /// Pieces discarded when playback jumped to the hook-in point
    pub hook_invalidated: Vec<PieceIndex>,
    pub pieces_downloaded: u64,
    pub bytes_played: u64,
    pub cancelled: u64,
    pub hash_failures: u64,
    pub starts: u32,
    pub pauses: u32,
    pub violations: Vec<InvariantViolation>,
    pub snapshot: SessionSnapshot,
}

impl SimulationReport {
    /// One-line summary for logs and assertion messages.
    pub fn summary(&self) -> String {
        format!(
            "seed {} over {:?}: {} downloaded, {} pushed, {} cancelled, {} pauses, {} violations, state {:?} at piece {}",
            self.seed,
            self.duration,
            self.pieces_downloaded,
            self.pushed.len(),
            self.cancelled,
            self.pauses,
            self.violations.len(),
            self.snapshot.state,
            self.snapshot.playback_pos,
        )
    }
}

/// Drives a [`StreamingSession`] against simulated neighbours with a
/// deterministic clock.
///
/// Each step runs housekeeping (once a second), the live source, the
/// transfers, deadline checks, the refill, the player and finally the picks,
/// then checks every invariant.
pub struct StreamingSimulation {
    config: SimulationConfig,
    clock: DeterministicClock,
    rng: DeterministicRng,
    session: StreamingSession,
    store: Arc<SimStore>,
    peers: Vec<SimPeer>,
    events: mpsc::UnboundedReceiver<VodEvent>,
    player: Option<PlayerStream>,
    player_credit: f64,
    invariants: Vec<Box<dyn Invariant>>,
    next_housekeeping: Duration,
    next_live_piece: Duration,
    frontier: u32,
    last_pushed: Option<PieceIndex>,
    report: Totals,
}

#[derive(Debug, Default)]
struct Totals {
    pushed: Vec<PieceIndex>,
    invalidated: Vec<PieceIndex>,
    hooked_at: Option<PieceIndex>,
    hook_invalidated: Vec<PieceIndex>,
    pieces_downloaded: u64,
    bytes_played: u64,
    cancelled: u64,
    hash_failures: u64,
    starts: u32,
    pauses: u32,
    violations: Vec<InvariantViolation>,
}

impl StreamingSimulation {
    /// Connects the neighbours and asks for playback from the first byte.
    ///
    /// # Errors
    /// - `SimulationError::Config` - Descriptor or picker options rejected
    /// - `SimulationError::Piece` - A neighbour's bitfield was rejected
    /// - `SimulationError::Transport` - Playback could not start
    pub fn new(mut config: SimulationConfig) -> Result<Self, SimulationError> {
        let clock = DeterministicClock::new();
        let mut rng = DeterministicRng::from_seed(config.seed);
        if config.picker.rng_seed.is_none() {
            config.picker.rng_seed = Some(rng.fork());
        }

        let store = Arc::new(SimStore::default());
        let (events_tx, events) = mpsc::unbounded_channel();
        let mut session = StreamingSession::new(
            &config.descriptor,
            config.picker.clone(),
            store.clone(),
            events_tx,
            clock.now(),
        )?;

        let piece_count = config.descriptor.piece_count;
        let (held, frontier) = match &config.live {
            Some(live) => {
                let video = session.video();
                let oldest = i64::from(live.frontier) - i64::from(live.window) + 1;
                let held: Vec<u32> = (0..live.window)
                    .map(|i| video.normalize(oldest + i64::from(i)))
                    .collect();
                (held, live.frontier)
            }
            None => ((0..piece_count).collect(), 0),
        };

        let mut peers = Vec::with_capacity(config.peers.len());
        for (id, spec) in config.peers.iter().enumerate() {
            let peer = SimPeer::new(
                PeerId(id as u64),
                spec.clone(),
                piece_count,
                held.iter().copied(),
                &mut rng,
            );
            session.on_peer_connected(peer.id, PeerCapabilities::default(), clock.now());
            session.on_bitfield(peer.id, &peer.holds)?;
            session.on_unchoke(peer.id)?;
            peers.push(peer);
        }
        session.start_playback(0, clock.now())?;

        info!(
            seed = config.seed,
            pieces = piece_count,
            peers = peers.len(),
            mode = ?config.descriptor.mode,
            "Simulation created"
        );
        let next_live_piece = config
            .live
            .as_ref()
            .map_or(Duration::MAX, |live| live.piece_interval);
        Ok(Self {
            clock,
            rng,
            session,
            store,
            peers,
            events,
            player: None,
            player_credit: 0.0,
            invariants: default_invariants(),
            next_housekeeping: Duration::ZERO,
            next_live_piece,
            frontier,
            last_pushed: None,
            report: Totals::default(),
            config,
        })
    }

    pub fn session(&self) -> &StreamingSession {
        &self.session
    }

    pub fn peers(&self) -> &[SimPeer] {
        &self.peers
    }

    /// Reader handed out with the start event, kept open for the run.
    pub fn player(&self) -> Option<&PlayerStream> {
        self.player.as_ref()
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    pub fn violations(&self) -> &[InvariantViolation] {
        &self.report.violations
    }

    /// Adds a check run after every phase.
    pub fn add_invariant(&mut self, invariant: Box<dyn Invariant>) {
        self.invariants.push(invariant);
    }

    /// Runs steps until `duration` of simulated time has passed.
    ///
    /// # Errors
    /// - `SimulationError::TooManyInvariantViolations` - Violation limit reached
    /// - `SimulationError::Piece` - The session rejected a simulated event
    pub fn run_for(&mut self, duration: Duration) -> Result<SimulationReport, SimulationError> {
        let end = self.clock.elapsed() + duration;
        while self.clock.elapsed() < end {
            self.step()?;
        }
        Ok(self.report())
    }

    /// Advances the simulation by one step.
    ///
    /// # Errors
    /// - `SimulationError::TooManyInvariantViolations` - Violation limit reached
    /// - `SimulationError::Piece` - The session rejected a simulated event
    pub fn step(&mut self) -> Result<(), SimulationError> {
        let now = self.clock.now();
        let elapsed = self.clock.elapsed();

        if elapsed >= self.next_housekeeping {
            let before = self.session.snapshot().state;
            self.housekeeping()?;
            self.next_housekeeping += HOUSEKEEPING_INTERVAL;
            self.check(CheckPhase::Housekeeping, before, &[], &[])?;
        }
        let before = self.session.snapshot().state;

        self.produce_live()?;
        self.transfer()?;
        self.cancel_late();

        let outcome = self.session.refill(now)?;
        for piece in &outcome.invalidated {
            self.store.discard(*piece);
        }
        self.report.invalidated.extend(&outcome.invalidated);
        self.report.pushed.extend(&outcome.pushed);

        self.drain_events();
        self.play();
        let picks = self.pick()?;

        self.check(CheckPhase::EndOfStep, before, &picks, &outcome.pushed)?;
        if let Some(&last) = outcome.pushed.last() {
            self.last_pushed = Some(last);
        }
        self.clock.advance(self.config.step)
    }

    fn housekeeping(&mut self) -> Result<(), SimulationError> {
        let now = self.clock.now();
        self.session.tick_second(now);
        match self.session.live_hook()? {
            HookOutcome::HookedIn {
                startpos,
                invalidated,
                ..
            } => {
                for piece in &invalidated {
                    self.store.discard(*piece);
                }
                self.report.hooked_at = Some(startpos);
                self.report.hook_invalidated.extend(invalidated);
            }
            HookOutcome::SwitchedToVod => info!("Simulated live stream switched to VOD"),
            HookOutcome::Waiting | HookOutcome::Inactive => {}
        }
        if self.session.autoresume(now) {
            debug!(at = ?self.clock.elapsed(), "Playback resumed automatically");
        }
        Ok(())
    }

    /// The source publishes new pieces and each neighbour picks them up
    /// with its coverage probability.
    fn produce_live(&mut self) -> Result<(), SimulationError> {
        let Some(live) = &self.config.live else {
            return Ok(());
        };
        let interval = live.piece_interval;
        while self.clock.elapsed() >= self.next_live_piece {
            self.next_live_piece += interval;
            self.frontier = self
                .session
                .video()
                .normalize(i64::from(self.frontier) + 1);
            let piece = PieceIndex(self.frontier);
            for peer in &mut self.peers {
                if self.rng.random_bool(peer.spec.coverage) {
                    peer.holds.set_piece(piece);
                    self.session.on_have(peer.id, piece)?;
                }
            }
            trace!(%piece, "Live source produced piece");
        }
        Ok(())
    }

    fn transfer(&mut self) -> Result<(), SimulationError> {
        let now = self.clock.now();
        let seconds = self.config.step.as_secs_f64();
        for i in 0..self.peers.len() {
            let Some(delivery) = self.peers[i].transmit(seconds) else {
                continue;
            };
            let peer = self.peers[i].id;
            if delivery.bytes > 0 {
                self.session.on_bytes_downloaded(peer, delivery.bytes, now)?;
            }
            if let Some(request) = delivery.completed {
                let corrupt = self.peers[i].spec.corrupt;
                self.deliver(peer, request, corrupt)?;
            }
        }
        Ok(())
    }

    fn deliver(
        &mut self,
        peer: PeerId,
        request: ChunkRequest,
        corrupt: bool,
    ) -> Result<(), SimulationError> {
        let now = self.clock.now();
        let piece = request.piece;
        if self.session.picker().has(piece) || !self.session.video().in_valid_range(piece) {
            trace!(%peer, %piece, "Discarding piece no longer wanted");
            return Ok(());
        }
        self.session.on_chunk_received(peer, request)?;
        if corrupt {
            let blamed = self.session.on_piece_failed_hash(piece)?;
            self.report.hash_failures += 1;
            debug!(%piece, blamed = blamed.len(), "Simulated corrupt piece");
            return Ok(());
        }
        self.store.store(piece, piece_payload(piece, request.length));
        self.session.on_piece_complete(piece, now)?;
        self.report.pieces_downloaded += 1;
        Ok(())
    }

    fn cancel_late(&mut self) {
        let mut wire: Vec<CancelRequest> = Vec::new();
        let cancelled = self.session.check_deadlines(&mut wire, self.clock.now());
        for cancel in &cancelled {
            if let Some(peer) = self.peers.iter_mut().find(|p| p.id == cancel.peer) {
                peer.cancel(&cancel.request);
            }
        }
        self.report.cancelled += cancelled.len() as u64;
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                VodEvent::Start { stream, .. } => {
                    self.report.starts += 1;
                    // dropping the stream would close playback
                    self.player = Some(stream);
                }
                VodEvent::Pause { autoresume } => {
                    self.report.pauses += 1;
                    debug!(autoresume, at = ?self.clock.elapsed(), "Player paused");
                }
                VodEvent::Resume => {}
            }
        }
    }

    /// The player consumes the queue at the stream bitrate.
    fn play(&mut self) {
        if self.session.snapshot().state != PlaybackState::Playing {
            return;
        }
        self.player_credit += self.session.video().bitrate() * self.config.step.as_secs_f64();
        let queue = Arc::clone(self.session.transporter().queue());
        while self.player_credit > 0.0 {
            let Some((_, data)) = queue.try_pop() else {
                self.player_credit = 0.0;
                break;
            };
            self.player_credit -= data.len() as f64;
            self.report.bytes_played += data.len() as u64;
        }
    }

    /// Idle neighbours get one whole-piece request each. Pieces already in
    /// flight elsewhere are left alone.
    fn pick(&mut self) -> Result<Vec<PickRecord>, SimulationError> {
        let now = self.clock.now();
        let mut in_flight: HashSet<PieceIndex> = self
            .peers
            .iter()
            .filter_map(|peer| peer.transfer.map(|t| t.request.piece))
            .collect();
        let mut order: Vec<usize> = (0..self.peers.len()).collect();
        self.rng.shuffle(&mut order);

        let mut picks = Vec::new();
        for i in order {
            if !self.peers[i].is_idle() {
                continue;
            }
            let peer = self.peers[i].id;
            let picked = {
                let want = |piece: PieceIndex| !in_flight.contains(&piece);
                let options = PickOptions {
                    want: Some(&want),
                    ..PickOptions::default()
                };
                self.session.pick_next(peer, &options)?
            };
            let Some(piece) = picked else {
                continue;
            };
            let request = ChunkRequest::new(piece, 0, self.session.video().piece_size(piece));
            self.session.on_request_committed(peer, request, now)?;
            self.peers[i].start(request);
            in_flight.insert(piece);
            picks.push(PickRecord { peer, piece });
        }
        Ok(picks)
    }

    fn check(
        &mut self,
        phase: CheckPhase,
        previous_state: PlaybackState,
        picks: &[PickRecord],
        pushed: &[PieceIndex],
    ) -> Result<(), SimulationError> {
        let view = SimulationView {
            session: &self.session,
            phase,
            elapsed: self.clock.elapsed(),
            previous_state,
            picks,
            pushed,
            last_pushed: self.last_pushed,
        };
        for invariant in &self.invariants {
            if let Err(violation) = invariant.check(&view) {
                warn!(%violation, "Invariant violated");
                self.report.violations.push(violation);
            }
        }
        let count = self.report.violations.len();
        if count >= self.config.max_violations {
            return Err(SimulationError::TooManyInvariantViolations { count });
        }
        Ok(())
    }

    /// Totals so far.
    pub fn report(&self) -> SimulationReport {
        SimulationReport {
            seed: self.config.seed,
            duration: self.clock.elapsed(),
            pushed: self.report.pushed.clone(),
            invalidated: self.report.invalidated.clone(),
            hooked_at: self.report.hooked_at,
            hook_invalidated: self.report.hook_invalidated.clone(),
            pieces_downloaded: self.report.pieces_downloaded,
            bytes_played: self.report.bytes_played,
            cancelled: self.report.cancelled,
            hash_failures: self.report.hash_failures,
            starts: self.report.starts,
            pauses: self.report.pauses,
            violations: self.report.violations.clone(),
            snapshot: self.session.snapshot(),
        }
    }
}
