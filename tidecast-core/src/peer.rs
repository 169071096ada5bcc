//! Peer connection records held by the picker.
//!
//! The wire layer owns the real connections and refers to them here by
//! [`PeerId`]. The picker owns the table and every per-peer counter it needs
//! for rarity, interest, deadline and bad-performance decisions.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use crate::piece::{Bitfield, ChunkRequest, PieceIndex};

/// Lookup key of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Optional protocol features a connection advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerCapabilities {
    pub supports_g2g: bool,
    pub supports_merkle: bool,
    pub is_live_source_authenticated: bool,
}

/// Short-term transfer rate over a decaying window.
///
/// The window trails the latest update by at most `period`; a fresh
/// estimator starts with a one second head start so the first samples do
/// not explode the rate.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    period: Duration,
    rate: f64,
    rate_since: Instant,
    last: Instant,
    active_at: Instant,
    total: u64,
}

impl RateEstimator {
    const FUDGE: Duration = Duration::from_secs(1);

    /// Creates an estimator averaging over `period`.
    pub fn new(period: Duration, now: Instant) -> Self {
        let rate_since = now.checked_sub(Self::FUDGE).unwrap_or(now);
        Self {
            period,
            rate: 0.0,
            rate_since,
            last: rate_since,
            active_at: now,
            total: 0,
        }
    }

    /// Accounts `amount` bytes transferred at `now`.
    pub fn update(&mut self, amount: u64, now: Instant) {
        let now = now.max(self.last);
        self.total += amount;
        if amount > 0 {
            self.active_at = now;
        }
        let covered = self.last.duration_since(self.rate_since).as_secs_f64();
        let elapsed = now.duration_since(self.rate_since).as_secs_f64();
        self.rate = (self.rate * covered + amount as f64) / (elapsed + 0.0001);
        self.last = now;
        if now.duration_since(self.rate_since) > self.period
            && let Some(since) = now.checked_sub(self.period)
        {
            self.rate_since = since;
        }
    }

    /// Current rate in bytes per second, decayed to `now`.
    pub fn rate(&mut self, now: Instant) -> f64 {
        self.update(0, now);
        self.rate
    }

    /// Rate as of the last update.
    pub fn rate_noupdate(&self) -> f64 {
        self.rate
    }

    /// Whether no bytes arrived during the last `period`, counting from
    /// creation for an estimator that never saw any.
    pub fn is_idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.active_at) >= self.period
    }

    /// Total bytes accounted so far.
    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Interest transition reported to the wire layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Interested,
    NotInterested,
}

/// Change of our interest in a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterestChange {
    pub peer: PeerId,
    pub interest: Interest,
}

/// Everything the picker knows about one connection.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    pub capabilities: PeerCapabilities,
    pub bitfield: Bitfield,
    /// Pieces the peer holds that we still want
    pub interesting: HashSet<PieceIndex>,
    /// Deadline misses minus successful deliveries, floored at zero
    pub bad_performance: u32,
    /// Pieces failing their hash check that this peer contributed to
    pub hash_failures: u32,
    pub rate: RateEstimator,
    /// Chunk requests committed on this connection and not yet answered
    pub active_requests: HashSet<ChunkRequest>,
    pub choked: bool,
    /// Peer announced or reached a full bitfield and is excluded from counts
    pub is_seed: bool,
}

impl PeerRecord {
    /// Creates a record for a freshly connected peer.
    pub fn new(
        id: PeerId,
        capabilities: PeerCapabilities,
        piece_count: u32,
        rate_period: Duration,
        now: Instant,
    ) -> Self {
        Self {
            id,
            capabilities,
            bitfield: Bitfield::new(piece_count),
            interesting: HashSet::new(),
            bad_performance: 0,
            hash_failures: 0,
            rate: RateEstimator::new(rate_period, now),
            active_requests: HashSet::new(),
            choked: true,
            is_seed: false,
        }
    }

    /// Whether the peer holds `piece`.
    pub fn has(&self, piece: PieceIndex) -> bool {
        self.bitfield.has_piece(piece)
    }

    /// Whether we want anything from this peer.
    pub fn is_interesting(&self) -> bool {
        !self.interesting.is_empty()
    }

    /// Whether deadline misses currently bar the peer from high-range pieces.
    pub fn is_barred(&self) -> bool {
        self.bad_performance > 0
    }

    /// Whether the peer advertised any piece at all.
    pub fn is_empty(&self) -> bool {
        !self.is_seed && self.bitfield.count() == 0
    }

    /// Bytes still in flight on this connection.
    pub fn in_flight_bytes(&self) -> u64 {
        self.active_requests
            .iter()
            .map(|request| u64::from(request.length))
            .sum()
    }
}

/// Table of connected peers keyed by id.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, PeerRecord>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record, returning false if the id is already present.
    pub fn insert(&mut self, record: PeerRecord) -> bool {
        match self.peers.entry(record.id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    pub fn remove(&mut self, id: PeerId) -> Option<PeerRecord> {
        self.peers.remove(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerRecord> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerRecord> {
        self.peers.values_mut()
    }

    /// Peer ids in ascending order, for deterministic scans.
    pub fn ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Connected peers holding at least one piece.
    pub fn nonempty_count(&self) -> usize {
        self.peers.values().filter(|peer| !peer.is_empty()).count()
    }

    /// Connected peers flagged as seeds.
    pub fn seed_count(&self) -> usize {
        self.peers.values().filter(|peer| peer.is_seed).count()
    }
}
