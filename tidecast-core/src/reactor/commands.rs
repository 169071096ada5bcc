//! Command definitions for the reactor actor.

use std::collections::HashSet;

use tokio::sync::oneshot;

use crate::peer::{InterestChange, PeerCapabilities, PeerId};
use crate::picker::PickOptions;
use crate::piece::{Bitfield, ChunkRequest, PieceError, PieceIndex};
use crate::session::SessionSnapshot;
use crate::transport::TransportError;

type Reply<T> = oneshot::Sender<T>;
type PieceReply<T> = oneshot::Sender<Result<T, PieceError>>;

/// Owned form of [`PickOptions`] that can cross the command channel.
#[derive(Debug, Clone)]
pub struct PickRequest {
    /// Only these pieces may be returned, when set
    pub want: Option<HashSet<PieceIndex>>,
    pub complete_first: bool,
    pub slow_pieces: HashSet<PieceIndex>,
    pub will_request: bool,
}

impl Default for PickRequest {
    fn default() -> Self {
        Self {
            want: None,
            complete_first: false,
            slow_pieces: HashSet::new(),
            will_request: true,
        }
    }
}

impl PickRequest {
    /// Borrows the request as picker options; `want` adapts the piece set.
    pub fn as_options<'a>(&'a self, want: &'a dyn Fn(PieceIndex) -> bool) -> PickOptions<'a> {
        PickOptions {
            want: self.want.as_ref().map(|_| want),
            complete_first: self.complete_first,
            slow_pieces: Some(&self.slow_pieces),
            will_request: self.will_request,
        }
    }
}

/// Commands processed one at a time by the reactor.
///
/// Each command carries the channel its result is sent back on, so the
/// session state is never shared or locked.
pub enum ReactorCommand {
    PeerConnected {
        peer: PeerId,
        capabilities: PeerCapabilities,
        responder: Reply<bool>,
    },
    Have {
        peer: PeerId,
        piece: PieceIndex,
        responder: PieceReply<Vec<InterestChange>>,
    },
    Bitfield {
        peer: PeerId,
        bitfield: Bitfield,
        responder: PieceReply<Vec<InterestChange>>,
    },
    Seed {
        peer: PeerId,
        responder: PieceReply<Vec<InterestChange>>,
    },
    Choke {
        peer: PeerId,
        choked: bool,
        responder: PieceReply<()>,
    },
    LostPeer {
        peer: PeerId,
        responder: PieceReply<()>,
    },
    RequestCommitted {
        peer: PeerId,
        request: ChunkRequest,
        responder: PieceReply<()>,
    },
    ChunkReceived {
        peer: PeerId,
        request: ChunkRequest,
        responder: PieceReply<()>,
    },
    BytesDownloaded {
        peer: PeerId,
        bytes: u64,
        responder: PieceReply<()>,
    },
    PieceComplete {
        piece: PieceIndex,
        responder: PieceReply<Vec<InterestChange>>,
    },
    PieceFailedHash {
        piece: PieceIndex,
        responder: PieceReply<Vec<PeerId>>,
    },
    PickNext {
        peer: PeerId,
        request: PickRequest,
        responder: PieceReply<Option<PieceIndex>>,
    },
    SetPriority {
        piece: PieceIndex,
        priority: i32,
        responder: PieceReply<Vec<InterestChange>>,
    },
    StartPlayback {
        byte_pos: u64,
        responder: Reply<Result<(), TransportError>>,
    },
    StopPlayback {
        responder: Reply<()>,
    },
    Pause {
        responder: Reply<Result<(), TransportError>>,
    },
    Resume {
        responder: Reply<Result<(), TransportError>>,
    },
    SetBitrate {
        bytes_per_second: f64,
        responder: Reply<()>,
    },
    Snapshot {
        responder: Reply<SessionSnapshot>,
    },
    Shutdown {
        responder: Reply<()>,
    },
}

impl ReactorCommand {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PeerConnected { .. } => "peer_connected",
            Self::Have { .. } => "have",
            Self::Bitfield { .. } => "bitfield",
            Self::Seed { .. } => "seed",
            Self::Choke { .. } => "choke",
            Self::LostPeer { .. } => "lost_peer",
            Self::RequestCommitted { .. } => "request_committed",
            Self::ChunkReceived { .. } => "chunk_received",
            Self::BytesDownloaded { .. } => "bytes_downloaded",
            Self::PieceComplete { .. } => "piece_complete",
            Self::PieceFailedHash { .. } => "piece_failed_hash",
            Self::PickNext { .. } => "pick_next",
            Self::SetPriority { .. } => "set_priority",
            Self::StartPlayback { .. } => "start_playback",
            Self::StopPlayback { .. } => "stop_playback",
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::SetBitrate { .. } => "set_bitrate",
            Self::Snapshot { .. } => "snapshot",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}
