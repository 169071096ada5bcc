//! Tidecast Core - streaming piece selection for peer-to-peer video
//!
//! This crate decides which piece to request from which peer so that a video
//! plays back without stalls, cancels requests that will miss their playback
//! deadline, and hands completed pieces to a player in order. It covers
//! on-demand files and live streams with a circular piece space.

pub mod config;
pub mod live;
pub mod monitor;
pub mod peer;
pub mod picker;
pub mod piece;
pub mod reactor;
pub mod session;
pub mod stats;
pub mod tracing_setup;
pub mod transport;
pub mod video;

// Re-export main types for convenient access
pub use config::{ConfigError, DelayThresholds, PickerConfig, StreamDescriptor, StreamMode};
pub use live::HookOutcome;
pub use monitor::{CancelRequest, RequestMonitor, WireSink};
pub use peer::{Interest, InterestChange, PeerCapabilities, PeerId};
pub use picker::{InterestIndex, PickOptions, PiecePicker};
pub use piece::{Bitfield, ChunkRequest, PieceError, PieceIndex};
pub use reactor::{PickRequest, ReactorError, ReactorHandle, spawn_reactor};
pub use session::{SessionSnapshot, StreamingSession};
pub use stats::{MonitorStats, PickStage, PickStats, TransportStats};
pub use tracing_setup::{TracingError, init_tracing};
pub use transport::{
    BufferTransporter, PieceSource, PlaybackState, PlayerStream, TransportError, VodEvent,
};
pub use video::{BitrateSource, VideoStatus};

/// Errors that can bubble up from any Tidecast subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TidecastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Piece error: {0}")]
    Piece(#[from] PieceError),

    #[error("Playback error: {0}")]
    Transport(#[from] TransportError),

    #[error("Reactor error: {0}")]
    Reactor(#[from] ReactorError),

    #[error("Tracing error: {0}")]
    Tracing(#[from] TracingError),
}

impl TidecastError {
    /// Checks if this error is due to caller input rather than session state.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TidecastError::Config(_)
                | TidecastError::Piece(_)
                | TidecastError::Transport(TransportError::SeekPastEnd { .. })
                | TidecastError::Reactor(ReactorError::Piece(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, TidecastError>;
