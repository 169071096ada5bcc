//! Notifications sent to the player host.

use super::stream::PlayerStream;

/// Player lifecycle events, delivered over an unbounded channel.
#[derive(Debug)]
pub enum VodEvent {
    /// Prebuffering finished; fired once per session
    Start {
        /// Whole file already present locally
        complete: bool,
        filename: Option<String>,
        mimetype: String,
        stream: PlayerStream,
        /// File length; `None` for live streams
        length: Option<u64>,
        /// Bytes per second
        bitrate: f64,
    },
    /// Playback halted for lack of data
    Pause { autoresume: bool },
    Resume,
}

impl VodEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Pause { .. } => "pause",
            Self::Resume => "resume",
        }
    }
}
