//! Handle for communicating with the reactor actor.

use tokio::sync::{mpsc, oneshot};

use super::ReactorError;
use super::commands::{PickRequest, ReactorCommand};
use crate::peer::{InterestChange, PeerCapabilities, PeerId};
use crate::piece::{Bitfield, ChunkRequest, PieceIndex};
use crate::session::SessionSnapshot;

/// Cloneable async front end of a running reactor.
///
/// Every call queues a command and waits for the reactor to answer. Once
/// the reactor has stopped, calls fail with `ReactorError::Shutdown`.
#[derive(Clone, Debug)]
pub struct ReactorHandle {
    sender: mpsc::Sender<ReactorCommand>,
}

impl ReactorHandle {
    pub fn new(sender: mpsc::Sender<ReactorCommand>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ReactorCommand,
    ) -> Result<T, ReactorError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(build(responder))
            .await
            .map_err(|_| ReactorError::Shutdown)?;
        rx.await.map_err(|_| ReactorError::Shutdown)
    }

    /// Registers a connection. Returns false if the id is taken.
    ///
    /// # Errors
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn peer_connected(
        &self,
        peer: PeerId,
        capabilities: PeerCapabilities,
    ) -> Result<bool, ReactorError> {
        self.request(|responder| ReactorCommand::PeerConnected {
            peer,
            capabilities,
            responder,
        })
        .await
    }

    /// # Errors
    /// - `ReactorError::Piece` - Unknown peer or index out of range
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn have(
        &self,
        peer: PeerId,
        piece: PieceIndex,
    ) -> Result<Vec<InterestChange>, ReactorError> {
        Ok(self
            .request(|responder| ReactorCommand::Have {
                peer,
                piece,
                responder,
            })
            .await??)
    }

    /// # Errors
    /// - `ReactorError::Piece` - Unknown peer or bitfield of the wrong length
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn bitfield(
        &self,
        peer: PeerId,
        bitfield: Bitfield,
    ) -> Result<Vec<InterestChange>, ReactorError> {
        Ok(self
            .request(|responder| ReactorCommand::Bitfield {
                peer,
                bitfield,
                responder,
            })
            .await??)
    }

    /// # Errors
    /// - `ReactorError::Piece` - Unknown peer
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn seed(&self, peer: PeerId) -> Result<Vec<InterestChange>, ReactorError> {
        Ok(self
            .request(|responder| ReactorCommand::Seed { peer, responder })
            .await??)
    }

    /// # Errors
    /// - `ReactorError::Piece` - Unknown peer
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn set_choked(&self, peer: PeerId, choked: bool) -> Result<(), ReactorError> {
        Ok(self
            .request(|responder| ReactorCommand::Choke {
                peer,
                choked,
                responder,
            })
            .await??)
    }

    /// # Errors
    /// - `ReactorError::Piece` - Unknown peer
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn lost_peer(&self, peer: PeerId) -> Result<(), ReactorError> {
        Ok(self
            .request(|responder| ReactorCommand::LostPeer { peer, responder })
            .await??)
    }

    /// # Errors
    /// - `ReactorError::Piece` - Unknown peer or request outside its piece
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn request_committed(
        &self,
        peer: PeerId,
        request: ChunkRequest,
    ) -> Result<(), ReactorError> {
        Ok(self
            .request(|responder| ReactorCommand::RequestCommitted {
                peer,
                request,
                responder,
            })
            .await??)
    }

    /// # Errors
    /// - `ReactorError::Piece` - Unknown peer or chunk outside its piece
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn chunk_received(
        &self,
        peer: PeerId,
        request: ChunkRequest,
    ) -> Result<(), ReactorError> {
        Ok(self
            .request(|responder| ReactorCommand::ChunkReceived {
                peer,
                request,
                responder,
            })
            .await??)
    }

    /// # Errors
    /// - `ReactorError::Piece` - Unknown peer
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn bytes_downloaded(&self, peer: PeerId, bytes: u64) -> Result<(), ReactorError> {
        Ok(self
            .request(|responder| ReactorCommand::BytesDownloaded {
                peer,
                bytes,
                responder,
            })
            .await??)
    }

    /// # Errors
    /// - `ReactorError::Piece` - Index out of range
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn piece_complete(
        &self,
        piece: PieceIndex,
    ) -> Result<Vec<InterestChange>, ReactorError> {
        Ok(self
            .request(|responder| ReactorCommand::PieceComplete { piece, responder })
            .await??)
    }

    /// Returns the peers that contributed chunks of the failed piece.
    ///
    /// # Errors
    /// - `ReactorError::Piece` - Index out of range
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn piece_failed_hash(&self, piece: PieceIndex) -> Result<Vec<PeerId>, ReactorError> {
        Ok(self
            .request(|responder| ReactorCommand::PieceFailedHash { piece, responder })
            .await??)
    }

    /// # Errors
    /// - `ReactorError::Piece` - Unknown peer
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn pick_next(
        &self,
        peer: PeerId,
        request: PickRequest,
    ) -> Result<Option<PieceIndex>, ReactorError> {
        Ok(self
            .request(|responder| ReactorCommand::PickNext {
                peer,
                request,
                responder,
            })
            .await??)
    }

    /// # Errors
    /// - `ReactorError::Piece` - Index out of range or invalid priority
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn set_priority(
        &self,
        piece: PieceIndex,
        priority: i32,
    ) -> Result<Vec<InterestChange>, ReactorError> {
        Ok(self
            .request(|responder| ReactorCommand::SetPriority {
                piece,
                priority,
                responder,
            })
            .await??)
    }

    /// Starts playback at `byte_pos` of the file.
    ///
    /// # Errors
    /// - `ReactorError::Transport` - Already playing or position past the file
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn start_playback(&self, byte_pos: u64) -> Result<(), ReactorError> {
        Ok(self
            .request(|responder| ReactorCommand::StartPlayback {
                byte_pos,
                responder,
            })
            .await??)
    }

    /// # Errors
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn stop_playback(&self) -> Result<(), ReactorError> {
        self.request(|responder| ReactorCommand::StopPlayback { responder })
            .await
    }

    /// # Errors
    /// - `ReactorError::Transport` - Not playing
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn pause(&self) -> Result<(), ReactorError> {
        Ok(self
            .request(|responder| ReactorCommand::Pause { responder })
            .await??)
    }

    /// # Errors
    /// - `ReactorError::Transport` - Not paused
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn resume(&self) -> Result<(), ReactorError> {
        Ok(self
            .request(|responder| ReactorCommand::Resume { responder })
            .await??)
    }

    /// Reports the bitrate found by a media analyser.
    ///
    /// # Errors
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn set_bitrate(&self, bytes_per_second: f64) -> Result<(), ReactorError> {
        self.request(|responder| ReactorCommand::SetBitrate {
            bytes_per_second,
            responder,
        })
        .await
    }

    /// # Errors
    /// - `ReactorError::Shutdown` - Reactor stopped
    pub async fn snapshot(&self) -> Result<SessionSnapshot, ReactorError> {
        self.request(|responder| ReactorCommand::Snapshot { responder })
            .await
    }

    /// Stops the reactor and waits for it to acknowledge.
    ///
    /// # Errors
    /// - `ReactorError::Shutdown` - Reactor already stopped
    pub async fn shutdown(&self) -> Result<(), ReactorError> {
        self.request(|responder| ReactorCommand::Shutdown { responder })
            .await
    }

    /// Whether the reactor still accepts commands.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}
