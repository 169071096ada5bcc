//! Single-threaded reactor driving a streaming session.
//!
//! The session runs inside one tokio task. Wire-layer events and playback
//! control arrive as commands through [`ReactorHandle`]; periodic tasks run
//! between commands, so no session state is ever shared.

pub mod actor;
pub mod commands;
pub mod handle;

pub use actor::spawn_reactor;
pub use commands::{PickRequest, ReactorCommand};
pub use handle::ReactorHandle;

use crate::piece::PieceError;
use crate::transport::TransportError;

/// Errors returned through a [`ReactorHandle`].
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("Reactor has shut down")]
    Shutdown,

    #[error("Piece error: {0}")]
    Piece(#[from] PieceError),

    #[error("Playback error: {0}")]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::{PickerConfig, StreamDescriptor};
    use crate::monitor::CancelRequest;
    use crate::peer::{PeerCapabilities, PeerId};
    use crate::piece::{ChunkRequest, PieceIndex};
    use crate::session::StreamingSession;
    use crate::transport::{PieceSource, PlaybackState, VodEvent};

    const PIECE: u32 = 16_384;

    #[derive(Default)]
    struct Store(Mutex<HashMap<PieceIndex, Bytes>>);

    impl PieceSource for Store {
        fn piece_data(&self, piece: PieceIndex) -> Option<Bytes> {
            self.0.lock().get(&piece).cloned()
        }
    }

    struct Running {
        handle: ReactorHandle,
        store: Arc<Store>,
        events: mpsc::UnboundedReceiver<VodEvent>,
        cancels: mpsc::UnboundedReceiver<Vec<CancelRequest>>,
    }

    fn spawn(pieces: u32) -> Running {
        let store = Arc::new(Store::default());
        let (events_tx, events) = mpsc::unbounded_channel();
        let (cancel_tx, cancels) = mpsc::unbounded_channel();
        let descriptor = StreamDescriptor::vod(PIECE, pieces).with_bitrate(65_536);
        let session = StreamingSession::new(
            &descriptor,
            PickerConfig::for_testing(),
            store.clone(),
            events_tx,
            tokio::time::Instant::now().into_std(),
        )
        .unwrap();
        Running {
            handle: spawn_reactor(session, cancel_tx),
            store,
            events,
            cancels,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_starts_from_refill_tick() {
        let mut running = spawn(8);
        for piece in 0..8 {
            running
                .store
                .0
                .lock()
                .insert(PieceIndex(piece), Bytes::from(vec![0u8; PIECE as usize]));
            running.handle.piece_complete(PieceIndex(piece)).await.unwrap();
        }
        running.handle.start_playback(0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let snapshot = running.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, PlaybackState::Playing);
        assert_eq!(snapshot.transport.pieces_pushed, 8);
        assert!(matches!(
            running.events.recv().await,
            Some(VodEvent::Start { complete: true, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_request_cancelled_by_deadline_task() {
        let mut running = spawn(50);
        let peer = PeerId(7);
        running
            .handle
            .peer_connected(peer, PeerCapabilities::default())
            .await
            .unwrap();
        running.handle.have(peer, PieceIndex(0)).await.unwrap();
        let request = ChunkRequest::new(PieceIndex(0), 0, PIECE);
        running.handle.request_committed(peer, request).await.unwrap();

        // buffering thresholds: nothing happens before 7.5 s
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(running.cancels.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let batch = running.cancels.recv().await.unwrap();
        assert_eq!(batch, vec![CancelRequest { peer, request }]);

        let snapshot = running.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.outstanding_requests, 0);
        assert_eq!(snapshot.monitor.stalled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_travel_back_through_handle() {
        let running = spawn(10);
        let result = running.handle.have(PeerId(1), PieceIndex(0)).await;
        assert!(matches!(
            result,
            Err(ReactorError::Piece(PieceError::UnknownPeer { .. }))
        ));
        running.handle.start_playback(0).await.unwrap();
        assert!(matches!(
            running.handle.start_playback(0).await,
            Err(ReactorError::Transport(TransportError::InvalidState { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_handle() {
        let running = spawn(10);
        running.handle.shutdown().await.unwrap();
        tokio::task::yield_now().await;
        assert!(matches!(
            running.handle.snapshot().await,
            Err(ReactorError::Shutdown)
        ));
        assert!(!running.handle.is_running());
    }
}
