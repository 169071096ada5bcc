//! Actor implementation of the streaming reactor.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::commands::ReactorCommand;
use super::handle::ReactorHandle;
use crate::live::HookOutcome;
use crate::monitor::WireSink;
use crate::piece::PieceIndex;
use crate::session::StreamingSession;

/// Period of the request monitor scan.
const DEADLINE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Period of hook-in, autoresume and rate housekeeping.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Spawns the reactor for `session` and returns its handle.
///
/// The reactor owns the session and the wire sink. It processes commands in
/// arrival order and runs the periodic tasks between them: deadline checks,
/// output refills, and once a second the live hook-in, autoresume and rate
/// measurement.
pub fn spawn_reactor<W>(session: StreamingSession, wire: W) -> ReactorHandle
where
    W: WireSink + 'static,
{
    let (sender, receiver) = mpsc::channel(256);
    tokio::spawn(async move {
        run_actor_loop(session, wire, receiver).await;
    });
    ReactorHandle::new(sender)
}

async fn run_actor_loop<W: WireSink>(
    mut session: StreamingSession,
    mut wire: W,
    mut receiver: mpsc::Receiver<ReactorCommand>,
) {
    debug!("Streaming reactor started");

    let refill_period = session.picker().config().refill_interval();
    let mut deadline_check = time::interval(DEADLINE_CHECK_INTERVAL);
    let mut refill = time::interval(refill_period);
    let mut housekeeping = time::interval(HOUSEKEEPING_INTERVAL);
    for interval in [&mut deadline_check, &mut refill, &mut housekeeping] {
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    loop {
        tokio::select! {
            command = receiver.recv() => {
                let Some(command) = command else {
                    break;
                };
                if !handle_command(&mut session, command) {
                    break;
                }
            }
            _ = deadline_check.tick() => {
                session.check_deadlines(&mut wire, now());
            }
            _ = refill.tick() => {
                match session.refill(now()) {
                    Ok(outcome) if !outcome.interest_changes.is_empty() => {
                        wire.interest_changed(&outcome.interest_changes);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Refill failed"),
                }
            }
            _ = housekeeping.tick() => {
                housekeeping_tick(&mut session, &mut wire);
            }
        }
    }

    session.stop_playback();
    debug!("Streaming reactor stopped");
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

fn housekeeping_tick<W: WireSink>(session: &mut StreamingSession, wire: &mut W) {
    let now = now();
    session.tick_second(now);
    match session.live_hook() {
        Ok(HookOutcome::HookedIn {
            interest_changes, ..
        }) if !interest_changes.is_empty() => wire.interest_changed(&interest_changes),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Live hook-in failed"),
    }
    session.autoresume(now);
}

/// Handles a single command. Returns false to shut down.
fn handle_command(session: &mut StreamingSession, command: ReactorCommand) -> bool {
    let now = now();
    tracing::trace!(command = command.name(), "Reactor command");
    match command {
        ReactorCommand::PeerConnected {
            peer,
            capabilities,
            responder,
        } => {
            let _ = responder.send(session.on_peer_connected(peer, capabilities, now));
        }
        ReactorCommand::Have {
            peer,
            piece,
            responder,
        } => {
            let _ = responder.send(session.on_have(peer, piece));
        }
        ReactorCommand::Bitfield {
            peer,
            bitfield,
            responder,
        } => {
            let _ = responder.send(session.on_bitfield(peer, &bitfield));
        }
        ReactorCommand::Seed { peer, responder } => {
            let _ = responder.send(session.on_seed(peer));
        }
        ReactorCommand::Choke {
            peer,
            choked,
            responder,
        } => {
            let result = if choked {
                session.on_choke(peer)
            } else {
                session.on_unchoke(peer)
            };
            let _ = responder.send(result);
        }
        ReactorCommand::LostPeer { peer, responder } => {
            let _ = responder.send(session.on_lost_peer(peer));
        }
        ReactorCommand::RequestCommitted {
            peer,
            request,
            responder,
        } => {
            let _ = responder.send(session.on_request_committed(peer, request, now));
        }
        ReactorCommand::ChunkReceived {
            peer,
            request,
            responder,
        } => {
            let _ = responder.send(session.on_chunk_received(peer, request));
        }
        ReactorCommand::BytesDownloaded {
            peer,
            bytes,
            responder,
        } => {
            let _ = responder.send(session.on_bytes_downloaded(peer, bytes, now));
        }
        ReactorCommand::PieceComplete { piece, responder } => {
            let _ = responder.send(session.on_piece_complete(piece, now));
        }
        ReactorCommand::PieceFailedHash { piece, responder } => {
            let _ = responder.send(session.on_piece_failed_hash(piece));
        }
        ReactorCommand::PickNext {
            peer,
            request,
            responder,
        } => {
            let want = |piece: PieceIndex| {
                request
                    .want
                    .as_ref()
                    .is_none_or(|pieces| pieces.contains(&piece))
            };
            let options = request.as_options(&want);
            let _ = responder.send(session.pick_next(peer, &options));
        }
        ReactorCommand::SetPriority {
            piece,
            priority,
            responder,
        } => {
            let _ = responder.send(session.set_priority(piece, priority));
        }
        ReactorCommand::StartPlayback {
            byte_pos,
            responder,
        } => {
            let _ = responder.send(session.start_playback(byte_pos, now));
        }
        ReactorCommand::StopPlayback { responder } => {
            session.stop_playback();
            let _ = responder.send(());
        }
        ReactorCommand::Pause { responder } => {
            let _ = responder.send(session.pause(now));
        }
        ReactorCommand::Resume { responder } => {
            let _ = responder.send(session.resume(now));
        }
        ReactorCommand::SetBitrate {
            bytes_per_second,
            responder,
        } => {
            session.set_bitrate(bytes_per_second);
            let _ = responder.send(());
        }
        ReactorCommand::Snapshot { responder } => {
            let _ = responder.send(session.snapshot());
        }
        ReactorCommand::Shutdown { responder } => {
            let _ = responder.send(());
            return false;
        }
    }
    true
}
