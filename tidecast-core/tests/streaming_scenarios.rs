//! End-to-end scenarios for the streaming picker.
//!
//! Each test drives the public API the way a wire layer would: peers
//! announce pieces, pieces complete, and the picker, monitor and transporter
//! react.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tidecast_core::{
    Bitfield, PeerCapabilities, PeerId, PickOptions, PickerConfig, PieceIndex, PiecePicker,
    PieceSource, PlaybackState, StreamDescriptor, StreamingSession, VideoStatus, VodEvent,
};
use tokio::sync::mpsc;

const PIECE: u32 = 16_384;

#[derive(Default)]
struct MemoryStore(Mutex<HashMap<PieceIndex, Bytes>>);

impl MemoryStore {
    fn store(&self, piece: PieceIndex) {
        self.0
            .lock()
            .insert(piece, Bytes::from(vec![piece.as_u32() as u8; PIECE as usize]));
    }
}

impl PieceSource for MemoryStore {
    fn piece_data(&self, piece: PieceIndex) -> Option<Bytes> {
        self.0.lock().get(&piece).cloned()
    }
}

fn seeded(seed: u64) -> PickerConfig {
    PickerConfig {
        rng_seed: Some(seed),
        ..PickerConfig::default()
    }
}

fn bulk_video(pieces: u32) -> VideoStatus {
    VideoStatus::new(
        &StreamDescriptor::bulk(PIECE, pieces),
        &PickerConfig::default(),
    )
    .unwrap()
}

fn connect(picker: &mut PiecePicker, id: u64, bits: &str, now: Instant) -> PeerId {
    let peer = PeerId(id);
    assert!(picker.add_peer(peer, PeerCapabilities::default(), now));
    picker
        .got_bitfield(peer, &Bitfield::from_bit_str(bits))
        .unwrap();
    peer
}

#[test]
fn test_bulk_picks_piece_with_single_holder() {
    let now = Instant::now();
    let video = bulk_video(5);
    for seed in 0..20 {
        let mut picker = PiecePicker::new(5, seeded(seed)).unwrap();
        let first = connect(&mut picker, 1, "11110", now);
        connect(&mut picker, 2, "11100", now);
        connect(&mut picker, 3, "11000", now);
        connect(&mut picker, 4, "10000", now);
        assert_eq!(
            picker.pick(first, &video, &PickOptions::default()).unwrap(),
            Some(PieceIndex(3))
        );
    }
}

#[test]
fn test_rarest_ties_are_broken_uniformly() {
    const TRIALS: u64 = 1000;
    // 99.9th percentile of chi-square with two degrees of freedom
    const CHI_SQUARE_LIMIT: f64 = 13.82;

    let now = Instant::now();
    let video = bulk_video(6);
    let mut counts: HashMap<PieceIndex, u64> = HashMap::new();
    for seed in 0..TRIALS {
        let mut picker = PiecePicker::new(6, seeded(seed)).unwrap();
        let peer = connect(&mut picker, 1, "111110", now);
        connect(&mut picker, 2, "110000", now);
        let piece = picker
            .pick(peer, &video, &PickOptions::default())
            .unwrap()
            .unwrap();
        *counts.entry(piece).or_default() += 1;
    }

    let singles = [PieceIndex(2), PieceIndex(3), PieceIndex(4)];
    assert_eq!(counts.values().sum::<u64>(), TRIALS);
    assert!(counts.keys().all(|piece| singles.contains(piece)));
    let expected = TRIALS as f64 / singles.len() as f64;
    let chi_square: f64 = singles
        .iter()
        .map(|piece| {
            let observed = *counts.get(piece).unwrap_or(&0) as f64;
            (observed - expected).powi(2) / expected
        })
        .sum();
    assert!(
        chi_square < CHI_SQUARE_LIMIT,
        "chi-square {chi_square} over {counts:?}"
    );
}

#[test]
fn test_vod_prebuffer_fires_start_once() {
    let start = Instant::now();
    let store = Arc::new(MemoryStore::default());
    let (events_tx, mut events) = mpsc::unbounded_channel();
    // 512 Kbit/s over 16 KiB pieces: ten seconds is forty pieces
    let descriptor = StreamDescriptor::vod(PIECE, 100).with_bitrate(65_536);
    let mut session = StreamingSession::new(
        &descriptor,
        PickerConfig::for_testing(),
        store.clone(),
        events_tx,
        start,
    )
    .unwrap();
    assert_eq!(session.video().prebuffer_pieces(), 40);

    session.start_playback(0, start).unwrap();
    let mut transitions = 0;
    let mut previous = session.snapshot().state;
    assert_eq!(previous, PlaybackState::Prebuffering);

    for piece in 0..40 {
        let now = start + Duration::from_millis(100 * (u64::from(piece) + 1));
        store.store(PieceIndex(piece));
        session.on_piece_complete(PieceIndex(piece), now).unwrap();
        session.refill(now).unwrap();

        let state = session.snapshot().state;
        if previous == PlaybackState::Prebuffering && state == PlaybackState::Playing {
            transitions += 1;
        }
        if piece < 39 {
            assert_eq!(state, PlaybackState::Prebuffering, "piece {piece}");
        }
        previous = state;
    }
    assert_eq!(previous, PlaybackState::Playing);

    for tick in 1..=5 {
        session
            .refill(start + Duration::from_millis(4000 + 100 * tick))
            .unwrap();
    }
    assert_eq!(transitions, 1);

    let mut starts = 0;
    while let Ok(event) = events.try_recv() {
        if let VodEvent::Start {
            complete, length, ..
        } = event
        {
            assert!(!complete);
            assert_eq!(length, Some(100 * u64::from(PIECE)));
            starts += 1;
        }
    }
    assert_eq!(starts, 1);
}

#[test]
fn test_barred_peer_waits_for_better_peer_to_leave() {
    let now = Instant::now();
    let config = PickerConfig::for_testing();
    let mut video = VideoStatus::new(
        &StreamDescriptor::vod(PIECE, 50).with_bitrate(65_536),
        &config,
    )
    .unwrap();
    video.set_playing(true);
    let mut picker = PiecePicker::new(50, config).unwrap();

    let mut bits = "0".repeat(50);
    bits.replace_range(0..1, "1");
    let good = connect(&mut picker, 1, &bits, now);
    let slow = connect(&mut picker, 2, &bits, now);
    picker.peer_mut(slow).unwrap().bad_performance = 2;

    let wanted = PieceIndex(0);
    assert!(video.in_high_range(wanted));
    assert_eq!(
        picker.pick(slow, &video, &PickOptions::default()).unwrap(),
        None
    );
    assert_eq!(
        picker.pick(good, &video, &PickOptions::default()).unwrap(),
        Some(wanted)
    );

    picker.lost_peer(good).unwrap();
    assert_eq!(
        picker.pick(slow, &video, &PickOptions::default()).unwrap(),
        Some(wanted)
    );
}

#[test]
fn test_seed_arrival_keeps_counts_and_order() {
    let now = Instant::now();
    let video = bulk_video(10);
    let mut picker = PiecePicker::new(10, PickerConfig::for_testing()).unwrap();
    let holder = connect(&mut picker, 1, "0000000100", now);
    let wide = connect(&mut picker, 2, "1111000100", now);

    let seven = PieceIndex(7);
    assert_eq!(picker.index().holders(seven), 2);
    assert_eq!(picker.index().interest_value(seven), Some(2));
    let cutoff = picker.priority_cutoff();
    let levels = picker.index().levels().to_vec();
    let before: Vec<_> = [holder, wide]
        .iter()
        .map(|&peer| picker.pick(peer, &video, &PickOptions::default()).unwrap())
        .collect();

    let seed = PeerId(3);
    picker.add_peer(seed, PeerCapabilities::default(), now);
    picker.got_seed(seed).unwrap();

    assert_eq!(picker.index().seeds(), 1);
    assert_eq!(picker.index().holders(seven), 2);
    assert_eq!(picker.priority_cutoff(), cutoff - 1);
    assert_eq!(picker.index().levels(), levels.as_slice());
    let after: Vec<_> = [holder, wide]
        .iter()
        .map(|&peer| picker.pick(peer, &video, &PickOptions::default()).unwrap())
        .collect();
    assert_eq!(before, after);
    picker.index().check_consistency().unwrap();
}

#[test]
fn test_seed_bitfield_is_not_counted() {
    let now = Instant::now();
    let mut picker = PiecePicker::new(8, PickerConfig::for_testing()).unwrap();
    connect(&mut picker, 1, "00000010", now);
    let seed = connect(&mut picker, 2, "11111111", now);
    assert!(picker.peer(seed).unwrap().is_seed);
    assert_eq!(picker.index().holders(PieceIndex(6)), 1);
    assert_eq!(picker.index().seeds(), 1);

    picker.lost_peer(seed).unwrap();
    assert_eq!(picker.index().seeds(), 0);
    assert_eq!(picker.index().holders(PieceIndex(6)), 1);
    picker.index().check_consistency().unwrap();
}
