//! Tidecast Simulation - deterministic swarms for the streaming picker
//!
//! A [`StreamingSimulation`] wires one [`tidecast_core::StreamingSession`]
//! to simulated neighbours, a simulated player and, for live streams, a
//! simulated source. Time only moves when the simulation steps, and all
//! randomness flows from one seed, so a failing run can be replayed exactly.
//!
//! After every phase of a step the registered [`Invariant`]s inspect the
//! session; violations are collected in the [`SimulationReport`].
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use tidecast_core::StreamDescriptor;
//! use tidecast_sim::{PeerSpec, SimulationConfig, StreamingSimulation};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let descriptor = StreamDescriptor::vod(16_384, 400).with_bitrate(65_536);
//! let peers = vec![PeerSpec::new(48 * 1024, 0.8); 6];
//! let mut sim = StreamingSimulation::new(SimulationConfig::vod(7, descriptor, peers))?;
//! let report = sim.run_for(Duration::from_secs(60))?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod invariants;
pub mod simulation;
pub mod swarm;

pub use clock::{DeterministicClock, DeterministicRng};
pub use invariants::{
    AutoresumeInvariant, BarredPeerInvariant, CheckPhase, IndexConsistencyInvariant, Invariant,
    InvariantViolation, LiveWindowInvariant, OutputOrderInvariant, PickRecord, SimulationView,
    default_invariants,
};
pub use simulation::{
    LiveSourceConfig, SimulationConfig, SimulationError, SimulationReport, StreamingSimulation,
};
pub use swarm::{PeerSpec, SimPeer, SimStore};
