//! Simulated time and seeded randomness.

use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::SimulationError;

/// Largest single step the clock accepts.
const MAX_TIME_ADVANCE: Duration = Duration::from_secs(3600);

/// Clock that only moves when the simulation says so.
///
/// The epoch is taken from the wall clock once; afterwards time is fully
/// controlled by the caller and independent of how fast the host runs.
#[derive(Debug, Clone)]
pub struct DeterministicClock {
    current: Instant,
    start: Instant,
}

impl Default for DeterministicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl DeterministicClock {
    pub fn new() -> Self {
        let start = Instant::now();
        Self {
            current: start,
            start,
        }
    }

    pub fn now(&self) -> Instant {
        self.current
    }

    /// Simulated time since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.current.duration_since(self.start)
    }

    /// Moves time forward by `step`.
    ///
    /// # Errors
    /// - `SimulationError::InvalidTimeStep` - Step longer than an hour
    pub fn advance(&mut self, step: Duration) -> Result<(), SimulationError> {
        if step > MAX_TIME_ADVANCE {
            return Err(SimulationError::InvalidTimeStep {
                reason: format!("{step:?} exceeds {MAX_TIME_ADVANCE:?}"),
            });
        }
        self.current += step;
        Ok(())
    }

    /// Moves time forward to `target`.
    ///
    /// # Errors
    /// - `SimulationError::InvalidTimeStep` - Target lies in the past
    pub fn advance_to(&mut self, target: Instant) -> Result<(), SimulationError> {
        if target < self.current {
            return Err(SimulationError::InvalidTimeStep {
                reason: "cannot move time backwards".to_string(),
            });
        }
        self.current = target;
        Ok(())
    }
}

/// Seeded random source; the same seed replays the same run.
#[derive(Debug)]
pub struct DeterministicRng {
    rng: ChaCha8Rng,
    seed: u64,
}

impl DeterministicRng {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Seed for a dependent generator, such as the picker's.
    pub fn fork(&mut self) -> u64 {
        self.rng.random()
    }

    /// Uniform value in `[0, 1)`.
    pub fn random_f64(&mut self) -> f64 {
        self.rng.random::<f64>()
    }

    /// Uniform value in `[min, max)`; `min` when the range is empty.
    pub fn random_range(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        self.rng.random_range(min..max)
    }

    pub fn random_bool(&mut self, probability: f64) -> bool {
        self.random_f64() < probability
    }

    pub fn shuffle<T>(&mut self, slice: &mut [T]) {
        use rand::seq::SliceRandom;
        slice.shuffle(&mut self.rng);
    }
}
