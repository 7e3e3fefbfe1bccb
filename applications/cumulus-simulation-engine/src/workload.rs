//! Synthetic request streams
//!
//! Scenario input for the binary: a seeded random stream of request
//! arrivals. The same seed always yields the same stream, so two runs of
//! the same scenario are bit-for-bit comparable.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::capacity::Capacity;
use crate::clock::SimTime;
use crate::model::RequestId;

/// One planned arrival, ready to hand to the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArrivalPlan {
    pub request: RequestId,
    pub at: SimTime,
    pub demand: Capacity,
}

/// Shape of the generated stream.
#[derive(Debug, Clone, Copy)]
pub struct GeneratorConfig {
    pub seed: u64,
    /// Inter-arrival gap is drawn from `1..=max_gap` ticks.
    pub max_gap: SimTime,
    /// Demand CPU is drawn from `1..=max_cores`.
    pub max_cores: u64,
    /// Memory units granted per requested core.
    pub memory_per_core: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig { seed: 42, max_gap: 10, max_cores: 4, memory_per_core: 1024 }
    }
}

/// Deterministic request generator over a seeded RNG.
pub struct RequestGenerator {
    rng: StdRng,
    config: GeneratorConfig,
    next_id: u64,
    at: SimTime,
}

impl RequestGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        RequestGenerator {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            next_id: 0,
            at: 0,
        }
    }

    /// Draw the next arrival. Arrival times are strictly increasing.
    pub fn next_arrival(&mut self) -> ArrivalPlan {
        let gap = self.rng.gen_range(1..=self.config.max_gap.max(1));
        self.at = self.at.saturating_add(gap);
        let cores = self.rng.gen_range(1..=self.config.max_cores.max(1));
        let id = RequestId(self.next_id);
        self.next_id += 1;
        ArrivalPlan {
            request: id,
            at: self.at,
            demand: Capacity::new(cores, cores * self.config.memory_per_core, 0, 0),
        }
    }

    /// Draw a whole stream at once.
    pub fn arrivals(&mut self, count: usize) -> Vec<ArrivalPlan> {
        (0..count).map(|_| self.next_arrival()).collect()
    }
}
