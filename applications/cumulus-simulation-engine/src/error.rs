//! Error types for the simulation engine

use thiserror::Error;

use crate::bus::Topic;
use crate::capacity::Capacity;
use crate::clock::SimTime;

/// Simulation result type
pub type Result<T> = std::result::Result<T, SimulationError>;

/// Errors that can occur while driving a simulation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    /// Requested allocation exceeds the host's free capacity
    #[error("insufficient capacity: requested [{requested}] but only [{free}] free")]
    Capacity { requested: Capacity, free: Capacity },

    /// Placement found no host able to fit the demand
    #[error("no feasible host for demand [{demand}]")]
    NoFeasibleHost { demand: Capacity },

    /// Operation attempted against an entity in an incompatible state
    #[error("invalid state transition: cannot {op} {entity} in state {state}")]
    InvalidStateTransition {
        entity: String,
        state: &'static str,
        op: &'static str,
    },

    /// Attempt to schedule an event strictly before the current simulated time
    #[error("causality violation: requested time {requested} is before current time {now}")]
    CausalityViolation { now: SimTime, requested: SimTime },

    /// Publish to a topic with no registered subscriber (strict mode only)
    #[error("no subscriber registered for topic {0}")]
    UnknownTopic(Topic),

    /// A policy returned an out-of-domain decision
    #[error("policy decision error: {0}")]
    PolicyDecision(String),

    /// Id lookup failed in the owning collection
    #[error("unknown {kind}: {id}")]
    UnknownEntity { kind: &'static str, id: String },

    /// Registration under an id that is already taken
    #[error("duplicate {kind} id: {id}")]
    DuplicateEntity { kind: &'static str, id: String },
}

impl SimulationError {
    /// Fatal errors abort the run; everything else is recovered locally
    /// (as a reject/degrade outcome or a returned result) and never
    /// unwinds across a dispatch boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SimulationError::CausalityViolation { .. })
    }

    /// True for the capacity class of failures (infeasible allocation).
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            SimulationError::Capacity { .. } | SimulationError::NoFeasibleHost { .. }
        )
    }
}
