//! Cumulus Simulation Engine
//!
//! Discrete-event simulator for cloud resource management: request
//! admission, VM placement, and replicated deployments on a modeled
//! cluster. Single-threaded and deterministic; same inputs, same run.

pub mod bus;
pub mod capacity;
pub mod clock;
pub mod deployment;
pub mod engine;
pub mod error;
pub mod model;
pub mod policy;
pub mod tracker;
pub mod workload;
