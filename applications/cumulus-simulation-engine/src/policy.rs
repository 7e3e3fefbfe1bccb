//! Pluggable decision policies
//!
//! Admission, placement, and scaling are pure decision functions: they
//! read a snapshot of the relevant state and return a value; the
//! invoking component performs all side effects. That separation lets a
//! test substitute a deterministic stub for any of them.

use crate::capacity::Capacity;
use crate::model::{DeploymentId, DeploymentState, PmId};

/// Snapshot of one candidate host as seen by a policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostCandidate {
    pub pm: PmId,
    pub free: Capacity,
    pub hosted: usize,
}

/// Read-only view of a deployment handed to the scaling policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeploymentView {
    pub id: DeploymentId,
    pub desired: u32,
    pub actual: u32,
    pub state: DeploymentState,
}

/// Accept/reject verdict for an incoming request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

/// Decides whether an arriving request should be admitted at all, given
/// its demand and the current cluster state.
pub trait AdmissionPolicy {
    fn decide(&self, demand: &Capacity, hosts: &[HostCandidate]) -> Verdict;
    fn name(&self) -> &str;
}

/// Chooses a host for a VM that needs one. `None` means no feasible
/// host; the caller surfaces that as a capacity failure.
pub trait PlacementPolicy {
    fn choose_host(&self, demand: &Capacity, hosts: &[HostCandidate]) -> Option<PmId>;
    fn name(&self) -> &str;
}

/// Proposes a signed replica delta for a deployment under the observed
/// load. Optional; deployments may also be driven by explicit scale
/// calls.
pub trait ScalingPolicy {
    fn decide_delta(&self, deployment: &DeploymentView, observed_load: f64) -> i64;
    fn name(&self) -> &str;
}

/// Default admission: accept iff some single host can fit the demand.
pub struct CapacityAdmission;

impl AdmissionPolicy for CapacityAdmission {
    fn decide(&self, demand: &Capacity, hosts: &[HostCandidate]) -> Verdict {
        if hosts.iter().any(|h| demand.fits(&h.free)) {
            Verdict::Accept
        } else {
            Verdict::Reject
        }
    }

    fn name(&self) -> &str {
        "capacity-admission"
    }
}

/// Fixed-verdict admission, handy for scripted scenarios and tests.
pub struct StaticAdmission(pub Verdict);

impl AdmissionPolicy for StaticAdmission {
    fn decide(&self, _demand: &Capacity, _hosts: &[HostCandidate]) -> Verdict {
        self.0
    }

    fn name(&self) -> &str {
        match self.0 {
            Verdict::Accept => "accept-all",
            Verdict::Reject => "reject-all",
        }
    }
}

/// Default placement: first host (in id order) with enough free capacity.
pub struct FirstFitPlacement;

impl PlacementPolicy for FirstFitPlacement {
    fn choose_host(&self, demand: &Capacity, hosts: &[HostCandidate]) -> Option<PmId> {
        hosts.iter().find(|h| demand.fits(&h.free)).map(|h| h.pm)
    }

    fn name(&self) -> &str {
        "first-fit"
    }
}

/// Spreads load: among feasible hosts, pick the one with the most free
/// CPU (ties broken by id order, which the candidate slice preserves).
pub struct WorstFitPlacement;

impl PlacementPolicy for WorstFitPlacement {
    fn choose_host(&self, demand: &Capacity, hosts: &[HostCandidate]) -> Option<PmId> {
        hosts
            .iter()
            .filter(|h| demand.fits(&h.free))
            .max_by_key(|h| h.free.cpu)
            .map(|h| h.pm)
    }

    fn name(&self) -> &str {
        "worst-fit"
    }
}

/// Scale up by `step` above `high` load, down by `step` below `low`.
pub struct ThresholdScaling {
    pub high: f64,
    pub low: f64,
    pub step: u32,
}

impl ScalingPolicy for ThresholdScaling {
    fn decide_delta(&self, _deployment: &DeploymentView, observed_load: f64) -> i64 {
        if observed_load > self.high {
            i64::from(self.step)
        } else if observed_load < self.low {
            -i64::from(self.step)
        } else {
            0
        }
    }

    fn name(&self) -> &str {
        "threshold-scaling"
    }
}

/// The policy bundle injected into the resource model at construction.
pub struct PolicySet {
    pub admission: Box<dyn AdmissionPolicy>,
    pub placement: Box<dyn PlacementPolicy>,
    pub scaling: Option<Box<dyn ScalingPolicy>>,
}

impl Default for PolicySet {
    fn default() -> Self {
        PolicySet {
            admission: Box::new(CapacityAdmission),
            placement: Box::new(FirstFitPlacement),
            scaling: None,
        }
    }
}
