//! Replicated deployments reconciled against a desired count
//!
//! A deployment is a group of identical replica VMs plus a desired
//! replica count. Reconciliation derives the state from desired vs.
//! actual: every live replica means RUNNING, some but not all means
//! DEGRADED, none means PENDING, and a zero desired count means STOPPED.
//! State changes are announced on the deployment topics; unchanged
//! reconciliations are silent.

use tracing::warn;

use crate::bus::{EventPayload, Outbox};
use crate::capacity::Capacity;
use crate::error::{Result, SimulationError};
use crate::model::{Cloud, DeploymentId, DeploymentState, VmId, VmState};
use crate::policy::DeploymentView;

/// A replicated group of identical VMs.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub id: DeploymentId,
    desired: u32,
    replica_demand: Capacity,
    // Creation order; scale-down trims from the tail.
    replicas: Vec<VmId>,
    state: DeploymentState,
}

impl Deployment {
    fn new(id: DeploymentId, desired: u32, replica_demand: Capacity) -> Self {
        Deployment {
            id,
            desired,
            replica_demand,
            replicas: Vec::new(),
            state: DeploymentState::Pending,
        }
    }

    pub fn desired(&self) -> u32 {
        self.desired
    }

    pub fn replica_demand(&self) -> Capacity {
        self.replica_demand
    }

    pub fn replicas(&self) -> &[VmId] {
        &self.replicas
    }

    pub fn actual(&self) -> u32 {
        self.replicas.len() as u32
    }

    pub fn state(&self) -> DeploymentState {
        self.state
    }

    pub fn view(&self) -> DeploymentView {
        DeploymentView {
            id: self.id,
            desired: self.desired,
            actual: self.actual(),
            state: self.state,
        }
    }
}

impl Cloud {
    pub fn deployment(&self, id: DeploymentId) -> Result<&Deployment> {
        self.deployments
            .get(&id)
            .ok_or(SimulationError::UnknownEntity { kind: "deployment", id: id.to_string() })
    }

    pub fn deployments(&self) -> impl Iterator<Item = &Deployment> {
        self.deployments.values()
    }

    /// Create a deployment, announce it as PENDING, and immediately try
    /// to bring up the desired replicas. Partial bring-up is not an
    /// error; reconciliation reports it as DEGRADED.
    pub fn create_deployment(
        &mut self,
        fx: &mut Outbox,
        id: DeploymentId,
        desired: u32,
        replica_demand: Capacity,
    ) -> Result<()> {
        if self.deployments.contains_key(&id) {
            return Err(SimulationError::DuplicateEntity {
                kind: "deployment",
                id: id.to_string(),
            });
        }
        self.deployments.insert(id, Deployment::new(id, desired, replica_demand));
        fx.publish(EventPayload::DeploymentPend { deployment: id, replicas: 0 });

        if desired > 0 {
            self.grow(fx, id, desired)?;
        }
        self.reconcile(fx, id)
    }

    /// Bring up at most `count` fresh replicas; returns how many came up.
    ///
    /// Replica demands are identical, so the first capacity failure ends
    /// the attempt: the remaining replicas could only fail the same way.
    fn grow(&mut self, fx: &mut Outbox, id: DeploymentId, count: u32) -> Result<u32> {
        let demand = self.deployment(id)?.replica_demand;
        let mut added = 0;
        for _ in 0..count {
            let vm_id = self.mint_vm_id();
            self.add_vm(vm_id, demand)?;
            match self.place_and_allocate(fx, vm_id) {
                Ok(_) => {
                    self.start_vm(fx, vm_id)?;
                    if let Some(dep) = self.deployments.get_mut(&id) {
                        dep.replicas.push(vm_id);
                    }
                    added += 1;
                }
                Err(err) if err.is_capacity() => {
                    self.vms.remove(&vm_id);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(added)
    }

    /// Tear down `count` replicas, newest first.
    fn shrink(&mut self, fx: &mut Outbox, id: DeploymentId, count: u32) -> Result<u32> {
        let mut removed = 0;
        for _ in 0..count {
            let Some(dep) = self.deployments.get_mut(&id) else { break };
            let Some(vm_id) = dep.replicas.pop() else { break };
            self.deallocate(fx, vm_id)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Set the desired replica count and converge toward it. The scale
    /// event is published even when nothing had to move; the state
    /// change (if any) follows from reconciliation.
    pub fn scale_deployment(
        &mut self,
        fx: &mut Outbox,
        id: DeploymentId,
        desired: u32,
    ) -> Result<()> {
        let dep = self.deployment(id)?;
        if dep.state == DeploymentState::Stopped {
            return Err(SimulationError::InvalidStateTransition {
                entity: id.to_string(),
                state: dep.state.as_str(),
                op: "scale",
            });
        }
        let actual = dep.actual();
        if let Some(dep) = self.deployments.get_mut(&id) {
            dep.desired = desired;
        }

        let mut added = 0;
        let mut removed = 0;
        if desired > actual {
            added = self.grow(fx, id, desired - actual)?;
        } else if desired < actual {
            removed = self.shrink(fx, id, actual - desired)?;
        }
        fx.publish(EventPayload::DeploymentScale { deployment: id, added, removed });
        self.reconcile(fx, id)
    }

    /// Tear down every replica and stop the deployment. Stopping an
    /// already stopped deployment is a no-op.
    pub fn stop_deployment(&mut self, fx: &mut Outbox, id: DeploymentId) -> Result<()> {
        let dep = self.deployment(id)?;
        if dep.state == DeploymentState::Stopped {
            return Ok(());
        }
        let actual = dep.actual();
        if let Some(dep) = self.deployments.get_mut(&id) {
            dep.desired = 0;
        }
        self.shrink(fx, id, actual)?;
        self.reconcile(fx, id)
    }

    /// Re-derive the deployment state from desired vs. actual, dropping
    /// replica ids whose VM is no longer running first. Publishes only
    /// on a state change.
    pub fn reconcile(&mut self, fx: &mut Outbox, id: DeploymentId) -> Result<()> {
        let dep = self.deployment(id)?;
        let live: Vec<VmId> = dep
            .replicas
            .iter()
            .copied()
            .filter(|vm_id| {
                self.vms
                    .get(vm_id)
                    .is_some_and(|vm| vm.state() != VmState::Deallocated)
            })
            .collect();

        let desired = dep.desired;
        let actual = live.len() as u32;
        let old_state = dep.state;
        let new_state = if desired == 0 {
            DeploymentState::Stopped
        } else if actual == 0 {
            DeploymentState::Pending
        } else if actual < desired {
            DeploymentState::Degraded
        } else {
            DeploymentState::Running
        };

        if let Some(dep) = self.deployments.get_mut(&id) {
            dep.replicas = live;
            dep.state = new_state;
        }
        if new_state != old_state {
            let payload = match new_state {
                DeploymentState::Pending => {
                    EventPayload::DeploymentPend { deployment: id, replicas: actual }
                }
                DeploymentState::Running => {
                    EventPayload::DeploymentRun { deployment: id, replicas: actual }
                }
                DeploymentState::Degraded => {
                    EventPayload::DeploymentDegrade { deployment: id, remaining: actual }
                }
                DeploymentState::Stopped => EventPayload::DeploymentStop { deployment: id },
            };
            fx.publish(payload);
        }
        Ok(())
    }

    /// Ask the scaling policy (if any) for a replica delta and apply it.
    /// A delta that would take the desired count below zero is clamped
    /// to zero and logged as an out-of-domain decision.
    pub fn autoscale(&mut self, fx: &mut Outbox, id: DeploymentId, observed_load: f64) -> Result<()> {
        let view = self.deployment(id)?.view();
        let Some(scaling) = self.policies.scaling.as_ref() else {
            return Ok(());
        };
        let delta = scaling.decide_delta(&view, observed_load);
        if delta == 0 {
            return Ok(());
        }
        let target = i64::from(view.desired) + delta;
        let desired = if target < 0 {
            let err = SimulationError::PolicyDecision(format!(
                "scaling delta {delta} takes {id} below zero replicas"
            ));
            warn!(error = %err, "clamping scale target to zero");
            0
        } else {
            target as u32
        };
        self.scale_deployment(fx, id, desired)
    }
}
