//! Topic-addressed publish/subscribe event bus
//!
//! Producers publish tagged payloads; the bus delivers each payload
//! synchronously to every current subscriber of its topic, in
//! registration order. Publishers know nothing about subscribers and a
//! publish with zero subscribers is a no-op by design (the decoupling
//! contract). Each topic has a fixed payload shape, encoded as one
//! variant of [`EventPayload`], so the wire contract between components
//! is checked at compile time.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capacity::Capacity;
use crate::clock::SimTime;
use crate::error::{Result, SimulationError};
use crate::model::{Cloud, DeploymentId, PmId, RequestId, VmId, WorkloadId};

/// Named event channels. Display renders the dotted wire name.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Topic {
    RequestArrive,
    RequestAccept,
    RequestReject,
    RequestStop,
    ActionExecute,
    AppStart,
    AppStop,
    ContainerStart,
    ContainerStop,
    ControllerStart,
    ControllerStop,
    DeploymentRun,
    DeploymentPend,
    DeploymentDegrade,
    DeploymentScale,
    DeploymentStop,
    VmAllocate,
    VmDeallocate,
    SimLog,
}

impl Topic {
    /// Every topic, in declaration order.
    pub const ALL: [Topic; 19] = [
        Topic::RequestArrive,
        Topic::RequestAccept,
        Topic::RequestReject,
        Topic::RequestStop,
        Topic::ActionExecute,
        Topic::AppStart,
        Topic::AppStop,
        Topic::ContainerStart,
        Topic::ContainerStop,
        Topic::ControllerStart,
        Topic::ControllerStop,
        Topic::DeploymentRun,
        Topic::DeploymentPend,
        Topic::DeploymentDegrade,
        Topic::DeploymentScale,
        Topic::DeploymentStop,
        Topic::VmAllocate,
        Topic::VmDeallocate,
        Topic::SimLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::RequestArrive => "request.arrive",
            Topic::RequestAccept => "request.accept",
            Topic::RequestReject => "request.reject",
            Topic::RequestStop => "request.stop",
            Topic::ActionExecute => "action.execute",
            Topic::AppStart => "app.start",
            Topic::AppStop => "app.stop",
            Topic::ContainerStart => "container.start",
            Topic::ContainerStop => "container.stop",
            Topic::ControllerStart => "controller.start",
            Topic::ControllerStop => "controller.stop",
            Topic::DeploymentRun => "deployment.run",
            Topic::DeploymentPend => "deployment.pend",
            Topic::DeploymentDegrade => "deployment.degrade",
            Topic::DeploymentScale => "deployment.scale",
            Topic::DeploymentStop => "deployment.stop",
            Topic::VmAllocate => "vm.allocate",
            Topic::VmDeallocate => "vm.deallocate",
            Topic::SimLog => "sim.log",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a scripted scenario action, executed in sequence by the
/// `action.execute` handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionDescriptor {
    StartWorkload { workload: WorkloadId, vm: VmId },
    StopWorkload { workload: WorkloadId },
    ScaleDeployment { deployment: DeploymentId, desired: u32 },
    StopDeployment { deployment: DeploymentId },
    StopRequest { request: RequestId },
}

/// Tagged event payload, one variant per topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    RequestArrive { request: RequestId, arrival: SimTime, demand: Capacity },
    RequestAccept { request: RequestId },
    RequestReject { request: RequestId },
    RequestStop { request: RequestId },
    ActionExecute { actions: Vec<ActionDescriptor> },
    AppStart { workload: WorkloadId, vm: VmId },
    AppStop { workload: WorkloadId, vm: VmId },
    ContainerStart { workload: WorkloadId, vm: VmId },
    ContainerStop { workload: WorkloadId, vm: VmId },
    ControllerStart { workload: WorkloadId, vm: VmId },
    ControllerStop { workload: WorkloadId, vm: VmId },
    DeploymentRun { deployment: DeploymentId, replicas: u32 },
    DeploymentPend { deployment: DeploymentId, replicas: u32 },
    DeploymentDegrade { deployment: DeploymentId, remaining: u32 },
    DeploymentScale { deployment: DeploymentId, added: u32, removed: u32 },
    DeploymentStop { deployment: DeploymentId },
    VmAllocate { vm: VmId, pm: PmId },
    VmDeallocate { vm: VmId, pm: PmId },
    SimLog { message: String },
}

impl EventPayload {
    /// The topic this payload belongs to.
    pub fn topic(&self) -> Topic {
        match self {
            EventPayload::RequestArrive { .. } => Topic::RequestArrive,
            EventPayload::RequestAccept { .. } => Topic::RequestAccept,
            EventPayload::RequestReject { .. } => Topic::RequestReject,
            EventPayload::RequestStop { .. } => Topic::RequestStop,
            EventPayload::ActionExecute { .. } => Topic::ActionExecute,
            EventPayload::AppStart { .. } => Topic::AppStart,
            EventPayload::AppStop { .. } => Topic::AppStop,
            EventPayload::ContainerStart { .. } => Topic::ContainerStart,
            EventPayload::ContainerStop { .. } => Topic::ContainerStop,
            EventPayload::ControllerStart { .. } => Topic::ControllerStart,
            EventPayload::ControllerStop { .. } => Topic::ControllerStop,
            EventPayload::DeploymentRun { .. } => Topic::DeploymentRun,
            EventPayload::DeploymentPend { .. } => Topic::DeploymentPend,
            EventPayload::DeploymentDegrade { .. } => Topic::DeploymentDegrade,
            EventPayload::DeploymentScale { .. } => Topic::DeploymentScale,
            EventPayload::DeploymentStop { .. } => Topic::DeploymentStop,
            EventPayload::VmAllocate { .. } => Topic::VmAllocate,
            EventPayload::VmDeallocate { .. } => Topic::VmDeallocate,
            EventPayload::SimLog { .. } => Topic::SimLog,
        }
    }

    /// Human-readable one-liner for the `sim.log` stream.
    pub fn describe(&self) -> String {
        match self {
            EventPayload::RequestArrive { request, demand, .. } => {
                format!("arrive {request} [{demand}]")
            }
            EventPayload::RequestAccept { request } => format!("accept {request}"),
            EventPayload::RequestReject { request } => format!("reject {request}"),
            EventPayload::RequestStop { request } => format!("stop {request}"),
            EventPayload::ActionExecute { actions } => {
                format!("execute {} action(s)", actions.len())
            }
            EventPayload::AppStart { workload, vm }
            | EventPayload::ContainerStart { workload, vm }
            | EventPayload::ControllerStart { workload, vm } => {
                format!("[{vm}]: start {workload}")
            }
            EventPayload::AppStop { workload, vm }
            | EventPayload::ContainerStop { workload, vm }
            | EventPayload::ControllerStop { workload, vm } => {
                format!("[{vm}]: stop {workload}")
            }
            EventPayload::DeploymentRun { deployment, replicas } => {
                format!("[{deployment}]: RUNNING ({replicas} replica(s))")
            }
            EventPayload::DeploymentPend { deployment, .. } => {
                format!("[{deployment}]: PENDING (awaiting resources)")
            }
            EventPayload::DeploymentDegrade { deployment, remaining } => {
                format!("[{deployment}]: DEGRADED ({remaining} replica(s) remained)")
            }
            EventPayload::DeploymentScale { deployment, added, removed } => {
                format!("[{deployment}]: SCALED (+{added}/-{removed} replica(s))")
            }
            EventPayload::DeploymentStop { deployment } => {
                format!("[{deployment}]: STOPPED")
            }
            EventPayload::VmAllocate { vm, pm } => format!("[{pm}]: allocate {vm}"),
            EventPayload::VmDeallocate { vm, pm } => format!("[{pm}]: deallocate {vm}"),
            EventPayload::SimLog { message } => message.clone(),
        }
    }
}

/// Deferred side effects produced while a handler runs.
///
/// Handlers never call back into the bus or the clock directly: they
/// queue publishes here and the engine drains the queue through the
/// clock after the dispatch completes. That single rule is what makes
/// check-then-commit operations atomic with respect to re-entrant
/// publishes triggered by the same event.
#[derive(Debug)]
pub struct Outbox {
    now: SimTime,
    queued: Vec<(SimTime, EventPayload)>,
}

impl Outbox {
    pub fn new(now: SimTime) -> Self {
        Outbox { now, queued: Vec::new() }
    }

    /// Current simulated time as seen by the running handler.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Queue a publish at the current simulated time.
    pub fn publish(&mut self, payload: EventPayload) {
        self.queued.push((self.now, payload));
    }

    /// Queue a publish `delay` ticks in the future.
    pub fn publish_in(&mut self, delay: SimTime, payload: EventPayload) {
        self.queued.push((self.now.saturating_add(delay), payload));
    }

    /// Queue a publish at an absolute time; the past is rejected.
    pub fn publish_at(&mut self, time: SimTime, payload: EventPayload) -> Result<()> {
        if time < self.now {
            return Err(SimulationError::CausalityViolation { now: self.now, requested: time });
        }
        self.queued.push((time, payload));
        Ok(())
    }

    /// Take every queued publish, oldest first.
    pub fn drain(&mut self) -> Vec<(SimTime, EventPayload)> {
        std::mem::take(&mut self.queued)
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

/// Subscriber callback. Receives the shared entity store, the deferred
/// side-effect buffer, and the payload being delivered.
pub type Handler = Box<dyn FnMut(&mut Cloud, &mut Outbox, &EventPayload) -> Result<()>>;

/// Identifies one subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
}

/// Result of delivering one payload to a topic's subscribers.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Handlers invoked.
    pub delivered: usize,
    /// Handler failures, collected after every handler has run.
    pub failures: Vec<SimulationError>,
}

/// The subscription registry. Owns all subscriptions; delivery to a
/// topic's subscribers follows registration order.
#[derive(Default)]
pub struct EventBus {
    topics: BTreeMap<Topic, Vec<Subscription>>,
    next_id: u64,
    strict: bool,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// In strict mode, publishing to a topic with zero subscribers is
    /// flagged as [`SimulationError::UnknownTopic`] instead of being a
    /// silent no-op.
    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    pub fn subscribe(&mut self, topic: Topic, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.topics.entry(topic).or_default().push(Subscription { id, handler });
        id
    }

    /// Remove a subscription; returns whether it existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for subs in self.topics.values_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                subs.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics.get(&topic).map_or(0, Vec::len)
    }

    /// Deliver `payload` synchronously to every subscriber of its topic,
    /// in registration order. A handler failure does not prevent
    /// delivery to subsequent handlers; failures are collected and
    /// reported together once all handlers have run.
    pub fn publish(
        &mut self,
        cloud: &mut Cloud,
        outbox: &mut Outbox,
        payload: &EventPayload,
    ) -> DispatchOutcome {
        let topic = payload.topic();
        let mut outcome = DispatchOutcome::default();
        let Some(subs) = self.topics.get_mut(&topic) else {
            if self.strict {
                outcome.failures.push(SimulationError::UnknownTopic(topic));
            }
            return outcome;
        };
        if subs.is_empty() && self.strict {
            outcome.failures.push(SimulationError::UnknownTopic(topic));
            return outcome;
        }
        for sub in subs.iter_mut() {
            outcome.delivered += 1;
            if let Err(err) = (sub.handler)(cloud, outbox, payload) {
                outcome.failures.push(err);
            }
        }
        outcome
    }
}
