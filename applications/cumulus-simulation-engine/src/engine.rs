//! The simulation engine: clock, bus, and resource model wired together
//!
//! The engine owns the three core components and drives the loop: pop
//! the earliest event from the clock, deliver it through the bus, then
//! feed every deferred publish back into the clock. Handlers run
//! single-threaded and to completion, so there is exactly one event in
//! flight at any instant and identical inputs replay identically.

use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::bus::{EventBus, EventPayload, Handler, Outbox, SubscriptionId, Topic};
use crate::capacity::Capacity;
use crate::clock::{Clock, EventHandle, SimTime};
use crate::error::Result;
use crate::model::{Cloud, DeploymentId, RequestId};

/// End-of-run summary, serializable for machine consumption.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub name: String,
    pub finished_at: SimTime,
    pub requests: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub accept_rate: f64,
    pub reject_rate: f64,
}

/// A single simulation run: one clock, one bus, one entity store.
pub struct Engine {
    name: String,
    clock: Clock,
    bus: EventBus,
    cloud: Cloud,
}

impl Engine {
    pub fn new(name: impl Into<String>, cloud: Cloud) -> Self {
        let mut engine =
            Engine { name: name.into(), clock: Clock::new(), bus: EventBus::new(), cloud };
        engine.wire_defaults();
        engine
    }

    /// Standing subscriptions every run starts with: per-topic counters,
    /// the arrival decider, the scripted-action executor, the
    /// event-to-log forwarders, and the log sink. Registration order is
    /// delivery order, so counters observe an event before its handler
    /// mutates anything.
    fn wire_defaults(&mut self) {
        for topic in Topic::ALL {
            self.bus.subscribe(
                topic,
                Box::new(|cloud, _fx, ev| {
                    cloud.tracker.observe(ev.topic());
                    Ok(())
                }),
            );
        }

        self.bus.subscribe(
            Topic::RequestArrive,
            Box::new(|cloud, fx, ev| {
                if let EventPayload::RequestArrive { request, arrival, demand } = ev {
                    cloud.register_request(*request, *arrival, *demand)?;
                    cloud.admit_request(fx, *request)?;
                }
                Ok(())
            }),
        );

        self.bus.subscribe(
            Topic::ActionExecute,
            Box::new(|cloud, fx, ev| {
                if let EventPayload::ActionExecute { actions } = ev {
                    cloud.execute_actions(fx, actions)?;
                }
                Ok(())
            }),
        );

        // Every lifecycle event also shows up on the log stream.
        for topic in Topic::ALL {
            if topic == Topic::SimLog {
                continue;
            }
            self.bus.subscribe(
                topic,
                Box::new(|_cloud, fx, ev| {
                    fx.publish(EventPayload::SimLog { message: ev.describe() });
                    Ok(())
                }),
            );
        }

        self.bus.subscribe(
            Topic::SimLog,
            Box::new(|_cloud, fx, ev| {
                if let EventPayload::SimLog { message } = ev {
                    info!(tick = fx.now(), "{message}");
                }
                Ok(())
            }),
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn now(&self) -> SimTime {
        self.clock.now()
    }

    pub fn cloud(&self) -> &Cloud {
        &self.cloud
    }

    pub fn cloud_mut(&mut self) -> &mut Cloud {
        &mut self.cloud
    }

    pub fn is_idle(&self) -> bool {
        self.clock.is_idle()
    }

    /// Add a subscription on top of the standing ones.
    pub fn subscribe(&mut self, topic: Topic, handler: Handler) -> SubscriptionId {
        self.bus.subscribe(topic, handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Treat publishes to subscriber-less topics as errors.
    pub fn set_strict(&mut self, strict: bool) {
        self.bus.set_strict(strict);
    }

    /// Record every payload delivered on `topic`; mostly for tests and
    /// scripted assertions.
    pub fn watch_topic(&mut self, topic: Topic) -> Rc<RefCell<Vec<EventPayload>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        self.bus.subscribe(
            topic,
            Box::new(move |_cloud, _fx, ev| {
                sink.borrow_mut().push(ev.clone());
                Ok(())
            }),
        );
        seen
    }

    // ---- scheduling ----

    pub fn schedule(&mut self, delay: SimTime, payload: EventPayload) -> EventHandle {
        self.clock.schedule_in(delay, payload)
    }

    pub fn schedule_at(&mut self, time: SimTime, payload: EventPayload) -> Result<EventHandle> {
        self.clock.schedule_at(time, payload)
    }

    pub fn cancel(&mut self, handle: EventHandle) {
        self.clock.cancel(handle);
    }

    /// Schedule a request arrival.
    pub fn submit_request(
        &mut self,
        request: RequestId,
        at: SimTime,
        demand: Capacity,
    ) -> Result<EventHandle> {
        self.clock
            .schedule_at(at, EventPayload::RequestArrive { request, arrival: at, demand })
    }

    // ---- stepping ----

    /// Dispatch the next pending event. Returns false once idle.
    ///
    /// Recoverable handler failures are logged and the run continues;
    /// a fatal failure aborts the run.
    pub fn advance(&mut self) -> Result<bool> {
        let Some(event) = self.clock.pop_next() else {
            return Ok(false);
        };
        self.dispatch(event.time, &event.payload)?;
        Ok(true)
    }

    /// Deliver `payload` at the current simulated time, bypassing the
    /// schedule. Deferred publishes still go through the clock.
    pub fn publish_now(&mut self, payload: EventPayload) -> Result<()> {
        self.dispatch(self.clock.now(), &payload)
    }

    fn dispatch(&mut self, time: SimTime, payload: &EventPayload) -> Result<()> {
        let mut outbox = Outbox::new(time);
        let outcome = self.bus.publish(&mut self.cloud, &mut outbox, payload);
        for failure in outcome.failures {
            if failure.is_fatal() {
                error!(topic = %payload.topic(), error = %failure, "fatal handler failure");
                return Err(failure);
            }
            warn!(topic = %payload.topic(), error = %failure, "handler failed");
        }
        for (when, queued) in outbox.drain() {
            self.clock.schedule_at(when, queued)?;
        }
        Ok(())
    }

    /// Run until no events remain; returns the number dispatched.
    pub fn run_until_idle(&mut self) -> Result<usize> {
        let mut steps = 0;
        while self.advance()? {
            steps += 1;
        }
        Ok(steps)
    }

    /// Dispatch everything due at or before `tick`, then park the clock
    /// exactly there.
    pub fn run_until(&mut self, tick: SimTime) -> Result<usize> {
        let mut steps = 0;
        while let Some(due) = self.clock.peek_time() {
            if due > tick {
                break;
            }
            self.advance()?;
            steps += 1;
        }
        if self.clock.now() < tick {
            self.clock.advance_to(tick)?;
        }
        Ok(steps)
    }

    // ---- direct model operations (deferred publishes go via the clock) ----

    pub fn stop_request(&mut self, request: RequestId) -> Result<()> {
        self.with_outbox(|cloud, fx| cloud.stop_request(fx, request))
    }

    pub fn create_deployment(
        &mut self,
        id: DeploymentId,
        desired: u32,
        replica_demand: Capacity,
    ) -> Result<()> {
        self.with_outbox(|cloud, fx| cloud.create_deployment(fx, id, desired, replica_demand))
    }

    pub fn scale_deployment(&mut self, id: DeploymentId, desired: u32) -> Result<()> {
        self.with_outbox(|cloud, fx| cloud.scale_deployment(fx, id, desired))
    }

    pub fn stop_deployment(&mut self, id: DeploymentId) -> Result<()> {
        self.with_outbox(|cloud, fx| cloud.stop_deployment(fx, id))
    }

    pub fn autoscale(&mut self, id: DeploymentId, observed_load: f64) -> Result<()> {
        self.with_outbox(|cloud, fx| cloud.autoscale(fx, id, observed_load))
    }

    fn with_outbox(
        &mut self,
        f: impl FnOnce(&mut Cloud, &mut Outbox) -> Result<()>,
    ) -> Result<()> {
        let mut fx = Outbox::new(self.clock.now());
        f(&mut self.cloud, &mut fx)?;
        for (when, payload) in fx.drain() {
            self.clock.schedule_at(when, payload)?;
        }
        Ok(())
    }

    // ---- reporting ----

    pub fn report(&self) -> RunReport {
        let requests = self.cloud.tracker.count(Topic::RequestArrive);
        let accepted = self.cloud.tracker.count(Topic::RequestAccept);
        let rejected = self.cloud.tracker.count(Topic::RequestReject);
        let rate = |n: u64| if requests == 0 { 0.0 } else { n as f64 / requests as f64 };
        RunReport {
            name: self.name.clone(),
            finished_at: self.clock.now(),
            requests,
            accepted,
            rejected,
            accept_rate: rate(accepted),
            reject_rate: rate(rejected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SimulationError;
    use crate::model::PmId;
    use crate::policy::{PolicySet, StaticAdmission, Verdict};

    fn small_cluster(cpu: u64) -> Cloud {
        let mut cloud = Cloud::new();
        cloud.add_pm(PmId(0), Capacity::cores(cpu)).expect("fresh id");
        cloud
    }

    #[test]
    fn test_accepted_request_allocates_and_reports() {
        let mut engine = Engine::new("accept-one", small_cluster(4));
        let accepts = engine.watch_topic(Topic::RequestAccept);

        engine.submit_request(RequestId(1), 3, Capacity::cores(2)).expect("future time");
        engine.run_until_idle().expect("clean run");

        assert_eq!(
            *accepts.borrow(),
            vec![EventPayload::RequestAccept { request: RequestId(1) }]
        );
        assert_eq!(engine.cloud().pm(PmId(0)).unwrap().free(), Capacity::cores(2));

        let report = engine.report();
        assert_eq!(report.requests, 1);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected, 0);
        assert_eq!(report.accept_rate, 1.0);
        assert_eq!(report.finished_at, 3);
    }

    #[test]
    fn test_reject_all_policy_rejects_exactly_once() {
        // A reject-all admission policy turns one arrival into exactly
        // one reject; the accept counter never moves.
        let mut policies = PolicySet::default();
        policies.admission = Box::new(StaticAdmission(Verdict::Reject));
        let mut cloud = Cloud::with_policies(policies);
        cloud.add_pm(PmId(0), Capacity::cores(8)).expect("fresh id");

        let mut engine = Engine::new("reject-all", cloud);
        engine.submit_request(RequestId(1), 1, Capacity::cores(1)).expect("future time");
        engine.run_until_idle().expect("clean run");

        let tracker = &engine.cloud().tracker;
        assert_eq!(tracker.count(Topic::RequestArrive), 1);
        assert_eq!(tracker.count(Topic::RequestReject), 1);
        assert_eq!(tracker.count(Topic::RequestAccept), 0);
        assert!(!tracker.has_pending());
    }

    #[test]
    fn test_every_arrival_is_decided_at_most_once() {
        // Overload a 4-core host with 6 requests: whatever the split,
        // accept + reject never exceeds arrivals and nothing stays
        // pending once the run is idle.
        let mut engine = Engine::new("overload", small_cluster(4));
        for i in 0..6 {
            engine
                .submit_request(RequestId(i), i + 1, Capacity::cores(2))
                .expect("future time");
        }
        engine.run_until_idle().expect("clean run");

        let tracker = &engine.cloud().tracker;
        let arrived = tracker.count(Topic::RequestArrive);
        let decided = tracker.count(Topic::RequestAccept) + tracker.count(Topic::RequestReject);
        assert_eq!(arrived, 6);
        assert_eq!(decided, arrived);
        assert_eq!(tracker.count(Topic::RequestAccept), 2);
        assert_eq!(tracker.count(Topic::RequestReject), 4);
        assert!(engine.cloud().pm_accounting_consistent(PmId(0)).unwrap());
    }

    #[test]
    fn test_run_until_parks_clock_between_events() {
        let mut engine = Engine::new("ticked", small_cluster(4));
        engine.schedule(5, EventPayload::SimLog { message: "early".into() });
        engine.schedule(12, EventPayload::SimLog { message: "late".into() });

        let steps = engine.run_until(10).expect("clean run");
        assert_eq!(steps, 1);
        assert_eq!(engine.now(), 10);

        engine.run_until_idle().expect("clean run");
        assert_eq!(engine.now(), 12);
    }

    #[test]
    fn test_deferred_publishes_preserve_dispatch_order() {
        // The accept decision publishes vm.allocate before
        // request.accept from the same handler run; both surface in that
        // order once the outbox drains through the clock.
        let mut engine = Engine::new("ordering", small_cluster(4));
        let log = engine.watch_topic(Topic::SimLog);

        engine.submit_request(RequestId(1), 1, Capacity::cores(1)).expect("future time");
        engine.run_until_idle().expect("clean run");

        let messages: Vec<String> = log
            .borrow()
            .iter()
            .filter_map(|ev| match ev {
                EventPayload::SimLog { message } => Some(message.clone()),
                _ => None,
            })
            .collect();
        let alloc = messages.iter().position(|m| m.contains("allocate"));
        let accept = messages.iter().position(|m| m.contains("accept"));
        assert!(alloc.unwrap() < accept.unwrap());
    }

    #[test]
    fn test_scripted_actions_run_in_sequence() {
        use crate::bus::ActionDescriptor;
        use crate::model::{WorkloadId, WorkloadKind};

        let mut engine = Engine::new("scripted", small_cluster(4));
        engine.submit_request(RequestId(1), 1, Capacity::cores(2)).expect("future time");
        engine.run_until_idle().expect("clean run");
        let vm = engine.cloud().request(RequestId(1)).unwrap().vm().expect("accepted");

        engine
            .cloud_mut()
            .add_workload(WorkloadId(7), WorkloadKind::Container, Capacity::cores(1))
            .expect("fresh id");
        engine.schedule(
            5,
            EventPayload::ActionExecute {
                actions: vec![
                    ActionDescriptor::StartWorkload { workload: WorkloadId(7), vm },
                    ActionDescriptor::StopWorkload { workload: WorkloadId(7) },
                    ActionDescriptor::StopRequest { request: RequestId(1) },
                ],
            },
        );
        engine.run_until_idle().expect("clean run");

        let tracker = &engine.cloud().tracker;
        assert_eq!(tracker.count(Topic::ContainerStart), 1);
        assert_eq!(tracker.count(Topic::ContainerStop), 1);
        assert_eq!(tracker.count(Topic::RequestStop), 1);
        assert_eq!(engine.cloud().pm(PmId(0)).unwrap().free(), Capacity::cores(4));
    }

    #[test]
    fn test_failed_action_does_not_abort_the_rest() {
        use crate::bus::ActionDescriptor;

        let mut engine = Engine::new("bad-action", small_cluster(4));
        engine.submit_request(RequestId(1), 1, Capacity::cores(1)).expect("future time");
        engine.schedule(
            3,
            EventPayload::ActionExecute {
                actions: vec![
                    // Unknown workload: recoverable, logged, skipped.
                    ActionDescriptor::StopWorkload { workload: crate::model::WorkloadId(99) },
                    ActionDescriptor::StopRequest { request: RequestId(1) },
                ],
            },
        );
        engine.run_until_idle().expect("run survives the bad action");
        assert_eq!(engine.cloud().tracker.count(Topic::RequestStop), 1);
    }

    #[test]
    fn test_schedule_at_past_is_fatal() {
        let mut engine = Engine::new("late", small_cluster(1));
        engine.schedule(5, EventPayload::SimLog { message: "move time".into() });
        engine.run_until_idle().expect("clean run");
        assert_eq!(engine.now(), 5);

        let err = engine
            .schedule_at(2, EventPayload::SimLog { message: "too late".into() })
            .unwrap_err();
        assert_eq!(err, SimulationError::CausalityViolation { now: 5, requested: 2 });
        assert!(err.is_fatal());
    }

    #[test]
    fn test_deployment_lifecycle_through_engine() {
        let mut engine = Engine::new("deploy", small_cluster(2));
        engine
            .create_deployment(DeploymentId(1), 3, Capacity::cores(1))
            .expect("partial bring-up");
        engine.run_until_idle().expect("clean run");

        let tracker = &engine.cloud().tracker;
        assert_eq!(tracker.count(Topic::DeploymentPend), 1);
        assert_eq!(tracker.count(Topic::DeploymentDegrade), 1);
        assert_eq!(tracker.count(Topic::VmAllocate), 2);

        engine.scale_deployment(DeploymentId(1), 2).expect("fits now");
        engine.run_until_idle().expect("clean run");
        assert_eq!(engine.cloud().tracker.count(Topic::DeploymentRun), 1);

        engine.stop_deployment(DeploymentId(1)).expect("stops");
        engine.run_until_idle().expect("clean run");
        assert_eq!(engine.cloud().tracker.count(Topic::DeploymentStop), 1);
        assert_eq!(engine.cloud().pm(PmId(0)).unwrap().free(), Capacity::cores(2));
    }

    #[test]
    fn test_cancelled_arrival_never_fires() {
        let mut engine = Engine::new("cancelled", small_cluster(4));
        let handle = engine
            .submit_request(RequestId(1), 5, Capacity::cores(1))
            .expect("future time");
        engine.cancel(handle);
        engine.run_until_idle().expect("clean run");

        assert_eq!(engine.cloud().tracker.count(Topic::RequestArrive), 0);
        assert!(engine.cloud().request(RequestId(1)).is_err());
    }
}
