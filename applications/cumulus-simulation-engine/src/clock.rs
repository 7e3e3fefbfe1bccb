//! Simulated clock and event schedule
//!
//! The clock owns the priority-ordered schedule of future events and is
//! the only component that moves simulated time. Events are ordered by
//! `(time, sequence number)`: the sequence number is a FIFO tie-break
//! among events scheduled for the same instant, which is what makes
//! dispatch order fully deterministic.

use std::collections::BTreeMap;

use crate::bus::EventPayload;
use crate::error::{Result, SimulationError};

/// Logical simulation time. One unit is one tick; no wall-clock meaning.
pub type SimTime = u64;

/// Handle to a scheduled-but-not-yet-dispatched event, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandle {
    time: SimTime,
    seq: u64,
}

/// An event popped from the schedule, ready for bus delivery.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub time: SimTime,
    pub seq: u64,
    pub payload: EventPayload,
}

#[derive(Debug)]
struct Slot {
    payload: EventPayload,
    cancelled: bool,
}

/// The simulation clock: current time plus the schedule of future events.
///
/// The schedule is an ordered map keyed by `(time, seq)`; cancellation
/// marks the slot inert rather than removing it, and dispatch silently
/// skips inert slots.
#[derive(Debug, Default)]
pub struct Clock {
    now: SimTime,
    next_seq: u64,
    schedule: BTreeMap<(SimTime, u64), Slot>,
    live: usize,
}

impl Clock {
    pub fn new() -> Self {
        Clock::default()
    }

    /// Current simulated time. Read-only; only dispatch and
    /// [`Clock::advance_to`] move it, and only ever forward.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Number of pending (non-cancelled) events.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_idle(&self) -> bool {
        self.live == 0
    }

    /// Schedule `payload` to fire `delay` ticks from now.
    pub fn schedule_in(&mut self, delay: SimTime, payload: EventPayload) -> EventHandle {
        let time = self.now.saturating_add(delay);
        self.insert(time, payload)
    }

    /// Schedule `payload` at an absolute time.
    ///
    /// Scheduling strictly before the current time breaks the causal
    /// ordering guarantee and is rejected as a fatal misuse.
    pub fn schedule_at(&mut self, time: SimTime, payload: EventPayload) -> Result<EventHandle> {
        if time < self.now {
            return Err(SimulationError::CausalityViolation {
                now: self.now,
                requested: time,
            });
        }
        Ok(self.insert(time, payload))
    }

    fn insert(&mut self, time: SimTime, payload: EventPayload) -> EventHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.schedule.insert((time, seq), Slot { payload, cancelled: false });
        self.live += 1;
        EventHandle { time, seq }
    }

    /// Mark a scheduled event inert. Idempotent; cancelling an already
    /// dispatched (or already cancelled) event has no effect.
    pub fn cancel(&mut self, handle: EventHandle) {
        if let Some(slot) = self.schedule.get_mut(&(handle.time, handle.seq)) {
            if !slot.cancelled {
                slot.cancelled = true;
                self.live -= 1;
            }
        }
    }

    /// Time of the next non-cancelled event, if any.
    pub fn peek_time(&self) -> Option<SimTime> {
        self.schedule
            .iter()
            .find(|(_, slot)| !slot.cancelled)
            .map(|((time, _), _)| *time)
    }

    /// Pop the earliest pending event and advance the clock to its time.
    ///
    /// Returns `None` when the schedule is idle. Cancelled slots are
    /// discarded without being returned, even if their time has passed.
    pub fn pop_next(&mut self) -> Option<ScheduledEvent> {
        while let Some(((time, seq), slot)) = self.schedule.pop_first() {
            if slot.cancelled {
                continue;
            }
            self.live -= 1;
            // Time only ever increases.
            self.now = self.now.max(time);
            return Some(ScheduledEvent { time, seq, payload: slot.payload });
        }
        None
    }

    /// Move the clock forward to a fixed tick with no event due.
    ///
    /// The driver must have drained every event scheduled at or before
    /// `time` first; jumping over a pending event is a causality misuse.
    pub fn advance_to(&mut self, time: SimTime) -> Result<()> {
        if time < self.now {
            return Err(SimulationError::CausalityViolation {
                now: self.now,
                requested: time,
            });
        }
        if let Some(due) = self.peek_time() {
            if due < time {
                return Err(SimulationError::CausalityViolation {
                    now: due,
                    requested: time,
                });
            }
        }
        self.now = time;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(msg: &str) -> EventPayload {
        EventPayload::SimLog { message: msg.to_string() }
    }

    #[test]
    fn test_dispatch_order_fifo_tie_break() {
        // Events at times 5, 5, 10 dispatch as (5,first), (5,second), (10).
        let mut clock = Clock::new();
        clock.schedule_in(5, log("first"));
        clock.schedule_in(5, log("second"));
        clock.schedule_in(10, log("third"));

        let order: Vec<(SimTime, String)> = std::iter::from_fn(|| clock.pop_next())
            .map(|ev| {
                let EventPayload::SimLog { message } = ev.payload else {
                    panic!("unexpected payload");
                };
                (ev.time, message)
            })
            .collect();

        assert_eq!(
            order,
            vec![
                (5, "first".to_string()),
                (5, "second".to_string()),
                (10, "third".to_string())
            ]
        );
        assert_eq!(clock.now(), 10);
    }

    #[test]
    fn test_time_never_decreases() {
        let mut clock = Clock::new();
        clock.schedule_in(3, log("a"));
        assert!(clock.pop_next().is_some());
        assert_eq!(clock.now(), 3);

        clock.schedule_in(0, log("b"));
        assert!(clock.pop_next().is_some());
        assert_eq!(clock.now(), 3);
    }

    #[test]
    fn test_schedule_at_rejects_past() {
        let mut clock = Clock::new();
        clock.schedule_in(5, log("a"));
        clock.pop_next();

        let err = clock.schedule_at(2, log("late")).unwrap_err();
        assert_eq!(err, SimulationError::CausalityViolation { now: 5, requested: 2 });
        assert!(err.is_fatal());
    }

    #[test]
    fn test_cancel_prevents_dispatch() {
        let mut clock = Clock::new();
        let keep = clock.schedule_in(1, log("keep"));
        let drop = clock.schedule_in(1, log("drop"));
        clock.cancel(drop);
        // Idempotent.
        clock.cancel(drop);
        assert_eq!(clock.len(), 1);

        let ev = clock.pop_next().expect("one event pending");
        assert_eq!(ev.seq, 0);
        assert!(clock.pop_next().is_none());
        assert!(clock.is_idle());

        // Cancelling after dispatch has no effect.
        clock.cancel(keep);
        assert!(clock.is_idle());
    }

    #[test]
    fn test_cancel_after_time_reached_but_before_dispatch() {
        let mut clock = Clock::new();
        clock.schedule_in(5, log("a"));
        let doomed = clock.schedule_in(5, log("doomed"));
        clock.pop_next();
        // Clock already sits at the event's time; cancellation still wins
        // because dispatch has not happened yet.
        assert_eq!(clock.now(), 5);
        clock.cancel(doomed);
        assert!(clock.pop_next().is_none());
    }

    #[test]
    fn test_advance_to_tick() {
        let mut clock = Clock::new();
        clock.advance_to(7).expect("idle clock advances freely");
        assert_eq!(clock.now(), 7);

        clock.schedule_in(3, log("a"));
        // Jumping over a due event is refused.
        assert!(clock.advance_to(20).is_err());
        // Advancing up to (not past) the due event is fine.
        clock.advance_to(10).expect("no event strictly before 10");
        assert_eq!(clock.now(), 10);
    }
}
