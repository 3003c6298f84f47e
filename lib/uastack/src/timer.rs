//! Monotonic min-ordered set of cyclic callbacks. The event loop checks due
//! entries out with `take_due`, fires them without holding the timer borrow
//! and hands them back through `reschedule`; removal and modification of a
//! checked-out entry are recorded and applied at hand-back time.

use std::collections::{BTreeMap, HashMap, HashSet};
use uabase::status::StatusCode;
use uabase::time::DateTime;

pub type TimerId = u64;

/// Rescheduling policy of a cyclic timer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimerPolicy {
    /// Next execution is `now + interval`.
    CurrentTime,
    /// Next execution stays in phase with the original baseline. Missed
    /// intervals are skipped, there are no catch-up bursts.
    BaseTime,
}

pub struct TimerEntry<C> {
    pub(crate) next_execution: DateTime,
    pub(crate) interval: DateTime,
    pub(crate) policy: TimerPolicy,
    pub(crate) callback: C,
}

/// Timer set generic over the callback payload so it can be exercised
/// without an event loop.
pub struct Timer<C> {
    entries: BTreeMap<(DateTime, TimerId), TimerEntry<C>>,
    index: HashMap<TimerId, DateTime>,
    in_flight: HashSet<TimerId>,
    cancelled: HashSet<TimerId>,
    pending_mods: HashMap<TimerId, (DateTime, TimerPolicy)>,
    next_id: TimerId,
}

/// Smallest multiple of `interval` past `base` that lies strictly after
/// `now`.
fn next_in_phase(base: DateTime, interval: DateTime, now: DateTime) -> DateTime {
    let next = base + interval;
    if next > now {
        return next;
    }
    let missed = (now - base) / interval;
    base + (missed + 1) * interval
}

impl<C> Timer<C> {
    pub fn new() -> Timer<C> {
        Timer {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            in_flight: HashSet::new(),
            cancelled: HashSet::new(),
            pending_mods: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.in_flight.len()
    }

    /// Registers a cyclic callback. `interval` must be positive; the first
    /// execution is `base_time + interval` in phase (default baseline:
    /// `now`).
    pub fn add(
        &mut self,
        callback: C,
        interval: DateTime,
        base_time: Option<DateTime>,
        policy: TimerPolicy,
        now: DateTime,
    ) -> Result<TimerId, StatusCode> {
        if interval <= 0 {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }

        let id = self.next_id;
        self.next_id += 1;

        let next_execution = next_in_phase(base_time.unwrap_or(now), interval, now);
        self.entries.insert(
            (next_execution, id),
            TimerEntry {
                next_execution,
                interval,
                policy,
                callback,
            },
        );
        self.index.insert(id, next_execution);
        Ok(id)
    }

    /// The earliest deadline, or `DateTime::MAX` if no timer is registered.
    pub fn next_deadline(&self) -> DateTime {
        self.entries
            .keys()
            .next()
            .map_or(DateTime::MAX, |(deadline, _)| *deadline)
    }

    /// Updates interval and policy, keeping the id. The next execution is
    /// recomputed from `now`.
    pub fn modify(
        &mut self,
        id: TimerId,
        interval: DateTime,
        policy: TimerPolicy,
        now: DateTime,
    ) -> Result<(), StatusCode> {
        if interval <= 0 {
            return Err(StatusCode::BAD_INVALID_ARGUMENT);
        }

        if let Some(scheduled) = self.index.get(&id).copied() {
            let mut entry = self
                .entries
                .remove(&(scheduled, id))
                .ok_or(StatusCode::BAD_INTERNAL_ERROR)?;
            entry.interval = interval;
            entry.policy = policy;
            entry.next_execution = next_in_phase(now, interval, now);
            self.index.insert(id, entry.next_execution);
            self.entries.insert((entry.next_execution, id), entry);
            return Ok(());
        }

        if self.in_flight.contains(&id) {
            self.pending_mods.insert(id, (interval, policy));
            return Ok(());
        }

        Err(StatusCode::BAD_NOT_FOUND)
    }

    /// Removes a timer. Idempotent; removing a timer from inside its own
    /// callback is honored when the entry is handed back.
    pub fn remove(&mut self, id: TimerId) {
        if let Some(scheduled) = self.index.remove(&id) {
            self.entries.remove(&(scheduled, id));
        } else if self.in_flight.contains(&id) {
            self.cancelled.insert(id);
        }
    }

    /// Checks out every entry with `next_execution <= now`, in deadline
    /// order. The caller fires them and returns each through `reschedule`.
    pub fn take_due(&mut self, now: DateTime) -> Vec<(TimerId, TimerEntry<C>)> {
        let mut due = Vec::new();
        loop {
            let key = match self.entries.keys().next() {
                Some(&key) if key.0 <= now => key,
                _ => break,
            };
            let entry = match self.entries.remove(&key) {
                Some(entry) => entry,
                None => break,
            };
            let id = key.1;
            self.index.remove(&id);
            self.in_flight.insert(id);
            due.push((id, entry));
        }
        due
    }

    /// Hands a fired entry back, applying any removal or modification that
    /// happened while it was checked out, and schedules the next cycle.
    pub fn reschedule(&mut self, id: TimerId, mut entry: TimerEntry<C>, now: DateTime) {
        self.in_flight.remove(&id);
        if self.cancelled.remove(&id) {
            self.pending_mods.remove(&id);
            return;
        }
        if let Some((interval, policy)) = self.pending_mods.remove(&id) {
            entry.interval = interval;
            entry.policy = policy;
        }

        entry.next_execution = match entry.policy {
            TimerPolicy::CurrentTime => now + entry.interval,
            TimerPolicy::BaseTime => next_in_phase(entry.next_execution, entry.interval, now),
        };
        self.index.insert(id, entry.next_execution);
        self.entries.insert((entry.next_execution, id), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fire_all(timer: &mut Timer<u32>, now: DateTime) -> Vec<(TimerId, u32)> {
        let due = timer.take_due(now);
        let mut fired = Vec::new();
        for (id, entry) in due {
            fired.push((id, entry.callback));
            timer.reschedule(id, entry, now);
        }
        fired
    }

    #[test]
    fn test_empty_deadline_is_max() {
        let timer: Timer<u32> = Timer::new();
        assert_eq!(timer.next_deadline(), DateTime::MAX);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let mut timer: Timer<u32> = Timer::new();
        assert_eq!(
            timer.add(1, 0, None, TimerPolicy::CurrentTime, 100).unwrap_err(),
            StatusCode::BAD_INVALID_ARGUMENT
        );
    }

    #[test]
    fn test_fires_at_or_after_deadline_never_before() {
        let mut timer: Timer<u32> = Timer::new();
        timer.add(7, 100, None, TimerPolicy::CurrentTime, 1000).unwrap();
        assert_eq!(timer.next_deadline(), 1100);

        assert!(fire_all(&mut timer, 1099).is_empty());
        let fired = fire_all(&mut timer, 1100);
        assert_eq!(fired, vec![(1, 7)]);
        // rescheduled one interval onward
        assert_eq!(timer.next_deadline(), 1200);
    }

    #[test]
    fn test_deadline_ordering() {
        let mut timer: Timer<u32> = Timer::new();
        timer.add(1, 300, None, TimerPolicy::CurrentTime, 0).unwrap();
        timer.add(2, 100, None, TimerPolicy::CurrentTime, 0).unwrap();
        timer.add(3, 200, None, TimerPolicy::CurrentTime, 0).unwrap();

        let fired: Vec<u32> = fire_all(&mut timer, 300).into_iter().map(|(_, c)| c).collect();
        assert_eq!(fired, vec![2, 3, 1]);
    }

    #[test]
    fn test_current_time_policy_drifts_with_now() {
        let mut timer: Timer<u32> = Timer::new();
        timer.add(1, 100, None, TimerPolicy::CurrentTime, 0).unwrap();
        // fired late at 170: next is 270, not 200
        fire_all(&mut timer, 170);
        assert_eq!(timer.next_deadline(), 270);
    }

    #[test]
    fn test_base_time_policy_preserves_phase() {
        let mut timer: Timer<u32> = Timer::new();
        timer.add(1, 100, None, TimerPolicy::BaseTime, 0).unwrap();
        // fired late at 170: next stays on the 100-grid
        fire_all(&mut timer, 170);
        assert_eq!(timer.next_deadline(), 200);
    }

    #[test]
    fn test_base_time_skips_missed_slots() {
        let mut timer: Timer<u32> = Timer::new();
        timer.add(1, 100, None, TimerPolicy::BaseTime, 0).unwrap();
        // five intervals missed; no burst, next is the first future slot
        fire_all(&mut timer, 570);
        assert_eq!(timer.next_deadline(), 600);
        assert_eq!(fire_all(&mut timer, 600).len(), 1);
        assert_eq!(timer.next_deadline(), 700);
    }

    #[test]
    fn test_modify_keeps_id() {
        let mut timer: Timer<u32> = Timer::new();
        let id = timer.add(1, 100, None, TimerPolicy::CurrentTime, 0).unwrap();
        timer.modify(id, 500, TimerPolicy::CurrentTime, 0).unwrap();
        assert_eq!(timer.next_deadline(), 500);
        assert_eq!(
            timer.modify(999, 500, TimerPolicy::CurrentTime, 0).unwrap_err(),
            StatusCode::BAD_NOT_FOUND
        );
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut timer: Timer<u32> = Timer::new();
        let id = timer.add(1, 100, None, TimerPolicy::CurrentTime, 0).unwrap();
        timer.remove(id);
        timer.remove(id);
        assert_eq!(timer.next_deadline(), DateTime::MAX);
    }

    #[test]
    fn test_remove_while_checked_out() {
        let mut timer: Timer<u32> = Timer::new();
        let id = timer.add(1, 100, None, TimerPolicy::CurrentTime, 0).unwrap();
        let due = timer.take_due(100);
        assert_eq!(due.len(), 1);
        // removal from "inside the callback"
        timer.remove(id);
        for (id, entry) in due {
            timer.reschedule(id, entry, 100);
        }
        assert_eq!(timer.next_deadline(), DateTime::MAX);
        assert_eq!(timer.len(), 0);
    }

    #[test]
    fn test_modify_while_checked_out() {
        let mut timer: Timer<u32> = Timer::new();
        let id = timer.add(1, 100, None, TimerPolicy::CurrentTime, 0).unwrap();
        let due = timer.take_due(100);
        timer.modify(id, 1000, TimerPolicy::CurrentTime, 100).unwrap();
        for (id, entry) in due {
            timer.reschedule(id, entry, 100);
        }
        assert_eq!(timer.next_deadline(), 1100);
    }

    #[test]
    fn test_explicit_base_time() {
        let mut timer: Timer<u32> = Timer::new();
        timer.add(1, 100, Some(1050), TimerPolicy::BaseTime, 1000).unwrap();
        assert_eq!(timer.next_deadline(), 1150);
    }
}
