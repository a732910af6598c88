//! One-shot timers ordered by deadline.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::scheduler::{Callback, TimerId};

/// Timers keyed by `(deadline, id)` so equal deadlines fire in arming order.
#[derive(Default)]
pub(crate) struct TimerWheel {
    queue: BTreeMap<(Instant, TimerId), Callback>,
    deadlines: HashMap<TimerId, Instant>,
    next_id: u64,
}

impl TimerWheel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn arm(&mut self, now: Instant, delay: Duration, callback: Callback) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let deadline = now + delay;
        self.queue.insert((deadline, id), callback);
        self.deadlines.insert(id, deadline);
        id
    }

    /// Returns `false` if the timer already fired or never existed.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => self.queue.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// The most recently armed timer id; timers armed later compare greater.
    pub(crate) fn last_armed(&self) -> TimerId {
        TimerId(self.next_id)
    }

    /// Pops the earliest timer due at `now` among those armed no later than `horizon`.
    pub(crate) fn pop_expired(
        &mut self,
        now: Instant,
        horizon: TimerId,
    ) -> Option<(TimerId, Callback)> {
        let (deadline, id) = self
            .queue
            .range(..=(now, TimerId(u64::MAX)))
            .map(|(key, _)| *key)
            .find(|(_, id)| *id <= horizon)?;
        let callback = self.queue.remove(&(deadline, id))?;
        self.deadlines.remove(&id);
        Some((id, callback))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn noop() -> Callback {
        Rc::new(|| {})
    }

    #[test]
    fn expires_in_deadline_then_arming_order() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let late = wheel.arm(now, Duration::from_millis(20), noop());
        let early = wheel.arm(now, Duration::from_millis(10), noop());
        let tie = wheel.arm(now, Duration::from_millis(10), noop());

        assert_eq!(wheel.next_deadline(), Some(now + Duration::from_millis(10)));
        let horizon = wheel.last_armed();
        assert!(wheel.pop_expired(now, horizon).is_none());

        let later = now + Duration::from_millis(30);
        let order: Vec<_> = std::iter::from_fn(|| wheel.pop_expired(later, horizon))
            .map(|(id, _)| id)
            .collect();
        assert_eq!(order, vec![early, tie, late]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancel_removes_only_live_timers() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let a = wheel.arm(now, Duration::ZERO, noop());
        let b = wheel.arm(now, Duration::from_secs(1), noop());

        assert!(wheel.cancel(b));
        assert!(!wheel.cancel(b));
        assert_eq!(wheel.len(), 1);

        assert_eq!(
            wheel.pop_expired(now, wheel.last_armed()).map(|(id, _)| id),
            Some(a)
        );
        assert!(!wheel.cancel(a));
        assert_eq!(wheel.next_deadline(), None);
    }

    #[test]
    fn horizon_holds_back_later_timers() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let old = wheel.arm(now, Duration::ZERO, noop());
        let horizon = wheel.last_armed();
        let new = wheel.arm(now, Duration::ZERO, noop());

        assert_eq!(wheel.pop_expired(now, horizon).map(|(id, _)| id), Some(old));
        assert!(wheel.pop_expired(now, horizon).is_none());
        assert_eq!(
            wheel.pop_expired(now, wheel.last_armed()).map(|(id, _)| id),
            Some(new)
        );
    }
}
