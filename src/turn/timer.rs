//! # Cancelable Timeouts
//!
//! A small set of named deadlines owned by the turn controller. Each timer
//! kind has at most one pending deadline; scheduling a kind again replaces
//! the previous deadline, and cancelling removes it outright, so a
//! superseded timer can never fire.
//!
//! The set does not sleep. The owner asks for [`Timers::next_deadline`],
//! arranges to be woken at that instant, and then calls
//! [`Timers::take_expired`].

use std::collections::HashMap;
use std::time::Instant;

/// The timers the controller knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Silence after the last partial result while the buffer holds text
    ShortSilence,
    /// Total silence while the buffer is still empty
    LongSilence,
    /// Hard limit on the length of a (trial) call
    CallLimit,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::ShortSilence => "short_silence",
            TimerKind::LongSilence => "long_silence",
            TimerKind::CallLimit => "call_limit",
        }
    }
}

#[derive(Debug, Default)]
pub struct Timers {
    deadlines: HashMap<TimerKind, Instant>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` to fire at `at`, replacing any pending deadline.
    pub fn schedule(&mut self, kind: TimerKind, at: Instant) {
        self.deadlines.insert(kind, at);
    }

    /// Disarm `kind`. Returns whether a deadline was pending.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.deadlines.remove(&kind).is_some()
    }

    pub fn cancel_all(&mut self) {
        self.deadlines.clear();
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Remove and return every timer whose deadline is at or before `now`,
    /// earliest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut expired: Vec<(Instant, TimerKind)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(kind, at)| (*at, *kind))
            .collect();
        expired.sort_by_key(|(at, _)| *at);

        for (_, kind) in &expired {
            self.deadlines.remove(kind);
        }

        expired.into_iter().map(|(_, kind)| kind).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rescheduling_replaces_deadline() {
        let base = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(TimerKind::ShortSilence, base + Duration::from_secs(1));
        timers.schedule(TimerKind::ShortSilence, base + Duration::from_secs(5));

        assert!(timers.take_expired(base + Duration::from_secs(2)).is_empty());
        assert_eq!(
            timers.take_expired(base + Duration::from_secs(5)),
            vec![TimerKind::ShortSilence]
        );
        assert!(timers.is_empty());
    }

    #[test]
    fn expired_timers_come_out_in_deadline_order() {
        let base = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(TimerKind::LongSilence, base + Duration::from_secs(10));
        timers.schedule(TimerKind::ShortSilence, base + Duration::from_millis(4500));
        timers.schedule(TimerKind::CallLimit, base + Duration::from_secs(300));

        assert_eq!(timers.next_deadline(), Some(base + Duration::from_millis(4500)));
        assert_eq!(
            timers.take_expired(base + Duration::from_secs(11)),
            vec![TimerKind::ShortSilence, TimerKind::LongSilence]
        );
        assert!(timers.is_armed(TimerKind::CallLimit));
    }

    #[test]
    fn cancelled_timer_never_expires() {
        let base = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(TimerKind::LongSilence, base);

        assert!(timers.cancel(TimerKind::LongSilence));
        assert!(!timers.cancel(TimerKind::LongSilence));
        assert!(timers.take_expired(base + Duration::from_secs(60)).is_empty());
    }
}
