//! Session timers
//!
//! Timers are plain data owned by the playback controller: a kind, a deadline
//! and an optional period. The controller asks for the next deadline, sleeps
//! until it, then pops whatever is due. Clearing the scheduler on teardown
//! leaves nothing behind to fire later.

use std::time::Duration;
use tokio::time::Instant;

/// What a timer does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// Periodic progress write
    Checkpoint,
    /// Advance to the next episode after the end
    AutoAdvance,
    /// Hide the transient notification
    NotificationDismiss,
    /// Hide the on-screen controls
    ControlsHide,
    /// Tick the skip countdown
    SkipCountdown,
}

#[derive(Debug, Clone)]
struct Timer {
    kind: TimerKind,
    deadline: Instant,
    period: Option<Duration>,
}

/// Shortest period a repeating timer runs at
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// At most one pending timer per kind; rescheduling a kind replaces it
#[derive(Debug, Default)]
pub struct Scheduler {
    timers: Vec<Timer>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire once after `delay`
    pub fn schedule_once(&mut self, kind: TimerKind, delay: Duration) {
        self.insert(Timer {
            kind,
            deadline: Instant::now() + delay,
            period: None,
        });
    }

    /// Fire every `period`, first after one period. Periods shorter than
    /// [`MIN_PERIOD`] are raised to it so a repeating timer always moves forward.
    pub fn schedule_repeating(&mut self, kind: TimerKind, period: Duration) {
        let period = period.max(MIN_PERIOD);
        self.insert(Timer {
            kind,
            deadline: Instant::now() + period,
            period: Some(period),
        });
    }

    fn insert(&mut self, timer: Timer) {
        self.cancel(timer.kind);
        self.timers.push(timer);
    }

    /// Returns true when a timer of this kind was pending
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.kind != kind);
        before != self.timers.len()
    }

    /// Drop every pending timer
    pub fn clear(&mut self) {
        self.timers.clear();
    }

    pub fn is_scheduled(&self, kind: TimerKind) -> bool {
        self.timers.iter().any(|t| t.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.deadline).min()
    }

    /// Pop the earliest timer due at `now`. Repeating timers are re-armed one
    /// period after their previous deadline, so a late caller catches up one
    /// firing at a time.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKind> {
        let (idx, _) = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.deadline <= now)
            .min_by_key(|(_, t)| (t.deadline, t.kind))?;

        let kind = self.timers[idx].kind;
        match self.timers[idx].period {
            Some(period) => self.timers[idx].deadline += period,
            None => {
                self.timers.swap_remove(idx);
            }
        }
        Some(kind)
    }
}
