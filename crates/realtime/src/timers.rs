//! Loop-owned deadlines.
//!
//! Every deadline carries the connection generation it was scheduled under.
//! The manager ignores deadlines whose generation is no longer current, so a
//! timer left over from a cancelled attempt can never act on a newer one.

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Handshake,
    Heartbeat,
    Liveness,
    Backoff,
}

impl TimerKind {
    const ALL: [TimerKind; 4] = [
        TimerKind::Liveness,
        TimerKind::Handshake,
        TimerKind::Heartbeat,
        TimerKind::Backoff,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Deadline {
    pub(crate) generation: u64,
    pub(crate) at: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct Timers {
    handshake: Option<Deadline>,
    heartbeat: Option<Deadline>,
    liveness: Option<Deadline>,
    backoff: Option<Deadline>,
}

impl Timers {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<Deadline> {
        match kind {
            TimerKind::Handshake => &mut self.handshake,
            TimerKind::Heartbeat => &mut self.heartbeat,
            TimerKind::Liveness => &mut self.liveness,
            TimerKind::Backoff => &mut self.backoff,
        }
    }

    /// Schedules (or reschedules) a timer.
    pub(crate) fn schedule(&mut self, kind: TimerKind, generation: u64, at: Instant) {
        *self.slot(kind) = Some(Deadline { generation, at });
    }

    pub(crate) fn cancel(&mut self, kind: TimerKind) {
        *self.slot(kind) = None;
    }

    pub(crate) fn cancel_all(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn get(&self, kind: TimerKind) -> Option<Deadline> {
        match kind {
            TimerKind::Handshake => self.handshake,
            TimerKind::Heartbeat => self.heartbeat,
            TimerKind::Liveness => self.liveness,
            TimerKind::Backoff => self.backoff,
        }
    }

    /// Earliest scheduled deadline, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        TimerKind::ALL
            .iter()
            .filter_map(|k| self.get(*k))
            .map(|d| d.at)
            .min()
    }

    /// Removes and returns every timer due at `now`. Liveness comes first so a
    /// dead channel is torn down before a heartbeat is written to it.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<(TimerKind, u64)> {
        let mut due = Vec::new();
        for kind in TimerKind::ALL {
            let slot = self.slot(kind);
            if let Some(d) = *slot
                && d.at <= now
            {
                *slot = None;
                due.push((kind, d.generation));
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn next_deadline_is_earliest() {
        let now = Instant::now();
        let mut timers = Timers::default();
        assert_eq!(timers.next_deadline(), None);

        timers.schedule(TimerKind::Heartbeat, 1, now + Duration::from_secs(30));
        timers.schedule(TimerKind::Liveness, 1, now + Duration::from_secs(60));
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(30)));

        timers.cancel(TimerKind::Heartbeat);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn take_due_removes_only_expired() {
        let now = Instant::now();
        let mut timers = Timers::default();
        timers.schedule(TimerKind::Heartbeat, 3, now);
        timers.schedule(TimerKind::Liveness, 3, now);
        timers.schedule(TimerKind::Backoff, 2, now + Duration::from_secs(5));

        let due = timers.take_due(now);
        assert_eq!(
            due,
            vec![(TimerKind::Liveness, 3), (TimerKind::Heartbeat, 3)]
        );
        assert!(timers.get(TimerKind::Heartbeat).is_none());
        assert_eq!(timers.get(TimerKind::Backoff).map(|d| d.generation), Some(2));
    }

    #[test]
    fn cancel_all_clears_everything() {
        let now = Instant::now();
        let mut timers = Timers::default();
        timers.schedule(TimerKind::Handshake, 1, now);
        timers.schedule(TimerKind::Backoff, 1, now);
        timers.cancel_all();
        assert_eq!(timers.next_deadline(), None);
        assert!(timers.take_due(now).is_empty());
    }
}
