//! Per-session append-only event ring.
//!
//! Every accepted or rejected intent, stage change, voice error, safety
//! block, and budget event lands here. The ring is bounded; the full
//! stream also goes to the persistence adapter best-effort.

use std::collections::VecDeque;

use pg_domain::events::{LoggedEvent, SessionEvent};

pub struct EventLog {
    capacity: usize,
    ring: VecDeque<LoggedEvent>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: VecDeque::new(),
        }
    }

    /// Append, emit the tracing line, and hand back the logged record so
    /// the caller can forward it to persistence.
    pub fn append(&mut self, event: SessionEvent) -> LoggedEvent {
        event.emit();
        let logged = LoggedEvent::now(event);
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(logged.clone());
        logged
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn recent(&self, n: usize) -> Vec<LoggedEvent> {
        self.ring.iter().rev().take(n).rev().cloned().collect()
    }

    /// Count of events matching a kind prefix, e.g. `"budget."`.
    pub fn count_kind(&self, prefix: &str) -> usize {
        self.ring.iter().filter(|e| e.kind.starts_with(prefix)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evt(n: usize) -> SessionEvent {
        SessionEvent::FloorGranted {
            session_id: "s1".into(),
            user_id: format!("u{n}"),
            previous: None,
        }
    }

    #[test]
    fn ring_is_bounded() {
        let mut log = EventLog::new(3);
        for i in 0..5 {
            log.append(evt(i));
        }
        assert_eq!(log.len(), 3);
        let recent = log.recent(3);
        match &recent[0].event {
            SessionEvent::FloorGranted { user_id, .. } => assert_eq!(user_id, "u2"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn kind_prefix_counting() {
        let mut log = EventLog::new(8);
        log.append(evt(0));
        log.append(SessionEvent::BudgetSoftLimit {
            session_id: "s1".into(),
            usd_estimate: 2.0,
        });
        assert_eq!(log.count_kind("budget."), 1);
        assert_eq!(log.count_kind("floor."), 1);
    }
}
