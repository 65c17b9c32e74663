// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Single priority-queue timer scheduler shared by the protocol layers.
//!
//! Timers are identified by kind and re-armed idempotently: scheduling a
//! kind that is already queued moves its deadline instead of queueing a
//! second entry. Expiry is polled with an explicit `now` so tests can
//! fast-forward time deterministically.

use std::collections::BTreeMap;
use std::time::Instant;

/// The logical timers of the protocol stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum TimerKind {
    Inactivity,
    Retrans,
    Install,
    Stats,
}

/// Deadline queue keyed by `(expiry, kind)`.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    deadlines: BTreeMap<TimerKind, Instant>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm or re-arm `kind` to fire at `deadline`.
    pub fn schedule(&mut self, kind: TimerKind, deadline: Instant) {
        let _ = self.deadlines.insert(kind, deadline);
    }

    /// Disarm `kind` if queued.
    pub fn cancel(&mut self, kind: TimerKind) {
        let _ = self.deadlines.remove(&kind);
    }

    /// Earliest queued deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Pop one expired timer; callers loop until `None`. Expired timers
    /// are removed and must be re-armed by the handler if periodic.
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerKind> {
        let kind = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .min_by_key(|(_, deadline)| **deadline)
            .map(|(kind, _)| *kind)?;
        let _ = self.deadlines.remove(&kind);
        Some(kind)
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines.get(&kind).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expiry_order_is_deadline_order() {
        let start = Instant::now();
        let mut queue = TimerQueue::new();
        queue.schedule(TimerKind::Retrans, start + Duration::from_secs(2));
        queue.schedule(TimerKind::Inactivity, start + Duration::from_secs(1));
        queue.schedule(TimerKind::Stats, start + Duration::from_secs(3));

        let now = start + Duration::from_secs(2);
        assert_eq!(queue.pop_expired(now), Some(TimerKind::Inactivity));
        assert_eq!(queue.pop_expired(now), Some(TimerKind::Retrans));
        assert_eq!(queue.pop_expired(now), None);
        assert_eq!(
            queue.next_deadline(),
            Some(start + Duration::from_secs(3))
        );
    }

    #[test]
    fn rearm_moves_deadline() {
        let start = Instant::now();
        let mut queue = TimerQueue::new();
        queue.schedule(TimerKind::Install, start + Duration::from_secs(1));
        queue.schedule(TimerKind::Install, start + Duration::from_secs(5));
        assert_eq!(queue.pop_expired(start + Duration::from_secs(2)), None);
        assert_eq!(
            queue.pop_expired(start + Duration::from_secs(5)),
            Some(TimerKind::Install)
        );
    }
}
