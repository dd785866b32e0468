use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::wire::envelope::ClientAddress;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    Refreshed,
    Unknown,
}

/// Ack deadlines for streaming clients.
///
/// A client is `Active` until its deadline passes without an ack, at which point `sweep` reports
/// it dormant and forgets it. Dormancy is terminal. Callers supply `now` so the broker's ticker
/// drives every transition.
#[derive(Debug)]
pub struct LivenessTracker {
    ack_window: Duration,
    deadlines: HashMap<ClientAddress, Instant>,
}

impl LivenessTracker {
    pub fn new(ack_window: Duration) -> Self {
        Self {
            ack_window,
            deadlines: HashMap::new(),
        }
    }

    pub fn ack_window(&self) -> Duration {
        self.ack_window
    }

    pub fn register(&mut self, client_address: ClientAddress, now: Instant) {
        self.deadlines.insert(client_address, now + self.ack_window);
    }

    pub fn ack(&mut self, client_address: &ClientAddress, now: Instant) -> AckOutcome {
        match self.deadlines.get_mut(client_address) {
            Some(deadline) => {
                *deadline = now + self.ack_window;
                AckOutcome::Refreshed
            }
            None => AckOutcome::Unknown,
        }
    }

    pub fn unregister(&mut self, client_address: &ClientAddress) -> bool {
        self.deadlines.remove(client_address).is_some()
    }

    pub fn deadline(&self, client_address: &ClientAddress) -> Option<Instant> {
        self.deadlines.get(client_address).copied()
    }

    /// Removes and returns every client whose deadline is at or before `now`, oldest first.
    pub fn sweep(&mut self, now: Instant) -> Vec<ClientAddress> {
        let mut dormant: Vec<(Instant, ClientAddress)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(address, deadline)| (*deadline, address.clone()))
            .collect();
        dormant.sort();

        for (_, address) in &dormant {
            self.deadlines.remove(address);
        }
        dormant.into_iter().map(|(_, address)| address).collect()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::wire::envelope::ClientAddress;

    use super::{AckOutcome, LivenessTracker};

    fn address(raw: &str) -> ClientAddress {
        ClientAddress::new(raw).expect("address should be valid")
    }

    #[test]
    fn ack_pushes_the_deadline_forward() {
        let start = Instant::now();
        let mut tracker = LivenessTracker::new(Duration::from_secs(10));
        tracker.register(address("a"), start);

        assert_eq!(
            tracker.ack(&address("a"), start + Duration::from_secs(8)),
            AckOutcome::Refreshed
        );
        assert!(tracker.sweep(start + Duration::from_secs(12)).is_empty());
        assert_eq!(
            tracker.sweep(start + Duration::from_secs(18)),
            vec![address("a")]
        );
    }

    #[test]
    fn dormancy_is_terminal_and_reported_once() {
        let start = Instant::now();
        let mut tracker = LivenessTracker::new(Duration::from_millis(100));
        tracker.register(address("b"), start + Duration::from_millis(10));
        tracker.register(address("a"), start);

        let later = start + Duration::from_millis(200);
        assert_eq!(tracker.sweep(later), vec![address("a"), address("b")]);
        assert!(tracker.sweep(later).is_empty());
        assert_eq!(tracker.ack(&address("a"), later), AckOutcome::Unknown);
        assert!(tracker.is_empty());
    }

    #[test]
    fn unknown_acks_are_ignored() {
        let start = Instant::now();
        let mut tracker = LivenessTracker::new(Duration::from_secs(1));

        assert_eq!(tracker.ack(&address("ghost"), start), AckOutcome::Unknown);
        assert!(tracker.deadline(&address("ghost")).is_none());
        assert!(!tracker.unregister(&address("ghost")));
    }
}
