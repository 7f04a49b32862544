//! Two-counter quiescence fixed point.
//!
//! `QuiescenceTracker` is the bookkeeping half of `Engine::barrier`: it owns
//! the "did the last two rounds agree" state so the engine's barrier loop
//! reads as a plain iterate-until-stable without re-deriving the fixed-point
//! condition inline.

#[derive(Debug, Clone, Copy, Default)]
pub struct QuiescenceTracker {
    previous: Option<(u64, u64)>,
}

impl QuiescenceTracker {
    pub fn new() -> Self {
        Self { previous: None }
    }

    /// Records one round's globally reduced `(recv, send)` totals. Returns
    /// `true` once two consecutive rounds agree and `recv == send`.
    pub fn observe(&mut self, totals: (u64, u64)) -> bool {
        let (recv, send) = totals;
        let quiescent = recv == send && self.previous == Some(totals);
        self.previous = Some(totals);
        quiescent
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_two_matching_rounds_with_equal_counters() {
        let mut tracker = QuiescenceTracker::new();
        assert!(!tracker.observe((3, 5)));
        assert!(!tracker.observe((3, 5)));
        // counters matched twice but recv != send: still not quiescent.
        let mut tracker = QuiescenceTracker::new();
        assert!(!tracker.observe((5, 5)));
        assert!(tracker.observe((5, 5)));
    }

    #[test]
    fn a_changed_round_resets_the_fixed_point() {
        let mut tracker = QuiescenceTracker::new();
        assert!(!tracker.observe((5, 5)));
        assert!(!tracker.observe((6, 6)));
        assert!(tracker.observe((6, 6)));
    }
}
