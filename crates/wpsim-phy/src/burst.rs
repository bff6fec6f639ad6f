//! Aggregate (burst) continuity tracking.

use wpsim_common::PhyFrame;

/// Result of checking one frame against the burst in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstCheck {
    /// In sequence, or not part of a burst.
    Clean,
    /// A new preamble arrived while `expected` was still due.
    Incomplete {
        /// Count the next subframe should have declared.
        expected: u16,
    },
    /// Subframes were missed: the declared count is below the expected one.
    Gap {
        /// Count the subframe should have declared.
        expected: u16,
        /// Count it declared.
        declared: u16,
    },
    /// The declared count is above the expected one.
    Mismatch {
        /// Count the subframe should have declared.
        expected: u16,
        /// Count it declared.
        declared: u16,
    },
    /// A continuation subframe with no burst in progress. Not receivable.
    Desync,
}

impl BurstCheck {
    /// True if the frame may be received.
    pub fn accepts(&self) -> bool {
        !matches!(self, BurstCheck::Desync)
    }

    /// True if the tracker had to resynchronize.
    pub fn is_resync(&self) -> bool {
        matches!(self, BurstCheck::Gap { .. } | BurstCheck::Mismatch { .. })
    }
}

/// Remaining-subframe counter of the burst being received.
#[derive(Debug, Clone, Default)]
pub struct BurstTracker {
    /// Remaining count the next subframe should declare.
    next_declared: Option<u16>,
    resyncs: u64,
    incomplete: u64,
}

impl BurstTracker {
    /// Create an inactive tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a burst is in progress.
    pub fn is_active(&self) -> bool {
        self.next_declared.is_some()
    }

    /// Remaining count the next subframe should declare.
    pub fn expected(&self) -> Option<u16> {
        self.next_declared
    }

    /// Number of resynchronizations so far.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Number of bursts interrupted by a new preamble.
    pub fn incomplete(&self) -> u64 {
        self.incomplete
    }

    /// Forget the burst in progress.
    pub fn reset(&mut self) {
        self.next_declared = None;
    }

    /// Check `frame` and advance the counter.
    pub fn observe(&mut self, frame: &PhyFrame) -> BurstCheck {
        let declared = frame.burst.map(|tag| tag.remaining);

        if frame.format.preamble.has_preamble() {
            let check = match self.next_declared {
                Some(expected) => {
                    self.incomplete += 1;
                    BurstCheck::Incomplete { expected }
                }
                None => BurstCheck::Clean,
            };
            self.next_declared = declared.and_then(|r| r.checked_sub(1));
            return check;
        }

        let Some(expected) = self.next_declared else {
            return BurstCheck::Desync;
        };
        let declared = declared.unwrap_or(0);
        let check = if declared < expected {
            BurstCheck::Gap { expected, declared }
        } else if declared > expected {
            BurstCheck::Mismatch { expected, declared }
        } else {
            BurstCheck::Clean
        };
        if check.is_resync() {
            self.resyncs += 1;
        }
        self.next_declared = declared.checked_sub(1);
        check
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wpsim_common::{FrameFormat, Preamble, WifiMode};

    fn first(remaining: u16) -> PhyFrame {
        PhyFrame::new(0, FrameFormat::for_mode(WifiMode::ht_mcs(7).unwrap()), 500).with_burst(remaining)
    }

    fn next(remaining: u16) -> PhyFrame {
        let format = FrameFormat::for_mode(WifiMode::ht_mcs(7).unwrap()).with_preamble(Preamble::None);
        PhyFrame::new(0, format, 500).with_burst(remaining)
    }

    #[test]
    fn test_clean_burst() {
        let mut tracker = BurstTracker::new();
        assert_eq!(tracker.observe(&first(3)), BurstCheck::Clean);
        for r in [2, 1, 0] {
            assert_eq!(tracker.observe(&next(r)), BurstCheck::Clean);
        }
        assert!(!tracker.is_active());
        assert_eq!(tracker.resyncs(), 0);
    }

    #[test]
    fn test_gap_resyncs_to_declared() {
        let mut tracker = BurstTracker::new();
        tracker.observe(&first(3));
        assert_eq!(tracker.observe(&next(1)), BurstCheck::Gap { expected: 2, declared: 1 });
        assert_eq!(tracker.expected(), Some(0));
        assert_eq!(tracker.observe(&next(0)), BurstCheck::Clean);
        assert_eq!(tracker.resyncs(), 1);
    }

    #[test]
    fn test_continuation_without_burst() {
        let mut tracker = BurstTracker::new();
        assert_eq!(tracker.observe(&next(2)), BurstCheck::Desync);
        assert!(!tracker.observe(&next(2)).accepts());
    }

    #[test]
    fn test_new_preamble_interrupts_burst() {
        let mut tracker = BurstTracker::new();
        tracker.observe(&first(3));
        tracker.observe(&next(2));
        assert_eq!(tracker.observe(&first(1)), BurstCheck::Incomplete { expected: 1 });
        assert_eq!(tracker.expected(), Some(0));
        assert_eq!(tracker.incomplete(), 1);
        // a plain frame ends tracking
        let plain = PhyFrame::new(1, FrameFormat::default(), 100);
        tracker.observe(&next(0));
        assert_eq!(tracker.observe(&plain), BurstCheck::Clean);
        assert!(!tracker.is_active());
    }
}
